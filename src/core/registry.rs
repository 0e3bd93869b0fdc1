//! Sandbox Registry: owns every sandbox record and the thread-affinity index.

use crate::config::types::{PerfboxError, Result, SandboxId, ThreadTag};
use crate::core::sandbox::Sandbox;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct Registry {
    sandboxes: HashMap<SandboxId, Sandbox>,
    threads: HashMap<ThreadTag, SandboxId>,
    /// Ids whose backend release is in flight
    releasing: HashSet<SandboxId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sandbox: Sandbox) -> Result<()> {
        if self.sandboxes.contains_key(&sandbox.id) {
            return Err(PerfboxError::ProtocolViolation(format!(
                "backend issued id {} twice",
                sandbox.id
            )));
        }
        if let Some(thread) = sandbox.owner_thread {
            self.threads.insert(thread, sandbox.id);
        }
        self.sandboxes.insert(sandbox.id, sandbox);
        Ok(())
    }

    /// Sandboxes being released are no longer visible
    pub fn get(&self, id: SandboxId) -> Result<&Sandbox> {
        if self.releasing.contains(&id) {
            return Err(PerfboxError::SandboxNotFound(id));
        }
        self.sandboxes
            .get(&id)
            .ok_or(PerfboxError::SandboxNotFound(id))
    }

    pub fn get_mut(&mut self, id: SandboxId) -> Result<&mut Sandbox> {
        if self.releasing.contains(&id) {
            return Err(PerfboxError::SandboxNotFound(id));
        }
        self.sandboxes
            .get_mut(&id)
            .ok_or(PerfboxError::SandboxNotFound(id))
    }

    pub fn contains(&self, id: SandboxId) -> bool {
        self.sandboxes.contains_key(&id) && !self.releasing.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sandbox> {
        self.sandboxes
            .values()
            .filter(move |sb| !self.releasing.contains(&sb.id))
    }

    /// Sandbox bound to `thread`, if any
    pub fn lookup_thread(&self, thread: ThreadTag) -> Option<SandboxId> {
        self.threads
            .get(&thread)
            .copied()
            .filter(|id| self.contains(*id))
    }

    pub fn bind_thread(&mut self, id: SandboxId, thread: ThreadTag) -> Result<()> {
        let sandbox = self.get_mut(id)?;
        sandbox.owner_thread = Some(thread);
        self.threads.insert(thread, id);
        Ok(())
    }

    /// Clear the owner of `id` and drop its index entry
    pub fn unbind_thread(&mut self, id: SandboxId) -> Result<Option<ThreadTag>> {
        let sandbox = self.get_mut(id)?;
        let previous = sandbox.owner_thread.take();
        if let Some(thread) = previous {
            if self.threads.get(&thread) == Some(&id) {
                self.threads.remove(&thread);
            }
        }
        Ok(previous)
    }

    /// Claim `id` for release. A second claimant observes `SandboxNotFound`.
    pub fn begin_release(&mut self, id: SandboxId) -> Result<()> {
        if !self.contains(id) {
            return Err(PerfboxError::SandboxNotFound(id));
        }
        self.releasing.insert(id);
        Ok(())
    }

    /// Undo a claim after the backend refused the release
    pub fn abort_release(&mut self, id: SandboxId) {
        self.releasing.remove(&id);
    }

    pub fn finish_release(&mut self, id: SandboxId) -> Option<Sandbox> {
        self.releasing.remove(&id);
        let sandbox = self.sandboxes.remove(&id)?;
        self.threads.retain(|_, bound| *bound != id);
        Some(sandbox)
    }
}
