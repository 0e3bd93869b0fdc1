//! Competitor Directory: per-resource ordered sets of contending sandboxes.
//!
//! Insertion order is kept; it is the tie-break for neighbor search and wakeups.

use crate::config::types::{PerfboxError, ResourceKey, Result, SandboxId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct CompetitorDirectory {
    entries: HashMap<ResourceKey, Vec<SandboxId>>,
}

impl CompetitorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to the set of `key`. Returns false if it was already a member.
    pub fn join(&mut self, key: ResourceKey, id: SandboxId) -> bool {
        let members = self.entries.entry(key).or_default();
        if members.contains(&id) {
            return false;
        }
        members.push(id);
        true
    }

    /// Remove `id` from the set of `key`, dropping the entry once it is empty
    pub fn leave(&mut self, key: ResourceKey, id: SandboxId) -> Result<()> {
        let members = self
            .entries
            .get_mut(&key)
            .ok_or(PerfboxError::MissingCompetitorSet(key))?;
        let pos = members.iter().position(|m| *m == id).ok_or_else(|| {
            PerfboxError::ProtocolViolation(format!("{} left {} without joining it", id, key))
        })?;
        members.remove(pos);
        if members.is_empty() {
            self.entries.remove(&key);
        }
        Ok(())
    }

    pub fn members(&self, key: ResourceKey) -> Result<&[SandboxId]> {
        self.entries
            .get(&key)
            .map(Vec::as_slice)
            .ok_or(PerfboxError::MissingCompetitorSet(key))
    }

    /// Fail unless `id` is in the set of `key`
    pub fn require_member(&self, key: ResourceKey, id: SandboxId) -> Result<()> {
        if self.members(key)?.contains(&id) {
            Ok(())
        } else {
            Err(PerfboxError::ProtocolViolation(format!(
                "{} is not competing for {}",
                id, key
            )))
        }
    }

    /// Remove `id` from every set; returns the keys it was removed from
    pub fn purge(&mut self, id: SandboxId) -> Vec<ResourceKey> {
        let mut removed = Vec::new();
        self.entries.retain(|key, members| {
            let before = members.len();
            members.retain(|m| *m != id);
            if members.len() != before {
                removed.push(*key);
            }
            !members.is_empty()
        });
        removed
    }

    /// Number of keys with a live set
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: ResourceKey = ResourceKey(0x1000);

    #[test]
    fn test_join_is_idempotent() {
        let mut dir = CompetitorDirectory::new();
        assert!(dir.join(KEY, SandboxId(1)));
        assert!(!dir.join(KEY, SandboxId(1)));
        assert!(dir.join(KEY, SandboxId(2)));
        assert_eq!(dir.members(KEY).unwrap(), &[SandboxId(1), SandboxId(2)]);
    }

    #[test]
    fn test_leave_deletes_empty_entry() {
        let mut dir = CompetitorDirectory::new();
        dir.join(KEY, SandboxId(1));
        dir.leave(KEY, SandboxId(1)).unwrap();
        assert!(dir.is_empty());
        assert!(matches!(
            dir.members(KEY),
            Err(PerfboxError::MissingCompetitorSet(_))
        ));
    }

    #[test]
    fn test_leave_errors() {
        let mut dir = CompetitorDirectory::new();
        assert!(matches!(
            dir.leave(KEY, SandboxId(1)),
            Err(PerfboxError::MissingCompetitorSet(_))
        ));

        dir.join(KEY, SandboxId(1));
        assert!(matches!(
            dir.leave(KEY, SandboxId(2)),
            Err(PerfboxError::ProtocolViolation(_))
        ));
        assert_eq!(dir.members(KEY).unwrap().len(), 1);
    }

    #[test]
    fn test_purge_across_keys() {
        let mut dir = CompetitorDirectory::new();
        let other = ResourceKey(0x2000);
        dir.join(KEY, SandboxId(1));
        dir.join(KEY, SandboxId(2));
        dir.join(other, SandboxId(1));

        let mut removed = dir.purge(SandboxId(1));
        removed.sort();
        assert_eq!(removed, vec![KEY, other]);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.members(KEY).unwrap(), &[SandboxId(2)]);
    }

    #[test]
    fn test_require_member() {
        let mut dir = CompetitorDirectory::new();
        dir.join(KEY, SandboxId(1));
        assert!(dir.require_member(KEY, SandboxId(1)).is_ok());
        assert!(dir.require_member(KEY, SandboxId(3)).is_err());
        assert!(dir.require_member(ResourceKey(1), SandboxId(1)).is_err());
    }
}
