//! Backend without enforcement: identifiers are process-local, side effects are logged.

use crate::config::types::{ActionLevel, IsolationRule, Result, SandboxId, ThreadTag};
use crate::kernel::backend::EnforcementBackend;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct NoopBackend {
    next_id: AtomicI64,
}

impl NoopBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for NoopBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EnforcementBackend for NoopBackend {
    fn backend_name(&self) -> &str {
        "noop"
    }

    fn create(&self, _rule: &IsolationRule) -> Result<SandboxId> {
        Ok(SandboxId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn release(&self, _id: SandboxId) -> Result<()> {
        Ok(())
    }

    fn activate(&self, _id: SandboxId) -> Result<()> {
        Ok(())
    }

    fn freeze(&self, _id: SandboxId) -> Result<()> {
        Ok(())
    }

    fn penalize(&self, id: SandboxId, penalty: Duration) -> Result<()> {
        log::debug!("noop backend: would penalize {} for {:?}", id, penalty);
        Ok(())
    }

    fn wakeup(&self, id: SandboxId) -> Result<()> {
        log::debug!("noop backend: would wake {}", id);
        Ok(())
    }

    fn compensate(&self, id: SandboxId, level: ActionLevel) -> Result<()> {
        log::debug!("noop backend: would set {} to {:?}", id, level);
        Ok(())
    }

    fn bind(&self, _id: SandboxId, _thread: ThreadTag) -> Result<()> {
        Ok(())
    }

    fn unbind(&self, _id: SandboxId) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let backend = NoopBackend::new();
        let a = backend.create(&IsolationRule::default()).unwrap();
        let b = backend.create(&IsolationRule::default()).unwrap();
        assert_ne!(a, b);
    }
}
