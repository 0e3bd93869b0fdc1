//! Enforcement backend abstraction.
//!
//! The backend owns the privileged side effects: issuing sandbox ids, suspending,
//! waking, penalizing and reprioritizing threads. The engine never holds its
//! bookkeeping lock while calling into a backend.

use crate::config::settings::{BackendKind, SyscallTable};
use crate::config::types::{
    ActionLevel, IsolationRule, PerfboxError, Result, SandboxId, ThreadTag,
};
use std::sync::Arc;
use std::time::Duration;

pub trait EnforcementBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    /// Issue an identifier for a new sandbox
    fn create(&self, rule: &IsolationRule) -> Result<SandboxId>;
    fn release(&self, id: SandboxId) -> Result<()>;
    /// The sandbox started a new activity
    fn activate(&self, id: SandboxId) -> Result<()>;
    /// The sandbox finished its activity
    fn freeze(&self, id: SandboxId) -> Result<()>;
    /// Deprioritize or suspend the sandbox's thread for a bounded time
    fn penalize(&self, id: SandboxId, penalty: Duration) -> Result<()>;
    /// Resume a sandbox the backend put to sleep
    fn wakeup(&self, id: SandboxId) -> Result<()>;
    /// Apply a new priority tier to the sandbox
    fn compensate(&self, id: SandboxId, level: ActionLevel) -> Result<()>;
    /// Attach the sandbox to an OS thread
    fn bind(&self, id: SandboxId, thread: ThreadTag) -> Result<()>;
    /// Detach the sandbox from its OS thread without releasing it
    fn unbind(&self, id: SandboxId) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackendType {
    Syscall,
    Noop,
}

/// Detect whether the running kernel carries the psandbox system calls
pub fn detect_backend(syscalls: &SyscallTable) -> Option<BackendType> {
    if crate::kernel::syscall::probe(syscalls) {
        Some(BackendType::Syscall)
    } else {
        None
    }
}

/// Create the enforcement backend: syscall when available, noop fallback unless strict.
pub fn create_backend(
    kind: BackendKind,
    strict: bool,
    syscalls: &SyscallTable,
) -> Result<Arc<dyn EnforcementBackend>> {
    log::info!(
        "Enforcement backend selection: requested={:?}, strict={}",
        kind,
        strict
    );

    match kind {
        BackendKind::Noop => {
            log::info!("Using noop enforcement backend (explicit)");
            Ok(Arc::new(crate::kernel::noop::NoopBackend::new()))
        }
        BackendKind::Syscall => match detect_backend(syscalls) {
            Some(BackendType::Syscall) => {
                log::info!("Using syscall enforcement backend (explicit)");
                Ok(Arc::new(crate::kernel::syscall::SyscallBackend::new(
                    syscalls.clone(),
                )))
            }
            _ => {
                if strict {
                    Err(PerfboxError::Backend(
                        "Syscall backend requested but the kernel does not expose it".to_string(),
                    ))
                } else {
                    log::warn!("Syscall backend requested but unavailable, using noop backend");
                    Ok(Arc::new(crate::kernel::noop::NoopBackend::new()))
                }
            }
        },
        BackendKind::Auto => match detect_backend(syscalls) {
            Some(BackendType::Syscall) => {
                log::info!("Using syscall enforcement backend (detected)");
                Ok(Arc::new(crate::kernel::syscall::SyscallBackend::new(
                    syscalls.clone(),
                )))
            }
            _ => {
                if strict {
                    Err(PerfboxError::Backend(
                        "No enforcement backend available in strict mode".to_string(),
                    ))
                } else {
                    log::warn!("No enforcement backend available, continuing without enforcement");
                    Ok(Arc::new(crate::kernel::noop::NoopBackend::new()))
                }
            }
        },
    }
}

pub fn backend_type_name(backend_type: BackendType) -> &'static str {
    match backend_type {
        BackendType::Syscall => "syscall",
        BackendType::Noop => "noop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_name() {
        assert_eq!(backend_type_name(BackendType::Syscall), "syscall");
        assert_eq!(backend_type_name(BackendType::Noop), "noop");
    }

    #[test]
    fn test_explicit_noop() {
        let backend = create_backend(BackendKind::Noop, true, &SyscallTable::default()).unwrap();
        assert_eq!(backend.backend_name(), "noop");
    }

    #[test]
    fn test_auto_selection_never_fails_when_permissive() {
        let backend = create_backend(BackendKind::Auto, false, &SyscallTable::default()).unwrap();
        assert!(matches!(backend.backend_name(), "noop" | "syscall"));
    }

    #[test]
    fn test_strict_syscall_matches_detection() {
        let table = SyscallTable::default();
        let result = create_backend(BackendKind::Syscall, true, &table);
        assert_eq!(result.is_ok(), detect_backend(&table).is_some());
    }
}
