//! Backend issuing the psandbox kernel calls.
//!
//! The call numbers of the patch overlap with syscalls assigned upstream after 5.4
//! (close_range, openat2, pidfd_getfd, ...), so the backend is only selected on a
//! kernel whose release string identifies the patch.

use crate::config::settings::SyscallTable;
use crate::config::types::{
    ActionLevel, IsolationRule, PerfboxError, Result, SandboxId, ThreadTag,
};
use crate::kernel::backend::EnforcementBackend;
use nix::errno::Errno;
use std::time::Duration;

/// Marker carried in `uname -r` by kernels built with the psandbox patch
const KERNEL_MARKER: &str = "psandbox";

/// Check that the kernel carries the patch and answers the lookup call
pub fn probe(syscalls: &SyscallTable) -> bool {
    let release = match nix::sys::utsname::uname() {
        Ok(uts) => uts.release().to_string_lossy().into_owned(),
        Err(e) => {
            log::debug!("uname failed during backend probe: {}", e);
            return false;
        }
    };
    if !release.contains(KERNEL_MARKER) {
        log::debug!("kernel {} does not carry the psandbox patch", release);
        return false;
    }

    // SAFETY: the lookup call takes no arguments and only reads kernel state.
    let ret = unsafe { libc::syscall(syscalls.get as libc::c_long) };
    ret != -1 || Errno::last() != Errno::ENOSYS
}

/// Penalty argument of the penalize call, in microseconds
fn penalty_arg(penalty: Duration) -> libc::c_long {
    penalty.as_micros().min(libc::c_long::MAX as u128) as libc::c_long
}

pub struct SyscallBackend {
    table: SyscallTable,
}

impl SyscallBackend {
    pub fn new(table: SyscallTable) -> Self {
        Self { table }
    }

    fn check(op: &str, ret: libc::c_long) -> Result<libc::c_long> {
        if ret == -1 {
            let errno = Errno::last();
            log::error!("psandbox {} call failed: {}", op, errno);
            return Err(PerfboxError::Backend(format!("{} failed: {}", op, errno)));
        }
        Ok(ret)
    }

    fn call1(&self, op: &str, number: Option<i64>, id: SandboxId) -> Result<()> {
        match number {
            Some(nr) => {
                // SAFETY: psandbox calls take plain integers and never dereference user memory.
                let ret = unsafe { libc::syscall(nr as libc::c_long, id.0 as libc::c_long) };
                Self::check(op, ret).map(|_| ())
            }
            None => {
                log::debug!("{} for {} has no kernel call, tracked in userspace", op, id);
                Ok(())
            }
        }
    }
}

impl EnforcementBackend for SyscallBackend {
    fn backend_name(&self) -> &str {
        "syscall"
    }

    fn create(&self, rule: &IsolationRule) -> Result<SandboxId> {
        // SAFETY: see call1.
        let ret = unsafe {
            libc::syscall(
                self.table.create as libc::c_long,
                rule.isolation_type as libc::c_long,
                rule.isolation_level as libc::c_long,
                ActionLevel::from(rule.priority) as libc::c_long,
            )
        };
        Self::check("create", ret).map(|bid| SandboxId(bid as i64))
    }

    fn release(&self, id: SandboxId) -> Result<()> {
        self.call1("release", Some(self.table.release), id)
    }

    fn activate(&self, id: SandboxId) -> Result<()> {
        self.call1("activate", self.table.activate, id)
    }

    fn freeze(&self, id: SandboxId) -> Result<()> {
        self.call1("freeze", self.table.freeze, id)
    }

    fn penalize(&self, id: SandboxId, penalty: Duration) -> Result<()> {
        let penalty_us = penalty_arg(penalty);
        // SAFETY: see call1.
        let ret = unsafe {
            libc::syscall(
                self.table.penalize as libc::c_long,
                id.0 as libc::c_long,
                penalty_us,
            )
        };
        Self::check("penalize", ret).map(|_| ())
    }

    fn wakeup(&self, id: SandboxId) -> Result<()> {
        self.call1("wakeup", Some(self.table.wakeup), id)
    }

    fn compensate(&self, id: SandboxId, level: ActionLevel) -> Result<()> {
        match self.table.compensate {
            Some(nr) => {
                // SAFETY: see call1.
                let ret = unsafe {
                    libc::syscall(
                        nr as libc::c_long,
                        id.0 as libc::c_long,
                        level as libc::c_long,
                    )
                };
                Self::check("compensate", ret).map(|_| ())
            }
            None => {
                log::debug!("compensate {} -> {:?} tracked in userspace", id, level);
                Ok(())
            }
        }
    }

    fn bind(&self, id: SandboxId, thread: ThreadTag) -> Result<()> {
        match self.table.bind {
            Some(nr) => {
                // SAFETY: see call1.
                let ret = unsafe {
                    libc::syscall(
                        nr as libc::c_long,
                        id.0 as libc::c_long,
                        thread.0 as libc::c_long,
                    )
                };
                Self::check("bind", ret).map(|_| ())
            }
            None => {
                log::debug!("bind {} to {} tracked in userspace", id, thread);
                Ok(())
            }
        }
    }

    fn unbind(&self, id: SandboxId) -> Result<()> {
        self.call1("unbind", self.table.unbind, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_does_not_panic() {
        let _ = probe(&SyscallTable::default());
    }

    #[test]
    fn test_penalty_arg_matches_kernel_units() {
        let budget = crate::config::settings::EngineConfig::default().penalty_budget();
        assert_eq!(penalty_arg(budget.neighbor), 100_000);
        assert_eq!(penalty_arg(budget.queue_release), 1_000);
        assert_eq!(penalty_arg(budget.mutex_release), 100_000);
        assert_eq!(penalty_arg(Duration::from_nanos(999)), 0);
        assert_eq!(penalty_arg(Duration::MAX), libc::c_long::MAX);
    }

    #[test]
    fn test_userspace_only_ops_succeed_without_numbers() {
        let backend = SyscallBackend::new(SyscallTable::default());
        assert!(backend.activate(SandboxId(1)).is_ok());
        assert!(backend.freeze(SandboxId(1)).is_ok());
        assert!(backend.unbind(SandboxId(1)).is_ok());
        assert!(backend.bind(SandboxId(1), ThreadTag::current()).is_ok());
        assert!(backend.compensate(SandboxId(1), ActionLevel::Highest).is_ok());
    }
}
