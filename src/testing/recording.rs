//! Enforcement backend that records every call instead of enforcing anything.

use crate::config::types::{
    ActionLevel, IsolationRule, PerfboxError, Result, SandboxId, ThreadTag,
};
use crate::kernel::backend::EnforcementBackend;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Kind of backend operation, used to select failures and count calls
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Create,
    Release,
    Activate,
    Freeze,
    Penalize,
    Wakeup,
    Compensate,
    Bind,
    Unbind,
}

/// One successful backend call
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum BackendCall {
    Create { id: SandboxId },
    Release { id: SandboxId },
    Activate { id: SandboxId },
    Freeze { id: SandboxId },
    Penalize { id: SandboxId, penalty: Duration },
    Wakeup { id: SandboxId },
    Compensate { id: SandboxId, level: ActionLevel },
    Bind { id: SandboxId, thread: ThreadTag },
    Unbind { id: SandboxId },
}

impl BackendCall {
    pub fn kind(&self) -> CallKind {
        match self {
            BackendCall::Create { .. } => CallKind::Create,
            BackendCall::Release { .. } => CallKind::Release,
            BackendCall::Activate { .. } => CallKind::Activate,
            BackendCall::Freeze { .. } => CallKind::Freeze,
            BackendCall::Penalize { .. } => CallKind::Penalize,
            BackendCall::Wakeup { .. } => CallKind::Wakeup,
            BackendCall::Compensate { .. } => CallKind::Compensate,
            BackendCall::Bind { .. } => CallKind::Bind,
            BackendCall::Unbind { .. } => CallKind::Unbind,
        }
    }

    pub fn sandbox(&self) -> SandboxId {
        match *self {
            BackendCall::Create { id }
            | BackendCall::Release { id }
            | BackendCall::Activate { id }
            | BackendCall::Freeze { id }
            | BackendCall::Penalize { id, .. }
            | BackendCall::Wakeup { id }
            | BackendCall::Compensate { id, .. }
            | BackendCall::Bind { id, .. }
            | BackendCall::Unbind { id } => id,
        }
    }
}

impl fmt::Display for BackendCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendCall::Penalize { id, penalty } => write!(f, "penalize({}, {:?})", id, penalty),
            BackendCall::Compensate { id, level } => write!(f, "compensate({}, {:?})", id, level),
            BackendCall::Bind { id, thread } => write!(f, "bind({}, {})", id, thread),
            other => write!(f, "{:?}({})", other.kind(), other.sandbox()),
        }
    }
}

/// Records successful calls in order. Failed calls are not recorded.
#[derive(Debug)]
pub struct RecordingBackend {
    next_id: AtomicI64,
    calls: Mutex<Vec<BackendCall>>,
    failing: Mutex<HashSet<CallKind>>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    fn calls_guard(&self) -> MutexGuard<'_, Vec<BackendCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `kind` fail with a backend error
    pub fn fail_next(&self, kind: CallKind) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind);
    }

    fn record(&self, call: BackendCall) -> Result<()> {
        let kind = call.kind();
        let armed = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);
        if armed {
            return Err(PerfboxError::Backend(format!(
                "injected {:?} failure for {}",
                kind,
                call.sandbox()
            )));
        }
        self.calls_guard().push(call);
        Ok(())
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls_guard().clone()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.calls_guard().iter().filter(|c| c.kind() == kind).count()
    }

    pub fn penalties_of(&self, id: SandboxId) -> Vec<Duration> {
        self.calls_guard()
            .iter()
            .filter_map(|call| match *call {
                BackendCall::Penalize { id: target, penalty } if target == id => Some(penalty),
                _ => None,
            })
            .collect()
    }

    pub fn levels_of(&self, id: SandboxId) -> Vec<ActionLevel> {
        self.calls_guard()
            .iter()
            .filter_map(|call| match *call {
                BackendCall::Compensate { id: target, level } if target == id => Some(level),
                _ => None,
            })
            .collect()
    }

    /// Targets of wakeup calls, in order
    pub fn wakeups(&self) -> Vec<SandboxId> {
        self.calls_guard()
            .iter()
            .filter(|c| c.kind() == CallKind::Wakeup)
            .map(BackendCall::sandbox)
            .collect()
    }

    pub fn clear(&self) {
        self.calls_guard().clear();
    }
}

impl EnforcementBackend for RecordingBackend {
    fn backend_name(&self) -> &str {
        "recording"
    }

    fn create(&self, _rule: &IsolationRule) -> Result<SandboxId> {
        let armed = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&CallKind::Create);
        if armed {
            return Err(PerfboxError::Backend("injected create failure".to_string()));
        }
        let id = SandboxId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.calls_guard().push(BackendCall::Create { id });
        Ok(id)
    }

    fn release(&self, id: SandboxId) -> Result<()> {
        self.record(BackendCall::Release { id })
    }

    fn activate(&self, id: SandboxId) -> Result<()> {
        self.record(BackendCall::Activate { id })
    }

    fn freeze(&self, id: SandboxId) -> Result<()> {
        self.record(BackendCall::Freeze { id })
    }

    fn penalize(&self, id: SandboxId, penalty: Duration) -> Result<()> {
        self.record(BackendCall::Penalize { id, penalty })
    }

    fn wakeup(&self, id: SandboxId) -> Result<()> {
        self.record(BackendCall::Wakeup { id })
    }

    fn compensate(&self, id: SandboxId, level: ActionLevel) -> Result<()> {
        self.record(BackendCall::Compensate { id, level })
    }

    fn bind(&self, id: SandboxId, thread: ThreadTag) -> Result<()> {
        self.record(BackendCall::Bind { id, thread })
    }

    fn unbind(&self, id: SandboxId) -> Result<()> {
        self.record(BackendCall::Unbind { id })
    }
}
