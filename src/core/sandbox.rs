//! Sandbox and activity records.
//!
//! The registry owns every `Sandbox`; the open `Activity` is an optional field
//! reset in place at `freeze`. Cross-references to other sandboxes are ids.

use crate::config::settings::EngineConfig;
use crate::config::types::{
    ActionLevel, IsolationRule, IsolationType, QueueState, ResourceKey, ResourceKind,
    SandboxId, SandboxState, ThreadTag,
};
use crate::kernel::clock::Timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One wait/execute episode of a sandbox
#[derive(Debug, Clone)]
pub struct Activity {
    pub execution_start: Timestamp,
    pub delaying_start: Timestamp,
    /// Accumulated wait inside this episode
    pub defer_time: Timestamp,
    pub queue_state: QueueState,
    pub resource_key: Option<ResourceKey>,
    pub resource_kind: Option<ResourceKind>,
    /// Mutex-like resources currently held, in acquisition order
    pub holders: Vec<ResourceKey>,
    pub is_preempted: bool,
    pub sleeping: bool,
}

impl Activity {
    pub fn open(now: Timestamp) -> Self {
        Self {
            execution_start: now,
            delaying_start: now,
            defer_time: Timestamp::ZERO,
            queue_state: QueueState::Exited,
            resource_key: None,
            resource_kind: None,
            holders: Vec::new(),
            is_preempted: false,
            sleeping: false,
        }
    }

    pub fn owned_mutex_count(&self) -> usize {
        self.holders.len()
    }

    pub fn holds(&self, key: ResourceKey) -> bool {
        self.holders.contains(&key)
    }

    /// Drop one hold of `key`; false when the key was not held
    pub fn drop_hold(&mut self, key: ResourceKey) -> bool {
        match self.holders.iter().rposition(|k| *k == key) {
            Some(pos) => {
                self.holders.remove(pos);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: SandboxId,
    pub owner_thread: Option<ThreadTag>,
    pub state: SandboxState,
    pub activity: Option<Activity>,
    pub rule: IsolationRule,

    pub delay_ratio: f64,
    pub interference_threshold: f64,
    pub tail_threshold: f64,
    pub finished_activities: u64,
    pub bad_activities: u64,
    /// Registry size minus self, sampled at `active`
    pub competitor_count: usize,

    pub baseline_level: ActionLevel,
    pub action_level: ActionLevel,
    pub compensation_ticket: u32,

    pub noisy_neighbor: Option<SandboxId>,
    pub victim: Option<SandboxId>,
    /// Correlates the audit records of one deferred-penalty handshake
    pub handshake: Option<Uuid>,
    /// An immediate penalty against this sandbox is with the backend
    pub penalty_in_flight: bool,

    pub created_at: DateTime<Utc>,
}

impl Sandbox {
    pub fn new(
        id: SandboxId,
        rule: IsolationRule,
        config: &EngineConfig,
        owner: ThreadTag,
    ) -> Self {
        let level = ActionLevel::from(rule.priority);
        Self {
            id,
            owner_thread: Some(owner),
            state: SandboxState::Start,
            activity: None,
            delay_ratio: rule.delay_ratio(),
            interference_threshold: rule.delay_ratio(),
            tail_threshold: config.tail_threshold,
            rule,
            finished_activities: 0,
            bad_activities: 0,
            competitor_count: 0,
            baseline_level: level,
            action_level: level,
            compensation_ticket: 0,
            noisy_neighbor: None,
            victim: None,
            handshake: None,
            penalty_in_flight: false,
            created_at: Utc::now(),
        }
    }

    /// Compensated sandboxes are never chosen as noisy neighbors
    pub fn is_immune(&self) -> bool {
        self.compensation_ticket > 0
    }

    fn in_compensation_state(&self) -> bool {
        matches!(
            self.state,
            SandboxState::Preempted
                | SandboxState::Penalized
                | SandboxState::PendingPenalty
                | SandboxState::Interfered
        )
    }

    /// Displaced, waiting on a penalty, or about to be penalized
    pub fn in_compensation(&self) -> bool {
        self.penalty_in_flight || self.in_compensation_state()
    }

    /// Tail threshold in effect for the escalation test
    pub fn effective_tail_threshold(&self) -> f64 {
        match self.rule.isolation_type {
            IsolationType::Scalable => self.tail_threshold * self.competitor_count.max(1) as f64,
            IsolationType::Absolute | IsolationType::Relative => self.tail_threshold,
        }
    }

    /// Return to `Active` from any compensation state; other states are left alone
    pub fn settle(&mut self) {
        if self.in_compensation_state() {
            self.state = SandboxState::Active;
        }
    }

    pub fn snapshot(&self) -> SandboxSnapshot {
        let activity = self.activity.as_ref();
        SandboxSnapshot {
            id: self.id,
            owner_thread: self.owner_thread,
            state: self.state,
            queue_state: activity.map(|a| a.queue_state),
            resource_key: activity.and_then(|a| a.resource_key),
            owned_mutex_count: activity.map_or(0, Activity::owned_mutex_count),
            is_preempted: activity.is_some_and(|a| a.is_preempted),
            sleeping: activity.is_some_and(|a| a.sleeping),
            defer_time: activity.map_or(Duration::ZERO, |a| a.defer_time.to_duration()),
            finished_activities: self.finished_activities,
            bad_activities: self.bad_activities,
            competitor_count: self.competitor_count,
            action_level: self.action_level,
            compensation_ticket: self.compensation_ticket,
            noisy_neighbor: self.noisy_neighbor,
            victim: self.victim,
            created_at: self.created_at,
        }
    }
}

/// Read-only copy of a sandbox's bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSnapshot {
    pub id: SandboxId,
    pub owner_thread: Option<ThreadTag>,
    pub state: SandboxState,
    pub queue_state: Option<QueueState>,
    pub resource_key: Option<ResourceKey>,
    pub owned_mutex_count: usize,
    pub is_preempted: bool,
    pub sleeping: bool,
    pub defer_time: Duration,
    pub finished_activities: u64,
    pub bad_activities: u64,
    pub competitor_count: usize,
    pub action_level: ActionLevel,
    pub compensation_ticket: u32,
    pub noisy_neighbor: Option<SandboxId>,
    pub victim: Option<SandboxId>,
    pub created_at: DateTime<Utc>,
}
