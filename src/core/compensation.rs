//! Compensation Controller.
//!
//! Everything here is decided under the engine lock and never calls the backend.
//! The engine plans an action, performs the backend call unlocked, then commits
//! the plan only if that call succeeded.

use crate::config::settings::EngineConfig;
use crate::config::types::{
    ActionLevel, PenaltyBudget, QueueState, ResourceKind, Result, SandboxId, SandboxState,
};
use crate::core::detector;
use crate::core::registry::Registry;
use crate::core::sandbox::Sandbox;
use crate::kernel::clock::Timestamp;
use std::time::Duration;
use uuid::Uuid;

/// How a noisy neighbor is to be penalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyPlan {
    /// Neighbor holds nested resources: link both sides, penalize on its last release
    Deferred { neighbor: SandboxId, victim: SandboxId },
    /// Penalize now through the backend
    Immediate {
        neighbor: SandboxId,
        victim: SandboxId,
        kind: ResourceKind,
    },
}

pub fn plan_penalty(
    registry: &Registry,
    neighbor: SandboxId,
    victim: SandboxId,
    kind: ResourceKind,
) -> Result<PenaltyPlan> {
    let owned = registry
        .get(neighbor)?
        .activity
        .as_ref()
        .map_or(0, |a| a.owned_mutex_count());
    if owned > 0 {
        Ok(PenaltyPlan::Deferred { neighbor, victim })
    } else {
        Ok(PenaltyPlan::Immediate {
            neighbor,
            victim,
            kind,
        })
    }
}

/// Start a deferred-penalty handshake
pub fn commit_deferred(
    registry: &mut Registry,
    neighbor: SandboxId,
    victim: SandboxId,
    correlation: Uuid,
) -> Result<()> {
    // Both must exist before either side is touched
    registry.get(neighbor)?;
    registry.get(victim)?;

    let v = registry.get_mut(victim)?;
    v.state = SandboxState::Interfered;
    v.noisy_neighbor = Some(neighbor);

    let n = registry.get_mut(neighbor)?;
    n.state = SandboxState::PendingPenalty;
    n.victim = Some(victim);
    n.handshake = Some(correlation);
    Ok(())
}

/// Record an immediate penalty the backend already applied.
/// Returns false when either side changed while the engine lock was released.
pub fn commit_immediate(
    registry: &mut Registry,
    neighbor: SandboxId,
    victim: SandboxId,
    kind: ResourceKind,
) -> Result<bool> {
    let still_valid = registry.get(neighbor).is_ok_and(|n| {
        !n.in_compensation()
            && n.activity
                .as_ref()
                .is_some_and(|a| a.queue_state == QueueState::Entered)
    }) && registry.get(victim).is_ok_and(|v| v.activity.is_some());
    if !still_valid {
        return Ok(false);
    }

    let n = registry.get_mut(neighbor)?;
    match kind {
        ResourceKind::Queue => {
            n.state = SandboxState::Preempted;
            if let Some(activity) = n.activity.as_mut() {
                activity.queue_state = QueueState::Preempted;
            }
        }
        // The engine's mutex occupants hold their key and take the deferred path,
        // so this arm only sees a mutex occupant that records no hold.
        ResourceKind::Mutex => n.state = SandboxState::Penalized,
    }
    n.victim = Some(victim);

    let v = registry.get_mut(victim)?;
    v.noisy_neighbor = Some(neighbor);
    if let Some(activity) = v.activity.as_mut() {
        activity.is_preempted = true;
        activity.queue_state = QueueState::Promoted;
    }
    Ok(true)
}

/// A `PendingPenalty` neighbor whose last nested resource was just released
pub fn handshake_ready(sandbox: &Sandbox) -> Option<SandboxId> {
    if sandbox.state != SandboxState::PendingPenalty {
        return None;
    }
    let owned = sandbox.activity.as_ref().map_or(0, |a| a.owned_mutex_count());
    if owned == 0 {
        sandbox.victim
    } else {
        None
    }
}

/// Clear both sides of a finished handshake; returns its correlation id
pub fn commit_handshake(
    registry: &mut Registry,
    neighbor: SandboxId,
    victim: SandboxId,
) -> Option<Uuid> {
    let mut correlation = None;
    if let Ok(n) = registry.get_mut(neighbor) {
        n.victim = None;
        correlation = n.handshake.take();
        n.settle();
    }
    if let Ok(v) = registry.get_mut(victim) {
        if v.noisy_neighbor == Some(neighbor) {
            v.noisy_neighbor = None;
        }
        v.settle();
    }
    correlation
}

/// Drop every cross-reference `id` takes part in; peers return to `Active`
pub fn detach_peers(registry: &mut Registry, id: SandboxId) {
    let (neighbor, victim) = match registry.get_mut(id) {
        Ok(sb) => {
            sb.handshake = None;
            (sb.noisy_neighbor.take(), sb.victim.take())
        }
        Err(_) => return,
    };
    detach_refs(registry, id, neighbor, victim);
}

/// Clear the peers of `id` given its former references. Used directly when `id`
/// itself is no longer in the registry.
pub fn detach_refs(
    registry: &mut Registry,
    id: SandboxId,
    neighbor: Option<SandboxId>,
    victim: Option<SandboxId>,
) {
    if let Some(n) = neighbor.and_then(|n| registry.get_mut(n).ok()) {
        if n.victim == Some(id) {
            n.victim = None;
            n.handshake = None;
        }
        n.settle();
        if let Some(activity) = n.activity.as_mut() {
            if activity.queue_state == QueueState::Preempted {
                activity.queue_state = QueueState::Entered;
            }
        }
    }
    if let Some(v) = victim.and_then(|v| registry.get_mut(v).ok()) {
        if v.noisy_neighbor == Some(id) {
            v.noisy_neighbor = None;
        }
        if let Some(activity) = v.activity.as_mut() {
            activity.is_preempted = false;
        }
        v.settle();
    }
}

/// Action taken when a sandbox leaves a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Nothing,
    /// Leaving neighbor served its deferred penalty: wake the victim, penalize the neighbor
    CompleteHandshake { neighbor: SandboxId, victim: SandboxId },
    /// A displaced neighbor gets its slot back once the victim is done
    WakeNeighbor { victim: SandboxId, neighbor: SandboxId },
    /// The victim got through before the handshake finished
    ClearHandshake { victim: SandboxId, neighbor: SandboxId },
    /// Neighbor left the queue while still holding nested resources
    CancelHandshake { neighbor: SandboxId, victim: SandboxId },
    /// Others waited past their threshold while the leaver held the resource
    ReleasePenalty {
        id: SandboxId,
        penalty: Duration,
        kind: ResourceKind,
    },
}

/// Decide what leaving `kind` means for `id`. `remaining` is the set after it left.
pub fn plan_leave(
    registry: &Registry,
    id: SandboxId,
    kind: ResourceKind,
    remaining: &[SandboxId],
    budget: &PenaltyBudget,
    now: Timestamp,
) -> Result<Resolution> {
    let sb = registry.get(id)?;

    if let Some(victim) = handshake_ready(sb) {
        return Ok(Resolution::CompleteHandshake {
            neighbor: id,
            victim,
        });
    }

    let preempted = sb.activity.as_ref().is_some_and(|a| a.is_preempted);
    if let (true, Some(neighbor)) = (preempted, sb.noisy_neighbor) {
        return Ok(Resolution::WakeNeighbor {
            victim: id,
            neighbor,
        });
    }

    match (sb.state, sb.noisy_neighbor, sb.victim) {
        (SandboxState::Interfered, Some(neighbor), _) => {
            return Ok(Resolution::ClearHandshake {
                victim: id,
                neighbor,
            })
        }
        (SandboxState::PendingPenalty, _, Some(victim)) if kind == ResourceKind::Queue => {
            return Ok(Resolution::CancelHandshake {
                neighbor: id,
                victim,
            })
        }
        _ => {}
    }

    if sb.in_compensation() || sb.is_immune() {
        return Ok(Resolution::Nothing);
    }

    let mut with_leaver = Vec::with_capacity(remaining.len() + 1);
    with_leaver.push(id);
    with_leaver.extend_from_slice(remaining);
    let total = detector::release_penalty_total(registry, id, &with_leaver, now);
    let cap = budget.release_cap(kind);
    if total > cap {
        Ok(Resolution::ReleasePenalty {
            id,
            penalty: cap,
            kind,
        })
    } else {
        Ok(Resolution::Nothing)
    }
}

/// Bookkeeping for a resolution whose backend calls (if any) succeeded
pub fn commit_leave(registry: &mut Registry, resolution: Resolution) -> Option<Uuid> {
    match resolution {
        Resolution::Nothing | Resolution::ReleasePenalty { .. } => None,
        Resolution::CompleteHandshake { neighbor, victim } => {
            commit_handshake(registry, neighbor, victim)
        }
        Resolution::WakeNeighbor { victim, neighbor } => {
            if let Ok(v) = registry.get_mut(victim) {
                v.noisy_neighbor = None;
                if let Some(activity) = v.activity.as_mut() {
                    activity.is_preempted = false;
                }
                v.settle();
            }
            if let Ok(n) = registry.get_mut(neighbor) {
                if n.victim == Some(victim) {
                    n.victim = None;
                }
                n.settle();
                if let Some(activity) = n.activity.as_mut() {
                    if activity.queue_state == QueueState::Preempted {
                        activity.queue_state = QueueState::Entered;
                    }
                }
            }
            None
        }
        Resolution::ClearHandshake { victim, neighbor } => {
            commit_handshake(registry, neighbor, victim)
        }
        Resolution::CancelHandshake { neighbor, victim } => {
            let correlation = commit_handshake(registry, neighbor, victim);
            if let Ok(v) = registry.get_mut(victim) {
                if let Some(activity) = v.activity.as_mut() {
                    if activity.queue_state == QueueState::Waiting {
                        activity.queue_state = QueueState::Promoted;
                    }
                }
            }
            correlation
        }
    }
}

/// Priority change decided at `freeze`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelChange {
    Escalate(ActionLevel),
    Expire(ActionLevel),
}

impl LevelChange {
    pub fn level(self) -> ActionLevel {
        match self {
            LevelChange::Escalate(level) | LevelChange::Expire(level) => level,
        }
    }
}

/// Statistics of a finished activity and the escalation decision they lead to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreezePlan {
    pub execution: Duration,
    pub defer: Duration,
    pub bad: bool,
    pub finished_activities: u64,
    pub bad_activities: u64,
    pub compensation_ticket: u32,
    pub action_level: ActionLevel,
    pub change: Option<LevelChange>,
}

/// Apply the bad-activity test and the escalation rules to the open activity of `sandbox`
pub fn plan_freeze(sandbox: &Sandbox, config: &EngineConfig, now: Timestamp) -> Option<FreezePlan> {
    let activity = sandbox.activity.as_ref()?;

    let execution = now.diff(activity.execution_start);
    let defer = activity.defer_time;
    let net = execution.as_nanos() - defer.as_nanos();
    let factor = sandbox.rule.contention_factor(sandbox.competitor_count);
    let bad = (net as f64) * sandbox.interference_threshold * factor < defer.as_nanos() as f64;

    let finished = sandbox.finished_activities + 1;
    let bad_count = sandbox.bad_activities + u64::from(bad);

    let mut ticket = sandbox.compensation_ticket;
    let mut level = sandbox.action_level;
    let mut change = None;

    if ticket > 0 {
        ticket -= 1;
        if ticket == 0 {
            level = sandbox.baseline_level;
            change = Some(LevelChange::Expire(level));
        }
    } else if finished >= config.probing_number
        && bad_count as f64 > sandbox.effective_tail_threshold() * finished as f64
    {
        ticket = config.compensation_ticket_number;
        level = ActionLevel::Highest;
        change = Some(LevelChange::Escalate(level));
    }

    Some(FreezePlan {
        execution: execution.to_duration(),
        defer: defer.to_duration(),
        bad,
        finished_activities: finished,
        bad_activities: bad_count,
        compensation_ticket: ticket,
        action_level: level,
        change,
    })
}

/// Commit a freeze plan. When the backend refused the level change the ticket
/// and level stay as they were so the change is retried on the next freeze.
pub fn commit_freeze(sandbox: &mut Sandbox, plan: &FreezePlan, level_applied: bool) {
    sandbox.finished_activities = plan.finished_activities;
    sandbox.bad_activities = plan.bad_activities;
    if plan.change.is_none() || level_applied {
        sandbox.compensation_ticket = plan.compensation_ticket;
        sandbox.action_level = plan.action_level;
    }
    sandbox.state = SandboxState::Freeze;
    sandbox.activity = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{IsolationRule, Priority, ThreadTag};
    use crate::core::sandbox::Activity;

    fn active(id: i64) -> Sandbox {
        let mut sb = Sandbox::new(
            SandboxId(id),
            IsolationRule::default(),
            &EngineConfig::default(),
            ThreadTag(id as i32),
        );
        sb.state = SandboxState::Active;
        sb.activity = Some(Activity::open(Timestamp::ZERO));
        sb
    }

    fn config(probing: u64, tickets: u32) -> EngineConfig {
        EngineConfig {
            probing_number: probing,
            compensation_ticket_number: tickets,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_plan_penalty_depends_on_nested_holds() {
        let mut registry = Registry::new();
        let mut neighbor = active(1);
        neighbor.activity.as_mut().unwrap().holders.push(crate::config::types::ResourceKey(5));
        registry.insert(neighbor).unwrap();
        registry.insert(active(2)).unwrap();
        registry.insert(active(3)).unwrap();

        assert_eq!(
            plan_penalty(&registry, SandboxId(1), SandboxId(2), ResourceKind::Queue).unwrap(),
            PenaltyPlan::Deferred {
                neighbor: SandboxId(1),
                victim: SandboxId(2)
            }
        );
        assert!(matches!(
            plan_penalty(&registry, SandboxId(3), SandboxId(2), ResourceKind::Queue).unwrap(),
            PenaltyPlan::Immediate { .. }
        ));
    }

    #[test]
    fn test_deferred_handshake_roundtrip() {
        let mut registry = Registry::new();
        registry.insert(active(1)).unwrap();
        registry.insert(active(2)).unwrap();
        let correlation = Uuid::new_v4();

        commit_deferred(&mut registry, SandboxId(1), SandboxId(2), correlation).unwrap();
        assert_eq!(registry.get(SandboxId(1)).unwrap().state, SandboxState::PendingPenalty);
        assert_eq!(registry.get(SandboxId(2)).unwrap().state, SandboxState::Interfered);
        assert_eq!(handshake_ready(registry.get(SandboxId(1)).unwrap()), Some(SandboxId(2)));

        assert_eq!(
            commit_handshake(&mut registry, SandboxId(1), SandboxId(2)),
            Some(correlation)
        );
        let n = registry.get(SandboxId(1)).unwrap();
        let v = registry.get(SandboxId(2)).unwrap();
        assert_eq!((n.state, v.state), (SandboxState::Active, SandboxState::Active));
        assert_eq!((n.victim, v.noisy_neighbor), (None, None));
    }

    #[test]
    fn test_commit_immediate_requires_entered_neighbor() {
        let mut registry = Registry::new();
        registry.insert(active(1)).unwrap();
        registry.insert(active(2)).unwrap();

        assert!(!commit_immediate(&mut registry, SandboxId(1), SandboxId(2), ResourceKind::Queue).unwrap());

        registry.get_mut(SandboxId(1)).unwrap().activity.as_mut().unwrap().queue_state =
            QueueState::Entered;
        assert!(commit_immediate(&mut registry, SandboxId(1), SandboxId(2), ResourceKind::Queue).unwrap());

        let n = registry.get(SandboxId(1)).unwrap();
        assert_eq!(n.state, SandboxState::Preempted);
        assert_eq!(n.activity.as_ref().unwrap().queue_state, QueueState::Preempted);
        assert_eq!(n.victim, Some(SandboxId(2)));
        let v = registry.get(SandboxId(2)).unwrap();
        assert_eq!(v.noisy_neighbor, Some(SandboxId(1)));
        assert!(v.activity.as_ref().unwrap().is_preempted);
        assert_eq!(v.activity.as_ref().unwrap().queue_state, QueueState::Promoted);
    }

    #[test]
    fn test_commit_immediate_on_mutex_marks_penalized() {
        let mut registry = Registry::new();
        let mut neighbor = active(1);
        neighbor.activity.as_mut().unwrap().queue_state = QueueState::Entered;
        registry.insert(neighbor).unwrap();
        registry.insert(active(2)).unwrap();

        assert!(commit_immediate(&mut registry, SandboxId(1), SandboxId(2), ResourceKind::Mutex).unwrap());
        let n = registry.get(SandboxId(1)).unwrap();
        assert_eq!(n.state, SandboxState::Penalized);
        assert_eq!(n.activity.as_ref().unwrap().queue_state, QueueState::Entered);
        assert!(n.in_compensation());

        detach_peers(&mut registry, SandboxId(2));
        assert_eq!(registry.get(SandboxId(1)).unwrap().state, SandboxState::Active);
    }

    #[test]
    fn test_detach_peers_clears_both_sides() {
        let mut registry = Registry::new();
        registry.insert(active(1)).unwrap();
        registry.insert(active(2)).unwrap();
        commit_deferred(&mut registry, SandboxId(1), SandboxId(2), Uuid::new_v4()).unwrap();

        detach_peers(&mut registry, SandboxId(2));
        let n = registry.get(SandboxId(1)).unwrap();
        assert_eq!(n.state, SandboxState::Active);
        assert_eq!(n.victim, None);
        assert_eq!(registry.get(SandboxId(2)).unwrap().noisy_neighbor, None);
    }

    #[test]
    fn test_freeze_bad_activity_and_escalation() {
        let mut sb = active(1);
        // executed 10s, 8s of it deferred: 2 * 1.0 * 1 < 8
        sb.activity.as_mut().unwrap().defer_time = Timestamp::new(8, 0);

        let plan = plan_freeze(&sb, &config(1, 3), Timestamp::new(10, 0)).unwrap();
        assert!(plan.bad);
        assert_eq!(plan.defer, Duration::from_secs(8));
        assert_eq!(plan.change, Some(LevelChange::Escalate(ActionLevel::Highest)));
        assert_eq!(plan.compensation_ticket, 3);

        commit_freeze(&mut sb, &plan, true);
        assert_eq!(sb.state, SandboxState::Freeze);
        assert!(sb.activity.is_none());
        assert_eq!(sb.action_level, ActionLevel::Highest);
    }

    #[test]
    fn test_no_escalation_during_probing() {
        let mut sb = active(1);
        sb.activity.as_mut().unwrap().defer_time = Timestamp::new(8, 0);
        let plan = plan_freeze(&sb, &config(5, 3), Timestamp::new(10, 0)).unwrap();
        assert!(plan.bad);
        assert_eq!(plan.change, None);
    }

    #[test]
    fn test_ticket_decays_to_baseline() {
        let mut sb = active(1);
        sb.rule.priority = Priority::Mid;
        sb.baseline_level = ActionLevel::Mid;
        sb.action_level = ActionLevel::Highest;
        sb.compensation_ticket = 2;

        let plan = plan_freeze(&sb, &config(1, 3), Timestamp::new(10, 0)).unwrap();
        assert!(!plan.bad);
        assert_eq!(plan.compensation_ticket, 1);
        assert_eq!(plan.change, None);
        commit_freeze(&mut sb, &plan, true);

        sb.activity = Some(Activity::open(Timestamp::new(10, 0)));
        let plan = plan_freeze(&sb, &config(1, 3), Timestamp::new(11, 0)).unwrap();
        assert_eq!(plan.compensation_ticket, 0);
        assert_eq!(plan.change, Some(LevelChange::Expire(ActionLevel::Mid)));
    }

    #[test]
    fn test_failed_level_change_is_not_committed() {
        let mut sb = active(1);
        sb.activity.as_mut().unwrap().defer_time = Timestamp::new(8, 0);
        let plan = plan_freeze(&sb, &config(1, 3), Timestamp::new(10, 0)).unwrap();

        commit_freeze(&mut sb, &plan, false);
        assert_eq!(sb.finished_activities, 1);
        assert_eq!(sb.bad_activities, 1);
        assert_eq!(sb.compensation_ticket, 0);
        assert_eq!(sb.action_level, ActionLevel::Low);
    }
}
