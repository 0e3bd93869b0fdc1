//! Interference Detector.
//!
//! A waiting sandbox is interfered when
//! `deferred > (executing - deferred) * delay_ratio * factor`, where the factor is the
//! size of the competitor set (at least 1) for relative and scalable isolation and 1
//! for absolute isolation.

use crate::config::types::{QueueState, SandboxId};
use crate::core::registry::Registry;
use crate::core::sandbox::Sandbox;
use crate::kernel::clock::Timestamp;
use std::time::Duration;

/// Pure ratio test on the current wait of `sandbox`
pub fn deferral_exceeds(sandbox: &Sandbox, set_size: usize, now: Timestamp) -> bool {
    let Some(activity) = sandbox.activity.as_ref() else {
        return false;
    };
    let executing = now.diff(activity.execution_start).as_nanos() as f64;
    let deferred = now.diff(activity.delaying_start).as_nanos() as f64;
    deferred > (executing - deferred) * sandbox.delay_ratio * sandbox.rule.contention_factor(set_size)
}

/// Whether `sandbox`, still waiting for its resource, has been deferred past its tolerance
pub fn is_interfered(sandbox: &Sandbox, set_size: usize, now: Timestamp) -> bool {
    if sandbox.state.in_handshake() {
        return false;
    }
    match sandbox.activity.as_ref() {
        Some(activity) if activity.queue_state == QueueState::Waiting => {
            deferral_exceeds(sandbox, set_size, now)
        }
        _ => false,
    }
}

/// Whether `candidate` may be blamed for another sandbox's deferral
fn is_eligible_neighbor(candidate: &Sandbox) -> bool {
    let Some(activity) = candidate.activity.as_ref() else {
        return false;
    };
    activity.queue_state == QueueState::Entered
        && !activity.is_preempted
        && !candidate.in_compensation()
        && !candidate.is_immune()
}

/// First member, in insertion order, that occupies the resource and is not already being dealt with
pub fn find_noisy_neighbor(
    registry: &Registry,
    caller: SandboxId,
    members: &[SandboxId],
) -> Option<SandboxId> {
    members
        .iter()
        .copied()
        .filter(|id| *id != caller)
        .find(|id| registry.get(*id).is_ok_and(is_eligible_neighbor))
}

/// Total deferral of the members still waiting past their own threshold
pub fn release_penalty_total(
    registry: &Registry,
    leaving: SandboxId,
    members: &[SandboxId],
    now: Timestamp,
) -> Duration {
    let set_size = members.len();
    members
        .iter()
        .filter(|id| **id != leaving)
        .filter_map(|id| registry.get(*id).ok())
        .filter(|sb| !sb.in_compensation())
        .filter_map(|sb| {
            let activity = sb.activity.as_ref()?;
            if activity.queue_state != QueueState::Waiting || activity.is_preempted {
                return None;
            }
            if !deferral_exceeds(sb, set_size, now) {
                return None;
            }
            Some(now.diff(activity.delaying_start).to_duration())
        })
        .sum()
}

/// At most one sleeping member to wake: a compensated one first, else the first past its threshold
pub fn pick_wakeup(registry: &Registry, members: &[SandboxId], now: Timestamp) -> Option<SandboxId> {
    let set_size = members.len();
    let sleeping: Vec<&Sandbox> = members
        .iter()
        .filter_map(|id| registry.get(*id).ok())
        .filter(|sb| sb.activity.as_ref().is_some_and(|a| a.sleeping))
        .collect();

    sleeping
        .iter()
        .find(|sb| sb.is_immune())
        .or_else(|| sleeping.iter().find(|sb| deferral_exceeds(sb, set_size, now)))
        .map(|sb| sb.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::EngineConfig;
    use crate::config::types::{IsolationRule, IsolationType, SandboxState, ThreadTag};
    use crate::core::sandbox::Activity;

    fn sandbox(id: i64, rule: IsolationRule) -> Sandbox {
        let mut sb = Sandbox::new(SandboxId(id), rule, &EngineConfig::default(), ThreadTag(id as i32));
        sb.state = SandboxState::Active;
        sb
    }

    fn waiting(id: i64, started: i64, waiting_since: i64) -> Sandbox {
        let mut sb = sandbox(id, IsolationRule::default());
        let mut activity = Activity::open(Timestamp::new(started, 0));
        activity.delaying_start = Timestamp::new(waiting_since, 0);
        activity.queue_state = QueueState::Waiting;
        sb.activity = Some(activity);
        sb
    }

    fn entered(id: i64) -> Sandbox {
        let mut sb = sandbox(id, IsolationRule::default());
        let mut activity = Activity::open(Timestamp::new(0, 0));
        activity.queue_state = QueueState::Entered;
        sb.activity = Some(activity);
        sb
    }

    #[test]
    fn test_is_interfered_threshold() {
        // executed 10s, waited the last 6s: 6 > 4 * 1.0 * 1
        let sb = waiting(1, 0, 4);
        assert!(is_interfered(&sb, 1, Timestamp::new(10, 0)));
        // two competitors double the tolerance: 6 > 8 is false
        assert!(!is_interfered(&sb, 2, Timestamp::new(10, 0)));
    }

    #[test]
    fn test_absolute_ignores_competitors() {
        let mut sb = waiting(1, 0, 4);
        sb.rule.isolation_type = IsolationType::Absolute;
        assert!(is_interfered(&sb, 5, Timestamp::new(10, 0)));
    }

    #[test]
    fn test_not_interfered_when_entered_or_in_handshake() {
        let mut sb = waiting(1, 0, 1);
        sb.state = SandboxState::Interfered;
        assert!(!is_interfered(&sb, 1, Timestamp::new(10, 0)));

        let sb = entered(2);
        assert!(!is_interfered(&sb, 1, Timestamp::new(10, 0)));
    }

    #[test]
    fn test_find_noisy_neighbor_first_fit() {
        let mut registry = Registry::new();
        registry.insert(waiting(1, 0, 0)).unwrap();
        registry.insert(entered(2)).unwrap();
        registry.insert(entered(3)).unwrap();

        let members = [SandboxId(1), SandboxId(3), SandboxId(2)];
        assert_eq!(
            find_noisy_neighbor(&registry, SandboxId(1), &members),
            Some(SandboxId(3))
        );
    }

    #[test]
    fn test_find_noisy_neighbor_skips_immune_and_penalized() {
        let mut registry = Registry::new();
        let mut immune = entered(2);
        immune.compensation_ticket = 3;
        let mut penalized = entered(3);
        penalized.state = SandboxState::Penalized;
        registry.insert(waiting(1, 0, 0)).unwrap();
        registry.insert(immune).unwrap();
        registry.insert(penalized).unwrap();

        let members = [SandboxId(1), SandboxId(2), SandboxId(3)];
        assert_eq!(find_noisy_neighbor(&registry, SandboxId(1), &members), None);
    }

    #[test]
    fn test_release_penalty_total_counts_waiters_over_threshold() {
        let mut registry = Registry::new();
        registry.insert(entered(1)).unwrap();
        registry.insert(waiting(2, 0, 2)).unwrap(); // waited 8s of 10s
        registry.insert(waiting(3, 0, 9)).unwrap(); // waited 1s of 10s

        let members = [SandboxId(1), SandboxId(2), SandboxId(3)];
        let total = release_penalty_total(&registry, SandboxId(1), &members, Timestamp::new(10, 0));
        assert_eq!(total, Duration::from_secs(8));
    }

    #[test]
    fn test_pick_wakeup_prefers_ticket_holder() {
        let mut registry = Registry::new();
        let mut over = waiting(1, 0, 1);
        over.activity.as_mut().unwrap().sleeping = true;
        let mut ticketed = waiting(2, 0, 9);
        ticketed.activity.as_mut().unwrap().sleeping = true;
        ticketed.compensation_ticket = 1;
        registry.insert(over).unwrap();
        registry.insert(ticketed).unwrap();

        let members = [SandboxId(1), SandboxId(2)];
        assert_eq!(
            pick_wakeup(&registry, &members, Timestamp::new(10, 0)),
            Some(SandboxId(2))
        );

        registry.get_mut(SandboxId(2)).unwrap().compensation_ticket = 0;
        assert_eq!(
            pick_wakeup(&registry, &members, Timestamp::new(10, 0)),
            Some(SandboxId(1))
        );
    }

    #[test]
    fn test_pick_wakeup_ignores_awake_members() {
        let mut registry = Registry::new();
        registry.insert(waiting(1, 0, 1)).unwrap();
        assert_eq!(
            pick_wakeup(&registry, &[SandboxId(1)], Timestamp::new(10, 0)),
            None
        );
    }
}
