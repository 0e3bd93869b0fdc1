//! End-to-end contention scenarios against the recording backend
//!
//! Time is driven by a manual clock so every deferral below is exact.

use perfbox::config::types::{ActionLevel, QueueState, SandboxState};
use perfbox::testing::{CallKind, ManualClock, RecordingBackend};
use perfbox::{BoxEvent, Engine, EngineConfig, EventOutcome, IsolationRule, ResourceKey, SandboxId};
use std::sync::Arc;
use std::time::Duration;

const QUEUE: ResourceKey = ResourceKey(0x5100);
const LOCK: ResourceKey = ResourceKey(0x5200);
const NESTED: ResourceKey = ResourceKey(0x5300);

struct Harness {
    engine: Engine,
    backend: Arc<RecordingBackend>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        let backend = Arc::new(RecordingBackend::new());
        let clock = Arc::new(ManualClock::new());
        let engine = Engine::with_backend(config, backend.clone(), clock.clone());
        Self {
            engine,
            backend,
            clock,
        }
    }

    fn started(&self) -> SandboxId {
        let id = self.engine.create_sandbox(IsolationRule::default()).unwrap();
        self.engine.active(id).unwrap();
        id
    }

    fn event(&self, id: SandboxId, key: ResourceKey, event: BoxEvent) -> EventOutcome {
        self.engine.update(id, key, event).unwrap()
    }

    fn advance_ms(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }

    /// One activity: wait `wait_ms` for the queue, then hold it for `run_ms`
    fn activity(&self, id: SandboxId, wait_ms: u64, run_ms: u64) {
        self.engine.active(id).unwrap();
        self.event(id, QUEUE, BoxEvent::Prepare);
        self.advance_ms(wait_ms);
        self.event(id, QUEUE, BoxEvent::Enter);
        self.advance_ms(run_ms);
        self.event(id, QUEUE, BoxEvent::Exit);
        self.engine.freeze(id).unwrap();
    }
}

#[test]
fn test_competitor_membership_is_unique() {
    let h = Harness::new(EngineConfig::default());
    let a = h.started();
    let b = h.started();

    h.event(a, QUEUE, BoxEvent::Prepare);
    h.event(a, QUEUE, BoxEvent::Prepare);
    h.event(b, QUEUE, BoxEvent::Prepare);
    h.event(a, LOCK, BoxEvent::Require);

    assert_eq!(h.engine.competitors(QUEUE).unwrap(), vec![a, b]);
    assert_eq!(h.engine.competitors(LOCK).unwrap(), vec![a]);
    assert_eq!(h.engine.metrics().contended_keys.get(), 2);
}

#[test]
fn test_leave_without_join_is_rejected() {
    let h = Harness::new(EngineConfig::default());
    let a = h.started();

    let err = h.engine.update(a, QUEUE, BoxEvent::Exit).unwrap_err();
    assert!(err.is_not_found());

    h.event(a, QUEUE, BoxEvent::Prepare);
    let b = h.started();
    assert!(h.engine.update(b, QUEUE, BoxEvent::Exit).is_err());
    assert_eq!(h.engine.competitors(QUEUE).unwrap(), vec![a]);
}

#[test]
fn test_contended_mutex_detection() {
    let h = Harness::new(EngineConfig::default());
    let a = h.started();
    let b = h.started();

    h.event(a, LOCK, BoxEvent::Require);
    h.event(a, LOCK, BoxEvent::Acquire);
    h.event(b, LOCK, BoxEvent::Require);
    assert!(!h.engine.is_interfered(b, LOCK).unwrap());

    h.advance_ms(1000);
    assert!(h.engine.is_interfered(b, LOCK).unwrap());
    assert!(!h.engine.is_interfered(a, LOCK).unwrap());
    assert_eq!(h.engine.find_noisy_neighbor(b, LOCK).unwrap(), Some(a));
    assert_eq!(h.engine.find_holder(LOCK).unwrap(), Some(a));
}

#[test]
fn test_deferred_penalty_handshake_completes_once() {
    let h = Harness::new(EngineConfig::default());
    let neighbor = h.started();
    let victim = h.started();

    h.event(neighbor, LOCK, BoxEvent::Require);
    h.event(neighbor, LOCK, BoxEvent::Acquire);
    h.event(victim, LOCK, BoxEvent::Require);
    h.advance_ms(1000);

    assert_eq!(
        h.engine.check_interference(victim, LOCK).unwrap(),
        EventOutcome::PenaltyDeferred { neighbor }
    );
    let n = h.engine.snapshot(neighbor).unwrap();
    let v = h.engine.snapshot(victim).unwrap();
    assert_eq!(n.state, SandboxState::PendingPenalty);
    assert_eq!(n.victim, Some(victim));
    assert_eq!(v.state, SandboxState::Interfered);
    assert_eq!(v.noisy_neighbor, Some(neighbor));
    assert_eq!(h.backend.count(CallKind::Penalize), 0);

    // A victim already in a handshake is not compensated twice
    assert_eq!(h.event(victim, LOCK, BoxEvent::Retry), EventOutcome::Recorded);

    assert_eq!(
        h.event(neighbor, LOCK, BoxEvent::Release),
        EventOutcome::HandshakeCompleted { victim }
    );
    assert_eq!(
        h.backend.penalties_of(neighbor),
        vec![Duration::from_millis(100)]
    );
    assert_eq!(h.backend.wakeups(), vec![victim]);

    let n = h.engine.snapshot(neighbor).unwrap();
    let v = h.engine.snapshot(victim).unwrap();
    assert_eq!((n.state, v.state), (SandboxState::Active, SandboxState::Active));
    assert_eq!((n.victim, v.noisy_neighbor), (None, None));
    assert_eq!(h.engine.metrics().handshakes_completed.get(), 1);

    h.event(victim, LOCK, BoxEvent::Acquire);
    h.event(victim, LOCK, BoxEvent::Release);
    assert_eq!(h.backend.count(CallKind::Penalize), 1);
}

#[test]
fn test_nested_hold_defers_queue_penalty_until_unhold() {
    let h = Harness::new(EngineConfig::default());
    let neighbor = h.started();
    let victim = h.started();

    h.event(neighbor, QUEUE, BoxEvent::Prepare);
    h.event(neighbor, QUEUE, BoxEvent::Enter);
    h.event(neighbor, NESTED, BoxEvent::Hold);
    h.event(neighbor, NESTED, BoxEvent::Hold);
    h.event(victim, QUEUE, BoxEvent::Prepare);
    h.advance_ms(500);

    assert_eq!(
        h.event(victim, QUEUE, BoxEvent::Retry),
        EventOutcome::PenaltyDeferred { neighbor }
    );
    assert_eq!(h.engine.snapshot(neighbor).unwrap().owned_mutex_count, 2);

    assert_eq!(h.event(neighbor, NESTED, BoxEvent::Unhold), EventOutcome::Recorded);
    assert_eq!(h.backend.count(CallKind::Penalize), 0);
    assert_eq!(
        h.event(neighbor, NESTED, BoxEvent::Unhold),
        EventOutcome::HandshakeCompleted { victim }
    );
    assert_eq!(h.backend.penalties_of(neighbor).len(), 1);
    assert!(h.engine.update(neighbor, NESTED, BoxEvent::Unhold).is_err());
}

#[test]
fn test_queue_of_two_displaces_first_occupant() {
    let h = Harness::new(EngineConfig::default());
    let a = h.started();
    let b = h.started();
    let c = h.started();

    h.event(a, QUEUE, BoxEvent::Prepare);
    h.event(a, QUEUE, BoxEvent::Enter);
    h.event(b, QUEUE, BoxEvent::Prepare);
    h.event(b, QUEUE, BoxEvent::Enter);

    // c runs 300ms, then waits; three competitors triple its tolerance (0.9s)
    h.advance_ms(300);
    h.event(c, QUEUE, BoxEvent::Prepare);
    h.advance_ms(500);
    assert_eq!(h.event(c, QUEUE, BoxEvent::Retry), EventOutcome::Recorded);

    h.advance_ms(1000);
    assert_eq!(
        h.event(c, QUEUE, BoxEvent::Retry),
        EventOutcome::PenaltyApplied { neighbor: a }
    );
    assert_eq!(h.backend.penalties_of(a), vec![Duration::from_millis(100)]);
    assert_eq!(h.engine.snapshot(a).unwrap().state, SandboxState::Preempted);
    assert_eq!(h.engine.snapshot(b).unwrap().state, SandboxState::Active);
    assert_eq!(h.event(c, QUEUE, BoxEvent::Retry), EventOutcome::Promoted);

    h.event(c, QUEUE, BoxEvent::Enter);
    let snap = h.engine.snapshot(c).unwrap();
    assert_eq!(snap.defer_time, Duration::from_millis(1500));
    assert_eq!(snap.queue_state, Some(QueueState::Entered));

    h.advance_ms(100);
    assert_eq!(
        h.event(c, QUEUE, BoxEvent::Exit),
        EventOutcome::NeighborReleased { neighbor: a }
    );
    assert_eq!(h.backend.wakeups(), vec![a]);
    assert_eq!(h.engine.snapshot(a).unwrap().state, SandboxState::Active);
    assert_eq!(h.engine.snapshot(c).unwrap().noisy_neighbor, None);

    h.event(a, QUEUE, BoxEvent::Exit);
    h.event(b, QUEUE, BoxEvent::Exit);
    assert!(h.engine.competitors(QUEUE).is_err());
}

#[test]
fn test_escalation_waits_for_probing_and_is_monotonic() {
    let config = EngineConfig {
        probing_number: 3,
        compensation_ticket_number: 2,
        ..EngineConfig::default()
    };
    let h = Harness::new(config);
    let id = h.engine.create_sandbox(IsolationRule::default()).unwrap();

    let mut previous = 0;
    let mut levels = Vec::new();
    for _ in 0..3 {
        h.activity(id, 3000, 1000);
        let snap = h.engine.snapshot(id).unwrap();
        assert!(snap.finished_activities > previous);
        assert!(snap.bad_activities <= snap.finished_activities);
        previous = snap.finished_activities;
        levels.push(snap.action_level);
    }

    assert_eq!(
        levels,
        vec![ActionLevel::Low, ActionLevel::Low, ActionLevel::Highest]
    );
    assert_eq!(h.engine.snapshot(id).unwrap().compensation_ticket, 2);
    assert_eq!(h.backend.levels_of(id), vec![ActionLevel::Highest]);
}

#[test]
fn test_ticket_decays_back_to_baseline() {
    let config = EngineConfig {
        probing_number: 1,
        compensation_ticket_number: 2,
        ..EngineConfig::default()
    };
    let h = Harness::new(config);
    let id = h
        .engine
        .create_sandbox(IsolationRule {
            priority: perfbox::config::types::Priority::Mid,
            ..IsolationRule::default()
        })
        .unwrap();

    h.activity(id, 3000, 1000);
    let snap = h.engine.snapshot(id).unwrap();
    assert_eq!((snap.action_level, snap.compensation_ticket), (ActionLevel::Highest, 2));

    // Immune while the ticket lasts, even for bad activities
    h.activity(id, 3000, 1000);
    let snap = h.engine.snapshot(id).unwrap();
    assert_eq!((snap.action_level, snap.compensation_ticket), (ActionLevel::Highest, 1));

    h.activity(id, 0, 1000);
    let snap = h.engine.snapshot(id).unwrap();
    assert_eq!((snap.action_level, snap.compensation_ticket), (ActionLevel::Mid, 0));
    assert_eq!(
        h.backend.levels_of(id),
        vec![ActionLevel::Highest, ActionLevel::Mid]
    );
    assert_eq!(h.engine.metrics().tickets_expired.get(), 1);
}

#[test]
fn test_failed_compensate_is_retried_on_next_freeze() {
    let config = EngineConfig {
        probing_number: 1,
        ..EngineConfig::default()
    };
    let h = Harness::new(config);
    let id = h.engine.create_sandbox(IsolationRule::default()).unwrap();

    h.backend.fail_next(CallKind::Compensate);
    h.activity(id, 3000, 1000);
    let snap = h.engine.snapshot(id).unwrap();
    assert_eq!(snap.finished_activities, 1);
    assert_eq!((snap.action_level, snap.compensation_ticket), (ActionLevel::Low, 0));
    assert_eq!(h.engine.metrics().backend_errors.get(), 1);

    h.activity(id, 3000, 1000);
    let snap = h.engine.snapshot(id).unwrap();
    assert_eq!(snap.action_level, ActionLevel::Highest);
    assert_eq!(h.backend.levels_of(id), vec![ActionLevel::Highest]);
}

#[test]
fn test_failed_handshake_penalty_keeps_handshake() {
    let h = Harness::new(EngineConfig::default());
    let neighbor = h.started();
    let victim = h.started();
    h.event(neighbor, QUEUE, BoxEvent::Prepare);
    h.event(neighbor, QUEUE, BoxEvent::Enter);
    h.event(neighbor, NESTED, BoxEvent::Hold);
    h.event(victim, QUEUE, BoxEvent::Prepare);
    h.advance_ms(500);
    h.event(victim, QUEUE, BoxEvent::Retry);

    h.backend.fail_next(CallKind::Penalize);
    assert!(h.engine.update(neighbor, NESTED, BoxEvent::Unhold).is_err());
    assert_eq!(
        h.engine.snapshot(neighbor).unwrap().state,
        SandboxState::PendingPenalty
    );
    assert_eq!(
        h.engine.snapshot(victim).unwrap().state,
        SandboxState::Interfered
    );

    // The handshake is picked up again when the neighbor leaves the queue
    assert_eq!(
        h.event(neighbor, QUEUE, BoxEvent::Exit),
        EventOutcome::HandshakeCompleted { victim }
    );
    assert_eq!(h.backend.penalties_of(neighbor).len(), 1);
}

#[test]
fn test_release_with_open_activity_cleans_up() {
    let h = Harness::new(EngineConfig::default());
    let neighbor = h.started();
    let victim = h.started();
    h.event(neighbor, QUEUE, BoxEvent::Prepare);
    h.event(neighbor, QUEUE, BoxEvent::Enter);
    h.event(neighbor, NESTED, BoxEvent::Hold);
    h.event(victim, QUEUE, BoxEvent::Prepare);
    h.advance_ms(500);
    h.event(victim, QUEUE, BoxEvent::Retry);

    h.engine.release(neighbor).unwrap();

    assert!(h.engine.snapshot(neighbor).unwrap_err().is_not_found());
    assert_eq!(h.engine.competitors(QUEUE).unwrap(), vec![victim]);
    assert_eq!(h.engine.find_holder(NESTED).unwrap(), None);
    let v = h.engine.snapshot(victim).unwrap();
    assert_eq!(v.state, SandboxState::Active);
    assert_eq!(v.noisy_neighbor, None);
    assert_eq!(h.engine.metrics().activities_finished.get(), 0);
    assert_eq!(h.engine.metrics().live_sandboxes.get(), 1);
}

#[test]
fn test_events_after_freeze_are_ignored() {
    let h = Harness::new(EngineConfig::default());
    let id = h.started();
    h.engine.freeze(id).unwrap();

    assert_eq!(h.event(id, QUEUE, BoxEvent::Prepare), EventOutcome::Ignored);
    assert_eq!(h.event(id, QUEUE, BoxEvent::Exit), EventOutcome::Ignored);
    assert!(h.engine.competitors(QUEUE).is_err());
}
