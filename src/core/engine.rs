//! The engine: one lock over the registry and the competitor directory, event
//! dispatch, and the activity tracker.
//!
//! Lock discipline: bookkeeping happens under `state`; backend calls happen with
//! no engine lock held. A side-effecting action is planned under the lock, the
//! backend is called, and the plan is committed under the lock again only if the
//! call succeeded.

use crate::config::settings::EngineConfig;
use crate::config::types::{
    BoxEvent, EventOutcome, PenaltyBudget, PerfboxError, QueueState, ResourceKey, ResourceKind,
    Result, SandboxId, SandboxState, ThreadTag, TransferToken, IsolationRule,
};
use crate::config::validator::{validate_engine_config, validate_rule};
use crate::core::compensation::{self, LevelChange, PenaltyPlan, Resolution};
use crate::core::competitors::CompetitorDirectory;
use crate::core::current;
use crate::core::detector;
use crate::core::registry::Registry;
use crate::core::sandbox::{Activity, Sandbox, SandboxSnapshot};
use crate::core::transfer::TransferDirectory;
use crate::kernel::backend::{create_backend, EnforcementBackend};
use crate::kernel::clock::{Clock, MonotonicClock};
use crate::observability::audit::events as audit;
use crate::observability::metrics::{get_metrics, MetricsRegistry};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Default)]
struct EngineState {
    registry: Registry,
    competitors: CompetitorDirectory,
}

pub struct Engine {
    state: Mutex<EngineState>,
    transfers: TransferDirectory,
    backend: Arc<dyn EnforcementBackend>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    budget: PenaltyBudget,
    metrics: Arc<MetricsRegistry>,
}

impl Engine {
    /// Validate `config`, select the backend it asks for, report into the global metrics
    pub fn new(config: EngineConfig) -> Result<Self> {
        let report = validate_engine_config(&config)?;
        for warning in &report.warnings {
            warn!("Engine config: {}", warning);
        }
        for err in &report.errors {
            error!("Engine config: {}", err);
        }

        let backend = create_backend(config.backend, config.strict, &config.syscalls)?;
        Ok(Self::with_parts(
            config,
            backend,
            Arc::new(MonotonicClock),
            get_metrics(),
        ))
    }

    /// Engine over an explicit backend and clock with its own metrics registry
    pub fn with_backend(
        config: EngineConfig,
        backend: Arc<dyn EnforcementBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_parts(config, backend, clock, Arc::new(MetricsRegistry::new()))
    }

    pub fn with_parts(
        config: EngineConfig,
        backend: Arc<dyn EnforcementBackend>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        info!(
            "perfbox engine starting: backend={}, probing={}, tickets={}",
            backend.backend_name(),
            config.probing_number,
            config.compensation_ticket_number
        );
        Self {
            state: Mutex::new(EngineState::default()),
            transfers: TransferDirectory::new(),
            budget: config.penalty_budget(),
            backend,
            clock,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.backend_name()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| PerfboxError::Fatal("engine lock poisoned".to_string()))
    }

    fn backend_call<T>(&self, id: Option<SandboxId>, operation: &str, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            self.metrics.backend_errors.inc();
            error!("Backend {} failed for {:?}: {}", operation, id, e);
            audit::backend_failure(id, operation, &e);
            e
        })
    }

    fn sync_gauges(&self, state: &EngineState) {
        self.metrics
            .live_sandboxes
            .set(state.registry.iter().count() as u64);
        self.metrics
            .contended_keys
            .set(state.competitors.len() as u64);
    }

    // ---------------------------------------------------------------------
    // Sandbox lifecycle
    // ---------------------------------------------------------------------

    /// Create a sandbox bound to the calling thread
    pub fn create_sandbox(&self, rule: IsolationRule) -> Result<SandboxId> {
        let report = validate_rule(&rule, self.config.strict)?;
        for warning in &report.warnings {
            warn!("Isolation rule: {}", warning);
        }
        for err in &report.errors {
            warn!("Isolation rule accepted despite: {}", err);
        }

        let id = self.backend_call(None, "create", self.backend.create(&rule))?;
        let thread = ThreadTag::current();
        {
            let mut state = self.lock()?;
            state
                .registry
                .insert(Sandbox::new(id, rule, &self.config, thread))?;
            self.sync_gauges(&state);
        }
        current::set(id);

        self.metrics.sandboxes_created.inc();
        audit::sandbox_created(id, self.backend.backend_name());
        info!("Created sandbox {} on {}", id, thread);
        Ok(id)
    }

    /// Release a sandbox. Concurrent releases of the same id: one wins, the others see `SandboxNotFound`.
    pub fn release(&self, id: SandboxId) -> Result<()> {
        self.lock()?.registry.begin_release(id)?;

        if let Err(e) = self.backend_call(Some(id), "release", self.backend.release(id)) {
            self.lock()?.registry.abort_release(id);
            return Err(e);
        }

        let sandbox = {
            let mut state = self.lock()?;
            let EngineState {
                registry,
                competitors,
            } = &mut *state;
            competitors.purge(id);
            let sandbox = registry
                .finish_release(id)
                .ok_or(PerfboxError::SandboxNotFound(id))?;
            compensation::detach_refs(registry, id, sandbox.noisy_neighbor, sandbox.victim);
            self.sync_gauges(&state);
            sandbox
        };
        self.transfers.purge(id)?;
        current::clear_if(id);

        let open_activity = sandbox.activity.is_some();
        if open_activity {
            debug!("Discarded open activity of {} on release", id);
        }
        self.metrics.sandboxes_released.inc();
        audit::sandbox_released(id, open_activity);
        info!("Released sandbox {}", id);
        Ok(())
    }

    /// Open a new activity
    pub fn active(&self, id: SandboxId) -> Result<()> {
        if self.lock()?.registry.get(id)?.activity.is_some() {
            return Err(self.violation(id, format!("{} activated twice without freeze", id)));
        }

        self.backend_call(Some(id), "activate", self.backend.activate(id))?;

        let now = self.clock.now();
        let mut state = self.lock()?;
        let competitors = state.registry.iter().count().saturating_sub(1);
        let sandbox = state.registry.get_mut(id)?;
        sandbox.state = SandboxState::Active;
        sandbox.activity = Some(Activity::open(now));
        sandbox.competitor_count = competitors;
        debug!("{} active with {} competitors", id, competitors);
        Ok(())
    }

    /// Close the open activity: statistics, escalation and ticket decay
    pub fn freeze(&self, id: SandboxId) -> Result<()> {
        let now = self.clock.now();
        let plan = {
            let state = self.lock()?;
            let sandbox = state.registry.get(id)?;
            compensation::plan_freeze(sandbox, &self.config, now)
        };
        let Some(plan) = plan else {
            return Err(self.violation(id, format!("{} frozen without an open activity", id)));
        };

        self.backend_call(Some(id), "freeze", self.backend.freeze(id))?;
        let level_applied = match plan.change {
            Some(change) => self
                .backend_call(
                    Some(id),
                    "compensate",
                    self.backend.compensate(id, change.level()),
                )
                .is_ok(),
            None => true,
        };

        {
            let mut state = self.lock()?;
            let EngineState {
                registry,
                competitors,
            } = &mut *state;
            let left = competitors.purge(id);
            if !left.is_empty() {
                debug!("{} frozen while still competing for {:?}", id, left);
            }
            compensation::detach_peers(registry, id);
            let sandbox = registry.get_mut(id)?;
            compensation::commit_freeze(sandbox, &plan, level_applied);
            self.sync_gauges(&state);
        }

        self.metrics.record_activity(plan.defer, plan.bad);
        debug!(
            "{} frozen: execution={:?} defer={:?} bad={} ({}/{})",
            id, plan.execution, plan.defer, plan.bad, plan.bad_activities, plan.finished_activities
        );
        match (plan.change, level_applied) {
            (Some(LevelChange::Escalate(_)), true) => {
                self.metrics.escalations.inc();
                info!("Escalated {} for {} activities", id, plan.compensation_ticket);
                audit::escalated(
                    id,
                    plan.bad_activities,
                    plan.finished_activities,
                    plan.compensation_ticket,
                );
            }
            (Some(LevelChange::Expire(level)), true) => {
                self.metrics.tickets_expired.inc();
                info!("Compensation of {} expired, back to {:?}", id, level);
                audit::ticket_expired(id);
            }
            _ => {}
        }
        Ok(())
    }

    /// Sandbox of the calling thread
    pub fn get_current(&self) -> Result<SandboxId> {
        let state = self.lock()?;
        let thread = ThreadTag::current();
        if let Some(id) = current::get() {
            let owned = state
                .registry
                .get(id)
                .is_ok_and(|sb| sb.owner_thread == Some(thread));
            if owned {
                return Ok(id);
            }
        }
        state
            .registry
            .lookup_thread(thread)
            .ok_or(PerfboxError::NoCurrentSandbox(thread))
    }

    pub fn snapshot(&self, id: SandboxId) -> Result<SandboxSnapshot> {
        Ok(self.lock()?.registry.get(id)?.snapshot())
    }

    pub fn lookup_current(&self) -> Result<SandboxSnapshot> {
        let id = self.get_current()?;
        self.snapshot(id)
    }

    /// Members of the competitor set of `key`, in insertion order
    pub fn competitors(&self, key: ResourceKey) -> Result<Vec<SandboxId>> {
        Ok(self.lock()?.competitors.members(key)?.to_vec())
    }

    /// A sandbox currently holding `key`
    pub fn find_holder(&self, key: ResourceKey) -> Result<Option<SandboxId>> {
        let state = self.lock()?;
        let holder = state
            .registry
            .iter()
            .find(|sb| sb.activity.as_ref().is_some_and(|a| a.holds(key)))
            .map(|sb| sb.id);
        Ok(holder)
    }

    pub fn live_sandboxes(&self) -> Result<usize> {
        Ok(self.lock()?.registry.iter().count())
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Apply one instrumentation event of sandbox `id` on resource `key`
    pub fn update(&self, id: SandboxId, key: ResourceKey, event: BoxEvent) -> Result<EventOutcome> {
        let result = match event {
            BoxEvent::Prepare => self.begin_wait(id, key, ResourceKind::Queue),
            BoxEvent::Require => self.begin_wait(id, key, ResourceKind::Mutex),
            BoxEvent::Enter => self.enter(id, key, ResourceKind::Queue),
            BoxEvent::Acquire => self.enter(id, key, ResourceKind::Mutex),
            BoxEvent::Retry => self.check_interference(id, key),
            BoxEvent::Exit => self.leave(id, key, ResourceKind::Queue),
            BoxEvent::Release => self.leave(id, key, ResourceKind::Mutex),
            BoxEvent::Hold => self.hold(id, key),
            BoxEvent::Unhold => self.unhold(id, key),
            BoxEvent::SleepBegin => self.set_sleeping(id, key, true),
            BoxEvent::SleepEnd => self.set_sleeping(id, key, false),
        };

        match &result {
            Ok(outcome) => debug!("{} {} {} -> {:?}", id, event, key, outcome),
            Err(PerfboxError::ProtocolViolation(details)) => {
                self.metrics.protocol_violations.inc();
                warn!("Rejected {} from {} on {}: {}", event, id, key, details);
                audit::protocol_violation(id, details.clone());
            }
            Err(e) => debug!("{} {} {} failed: {}", id, event, key, e),
        }
        result
    }

    /// `update` for the sandbox of the calling thread
    pub fn update_current(&self, key: ResourceKey, event: BoxEvent) -> Result<EventOutcome> {
        let id = self.get_current()?;
        self.update(id, key, event)
    }

    fn violation(&self, id: SandboxId, details: String) -> PerfboxError {
        self.metrics.protocol_violations.inc();
        warn!("Protocol violation by {}: {}", id, details);
        audit::protocol_violation(id, details.clone());
        PerfboxError::ProtocolViolation(details)
    }

    fn begin_wait(&self, id: SandboxId, key: ResourceKey, kind: ResourceKind) -> Result<EventOutcome> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let EngineState {
            registry,
            competitors,
        } = &mut *state;

        let sandbox = registry.get_mut(id)?;
        let Some(activity) = sandbox.activity.as_mut() else {
            return Ok(EventOutcome::Ignored);
        };
        activity.delaying_start = now;
        activity.queue_state = QueueState::Waiting;
        activity.resource_key = Some(key);
        activity.resource_kind = Some(kind);
        activity.sleeping = false;
        competitors.join(key, id);

        self.sync_gauges(&state);
        Ok(EventOutcome::Recorded)
    }

    fn enter(&self, id: SandboxId, key: ResourceKey, kind: ResourceKind) -> Result<EventOutcome> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let EngineState {
            registry,
            competitors,
        } = &mut *state;

        let sandbox = registry.get_mut(id)?;
        let Some(activity) = sandbox.activity.as_mut() else {
            return Ok(EventOutcome::Ignored);
        };
        competitors.require_member(key, id)?;

        match activity.queue_state {
            QueueState::Waiting | QueueState::Promoted => {
                activity.defer_time = activity.defer_time + now.diff(activity.delaying_start);
            }
            QueueState::Entered | QueueState::Preempted => {
                return Err(PerfboxError::ProtocolViolation(format!(
                    "{} entered {} twice",
                    id, key
                )));
            }
            QueueState::Exited => {
                return Err(PerfboxError::ProtocolViolation(format!(
                    "{} entered {} without waiting for it",
                    id, key
                )));
            }
        }
        activity.queue_state = QueueState::Entered;
        activity.sleeping = false;
        if kind == ResourceKind::Mutex {
            activity.holders.push(key);
        }
        Ok(EventOutcome::Recorded)
    }

    fn leave(&self, id: SandboxId, key: ResourceKey, kind: ResourceKind) -> Result<EventOutcome> {
        let now = self.clock.now();
        let resolution = {
            let mut state = self.lock()?;
            let EngineState {
                registry,
                competitors,
            } = &mut *state;

            let sandbox = registry.get_mut(id)?;
            let Some(activity) = sandbox.activity.as_mut() else {
                return Ok(EventOutcome::Ignored);
            };
            competitors.require_member(key, id)?;
            if kind == ResourceKind::Mutex && !activity.drop_hold(key) {
                return Err(PerfboxError::ProtocolViolation(format!(
                    "{} released {} without holding it",
                    id, key
                )));
            }
            activity.queue_state = QueueState::Exited;
            activity.sleeping = false;
            competitors.leave(key, id)?;

            let remaining = competitors.members(key).map(<[SandboxId]>::to_vec).unwrap_or_default();
            let resolution = compensation::plan_leave(registry, id, kind, &remaining, &self.budget, now)?;
            self.sync_gauges(&state);
            resolution
        };

        let outcome = self.resolve(resolution)?;
        if !matches!(resolution, Resolution::CompleteHandshake { .. }) {
            self.wakeup_competitor(key)?;
        }
        Ok(outcome)
    }

    fn hold(&self, id: SandboxId, key: ResourceKey) -> Result<EventOutcome> {
        let mut state = self.lock()?;
        let sandbox = state.registry.get_mut(id)?;
        let Some(activity) = sandbox.activity.as_mut() else {
            return Ok(EventOutcome::Ignored);
        };
        activity.holders.push(key);
        Ok(EventOutcome::Recorded)
    }

    fn unhold(&self, id: SandboxId, key: ResourceKey) -> Result<EventOutcome> {
        let ready = {
            let mut state = self.lock()?;
            let sandbox = state.registry.get_mut(id)?;
            let Some(activity) = sandbox.activity.as_mut() else {
                return Ok(EventOutcome::Ignored);
            };
            if !activity.drop_hold(key) {
                return Err(PerfboxError::ProtocolViolation(format!(
                    "{} unheld {} without holding it",
                    id, key
                )));
            }
            compensation::handshake_ready(sandbox)
        };

        match ready {
            Some(victim) => self.resolve(Resolution::CompleteHandshake {
                neighbor: id,
                victim,
            }),
            None => Ok(EventOutcome::Recorded),
        }
    }

    fn set_sleeping(&self, id: SandboxId, key: ResourceKey, sleeping: bool) -> Result<EventOutcome> {
        let mut state = self.lock()?;
        let EngineState {
            registry,
            competitors,
        } = &mut *state;
        let sandbox = registry.get_mut(id)?;
        let Some(activity) = sandbox.activity.as_mut() else {
            return Ok(EventOutcome::Ignored);
        };
        competitors.require_member(key, id)?;
        activity.sleeping = sleeping;
        Ok(EventOutcome::Recorded)
    }

    // ---------------------------------------------------------------------
    // Detection and compensation
    // ---------------------------------------------------------------------

    /// Interference test for `id` waiting on `key`
    pub fn is_interfered(&self, id: SandboxId, key: ResourceKey) -> Result<bool> {
        let now = self.clock.now();
        let state = self.lock()?;
        let members = state.competitors.members(key)?;
        let sandbox = state.registry.get(id)?;
        Ok(detector::is_interfered(sandbox, members.len(), now))
    }

    /// First competitor on `key` that `id` may blame for its deferral
    pub fn find_noisy_neighbor(&self, id: SandboxId, key: ResourceKey) -> Result<Option<SandboxId>> {
        let state = self.lock()?;
        let members = state.competitors.members(key)?;
        Ok(detector::find_noisy_neighbor(&state.registry, id, members))
    }

    /// Run detection for a waiting sandbox and compensate it if it is interfered.
    /// Also the handler of `retry`.
    pub fn check_interference(&self, id: SandboxId, key: ResourceKey) -> Result<EventOutcome> {
        let now = self.clock.now();
        let neighbor = {
            let state = self.lock()?;
            let sandbox = state.registry.get(id)?;
            let Some(activity) = sandbox.activity.as_ref() else {
                return Ok(EventOutcome::Ignored);
            };
            state.competitors.require_member(key, id)?;
            if activity.queue_state == QueueState::Promoted {
                return Ok(EventOutcome::Promoted);
            }
            if sandbox.rule.retro {
                return Ok(EventOutcome::Recorded);
            }

            let members = state.competitors.members(key)?;
            if !detector::is_interfered(sandbox, members.len(), now) {
                return Ok(EventOutcome::Recorded);
            }
            self.metrics.interference_detected.inc();
            audit::interference_detected(id, key, members.len());

            match detector::find_noisy_neighbor(&state.registry, id, members) {
                Some(neighbor) => neighbor,
                None => {
                    debug!("{} interfered on {} but no competitor can be blamed", id, key);
                    return Ok(EventOutcome::Recorded);
                }
            }
        };

        self.penalize_competitor(neighbor, id)
    }

    /// Penalize `neighbor` on behalf of `victim`: immediately when the neighbor holds
    /// no nested resources, otherwise through a deferred handshake.
    pub fn penalize_competitor(&self, neighbor: SandboxId, victim: SandboxId) -> Result<EventOutcome> {
        if neighbor == victim {
            return Err(self.violation(victim, format!("{} cannot penalize itself", victim)));
        }

        let plan = {
            let mut state = self.lock()?;
            let registry = &mut state.registry;

            let v = registry.get(victim)?;
            if v.state.in_handshake() {
                return Ok(EventOutcome::Recorded);
            }
            let kind = v
                .activity
                .as_ref()
                .and_then(|a| a.resource_kind)
                .unwrap_or(ResourceKind::Queue);
            let key = v.activity.as_ref().and_then(|a| a.resource_key);

            let n = registry.get(neighbor)?;
            if n.in_compensation() || n.victim.is_some() {
                debug!("{} is already being compensated against", neighbor);
                return Ok(EventOutcome::Recorded);
            }

            match compensation::plan_penalty(registry, neighbor, victim, kind)? {
                PenaltyPlan::Deferred { neighbor, victim } => {
                    let correlation = Uuid::new_v4();
                    compensation::commit_deferred(registry, neighbor, victim, correlation)?;
                    self.metrics.penalties_deferred.inc();
                    warn!(
                        "Penalty of {} deferred until it releases its nested resources (victim {})",
                        neighbor, victim
                    );
                    if let Some(key) = key {
                        audit::penalty_deferred(neighbor, victim, key, correlation);
                    }
                    return Ok(EventOutcome::PenaltyDeferred { neighbor });
                }
                immediate => {
                    // Other victims skip this neighbor until the penalty is committed
                    registry.get_mut(neighbor)?.penalty_in_flight = true;
                    immediate
                }
            }
        };

        let PenaltyPlan::Immediate {
            neighbor,
            victim,
            kind,
        } = plan
        else {
            return Ok(EventOutcome::Recorded);
        };

        let applied = self.backend_call(
            Some(neighbor),
            "penalize",
            self.backend.penalize(neighbor, self.budget.neighbor),
        );

        let committed = {
            let mut state = self.lock()?;
            if let Ok(n) = state.registry.get_mut(neighbor) {
                n.penalty_in_flight = false;
            }
            applied?;
            compensation::commit_immediate(&mut state.registry, neighbor, victim, kind)?
        };
        if !committed {
            warn!(
                "{} or {} changed while the penalty was applied; bookkeeping left as is",
                neighbor, victim
            );
            return Ok(EventOutcome::Recorded);
        }

        self.metrics.penalties_immediate.inc();
        warn!("Penalized {} for {:?} on behalf of {}", neighbor, self.budget.neighbor, victim);
        audit::penalty_applied(neighbor, Some(victim), self.budget.neighbor);
        Ok(EventOutcome::PenaltyApplied { neighbor })
    }

    fn resolve(&self, resolution: Resolution) -> Result<EventOutcome> {
        match resolution {
            Resolution::Nothing => Ok(EventOutcome::Recorded),
            Resolution::CompleteHandshake { neighbor, victim } => {
                self.backend_call(Some(victim), "wakeup", self.backend.wakeup(victim))?;
                self.backend_call(
                    Some(neighbor),
                    "penalize",
                    self.backend.penalize(neighbor, self.budget.neighbor),
                )?;
                let correlation = {
                    let mut state = self.lock()?;
                    compensation::commit_leave(&mut state.registry, resolution)
                };
                self.metrics.handshakes_completed.inc();
                warn!(
                    "Deferred penalty of {} served, victim {} woken",
                    neighbor, victim
                );
                audit::handshake_completed(neighbor, victim, correlation);
                Ok(EventOutcome::HandshakeCompleted { victim })
            }
            Resolution::WakeNeighbor { victim, neighbor } => {
                self.backend_call(Some(neighbor), "wakeup", self.backend.wakeup(neighbor))?;
                {
                    let mut state = self.lock()?;
                    compensation::commit_leave(&mut state.registry, resolution);
                }
                self.metrics.wakeups.inc();
                audit::neighbor_woken(neighbor, Some(victim));
                Ok(EventOutcome::NeighborReleased { neighbor })
            }
            Resolution::ClearHandshake { .. } | Resolution::CancelHandshake { .. } => {
                let mut state = self.lock()?;
                compensation::commit_leave(&mut state.registry, resolution);
                Ok(EventOutcome::Recorded)
            }
            Resolution::ReleasePenalty { id, penalty, kind } => {
                self.backend_call(Some(id), "penalize", self.backend.penalize(id, penalty))?;
                self.metrics.record_release_penalty(kind);
                debug!("Release penalty of {:?} for {}", penalty, id);
                audit::penalty_applied(id, None, penalty);
                Ok(EventOutcome::Recorded)
            }
        }
    }

    /// Wake at most one sleeping competitor of `key`
    pub fn wakeup_competitor(&self, key: ResourceKey) -> Result<Option<SandboxId>> {
        let now = self.clock.now();
        let target = {
            let state = self.lock()?;
            match state.competitors.members(key) {
                Ok(members) => detector::pick_wakeup(&state.registry, members, now),
                Err(_) => None,
            }
        };
        let Some(target) = target else {
            return Ok(None);
        };

        self.backend_call(Some(target), "wakeup", self.backend.wakeup(target))?;
        {
            let mut state = self.lock()?;
            if let Ok(sandbox) = state.registry.get_mut(target) {
                if let Some(activity) = sandbox.activity.as_mut() {
                    activity.sleeping = false;
                }
            }
        }
        self.metrics.wakeups.inc();
        audit::neighbor_woken(target, None);
        Ok(Some(target))
    }

    // ---------------------------------------------------------------------
    // Ownership transfer
    // ---------------------------------------------------------------------

    /// Park `id` under `token`; it stays alive but belongs to no thread.
    /// Only a bound sandbox can be parked, and under one token at a time.
    pub fn unbind(&self, token: TransferToken, id: SandboxId) -> Result<()> {
        self.lock()?.registry.get(id)?;
        self.transfers.reserve(token, id)?;

        let previous = match self.detach_owner(id) {
            Ok(previous) => previous,
            Err(e) => {
                self.transfers.cancel(token, id)?;
                return Err(e);
            }
        };
        if let Err(e) = self.transfers.publish(token, id) {
            if let Ok(mut state) = self.lock() {
                if let Err(rebind) = state.registry.bind_thread(id, previous) {
                    debug!("{} not restored to {}: {}", id, previous, rebind);
                }
            }
            return Err(e);
        }
        current::clear_if(id);

        self.metrics.transfers_parked.inc();
        audit::ownership_parked(id, token);
        info!("Parked {} under {} (was on {})", id, token, previous);
        Ok(())
    }

    /// Detach a reserved sandbox from its owner thread; returns that thread
    fn detach_owner(&self, id: SandboxId) -> Result<ThreadTag> {
        let bound = self.lock()?.registry.get(id)?.owner_thread.is_some();
        if !bound {
            return Err(self.violation(id, format!("{} is parked or being adopted", id)));
        }

        self.backend_call(Some(id), "unbind", self.backend.unbind(id))?;
        let previous = self.lock()?.registry.unbind_thread(id)?;
        previous.ok_or(PerfboxError::Fatal(format!("{} lost its owner while reserved", id)))
    }

    /// Adopt the sandbox parked under `token`; `TransferSlotEmpty` if nothing is parked
    pub fn bind(&self, token: TransferToken) -> Result<SandboxId> {
        let id = self.transfers.take(token)?;
        self.adopt(token, id)
    }

    /// Like `bind`, but waits up to `timeout` for the matching `unbind`
    pub fn bind_wait(&self, token: TransferToken, timeout: Duration) -> Result<SandboxId> {
        let id = self.transfers.take_wait(token, timeout)?;
        self.adopt(token, id)
    }

    fn adopt(&self, token: TransferToken, id: SandboxId) -> Result<SandboxId> {
        let thread = ThreadTag::current();
        if let Err(e) = self.backend_call(Some(id), "bind", self.backend.bind(id, thread)) {
            if let Err(park_err) = self.transfers.park(token, id) {
                error!("Could not re-park {} under {}: {}", id, token, park_err);
            }
            return Err(e);
        }

        self.lock()?.registry.bind_thread(id, thread)?;
        current::set(id);

        self.metrics.transfers_adopted.inc();
        audit::ownership_adopted(id, token);
        info!("Adopted {} from {} on {}", id, token, thread);
        Ok(id)
    }
}
