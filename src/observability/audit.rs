/// Compensation audit trail
/// Structured records of every decision the engine takes against a sandbox:
/// lifecycle, detection, penalties, escalation and ownership transfer.
///
/// Each record is one JSON object per line. Records go through `log` always and are
/// appended to an audit file once `init_audit_logger` has run.
use crate::config::types::{PerfboxError, ResourceKey, Result, SandboxId, TransferToken};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    High,
    Medium,
    Low,
}

/// Kinds of engine decisions that are audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationEventType {
    // Lifecycle
    SandboxCreated,
    SandboxReleased,

    // Detection and compensation
    InterferenceDetected,
    PenaltyApplied,
    PenaltyDeferred,
    HandshakeCompleted,
    NeighborWoken,
    Escalated,
    TicketExpired,

    // Ownership transfer
    OwnershipParked,
    OwnershipAdopted,

    // Failures
    ProtocolViolation,
    BackendFailure,
}

impl CompensationEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            CompensationEventType::SandboxCreated
            | CompensationEventType::SandboxReleased
            | CompensationEventType::OwnershipParked
            | CompensationEventType::OwnershipAdopted
            | CompensationEventType::TicketExpired
            | CompensationEventType::NeighborWoken => AuditSeverity::Low,

            CompensationEventType::InterferenceDetected
            | CompensationEventType::PenaltyApplied
            | CompensationEventType::PenaltyDeferred
            | CompensationEventType::HandshakeCompleted
            | CompensationEventType::Escalated
            | CompensationEventType::ProtocolViolation => AuditSeverity::Medium,

            CompensationEventType::BackendFailure => AuditSeverity::High,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationEvent {
    pub event_type: CompensationEventType,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    /// Shared by the records of one multi-step decision (e.g. a deferred penalty and its completion)
    pub correlation: Uuid,
    pub sandbox: Option<SandboxId>,
    /// Other side of a penalty or handshake
    pub peer: Option<SandboxId>,
    pub resource: Option<ResourceKey>,
    pub token: Option<TransferToken>,
}

impl CompensationEvent {
    pub fn new(event_type: CompensationEventType, details: String) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details,
            correlation: Uuid::new_v4(),
            sandbox: None,
            peer: None,
            resource: None,
            token: None,
        }
    }

    pub fn with_sandbox(mut self, id: SandboxId) -> Self {
        self.sandbox = Some(id);
        self
    }

    pub fn with_peer(mut self, id: SandboxId) -> Self {
        self.peer = Some(id);
        self
    }

    pub fn with_resource(mut self, key: ResourceKey) -> Self {
        self.resource = Some(key);
        self
    }

    pub fn with_token(mut self, token: TransferToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_correlation(mut self, correlation: Uuid) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// One-line JSON rendering
    pub fn to_json_line(&self) -> String {
        let entry = serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "correlation": self.correlation.to_string(),
            "sandbox": self.sandbox,
            "peer": self.peer,
            "resource": self.resource,
            "token": self.token,
            "process_id": std::process::id(),
        });
        entry.to_string()
    }
}

/// Audit sink appending JSON lines to a file
pub struct AuditLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_path: &Path) -> Result<Self> {
        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PerfboxError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit_path)
            .map_err(|e| PerfboxError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path: audit_path.to_path_buf(),
        })
    }

    pub fn log_event(&self, event: &CompensationEvent) {
        emit_to_log(event);

        if let Ok(mut file) = self.audit_file.lock() {
            if let Err(e) = writeln!(file, "{}", event.to_json_line()) {
                error!("Failed to write to audit log: {}", e);
            }
            if let Err(e) = file.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        } else {
            error!("Failed to acquire lock on audit file");
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

fn emit_to_log(event: &CompensationEvent) {
    match event.severity {
        AuditSeverity::High => error!("AUDIT {:?}: {}", event.event_type, event.details),
        AuditSeverity::Medium => warn!("AUDIT {:?}: {}", event.event_type, event.details),
        AuditSeverity::Low => info!("AUDIT {:?}: {}", event.event_type, event.details),
    }
}

static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Initialize the global file-backed audit sink
pub fn init_audit_logger(audit_path: &Path) -> Result<()> {
    let logger = AuditLogger::new(audit_path)?;
    if AUDIT_LOGGER.set(logger).is_err() {
        warn!("Audit logger already initialized");
    } else {
        info!("Audit logger writing to {}", audit_path.display());
    }
    Ok(())
}

/// Emit an audit record through the global sink, or `log` alone when none is set
pub fn log_compensation_event(event: CompensationEvent) {
    match AUDIT_LOGGER.get() {
        Some(logger) => logger.log_event(&event),
        None => emit_to_log(&event),
    }
}

/// Convenience functions for the records the engine emits
pub mod events {
    use super::*;
    use std::time::Duration;

    pub fn sandbox_created(id: SandboxId, backend: &str) {
        log_compensation_event(
            CompensationEvent::new(
                CompensationEventType::SandboxCreated,
                format!("Sandbox {} created on {} backend", id, backend),
            )
            .with_sandbox(id),
        );
    }

    pub fn sandbox_released(id: SandboxId, open_activity: bool) {
        log_compensation_event(
            CompensationEvent::new(
                CompensationEventType::SandboxReleased,
                format!(
                    "Sandbox {} released (open activity discarded: {})",
                    id, open_activity
                ),
            )
            .with_sandbox(id),
        );
    }

    pub fn interference_detected(victim: SandboxId, key: ResourceKey, competitors: usize) {
        log_compensation_event(
            CompensationEvent::new(
                CompensationEventType::InterferenceDetected,
                format!(
                    "Sandbox {} over its deferral threshold on {} with {} competitors",
                    victim, key, competitors
                ),
            )
            .with_sandbox(victim)
            .with_resource(key),
        );
    }

    pub fn penalty_applied(neighbor: SandboxId, victim: Option<SandboxId>, penalty: Duration) {
        let event = CompensationEvent::new(
            CompensationEventType::PenaltyApplied,
            format!("Sandbox {} penalized for {:?}", neighbor, penalty),
        )
        .with_sandbox(neighbor);
        log_compensation_event(match victim {
            Some(v) => event.with_peer(v),
            None => event,
        });
    }

    pub fn penalty_deferred(
        neighbor: SandboxId,
        victim: SandboxId,
        key: ResourceKey,
        correlation: Uuid,
    ) {
        log_compensation_event(
            CompensationEvent::new(
                CompensationEventType::PenaltyDeferred,
                format!(
                    "Penalty of {} deferred until it releases its nested resources",
                    neighbor
                ),
            )
            .with_sandbox(neighbor)
            .with_peer(victim)
            .with_resource(key)
            .with_correlation(correlation),
        );
    }

    pub fn handshake_completed(neighbor: SandboxId, victim: SandboxId, correlation: Option<Uuid>) {
        let event = CompensationEvent::new(
            CompensationEventType::HandshakeCompleted,
            format!("Deferred penalty of {} served, {} woken", neighbor, victim),
        )
        .with_sandbox(neighbor)
        .with_peer(victim);
        log_compensation_event(match correlation {
            Some(c) => event.with_correlation(c),
            None => event,
        });
    }

    pub fn neighbor_woken(id: SandboxId, by: Option<SandboxId>) {
        let event = CompensationEvent::new(
            CompensationEventType::NeighborWoken,
            format!("Sandbox {} woken", id),
        )
        .with_sandbox(id);
        log_compensation_event(match by {
            Some(peer) => event.with_peer(peer),
            None => event,
        });
    }

    pub fn escalated(id: SandboxId, bad: u64, finished: u64, ticket: u32) {
        log_compensation_event(
            CompensationEvent::new(
                CompensationEventType::Escalated,
                format!(
                    "Sandbox {} escalated after {}/{} bad activities, ticket={}",
                    id, bad, finished, ticket
                ),
            )
            .with_sandbox(id),
        );
    }

    pub fn ticket_expired(id: SandboxId) {
        log_compensation_event(
            CompensationEvent::new(
                CompensationEventType::TicketExpired,
                format!("Compensation ticket of {} ran out", id),
            )
            .with_sandbox(id),
        );
    }

    pub fn ownership_parked(id: SandboxId, token: TransferToken) {
        log_compensation_event(
            CompensationEvent::new(
                CompensationEventType::OwnershipParked,
                format!("Sandbox {} parked under {}", id, token),
            )
            .with_sandbox(id)
            .with_token(token),
        );
    }

    pub fn ownership_adopted(id: SandboxId, token: TransferToken) {
        log_compensation_event(
            CompensationEvent::new(
                CompensationEventType::OwnershipAdopted,
                format!("Sandbox {} adopted from {}", id, token),
            )
            .with_sandbox(id)
            .with_token(token),
        );
    }

    pub fn protocol_violation(id: SandboxId, details: String) {
        log_compensation_event(
            CompensationEvent::new(CompensationEventType::ProtocolViolation, details)
                .with_sandbox(id),
        );
    }

    pub fn backend_failure(id: Option<SandboxId>, operation: &str, error: &PerfboxError) {
        let event = CompensationEvent::new(
            CompensationEventType::BackendFailure,
            format!("Backend {} failed: {}", operation, error),
        );
        log_compensation_event(match id {
            Some(id) => event.with_sandbox(id),
            None => event,
        });
    }
}
