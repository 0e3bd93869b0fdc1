/// Engine configuration loading from JSON
use crate::config::types::{PenaltyBudget, PerfboxError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which enforcement backend the engine drives
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Syscall backend when the kernel exposes it, noop otherwise
    #[default]
    Auto,
    Syscall,
    Noop,
}

/// System call numbers of the psandbox kernel patch.
/// Operations without a number are tracked in userspace only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyscallTable {
    pub create: i64,
    pub release: i64,
    pub get: i64,
    pub wakeup: i64,
    pub penalize: i64,
    pub activate: Option<i64>,
    pub freeze: Option<i64>,
    pub compensate: Option<i64>,
    pub bind: Option<i64>,
    pub unbind: Option<i64>,
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self {
            create: 436,
            release: 437,
            get: 438,
            wakeup: 439,
            penalize: 440,
            activate: None,
            freeze: None,
            compensate: None,
            bind: None,
            unbind: None,
        }
    }
}

/// Tunable constants of the detection and compensation engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Finished activities observed before escalation is considered
    pub probing_number: u64,
    /// Activities a sandbox stays escalated once compensated
    pub compensation_ticket_number: u32,
    /// Tolerated fraction of bad activities
    pub tail_threshold: f64,
    /// Penalty applied to a noisy neighbor, in microseconds
    pub penalty_us: u64,
    /// Cap on the penalty for leaving a queue, in microseconds
    pub queue_release_penalty_us: u64,
    /// Cap on the penalty for releasing a mutex, in microseconds
    pub mutex_release_penalty_us: u64,
    pub backend: BackendKind,
    /// Fail instead of degrading when the requested backend is unavailable
    pub strict: bool,
    pub syscalls: SyscallTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probing_number: 100,
            compensation_ticket_number: 10,
            tail_threshold: 0.05,
            penalty_us: 100_000,
            queue_release_penalty_us: 1_000,
            mutex_release_penalty_us: 100_000,
            backend: BackendKind::Auto,
            strict: false,
            syscalls: SyscallTable::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PerfboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON document; missing fields take defaults
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| PerfboxError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Load `PERFBOX_CONFIG` if set, defaults otherwise
    pub fn load_default() -> Result<Self> {
        match std::env::var_os("PERFBOX_CONFIG") {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn penalty_budget(&self) -> PenaltyBudget {
        PenaltyBudget {
            neighbor: Duration::from_micros(self.penalty_us),
            queue_release: Duration::from_micros(self.queue_release_penalty_us),
            mutex_release: Duration::from_micros(self.mutex_release_penalty_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.probing_number, 100);
        assert_eq!(config.compensation_ticket_number, 10);
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.syscalls.penalize, 440);
        assert!(config.syscalls.bind.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json(r#"{"probing_number": 4, "backend": "noop"}"#).unwrap();
        assert_eq!(config.probing_number, 4);
        assert_eq!(config.backend, BackendKind::Noop);
        assert_eq!(config.compensation_ticket_number, 10);
        assert_eq!(config.penalty_us, 100_000);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = EngineConfig::from_json("{probing_number:").unwrap_err();
        assert!(matches!(err, PerfboxError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("perfbox-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"tail_threshold": 0.2, "syscalls": {"bind": 441}}"#).unwrap();

        let config = EngineConfig::load_from_file(&path).unwrap();
        assert!((config.tail_threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.syscalls.bind, Some(441));
        assert_eq!(config.syscalls.create, 436);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::load_from_file("/nonexistent/perfbox.json").unwrap_err();
        assert!(matches!(err, PerfboxError::Config(_)));
    }

    #[test]
    fn test_penalty_budget() {
        let budget = EngineConfig::default().penalty_budget();
        assert_eq!(budget.neighbor, Duration::from_millis(100));
        assert_eq!(budget.queue_release, Duration::from_millis(1));
        assert_eq!(budget.mutex_release, Duration::from_millis(100));
    }
}
