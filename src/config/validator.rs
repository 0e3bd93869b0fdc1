// Config Validation
// Engine settings and isolation rules are validated before the engine starts.
// Strict mode turns validation errors into a startup failure.

use crate::config::settings::{BackendKind, EngineConfig};
use crate::config::types::{IsolationRule, IsolationType, PerfboxError, Result};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn into_result(self, strict: bool, what: &str) -> Result<Self> {
        if strict && !self.is_valid() {
            return Err(PerfboxError::Config(format!(
                "{} validation failed in strict mode:\n{}",
                what,
                self.errors.join("\n")
            )));
        }
        Ok(self)
    }
}

/// Validate engine settings. In strict mode errors are fatal.
pub fn validate_engine_config(config: &EngineConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if config.probing_number == 0 {
        result.add_error("probing_number cannot be zero".to_string());
    }

    if config.compensation_ticket_number == 0 {
        result.add_error("compensation_ticket_number cannot be zero".to_string());
    }

    if !(0.0..=1.0).contains(&config.tail_threshold) || config.tail_threshold.is_nan() {
        result.add_error(format!(
            "tail_threshold must be within [0, 1], got {}",
            config.tail_threshold
        ));
    }

    if config.penalty_us == 0 {
        result.add_error("penalty_us cannot be zero".to_string());
    } else if config.penalty_us > 10_000_000 {
        result.add_warning(format!(
            "penalty_us {} exceeds 10s; penalized threads may stall visibly",
            config.penalty_us
        ));
    }

    if config.probing_number < 10 {
        result.add_warning(format!(
            "probing_number {} gives a noisy tail estimate",
            config.probing_number
        ));
    }

    if config.backend == BackendKind::Noop && config.strict {
        result.add_warning("noop backend in strict mode enforces nothing".to_string());
    }

    let syscalls = &config.syscalls;
    let mut numbers = vec![
        syscalls.create,
        syscalls.release,
        syscalls.get,
        syscalls.wakeup,
        syscalls.penalize,
    ];
    numbers.extend(
        [
            syscalls.activate,
            syscalls.freeze,
            syscalls.compensate,
            syscalls.bind,
            syscalls.unbind,
        ]
        .into_iter()
        .flatten(),
    );
    if numbers.iter().any(|n| *n <= 0) {
        result.add_error("syscall numbers must be positive".to_string());
    }
    let mut sorted = numbers.clone();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != numbers.len() {
        result.add_error("syscall numbers must be distinct".to_string());
    }

    result.into_result(config.strict, "Engine config")
}

/// Validate an isolation rule against the engine settings
pub fn validate_rule(rule: &IsolationRule, strict: bool) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if rule.isolation_level == 0 {
        result.add_error(
            "isolation_level cannot be zero: every wait would count as interference".to_string(),
        );
    }

    if rule.isolation_level > 10_000 {
        result.add_warning(format!(
            "isolation_level {}% effectively disables detection",
            rule.isolation_level
        ));
    }

    if rule.retro && rule.isolation_type == IsolationType::Absolute {
        result.add_warning(
            "retro mode with absolute isolation only escalates, it never penalizes".to_string(),
        );
    }

    result.into_result(strict, "Isolation rule")
}
