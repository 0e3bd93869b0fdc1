/// Core types and structures for the perfbox engine
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Identifier issued by the enforcement backend for one sandbox
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(pub i64);

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "box-{}", self.0)
    }
}

/// Identity of a contended resource (usually the address of the lock or counter)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(pub u64);

impl ResourceKey {
    /// Key derived from the address of a shared object
    pub fn of<T: ?Sized>(resource: &T) -> Self {
        ResourceKey(resource as *const T as *const u8 as usize as u64)
    }
}

impl From<u64> for ResourceKey {
    fn from(value: u64) -> Self {
        ResourceKey(value)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Parking token used to hand a sandbox from one thread to another
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferToken(pub u64);

impl TransferToken {
    /// Token derived from the address of the task being handed off
    pub fn of<T: ?Sized>(task: &T) -> Self {
        TransferToken(task as *const T as *const u8 as usize as u64)
    }
}

impl From<u64> for TransferToken {
    fn from(value: u64) -> Self {
        TransferToken(value)
    }
}

impl fmt::Display for TransferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token-{:#x}", self.0)
    }
}

/// Kernel thread id of an OS thread
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadTag(pub i32);

impl ThreadTag {
    /// Thread id of the calling thread
    pub fn current() -> Self {
        ThreadTag(nix::unistd::gettid().as_raw())
    }
}

impl fmt::Display for ThreadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid-{}", self.0)
    }
}

/// How the tolerated deferral scales with contention
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationType {
    /// Fixed tolerance, independent of the number of competitors
    Absolute,
    /// Tolerance grows with the number of competitors
    #[default]
    Relative,
    /// Like relative, and the tail threshold also grows with contention
    Scalable,
}

/// Priority tier requested for a sandbox
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Low,
    Mid,
    High,
}

/// Isolation rule a sandbox is created with
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationRule {
    pub isolation_type: IsolationType,
    /// Tolerated deferral, in percent of net execution time
    pub isolation_level: u32,
    pub priority: Priority,
    /// Only compensate retrospectively (escalation at freeze), never on retry
    pub retro: bool,
}

impl Default for IsolationRule {
    fn default() -> Self {
        Self {
            isolation_type: IsolationType::Relative,
            isolation_level: 100,
            priority: Priority::Low,
            retro: false,
        }
    }
}

impl IsolationRule {
    /// Maximum allowed ratio of deferred to net executing time
    pub fn delay_ratio(&self) -> f64 {
        f64::from(self.isolation_level) / 100.0
    }

    /// Competitor multiplier applied by the detector for a set of `size`
    pub fn contention_factor(&self, size: usize) -> f64 {
        match self.isolation_type {
            IsolationType::Absolute => 1.0,
            IsolationType::Relative | IsolationType::Scalable => size.max(1) as f64,
        }
    }
}

/// Priority tier the backend currently applies to a sandbox
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionLevel {
    Low = 0,
    Mid = 1,
    Highest = 2,
}

impl From<Priority> for ActionLevel {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Low => ActionLevel::Low,
            Priority::Mid => ActionLevel::Mid,
            Priority::High => ActionLevel::Highest,
        }
    }
}

/// Lifecycle and compensation state of a sandbox
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    Start,
    Active,
    Freeze,
    /// Displaced from a queue slot by an immediate penalty
    Preempted,
    /// Noisy neighbor whose penalty waits for its nested resources to be released
    PendingPenalty,
    /// Noisy neighbor penalized while holding a mutex-like resource
    Penalized,
    /// Victim waiting for a deferred penalty handshake to complete
    Interfered,
}

impl SandboxState {
    /// States in which the sandbox takes part in an unfinished compensation
    pub fn in_handshake(self) -> bool {
        matches!(self, SandboxState::Interfered | SandboxState::PendingPenalty)
    }
}

/// Position of an activity relative to the resource it waits for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    Waiting,
    Entered,
    Exited,
    /// Slot handed over to a victim
    Preempted,
    /// Victim allowed to take the resource without further retries
    Promoted,
}

/// Shape of a contended resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Bounded-concurrency slot: prepare / retry / enter / exit
    Queue,
    /// Mutex-like: require / acquire / release
    Mutex,
}

/// Event emitted by instrumented code around a contended section
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxEvent {
    Prepare,
    Retry,
    Enter,
    Exit,
    Require,
    Acquire,
    Release,
    Hold,
    Unhold,
    SleepBegin,
    SleepEnd,
}

impl BoxEvent {
    pub fn name(self) -> &'static str {
        match self {
            BoxEvent::Prepare => "prepare",
            BoxEvent::Retry => "retry",
            BoxEvent::Enter => "enter",
            BoxEvent::Exit => "exit",
            BoxEvent::Require => "require",
            BoxEvent::Acquire => "acquire",
            BoxEvent::Release => "release",
            BoxEvent::Hold => "hold",
            BoxEvent::Unhold => "unhold",
            BoxEvent::SleepBegin => "sleep_begin",
            BoxEvent::SleepEnd => "sleep_end",
        }
    }
}

impl fmt::Display for BoxEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What an event call did beyond plain bookkeeping
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOutcome {
    /// Bookkeeping updated, nothing else happened
    Recorded,
    /// Sandbox has no open activity; the event was dropped
    Ignored,
    /// A competitor was displaced; the caller may take the resource now
    Promoted,
    /// The noisy neighbor was penalized immediately
    PenaltyApplied { neighbor: SandboxId },
    /// The noisy neighbor holds nested resources; its penalty waits for their release
    PenaltyDeferred { neighbor: SandboxId },
    /// This sandbox released its last nested resource and served its deferred penalty
    HandshakeCompleted { victim: SandboxId },
    /// A victim left the resource and released the neighbor it had displaced
    NeighborReleased { neighbor: SandboxId },
}

/// Error types for perfbox
#[derive(Error, Debug)]
pub enum PerfboxError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Sandbox {0} not found")]
    SandboxNotFound(SandboxId),

    #[error("No sandbox bound to thread {0}")]
    NoCurrentSandbox(ThreadTag),

    #[error("No competitor set for resource {0}")]
    MissingCompetitorSet(ResourceKey),

    #[error("No sandbox parked under {0}")]
    TransferSlotEmpty(TransferToken),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Fatal engine error: {0}")]
    Fatal(String),
}

impl PerfboxError {
    /// Lookup failures: sandbox, current thread, competitor set or transfer slot
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PerfboxError::SandboxNotFound(_)
                | PerfboxError::NoCurrentSandbox(_)
                | PerfboxError::MissingCompetitorSet(_)
                | PerfboxError::TransferSlotEmpty(_)
        )
    }

    /// Short label used for metrics and audit records
    pub fn kind(&self) -> &'static str {
        match self {
            PerfboxError::Backend(_) => "backend",
            PerfboxError::SandboxNotFound(_)
            | PerfboxError::NoCurrentSandbox(_)
            | PerfboxError::MissingCompetitorSet(_)
            | PerfboxError::TransferSlotEmpty(_) => "not_found",
            PerfboxError::ProtocolViolation(_) => "protocol_violation",
            PerfboxError::Config(_) => "config",
            PerfboxError::Io(_) => "io",
            PerfboxError::NotInitialized => "not_initialized",
            PerfboxError::Fatal(_) => "fatal",
        }
    }
}

impl From<nix::errno::Errno> for PerfboxError {
    fn from(err: nix::errno::Errno) -> Self {
        PerfboxError::Backend(err.to_string())
    }
}

/// Convert engine errors to process exit codes
impl From<PerfboxError> for i32 {
    fn from(err: PerfboxError) -> i32 {
        match err {
            PerfboxError::Backend(_) => 69,           // Service unavailable
            PerfboxError::SandboxNotFound(_)
            | PerfboxError::NoCurrentSandbox(_)
            | PerfboxError::MissingCompetitorSet(_)
            | PerfboxError::TransferSlotEmpty(_) => 2, // Lookup failure
            PerfboxError::ProtocolViolation(_) => 65, // Data error
            PerfboxError::Config(_) => 78,            // Config error
            PerfboxError::Io(_) => 74,                // IO error
            PerfboxError::NotInitialized => 1,
            PerfboxError::Fatal(_) => 70,             // Internal software error
        }
    }
}

/// Result type alias for perfbox operations
pub type Result<T> = std::result::Result<T, PerfboxError>;

/// Bounded penalty durations used by the compensation controller
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PenaltyBudget {
    /// Immediate or deferred penalty applied to a noisy neighbor
    pub neighbor: Duration,
    /// Cap for the penalty a sandbox earns when leaving a queue
    pub queue_release: Duration,
    /// Cap for the penalty a sandbox earns when releasing a mutex
    pub mutex_release: Duration,
}

impl PenaltyBudget {
    pub fn release_cap(&self, kind: ResourceKind) -> Duration {
        match kind {
            ResourceKind::Queue => self.queue_release,
            ResourceKind::Mutex => self.mutex_release,
        }
    }
}
