//! Enforcement backends and time.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.

pub mod backend;
pub mod clock;
pub mod noop;
pub mod syscall;

pub use backend::{create_backend, EnforcementBackend};
pub use clock::{Clock, MonotonicClock, Timestamp};
