//! Test doubles and caller-side helpers
//!
//! `RecordingBackend` and `ManualClock` let the engine run deterministically
//! in-process; `Backoff` is the sleep-and-retry loop callers wrap around
//! `retry` and `bind`.

pub mod backoff;
pub mod manual_clock;
pub mod recording;

pub use backoff::Backoff;
pub use manual_clock::ManualClock;
pub use recording::{BackendCall, CallKind, RecordingBackend};
