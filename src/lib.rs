//! perfbox: performance isolation between threads competing for shared resources
//!
//! Instrumented code reports, per sandbox, when it waits for, occupies and leaves
//! a contended resource (queue slot or mutex). The engine measures how long each
//! sandbox is deferred by its competitors, identifies a noisy neighbor when the
//! deferral exceeds the sandbox's isolation rule, and compensates the victim
//! through an enforcement backend: penalizing or preempting the neighbor, or
//! escalating the victim's priority for a number of activities.
//!
//! # Architecture
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: identifiers, closed enums and the error taxonomy
//! - [`config::settings`]: tunable engine constants loaded from JSON
//! - [`config::validator`]: rule and configuration validation
//!
//! ## Kernel interface ([`kernel`])
//! - [`kernel::backend`]: the `EnforcementBackend` trait and backend selection
//! - [`kernel::syscall`]: psandbox system calls
//! - [`kernel::noop`]: bookkeeping only, no enforcement
//! - [`kernel::clock`]: monotonic timestamps
//!
//! ## Engine ([`core`])
//! - [`core::engine`]: the single engine lock and event dispatch
//! - [`core::registry`], [`core::competitors`], [`core::transfer`]: directories
//! - [`core::detector`], [`core::compensation`]: detection and compensation decisions
//!
//! ## Observability ([`observability`])
//! - [`observability::metrics`]: Prometheus metrics export
//! - [`observability::audit`]: structured compensation events
//!
//! [`api`] exposes a process-wide engine through free functions; [`testing`]
//! carries the in-memory backend and manual clock used by tests and the CLI.

pub mod config;
pub mod kernel;
pub mod core;
pub mod observability;
pub mod api;
pub mod testing;
pub mod cli;

pub use crate::config::settings::EngineConfig;
pub use crate::config::types::{
    BoxEvent, EventOutcome, IsolationRule, PerfboxError, ResourceKey, Result, SandboxId,
    TransferToken,
};
pub use crate::core::Engine;
