//! Detection and compensation engine.
//!
//! `engine` owns the single lock; the other modules are the bookkeeping it
//! drives and never call the enforcement backend themselves.

pub mod competitors;
pub mod compensation;
pub mod current;
pub mod detector;
pub mod engine;
pub mod registry;
pub mod sandbox;
pub mod transfer;

pub use engine::Engine;
pub use sandbox::{Activity, Sandbox, SandboxSnapshot};
