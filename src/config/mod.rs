//! Configuration and policy
//!
//! Isolation rules, engine settings, and their validation.

pub mod settings;
pub mod types;
pub mod validator;
