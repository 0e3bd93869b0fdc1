//! Process-wide engine and the free-function surface instrumented code calls.
//!
//! Every function fails with `NotInitialized` until `init_engine` succeeds.

use crate::config::settings::EngineConfig;
use crate::config::types::{
    BoxEvent, EventOutcome, IsolationRule, PerfboxError, ResourceKey, Result, SandboxId,
    TransferToken,
};
use crate::core::engine::Engine;
use crate::core::sandbox::SandboxSnapshot;
use log::info;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Global engine instance
static GLOBAL_ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

fn engine() -> Result<&'static Arc<Engine>> {
    GLOBAL_ENGINE.get().ok_or(PerfboxError::NotInitialized)
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// Initialize the global engine
pub fn init_engine(config: EngineConfig) -> Result<()> {
    let engine = Engine::new(config)?;
    install_engine(Arc::new(engine))
}

/// Install an already built engine, e.g. one over a test backend
pub fn install_engine(engine: Arc<Engine>) -> Result<()> {
    let backend = engine.backend_name().to_string();
    GLOBAL_ENGINE
        .set(engine)
        .map_err(|_| PerfboxError::Config("engine already initialized".to_string()))?;
    info!("Global perfbox engine initialized (backend: {})", backend);
    Ok(())
}

pub fn global_engine() -> Result<Arc<Engine>> {
    engine().map(Arc::clone)
}

pub fn create_sandbox(rule: IsolationRule) -> Result<SandboxId> {
    engine()?.create_sandbox(rule)
}

pub fn release_sandbox(id: SandboxId) -> Result<()> {
    engine()?.release(id)
}

pub fn active_sandbox(id: SandboxId) -> Result<()> {
    engine()?.active(id)
}

pub fn freeze_sandbox(id: SandboxId) -> Result<()> {
    engine()?.freeze(id)
}

pub fn get_current_sandbox() -> Result<SandboxId> {
    engine()?.get_current()
}

pub fn get_sandbox(id: SandboxId) -> Result<SandboxSnapshot> {
    engine()?.snapshot(id)
}

/// Report an event on `key` for the sandbox of the calling thread
pub fn update_sandbox(key: ResourceKey, event: BoxEvent) -> Result<EventOutcome> {
    engine()?.update_current(key, event)
}

pub fn update_sandbox_of(id: SandboxId, key: ResourceKey, event: BoxEvent) -> Result<EventOutcome> {
    engine()?.update(id, key, event)
}

pub fn unbind_sandbox(token: TransferToken, id: SandboxId) -> Result<()> {
    engine()?.unbind(token, id)
}

pub fn bind_sandbox(token: TransferToken) -> Result<SandboxId> {
    engine()?.bind(token)
}

pub fn bind_sandbox_wait(token: TransferToken, timeout: Duration) -> Result<SandboxId> {
    engine()?.bind_wait(token, timeout)
}

/// Export engine metrics in Prometheus format
pub fn get_engine_metrics() -> Result<String> {
    Ok(engine()?.metrics().export_prometheus())
}
