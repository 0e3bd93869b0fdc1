use crate::config::settings::EngineConfig;
use crate::config::types::{
    BoxEvent, EventOutcome, IsolationRule, PerfboxError, ResourceKey, SandboxId, TransferToken,
};
use crate::config::validator::{validate_engine_config, validate_rule, ValidationResult};
use crate::core::engine::Engine;
use crate::kernel::backend::{backend_type_name, detect_backend, BackendType};
use crate::observability::audit::init_audit_logger;
use crate::observability::metrics::MetricsRegistry;
use crate::testing::{Backoff, ManualClock, RecordingBackend};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an engine configuration and, optionally, an isolation rule
    CheckConfig {
        /// Engine configuration (JSON); defaults are checked when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Isolation rule (JSON)
        #[arg(long)]
        rule: Option<PathBuf>,
    },
    /// Run a contention scenario in-process against a recording backend
    Simulate {
        #[arg(value_enum)]
        scenario: Scenario,
        /// Print sandbox snapshots as JSON
        #[arg(long)]
        json: bool,
        /// Append compensation audit records to this file
        #[arg(long)]
        audit_log: Option<PathBuf>,
    },
    /// Print the metrics format of an empty registry
    Metrics,
    /// Report which enforcement backend this kernel supports
    Backend {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    /// Waiter blames the mutex holder; penalty served on release
    Mutex,
    /// Two-slot queue, third sandbox displaces an occupant
    Queue,
    /// Queue occupant holding a nested lock: deferred penalty handshake
    Nest,
    /// Sandbox handed from one thread to another
    Transfer,
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::CheckConfig { config, rule } => {
            let exit_code = check_config(config, rule)?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Commands::Simulate {
            scenario,
            json,
            audit_log,
        } => {
            if let Some(path) = audit_log {
                init_audit_logger(&path)
                    .with_context(|| format!("opening audit log {}", path.display()))?;
            }
            simulate(scenario, json)
        }
        Commands::Metrics => {
            print!("{}", MetricsRegistry::new().export_prometheus());
            Ok(())
        }
        Commands::Backend { config } => {
            let config = load_config(config)?;
            let backend = detect_backend(&config.syscalls).unwrap_or(BackendType::Noop);
            println!("{}", backend_type_name(backend));
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_file(&path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn print_report(what: &str, report: &ValidationResult) {
    for warning in &report.warnings {
        eprintln!("{}: warning: {}", what, warning);
    }
    for error in &report.errors {
        eprintln!("{}: error: {}", what, error);
    }
    if report.is_valid() {
        println!("{}: ok", what);
    }
}

fn check_config(config: Option<PathBuf>, rule: Option<PathBuf>) -> Result<i32> {
    let config = match load_config(config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return Ok(i32::from(PerfboxError::Config(e.to_string())));
        }
    };

    let report = match validate_engine_config(&config) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Ok(i32::from(e));
        }
    };
    print_report("engine config", &report);
    let mut valid = report.is_valid();

    if let Some(path) = rule {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let rule: IsolationRule = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        match validate_rule(&rule, config.strict) {
            Ok(report) => {
                print_report("isolation rule", &report);
                valid &= report.is_valid();
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                return Ok(i32::from(e));
            }
        }
    }

    Ok(if valid { 0 } else { 78 })
}

struct Simulation {
    engine: Arc<Engine>,
    backend: Arc<RecordingBackend>,
    clock: Arc<ManualClock>,
}

impl Simulation {
    fn new(config: EngineConfig) -> Self {
        let backend = Arc::new(RecordingBackend::new());
        let clock = Arc::new(ManualClock::new());
        let engine = Arc::new(Engine::with_backend(config, backend.clone(), clock.clone()));
        Self {
            engine,
            backend,
            clock,
        }
    }

    fn started(&self, name: &str) -> Result<SandboxId> {
        let id = self.engine.create_sandbox(IsolationRule::default())?;
        self.engine.active(id)?;
        println!("{} = {}", name, id);
        Ok(id)
    }

    fn event(&self, id: SandboxId, key: ResourceKey, event: BoxEvent) -> Result<EventOutcome> {
        let outcome = self.engine.update(id, key, event)?;
        println!("  {:>8} {:<11} {} -> {:?}", id, event.to_string(), key, outcome);
        Ok(outcome)
    }

    /// Caller retry loop: advance simulated time by the backoff delay and retry
    fn retry_until_promoted(&self, id: SandboxId, key: ResourceKey) -> Result<EventOutcome> {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_millis(400));
        while backoff.attempts() < 64 {
            let outcome = self.engine.update(id, key, BoxEvent::Retry)?;
            if outcome != EventOutcome::Recorded {
                println!(
                    "  {:>8} {:<11} {} -> {:?} after {} retries",
                    id,
                    "retry",
                    key,
                    outcome,
                    backoff.attempts()
                );
                return Ok(outcome);
            }
            self.clock.advance(backoff.next_delay());
        }
        Err(anyhow!("{} was never compensated on {}", id, key))
    }

    fn report(&self, ids: &[SandboxId], json: bool) -> Result<()> {
        println!("\nbackend calls:");
        for call in self.backend.calls() {
            println!("  {}", call);
        }
        if json {
            let snapshots = ids
                .iter()
                .map(|id| self.engine.snapshot(*id))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            println!("\n{}", serde_json::to_string_pretty(&snapshots)?);
        }
        println!();
        print!("{}", self.engine.metrics().export_prometheus());
        Ok(())
    }
}

fn simulate(scenario: Scenario, json: bool) -> Result<()> {
    let sim = Simulation::new(EngineConfig::default());
    let key = ResourceKey(0x1000);
    let ids = match scenario {
        Scenario::Mutex => {
            let a = sim.started("holder")?;
            let b = sim.started("waiter")?;
            sim.event(a, key, BoxEvent::Require)?;
            sim.event(a, key, BoxEvent::Acquire)?;
            sim.event(b, key, BoxEvent::Require)?;
            sim.clock.advance(Duration::from_secs(1));
            let outcome = sim.engine.check_interference(b, key)?;
            println!("  {:>8} check       {} -> {:?}", b, key, outcome);
            sim.clock.advance(Duration::from_secs(1));
            sim.event(a, key, BoxEvent::Release)?;
            sim.event(b, key, BoxEvent::Acquire)?;
            sim.event(b, key, BoxEvent::Release)?;
            sim.engine.freeze(a)?;
            sim.engine.freeze(b)?;
            vec![a, b]
        }
        Scenario::Queue => {
            let a = sim.started("first")?;
            let b = sim.started("second")?;
            let c = sim.started("third")?;
            sim.event(a, key, BoxEvent::Prepare)?;
            sim.event(a, key, BoxEvent::Enter)?;
            sim.event(b, key, BoxEvent::Prepare)?;
            sim.event(b, key, BoxEvent::Enter)?;
            sim.clock.advance(Duration::from_millis(300));
            sim.event(c, key, BoxEvent::Prepare)?;
            sim.retry_until_promoted(c, key)?;
            sim.event(c, key, BoxEvent::Enter)?;
            sim.clock.advance(Duration::from_millis(100));
            sim.event(c, key, BoxEvent::Exit)?;
            sim.event(a, key, BoxEvent::Exit)?;
            sim.event(b, key, BoxEvent::Exit)?;
            for id in [a, b, c] {
                sim.engine.freeze(id)?;
            }
            vec![a, b, c]
        }
        Scenario::Nest => {
            let nested = ResourceKey(0x2000);
            let n = sim.started("neighbor")?;
            let v = sim.started("victim")?;
            sim.event(n, key, BoxEvent::Prepare)?;
            sim.event(n, key, BoxEvent::Enter)?;
            sim.event(n, nested, BoxEvent::Hold)?;
            sim.event(v, key, BoxEvent::Prepare)?;
            sim.retry_until_promoted(v, key)?;
            sim.clock.advance(Duration::from_millis(200));
            sim.event(n, nested, BoxEvent::Unhold)?;
            sim.event(n, key, BoxEvent::Exit)?;
            sim.event(v, key, BoxEvent::Enter)?;
            sim.event(v, key, BoxEvent::Exit)?;
            sim.engine.freeze(n)?;
            sim.engine.freeze(v)?;
            vec![n, v]
        }
        Scenario::Transfer => simulate_transfer(&sim)?,
    };
    sim.report(&ids, json)
}

fn simulate_transfer(sim: &Simulation) -> Result<Vec<SandboxId>> {
    let token = TransferToken(0xBEEF);
    let (parked_tx, parked_rx) = crossbeam_channel::bounded::<SandboxId>(1);
    let (adopted_tx, adopted_rx) = crossbeam_channel::bounded::<SandboxId>(1);

    let adopter = {
        let engine = Arc::clone(&sim.engine);
        std::thread::spawn(move || -> crate::config::types::Result<()> {
            let id = engine.bind_wait(token, Duration::from_secs(5))?;
            println!("adopter bound {} ({} now current)", id, engine.get_current()?);
            let _ = adopted_tx.send(id);
            engine.release(id)
        })
    };

    let producer = {
        let engine = Arc::clone(&sim.engine);
        std::thread::spawn(move || -> crate::config::types::Result<()> {
            let id = engine.create_sandbox(IsolationRule::default())?;
            println!("producer created {}", id);
            engine.unbind(token, id)?;
            println!("producer parked {} under {}", id, token);
            let _ = parked_tx.send(id);
            Ok(())
        })
    };

    producer
        .join()
        .map_err(|_| anyhow!("producer thread panicked"))??;
    adopter
        .join()
        .map_err(|_| anyhow!("adopter thread panicked"))??;

    let parked = parked_rx.recv_timeout(Duration::from_secs(1))?;
    let adopted = adopted_rx.recv_timeout(Duration::from_secs(1))?;
    if parked != adopted {
        return Err(anyhow!("parked {} but adopted {}", parked, adopted));
    }
    Ok(Vec::new())
}
