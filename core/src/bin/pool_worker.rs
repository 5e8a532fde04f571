//! Helper binary exercising the worker-pool trampoline in integration tests
//!
//! Each registered entry models one worker personality: clean success, a
//! reported failure, a long sleep, a worker that survives the termination
//! signal, and one that echoes its injected environment back as its result.

use muster_core::{Result, WorkerContext, WorkerRegistry, maybe_run_worker};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

fn report(context: WorkerContext) -> std::result::Result<serde_json::Value, String> {
    Ok(json!({"rank": context.rank, "args": context.args}))
}

fn fail(context: WorkerContext) -> std::result::Result<serde_json::Value, String> {
    Err(format!("rank {} gave up", context.rank))
}

fn napper(context: WorkerContext) -> std::result::Result<serde_json::Value, String> {
    let secs = context
        .args
        .first()
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(30.0);
    std::thread::sleep(Duration::from_secs_f64(secs));
    Ok(json!("woke"))
}

fn stubborn(_context: WorkerContext) -> std::result::Result<serde_json::Value, String> {
    // Swallow SIGTERM so only SIGKILL ends this worker
    let noted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, noted)
        .map_err(|e| format!("could not register SIGTERM handler: {e}"))?;
    std::thread::sleep(Duration::from_secs(120));
    Ok(json!("outlasted"))
}

fn env_echo(context: WorkerContext) -> std::result::Result<serde_json::Value, String> {
    let mut seen = serde_json::Map::new();
    for key in &context.args {
        if let Ok(value) = std::env::var(key) {
            seen.insert(key.clone(), json!(value));
        }
    }
    Ok(json!({"rank": context.rank, "env": seen}))
}

fn main() -> Result<()> {
    let mut registry = WorkerRegistry::new();
    registry
        .register("report", report)
        .register("fail", fail)
        .register("napper", napper)
        .register("stubborn", stubborn)
        .register("env-echo", env_echo);

    if maybe_run_worker(&registry)? {
        return Ok(());
    }

    eprintln!(
        "pool_worker only runs as a re-executed pool worker; entries: {:?}",
        registry.names()
    );
    std::process::exit(2);
}
