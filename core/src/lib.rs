//! Core functionality for the Muster project
//!
//! This crate contains the local process-group supervisor used by the
//! launcher: worker spawning, exit monitoring, graceful termination with
//! bounded escalation, and signal routing from the parent process to its
//! worker groups.

#[cfg(unix)]
pub mod config;
pub mod error;
#[cfg(unix)]
pub mod group;
pub mod policy;
#[cfg(unix)]
pub mod process;
#[cfg(unix)]
pub mod router;

#[cfg(test)]
mod error_tests;

// Re-export schema types for convenience
pub use schema::*;

pub use error::{CoreError, Result};
pub use policy::{DEFAULT_GRACE_PERIOD, PolicyCell, PolicyUpdate, SignalPolicy};

#[cfg(unix)]
pub use group::{
    GroupConfig, MockInstruction, MockWorkerLauncher, PoolEntry, ProcessGroup, RankCommand,
    SubprocessGroup, WorkerContext, WorkerLauncher, WorkerPoolGroup, WorkerRegistry,
    maybe_run_worker,
};
#[cfg(unix)]
pub use router::{RouterConfig, RouterEvent, SignalRouter, parse_signal_names};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
