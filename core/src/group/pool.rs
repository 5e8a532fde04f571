//! In-process worker pools via re-execution
//!
//! The pool flavor runs Rust worker functions in child processes by
//! re-executing the current binary. The parent passes the entry name, rank
//! and arguments through protocol environment variables; the child's `main`
//! calls [`maybe_run_worker`] early, which detects the variables, runs the
//! registered function and exits instead of starting another launcher.
//!
//! A worker function's `Ok` value is serialized to a per-rank result file
//! and surfaces in the group's [`RunResult`] once the worker exits 0.

use crate::group::adapters::{ManagedWorker, UnixWorker, WorkerLauncher};
use crate::group::{GroupConfig, GroupCore, ProcessGroup};
use crate::process::{spawn_worker, OutputFiles};
use crate::{CoreError, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use schema::{GroupEvent, GroupState, Rank, RunResult};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Environment variable naming the worker entry to run
pub const WORKER_ENTRY_ENV: &str = "MUSTER_WORKER_ENTRY";
/// Environment variable carrying the worker's rank
pub const WORKER_RANK_ENV: &str = "MUSTER_WORKER_RANK";
/// Environment variable carrying the worker's arguments as a JSON array
pub const WORKER_ARGS_ENV: &str = "MUSTER_WORKER_ARGS";
/// Environment variable naming the file the worker writes its result to
pub const RESULT_FILE_ENV: &str = "MUSTER_RESULT_FILE";

/// Context handed to a worker function
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// The worker's local rank
    pub rank: Rank,
    /// Arguments configured for this worker
    pub args: Vec<String>,
}

/// A function runnable as a pool worker.
///
/// The `Ok` value becomes the rank's return value; an `Err` makes the worker
/// process exit non-zero with the message on stderr.
pub type WorkerFn = fn(WorkerContext) -> std::result::Result<serde_json::Value, String>;

/// Named worker functions available to re-executed children.
///
/// The registry must be identical in parent and child, which is guaranteed
/// when both build it in the same `main`.
#[derive(Default)]
pub struct WorkerRegistry {
    entries: BTreeMap<String, WorkerFn>,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker function under a name
    pub fn register(&mut self, name: impl Into<String>, worker: WorkerFn) -> &mut Self {
        self.entries.insert(name.into(), worker);
        self
    }

    /// Look up a worker function by name
    pub fn get(&self, name: &str) -> Option<WorkerFn> {
        self.entries.get(name).copied()
    }

    /// Names of all registered entries
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

struct WorkerInvocation {
    entry: String,
    rank: Rank,
    args: Vec<String>,
    result_file: Option<PathBuf>,
}

fn invocation_from_env() -> Result<Option<WorkerInvocation>> {
    let Ok(entry) = std::env::var(WORKER_ENTRY_ENV) else {
        return Ok(None);
    };
    let rank = std::env::var(WORKER_RANK_ENV)
        .map_err(|_| CoreError::ConfigurationError(format!("{WORKER_RANK_ENV} is not set")))?
        .parse::<Rank>()
        .map_err(|e| {
            CoreError::ConfigurationError(format!("{WORKER_RANK_ENV} is not a valid rank: {e}"))
        })?;
    let args = match std::env::var(WORKER_ARGS_ENV) {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
            CoreError::ConfigurationError(format!(
                "{WORKER_ARGS_ENV} is not a JSON string array: {e}"
            ))
        })?,
        Err(_) => Vec::new(),
    };
    let result_file = std::env::var(RESULT_FILE_ENV).ok().map(PathBuf::from);
    Ok(Some(WorkerInvocation {
        entry,
        rank,
        args,
        result_file,
    }))
}

fn run_invocation(registry: &WorkerRegistry, invocation: WorkerInvocation) -> Result<()> {
    let Some(worker_fn) = registry.get(&invocation.entry) else {
        return Err(CoreError::ConfigurationError(format!(
            "Unknown worker entry '{}'",
            invocation.entry
        )));
    };

    debug!(
        "Running worker entry '{}' for rank {}",
        invocation.entry, invocation.rank
    );
    let context = WorkerContext {
        rank: invocation.rank,
        args: invocation.args,
    };
    match worker_fn(context) {
        Ok(value) => {
            if let Some(path) = &invocation.result_file {
                let payload = serde_json::to_string(&value)?;
                std::fs::write(path, payload)?;
            }
            Ok(())
        }
        Err(message) => Err(CoreError::Other(format!(
            "Worker entry '{}' failed: {}",
            invocation.entry, message
        ))),
    }
}

/// Run as a pool worker if the protocol environment variables are present.
///
/// Call this at the top of `main`, before any launcher setup. Returns
/// `Ok(false)` when the process was started normally, `Ok(true)` after a
/// worker entry ran to completion. Errors from the entry propagate so the
/// process exits non-zero.
pub fn maybe_run_worker(registry: &WorkerRegistry) -> Result<bool> {
    match invocation_from_env()? {
        Some(invocation) => {
            run_invocation(registry, invocation)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// What one rank of a worker pool runs
#[derive(Debug, Clone)]
pub struct PoolEntry {
    /// Name of the registered worker entry
    pub entry: String,
    /// Arguments passed to the worker function
    pub args: Vec<String>,
    /// Caller-supplied environment overrides. These win over the variables
    /// the group injects, but not over the protocol variables.
    pub env: HashMap<String, String>,
}

impl PoolEntry {
    /// Run the named entry with no arguments
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable for the worker
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Launcher re-executing a binary with the worker protocol environment
struct TrampolineLauncher {
    program: PathBuf,
    entries: BTreeMap<Rank, PoolEntry>,
    /// Directory for per-rank result files
    scratch: PathBuf,
    group_name: String,
}

impl TrampolineLauncher {
    fn result_path(&self, rank: Rank) -> PathBuf {
        self.scratch.join(format!(
            "{}_{}_{}_result.json",
            self.group_name,
            std::process::id(),
            rank
        ))
    }
}

#[async_trait]
impl WorkerLauncher for TrampolineLauncher {
    fn ranks(&self) -> Vec<Rank> {
        self.entries.keys().copied().collect()
    }

    async fn launch(
        &self,
        rank: Rank,
        extra_env: &HashMap<String, String>,
        output: &OutputFiles,
    ) -> Result<Box<dyn ManagedWorker>> {
        let entry = self.entries.get(&rank).ok_or_else(|| {
            CoreError::StateError(format!("No pool entry registered for rank {rank}"))
        })?;

        let result_path = self.result_path(rank);
        // A stale file from an earlier run must not be read as this run's result
        let _ = std::fs::remove_file(&result_path);

        let mut env = extra_env.clone();
        env.extend(entry.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        // Protocol variables go in last; the trampoline depends on them
        env.insert(WORKER_ENTRY_ENV.to_string(), entry.entry.clone());
        env.insert(WORKER_RANK_ENV.to_string(), rank.to_string());
        env.insert(WORKER_ARGS_ENV.to_string(), serde_json::to_string(&entry.args)?);
        env.insert(
            RESULT_FILE_ENV.to_string(),
            result_path.display().to_string(),
        );

        debug!(
            "Launching rank {} as entry '{}' via {}",
            rank,
            entry.entry,
            self.program.display()
        );
        let child = spawn_worker(self.program.as_os_str(), &[], &env, output)?;
        Ok(Box::new(UnixWorker::new(child, Some(result_path))))
    }
}

/// Process group running registered worker functions in child processes
pub struct WorkerPoolGroup {
    core: GroupCore,
}

impl WorkerPoolGroup {
    /// Create a pool that re-executes the current binary.
    ///
    /// # Errors
    ///
    /// Fails if the current executable path cannot be determined.
    pub fn new(config: GroupConfig, entries: BTreeMap<Rank, PoolEntry>) -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::with_program(config, entries, program))
    }

    /// Create a pool that re-executes an explicit binary. The binary's
    /// `main` must call [`maybe_run_worker`] with a matching registry.
    pub fn with_program(
        config: GroupConfig,
        entries: BTreeMap<Rank, PoolEntry>,
        program: PathBuf,
    ) -> Self {
        let scratch = config.log_dir.clone().unwrap_or_else(std::env::temp_dir);
        let launcher = TrampolineLauncher {
            program,
            entries,
            scratch,
            group_name: config.name.clone(),
        };
        Self {
            core: GroupCore::new(config, Box::new(launcher)),
        }
    }

    /// Create a pool running the same entry for ranks `0..world_size`
    pub fn homogeneous(config: GroupConfig, entry: PoolEntry, world_size: usize) -> Result<Self> {
        let entries = (0..world_size as Rank)
            .map(|rank| (rank, entry.clone()))
            .collect();
        Self::new(config, entries)
    }
}

#[async_trait]
impl ProcessGroup for WorkerPoolGroup {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn world_size(&self) -> usize {
        self.core.world_size()
    }

    async fn start(&self) -> Result<()> {
        self.core.start().await
    }

    async fn pids(&self) -> Result<BTreeMap<Rank, u32>> {
        self.core.pids().await
    }

    async fn wait(&self, timeout: Duration) -> Result<RunResult> {
        self.core.wait(timeout).await
    }

    async fn close(&self) -> Result<()> {
        self.core.close().await
    }

    async fn forward_signal(&self, signal: Signal) -> Result<Vec<u32>> {
        self.core.forward_signal(signal).await
    }

    async fn fail_rank_by_pid(&self, pid: u32, signal: Signal) -> Result<Option<Rank>> {
        self.core.fail_rank_by_pid(pid, signal).await
    }

    async fn state(&self) -> GroupState {
        self.core.state().await
    }

    fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.core.subscribe()
    }
}
