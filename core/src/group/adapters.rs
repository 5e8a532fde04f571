//! Worker adapters for abstracting process management
//!
//! This module provides traits and implementations for abstracting how
//! workers are launched and controlled, enabling testing with mock
//! implementations and supporting different launch backends (external
//! commands, re-executed worker entrypoints).

use crate::process::OutputFiles;
use crate::Result;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use schema::{GroupEvent, Rank, WorkerExit};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Trait for launching one worker per local rank
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// The local ranks this launcher can populate, in ascending order
    fn ranks(&self) -> Vec<Rank>;

    /// Launch the worker for a rank.
    ///
    /// `extra_env` holds the variables the group injects (rank identity,
    /// signal contract); launchers apply them before any caller-supplied
    /// values so callers can override them.
    async fn launch(
        &self,
        rank: Rank,
        extra_env: &HashMap<String, String>,
        output: &OutputFiles,
    ) -> Result<Box<dyn ManagedWorker>>;
}

/// Trait representing a launched worker that can be reaped and signaled
pub trait ManagedWorker: Send + Sync {
    /// Get the worker's process ID
    fn pid(&self) -> u32;

    /// Try to reap the worker without blocking.
    ///
    /// Returns `Ok(None)` while the worker is still running and
    /// `Ok(Some(exit))` exactly once when it has exited.
    fn try_reap(&mut self) -> Result<Option<WorkerExit>>;

    /// Deliver a forwarded signal to the worker process only
    fn deliver(&self, signal: Signal) -> Result<()>;

    /// Send a termination signal to the worker's whole process group
    fn terminate(&self, signal: Signal) -> Result<()>;

    /// Forcefully kill the worker's whole process group
    fn kill(&self) -> Result<()>;

    /// Check if the worker is still alive
    fn is_alive(&self) -> bool;

    /// The worker's return value, consulted after a successful exit
    fn return_value(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Real worker backed by a Unix process group
#[cfg(unix)]
pub(crate) struct UnixWorker {
    child: crate::process::WorkerChild,
    /// File the worker writes its JSON return value to, if the launch
    /// backend supports return values
    result_file: Option<std::path::PathBuf>,
}

#[cfg(unix)]
impl UnixWorker {
    pub(crate) fn new(
        child: crate::process::WorkerChild,
        result_file: Option<std::path::PathBuf>,
    ) -> Self {
        Self { child, result_file }
    }
}

#[cfg(unix)]
impl ManagedWorker for UnixWorker {
    fn pid(&self) -> u32 {
        self.child.pid()
    }

    fn try_reap(&mut self) -> Result<Option<WorkerExit>> {
        let Some(status) = self.child.try_wait()? else {
            return Ok(None);
        };
        let (exit_code, signal) = crate::process::decode_exit_status(&status);
        Ok(Some(WorkerExit {
            pid: self.pid(),
            exit_code,
            signal,
            timestamp: GroupEvent::current_timestamp(),
        }))
    }

    fn deliver(&self, signal: Signal) -> Result<()> {
        crate::process::signal_pid(self.pid(), signal)
    }

    fn terminate(&self, signal: Signal) -> Result<()> {
        crate::process::signal_group(&self.child, signal)
    }

    fn kill(&self) -> Result<()> {
        crate::process::signal_group(&self.child, Signal::SIGKILL)
    }

    fn is_alive(&self) -> bool {
        crate::process::is_pid_alive(self.pid())
    }

    fn return_value(&self) -> serde_json::Value {
        let Some(path) = &self.result_file else {
            return serde_json::Value::Null;
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        "Worker {} wrote a malformed return value to {}: {}",
                        self.pid(),
                        path.display(),
                        e
                    );
                    serde_json::Value::Null
                }
            },
            // The worker never wrote a value; treat as no return value
            Err(_) => serde_json::Value::Null,
        }
    }
}

/// A signal observed by the mock launcher's workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRecord {
    /// Rank of the worker that received the signal
    pub rank: Rank,
    /// Raw signal number
    pub signal: i32,
    /// Whether the signal targeted the whole process group
    pub to_group: bool,
}

/// Instructions for mock worker behavior
#[derive(Debug, Clone)]
pub struct MockInstruction {
    /// How long the worker "runs" before exiting on its own
    pub exit_delay: std::time::Duration,
    /// Exit code for a natural exit (None means killed by signal)
    pub exit_code: Option<i32>,
    /// Signal that killed the worker on a natural exit (Unix only)
    pub signal: Option<i32>,
    /// Whether delivered or termination signals end the worker
    pub responds_to_signals: bool,
    /// Value the worker reports after a successful exit
    pub return_value: serde_json::Value,
    /// Whether launching this worker fails outright
    pub fail_spawn: bool,
}

impl Default for MockInstruction {
    fn default() -> Self {
        Self {
            exit_delay: std::time::Duration::from_millis(100),
            exit_code: Some(0),
            signal: None,
            responds_to_signals: true,
            return_value: serde_json::Value::Null,
            fail_spawn: false,
        }
    }
}

impl MockInstruction {
    /// A worker that exits successfully after a short delay
    pub fn success() -> Self {
        Self::default()
    }

    /// A worker that exits with the given code after a short delay
    pub fn exit_with(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// A worker that dies to the given signal after a short delay
    pub fn die_by_signal(signal: i32) -> Self {
        Self {
            exit_code: None,
            signal: Some(signal),
            ..Self::default()
        }
    }

    /// A worker that runs until signaled
    pub fn long_running() -> Self {
        Self {
            exit_delay: std::time::Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// A worker that runs until signaled and ignores everything but SIGKILL
    pub fn stubborn() -> Self {
        Self {
            exit_delay: std::time::Duration::from_secs(60),
            responds_to_signals: false,
            ..Self::default()
        }
    }
}

/// Mock worker launcher for testing
#[derive(Clone)]
pub struct MockWorkerLauncher {
    /// Per-rank behavior instructions
    instructions: Arc<std::sync::Mutex<HashMap<Rank, MockInstruction>>>,
    /// Every signal any mock worker received, in delivery order
    ledger: Arc<std::sync::Mutex<Vec<SignalRecord>>>,
    /// Injected environment observed per rank at launch time
    envs: Arc<std::sync::Mutex<HashMap<Rank, HashMap<String, String>>>>,
    /// Ranks in launch order
    rank_list: Vec<Rank>,
}

impl MockWorkerLauncher {
    /// Create a launcher with default (quick success) behavior for `world_size` ranks
    pub fn new(world_size: usize) -> Self {
        Self {
            instructions: Arc::new(std::sync::Mutex::new(HashMap::new())),
            ledger: Arc::new(std::sync::Mutex::new(Vec::new())),
            envs: Arc::new(std::sync::Mutex::new(HashMap::new())),
            rank_list: (0..world_size as Rank).collect(),
        }
    }

    /// Override the behavior of one rank
    pub fn instruct(&self, rank: Rank, instruction: MockInstruction) {
        let mut instructions = lock_ignore_poison(&self.instructions);
        instructions.insert(rank, instruction);
    }

    /// Apply the same behavior to every rank
    pub fn instruct_all(&self, instruction: MockInstruction) {
        let mut instructions = lock_ignore_poison(&self.instructions);
        for rank in &self.rank_list {
            instructions.insert(*rank, instruction.clone());
        }
    }

    /// Every signal received by any worker so far, in order
    pub fn signals(&self) -> Vec<SignalRecord> {
        lock_ignore_poison(&self.ledger).clone()
    }

    /// The injected environment a rank's worker was launched with
    pub fn env_seen(&self, rank: Rank) -> Option<HashMap<String, String>> {
        lock_ignore_poison(&self.envs).get(&rank).cloned()
    }
}

// Mutex poisoning only happens when a test thread panicked; the data is
// still usable for assertions.
fn lock_ignore_poison<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl WorkerLauncher for MockWorkerLauncher {
    fn ranks(&self) -> Vec<Rank> {
        self.rank_list.clone()
    }

    async fn launch(
        &self,
        rank: Rank,
        extra_env: &HashMap<String, String>,
        _output: &OutputFiles,
    ) -> Result<Box<dyn ManagedWorker>> {
        let instruction = lock_ignore_poison(&self.instructions)
            .get(&rank)
            .cloned()
            .unwrap_or_default();

        if instruction.fail_spawn {
            return Err(crate::CoreError::ProcessSpawn(format!(
                "Injected spawn failure for rank {rank}"
            )));
        }

        lock_ignore_poison(&self.envs).insert(rank, extra_env.clone());

        // Generate a fake PID well above real ones
        let pid = rand::random::<u32>() % 20000 + 40000;
        debug!("Launched mock worker for rank {} with pid {}", rank, pid);

        Ok(Box::new(MockWorker {
            pid,
            rank,
            ledger: Arc::clone(&self.ledger),
            state: std::sync::Mutex::new(MockWorkerState {
                instruction,
                started_at: std::time::Instant::now(),
                fatal_signal: None,
                reaped: false,
            }),
        }))
    }
}

struct MockWorkerState {
    instruction: MockInstruction,
    started_at: std::time::Instant,
    /// Signal that has already "killed" this worker, if any
    fatal_signal: Option<i32>,
    reaped: bool,
}

/// Mock managed worker for testing
struct MockWorker {
    pid: u32,
    rank: Rank,
    ledger: Arc<std::sync::Mutex<Vec<SignalRecord>>>,
    state: std::sync::Mutex<MockWorkerState>,
}

impl MockWorker {
    fn record(&self, signal: Signal, to_group: bool) {
        lock_ignore_poison(&self.ledger).push(SignalRecord {
            rank: self.rank,
            signal: signal as i32,
            to_group,
        });
    }

    fn receive(&self, signal: Signal, to_group: bool) {
        self.record(signal, to_group);
        let mut state = lock_ignore_poison(&self.state);
        // SIGKILL always lands; other signals only if the worker responds
        if state.fatal_signal.is_none()
            && (signal == Signal::SIGKILL || state.instruction.responds_to_signals)
        {
            state.fatal_signal = Some(signal as i32);
        }
    }

    fn pending_exit(state: &MockWorkerState, pid: u32) -> Option<WorkerExit> {
        if let Some(signal) = state.fatal_signal {
            return Some(WorkerExit::with_signal(pid, signal));
        }
        if state.started_at.elapsed() >= state.instruction.exit_delay {
            return Some(WorkerExit {
                pid,
                exit_code: state.instruction.exit_code,
                signal: state.instruction.signal,
                timestamp: GroupEvent::current_timestamp(),
            });
        }
        None
    }
}

impl ManagedWorker for MockWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_reap(&mut self) -> Result<Option<WorkerExit>> {
        let mut state = lock_ignore_poison(&self.state);
        if state.reaped {
            return Ok(None);
        }
        match Self::pending_exit(&state, self.pid) {
            Some(exit) => {
                state.reaped = true;
                Ok(Some(exit))
            }
            None => Ok(None),
        }
    }

    fn deliver(&self, signal: Signal) -> Result<()> {
        debug!("Delivering {} to mock worker {}", signal, self.pid);
        self.receive(signal, false);
        Ok(())
    }

    fn terminate(&self, signal: Signal) -> Result<()> {
        debug!("Terminating mock worker {} with {}", self.pid, signal);
        self.receive(signal, true);
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        debug!("Killing mock worker {}", self.pid);
        self.receive(Signal::SIGKILL, true);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        let state = lock_ignore_poison(&self.state);
        !state.reaped && Self::pending_exit(&state, self.pid).is_none()
    }

    fn return_value(&self) -> serde_json::Value {
        lock_ignore_poison(&self.state).instruction.return_value.clone()
    }
}

// Simple random number generator for mock PIDs
mod rand {
    use std::sync::atomic::{AtomicU32, Ordering};

    static SEED: AtomicU32 = AtomicU32::new(1);

    pub(crate) fn random<T>() -> T
    where
        T: From<u32>,
    {
        // Simple linear congruential generator
        let prev = SEED.load(Ordering::Relaxed);
        let next = prev.wrapping_mul(1103515245).wrapping_add(12345);
        SEED.store(next, Ordering::Relaxed);
        T::from(next)
    }
}
