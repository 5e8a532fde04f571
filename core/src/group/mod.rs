//! Process group supervision
//!
//! This module provides the core supervision machinery for a set of worker
//! processes, one per local rank: spawning, exit monitoring, signal delivery
//! and graceful teardown with bounded escalation.
//!
//! ## Lifecycle
//!
//! A group moves monotonically through four states and never backward:
//!
//! ```text
//! Created → Running → Terminating → Terminated
//! ```
//!
//! `Terminated` is absorbing. Natural completion may skip `Terminating`.
//!
//! ## Components
//!
//! - [`ProcessGroup`]: control surface shared by every group flavor
//! - [`GroupCore`]: state machine driving launch, reap and escalation
//! - [`WorkerLauncher`] / [`ManagedWorker`]: pluggable launch backends
//! - [`SubprocessGroup`](subprocess::SubprocessGroup): external commands
//! - [`WorkerPoolGroup`](pool::WorkerPoolGroup): re-executed worker entrypoints

use crate::policy::PolicyCell;
use crate::process::OutputFiles;
use crate::{CoreError, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use schema::launch::{DEFAULT_SIGNALS_TO_HANDLE, LOCAL_RANK_ENV, SIGNALS_TO_HANDLE_ENV};
use schema::{GroupEvent, GroupState, ProcessFailure, Rank, RunResult, WorkerExit};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

pub mod adapters;
pub mod pool;
pub mod subprocess;

pub use adapters::*;
pub use pool::*;
pub use subprocess::*;

/// How often worker exits are polled
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded wait for SIGKILL to take effect before a rank is reported stuck
pub(crate) const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the per-group event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Control surface for a running process group.
///
/// Both group flavors expose the same operations; the signal router and the
/// launcher only ever talk to groups through this trait.
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    /// Name of the group, used in logs and events
    fn name(&self) -> &str;

    /// Number of ranks this group manages
    fn world_size(&self) -> usize;

    /// Spawn one worker per rank and move the group to `Running`.
    ///
    /// Fails with a `StateError` unless the group is still `Created`. If any
    /// rank fails to spawn, every already-spawned sibling is killed and the
    /// group lands in `Terminated` with an empty result.
    async fn start(&self) -> Result<()>;

    /// Process ID per rank, available once the group has been started
    async fn pids(&self) -> Result<BTreeMap<Rank, u32>>;

    /// Monitor workers for up to `timeout`, collecting terminal outcomes.
    ///
    /// Returns the final result once every rank has settled. If the timeout
    /// elapses first, returns the partial result accumulated so far; ranks
    /// still running are simply absent from it.
    async fn wait(&self, timeout: Duration) -> Result<RunResult>;

    /// Terminate every live worker: termination signal, grace period, then
    /// SIGKILL for survivors.
    ///
    /// Idempotent. A second caller returns immediately while or after a
    /// close is in flight. Ranks that already exited keep their natural
    /// outcome.
    async fn close(&self) -> Result<()>;

    /// Deliver a signal to each live worker process (not its whole process
    /// group), returning the PIDs it was delivered to.
    ///
    /// Does nothing unless the group is `Running`.
    async fn forward_signal(&self, signal: Signal) -> Result<Vec<u32>>;

    /// Record a failure for the rank whose worker has the given PID.
    ///
    /// Used when a worker reports its own demise out of band (for example
    /// via the secondary user signal). Returns the rank if the PID belongs
    /// to this group. The injected failure takes precedence over whatever
    /// exit the worker produces afterwards.
    async fn fail_rank_by_pid(&self, pid: u32, signal: Signal) -> Result<Option<Rank>>;

    /// Current lifecycle state
    async fn state(&self) -> GroupState;

    /// Subscribe to this group's event stream
    fn subscribe(&self) -> broadcast::Receiver<GroupEvent>;
}

/// Configuration shared by every group flavor
pub struct GroupConfig {
    /// Group name, used in logs, events and log file names
    pub name: String,
    /// Shared signal handling policy
    pub policy: PolicyCell,
    /// Signal sent to workers when a close begins
    pub term_signal: Signal,
    /// Value injected into each worker's environment as the signal contract
    pub signals_to_handle: String,
    /// Directory for per-rank stdout/stderr files; `None` means workers
    /// inherit the launcher's streams
    pub log_dir: Option<PathBuf>,
}

impl GroupConfig {
    /// Create a configuration with default policy and signal contract
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: PolicyCell::default(),
            term_signal: Signal::SIGTERM,
            signals_to_handle: DEFAULT_SIGNALS_TO_HANDLE.to_string(),
            log_dir: None,
        }
    }
}

/// State machine driving one process group.
///
/// The launch backend is pluggable through [`WorkerLauncher`]; everything
/// else (state transitions, exit bookkeeping, escalation) is common to all
/// group flavors.
pub struct GroupCore {
    name: String,
    policy: PolicyCell,
    term_signal: Signal,
    signals_to_handle: String,
    log_dir: Option<PathBuf>,
    launcher: Box<dyn WorkerLauncher>,
    ranks: Vec<Rank>,
    event_tx: broadcast::Sender<GroupEvent>,
    inner: Mutex<GroupInner>,
}

struct GroupInner {
    state: GroupState,
    /// Live workers, removed as they are reaped
    workers: BTreeMap<Rank, Box<dyn ManagedWorker>>,
    /// PID per rank, retained after termination for attribution
    pids: BTreeMap<Rank, u32>,
    return_values: BTreeMap<Rank, serde_json::Value>,
    failures: BTreeMap<Rank, ProcessFailure>,
    /// Cached once the group reaches `Terminated`
    final_result: Option<RunResult>,
}

impl GroupCore {
    /// Create a group around the given launch backend
    pub fn new(config: GroupConfig, launcher: Box<dyn WorkerLauncher>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ranks = launcher.ranks();
        Self {
            name: config.name,
            policy: config.policy,
            term_signal: config.term_signal,
            signals_to_handle: config.signals_to_handle,
            log_dir: config.log_dir,
            launcher,
            ranks,
            event_tx,
            inner: Mutex::new(GroupInner {
                state: GroupState::Created,
                workers: BTreeMap::new(),
                pids: BTreeMap::new(),
                return_values: BTreeMap::new(),
                failures: BTreeMap::new(),
                final_result: None,
            }),
        }
    }

    /// Environment the group injects into every worker. Launchers apply
    /// caller-supplied variables after these, so callers win on conflicts.
    fn injected_env(&self, rank: Rank) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(
            SIGNALS_TO_HANDLE_ENV.to_string(),
            self.signals_to_handle.clone(),
        );
        env.insert(LOCAL_RANK_ENV.to_string(), rank.to_string());
        env
    }

    fn output_files(&self, rank: Rank) -> OutputFiles {
        match &self.log_dir {
            Some(dir) => OutputFiles {
                stdout: Some(dir.join(format!("{}_{}_stdout.log", self.name, rank))),
                stderr: Some(dir.join(format!("{}_{}_stderr.log", self.name, rank))),
            },
            None => OutputFiles::inherit(),
        }
    }

    /// Reap exited workers and record their outcomes. Called with the group
    /// lock held.
    fn reap_exited(&self, inner: &mut GroupInner) {
        let ranks: Vec<Rank> = inner.workers.keys().copied().collect();
        for rank in ranks {
            let outcome = match inner.workers.get_mut(&rank) {
                Some(worker) => worker.try_reap(),
                None => continue,
            };
            match outcome {
                Ok(Some(exit)) => {
                    let worker = inner.workers.remove(&rank);
                    self.record_exit(inner, rank, &exit, worker);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to poll worker for rank {}: {}", rank, e);
                    let worker = inner.workers.remove(&rank);
                    let pid = worker.map(|w| w.pid()).unwrap_or(0);
                    inner.failures.entry(rank).or_insert_with(|| {
                        ProcessFailure::from_code(
                            rank,
                            pid,
                            1,
                            format!("Worker could not be polled: {e}"),
                        )
                    });
                }
            }
        }
    }

    /// Record one worker's terminal outcome. An injected failure recorded
    /// earlier for the rank wins over the observed exit.
    fn record_exit(
        &self,
        inner: &mut GroupInner,
        rank: Rank,
        exit: &WorkerExit,
        worker: Option<Box<dyn ManagedWorker>>,
    ) {
        let _ = self
            .event_tx
            .send(GroupEvent::worker_exited(self.name.clone(), rank, exit.clone()));

        if inner.failures.contains_key(&rank) {
            debug!(
                "Rank {} already recorded as failed; ignoring exit ({})",
                rank,
                exit.describe()
            );
            return;
        }

        if exit.is_success() {
            debug!("Worker for rank {} (pid {}) exited cleanly", rank, exit.pid);
            let value = worker
                .map(|w| w.return_value())
                .unwrap_or(serde_json::Value::Null);
            inner.return_values.insert(rank, value);
        } else {
            let failure = failure_from_exit(rank, exit);
            warn!("Worker for rank {} failed: {}", rank, failure.message);
            inner.failures.insert(rank, failure);
        }
    }

    /// Cache the final result and move to `Terminated`. Called with the
    /// group lock held and no workers left.
    fn finish(&self, inner: &mut GroupInner) -> RunResult {
        let result = snapshot_result(inner);
        inner.final_result = Some(result.clone());
        inner.state = GroupState::Terminated;
        info!(
            "Process group '{}' terminated ({} succeeded, {} failed)",
            self.name,
            result.return_values.len(),
            result.failures.len()
        );
        let _ = self
            .event_tx
            .send(GroupEvent::group_terminated(self.name.clone(), result.is_failed()));
        result
    }
}

#[async_trait]
impl ProcessGroup for GroupCore {
    fn name(&self) -> &str {
        &self.name
    }

    fn world_size(&self) -> usize {
        self.ranks.len()
    }

    async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.state.can_start() {
            return Err(CoreError::StateError(format!(
                "Cannot start group '{}' in state {:?}",
                self.name, inner.state
            )));
        }

        // A bad log directory should fail before any worker is spawned
        if let Some(dir) = &self.log_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                CoreError::ProcessSpawn(format!(
                    "Failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        info!(
            "Starting process group '{}' with {} workers",
            self.name,
            self.ranks.len()
        );

        for rank in &self.ranks {
            let env = self.injected_env(*rank);
            let output = self.output_files(*rank);
            match self.launcher.launch(*rank, &env, &output).await {
                Ok(worker) => {
                    let pid = worker.pid();
                    debug!("Worker for rank {} started with pid {}", rank, pid);
                    inner.pids.insert(*rank, pid);
                    inner.workers.insert(*rank, worker);
                }
                Err(e) => {
                    error!("Failed to launch worker for rank {}: {}", rank, e);
                    // Kill the ranks that did start; a half-started group
                    // must not leave orphans behind
                    for (started, worker) in inner.workers.iter() {
                        if let Err(kill_err) = worker.kill() {
                            warn!(
                                "Failed to kill rank {} while rolling back: {}",
                                started, kill_err
                            );
                        }
                    }
                    inner.workers.clear();
                    inner.pids.clear();
                    inner.state = GroupState::Terminated;
                    inner.final_result = Some(RunResult::default());
                    return Err(e);
                }
            }
        }

        inner.state = GroupState::Running;
        let _ = self
            .event_tx
            .send(GroupEvent::group_started(self.name.clone(), inner.pids.clone()));
        Ok(())
    }

    async fn pids(&self) -> Result<BTreeMap<Rank, u32>> {
        let inner = self.inner.lock().await;
        if inner.state == GroupState::Created {
            return Err(CoreError::StateError(format!(
                "Group '{}' has not been started",
                self.name
            )));
        }
        Ok(inner.pids.clone())
    }

    async fn wait(&self, timeout: Duration) -> Result<RunResult> {
        let start = Instant::now();
        loop {
            {
                let mut inner = self.inner.lock().await;
                match inner.state {
                    GroupState::Created => {
                        return Err(CoreError::StateError(format!(
                            "Cannot wait on group '{}' before it is started",
                            self.name
                        )));
                    }
                    GroupState::Terminated => {
                        if let Some(result) = &inner.final_result {
                            return Ok(result.clone());
                        }
                        return Ok(snapshot_result(&inner));
                    }
                    GroupState::Running => {
                        self.reap_exited(&mut inner);
                        if inner.workers.is_empty() {
                            return Ok(self.finish(&mut inner));
                        }
                    }
                    GroupState::Terminating => {
                        // A close is in flight and owns the workers; report
                        // what has settled so far until it finishes
                    }
                }

                if start.elapsed() >= timeout {
                    debug!(
                        "Wait on group '{}' timed out with ranks still running",
                        self.name
                    );
                    return Ok(snapshot_result(&inner));
                }
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn close(&self) -> Result<()> {
        let policy = self.policy.current().await;

        // Decide and drain under the lock; signal and poll outside it so
        // concurrent wait() and state() calls stay responsive
        let mut draining: Vec<(Rank, Box<dyn ManagedWorker>)> = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                GroupState::Terminating | GroupState::Terminated => {
                    debug!(
                        "Group '{}' is already {:?}; close is a no-op",
                        self.name, inner.state
                    );
                    return Ok(());
                }
                GroupState::Created => {
                    debug!("Closing group '{}' before start", self.name);
                    inner.state = GroupState::Terminated;
                    inner.final_result = Some(RunResult::default());
                    let _ = self
                        .event_tx
                        .send(GroupEvent::group_terminated(self.name.clone(), false));
                    return Ok(());
                }
                GroupState::Running => {
                    inner.state = GroupState::Terminating;
                    let _ = self.event_tx.send(GroupEvent::shutdown_requested(
                        self.name.clone(),
                        self.term_signal.as_str().to_string(),
                    ));
                    std::mem::take(&mut inner.workers).into_iter().collect()
                }
            }
        };

        info!(
            "Closing group '{}': sending {} to {} workers, grace {:?}",
            self.name,
            self.term_signal,
            draining.len(),
            policy.grace_period
        );

        // Phase 1: termination signal to every worker's process group
        for (rank, worker) in &draining {
            if let Err(e) = worker.terminate(self.term_signal) {
                warn!("Failed to send {} to rank {}: {}", self.term_signal, rank, e);
            }
        }

        // Phase 2: reap exits for the duration of the grace period
        let mut settled: Vec<(Rank, WorkerExit, Box<dyn ManagedWorker>)> = Vec::new();
        let grace_start = Instant::now();
        while !draining.is_empty() && grace_start.elapsed() < policy.grace_period {
            reap_draining(&mut draining, &mut settled);
            if draining.is_empty() {
                break;
            }
            let remaining = policy.grace_period.saturating_sub(grace_start.elapsed());
            tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
        }
        if !draining.is_empty() {
            reap_draining(&mut draining, &mut settled);
        }

        // Phase 3: SIGKILL for survivors, with a bounded reap
        let mut stuck: Vec<Rank> = Vec::new();
        if !draining.is_empty() {
            let survivors: Vec<Rank> = draining.iter().map(|(rank, _)| *rank).collect();
            warn!(
                "Grace period expired for group '{}'; killing ranks {:?}",
                self.name, survivors
            );
            let _ = self
                .event_tx
                .send(GroupEvent::grace_expired(self.name.clone(), survivors));
            for (rank, worker) in &draining {
                if let Err(e) = worker.kill() {
                    warn!("Failed to kill rank {}: {}", rank, e);
                }
            }

            let kill_start = Instant::now();
            while !draining.is_empty() && kill_start.elapsed() < KILL_TIMEOUT {
                reap_draining(&mut draining, &mut settled);
                if draining.is_empty() {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            stuck = draining.iter().map(|(rank, _)| *rank).collect();
        }

        // Phase 4: merge outcomes and finalize
        {
            let mut inner = self.inner.lock().await;
            for (rank, exit, worker) in settled {
                self.record_exit(&mut inner, rank, &exit, Some(worker));
            }
            for (rank, worker) in draining {
                let pid = worker.pid();
                error!(
                    "Rank {} (pid {}) did not exit within {:?} of SIGKILL",
                    rank, pid, KILL_TIMEOUT
                );
                inner.failures.entry(rank).or_insert_with(|| {
                    ProcessFailure::from_signal(
                        rank,
                        pid,
                        libc::SIGKILL,
                        signal_name(libc::SIGKILL),
                        format!("Worker did not exit within {KILL_TIMEOUT:?} of SIGKILL"),
                    )
                });
            }
            self.finish(&mut inner);
        }

        if stuck.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Timeout(format!(
                "Workers for ranks {:?} in group '{}' did not exit after SIGKILL",
                stuck, self.name
            )))
        }
    }

    async fn forward_signal(&self, signal: Signal) -> Result<Vec<u32>> {
        let inner = self.inner.lock().await;
        if inner.state != GroupState::Running {
            debug!(
                "Not forwarding {} to group '{}' in state {:?}",
                signal, self.name, inner.state
            );
            return Ok(Vec::new());
        }

        let mut pids = Vec::new();
        for (rank, worker) in inner.workers.iter() {
            match worker.deliver(signal) {
                Ok(()) => pids.push(worker.pid()),
                Err(e) => warn!("Failed to forward {} to rank {}: {}", signal, rank, e),
            }
        }
        info!(
            "Forwarded {} to {} workers in group '{}'",
            signal,
            pids.len(),
            self.name
        );
        let _ = self.event_tx.send(GroupEvent::signal_forwarded(
            self.name.clone(),
            signal.as_str().to_string(),
            pids.clone(),
        ));
        Ok(pids)
    }

    async fn fail_rank_by_pid(&self, pid: u32, signal: Signal) -> Result<Option<Rank>> {
        let mut inner = self.inner.lock().await;
        let Some(rank) = inner
            .pids
            .iter()
            .find(|(_, worker_pid)| **worker_pid == pid)
            .map(|(rank, _)| *rank)
        else {
            return Ok(None);
        };

        if inner.failures.contains_key(&rank) {
            debug!("Rank {} already has a failure recorded", rank);
            return Ok(Some(rank));
        }
        if inner.return_values.contains_key(&rank) {
            debug!(
                "Rank {} already settled successfully; not recording injected failure",
                rank
            );
            return Ok(Some(rank));
        }

        let signo = signal as i32;
        let name = signal_name(signo);
        let failure = ProcessFailure::from_signal(
            rank,
            pid,
            signo,
            name.clone(),
            format!(
                "Worker reported failure via {}",
                name.as_deref().unwrap_or("signal")
            ),
        );
        warn!(
            "Recording injected failure for rank {} (pid {}) in group '{}'",
            rank, pid, self.name
        );
        inner.failures.insert(rank, failure);
        let _ = self.event_tx.send(GroupEvent::rank_failure_injected(
            self.name.clone(),
            rank,
            pid,
            signal.as_str().to_string(),
        ));
        Ok(Some(rank))
    }

    async fn state(&self) -> GroupState {
        self.inner.lock().await.state
    }

    fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.event_tx.subscribe()
    }
}

fn snapshot_result(inner: &GroupInner) -> RunResult {
    RunResult {
        return_values: inner.return_values.clone(),
        failures: inner.failures.clone(),
    }
}

/// Move workers that exited out of `draining` into `settled`
fn reap_draining(
    draining: &mut Vec<(Rank, Box<dyn ManagedWorker>)>,
    settled: &mut Vec<(Rank, WorkerExit, Box<dyn ManagedWorker>)>,
) {
    let mut still_running = Vec::with_capacity(draining.len());
    for (rank, mut worker) in draining.drain(..) {
        match worker.try_reap() {
            Ok(Some(exit)) => settled.push((rank, exit, worker)),
            Ok(None) => still_running.push((rank, worker)),
            Err(e) => {
                warn!("Failed to poll rank {} during shutdown: {}", rank, e);
                let exit = WorkerExit {
                    pid: worker.pid(),
                    exit_code: None,
                    signal: None,
                    timestamp: GroupEvent::current_timestamp(),
                };
                settled.push((rank, exit, worker));
            }
        }
    }
    *draining = still_running;
}

/// Build the failure record matching an abnormal exit
fn failure_from_exit(rank: Rank, exit: &WorkerExit) -> ProcessFailure {
    match (exit.exit_code, exit.signal) {
        (Some(code), _) => ProcessFailure::from_code(
            rank,
            exit.pid,
            code,
            format!("Worker exited with code {code}"),
        ),
        (None, Some(signo)) => {
            let name = signal_name(signo);
            let message = match &name {
                Some(name) => format!("Worker killed by {name}"),
                None => format!("Worker killed by signal {signo}"),
            };
            ProcessFailure::from_signal(rank, exit.pid, signo, name, message)
        }
        (None, None) => ProcessFailure::from_code(
            rank,
            exit.pid,
            1,
            "Worker exited with unknown status".to_string(),
        ),
    }
}

/// Resolve a raw signal number to its name, if it is a known signal
pub(crate) fn signal_name(signo: i32) -> Option<String> {
    Signal::try_from(signo).ok().map(|s| s.as_str().to_string())
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::policy::SignalPolicy;
    use std::sync::Arc;
    use tokio::time::timeout as tokio_timeout;

    fn make_group(launcher: MockWorkerLauncher, grace: Duration) -> GroupCore {
        let mut config = GroupConfig::new("test-group");
        config.policy = PolicyCell::new(SignalPolicy {
            grace_period: grace,
            ..SignalPolicy::default()
        });
        GroupCore::new(config, Box::new(launcher))
    }

    async fn drain_events(rx: &mut broadcast::Receiver<GroupEvent>) -> Vec<GroupEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_start_moves_group_to_running() {
        let launcher = MockWorkerLauncher::new(2);
        launcher.instruct_all(MockInstruction::long_running());
        let group = make_group(launcher, Duration::from_secs(5));

        assert_eq!(group.state().await, GroupState::Created);
        group.start().await.unwrap();
        assert_eq!(group.state().await, GroupState::Running);

        let pids = group.pids().await.unwrap();
        assert_eq!(pids.len(), 2);
        assert!(pids.values().all(|pid| *pid > 0));
    }

    #[tokio::test]
    async fn test_start_twice_is_a_state_error() {
        let launcher = MockWorkerLauncher::new(1);
        launcher.instruct_all(MockInstruction::long_running());
        let group = make_group(launcher, Duration::from_secs(5));

        group.start().await.unwrap();
        let err = group.start().await.unwrap_err();
        assert!(matches!(err, CoreError::StateError(_)));
    }

    #[tokio::test]
    async fn test_wait_and_pids_before_start_are_state_errors() {
        let group = make_group(MockWorkerLauncher::new(1), Duration::from_secs(5));

        assert!(matches!(
            group.pids().await.unwrap_err(),
            CoreError::StateError(_)
        ));
        assert!(matches!(
            group.wait(Duration::from_millis(10)).await.unwrap_err(),
            CoreError::StateError(_)
        ));
    }

    #[tokio::test]
    async fn test_wait_collects_return_values() {
        let launcher = MockWorkerLauncher::new(2);
        launcher.instruct(
            0,
            MockInstruction {
                exit_delay: Duration::ZERO,
                return_value: serde_json::json!({"rank": 0}),
                ..MockInstruction::default()
            },
        );
        launcher.instruct(
            1,
            MockInstruction {
                exit_delay: Duration::from_millis(50),
                return_value: serde_json::json!({"rank": 1}),
                ..MockInstruction::default()
            },
        );
        let group = make_group(launcher, Duration::from_secs(5));

        group.start().await.unwrap();
        let result = group.wait(Duration::from_secs(5)).await.unwrap();

        assert!(!result.is_failed());
        assert!(result.is_complete(2));
        assert_eq!(result.return_values[&0], serde_json::json!({"rank": 0}));
        assert_eq!(result.return_values[&1], serde_json::json!({"rank": 1}));
        assert_eq!(group.state().await, GroupState::Terminated);
    }

    #[tokio::test]
    async fn test_wait_timeout_returns_partial_result() {
        let launcher = MockWorkerLauncher::new(2);
        launcher.instruct(
            0,
            MockInstruction {
                exit_delay: Duration::ZERO,
                ..MockInstruction::default()
            },
        );
        launcher.instruct(1, MockInstruction::long_running());
        let group = make_group(launcher, Duration::from_secs(5));

        group.start().await.unwrap();
        let result = group.wait(Duration::from_millis(300)).await.unwrap();

        // Rank 0 settled, rank 1 is still running and therefore absent
        assert!(result.return_values.contains_key(&0));
        assert_eq!(result.settled_ranks(), 1);
        assert!(!result.is_complete(2));
        assert_eq!(group.state().await, GroupState::Running);
    }

    #[tokio::test]
    async fn test_wait_aggregates_failures_per_rank() {
        let launcher = MockWorkerLauncher::new(3);
        launcher.instruct(
            0,
            MockInstruction {
                exit_delay: Duration::ZERO,
                ..MockInstruction::exit_with(3)
            },
        );
        launcher.instruct(
            1,
            MockInstruction {
                exit_delay: Duration::ZERO,
                ..MockInstruction::default()
            },
        );
        launcher.instruct(
            2,
            MockInstruction {
                exit_delay: Duration::ZERO,
                ..MockInstruction::die_by_signal(libc::SIGSEGV)
            },
        );
        let group = make_group(launcher, Duration::from_secs(5));

        group.start().await.unwrap();
        let result = group.wait(Duration::from_secs(5)).await.unwrap();

        assert!(result.is_failed());
        assert!(result.is_complete(3));
        assert_eq!(result.failures[&0].exit_code, 3);
        assert!(result.failures[&0].signal_name.is_none());
        assert!(result.return_values.contains_key(&1));
        assert_eq!(result.failures[&2].exit_code, -libc::SIGSEGV);
        assert_eq!(result.failures[&2].signal_name.as_deref(), Some("SIGSEGV"));
    }

    #[tokio::test]
    async fn test_wait_after_termination_returns_cached_result() {
        let launcher = MockWorkerLauncher::new(1);
        launcher.instruct(
            0,
            MockInstruction {
                exit_delay: Duration::ZERO,
                ..MockInstruction::exit_with(7)
            },
        );
        let group = make_group(launcher, Duration::from_secs(5));

        group.start().await.unwrap();
        let first = group.wait(Duration::from_secs(5)).await.unwrap();
        let second = group.wait(Duration::from_millis(1)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_close_terminates_responsive_workers_within_grace() {
        let launcher = MockWorkerLauncher::new(2);
        launcher.instruct_all(MockInstruction::long_running());
        let group = make_group(launcher.clone(), Duration::from_secs(10));

        group.start().await.unwrap();
        let start = Instant::now();
        group.close().await.unwrap();

        // Responsive workers die to the termination signal well before the
        // grace period elapses
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(group.state().await, GroupState::Terminated);

        let signals = launcher.signals();
        assert_eq!(signals.len(), 2);
        assert!(signals
            .iter()
            .all(|record| record.signal == libc::SIGTERM && record.to_group));

        let result = group.wait(Duration::from_millis(1)).await.unwrap();
        assert_eq!(result.failures[&0].signal_name.as_deref(), Some("SIGTERM"));
        assert_eq!(result.failures[&0].exit_code, -libc::SIGTERM);
    }

    #[tokio::test]
    async fn test_close_escalates_to_kill_after_grace() {
        let launcher = MockWorkerLauncher::new(1);
        launcher.instruct_all(MockInstruction::stubborn());
        let grace = Duration::from_millis(300);
        let group = make_group(launcher.clone(), grace);

        group.start().await.unwrap();
        let start = Instant::now();
        group.close().await.unwrap();
        assert!(start.elapsed() >= grace);

        let signals = launcher.signals();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal, libc::SIGTERM);
        assert_eq!(signals[1].signal, libc::SIGKILL);

        let result = group.wait(Duration::from_millis(1)).await.unwrap();
        assert_eq!(result.failures[&0].exit_code, -libc::SIGKILL);
    }

    #[tokio::test]
    async fn test_close_with_zero_grace_kills_immediately() {
        let launcher = MockWorkerLauncher::new(1);
        launcher.instruct_all(MockInstruction::stubborn());
        let group = make_group(launcher.clone(), Duration::ZERO);

        group.start().await.unwrap();
        let start = Instant::now();
        group.close().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));

        let signals = launcher.signals();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal, libc::SIGTERM);
        assert_eq!(signals[1].signal, libc::SIGKILL);
    }

    #[tokio::test]
    async fn test_close_keeps_outcomes_of_already_exited_ranks() {
        let launcher = MockWorkerLauncher::new(2);
        launcher.instruct(
            0,
            MockInstruction {
                exit_delay: Duration::ZERO,
                return_value: serde_json::json!(42),
                ..MockInstruction::default()
            },
        );
        launcher.instruct(1, MockInstruction::long_running());
        let group = make_group(launcher, Duration::from_secs(10));

        group.start().await.unwrap();
        // Let rank 0 settle first
        let partial = group.wait(Duration::from_millis(300)).await.unwrap();
        assert!(partial.return_values.contains_key(&0));

        group.close().await.unwrap();
        let result = group.wait(Duration::from_millis(1)).await.unwrap();
        assert_eq!(result.return_values[&0], serde_json::json!(42));
        assert!(result.failures.contains_key(&1));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let launcher = MockWorkerLauncher::new(1);
        launcher.instruct_all(MockInstruction::long_running());
        let group = make_group(launcher.clone(), Duration::from_secs(10));

        group.start().await.unwrap();
        group.close().await.unwrap();
        let signals_after_first = launcher.signals().len();

        group.close().await.unwrap();
        assert_eq!(launcher.signals().len(), signals_after_first);
        assert_eq!(group.state().await, GroupState::Terminated);
    }

    #[tokio::test]
    async fn test_close_before_start_terminates_with_empty_result() {
        let launcher = MockWorkerLauncher::new(2);
        let group = make_group(launcher.clone(), Duration::from_secs(10));

        group.close().await.unwrap();
        assert_eq!(group.state().await, GroupState::Terminated);
        assert!(launcher.signals().is_empty());

        let result = group.wait(Duration::from_millis(1)).await.unwrap();
        assert_eq!(result.settled_ranks(), 0);

        // start() after close() must be rejected
        assert!(matches!(
            group.start().await.unwrap_err(),
            CoreError::StateError(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_launch_rolls_back_started_ranks() {
        let launcher = MockWorkerLauncher::new(3);
        launcher.instruct(0, MockInstruction::long_running());
        launcher.instruct(
            1,
            MockInstruction {
                fail_spawn: true,
                ..MockInstruction::default()
            },
        );
        let group = make_group(launcher.clone(), Duration::from_secs(10));

        let err = group.start().await.unwrap_err();
        assert!(matches!(err, CoreError::ProcessSpawn(_)));
        assert_eq!(group.state().await, GroupState::Terminated);

        // Rank 0 was killed during rollback; rank 2 was never launched
        let signals = launcher.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].rank, 0);
        assert_eq!(signals[0].signal, libc::SIGKILL);
        assert!(launcher.env_seen(2).is_none());
    }

    #[tokio::test]
    async fn test_forward_signal_delivers_to_processes_not_groups() {
        let launcher = MockWorkerLauncher::new(2);
        launcher.instruct_all(MockInstruction::long_running());
        let group = make_group(launcher.clone(), Duration::from_secs(10));

        group.start().await.unwrap();
        let pids = group.forward_signal(Signal::SIGUSR2).await.unwrap();
        assert_eq!(pids.len(), 2);

        let signals = launcher.signals();
        assert_eq!(signals.len(), 2);
        assert!(signals
            .iter()
            .all(|record| record.signal == libc::SIGUSR2 && !record.to_group));
    }

    #[tokio::test]
    async fn test_forward_signal_outside_running_is_a_noop() {
        let launcher = MockWorkerLauncher::new(1);
        let group = make_group(launcher.clone(), Duration::from_secs(10));

        assert!(group
            .forward_signal(Signal::SIGTERM)
            .await
            .unwrap()
            .is_empty());

        group.close().await.unwrap();
        assert!(group
            .forward_signal(Signal::SIGTERM)
            .await
            .unwrap()
            .is_empty());
        assert!(launcher.signals().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_wins_over_later_exit() {
        let launcher = MockWorkerLauncher::new(2);
        launcher.instruct_all(MockInstruction::long_running());
        let group = make_group(launcher, Duration::from_secs(10));

        group.start().await.unwrap();
        let pids = group.pids().await.unwrap();
        let target_pid = pids[&1];

        let rank = group
            .fail_rank_by_pid(target_pid, Signal::SIGUSR1)
            .await
            .unwrap();
        assert_eq!(rank, Some(1));

        // Unknown PIDs are not attributed
        assert_eq!(
            group.fail_rank_by_pid(1, Signal::SIGUSR1).await.unwrap(),
            None
        );

        group.close().await.unwrap();
        let result = group.wait(Duration::from_millis(1)).await.unwrap();

        // The injected record survives the SIGTERM death during close
        assert_eq!(result.failures[&1].exit_code, -libc::SIGUSR1);
        assert_eq!(result.failures[&1].signal_name.as_deref(), Some("SIGUSR1"));
        assert_eq!(result.failures[&1].pid, target_pid);
        // The sibling rank carries its own close outcome
        assert_eq!(result.failures[&0].signal_name.as_deref(), Some("SIGTERM"));
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_broadcast() {
        let launcher = MockWorkerLauncher::new(1);
        launcher.instruct_all(MockInstruction::long_running());
        let group = make_group(launcher, Duration::from_secs(10));
        let mut rx = group.subscribe();

        group.start().await.unwrap();
        group.close().await.unwrap();

        let events = drain_events(&mut rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, GroupEvent::GroupStarted { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, GroupEvent::ShutdownRequested { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, GroupEvent::WorkerExited { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, GroupEvent::GroupTerminated { failed: true, .. })));
        assert!(events.iter().all(|e| e.group() == "test-group"));
    }

    #[tokio::test]
    async fn test_concurrent_wait_sees_close_finish() {
        let launcher = MockWorkerLauncher::new(1);
        launcher.instruct_all(MockInstruction::long_running());
        let group = Arc::new(make_group(launcher, Duration::from_secs(10)));

        group.start().await.unwrap();

        let waiter = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.wait(Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        group.close().await.unwrap();

        let result = tokio_timeout(Duration::from_secs(5), waiter)
            .await
            .expect("wait should finish once close completes")
            .unwrap()
            .unwrap();
        assert!(result.is_complete(1));
    }
}
