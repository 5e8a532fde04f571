//! Process groups running external commands
//!
//! The subprocess flavor spawns one caller-supplied command line per rank.
//! Workers are plain executables; they report nothing back beyond their exit
//! status, so successful ranks settle with a `null` return value.

use crate::group::adapters::{ManagedWorker, UnixWorker, WorkerLauncher};
use crate::group::{GroupConfig, GroupCore, ProcessGroup};
use crate::process::{spawn_worker, OutputFiles};
use crate::{CoreError, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use schema::{GroupEvent, GroupState, Rank, RunResult};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Command line for one rank's worker
#[derive(Debug, Clone)]
pub struct RankCommand {
    /// Program to execute (must be in PATH or an absolute path)
    pub program: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Caller-supplied environment overrides. These win over the variables
    /// the group injects.
    pub env: HashMap<String, String>,
}

impl RankCommand {
    /// Create a command with no arguments and no environment overrides
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
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

/// Launcher spawning an external command per rank
struct CommandLauncher {
    commands: BTreeMap<Rank, RankCommand>,
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    fn ranks(&self) -> Vec<Rank> {
        self.commands.keys().copied().collect()
    }

    async fn launch(
        &self,
        rank: Rank,
        extra_env: &HashMap<String, String>,
        output: &OutputFiles,
    ) -> Result<Box<dyn ManagedWorker>> {
        let command = self.commands.get(&rank).ok_or_else(|| {
            CoreError::StateError(format!("No command registered for rank {rank}"))
        })?;

        // Injected variables go in first so the caller's env wins on conflicts
        let mut env = extra_env.clone();
        env.extend(command.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        debug!(
            "Launching rank {}: {} {:?}",
            rank, command.program, command.args
        );
        let child = spawn_worker(OsStr::new(&command.program), &command.args, &env, output)?;
        Ok(Box::new(UnixWorker::new(child, None)))
    }
}

/// Process group running one external command per rank
pub struct SubprocessGroup {
    core: GroupCore,
}

impl SubprocessGroup {
    /// Create a group from explicit per-rank commands.
    ///
    /// The rank set is exactly the key set of `commands`.
    pub fn new(config: GroupConfig, commands: BTreeMap<Rank, RankCommand>) -> Self {
        Self {
            core: GroupCore::new(config, Box::new(CommandLauncher { commands })),
        }
    }

    /// Create a group running the same command for ranks `0..world_size`.
    ///
    /// Workers tell their ranks apart through the injected rank variable.
    pub fn homogeneous(config: GroupConfig, command: RankCommand, world_size: usize) -> Self {
        let commands = (0..world_size as Rank)
            .map(|rank| (rank, command.clone()))
            .collect();
        Self::new(config, commands)
    }
}

#[async_trait]
impl ProcessGroup for SubprocessGroup {
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
