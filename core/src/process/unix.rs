//! Unix worker spawning and signaling using process groups
//!
//! Workers are spawned into their own session with `setsid()`, which makes
//! each worker the leader of a fresh process group. Termination signals are
//! then sent to the whole group (negative PID semantics via `killpg`), so
//! grandchildren forked by a worker cannot outlive it. Forwarded signals,
//! by contrast, are delivered to the worker process alone.
//!
//! ## Error handling for races
//!
//! A worker may exit between the moment we decide to signal it and the
//! moment the signal is sent. `ESRCH` (no such process) and `EPERM`
//! (ownership already changed) are therefore treated as success by the
//! group-signaling helpers.

// Allow unsafe code for this module since process management requires libc::setsid() calls
#![allow(unsafe_code)]

use crate::{CoreError, Result};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::ffi::OsStr;
#[allow(unused_imports)]
use std::os::unix::process::CommandExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error};

/// Where a worker's stdout and stderr should go.
///
/// `None` for a stream means the worker inherits the launcher's stream.
#[derive(Debug, Clone, Default)]
pub struct OutputFiles {
    /// File to receive the worker's stdout, if redirected
    pub stdout: Option<PathBuf>,
    /// File to receive the worker's stderr, if redirected
    pub stderr: Option<PathBuf>,
}

impl OutputFiles {
    /// Inherit both streams from the launcher
    pub fn inherit() -> Self {
        Self::default()
    }
}

/// A worker process spawned into its own Unix process group
///
/// The wrapped process is guaranteed to be a session leader, so its PID
/// doubles as its process group ID and group-wide signals reach the entire
/// process tree rooted at the worker.
#[derive(Debug)]
pub struct WorkerChild {
    /// The process ID of the spawned worker
    pid: Pid,
    /// The underlying Child handle for waiting and status checking
    child: Child,
}

impl WorkerChild {
    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Get the process group ID (same as PID for session leaders)
    pub fn pgid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Wait for the worker to exit and return its exit status (async)
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().await.map_err(|e| {
            CoreError::ProcessWait(format!("Failed to wait for process {}: {}", self.pid, e))
        })
    }

    /// Try to reap the worker without blocking
    pub fn try_wait(&mut self) -> Result<Option<std::process::ExitStatus>> {
        self.child.try_wait().map_err(|e| {
            CoreError::ProcessWait(format!(
                "Failed to try_wait for process {}: {}",
                self.pid, e
            ))
        })
    }
}

/// Spawn a worker in its own process group
///
/// The worker is detached into a new session via `setsid()` before `exec()`,
/// making it the leader of its own process group. The worker inherits the
/// launcher's environment with `env` applied on top, and its output streams
/// are redirected according to `output`.
///
/// ## Safety
///
/// This function uses `unsafe` code to call `libc::setsid()` in the
/// `pre_exec` closure. `setsid()` is async-signal-safe and appropriate for
/// use between `fork()` and `exec()`.
pub fn spawn_worker(
    program: &OsStr,
    args: &[String],
    env: &HashMap<String, String>,
    output: &OutputFiles,
) -> Result<WorkerChild> {
    debug!("Spawning worker: {} {:?}", program.to_string_lossy(), args);

    let mut command = Command::new(program);
    command.args(args);
    command.envs(env);
    command.stdin(Stdio::null());
    command.stdout(open_stream(output.stdout.as_ref())?);
    command.stderr(open_stream(output.stderr.as_ref())?);

    // Use pre_exec to call setsid() in the child process
    // Safety: setsid() is async-signal-safe and appropriate for use in pre_exec
    #[deny(unsafe_op_in_unsafe_fn)]
    unsafe {
        command.pre_exec(|| {
            // Create a new session and process group
            let result = libc::setsid();
            if result == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        error!(
            "Failed to spawn worker '{}': {}",
            program.to_string_lossy(),
            e
        );
        CoreError::ProcessSpawn(format!(
            "Failed to spawn '{}': {}",
            program.to_string_lossy(),
            e
        ))
    })?;

    // tokio::process::Child::id() may return Option on some platforms
    let raw_pid = child
        .id()
        .ok_or_else(|| CoreError::ProcessSpawn("Spawned worker did not have a PID".to_string()))?;
    let pid = Pid::from_raw(raw_pid as i32);
    debug!("Successfully spawned worker {} in new process group", pid);

    Ok(WorkerChild { pid, child })
}

fn open_stream(path: Option<&PathBuf>) -> Result<Stdio> {
    match path {
        Some(path) => {
            let file = std::fs::File::create(path).map_err(|e| {
                CoreError::ProcessSpawn(format!(
                    "Failed to create log file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::inherit()),
    }
}

/// Send a signal to the worker's entire process group
///
/// `ESRCH` (group already gone) and `EPERM` (ownership changed, which on a
/// session leader also means it already exited) are treated as success, so
/// signaling an already-dead worker is not an error.
pub fn signal_group(child: &WorkerChild, signal: Signal) -> Result<()> {
    debug!("Sending {} to process group {}", signal, child.pid);

    match killpg(child.pid, signal) {
        Ok(()) => {
            debug!("Successfully sent {} to process group {}", signal, child.pid);
            Ok(())
        }
        Err(nix::errno::Errno::ESRCH) => {
            // Process group doesn't exist, which means it already exited
            debug!("Process group {} already exited", child.pid);
            Ok(())
        }
        Err(nix::errno::Errno::EPERM) => {
            // Permission denied - process may have already exited or changed ownership
            debug!(
                "Permission denied signaling process group {} (likely already exited)",
                child.pid
            );
            Ok(())
        }
        Err(e) => {
            error!(
                "Failed to send {} to process group {}: {}",
                signal, child.pid, e
            );
            Err(CoreError::ProcessSignal(format!(
                "Failed to send {} to process group {}: {}",
                signal, child.pid, e
            )))
        }
    }
}

/// Send a signal to a single process by PID, without touching its group.
///
/// Used for forwarding externally-received signals to individual workers.
/// As with [`signal_group`], a target that already exited is not an error.
pub fn signal_pid(pid: u32, signal: Signal) -> Result<()> {
    let target = Pid::from_raw(pid as i32);
    debug!("Sending {} to process {}", signal, target);

    match kill(target, signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) | Err(nix::errno::Errno::EPERM) => Ok(()),
        Err(e) => Err(CoreError::ProcessSignal(format!(
            "Failed to send {} to process {}: {}",
            signal, target, e
        ))),
    }
}

/// Check whether a process is still alive (signal 0 probe)
pub fn is_pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Split an exit status into `(exit_code, signal)`.
///
/// Exactly one side is `Some` on Unix: a voluntary exit carries a code, a
/// signal death carries the terminating signal number.
pub fn decode_exit_status(status: &std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), status.signal())
}
