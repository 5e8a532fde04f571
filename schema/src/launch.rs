//! Launcher-facing configuration surface

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable through which the list of handled signals is
/// communicated to spawned workers.
pub const SIGNALS_TO_HANDLE_ENV: &str = "MUSTER_SIGNALS_TO_HANDLE";

/// Default comma-separated list of signals the supervisor handles.
pub const DEFAULT_SIGNALS_TO_HANDLE: &str = "SIGTERM,SIGINT,SIGHUP,SIGQUIT";

/// Environment variable carrying a worker's rank within its local group.
pub const LOCAL_RANK_ENV: &str = "LOCAL_RANK";

/// Configuration consumed from the launcher.
///
/// Defaults match the supervisor's built-in behavior: a 30 second grace
/// period, signal forwarding enabled and no secondary user-signal handler.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchOptions {
    /// Comma-separated signal names the parent should handle
    #[serde(default = "default_signals_to_handle")]
    pub signals_to_handle: String,

    /// Seconds to wait after the termination signal before escalating to a
    /// forced kill. Zero escalates immediately; negative values are rejected
    /// by validation.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: f64,

    /// Whether the secondary user signal (SIGUSR1) is treated as a targeted
    /// worker-failure event
    #[serde(default)]
    pub handle_secondary_signal: bool,

    /// Whether signals received by the parent are forwarded to every live
    /// child before the parent's own shutdown begins
    #[serde(default = "default_forward_signals")]
    pub forward_signals: bool,

    /// Directory for per-rank stdout/stderr files; workers inherit the
    /// parent's stdio when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            signals_to_handle: default_signals_to_handle(),
            grace_period_secs: default_grace_period_secs(),
            handle_secondary_signal: false,
            forward_signals: default_forward_signals(),
            log_dir: None,
        }
    }
}

fn default_signals_to_handle() -> String {
    DEFAULT_SIGNALS_TO_HANDLE.to_string()
}

const fn default_grace_period_secs() -> f64 {
    30.0
}

const fn default_forward_signals() -> bool {
    true
}
