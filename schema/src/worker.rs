//! Per-worker exit records and failure reports

use crate::Rank;
use crate::events::GroupEvent;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Information about how a worker process exited
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerExit {
    /// Process ID of the exited worker
    pub pid: u32,
    /// Exit code if the process exited normally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Signal number if the process was killed by a signal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Timestamp when the exit was observed, in RFC3339 format
    pub timestamp: String,
}

impl WorkerExit {
    /// Create an exit record for a normal exit with the given code
    #[must_use]
    pub fn with_code(pid: u32, code: i32) -> Self {
        Self {
            pid,
            exit_code: Some(code),
            signal: None,
            timestamp: GroupEvent::current_timestamp(),
        }
    }

    /// Create an exit record for a death by signal
    #[must_use]
    pub fn with_signal(pid: u32, signal: i32) -> Self {
        Self {
            pid,
            exit_code: None,
            signal: Some(signal),
            timestamp: GroupEvent::current_timestamp(),
        }
    }

    /// Check if the worker exited successfully (exit code 0)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Check if the worker exited abnormally (non-zero code or signal death)
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Human readable description of the exit
    #[must_use]
    pub fn describe(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(signal)) => format!("killed by signal {signal}"),
            (None, None) => "exited with unknown status".to_string(),
        }
    }
}

/// Immutable record of one worker's abnormal termination.
///
/// Created exactly once per failed rank by whichever component first observes
/// the worker's exit. Death by signal is encoded as a negative `exit_code`
/// (the negated signal number) together with `signal_name`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessFailure {
    /// Rank of the failed worker within its group
    pub rank: Rank,
    /// Process ID associated with the failure
    pub pid: u32,
    /// Exit code; negative values encode death by signal
    pub exit_code: i32,
    /// Name of the signal that killed the worker, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
    /// Timestamp when the failure was recorded, in RFC3339 format
    pub timestamp: String,
    /// Human readable description of what happened
    pub message: String,
}

impl ProcessFailure {
    /// Record a failure caused by a non-zero exit code
    #[must_use]
    pub fn from_code(rank: Rank, pid: u32, exit_code: i32, message: String) -> Self {
        Self {
            rank,
            pid,
            exit_code,
            signal_name: None,
            timestamp: GroupEvent::current_timestamp(),
            message,
        }
    }

    /// Record a failure caused by a signal. The exit code is stored as the
    /// negated signal number.
    #[must_use]
    pub fn from_signal(
        rank: Rank,
        pid: u32,
        signal: i32,
        signal_name: Option<String>,
        message: String,
    ) -> Self {
        Self {
            rank,
            pid,
            exit_code: -signal,
            signal_name,
            timestamp: GroupEvent::current_timestamp(),
            message,
        }
    }

    /// Check whether this failure was caused by a signal
    #[must_use]
    pub fn is_signal_death(&self) -> bool {
        self.exit_code < 0 || self.signal_name.is_some()
    }
}
