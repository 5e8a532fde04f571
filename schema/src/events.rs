//! Event system for the muster supervisor
//!
//! This module defines the event types emitted while a process group runs:
//! lifecycle transitions, per-worker exits, signal routing decisions and
//! grace-period escalations.
//!
//! Events are designed to be serializable and can be:
//! - Logged to structured log files
//! - Sent to monitoring systems
//! - Broadcast to multiple subscribers via event channels

use crate::Rank;
use crate::worker::WorkerExit;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Events emitted by a process group and its signal router
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum GroupEvent {
    /// All ranks of a group have been spawned
    GroupStarted {
        /// Group name
        group: String,
        /// Process ID per rank
        pids: BTreeMap<Rank, u32>,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// One worker has reached a terminal OS state
    WorkerExited {
        /// Group name
        group: String,
        /// Rank of the worker
        rank: Rank,
        /// Exit information
        exit: WorkerExit,
    },

    /// A teardown sequence has begun
    ShutdownRequested {
        /// Group name
        group: String,
        /// Signal sent to every live child
        signal: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A received signal was forwarded to every live child
    SignalForwarded {
        /// Group name
        group: String,
        /// Name of the forwarded signal
        signal: String,
        /// Process IDs the signal was delivered to
        pids: Vec<u32>,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// The grace period elapsed with ranks still alive
    GraceExpired {
        /// Group name
        group: String,
        /// Ranks that were force-killed
        killed: Vec<Rank>,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// The router attributed a secondary signal to a rank and recorded a
    /// failure for it
    RankFailureInjected {
        /// Group name
        group: String,
        /// Rank the failure was recorded for
        rank: Rank,
        /// Process ID that raised the signal
        origin_pid: u32,
        /// Name of the signal
        signal: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// Every rank has been reaped and the final result is cached
    GroupTerminated {
        /// Group name
        group: String,
        /// Whether any rank failed
        failed: bool,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },
}

/// Event severity level for filtering and alerting
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "camelCase")]
pub enum EventSeverity {
    /// Debug information
    Debug,
    /// Informational events
    Info,
    /// Warning conditions
    Warning,
    /// Error conditions
    Error,
}

impl GroupEvent {
    /// Get the group name for this event
    #[must_use]
    pub fn group(&self) -> &str {
        match self {
            Self::GroupStarted { group, .. }
            | Self::WorkerExited { group, .. }
            | Self::ShutdownRequested { group, .. }
            | Self::SignalForwarded { group, .. }
            | Self::GraceExpired { group, .. }
            | Self::RankFailureInjected { group, .. }
            | Self::GroupTerminated { group, .. } => group,
        }
    }

    /// Get the timestamp for this event
    #[must_use]
    pub fn timestamp(&self) -> &str {
        match self {
            Self::WorkerExited { exit, .. } => &exit.timestamp,
            Self::GroupStarted { timestamp, .. }
            | Self::ShutdownRequested { timestamp, .. }
            | Self::SignalForwarded { timestamp, .. }
            | Self::GraceExpired { timestamp, .. }
            | Self::RankFailureInjected { timestamp, .. }
            | Self::GroupTerminated { timestamp, .. } => timestamp,
        }
    }

    /// Get the severity level for this event
    #[must_use]
    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::GroupStarted { .. } | Self::ShutdownRequested { .. } => EventSeverity::Info,
            Self::SignalForwarded { .. } => EventSeverity::Debug,
            Self::WorkerExited { exit, .. } => {
                if exit.is_success() {
                    EventSeverity::Info
                } else {
                    EventSeverity::Warning
                }
            }
            Self::GraceExpired { .. } => EventSeverity::Warning,
            Self::RankFailureInjected { .. } => EventSeverity::Error,
            Self::GroupTerminated { failed, .. } => {
                if *failed {
                    EventSeverity::Warning
                } else {
                    EventSeverity::Info
                }
            }
        }
    }

    /// Create a current timestamp string in RFC3339 format
    #[must_use]
    pub fn current_timestamp() -> String {
        humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
    }

    /// Create a group started event
    #[must_use]
    pub fn group_started(group: String, pids: BTreeMap<Rank, u32>) -> Self {
        Self::GroupStarted {
            group,
            pids,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a worker exited event
    #[must_use]
    pub fn worker_exited(group: String, rank: Rank, exit: WorkerExit) -> Self {
        Self::WorkerExited { group, rank, exit }
    }

    /// Create a shutdown requested event
    #[must_use]
    pub fn shutdown_requested(group: String, signal: String) -> Self {
        Self::ShutdownRequested {
            group,
            signal,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a signal forwarded event
    #[must_use]
    pub fn signal_forwarded(group: String, signal: String, pids: Vec<u32>) -> Self {
        Self::SignalForwarded {
            group,
            signal,
            pids,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a grace expired event
    #[must_use]
    pub fn grace_expired(group: String, killed: Vec<Rank>) -> Self {
        Self::GraceExpired {
            group,
            killed,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a rank failure injected event
    #[must_use]
    pub fn rank_failure_injected(
        group: String,
        rank: Rank,
        origin_pid: u32,
        signal: String,
    ) -> Self {
        Self::RankFailureInjected {
            group,
            rank,
            origin_pid,
            signal,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a group terminated event
    #[must_use]
    pub fn group_terminated(group: String, failed: bool) -> Self {
        Self::GroupTerminated {
            group,
            failed,
            timestamp: Self::current_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = GroupEvent::group_started("trainers".to_string(), BTreeMap::new());
        assert_eq!(event.group(), "trainers");
        assert!(!event.timestamp().is_empty());
        assert_eq!(event.severity(), EventSeverity::Info);
    }

    #[test]
    fn test_worker_exited_severity_tracks_outcome() {
        let ok = GroupEvent::worker_exited("g".into(), 0, WorkerExit::with_code(10, 0));
        assert_eq!(ok.severity(), EventSeverity::Info);

        let crashed = GroupEvent::worker_exited("g".into(), 0, WorkerExit::with_signal(10, 11));
        assert_eq!(crashed.severity(), EventSeverity::Warning);
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = GroupEvent::group_terminated("g".to_string(), true);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"eventType\":\"groupTerminated\""));
        assert!(json.contains("\"failed\":true"));
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let ts = GroupEvent::current_timestamp();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }
}
