//! Schema definitions for Muster
//!
//! This crate contains the shared data structures used across the muster
//! process-group supervisor: per-worker exit records, aggregated run results,
//! group lifecycle states, launch options and supervisor events. All types
//! here implement JSON Schema generation for external consumption.

pub mod events;
pub mod group;
pub mod launch;
pub mod worker;

pub use events::{EventSeverity, GroupEvent};
pub use group::{GroupState, RunResult};
pub use launch::{
    DEFAULT_SIGNALS_TO_HANDLE, LOCAL_RANK_ENV, LaunchOptions, SIGNALS_TO_HANDLE_ENV,
};
pub use worker::{ProcessFailure, WorkerExit};

/// Stable integer identity of one worker within a process group,
/// independent of its OS process identifier.
pub type Rank = u32;
