//! Low-level process primitives for worker management
//!
//! This module provides the platform-specific plumbing used by process
//! groups: spawning workers into their own Unix process group, delivering
//! signals to a single process or a whole group, and decoding exit statuses.
//!
//! ## Safety
//!
//! Spawned workers are made session leaders via `setsid()`, so signaling the
//! worker's process group reliably reaches any grandchildren it forked.

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;
