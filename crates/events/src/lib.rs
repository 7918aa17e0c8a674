//! Event log for agent sessions.
//!
//! This crate provides the server-authored event types, the append-only
//! [`EventLog`] contract with bounded replay, the snapshot reducer that keeps
//! a point-in-time view alongside the log, and an in-memory implementation.

mod log;
mod memory;
mod snapshot;
mod types;

pub use log::{check_replay_range, EventLog, LogConfig, LogError, ReplayStream, SessionMeta};
pub use memory::MemoryEventLog;
pub use snapshot::SessionSnapshot;
pub use types::*;
