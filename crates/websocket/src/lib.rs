//! WebSocket transport for the session protocol.
//!
//! One socket is one [`orchestrator::Connection`]. Text frames are handed to
//! the [`orchestrator::SessionRegistry`]; everything queued for the
//! connection is written back as JSON, interleaved with heartbeats.

mod handler;
mod messages;

pub use handler::{ws_handler, WsQuery, WsState};
pub use messages::{encode, heartbeat};
