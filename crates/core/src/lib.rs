//! Domain types shared by the session/run coordination crates.
//!
//! Everything here is plain data: identifiers, run and session state, the
//! transcript item union, approval decisions and the client command set.

pub mod domain;
mod error;
pub mod protocol;

pub use domain::*;
pub use error::CoreError;
pub use protocol::{ClientCommand, ClientFrame, ErrorCode, PROTOCOL_VERSION};
