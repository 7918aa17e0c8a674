mod error;
mod event_log;
pub mod models;
mod pool;
pub mod repositories;

pub use error::*;
pub use event_log::SqliteEventLog;
pub use models::{EventRow, SessionRow};
pub use pool::*;
pub use repositories::*;
