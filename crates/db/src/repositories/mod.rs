mod event_repository;
mod session_repository;

pub use event_repository::*;
pub use session_repository::*;
