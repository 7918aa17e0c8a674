mod event;
mod session;

pub use event::EventRow;
pub use session::SessionRow;
