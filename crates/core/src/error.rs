use thiserror::Error;

use crate::protocol::ErrorCode;

/// Rejections of malformed client input. None of these change state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Bad argument: {0}")]
    BadArgument(String),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidCommand(_) => ErrorCode::InvalidCommand,
            Self::MissingField(_) => ErrorCode::MissingField,
            Self::BadArgument(_) => ErrorCode::BadArgument,
        }
    }
}
