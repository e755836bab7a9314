use shared::{domain::TitleError, error::ErrorCode};
use thiserror::Error;

/// Failure of a REST call. Every variant is treated by the board as a
/// rollback trigger.
#[derive(Debug, Error)]
pub enum ApiFailure {
    #[error("unauthorized: session expired")]
    Unauthorized,
    #[error("server returned {status}: {message}")]
    Status {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("{0}")]
    Rejected(String),
}

impl ApiFailure {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiFailure::Unauthorized)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to connect push channel: {0}")]
    Connect(String),
}

/// Rejected board command. Nothing was applied to the board.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error(transparent)]
    InvalidTitle(#[from] TitleError),
    #[error("board is closed")]
    Closed,
}
