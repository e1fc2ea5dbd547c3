//! Error types for changerelay core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Change feed error: {0}")]
    Feed(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn handler(msg: impl Into<String>) -> Self {
        RelayError::Handler(msg.into())
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}
