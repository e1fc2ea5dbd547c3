//! Error types for queue consumers

use thiserror::Error;

/// Failure of the ack/requeue call itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("Broker error: {0}")]
    Broker(String),
}

/// Failure while applying a batch to a derived store
#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Projection panicked: {0}")]
    Panicked(String),
}

/// Failure to receive from the broker
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Receive failed: {0}")]
    Receive(String),
}
