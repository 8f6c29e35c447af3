//! Bus error types.

use thiserror::Error;

/// Bus error type.
#[derive(Debug, Error)]
pub enum BusError {
    /// Initial connection failed.
    #[error("connect error: {0}")]
    Connect(#[from] async_nats::ConnectError),

    /// Core publish failed.
    #[error("publish error: {0}")]
    Publish(#[from] async_nats::PublishError),

    /// Subscription setup failed.
    #[error("subscribe error: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),

    /// Durable stream publish or acknowledgement failed.
    #[error("stream publish error: {0}")]
    Stream(String),

    /// Publish refused: empty token or wildcard in the subject.
    #[error("invalid publish subject: {0}")]
    InvalidSubject(String),

    /// The client is not connected; publishes fail fast while reconnecting.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
