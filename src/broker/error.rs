//! Error type for broker operations.

use thiserror::Error;

/// Error type for broker operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The connection (or the channel riding on it) is gone.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// Reconnection was attempted the maximum number of times and gave up.
    #[error("reconnection abandoned after {attempts} attempts")]
    ReconnectAbandoned { attempts: u32 },
    /// The manager was shut down on purpose.
    #[error("broker client is shut down")]
    Shutdown,
    /// A redeclare used different arguments, or another precondition failed.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// The queue or exchange does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Ack/nack of a delivery tag the channel does not know about.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    /// The consumer was cancelled.
    #[error("consumer {0} cancelled")]
    ConsumerCancelled(String),
    /// Encoding a message body failed.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// True for errors that mean the connection needs to be re-established.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionFailed(_) | BrokerError::ConnectionClosed(_)
        )
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}
