use thiserror::Error;

use crate::broker::BrokerError;
use crate::notify::NotifyError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("message encoding: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("failed to spawn {name}: {reason}")]
    Spawn { name: String, reason: String },
}

impl PipelineError {
    /// The broker connection itself failed.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, PipelineError::Broker(e) if e.is_connectivity())
    }
}
