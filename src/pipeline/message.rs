use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orders::OrderData;

/// Attempt count of the current delivery. Set on every publish.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Why a message was dead-lettered.
pub const FAILED_REASON_HEADER: &str = "x-failed-reason";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub retry_count: u32,
    pub original_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub last_retry_timestamp: Option<DateTime<Utc>>,
}

/// The unit of work on the order queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMessage {
    pub id: String,
    pub data: OrderData,
    pub metadata: MessageMetadata,
}

impl OrderMessage {
    /// Wrap checkout data with a fresh id and zeroed metadata.
    pub fn new(data: OrderData) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data,
            metadata: MessageMetadata {
                retry_count: 0,
                original_timestamp: Utc::now(),
                last_retry_timestamp: None,
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
