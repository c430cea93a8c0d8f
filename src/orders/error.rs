use thiserror::Error;

use crate::notify::{LinkError, NotifyError};
use crate::store::StoreError;

/// Why processing an order failed. Every variant aborts the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("digital product {0} has no storage key")]
    MissingStorageKey(String),
    #[error("product {product_id} has no variant {size}")]
    VariantNotFound { product_id: String, size: String },
    #[error("line for {0} has zero quantity")]
    InvalidQuantity(String),
    #[error("amount overflow in {0}")]
    AmountOverflow(String),
    #[error("order has no items")]
    EmptyOrder,
    #[error("download link: {0}")]
    DownloadLink(#[from] LinkError),
    #[error("notification: {0}")]
    Notification(#[from] NotifyError),
    #[error("{0}")]
    Other(String),
}
