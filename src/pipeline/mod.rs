//! Pipeline - order queue producer, consumers and retry scheduling.
//!
//! ```text
//! checkout ──send_order──► [orders] ──► OrderConsumer ──► OrderHandler
//!                             ▲              │ failure
//!                             │              ├─ retry_count < max ─► delay queue (TTL) ─┐
//!                             └──────────────┼──────────────────────────────────────────┘
//!                                            └─ retry_count = max ─► (orders.dlx)
//!                                                                        │
//!                                            DeadLetterConsumer ◄── [orders.dead-letter]
//! ```
//!
//! Every publish carries `x-retry-count`; dead-letter publishes also carry
//! `x-failed-reason`. Retry counting uses the header of the current delivery.

mod consumer;
mod dead_letter;
mod error;
mod message;
mod producer;
mod retry;
mod topology;
mod worker;

pub use consumer::{process_delivery, OrderConsumer};
pub use dead_letter::{process_dead_letter, DeadLetterConsumer};
pub use error::PipelineError;
pub use message::{MessageMetadata, OrderMessage, FAILED_REASON_HEADER, RETRY_COUNT_HEADER};
pub use producer::{OrderProducer, RetryDisposition, REASON_MAX_RETRIES, REASON_RETRY_FAILED};
pub use retry::RetryPolicy;
pub use topology::{assert_topology, TopologyNames};
pub use worker::{ConsumerStats, ConsumerThread, Disposition};
