//! Reliable order processing over a message broker.
//!
//! Checkout submissions are queued by [`OrderProducer`], consumed one at a
//! time by [`OrderConsumer`] and handed to an [`OrderHandler`] (normally
//! [`OrderService`]). Failures are redelivered through per-attempt delay
//! queues and, once retries run out, routed to the dead-letter queue where
//! [`DeadLetterConsumer`] notifies an operator and the customer.
//!
//! [`OrderService`] applies each order inside one store [`Session`]: stock,
//! seller balances, the order itself and the buyer's cart change together
//! or not at all.

pub mod broker;
pub mod config;
pub mod logger;
pub mod notify;
pub mod orders;
pub mod pipeline;
pub mod store;

pub use broker::{ConnectionEvent, ConnectionManager, ConnectionOptions, InMemoryBroker};
pub use config::Config;
pub use notify::{LogMailer, Mailer, SignedLinkGenerator};
pub use orders::{OrderData, OrderHandler, OrderService, ProcessError, ProcessOutcome};
pub use pipeline::{
    ConsumerStats, DeadLetterConsumer, OrderConsumer, OrderMessage, OrderProducer, PipelineError,
    RetryPolicy, TopologyNames,
};
pub use store::{DocumentStore, InMemoryStore, Session, StoreError};
