//! Broker client - transport abstractions and connection management.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ConnectionManager (one per process)            │
//! │  - connect() / channel() / connection_lost() / close()      │
//! │  - reconnect thread, ConnectionEvent subscribers            │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │         Connector → Connection → Channel → Consumer         │
//! │  declare / bind / publish / consume / ack / nack / close    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                               │
//!          ▼                               ▼
//! ┌─────────────────┐            ┌─────────────────────────────┐
//! │ InMemoryBroker  │            │ AMQP client adapter         │
//! │   (included)    │            │ (external)                  │
//! └─────────────────┘            └─────────────────────────────┘
//! ```

mod connection;
mod error;
mod memory;
mod message;
mod transport;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionOptions};
pub use error::BrokerError;
pub use memory::InMemoryBroker;
pub use message::{Delivery, HeaderValue, Headers, Properties, PublishedMessage};
pub use transport::{
    Channel, CloseHandler, Connection, Connector, Consumer, ExchangeKind, QueueOptions,
};
