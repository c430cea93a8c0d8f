//! Transport traits: the slice of AMQP 0-9-1 the pipeline relies on.

use std::sync::Arc;
use std::time::Duration;

use super::error::BrokerError;
use super::message::{Delivery, Properties};

/// Exchange routing behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route to queues bound with exactly the publish routing key.
    Direct,
    /// Route to every bound queue.
    Fanout,
}

/// Queue declaration arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// `x-dead-letter-exchange` (empty string is the default exchange).
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
    /// `x-message-ttl`
    pub message_ttl: Option<Duration>,
    /// `x-expires`: delete the queue after it has been unused this long.
    pub expires: Option<Duration>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn dead_letter_to(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn dead_letter_routing_key(mut self, key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(key.into());
        self
    }

    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn expires(mut self, after: Duration) -> Self {
        self.expires = Some(after);
        self
    }
}

/// Invoked once when a connection closes without `close()` being called.
pub type CloseHandler = Box<dyn Fn(String) + Send + Sync>;

/// Opens connections to a broker.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Box<dyn Connection>, BrokerError>;
}

/// A live broker connection.
pub trait Connection: Send + Sync {
    fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Register the handler for unexpected closes. Replaces any previous one.
    fn on_close(&self, handler: CloseHandler);

    fn is_open(&self) -> bool;

    fn close(&self) -> Result<(), BrokerError>;
}

/// A channel multiplexed over a connection.
pub trait Channel: Send + Sync {
    /// False once the channel or its connection has closed. A broker may
    /// close a channel on its own after a channel-level error.
    fn is_open(&self) -> bool;

    /// Maximum unacknowledged deliveries per consumer on this channel (0 = unlimited).
    fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError>;

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    /// Publish a message. `Ok(false)` means the write buffer is full and the
    /// caller should `wait_for_drain` before publishing more.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &Properties,
    ) -> Result<bool, BrokerError>;

    /// Block until the write buffer has drained or the timeout elapses.
    fn wait_for_drain(&self, timeout: Duration) -> Result<(), BrokerError>;

    /// Start a manual-ack consumer on a queue.
    fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn Consumer>, BrokerError>;

    fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    fn close(&self) -> Result<(), BrokerError>;
}

/// Pull side of a consumer subscription.
pub trait Consumer: Send {
    fn tag(&self) -> &str;

    /// Wait for the next delivery, or `None` when the timeout elapses.
    fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;
}
