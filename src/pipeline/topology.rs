//! Queue and exchange layout of the order pipeline.
//!
//! ```text
//!   producer ──► [orders] ──nack/reject──► (orders.dlx) ──► [orders.dead-letter]
//!                   ▲
//!                   └── TTL expiry ── [orders.retry.<id>.<n>]   one per attempt
//! ```

use std::time::Duration;

use tracing::debug;

use crate::broker::{BrokerError, Channel, ExchangeKind, QueueOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNames {
    pub order_queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub retry_exchange: String,
    pub retry_queue: String,
}

impl Default for TopologyNames {
    fn default() -> Self {
        Self {
            order_queue: "orders".into(),
            dead_letter_exchange: "orders.dlx".into(),
            dead_letter_queue: "orders.dead-letter".into(),
            retry_exchange: "orders.retry".into(),
            retry_queue: "orders.retry.wait".into(),
        }
    }
}

impl TopologyNames {
    /// Prefix shared by every per-attempt delay queue.
    pub fn delay_queue_prefix(&self) -> String {
        format!("{}.retry.", self.order_queue)
    }

    /// Name of the delay queue for one retry attempt of one message.
    pub fn delay_queue(&self, message_id: &str, retry_count: u32) -> String {
        format!("{}{}.{}", self.delay_queue_prefix(), message_id, retry_count)
    }

    /// Options of a delay queue: expire messages after `delay` back into the
    /// order queue and drop the queue itself `grace` after that.
    pub fn delay_queue_options(&self, delay: Duration, grace: Duration) -> QueueOptions {
        QueueOptions::durable()
            .dead_letter_to("")
            .dead_letter_routing_key(self.order_queue.clone())
            .message_ttl(delay)
            .expires(delay + grace)
    }
}

/// Declare every durable queue, exchange and binding. Idempotent.
pub fn assert_topology(channel: &dyn Channel, names: &TopologyNames) -> Result<(), BrokerError> {
    channel.declare_exchange(&names.dead_letter_exchange, ExchangeKind::Direct, true)?;
    channel.declare_queue(&names.dead_letter_queue, &QueueOptions::durable())?;
    channel.bind_queue(
        &names.dead_letter_queue,
        &names.dead_letter_exchange,
        &names.order_queue,
    )?;

    channel.declare_queue(
        &names.order_queue,
        &QueueOptions::durable().dead_letter_to(names.dead_letter_exchange.clone()),
    )?;

    channel.declare_exchange(&names.retry_exchange, ExchangeKind::Direct, true)?;
    channel.declare_queue(
        &names.retry_queue,
        &QueueOptions::durable()
            .dead_letter_to("")
            .dead_letter_routing_key(names.order_queue.clone()),
    )?;
    channel.bind_queue(&names.retry_queue, &names.retry_exchange, &names.order_queue)?;

    debug!(
        order_queue = %names.order_queue,
        dead_letter_queue = %names.dead_letter_queue,
        retry_queue = %names.retry_queue,
        "Topology asserted"
    );
    Ok(())
}
