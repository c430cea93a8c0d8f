//! OrderProducer - publishes new orders, schedules retries, escalates failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::error::PipelineError;
use super::message::{OrderMessage, FAILED_REASON_HEADER, RETRY_COUNT_HEADER};
use super::retry::RetryPolicy;
use super::topology::{assert_topology, TopologyNames};
use crate::broker::{BrokerError, Channel, ConnectionManager, Properties};
use crate::orders::OrderData;

/// Failure reason recorded when retries ran out.
pub const REASON_MAX_RETRIES: &str = "max-retries-exceeded";
/// Failure reason recorded when a retry could not be scheduled.
pub const REASON_RETRY_FAILED: &str = "retry-scheduling-failed";

/// Where a failed message went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Parked in a delay queue; redelivered to the order queue after `delay`.
    Scheduled { queue: String, delay: Duration },
    /// The delay queue was unusable; sent to the dead-letter queue instead.
    Escalated,
}

pub struct OrderProducer {
    manager: Arc<ConnectionManager>,
    names: TopologyNames,
    policy: RetryPolicy,
    drain_timeout: Duration,
}

impl OrderProducer {
    pub fn new(manager: Arc<ConnectionManager>, names: TopologyNames, policy: RetryPolicy) -> Self {
        Self {
            manager,
            names,
            policy,
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn names(&self) -> &TopologyNames {
        &self.names
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Connect and declare the topology. Safe to call on every startup.
    pub fn start(&self) -> Result<(), PipelineError> {
        let result = self
            .manager
            .channel()
            .and_then(|channel| assert_topology(channel.as_ref(), &self.names));
        self.report(result)?;
        info!(queue = %self.names.order_queue, "Order producer ready");
        Ok(())
    }

    /// Enqueue a checkout. Returns the new message id.
    pub fn send_order(&self, data: OrderData) -> Result<String, PipelineError> {
        let message = OrderMessage::new(data);
        let body = message.to_bytes()?;
        let properties = self.properties(&message, message.metadata.retry_count);

        let result = self.manager.channel().and_then(|channel| {
            self.publish(channel.as_ref(), "", &self.names.order_queue, &body, &properties)
        });
        self.report(result)?;

        info!(
            message_id = %message.id,
            buyer_id = %message.data.buyer_id,
            items = message.data.items.len(),
            "Order queued"
        );
        Ok(message.id)
    }

    /// Park `message` in its own delay queue for redelivery attempt `retry_count`.
    ///
    /// If the delay queue cannot be declared or published to, the message
    /// goes straight to the dead-letter queue.
    pub fn send_to_retry_queue(
        &self,
        message: &OrderMessage,
        retry_count: u32,
    ) -> Result<RetryDisposition, PipelineError> {
        let delay = self.policy.delay_for(retry_count);
        let mut message = message.clone();
        message.metadata.retry_count = retry_count;
        message.metadata.last_retry_timestamp = Some(Utc::now());

        let queue = self.names.delay_queue(&message.id, retry_count);
        let options = self
            .names
            .delay_queue_options(delay, self.policy.delay_queue_grace);
        let body = message.to_bytes()?;
        let properties = self.properties(&message, retry_count);

        let result = self.manager.channel().and_then(|channel| {
            channel.declare_queue(&queue, &options)?;
            self.publish(channel.as_ref(), "", &queue, &body, &properties)
        });

        match self.report(result) {
            Ok(()) => {
                info!(
                    message_id = %message.id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    queue = %queue,
                    "Retry scheduled"
                );
                Ok(RetryDisposition::Scheduled { queue, delay })
            }
            Err(err) => {
                warn!(
                    message_id = %message.id,
                    retry_count,
                    error = %err,
                    "Could not schedule retry, escalating to dead-letter queue"
                );
                self.send_to_dead_letter_queue_with_reason(&message, REASON_RETRY_FAILED)?;
                Ok(RetryDisposition::Escalated)
            }
        }
    }

    /// Publish to the dead-letter exchange after retries ran out.
    pub fn send_to_dead_letter_queue(&self, message: &OrderMessage) -> Result<(), PipelineError> {
        self.send_to_dead_letter_queue_with_reason(message, REASON_MAX_RETRIES)
    }

    pub fn send_to_dead_letter_queue_with_reason(
        &self,
        message: &OrderMessage,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let mut message = message.clone();
        message.metadata.last_retry_timestamp = Some(Utc::now());

        let body = message.to_bytes()?;
        let properties = self
            .properties(&message, message.metadata.retry_count)
            .with_header(FAILED_REASON_HEADER, reason);

        let result = self.manager.channel().and_then(|channel| {
            self.publish(
                channel.as_ref(),
                &self.names.dead_letter_exchange,
                &self.names.order_queue,
                &body,
                &properties,
            )
        });
        self.report(result)?;

        error!(
            message_id = %message.id,
            retry_count = message.metadata.retry_count,
            reason,
            "Order sent to dead-letter queue"
        );
        Ok(())
    }

    fn properties(&self, message: &OrderMessage, retry_count: u32) -> Properties {
        Properties::new()
            .with_message_id(message.id.as_str())
            .persistent()
            .with_content_type("application/json")
            .with_header(RETRY_COUNT_HEADER, retry_count)
    }

    /// Publish, waiting for the write buffer to drain when the broker says it is full.
    fn publish(
        &self,
        channel: &dyn Channel,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &Properties,
    ) -> Result<(), BrokerError> {
        if !channel.publish(exchange, routing_key, body, properties)? {
            debug!(exchange, routing_key, "Write buffer full, waiting for drain");
            channel.wait_for_drain(self.drain_timeout)?;
        }
        Ok(())
    }

    fn report<T>(&self, result: Result<T, BrokerError>) -> Result<T, BrokerError> {
        if let Err(err) = &result {
            if err.is_connectivity() {
                self.manager.connection_lost(&err.to_string());
            }
        }
        result
    }
}
