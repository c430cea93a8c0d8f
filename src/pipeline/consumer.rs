//! OrderConsumer - drives order messages through the order handler.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::error::PipelineError;
use super::message::{OrderMessage, RETRY_COUNT_HEADER};
use super::producer::{OrderProducer, RetryDisposition};
use super::worker::{ConsumerStats, ConsumerThread, Disposition};
use crate::broker::{Channel, Delivery};
use crate::orders::OrderHandler;

/// Settle one order delivery.
///
/// Success acks. A failure below the retry limit schedules the next attempt
/// and acks the original; at the limit the message is dead-lettered and the
/// original acked. If neither hand-off can be published the original is
/// nacked with requeue, keeping its retry count. An unparseable body is
/// nacked without requeue.
pub fn process_delivery<H>(
    channel: &dyn Channel,
    producer: &OrderProducer,
    handler: &H,
    delivery: &Delivery,
) -> Result<Disposition, PipelineError>
where
    H: OrderHandler + ?Sized,
{
    let mut message = match OrderMessage::from_bytes(&delivery.body) {
        Ok(message) => message,
        Err(err) => {
            error!(
                delivery_tag = delivery.delivery_tag,
                message_id = ?delivery.properties.message_id,
                error = %err,
                "Corrupt order message rejected"
            );
            channel.nack(delivery.delivery_tag, false)?;
            return Ok(Disposition::Rejected);
        }
    };

    let retry_count = delivery
        .header_i64(RETRY_COUNT_HEADER)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(message.metadata.retry_count);

    let err = match handler.process_order(&message.id, &message.data) {
        Ok(outcome) => {
            channel.ack(delivery.delivery_tag)?;
            info!(
                message_id = %message.id,
                order_id = %outcome.order_id,
                retry_count,
                duplicate = outcome.duplicate,
                "Order processed"
            );
            return Ok(Disposition::Acked);
        }
        Err(err) => err,
    };

    warn!(
        message_id = %message.id,
        retry_count,
        redelivered = delivery.redelivered,
        error = %err,
        "Order processing failed"
    );

    let handed_off = if producer.policy().should_retry(retry_count) {
        let next = retry_count + 1;
        producer
            .send_to_retry_queue(&message, next)
            .map(|scheduled| match scheduled {
                RetryDisposition::Scheduled { .. } => Disposition::Retried { retry_count: next },
                RetryDisposition::Escalated => Disposition::DeadLettered,
            })
    } else {
        message.metadata.retry_count = retry_count;
        producer
            .send_to_dead_letter_queue(&message)
            .map(|()| Disposition::DeadLettered)
    };

    match handed_off {
        Ok(disposition) => {
            channel.ack(delivery.delivery_tag)?;
            Ok(disposition)
        }
        Err(err) => {
            error!(
                message_id = %message.id,
                retry_count,
                error = %err,
                "Failed order could not be handed off, requeueing"
            );
            channel.nack(delivery.delivery_tag, true)?;
            Ok(Disposition::Requeued)
        }
    }
}

/// Consumes the order queue on a background thread.
pub struct OrderConsumer {
    thread: ConsumerThread,
}

impl OrderConsumer {
    pub const NAME: &'static str = "order-consumer";

    /// Assert the topology, subscribe to the order queue and start consuming.
    pub fn start<H>(
        producer: Arc<OrderProducer>,
        handler: H,
        poll_interval: Duration,
    ) -> Result<Self, PipelineError>
    where
        H: OrderHandler + 'static,
    {
        producer.start()?;
        let manager = Arc::clone(producer.manager());
        let queue = producer.names().order_queue.clone();

        let thread = ConsumerThread::spawn(
            Self::NAME,
            manager,
            &queue,
            poll_interval,
            move |channel, delivery| process_delivery(channel, &producer, &handler, delivery),
        )?;
        Ok(Self { thread })
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    /// Stop consuming. No resubscribe happens after this.
    pub fn stop(self) -> ConsumerStats {
        self.thread.stop()
    }
}
