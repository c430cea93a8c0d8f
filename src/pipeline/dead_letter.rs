//! DeadLetterConsumer - terminal path for orders that exhausted their retries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use super::error::PipelineError;
use super::message::{OrderMessage, FAILED_REASON_HEADER, RETRY_COUNT_HEADER};
use super::worker::{ConsumerStats, ConsumerThread, Disposition};
use crate::broker::{Channel, ConnectionManager, Delivery};
use crate::notify::{Email, Mailer};

/// Log, notify operator and customer, then ack. Any failure nacks without requeue.
pub fn process_dead_letter<M>(
    channel: &dyn Channel,
    mailer: &M,
    operator_email: &str,
    delivery: &Delivery,
) -> Result<Disposition, PipelineError>
where
    M: Mailer + ?Sized,
{
    match notify(mailer, operator_email, delivery) {
        Ok(()) => {
            channel.ack(delivery.delivery_tag)?;
            Ok(Disposition::Acked)
        }
        Err(err) => {
            warn!(
                delivery_tag = delivery.delivery_tag,
                error = %err,
                "Dead letter could not be handled, discarding"
            );
            channel.nack(delivery.delivery_tag, false)?;
            Ok(Disposition::Rejected)
        }
    }
}

fn notify<M>(mailer: &M, operator_email: &str, delivery: &Delivery) -> Result<(), PipelineError>
where
    M: Mailer + ?Sized,
{
    let message = OrderMessage::from_bytes(&delivery.body)?;
    let retry_count = delivery
        .header_i64(RETRY_COUNT_HEADER)
        .unwrap_or(i64::from(message.metadata.retry_count));
    let reason = delivery
        .properties
        .header(FAILED_REASON_HEADER)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let data = serde_json::to_string_pretty(&message.data)?;
    let last_retry = message
        .metadata
        .last_retry_timestamp
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".into());

    error!(
        order_id = %message.id,
        retry_count,
        reason,
        original_timestamp = %message.metadata.original_timestamp.to_rfc3339(),
        last_retry_timestamp = %last_retry,
        data = %data,
        "Order permanently failed"
    );

    let operator = Email::new(
        operator_email,
        format!("Order {} failed after {} retries", message.id, retry_count),
        format!(
            "Order message {id} was dead-lettered ({reason}).\n\n\
             Buyer: {buyer} <{email}>\n\
             Payment reference: {reference}\n\
             Retry count: {retry_count}\n\
             First submitted: {original}\n\
             Last retry: {last_retry}\n\n\
             Resubmit the order data below to reprocess it:\n\n{data}\n",
            id = message.id,
            reason = reason,
            buyer = message.data.buyer_id,
            email = message.data.buyer_email,
            reference = message.data.payment_reference,
            retry_count = retry_count,
            original = message.metadata.original_timestamp.to_rfc3339(),
            last_retry = last_retry,
            data = data,
        ),
    );
    mailer.send_email(&operator)?;

    let customer = Email::new(
        message.data.buyer_email.as_str(),
        "We could not complete your order",
        format!(
            "We're sorry, something went wrong while completing your order \
             (payment reference {}). Our team has been notified.",
            message.data.payment_reference
        ),
    );
    mailer.send_email(&customer)?;
    Ok(())
}

/// Consumes the dead-letter queue on a background thread.
pub struct DeadLetterConsumer {
    thread: ConsumerThread,
}

impl DeadLetterConsumer {
    pub const NAME: &'static str = "dead-letter-consumer";

    pub fn start<M>(
        manager: Arc<ConnectionManager>,
        queue: &str,
        mailer: M,
        operator_email: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self, PipelineError>
    where
        M: Mailer + 'static,
    {
        let operator_email = operator_email.into();
        let thread = ConsumerThread::spawn(
            Self::NAME,
            manager,
            queue,
            poll_interval,
            move |channel, delivery| process_dead_letter(channel, &mailer, &operator_email, delivery),
        )?;
        Ok(Self { thread })
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    pub fn stop(self) -> ConsumerStats {
        self.thread.stop()
    }
}
