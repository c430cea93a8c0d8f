//! Redelivery through per-attempt delay queues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use order_pipeline::broker::{BrokerError, Properties};
use order_pipeline::notify::{LogMailer, SignedLinkGenerator};
use order_pipeline::orders::{CartLine, Order, OrderData, OrderService, Product, StoreAccount};
use order_pipeline::pipeline::{
    ConsumerThread, Disposition, OrderConsumer, OrderMessage, PipelineError, RETRY_COUNT_HEADER,
};
use order_pipeline::store::InMemoryStore;

use crate::support::{delays, settle, wait_until, Accept, Flaky, Harness, POLL};

fn checkout() -> OrderData {
    OrderData::new("buyer-1", "buyer@example.com")
        .with_item(CartLine::physical("mug", 1))
        .with_payment("pay_1", "card", "paid")
}

// ============================================================================
// Test 1: success on the first attempt
// ============================================================================

#[test]
fn first_attempt_success_needs_no_retry() {
    let h = Harness::new();
    let (handler, calls) = Flaky::new(Accept, 0);
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();

    h.producer.send_order(checkout()).unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));
    settle();

    let stats = consumer.stop();
    assert_eq!(stats.acked, 1);
    assert_eq!(h.retry_publishes(), 0);
    assert_eq!(h.dead_letter_publishes(), 0);
    assert_eq!(h.broker.queue_depth("orders"), Some(0));
}

// ============================================================================
// Scenario C: two transient failures, success on the third attempt
// ============================================================================

#[test]
fn transient_failures_retry_then_persist() {
    let h = Harness::new();
    let store = InMemoryStore::new();
    store.put(&StoreAccount::new("kiln", "Kiln & Co", "kiln@example.com")).unwrap();
    store.put(&Product::new("mug", "kiln", "Mug", 1_400, 5)).unwrap();
    let service = OrderService::new(
        store.clone(),
        LogMailer::new(),
        SignedLinkGenerator::new("https://dl.example.com", "k", chrono::Duration::hours(1)),
    );
    let (handler, calls) = Flaky::new(service, 2);
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();

    let id = h.producer.send_order(checkout()).unwrap();

    assert!(wait_until(|| store.count("orders") == 1));
    settle();
    let stats = consumer.stop();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.acked, 1);
    assert_eq!(h.retry_publishes(), 2);
    assert_eq!(h.dead_letter_publishes(), 0);

    let orders = store.find::<Order>(&|_| true).unwrap();
    assert_eq!(orders[0].source_message_id, id);

    // Each retry carries a higher count and a delay from the backoff table.
    let retries = h.broker.published_with_key_prefix("orders.retry.");
    for (i, published) in retries.iter().enumerate() {
        let attempt = i as u32 + 1;
        assert_eq!(published.routing_key, format!("orders.retry.{}.{}", id, attempt));
        assert_eq!(published.header_i64(RETRY_COUNT_HEADER), Some(i64::from(attempt)));
        let body = OrderMessage::from_bytes(&published.body).unwrap();
        assert_eq!(body.metadata.retry_count, attempt);
        assert!(body.metadata.last_retry_timestamp.is_some());

        let options = h.broker.queue_options(&published.routing_key).unwrap();
        assert_eq!(options.message_ttl, Some(delays()[i]));
    }
}

// ============================================================================
// Scenario D (retry side): every attempt fails
// ============================================================================

#[test]
fn persistent_failure_is_dead_lettered_once_at_max() {
    let h = Harness::new();
    let (handler, calls) = Flaky::always_failing();
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();

    h.producer.send_order(checkout()).unwrap();

    assert!(wait_until(|| h.dead_letter_publishes() == 1));
    settle();
    let stats = consumer.stop();

    // Initial attempt plus three retries.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.retry_publishes(), 3);
    assert_eq!(stats.retried, 3);
    assert_eq!(stats.dead_lettered, 1);

    let dead = h.broker.published_to_exchange("orders.dlx");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].header_i64(RETRY_COUNT_HEADER), Some(3));
    assert_eq!(h.broker.queue_depth("orders.dead-letter"), Some(1));
    assert_eq!(h.broker.queue_depth("orders"), Some(0));
}

// ============================================================================
// Test 4: corrupt messages are rejected, not retried
// ============================================================================

#[test]
fn corrupt_message_is_rejected() {
    let h = Harness::new();
    let (handler, calls) = Flaky::new(Accept, 0);
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();

    h.broker
        .inject("", "orders", b"{\"id\":", Properties::new())
        .unwrap();

    assert!(wait_until(|| h.broker.queue_depth("orders.dead-letter") == Some(1)));
    let stats = consumer.stop();

    assert_eq!(stats.rejected, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.retry_publishes(), 0);
    assert_eq!(h.dead_letter_publishes(), 0);
}

// ============================================================================
// Test 5: unusable delay queue escalates straight to the dead-letter queue
// ============================================================================

#[test]
fn retry_scheduling_failure_escalates() {
    let h = Harness::new();
    let (handler, _calls) = Flaky::always_failing();
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();
    h.broker.fail_declares_with_prefix("orders.retry.");

    h.producer.send_order(checkout()).unwrap();

    assert!(wait_until(|| h.dead_letter_publishes() == 1));
    let stats = consumer.stop();

    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(h.retry_publishes(), 0);
    let dead = h.broker.published_to_exchange("orders.dlx");
    assert_eq!(dead[0].header_str("x-failed-reason"), Some("retry-scheduling-failed"));
}

// ============================================================================
// Test 6: a failed hand-off requeues the delivery instead of stalling
// ============================================================================

#[test]
fn failed_hand_off_does_not_stall_consumer() {
    let h = Harness::new();
    let (handler, calls) = Flaky::new(Accept, 1);
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();
    h.broker.fail_declares_with_prefix("orders.retry.");
    h.broker.fail_publishes_to(Some("orders.dlx"));

    h.producer.send_order(checkout()).unwrap();
    h.producer.send_order(checkout()).unwrap();

    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 3));
    settle();
    let stats = consumer.stop();

    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.acked, 2);
    assert_eq!(stats.errors, 0);
    assert_eq!(h.broker.queue_depth("orders"), Some(0));
    assert_eq!(h.broker.unacked_count(), 0);
    assert_eq!(h.dead_letter_publishes(), 0);
}

// ============================================================================
// Test 7: a handler error hands the delivery back to the queue
// ============================================================================

#[test]
fn handler_error_returns_delivery_to_queue() {
    let h = Harness::new();
    h.producer.start().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let worker = ConsumerThread::spawn(
        "settling-worker",
        Arc::clone(&h.manager),
        "orders",
        POLL,
        move |channel, delivery| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(PipelineError::Broker(BrokerError::UnknownDeliveryTag(
                    delivery.delivery_tag,
                )));
            }
            channel.ack(delivery.delivery_tag)?;
            Ok(Disposition::Acked)
        },
    )
    .unwrap();

    h.producer.send_order(checkout()).unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 2));
    settle();
    let stats = worker.stop();

    assert_eq!(stats.errors, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(h.broker.unacked_count(), 0);
    assert_eq!(h.broker.queue_depth("orders"), Some(0));
}
