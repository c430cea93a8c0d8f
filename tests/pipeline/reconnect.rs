//! Consumers across broker connection loss.

use std::sync::atomic::Ordering;

use order_pipeline::orders::{CartLine, OrderData};
use order_pipeline::pipeline::OrderConsumer;

use crate::support::{settle, wait_until, Accept, Flaky, Harness, POLL};

fn checkout() -> OrderData {
    OrderData::new("buyer-1", "buyer@example.com").with_item(CartLine::physical("mug", 1))
}

// ============================================================================
// Test 1: consumer resubscribes after the broker comes back
// ============================================================================

#[test]
fn consumer_resubscribes_after_reconnect() {
    let h = Harness::new();
    let (handler, calls) = Flaky::new(Accept, 0);
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();
    assert_eq!(h.broker.connects(), 1);

    h.broker.kill_connections("broker restart");
    assert!(wait_until(|| h.manager.is_connected() && h.broker.connects() >= 2));

    h.producer.send_order(checkout()).unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));
    settle();

    let stats = consumer.stop();
    assert!(stats.resubscribes >= 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(h.broker.queue_depth("orders"), Some(0));
}

// ============================================================================
// Test 2: consumer exits once reconnection is abandoned
// ============================================================================

#[test]
fn consumer_exits_when_reconnect_is_abandoned() {
    let h = Harness::with_reconnect_attempts(2);
    let (handler, _calls) = Flaky::new(Accept, 0);
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();

    h.broker.fail_next_connects(100);
    h.broker.kill_connections("broker gone");

    assert!(wait_until(|| !consumer.is_running()));
    let stats = consumer.stop();
    assert_eq!(stats.acked, 0);
    assert!(!h.manager.is_connected());
}

// ============================================================================
// Test 3: a stopped consumer does not come back after reconnect
// ============================================================================

#[test]
fn stopped_consumer_stays_stopped() {
    let h = Harness::new();
    let (handler, calls) = Flaky::new(Accept, 0);
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();
    consumer.stop();

    h.broker.kill_connections("broker restart");
    assert!(wait_until(|| h.manager.is_connected()));

    h.producer.send_order(checkout()).unwrap();
    settle();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.broker.queue_depth("orders"), Some(1));
}

// ============================================================================
// Test 4: a channel closed by the broker is replaced
// ============================================================================

#[test]
fn closed_channel_recovers_without_reconnect() {
    let h = Harness::new();
    let (handler, calls) = Flaky::new(Accept, 0);
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();

    h.manager.channel().unwrap().close().unwrap();

    h.producer.send_order(checkout()).unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));
    settle();

    let stats = consumer.stop();
    assert_eq!(stats.acked, 1);
    assert!(stats.resubscribes >= 1);
    assert_eq!(h.broker.connects(), 1);
    assert!(h.manager.is_connected());
    assert_eq!(h.broker.queue_depth("orders"), Some(0));
}

// ============================================================================
// Test 5: closing the manager closes the channel and connection
// ============================================================================

#[test]
fn graceful_shutdown_closes_connection() {
    let h = Harness::new();
    let (handler, _calls) = Flaky::new(Accept, 0);
    let consumer = OrderConsumer::start(h.producer.clone(), handler, POLL).unwrap();
    assert_eq!(h.broker.open_connections(), 1);

    consumer.stop();
    h.manager.close().unwrap();

    assert_eq!(h.broker.open_connections(), 0);
    assert!(h.producer.send_order(checkout()).is_err());
}
