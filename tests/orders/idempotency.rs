//! Redelivered messages must not create a second order.

use std::sync::{Arc, Barrier};
use std::thread;

use order_pipeline::orders::{CartLine, OrderHandler, OrderReference, ProcessError};
use order_pipeline::store::{DocumentStore, StoreError};

use crate::support::{order, Fixture};

#[test]
fn same_payment_reference_is_processed_once() {
    let fx = Fixture::new();
    let data = order(vec![CartLine::physical("mug", 1)]).with_payment("pay_1", "card", "paid");

    let first = fx.service.process_order("msg-1", &data).unwrap();
    let second = fx.service.process_order("msg-1", &data).unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(second.order_id, first.order_id);
    assert_eq!(fx.stock("mug"), 9);
    assert_eq!(fx.store.count("orders"), 1);

    let reference = fx.store.get::<OrderReference>("pay_1").unwrap().unwrap();
    assert_eq!(reference.data.order_id, first.order_id);
    assert_eq!(reference.data.message_id, "msg-1");
}

#[test]
fn empty_reference_skips_the_guard() {
    let fx = Fixture::new();
    let data = order(vec![CartLine::physical("mug", 1)]);

    fx.service.process_order("msg-1", &data).unwrap();
    fx.service.process_order("msg-2", &data).unwrap();

    assert_eq!(fx.store.count("orders"), 2);
    assert_eq!(fx.store.count("order_references"), 0);
}

#[test]
fn racing_duplicates_commit_once() {
    let fx = Arc::new(Fixture::new());
    let data = order(vec![CartLine::physical("mug", 1)]).with_payment("pay_race", "card", "paid");
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let fx = Arc::clone(&fx);
            let data = data.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                fx.service.process_order(&format!("msg-{}", i), &data)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let committed = results
        .iter()
        .filter(|r| matches!(r, Ok(outcome) if !outcome.duplicate))
        .count();
    assert_eq!(committed, 1);
    for result in &results {
        match result {
            Ok(_) => {}
            Err(ProcessError::Store(StoreError::AlreadyExists { .. }))
            | Err(ProcessError::Store(StoreError::ConcurrencyConflict { .. })) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(fx.store.count("orders"), 1);
    assert_eq!(fx.stock("mug"), 9);
}
