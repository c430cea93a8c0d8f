//! All-or-nothing behaviour of an order session.

use order_pipeline::orders::{CartLine, Order, OrderHandler, ProcessError};
use order_pipeline::store::StoreError;

use crate::support::{order, Fixture};

// ============================================================================
// Test 1: storage failure at commit leaves everything unchanged
// ============================================================================

#[test]
fn failed_commit_changes_nothing_and_sends_no_notices() {
    let data = order(vec![CartLine::physical("mug", 2), CartLine::physical("bowl", 5)]);
    let fx = Fixture::new().with_cart(&data);
    fx.store.fail_next_commit();

    let err = fx.service.process_order("msg-1", &data).unwrap_err();

    assert!(matches!(err, ProcessError::Store(StoreError::Storage(_))));
    assert_eq!(fx.stock("mug"), 10);
    assert_eq!(fx.balance("kiln"), 0);
    assert_eq!(fx.cart_len("buyer-1"), 2);
    assert_eq!(fx.store.count("orders"), 0);
    // Neither the sold notice nor the shortage notice went out.
    assert!(fx.mailer.sent_to("kiln@example.com").is_empty());

    // The next attempt goes through.
    fx.service.process_order("msg-1", &data).unwrap();
    assert_eq!(fx.stock("mug"), 8);
    assert_eq!(fx.cart_len("buyer-1"), 0);
    assert_eq!(fx.store.count("orders"), 1);
}

// ============================================================================
// Test 2: digital product without a file aborts the order
// ============================================================================

#[test]
fn missing_storage_key_aborts() {
    let data = order(vec![CartLine::physical("mug", 1), CartLine::digital("zine")]);
    let fx = Fixture::new().with_cart(&data);

    let err = fx.service.process_order("msg-1", &data).unwrap_err();

    assert_eq!(err, ProcessError::MissingStorageKey("zine".into()));
    assert_eq!(fx.stock("mug"), 10);
    assert_eq!(fx.cart_len("buyer-1"), 2);
    assert_eq!(fx.store.count("orders"), 0);
}

// ============================================================================
// Test 3: the download email must go out, or the order fails
// ============================================================================

#[test]
fn download_email_failure_aborts() {
    let data = order(vec![CartLine::digital("ebook")]);
    let fx = Fixture::new().with_cart(&data);
    fx.mailer.set_failing(true);

    let err = fx.service.process_order("msg-1", &data).unwrap_err();

    assert!(matches!(err, ProcessError::Notification(_)));
    assert_eq!(fx.balance("press"), 0);
    assert_eq!(fx.cart_len("buyer-1"), 1);
}

// ============================================================================
// Test 4: post-commit notice failures are swallowed
// ============================================================================

#[test]
fn seller_notice_failure_does_not_fail_committed_order() {
    let data = order(vec![CartLine::physical("mug", 1)]);
    let fx = Fixture::new().with_cart(&data);
    fx.mailer.set_failing(true);

    let outcome = fx.service.process_order("msg-1", &data).unwrap();

    assert_eq!(outcome.sub_orders, 1);
    assert_eq!(fx.store.count("orders"), 1);
    assert_eq!(fx.cart_len("buyer-1"), 0);
}

// ============================================================================
// Test 5: unknown product aborts
// ============================================================================

#[test]
fn unknown_product_aborts() {
    let data = order(vec![CartLine::physical("mug", 1), CartLine::physical("ghost", 1)]);
    let fx = Fixture::new();

    let err = fx.service.process_order("msg-1", &data).unwrap_err();

    assert!(matches!(err, ProcessError::Store(StoreError::NotFound { .. })));
    assert_eq!(fx.stock("mug"), 10);
    assert!(fx.store.find::<Order>(&|_| true).unwrap().is_empty());
}
