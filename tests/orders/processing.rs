//! Resolution of cart lines into sub-orders.

use order_pipeline::orders::{
    CartLine, Order, OrderHandler, PaymentStatus, ProductRef, DeliveryStatus,
};

use crate::support::{order, Fixture};

fn only_order(fx: &Fixture) -> Order {
    let orders = fx.store.find::<Order>(&|_| true).unwrap();
    assert_eq!(orders.len(), 1);
    orders.into_iter().next().unwrap()
}

fn assert_totals_consistent(order: &Order) {
    let sub_total: u64 = order.sub_orders.iter().map(|s| s.total_cents).sum();
    assert_eq!(order.total_cents, sub_total);
    for sub in &order.sub_orders {
        let lines: u64 = sub.lines.iter().map(|l| l.line_price_cents).sum();
        assert_eq!(sub.total_cents, lines);
    }
}

// ============================================================================
// Scenario A: single seller, two in-stock physical items
// ============================================================================

#[test]
fn single_seller_cart_becomes_one_sub_order() {
    let data = order(vec![CartLine::physical("mug", 2), CartLine::physical("bowl", 1)]);
    let fx = Fixture::new().with_cart(&data);
    assert_eq!(fx.cart_len("buyer-1"), 2);

    let outcome = fx.service.process_order("msg-1", &data).unwrap();

    assert_eq!(outcome.sub_orders, 1);
    assert_eq!(outcome.shortages, 0);
    assert!(!outcome.duplicate);
    assert_eq!(fx.stock("mug"), 8);
    assert_eq!(fx.stock("bowl"), 0);
    assert_eq!(fx.cart_len("buyer-1"), 0);

    let order = only_order(&fx);
    assert_eq!(order.id, outcome.order_id);
    assert_eq!(order.sellers, vec!["kiln".to_string()]);
    assert_eq!(order.total_cents, 2 * 1_400 + 2_500);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.shipping_method, "express");
    assert_eq!(order.postal_code, "10001");
    assert_eq!(order.source_message_id, "msg-1");
    assert_eq!(order.sub_orders[0].delivery_status, DeliveryStatus::Pending);
    assert_eq!(order.sub_orders[0].shipping_method, "express");
    assert_totals_consistent(&order);

    // 10% commission
    assert_eq!(fx.balance("kiln"), 4_770);
}

// ============================================================================
// Scenario B: two sellers, one physical and one digital line
// ============================================================================

#[test]
fn two_seller_cart_splits_and_sends_download_link() {
    let data = order(vec![CartLine::physical("mug", 1), CartLine::digital("ebook")]);
    let fx = Fixture::new().with_cart(&data);

    let outcome = fx.service.process_order("msg-1", &data).unwrap();
    assert_eq!(outcome.sub_orders, 2);

    let order = only_order(&fx);
    let mut sellers = order.sellers.clone();
    sellers.sort();
    assert_eq!(sellers, vec!["kiln".to_string(), "press".to_string()]);
    assert_eq!(order.total_cents, 1_400 + 1_000);
    assert_totals_consistent(&order);

    let digital = order
        .sub_orders
        .iter()
        .find(|s| s.seller_id == "press")
        .unwrap();
    assert_eq!(digital.lines[0].product, ProductRef::Digital { id: "ebook".into() });

    assert_eq!(fx.balance("kiln"), 1_260);
    assert_eq!(fx.balance("press"), 900);

    let downloads = fx.mailer.sent_to("buyer@example.com");
    assert_eq!(downloads.len(), 1);
    let url = downloads[0]
        .text
        .split_whitespace()
        .find(|w| w.starts_with("https://dl.example.com/"))
        .unwrap();
    assert_eq!(fx.links.verify(url).unwrap(), "books/glazing.pdf");
}

// ============================================================================
// Scenario E: insufficient stock on one line
// ============================================================================

#[test]
fn shortage_skips_line_but_completes_order() {
    let data = order(vec![CartLine::physical("bowl", 3), CartLine::physical("mug", 1)]);
    let fx = Fixture::new().with_cart(&data);

    let outcome = fx.service.process_order("msg-1", &data).unwrap();

    assert_eq!(outcome.shortages, 1);
    assert_eq!(fx.stock("bowl"), 1);
    assert_eq!(fx.stock("mug"), 9);
    assert_eq!(fx.cart_len("buyer-1"), 0);

    let order = only_order(&fx);
    assert_eq!(order.total_cents, 1_400);
    assert_eq!(order.sub_orders[0].lines.len(), 1);
    assert_eq!(order.shortages[0].product_id, "bowl");
    assert_eq!(order.shortages[0].requested, 3);
    assert_eq!(order.shortages[0].available, 1);
    assert_eq!(fx.balance("kiln"), 1_260);

    let notices = fx.mailer.sent_to("kiln@example.com");
    assert!(notices.iter().any(|e| e.subject.starts_with("Low stock")));
}

#[test]
fn fully_short_order_is_still_recorded() {
    let data = order(vec![CartLine::physical("bowl", 5)]);
    let fx = Fixture::new().with_cart(&data);

    let outcome = fx.service.process_order("msg-1", &data).unwrap();

    assert_eq!(outcome.sub_orders, 0);
    assert_eq!(outcome.shortages, 1);
    let order = only_order(&fx);
    assert!(order.sellers.is_empty());
    assert_eq!(order.total_cents, 0);
    assert_eq!(fx.balance("kiln"), 0);
}

// ============================================================================
// Variants
// ============================================================================

#[test]
fn variant_stock_is_decremented_at_variant_price() {
    let data = order(vec![CartLine::physical("tee", 2).with_size("S")]);
    let fx = Fixture::new();

    fx.service.process_order("msg-1", &data).unwrap();

    assert_eq!(fx.variant_stock("tee", "S"), 0);
    assert_eq!(fx.stock("tee"), 0);
    let order = only_order(&fx);
    assert_eq!(order.total_cents, 3_600);
    assert_eq!(order.sub_orders[0].lines[0].size.as_deref(), Some("S"));
}

#[test]
fn variant_shortage_behaves_like_plain_shortage() {
    let data = order(vec![
        CartLine::physical("tee", 1).with_size("L"),
        CartLine::physical("mug", 1),
    ]);
    let fx = Fixture::new();

    let outcome = fx.service.process_order("msg-1", &data).unwrap();

    assert_eq!(outcome.shortages, 1);
    let order = only_order(&fx);
    assert_eq!(order.shortages[0].size.as_deref(), Some("L"));
    assert_eq!(fx.variant_stock("tee", "L"), 0);
}

#[test]
fn unknown_variant_aborts() {
    let data = order(vec![
        CartLine::physical("mug", 1),
        CartLine::physical("tee", 1).with_size("XXL"),
    ]);
    let fx = Fixture::new().with_cart(&data);

    assert!(fx.service.process_order("msg-1", &data).is_err());
    assert_eq!(fx.stock("mug"), 10);
    assert_eq!(fx.cart_len("buyer-1"), 2);
}

// ============================================================================
// Payment status mapping
// ============================================================================

#[test]
fn declared_payment_status_is_mapped() {
    let fx = Fixture::new();
    let data = order(vec![CartLine::physical("mug", 1)]).with_payment("", "invoice", "requires_action");

    fx.service.process_order("msg-1", &data).unwrap();

    let order = only_order(&fx);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert_eq!(order.payment_method, "invoice");
}
