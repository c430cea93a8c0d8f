//! Order processing integration tests.
//!
//! Runs `OrderService` against the in-memory store, the log mailer and the
//! signed link generator:
//! - splitting carts per seller, stock and balance adjustments
//! - shortages, variants and digital fulfilment
//! - all-or-nothing sessions and post-commit notifications
//! - payment-reference idempotency

mod support;
mod idempotency;
mod processing;
mod transactions;
