//! Checkout snapshot carried on the wire inside an order message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    Physical,
    Digital,
}

/// One cart line as submitted at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: String,
    pub kind: ProductKind,
    pub quantity: u32,
    /// Selected size variant, physical products only.
    #[serde(default)]
    pub size: Option<String>,
}

impl CartLine {
    pub fn physical(product_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            kind: ProductKind::Physical,
            quantity,
            size: None,
        }
    }

    pub fn digital(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            kind: ProductKind::Digital,
            quantity: 1,
            size: None,
        }
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }
}

/// Cart snapshot taken at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderData {
    pub items: Vec<CartLine>,
    pub buyer_id: String,
    pub buyer_email: String,
    pub shipping_address: String,
    pub shipping_method: String,
    /// Payment outcome as declared by the checkout flow ("paid", "failed", ...).
    pub payment_status: String,
    pub payment_method: String,
    pub postal_code: String,
    pub total_amount_cents: u64,
    /// Payment transaction reference; doubles as the idempotency key.
    pub payment_reference: String,
    pub submitted_at: DateTime<Utc>,
}

impl OrderData {
    pub fn new(buyer_id: impl Into<String>, buyer_email: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            buyer_id: buyer_id.into(),
            buyer_email: buyer_email.into(),
            shipping_address: String::new(),
            shipping_method: "standard".into(),
            payment_status: "paid".into(),
            payment_method: "card".into(),
            postal_code: String::new(),
            total_amount_cents: 0,
            payment_reference: String::new(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_item(mut self, line: CartLine) -> Self {
        self.items.push(line);
        self
    }

    pub fn with_shipping(
        mut self,
        address: impl Into<String>,
        method: impl Into<String>,
        postal_code: impl Into<String>,
    ) -> Self {
        self.shipping_address = address.into();
        self.shipping_method = method.into();
        self.postal_code = postal_code.into();
        self
    }

    pub fn with_payment(
        mut self,
        reference: impl Into<String>,
        method: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        self.payment_reference = reference.into();
        self.payment_method = method.into();
        self.payment_status = status.into();
        self
    }

    pub fn with_total(mut self, cents: u64) -> Self {
        self.total_amount_cents = cents;
        self
    }
}
