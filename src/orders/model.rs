//! Domain documents touched by order processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checkout::CartLine;
use crate::store::Document;

/// A size variant of a physical product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub size: String,
    pub price_cents: u64,
    pub stock: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub seller_id: String,
    pub name: String,
    pub price_cents: u64,
    pub stock: u32,
    pub variants: Vec<Variant>,
}

impl Product {
    pub fn new(
        id: impl Into<String>,
        seller_id: impl Into<String>,
        name: impl Into<String>,
        price_cents: u64,
        stock: u32,
    ) -> Self {
        Self {
            id: id.into(),
            seller_id: seller_id.into(),
            name: name.into(),
            price_cents,
            stock,
            variants: Vec::new(),
        }
    }

    pub fn with_variant(mut self, size: impl Into<String>, price_cents: u64, stock: u32) -> Self {
        self.variants.push(Variant {
            size: size.into(),
            price_cents,
            stock,
        });
        self
    }

    pub fn variant(&self, size: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.size == size)
    }

    pub fn variant_mut(&mut self, size: &str) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.size == size)
    }
}

impl Document for Product {
    const COLLECTION: &'static str = "products";
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalProduct {
    pub id: String,
    pub seller_id: String,
    pub name: String,
    pub price_cents: u64,
    /// Object storage key of the downloadable file.
    pub storage_key: Option<String>,
}

impl DigitalProduct {
    pub fn new(
        id: impl Into<String>,
        seller_id: impl Into<String>,
        name: impl Into<String>,
        price_cents: u64,
        storage_key: Option<&str>,
    ) -> Self {
        Self {
            id: id.into(),
            seller_id: seller_id.into(),
            name: name.into(),
            price_cents,
            storage_key: storage_key.map(str::to_string),
        }
    }
}

impl Document for DigitalProduct {
    const COLLECTION: &'static str = "digital_products";
    fn id(&self) -> &str {
        &self.id
    }
}

/// A seller's store and its balance awaiting payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAccount {
    pub id: String,
    pub name: String,
    pub owner_email: String,
    pub pending_balance_cents: u64,
}

impl StoreAccount {
    pub fn new(id: impl Into<String>, name: impl Into<String>, owner_email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            owner_email: owner_email.into(),
            pending_balance_cents: 0,
        }
    }
}

impl Document for StoreAccount {
    const COLLECTION: &'static str = "stores";
    fn id(&self) -> &str {
        &self.id
    }
}

/// A buyer's cart, keyed by buyer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: String,
    pub items: Vec<CartLine>,
}

impl Cart {
    pub fn new(buyer_id: impl Into<String>, items: Vec<CartLine>) -> Self {
        Self {
            id: buyer_id.into(),
            items,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Document for Cart {
    const COLLECTION: &'static str = "carts";
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductRef {
    Physical { id: String },
    Digital { id: String },
}

impl ProductRef {
    pub fn id(&self) -> &str {
        match self {
            ProductRef::Physical { id } | ProductRef::Digital { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product: ProductRef,
    pub quantity: u32,
    pub size: Option<String>,
    pub line_price_cents: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Shipped,
    Delivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    /// Map the payment outcome declared at checkout.
    pub fn from_declared(declared: &str) -> Self {
        match declared.trim().to_ascii_lowercase().as_str() {
            "paid" | "succeeded" | "success" => PaymentStatus::Paid,
            "failed" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }
}

/// The part of an order belonging to one seller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOrder {
    pub seller_id: String,
    pub lines: Vec<OrderLine>,
    pub total_cents: u64,
    pub shipping_method: String,
    pub delivery_status: DeliveryStatus,
}

impl SubOrder {
    pub fn new(seller_id: String, lines: Vec<OrderLine>, shipping_method: String) -> Self {
        let total_cents = lines.iter().map(|l| l.line_price_cents).sum();
        Self {
            seller_id,
            lines,
            total_cents,
            shipping_method,
            delivery_status: DeliveryStatus::Pending,
        }
    }
}

/// A line that could not be fulfilled from stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    pub product_id: String,
    pub seller_id: String,
    pub size: Option<String>,
    pub requested: u32,
    pub available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub buyer_id: String,
    pub buyer_email: String,
    pub sellers: Vec<String>,
    pub sub_orders: Vec<SubOrder>,
    pub total_cents: u64,
    pub payment_method: String,
    pub payment_status: PaymentStatus,
    pub payment_reference: String,
    pub shipping_address: String,
    pub shipping_method: String,
    pub postal_code: String,
    pub shortages: Vec<Shortage>,
    /// Id of the broker message that produced this order.
    pub source_message_id: String,
    pub created_at: DateTime<Utc>,
}

impl Document for Order {
    const COLLECTION: &'static str = "orders";
    fn id(&self) -> &str {
        &self.id
    }
}

/// Unique marker per payment reference, written in the same session as the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReference {
    pub id: String,
    pub order_id: String,
    pub message_id: String,
}

impl Document for OrderReference {
    const COLLECTION: &'static str = "order_references";
    fn id(&self) -> &str {
        &self.id
    }
}
