//! Orders - domain documents and the order processing service.

mod checkout;
mod error;
mod model;
mod repository;
mod service;

pub use checkout::{CartLine, OrderData, ProductKind};
pub use error::ProcessError;
pub use model::{
    Cart, DeliveryStatus, DigitalProduct, Order, OrderLine, OrderReference, PaymentStatus, Product,
    ProductRef, Shortage, StoreAccount, SubOrder, Variant,
};
pub use repository::Repositories;
pub use service::{OrderHandler, OrderService, ProcessOutcome, DEFAULT_COMMISSION_BPS};
