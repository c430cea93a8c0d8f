//! Repositories - typed access to order documents through a session.

use super::model::{Cart, DigitalProduct, Order, OrderReference, Product, StoreAccount};
use crate::store::{Session, StoreError};

/// Extension trait for typed repository access on any [`Session`].
///
/// Every call goes through the session it is invoked on, so all reads and
/// writes made while processing one order share one transaction.
pub trait Repositories: Session {
    fn product(&mut self, id: &str) -> Result<Product, StoreError> {
        self.get::<Product>(id)?
            .ok_or_else(|| StoreError::not_found::<Product>(id))
    }

    fn save_product(&mut self, product: &Product) -> Result<(), StoreError> {
        self.save(product)
    }

    fn digital_product(&mut self, id: &str) -> Result<DigitalProduct, StoreError> {
        self.get::<DigitalProduct>(id)?
            .ok_or_else(|| StoreError::not_found::<DigitalProduct>(id))
    }

    fn store_account(&mut self, id: &str) -> Result<StoreAccount, StoreError> {
        self.get::<StoreAccount>(id)?
            .ok_or_else(|| StoreError::not_found::<StoreAccount>(id))
    }

    fn save_store(&mut self, store: &StoreAccount) -> Result<(), StoreError> {
        self.save(store)
    }

    fn cart(&mut self, buyer_id: &str) -> Result<Option<Cart>, StoreError> {
        self.get::<Cart>(buyer_id)
    }

    /// Empty the buyer's cart. Returns false if the buyer has none.
    fn clear_cart(&mut self, buyer_id: &str) -> Result<bool, StoreError> {
        match self.cart(buyer_id)? {
            Some(mut cart) => {
                cart.items.clear();
                self.save(&cart)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        self.insert(order)
    }

    fn order_reference(&mut self, reference: &str) -> Result<Option<OrderReference>, StoreError> {
        self.get::<OrderReference>(reference)
    }

    fn insert_order_reference(&mut self, reference: &OrderReference) -> Result<(), StoreError> {
        self.insert(reference)
    }
}

impl<S: Session> Repositories for S {}
