//! Order processing service.
//!
//! Turns one checkout snapshot into a persisted [`Order`] inside a single
//! store session: resolves every line against current product state, splits
//! lines per seller, adjusts stock, issues download links for digital
//! products, credits each seller net of commission, writes the order and
//! clears the buyer's cart. Seller notices go out only after the commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::checkout::{CartLine, OrderData, ProductKind};
use super::error::ProcessError;
use super::model::{
    Order, OrderLine, OrderReference, PaymentStatus, ProductRef, Shortage, StoreAccount, SubOrder,
};
use super::repository::Repositories;
use crate::notify::{DownloadLinks, Email, Mailer};
use crate::store::{DocumentStore, Session};

/// Platform commission, in basis points of the line price.
pub const DEFAULT_COMMISSION_BPS: u32 = 1_000;

/// Result of processing one order message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub order_id: String,
    pub sub_orders: usize,
    pub shortages: usize,
    /// The payment reference was already processed; nothing changed.
    pub duplicate: bool,
}

/// Seam between the queue consumer and order processing.
pub trait OrderHandler: Send + Sync {
    fn process_order(&self, message_id: &str, data: &OrderData) -> Result<ProcessOutcome, ProcessError>;
}

impl<H: OrderHandler + ?Sized> OrderHandler for Arc<H> {
    fn process_order(&self, message_id: &str, data: &OrderData) -> Result<ProcessOutcome, ProcessError> {
        (**self).process_order(message_id, data)
    }
}

enum Resolved {
    Line { seller_id: String, line: OrderLine },
    Short(Shortage),
}

/// Everything a committed order needs for its follow-up notices.
struct Applied {
    order: Order,
    credited: Vec<(StoreAccount, u64)>,
}

pub struct OrderService<S, M, L> {
    store: S,
    mailer: M,
    links: L,
    commission_bps: u32,
}

impl<S, M, L> OrderService<S, M, L>
where
    S: DocumentStore,
    M: Mailer,
    L: DownloadLinks,
{
    pub fn new(store: S, mailer: M, links: L) -> Self {
        Self {
            store,
            mailer,
            links,
            commission_bps: DEFAULT_COMMISSION_BPS,
        }
    }

    pub fn with_commission_bps(mut self, bps: u32) -> Self {
        self.commission_bps = bps.min(10_000);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Amount credited to the seller for a line price.
    pub fn seller_share(&self, line_price_cents: u64) -> u64 {
        let share = u128::from(line_price_cents) * u128::from(10_000 - self.commission_bps) / 10_000;
        // Never above the line price, so it always fits.
        u64::try_from(share).unwrap_or(line_price_cents)
    }

    pub fn process(&self, message_id: &str, data: &OrderData) -> Result<ProcessOutcome, ProcessError> {
        if data.items.is_empty() {
            return Err(ProcessError::EmptyOrder);
        }

        let mut session = self.store.start_session()?;

        let reference = data.payment_reference.trim();
        if !reference.is_empty() {
            if let Some(existing) = session.order_reference(reference)? {
                info!(
                    message_id,
                    payment_reference = reference,
                    order_id = %existing.order_id,
                    "Order already processed, skipping"
                );
                session.abort();
                return Ok(ProcessOutcome {
                    order_id: existing.order_id,
                    sub_orders: 0,
                    shortages: 0,
                    duplicate: true,
                });
            }
        }

        let applied = match self.apply(&mut session, message_id, data) {
            Ok(applied) => applied,
            Err(e) => {
                session.abort();
                return Err(e);
            }
        };
        session.commit()?;

        let order = &applied.order;
        info!(
            message_id,
            order_id = %order.id,
            sellers = order.sellers.len(),
            total_cents = order.total_cents,
            shortages = order.shortages.len(),
            "Order committed"
        );

        self.notify_sellers(&applied);

        Ok(ProcessOutcome {
            order_id: order.id.clone(),
            sub_orders: order.sub_orders.len(),
            shortages: order.shortages.len(),
            duplicate: false,
        })
    }

    fn apply(
        &self,
        session: &mut S::Session,
        message_id: &str,
        data: &OrderData,
    ) -> Result<Applied, ProcessError> {
        let mut by_seller: BTreeMap<String, Vec<OrderLine>> = BTreeMap::new();
        let mut shortages = Vec::new();

        for item in &data.items {
            if item.quantity == 0 {
                return Err(ProcessError::InvalidQuantity(item.product_id.clone()));
            }
            let resolved = match (item.kind, item.size.as_deref()) {
                (ProductKind::Physical, None) => self.take_stock(session, item)?,
                (ProductKind::Physical, Some(size)) => self.take_variant_stock(session, item, size)?,
                (ProductKind::Digital, _) => self.issue_download(session, item, data)?,
            };
            match resolved {
                Resolved::Line { seller_id, line } => {
                    by_seller.entry(seller_id).or_default().push(line)
                }
                Resolved::Short(shortage) => {
                    warn!(
                        message_id,
                        product_id = %shortage.product_id,
                        size = ?shortage.size,
                        requested = shortage.requested,
                        available = shortage.available,
                        "Insufficient stock, line skipped"
                    );
                    shortages.push(shortage);
                }
            }
        }

        let mut sub_orders = Vec::with_capacity(by_seller.len());
        let mut credited = Vec::with_capacity(by_seller.len());
        for (seller_id, lines) in by_seller {
            // SubOrder::new sums the same line prices unchecked.
            checked_sum(lines.iter().map(|l| l.line_price_cents), &seller_id)?;
            let credit = checked_sum(lines.iter().map(|l| self.seller_share(l.line_price_cents)), &seller_id)?;
            let mut account = session.store_account(&seller_id)?;
            account.pending_balance_cents = account
                .pending_balance_cents
                .checked_add(credit)
                .ok_or_else(|| ProcessError::AmountOverflow(format!("balance of {}", seller_id)))?;
            session.save_store(&account)?;

            sub_orders.push(SubOrder::new(seller_id, lines, data.shipping_method.clone()));
            credited.push((account, credit));
        }

        let total_cents = checked_sum(sub_orders.iter().map(|s| s.total_cents), "order total")?;
        let order = Order {
            id: Uuid::new_v4().to_string(),
            buyer_id: data.buyer_id.clone(),
            buyer_email: data.buyer_email.clone(),
            sellers: sub_orders.iter().map(|s| s.seller_id.clone()).collect(),
            total_cents,
            sub_orders,
            payment_method: data.payment_method.clone(),
            payment_status: PaymentStatus::from_declared(&data.payment_status),
            payment_reference: data.payment_reference.clone(),
            shipping_address: data.shipping_address.clone(),
            shipping_method: data.shipping_method.clone(),
            postal_code: data.postal_code.clone(),
            shortages,
            source_message_id: message_id.to_string(),
            created_at: Utc::now(),
        };
        session.insert_order(&order)?;

        let reference = data.payment_reference.trim();
        if !reference.is_empty() {
            session.insert_order_reference(&OrderReference {
                id: reference.to_string(),
                order_id: order.id.clone(),
                message_id: message_id.to_string(),
            })?;
        }

        if !session.clear_cart(&data.buyer_id)? {
            debug!(buyer_id = %data.buyer_id, "Buyer has no stored cart");
        }

        Ok(Applied { order, credited })
    }

    fn take_stock(&self, session: &mut S::Session, item: &CartLine) -> Result<Resolved, ProcessError> {
        let mut product = session.product(&item.product_id)?;
        if product.stock < item.quantity {
            return Ok(Resolved::Short(Shortage {
                product_id: product.id,
                seller_id: product.seller_id,
                size: None,
                requested: item.quantity,
                available: product.stock,
            }));
        }

        product.stock -= item.quantity;
        session.save_product(&product)?;
        debug!(product_id = %product.id, remaining = product.stock, "Stock decremented");

        Ok(Resolved::Line {
            line: OrderLine {
                product: ProductRef::Physical { id: product.id.clone() },
                quantity: item.quantity,
                size: None,
                line_price_cents: line_price(&product.id, product.price_cents, item.quantity)?,
            },
            seller_id: product.seller_id,
        })
    }

    fn take_variant_stock(
        &self,
        session: &mut S::Session,
        item: &CartLine,
        size: &str,
    ) -> Result<Resolved, ProcessError> {
        let mut product = session.product(&item.product_id)?;
        let variant = product
            .variant_mut(size)
            .ok_or_else(|| ProcessError::VariantNotFound {
                product_id: item.product_id.clone(),
                size: size.to_string(),
            })?;

        if variant.stock < item.quantity {
            let available = variant.stock;
            return Ok(Resolved::Short(Shortage {
                product_id: product.id,
                seller_id: product.seller_id,
                size: Some(size.to_string()),
                requested: item.quantity,
                available,
            }));
        }

        variant.stock -= item.quantity;
        let line_price_cents = line_price(&item.product_id, variant.price_cents, item.quantity)?;
        session.save_product(&product)?;

        Ok(Resolved::Line {
            line: OrderLine {
                product: ProductRef::Physical { id: product.id },
                quantity: item.quantity,
                size: Some(size.to_string()),
                line_price_cents,
            },
            seller_id: product.seller_id,
        })
    }

    fn issue_download(
        &self,
        session: &mut S::Session,
        item: &CartLine,
        data: &OrderData,
    ) -> Result<Resolved, ProcessError> {
        let product = session.digital_product(&item.product_id)?;
        let key = product
            .storage_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProcessError::MissingStorageKey(product.id.clone()))?;

        let url = self.links.download_url(key)?;
        let email = Email::new(
            data.buyer_email.as_str(),
            format!("Your download: {}", product.name),
            format!(
                "Thanks for your purchase. Download {} here: {}\nThe link expires soon, save the file once downloaded.",
                product.name, url
            ),
        )
        .with_html(format!(
            "<p>Thanks for your purchase.</p><p><a href=\"{}\">Download {}</a></p>",
            url, product.name
        ));
        self.mailer.send_email(&email)?;
        debug!(product_id = %product.id, buyer = %data.buyer_email, "Download link sent");

        Ok(Resolved::Line {
            line: OrderLine {
                product: ProductRef::Digital { id: product.id.clone() },
                quantity: item.quantity,
                size: None,
                line_price_cents: line_price(&product.id, product.price_cents, item.quantity)?,
            },
            seller_id: product.seller_id,
        })
    }

    /// Post-commit notices. Failures are logged, never propagated.
    fn notify_sellers(&self, applied: &Applied) {
        let order = &applied.order;

        for (account, credit) in &applied.credited {
            let email = Email::new(
                account.owner_email.as_str(),
                format!("New order {}", order.id),
                format!(
                    "{} sold items in order {}. {} cents were added to your pending balance.",
                    account.name, order.id, credit
                ),
            );
            if let Err(e) = self.mailer.send_email(&email) {
                warn!(order_id = %order.id, store_id = %account.id, error = %e, "Sold notice failed");
            }
        }

        for shortage in &order.shortages {
            let owner = match self.store.get::<StoreAccount>(&shortage.seller_id) {
                Ok(Some(account)) => account.data.owner_email,
                Ok(None) => {
                    warn!(store_id = %shortage.seller_id, "No store for shortage notice");
                    continue;
                }
                Err(e) => {
                    warn!(store_id = %shortage.seller_id, error = %e, "Store lookup failed");
                    continue;
                }
            };
            let product = match &shortage.size {
                Some(size) => format!("{} (size {})", shortage.product_id, size),
                None => shortage.product_id.clone(),
            };
            let email = Email::new(
                owner,
                format!("Low stock: {}", product),
                format!(
                    "Order {} requested {} of {} but only {} were available. The line was not fulfilled.",
                    order.id, shortage.requested, product, shortage.available
                ),
            );
            if let Err(e) = self.mailer.send_email(&email) {
                warn!(order_id = %order.id, product_id = %shortage.product_id, error = %e, "Shortage notice failed");
            }
        }
    }
}

fn line_price(product_id: &str, price_cents: u64, quantity: u32) -> Result<u64, ProcessError> {
    price_cents
        .checked_mul(u64::from(quantity))
        .ok_or_else(|| ProcessError::AmountOverflow(format!("line for {}", product_id)))
}

fn checked_sum(amounts: impl IntoIterator<Item = u64>, what: &str) -> Result<u64, ProcessError> {
    amounts
        .into_iter()
        .try_fold(0u64, u64::checked_add)
        .ok_or_else(|| ProcessError::AmountOverflow(what.to_string()))
}

impl<S, M, L> OrderHandler for OrderService<S, M, L>
where
    S: DocumentStore,
    M: Mailer,
    L: DownloadLinks,
{
    fn process_order(&self, message_id: &str, data: &OrderData) -> Result<ProcessOutcome, ProcessError> {
        self.process(message_id, data)
    }
}
