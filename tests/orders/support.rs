//! Shared fixtures: a seeded catalog and a service wired to in-memory collaborators.

use std::sync::{Arc, Mutex};

use chrono::Duration;
use order_pipeline::notify::{LogMailer, SignedLinkGenerator};
use order_pipeline::orders::{
    Cart, CartLine, DigitalProduct, OrderData, OrderService, Product, StoreAccount,
};
use order_pipeline::store::{DocumentStore, InMemoryStore};

pub type Service = OrderService<InMemoryStore, LogMailer, SignedLinkGenerator>;

pub struct Fixture {
    pub store: InMemoryStore,
    pub mailer: LogMailer,
    pub links: SignedLinkGenerator,
    pub service: Service,
}

impl Fixture {
    /// Two sellers:
    /// - `kiln` sells `mug` (1400, stock 10), `bowl` (2500, stock 1) and
    ///   `tee` with sizes S (1800, stock 2) and L (2000, stock 0)
    /// - `press` sells the digital `ebook` (1000) and `zine` with no file
    pub fn new() -> Self {
        let store = InMemoryStore::new();
        let mailer = LogMailer::with_buffer(Arc::new(Mutex::new(Vec::new())));
        let links = SignedLinkGenerator::new("https://dl.example.com", "test-key", Duration::hours(1));

        store.put(&StoreAccount::new("kiln", "Kiln & Co", "kiln@example.com")).unwrap();
        store.put(&StoreAccount::new("press", "Paper Press", "press@example.com")).unwrap();
        store.put(&Product::new("mug", "kiln", "Mug", 1_400, 10)).unwrap();
        store.put(&Product::new("bowl", "kiln", "Bowl", 2_500, 1)).unwrap();
        store
            .put(
                &Product::new("tee", "kiln", "Tee", 1_900, 0)
                    .with_variant("S", 1_800, 2)
                    .with_variant("L", 2_000, 0),
            )
            .unwrap();
        store
            .put(&DigitalProduct::new("ebook", "press", "Glazing Handbook", 1_000, Some("books/glazing.pdf")))
            .unwrap();
        store
            .put(&DigitalProduct::new("zine", "press", "Zine", 500, None))
            .unwrap();

        let service = OrderService::new(store.clone(), mailer.clone(), links.clone());
        Self {
            store,
            mailer,
            links,
            service,
        }
    }

    /// Store the buyer's cart with the same lines as the order.
    pub fn with_cart(self, data: &OrderData) -> Self {
        self.store
            .put(&Cart::new(data.buyer_id.as_str(), data.items.clone()))
            .unwrap();
        self
    }

    pub fn stock(&self, product_id: &str) -> u32 {
        self.product(product_id).stock
    }

    pub fn variant_stock(&self, product_id: &str, size: &str) -> u32 {
        self.product(product_id)
            .variant(size)
            .map(|v| v.stock)
            .unwrap()
    }

    pub fn product(&self, product_id: &str) -> Product {
        self.store.get::<Product>(product_id).unwrap().unwrap().data
    }

    pub fn balance(&self, store_id: &str) -> u64 {
        self.store
            .get::<StoreAccount>(store_id)
            .unwrap()
            .unwrap()
            .data
            .pending_balance_cents
    }

    pub fn cart_len(&self, buyer_id: &str) -> usize {
        self.store
            .get::<Cart>(buyer_id)
            .unwrap()
            .map(|c| c.data.items.len())
            .unwrap_or(0)
    }
}

pub fn order(lines: Vec<CartLine>) -> OrderData {
    let mut data = OrderData::new("buyer-1", "buyer@example.com")
        .with_shipping("1 Main St", "express", "10001")
        .with_payment("", "card", "paid");
    data.items = lines;
    data
}
