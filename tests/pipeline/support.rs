//! Harness wiring the pipeline to the in-memory broker with millisecond delays.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use order_pipeline::broker::{ConnectionManager, ConnectionOptions, InMemoryBroker};
use order_pipeline::notify::LogMailer;
use order_pipeline::orders::{OrderData, OrderHandler, ProcessError, ProcessOutcome};
use order_pipeline::pipeline::{OrderProducer, RetryPolicy, TopologyNames};

pub const POLL: Duration = Duration::from_millis(10);

pub fn delays() -> Vec<Duration> {
    vec![
        Duration::from_millis(20),
        Duration::from_millis(40),
        Duration::from_millis(60),
    ]
}

pub struct Harness {
    pub broker: InMemoryBroker,
    pub manager: Arc<ConnectionManager>,
    pub producer: Arc<OrderProducer>,
    pub mailer: LogMailer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_reconnect_attempts(5)
    }

    pub fn with_reconnect_attempts(attempts: u32) -> Self {
        let broker = InMemoryBroker::recording();
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            ConnectionOptions {
                url: "memory://pipeline".into(),
                prefetch: 1,
                reconnect_interval: Duration::from_millis(20),
                max_reconnect_attempts: attempts,
            },
        );
        let policy = RetryPolicy::new(3, delays()).with_grace(Duration::from_secs(5));
        let producer = Arc::new(OrderProducer::new(
            Arc::clone(&manager),
            TopologyNames::default(),
            policy,
        ));
        let mailer = LogMailer::with_buffer(Arc::new(Mutex::new(Vec::new())));
        Self {
            broker,
            manager,
            producer,
            mailer,
        }
    }

    pub fn retry_publishes(&self) -> usize {
        self.broker.published_with_key_prefix("orders.retry.").len()
    }

    pub fn dead_letter_publishes(&self) -> usize {
        self.broker.published_to_exchange("orders.dlx").len()
    }
}

/// Accepts every order without touching any store.
pub struct Accept;

impl OrderHandler for Accept {
    fn process_order(&self, message_id: &str, _data: &OrderData) -> Result<ProcessOutcome, ProcessError> {
        Ok(ProcessOutcome {
            order_id: format!("order-{}", message_id),
            sub_orders: 1,
            shortages: 0,
            duplicate: false,
        })
    }
}

/// Fails the first `failures` calls, then delegates to `inner`.
pub struct Flaky<H> {
    inner: H,
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl<H: OrderHandler> Flaky<H> {
    /// Returns the handler and its call counter.
    pub fn new(inner: H, failures: usize) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Self {
            inner,
            failures,
            calls: Arc::clone(&calls),
        };
        (handler, calls)
    }
}

impl Flaky<Accept> {
    pub fn always_failing() -> (Self, Arc<AtomicUsize>) {
        Self::new(Accept, usize::MAX)
    }
}

impl<H: OrderHandler> OrderHandler for Flaky<H> {
    fn process_order(&self, message_id: &str, data: &OrderData) -> Result<ProcessOutcome, ProcessError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ProcessError::Other(format!("transient failure #{}", call + 1)));
        }
        self.inner.process_order(message_id, data)
    }
}

/// Poll `check` until it holds or five seconds pass.
pub fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Give the consumers time to act on anything that is still pending.
pub fn settle() {
    thread::sleep(Duration::from_millis(150));
}
