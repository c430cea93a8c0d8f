//! In-memory broker for testing and single-process deployments.
//!
//! `InMemoryBroker` implements [`Connector`] with the AMQP behaviour the
//! pipeline depends on:
//! - the default exchange routes to the queue named by the routing key
//! - direct and fanout exchanges with bindings
//! - queue arguments: dead-letter exchange/routing key, message TTL, expiry
//! - redeclaring with different arguments fails with `PreconditionFailed`
//! - expired and rejected (`requeue = false`) messages are dead-lettered
//! - unacked deliveries go back to the head of their queue, flagged
//!   `redelivered`, when their channel or connection closes
//! - per-consumer prefetch
//!
//! It also carries hooks for exercising failure paths (refused connects,
//! killed connections, failing declares, a bounded write buffer) and an
//! opt-in log of every publish for assertions. Nothing is persisted: the
//! `durable` flag and persistent delivery mode are accepted but a process
//! restart loses every queue and message.
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use order_pipeline::broker::{
//!     Channel, Connector, Consumer, InMemoryBroker, Properties, QueueOptions,
//! };
//!
//! let broker = InMemoryBroker::new();
//! let connection = broker.connect("memory://local").unwrap();
//! let channel = connection.create_channel().unwrap();
//!
//! channel.declare_queue("orders", &QueueOptions::durable()).unwrap();
//! channel.publish("", "orders", b"{}", &Properties::new()).unwrap();
//!
//! let mut consumer = channel.consume("orders", "worker-1").unwrap();
//! let delivery = consumer.next(Duration::from_millis(10)).unwrap().unwrap();
//! channel.ack(delivery.delivery_tag).unwrap();
//! assert_eq!(broker.queue_depth("orders"), Some(0));
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::error::BrokerError;
use super::message::{Delivery, Properties, PublishedMessage};
use super::transport::{
    Channel, CloseHandler, Connection, Connector, Consumer, ExchangeKind, QueueOptions,
};

/// Upper bound on a single condvar wait so TTL expiry is noticed promptly.
const SWEEP_SLICE: Duration = Duration::from_millis(5);

/// In-memory broker. Clone-friendly via `Arc`; clones share all state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    wake: Condvar,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    bindings: Vec<Binding>,
    queues: HashMap<String, Queue>,
    published: Vec<PublishedMessage>,
    record_publishes: bool,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    unacked: HashMap<(u64, u64), Unacked>,
    consumers: HashMap<(u64, String), String>,
    next_id: u64,
    connects: usize,
    drains: usize,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    failing_connects: u32,
    failing_declare_prefix: Option<String>,
    failing_publish_exchange: Option<String>,
    write_buffer: Option<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Exchange {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct Queue {
    options: QueueOptions,
    ready: VecDeque<Stored>,
    last_used: Instant,
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    properties: Properties,
    body: Vec<u8>,
    expires_at: Option<Instant>,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: Stored,
}

struct ConnectionState {
    close_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    next_tag: u64,
    buffered: usize,
}

impl InMemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that keeps every publish for [`published`](Self::published).
    pub fn recording() -> Self {
        let broker = Self::new();
        broker.record_publishes(true);
        broker
    }

    /// Turn the publish log on or off. Off by default; turning it off clears it.
    pub fn record_publishes(&self, on: bool) {
        let mut state = self.lock();
        state.record_publishes = on;
        if !on {
            state.published = Vec::new();
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.inner.wake.notify_all();
    }

    // ------------------------------------------------------------------
    // Failure hooks
    // ------------------------------------------------------------------

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().faults.failing_connects = count;
    }

    /// Fail every queue declaration whose name starts with `prefix`.
    pub fn fail_declares_with_prefix(&self, prefix: impl Into<String>) {
        self.lock().faults.failing_declare_prefix = Some(prefix.into());
    }

    pub fn clear_declare_failures(&self) {
        self.lock().faults.failing_declare_prefix = None;
    }

    /// Refuse channel publishes to `exchange` (`None` clears it).
    pub fn fail_publishes_to(&self, exchange: Option<&str>) {
        self.lock().faults.failing_publish_exchange = exchange.map(str::to_string);
    }

    /// Bound each channel's write buffer; `publish` reports `false` once full.
    pub fn set_write_buffer(&self, limit: Option<usize>) {
        self.lock().faults.write_buffer = limit;
    }

    /// Drop every open connection as if the broker had gone away.
    ///
    /// Unacked deliveries are requeued and each connection's close handler
    /// is invoked with `reason`.
    pub fn kill_connections(&self, reason: &str) {
        let handlers = {
            let mut state = self.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.close_connection(id))
                .collect::<Vec<_>>()
        };
        self.notify();
        debug!(count = handlers.len(), reason, "Killed broker connections");
        for handler in handlers {
            handler(reason.to_string());
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Every message published while recording was on, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Messages published to a given exchange.
    pub fn published_to_exchange(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Messages whose routing key starts with `prefix`.
    pub fn published_with_key_prefix(&self, prefix: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.routing_key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of ready (not yet delivered) messages in a queue.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let mut state = self.lock();
        state.sweep(Instant::now());
        state.queues.get(queue).map(|q| q.ready.len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        let mut state = self.lock();
        state.sweep(Instant::now());
        state.queues.contains_key(queue)
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.lock().queues.get(queue).map(|q| q.options.clone())
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).map(|e| e.kind)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock().bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        })
    }

    /// Deliveries handed out and not yet acked or nacked.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Successful connection attempts since creation.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Number of `wait_for_drain` calls served.
    pub fn drains(&self) -> usize {
        self.lock().drains
    }

    /// Route a message without a connection (for seeding tests).
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: Properties,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.lock();
            state.publish(exchange, routing_key, body, properties)?;
        }
        self.notify();
        Ok(())
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_connection_open(&self, connection_id: u64) -> Result<(), BrokerError> {
        match self.connections.get(&connection_id) {
            Some(_) => Ok(()),
            _ => Err(BrokerError::ConnectionClosed("connection is closed".into())),
        }
    }

    fn ensure_channel_open(&self, channel_id: u64) -> Result<(), BrokerError> {
        match self.channels.get(&channel_id) {
            Some(channel) => self.ensure_connection_open(channel.connection_id),
            _ => Err(BrokerError::ConnectionClosed("channel is closed".into())),
        }
    }

    /// Drop a connection and its channels, returning its close handler, if any.
    fn close_connection(&mut self, connection_id: u64) -> Option<Arc<dyn Fn(String) + Send + Sync>> {
        let conn = self.connections.remove(&connection_id)?;
        let handler = conn.close_handler;

        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            self.close_channel(id);
        }
        handler
    }

    fn close_channel(&mut self, channel_id: u64) {
        self.channels.remove(&channel_id);
        self.consumers.retain(|(ch, _), _| *ch != channel_id);

        let mut tags: Vec<u64> = self
            .unacked
            .keys()
            .filter(|(ch, _)| *ch == channel_id)
            .map(|(_, tag)| *tag)
            .collect();
        // Requeue newest first so the oldest ends up back at the head.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&(channel_id, tag)) {
                self.requeue(unacked);
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    fn declare_queue(&mut self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        if let Some(prefix) = &self.faults.failing_declare_prefix {
            if name.starts_with(prefix.as_str()) {
                return Err(BrokerError::PreconditionFailed(format!(
                    "declare of queue '{}' refused",
                    name
                )));
            }
        }

        let now = Instant::now();
        match self.queues.get_mut(name) {
            Some(existing) if existing.options == *options => {
                existing.last_used = now;
                Ok(())
            }
            Some(_) => Err(BrokerError::PreconditionFailed(format!(
                "queue '{}' already declared with different arguments",
                name
            ))),
            None => {
                self.queues.insert(
                    name.to_string(),
                    Queue {
                        options: options.clone(),
                        ready: VecDeque::new(),
                        last_used: now,
                    },
                );
                trace!(queue = name, "Queue declared");
                Ok(())
            }
        }
    }

    fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        if name.is_empty() {
            return Err(BrokerError::PreconditionFailed(
                "the default exchange cannot be declared".into(),
            ));
        }
        let wanted = Exchange { kind, durable };
        match self.exchanges.get(name) {
            Some(existing) if *existing == wanted => Ok(()),
            Some(_) => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{}' already declared with different arguments",
                name
            ))),
            None => {
                self.exchanges.insert(name.to_string(), wanted);
                Ok(())
            }
        }
    }

    fn bind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{}'", queue)));
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{}'", exchange)));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: Properties,
    ) -> Result<(), BrokerError> {
        if !exchange.is_empty() && !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{}'", exchange)));
        }
        if self.record_publishes {
            self.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                body: body.to_vec(),
            });
        }
        let message = Stored {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body: body.to_vec(),
            expires_at: None,
            redelivered: false,
        };
        self.route(exchange, routing_key, message);
        Ok(())
    }

    /// Deliver a message to every matching queue. Unroutable messages are dropped.
    fn route(&mut self, exchange: &str, routing_key: &str, message: Stored) -> usize {
        let targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            match self.exchanges.get(exchange) {
                Some(ex) => self
                    .bindings
                    .iter()
                    .filter(|b| {
                        b.exchange == exchange
                            && (ex.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
                    })
                    .map(|b| b.queue.clone())
                    .collect(),
                None => Vec::new(),
            }
        };

        if targets.is_empty() {
            trace!(exchange, routing_key, "Message unroutable, dropped");
        }

        let now = Instant::now();
        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                let ttl = match (queue.options.message_ttl, message.properties.expiration) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                let mut copy = message.clone();
                copy.expires_at = ttl.map(|ttl| now + ttl);
                queue.ready.push_back(copy);
            }
        }
        targets.len()
    }

    /// Route a message out through its queue's dead-letter exchange, or drop it.
    fn dead_letter(&mut self, queue: &str, mut message: Stored) {
        let target = self.queues.get(queue).and_then(|q| {
            q.options.dead_letter_exchange.clone().map(|exchange| {
                let key = q
                    .options
                    .dead_letter_routing_key
                    .clone()
                    .unwrap_or_else(|| message.routing_key.clone());
                (exchange, key)
            })
        });
        if let Some((exchange, routing_key)) = target {
            trace!(queue, exchange = %exchange, routing_key = %routing_key, "Dead-lettering message");
            message.redelivered = false;
            message.properties.expiration = None;
            message.exchange = exchange.clone();
            message.routing_key = routing_key.clone();
            self.route(&exchange, &routing_key, message);
        }
    }

    /// Expire messages past their TTL and queues past their idle expiry.
    fn sweep(&mut self, now: Instant) {
        let mut expired: Vec<(String, Stored)> = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            if queue.ready.iter().all(|m| m.expires_at.map_or(true, |at| at > now)) {
                continue;
            }
            let mut kept = VecDeque::with_capacity(queue.ready.len());
            for message in queue.ready.drain(..) {
                if message.expires_at.is_some_and(|at| at <= now) {
                    expired.push((name.clone(), message));
                } else {
                    kept.push_back(message);
                }
            }
            queue.ready = kept;
        }
        for (queue, message) in expired {
            self.dead_letter(&queue, message);
        }

        let consumed: Vec<&String> = self.consumers.values().collect();
        let idle: Vec<String> = self
            .queues
            .iter()
            .filter(|(name, queue)| {
                queue.options.expires.is_some_and(|after| {
                    now.duration_since(queue.last_used) >= after && !consumed.contains(name)
                })
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in idle {
            trace!(queue = %name, "Queue expired");
            self.queues.remove(&name);
            self.bindings.retain(|b| b.queue != name);
        }
    }

    fn try_deliver(&mut self, channel_id: u64, consumer_tag: &str, queue_name: &str) -> Option<Delivery> {
        let prefetch = self.channels.get(&channel_id)?.prefetch;
        if prefetch > 0 {
            let in_flight = self
                .unacked
                .iter()
                .filter(|((ch, _), u)| *ch == channel_id && u.consumer_tag == consumer_tag)
                .count();
            if in_flight >= usize::from(prefetch) {
                return None;
            }
        }

        let queue = self.queues.get_mut(queue_name)?;
        let message = queue.ready.pop_front()?;
        queue.last_used = Instant::now();

        let channel = self.channels.get_mut(&channel_id)?;
        channel.next_tag += 1;
        let tag = channel.next_tag;

        let delivery = Delivery {
            delivery_tag: tag,
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            properties: message.properties.clone(),
            body: message.body.clone(),
        };
        self.unacked.insert(
            (channel_id, tag),
            Unacked {
                queue: queue_name.to_string(),
                consumer_tag: consumer_tag.to_string(),
                message,
            },
        );
        Some(delivery)
    }
}

impl Connector for InMemoryBroker {
    fn connect(&self, url: &str) -> Result<Box<dyn Connection>, BrokerError> {
        let mut state = self.lock();
        if state.faults.failing_connects > 0 {
            state.faults.failing_connects -= 1;
            return Err(BrokerError::ConnectionFailed(format!(
                "{}: connection refused",
                url
            )));
        }
        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionState {
                close_handler: None,
            },
        );
        state.connects += 1;
        debug!(connection_id = id, url, "In-memory connection opened");
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

impl Connection for MemoryConnection {
    fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_connection_open(self.id)?;
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                next_tag: 0,
                buffered: 0,
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn on_close(&self, handler: CloseHandler) {
        if let Some(conn) = self.broker.lock().connections.get_mut(&self.id) {
            conn.close_handler = Some(Arc::from(handler));
        }
    }

    fn is_open(&self) -> bool {
        self.broker.lock().ensure_connection_open(self.id).is_ok()
    }

    fn close(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.lock();
            // A deliberate close does not fire the close handler.
            let _ = state.close_connection(self.id);
        }
        self.broker.notify();
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.lock().ensure_channel_open(self.id).is_ok()
    }

    fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_channel_open(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_channel_open(self.id)?;
        state.declare_exchange(name, kind, durable)
    }

    fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_channel_open(self.id)?;
        state.sweep(Instant::now());
        state.declare_queue(name, options)
    }

    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_channel_open(self.id)?;
        state.bind(queue, exchange, routing_key)
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &Properties,
    ) -> Result<bool, BrokerError> {
        let has_room = {
            let mut state = self.broker.lock();
            state.ensure_channel_open(self.id)?;
            if state.faults.failing_publish_exchange.as_deref() == Some(exchange) {
                return Err(BrokerError::PreconditionFailed(format!(
                    "publish to exchange '{}' refused",
                    exchange
                )));
            }
            state.sweep(Instant::now());
            state.publish(exchange, routing_key, body, properties.clone())?;
            let limit = state.faults.write_buffer;
            match state.channels.get_mut(&self.id) {
                Some(channel) => {
                    channel.buffered += 1;
                    limit.map_or(true, |limit| channel.buffered < limit)
                }
                None => true,
            }
        };
        self.broker.notify();
        Ok(has_room)
    }

    fn wait_for_drain(&self, _timeout: Duration) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_channel_open(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.buffered = 0;
        }
        state.drains += 1;
        Ok(())
    }

    fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn Consumer>, BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_channel_open(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{}'", queue)));
        }
        let key = (self.id, consumer_tag.to_string());
        if state.consumers.contains_key(&key) {
            return Err(BrokerError::PreconditionFailed(format!(
                "consumer tag '{}' already in use",
                consumer_tag
            )));
        }
        state.consumers.insert(key, queue.to_string());
        Ok(Box::new(MemoryConsumer {
            broker: self.broker.clone(),
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
        }))
    }

    fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.lock();
            state.ensure_channel_open(self.id)?;
            state
                .unacked
                .remove(&(self.id, delivery_tag))
                .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        }
        self.broker.notify();
        Ok(())
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.lock();
            state.ensure_channel_open(self.id)?;
            let unacked = state
                .unacked
                .remove(&(self.id, delivery_tag))
                .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
            if requeue {
                state.requeue(unacked);
            } else {
                let queue = unacked.queue.clone();
                state.dead_letter(&queue, unacked.message);
            }
        }
        self.broker.notify();
        Ok(())
    }

    fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_channel_open(self.id)?;
        state.consumers.remove(&(self.id, consumer_tag.to_string()));
        Ok(())
    }

    fn close(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.lock();
            state.close_channel(self.id);
        }
        self.broker.notify();
        Ok(())
    }
}

struct MemoryConsumer {
    broker: InMemoryBroker,
    channel_id: u64,
    tag: String,
    queue: String,
}

impl Consumer for MemoryConsumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.broker.lock();

        loop {
            let now = Instant::now();
            state.sweep(now);
            state.ensure_channel_open(self.channel_id)?;
            if !state
                .consumers
                .contains_key(&(self.channel_id, self.tag.clone()))
            {
                return Err(BrokerError::ConsumerCancelled(self.tag.clone()));
            }
            if !state.queues.contains_key(&self.queue) {
                return Err(BrokerError::ConsumerCancelled(self.tag.clone()));
            }

            if let Some(delivery) = state.try_deliver(self.channel_id, &self.tag, &self.queue) {
                return Ok(Some(delivery));
            }

            if now >= deadline {
                return Ok(None);
            }

            let wait = deadline.saturating_duration_since(now).min(SWEEP_SLICE);
            state = self
                .broker
                .inner
                .wake
                .wait_timeout(state, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}
