//! Connection manager: one connection and one channel per process, owned
//! explicitly and passed to every component that talks to the broker.
//!
//! ## Lifecycle
//!
//! ```text
//!   Idle ──connect()──▶ Connecting ──ok──▶ Connected
//!    ▲                      │                  │
//!    └──────── err ─────────┘          lost / close handler
//!                                              │
//!                          reconnect thread ◀──┘  (fixed interval, bounded attempts)
//!                             │         │
//!                  Reconnected event   Abandoned event
//! ```
//!
//! Concurrent callers of [`ConnectionManager::connect`] share a single
//! in-flight attempt. Components that hold subscriptions call
//! [`ConnectionManager::subscribe`] and resubscribe when they receive
//! [`ConnectionEvent::Reconnected`].

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::error::BrokerError;
use super::transport::{Channel, Connection, Connector};

/// Settings for establishing and re-establishing the broker connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub url: String,
    /// Per-consumer prefetch applied to the channel.
    pub prefetch: u16,
    /// Fixed delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Attempts before reconnection is abandoned.
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".into(),
            prefetch: 1,
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

/// Lifecycle notifications delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new connection or channel replaced one that was lost.
    Reconnected,
    /// Reconnection gave up after this many attempts.
    Abandoned { attempts: u32 },
}

enum Phase {
    Idle,
    Connecting,
    Connected {
        connection: Arc<dyn Connection>,
        channel: Arc<dyn Channel>,
    },
    Closed,
}

struct State {
    phase: Phase,
    /// Set when a connection was lost; cleared by the next successful connect.
    lost: bool,
    reconnecting: bool,
    /// Bumped on every new connection so stale close handlers are ignored.
    generation: u64,
}

/// Owns the process-wide broker connection and channel.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    state: Mutex<State>,
    changed: Condvar,
    listeners: Mutex<Vec<Sender<ConnectionEvent>>>,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until the first `connect()`/`channel()`.
    pub fn new(connector: Arc<dyn Connector>, options: ConnectionOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            connector,
            options,
            state: Mutex::new(State {
                phase: Phase::Idle,
                lost: false,
                reconnecting: false,
                generation: 0,
            }),
            changed: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register for lifecycle events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn emit(&self, event: ConnectionEvent) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.lock().phase, Phase::Connected { .. })
    }

    /// Establish the connection and channel, or return the existing channel.
    ///
    /// If another thread is already connecting, waits for that attempt and
    /// shares its outcome. A failed attempt schedules background reconnects.
    /// A channel the broker closed is reopened on the live connection.
    pub fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut state = self.lock();
        loop {
            if let Phase::Connected {
                connection,
                channel,
            } = &state.phase
            {
                if channel.is_open() {
                    return Ok(Arc::clone(channel));
                }
                let connection = Arc::clone(connection);
                return self.reopen_channel(state, connection);
            }
            if matches!(state.phase, Phase::Closed) {
                return Err(BrokerError::Shutdown);
            }
            if matches!(state.phase, Phase::Idle) {
                break;
            }
            let generation = state.generation;
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            if matches!(state.phase, Phase::Idle) && state.generation == generation {
                return Err(BrokerError::ConnectionFailed(
                    "shared connection attempt failed".into(),
                ));
            }
        }
        state.phase = Phase::Connecting;
        drop(state);

        let result = self.open();

        let mut state = self.lock();
        match result {
            Ok((connection, channel)) => {
                if matches!(state.phase, Phase::Closed) {
                    drop(state);
                    let _ = channel.close();
                    let _ = connection.close();
                    return Err(BrokerError::Shutdown);
                }
                state.generation += 1;
                let generation = state.generation;
                let was_lost = std::mem::replace(&mut state.lost, false);
                state.phase = Phase::Connected {
                    connection: Arc::clone(&connection),
                    channel: Arc::clone(&channel),
                };
                self.changed.notify_all();
                drop(state);

                self.watch(&connection, generation);
                info!(url = %self.options.url, prefetch = self.options.prefetch, "Broker connection established");
                if was_lost {
                    info!("Broker connection re-established");
                    self.emit(ConnectionEvent::Reconnected);
                }
                Ok(channel)
            }
            Err(err) => {
                if !matches!(state.phase, Phase::Closed) {
                    state.phase = Phase::Idle;
                    state.lost = true;
                }
                self.changed.notify_all();
                drop(state);
                warn!(url = %self.options.url, error = %err, "Broker connection attempt failed");
                self.schedule_reconnect();
                Err(err)
            }
        }
    }

    /// The active channel, connecting first if necessary.
    pub fn channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        self.connect()
    }

    fn open(&self) -> Result<(Arc<dyn Connection>, Arc<dyn Channel>), BrokerError> {
        let connection: Arc<dyn Connection> = Arc::from(self.connector.connect(&self.options.url)?);
        match self.open_channel(&connection) {
            Ok(channel) => Ok((connection, channel)),
            Err(err) => {
                let _ = connection.close();
                Err(err)
            }
        }
    }

    fn open_channel(&self, connection: &Arc<dyn Connection>) -> Result<Arc<dyn Channel>, BrokerError> {
        let channel = connection.create_channel()?;
        channel.set_prefetch(self.options.prefetch)?;
        Ok(channel)
    }

    /// Replace a dead channel. If no channel can be opened on the current
    /// connection, drop the connection and fall back to the reconnect loop.
    fn reopen_channel(
        &self,
        mut state: MutexGuard<'_, State>,
        connection: Arc<dyn Connection>,
    ) -> Result<Arc<dyn Channel>, BrokerError> {
        if connection.is_open() {
            match self.open_channel(&connection) {
                Ok(channel) => {
                    state.phase = Phase::Connected {
                        connection,
                        channel: Arc::clone(&channel),
                    };
                    drop(state);
                    warn!("Broker channel was closed, reopened on the existing connection");
                    self.emit(ConnectionEvent::Reconnected);
                    return Ok(channel);
                }
                Err(err) => warn!(error = %err, "Failed to reopen broker channel"),
            }
        }

        state.phase = Phase::Idle;
        state.lost = true;
        self.changed.notify_all();
        drop(state);

        let _ = connection.close();
        error!("Broker channel lost, reconnecting");
        self.schedule_reconnect();
        Err(BrokerError::ConnectionClosed("channel is closed".into()))
    }

    fn watch(&self, connection: &Arc<dyn Connection>, generation: u64) {
        let this = self.this.clone();
        connection.on_close(Box::new(move |reason| {
            if let Some(manager) = this.upgrade() {
                manager.lost(generation, &reason);
            }
        }));
    }

    /// Report a connectivity failure observed while using the channel.
    ///
    /// Safe to call from several components for the same outage: reports
    /// against a connection that is still open, or one already replaced,
    /// are ignored.
    pub fn connection_lost(&self, reason: &str) {
        let generation = self.lock().generation;
        self.lost(generation, reason);
    }

    fn lost(&self, generation: u64, reason: &str) {
        let stale = {
            let mut state = self.lock();
            let still_open = match &state.phase {
                Phase::Connected { connection, .. } => connection.is_open(),
                _ => true,
            };
            if state.generation != generation || still_open {
                true
            } else {
                state.phase = Phase::Idle;
                state.lost = true;
                self.changed.notify_all();
                false
            }
        };
        if stale {
            return;
        }
        error!(reason, "Broker connection lost");
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        {
            let mut state = self.lock();
            if state.reconnecting || matches!(state.phase, Phase::Closed) {
                return;
            }
            state.reconnecting = true;
        }

        let Some(manager) = self.this.upgrade() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name("broker-reconnect".into())
            .spawn(move || manager.reconnect_loop());
        if let Err(err) = spawned {
            error!(error = %err, "Failed to spawn reconnect thread");
            self.lock().reconnecting = false;
        }
    }

    fn reconnect_loop(&self) {
        let max = self.options.max_reconnect_attempts;
        let mut attempt = 0;

        while attempt < max {
            attempt += 1;
            thread::sleep(self.options.reconnect_interval);

            {
                let mut state = self.lock();
                if matches!(state.phase, Phase::Closed | Phase::Connected { .. }) {
                    state.reconnecting = false;
                    return;
                }
            }

            info!(attempt, max, "Reconnecting to broker");
            // `reconnecting` stays set while connect() runs, so a failure
            // inside it does not spawn a second loop.
            match self.connect() {
                Ok(_) | Err(BrokerError::Shutdown) => {
                    self.lock().reconnecting = false;
                    return;
                }
                Err(err) => debug!(attempt, error = %err, "Reconnect attempt failed"),
            }
        }

        self.lock().reconnecting = false;
        error!(
            attempts = max,
            url = %self.options.url,
            "Giving up on broker reconnection; operator intervention required"
        );
        self.emit(ConnectionEvent::Abandoned { attempts: max });
    }

    /// Close the channel, then the connection. No reconnects afterwards.
    pub fn close(&self) -> Result<(), BrokerError> {
        let previous = {
            let mut state = self.lock();
            let previous = std::mem::replace(&mut state.phase, Phase::Closed);
            self.changed.notify_all();
            previous
        };
        if let Phase::Connected {
            connection,
            channel,
        } = previous
        {
            channel.close()?;
            connection.close()?;
            info!("Broker channel and connection closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.lock().phase, Phase::Closed)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Phase::Connected {
            connection,
            channel,
        } = std::mem::replace(&mut state.phase, Phase::Closed)
        {
            let _ = channel.close();
            let _ = connection.close();
        }
    }
}
