//! Background consume loop shared by the order and dead-letter consumers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::error::PipelineError;
use crate::broker::{
    Channel, ConnectionEvent, ConnectionManager, Consumer, Delivery,
};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Acked after scheduling redelivery attempt `retry_count`.
    Retried { retry_count: u32 },
    /// Acked after publishing to the dead-letter exchange.
    DeadLettered,
    /// Nacked without requeue.
    Rejected,
    /// Nacked with requeue; the broker redelivers it unchanged.
    Requeued,
}

/// Statistics from a consumer thread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub rejected: usize,
    pub requeued: usize,
    /// Deliveries whose handling failed with a broker or codec error.
    pub errors: usize,
    pub resubscribes: usize,
}

impl ConsumerStats {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Acked => self.acked += 1,
            Disposition::Retried { .. } => self.retried += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Rejected => self.rejected += 1,
            Disposition::Requeued => self.requeued += 1,
        }
    }
}

type Subscription = (Arc<dyn Channel>, Box<dyn Consumer>);

/// A thread consuming one queue with manual acknowledgement.
///
/// Resubscribes after `ConnectionEvent::Reconnected` and exits on
/// `ConnectionEvent::Abandoned` or `stop()`.
pub struct ConsumerThread {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<ConsumerStats>>,
}

impl ConsumerThread {
    /// Subscribe to `queue` and start consuming.
    ///
    /// The first subscription happens on the calling thread so that an
    /// unreachable broker or a missing queue is reported here.
    pub fn spawn<F>(
        name: &str,
        manager: Arc<ConnectionManager>,
        queue: &str,
        poll_interval: Duration,
        mut handle_delivery: F,
    ) -> Result<Self, PipelineError>
    where
        F: FnMut(&dyn Channel, &Delivery) -> Result<Disposition, PipelineError> + Send + 'static,
    {
        let events = manager.subscribe();
        let subscription = subscribe(&manager, queue, name)?;
        info!(consumer = name, queue, "Consumer subscribed");

        let stop = Arc::new(AtomicBool::new(false));
        let state = Loop {
            name: name.to_string(),
            queue: queue.to_string(),
            manager,
            events,
            stop: Arc::clone(&stop),
            poll_interval,
        };

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || state.run(subscription, &mut handle_delivery))
            .map_err(|e| PipelineError::Spawn {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the loop has exited (stopped or reconnection abandoned).
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop consuming, wait for the in-flight delivery, and return stats.
    pub fn stop(mut self) -> ConsumerStats {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                error!(consumer = %self.name, "Consumer thread panicked");
                ConsumerStats::default()
            }
            None => ConsumerStats::default(),
        }
    }
}

impl Drop for ConsumerThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Loop {
    name: String,
    queue: String,
    manager: Arc<ConnectionManager>,
    events: Receiver<ConnectionEvent>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Loop {
    fn run<F>(self, initial: Subscription, handle_delivery: &mut F) -> ConsumerStats
    where
        F: FnMut(&dyn Channel, &Delivery) -> Result<Disposition, PipelineError>,
    {
        let mut stats = ConsumerStats::default();
        let mut subscription = Some(initial);

        'consume: loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            loop {
                match self.events.try_recv() {
                    Ok(ConnectionEvent::Reconnected) => {
                        if self.stop.load(Ordering::SeqCst) {
                            break 'consume;
                        }
                        debug!(consumer = %self.name, "Broker reconnected, resubscribing");
                        if let Some((channel, consumer)) = subscription.take() {
                            let _ = channel.cancel(consumer.tag());
                        }
                    }
                    Ok(ConnectionEvent::Abandoned { attempts }) => {
                        error!(
                            consumer = %self.name,
                            attempts,
                            "Broker reconnection abandoned, consumer exiting"
                        );
                        break 'consume;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'consume,
                }
            }

            if subscription.is_none() {
                if !self.manager.is_connected() {
                    thread::sleep(self.poll_interval);
                    continue;
                }
                match subscribe(&self.manager, &self.queue, &self.name) {
                    Ok(s) => {
                        info!(consumer = %self.name, queue = %self.queue, "Consumer resubscribed");
                        stats.resubscribes += 1;
                        subscription = Some(s);
                    }
                    Err(err) => {
                        warn!(consumer = %self.name, error = %err, "Resubscribe failed");
                        thread::sleep(self.poll_interval);
                        continue;
                    }
                }
            }

            let Some((channel, consumer)) = subscription.as_mut() else {
                continue;
            };

            let delivery = match consumer.next(self.poll_interval) {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(err) => {
                    warn!(consumer = %self.name, error = %err, "Subscription lost");
                    if err.is_connectivity() {
                        self.manager.connection_lost(&err.to_string());
                    }
                    subscription = None;
                    continue;
                }
            };

            match handle_delivery(channel.as_ref(), &delivery) {
                Ok(disposition) => {
                    stats.record(disposition);
                    if disposition == Disposition::Requeued {
                        thread::sleep(self.poll_interval);
                    }
                }
                Err(err) => {
                    stats.errors += 1;
                    error!(
                        consumer = %self.name,
                        delivery_tag = delivery.delivery_tag,
                        error = %err,
                        "Delivery handling failed"
                    );
                    if err.is_connectivity() {
                        self.manager.connection_lost(&err.to_string());
                        subscription = None;
                    } else if let Err(nack_err) = channel.nack(delivery.delivery_tag, true) {
                        // Closing the channel hands the delivery back to the broker;
                        // the manager opens a fresh one on the next resubscribe.
                        warn!(
                            consumer = %self.name,
                            error = %nack_err,
                            "Could not requeue delivery, closing channel"
                        );
                        let _ = channel.close();
                        subscription = None;
                    } else {
                        thread::sleep(self.poll_interval);
                    }
                }
            }
        }

        if let Some((channel, consumer)) = subscription {
            let _ = channel.cancel(consumer.tag());
        }
        info!(consumer = %self.name, ?stats, "Consumer stopped");
        stats
    }
}

fn subscribe(
    manager: &ConnectionManager,
    queue: &str,
    tag: &str,
) -> Result<Subscription, PipelineError> {
    let channel = manager.channel()?;
    let consumer = match channel.consume(queue, tag) {
        Ok(consumer) => consumer,
        Err(err) => {
            if err.is_connectivity() {
                manager.connection_lost(&err.to_string());
            }
            return Err(err.into());
        }
    };
    Ok((channel, consumer))
}
