//! order-pipeline: runs the order consumer and dead-letter consumer until
//! SIGINT/SIGTERM, then closes the broker channel and connection.
//!
//! The binary wires the in-memory broker and store and seeds a small demo
//! catalog; an AMQP adapter implements `broker::Connector` for real brokers.
//!
//! `AMQP_URL` is only logged here. Queues are declared durable and messages
//! published persistent, but the in-memory broker and store keep nothing
//! across a restart: every queued, retrying or dead-lettered order is lost
//! when the process exits.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};

use order_pipeline::broker::{ConnectionEvent, ConnectionManager, InMemoryBroker};
use order_pipeline::logger::init_logger;
use order_pipeline::notify::LogMailer;
use order_pipeline::orders::{CartLine, DigitalProduct, OrderData, Product, StoreAccount};
use order_pipeline::pipeline::{DeadLetterConsumer, OrderConsumer, OrderProducer, PipelineError};
use order_pipeline::store::{InMemoryStore, StoreError};
use order_pipeline::{Config, OrderService};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let config = Config::from_env();
    init_logger(&config.log_level);

    if let Err(err) = run(config).await {
        error!(error = %err, "Order pipeline failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), PipelineError> {
    warn!(
        url = %config.amqp_url,
        "Using the in-process broker and store; AMQP_URL is ignored and nothing survives a restart"
    );
    let broker = InMemoryBroker::new();
    let manager = ConnectionManager::new(Arc::new(broker), config.connection_options());

    let store = InMemoryStore::new();
    if let Err(err) = seed(&store) {
        error!(error = %err, "Failed to seed demo catalog");
    }
    let mailer = LogMailer::new();
    let service = OrderService::new(store, mailer.clone(), config.link_generator())
        .with_commission_bps(config.commission_bps);

    let producer = Arc::new(OrderProducer::new(
        Arc::clone(&manager),
        config.names.clone(),
        config.retry.clone(),
    ));
    let events = manager.subscribe();

    let orders = OrderConsumer::start(Arc::clone(&producer), service, config.poll_interval)?;
    let dead_letters = DeadLetterConsumer::start(
        Arc::clone(&manager),
        &config.names.dead_letter_queue,
        mailer,
        config.operator_email.clone(),
        config.poll_interval,
    )?;

    let demo = OrderData::new("buyer-1", "buyer@example.com")
        .with_item(CartLine::physical("mug", 2))
        .with_item(CartLine::digital("ebook"))
        .with_shipping("1 Main St", "standard", "10001")
        .with_payment("demo-payment", "card", "paid")
        .with_total(3_900);
    let message_id = producer.send_order(demo)?;
    info!(message_id = %message_id, "Demo order submitted");

    let abandoned = tokio::task::spawn_blocking(move || {
        events.iter().find_map(|event| match event {
            ConnectionEvent::Abandoned { attempts } => Some(attempts),
            ConnectionEvent::Reconnected => None,
        })
    });

    info!("Order pipeline running");
    let exit = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        attempts = abandoned => match attempts {
            Ok(Some(attempts)) => Err(PipelineError::Broker(
                order_pipeline::broker::BrokerError::ReconnectAbandoned { attempts },
            )),
            _ => Ok(()),
        },
    };

    let stopped = tokio::task::spawn_blocking(move || (orders.stop(), dead_letters.stop())).await;
    match stopped {
        Ok((orders, dead_letters)) => info!(?orders, ?dead_letters, "Consumers stopped"),
        Err(err) => error!(error = %err, "Consumer shutdown failed"),
    }

    manager.close()?;
    info!("Order pipeline stopped");
    exit
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

fn seed(store: &InMemoryStore) -> Result<(), StoreError> {
    store.put(&StoreAccount::new("store-1", "Kiln & Co", "owner@kiln.example.com"))?;
    store.put(&StoreAccount::new("store-2", "Paper Press", "owner@paper.example.com"))?;
    store.put(&Product::new("mug", "store-1", "Stoneware mug", 1_400, 12))?;
    store.put(&DigitalProduct::new(
        "ebook",
        "store-2",
        "Glazing handbook",
        1_100,
        Some("books/glazing.pdf"),
    ))?;
    Ok(())
}
