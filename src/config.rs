use std::time::Duration;

use crate::broker::ConnectionOptions;
use crate::notify::SignedLinkGenerator;
use crate::orders::DEFAULT_COMMISSION_BPS;
use crate::pipeline::{RetryPolicy, TopologyNames};

/// Pipeline configuration.
///
/// # Environment variables
///
/// | Variable | Default | Meaning |
/// |----------|---------|---------|
/// | AMQP_URL | amqp://localhost:5672 | Broker URL (unused by the in-memory broker) |
/// | ORDER_QUEUE | orders | Main order queue |
/// | DEAD_LETTER_EXCHANGE | orders.dlx | Dead-letter exchange |
/// | DEAD_LETTER_QUEUE | orders.dead-letter | Dead-letter queue |
/// | RETRY_EXCHANGE | orders.retry | Retry exchange |
/// | RETRY_QUEUE | orders.retry.wait | Retry queue (bootstrap only) |
/// | MAX_RETRIES | 3 | Redeliveries before dead-lettering |
/// | RETRY_DELAYS_MS | 30000,60000,90000 | Backoff table |
/// | DELAY_QUEUE_GRACE_MS | 1000 | Delay queue lifetime beyond its TTL |
/// | RECONNECT_INTERVAL_MS | 5000 | Wait between reconnect attempts |
/// | MAX_RECONNECT_ATTEMPTS | 10 | Reconnect attempts before giving up |
/// | PREFETCH | 1 | Unacked deliveries per consumer |
/// | POLL_INTERVAL_MS | 250 | Consumer wait per poll |
/// | COMMISSION_BPS | 1000 | Platform commission in basis points |
/// | DOWNLOAD_BASE_URL | http://localhost:8080/downloads | Download link base |
/// | DOWNLOAD_SIGNING_KEY | dev-signing-key | HMAC key for download links |
/// | DOWNLOAD_LINK_TTL_SECS | 3600 | Download link lifetime |
/// | OPERATOR_EMAIL | ops@localhost | Recipient of dead-letter reports |
/// | LOG_LEVEL | info | Default log filter |
#[derive(Debug, Clone)]
pub struct Config {
    pub amqp_url: String,
    pub names: TopologyNames,
    pub retry: RetryPolicy,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub prefetch: u16,
    pub poll_interval: Duration,
    pub commission_bps: u32,
    pub download_base_url: String,
    pub download_signing_key: String,
    pub download_link_ttl: Duration,
    pub operator_email: String,
    pub log_level: String,
}

impl Config {
    /// Load from environment variables, with defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());
        let millis = |key: &str, default: u64| {
            Duration::from_millis(lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default))
        };

        let defaults = TopologyNames::default();
        let retry_defaults = RetryPolicy::default();

        let delays = lookup("RETRY_DELAYS_MS")
            .and_then(|v| parse_delays(&v))
            .unwrap_or(retry_defaults.delays);

        Self {
            amqp_url: string("AMQP_URL", "amqp://localhost:5672"),
            names: TopologyNames {
                order_queue: string("ORDER_QUEUE", &defaults.order_queue),
                dead_letter_exchange: string("DEAD_LETTER_EXCHANGE", &defaults.dead_letter_exchange),
                dead_letter_queue: string("DEAD_LETTER_QUEUE", &defaults.dead_letter_queue),
                retry_exchange: string("RETRY_EXCHANGE", &defaults.retry_exchange),
                retry_queue: string("RETRY_QUEUE", &defaults.retry_queue),
            },
            retry: RetryPolicy {
                max_retries: lookup("MAX_RETRIES")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(retry_defaults.max_retries),
                delays,
                delay_queue_grace: millis("DELAY_QUEUE_GRACE_MS", 1_000),
            },
            reconnect_interval: millis("RECONNECT_INTERVAL_MS", 5_000),
            max_reconnect_attempts: lookup("MAX_RECONNECT_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            prefetch: lookup("PREFETCH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            poll_interval: millis("POLL_INTERVAL_MS", 250),
            commission_bps: lookup("COMMISSION_BPS")
                .and_then(|v| v.parse().ok())
                .filter(|bps| *bps <= 10_000)
                .unwrap_or(DEFAULT_COMMISSION_BPS),
            download_base_url: string("DOWNLOAD_BASE_URL", "http://localhost:8080/downloads"),
            download_signing_key: string("DOWNLOAD_SIGNING_KEY", "dev-signing-key"),
            download_link_ttl: Duration::from_secs(
                lookup("DOWNLOAD_LINK_TTL_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3_600),
            ),
            operator_email: string("OPERATOR_EMAIL", "ops@localhost"),
            log_level: string("LOG_LEVEL", "info"),
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            url: self.amqp_url.clone(),
            prefetch: self.prefetch,
            reconnect_interval: self.reconnect_interval,
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn link_generator(&self) -> SignedLinkGenerator {
        let ttl = chrono::Duration::from_std(self.download_link_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        SignedLinkGenerator::new(
            self.download_base_url.as_str(),
            self.download_signing_key.as_bytes(),
            ttl,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Parse a comma-separated list of milliseconds. None if any entry is invalid or the list is empty.
fn parse_delays(value: &str) -> Option<Vec<Duration>> {
    let delays = value
        .split(',')
        .map(|part| part.trim().parse::<u64>().map(Duration::from_millis))
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    (!delays.is_empty()).then_some(delays)
}
