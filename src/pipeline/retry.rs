use std::time::Duration;

/// How failed orders are redelivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Redeliveries before a message goes to the dead-letter queue.
    pub max_retries: u32,
    /// Backoff table indexed by `retry_count - 1`, clamped to the last entry.
    pub delays: Vec<Duration>,
    /// Extra lifetime of a delay queue beyond its message TTL.
    pub delay_queue_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays: vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(90),
            ],
            delay_queue_grace: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_retries,
            delays,
            ..Self::default()
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.delay_queue_grace = grace;
        self
    }

    /// Delay before redelivery attempt `retry_count` (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let index = retry_count.saturating_sub(1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether a delivery that already used `retry_count` retries may be retried again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}
