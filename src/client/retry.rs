use async_trait::async_trait;
use std::time::Duration;

/// Exponential backoff for rate-limited requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first request included.
    pub max_attempts: u32,
    pub initial_wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_wait,
        }
    }

    /// Wait after failed attempt `attempt` (1-based): `initial_wait * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_wait.saturating_mul(factor)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Delay primitive; swapped out in tests so backoff never really sleeps.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
