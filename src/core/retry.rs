//! Exponential backoff and a small async retry executor.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::RetryConfig;

/// Computes exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct BackoffCalculator;

impl BackoffCalculator {
    /// Backoff delay for a 0-based attempt index, capped at the
    /// configured maximum before jitter is applied.
    pub fn delay(config: &RetryConfig, attempt: u32) -> Duration {
        let pow = config.backoff_multiplier.powi(attempt as i32);
        let delay_ms = ((config.initial_backoff_ms as f32 * pow) as u64).min(config.max_backoff_ms);

        let jitter = config.jitter_factor.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let scale: f32 = rand::rng().random_range(-jitter..=jitter);
            let adjusted = (delay_ms as f32 * (1.0 + scale)).round().max(0.0) as u64;
            return Duration::from_millis(adjusted);
        }

        Duration::from_millis(delay_ms)
    }
}

/// Drives an async operation through bounded retries.
///
/// The operation is attempted up to `max_retries` times; `should_retry`
/// decides whether an output warrants another attempt, and `on_backoff`
/// runs before each sleep. The last output is returned either way.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor;

impl RetryExecutor {
    pub async fn execute<Op, Fut, T, ShouldRetry, OnBackoff>(
        config: &RetryConfig,
        mut operation: Op,
        should_retry: ShouldRetry,
        on_backoff: OnBackoff,
    ) -> T
    where
        Op: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = T>,
        ShouldRetry: Fn(&T, u32) -> bool,
        OnBackoff: Fn(Duration, u32),
    {
        let max = config.max_retries.max(1);
        let mut attempt: u32 = 0;

        loop {
            let output = operation(attempt).await;

            if !should_retry(&output, attempt) || attempt + 1 >= max {
                return output;
            }

            let delay = BackoffCalculator::delay(config, attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            on_backoff(delay, attempt + 1);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
