//! Retry loops shared by readiness polling and dispatch.

use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Exponential backoff: the delay doubles after every failed attempt and
/// never exceeds `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    fn after(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max)
    }
}

/// Run `attempt_fn` once plus up to `max_retries` more times. Errors for which
/// `is_retryable` returns false end the loop right away.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    max_retries: u32,
    backoff: Backoff,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let mut delay = backoff.initial.min(backoff.max);
    for retry in 1..=max_retries {
        match attempt_fn().await {
            Ok(val) => return Ok(val),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) => {
                warn!(
                    retry,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    description,
                    error = %e,
                    "Attempt failed, retrying with backoff"
                );
                sleep(delay).await;
                delay = backoff.after(delay);
            }
        }
    }
    attempt_fn().await
}

/// Poll `attempt` every `poll_interval` until it succeeds. Fails with the last
/// error once `timeout` has passed.
pub async fn retry_until_deadline<T, F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    description: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let err = match attempt().await {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };
        let now = Instant::now();
        if now >= deadline {
            anyhow::bail!("Timeout {} after {:?}: {}", description, timeout, err);
        }
        debug!(error = %err, description, "Not there yet");
        sleep(poll_interval.min(deadline - now)).await;
    }
}
