//! Bounded retry with exponential backoff for the calls made to the Google APIs.
//!
//! Only errors accepted by the [`Condition`] are retried, the number of retries is bounded by the
//! backoff iterator, and the loop gives up as soon as the call's cancellation token fires. The
//! per-call deadline of the provider service is enforced by the caller, so a retry never outlives
//! the Mount call that started it.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The retry condition depends on the result of [`Condition::can_retry`].
pub(crate) trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}

/// Exponential backoff with jitter: `base_interval * factor^(attempt - 1)`, capped at
/// `max_interval`, yielding at most `max_retries` delays.
pub(crate) struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    jitter: f64,
    max_retries: u16,
    current_attempt: u16,
}

impl Exponential {
    pub(crate) fn new(config: &RetryConfig) -> Self {
        Self {
            base_interval: config.base_interval,
            max_interval: config.max_interval,
            factor: 2.0,
            jitter: config.jitter.clamp(0.0, 1.0),
            max_retries: config.max_retries,
            current_attempt: 0,
        }
    }

    fn delay(&self, attempt: u16) -> Duration {
        let attempt = attempt.max(1);
        let base_delay_ms =
            (self.base_interval.as_millis() as f64) * self.factor.powi(i32::from(attempt - 1));

        if self.jitter == 0.0 {
            return Duration::from_millis(base_delay_ms as u64).min(self.max_interval);
        }

        let jitter_factor: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((base_delay_ms * jitter_factor) as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_attempt >= self.max_retries {
            return None;
        }
        self.current_attempt += 1;
        Some(self.delay(self.current_attempt))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, the backoff runs out or
/// the token is cancelled. The last error is returned when the backoff runs out.
pub(crate) async fn retry<T, F, Fut, C>(
    backoff: impl IntoIterator<Item = Duration>,
    cln_token: &CancellationToken,
    mut operation: F,
    condition: C,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Condition<Error>,
{
    let mut backoff = backoff.into_iter();
    loop {
        let result = tokio::select! {
            biased;
            _ = cln_token.cancelled() => {
                return Err(Error::Cancelled("call cancelled".to_string()));
            }
            result = operation() => result,
        };

        let error = match result {
            Ok(item) => return Ok(item),
            Err(e) => e,
        };

        if !condition.can_retry(&error) {
            return Err(error);
        }

        let Some(delay) = backoff.next() else {
            return Err(error);
        };

        warn!(?delay, %error, "Retrying after transient error");
        tokio::select! {
            biased;
            _ = cln_token.cancelled() => {
                return Err(Error::Cancelled("call cancelled".to_string()));
            }
            _ = sleep(delay) => {}
        }
    }
}
