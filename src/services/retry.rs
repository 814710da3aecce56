//! Bounded exponential-backoff retries around store and ledger calls.
//!
//! This is the only place transient-failure policy lives: callers wrap each
//! network-facing call in [`RetryExecutor::retry`] and treat whatever comes
//! back as final.

use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{ArchiveError, ArchiveResult};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(20),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_backoff,
            multiplier: self.multiplier.max(1.0),
            max: self.max_backoff,
        }
    }
}

/// Infinite sequence `min(max, initial * multiplier^i)`.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    multiplier: f64,
    max: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.max);
        self.next = self.next.mul_f64(self.multiplier).min(self.max);
        Some(current)
    }
}

/// Runs fallible operations with retries. Cheap to clone; clones share the
/// cancellation token.
#[derive(Clone, Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Same policy, bound to a different cancellation token.
    pub fn with_token(&self, cancel: CancellationToken) -> Self {
        Self {
            config: self.config.clone(),
            cancel,
        }
    }

    /// Invoke `op` until it succeeds, fails with a non-transient error, or
    /// `max_attempts` is reached. Attempts run strictly one after another.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> ArchiveResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ArchiveResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.backoff();
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };
            if attempt >= max_attempts {
                return Err(ArchiveError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            let delay = backoff.next().unwrap_or(self.config.max_backoff);
            debug!(operation, attempt, ?delay, error = %err, "transient failure, backing off");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
