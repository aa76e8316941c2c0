// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How many times a failing operation is attempted, and how long to wait
/// between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry right away, up to the given number of attempts.
    Immediate(u32),
    /// Wait `min(base * 2^(n-1), max)` after the n-th failed attempt.
    Exponential {
        attempts: u32,
        base: Duration,
        max: Duration,
    },
}

impl RetryStrategy {
    /// Total number of attempts, the first one included. Never zero.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            RetryStrategy::Immediate(attempts) => (*attempts).max(1),
            RetryStrategy::Exponential { attempts, .. } => (*attempts).max(1),
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::Exponential { base, max, .. } => {
                let shift = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << shift)
                    .map_or(*max, |delay| delay.min(*max))
            }
        }
    }

    /// Runs `operation` until it succeeds, fails with an error `is_transient`
    /// rejects, or runs out of attempts. Cancelling `cancel` stops the wait
    /// between attempts and returns the last error.
    ///
    /// `on_retry` is called before every wait with the failed attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        is_transient: impl Fn(&E) -> bool,
        mut on_retry: impl FnMut(u32, &E),
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts || !is_transient(&e) => return Err(e),
                Err(e) => {
                    on_retry(attempt, &e);
                    let delay = self.delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(e),
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential {
            attempts: 5,
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delay_is_capped() {
        let strategy = RetryStrategy::Exponential {
            attempts: 10,
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(strategy.delay(1), Duration::from_millis(100));
        assert_eq!(strategy.delay(2), Duration::from_millis(200));
        assert_eq!(strategy.delay(3), Duration::from_millis(400));
        assert_eq!(strategy.delay(4), Duration::from_millis(500));
        assert_eq!(strategy.delay(64), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(RetryStrategy::Immediate(0).attempts(), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, &str> = RetryStrategy::Immediate(3)
            .run(
                &CancellationToken::new(),
                |_| true,
                |_, _| {},
                || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err("busy")
                    } else {
                        Ok(n)
                    }
                },
            )
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), &str> = RetryStrategy::Immediate(5)
            .run(
                &CancellationToken::new(),
                |_| false,
                |_, _| {},
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("bad request")
                },
            )
            .await;
        assert_eq!(result, Err("bad request"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let retries = &AtomicU32::new(0);
        let result: Result<(), &str> = RetryStrategy::Immediate(4)
            .run(
                &CancellationToken::new(),
                |_| true,
                |_, _| {
                    retries.fetch_add(1, Ordering::SeqCst);
                },
                || async move { Err("unavailable") },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(retries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let strategy = RetryStrategy::Exponential {
            attempts: 3,
            base: Duration::from_secs(3600),
            max: Duration::from_secs(3600),
        };
        let calls = &AtomicU32::new(0);
        let result: Result<(), &str> = strategy
            .run(
                &cancel,
                |_| true,
                |_, _| {},
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("timeout")
                },
            )
            .await;
        assert_eq!(result, Err("timeout"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
