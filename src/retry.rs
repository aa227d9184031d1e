//! Retry policies for transient device failures.
//!
//! The executor never retries on its own. Owners decide: the scan
//! orchestrator retries transient poll failures with a [`RetryPolicy`],
//! the camera watchdog reconnects on a capped exponential [`Backoff`].

use crate::error::DeviceError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    #[serde(with = "humantime_serde")]
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails fatally or exhausts the attempts.
    ///
    /// Only transient errors are retried. `op` receives the 1-based attempt.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, DeviceError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    debug!(device = %err.device, attempt, error = %err, "transient failure, retrying");
                    attempt += 1;
                    sleep(self.backoff_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Capped exponential backoff.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Backoff starting at `initial` and doubling up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Delay before the next attempt; doubles each call up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        let delay = self.initial.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(8));
        let delays: Vec<_> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000, 8000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retry_logic_succeeds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
        };
        let id = DeviceId::from("ct400");
        let calls = AtomicU32::new(0);
        let result = policy
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                let id = id.clone();
                async move {
                    if attempt < 2 {
                        Err(DeviceError::busy(&id))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(logs_contain("transient failure, retrying"));
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
        };
        let id = DeviceId::from("ct400");
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let id = id.clone();
                async move { Err(DeviceError::busy(&id)) }
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_secs(10),
        };
        let id = DeviceId::from("ct400");
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = policy
            .run(|_| {
                let id = id.clone();
                async move { Err(DeviceError::busy(&id)) }
            })
            .await;
        assert!(result.is_err());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(20) && waited < Duration::from_secs(21));
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let id = DeviceId::from("ct400");
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let id = id.clone();
                async move { Err(DeviceError::removed(&id)) }
            })
            .await;
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
