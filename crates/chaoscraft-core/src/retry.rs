//! ---
//! cc_section: "01-core-functionality"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Bounded retry with exponential backoff for transient store errors."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use chaoscraft_store::StoreError;
use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

/// Retry policy applied to individual store calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    /// Delay before the second attempt; doubles on each further attempt.
    pub base_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = (attempt.saturating_sub(1) as u32).min(8);
        let base = self.base_delay.mul_f64(2u32.pow(exponent) as f64);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }

    /// Run `call` until it succeeds, fails with a non-transient error, or the
    /// attempts are exhausted. `on_retry` fires before every repeated attempt.
    pub async fn run<T, F, Fut, R>(
        &self,
        operation: &str,
        mut call: F,
        mut on_retry: R,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
        R: FnMut(),
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store error; retrying"
                    );
                    on_retry();
                    sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50), Duration::from_millis(25))
    }
}
