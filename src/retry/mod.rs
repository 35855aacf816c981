//! Retry with exponential backoff
//!
//! [`RetryPolicy::run`] re-invokes an operation while [`classifier`] says the
//! failure is transient. The wait between attempts doubles each time and is
//! interrupted by the operation context; an interrupted wait, an exhausted
//! budget and a permanent failure all return the operation's own last error.

pub mod classifier;

pub use classifier::is_retryable;

use crate::context::OperationContext;
use crate::error::Result;
use crate::logging::Logger;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt; zero means a single attempt
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Wait before retry number `attempt + 1`: `base_delay * 2^attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Invoke `operation` until it succeeds, fails permanently, runs out of
    /// retries or `ctx` fires during a backoff wait
    pub async fn run<F, Fut, T>(
        &self,
        ctx: &OperationContext,
        logger: &Logger,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            if !is_retryable(&err) {
                logger.debug(&format!("Not retrying permanent error: {}", err.chain()));
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            logger.warning(&format!(
                "Attempt {} of {} failed: {}; retrying in {:?}",
                attempt + 1,
                self.max_retries + 1,
                err.chain(),
                delay
            ));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                reason = ctx.done() => {
                    logger.debug(&format!("Retry wait interrupted: {}", reason));
                    return Err(err);
                }
            }
            attempt += 1;
        }
    }
}
