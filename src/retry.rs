//! Bounded retry for read-style cluster calls.
//!
//! Reads are retried a small, fixed number of times with a constant delay.
//! A read never aborts a run: once the attempt budget is spent (or the error
//! is terminal, such as NotFound) the caller-supplied fallback is returned.
//! The only error that escapes is cancellation.
//!
//! # Example
//!
//! ```ignore
//! use dataplane_installer::retry::{Fallback, RetryPolicy};
//!
//! let ready = RetryPolicy::default()
//!     .run("read operator deployment", &cancel, Fallback::value(false), || async {
//!         api.read_deployment("system", "operator").await.map(|d| is_ready(&d))
//!     })
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Default number of attempts for wrapped reads
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Default fixed delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Retry budget for a wrapped read
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (minimum 1)
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Value handed back when the wrapped call cannot succeed
pub enum Fallback<T> {
    /// A constant value
    Value(T),
    /// A value computed from the final error
    FromError(Box<dyn FnOnce(Error) -> T + Send>),
}

impl<T> Fallback<T> {
    /// Fall back to a constant
    pub fn value(value: T) -> Self {
        Fallback::Value(value)
    }

    /// Fall back to a value derived from the final error
    pub fn from_error(f: impl FnOnce(Error) -> T + Send + 'static) -> Self {
        Fallback::FromError(Box::new(f))
    }

    fn resolve(self, err: Error) -> T {
        match self {
            Fallback::Value(v) => v,
            Fallback::FromError(f) => f(err),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and delay
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `operation`, retrying transient failures.
    ///
    /// Returns the first success, otherwise the fallback. Terminal errors
    /// (see [`Error::is_retryable`]) go straight to the fallback without a
    /// second attempt. `Err` is returned only when `cancel` fires, whether
    /// during a call or during the delay between attempts.
    pub async fn run<F, Fut, T>(
        &self,
        message: &str,
        cancel: &CancellationToken,
        fallback: Fallback<T>,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled(message)),
                outcome = operation() => outcome,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            if !err.is_retryable() {
                debug!(
                    operation = %message,
                    attempt = attempt,
                    error = %err,
                    "terminal error, using fallback"
                );
                return Ok(fallback.resolve(err));
            }

            if attempt >= max_attempts {
                warn!(
                    operation = %message,
                    attempts = attempt,
                    error = %err,
                    "{}", message
                );
                return Ok(fallback.resolve(err));
            }

            debug!(
                operation = %message,
                attempt = attempt,
                error = %err,
                delay_ms = self.delay.as_millis(),
                "read failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled(message)),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}
