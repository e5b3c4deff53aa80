//! Bounded retry combinator.
//!
//! The attempt count and the retryable-error predicate are explicit
//! parameters, so a single-retry policy is visible at the call site.

use std::future::Future;
use std::time::Duration;

use vboxbuild_shared::errors::BuildResult;

/// How many times to run an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
        }
    }

    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent. The last error is returned.
///
/// `operation` receives the zero-based attempt number so it can perform
/// corrective work (such as deleting a stale resource) before retrying.
pub async fn retry<T, F, Fut, P>(policy: RetryPolicy, mut operation: F, is_retryable: P) -> BuildResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = BuildResult<T>>,
    P: Fn(&vboxbuild_shared::BuildError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !is_retryable(&err) {
                    return Err(err);
                }
                tracing::debug!(attempt, max_attempts, error = %err, "Retrying operation");
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
}
