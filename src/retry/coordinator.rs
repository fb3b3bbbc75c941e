//! Retry coordinator: runs a remote call until it succeeds, fails fatally, or the retry
//! budget is spent.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::backoff::Backoff;
use super::classify::{ErrorClass, classify};
use crate::errors::{RemoteError, RetryError};
use crate::shutdown::Shutdown;

/// Fallback wait after a rate-limit signal with no advertised wait.
/// Chosen to outlast a 60 s free-tier window.
pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(65);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` means try once
    pub max_retries: u32,
    /// Delay before the first retry of a transient error
    pub base_delay: Duration,
    /// Upper bound on backoff delays (not applied to rate-limit waits)
    pub max_delay: Duration,
    /// Wait after a rate-limit signal that carried no retry-after hint
    pub rate_limit_delay: Duration,
    /// Maximum random extra delay added to backoff steps
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_secs(60),
            rate_limit_delay: DEFAULT_RATE_LIMIT_DELAY,
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(self.base_delay, self.max_delay).with_jitter(self.jitter)
    }

    /// Wait before retrying after `err` on the given 0-based attempt.
    pub fn delay_after(&self, attempt: u32, class: ErrorClass, err: &RemoteError) -> Duration {
        match class {
            ErrorClass::RateLimitRetry => err.retry_after.unwrap_or(self.rate_limit_delay),
            _ => self.backoff().jittered(attempt),
        }
    }
}

/// Wraps remote calls with classification and backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    shutdown: Option<Shutdown>,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            shutdown: None,
        }
    }

    /// Cut retry waits short when `shutdown` is triggered.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(Shutdown::is_triggered)
    }

    /// Run `op` until it succeeds.
    ///
    /// `op` receives the 0-based attempt number. Fatal errors return immediately without
    /// consuming the budget; once `max_retries` retries have failed the last error is
    /// returned inside [`RetryError::Exhausted`].
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = classify(&err);
            if class == ErrorClass::Fatal {
                return Err(RetryError::Fatal(err));
            }
            if attempt >= self.policy.max_retries {
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: err,
                });
            }

            let delay = self.policy.delay_after(attempt, class, &err);
            warn!(
                attempt = attempt + 1,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                class = ?class,
                error = %err,
                "Remote call failed; retrying"
            );
            self.wait(delay).await?;
            attempt += 1;
        }
    }

    async fn wait(&self, delay: Duration) -> Result<(), RetryError> {
        let Some(shutdown) = &self.shutdown else {
            tokio::time::sleep(delay).await;
            return Ok(());
        };
        if shutdown.is_triggered() {
            return Err(RetryError::Cancelled);
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = shutdown.triggered() => Err(RetryError::Cancelled),
        }
    }
}
