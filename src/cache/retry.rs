//! Retry/Backoff Executor
//!
//! Wraps any fallible async operation with bounded exponential backoff.
//! An operation runs at most `max_retries + 1` times and the total sleep is
//! bounded by `max_retries * max_delay`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Decides whether a failed attempt is retried: `(error, attempt_number)`
pub type RetryPredicate = Arc<dyn Fn(&Error, u32) -> bool + Send + Sync>;

/// Observes each retry: `(error, attempt_number, delay_before_retry)`
pub type RetryHook = Arc<dyn Fn(&Error, u32, Duration) + Send + Sync>;

/// Default predicate: retry transient failures only
///
/// Network, timeout and 5xx-class failures are retried; client failures and
/// quota exhaustion are not.
pub fn default_should_retry(error: &Error, _attempt: u32) -> bool {
    error.is_transient()
}

/// Retry policy (value object)
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor per retry
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    should_retry: RetryPredicate,
    on_retry: Option<RetryHook>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .field("has_on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Build from configuration with the default predicate
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            backoff_multiplier: config.backoff_multiplier,
            max_delay: config.max_delay,
            should_retry: Arc::new(default_should_retry),
            on_retry: None,
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set retry count and delays
    pub fn with_backoff(
        mut self,
        max_retries: u32,
        base_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self.backoff_multiplier = backoff_multiplier;
        self.max_delay = max_delay;
        self
    }

    /// Replace the retry predicate
    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Register a retry observer
    pub fn with_on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Whether `error` on `attempt` (1-based) should be retried
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        (self.should_retry)(error, attempt)
    }

    /// Delay before retry number `retry` (0-based):
    /// `min(base_delay * multiplier^retry, max_delay)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_secs_f64() * 1000.0 * factor;
        let capped = millis.min(self.max_delay.as_secs_f64() * 1000.0);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_micros((capped * 1000.0) as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Upper bound on the total time spent sleeping between attempts
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_retries).map(|r| self.delay_for(r)).sum()
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, the predicate refuses, or retries run out
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        execute(&self.policy, op).await
    }
}

/// Run `op` under `policy`, returning the last error when giving up
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(retries = retry, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                let attempt = retry + 1;
                if retry >= policy.max_retries || !policy.should_retry(&e, attempt) {
                    if retry > 0 {
                        warn!(attempts = attempt, error = %e, "Giving up after retries");
                    }
                    return Err(e);
                }

                let delay = policy.delay_for(retry);
                warn!(
                    "Attempt {}/{} failed, retrying in {:?}: {}",
                    attempt,
                    policy.max_retries + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                if let Some(hook) = &policy.on_retry {
                    hook(&e, attempt, delay);
                }
                retry += 1;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
