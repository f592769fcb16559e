// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry harness with error-class-specific recovery.
//!
//! Wraps one async operation. Each failure is classified through
//! [`ForgeError::class`] and answered with both a delay (from a configurable
//! schedule) and a class-specific recovery action supplied by the caller via
//! [`RecoveryHooks`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

use forge_error::{ErrorClass, ForgeError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// RetrySchedule
// ---------------------------------------------------------------------------

/// Delay schedule applied between attempts.
///
/// Past the end of the configured sequence the schedule continues with
/// exponential backoff, doubling from the last entry.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
    max_retries: u32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            max_retries: 3,
        }
    }
}

impl RetrySchedule {
    /// Create a schedule with explicit delays and retry cap.
    ///
    /// An empty `delays` sequence falls back to a 1-second base.
    #[must_use]
    pub fn new(delays: Vec<Duration>, max_retries: u32) -> Self {
        let delays = if delays.is_empty() {
            vec![Duration::from_secs(1)]
        } else {
            delays
        };
        Self {
            delays,
            max_retries,
        }
    }

    /// A zero-delay schedule, useful in tests.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(vec![Duration::ZERO], max_retries)
    }

    /// Maximum number of retries (total attempts = `max_retries + 1`).
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the retry that follows attempt `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = attempt as usize;
        if idx < self.delays.len() {
            return self.delays[idx];
        }
        // Exponential backoff with base = last configured entry.
        let last = *self.delays.last().expect("schedule is never empty");
        let exp = (idx - self.delays.len() + 1).min(16) as u32;
        last.saturating_mul(2u32.saturating_pow(exp))
    }
}

// ---------------------------------------------------------------------------
// RecoveryHooks
// ---------------------------------------------------------------------------

/// Class-specific recovery actions supplied by the caller.
///
/// All hooks default to no-ops; implement only what the wrapped operation
/// can act on. The harness calls at most one hook per failed attempt.
#[async_trait::async_trait]
pub trait RecoveryHooks: Send + Sync {
    /// Shrink the prompt context before the next attempt (`token_limit`).
    async fn reduce_context(&self, _attempt: u32) {}

    /// Feed the parser error back into the next prompt (`generation`).
    async fn add_feedback(&self, _message: &str) {}

    /// Switch to an alternative strategy (`validation`).
    async fn try_alternative(&self, _attempt: u32) {}

    /// Raise the operation timeout; invoked at most once per operation
    /// (`timeout`).
    async fn increase_timeout(&self) {}
}

/// The do-nothing hook set.
pub struct NoRecovery;

#[async_trait::async_trait]
impl RecoveryHooks for NoRecovery {}

// ---------------------------------------------------------------------------
// RetryHarness
// ---------------------------------------------------------------------------

/// Retries one async operation according to a [`RetrySchedule`], applying
/// the recovery action matching each failure's [`ErrorClass`].
///
/// Non-retryable classes (`auth`, `unrecoverable`) and exhausted schedules
/// propagate the last error unchanged.
pub struct RetryHarness {
    schedule: RetrySchedule,
    hooks: Arc<dyn RecoveryHooks>,
}

impl RetryHarness {
    /// Create a harness with the given schedule and no-op hooks.
    #[must_use]
    pub fn new(schedule: RetrySchedule) -> Self {
        Self {
            schedule,
            hooks: Arc::new(NoRecovery),
        }
    }

    /// Attach recovery hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn RecoveryHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Borrow the schedule.
    #[must_use]
    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    /// Run `op` until it succeeds, fails unrecoverably, or the schedule is
    /// exhausted. The closure receives the 0-based attempt number.
    ///
    /// # Errors
    ///
    /// Propagates the last [`ForgeError`] after `max_retries + 1` attempts,
    /// or immediately for non-retryable classes.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, ForgeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ForgeError>>,
    {
        let mut timeout_raised = false;

        for attempt in 0..=self.schedule.max_retries {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let class = err.class();
                    if !class.is_retryable() {
                        warn!(
                            target: "forge.retry",
                            class = %class,
                            attempt,
                            "non-retryable failure"
                        );
                        return Err(err);
                    }
                    if attempt == self.schedule.max_retries {
                        warn!(
                            target: "forge.retry",
                            class = %class,
                            attempt,
                            "retries exhausted"
                        );
                        return Err(err);
                    }

                    let delay = self.recover(&err, class, attempt, &mut timeout_raised).await;
                    debug!(
                        target: "forge.retry",
                        class = %class,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        unreachable!("loop returns on the final attempt")
    }

    /// Apply the class-specific recovery action and return the delay to
    /// sleep before the next attempt.
    async fn recover(
        &self,
        err: &ForgeError,
        class: ErrorClass,
        attempt: u32,
        timeout_raised: &mut bool,
    ) -> Duration {
        let scheduled = self.schedule.delay_for(attempt);
        match class {
            ErrorClass::RateLimit => err.retry_after.unwrap_or(scheduled),
            ErrorClass::TokenLimit => {
                self.hooks.reduce_context(attempt + 1).await;
                scheduled
            }
            ErrorClass::Generation => {
                self.hooks.add_feedback(&err.message).await;
                scheduled
            }
            ErrorClass::Validation => {
                self.hooks.try_alternative(attempt + 1).await;
                scheduled
            }
            ErrorClass::Timeout => {
                if !*timeout_raised {
                    self.hooks.increase_timeout().await;
                    *timeout_raised = true;
                }
                scheduled
            }
            ErrorClass::Network | ErrorClass::ToolError => scheduled,
            // Filtered out before recover() is reached.
            ErrorClass::Auth | ErrorClass::Unrecoverable => scheduled,
        }
    }
}

impl Default for RetryHarness {
    fn default() -> Self {
        Self::new(RetrySchedule::default())
    }
}
