//! Retry policy with exponential backoff.
//!
//! The policy is a value: a classifier deciding which errors are worth
//! another attempt, plus a backoff schedule. Call sites hand it a unit of
//! work instead of writing their own loops.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{ForkError, Result};
use crate::orchestrator::RunContext;

/// Decides whether an error may succeed on a later attempt.
pub type Classifier = fn(&ForkError) -> bool;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    classifier: Classifier,
}

impl RetryPolicy {
    /// Build from configuration, retrying connection and timeout errors.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            classifier: ForkError::is_retryable,
        }
    }

    /// Replace the classifier.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based): doubling from the
    /// initial delay, capped at the maximum.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, ctx: &RunContext, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            ctx.check()?;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => self.recover(ctx, what, attempt, e).await?,
            }
            attempt += 1;
        }
    }

    /// Decide what happens after attempt `attempt` failed with `err`.
    ///
    /// Returns `Ok(())` once the backoff delay has elapsed and another attempt
    /// should be made; otherwise the error to surface. For call sites whose
    /// unit of work borrows mutable state across attempts.
    pub async fn recover(
        &self,
        ctx: &RunContext,
        what: &str,
        attempt: u32,
        err: ForkError,
    ) -> Result<()> {
        if !(self.classifier)(&err) {
            return Err(err);
        }
        if attempt >= self.max_attempts {
            return Err(ForkError::ExhaustedRetries {
                attempts: attempt,
                source: Box::new(err),
            });
        }

        let delay = self.delay_for(attempt);
        warn!(
            attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "{} failed, retrying: {}",
            what,
            err
        );
        ctx.sleep(delay).await
    }
}
