//! Cancellation and deadline shared by every task of one fork.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ForkError, Result};

/// Cancellation signal plus the job's overall deadline.
///
/// Cloning is cheap; clones observe the same token and deadline.
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// A context without deadline that is never cancelled.
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    /// A context cancelled with this one, or on its own via [`RunContext::cancel`].
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail if cancelled or past the deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ForkError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(deadline_exceeded());
            }
        }
        Ok(())
    }

    /// Sleep for `delay`, waking early on cancellation or at the deadline.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        let wake = Instant::now() + delay;
        let (until, hits_deadline) = match self.deadline {
            Some(deadline) if deadline < wake => (deadline, true),
            _ => (wake, false),
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ForkError::Cancelled),
            _ = tokio::time::sleep_until(until) => {
                if hits_deadline {
                    Err(deadline_exceeded())
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Run `fut` unless the deadline passes first.
    ///
    /// Cancellation is not applied here: an in-flight statement or chunk is
    /// allowed to finish so its commit boundary stays intact.
    pub async fn within_deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| deadline_exceeded())?,
            None => fut.await,
        }
    }
}

fn deadline_exceeded() -> ForkError {
    ForkError::Timeout("fork deadline exceeded".to_string())
}
