//! Job store used when no state directory is configured.
//!
//! Forks complete normally but cannot be resumed if interrupted.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use super::{ForkJob, JobStore, JobSummary};
use crate::error::Result;

/// Store that keeps nothing. Warns on first save.
pub struct NoopStateStore {
    warned: AtomicBool,
}

impl NoopStateStore {
    pub fn new() -> Self {
        Self {
            warned: AtomicBool::new(false),
        }
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!("No state directory configured: job state will not be persisted and this fork cannot be resumed");
        }
    }
}

impl Default for NoopStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for NoopStateStore {
    async fn save(&self, _job: &ForkJob) -> Result<()> {
        self.warn_once();
        Ok(())
    }

    async fn load(&self, _job_id: &str) -> Result<Option<ForkJob>> {
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<JobSummary>> {
        Ok(Vec::new())
    }

    async fn delete(&self, _job_id: &str) -> Result<bool> {
        Ok(false)
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn backend_type(&self) -> &'static str {
        "noop"
    }
}
