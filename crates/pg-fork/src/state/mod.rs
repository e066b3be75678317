//! Job records for resume capability.

mod noop;

pub use noop::NoopStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::ForkSpec;
use crate::error::{ForkError, Result};
use crate::planner::{TableTask, TaskStatus, TransferPlan};

type HmacSha256 = Hmac<Sha256>;

/// Phase of a fork job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Planning,
    TargetCleanup,
    Schema,
    Data,
    Verify,
    Done,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Done | JobPhase::Failed)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobPhase::Planning => "planning",
            JobPhase::TargetCleanup => "target_cleanup",
            JobPhase::Schema => "schema",
            JobPhase::Data => "data",
            JobPhase::Verify => "verify",
            JobPhase::Done => "done",
            JobPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Persisted record of one fork.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkJob {
    pub job_id: String,

    /// Fingerprint of the resume-relevant spec fields; also the HMAC key.
    pub fingerprint: String,

    /// Spec snapshot, without passwords.
    pub spec: ForkSpec,

    pub plan: Option<TransferPlan>,

    /// One task per plan table, in plan order.
    pub tasks: Vec<TableTask>,

    pub phase: JobPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Count of `plan.pre_data` statements already applied.
    #[serde(default)]
    pub pre_data_applied: usize,

    /// Count of `plan.post_data` statements already applied.
    #[serde(default)]
    pub post_data_applied: usize,

    /// Whether this job created the target database.
    #[serde(default)]
    pub target_created: bool,

    pub error: Option<String>,

    /// HMAC-SHA256 over the record without this field, keyed by `fingerprint`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl ForkJob {
    pub fn new(job_id: impl Into<String>, spec: &ForkSpec) -> Self {
        let now = Utc::now();
        let mut snapshot = spec.clone();
        snapshot.source.password.clear();
        snapshot.destination.password.clear();

        Self {
            job_id: job_id.into(),
            fingerprint: spec.fingerprint(),
            spec: snapshot,
            plan: None,
            tasks: Vec::new(),
            phase: JobPhase::Planning,
            created_at: now,
            updated_at: now,
            pre_data_applied: 0,
            post_data_applied: 0,
            target_created: false,
            error: None,
            hmac: None,
        }
    }

    /// Attach the plan and create one pending task per table.
    pub fn set_plan(&mut self, plan: TransferPlan) {
        self.tasks = plan.tasks();
        self.plan = Some(plan);
    }

    /// Reject a resume whose spec differs in a resume-relevant field.
    pub fn validate_resume(&self, spec: &ForkSpec) -> Result<()> {
        if self.fingerprint == spec.fingerprint() {
            return Ok(());
        }
        let field = self
            .spec
            .resume_key()
            .first_difference(&spec.resume_key())
            .unwrap_or("fork specification");
        Err(ForkError::ResumeMismatch {
            job_id: self.job_id.clone(),
            field: field.to_string(),
        })
    }

    /// Requeue tasks interrupted by an earlier run.
    ///
    /// Returns the indices of tasks whose destination table may hold partial
    /// data and must be truncated before streaming again.
    pub fn requeue(&mut self) -> BTreeSet<usize> {
        self.tasks
            .iter_mut()
            .enumerate()
            .filter_map(|(i, task)| task.requeue().then_some(i))
            .collect()
    }

    /// Indices of tasks not yet completed.
    pub fn pending(&self) -> Vec<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status != TaskStatus::Completed)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn tables_completed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }

    pub fn rows_transferred(&self) -> u64 {
        self.tasks.iter().map(|t| t.rows_transferred).sum()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id.clone(),
            target_database: self.spec.target_database.clone(),
            phase: self.phase,
            tables_completed: self.tables_completed(),
            tables_total: self.tasks.len(),
            updated_at: self.updated_at,
            error: self.error.clone(),
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| ForkError::State(format!("failed to serialize job for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.fingerprint.as_bytes())
            .map_err(|e| ForkError::State(format!("failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// A copy carrying a fresh signature.
    pub fn signed(&self) -> Result<Self> {
        let mut signed = self.clone();
        signed.hmac = Some(self.compute_hmac()?);
        Ok(signed)
    }

    /// Check the signature of a record read from storage.
    pub fn verify_signature(&self) -> Result<()> {
        let Some(stored) = &self.hmac else {
            return Err(ForkError::State(format!(
                "job {} has no integrity signature",
                self.job_id
            )));
        };
        if *stored != self.compute_hmac()? {
            return Err(ForkError::State(format!(
                "job {} failed its integrity check: HMAC mismatch (possible tampering)",
                self.job_id
            )));
        }
        Ok(())
    }
}

/// One line of a job listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub target_database: String,
    pub phase: JobPhase,
    pub tables_completed: usize,
    pub tables_total: usize,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Storage for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist `job`, replacing any earlier record with the same id.
    async fn save(&self, job: &ForkJob) -> Result<()>;

    /// Load a job by id. `None` when no record exists.
    async fn load(&self, job_id: &str) -> Result<Option<ForkJob>>;

    /// All readable records, most recently updated first.
    async fn list(&self) -> Result<Vec<JobSummary>>;

    /// Delete a record. Returns whether one existed.
    async fn delete(&self, job_id: &str) -> Result<bool>;

    /// Whether saved jobs can be resumed later.
    fn is_persistent(&self) -> bool;

    fn backend_type(&self) -> &'static str;
}

/// One JSON file per job under a state directory.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf> {
        if job_id.is_empty()
            || job_id.contains(['/', '\\'])
            || job_id == "."
            || job_id == ".."
        {
            return Err(ForkError::State(format!("invalid job id {:?}", job_id)));
        }
        Ok(self.dir.join(format!("{}.json", job_id)))
    }

    async fn read(&self, path: &Path) -> Result<Option<ForkJob>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let job: ForkJob = serde_json::from_str(&content).map_err(|e| {
            ForkError::State(format!("unreadable job record {}: {}", path.display(), e))
        })?;
        job.verify_signature()?;
        Ok(Some(job))
    }
}

#[async_trait]
impl JobStore for FileStateStore {
    async fn save(&self, job: &ForkJob) -> Result<()> {
        let path = self.path_for(&job.job_id)?;
        let content = serde_json::to_string_pretty(&job.signed()?)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!("Saved job {} ({})", job.job_id, job.phase);
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<ForkJob>> {
        let path = self.path_for(job_id)?;
        self.read(&path).await
    }

    async fn list(&self) -> Result<Vec<JobSummary>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(job)) => jobs.push(job.summary()),
                Ok(None) => {}
                Err(e) => warn!("Skipping job record {}: {}", path.display(), e),
            }
        }

        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> Result<bool> {
        let path = self.path_for(job_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
