//! The validated fork specification consumed by the engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

use super::types::{ConnectionConfig, RetryConfig, DEFAULT_CHUNK_SIZE, DEFAULT_TIMEOUT_SECS};
use super::validation;
use crate::error::Result;

/// Everything the engine needs to run one fork.
///
/// Built from a [`super::Config`] (or directly by library callers) and
/// validated once before any connection is opened. The snapshot stored in a
/// job record never carries passwords.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForkSpec {
    pub source: ConnectionConfig,
    pub destination: ConnectionConfig,
    pub target_database: String,
    pub schemas: Vec<String>,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub schema_only: bool,
    pub data_only: bool,
    pub drop_if_exists: bool,
    pub dry_run: bool,
    pub max_connections: usize,
    pub chunk_size: usize,
    pub timeout_secs: u64,
    pub retry: RetryConfig,
    pub job_id: Option<String>,
    pub resume: bool,
    pub state_dir: Option<PathBuf>,
    pub progress_file: Option<PathBuf>,
    pub progress_interval_secs: u64,
    pub verify: bool,
}

impl ForkSpec {
    /// Create a spec with default options.
    pub fn new(
        source: ConnectionConfig,
        destination: ConnectionConfig,
        target_database: impl Into<String>,
    ) -> Self {
        Self {
            source,
            destination,
            target_database: target_database.into(),
            schemas: vec!["public".to_string()],
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            schema_only: false,
            data_only: false,
            drop_if_exists: false,
            dry_run: false,
            max_connections: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry: RetryConfig::default(),
            job_id: None,
            resume: false,
            state_dir: None,
            progress_file: None,
            progress_interval_secs: 5,
            verify: true,
        }
    }

    /// Validate, collecting every violation.
    pub fn validate(&self) -> Result<()> {
        validation::check(self)
    }

    /// Overall job deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Fields that must match for a job to be resumed.
    pub fn resume_key(&self) -> ResumeKey {
        let mut include_tables = self.include_tables.clone();
        include_tables.sort();
        include_tables.dedup();
        let mut exclude_tables = self.exclude_tables.clone();
        exclude_tables.sort();
        exclude_tables.dedup();

        ResumeKey {
            source_host: self.source.host.clone(),
            source_port: self.source.port,
            source_database: self.source.database.clone(),
            source_user: self.source.user.clone(),
            destination_host: self.destination.host.clone(),
            destination_port: self.destination.port,
            destination_user: self.destination.user.clone(),
            target_database: self.target_database.clone(),
            schemas: self.schemas.clone(),
            include_tables,
            exclude_tables,
            schema_only: self.schema_only,
            data_only: self.data_only,
        }
    }

    /// SHA256 over the resume-relevant fields.
    pub fn fingerprint(&self) -> String {
        self.resume_key().fingerprint()
    }
}

/// The resume-relevant subset of a [`ForkSpec`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeKey {
    pub source_host: String,
    pub source_port: u16,
    pub source_database: String,
    pub source_user: String,
    pub destination_host: String,
    pub destination_port: u16,
    pub destination_user: String,
    pub target_database: String,
    pub schemas: Vec<String>,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub schema_only: bool,
    pub data_only: bool,
}

impl ResumeKey {
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Name of the first field that differs from `other`.
    pub fn first_difference(&self, other: &ResumeKey) -> Option<&'static str> {
        if self.source_host != other.source_host || self.source_port != other.source_port {
            return Some("source address");
        }
        if self.source_database != other.source_database {
            return Some("source database");
        }
        if self.source_user != other.source_user {
            return Some("source user");
        }
        if self.destination_host != other.destination_host
            || self.destination_port != other.destination_port
        {
            return Some("destination address");
        }
        if self.destination_user != other.destination_user {
            return Some("destination user");
        }
        if self.target_database != other.target_database {
            return Some("target database");
        }
        if self.schemas != other.schemas
            || self.include_tables != other.include_tables
            || self.exclude_tables != other.exclude_tables
        {
            return Some("table selection");
        }
        if self.schema_only != other.schema_only || self.data_only != other.data_only {
            return Some("fork mode");
        }
        None
    }
}
