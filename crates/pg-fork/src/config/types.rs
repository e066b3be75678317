//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Worker count used when `max_connections` is not set: cores - 2, kept within 2..=16.
    pub fn default_max_connections(&self) -> usize {
        self.cpu_cores.saturating_sub(2).clamp(2, 16)
    }
}

/// Root configuration structure, as loaded from YAML and overridden by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database (the database being forked). Only ever read from.
    pub source: ConnectionConfig,

    /// Destination server. `database` names the maintenance database used
    /// to create or drop the target.
    pub destination: ConnectionConfig,

    /// Fork behavior.
    #[serde(default)]
    pub fork: ForkOptions,
}

/// One PostgreSQL endpoint.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Database host.
    #[serde(default)]
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    #[serde(default)]
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password. Never written to job state files.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: disable).
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// Connect timeout in seconds (default: 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Application name reported to the server.
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl ConnectionConfig {
    /// Create a config with defaults for everything but the address and credentials.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: password.into(),
            ssl_mode: default_ssl_mode(),
            connect_timeout_secs: default_connect_timeout(),
            application_name: default_application_name(),
        }
    }

    /// The same endpoint pointed at another database.
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.database = database.into();
        config
    }

    /// `host:port/database` for log lines.
    pub fn display_name(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Retry behavior for connection acquisition, chunk writes and DDL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum attempts including the first (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds (default: 500).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Fork behavior configuration.
/// Performance fields use Option<T> to distinguish "not set" (auto-tuned
/// default) from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkOptions {
    /// Name of the database to create.
    #[serde(default)]
    pub target_database: String,

    /// Source schemas to fork (default: ["public"]).
    #[serde(default = "default_schemas")]
    pub schemas: Vec<String>,

    /// Tables to include (allow-list). Entries are `schema.table` or `table`.
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Tables to exclude (deny-list, applied after include).
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Create the schema only, move no rows.
    #[serde(default)]
    pub schema_only: bool,

    /// Move rows only; the destination schema must already exist.
    #[serde(default)]
    pub data_only: bool,

    /// Drop the target database first if it exists.
    #[serde(default)]
    pub drop_if_exists: bool,

    /// Plan and validate only.
    #[serde(default)]
    pub dry_run: bool,

    /// Parallel table workers. Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Rows per chunk (default: 10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Overall job deadline in seconds (default: 3600).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Retry behavior.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Job identifier. Generated when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Resume the job named by `job_id`.
    #[serde(default)]
    pub resume: bool,

    /// Directory holding job state files. No state is persisted without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// File receiving progress snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_file: Option<PathBuf>,

    /// Minimum seconds between progress writes during a long table (default: 5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_interval_secs: Option<u64>,

    /// Compare destination row counts after the transfer (default: true).
    #[serde(default = "default_true")]
    pub verify: bool,
}

impl Default for ForkOptions {
    fn default() -> Self {
        Self {
            target_database: String::new(),
            schemas: default_schemas(),
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            schema_only: false,
            data_only: false,
            drop_if_exists: false,
            dry_run: false,
            max_connections: None,
            chunk_size: None,
            timeout_secs: None,
            retry: RetryConfig::default(),
            job_id: None,
            resume: false,
            state_dir: None,
            progress_file: None,
            progress_interval_secs: None,
            verify: true,
        }
    }
}

impl ForkOptions {
    /// Fill in unset performance values from detected resources.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.max_connections.is_none() {
            self.max_connections = Some(resources.default_max_connections());
            info!(
                "Auto-tuned max_connections={} ({} CPU cores, {:.1} GB RAM)",
                resources.default_max_connections(),
                resources.cpu_cores,
                resources.total_memory_gb
            );
        }
        self
    }

    pub fn get_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(4)
    }

    pub fn get_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn get_timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    pub fn get_progress_interval_secs(&self) -> u64 {
        self.progress_interval_secs.unwrap_or(5)
    }
}

/// Default rows per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Default overall job deadline.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_application_name() -> String {
    "pg-fork".to_string()
}

fn default_schemas() -> Vec<String> {
    vec!["public".to_string()]
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}
