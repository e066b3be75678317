//! Error types for the fork engine.
//!
//! Every failure the engine can surface is a [`ForkError`]. Callers that need
//! to branch on the failure class (the retry policy, the CLI exit code) use
//! [`ForkError::kind`] instead of matching on messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_postgres::error::SqlState;

use crate::config::template::TemplateError;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Dotted path of the offending field (e.g. `fork.chunk_size`).
    pub field: String,

    /// Human readable explanation.
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Classification of a [`ForkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Planning,
    Permission,
    Connection,
    Timeout,
    SchemaMismatch,
    ResumeMismatch,
    Cancelled,
    ExhaustedRetries,
    Constraint,
    Validation,
    Config,
    State,
    Verification,
    Database,
    Io,
}

/// Main error type for fork operations.
#[derive(Error, Debug)]
pub enum ForkError {
    /// Planning failed (missing source, target conflict, empty selection).
    #[error("Planning error: {0}")]
    Planning(String),

    /// Authentication or privilege failure. Never retried.
    #[error("Permission error: {0}")]
    Permission(String),

    /// Connection refused, reset or otherwise lost. Retryable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Statement or job deadline exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Destination schema cannot receive the source data (data-only mode).
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The persisted job was created from a different fork specification.
    #[error("Cannot resume job {job_id}: {field} changed since the job was created")]
    ResumeMismatch { job_id: String, field: String },

    /// The caller cancelled the fork.
    #[error("Fork cancelled")]
    Cancelled,

    /// A retryable operation kept failing.
    #[error("Gave up after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Box<ForkError>,
    },

    /// A table task failed; wraps the classified cause.
    #[error("Table {table} failed: {source}")]
    Table {
        table: String,
        #[source]
        source: Box<ForkError>,
    },

    /// Configuration failed validation.
    #[error("Invalid configuration: {}", format_violations(.0))]
    Validation(Vec<FieldViolation>),

    /// Name template could not be rendered.
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// Configuration error (unreadable YAML, bad override, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job state file error.
    #[error("State error: {0}")]
    State(String),

    /// Rows or DDL rejected by an integrity constraint.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Post-transfer verification failed.
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Database error reported by the server or the driver.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Connection pool error with context.
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// IO error (state and progress files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ForkError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        ForkError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Attach the failing table's name to an error.
    pub fn for_table(self, table: impl Into<String>) -> Self {
        match self {
            // Cancellation is caller-initiated and stays unwrapped.
            ForkError::Cancelled => ForkError::Cancelled,
            already @ ForkError::Table { .. } => already,
            other => ForkError::Table {
                table: table.into(),
                source: Box::new(other),
            },
        }
    }

    /// Convert a deadpool error, keeping the server error when there is one.
    pub fn from_pool_error(err: deadpool_postgres::PoolError, context: &str) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => ForkError::Database(e),
            deadpool_postgres::PoolError::Timeout(_) => {
                ForkError::Connection(format!("timed out waiting for a connection ({})", context))
            }
            other => ForkError::pool(other, context),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForkError::Planning(_) => ErrorKind::Planning,
            ForkError::Permission(_) => ErrorKind::Permission,
            ForkError::Connection(_) | ForkError::Pool { .. } => ErrorKind::Connection,
            ForkError::Timeout(_) => ErrorKind::Timeout,
            ForkError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            ForkError::ResumeMismatch { .. } => ErrorKind::ResumeMismatch,
            ForkError::Cancelled => ErrorKind::Cancelled,
            ForkError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            ForkError::Table { source, .. } => source.kind(),
            ForkError::Validation(_) | ForkError::Template(_) => ErrorKind::Validation,
            ForkError::Config(_) | ForkError::Yaml(_) => ErrorKind::Config,
            ForkError::State(_) | ForkError::Json(_) => ErrorKind::State,
            ForkError::Constraint(_) => ErrorKind::Constraint,
            ForkError::Verification(_) => ErrorKind::Verification,
            ForkError::Io(_) => ErrorKind::Io,
            ForkError::Database(e) => classify_pg_error(e),
        }
    }

    /// Whether a retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Timeout)
    }

    /// Whether the server rejected DDL because the object already exists.
    pub fn is_duplicate_object(&self) -> bool {
        match self {
            ForkError::Database(e) => e.code().is_some_and(|code| {
                [
                    SqlState::DUPLICATE_TABLE,
                    SqlState::DUPLICATE_OBJECT,
                    SqlState::DUPLICATE_SCHEMA,
                    SqlState::DUPLICATE_COLUMN,
                ]
                .contains(code)
            }),
            ForkError::ExhaustedRetries { source, .. } | ForkError::Table { source, .. } => {
                source.is_duplicate_object()
            }
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::Config => 1,
            ErrorKind::Planning => 2,
            ErrorKind::Permission => 3,
            ErrorKind::Connection | ErrorKind::ExhaustedRetries => 4,
            ErrorKind::Timeout => 5,
            ErrorKind::SchemaMismatch | ErrorKind::Verification => 6,
            ErrorKind::Io => 7,
            ErrorKind::ResumeMismatch | ErrorKind::State => 8,
            ErrorKind::Constraint | ErrorKind::Database => 9,
            ErrorKind::Cancelled => 130,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Classify a driver error by SQLSTATE.
pub fn classify_pg_error(err: &tokio_postgres::Error) -> ErrorKind {
    let Some(code) = err.code() else {
        // No SQLSTATE: the failure happened below the protocol (I/O, closed socket).
        return ErrorKind::Connection;
    };

    classify_sqlstate(code)
}

/// Classify a SQLSTATE code.
pub fn classify_sqlstate(code: &SqlState) -> ErrorKind {
    let raw = code.code();

    if *code == SqlState::QUERY_CANCELED {
        return ErrorKind::Timeout;
    }
    if *code == SqlState::INSUFFICIENT_PRIVILEGE || raw.starts_with("28") {
        return ErrorKind::Permission;
    }
    if raw.starts_with("08")
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
        || *code == SqlState::OBJECT_IN_USE
        || *code == SqlState::T_R_SERIALIZATION_FAILURE
        || *code == SqlState::T_R_DEADLOCK_DETECTED
        || *code == SqlState::TOO_MANY_CONNECTIONS
    {
        return ErrorKind::Connection;
    }
    if raw.starts_with("23") {
        return ErrorKind::Constraint;
    }
    if *code == SqlState::INVALID_CATALOG_NAME {
        return ErrorKind::Planning;
    }

    ErrorKind::Database
}

/// Result type alias for fork operations.
pub type Result<T> = std::result::Result<T, ForkError>;
