//! Fork specification validation.
//!
//! Validation is a plain function over the spec that reports every
//! violation at once, so a caller fixing a config file sees all problems in
//! one run.

use std::collections::BTreeSet;

use super::fork_spec::ForkSpec;
use super::types::ConnectionConfig;
use crate::connection::tls::SslMode;
use crate::error::{FieldViolation, ForkError, Result};

/// PostgreSQL truncates identifiers longer than this.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Collect every violation in `spec`.
pub fn validate(spec: &ForkSpec) -> Vec<FieldViolation> {
    let mut violations = Vec::new();

    validate_endpoint("source", &spec.source, &mut violations);
    validate_endpoint("destination", &spec.destination, &mut violations);

    if let Err(message) = check_identifier(&spec.target_database) {
        violations.push(FieldViolation::new("fork.target_database", message));
    }

    if spec.source.host == spec.destination.host
        && spec.source.port == spec.destination.port
        && spec.source.database == spec.target_database
    {
        violations.push(FieldViolation::new(
            "fork.target_database",
            "must differ from the source database on the same server",
        ));
    }

    if spec.schemas.is_empty() {
        violations.push(FieldViolation::new(
            "fork.schemas",
            "at least one schema is required",
        ));
    }
    if spec.schemas.iter().any(|s| s.trim().is_empty()) {
        violations.push(FieldViolation::new(
            "fork.schemas",
            "schema names cannot be empty",
        ));
    }

    if spec.include_tables.iter().any(|t| t.trim().is_empty()) {
        violations.push(FieldViolation::new(
            "fork.include_tables",
            "table names cannot be empty",
        ));
    }
    if spec.exclude_tables.iter().any(|t| t.trim().is_empty()) {
        violations.push(FieldViolation::new(
            "fork.exclude_tables",
            "table names cannot be empty",
        ));
    }

    let include: BTreeSet<&str> = spec.include_tables.iter().map(|t| t.trim()).collect();
    let overlap: Vec<&str> = spec
        .exclude_tables
        .iter()
        .map(|t| t.trim())
        .filter(|t| include.contains(t))
        .collect();
    if !overlap.is_empty() {
        violations.push(FieldViolation::new(
            "fork.exclude_tables",
            format!("tables listed in both include and exclude: {}", overlap.join(", ")),
        ));
    }

    if spec.schema_only && spec.data_only {
        violations.push(FieldViolation::new(
            "fork.data_only",
            "schema_only and data_only are mutually exclusive",
        ));
    }
    if spec.data_only && spec.drop_if_exists {
        violations.push(FieldViolation::new(
            "fork.drop_if_exists",
            "data_only requires an existing target and cannot drop it",
        ));
    }

    if spec.max_connections == 0 {
        violations.push(FieldViolation::new(
            "fork.max_connections",
            "must be at least 1",
        ));
    }
    if spec.chunk_size == 0 {
        violations.push(FieldViolation::new("fork.chunk_size", "must be at least 1"));
    }
    if spec.timeout_secs == 0 {
        violations.push(FieldViolation::new("fork.timeout_secs", "must be at least 1"));
    }
    if spec.retry.max_attempts == 0 {
        violations.push(FieldViolation::new(
            "fork.retry.max_attempts",
            "must be at least 1",
        ));
    }
    if spec.retry.initial_delay_ms > spec.retry.max_delay_ms {
        violations.push(FieldViolation::new(
            "fork.retry.initial_delay_ms",
            "cannot exceed max_delay_ms",
        ));
    }

    if spec.resume {
        if spec.job_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            violations.push(FieldViolation::new(
                "fork.job_id",
                "resume requires a job id",
            ));
        }
        if spec.state_dir.is_none() {
            violations.push(FieldViolation::new(
                "fork.state_dir",
                "resume requires a state directory",
            ));
        }
    }
    if let Some(id) = &spec.job_id {
        if id.is_empty() || id.contains(['/', '\\', '\0']) || id.starts_with('.') {
            violations.push(FieldViolation::new(
                "fork.job_id",
                "must be non-empty and usable as a file name",
            ));
        }
    }

    violations
}

/// Validate and convert violations into an error.
pub fn check(spec: &ForkSpec) -> Result<()> {
    let violations = validate(spec);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ForkError::Validation(violations))
    }
}

fn validate_endpoint(prefix: &str, config: &ConnectionConfig, out: &mut Vec<FieldViolation>) {
    if config.host.is_empty() {
        out.push(FieldViolation::new(format!("{prefix}.host"), "is required"));
    }
    if config.port == 0 {
        out.push(FieldViolation::new(format!("{prefix}.port"), "must be non-zero"));
    }
    if config.database.is_empty() {
        out.push(FieldViolation::new(
            format!("{prefix}.database"),
            "is required",
        ));
    }
    if config.user.is_empty() {
        out.push(FieldViolation::new(format!("{prefix}.user"), "is required"));
    }
    if let Err(e) = SslMode::parse(&config.ssl_mode) {
        out.push(FieldViolation::new(format!("{prefix}.ssl_mode"), e.to_string()));
    }
}

/// Check that `name` is usable as a PostgreSQL database name.
pub fn check_identifier(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("is required".to_string());
    }
    if name.contains('\0') {
        return Err("cannot contain NUL bytes".to_string());
    }
    if name.len() > MAX_IDENTIFIER_BYTES {
        return Err(format!(
            "exceeds {} bytes (got {})",
            MAX_IDENTIFIER_BYTES,
            name.len()
        ));
    }
    Ok(())
}
