//! Configuration loading and validation.

mod fork_spec;
pub mod template;
mod types;
mod validation;

pub use fork_spec::{ForkSpec, ResumeKey};
pub use types::*;
pub use validation::{check_identifier, validate as validate_spec, MAX_IDENTIFIER_BYTES};

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// The file is only parsed here; validation happens in [`Config::into_spec`]
    /// so CLI overrides can be applied first.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// An empty configuration, for callers that build everything from flags.
    pub fn empty() -> Self {
        Self {
            source: ConnectionConfig::new("", 5432, "", "", ""),
            destination: ConnectionConfig::new("", 5432, "postgres", "", ""),
            fork: ForkOptions::default(),
        }
    }

    /// Apply auto-tuned defaults based on system resources.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        self.fork = self.fork.with_auto_tuning(&resources);
        self
    }

    /// Resolve defaults and validate, producing the engine's input.
    pub fn into_spec(self) -> Result<ForkSpec> {
        let fork = self.fork;
        let spec = ForkSpec {
            source: self.source,
            destination: self.destination,
            target_database: fork.target_database.clone(),
            schemas: fork.schemas.clone(),
            include_tables: fork.include_tables.clone(),
            exclude_tables: fork.exclude_tables.clone(),
            schema_only: fork.schema_only,
            data_only: fork.data_only,
            drop_if_exists: fork.drop_if_exists,
            dry_run: fork.dry_run,
            max_connections: fork.get_max_connections(),
            chunk_size: fork.get_chunk_size(),
            timeout_secs: fork.get_timeout_secs(),
            retry: fork.retry.clone(),
            job_id: fork.job_id.clone(),
            resume: fork.resume,
            state_dir: fork.state_dir.clone(),
            progress_file: fork.progress_file.clone(),
            progress_interval_secs: fork.get_progress_interval_secs(),
            verify: fork.verify,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.clone().into_spec().map(|_| ())
    }

    /// Fingerprint of the resume-relevant settings; see [`ForkSpec::fingerprint`].
    pub fn fingerprint(&self) -> Result<String> {
        Ok(self.clone().into_spec()?.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForkError;

    const YAML: &str = r#"
source:
  host: prod-db.internal
  database: app
  user: readonly
  password: s3cret
  ssl_mode: require
destination:
  host: preview-db.internal
  database: postgres
  user: admin
  password: s3cret
fork:
  target_database: app_preview
  exclude_tables: [audit_logs]
  chunk_size: 5000
  retry:
    max_attempts: 3
"#;

    #[test]
    fn test_from_yaml_with_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 5432);
        assert_eq!(config.source.ssl_mode, "require");
        assert_eq!(config.destination.ssl_mode, "disable");
        assert_eq!(config.fork.schemas, vec!["public".to_string()]);
        assert_eq!(config.fork.retry.max_attempts, 3);
        assert_eq!(config.fork.retry.initial_delay_ms, 500);
        assert!(config.fork.verify);
    }

    #[test]
    fn test_into_spec_resolves_defaults() {
        let spec = Config::from_yaml(YAML).unwrap().into_spec().unwrap();
        assert_eq!(spec.chunk_size, 5000);
        assert_eq!(spec.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(spec.max_connections, 4);
        assert_eq!(spec.exclude_tables, vec!["audit_logs".to_string()]);
    }

    #[test]
    fn test_into_spec_reports_violations() {
        let mut config = Config::from_yaml(YAML).unwrap();
        config.fork.chunk_size = Some(0);
        config.fork.include_tables = vec!["audit_logs".into()];
        match config.into_spec() {
            Err(ForkError::Validation(v)) => assert_eq!(v.len(), 2),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_fingerprint_ignores_tuning() {
        let config = Config::from_yaml(YAML).unwrap();
        let mut tuned = config.clone();
        tuned.fork.chunk_size = Some(100);
        assert_eq!(config.fingerprint().unwrap(), tuned.fingerprint().unwrap());

        let mut retargeted = config.clone();
        retargeted.fork.target_database = "app_other".into();
        assert_ne!(config.fingerprint().unwrap(), retargeted.fingerprint().unwrap());
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            Config::from_yaml("source: [unclosed"),
            Err(ForkError::Yaml(_))
        ));
    }

    #[test]
    fn test_auto_tuning_keeps_explicit_values() {
        let mut options = ForkOptions::default();
        options.max_connections = Some(3);
        let resources = SystemResources {
            total_memory_gb: 8.0,
            cpu_cores: 32,
        };
        assert_eq!(options.with_auto_tuning(&resources).max_connections, Some(3));

        let tuned = ForkOptions::default().with_auto_tuning(&resources);
        assert_eq!(tuned.max_connections, Some(16));
    }
}
