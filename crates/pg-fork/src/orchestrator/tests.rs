use super::*;
use crate::config::{ConnectionConfig, RetryConfig};
use crate::error::ErrorKind;
use crate::schema::{Column, Constraint, ConstraintKind, ForeignKey, Table, TableRef};
use crate::source::SourceDatabase;
use crate::testing::{FakeConnector, FakeServer, Fault};
use tempfile::TempDir;

fn table(name: &str, columns: &[&str]) -> Table {
    let mut columns: Vec<Column> = columns.iter().map(|c| Column::new(*c, "text")).collect();
    columns[0].data_type = "integer".into();
    columns[0].is_nullable = false;
    let mut table = Table::new(TableRef::new("public", name), columns);
    table.constraints.push(Constraint {
        name: format!("{}_pkey", name),
        kind: ConstraintKind::PrimaryKey,
        definition: "PRIMARY KEY (id)".into(),
    });
    table
}

fn orders() -> Table {
    let mut orders = table("orders", &["id", "user_id", "total"]);
    orders.foreign_keys.push(ForeignKey {
        name: "orders_user_id_fkey".into(),
        definition: "FOREIGN KEY (user_id) REFERENCES public.users(id)".into(),
        referenced: TableRef::new("public", "users"),
    });
    orders
}

fn populate(server: &FakeServer) {
    server.add_database("app");
    server.add_database("postgres");
    server.add_table("app", table("users", &["id", "email"]), 100);
    server.add_table("app", table("products", &["id", "name", "price"]), 50);
    server.add_table("app", orders(), 20);
    server.add_table("app", table("audit_logs", &["id", "event"]), 30);
}

struct Scenario {
    source: Arc<FakeServer>,
    destination: Arc<FakeServer>,
    state_dir: TempDir,
}

impl Scenario {
    fn cross_server() -> Self {
        let source = FakeServer::new("10.0.0.1");
        populate(&source);
        let destination = FakeServer::new("10.0.0.2");
        destination.add_database("postgres");
        Self {
            source,
            destination,
            state_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn same_server() -> Self {
        let server = FakeServer::new("10.0.0.1");
        populate(&server);
        Self {
            source: server.clone(),
            destination: server,
            state_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn spec(&self) -> ForkSpec {
        let mut spec = ForkSpec::new(
            ConnectionConfig::new("prod-db", 5432, "app", "postgres", "pw"),
            ConnectionConfig::new("preview-db", 5432, "postgres", "postgres", "pw"),
            "app_copy",
        );
        spec.exclude_tables = vec!["audit_logs".into()];
        spec.job_id = Some("job-1".into());
        spec.state_dir = Some(self.state_dir.path().to_path_buf());
        spec.max_connections = 2;
        spec.chunk_size = 16;
        spec.retry = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 5,
            max_delay_ms: 20,
        };
        spec
    }

    fn orchestrator(&self, spec: ForkSpec) -> ForkOrchestrator {
        ForkOrchestrator::new(spec).unwrap().with_connector(Arc::new(FakeConnector::new(
            self.source.clone(),
            "app",
            self.destination.clone(),
        )))
    }

    async fn run(&self, spec: ForkSpec) -> Result<ForkResult> {
        self.orchestrator(spec).run(CancellationToken::new()).await
    }

    async fn job(&self) -> ForkJob {
        FileStateStore::new(self.state_dir.path())
            .load("job-1")
            .await
            .unwrap()
            .unwrap()
    }

    fn rows(&self, table: &str) -> Option<usize> {
        self.destination.table_rows("app_copy", table)
    }
}

fn statuses(job: &ForkJob) -> Vec<(String, TaskStatus)> {
    job.tasks
        .iter()
        .map(|t| (t.table.name.clone(), t.status))
        .collect()
}

#[tokio::test]
async fn test_cross_server_fork_copies_selected_tables() {
    let s = Scenario::cross_server();
    let mut spec = s.spec();
    let progress = s.state_dir.path().join("progress.json");
    spec.progress_file = Some(progress.clone());

    let result = s.run(spec).await.unwrap();

    assert_eq!(result.strategy, Strategy::CrossServer);
    assert_eq!(result.tables, 3);
    assert_eq!(result.rows, 170);
    assert!(!result.resumed);
    assert_eq!(s.rows("users"), Some(100));
    assert_eq!(s.rows("products"), Some(50));
    assert_eq!(s.rows("orders"), Some(20));
    assert_eq!(s.rows("audit_logs"), None);
    assert_eq!(
        s.destination.rows("app_copy", "users"),
        s.source.rows("app", "users")
    );

    let statements = s.destination.statements("app_copy");
    assert!(statements[0].starts_with("CREATE SCHEMA"));
    assert!(statements.last().unwrap().contains("FOREIGN KEY"));

    let job = s.job().await;
    assert_eq!(job.phase, JobPhase::Done);
    assert!(job.tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert_eq!(job.pre_data_applied, job.plan.as_ref().unwrap().pre_data.len());

    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(progress).unwrap()).unwrap();
    assert_eq!(snapshot["phase"], "done");
    assert_eq!(snapshot["overall"]["percent_complete"], 100.0);
    assert_eq!(snapshot["overall"]["tables_completed"], 3);
}

#[tokio::test]
async fn test_same_server_clones_and_drops_excluded() {
    let s = Scenario::same_server();
    let result = s.run(s.spec()).await.unwrap();

    assert_eq!(result.strategy, Strategy::SameServer);
    assert_eq!(result.rows, 170);
    assert_eq!(s.rows("users"), Some(100));
    assert_eq!(s.rows("audit_logs"), None);
    assert_eq!(s.source.table_rows("app", "audit_logs"), Some(30));
    assert_eq!(s.source.open_sessions("app"), 0);

    let statements = s.destination.statements("app_copy");
    assert_eq!(statements.len(), 1);
    assert!(statements[0].starts_with("DROP TABLE IF EXISTS \"public\".\"audit_logs\""));

    let job = s.job().await;
    assert_eq!(job.phase, JobPhase::Done);
    assert!(job.target_created);
}

#[tokio::test]
async fn test_same_server_busy_template_exhausts_retries() {
    let s = Scenario::same_server();
    let _other_session = s.source.open_source("app");

    let err = s.run(s.spec()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExhaustedRetries);
    assert_eq!(err.exit_code(), 4);
    assert!(!s.destination.database_exists("app_copy"));
    assert_eq!(s.job().await.phase, JobPhase::Failed);
}

#[tokio::test]
async fn test_transient_chunk_failure_recovers() {
    let s = Scenario::cross_server();
    s.destination
        .inject_write_faults("users", vec![Fault::Connection, Fault::Connection]);

    let result = s.run(s.spec()).await.unwrap();
    assert_eq!(result.rows, 170);
    assert_eq!(s.rows("users"), Some(100));
    assert_eq!(s.destination.chunk_writes("users"), 7);
}

#[tokio::test]
async fn test_persistent_connection_failure_exhausts_retries() {
    let s = Scenario::cross_server();
    s.destination.inject_write_faults(
        "users",
        vec![Fault::Connection, Fault::Connection, Fault::Connection],
    );

    let err = s.run(s.spec()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExhaustedRetries);
    assert!(err.to_string().contains("public.users"));
}

#[tokio::test]
async fn test_permission_failure_fails_job_immediately() {
    let s = Scenario::cross_server();
    s.destination
        .inject_write_faults("users", vec![Fault::Permission, Fault::Permission]);
    let mut spec = s.spec();
    spec.max_connections = 1;

    let err = s.run(spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert_eq!(err.exit_code(), 3);
    assert!(err.to_string().contains("public.users"));
    assert_eq!(s.destination.chunk_writes("users"), 0);

    let job = s.job().await;
    assert_eq!(job.phase, JobPhase::Failed);
    let users = job.tasks.iter().find(|t| t.table.name == "users").unwrap();
    assert_eq!(users.status, TaskStatus::Failed);
    assert!(users.last_error.as_deref().unwrap().contains("permission denied"));
}

#[tokio::test]
async fn test_resume_skips_completed_tables() {
    let s = Scenario::cross_server();
    s.destination.inject_write_faults("users", vec![Fault::Permission]);
    let mut spec = s.spec();
    spec.max_connections = 1;

    s.run(spec.clone()).await.unwrap_err();
    let job = s.job().await;
    assert_eq!(
        statuses(&job),
        vec![
            ("orders".to_string(), TaskStatus::Completed),
            ("products".to_string(), TaskStatus::Completed),
            ("users".to_string(), TaskStatus::Failed),
        ]
    );
    assert_eq!(job.post_data_applied, 0);
    let orders_writes = s.destination.chunk_writes("orders");
    let products_writes = s.destination.chunk_writes("products");

    spec.resume = true;
    let result = s.run(spec).await.unwrap();

    assert!(result.resumed);
    assert_eq!(result.rows, 170);
    assert_eq!(s.destination.chunk_writes("orders"), orders_writes);
    assert_eq!(s.destination.chunk_writes("products"), products_writes);
    assert_eq!(s.rows("users"), Some(100));
    assert_eq!(s.rows("orders"), Some(20));

    let job = s.job().await;
    assert_eq!(job.phase, JobPhase::Done);
    let users = job.tasks.iter().find(|t| t.table.name == "users").unwrap();
    assert_eq!(users.attempts, 2);
    assert!(s
        .destination
        .statements("app_copy")
        .last()
        .unwrap()
        .contains("FOREIGN KEY"));
}

#[tokio::test]
async fn test_resume_after_cancellation_restarts_partial_table() {
    let s = Scenario::cross_server();
    let mut spec = s.spec();
    spec.max_connections = 1;
    let cancel = CancellationToken::new();
    s.destination.cancel_after_writes(1, cancel.clone());

    let err = s.orchestrator(spec.clone()).run(cancel).await.unwrap_err();
    assert!(matches!(err, ForkError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(s.rows("orders"), Some(16));

    let job = s.job().await;
    assert_eq!(job.phase, JobPhase::Failed);
    assert_eq!(job.error.as_deref(), Some("Fork cancelled"));

    spec.resume = true;
    s.run(spec).await.unwrap();
    assert_eq!(s.rows("orders"), Some(20));
    assert_eq!(s.rows("users"), Some(100));
}

#[tokio::test]
async fn test_resume_with_changed_selection_is_rejected() {
    let s = Scenario::cross_server();
    s.destination.inject_write_faults("users", vec![Fault::Permission]);
    s.run(s.spec()).await.unwrap_err();

    let mut spec = s.spec();
    spec.resume = true;
    spec.exclude_tables = vec!["audit_logs".into(), "orders".into()];
    match s.run(spec).await {
        Err(ForkError::ResumeMismatch { job_id, field }) => {
            assert_eq!(job_id, "job-1");
            assert_eq!(field, "table selection");
        }
        other => panic!("expected resume mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resume_unknown_job() {
    let s = Scenario::cross_server();
    let mut spec = s.spec();
    spec.resume = true;
    let err = s.run(spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
}

#[tokio::test]
async fn test_resume_of_completed_job_does_nothing() {
    let s = Scenario::cross_server();
    let mut spec = s.spec();
    s.run(spec.clone()).await.unwrap();
    let writes = s.destination.chunk_writes("users");

    spec.resume = true;
    let result = s.run(spec).await.unwrap();
    assert!(result.resumed);
    assert_eq!(result.rows, 170);
    assert_eq!(s.destination.chunk_writes("users"), writes);
}

#[tokio::test]
async fn test_rerun_with_existing_job_id_is_rejected() {
    let s = Scenario::cross_server();
    s.run(s.spec()).await.unwrap();
    let err = s.run(s.spec()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
}

#[tokio::test]
async fn test_schema_only_creates_empty_tables() {
    let s = Scenario::cross_server();
    let mut spec = s.spec();
    spec.schema_only = true;

    let result = s.run(spec).await.unwrap();
    assert_eq!(result.rows, 0);
    assert_eq!(result.tables, 3);
    assert_eq!(s.rows("users"), Some(0));
    assert_eq!(s.rows("orders"), Some(0));
    assert_eq!(s.destination.chunk_writes("users"), 0);
    assert!(s
        .destination
        .statements("app_copy")
        .iter()
        .any(|sql| sql.contains("FOREIGN KEY")));
}

#[tokio::test]
async fn test_data_only_reports_every_mismatch() {
    let s = Scenario::cross_server();
    s.destination.add_database("app_copy");
    s.destination.add_empty_table(
        "app_copy",
        Table::new(
            TableRef::new("public", "users"),
            vec![Column::new("id", "integer")],
        ),
    );
    let mut spec = s.spec();
    spec.data_only = true;

    let err = s.run(spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    let message = err.to_string();
    assert!(message.contains("email"));
    assert!(message.contains("public.products"));
    assert!(message.contains("public.orders"));
    assert_eq!(s.destination.chunk_writes("users"), 0);
}

#[tokio::test]
async fn test_data_only_replaces_existing_rows() {
    let s = Scenario::cross_server();
    s.destination.add_database("app_copy");
    s.destination
        .add_empty_table("app_copy", table("users", &["id", "email"]));
    s.destination
        .add_empty_table("app_copy", table("products", &["id", "name", "price"]));
    s.destination.add_empty_table("app_copy", orders());
    s.destination.seed_rows("app_copy", "users", 5);
    let mut spec = s.spec();
    spec.data_only = true;

    let result = s.run(spec).await.unwrap();
    assert_eq!(result.rows, 170);
    assert_eq!(s.rows("users"), Some(100));
    assert_eq!(s.rows("orders"), Some(20));

    let statements = s.destination.statements("app_copy");
    assert_eq!(
        statements,
        vec![
            "ALTER TABLE \"public\".\"orders\" DROP CONSTRAINT IF EXISTS \"orders_user_id_fkey\"".to_string(),
            "TRUNCATE TABLE \"public\".\"orders\", \"public\".\"products\", \"public\".\"users\"".to_string(),
            "ALTER TABLE \"public\".\"orders\" ADD CONSTRAINT \"orders_user_id_fkey\" FOREIGN KEY (user_id) REFERENCES public.users(id)".to_string(),
        ]
    );
    assert_eq!(
        s.destination.foreign_key_names("app_copy", "orders"),
        vec!["orders_user_id_fkey"]
    );
}

#[tokio::test]
async fn test_schema_only_then_data_only_on_same_target() {
    let s = Scenario::cross_server();
    let mut schema = s.spec();
    schema.schema_only = true;
    s.run(schema).await.unwrap();
    assert_eq!(
        s.destination.foreign_key_names("app_copy", "orders"),
        vec!["orders_user_id_fkey"]
    );

    let mut data = s.spec();
    data.job_id = Some("job-2".into());
    data.data_only = true;
    let result = s.run(data.clone()).await.unwrap();
    assert_eq!(result.rows, 170);
    assert_eq!(s.rows("users"), Some(100));
    assert_eq!(s.rows("orders"), Some(20));
    assert_eq!(
        s.destination.foreign_key_names("app_copy", "orders"),
        vec!["orders_user_id_fkey"]
    );

    // A second reload replaces the rows instead of appending to them.
    data.job_id = Some("job-3".into());
    s.run(data).await.unwrap();
    assert_eq!(s.rows("users"), Some(100));
    assert_eq!(s.rows("orders"), Some(20));
}

#[tokio::test]
async fn test_data_only_resume_restores_detached_foreign_keys() {
    let s = Scenario::cross_server();
    let mut schema = s.spec();
    schema.job_id = Some("schema".into());
    schema.schema_only = true;
    s.run(schema).await.unwrap();

    s.destination.inject_write_faults("users", vec![Fault::Permission]);
    let mut spec = s.spec();
    spec.data_only = true;
    spec.max_connections = 1;
    s.run(spec.clone()).await.unwrap_err();
    assert!(s.destination.foreign_key_names("app_copy", "orders").is_empty());
    let job = s.job().await;
    assert_eq!(job.post_data_applied, 0);
    assert_eq!(job.plan.as_ref().unwrap().post_data.len(), 1);

    spec.resume = true;
    let result = s.run(spec).await.unwrap();
    assert_eq!(result.rows, 170);
    assert_eq!(s.rows("users"), Some(100));
    assert_eq!(
        s.destination.foreign_key_names("app_copy", "orders"),
        vec!["orders_user_id_fkey"]
    );
    let truncates = s
        .destination
        .statements("app_copy")
        .iter()
        .filter(|sql| sql.starts_with("TRUNCATE"))
        .count();
    assert_eq!(truncates, 1);
}

#[tokio::test]
async fn test_data_only_requires_target() {
    let s = Scenario::cross_server();
    let mut spec = s.spec();
    spec.data_only = true;
    let err = s.run(spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Planning);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let s = Scenario::cross_server();
    let mut spec = s.spec();
    spec.dry_run = true;

    let result = s.run(spec).await.unwrap();
    assert!(result.dry_run);
    assert_eq!(result.tables, 3);
    let plan = result.plan.unwrap();
    assert_eq!(plan.excluded, vec![TableRef::new("public", "audit_logs")]);
    assert!(!plan.pre_data.is_empty());
    assert!(!s.destination.database_exists("app_copy"));
    assert!(!s.state_dir.path().join("job-1.json").exists());
}

#[tokio::test]
async fn test_existing_target_needs_drop_if_exists() {
    let s = Scenario::cross_server();
    s.destination.add_database("app_copy");
    s.destination
        .add_empty_table("app_copy", table("stale", &["id"]));

    let err = s.run(s.spec()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Planning);
    assert_eq!(err.exit_code(), 2);

    let mut spec = s.spec();
    spec.job_id = Some("job-2".into());
    spec.drop_if_exists = true;
    s.run(spec).await.unwrap();
    assert_eq!(s.rows("stale"), None);
    assert_eq!(s.rows("users"), Some(100));
}

/// Seed a database the fork must never touch at the target name.
fn seed_foreign_target(s: &Scenario) {
    s.destination.add_database("app_copy");
    s.destination
        .add_table("app_copy", table("precious", &["id"]), 7);
}

async fn resume_against_foreign_target(s: Scenario) {
    seed_foreign_target(&s);
    let err = s.run(s.spec()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Planning);
    assert!(!s.job().await.target_created);

    let mut spec = s.spec();
    spec.resume = true;
    let err = s.run(spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Planning);
    assert!(err.to_string().contains("already exists"));
    assert_eq!(s.rows("precious"), Some(7));
    assert_eq!(s.rows("users"), None);
    assert!(s.destination.statements("app_copy").is_empty());
}

#[tokio::test]
async fn test_resume_keeps_preexisting_target_same_server() {
    resume_against_foreign_target(Scenario::same_server()).await;
}

#[tokio::test]
async fn test_resume_keeps_preexisting_target_cross_server() {
    resume_against_foreign_target(Scenario::cross_server()).await;
}

#[tokio::test]
async fn test_resume_keeps_target_created_after_planning() {
    let s = Scenario::same_server();
    let other = s.source.open_source("app");
    let err = s.run(s.spec()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExhaustedRetries);
    assert!(s.job().await.plan.is_some());
    other.close().await;
    seed_foreign_target(&s);

    let mut spec = s.spec();
    spec.resume = true;
    let err = s.run(spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Planning);
    assert!(err.to_string().contains("not created by job job-1"));
    assert_eq!(s.rows("precious"), Some(7));
}

#[tokio::test]
async fn test_missing_source_database() {
    let s = Scenario::cross_server();
    let orchestrator = ForkOrchestrator::new(s.spec())
        .unwrap()
        .with_connector(Arc::new(FakeConnector::new(
            s.source.clone(),
            "missing",
            s.destination.clone(),
        )));
    let err = orchestrator.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Planning);
    assert!(err.to_string().contains("does not exist"));
}

#[tokio::test]
async fn test_empty_selection_is_a_planning_error() {
    let s = Scenario::cross_server();
    let mut spec = s.spec();
    spec.include_tables = vec!["nonexistent".into()];
    spec.exclude_tables.clear();
    let err = s.run(spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Planning);
}

#[tokio::test]
async fn test_transient_ddl_failure_is_retried() {
    let s = Scenario::cross_server();
    s.destination.inject_execute_faults(vec![Fault::Connection]);
    let result = s.run(s.spec()).await.unwrap();
    assert_eq!(result.rows, 170);
}

#[tokio::test]
async fn test_without_state_dir_nothing_is_persisted() {
    let s = Scenario::cross_server();
    let mut spec = s.spec();
    spec.state_dir = None;
    spec.job_id = None;

    let result = s.run(spec).await.unwrap();
    assert_eq!(result.rows, 170);
    assert!(!result.job_id.is_empty());
    assert_eq!(std::fs::read_dir(s.state_dir.path()).unwrap().count(), 0);
}
