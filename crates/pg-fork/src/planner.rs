//! Strategy selection and transfer planning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ForkSpec;
use crate::connection::ServerIdentity;
use crate::error::{ForkError, Result};
use crate::schema::{
    build_ddl, CatalogEntry, DdlKind, DdlStatement, SchemaExtractor, Table, TableRef,
};
use crate::source::SourceDatabase;
use crate::target::{create_database_sql, ServerAdmin};

/// How the target database gets its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// `CREATE DATABASE ... TEMPLATE source` on the shared server.
    SameServer,
    /// Schema replay plus streamed COPY between two servers.
    CrossServer,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::SameServer => write!(f, "same-server"),
            Strategy::CrossServer => write!(f, "cross-server"),
        }
    }
}

/// A table selected for the fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTable {
    /// Source metadata. Same-server plans carry only the name.
    pub table: Table,

    pub estimated_rows: Option<i64>,
}

impl PlannedTable {
    pub fn name(&self) -> &TableRef {
        &self.table.table
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Per-table unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableTask {
    pub table: TableRef,
    pub estimated_rows: Option<i64>,
    pub status: TaskStatus,
    pub rows_transferred: u64,

    /// Number of times the task was started, across resumes.
    pub attempts: u32,

    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TableTask {
    pub fn new(table: TableRef, estimated_rows: Option<i64>) -> Self {
        Self {
            table,
            estimated_rows,
            status: TaskStatus::Pending,
            rows_transferred: 0,
            attempts: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, to: TaskStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        );
        if !allowed {
            return Err(ForkError::State(format!(
                "table {}: invalid transition {:?} -> {:?}",
                self.table, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::InProgress)?;
        self.attempts += 1;
        self.rows_transferred = 0;
        self.last_error = None;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, rows: u64) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.rows_transferred = rows;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Requeue a task interrupted in an earlier run. Returns whether its
    /// destination table may hold partial data.
    pub fn requeue(&mut self) -> bool {
        match self.status {
            TaskStatus::Failed | TaskStatus::InProgress => {
                self.status = TaskStatus::Pending;
                self.rows_transferred = 0;
                self.completed_at = None;
                true
            }
            TaskStatus::Pending => self.attempts > 0,
            TaskStatus::Completed => false,
        }
    }
}

/// Everything decided before the first write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub strategy: Strategy,
    pub source_database: String,
    pub target_database: String,

    /// Whether the target existed at planning time.
    pub target_exists: bool,

    pub tables: Vec<PlannedTable>,

    /// Source tables left out by the filters.
    pub excluded: Vec<TableRef>,

    /// Statements before the data load. Same-server: the template clone.
    pub pre_data: Vec<DdlStatement>,

    /// Statements after the data load. Same-server: drops of excluded tables.
    pub post_data: Vec<DdlStatement>,
}

impl TransferPlan {
    /// Fresh tasks, one per planned table, in plan order.
    pub fn tasks(&self) -> Vec<TableTask> {
        self.tables
            .iter()
            .map(|t| TableTask::new(t.name().clone(), t.estimated_rows))
            .collect()
    }

    pub fn estimated_rows_total(&self) -> Option<i64> {
        let known: Vec<i64> = self.tables.iter().filter_map(|t| t.estimated_rows).collect();
        if known.is_empty() {
            None
        } else {
            Some(known.iter().sum())
        }
    }
}

/// Same-server only when both sides share address, port and role, and the
/// fork copies schema and data together.
pub fn choose_strategy(spec: &ForkSpec, source: &ServerIdentity, destination: &ServerIdentity) -> Strategy {
    if source.same_server(destination) && !spec.schema_only && !spec.data_only {
        Strategy::SameServer
    } else {
        Strategy::CrossServer
    }
}

/// Apply include (allow-list, when non-empty) then exclude (deny-list).
///
/// Returns the selected entries and the names left out.
pub fn apply_filters(
    catalog: Vec<CatalogEntry>,
    include: &[String],
    exclude: &[String],
) -> (Vec<CatalogEntry>, Vec<TableRef>) {
    let mut selected = Vec::new();
    let mut excluded = Vec::new();

    for entry in catalog {
        let included = include.is_empty() || include.iter().any(|f| entry.table.matches(f));
        let denied = exclude.iter().any(|f| entry.table.matches(f));
        if included && !denied {
            selected.push(entry);
        } else {
            excluded.push(entry.table);
        }
    }

    (selected, excluded)
}

/// Builds the [`TransferPlan`] for a spec.
pub struct StrategyPlanner<'a> {
    spec: &'a ForkSpec,
}

impl<'a> StrategyPlanner<'a> {
    pub fn new(spec: &'a ForkSpec) -> Self {
        Self { spec }
    }

    /// Probe both servers, select tables and generate DDL.
    ///
    /// `target_created` allows an existing target because the job being
    /// resumed created it. Resuming alone never does.
    pub async fn plan(
        &self,
        source: &dyn SourceDatabase,
        admin: &dyn ServerAdmin,
        target_created: bool,
    ) -> Result<TransferPlan> {
        let spec = self.spec;

        let source_identity = source.identity().await?;
        let destination_identity = admin.identity().await?;
        let strategy = choose_strategy(spec, &source_identity, &destination_identity);
        debug!(
            "Source {:?}, destination {:?}: {} strategy",
            source_identity, destination_identity, strategy
        );

        let catalog = source.list_tables(&spec.schemas).await?;
        let catalog_size = catalog.len();
        let (selected, excluded) =
            apply_filters(catalog, &spec.include_tables, &spec.exclude_tables);

        let filtered = !spec.include_tables.is_empty() || !spec.exclude_tables.is_empty();
        if selected.is_empty() && filtered {
            return Err(ForkError::Planning(format!(
                "no tables left after applying filters to {} source tables in schemas {}",
                catalog_size,
                spec.schemas.join(", ")
            )));
        }

        let target_exists = admin.database_exists(&spec.target_database).await?;
        if spec.data_only {
            if !target_exists {
                return Err(ForkError::Planning(format!(
                    "data-only fork requires target database {} to exist",
                    spec.target_database
                )));
            }
        } else if target_exists && !spec.drop_if_exists && !target_created {
            return Err(ForkError::Planning(format!(
                "target database {} already exists (use drop_if_exists to replace it)",
                spec.target_database
            )));
        }

        let plan = match strategy {
            Strategy::SameServer => self.same_server_plan(selected, excluded, target_exists),
            Strategy::CrossServer => {
                self.cross_server_plan(source, selected, excluded, target_exists)
                    .await?
            }
        };

        info!(
            "Planned {} fork of {} into {}: {} tables, {} excluded, {} pre-data and {} post-data statements",
            plan.strategy,
            plan.source_database,
            plan.target_database,
            plan.tables.len(),
            plan.excluded.len(),
            plan.pre_data.len(),
            plan.post_data.len()
        );
        Ok(plan)
    }

    fn same_server_plan(
        &self,
        selected: Vec<CatalogEntry>,
        excluded: Vec<TableRef>,
        target_exists: bool,
    ) -> TransferPlan {
        let spec = self.spec;
        let clone = DdlStatement::new(
            DdlKind::TemplateClone,
            &spec.target_database,
            create_database_sql(&spec.target_database, Some(&spec.source.database)),
        );
        let drops = excluded
            .iter()
            .map(|t| {
                DdlStatement::new(
                    DdlKind::DropTable,
                    t.to_string(),
                    format!("DROP TABLE IF EXISTS {} CASCADE", t.quoted()),
                )
            })
            .collect();

        TransferPlan {
            strategy: Strategy::SameServer,
            source_database: spec.source.database.clone(),
            target_database: spec.target_database.clone(),
            target_exists,
            tables: selected
                .into_iter()
                .map(|e| PlannedTable {
                    table: Table::new(e.table, Vec::new()),
                    estimated_rows: e.estimated_rows,
                })
                .collect(),
            excluded,
            pre_data: vec![clone],
            post_data: drops,
        }
    }

    async fn cross_server_plan(
        &self,
        source: &dyn SourceDatabase,
        selected: Vec<CatalogEntry>,
        excluded: Vec<TableRef>,
        target_exists: bool,
    ) -> Result<TransferPlan> {
        let spec = self.spec;
        let names: Vec<TableRef> = selected.iter().map(|e| e.table.clone()).collect();
        let described = SchemaExtractor::new(source).extract(&names).await?;

        let ddl = if spec.data_only {
            Default::default()
        } else {
            build_ddl(&described)
        };

        Ok(TransferPlan {
            strategy: Strategy::CrossServer,
            source_database: spec.source.database.clone(),
            target_database: spec.target_database.clone(),
            target_exists,
            tables: described
                .into_iter()
                .zip(selected)
                .map(|(table, entry)| PlannedTable {
                    table,
                    estimated_rows: entry.estimated_rows,
                })
                .collect(),
            excluded,
            pre_data: ddl.pre_data,
            post_data: ddl.post_data,
        })
    }
}
