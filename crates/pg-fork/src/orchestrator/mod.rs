//! Fork orchestrator: drives one job through its phases.
//!
//! ```text
//! planning -> [target_cleanup] -> schema -> data -> verify -> done
//!                        \____________ any failure ____________/-> failed
//! ```
//!
//! Every phase change and every table task transition goes through the
//! [`JobRecorder`], which persists the job before the caller continues.

mod context;

pub use context::RunContext;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ForkSpec;
use crate::connection::{ConnectionManager, Connector};
use crate::error::{ForkError, Result};
use crate::planner::{Strategy, StrategyPlanner, TaskStatus, TransferPlan};
use crate::progress::{format_duration, ProgressSink, ProgressTracker};
use crate::retry::RetryPolicy;
use crate::schema::{check_compatibility, reload_ddl, DdlStatement, TableRef};
use crate::source::SourceDatabase;
use crate::state::{FileStateStore, ForkJob, JobPhase, JobStore, NoopStateStore};
use crate::target::{DestinationDatabase, ServerAdmin};
use crate::transfer::{TaskObserver, TransferConfig, WorkItem, WorkerPool};

/// Outcome of a finished fork.
#[derive(Debug, Clone, Serialize)]
pub struct ForkResult {
    pub job_id: String,
    pub target_database: String,
    pub strategy: Strategy,
    pub tables: usize,
    pub rows: u64,
    pub duration: String,
    pub duration_secs: f64,
    pub dry_run: bool,
    pub resumed: bool,

    /// The plan, for dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<TransferPlan>,
}

/// Fork a database as described by `spec`.
///
/// Runs until the fork completes, fails, or `cancel` fires.
pub async fn fork(cancel: CancellationToken, spec: ForkSpec) -> Result<ForkResult> {
    ForkOrchestrator::new(spec)?.run(cancel).await
}

/// Runs one fork job.
pub struct ForkOrchestrator {
    spec: ForkSpec,
    connector: Arc<dyn Connector>,
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
    progress_stderr: bool,
}

impl ForkOrchestrator {
    /// Validate `spec` and wire the PostgreSQL connector and job store.
    pub fn new(spec: ForkSpec) -> Result<Self> {
        spec.validate()?;

        let store: Arc<dyn JobStore> = match &spec.state_dir {
            Some(dir) => Arc::new(FileStateStore::new(dir)),
            None => Arc::new(NoopStateStore::new()),
        };

        Ok(Self {
            connector: Arc::new(ConnectionManager::new(&spec)),
            store,
            retry: RetryPolicy::new(&spec.retry),
            progress_stderr: false,
            spec,
        })
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = store;
        self
    }

    /// Print each progress snapshot to stderr as a JSON line.
    pub fn with_progress_stderr(mut self, enabled: bool) -> Self {
        self.progress_stderr = enabled;
        self
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<ForkResult> {
        let started = Instant::now();
        let ctx = RunContext::new(cancel, Some(self.spec.timeout()));
        let job_id = self
            .spec
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let span = info_span!("fork", job_id = %job_id);
        async move {
            if self.spec.dry_run {
                self.dry_run(&ctx, job_id, started).await
            } else {
                self.execute(&ctx, job_id, started).await
            }
        }
        .instrument(span)
        .await
    }

    async fn dry_run(&self, ctx: &RunContext, job_id: String, started: Instant) -> Result<ForkResult> {
        info!("Dry run: planning only, nothing will be written");
        let (source, admin) = self.connect(ctx).await?;
        let plan = StrategyPlanner::new(&self.spec)
            .plan(source.as_ref(), admin.as_ref(), false)
            .await;
        source.close().await;
        admin.close().await;
        let plan = plan?;

        for statement in plan.pre_data.iter().chain(&plan.post_data) {
            debug!("Would apply {}: {}", statement.object, statement.sql);
        }

        Ok(ForkResult {
            job_id,
            target_database: plan.target_database.clone(),
            strategy: plan.strategy,
            tables: plan.tables.len(),
            rows: 0,
            duration: format_duration(started.elapsed()),
            duration_secs: started.elapsed().as_secs_f64(),
            dry_run: true,
            resumed: false,
            plan: Some(plan),
        })
    }

    async fn execute(&self, ctx: &RunContext, job_id: String, started: Instant) -> Result<ForkResult> {
        let (job, resumed) = self.load_job(&job_id).await?;

        let tracker = Arc::new(ProgressTracker::new(Duration::from_secs(
            self.spec.progress_interval_secs.max(1),
        )));
        let sink = ProgressSink::new(self.spec.progress_file.clone(), self.progress_stderr);
        let sink = sink.is_enabled().then(|| sink.spawn(tracker.subscribe()));

        let recorder = Arc::new(JobRecorder::new(job, self.store.clone(), tracker));
        let outcome = self.drive(ctx, &recorder, resumed).await;

        let outcome = match outcome {
            Ok(strategy) => {
                info!("Fork completed in {}", format_duration(started.elapsed()));
                Ok(strategy)
            }
            Err(e) => {
                if matches!(e, ForkError::Cancelled) {
                    warn!("Fork cancelled");
                } else {
                    error!("Fork failed: {}", e);
                }
                recorder.fail(&e).await;
                Err(e)
            }
        };

        if let Some(sink) = sink {
            sink.finish().await;
        }

        let strategy = outcome?;
        let job = recorder.snapshot().await;
        Ok(ForkResult {
            job_id: job.job_id.clone(),
            target_database: job.spec.target_database.clone(),
            strategy,
            tables: if self.spec.schema_only {
                job.tasks.len()
            } else {
                job.tables_completed()
            },
            rows: job.rows_transferred(),
            duration: format_duration(started.elapsed()),
            duration_secs: started.elapsed().as_secs_f64(),
            dry_run: false,
            resumed,
            plan: None,
        })
    }

    async fn load_job(&self, job_id: &str) -> Result<(ForkJob, bool)> {
        let existing = self.store.load(job_id).await?;

        if !self.spec.resume {
            if existing.is_some() {
                return Err(ForkError::State(format!(
                    "job {} already exists; resume it or delete it first",
                    job_id
                )));
            }
            return Ok((ForkJob::new(job_id, &self.spec), false));
        }

        let Some(mut job) = existing else {
            return Err(ForkError::State(format!(
                "no job {} found to resume ({} store)",
                job_id,
                self.store.backend_type()
            )));
        };
        job.validate_resume(&self.spec)?;
        info!(
            "Resuming job {} from phase {} ({}/{} tables completed)",
            job_id,
            job.phase,
            job.tables_completed(),
            job.tasks.len()
        );
        job.error = None;
        Ok((job, true))
    }

    async fn connect(&self, ctx: &RunContext) -> Result<(Arc<dyn SourceDatabase>, Arc<dyn ServerAdmin>)> {
        let connector = self.connector.as_ref();
        let source = self
            .retry
            .run(ctx, "connect to source", move |_| connector.source())
            .await?;
        let admin = self
            .retry
            .run(ctx, "connect to destination server", move |_| connector.admin())
            .await?;
        Ok((source, admin))
    }

    /// Run the phases. Returns the strategy used.
    async fn drive(&self, ctx: &RunContext, recorder: &Arc<JobRecorder>, resumed: bool) -> Result<Strategy> {
        if let Some(plan) = recorder.read(|job| (job.phase == JobPhase::Done).then(|| job.plan.clone())).await {
            info!("Job already completed; nothing to do");
            return plan
                .map(|p| p.strategy)
                .ok_or_else(|| ForkError::State("completed job has no plan".into()));
        }

        recorder.set_phase(JobPhase::Planning).await?;
        let (source, admin) = self.connect(ctx).await?;

        let result = self.plan_and_apply(ctx, recorder, &source, &admin, resumed).await;
        source.close().await;
        admin.close().await;
        let strategy = result?;

        recorder.set_phase(JobPhase::Done).await?;
        Ok(strategy)
    }

    async fn plan_and_apply(
        &self,
        ctx: &RunContext,
        recorder: &Arc<JobRecorder>,
        source: &Arc<dyn SourceDatabase>,
        admin: &Arc<dyn ServerAdmin>,
        resumed: bool,
    ) -> Result<Strategy> {
        let stored = recorder.read(|job| job.plan.clone()).await;
        let plan = match stored {
            Some(plan) => {
                info!("Reusing the plan stored with the job");
                plan
            }
            None => {
                let created = recorder.read(|job| job.target_created).await;
                let plan = StrategyPlanner::new(&self.spec)
                    .plan(source.as_ref(), admin.as_ref(), created)
                    .await?;
                let stored = plan.clone();
                recorder.update(move |job| {
                    job.set_plan(stored);
                    Ok(())
                })
                .await?;
                plan
            }
        };

        let truncate = if resumed {
            recorder.update(|job| Ok(job.requeue())).await?
        } else {
            BTreeSet::new()
        };
        recorder.sync_progress().await;
        ctx.check()?;

        match plan.strategy {
            Strategy::SameServer => {
                self.same_server(ctx, recorder, &plan, source, admin, resumed)
                    .await?
            }
            Strategy::CrossServer => {
                self.cross_server(ctx, recorder, &plan, source, admin, truncate, resumed)
                    .await?
            }
        }
        Ok(plan.strategy)
    }

    /// Clone through `CREATE DATABASE ... TEMPLATE`, then drop excluded tables.
    async fn same_server(
        &self,
        ctx: &RunContext,
        recorder: &Arc<JobRecorder>,
        plan: &TransferPlan,
        source: &Arc<dyn SourceDatabase>,
        admin: &Arc<dyn ServerAdmin>,
        resumed: bool,
    ) -> Result<()> {
        let target = plan.target_database.as_str();
        let template = plan.source_database.as_str();
        let admin = admin.as_ref();

        let (cloned, created) = recorder
            .read(|job| (job.pre_data_applied > 0, job.target_created))
            .await;
        if !cloned {
            if admin.database_exists(target).await? {
                self.ensure_replaceable(recorder, target, created).await?;
                recorder.set_phase(JobPhase::TargetCleanup).await?;
                info!("Dropping existing target database {}", target);
                self.retry
                    .run(ctx, "drop target database", move |_| admin.drop_database(target))
                    .await?;
            }

            recorder.set_phase(JobPhase::Schema).await?;
            // The template must have no other sessions, including ours.
            source.close().await;
            ctx.check()?;
            info!("Cloning {} into {} on the same server", template, target);
            self.retry
                .run(ctx, "clone database", move |_| {
                    ctx.within_deadline(admin.create_database(target, Some(template)))
                })
                .await?;
            recorder
                .update(|job| {
                    job.pre_data_applied = 1;
                    job.target_created = true;
                    Ok(())
                })
                .await?;
        } else {
            recorder.set_phase(JobPhase::Schema).await?;
        }

        let destination = self.open_target(ctx, target).await?;
        let result = self
            .finish_clone(ctx, recorder, plan, destination.as_ref(), resumed)
            .await;
        destination.close().await;
        result
    }

    async fn finish_clone(
        &self,
        ctx: &RunContext,
        recorder: &Arc<JobRecorder>,
        plan: &TransferPlan,
        destination: &dyn DestinationDatabase,
        resumed: bool,
    ) -> Result<()> {
        self.apply_statements(ctx, recorder, destination, &plan.post_data, Stage::PostData, resumed)
            .await?;

        recorder.set_phase(JobPhase::Data).await?;
        for index in recorder.read(|job| job.pending()).await {
            let table = plan.tables[index].name();
            recorder.task_started(index).await?;
            match destination.row_count(table).await {
                Ok(rows) => recorder.task_completed(index, rows).await?,
                Err(e) => {
                    let e = e.for_table(table.to_string());
                    recorder.task_failed(index, &e).await?;
                    return Err(e);
                }
            }
        }

        if self.spec.verify {
            recorder.set_phase(JobPhase::Verify).await?;
            let mut problems = Vec::new();
            for table in plan.tables.iter().map(|t| t.name()) {
                if destination.table_columns(table).await?.is_none() {
                    problems.push(format!("{} is missing from the clone", table));
                }
            }
            for table in &plan.excluded {
                if self.spec.schemas.contains(&table.schema)
                    && destination.table_columns(table).await?.is_some()
                {
                    problems.push(format!("excluded table {} is still present", table));
                }
            }
            if !problems.is_empty() {
                return Err(ForkError::Verification(problems.join("; ")));
            }
        }
        Ok(())
    }

    /// Replay schema and stream data between servers.
    #[allow(clippy::too_many_arguments)]
    async fn cross_server(
        &self,
        ctx: &RunContext,
        recorder: &Arc<JobRecorder>,
        plan: &TransferPlan,
        source: &Arc<dyn SourceDatabase>,
        admin: &Arc<dyn ServerAdmin>,
        mut truncate: BTreeSet<usize>,
        resumed: bool,
    ) -> Result<()> {
        let spec = &self.spec;
        let target = plan.target_database.as_str();
        let admin = admin.as_ref();

        if !spec.data_only {
            let created = recorder.read(|job| job.target_created).await;
            let mut exists = admin.database_exists(target).await?;

            if exists && !created {
                self.ensure_replaceable(recorder, target, created).await?;
                recorder.set_phase(JobPhase::TargetCleanup).await?;
                info!("Dropping existing target database {}", target);
                self.retry
                    .run(ctx, "drop target database", move |_| admin.drop_database(target))
                    .await?;
                exists = false;
            }

            if !exists {
                if created {
                    warn!(
                        "Target database {} created by this job no longer exists; starting over",
                        target
                    );
                    recorder
                        .update(|job| {
                            job.pre_data_applied = 0;
                            job.post_data_applied = 0;
                            if let Some(plan) = &job.plan {
                                job.tasks = plan.tasks();
                            }
                            Ok(())
                        })
                        .await?;
                    recorder.sync_progress().await;
                    truncate.clear();
                }
                info!("Creating target database {}", target);
                self.retry
                    .run(ctx, "create target database", move |_| {
                        ctx.within_deadline(admin.create_database(target, None))
                    })
                    .await?;
                recorder
                    .update(|job| {
                        job.target_created = true;
                        Ok(())
                    })
                    .await?;
            }
        }

        let destination = self.open_target(ctx, target).await?;
        let result = self
            .replay(ctx, recorder, plan, source, &destination, truncate, resumed)
            .await;
        destination.close().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn replay(
        &self,
        ctx: &RunContext,
        recorder: &Arc<JobRecorder>,
        plan: &TransferPlan,
        source: &Arc<dyn SourceDatabase>,
        destination: &Arc<dyn DestinationDatabase>,
        truncate: BTreeSet<usize>,
        resumed: bool,
    ) -> Result<()> {
        let spec = &self.spec;

        recorder.set_phase(JobPhase::Schema).await?;
        let reload;
        let plan = if spec.data_only {
            check_compatibility(destination.as_ref(), plan.tables.iter().map(|t| &t.table)).await?;
            reload = self.prepare_reload(recorder, plan, destination.as_ref()).await?;
            &reload
        } else {
            plan
        };
        self.apply_statements(ctx, recorder, destination.as_ref(), &plan.pre_data, Stage::PreData, resumed)
            .await?;

        if spec.schema_only {
            self.apply_statements(ctx, recorder, destination.as_ref(), &plan.post_data, Stage::PostData, resumed)
                .await?;
        } else {
            recorder.set_phase(JobPhase::Data).await?;
            let items: Vec<WorkItem> = recorder
                .read(|job| job.pending())
                .await
                .into_iter()
                .map(|index| WorkItem {
                    index,
                    table: plan.tables[index].clone(),
                    truncate_first: truncate.contains(&index),
                })
                .collect();

            let skipped = plan.tables.len() - items.len();
            if skipped > 0 {
                info!("Skipping {} tables completed by an earlier run", skipped);
            }

            let observer: Arc<dyn TaskObserver> = recorder.clone();
            let pool = WorkerPool::new(
                source.clone(),
                destination.clone(),
                self.retry.clone(),
                observer,
                TransferConfig {
                    workers: spec.max_connections,
                    chunk_size: spec.chunk_size,
                },
            );
            let summary = pool.run(ctx, items).await?;
            info!(
                "Transferred {} rows across {} tables",
                summary.rows, summary.tables
            );

            // Foreign keys are in post-data, so they land after every table load.
            self.apply_statements(ctx, recorder, destination.as_ref(), &plan.post_data, Stage::PostData, resumed)
                .await?;
        }

        if spec.verify {
            recorder.set_phase(JobPhase::Verify).await?;
            self.verify(destination.as_ref(), recorder).await?;
        }
        Ok(())
    }

    /// Store the DDL that empties an existing target for a data-only load.
    ///
    /// Destination foreign keys touching the forked tables are dropped, the
    /// tables are truncated in one statement, and the keys come back after
    /// every table is loaded. The statements are kept with the job, so a
    /// resumed run re-adds keys an earlier run already dropped.
    async fn prepare_reload(
        &self,
        recorder: &JobRecorder,
        plan: &TransferPlan,
        destination: &dyn DestinationDatabase,
    ) -> Result<TransferPlan> {
        if !plan.pre_data.is_empty() || plan.tables.is_empty() {
            return Ok(plan.clone());
        }

        let tables: Vec<TableRef> = plan.tables.iter().map(|t| t.name().clone()).collect();
        let foreign_keys = destination.foreign_keys(&tables).await?;
        if !foreign_keys.is_empty() {
            info!(
                "Detaching {} foreign keys on the target for the reload",
                foreign_keys.len()
            );
        }
        let ddl = reload_ddl(&tables, &foreign_keys);

        let mut prepared = plan.clone();
        prepared.pre_data = ddl.pre_data;
        prepared.post_data = ddl.post_data;
        let stored = prepared.clone();
        recorder
            .update(move |job| {
                if let Some(plan) = job.plan.as_mut() {
                    plan.pre_data = stored.pre_data;
                    plan.post_data = stored.post_data;
                }
                Ok(())
            })
            .await?;
        Ok(prepared)
    }

    /// Compare destination row counts with what the job recorded.
    async fn verify(&self, destination: &dyn DestinationDatabase, recorder: &JobRecorder) -> Result<()> {
        let tasks = recorder.read(|job| job.tasks.clone()).await;
        let mut mismatches = Vec::new();

        for task in &tasks {
            if self.spec.schema_only {
                if destination.table_columns(&task.table).await?.is_none() {
                    mismatches.push(format!("{} was not created", task.table));
                }
                continue;
            }
            let actual = destination.row_count(&task.table).await?;
            if actual != task.rows_transferred {
                mismatches.push(format!(
                    "{}: expected {} rows, found {}",
                    task.table, task.rows_transferred, actual
                ));
            }
        }

        if mismatches.is_empty() {
            info!("Verified {} tables", tasks.len());
            Ok(())
        } else {
            Err(ForkError::Verification(mismatches.join("; ")))
        }
    }

    /// An existing target may be dropped only when the job created it or
    /// `drop_if_exists` is set.
    async fn ensure_replaceable(&self, recorder: &JobRecorder, target: &str, created: bool) -> Result<()> {
        if created || self.spec.drop_if_exists {
            return Ok(());
        }
        let job_id = recorder.read(|job| job.job_id.clone()).await;
        Err(ForkError::Planning(format!(
            "target database {} already exists and was not created by job {} (use drop_if_exists to replace it)",
            target, job_id
        )))
    }

    async fn open_target(&self, ctx: &RunContext, target: &str) -> Result<Arc<dyn DestinationDatabase>> {
        let connector = self.connector.as_ref();
        self.retry
            .run(ctx, "connect to target database", move |_| connector.target(target))
            .await
    }

    /// Apply `statements` in order, continuing after those an earlier run applied.
    async fn apply_statements(
        &self,
        ctx: &RunContext,
        recorder: &JobRecorder,
        destination: &dyn DestinationDatabase,
        statements: &[DdlStatement],
        stage: Stage,
        resumed: bool,
    ) -> Result<()> {
        let applied = recorder.read(|job| stage.applied(job)).await;
        if applied > 0 {
            info!(
                "Skipping {} {} statements applied by an earlier run",
                applied.min(statements.len()),
                stage
            );
        }

        for (index, statement) in statements.iter().enumerate().skip(applied) {
            ctx.check()?;
            debug!("Applying {} {}: {}", stage, statement.object, statement.sql);

            let result = self
                .retry
                .run(ctx, "schema statement", move |_| {
                    ctx.within_deadline(destination.execute(&statement.sql))
                })
                .await;
            match result {
                Ok(()) => {}
                // The statement may have committed just before the earlier run stopped.
                Err(e) if resumed && index == applied && e.is_duplicate_object() => {
                    warn!("{} already exists; continuing", statement.object);
                }
                Err(e) => return Err(e.for_table(statement.object.clone())),
            }

            recorder
                .update(|job| {
                    stage.set_applied(job, index + 1);
                    Ok(())
                })
                .await?;
        }

        if statements.len() > applied {
            info!("Applied {} {} statements", statements.len() - applied, stage);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    PreData,
    PostData,
}

impl Stage {
    fn applied(self, job: &ForkJob) -> usize {
        match self {
            Stage::PreData => job.pre_data_applied,
            Stage::PostData => job.post_data_applied,
        }
    }

    fn set_applied(self, job: &mut ForkJob, count: usize) {
        match self {
            Stage::PreData => job.pre_data_applied = count,
            Stage::PostData => job.post_data_applied = count,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::PreData => write!(f, "pre-data"),
            Stage::PostData => write!(f, "post-data"),
        }
    }
}

/// Single update path for the job record.
///
/// Holds the job behind an async mutex and saves it before releasing the
/// lock, so concurrent workers never interleave writes to the store.
pub(crate) struct JobRecorder {
    job: Mutex<ForkJob>,
    store: Arc<dyn JobStore>,
    progress: Arc<ProgressTracker>,
}

impl JobRecorder {
    fn new(job: ForkJob, store: Arc<dyn JobStore>, progress: Arc<ProgressTracker>) -> Self {
        Self {
            job: Mutex::new(job),
            store,
            progress,
        }
    }

    async fn read<R>(&self, f: impl FnOnce(&ForkJob) -> R) -> R {
        let job = self.job.lock().await;
        f(&job)
    }

    async fn snapshot(&self) -> ForkJob {
        self.job.lock().await.clone()
    }

    /// Apply `f` and persist the job.
    async fn update<R>(&self, f: impl FnOnce(&mut ForkJob) -> Result<R>) -> Result<R> {
        let mut job = self.job.lock().await;
        let value = f(&mut job)?;
        job.updated_at = chrono::Utc::now();
        self.store.save(&job).await?;
        Ok(value)
    }

    async fn set_phase(&self, phase: JobPhase) -> Result<()> {
        self.update(|job| {
            job.phase = phase;
            Ok(())
        })
        .await?;
        self.progress.set_phase(phase);
        info!("Phase: {}", phase);
        Ok(())
    }

    /// Re-register the job's tasks with the progress tracker.
    async fn sync_progress(&self) {
        let job = self.job.lock().await;
        self.progress.set_tables(&job.tasks);
    }

    /// Record a terminal failure. Persistence errors are logged, not returned.
    async fn fail(&self, err: &ForkError) {
        let result = self
            .update(|job| {
                job.phase = JobPhase::Failed;
                job.error = Some(err.to_string());
                Ok(())
            })
            .await;
        self.progress.set_phase(JobPhase::Failed);
        if let Err(e) = result {
            error!("Could not record job failure: {}", e);
        }
    }
}

fn task_mut(job: &mut ForkJob, index: usize) -> Result<&mut crate::planner::TableTask> {
    job.tasks
        .get_mut(index)
        .ok_or_else(|| ForkError::State(format!("no task at index {}", index)))
}

#[async_trait]
impl TaskObserver for JobRecorder {
    async fn task_started(&self, index: usize) -> Result<()> {
        self.update(|job| task_mut(job, index)?.start()).await?;
        self.progress.table_started(index);
        Ok(())
    }

    fn chunk_written(&self, index: usize, rows: u64) {
        self.progress.rows_written(index, rows);
    }

    async fn task_completed(&self, index: usize, rows: u64) -> Result<()> {
        self.update(|job| task_mut(job, index)?.complete(rows)).await?;
        self.progress.table_completed(index, rows);
        Ok(())
    }

    async fn task_failed(&self, index: usize, error: &ForkError) -> Result<()> {
        let result = self
            .update(|job| {
                let task = task_mut(job, index)?;
                if task.status == TaskStatus::InProgress {
                    task.fail(error.to_string())?;
                }
                Ok(())
            })
            .await;
        self.progress.table_failed(index);
        result
    }
}

#[cfg(test)]
mod tests;
