//! Bounded worker pool streaming table data from source to destination.
//!
//! Each worker takes one table at a time from a shared queue, opens a COPY
//! stream on the source and writes it to the destination in chunks of
//! `chunk_size` rows. A chunk is one COPY on the destination, so it commits
//! or fails as a unit; a failed chunk is retried whole.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{ForkError, Result};
use crate::orchestrator::RunContext;
use crate::planner::PlannedTable;
use crate::retry::RetryPolicy;
use crate::source::SourceDatabase;
use crate::target::{DestinationDatabase, TableWriter};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Maximum concurrent table transfers.
    pub workers: usize,

    /// Rows per destination COPY.
    pub chunk_size: usize,
}

/// One table queued for transfer.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Position of the table's task in the job.
    pub index: usize,
    pub table: PlannedTable,

    /// Truncate the destination table before streaming.
    pub truncate_first: bool,
}

/// Receives task transitions from the workers.
///
/// Start, completion and failure are persisted by the implementation before
/// the worker moves on; chunk notifications only feed progress.
#[async_trait]
pub trait TaskObserver: Send + Sync {
    async fn task_started(&self, index: usize) -> Result<()>;

    fn chunk_written(&self, index: usize, rows: u64);

    async fn task_completed(&self, index: usize, rows: u64) -> Result<()>;

    async fn task_failed(&self, index: usize, error: &ForkError) -> Result<()>;
}

/// Totals for one pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub tables: usize,
    pub rows: u64,
}

impl TransferSummary {
    fn merge(&mut self, other: TransferSummary) {
        self.tables += other.tables;
        self.rows += other.rows;
    }
}

pub struct WorkerPool {
    source: Arc<dyn SourceDatabase>,
    destination: Arc<dyn DestinationDatabase>,
    retry: RetryPolicy,
    observer: Arc<dyn TaskObserver>,
    config: TransferConfig,
}

impl WorkerPool {
    pub fn new(
        source: Arc<dyn SourceDatabase>,
        destination: Arc<dyn DestinationDatabase>,
        retry: RetryPolicy,
        observer: Arc<dyn TaskObserver>,
        config: TransferConfig,
    ) -> Self {
        Self {
            source,
            destination,
            retry,
            observer,
            config,
        }
    }

    /// Transfer every item, at most `workers` tables at a time.
    ///
    /// The first fatal table failure stops the pool: running workers finish
    /// their current chunk, mark their table failed and exit. Waits for every
    /// worker before returning.
    pub async fn run(&self, ctx: &RunContext, items: Vec<WorkItem>) -> Result<TransferSummary> {
        if items.is_empty() {
            return Ok(TransferSummary::default());
        }

        let workers = self.config.workers.max(1).min(items.len());
        info!(
            "Transferring {} tables with {} workers",
            items.len(),
            workers
        );

        let (tx, rx) = async_channel::unbounded::<WorkItem>();
        for item in items {
            tx.send(item)
                .await
                .map_err(|_| ForkError::State("transfer queue closed unexpectedly".into()))?;
        }
        drop(tx);

        let pool_ctx = ctx.child();
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker = Worker {
                id,
                source: self.source.clone(),
                destination: self.destination.clone(),
                retry: self.retry.clone(),
                observer: self.observer.clone(),
                chunk_size: self.config.chunk_size.max(1),
            };
            let rx = rx.clone();
            let ctx = pool_ctx.clone();
            handles.push(tokio::spawn(async move { worker.run(rx, ctx).await }));
        }
        drop(rx);

        let mut summary = TransferSummary::default();
        let mut failure: Option<ForkError> = None;
        for handle in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    pool_ctx.cancel();
                    Err(ForkError::State(format!("transfer worker panicked: {}", e)))
                }
            };
            match outcome {
                Ok(stats) => summary.merge(stats),
                Err(e) => keep_most_relevant(&mut failure, e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// A table's own failure explains a stop better than the cancellation it caused.
fn keep_most_relevant(current: &mut Option<ForkError>, new: ForkError) {
    let replace = match current {
        None => true,
        Some(ForkError::Cancelled) => !matches!(new, ForkError::Cancelled),
        Some(_) => false,
    };
    if replace {
        *current = Some(new);
    }
}

struct Worker {
    id: usize,
    source: Arc<dyn SourceDatabase>,
    destination: Arc<dyn DestinationDatabase>,
    retry: RetryPolicy,
    observer: Arc<dyn TaskObserver>,
    chunk_size: usize,
}

impl Worker {
    async fn run(
        self,
        rx: async_channel::Receiver<WorkItem>,
        ctx: RunContext,
    ) -> Result<TransferSummary> {
        let mut stats = TransferSummary::default();

        while let Ok(item) = rx.recv().await {
            ctx.check()?;

            let span = info_span!("table", table = %item.table.name(), worker = self.id);
            match self.process(&ctx, item).instrument(span).await {
                Ok(rows) => stats.merge(TransferSummary { tables: 1, rows }),
                Err(e) => {
                    ctx.cancel();
                    return Err(e);
                }
            }
        }

        debug!(
            "Worker {} finished: {} tables, {} rows",
            self.id, stats.tables, stats.rows
        );
        Ok(stats)
    }

    async fn process(&self, ctx: &RunContext, item: WorkItem) -> Result<u64> {
        let name = item.table.name().to_string();
        self.observer.task_started(item.index).await?;

        match self.transfer_table(ctx, &item).await {
            Ok(rows) => {
                self.observer.task_completed(item.index, rows).await?;
                info!("{}: completed ({} rows)", name, rows);
                Ok(rows)
            }
            Err(e) => {
                let e = e.for_table(&name);
                if matches!(e, ForkError::Cancelled) {
                    warn!("{}: stopped by cancellation", name);
                } else {
                    error!("{}: failed - {}", name, e);
                }
                if let Err(save) = self.observer.task_failed(item.index, &e).await {
                    error!("{}: could not record failure: {}", name, save);
                }
                Err(e)
            }
        }
    }

    async fn transfer_table(&self, ctx: &RunContext, item: &WorkItem) -> Result<u64> {
        let table = item.table.name();
        let columns = item.table.table.copy_columns();
        let columns = columns.as_slice();
        let source: &dyn SourceDatabase = self.source.as_ref();
        let destination: &dyn DestinationDatabase = self.destination.as_ref();

        let mut writer = self
            .retry
            .run(ctx, "open destination writer", move |_| {
                destination.open_writer(table, columns)
            })
            .await?;

        if item.truncate_first {
            debug!("{}: truncating partial data from an earlier run", table);
            self.retry
                .run(ctx, "truncate destination table", move |_| {
                    destination.truncate(table)
                })
                .await?;
        }

        let mut stream = self
            .retry
            .run(ctx, "open source stream", move |_| source.copy_out(table, columns))
            .await?;

        let mut pending = BytesMut::new();
        // Bytes of `pending` already known to hold no row terminator.
        let mut scanned = 0;
        let mut chunk: Vec<Bytes> = Vec::with_capacity(self.chunk_size);
        let mut total = 0u64;

        while let Some(data) = ctx.within_deadline(stream.try_next()).await? {
            pending.extend_from_slice(&data);
            while let Some(offset) = pending[scanned..].iter().position(|b| *b == b'\n') {
                chunk.push(pending.split_to(scanned + offset + 1).freeze());
                scanned = 0;
                if chunk.len() >= self.chunk_size {
                    total += self.flush(ctx, writer.as_mut(), &mut chunk, item.index).await?;
                    ctx.check()?;
                }
            }
            scanned = pending.len();
        }

        if !pending.is_empty() {
            return Err(ForkError::Connection(format!(
                "source stream for {} ended in the middle of a row",
                table
            )));
        }
        if !chunk.is_empty() {
            total += self.flush(ctx, writer.as_mut(), &mut chunk, item.index).await?;
        }

        Ok(total)
    }

    /// Write one chunk, retrying it whole on transient failure.
    async fn flush(
        &self,
        ctx: &RunContext,
        writer: &mut dyn TableWriter,
        chunk: &mut Vec<Bytes>,
        index: usize,
    ) -> Result<u64> {
        let mut attempt = 1;
        let rows = loop {
            match ctx.within_deadline(writer.write_chunk(chunk.as_slice())).await {
                Ok(rows) => break rows,
                Err(e) => self.retry.recover(ctx, "chunk write", attempt, e).await?,
            }
            attempt += 1;
        };

        chunk.clear();
        self.observer.chunk_written(index, rows);
        debug!("Wrote chunk of {} rows", rows);
        Ok(rows)
    }
}
