//! Progress aggregation and reporting.
//!
//! Workers report into a [`ProgressTracker`], which recomputes a
//! [`ProgressSnapshot`] and publishes it on a `watch` channel. A separate
//! [`ProgressSink`] task owns all file and terminal output, so a slow disk
//! never stalls a worker: the channel only ever holds the latest snapshot.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::planner::{TableTask, TaskStatus};
use crate::state::JobPhase;

/// Window for the moving-average transfer rate.
const RATE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub phase: JobPhase,
    pub overall: OverallProgress,
    pub current_table: Option<CurrentTable>,
    pub estimated_time_remaining: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallProgress {
    pub percent_complete: f64,
    pub tables_completed: usize,
    pub tables_total: usize,
    pub rows_completed: u64,
    pub rows_total: u64,
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentTable {
    pub name: String,
    pub percent_complete: f64,
    pub rows_completed: u64,
    pub rows_total: u64,
    pub speed: String,
}

#[derive(Debug)]
struct TableProgress {
    name: String,
    rows_estimate: Option<u64>,
    rows_done: u64,
    completed: bool,
    started: Option<Instant>,
}

impl TableProgress {
    /// Completed tables count what they moved; others their estimate.
    fn rows_expected(&self) -> u64 {
        if self.completed {
            self.rows_done
        } else {
            self.rows_estimate.unwrap_or(0).max(self.rows_done)
        }
    }
}

#[derive(Debug)]
struct Tracker {
    phase: JobPhase,
    tables: Vec<TableProgress>,
    started: Instant,
    samples: VecDeque<(Instant, u64)>,
    current: Option<usize>,
    last_publish: Option<Instant>,
}

/// Aggregates per-table counters into snapshots.
pub struct ProgressTracker {
    inner: Mutex<Tracker>,
    tx: watch::Sender<Option<ProgressSnapshot>>,
    interval: Duration,
}

impl ProgressTracker {
    /// `interval` is the minimum gap between snapshots published for row
    /// progress; phase and table transitions always publish.
    pub fn new(interval: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            inner: Mutex::new(Tracker {
                phase: JobPhase::Planning,
                tables: Vec::new(),
                started: Instant::now(),
                samples: VecDeque::new(),
                current: None,
                last_publish: None,
            }),
            tx,
            interval,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ProgressSnapshot>> {
        self.tx.subscribe()
    }

    /// Register the plan's tasks. Tasks completed by an earlier run count as done.
    pub fn set_tables(&self, tasks: &[TableTask]) {
        self.update(true, |t, _| {
            t.tables = tasks
                .iter()
                .map(|task| {
                    let completed = task.status == TaskStatus::Completed;
                    TableProgress {
                        name: task.table.to_string(),
                        rows_estimate: task.estimated_rows.map(|r| r.max(0) as u64),
                        rows_done: if completed { task.rows_transferred } else { 0 },
                        completed,
                        started: None,
                    }
                })
                .collect();
            t.current = None;
        });
    }

    pub fn set_phase(&self, phase: JobPhase) {
        self.update(true, |t, _| t.phase = phase);
    }

    pub fn table_started(&self, index: usize) {
        self.update(true, |t, now| {
            if let Some(table) = t.tables.get_mut(index) {
                table.rows_done = 0;
                table.started = Some(now);
                t.current = Some(index);
            }
        });
    }

    pub fn rows_written(&self, index: usize, rows: u64) {
        self.update(false, |t, now| {
            if let Some(table) = t.tables.get_mut(index) {
                table.rows_done += rows;
                t.current = Some(index);
            }
            let total = t.tables.iter().map(|t| t.rows_done).sum();
            t.samples.push_back((now, total));
            while t.samples.len() > 2
                && t.samples
                    .front()
                    .is_some_and(|(at, _)| now.duration_since(*at) > RATE_WINDOW)
            {
                t.samples.pop_front();
            }
        });
    }

    pub fn table_completed(&self, index: usize, rows: u64) {
        self.update(true, |t, _| {
            if let Some(table) = t.tables.get_mut(index) {
                table.rows_done = rows;
                table.completed = true;
            }
            if t.current == Some(index) {
                t.current = None;
            }
        });
    }

    pub fn table_failed(&self, index: usize) {
        self.update(true, |t, _| {
            if t.current == Some(index) {
                t.current = None;
            }
        });
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let tracker = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        build_snapshot(&tracker, Instant::now())
    }

    fn update<F: FnOnce(&mut Tracker, Instant)>(&self, force: bool, f: F) {
        let now = Instant::now();
        let mut tracker = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut tracker, now);

        let due = tracker
            .last_publish
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if force || due {
            tracker.last_publish = Some(now);
            let snapshot = build_snapshot(&tracker, now);
            self.tx.send_replace(Some(snapshot));
        }
    }
}

fn build_snapshot(t: &Tracker, now: Instant) -> ProgressSnapshot {
    let tables_total = t.tables.len();
    let tables_completed = t.tables.iter().filter(|t| t.completed).count();
    let rows_completed: u64 = t.tables.iter().map(|t| t.rows_done).sum();
    let rows_total: u64 = t.tables.iter().map(|t| t.rows_expected()).sum();
    let estimates_known = t
        .tables
        .iter()
        .any(|t| t.rows_estimate.is_some() || t.completed);

    let percent_complete = if t.phase == JobPhase::Done {
        100.0
    } else if estimates_known && rows_total > 0 {
        percent(rows_completed, rows_total)
    } else if tables_total > 0 {
        percent(tables_completed as u64, tables_total as u64)
    } else {
        0.0
    };

    let rate = moving_rate(&t.samples);
    let estimated_time_remaining = match rate {
        Some(rate) if rate > 0.0 && rows_total > rows_completed && t.phase != JobPhase::Done => {
            let secs = (rows_total - rows_completed) as f64 / rate;
            Some(format_duration(Duration::from_secs_f64(secs)))
        }
        _ => None,
    };

    let current_table = t.current.and_then(|i| t.tables.get(i)).map(|table| {
        let elapsed = table
            .started
            .map(|s| now.duration_since(s).as_secs_f64())
            .unwrap_or(0.0);
        let speed = if elapsed > 0.0 {
            table.rows_done as f64 / elapsed
        } else {
            0.0
        };
        let expected = table.rows_expected();
        CurrentTable {
            name: table.name.clone(),
            percent_complete: if expected > 0 {
                percent(table.rows_done, expected)
            } else {
                0.0
            },
            rows_completed: table.rows_done,
            rows_total: expected,
            speed: format!("{:.0} rows/sec", speed),
        }
    });

    ProgressSnapshot {
        phase: t.phase,
        overall: OverallProgress {
            percent_complete,
            tables_completed,
            tables_total,
            rows_completed,
            rows_total,
            duration: format_duration(now.duration_since(t.started)),
        },
        current_table,
        estimated_time_remaining,
    }
}

fn percent(done: u64, total: u64) -> f64 {
    let p = (done as f64 / total as f64 * 100.0).min(100.0);
    (p * 10.0).round() / 10.0
}

/// Rows per second across the sample window.
fn moving_rate(samples: &VecDeque<(Instant, u64)>) -> Option<f64> {
    let (first_at, first_rows) = samples.front()?;
    let (last_at, last_rows) = samples.back()?;
    let secs = last_at.duration_since(*first_at).as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    Some(last_rows.saturating_sub(*first_rows) as f64 / secs)
}

/// Render like Go's `time.Duration`: `1h2m3s`, `5m30s`, `12s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Writes published snapshots to the progress file and/or stderr.
pub struct ProgressSink {
    path: Option<PathBuf>,
    stderr: bool,
}

/// Running sink; [`SinkHandle::finish`] flushes the last snapshot.
pub struct SinkHandle {
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl SinkHandle {
    pub async fn finish(self) {
        self.stop.cancel();
        if let Err(e) = self.join.await {
            warn!("Progress sink task failed: {}", e);
        }
    }
}

impl ProgressSink {
    pub fn new(path: Option<PathBuf>, stderr: bool) -> Self {
        Self { path, stderr }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some() || self.stderr
    }

    pub fn spawn(self, mut rx: watch::Receiver<Option<ProgressSnapshot>>) -> SinkHandle {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = rx.borrow_and_update().clone();
                        self.emit(snapshot).await;
                    }
                    _ = stopped.cancelled() => {
                        if rx.has_changed().unwrap_or(false) {
                            let snapshot = rx.borrow_and_update().clone();
                            self.emit(snapshot).await;
                        }
                        break;
                    }
                }
            }
        });
        SinkHandle { stop, join }
    }

    async fn emit(&self, snapshot: Option<ProgressSnapshot>) {
        let Some(snapshot) = snapshot else {
            return;
        };

        if self.stderr {
            match serde_json::to_string(&snapshot) {
                Ok(line) => eprintln!("{}", line),
                Err(e) => warn!("Failed to serialize progress: {}", e),
            }
        }

        if let Some(path) = &self.path {
            if let Err(e) = write_atomic(path, &snapshot).await {
                warn!("Failed to write progress file {}: {}", path.display(), e);
            }
        }
    }
}

async fn write_atomic(path: &PathBuf, snapshot: &ProgressSnapshot) -> std::io::Result<()> {
    let content = serde_json::to_vec_pretty(snapshot)?;
    let temp = path.with_extension("tmp");
    tokio::fs::write(&temp, &content).await?;
    tokio::fs::rename(&temp, path).await
}
