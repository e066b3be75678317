//! # pg-fork
//!
//! Fork engine for PostgreSQL databases.
//!
//! A fork creates a new database holding a copy of a source database's
//! schema and data:
//!
//! - **Same-server** forks clone through `CREATE DATABASE ... TEMPLATE`
//! - **Cross-server** forks replay the schema and stream rows with `COPY`
//!   over a bounded pool of table workers
//! - **Resume** picks up an interrupted job from its JSON state file
//! - **Retries** absorb transient connection failures with capped backoff
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_fork::{fork, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pg_fork::Result<()> {
//!     let spec = Config::load("fork.yaml")?.into_spec()?;
//!     let result = fork(CancellationToken::new(), spec).await?;
//!     println!("Forked {} rows into {}", result.rows, result.target_database);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod identifier;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod schema;
pub mod source;
pub mod state;
pub mod target;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use config::{Config, ConnectionConfig, ForkOptions, ForkSpec, RetryConfig};
pub use connection::{ConnectionManager, HealthReport};
pub use error::{ErrorKind, ForkError, Result};
pub use orchestrator::{fork, ForkOrchestrator, ForkResult};
pub use planner::{Strategy, TransferPlan};
pub use progress::ProgressSnapshot;
pub use state::{FileStateStore, ForkJob, JobPhase, JobStore, JobSummary};
