//! pg-fork CLI - fork PostgreSQL databases on the same server or across servers.

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pg_fork::config::template::{builtin_vars, parse_var, render, resolve_name};
use pg_fork::{
    Config, ConnectionConfig, ConnectionManager, FileStateStore, ForkError, ForkOrchestrator,
    ForkResult, ForkSpec, JobStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-fork")]
#[command(about = "Fork a PostgreSQL database into a new database")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Endpoint overrides shared by every command that connects.
#[derive(Args, Default)]
struct EndpointArgs {
    /// Source host
    #[arg(long)]
    source_host: Option<String>,

    /// Source port
    #[arg(long)]
    source_port: Option<u16>,

    /// Source database (the database being forked)
    #[arg(long)]
    source_db: Option<String>,

    /// Source user
    #[arg(long)]
    source_user: Option<String>,

    /// Source password
    #[arg(long, env = "PGFORK_SOURCE_PASSWORD", hide_env_values = true)]
    source_password: Option<String>,

    /// Source SSL mode: disable, require, verify-ca, verify-full
    #[arg(long)]
    source_ssl_mode: Option<String>,

    /// Destination host
    #[arg(long)]
    dest_host: Option<String>,

    /// Destination port
    #[arg(long)]
    dest_port: Option<u16>,

    /// Maintenance database on the destination server
    #[arg(long)]
    dest_db: Option<String>,

    /// Destination user
    #[arg(long)]
    dest_user: Option<String>,

    /// Destination password
    #[arg(long, env = "PGFORK_DEST_PASSWORD", hide_env_values = true)]
    dest_password: Option<String>,

    /// Destination SSL mode: disable, require, verify-ca, verify-full
    #[arg(long)]
    dest_ssl_mode: Option<String>,
}

/// Fork options shared by `run` and `resume`.
#[derive(Args)]
struct ForkArgs {
    #[command(flatten)]
    endpoints: EndpointArgs,

    /// Target database name; may contain {{source}}, {{date}}, {{timestamp}} or --var placeholders
    #[arg(long)]
    target: Option<String>,

    /// Table to include (schema.table or table); repeatable
    #[arg(long = "include")]
    include: Vec<String>,

    /// Table to exclude (schema.table or table); repeatable
    #[arg(long = "exclude")]
    exclude: Vec<String>,

    /// Create the schema only, copy no rows
    #[arg(long)]
    schema_only: bool,

    /// Copy rows into an existing schema
    #[arg(long)]
    data_only: bool,

    /// Drop the target database first if it exists
    #[arg(long)]
    drop_if_exists: bool,

    /// Number of parallel table workers
    #[arg(long)]
    max_connections: Option<usize>,

    /// Rows per chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Overall deadline in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Directory holding job state files
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// File receiving progress snapshots
    #[arg(long)]
    progress_file: Option<PathBuf>,

    /// Template variable KEY=VALUE; repeatable
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new fork
    Run {
        #[command(flatten)]
        fork: ForkArgs,

        /// Job identifier (generated when not set); may contain placeholders
        #[arg(long)]
        job_id: Option<String>,

        /// Plan and validate without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume an interrupted fork
    Resume {
        #[command(flatten)]
        fork: ForkArgs,

        /// Job to resume
        #[arg(long)]
        job_id: String,
    },

    /// Show the persisted record of a job
    Status {
        #[arg(long)]
        job_id: String,

        #[arg(long)]
        state_dir: PathBuf,
    },

    /// List job records, or delete one
    Jobs {
        #[arg(long)]
        state_dir: PathBuf,

        /// Delete the record of this job
        #[arg(long)]
        delete: Option<String>,
    },

    /// Test database connections
    HealthCheck {
        #[command(flatten)]
        endpoints: EndpointArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ForkError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(ForkError::Config)?;

    match cli.command {
        Commands::Run {
            fork,
            job_id,
            dry_run,
        } => {
            let mut config = load_config(cli.config.as_ref())?;
            config.fork.dry_run |= dry_run;
            if job_id.is_some() {
                config.fork.job_id = job_id;
            }
            let spec = build_spec(config, fork)?;
            let result = execute(spec, cli.progress).await?;
            print_result(&result, cli.output_json)?;
        }

        Commands::Resume { fork, job_id } => {
            let mut config = load_config(cli.config.as_ref())?;
            config.fork.job_id = Some(job_id);
            config.fork.resume = true;
            let spec = build_spec(config, fork)?;
            info!("Resuming job {}", spec.job_id.as_deref().unwrap_or_default());
            let result = execute(spec, cli.progress).await?;
            print_result(&result, cli.output_json)?;
        }

        Commands::Status { job_id, state_dir } => {
            let store = FileStateStore::new(state_dir);
            let job = store.load(&job_id).await?.ok_or_else(|| {
                ForkError::State(format!("no job {} in {}", job_id, store.dir().display()))
            })?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                println!("Job {}", job.job_id);
                println!("  Target: {}", job.spec.target_database);
                println!("  Phase: {}", job.phase);
                println!("  Updated: {}", job.updated_at.to_rfc3339());
                println!(
                    "  Tables: {}/{}",
                    job.tables_completed(),
                    job.tasks.len()
                );
                println!("  Rows: {}", job.rows_transferred());
                if let Some(ref err) = job.error {
                    println!("  Error: {}", err);
                }
                for task in &job.tasks {
                    println!(
                        "    {:<40} {:<12} {:>12} rows  attempts={}",
                        task.table.to_string(),
                        format!("{:?}", task.status).to_lowercase(),
                        task.rows_transferred,
                        task.attempts
                    );
                }
            }
        }

        Commands::Jobs { state_dir, delete } => {
            let store = FileStateStore::new(state_dir);
            if let Some(job_id) = delete {
                if !store.delete(&job_id).await? {
                    return Err(ForkError::State(format!("no job {} to delete", job_id)));
                }
                println!("Deleted job {}", job_id);
                return Ok(());
            }

            let jobs = store.list().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No jobs in {}", store.dir().display());
            } else {
                for job in jobs {
                    println!(
                        "{:<36} {:<24} {:<14} {}/{} tables  {}",
                        job.job_id,
                        job.target_database,
                        job.phase.to_string(),
                        job.tables_completed,
                        job.tables_total,
                        job.updated_at.to_rfc3339()
                    );
                }
            }
        }

        Commands::HealthCheck { endpoints } => {
            let mut config = load_config(cli.config.as_ref())?;
            endpoints.apply(&mut config);
            let manager = ConnectionManager::from_endpoints(config.source, config.destination, 1);
            let report = manager.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Health Check Results:");
                for endpoint in [&report.source, &report.destination] {
                    println!(
                        "  {} ({}): {} ({}ms)",
                        endpoint.endpoint,
                        endpoint.address,
                        if endpoint.healthy { "OK" } else { "FAILED" },
                        endpoint.latency_ms
                    );
                    if let Some(ref version) = endpoint.server_version {
                        println!("    PostgreSQL {}", version);
                    }
                    if let Some(ref err) = endpoint.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if report.healthy() { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !report.healthy() {
                return Err(ForkError::Connection("health check failed".to_string()));
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, ForkError> {
    match path {
        Some(path) => {
            let config = Config::load(path)?;
            info!("Loaded configuration from {:?}", path);
            Ok(config)
        }
        None => Ok(Config::empty()),
    }
}

impl EndpointArgs {
    fn apply(self, config: &mut Config) {
        override_endpoint(
            &mut config.source,
            self.source_host,
            self.source_port,
            self.source_db,
            self.source_user,
            self.source_password,
            self.source_ssl_mode,
        );
        override_endpoint(
            &mut config.destination,
            self.dest_host,
            self.dest_port,
            self.dest_db,
            self.dest_user,
            self.dest_password,
            self.dest_ssl_mode,
        );
    }
}

fn override_endpoint(
    endpoint: &mut ConnectionConfig,
    host: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    user: Option<String>,
    password: Option<String>,
    ssl_mode: Option<String>,
) {
    if let Some(host) = host {
        endpoint.host = host;
    }
    if let Some(port) = port {
        endpoint.port = port;
    }
    if let Some(database) = database {
        endpoint.database = database;
    }
    if let Some(user) = user {
        endpoint.user = user;
    }
    if let Some(password) = password {
        endpoint.password = password;
    }
    if let Some(ssl_mode) = ssl_mode {
        endpoint.ssl_mode = ssl_mode;
    }
}

/// Apply flag overrides and name templates, then validate.
fn build_spec(mut config: Config, args: ForkArgs) -> Result<ForkSpec, ForkError> {
    args.endpoints.apply(&mut config);

    let fork = &mut config.fork;
    if let Some(target) = args.target {
        fork.target_database = target;
    }
    if !args.include.is_empty() {
        fork.include_tables = args.include;
    }
    if !args.exclude.is_empty() {
        fork.exclude_tables = args.exclude;
    }
    fork.schema_only |= args.schema_only;
    fork.data_only |= args.data_only;
    fork.drop_if_exists |= args.drop_if_exists;
    if args.max_connections.is_some() {
        fork.max_connections = args.max_connections;
    }
    if args.chunk_size.is_some() {
        fork.chunk_size = args.chunk_size;
    }
    if args.timeout.is_some() {
        fork.timeout_secs = args.timeout;
    }
    if args.state_dir.is_some() {
        fork.state_dir = args.state_dir;
    }
    if args.progress_file.is_some() {
        fork.progress_file = args.progress_file;
    }

    let mut vars = builtin_vars(&config.source.database, Utc::now());
    vars.extend(args.vars);

    let fork = &mut config.fork;
    if !fork.target_database.is_empty() {
        fork.target_database = resolve_name(&fork.target_database, &vars)?;
    }
    if let Some(job_id) = fork.job_id.take() {
        fork.job_id = Some(render(&job_id, &vars)?);
    }

    config.with_auto_tuning().into_spec()
}

async fn execute(spec: ForkSpec, progress: bool) -> Result<ForkResult, ForkError> {
    let cancel = setup_signal_handler();
    ForkOrchestrator::new(spec)?
        .with_progress_stderr(progress)
        .run(cancel)
        .await
}

fn print_result(result: &ForkResult, json: bool) -> Result<(), ForkError> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    if result.dry_run {
        println!("\nDry run completed!");
    } else if result.resumed {
        println!("\nFork resumed and completed!");
    } else {
        println!("\nFork completed!");
    }
    println!("  Job ID: {}", result.job_id);
    println!("  Target: {}", result.target_database);
    println!("  Strategy: {}", result.strategy);
    println!("  Duration: {}", result.duration);
    println!("  Tables: {}", result.tables);
    println!("  Rows: {}", result.rows);

    if let Some(ref plan) = result.plan {
        if !plan.excluded.is_empty() {
            let excluded: Vec<String> = plan.excluded.iter().map(|t| t.to_string()).collect();
            println!("  Excluded: {}", excluded.join(", "));
        }
        println!(
            "  DDL: {} pre-data, {} post-data statements",
            plan.pre_data.len(),
            plan.post_data.len()
        );
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = match format {
        "json" => subscriber.json().try_init(),
        "text" => subscriber.try_init(),
        other => return Err(format!("unknown log format '{}'", other)),
    };
    installed.map_err(|e| e.to_string())
}

/// Cancel the returned token on SIGINT (Ctrl-C) or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    if stream.recv().await.is_some() {
                        eprintln!("\nReceived {}. Stopping after the current chunks...", name);
                        token.cancel();
                    }
                });
            }
            Err(e) => warn!("Cannot install {} handler: {}", name, e),
        }
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Stopping after the current chunks...");
                token.cancel();
            }
            Err(e) => warn!("Cannot install Ctrl-C handler: {}", e),
        }
    });

    cancel_token
}
