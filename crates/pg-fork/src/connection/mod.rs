//! Connection management for the source and destination servers.

pub mod tls;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::info;

use crate::config::{ConnectionConfig, ForkSpec};
use crate::error::{ErrorKind, ForkError, Result};
use crate::source::{PgSource, SourceDatabase};
use crate::target::{DestinationDatabase, PgDestination, PgServerAdmin, ServerAdmin};
use tls::SslMode;

/// Where a connection actually landed, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerIdentity {
    pub address: String,
    pub port: u16,
    pub role: String,
}

impl ServerIdentity {
    /// Same host, port and authenticated role.
    pub fn same_server(&self, other: &ServerIdentity) -> bool {
        self.address == other.address && self.port == other.port && self.role == other.role
    }
}

const IDENTITY: &str =
    "SELECT host(inet_server_addr()), inet_server_port(), current_user::text";

/// Ask the server which address, port and role this session uses.
///
/// Unix-socket sessions report no address; the configured host stands in.
pub async fn probe_identity(
    client: &tokio_postgres::Client,
    configured_host: &str,
) -> Result<ServerIdentity> {
    let row = client.query_one(IDENTITY, &[]).await?;
    let address: Option<String> = row.get(0);
    let port: Option<i32> = row.get(1);
    let role: String = row.get(2);

    Ok(ServerIdentity {
        address: address.unwrap_or_else(|| normalize_host(configured_host)),
        port: port.and_then(|p| u16::try_from(p).ok()).unwrap_or(5432),
        role,
    })
}

fn normalize_host(host: &str) -> String {
    match host {
        "localhost" | "::1" => "127.0.0.1".to_string(),
        other => other.to_string(),
    }
}

/// Opens the engine's database handles.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Read-only handle on the source database.
    async fn source(&self) -> Result<Arc<dyn SourceDatabase>>;

    /// Maintenance handle on the destination server.
    async fn admin(&self) -> Result<Arc<dyn ServerAdmin>>;

    /// Handle on `database` on the destination server.
    async fn target(&self, database: &str) -> Result<Arc<dyn DestinationDatabase>>;
}

/// Pooled PostgreSQL connections for one fork.
pub struct ConnectionManager {
    source: ConnectionConfig,
    destination: ConnectionConfig,
    pool_size: usize,
}

impl ConnectionManager {
    pub fn new(spec: &ForkSpec) -> Self {
        // One connection per worker plus one for catalog queries and DDL.
        Self::from_endpoints(spec.source.clone(), spec.destination.clone(), spec.max_connections + 1)
    }

    /// A manager over two endpoints without a full fork spec (health checks).
    pub fn from_endpoints(source: ConnectionConfig, destination: ConnectionConfig, pool_size: usize) -> Self {
        Self {
            source,
            destination,
            pool_size,
        }
    }

    /// Build a pool without connecting.
    pub fn build_pool(config: &ConnectionConfig, max_size: usize, read_only: bool) -> Result<Pool> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name(&config.application_name);
        pg_config.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        pg_config.keepalives(true);
        if read_only {
            pg_config.options("-c default_transaction_read_only=on");
        }

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match SslMode::parse(&config.ssl_mode)?.connector()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, NoTls, mgr_config),
        };

        Pool::builder(mgr)
            .max_size(max_size.max(1))
            .build()
            .map_err(|e| ForkError::pool(e, format!("building pool for {}", config.display_name())))
    }

    /// Build a pool and prove it can connect.
    async fn open_pool(
        config: &ConnectionConfig,
        max_size: usize,
        read_only: bool,
        role: &str,
    ) -> Result<Pool> {
        let pool = Self::build_pool(config, max_size, read_only)?;
        let client = pool
            .get()
            .await
            .map_err(|e| ForkError::from_pool_error(e, &format!("connecting to {}", role)))?;
        client.simple_query("SELECT 1").await?;

        info!("Connected to {} {}", role, config.display_name());
        Ok(pool)
    }

    /// Probe both endpoints.
    pub async fn health_check(&self) -> HealthReport {
        HealthReport {
            source: check_endpoint("source", &self.source).await,
            destination: check_endpoint("destination", &self.destination).await,
        }
    }
}

#[async_trait]
impl Connector for ConnectionManager {
    async fn source(&self) -> Result<Arc<dyn SourceDatabase>> {
        let pool = Self::open_pool(&self.source, self.pool_size, true, "source")
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::Planning => ForkError::Planning(format!(
                    "source database {} does not exist",
                    self.source.display_name()
                )),
                _ => e,
            })?;
        Ok(Arc::new(PgSource::new(pool, self.source.host.clone())))
    }

    async fn admin(&self) -> Result<Arc<dyn ServerAdmin>> {
        let pool = Self::open_pool(&self.destination, 1, false, "destination").await?;
        Ok(Arc::new(PgServerAdmin::new(pool, self.destination.host.clone())))
    }

    async fn target(&self, database: &str) -> Result<Arc<dyn DestinationDatabase>> {
        let config = self.destination.with_database(database);
        let pool = Self::open_pool(&config, self.pool_size, false, "target").await?;
        Ok(Arc::new(PgDestination::new(pool)))
    }
}

/// Reachability of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub address: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub server_version: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub source: EndpointHealth,
    pub destination: EndpointHealth,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.source.healthy && self.destination.healthy
    }
}

async fn check_endpoint(endpoint: &str, config: &ConnectionConfig) -> EndpointHealth {
    let started = Instant::now();
    let result = async {
        let pool = ConnectionManager::build_pool(config, 1, endpoint == "source")?;
        let client = pool
            .get()
            .await
            .map_err(|e| ForkError::from_pool_error(e, "health check"))?;
        let row = client.query_one("SELECT current_setting('server_version')", &[]).await?;
        let version: String = row.get(0);
        pool.close();
        Ok::<_, ForkError>(version)
    }
    .await;

    let latency_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(version) => EndpointHealth {
            endpoint: endpoint.to_string(),
            address: config.display_name(),
            healthy: true,
            latency_ms,
            server_version: Some(version),
            error: None,
        },
        Err(e) => EndpointHealth {
            endpoint: endpoint.to_string(),
            address: config.display_name(),
            healthy: false,
            latency_ms,
            server_version: None,
            error: Some(e.to_string()),
        },
    }
}
