//! Destination server access.
//!
//! Two handles exist per destination server: a [`ServerAdmin`] on the
//! configured maintenance database (create, clone and drop databases) and a
//! [`DestinationDatabase`] on the fork target itself (DDL, COPY, counts).

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use deadpool_postgres::{Object, Pool};
use futures::SinkExt;
use tracing::{debug, info};

use crate::connection::{probe_identity, ServerIdentity};
use crate::error::{ForkError, Result};
use crate::identifier::{quote, quote_list};
use crate::schema::{ForeignKey, TableRef};

/// Database-level operations on the destination server.
#[async_trait]
pub trait ServerAdmin: Send + Sync {
    async fn identity(&self) -> Result<ServerIdentity>;

    async fn database_exists(&self, name: &str) -> Result<bool>;

    /// `CREATE DATABASE`, optionally from a template on the same server.
    async fn create_database(&self, name: &str, template: Option<&str>) -> Result<()>;

    /// Terminate sessions on `name`, then drop it.
    async fn drop_database(&self, name: &str) -> Result<()>;

    async fn close(&self);
}

/// Operations on the fork target database.
#[async_trait]
pub trait DestinationDatabase: Send + Sync {
    /// Run one DDL statement.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Column names of `table`, or `None` when it does not exist.
    async fn table_columns(&self, table: &TableRef) -> Result<Option<Vec<String>>>;

    async fn truncate(&self, table: &TableRef) -> Result<()>;

    /// Foreign keys defined on or referencing any of `tables`, each paired
    /// with the table that owns it.
    async fn foreign_keys(&self, tables: &[TableRef]) -> Result<Vec<(TableRef, ForeignKey)>>;

    async fn row_count(&self, table: &TableRef) -> Result<u64>;

    /// Open the write path for one table.
    async fn open_writer(&self, table: &TableRef, columns: &[String]) -> Result<Box<dyn TableWriter>>;

    async fn close(&self);
}

/// Exclusive write path for one table.
#[async_trait]
pub trait TableWriter: Send {
    /// Write COPY text rows atomically. Returns the number of rows committed.
    async fn write_chunk(&mut self, rows: &[Bytes]) -> Result<u64>;
}

const DATABASE_EXISTS: &str = "SELECT 1 FROM pg_database WHERE datname = $1";

const TERMINATE_SESSIONS: &str = r#"
SELECT pg_terminate_backend(pid)
FROM pg_stat_activity
WHERE datname = $1 AND pid <> pg_backend_pid()
"#;

const TABLE_COLUMNS: &str = r#"
SELECT a.attname::text
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')
  AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum
"#;

const TABLE_EXISTS: &str = r#"
SELECT 1
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')
"#;

const FOREIGN_KEYS: &str = r#"
WITH wanted AS (
    SELECT * FROM unnest($1::text[], $2::text[]) AS w(nspname, relname)
)
SELECT cn.nspname::text,
       cr.relname::text,
       con.conname::text,
       pg_get_constraintdef(con.oid),
       rn.nspname::text,
       rr.relname::text
FROM pg_constraint con
JOIN pg_class cr ON cr.oid = con.conrelid
JOIN pg_namespace cn ON cn.oid = cr.relnamespace
JOIN pg_class rr ON rr.oid = con.confrelid
JOIN pg_namespace rn ON rn.oid = rr.relnamespace
WHERE con.contype = 'f' AND con.conparentid = 0
  AND (EXISTS (SELECT 1 FROM wanted w WHERE w.nspname = cn.nspname AND w.relname = cr.relname)
    OR EXISTS (SELECT 1 FROM wanted w WHERE w.nspname = rn.nspname AND w.relname = rr.relname))
ORDER BY cn.nspname, cr.relname, con.conname
"#;

/// Admin handle on the destination's maintenance database.
pub struct PgServerAdmin {
    pool: Pool,
    configured_host: String,
}

impl PgServerAdmin {
    pub fn new(pool: Pool, configured_host: impl Into<String>) -> Self {
        Self {
            pool,
            configured_host: configured_host.into(),
        }
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| ForkError::from_pool_error(e, context))
    }
}

#[async_trait]
impl ServerAdmin for PgServerAdmin {
    async fn identity(&self) -> Result<ServerIdentity> {
        let client = self.client("probing destination identity").await?;
        probe_identity(&client, &self.configured_host).await
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        let client = self.client("checking target database").await?;
        Ok(client.query_opt(DATABASE_EXISTS, &[&name]).await?.is_some())
    }

    async fn create_database(&self, name: &str, template: Option<&str>) -> Result<()> {
        let client = self.client("creating target database").await?;
        let sql = create_database_sql(name, template);
        debug!("{}", sql);
        client.batch_execute(&sql).await?;
        info!("Created database {}", name);
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let client = self.client("dropping target database").await?;
        let terminated = client.query(TERMINATE_SESSIONS, &[&name]).await?.len();
        if terminated > 0 {
            info!("Terminated {} session(s) on {}", terminated, name);
        }
        client
            .batch_execute(&format!("DROP DATABASE IF EXISTS {}", quote(name)))
            .await?;
        info!("Dropped database {}", name);
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

pub fn create_database_sql(name: &str, template: Option<&str>) -> String {
    match template {
        Some(template) => format!(
            "CREATE DATABASE {} TEMPLATE {}",
            quote(name),
            quote(template)
        ),
        None => format!("CREATE DATABASE {}", quote(name)),
    }
}

/// The fork target database.
pub struct PgDestination {
    pool: Pool,
}

impl PgDestination {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| ForkError::from_pool_error(e, context))
    }
}

#[async_trait]
impl DestinationDatabase for PgDestination {
    async fn execute(&self, sql: &str) -> Result<()> {
        let client = self.client("applying DDL").await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn table_columns(&self, table: &TableRef) -> Result<Option<Vec<String>>> {
        let client = self.client("reading target columns").await?;
        if client
            .query_opt(TABLE_EXISTS, &[&table.schema, &table.name])
            .await?
            .is_none()
        {
            return Ok(None);
        }
        let rows = client
            .query(TABLE_COLUMNS, &[&table.schema, &table.name])
            .await?;
        Ok(Some(rows.iter().map(|r| r.get(0)).collect()))
    }

    async fn truncate(&self, table: &TableRef) -> Result<()> {
        let client = self.client("truncating target table").await?;
        client
            .batch_execute(&format!("TRUNCATE TABLE {}", table.quoted()))
            .await?;
        Ok(())
    }

    async fn foreign_keys(&self, tables: &[TableRef]) -> Result<Vec<(TableRef, ForeignKey)>> {
        let client = self.client("reading target foreign keys").await?;
        let schemas: Vec<&str> = tables.iter().map(|t| t.schema.as_str()).collect();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        let rows = client.query(FOREIGN_KEYS, &[&schemas, &names]).await?;
        Ok(rows
            .iter()
            .map(|r| {
                (
                    TableRef::new(r.get::<_, String>(0), r.get::<_, String>(1)),
                    ForeignKey {
                        name: r.get(2),
                        definition: r.get(3),
                        referenced: TableRef::new(r.get::<_, String>(4), r.get::<_, String>(5)),
                    },
                )
            })
            .collect())
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64> {
        let client = self.client("counting target rows").await?;
        let row = client
            .query_one(&format!("SELECT count(*) FROM {}", table.quoted()), &[])
            .await?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn open_writer(&self, table: &TableRef, columns: &[String]) -> Result<Box<dyn TableWriter>> {
        let client = self.client("opening table writer").await?;
        Ok(Box::new(PgTableWriter {
            pool: self.pool.clone(),
            client: Some(client),
            copy_sql: copy_in_sql(table, columns),
        }))
    }

    async fn close(&self) {
        self.pool.close();
    }
}

pub fn copy_in_sql(table: &TableRef, columns: &[String]) -> String {
    if columns.is_empty() {
        return format!("COPY {} FROM STDIN", table.quoted());
    }
    format!(
        "COPY {} ({}) FROM STDIN",
        table.quoted(),
        quote_list(columns)
    )
}

/// COPY writer holding one dedicated destination connection.
///
/// After a failed chunk the connection is discarded and the next write
/// reconnects, so a retry never reuses a session in an unknown state.
pub struct PgTableWriter {
    pool: Pool,
    client: Option<Object>,
    copy_sql: String,
}

#[async_trait]
impl TableWriter for PgTableWriter {
    async fn write_chunk(&mut self, rows: &[Bytes]) -> Result<u64> {
        let client = match self.client.take() {
            Some(client) => client,
            None => self
                .pool
                .get()
                .await
                .map_err(|e| ForkError::from_pool_error(e, "reconnecting table writer"))?,
        };

        let mut buf = BytesMut::with_capacity(rows.iter().map(|r| r.len()).sum());
        for row in rows {
            buf.extend_from_slice(row);
        }

        let sink = client.copy_in::<str, Bytes>(self.copy_sql.as_str()).await;
        let written = match sink {
            Ok(sink) => {
                tokio::pin!(sink);
                match sink.send(buf.freeze()).await {
                    Ok(()) => sink.finish().await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match written {
            Ok(n) => {
                self.client = Some(client);
                Ok(n)
            }
            Err(e) => {
                drop(Object::take(client));
                Err(e.into())
            }
        }
    }
}
