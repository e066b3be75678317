//! Source database access.
//!
//! The source is only ever read. Pools opened by the connection manager set
//! `default_transaction_read_only`, and every read below additionally runs in
//! an explicit `REPEATABLE READ READ ONLY` transaction.

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Object, Pool};
use futures::stream::{self, BoxStream, StreamExt};
use tokio_postgres::CopyOutStream;
use tracing::debug;

use crate::connection::{probe_identity, ServerIdentity};
use crate::error::{ForkError, Result};
use crate::identifier::quote_list;
use crate::schema::{
    CatalogEntry, Column, Constraint, ConstraintKind, ForeignKey, IdentityKind, Index, Sequence,
    Table, TableRef,
};

/// Raw COPY text-format data. Item boundaries are arbitrary; rows end in `\n`.
pub type RowStream = BoxStream<'static, Result<Bytes>>;

/// Read access to the source database.
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    /// Address, port and role the server sees for this connection.
    async fn identity(&self) -> Result<ServerIdentity>;

    /// Ordinary tables in `schemas` with their row estimates.
    async fn list_tables(&self, schemas: &[String]) -> Result<Vec<CatalogEntry>>;

    /// Columns, constraints, indexes, foreign keys and owned sequences.
    async fn describe_table(&self, table: &TableRef) -> Result<Table>;

    /// Stream every row of `table` on a dedicated connection.
    async fn copy_out(&self, table: &TableRef, columns: &[String]) -> Result<RowStream>;

    /// Release pooled connections.
    async fn close(&self);
}

const LIST_TABLES: &str = r#"
SELECT n.nspname::text, c.relname::text, c.reltuples::bigint
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE c.relkind = 'r'
  AND n.nspname::text = ANY($1::text[])
ORDER BY n.nspname, c.relname
"#;

const TABLE_OID: &str = r#"
SELECT c.oid
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind = 'r'
"#;

const COLUMNS: &str = r#"
SELECT a.attname::text,
       format_type(a.atttypid, a.atttypmod),
       NOT a.attnotnull,
       pg_get_expr(ad.adbin, ad.adrelid),
       a.attidentity::text,
       a.attgenerated::text,
       CASE WHEN a.attidentity <> '' THEN (
           SELECT s.last_value FROM pg_sequences s
           WHERE format('%I.%I', s.schemaname, s.sequencename)::regclass
                 = pg_get_serial_sequence(format('%I.%I', n.nspname, c.relname), a.attname)::regclass
       ) END
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_attrdef ad ON ad.adrelid = a.attrelid AND ad.adnum = a.attnum
WHERE a.attrelid = $1 AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum
"#;

const CONSTRAINTS: &str = r#"
SELECT con.conname::text,
       con.contype::text,
       pg_get_constraintdef(con.oid),
       rn.nspname::text,
       rc.relname::text
FROM pg_constraint con
LEFT JOIN pg_class rc ON rc.oid = con.confrelid
LEFT JOIN pg_namespace rn ON rn.oid = rc.relnamespace
WHERE con.conrelid = $1 AND con.contype IN ('p', 'u', 'c', 'x', 'f')
ORDER BY con.conname
"#;

const INDEXES: &str = r#"
SELECT ic.relname::text, pg_get_indexdef(i.indexrelid)
FROM pg_index i
JOIN pg_class ic ON ic.oid = i.indexrelid
WHERE i.indrelid = $1
  AND NOT EXISTS (
      SELECT 1 FROM pg_constraint con
      WHERE con.conindid = i.indexrelid AND con.contype IN ('p', 'u', 'x')
  )
ORDER BY ic.relname
"#;

const OWNED_SEQUENCES: &str = r#"
SELECT sn.nspname::text,
       s.relname::text,
       a.attname::text,
       format_type(seq.seqtypid, NULL),
       seq.seqstart,
       seq.seqincrement,
       seq.seqmin,
       seq.seqmax,
       seq.seqcache,
       seq.seqcycle,
       ps.last_value
FROM pg_depend d
JOIN pg_class s ON s.oid = d.objid AND s.relkind = 'S'
JOIN pg_namespace sn ON sn.oid = s.relnamespace
JOIN pg_sequence seq ON seq.seqrelid = s.oid
JOIN pg_attribute a ON a.attrelid = d.refobjid AND a.attnum = d.refobjsubid
LEFT JOIN pg_sequences ps ON ps.schemaname = sn.nspname AND ps.sequencename = s.relname
WHERE d.classid = 'pg_class'::regclass
  AND d.refclassid = 'pg_class'::regclass
  AND d.refobjid = $1
  AND d.deptype = 'a'
ORDER BY s.relname
"#;

/// PostgreSQL source backed by a read-only pool.
pub struct PgSource {
    pool: Pool,
    configured_host: String,
}

impl PgSource {
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
impl SourceDatabase for PgSource {
    async fn identity(&self) -> Result<ServerIdentity> {
        let client = self.client("probing source identity").await?;
        probe_identity(&client, &self.configured_host).await
    }

    async fn list_tables(&self, schemas: &[String]) -> Result<Vec<CatalogEntry>> {
        let client = self.client("listing source tables").await?;
        let rows = client.query(LIST_TABLES, &[&schemas]).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let estimate: i64 = row.get(2);
                CatalogEntry {
                    table: TableRef::new(row.get::<_, String>(0), row.get::<_, String>(1)),
                    // reltuples is -1 (or 0 on old servers) before the first ANALYZE.
                    estimated_rows: (estimate >= 0).then_some(estimate),
                }
            })
            .collect())
    }

    async fn describe_table(&self, table: &TableRef) -> Result<Table> {
        let mut client = self.client("describing source table").await?;
        let tx = client
            .build_transaction()
            .isolation_level(tokio_postgres::IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await?;

        let oid: u32 = tx
            .query_opt(TABLE_OID, &[&table.schema, &table.name])
            .await?
            .map(|row| row.get(0))
            .ok_or_else(|| ForkError::Planning(format!("table {} disappeared from the source", table)))?;

        let columns = tx
            .query(COLUMNS, &[&oid])
            .await?
            .iter()
            .map(|row| {
                let identity: String = row.get(4);
                let generated: String = row.get(5);
                let default: Option<String> = row.get(3);
                let is_generated = !generated.is_empty();
                Column {
                    name: row.get(0),
                    data_type: row.get(1),
                    is_nullable: row.get(2),
                    default: if is_generated { None } else { default.clone() },
                    identity: IdentityKind::from_catalog(&identity),
                    generated: if is_generated { default } else { None },
                    identity_last_value: row.get(6),
                }
            })
            .collect();

        let mut described = Table::new(table.clone(), columns);

        for row in tx.query(CONSTRAINTS, &[&oid]).await? {
            let name: String = row.get(0);
            let contype: String = row.get(1);
            let definition: String = row.get(2);
            if contype == "f" {
                let (Some(schema), Some(referenced)) =
                    (row.get::<_, Option<String>>(3), row.get::<_, Option<String>>(4))
                else {
                    continue;
                };
                described.foreign_keys.push(ForeignKey {
                    name,
                    definition,
                    referenced: TableRef::new(schema, referenced),
                });
            } else if let Some(kind) = ConstraintKind::from_catalog(&contype) {
                described.constraints.push(Constraint {
                    name,
                    kind,
                    definition,
                });
            }
        }

        described.indexes = tx
            .query(INDEXES, &[&oid])
            .await?
            .iter()
            .map(|row| Index {
                name: row.get(0),
                definition: row.get(1),
            })
            .collect();

        described.sequences = tx
            .query(OWNED_SEQUENCES, &[&oid])
            .await?
            .iter()
            .map(|row| Sequence {
                schema: row.get(0),
                name: row.get(1),
                owned_by: row.get(2),
                data_type: row.get(3),
                start: row.get(4),
                increment: row.get(5),
                min_value: row.get(6),
                max_value: row.get(7),
                cache: row.get(8),
                cycle: row.get(9),
                last_value: row.get(10),
            })
            .collect();

        tx.commit().await?;

        debug!(
            "Described {}: {} columns, {} constraints, {} indexes, {} foreign keys",
            table,
            described.columns.len(),
            described.constraints.len(),
            described.indexes.len(),
            described.foreign_keys.len()
        );
        Ok(described)
    }

    async fn copy_out(&self, table: &TableRef, columns: &[String]) -> Result<RowStream> {
        let client = self.client("opening source cursor").await?;
        client
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await?;

        let query = copy_out_query(table, columns);
        debug!("COPY query: {}", query);
        let copy = client.copy_out(&query).await?;

        let cursor = Cursor {
            client: Some(client),
            copy: Box::pin(copy),
        };

        Ok(stream::try_unfold(cursor, |mut cursor| async move {
            match cursor.copy.next().await {
                Some(Ok(data)) => Ok(Some((data, cursor))),
                Some(Err(e)) => Err(ForkError::from(e)),
                None => {
                    cursor.finish().await?;
                    Ok(None)
                }
            }
        })
        .boxed())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// `COPY (SELECT ...) TO STDOUT`. A zero-column table still yields one line per row.
pub fn copy_out_query(table: &TableRef, columns: &[String]) -> String {
    if columns.is_empty() {
        return format!("COPY (SELECT FROM {}) TO STDOUT", table.quoted());
    }
    format!(
        "COPY (SELECT {} FROM {}) TO STDOUT",
        quote_list(columns),
        table.quoted()
    )
}

/// A pooled connection with an open COPY OUT.
///
/// A cursor dropped before the stream ended leaves its connection mid-protocol,
/// so the connection is detached from the pool instead of being recycled.
struct Cursor {
    client: Option<Object>,
    copy: std::pin::Pin<Box<CopyOutStream>>,
}

impl Cursor {
    async fn finish(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.batch_execute("COMMIT").await?;
        }
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            drop(Object::take(client));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_out_query() {
        let table = TableRef::new("public", "users");
        assert_eq!(
            copy_out_query(&table, &["id".into(), "email".into()]),
            "COPY (SELECT \"id\", \"email\" FROM \"public\".\"users\") TO STDOUT"
        );
        assert_eq!(
            copy_out_query(&table, &[]),
            "COPY (SELECT FROM \"public\".\"users\") TO STDOUT"
        );
    }
}
