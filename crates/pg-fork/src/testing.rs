//! In-memory PostgreSQL stand-in for engine tests.
//!
//! A [`FakeServer`] holds databases of tables with rows in COPY text form.
//! It implements the engine's database seams and supports fault injection on
//! chunk writes and DDL statements.
//!
//! Foreign keys are enforced the way PostgreSQL enforces them on the paths
//! the engine uses: a referenced table cannot be truncated unless every
//! referencing table is truncated with it, and rows cannot land in a child
//! table while its parent is empty. Rows carry no real key values, so an
//! empty parent is the only violation the fake can see.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connector, ServerIdentity};
use crate::error::{ForkError, Result};
use crate::schema::{CatalogEntry, Column, ForeignKey, Table, TableRef};
use crate::source::{RowStream, SourceDatabase};
use crate::target::{DestinationDatabase, ServerAdmin, TableWriter};

/// Bytes per piece of a fake COPY stream; small so rows straddle pieces.
const STREAM_PIECE: usize = 7;

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Connection,
    Permission,
}

impl Fault {
    fn error(self) -> ForkError {
        match self {
            Fault::Connection => ForkError::Connection("connection reset by peer".into()),
            Fault::Permission => {
                ForkError::Permission("permission denied for table".into())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct FakeTable {
    table: Table,
    rows: Vec<Bytes>,
}

#[derive(Debug, Clone, Default)]
struct FakeDatabase {
    tables: BTreeMap<TableRef, FakeTable>,
    statements: Vec<String>,
}

#[derive(Default)]
struct ServerState {
    databases: BTreeMap<String, FakeDatabase>,
    sessions: BTreeMap<String, usize>,
    write_faults: BTreeMap<String, VecDeque<Fault>>,
    execute_faults: VecDeque<Fault>,
    chunk_writes: BTreeMap<String, usize>,
    total_writes: usize,
    cancel_after: Option<(usize, CancellationToken)>,
}

pub struct FakeServer {
    identity: ServerIdentity,
    state: Mutex<ServerState>,
}

fn find<'a>(db: &'a FakeDatabase, name: &str) -> Option<&'a FakeTable> {
    db.tables.values().find(|t| t.table.table.matches(name))
}

fn find_mut<'a>(db: &'a mut FakeDatabase, name: &str) -> Option<&'a mut FakeTable> {
    db.tables.values_mut().find(|t| t.table.table.matches(name))
}

/// Row `i` of a table with `columns` columns, in COPY text form.
fn row(i: usize, columns: usize) -> Bytes {
    let fields: Vec<String> = (0..columns.max(1))
        .map(|c| {
            if c == 0 {
                i.to_string()
            } else {
                format!("value_{}_{}", i, c)
            }
        })
        .collect();
    Bytes::from(format!("{}\n", fields.join("\t")))
}

impl FakeServer {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            identity: ServerIdentity {
                address: address.to_string(),
                port: 5432,
                role: "postgres".to_string(),
            },
            state: Mutex::new(ServerState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn add_database(&self, name: &str) {
        self.state()
            .databases
            .entry(name.to_string())
            .or_default();
    }

    /// Add a table holding `rows` generated rows.
    pub fn add_table(&self, database: &str, table: Table, rows: usize) {
        let columns = table.copy_columns().len();
        let rows = (0..rows).map(|i| row(i, columns)).collect();
        let mut state = self.state();
        let db = state.databases.entry(database.to_string()).or_default();
        db.tables
            .insert(table.table.clone(), FakeTable { table, rows });
    }

    pub fn add_empty_table(&self, database: &str, table: Table) {
        self.add_table(database, table, 0);
    }

    /// Append `rows` rows to an existing table, as left by an interrupted load.
    pub fn seed_rows(&self, database: &str, table: &str, rows: usize) {
        let mut state = self.state();
        let db = state.databases.get_mut(database).unwrap();
        let t = find_mut(db, table).unwrap();
        let columns = t.table.copy_columns().len();
        let start = t.rows.len();
        t.rows.extend((start..start + rows).map(|i| row(i, columns)));
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.state().databases.contains_key(name)
    }

    pub fn table_names(&self, database: &str) -> Vec<String> {
        self.state()
            .databases
            .get(database)
            .map(|db| db.tables.keys().map(|t| t.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn table_rows(&self, database: &str, table: &str) -> Option<usize> {
        let state = self.state();
        state
            .databases
            .get(database)
            .and_then(|db| find(db, table))
            .map(|t| t.rows.len())
    }

    pub fn rows(&self, database: &str, table: &str) -> Vec<Bytes> {
        let state = self.state();
        state
            .databases
            .get(database)
            .and_then(|db| find(db, table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Names of the foreign keys defined on `table`.
    pub fn foreign_key_names(&self, database: &str, table: &str) -> Vec<String> {
        let state = self.state();
        state
            .databases
            .get(database)
            .and_then(|db| find(db, table))
            .map(|t| t.table.foreign_keys.iter().map(|fk| fk.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn statements(&self, database: &str) -> Vec<String> {
        self.state()
            .databases
            .get(database)
            .map(|db| db.statements.clone())
            .unwrap_or_default()
    }

    /// Successful chunk writes into tables named `table`, across databases.
    pub fn chunk_writes(&self, table: &str) -> usize {
        self.state().chunk_writes.get(table).copied().unwrap_or(0)
    }

    pub fn open_sessions(&self, database: &str) -> usize {
        self.state().sessions.get(database).copied().unwrap_or(0)
    }

    /// Fail the next chunk writes into `table`, one fault per write.
    pub fn inject_write_faults(&self, table: &str, faults: Vec<Fault>) {
        self.state()
            .write_faults
            .entry(table.to_string())
            .or_default()
            .extend(faults);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.write_faults.clear();
        state.execute_faults.clear();
    }

    /// Fail the next DDL statements, one fault per statement.
    pub fn inject_execute_faults(&self, faults: Vec<Fault>) {
        self.state().execute_faults.extend(faults);
    }

    /// Cancel `token` once `writes` chunks have been written.
    pub fn cancel_after_writes(&self, writes: usize, token: CancellationToken) {
        self.state().cancel_after = Some((writes, token));
    }

    pub fn open_source(self: &Arc<Self>, database: &str) -> Arc<dyn SourceDatabase> {
        *self.state().sessions.entry(database.to_string()).or_default() += 1;
        Arc::new(FakeSource {
            server: self.clone(),
            database: database.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn open_destination(self: &Arc<Self>, database: &str) -> Arc<dyn DestinationDatabase> {
        Arc::new(FakeDestination {
            server: self.clone(),
            database: database.to_string(),
        })
    }

    pub fn admin(self: &Arc<Self>) -> Arc<dyn ServerAdmin> {
        Arc::new(FakeAdmin {
            server: self.clone(),
        })
    }
}

struct FakeSource {
    server: Arc<FakeServer>,
    database: String,
    closed: AtomicBool,
}

#[async_trait]
impl SourceDatabase for FakeSource {
    async fn identity(&self) -> Result<ServerIdentity> {
        Ok(self.server.identity.clone())
    }

    async fn list_tables(&self, schemas: &[String]) -> Result<Vec<CatalogEntry>> {
        let state = self.server.state();
        let db = state
            .databases
            .get(&self.database)
            .ok_or_else(|| ForkError::Planning(format!("database {} does not exist", self.database)))?;
        Ok(db
            .tables
            .values()
            .filter(|t| schemas.contains(&t.table.table.schema))
            .map(|t| CatalogEntry {
                table: t.table.table.clone(),
                estimated_rows: Some(t.rows.len() as i64),
            })
            .collect())
    }

    async fn describe_table(&self, table: &TableRef) -> Result<Table> {
        let state = self.server.state();
        state
            .databases
            .get(&self.database)
            .and_then(|db| db.tables.get(table))
            .map(|t| t.table.clone())
            .ok_or_else(|| ForkError::Planning(format!("relation {} does not exist", table)))
    }

    async fn copy_out(&self, table: &TableRef, _columns: &[String]) -> Result<RowStream> {
        let rows = {
            let state = self.server.state();
            state
                .databases
                .get(&self.database)
                .and_then(|db| db.tables.get(table))
                .map(|t| t.rows.clone())
                .ok_or_else(|| ForkError::Planning(format!("relation {} does not exist", table)))?
        };

        let data: Vec<u8> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        let pieces: Vec<Result<Bytes>> = data
            .chunks(STREAM_PIECE)
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        Ok(stream::iter(pieces).boxed())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.server.state();
            if let Some(sessions) = state.sessions.get_mut(&self.database) {
                *sessions = sessions.saturating_sub(1);
            }
        }
    }
}

struct FakeAdmin {
    server: Arc<FakeServer>,
}

#[async_trait]
impl ServerAdmin for FakeAdmin {
    async fn identity(&self) -> Result<ServerIdentity> {
        Ok(self.server.identity.clone())
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        Ok(self.server.database_exists(name))
    }

    async fn create_database(&self, name: &str, template: Option<&str>) -> Result<()> {
        let mut state = self.server.state();
        if state.databases.contains_key(name) {
            return Err(ForkError::Planning(format!("database {} already exists", name)));
        }
        let db = match template {
            Some(template) => {
                if state.sessions.get(template).copied().unwrap_or(0) > 0 {
                    return Err(ForkError::Connection(format!(
                        "source database \"{}\" is being accessed by other users",
                        template
                    )));
                }
                let mut copy = state
                    .databases
                    .get(template)
                    .cloned()
                    .ok_or_else(|| {
                        ForkError::Planning(format!("template database {} does not exist", template))
                    })?;
                copy.statements.clear();
                copy
            }
            None => FakeDatabase::default(),
        };
        state.databases.insert(name.to_string(), db);
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let mut state = self.server.state();
        state.databases.remove(name);
        state.sessions.remove(name);
        Ok(())
    }

    async fn close(&self) {}
}

struct FakeDestination {
    server: Arc<FakeServer>,
    database: String,
}

fn parse_qualified(text: &str) -> TableRef {
    let parts: Vec<&str> = text.trim().split('.').map(|p| p.trim_matches('"')).collect();
    match parts.as_slice() {
        [schema, name] => TableRef::new(*schema, *name),
        _ => TableRef::new("public", text.trim().trim_matches('"')),
    }
}

/// Foreign keys in `db` referencing `target` from another table.
fn referencing<'a>(db: &'a FakeDatabase, target: &'a TableRef) -> impl Iterator<Item = (&'a TableRef, &'a ForeignKey)> {
    db.tables.iter().flat_map(move |(owner, t)| {
        t.table
            .foreign_keys
            .iter()
            .filter(move |fk| fk.referenced == *target && owner != target)
            .map(move |fk| (owner, fk))
    })
}

/// Truncate `tables` together, as one `TRUNCATE a, b, ...` does.
fn truncate_tables(db: &mut FakeDatabase, tables: &[TableRef]) -> Result<()> {
    for table in tables {
        if !db.tables.contains_key(table) {
            return Err(ForkError::Planning(format!("relation {} does not exist", table)));
        }
        if let Some((owner, fk)) = referencing(db, table).find(|(owner, _)| !tables.contains(owner)) {
            return Err(ForkError::Constraint(format!(
                "cannot truncate a table referenced in a foreign key constraint: {} references {} via {}",
                owner, table, fk.name
            )));
        }
    }
    for table in tables {
        if let Some(t) = db.tables.get_mut(table) {
            t.rows.clear();
        }
    }
    Ok(())
}

/// `ALTER TABLE t ADD CONSTRAINT "name" FOREIGN KEY (...) REFERENCES s.r(...)`.
fn add_foreign_key(db: &mut FakeDatabase, table: TableRef, rest: &str) -> Result<()> {
    let Some(name) = rest.strip_prefix('"').and_then(|r| r.split('"').next()) else {
        return Ok(());
    };
    let definition = rest[name.len() + 2..].trim();
    if !definition.starts_with("FOREIGN KEY") {
        return Ok(());
    }
    let Some((_, target)) = definition.split_once("REFERENCES ") else {
        return Ok(());
    };
    let referenced = parse_qualified(target.split('(').next().unwrap_or(target));

    let parent_empty = db.tables.get(&referenced).map(|t| t.rows.is_empty());
    let t = db
        .tables
        .get_mut(&table)
        .ok_or_else(|| ForkError::Planning(format!("relation {} does not exist", table)))?;
    if t.table.foreign_keys.iter().any(|fk| fk.name == name) {
        return Err(ForkError::State(format!("constraint {} already exists", name)));
    }
    match parent_empty {
        None => {
            return Err(ForkError::Planning(format!("relation {} does not exist", referenced)));
        }
        Some(true) if !t.rows.is_empty() => {
            return Err(ForkError::Constraint(format!(
                "insert or update on table {} violates foreign key constraint {}",
                table, name
            )));
        }
        Some(_) => {}
    }
    t.table.foreign_keys.push(ForeignKey {
        name: name.to_string(),
        definition: definition.to_string(),
        referenced,
    });
    Ok(())
}

/// Apply the subset of DDL the fake understands; other statements are only logged.
fn apply_ddl(db: &mut FakeDatabase, sql: &str) -> Result<()> {
    if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
        let (name, body) = rest.split_once(" (").unwrap_or((rest, ""));
        let table = parse_qualified(name);
        if db.tables.contains_key(&table) {
            return Err(ForkError::State(format!("relation {} already exists", table)));
        }
        let columns = body
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('"'))
            .filter_map(|line| line[1..].split('"').next())
            .map(|name| Column::new(name, "text"))
            .collect();
        db.tables.insert(
            table.clone(),
            FakeTable {
                table: Table::new(table, columns),
                rows: Vec::new(),
            },
        );
    } else if let Some(rest) = sql.strip_prefix("DROP TABLE IF EXISTS ") {
        let table = parse_qualified(rest.trim_end_matches(" CASCADE"));
        db.tables.remove(&table);
        for t in db.tables.values_mut() {
            t.table.foreign_keys.retain(|fk| fk.referenced != table);
        }
    } else if let Some(rest) = sql.strip_prefix("TRUNCATE TABLE ") {
        let tables: Vec<TableRef> = rest.split(", ").map(parse_qualified).collect();
        truncate_tables(db, &tables)?;
    } else if let Some(rest) = sql.strip_prefix("ALTER TABLE ") {
        let Some((name, action)) = rest.split_once(' ') else {
            return Ok(());
        };
        let table = parse_qualified(name);
        if let Some(constraint) = action.strip_prefix("ADD CONSTRAINT ") {
            add_foreign_key(db, table, constraint)?;
        } else if let Some(constraint) = action.strip_prefix("DROP CONSTRAINT IF EXISTS ") {
            let constraint = constraint.trim_matches('"');
            if let Some(t) = db.tables.get_mut(&table) {
                t.table.foreign_keys.retain(|fk| fk.name != constraint);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DestinationDatabase for FakeDestination {
    async fn execute(&self, sql: &str) -> Result<()> {
        let mut state = self.server.state();
        if let Some(fault) = state.execute_faults.pop_front() {
            return Err(fault.error());
        }
        let db = state
            .databases
            .get_mut(&self.database)
            .ok_or_else(|| ForkError::Planning(format!("database {} does not exist", self.database)))?;
        apply_ddl(db, sql)?;
        db.statements.push(sql.to_string());
        Ok(())
    }

    async fn table_columns(&self, table: &TableRef) -> Result<Option<Vec<String>>> {
        let state = self.server.state();
        Ok(state
            .databases
            .get(&self.database)
            .and_then(|db| db.tables.get(table))
            .map(|t| t.table.columns.iter().map(|c| c.name.clone()).collect()))
    }

    async fn truncate(&self, table: &TableRef) -> Result<()> {
        let mut state = self.server.state();
        match state.databases.get_mut(&self.database) {
            Some(db) if db.tables.contains_key(table) => {
                truncate_tables(db, std::slice::from_ref(table))
            }
            _ => Ok(()),
        }
    }

    async fn foreign_keys(&self, tables: &[TableRef]) -> Result<Vec<(TableRef, ForeignKey)>> {
        let state = self.server.state();
        let Some(db) = state.databases.get(&self.database) else {
            return Ok(Vec::new());
        };
        Ok(db
            .tables
            .iter()
            .flat_map(|(owner, t)| t.table.foreign_keys.iter().map(move |fk| (owner, fk)))
            .filter(|(owner, fk)| tables.contains(owner) || tables.contains(&fk.referenced))
            .map(|(owner, fk)| (owner.clone(), fk.clone()))
            .collect())
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64> {
        let state = self.server.state();
        state
            .databases
            .get(&self.database)
            .and_then(|db| db.tables.get(table))
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| ForkError::Verification(format!("relation {} does not exist", table)))
    }

    async fn open_writer(&self, table: &TableRef, _columns: &[String]) -> Result<Box<dyn TableWriter>> {
        let exists = self
            .server
            .state()
            .databases
            .get(&self.database)
            .is_some_and(|db| db.tables.contains_key(table));
        if !exists {
            return Err(ForkError::SchemaMismatch(format!("relation {} does not exist", table)));
        }
        Ok(Box::new(FakeWriter {
            server: self.server.clone(),
            database: self.database.clone(),
            table: table.clone(),
        }))
    }

    async fn close(&self) {}
}

struct FakeWriter {
    server: Arc<FakeServer>,
    database: String,
    table: TableRef,
}

#[async_trait]
impl TableWriter for FakeWriter {
    async fn write_chunk(&mut self, rows: &[Bytes]) -> Result<u64> {
        let mut state = self.server.state();
        if let Some(fault) = state
            .write_faults
            .get_mut(&self.table.name)
            .and_then(|q| q.pop_front())
        {
            return Err(fault.error());
        }

        let db = state
            .databases
            .get_mut(&self.database)
            .filter(|db| db.tables.contains_key(&self.table))
            .ok_or_else(|| ForkError::SchemaMismatch(format!("relation {} does not exist", self.table)))?;
        if let Some(fk) = db.tables[&self.table].table.foreign_keys.iter().find(|fk| {
            fk.referenced != self.table
                && db.tables.get(&fk.referenced).map_or(true, |parent| parent.rows.is_empty())
        }) {
            if !rows.is_empty() {
                return Err(ForkError::Constraint(format!(
                    "insert or update on table {} violates foreign key constraint {}",
                    self.table, fk.name
                )));
            }
        }
        if let Some(t) = db.tables.get_mut(&self.table) {
            t.rows.extend(rows.iter().cloned());
        }

        *state.chunk_writes.entry(self.table.name.clone()).or_default() += 1;
        state.total_writes += 1;
        if let Some((after, token)) = &state.cancel_after {
            if state.total_writes >= *after {
                token.cancel();
            }
        }
        Ok(rows.len() as u64)
    }
}

/// Wires a source server/database and a destination server together.
pub struct FakeConnector {
    source: Arc<FakeServer>,
    source_database: String,
    destination: Arc<FakeServer>,
}

impl FakeConnector {
    pub fn new(source: Arc<FakeServer>, source_database: &str, destination: Arc<FakeServer>) -> Self {
        Self {
            source,
            source_database: source_database.to_string(),
            destination,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn source(&self) -> Result<Arc<dyn SourceDatabase>> {
        if !self.source.database_exists(&self.source_database) {
            return Err(ForkError::Planning(format!(
                "source database {} does not exist",
                self.source_database
            )));
        }
        Ok(self.source.open_source(&self.source_database))
    }

    async fn admin(&self) -> Result<Arc<dyn ServerAdmin>> {
        Ok(self.destination.admin())
    }

    async fn target(&self, database: &str) -> Result<Arc<dyn DestinationDatabase>> {
        if !self.destination.database_exists(database) {
            return Err(ForkError::Planning(format!("database {} does not exist", database)));
        }
        Ok(self.destination.open_destination(database))
    }
}
