//! DDL generation.
//!
//! Statements are split around the data load. `pre_data` creates everything
//! rows need to land (schemas, sequences, tables with their primary keys and
//! check constraints); `post_data` holds what is cheaper or only possible
//! once data is present, with foreign keys strictly last.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

use super::types::{Column, ConstraintKind, ForeignKey, Sequence, Table, TableRef};
use crate::identifier::{literal, qualify, quote};

/// What a DDL statement creates or changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlKind {
    Schema,
    Sequence,
    Table,
    SequenceOwnership,
    SequenceValue,
    Constraint,
    Index,
    ForeignKey,
    TemplateClone,
    DropTable,
    DropForeignKey,
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlStatement {
    pub kind: DdlKind,

    /// Object the statement acts on, for logs and error messages.
    pub object: String,

    pub sql: String,
}

impl DdlStatement {
    pub fn new(kind: DdlKind, object: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            kind,
            object: object.into(),
            sql: sql.into(),
        }
    }
}

/// Ordered DDL around the data load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlPlan {
    pub pre_data: Vec<DdlStatement>,
    pub post_data: Vec<DdlStatement>,
}

/// Generate the DDL that recreates `tables` on an empty database.
pub fn build_ddl(tables: &[Table]) -> DdlPlan {
    let mut plan = DdlPlan::default();
    let in_plan: BTreeSet<&TableRef> = tables.iter().map(|t| &t.table).collect();

    let mut schemas = BTreeSet::new();
    for table in tables {
        if schemas.insert(table.table.schema.as_str()) {
            plan.pre_data.push(DdlStatement::new(
                DdlKind::Schema,
                &table.table.schema,
                format!("CREATE SCHEMA IF NOT EXISTS {}", quote(&table.table.schema)),
            ));
        }
    }

    for table in tables {
        for seq in &table.sequences {
            plan.pre_data.push(DdlStatement::new(
                DdlKind::Sequence,
                format!("{}.{}", seq.schema, seq.name),
                create_sequence(seq),
            ));
        }
    }

    for table in tables {
        plan.pre_data.push(DdlStatement::new(
            DdlKind::Table,
            table.table.to_string(),
            create_table(table),
        ));
    }

    for table in tables {
        for seq in &table.sequences {
            plan.pre_data.push(DdlStatement::new(
                DdlKind::SequenceOwnership,
                format!("{}.{}", seq.schema, seq.name),
                format!(
                    "ALTER SEQUENCE {} OWNED BY {}.{}",
                    qualify(&seq.schema, &seq.name),
                    table.table.quoted(),
                    quote(&seq.owned_by)
                ),
            ));
        }
    }

    for table in tables {
        for seq in &table.sequences {
            if let Some(value) = seq.last_value {
                plan.post_data.push(DdlStatement::new(
                    DdlKind::SequenceValue,
                    format!("{}.{}", seq.schema, seq.name),
                    format!(
                        "SELECT setval({}, {}, true)",
                        literal(&qualify(&seq.schema, &seq.name)),
                        value
                    ),
                ));
            }
        }
        for col in &table.columns {
            if let (Some(_), Some(value)) = (col.identity, col.identity_last_value) {
                plan.post_data.push(DdlStatement::new(
                    DdlKind::SequenceValue,
                    format!("{}.{}", table.table, col.name),
                    format!(
                        "SELECT setval(pg_get_serial_sequence({}, {}), {}, true)",
                        literal(&table.table.quoted()),
                        literal(&col.name),
                        value
                    ),
                ));
            }
        }
    }

    for table in tables {
        for constraint in table
            .constraints
            .iter()
            .filter(|c| matches!(c.kind, ConstraintKind::Unique | ConstraintKind::Exclusion))
        {
            plan.post_data.push(DdlStatement::new(
                DdlKind::Constraint,
                format!("{}.{}", table.table, constraint.name),
                add_constraint(&table.table, &constraint.name, &constraint.definition),
            ));
        }
    }

    for table in tables {
        for index in &table.indexes {
            plan.post_data.push(DdlStatement::new(
                DdlKind::Index,
                format!("{}.{}", table.table.schema, index.name),
                index.definition.clone(),
            ));
        }
    }

    for table in tables {
        for fk in &table.foreign_keys {
            if !in_plan.contains(&fk.referenced) {
                warn!(
                    "Skipping foreign key {} on {}: referenced table {} is not part of the fork",
                    fk.name, table.table, fk.referenced
                );
                continue;
            }
            plan.post_data.push(DdlStatement::new(
                DdlKind::ForeignKey,
                format!("{}.{}", table.table, fk.name),
                add_constraint(&table.table, &fk.name, &fk.definition),
            ));
        }
    }

    plan
}

/// DDL that empties existing `tables` for a data-only load.
///
/// `foreign_keys` are the destination's constraints touching those tables,
/// each with the table it is defined on. They are dropped before one
/// `TRUNCATE` over every table and re-added in `post_data`, after the load.
pub fn reload_ddl(tables: &[TableRef], foreign_keys: &[(TableRef, ForeignKey)]) -> DdlPlan {
    let mut plan = DdlPlan::default();
    if tables.is_empty() {
        return plan;
    }

    for (table, fk) in foreign_keys {
        plan.pre_data.push(DdlStatement::new(
            DdlKind::DropForeignKey,
            format!("{}.{}", table, fk.name),
            format!(
                "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
                table.quoted(),
                quote(&fk.name)
            ),
        ));
    }

    let names: Vec<String> = tables.iter().map(TableRef::quoted).collect();
    plan.pre_data.push(DdlStatement::new(
        DdlKind::Truncate,
        format!("{} tables", tables.len()),
        format!("TRUNCATE TABLE {}", names.join(", ")),
    ));

    for (table, fk) in foreign_keys {
        plan.post_data.push(DdlStatement::new(
            DdlKind::ForeignKey,
            format!("{}.{}", table, fk.name),
            add_constraint(table, &fk.name, &fk.definition),
        ));
    }
    plan
}

fn create_table(table: &Table) -> String {
    let mut lines: Vec<String> = table.columns.iter().map(column_definition).collect();

    for constraint in table
        .constraints
        .iter()
        .filter(|c| matches!(c.kind, ConstraintKind::PrimaryKey | ConstraintKind::Check))
    {
        lines.push(format!(
            "CONSTRAINT {} {}",
            quote(&constraint.name),
            constraint.definition
        ));
    }

    if lines.is_empty() {
        return format!("CREATE TABLE {} ()", table.table.quoted());
    }
    format!(
        "CREATE TABLE {} (\n    {}\n)",
        table.table.quoted(),
        lines.join(",\n    ")
    )
}

fn column_definition(col: &Column) -> String {
    let mut def = format!("{} {}", quote(&col.name), col.data_type);

    if let Some(expr) = &col.generated {
        def.push_str(&format!(" GENERATED ALWAYS AS ({}) STORED", expr));
    } else if let Some(identity) = col.identity {
        def.push(' ');
        def.push_str(identity.as_sql());
    } else if let Some(default) = &col.default {
        def.push_str(&format!(" DEFAULT {}", default));
    }

    if !col.is_nullable {
        def.push_str(" NOT NULL");
    }
    def
}

fn create_sequence(seq: &Sequence) -> String {
    format!(
        "CREATE SEQUENCE IF NOT EXISTS {} AS {} INCREMENT BY {} MINVALUE {} MAXVALUE {} START WITH {} CACHE {} {}",
        qualify(&seq.schema, &seq.name),
        seq.data_type,
        seq.increment,
        seq.min_value,
        seq.max_value,
        seq.start,
        seq.cache,
        if seq.cycle { "CYCLE" } else { "NO CYCLE" }
    )
}

fn add_constraint(table: &TableRef, name: &str, definition: &str) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {}",
        table.quoted(),
        quote(name),
        definition
    )
}

/// Missing tables or columns that would make a data-only load fail.
pub fn compatibility_issues(source: &Table, destination_columns: Option<&[String]>) -> Vec<String> {
    let Some(existing) = destination_columns else {
        return vec![format!("table {} does not exist", source.table)];
    };

    let missing: Vec<String> = source
        .copy_columns()
        .into_iter()
        .filter(|c| !existing.contains(c))
        .collect();

    if missing.is_empty() {
        Vec::new()
    } else {
        vec![format!(
            "table {} is missing columns: {}",
            source.table,
            missing.join(", ")
        )]
    }
}
