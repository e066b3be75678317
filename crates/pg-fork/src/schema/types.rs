//! Table model produced by catalog introspection.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identifier::qualify;

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Quoted `"schema"."name"` for SQL text.
    pub fn quoted(&self) -> String {
        qualify(&self.schema, &self.name)
    }

    /// Whether a filter entry names this table.
    ///
    /// `schema.table` matches exactly; a bare `table` matches in any schema.
    pub fn matches(&self, filter: &str) -> bool {
        let filter = filter.trim();
        match filter.split_once('.') {
            Some((schema, name)) => schema == self.schema && name == self.name,
            None => filter == self.name,
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One row of the source table catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub table: TableRef,

    /// `pg_class.reltuples`; `None` when the table was never analyzed.
    pub estimated_rows: Option<i64>,
}

/// How an identity column generates values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Always,
    ByDefault,
}

impl IdentityKind {
    /// Parse `pg_attribute.attidentity`.
    pub fn from_catalog(code: &str) -> Option<Self> {
        match code {
            "a" => Some(IdentityKind::Always),
            "d" => Some(IdentityKind::ByDefault),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            IdentityKind::Always => "GENERATED ALWAYS AS IDENTITY",
            IdentityKind::ByDefault => "GENERATED BY DEFAULT AS IDENTITY",
        }
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,

    /// Type as rendered by `format_type`, e.g. `character varying(255)`.
    pub data_type: String,

    pub is_nullable: bool,

    /// Default expression, as rendered by `pg_get_expr`.
    pub default: Option<String>,

    pub identity: Option<IdentityKind>,

    /// Expression of a stored generated column.
    pub generated: Option<String>,

    /// Last value handed out by the identity sequence, if any.
    pub identity_last_value: Option<i64>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
            default: None,
            identity: None,
            generated: None,
            identity_last_value: None,
        }
    }

    /// Generated columns are computed by the destination and cannot be copied.
    pub fn is_copyable(&self) -> bool {
        self.generated.is_none()
    }
}

/// Kind of a table constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    Check,
    Exclusion,
}

impl ConstraintKind {
    /// Parse `pg_constraint.contype`. Foreign keys are modelled separately.
    pub fn from_catalog(code: &str) -> Option<Self> {
        match code {
            "p" => Some(ConstraintKind::PrimaryKey),
            "u" => Some(ConstraintKind::Unique),
            "c" => Some(ConstraintKind::Check),
            "x" => Some(ConstraintKind::Exclusion),
            _ => None,
        }
    }
}

/// A non-foreign-key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub kind: ConstraintKind,

    /// `pg_get_constraintdef` output, e.g. `PRIMARY KEY (id)`.
    pub definition: String,
}

/// A secondary index not backing a constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,

    /// Full `CREATE INDEX` statement from `pg_get_indexdef`.
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub definition: String,
    pub referenced: TableRef,
}

/// A sequence owned by one of the table's columns (serial columns).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub schema: String,
    pub name: String,
    pub owned_by: String,
    pub data_type: String,
    pub start: i64,
    pub increment: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub cache: i64,
    pub cycle: bool,

    /// `None` until `nextval` was first called.
    pub last_value: Option<i64>,
}

/// Full metadata for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub table: TableRef,
    pub columns: Vec<Column>,
    pub constraints: Vec<Constraint>,
    pub indexes: Vec<Index>,
    pub foreign_keys: Vec<ForeignKey>,
    pub sequences: Vec<Sequence>,
}

impl Table {
    pub fn new(table: TableRef, columns: Vec<Column>) -> Self {
        Self {
            table,
            columns,
            constraints: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            sequences: Vec::new(),
        }
    }

    /// Columns moved by COPY, in catalog order.
    pub fn copy_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_copyable())
            .map(|c| c.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matching() {
        let t = TableRef::new("public", "users");
        assert!(t.matches("users"));
        assert!(t.matches("public.users"));
        assert!(t.matches(" users "));
        assert!(!t.matches("billing.users"));
        assert!(!t.matches("user"));
    }

    #[test]
    fn test_copy_columns_skip_generated() {
        let mut full_name = Column::new("full_name", "text");
        full_name.generated = Some("(first || ' ' || last)".into());
        let table = Table::new(
            TableRef::new("public", "people"),
            vec![
                Column::new("first", "text"),
                Column::new("last", "text"),
                full_name,
            ],
        );
        assert_eq!(table.copy_columns(), vec!["first", "last"]);
    }

    #[test]
    fn test_catalog_codes() {
        assert_eq!(IdentityKind::from_catalog("a"), Some(IdentityKind::Always));
        assert_eq!(IdentityKind::from_catalog(""), None);
        assert_eq!(ConstraintKind::from_catalog("p"), Some(ConstraintKind::PrimaryKey));
        assert_eq!(ConstraintKind::from_catalog("f"), None);
    }
}
