//! Schema extraction and replay.

mod ddl;
mod types;

pub use ddl::{build_ddl, compatibility_issues, reload_ddl, DdlKind, DdlPlan, DdlStatement};
pub use types::*;

use tracing::{debug, info};

use crate::error::{ForkError, Result};
use crate::source::SourceDatabase;
use crate::target::DestinationDatabase;

/// Reads table metadata from the source and turns it into destination DDL.
pub struct SchemaExtractor<'a> {
    source: &'a dyn SourceDatabase,
}

impl<'a> SchemaExtractor<'a> {
    pub fn new(source: &'a dyn SourceDatabase) -> Self {
        Self { source }
    }

    /// Describe every table in `tables`, in order.
    pub async fn extract(&self, tables: &[TableRef]) -> Result<Vec<Table>> {
        let mut described = Vec::with_capacity(tables.len());
        for table in tables {
            described.push(self.source.describe_table(table).await?);
        }
        info!("Extracted schema for {} tables", described.len());
        Ok(described)
    }
}

/// Verify the destination can receive every column of `tables`.
///
/// Reports every missing table and column in one error.
pub async fn check_compatibility<'t, I>(destination: &dyn DestinationDatabase, tables: I) -> Result<()>
where
    I: IntoIterator<Item = &'t Table>,
{
    let mut issues = Vec::new();
    let mut checked = 0;
    for table in tables {
        let columns = destination.table_columns(&table.table).await?;
        issues.extend(compatibility_issues(table, columns.as_deref()));
        checked += 1;
    }

    if issues.is_empty() {
        debug!("Destination schema accepts all {} tables", checked);
        Ok(())
    } else {
        Err(ForkError::SchemaMismatch(issues.join("; ")))
    }
}
