//! Storage adapters: one per engine family, behind a common trait.

mod dbf;
mod sql;

pub use dbf::DbfStorage;
pub use sql::SqlStorage;

use crate::condition::Condition;
use crate::config::Engine;
use crate::error::{Result, SyncError};
use crate::reconcile::OperationGroup;
use crate::value::{conform_value, find_column, ColumnDef, Row, Value};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

/// Counts of rows touched while applying an operation group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Inserts and updates whose values the destiny cannot hold
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedRow>,
}

impl ApplySummary {
    /// Record a row-level failure, or hand back any other error.
    pub(crate) fn reject(&mut self, label: &str, operation: String, err: SyncError) -> Result<()> {
        if !err.is_row_error() {
            return Err(err);
        }
        log::warn!("{label}: skipped {operation}: {err}");
        self.rejected.push(RejectedRow {
            operation,
            reason: err.to_string(),
        });
        Ok(())
    }
}

/// One operation left out of an apply, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    pub operation: String,
    pub reason: String,
}

/// Table operations on one engine family. `table` is ignored by engines
/// where the file is the table.
pub trait Storage: Send + Sync {
    /// Create a table (and its file, if needed). Fails if it already exists.
    fn create_table(&self, path: &Path, table: &str, columns: &[ColumnDef]) -> Result<()>;

    /// Declared columns of a table, in physical order.
    fn columns(&self, path: &Path, table: &str) -> Result<Vec<ColumnDef>>;

    fn insert_row(&self, path: &Path, table: &str, row: &Row) -> Result<()>;

    /// Rows in physical order, optionally filtered.
    fn read_rows(&self, path: &Path, table: &str, condition: Option<&Condition>) -> Result<Vec<Row>>;

    /// Overwrite the given columns on every matching row.
    fn update_rows(&self, path: &Path, table: &str, row: &Row, condition: &Condition) -> Result<usize>;

    fn delete_rows(&self, path: &Path, table: &str, condition: &Condition) -> Result<usize>;

    /// Drop a table. An empty table name removes the whole file.
    fn drop_table(&self, path: &Path, table: &str) -> Result<()>;

    /// Apply a whole group. Indices refer to the row order as currently
    /// stored and are resolved before any row is written. A row whose values
    /// do not fit the destiny is listed in [`ApplySummary::rejected`] and the
    /// rest of the group is still written.
    fn apply(&self, path: &Path, table: &str, group: &OperationGroup) -> Result<ApplySummary>;
}

static DBF: DbfStorage = DbfStorage;
static SQL: SqlStorage = SqlStorage;

/// The adapter handling `engine`.
pub fn adapter(engine: Engine) -> &'static dyn Storage {
    match engine {
        Engine::Dbf => &DBF,
        Engine::Sql => &SQL,
    }
}

/// Pair each cell of `row` with its declared column, converting the value
/// to the column's type.
pub(crate) fn conform_row<'a>(
    columns: &'a [ColumnDef],
    row: &Row,
) -> Result<Vec<(&'a ColumnDef, Value)>> {
    row.iter()
        .map(|(name, value)| {
            let column =
                find_column(columns, name).ok_or_else(|| SyncError::FieldNotFound(name.clone()))?;
            Ok((column, conform_value(column, value)?))
        })
        .collect()
}

/// Check that every index of `group` exists in a snapshot of `len` rows and
/// return the set of deleted indices.
pub(crate) fn check_indexes(group: &OperationGroup, len: usize, label: &str) -> Result<BTreeSet<usize>> {
    let out_of_range = group
        .update
        .iter()
        .map(|u| u.index)
        .chain(group.delete.iter().map(|d| d.index))
        .find(|&i| i >= len);

    if let Some(index) = out_of_range {
        return Err(SyncError::Storage(format!(
            "{label}: row index {index} out of range ({len} rows)"
        )));
    }
    Ok(group.delete.iter().map(|d| d.index).collect())
}

pub(crate) fn ensure_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(SyncError::Storage(format!("{} does not exist", path.display())));
    }
    Ok(())
}
