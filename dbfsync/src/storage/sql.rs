use super::{check_indexes, conform_row, ensure_exists, ApplySummary, Storage};
use crate::condition::{filter_indexes, Condition};
use crate::config::Engine;
use crate::error::{Result, SyncError};
use crate::reconcile::{Operation, OperationGroup};
use crate::value::{cast_value, parse_column_type, ColumnDef, ColumnType, Row, Value};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;

/// SQLite tables inside a database file.
pub struct SqlStorage;

impl SqlStorage {
    fn open(path: &Path) -> Result<Connection> {
        ensure_exists(path)?;
        Ok(Connection::open(path)?)
    }

    /// Every row with its rowid, in rowid order.
    fn snapshot(conn: &Connection, table: &str, columns: &[ColumnDef]) -> Result<Vec<(i64, Row)>> {
        let select = columns
            .iter()
            .map(|c| quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT rowid, {select} FROM {} ORDER BY rowid", quote(table));

        let mut stmt = conn.prepare(&sql)?;
        let raw_rows = stmt.query_map([], |row| {
            let rowid: i64 = row.get(0)?;
            let mut cells = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                cells.push(row.get::<_, SqlValue>(i + 1)?);
            }
            Ok((rowid, cells))
        })?;

        let mut rows = Vec::new();
        for raw in raw_rows {
            let (rowid, cells) = raw?;
            let mut row = Row::new();
            for (column, cell) in columns.iter().zip(cells) {
                row.insert(column.name.clone(), from_sql(column, cell)?);
            }
            rows.push((rowid, row));
        }
        Ok(rows)
    }

    fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnDef>> {
        let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
        let rows = stmt.query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut columns = Vec::new();
        for row in rows {
            let (name, tag) = row?;
            let column = match parse_column_type(Engine::Sql, &name, &tag) {
                Ok(column) => column,
                // Untyped or unusual declarations are handled as text
                Err(_) => ColumnDef::new(&name, ColumnType::Text, &tag),
            };
            columns.push(column);
        }

        if columns.is_empty() {
            return Err(SyncError::Storage(format!("table '{table}' does not exist")));
        }
        Ok(columns)
    }

    fn update_by_rowid(conn: &Connection, table: &str, rowid: i64, cells: &[(&ColumnDef, Value)]) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }
        let assignments = cells
            .iter()
            .enumerate()
            .map(|(i, (c, _))| format!("{} = ?{}", quote(&c.name), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE rowid = ?{}",
            quote(table),
            cells.len() + 1
        );

        let mut values: Vec<&dyn ToSql> = cells.iter().map(|(_, v)| v as &dyn ToSql).collect();
        values.push(&rowid);
        conn.execute(&sql, values.as_slice())?;
        Ok(())
    }

    fn insert_cells(conn: &Connection, table: &str, cells: &[(&ColumnDef, Value)]) -> Result<()> {
        let sql = if cells.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote(table))
        } else {
            let names = cells
                .iter()
                .map(|(c, _)| quote(&c.name))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = (1..=cells.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("INSERT INTO {} ({names}) VALUES ({placeholders})", quote(table))
        };
        conn.execute(&sql, params_from_iter(cells.iter().map(|(_, v)| v)))?;
        Ok(())
    }
}

impl Storage for SqlStorage {
    fn create_table(&self, path: &Path, table: &str, columns: &[ColumnDef]) -> Result<()> {
        require_table(path, table)?;
        if columns.is_empty() {
            return Err(SyncError::Storage(format!("table '{table}' needs at least one column")));
        }
        let definitions = columns
            .iter()
            .map(|c| format!("{} {}", quote(&c.name), c.tag))
            .collect::<Vec<_>>()
            .join(", ");

        let conn = Connection::open(path)?;
        conn.execute_batch(&format!("CREATE TABLE {} ({definitions})", quote(table)))
            .map_err(|e| SyncError::Storage(format!("cannot create table '{table}': {e}")))?;
        log::debug!("Created table {table} in {}", path.display());
        Ok(())
    }

    fn columns(&self, path: &Path, table: &str) -> Result<Vec<ColumnDef>> {
        require_table(path, table)?;
        let conn = Self::open(path)?;
        Self::table_columns(&conn, table)
    }

    fn insert_row(&self, path: &Path, table: &str, row: &Row) -> Result<()> {
        require_table(path, table)?;
        let conn = Self::open(path)?;
        let columns = Self::table_columns(&conn, table)?;
        let cells = conform_row(&columns, row)?;
        Self::insert_cells(&conn, table, &cells)
    }

    fn read_rows(&self, path: &Path, table: &str, condition: Option<&Condition>) -> Result<Vec<Row>> {
        require_table(path, table)?;
        let conn = Self::open(path)?;
        let columns = Self::table_columns(&conn, table)?;
        let rows: Vec<Row> = Self::snapshot(&conn, table, &columns)?
            .into_iter()
            .map(|(_, row)| row)
            .collect();

        let keep = filter_indexes(&rows, condition)?;
        Ok(rows
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.binary_search(i).is_ok())
            .map(|(_, row)| row)
            .collect())
    }

    fn update_rows(&self, path: &Path, table: &str, row: &Row, condition: &Condition) -> Result<usize> {
        require_table(path, table)?;
        let mut conn = Self::open(path)?;
        let columns = Self::table_columns(&conn, table)?;
        let cells = conform_row(&columns, row)?;
        let snapshot = Self::snapshot(&conn, table, &columns)?;
        let rows: Vec<Row> = snapshot.iter().map(|(_, r)| r.clone()).collect();
        let matched = filter_indexes(&rows, Some(condition))?;

        let tx = conn.transaction()?;
        for &index in &matched {
            Self::update_by_rowid(&tx, table, snapshot[index].0, &cells)?;
        }
        tx.commit()?;
        Ok(matched.len())
    }

    fn delete_rows(&self, path: &Path, table: &str, condition: &Condition) -> Result<usize> {
        require_table(path, table)?;
        let mut conn = Self::open(path)?;
        let columns = Self::table_columns(&conn, table)?;
        let snapshot = Self::snapshot(&conn, table, &columns)?;
        let rows: Vec<Row> = snapshot.iter().map(|(_, r)| r.clone()).collect();
        let matched = filter_indexes(&rows, Some(condition))?;

        let tx = conn.transaction()?;
        let sql = format!("DELETE FROM {} WHERE rowid = ?1", quote(table));
        for &index in &matched {
            tx.execute(&sql, params![snapshot[index].0])?;
        }
        tx.commit()?;
        Ok(matched.len())
    }

    fn drop_table(&self, path: &Path, table: &str) -> Result<()> {
        ensure_exists(path)?;
        if table.is_empty() {
            std::fs::remove_file(path)?;
            return Ok(());
        }
        let conn = Self::open(path)?;
        conn.execute_batch(&format!("DROP TABLE {}", quote(table)))
            .map_err(|e| SyncError::Storage(format!("cannot drop table '{table}': {e}")))?;
        Ok(())
    }

    fn apply(&self, path: &Path, table: &str, group: &OperationGroup) -> Result<ApplySummary> {
        require_table(path, table)?;
        let mut conn = Self::open(path)?;
        let columns = Self::table_columns(&conn, table)?;
        let snapshot = Self::snapshot(&conn, table, &columns)?;
        let label = format!("{}:{table}", path.display());
        let deleted = check_indexes(group, snapshot.len(), &label)?;

        let mut summary = ApplySummary::default();
        let tx = conn.transaction()?;
        for op in &group.update {
            let written = conform_row(&columns, &op.fields)
                .and_then(|cells| Self::update_by_rowid(&tx, table, snapshot[op.index].0, &cells));
            match written {
                Ok(()) => summary.updated += 1,
                Err(e) => summary.reject(&label, Operation::Update(op).describe(), e)?,
            }
        }
        let sql = format!("DELETE FROM {} WHERE rowid = ?1", quote(table));
        for &index in &deleted {
            tx.execute(&sql, params![snapshot[index].0])?;
            summary.deleted += 1;
        }
        for op in &group.insert {
            let written = conform_row(&columns, &op.fields)
                .and_then(|cells| Self::insert_cells(&tx, table, &cells));
            match written {
                Ok(()) => summary.inserted += 1,
                Err(e) => summary.reject(&label, Operation::Insert(op).describe(), e)?,
            }
        }
        tx.commit()?;

        Ok(summary)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Integer(n) => ToSqlOutput::Owned(SqlValue::Integer(*n)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Date(_) | Value::DateTime(_) => ToSqlOutput::Owned(SqlValue::Text(self.to_string())),
        })
    }
}

/// Convert a stored SQLite cell into a typed value for its declared column.
fn from_sql(column: &ColumnDef, cell: SqlValue) -> Result<Value> {
    match (cell, column.kind) {
        (SqlValue::Null, _) => Ok(Value::Null),
        (SqlValue::Integer(n), ColumnType::Boolean) => Ok(Value::Bool(n != 0)),
        (SqlValue::Integer(n), ColumnType::Float) => Ok(Value::Float(n as f64)),
        (SqlValue::Integer(n), _) => Ok(Value::Integer(n)),
        (SqlValue::Real(f), _) => Ok(Value::Float(f)),
        (SqlValue::Text(s), _) if s.trim().is_empty() => Ok(Value::Null),
        (SqlValue::Text(s), ColumnType::Text) => Ok(Value::Text(s.trim_end().to_string())),
        (SqlValue::Text(s), _) => cast_value(column, &s),
        (SqlValue::Blob(b), _) => Ok(Value::Text(String::from_utf8_lossy(&b).trim_end().to_string())),
    }
}

fn require_table(path: &Path, table: &str) -> Result<()> {
    if table.is_empty() {
        return Err(SyncError::Storage(format!(
            "{}: a table name is required for SQL sources",
            path.display()
        )));
    }
    Ok(())
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
