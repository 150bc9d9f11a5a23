use super::{find_column, ColumnDef, ColumnType, Row, Value, DATETIME_FORMAT, DATE_FORMAT};
use crate::config::Engine;
use crate::error::{Result, SyncError};
use chrono::{NaiveDate, NaiveDateTime};

/// Parse a column type tag as declared for `engine`.
///
/// DBF tags are a type letter with an optional size: `C(30)`, `N(10,2)`,
/// `L`, `D`. SQL tags follow SQLite affinity rules, so `VARCHAR(20)` is text
/// and `BIGINT` is an integer.
pub fn parse_column_type(engine: Engine, name: &str, tag: &str) -> Result<ColumnDef> {
    let trimmed = tag.trim();
    let invalid = || SyncError::value_not_valid(name, tag, "column type");

    match engine {
        Engine::Dbf => {
            let (letter, size) = match trimmed.find('(') {
                Some(pos) => {
                    let inner = trimmed[pos + 1..].strip_suffix(')').ok_or_else(invalid)?;
                    (&trimmed[..pos], Some(inner))
                }
                None => (trimmed, None),
            };
            let (length, decimals) = match size {
                Some(inner) => {
                    let mut parts = inner.split(',').map(|p| p.trim().parse::<u8>());
                    let length = parts.next().transpose().map_err(|_| invalid())?;
                    let decimals = parts.next().transpose().map_err(|_| invalid())?;
                    (length, decimals)
                }
                None => (None, None),
            };

            let kind = match letter.to_ascii_uppercase().as_str() {
                "C" | "M" => ColumnType::Text,
                "N" if decimals.unwrap_or(0) == 0 => ColumnType::Integer,
                "N" | "F" | "O" | "Y" => ColumnType::Float,
                "I" => ColumnType::Integer,
                "L" => ColumnType::Boolean,
                "D" => ColumnType::Date,
                "T" | "@" => ColumnType::DateTime,
                _ => return Err(invalid()),
            };

            let mut column = ColumnDef::new(name, kind, trimmed);
            column.length = length;
            column.decimals = decimals;
            Ok(column)
        }
        Engine::Sql => {
            if trimmed.is_empty() {
                return Err(invalid());
            }
            let upper = trimmed.to_ascii_uppercase();
            let kind = if upper.contains("DATETIME") || upper.contains("TIMESTAMP") {
                ColumnType::DateTime
            } else if upper.contains("DATE") {
                ColumnType::Date
            } else if upper.contains("BOOL") {
                ColumnType::Boolean
            } else if upper.contains("INT") {
                ColumnType::Integer
            } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
                ColumnType::Text
            } else if upper.contains("REAL")
                || upper.contains("FLOA")
                || upper.contains("DOUB")
                || upper.contains("NUMERIC")
                || upper.contains("DECIMAL")
            {
                ColumnType::Float
            } else {
                return Err(invalid());
            };
            Ok(ColumnDef::new(name, kind, trimmed))
        }
    }
}

/// Coerce a raw string into the column's logical type.
pub fn cast_value(column: &ColumnDef, raw: &str) -> Result<Value> {
    let invalid = |expected: &str| SyncError::value_not_valid(&column.name, raw, expected);
    let value = raw.trim();

    match column.kind {
        ColumnType::Text => Ok(Value::Text(raw.trim_end().to_string())),
        _ if value.is_empty() => Ok(Value::Null),
        ColumnType::Integer => value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        ColumnType::Float => value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("number")),
        ColumnType::Boolean => parse_bool(value).map(Value::Bool).ok_or_else(|| invalid("bool")),
        ColumnType::Date => parse_date(value).map(Value::Date).ok_or_else(|| invalid("date")),
        ColumnType::DateTime => parse_datetime(value)
            .map(Value::DateTime)
            .ok_or_else(|| invalid("datetime")),
    }
}

/// Cast a row of raw `(field, value)` pairs against the declared columns.
/// Every key must name a declared column.
pub fn cast_row(columns: &[ColumnDef], raw: &[(String, String)]) -> Result<Row> {
    let mut row = Row::new();
    for (field, value) in raw {
        let column =
            find_column(columns, field).ok_or_else(|| SyncError::FieldNotFound(field.clone()))?;
        row.insert(column.name.clone(), cast_value(column, value)?);
    }
    Ok(row)
}

/// Convert an already-typed value to the column's type, for writes across
/// engines whose column types differ.
pub fn conform_value(column: &ColumnDef, value: &Value) -> Result<Value> {
    match (column.kind, value) {
        (_, Value::Null) => Ok(Value::Null),
        (ColumnType::Text, Value::Text(_))
        | (ColumnType::Integer, Value::Integer(_))
        | (ColumnType::Float, Value::Float(_))
        | (ColumnType::Boolean, Value::Bool(_))
        | (ColumnType::Date, Value::Date(_))
        | (ColumnType::DateTime, Value::DateTime(_)) => Ok(value.clone()),
        (ColumnType::Float, Value::Integer(n)) => Ok(Value::Float(*n as f64)),
        (ColumnType::Date, Value::DateTime(dt)) => Ok(Value::Date(dt.date())),
        (ColumnType::DateTime, Value::Date(d)) => d
            .and_hms_opt(0, 0, 0)
            .map(Value::DateTime)
            .ok_or_else(|| SyncError::value_not_valid(&column.name, &d.to_string(), "datetime")),
        _ => cast_value(column, &value.to_string()),
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&value.replace('/', "-"), DATE_FORMAT).ok()
}

pub(crate) fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let normalized = value.replace('/', "-").replace('T', " ");
    NaiveDateTime::parse_from_str(&normalized, DATETIME_FORMAT)
        .ok()
        .or_else(|| parse_date(value).and_then(|d| d.and_hms_opt(0, 0, 0)))
}
