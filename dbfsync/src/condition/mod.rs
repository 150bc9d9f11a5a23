//! Row filtering for `read`, `update` and `delete`.
//!
//! A condition is `field operator value`. Operators are a closed set and the
//! comparison is dispatched on [`Operator`]; nothing is ever evaluated as an
//! expression string.

use crate::error::{Result, SyncError};
use crate::value::cast::{parse_bool, parse_date, parse_datetime};
use crate::value::{Row, Value};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Synthetic field selecting rows by 1-based position.
pub const ROW_NUMBER: &str = "row_number";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }

    /// Apply the operator to an ordering. Incomparable values only satisfy `!=`.
    fn holds(&self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (Operator::Ne, None) => true,
            (_, None) => false,
            (Operator::Eq, Some(o)) => o == Ordering::Equal,
            (Operator::Ne, Some(o)) => o != Ordering::Equal,
            (Operator::Lt, Some(o)) => o == Ordering::Less,
            (Operator::Le, Some(o)) => o != Ordering::Greater,
            (Operator::Gt, Some(o)) => o == Ordering::Greater,
            (Operator::Ge, Some(o)) => o != Ordering::Less,
        }
    }
}

impl FromStr for Operator {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "==" | "=" => Ok(Operator::Eq),
            "!=" => Ok(Operator::Ne),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            other => Err(SyncError::UnsupportedOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `field operator value` filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: String,
}

impl Condition {
    /// Build a condition, rejecting unknown operators up front.
    pub fn parse(field: &str, operator: &str, value: &str) -> Result<Self> {
        Ok(Condition {
            field: field.trim().to_lowercase(),
            operator: operator.parse()?,
            value: value.to_string(),
        })
    }

    /// Whether the row at 0-based `index` satisfies the condition.
    pub fn matches(&self, row: &Row, index: usize) -> Result<bool> {
        evaluate_condition(row, index, self)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// Evaluate `condition` against the row at 0-based `index`.
pub fn evaluate_condition(row: &Row, index: usize, condition: &Condition) -> Result<bool> {
    let op = condition.operator;

    if condition.field == ROW_NUMBER {
        let wanted: i64 = condition.value.trim().parse().map_err(|_| {
            SyncError::value_not_valid(ROW_NUMBER, &condition.value, "int")
        })?;
        let position = index as i64 + 1;
        return Ok(op.holds(position.partial_cmp(&wanted)));
    }

    let cell = row
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(&condition.field))
        .map(|(_, value)| value)
        .ok_or_else(|| SyncError::FieldNotFound(condition.field.clone()))?;

    let target = coerce_like(cell, &condition.field, &condition.value)?;
    Ok(op.holds(cell.partial_cmp(&target)))
}

/// Indexes of the rows matching `condition`, or every index when there is none.
pub fn filter_indexes(rows: &[Row], condition: Option<&Condition>) -> Result<Vec<usize>> {
    let mut indexes = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        match condition {
            Some(c) if !c.matches(row, index)? => {}
            _ => indexes.push(index),
        }
    }
    Ok(indexes)
}

/// Interpret the raw comparison value with the same type as `cell`.
fn coerce_like(cell: &Value, field: &str, raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    let invalid = |expected: &str| SyncError::value_not_valid(field, raw, expected);

    match cell {
        Value::Text(_) => Ok(Value::Text(raw.to_string())),
        Value::Null if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") => {
            Ok(Value::Null)
        }
        Value::Null => Ok(Value::Text(raw.to_string())),
        Value::Bool(_) => parse_bool(trimmed).map(Value::Bool).ok_or_else(|| invalid("bool")),
        Value::Integer(_) | Value::Float(_) => match trimmed.parse::<i64>() {
            Ok(n) => Ok(Value::Integer(n)),
            Err(_) => trimmed
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| invalid("number")),
        },
        Value::Date(_) => parse_date(trimmed).map(Value::Date).ok_or_else(|| invalid("date")),
        Value::DateTime(_) => parse_datetime(trimmed)
            .map(Value::DateTime)
            .ok_or_else(|| invalid("datetime")),
    }
}
