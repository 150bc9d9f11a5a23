use super::{check_indexes, conform_row, ensure_exists, ApplySummary, Storage};
use crate::condition::{filter_indexes, Condition};
use crate::error::{Result, SyncError};
use crate::reconcile::{Operation, OperationGroup};
use crate::value::{conform_value, find_column, ColumnDef, ColumnType, Row, Value};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use dbase::{FieldName, FieldType, FieldValue, Reader, Record, TableWriterBuilder};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const MAX_CHARACTER_LENGTH: u8 = 254;
const MAX_YEAR: i32 = 9999;

/// Size of the file header and of each field descriptor after it.
const HEADER_SIZE: usize = 32;
const DESCRIPTOR_SIZE: usize = 32;
/// Offset of the decimal count inside a field descriptor.
const DECIMALS_OFFSET: usize = 17;

/// DBF files, where each file holds exactly one table.
pub struct DbfStorage;

/// One physical field of a loaded file.
struct DbfField {
    /// Name as stored in the file header
    name: String,
    field_type: FieldType,
    length: u8,
    decimals: u8,
    column: ColumnDef,
}

/// A whole DBF file in memory. Records keep their stored cells, so columns
/// that are not written keep their original encoding.
struct DbfTable {
    reader: Reader<BufReader<File>>,
    fields: Vec<DbfField>,
    records: Vec<Record>,
}

impl DbfTable {
    fn load(path: &Path) -> Result<Self> {
        ensure_exists(path)?;
        let mut reader = Reader::from_path(path).map_err(|e| dbf_error(path, e))?;
        let records = reader.read().map_err(|e| dbf_error(path, e))?;
        let decimals = decimal_places(path, reader.fields().len())?;

        let fields = reader
            .fields()
            .iter()
            .zip(decimals)
            .map(|(info, decimals)| {
                let name = info.name().to_string();
                let field_type = info.field_type();
                let length = info.length();
                let kind = column_type(field_type, decimals);
                let mut column = ColumnDef::new(&name, kind, &field_tag(field_type, length, decimals));
                column.length = Some(length);
                if decimals > 0 {
                    column.decimals = Some(decimals);
                }
                DbfField {
                    name,
                    field_type,
                    length,
                    decimals,
                    column,
                }
            })
            .collect();

        Ok(DbfTable {
            reader,
            fields,
            records,
        })
    }

    fn columns(&self) -> Vec<ColumnDef> {
        self.fields.iter().map(|f| f.column.clone()).collect()
    }

    fn rows(&self) -> Vec<Row> {
        self.records
            .iter()
            .map(|record| {
                self.fields
                    .iter()
                    .map(|f| {
                        let value = record.get(&f.name).map(from_field_value).unwrap_or(Value::Null);
                        (f.column.name.clone(), value)
                    })
                    .collect()
            })
            .collect()
    }

    /// Overwrite the cells of `row` on the record at `index`. Nothing is
    /// written unless every cell can be encoded.
    fn write_cells(&mut self, index: usize, row: &Row) -> Result<()> {
        let columns = self.columns();
        let mut encoded = Vec::with_capacity(row.len());
        for (column, value) in conform_row(&columns, row)? {
            let field = self.field(&column.name)?;
            encoded.push((field.name.clone(), to_field_value(field, &value)?));
        }
        for (name, cell) in encoded {
            self.records[index].insert(name, cell);
        }
        Ok(())
    }

    /// A record with every field set from `row`, empty where `row` has no value.
    fn new_record(&self, row: &Row) -> Result<Record> {
        let columns = self.columns();
        if let Some(unknown) = row.keys().find(|k| find_column(&columns, k).is_none()) {
            return Err(SyncError::FieldNotFound(unknown.clone()));
        }

        let mut record = Record::default();
        for field in &self.fields {
            let value = row
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&field.column.name))
                .map(|(_, v)| conform_value(&field.column, v))
                .transpose()?
                .unwrap_or(Value::Null);
            record.insert(field.name.clone(), to_field_value(field, &value)?);
        }
        Ok(record)
    }

    fn field(&self, column: &str) -> Result<&DbfField> {
        self.fields
            .iter()
            .find(|f| f.column.name.eq_ignore_ascii_case(column))
            .ok_or_else(|| SyncError::FieldNotFound(column.to_string()))
    }

    /// Rewrite the file through a temporary file in the same directory.
    fn save(self, path: &Path) -> Result<()> {
        if let Some(memo) = self.fields.iter().find(|f| f.field_type == FieldType::Memo) {
            return Err(SyncError::Storage(format!(
                "{}: memo field '{}' cannot be rewritten",
                path.display(),
                memo.column.name
            )));
        }

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;

        let mut writer = TableWriterBuilder::from_reader(self.reader)
            .build_with_file_dest(tmp.path())
            .map_err(|e| dbf_error(path, e))?;
        for record in &self.records {
            writer.write_record(record).map_err(|e| dbf_error(path, e))?;
        }
        writer.close().map_err(|e| dbf_error(path, e))?;
        drop(writer);

        tmp.persist(path).map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }
}

impl Storage for DbfStorage {
    fn create_table(&self, path: &Path, _table: &str, columns: &[ColumnDef]) -> Result<()> {
        if path.exists() {
            return Err(SyncError::Storage(format!("{} already exists", path.display())));
        }
        if columns.is_empty() {
            return Err(SyncError::Storage(format!(
                "{} needs at least one field",
                path.display()
            )));
        }

        let mut builder = TableWriterBuilder::new();
        for column in columns {
            let name = FieldName::try_from(column.name.as_str()).map_err(|e| {
                SyncError::Storage(format!("invalid DBF field name '{}': {e}", column.name))
            })?;
            let letter = column.tag.trim_start().chars().next().map(|c| c.to_ascii_uppercase());
            builder = match (column.kind, letter) {
                (ColumnType::Text, Some('M')) => {
                    return Err(SyncError::Storage(format!(
                        "field '{}': memo fields cannot be created",
                        column.name
                    )))
                }
                (ColumnType::Text, _) => builder.add_character_field(
                    name,
                    column.length.unwrap_or(MAX_CHARACTER_LENGTH).min(MAX_CHARACTER_LENGTH),
                ),
                (ColumnType::Integer, Some('I')) => builder.add_integer_field(name),
                (ColumnType::Integer, _) => builder.add_numeric_field(name, column.length.unwrap_or(11), 0),
                (ColumnType::Float, Some('F')) => builder.add_float_field(
                    name,
                    column.length.unwrap_or(20),
                    column.decimals.unwrap_or(5),
                ),
                (ColumnType::Float, Some('O')) => builder.add_double_field(name),
                (ColumnType::Float, Some('Y')) => builder.add_currency_field(name),
                (ColumnType::Float, _) => builder.add_numeric_field(
                    name,
                    column.length.unwrap_or(18),
                    column.decimals.unwrap_or(5),
                ),
                (ColumnType::Boolean, _) => builder.add_logical_field(name),
                (ColumnType::Date, _) => builder.add_date_field(name),
                (ColumnType::DateTime, _) => builder.add_datetime_field(name),
            };
        }

        let mut writer = builder
            .build_with_file_dest(path)
            .map_err(|e| dbf_error(path, e))?;
        writer.close().map_err(|e| dbf_error(path, e))?;
        log::debug!("Created {}", path.display());
        Ok(())
    }

    fn columns(&self, path: &Path, _table: &str) -> Result<Vec<ColumnDef>> {
        Ok(DbfTable::load(path)?.columns())
    }

    fn insert_row(&self, path: &Path, _table: &str, row: &Row) -> Result<()> {
        let mut table = DbfTable::load(path)?;
        let record = table.new_record(row)?;
        table.records.push(record);
        table.save(path)
    }

    fn read_rows(&self, path: &Path, _table: &str, condition: Option<&Condition>) -> Result<Vec<Row>> {
        let rows = DbfTable::load(path)?.rows();
        let keep = filter_indexes(&rows, condition)?;
        Ok(rows
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.binary_search(i).is_ok())
            .map(|(_, row)| row)
            .collect())
    }

    fn update_rows(&self, path: &Path, _table: &str, row: &Row, condition: &Condition) -> Result<usize> {
        let mut table = DbfTable::load(path)?;
        let matched = filter_indexes(&table.rows(), Some(condition))?;
        for &index in &matched {
            table.write_cells(index, row)?;
        }
        if !matched.is_empty() {
            table.save(path)?;
        }
        Ok(matched.len())
    }

    fn delete_rows(&self, path: &Path, _table: &str, condition: &Condition) -> Result<usize> {
        let mut table = DbfTable::load(path)?;
        let matched = filter_indexes(&table.rows(), Some(condition))?;
        if matched.is_empty() {
            return Ok(0);
        }
        table.records = std::mem::take(&mut table.records)
            .into_iter()
            .enumerate()
            .filter(|(i, _)| matched.binary_search(i).is_err())
            .map(|(_, record)| record)
            .collect();
        table.save(path)?;
        Ok(matched.len())
    }

    fn drop_table(&self, path: &Path, _table: &str) -> Result<()> {
        ensure_exists(path)?;
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn apply(&self, path: &Path, _table: &str, group: &OperationGroup) -> Result<ApplySummary> {
        let mut table = DbfTable::load(path)?;
        let label = path.display().to_string();
        let deleted = check_indexes(group, table.records.len(), &label)?;
        let mut summary = ApplySummary {
            deleted: deleted.len(),
            ..Default::default()
        };

        for op in &group.update {
            match table.write_cells(op.index, &op.fields) {
                Ok(()) => summary.updated += 1,
                Err(e) => summary.reject(&label, Operation::Update(op).describe(), e)?,
            }
        }
        let mut inserted = Vec::with_capacity(group.insert.len());
        for op in &group.insert {
            match table.new_record(&op.fields) {
                Ok(record) => inserted.push(record),
                Err(e) => summary.reject(&label, Operation::Insert(op).describe(), e)?,
            }
        }
        summary.inserted = inserted.len();

        table.records = std::mem::take(&mut table.records)
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !deleted.contains(i))
            .map(|(_, record)| record)
            .chain(inserted)
            .collect();
        table.save(path)?;

        Ok(summary)
    }
}

fn dbf_error<E: std::fmt::Display>(path: &Path, e: E) -> SyncError {
    SyncError::Storage(format!("{}: {e}", path.display()))
}

/// Decimal places of the first `count` fields. The reader keeps these
/// private, so they come straight from the field descriptors.
fn decimal_places(path: &Path, count: usize) -> Result<Vec<u8>> {
    let mut header = vec![0u8; HEADER_SIZE + DESCRIPTOR_SIZE * count];
    File::open(path)?.read_exact(&mut header)?;
    Ok((0..count)
        .map(|i| header[HEADER_SIZE + DESCRIPTOR_SIZE * i + DECIMALS_OFFSET])
        .collect())
}

fn column_type(field_type: FieldType, decimals: u8) -> ColumnType {
    match field_type {
        FieldType::Numeric if decimals == 0 => ColumnType::Integer,
        FieldType::Numeric | FieldType::Float | FieldType::Double | FieldType::Currency => {
            ColumnType::Float
        }
        FieldType::Integer => ColumnType::Integer,
        FieldType::Logical => ColumnType::Boolean,
        FieldType::Date => ColumnType::Date,
        FieldType::DateTime => ColumnType::DateTime,
        FieldType::Character | FieldType::Memo => ColumnType::Text,
    }
}

fn type_letter(field_type: FieldType) -> char {
    match field_type {
        FieldType::Character => 'C',
        FieldType::Numeric => 'N',
        FieldType::Float => 'F',
        FieldType::Double => 'O',
        FieldType::Currency => 'Y',
        FieldType::Integer => 'I',
        FieldType::Logical => 'L',
        FieldType::Date => 'D',
        FieldType::DateTime => 'T',
        FieldType::Memo => 'M',
    }
}

/// Declared type as written in a create command, e.g. `C(30)` or `N(10,2)`.
fn field_tag(field_type: FieldType, length: u8, decimals: u8) -> String {
    let letter = type_letter(field_type);
    match field_type {
        FieldType::Character => format!("{letter}({length})"),
        FieldType::Numeric | FieldType::Float => format!("{letter}({length},{decimals})"),
        _ => letter.to_string(),
    }
}

/// Decode a stored cell. Character padding is stripped and blank strings
/// read as null; integral numerics read as integers.
fn from_field_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Character(Some(s)) | FieldValue::Memo(s) => {
            let trimmed = s.trim_end();
            if trimmed.is_empty() {
                Value::Null
            } else {
                Value::Text(trimmed.to_string())
            }
        }
        FieldValue::Numeric(Some(n)) => number(*n),
        // f32 cells go through their shortest decimal form so 2.1 stays 2.1
        FieldValue::Float(Some(f)) => f.to_string().parse().map(number).unwrap_or(Value::Null),
        FieldValue::Double(d) | FieldValue::Currency(d) => number(*d),
        FieldValue::Integer(i) => Value::Integer(i64::from(*i)),
        FieldValue::Logical(Some(b)) => Value::Bool(*b),
        FieldValue::Date(Some(d)) => from_dbase_date(d).map(Value::Date).unwrap_or(Value::Null),
        FieldValue::DateTime(dt) => {
            let time = dt.time();
            from_dbase_date(&dt.date())
                .zip(NaiveTime::from_hms_opt(time.hours(), time.minutes(), time.seconds()))
                .map(|(date, time)| Value::DateTime(NaiveDateTime::new(date, time)))
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn from_dbase_date(d: &dbase::Date) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(i32::try_from(d.year()).ok()?, d.month(), d.day())
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        Value::Integer(n as i64)
    } else {
        Value::Float(n)
    }
}

/// Encode a value, already conformed to the field's column type. Values the
/// field cannot hold exactly are refused rather than cropped or rounded.
fn to_field_value(field: &DbfField, value: &Value) -> Result<FieldValue> {
    let as_f64 = |v: &Value| match v {
        Value::Integer(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    };
    let mismatch = || SyncError::value_not_valid(&field.column.name, &value.to_string(), &field.column.tag);
    let not_null = || {
        SyncError::value_not_valid(
            &field.column.name,
            "null",
            &format!("{} without nulls", field.column.tag),
        )
    };

    let encoded = match (field.field_type, value) {
        (FieldType::Character, Value::Null) => FieldValue::Character(None),
        (FieldType::Character, v) => {
            let text = v.to_string();
            if text.len() > usize::from(field.length) {
                return Err(mismatch());
            }
            FieldValue::Character(Some(text))
        }
        (FieldType::Numeric, Value::Null) => FieldValue::Numeric(None),
        (FieldType::Numeric, v) => {
            let n = as_f64(v).ok_or_else(mismatch)?;
            let text = format!("{n:.prec$}", prec = usize::from(field.decimals));
            if !fits(field, &text) || text.parse::<f64>().ok() != Some(n) {
                return Err(mismatch());
            }
            FieldValue::Numeric(Some(n))
        }
        (FieldType::Float, Value::Null) => FieldValue::Float(None),
        (FieldType::Float, v) => {
            let n = as_f64(v).ok_or_else(mismatch)?;
            let single = n as f32;
            let text = format!("{single:.prec$}", prec = usize::from(field.decimals));
            let stored = text
                .parse::<f32>()
                .ok()
                .and_then(|f| f.to_string().parse::<f64>().ok());
            if !fits(field, &text) || stored != Some(n) {
                return Err(mismatch());
            }
            FieldValue::Float(Some(single))
        }
        (FieldType::Double | FieldType::Currency | FieldType::Integer | FieldType::DateTime, Value::Null) => {
            return Err(not_null())
        }
        (FieldType::Double, v) => FieldValue::Double(as_f64(v).ok_or_else(mismatch)?),
        (FieldType::Currency, v) => FieldValue::Currency(as_f64(v).ok_or_else(mismatch)?),
        (FieldType::Integer, Value::Integer(n)) => {
            FieldValue::Integer(i32::try_from(*n).map_err(|_| mismatch())?)
        }
        (FieldType::Logical, Value::Null) => FieldValue::Logical(None),
        (FieldType::Logical, Value::Bool(b)) => FieldValue::Logical(Some(*b)),
        (FieldType::Date, Value::Null) => FieldValue::Date(None),
        (FieldType::Date, Value::Date(d)) => FieldValue::Date(Some(to_dbase_date(d).ok_or_else(mismatch)?)),
        (FieldType::DateTime, Value::DateTime(dt)) => {
            let date = to_dbase_date(&dt.date()).ok_or_else(mismatch)?;
            // Stored with whole-second precision
            if dt.nanosecond() != 0 {
                return Err(mismatch());
            }
            let time = dbase::Time::new(dt.hour(), dt.minute(), dt.second());
            FieldValue::DateTime(dbase::DateTime::new(date, time))
        }
        _ => return Err(mismatch()),
    };
    Ok(encoded)
}

/// Whether a formatted number fits the field width.
fn fits(field: &DbfField, text: &str) -> bool {
    text.len() <= usize::from(field.length)
}

/// Years outside 0..=9999 have no DBF date encoding.
fn to_dbase_date(d: &NaiveDate) -> Option<dbase::Date> {
    if d.year() > MAX_YEAR {
        return None;
    }
    let year = u32::try_from(d.year()).ok()?;
    Some(dbase::Date::new(d.day(), d.month(), year))
}
