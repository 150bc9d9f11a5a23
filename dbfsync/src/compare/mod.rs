use crate::value::{Row, Value};

static NULL: Value = Value::Null;

/// Values of `row` in the order of `fields`. Missing cells project to null.
pub fn project<'a>(row: &'a Row, fields: &'a [String]) -> impl Iterator<Item = &'a Value> + 'a {
    fields.iter().map(move |f| row.get(f).unwrap_or(&NULL))
}

/// Whether two rows hold the same values, position by position, along their
/// aligned field lists. Column names may differ between the sides.
pub fn same_row(
    origin_row: &Row,
    destiny_row: &Row,
    origin_fields: &[String],
    destiny_fields: &[String],
) -> bool {
    origin_fields.len() == destiny_fields.len()
        && project(origin_row, origin_fields).eq(project(destiny_row, destiny_fields))
}

/// Keep only `origin_fields` of `row` and rename them positionally to
/// `destiny_fields`.
pub fn remap_row(row: &Row, origin_fields: &[String], destiny_fields: &[String]) -> Row {
    origin_fields
        .iter()
        .zip(destiny_fields)
        .filter_map(|(from, to)| row.get(from).map(|v| (to.clone(), v.clone())))
        .collect()
}
