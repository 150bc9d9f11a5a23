//! Reconciliation of one origin table against its destinies.
//!
//! # Algorithm
//!
//! 1. Every destiny row starts in a pool, keyed by its index.
//! 2. Each origin row, in order, claims the first pooled destiny row that
//!    matches it along the relation's aligned columns. Claimed rows leave the
//!    pool; origin rows that claim nothing are residual.
//! 3. Residues pair up positionally: pairs become updates, leftover origin
//!    rows become inserts and leftover destiny rows become deletes.
//!
//! Indices in the resulting [`OperationGroup`] refer to the destiny rows as
//! they were read, so a group must be applied against that snapshot.

use crate::catalog::SyncTable;
use crate::compare::{remap_row, same_row};
use crate::value::Row;
use serde::Serialize;
use std::collections::BTreeSet;

/// A row that found no counterpart on the other side, with its original index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Residual {
    pub index: usize,
    pub fields: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insert {
    pub fields: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Update {
    pub index: usize,
    pub fields: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delete {
    pub index: usize,
}

/// A single change to a destiny table.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation<'a> {
    Insert(&'a Insert),
    Update(&'a Update),
    Delete(&'a Delete),
}

impl Operation<'_> {
    /// Human-readable description of this operation.
    pub fn describe(&self) -> String {
        match self {
            Operation::Insert(op) => format!("Insert row: {}", render_row(&op.fields)),
            Operation::Update(op) => format!(
                "Update row_number {} with: {}",
                op.index + 1,
                render_row(&op.fields)
            ),
            Operation::Delete(op) => format!("Delete row_number {}", op.index + 1),
        }
    }
}

/// The changes that bring one destiny in line with its origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationGroup {
    pub insert: Vec<Insert>,
    pub update: Vec<Update>,
    pub delete: Vec<Delete>,
}

impl OperationGroup {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.insert.len() + self.update.len() + self.delete.len()
    }

    /// All operations, inserts first.
    pub fn operations(&self) -> impl Iterator<Item = Operation<'_>> {
        self.insert
            .iter()
            .map(Operation::Insert)
            .chain(self.update.iter().map(Operation::Update))
            .chain(self.delete.iter().map(Operation::Delete))
    }
}

/// Match origin rows against destiny rows. Returns the unmatched origin rows
/// and the unclaimed destiny rows, both in original order.
pub fn compare_rows(
    origin_rows: &[Row],
    destiny_rows: &[Row],
    origin_fields: &[String],
    destiny_fields: &[String],
) -> (Vec<Residual>, Vec<Residual>) {
    let mut pool: BTreeSet<usize> = (0..destiny_rows.len()).collect();
    let mut residual_origin = Vec::new();

    for (index, origin_row) in origin_rows.iter().enumerate() {
        let claimed = pool.iter().copied().find(|&d| {
            same_row(origin_row, &destiny_rows[d], origin_fields, destiny_fields)
        });

        match claimed {
            Some(d) => {
                pool.remove(&d);
            }
            None => residual_origin.push(Residual {
                index,
                fields: origin_row.clone(),
            }),
        }
    }

    let residual_destiny = pool
        .into_iter()
        .map(|index| Residual {
            index,
            fields: destiny_rows[index].clone(),
        })
        .collect();

    (residual_origin, residual_destiny)
}

/// Turn residues into an operation group by pairing them positionally.
/// Origin residues must already be expressed in destiny column names.
pub fn classify_operations(origin: &[Residual], destiny: &[Residual]) -> OperationGroup {
    let paired = origin.len().min(destiny.len());

    OperationGroup {
        update: origin
            .iter()
            .zip(destiny)
            .map(|(o, d)| Update {
                index: d.index,
                fields: o.fields.clone(),
            })
            .collect(),
        insert: origin[paired..]
            .iter()
            .map(|o| Insert {
                fields: o.fields.clone(),
            })
            .collect(),
        delete: destiny[paired..]
            .iter()
            .map(|d| Delete { index: d.index })
            .collect(),
    }
}

/// Reconcile one origin/destiny pair. `origin_fields` are the origin columns
/// aligned with `destiny.fields` in this pair's relation.
pub fn reconcile(origin: &SyncTable, origin_fields: &[String], destiny: &SyncTable) -> OperationGroup {
    let (mut residual_origin, residual_destiny) =
        compare_rows(&origin.rows, &destiny.rows, origin_fields, &destiny.fields);

    for residual in &mut residual_origin {
        residual.fields = remap_row(&residual.fields, origin_fields, &destiny.fields);
    }

    classify_operations(&residual_origin, &residual_destiny)
}

/// Apply a group to an in-memory row snapshot, the way a storage adapter does.
/// Updates overwrite only the columns they carry.
pub fn apply_to_rows(rows: &[Row], group: &OperationGroup) -> Vec<Row> {
    let mut result: Vec<Option<Row>> = rows.iter().cloned().map(Some).collect();

    for op in &group.update {
        if let Some(Some(row)) = result.get_mut(op.index) {
            row.extend(op.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    for op in &group.delete {
        if let Some(slot) = result.get_mut(op.index) {
            *slot = None;
        }
    }

    result
        .into_iter()
        .flatten()
        .chain(group.insert.iter().map(|op| op.fields.clone()))
        .collect()
}

fn render_row(row: &Row) -> String {
    let cells: Vec<String> = row.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{{{}}}", cells.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Engine;
    use crate::value::Value;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn person(id: i64, name: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::Integer(id));
        row.insert("name".into(), Value::Text(name.into()));
        row
    }

    fn table(source: &str, columns: &[&str], rows: Vec<Row>) -> SyncTable {
        SyncTable {
            engine: Engine::Dbf,
            source: source.into(),
            path: PathBuf::from(source),
            table: String::new(),
            fields: fields(columns),
            rows,
        }
    }

    fn run(origin: Vec<Row>, destiny: Vec<Row>) -> OperationGroup {
        let o = table("a.dbf", &["id", "name"], origin);
        let d = table("b.dbf", &["id", "name"], destiny);
        reconcile(&o, &o.fields, &d)
    }

    #[test]
    fn test_update_and_insert_scenario() {
        let group = run(
            vec![person(1, "A"), person(2, "B"), person(3, "C")],
            vec![person(1, "A"), person(2, "X")],
        );
        assert_eq!(
            group,
            OperationGroup {
                update: vec![Update { index: 1, fields: person(2, "B") }],
                insert: vec![Insert { fields: person(3, "C") }],
                delete: vec![],
            }
        );
    }

    #[test]
    fn test_empty_origin_deletes_everything() {
        let group = run(vec![], vec![person(9, "Z")]);
        assert_eq!(
            group,
            OperationGroup {
                insert: vec![],
                update: vec![],
                delete: vec![Delete { index: 0 }],
            }
        );
    }

    #[test]
    fn test_empty_destiny_inserts_everything() {
        let group = run(vec![person(1, "A"), person(2, "B")], vec![]);
        assert_eq!(group.insert.len(), 2);
        assert!(group.update.is_empty() && group.delete.is_empty());
    }

    #[test]
    fn test_identical_tables_yield_nothing() {
        let rows = vec![person(1, "A"), person(2, "B"), person(2, "B")];
        assert!(run(rows.clone(), rows).is_empty());
    }

    #[test]
    fn test_reordered_identical_rows_yield_nothing() {
        let group = run(
            vec![person(1, "A"), person(2, "B"), person(3, "C")],
            vec![person(3, "C"), person(1, "A"), person(2, "B")],
        );
        assert!(group.is_empty());
    }

    #[test]
    fn test_duplicates_claim_earliest_destiny() {
        let (origin, destiny) = compare_rows(
            &[person(1, "A")],
            &[person(1, "A"), person(1, "A")],
            &fields(&["id", "name"]),
            &fields(&["id", "name"]),
        );
        assert!(origin.is_empty());
        assert_eq!(destiny.len(), 1);
        assert_eq!(destiny[0].index, 1);
    }

    #[test]
    fn test_residuals_keep_original_indexes() {
        let (origin, destiny) = compare_rows(
            &[person(1, "A"), person(5, "E"), person(2, "B")],
            &[person(7, "G"), person(2, "B"), person(8, "H")],
            &fields(&["id", "name"]),
            &fields(&["id", "name"]),
        );
        assert_eq!(origin.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(destiny.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_fields_renamed_to_destiny_columns() {
        let mut origin_row = person(4, "D");
        origin_row.insert("internal".into(), Value::Bool(true));
        let origin = table("a.dbf", &["id", "name"], vec![origin_row]);
        let destiny = table("b.sql", &["uid", "label"], vec![]);

        let group = reconcile(&origin, &origin.fields, &destiny);

        let mut expected = Row::new();
        expected.insert("uid".into(), Value::Integer(4));
        expected.insert("label".into(), Value::Text("D".into()));
        assert_eq!(group.insert, vec![Insert { fields: expected }]);
    }

    #[test]
    fn test_count_invariant() {
        let cases = vec![
            (vec![person(1, "A")], vec![person(2, "B"), person(3, "C"), person(4, "D")]),
            (vec![person(1, "A"), person(2, "B")], vec![person(2, "B")]),
            (vec![], vec![]),
            (vec![person(1, "A"); 4], vec![person(1, "A"), person(9, "Z")]),
        ];
        for (origin, destiny) in cases {
            let (o, d) = (origin.len() as i64, destiny.len() as i64);
            let group = run(origin, destiny);
            assert_eq!(group.insert.len() as i64 - group.delete.len() as i64, o - d);
        }
    }

    #[test]
    fn test_applying_group_converges() {
        let origin = vec![person(1, "A"), person(4, "D"), person(2, "B"), person(2, "B")];
        let destinies = vec![
            vec![],
            vec![person(9, "Z")],
            vec![person(2, "B"), person(3, "C"), person(1, "X"), person(5, "E"), person(6, "F")],
            vec![person(4, "D"), person(2, "B"), person(1, "A"), person(2, "B")],
        ];
        for destiny in destinies {
            let group = run(origin.clone(), destiny.clone());
            let applied = apply_to_rows(&destiny, &group);
            assert!(run(origin.clone(), applied.clone()).is_empty(), "{applied:?}");
            assert_eq!(applied.len(), origin.len());
        }
    }

    #[test]
    fn test_describe_operations() {
        let group = run(vec![person(1, "A")], vec![person(1, "B"), person(2, "C")]);
        let lines: Vec<String> = group.operations().map(|op| op.describe()).collect();
        assert_eq!(
            lines,
            vec![
                "Update row_number 1 with: {id=1, name=A}".to_string(),
                "Delete row_number 2".to_string(),
            ]
        );
    }
}
