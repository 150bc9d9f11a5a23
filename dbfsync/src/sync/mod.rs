//! Sync passes: collect governed files, route them to origin/destiny groups,
//! reconcile each pair and apply the result.

use crate::catalog::{Catalog, SyncTable};
use crate::config::{ConfigFile, Engine};
use crate::error::{Result, SyncError};
use crate::reconcile::{reconcile, OperationGroup};
use crate::router::affected_groups;
use crate::storage::{adapter, ApplySummary};
use crate::value::Row;
use crate::watcher::{FileWatcher, PendingChanges};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

/// How long the sync loop waits for events before checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Continuous sync always treats DBF files as the origin.
pub const SYNC_PRIORITY: Engine = Engine::Dbf;

/// Shared flag asking a running sync loop to stop after the current pass.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a continuous sync ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Stopped,
}

/// Result of reconciling one origin/destiny pair.
#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub origin: String,
    pub destiny: String,
    pub operations: OperationGroup,
    /// Set once the group has been written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<ApplySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An origin that could not be read, so none of its destinies were touched.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedOrigin {
    pub origin: String,
    pub reason: String,
}

/// Everything one pass did or planned.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub pairs: Vec<PairReport>,
    pub skipped: Vec<SkippedOrigin>,
}

impl PassReport {
    /// Number of planned operations across every pair.
    pub fn operation_count(&self) -> usize {
        self.pairs.iter().map(|p| p.operations.len()).sum()
    }

    /// Pairs that failed plus skipped origins.
    pub fn failure_count(&self) -> usize {
        self.pairs.iter().filter(|p| p.error.is_some()).count() + self.skipped.len()
    }

    /// Row operations the destinies could not hold.
    pub fn rejected_count(&self) -> usize {
        self.pairs
            .iter()
            .filter_map(|p| p.applied.as_ref())
            .map(|a| a.rejected.len())
            .sum()
    }
}

/// Drives sync passes over a relation catalog.
pub struct Orchestrator {
    catalog: Catalog,
}

impl Orchestrator {
    pub fn new(catalog: Catalog) -> Self {
        Orchestrator { catalog }
    }

    /// Validate `config` and build an orchestrator over it.
    pub fn from_config(config: &ConfigFile) -> Result<Self> {
        Ok(Self::new(Catalog::from_config(config)?))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// File names in `priority`'s folders with one of its extensions that
    /// some relation governs. Sorted, without duplicates.
    pub fn collect(&self, priority: Engine) -> Result<Vec<String>> {
        let extensions = self.catalog.extensions_for(priority);
        let mut names = Vec::new();

        for folder in self.catalog.folders_for(priority) {
            let pattern = format!(
                "{}/*",
                glob::Pattern::escape(&folder.to_string_lossy())
            );
            let entries = glob::glob(&pattern)
                .map_err(|e| SyncError::Config(format!("bad folder '{}': {e}", folder.display())))?;

            for entry in entries {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        log::warn!("Cannot list {}: {e}", folder.display());
                        continue;
                    }
                };
                if !path.is_file() {
                    continue;
                }
                let ext = path
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()));
                if !ext.map(|e| extensions.contains(&e)).unwrap_or(false) {
                    continue;
                }
                if let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) {
                    if self.catalog.is_governed(&name) {
                        names.push(name);
                    }
                }
            }
        }

        names.sort();
        names.dedup();
        log::debug!("Collected {} {priority} file(s)", names.len());
        Ok(names)
    }

    /// Run one pass for `filenames` as origins and apply every group.
    pub fn migrate<S: AsRef<str>>(&self, filenames: &[S]) -> Result<PassReport> {
        self.run_pass(filenames, true)
    }

    /// Compute what [`migrate`](Self::migrate) would do, writing nothing.
    pub fn plan<S: AsRef<str>>(&self, filenames: &[S]) -> Result<PassReport> {
        self.run_pass(filenames, false)
    }

    /// Collect the priority family and run one pass over it.
    pub fn migrate_once(&self, priority: Engine, dry_run: bool) -> Result<PassReport> {
        let filenames = self.collect(priority)?;
        self.run_pass(&filenames, !dry_run)
    }

    /// Migrate once with DBF priority, then re-run a pass for every batch of
    /// changed files until `shutdown` is triggered. A failing pass is logged
    /// and the loop keeps going.
    pub fn sync(&self, shutdown: &ShutdownSignal) -> Result<SyncOutcome> {
        let report = self.migrate_once(SYNC_PRIORITY, false)?;
        log_pass(&report);

        let watcher = FileWatcher::start(
            self.catalog.folders_for(SYNC_PRIORITY),
            self.catalog.extensions_for(SYNC_PRIORITY),
        )?;
        let mut pending = PendingChanges::default();
        log::info!("Watching for changes");

        loop {
            if shutdown.is_triggered() {
                log::info!("Sync stopped");
                return Ok(SyncOutcome::Stopped);
            }

            match watcher.event_rx.recv_timeout(POLL_INTERVAL) {
                Ok(event) => {
                    pending.push(&event);
                    while let Ok(event) = watcher.event_rx.try_recv() {
                        pending.push(&event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SyncError::Storage("file watcher stopped".into()));
                }
            }

            if pending.is_empty() || shutdown.is_triggered() {
                continue;
            }

            let changed: Vec<String> = pending
                .drain()
                .into_iter()
                .filter(|name| self.catalog.is_governed(name))
                .collect();
            if changed.is_empty() {
                continue;
            }

            log::info!("Changed: {}", changed.join(", "));
            match self.migrate(&changed) {
                Ok(report) => log_pass(&report),
                Err(e) => log::error!("Sync pass failed: {e}"),
            }
        }
    }

    fn run_pass<S: AsRef<str>>(&self, filenames: &[S], apply: bool) -> Result<PassReport> {
        let mut report = PassReport::default();

        for group in affected_groups(filenames, &self.catalog)? {
            let origin = match read_table(&group.origin) {
                Ok(rows) => group.origin.with_rows(rows),
                Err(e) => {
                    log::warn!("Skipping {}: {e}", group.origin.label());
                    report.skipped.push(SkippedOrigin {
                        origin: group.origin.label(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            for (origin_fields, destiny) in group.pairs() {
                report
                    .pairs
                    .push(sync_pair(&origin, origin_fields, destiny, apply));
            }
        }

        Ok(report)
    }
}

/// Reconcile one destiny against an origin already read, applying the
/// resulting group when `apply` is set.
fn sync_pair(origin: &SyncTable, origin_fields: &[String], destiny: &SyncTable, apply: bool) -> PairReport {
    let mut report = PairReport {
        origin: origin.label(),
        destiny: destiny.label(),
        operations: OperationGroup::default(),
        applied: None,
        error: None,
    };

    let destiny = match read_table(destiny) {
        Ok(rows) => destiny.with_rows(rows),
        Err(e) => {
            log::warn!("Cannot read {}: {e}", report.destiny);
            report.error = Some(e.to_string());
            return report;
        }
    };

    report.operations = reconcile(origin, origin_fields, &destiny);
    if report.operations.is_empty() {
        log::debug!("{} -> {}: in sync", report.origin, report.destiny);
        return report;
    }

    for op in report.operations.operations() {
        log::debug!("{}: {}", report.destiny, op.describe());
    }
    if !apply {
        return report;
    }

    match adapter(destiny.engine).apply(&destiny.path, &destiny.table, &report.operations) {
        Ok(summary) => {
            log::info!(
                "{} -> {}: {} inserted, {} updated, {} deleted, {} rejected",
                report.origin,
                report.destiny,
                summary.inserted,
                summary.updated,
                summary.deleted,
                summary.rejected.len()
            );
            report.applied = Some(summary);
        }
        Err(e) => {
            log::warn!("Cannot apply to {}: {e}", report.destiny);
            report.error = Some(e.to_string());
        }
    }
    report
}

fn read_table(table: &SyncTable) -> Result<Vec<Row>> {
    adapter(table.engine).read_rows(&table.path, &table.table, None)
}

fn log_pass(report: &PassReport) {
    if report.failure_count() > 0 || report.rejected_count() > 0 {
        log::warn!(
            "Pass finished with {} failure(s), {} rejected row(s), {} operation(s)",
            report.failure_count(),
            report.rejected_count(),
            report.operation_count()
        );
    } else {
        log::info!("Pass finished, {} operation(s)", report.operation_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config_str;
    use crate::storage::{DbfStorage, SqlStorage, Storage};
    use crate::value::{parse_column_type, Value};
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::TempDir;

    fn orchestrator(dir: &Path, relations: &str) -> Orchestrator {
        let yaml = format!(
            r#"
folderpaths:
  DBF: ["{dir}"]
  SQL: ["{dir}"]
extensions:
  DBF: [".dbf"]
  SQL: [".sql"]
relations:
{relations}
"#,
            dir = dir.display()
        );
        Orchestrator::from_config(&parse_config_str(&yaml).unwrap()).unwrap()
    }

    fn sql_table(path: &Path, table: &str, fields: &[&str]) {
        let columns: Vec<_> = fields
            .iter()
            .map(|f| {
                let tag = if *f == "id" || f.ends_with("_id") { "INTEGER" } else { "TEXT" };
                parse_column_type(Engine::Sql, f, tag).unwrap()
            })
            .collect();
        SqlStorage.create_table(path, table, &columns).unwrap();
    }

    fn row(cells: &[(&str, Value)]) -> Row {
        cells.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn person(id: i64, name: &str) -> Row {
        row(&[("id", Value::Integer(id)), ("name", Value::Text(name.into()))])
    }

    const SQL_PAIR: &str = r#"
  - sources: ["a.sql", "b.sql"]
    tables: ["people", "users"]
    fields: [["id", "name"], ["user_id", "full_name"]]
"#;

    #[test]
    fn test_collect_governed_files_only() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(tmp.path(), SQL_PAIR);
        for name in ["a.sql", "b.sql", "stray.sql", "notes.txt"] {
            std::fs::write(tmp.path().join(name), "").unwrap();
        }

        assert_eq!(orch.collect(Engine::Sql).unwrap(), vec!["a.sql", "b.sql"]);
        assert!(orch.collect(Engine::Dbf).unwrap().is_empty());
    }

    #[test]
    fn test_migrate_copies_and_converges() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(tmp.path(), SQL_PAIR);
        let a = tmp.path().join("a.sql");
        let b = tmp.path().join("b.sql");
        sql_table(&a, "people", &["id", "name"]);
        sql_table(&b, "users", &["user_id", "full_name"]);
        SqlStorage.insert_row(&a, "people", &person(1, "Alice")).unwrap();
        SqlStorage.insert_row(&a, "people", &person(2, "Bob")).unwrap();

        let report = orch.migrate(&["a.sql"]).unwrap();
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].origin, "a.sql:people");
        assert_eq!(report.pairs[0].destiny, "b.sql:users");
        assert_eq!(
            report.pairs[0].applied,
            Some(ApplySummary { inserted: 2, updated: 0, deleted: 0, rejected: vec![] })
        );

        let rows = SqlStorage.read_rows(&b, "users", None).unwrap();
        assert_eq!(
            rows,
            vec![
                row(&[("user_id", Value::Integer(1)), ("full_name", Value::Text("Alice".into()))]),
                row(&[("user_id", Value::Integer(2)), ("full_name", Value::Text("Bob".into()))]),
            ]
        );

        let again = orch.migrate(&["a.sql"]).unwrap();
        assert_eq!(again.operation_count(), 0);
    }

    #[test]
    fn test_rows_the_destiny_cannot_hold_are_rejected_alone() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(
            tmp.path(),
            r#"
  - sources: ["a.sql", "b.sql"]
    tables: ["amounts", "amounts"]
    fields: [["amount"], ["amount_id"]]
"#,
        );
        let a = tmp.path().join("a.sql");
        let b = tmp.path().join("b.sql");
        let real = vec![parse_column_type(Engine::Sql, "amount", "REAL").unwrap()];
        SqlStorage.create_table(&a, "amounts", &real).unwrap();
        sql_table(&b, "amounts", &["amount_id"]);
        for amount in [1.0, 2.5, 3.0] {
            let cells = row(&[("amount", Value::Float(amount))]);
            SqlStorage.insert_row(&a, "amounts", &cells).unwrap();
        }

        let report = orch.migrate(&["a.sql"]).unwrap();
        assert_eq!(report.failure_count(), 0);
        assert_eq!(report.rejected_count(), 1);
        let applied = report.pairs[0].applied.as_ref().unwrap();
        assert_eq!(applied.inserted, 2);
        assert!(applied.rejected[0].reason.contains("2.5"));

        let stored: Vec<Value> = SqlStorage
            .read_rows(&b, "amounts", None)
            .unwrap()
            .into_iter()
            .map(|r| r["amount_id"].clone())
            .collect();
        assert_eq!(stored, vec![Value::Integer(1), Value::Integer(3)]);

        // Only the row that cannot be stored is planned again
        let again = orch.plan(&["a.sql"]).unwrap();
        assert_eq!(again.operation_count(), 1);
        assert_eq!(again.pairs[0].operations.insert.len(), 1);
    }

    #[test]
    fn test_plan_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(tmp.path(), SQL_PAIR);
        let a = tmp.path().join("a.sql");
        let b = tmp.path().join("b.sql");
        sql_table(&a, "people", &["id", "name"]);
        sql_table(&b, "users", &["user_id", "full_name"]);
        SqlStorage.insert_row(&a, "people", &person(1, "Alice")).unwrap();

        let report = orch.migrate_once(Engine::Sql, true).unwrap();
        // a.sql feeds b.sql and b.sql (empty) feeds a.sql
        assert_eq!(report.pairs.len(), 2);
        assert!(report.pairs.iter().all(|p| p.applied.is_none()));
        assert!(SqlStorage.read_rows(&b, "users", None).unwrap().is_empty());
        assert_eq!(SqlStorage.read_rows(&a, "people", None).unwrap().len(), 1);
    }

    #[test]
    fn test_unreadable_origin_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(tmp.path(), SQL_PAIR);
        sql_table(&tmp.path().join("b.sql"), "users", &["user_id", "full_name"]);

        let report = orch.migrate(&["a.sql"]).unwrap();
        assert!(report.pairs.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].origin, "a.sql:people");
        assert_eq!(report.failure_count(), 1);
    }

    #[test]
    fn test_failing_destiny_does_not_stop_others() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(
            tmp.path(),
            r#"
  - sources: ["a.sql", "missing.sql", "c.sql"]
    tables: ["people", "people", "people"]
    fields: [["id", "name"], ["id", "name"], ["id", "name"]]
"#,
        );
        let a = tmp.path().join("a.sql");
        let c = tmp.path().join("c.sql");
        sql_table(&a, "people", &["id", "name"]);
        sql_table(&c, "people", &["id", "name"]);
        SqlStorage.insert_row(&a, "people", &person(7, "Gus")).unwrap();

        let report = orch.migrate(&["a.sql"]).unwrap();
        assert_eq!(report.pairs.len(), 2);
        assert!(report.pairs[0].error.is_some());
        assert!(report.pairs[1].error.is_none());
        assert_eq!(SqlStorage.read_rows(&c, "people", None).unwrap(), vec![person(7, "Gus")]);
    }

    #[test]
    fn test_sync_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(tmp.path(), SQL_PAIR);
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        assert_eq!(orch.sync(&shutdown).unwrap(), SyncOutcome::Stopped);
    }

    #[test]
    fn test_sync_propagates_dbf_changes() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(
            tmp.path(),
            r#"
  - sources: ["people.dbf", "people.sql"]
    tables: ["", "people"]
    fields: [["id", "name"], ["id", "name"]]
"#,
        );
        let dbf = tmp.path().join("people.dbf");
        let sql = tmp.path().join("people.sql");
        let columns = vec![
            parse_column_type(Engine::Dbf, "id", "N(8)").unwrap(),
            parse_column_type(Engine::Dbf, "name", "C(20)").unwrap(),
        ];
        DbfStorage.create_table(&dbf, "", &columns).unwrap();
        sql_table(&sql, "people", &["id", "name"]);

        let shutdown = ShutdownSignal::new();
        let handle = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || orch.sync(&shutdown))
        };

        std::thread::sleep(Duration::from_millis(500));
        DbfStorage.insert_row(&dbf, "", &person(1, "Alice")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut rows = Vec::new();
        while rows.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
            rows = SqlStorage.read_rows(&sql, "people", None).unwrap();
        }

        shutdown.trigger();
        let outcome = handle.join().unwrap().unwrap();
        assert_eq!(outcome, SyncOutcome::Stopped);
        assert_eq!(rows, vec![person(1, "Alice")]);
    }
}
