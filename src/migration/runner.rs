//! Base migration runner: ordered registry, batched application, rollback,
//! and the `__migrations` tracking table.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{InterruptHandle, params};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::db::statement::StatementAdapter;
use crate::migration::{
    AppliedMigration, Direction, HealthReport, HealthStatus, Migration, MigrationError,
    RollbackResult, RunResult, ValidationReport, now_unix,
};

/// Progress callback: `(completed, total, current migration name)`.
pub type ProgressFn = Box<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Migrations are applied in fixed-size batches with a short pause between
/// batches so a large backlog does not saturate the database.
const DEFAULT_BATCH_SIZE: usize = 5;
const BATCH_PAUSE: Duration = Duration::from_millis(100);

const MIGRATIONS_TABLE: &str = "__migrations";

/// Applies registered migrations in order and tracks what has been applied.
///
/// The runner owns the [`Database`]; callers must not invoke `run`/`rollback`
/// concurrently on the same instance; the engine assumes a single logical
/// writer and provides no internal locking.
pub struct MigrationRunner {
    db: Database,
    registry: Vec<Migration>,
    batch_size: usize,
    progress: Option<ProgressFn>,
}

impl MigrationRunner {
    /// Creates a runner and ensures the tracking table exists.
    pub fn new(db: Database) -> Result<Self> {
        db.connection()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS __migrations (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
                )",
            )
            .context("Failed to create migrations tracking table")?;
        Ok(Self {
            db,
            registry: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            progress: None,
        })
    }

    /// Overrides the batch size (clamped to at least 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Installs a progress callback invoked before each migration runs.
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(usize, usize, &str) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Appends a migration to the registry.
    ///
    /// No uniqueness check happens here; call [`validate`](Self::validate)
    /// before running.
    pub fn register(&mut self, migration: Migration) {
        self.registry.push(migration);
    }

    /// Returns the registered migrations in registration order.
    pub fn migrations(&self) -> &[Migration] {
        &self.registry
    }

    /// Looks up a registered migration by id.
    pub fn migration(&self, id: &str) -> Option<&Migration> {
        self.registry.iter().find(|m| m.id() == id)
    }

    /// Checks the registry for duplicate ids and missing procedures.
    ///
    /// Reports every violation found, not just the first.
    pub fn validate(&self) -> ValidationReport {
        let mut issues = Vec::new();

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for m in &self.registry {
            *seen.entry(m.id()).or_insert(0) += 1;
        }
        // Preserve registration order when reporting duplicates.
        let mut reported: HashSet<&str> = HashSet::new();
        for m in &self.registry {
            if seen[m.id()] > 1 && reported.insert(m.id()) {
                issues.push(format!("Duplicate migration IDs: {}", m.id()));
            }
        }

        for m in &self.registry {
            if !m.has_up() {
                issues.push(format!("Migration {} missing up function", m.id()));
            }
            if !m.has_down() {
                issues.push(format!("Migration {} missing down function", m.id()));
            }
        }

        ValidationReport {
            valid: issues.is_empty(),
            issues,
        }
    }

    /// Ids of registered migrations not yet recorded as applied, in
    /// registration order.
    pub fn pending_migrations(&self) -> Result<Vec<String>> {
        let applied = self.applied_ids()?;
        Ok(self
            .registry
            .iter()
            .filter(|m| !applied.contains(m.id()))
            .map(|m| m.id().to_string())
            .collect())
    }

    fn applied_ids(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .db
            .connection()
            .prepare(&format!("SELECT id FROM {MIGRATIONS_TABLE}"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Applies all pending migrations in order.
    ///
    /// Stops at the first failure: later pending migrations are not
    /// attempted in this call, but earlier successes stay committed and are
    /// listed in the result's `applied`.
    pub fn run(&self, timeout: Duration) -> RunResult {
        let pending = match self.pending_migrations() {
            Ok(pending) => pending,
            Err(e) => return RunResult::failed(format!("Failed to compute pending migrations: {e:#}")),
        };
        if pending.is_empty() {
            debug!("no pending migrations");
            return RunResult::ok();
        }

        let total = pending.len();
        let mut result = RunResult::ok();
        let mut completed = 0usize;

        info!(total, "applying pending migrations");
        let mut batches = pending.chunks(self.batch_size).peekable();
        while let Some(batch) = batches.next() {
            for id in batch {
                // Pending ids derive from the registry, so the lookup holds.
                let Some(migration) = self.migration(id) else {
                    result.success = false;
                    result.errors.push(format!("Migration {id} not found"));
                    return result;
                };
                self.report_progress(completed, total, migration.name());

                match self.execute_with_timeout(migration, Direction::Up, timeout) {
                    Ok(()) => {
                        if let Err(e) = self.record_applied(migration) {
                            result.success = false;
                            result
                                .errors
                                .push(format!("Failed to record migration {id}: {e:#}"));
                            return result;
                        }
                        info!(id = %id, name = migration.name(), "migration applied");
                        result.applied.push(id.clone());
                        completed += 1;
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "migration failed, halting run");
                        result.success = false;
                        result.errors.push(format!("Migration {id} failed: {e}"));
                        return result;
                    }
                }
            }
            if batches.peek().is_some() {
                thread::sleep(BATCH_PAUSE);
            }
        }

        result
    }

    /// Rolls back a single applied migration by id.
    ///
    /// Other migrations are untouched. On success the applied record is
    /// deleted, returning the id to the pending set.
    pub fn rollback(&self, id: &str, timeout: Duration) -> RollbackResult {
        let Some(migration) = self.migration(id) else {
            return RollbackResult::failed(format!("Migration {id} not found"));
        };

        match self.execute_with_timeout(migration, Direction::Down, timeout) {
            Ok(()) => {
                if let Err(e) = self.delete_applied(id) {
                    return RollbackResult::failed(format!(
                        "Rolled back {id} but failed to delete its record: {e:#}"
                    ));
                }
                info!(id, "migration rolled back");
                RollbackResult::ok()
            }
            Err(e) => RollbackResult::failed(format!("Rollback of {id} failed: {e}")),
        }
    }

    /// All applied-migration records, oldest first.
    pub fn applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        let mut stmt = self.db.connection().prepare(&format!(
            "SELECT id, name, applied_at FROM {MIGRATIONS_TABLE} ORDER BY applied_at ASC, rowid ASC"
        ))?;
        let records = stmt
            .query_map([], |row| {
                Ok(AppliedMigration {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    applied_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Confirms database connectivity and summarizes migration state.
    pub fn health_check(&self) -> HealthReport {
        let total = self.registry.len();

        if let Err(e) = self
            .db
            .connection()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        {
            return HealthReport {
                status: HealthStatus::Error(format!("Database round trip failed: {e}")),
                total_migrations: total,
                applied_migrations: 0,
                pending_migrations: 0,
                last_migration: "none".to_string(),
            };
        }

        let applied = match self.applied_migrations() {
            Ok(applied) => applied,
            Err(e) => {
                return HealthReport {
                    status: HealthStatus::Error(format!("Failed to read applied migrations: {e:#}")),
                    total_migrations: total,
                    applied_migrations: 0,
                    pending_migrations: 0,
                    last_migration: "none".to_string(),
                };
            }
        };

        let applied_ids: HashSet<&str> = applied.iter().map(|m| m.id.as_str()).collect();
        let pending = self
            .registry
            .iter()
            .filter(|m| !applied_ids.contains(m.id()))
            .count();
        let last_migration = applied
            .last()
            .map(|m| m.name.clone())
            .unwrap_or_else(|| "none".to_string());

        let status = if pending > 0 {
            HealthStatus::Warning(format!("{pending} migration(s) pending"))
        } else {
            HealthStatus::Ok
        };

        HealthReport {
            status,
            total_migrations: total,
            applied_migrations: applied.len(),
            pending_migrations: pending,
            last_migration,
        }
    }

    // Accessor contract for the enhanced runner, which composes this one
    // instead of reaching into its internals.

    /// Executes the forward procedure of a registered migration without
    /// recording it as applied.
    pub(crate) fn execute_up(&self, id: &str, timeout: Duration) -> Result<(), MigrationError> {
        let migration = self
            .migration(id)
            .ok_or_else(|| MigrationError::NotFound(id.to_string()))?;
        self.execute_with_timeout(migration, Direction::Up, timeout)
    }

    /// Inserts the applied record for a migration that just committed.
    pub(crate) fn record_applied(&self, migration: &Migration) -> Result<()> {
        self.db
            .connection()
            .execute(
                &format!("INSERT INTO {MIGRATIONS_TABLE} (id, name, applied_at) VALUES (?1, ?2, ?3)"),
                params![migration.id(), migration.name(), now_unix()],
            )
            .with_context(|| format!("Failed to record applied migration {}", migration.id()))?;
        Ok(())
    }

    /// Inserts the applied record by id.
    pub(crate) fn record_applied_id(&self, id: &str) -> Result<()> {
        let migration = self
            .migration(id)
            .with_context(|| format!("Migration {id} not found"))?;
        self.record_applied(migration)
    }

    fn delete_applied(&self, id: &str) -> Result<()> {
        self.db.connection().execute(
            &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE id = ?1"),
            params![id],
        )?;
        Ok(())
    }

    pub(crate) fn report_progress(&self, completed: usize, total: usize, current: &str) {
        if let Some(progress) = &self.progress {
            progress(completed, total, current);
        }
    }

    /// Returns the underlying database. Useful for introspection in tests
    /// and the dashboard's read paths.
    pub fn database(&self) -> &Database {
        &self.db
    }

    pub(crate) fn database_mut(&mut self) -> &mut Database {
        &mut self.db
    }

    /// Runs a procedure with a watchdog that interrupts the connection when
    /// the deadline passes.
    ///
    /// The interrupt is a real cancellation signal into SQLite: a statement
    /// in flight aborts with an interrupted error, which is what classifies
    /// the outcome as a timeout. A procedure busy outside the driver (e.g.
    /// computing in Rust between statements) is only interrupted at its next
    /// statement, and a procedure that finishes before the watchdog fires is
    /// accepted even if it overran the deadline.
    fn execute_with_timeout(
        &self,
        migration: &Migration,
        direction: Direction,
        timeout: Duration,
    ) -> Result<(), MigrationError> {
        let watchdog = Watchdog::arm(self.db.connection().get_interrupt_handle(), timeout);
        let adapter = StatementAdapter::new(self.db.connection());
        let outcome = migration.execute(direction, &adapter);
        drop(watchdog);

        match outcome {
            Ok(()) => Ok(()),
            Err(MigrationError::Execution(e)) if was_interrupted(&e) => {
                Err(MigrationError::Timeout(timeout))
            }
            Err(e) => Err(e),
        }
    }
}

/// Whether an execution error chain bottoms out in SQLite's interrupted
/// error, i.e. the watchdog cancelled the statement. An ordinary failure
/// that happens to surface after the deadline stays an execution error.
fn was_interrupted(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::OperationInterrupted
        )
    })
}

/// Watchdog thread that interrupts the connection after a deadline.
///
/// Dropping the guard disarms the watchdog and joins the thread.
struct Watchdog {
    disarm: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn arm(handle: InterruptHandle, timeout: Duration) -> Self {
        let (disarm, armed) = mpsc::channel::<()>();
        let thread = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = armed.recv_timeout(timeout) {
                handle.interrupt();
            }
        });
        Self {
            disarm,
            thread: Some(thread),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let _ = self.disarm.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Migration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn runner_with(migrations: Vec<Migration>) -> MigrationRunner {
        let db = Database::in_memory().unwrap();
        let mut runner = MigrationRunner::new(db).unwrap();
        for m in migrations {
            runner.register(m);
        }
        runner
    }

    fn sql_migration(id: &'static str, table: &'static str) -> Migration {
        Migration::new(id, id)
            .up(move |adapter| {
                Ok(adapter.execute(format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY)"))?)
            })
            .down(move |adapter| Ok(adapter.execute(format!("DROP TABLE {table}"))?))
    }

    #[test]
    fn validate_reports_every_violation() {
        let runner = runner_with(vec![
            Migration::new("X", "first").up(|_| Ok(())).down(|_| Ok(())),
            Migration::new("X", "second").up(|_| Ok(())).down(|_| Ok(())),
            Migration::new("Y", "third").up(|_| Ok(())),
        ]);

        let report = runner.validate();
        assert!(!report.valid);
        assert!(report.issues.contains(&"Duplicate migration IDs: X".to_string()));
        assert!(report.issues.contains(&"Migration Y missing down function".to_string()));
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn validate_passes_clean_registry() {
        let runner = runner_with(vec![
            sql_migration("001_v1.0_a", "a"),
            sql_migration("002_v1.0_b", "b"),
        ]);
        let report = runner.validate();
        assert!(report.valid);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn run_applies_in_registration_order() {
        let runner = runner_with(vec![
            sql_migration("A", "table_a"),
            sql_migration("B", "table_b"),
            sql_migration("C", "table_c"),
        ]);

        let result = runner.run(TIMEOUT);
        assert!(result.success);
        assert_eq!(result.applied, vec!["A", "B", "C"]);

        let applied = runner.applied_migrations().unwrap();
        let ids: Vec<&str> = applied.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn run_is_idempotent() {
        let runner = runner_with(vec![sql_migration("A", "table_a")]);

        let first = runner.run(TIMEOUT);
        assert!(first.success);
        assert_eq!(first.applied, vec!["A"]);

        let second = runner.run(TIMEOUT);
        assert!(second.success);
        assert!(second.applied.is_empty());
    }

    #[test]
    fn run_halts_at_first_failure() {
        let runner = runner_with(vec![
            sql_migration("A", "table_a"),
            Migration::new("B", "broken")
                .up(|adapter| Ok(adapter.execute("CREATE TABLE oops (")?))
                .down(|_| Ok(())),
            sql_migration("C", "table_c"),
        ]);

        let result = runner.run(TIMEOUT);
        assert!(!result.success);
        assert_eq!(result.applied, vec!["A"]);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Migration B failed"));

        // A committed, B and C did not.
        let applied = runner.applied_migrations().unwrap();
        let ids: Vec<&str> = applied.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["A"]);
    }

    #[test]
    fn failed_migration_stays_pending_for_next_run() {
        let runner = runner_with(vec![Migration::new("A", "broken")
            .up(|adapter| Ok(adapter.execute("CREATE TABLE oops (")?))
            .down(|_| Ok(()))]);

        let result = runner.run(TIMEOUT);
        assert!(!result.success);
        assert_eq!(runner.pending_migrations().unwrap(), vec!["A"]);
    }

    #[test]
    fn rollback_removes_applied_record_and_schema() {
        let runner = runner_with(vec![sql_migration("A", "table_a")]);
        assert!(runner.run(TIMEOUT).success);

        let result = runner.rollback("A", TIMEOUT);
        assert!(result.success, "{:?}", result.error);

        assert!(runner.applied_migrations().unwrap().is_empty());
        let exists: bool = runner
            .database()
            .connection()
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name='table_a')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!exists);
    }

    #[test]
    fn rollback_unknown_id_fails_without_side_effects() {
        let runner = runner_with(vec![sql_migration("A", "table_a")]);
        assert!(runner.run(TIMEOUT).success);

        let result = runner.rollback("nope", TIMEOUT);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Migration nope not found"));
        assert_eq!(runner.applied_migrations().unwrap().len(), 1);
    }

    #[test]
    fn health_check_tracks_pending_and_applied() {
        let runner = runner_with(vec![sql_migration("A", "table_a")]);

        let before = runner.health_check();
        assert_eq!(before.total_migrations, 1);
        assert_eq!(before.applied_migrations, 0);
        assert_eq!(before.pending_migrations, 1);
        assert_eq!(before.last_migration, "none");
        assert!(matches!(before.status, HealthStatus::Warning(_)));

        assert!(runner.run(TIMEOUT).success);

        let after = runner.health_check();
        assert!(after.status.is_ok());
        assert_eq!(after.applied_migrations, 1);
        assert_eq!(after.pending_migrations, 0);
        assert_eq!(after.last_migration, "A");
    }

    #[test]
    fn run_reports_progress() {
        use std::sync::{Arc, Mutex};

        let seen: Arc<Mutex<Vec<(usize, usize, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let db = Database::in_memory().unwrap();
        let mut runner = MigrationRunner::new(db)
            .unwrap()
            .with_progress(move |completed, total, name| {
                sink.lock().unwrap().push((completed, total, name.to_string()));
            });
        runner.register(sql_migration("A", "table_a"));
        runner.register(sql_migration("B", "table_b"));

        assert!(runner.run(TIMEOUT).success);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (0, 2, "A".to_string()));
        assert_eq!(seen[1], (1, 2, "B".to_string()));
    }

    #[test]
    fn timeout_interrupts_long_running_statement() {
        // A recursive CTE that grinds long enough for the watchdog to fire.
        let runner = runner_with(vec![Migration::new("slow", "slow migration")
            .up(|adapter| {
                Ok(adapter.execute(
                    "WITH RECURSIVE grind(n) AS (
                         SELECT 1 UNION ALL SELECT n + 1 FROM grind LIMIT 200000000
                     )
                     SELECT COUNT(*) FROM grind;",
                )?)
            })
            .down(|_| Ok(()))]);

        let result = runner.run(Duration::from_millis(100));
        assert!(!result.success);
        assert!(
            result.errors[0].contains("timed out"),
            "unexpected error: {}",
            result.errors[0]
        );
        assert!(runner.applied_migrations().unwrap().is_empty());
    }

    #[test]
    fn sql_error_past_the_deadline_is_not_a_timeout() {
        // The procedure dawdles outside the driver until the watchdog has
        // fired, then hits a genuine SQL error. No statement was running
        // when the interrupt landed, so the error must surface as an
        // execution failure, not a timeout.
        let runner = runner_with(vec![Migration::new("late", "late failure")
            .up(|adapter| {
                thread::sleep(Duration::from_millis(150));
                Ok(adapter.execute("CREATE TABLEX oops (id INTEGER)")?)
            })
            .down(|_| Ok(()))]);

        let result = runner.run(Duration::from_millis(50));
        assert!(!result.success);
        assert!(
            result.errors[0].contains("syntax error"),
            "unexpected error: {}",
            result.errors[0]
        );
        assert!(!result.errors[0].contains("timed out"));
    }
}
