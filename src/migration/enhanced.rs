//! Enhanced migration runner: integrity validation around every run,
//! per-migration retry with exponential backoff, automatic backups and
//! restore, cascading auto-rollback past a failure threshold, and a
//! queryable log of migration attempts.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::params;
use tracing::{info, warn};

use crate::backup::BackupStore;
use crate::db::Database;
use crate::migration::runner::MigrationRunner;
use crate::migration::{
    AppliedMigration, BackupDescriptor, HealthReport, IntegrityReport, Migration,
    MigrationLogEntry, MigrationStatus, RollbackResult, RunResult, ValidationReport, now_unix,
};

const LOGS_TABLE: &str = "__migration_logs";

/// Environment variable overriding the backup directory.
pub const BACKUP_DIR_ENV: &str = "STOCKDB_BACKUP_DIR";

/// The "create core tables" migration whose tables integrity validation
/// re-checks for as long as the migration stays applied.
#[derive(Debug, Clone)]
pub struct CoreTablesCheck {
    pub migration_id: String,
    pub tables: Vec<String>,
}

/// Configuration for [`EnhancedRunner`].
#[derive(Debug, Clone)]
pub struct EnhancedConfig {
    /// Attempts per migration before it is marked failed.
    pub max_retries: u32,
    /// Where backup snapshots are written.
    pub backup_dir: PathBuf,
    /// Base unit for exponential backoff; attempt `n` waits
    /// `backoff_base * 2^n`. One second matches production; tests shrink it.
    pub backoff_base: Duration,
    /// Batch size handed to the base runner.
    pub batch_size: usize,
    /// `(table, index)` pairs: the index must exist whenever the table does.
    pub expected_indexes: Vec<(String, String)>,
    /// Core-tables check, or `None` to skip it.
    pub core_tables: Option<CoreTablesCheck>,
}

impl Default for EnhancedConfig {
    fn default() -> Self {
        let backup_dir = std::env::var(BACKUP_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./backups"));
        Self {
            max_retries: 3,
            backup_dir,
            backoff_base: Duration::from_secs(1),
            batch_size: 5,
            expected_indexes: vec![
                ("stock_daily".into(), "idx_stock_daily_symbol".into()),
                ("stock_daily".into(), "idx_stock_daily_trade_date".into()),
                (
                    "user_stock_favorites".into(),
                    "idx_user_stock_favorites_user".into(),
                ),
            ],
            core_tables: Some(CoreTablesCheck {
                migration_id: "002_v1.1_create_stocks_tables".into(),
                tables: vec![
                    "stocks".into(),
                    "stock_daily".into(),
                    "user_stock_favorites".into(),
                ],
            }),
        }
    }
}

/// Wraps the base [`MigrationRunner`] with validation, retries, backups, and
/// auto-rollback.
///
/// Composes the base runner as a collaborator; the only internals it uses
/// are the base runner's explicit crate-level accessors.
pub struct EnhancedRunner {
    runner: MigrationRunner,
    backups: BackupStore,
    config: EnhancedConfig,
    /// Failures accumulated across the current `run_enhanced` call. When it
    /// reaches `max_retries`, everything applied this run is rolled back.
    /// Instance-scoped so runners in one process do not cross-contaminate.
    failure_count: u32,
}

impl EnhancedRunner {
    /// Creates an enhanced runner with default configuration.
    pub fn new(db: Database) -> Result<Self> {
        Self::with_config(db, EnhancedConfig::default())
    }

    /// Creates an enhanced runner, setting up the log and backup tracking
    /// tables and the backup directory.
    pub fn with_config(db: Database, config: EnhancedConfig) -> Result<Self> {
        db.connection()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS __migration_logs (
                    id TEXT PRIMARY KEY,
                    name TEXT,
                    status TEXT,
                    started_at INTEGER,
                    completed_at INTEGER,
                    error_message TEXT,
                    backup_path TEXT,
                    attempt_count INTEGER DEFAULT 0,
                    created_at INTEGER DEFAULT (strftime('%s', 'now'))
                )",
            )
            .context("Failed to create migration logs table")?;
        BackupStore::ensure_catalog(db.connection())?;

        let backups = BackupStore::new(&config.backup_dir);
        let runner = MigrationRunner::new(db)?.with_batch_size(config.batch_size);
        Ok(Self {
            runner,
            backups,
            config,
            failure_count: 0,
        })
    }

    /// Installs a progress callback on the underlying base runner.
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(usize, usize, &str) + Send + Sync + 'static,
    {
        self.runner = self.runner.with_progress(progress);
        self
    }

    // The base runner's surface, re-exposed so callers hold one handle.

    pub fn register(&mut self, migration: Migration) {
        self.runner.register(migration);
    }

    pub fn validate(&self) -> ValidationReport {
        self.runner.validate()
    }

    /// Runs pending migrations through the base runner, without validation,
    /// retries, or backups.
    pub fn run(&self, timeout: Duration) -> RunResult {
        self.runner.run(timeout)
    }

    pub fn rollback(&self, id: &str, timeout: Duration) -> RollbackResult {
        self.runner.rollback(id, timeout)
    }

    pub fn applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        self.runner.applied_migrations()
    }

    pub fn health_check(&self) -> HealthReport {
        self.runner.health_check()
    }

    pub fn pending_migrations(&self) -> Result<Vec<String>> {
        self.runner.pending_migrations()
    }

    /// Returns the underlying database. Useful for introspection in tests
    /// and the dashboard's read paths.
    pub fn database(&self) -> &Database {
        self.runner.database()
    }

    /// Applies pending migrations with the full safety net.
    ///
    /// Integrity is validated before anything runs, after every forward
    /// procedure, and once more after the last migration. Each migration is
    /// retried up to `max_retries` times with exponential backoff, with a
    /// backup taken before the first attempt. A migration that exhausts its
    /// retries is restored from backup and halts the run; once failures
    /// across the run reach `max_retries`, everything applied during the
    /// run is rolled back in reverse order.
    ///
    /// Failures never escape as `Err`; inspect the returned result.
    pub fn run_enhanced(&mut self, timeout: Duration) -> RunResult {
        self.failure_count = 0;
        let mut result = RunResult::ok();
        if let Err(e) = self.run_enhanced_inner(timeout, &mut result) {
            result.success = false;
            result.errors.push(format!("Migration system error: {e:#}"));
        }
        result
    }

    fn run_enhanced_inner(&mut self, timeout: Duration, result: &mut RunResult) -> Result<()> {
        let pre = self.validate_data_integrity();
        if !pre.valid {
            result.success = false;
            for issue in pre.issues {
                result
                    .errors
                    .push(format!("Pre-run integrity check failed: {issue}"));
            }
            return Ok(());
        }

        let pending = self.runner.pending_migrations()?;
        if pending.is_empty() {
            return Ok(());
        }
        let total = pending.len();
        info!(total, "running migrations with enhanced safety checks");

        let mut applied_this_run: Vec<String> = Vec::new();
        let mut halted = false;

        for (position, id) in pending.iter().enumerate() {
            let name = self
                .runner
                .migration(id)
                .map(|m| m.name().to_string())
                .unwrap_or_else(|| id.clone());
            self.runner.report_progress(position, total, &name);
            self.log_running(id, &name)?;

            let mut backup: Option<BackupDescriptor> = None;
            let mut attempt = 0u32;
            let mut last_error = String::new();
            let mut committed = false;

            while attempt < self.config.max_retries {
                attempt += 1;
                self.log_attempt(id, attempt)?;

                if attempt == 1 {
                    match self.backups.create_backup(self.runner.database(), id) {
                        Ok(Some(descriptor)) => {
                            self.log_backup_path(id, &descriptor.path)?;
                            result.backups.push(descriptor.path.clone());
                            backup = Some(descriptor);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(id = %id, error = %format!("{e:#}"), "backup failed, proceeding without one");
                        }
                    }
                }

                match self.runner.execute_up(id, timeout) {
                    Ok(()) => {
                        let post = self.validate_data_integrity();
                        if post.valid {
                            self.runner.record_applied_id(id)?;
                            self.log_completed(id, attempt)?;
                            applied_this_run.push(id.clone());
                            result.applied.push(id.clone());
                            committed = true;
                            break;
                        }
                        last_error = format!(
                            "Integrity validation failed after migration: {}",
                            post.issues.join("; ")
                        );
                        self.failure_count += 1;
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        self.failure_count += 1;
                    }
                }

                if attempt < self.config.max_retries {
                    let delay = self.config.backoff_base * 2u32.pow(attempt);
                    warn!(id = %id, attempt, delay = ?delay, error = %last_error, "migration attempt failed, backing off");
                    thread::sleep(delay);
                }
            }

            if !committed {
                warn!(id = %id, attempts = attempt, error = %last_error, "migration failed permanently");
                result.success = false;
                result
                    .errors
                    .push(format!("Migration {id} failed after {attempt} attempts: {last_error}"));

                // Restore before logging the failure: the restore overwrites
                // the whole database file, log table included, and the
                // failed row must survive it.
                if let Some(descriptor) = &backup {
                    if let Err(e) = self.restore_from_backup(&descriptor.path) {
                        result
                            .errors
                            .push(format!("Backup restore failed for {id}: {e:#}"));
                    } else if let Err(e) =
                        self.backups.catalog(self.runner.database(), descriptor)
                    {
                        // The restore rewound the catalogue past this
                        // backup's entry; without re-recording it the file
                        // would escape retention cleanup.
                        warn!(id = %id, error = %format!("{e:#}"), "failed to re-catalogue restored backup");
                    }
                }
                self.log_failed(
                    id,
                    &last_error,
                    attempt,
                    backup.as_ref().map(|d| d.path.as_path()),
                )?;
                if self.failure_count >= self.config.max_retries {
                    self.auto_rollback(&mut applied_this_run, timeout, result);
                }
                halted = true;
                break;
            }
        }

        if result.success && !halted {
            let post = self.validate_data_integrity();
            if !post.valid {
                result.success = false;
                for issue in post.issues {
                    result
                        .errors
                        .push(format!("Post-run integrity check failed: {issue}"));
                }
            }
        }
        Ok(())
    }

    /// Rolls back every migration applied during this run, newest first.
    ///
    /// Stops at the first rollback failure, leaving the database partially
    /// rolled back; that state is surfaced as an error and needs operator
    /// intervention.
    fn auto_rollback(
        &mut self,
        applied_this_run: &mut Vec<String>,
        timeout: Duration,
        result: &mut RunResult,
    ) {
        if applied_this_run.is_empty() {
            return;
        }
        warn!(
            count = applied_this_run.len(),
            "failure threshold reached, rolling back migrations applied this run"
        );

        while let Some(id) = applied_this_run.pop() {
            let rollback = self.runner.rollback(&id, timeout);
            if rollback.success {
                if let Err(e) = self.log_rolled_back(&id) {
                    warn!(id = %id, error = %format!("{e:#}"), "failed to log rollback");
                }
                result.applied.retain(|applied| applied != &id);
            } else {
                let message = rollback
                    .error
                    .unwrap_or_else(|| "unknown rollback error".to_string());
                result
                    .errors
                    .push(format!("Auto-rollback failed for {id}: {message}"));
                break;
            }
        }
    }

    /// Checks database consistency, accumulating every violation found.
    ///
    /// In order: foreign-key violations, SQLite's full integrity check,
    /// expected indexes on present tables, and the core-tables check when
    /// its migration is applied.
    pub fn validate_data_integrity(&self) -> IntegrityReport {
        let mut issues = Vec::new();
        let conn = self.runner.database().connection();

        match conn.prepare("PRAGMA foreign_key_check") {
            Ok(mut stmt) => match stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(2)?))
            }) {
                Ok(rows) => {
                    for row in rows.flatten() {
                        issues.push(format!(
                            "Foreign key violation in table {} referencing {}",
                            row.0, row.1
                        ));
                    }
                }
                Err(e) => issues.push(format!("Foreign key check failed: {e}")),
            },
            Err(e) => issues.push(format!("Foreign key check failed: {e}")),
        }

        match conn.query_row("PRAGMA integrity_check", [], |row| {
            row.get::<_, String>(0)
        }) {
            Ok(verdict) if verdict == "ok" => {}
            Ok(verdict) => issues.push(format!("Database consistency check failed: {verdict}")),
            Err(e) => issues.push(format!("Database consistency check failed: {e}")),
        }

        for (table, index) in &self.config.expected_indexes {
            match (
                object_exists(conn, "table", table),
                object_exists(conn, "index", index),
            ) {
                (Ok(true), Ok(false)) => {
                    issues.push(format!("Missing expected index {index} on table {table}"))
                }
                (Err(e), _) | (_, Err(e)) => {
                    issues.push(format!("Index check failed for {index}: {e}"))
                }
                _ => {}
            }
        }

        if let Some(check) = &self.config.core_tables {
            match self.is_applied(&check.migration_id) {
                Ok(true) => {
                    for table in &check.tables {
                        match object_exists(conn, "table", table) {
                            Ok(true) => {}
                            Ok(false) => issues.push(format!(
                                "Core table {table} missing after {}",
                                check.migration_id
                            )),
                            Err(e) => issues.push(format!("Core table check failed for {table}: {e}")),
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => issues.push(format!("Core table check failed: {e:#}")),
            }
        }

        IntegrityReport {
            valid: issues.is_empty(),
            issues,
        }
    }

    fn is_applied(&self, id: &str) -> Result<bool> {
        let applied = self
            .runner
            .database()
            .connection()
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM __migrations WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
        Ok(applied)
    }

    /// Current log snapshot for every migration the runner has touched,
    /// oldest start first. Rows persist across runs as an audit trail.
    pub fn migration_logs(&self) -> Result<Vec<MigrationLogEntry>> {
        let mut stmt = self.runner.database().connection().prepare(&format!(
            "SELECT id, name, status, started_at, completed_at, error_message,
                    backup_path, attempt_count
             FROM {LOGS_TABLE} ORDER BY started_at ASC, rowid ASC"
        ))?;
        let entries = stmt
            .query_map([], |row| {
                let status: String = row.get(2)?;
                Ok(MigrationLogEntry {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    status: MigrationStatus::parse(&status)
                        .unwrap_or(MigrationStatus::Pending),
                    started_at: row.get(3)?,
                    completed_at: row.get(4)?,
                    error_message: row.get(5)?,
                    backup_path: row.get(6)?,
                    attempt_count: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Takes a backup for a migration id. `None` for in-memory databases.
    pub fn create_backup(&self, migration_id: &str) -> Result<Option<BackupDescriptor>> {
        self.backups.create_backup(self.runner.database(), migration_id)
    }

    /// Restores the database from a backup file.
    pub fn restore_from_backup(&mut self, path: &Path) -> Result<()> {
        self.backups
            .restore_from_backup(self.runner.database_mut(), path)
    }

    /// Prunes backups older than `retain_days`; returns how many were removed.
    pub fn cleanup_old_backups(&self, retain_days: i64) -> Result<usize> {
        self.backups
            .cleanup_old_backups(self.runner.database(), retain_days)
    }

    /// All catalogued backups, oldest first.
    pub fn list_backups(&self) -> Result<Vec<BackupDescriptor>> {
        self.backups.list_backups(self.runner.database())
    }

    // Log transitions: one row per migration id, overwritten in place.

    fn log_running(&self, id: &str, name: &str) -> Result<()> {
        self.runner.database().connection().execute(
            &format!(
                "INSERT INTO {LOGS_TABLE}
                     (id, name, status, started_at, completed_at, error_message, backup_path, attempt_count)
                 VALUES (?1, ?2, 'running', ?3, NULL, NULL, NULL, 1)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     status = 'running',
                     started_at = excluded.started_at,
                     completed_at = NULL,
                     error_message = NULL,
                     backup_path = NULL,
                     attempt_count = 1"
            ),
            params![id, name, now_unix()],
        )?;
        Ok(())
    }

    fn log_attempt(&self, id: &str, attempt: u32) -> Result<()> {
        self.runner.database().connection().execute(
            &format!("UPDATE {LOGS_TABLE} SET attempt_count = ?2 WHERE id = ?1"),
            params![id, attempt],
        )?;
        Ok(())
    }

    fn log_backup_path(&self, id: &str, path: &Path) -> Result<()> {
        self.runner.database().connection().execute(
            &format!("UPDATE {LOGS_TABLE} SET backup_path = ?2 WHERE id = ?1"),
            params![id, path.to_string_lossy()],
        )?;
        Ok(())
    }

    fn log_completed(&self, id: &str, attempt: u32) -> Result<()> {
        self.runner.database().connection().execute(
            &format!(
                "UPDATE {LOGS_TABLE}
                 SET status = 'completed', completed_at = ?2, error_message = NULL,
                     attempt_count = ?3
                 WHERE id = ?1"
            ),
            params![id, now_unix(), attempt],
        )?;
        Ok(())
    }

    /// Also re-records the backup path: a restore may have rewound the log
    /// row to a state from before the backup was catalogued.
    fn log_failed(&self, id: &str, error: &str, attempt: u32, backup: Option<&Path>) -> Result<()> {
        self.runner.database().connection().execute(
            &format!(
                "UPDATE {LOGS_TABLE}
                 SET status = 'failed', completed_at = ?2, error_message = ?3,
                     attempt_count = ?4, backup_path = COALESCE(?5, backup_path)
                 WHERE id = ?1"
            ),
            params![
                id,
                now_unix(),
                error,
                attempt,
                backup.map(|p| p.to_string_lossy().into_owned())
            ],
        )?;
        Ok(())
    }

    fn log_rolled_back(&self, id: &str) -> Result<()> {
        self.runner.database().connection().execute(
            &format!(
                "UPDATE {LOGS_TABLE} SET status = 'rolled_back', completed_at = ?2 WHERE id = ?1"
            ),
            params![id, now_unix()],
        )?;
        Ok(())
    }
}

fn object_exists(conn: &rusqlite::Connection, kind: &str, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
        params![kind, name],
        |row| row.get(0),
    )
}
