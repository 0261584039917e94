//! Migration definitions and the shared result types of the engine.
//!
//! A [`Migration`] pairs a forward and a backward procedure under a globally
//! unique id. Procedures receive a [`StatementAdapter`] and are the only way
//! migrations touch the database. Everything the engine reports back to
//! callers (run results, rollback results, health, validation and integrity
//! reports, log entries) lives here so the dashboard's API layer can
//! serialize it directly.

pub mod enhanced;
pub mod runner;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::db::statement::StatementAdapter;

/// A forward or backward migration procedure.
pub type MigrationFn = Box<dyn Fn(&StatementAdapter<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Direction of a migration procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// Errors raised while executing a single migration procedure.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The requested migration id is not in the registry.
    #[error("Migration {0} not found")]
    NotFound(String),

    /// The migration has no procedure for the requested direction.
    #[error("Migration {id} missing {direction} function")]
    MissingProcedure { id: String, direction: Direction },

    /// The procedure returned an error. The source chain is preserved so
    /// callers can tell an interrupted statement from an ordinary failure.
    #[error("{0:#}")]
    Execution(anyhow::Error),

    /// The procedure was interrupted after exceeding its deadline.
    #[error("Migration timed out after {0:?}")]
    Timeout(Duration),
}

/// A named, versioned pair of forward/backward schema-change procedures.
///
/// Ids follow the `"<seq>_<semver>_<slug>"` convention, e.g.
/// `"002_v1.1_create_stocks_tables"`. Registration order determines default
/// application order; uniqueness is checked by the runner's `validate`, not
/// at construction time.
pub struct Migration {
    id: String,
    name: String,
    up: Option<MigrationFn>,
    down: Option<MigrationFn>,
}

impl Migration {
    /// Creates a migration with no procedures attached yet.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            up: None,
            down: None,
        }
    }

    /// Attaches the forward procedure.
    pub fn up<F>(mut self, f: F) -> Self
    where
        F: Fn(&StatementAdapter<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.up = Some(Box::new(f));
        self
    }

    /// Attaches the backward procedure.
    pub fn down<F>(mut self, f: F) -> Self
    where
        F: Fn(&StatementAdapter<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.down = Some(Box::new(f));
        self
    }

    /// Convenience constructor for migrations that are plain SQL scripts.
    pub fn from_sql(
        id: impl Into<String>,
        name: impl Into<String>,
        up_sql: &'static str,
        down_sql: &'static str,
    ) -> Self {
        Self::new(id, name)
            .up(move |adapter| Ok(adapter.execute(up_sql)?))
            .down(move |adapter| Ok(adapter.execute(down_sql)?))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_up(&self) -> bool {
        self.up.is_some()
    }

    pub fn has_down(&self) -> bool {
        self.down.is_some()
    }

    /// Runs the procedure for the given direction against the adapter.
    pub(crate) fn execute(
        &self,
        direction: Direction,
        adapter: &StatementAdapter<'_>,
    ) -> Result<(), MigrationError> {
        let proc = match direction {
            Direction::Up => self.up.as_ref(),
            Direction::Down => self.down.as_ref(),
        };
        let proc = proc.ok_or_else(|| MigrationError::MissingProcedure {
            id: self.id.clone(),
            direction,
        })?;
        proc(adapter).map_err(MigrationError::Execution)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_up", &self.has_up())
            .field("has_down", &self.has_down())
            .finish()
    }
}

/// Lifecycle state of a migration, as persisted in the log table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    /// Wire string stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Running => "running",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MigrationStatus::Pending),
            "running" => Some(MigrationStatus::Running),
            "completed" => Some(MigrationStatus::Completed),
            "failed" => Some(MigrationStatus::Failed),
            "rolled_back" => Some(MigrationStatus::RolledBack),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted proof that a migration's forward procedure has committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub id: String,
    pub name: String,
    /// Unix timestamp (seconds) of when the forward procedure committed.
    pub applied_at: i64,
}

/// Current-state snapshot of a migration's most recent run, one row per id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationLogEntry {
    pub id: String,
    pub name: String,
    pub status: MigrationStatus,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
    pub backup_path: Option<String>,
    pub attempt_count: u32,
}

/// Metadata for a point-in-time copy of the database file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub migration_id: String,
    pub path: PathBuf,
    pub file_size: i64,
    /// Unix timestamp (seconds) of backup creation.
    pub created_at: i64,
}

/// Outcome of a `run`/`run_enhanced` call.
///
/// `success == false` never means "nothing happened": migrations earlier in
/// the batch may have committed before the failure, and those ids are listed
/// in `applied`.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub success: bool,
    /// Ids committed and still applied when the call returned.
    pub applied: Vec<String>,
    pub errors: Vec<String>,
    /// Backup files created during this run.
    pub backups: Vec<PathBuf>,
}

impl RunResult {
    pub(crate) fn ok() -> Self {
        Self {
            success: true,
            applied: Vec::new(),
            errors: Vec::new(),
            backups: Vec::new(),
        }
    }

    pub(crate) fn failed(error: String) -> Self {
        Self {
            success: false,
            applied: Vec::new(),
            errors: vec![error],
            backups: Vec::new(),
        }
    }
}

/// Outcome of rolling back a single migration.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub success: bool,
    pub error: Option<String>,
}

impl RollbackResult {
    pub(crate) fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub(crate) fn failed(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
        }
    }
}

/// Registry validation outcome: every violation found, not just the first.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<String>,
}

/// Data integrity outcome: every violation found, not just the first.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub issues: Vec<String>,
}

/// Health status for the migration subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Database reachable, no migrations waiting.
    Ok,
    /// Database reachable but migrations are pending.
    Warning(String),
    /// Database round trip failed.
    Error(String),
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HealthStatus::Ok)
    }
}

/// Snapshot returned by `health_check`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_migrations: usize,
    pub applied_migrations: usize,
    pub pending_migrations: usize,
    /// Name of the most recently applied migration, or `"none"`.
    pub last_migration: String,
}

/// Current Unix timestamp in seconds.
pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
