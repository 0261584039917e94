//! Schema-migration engine for the stock dashboard's SQLite database.
//!
//! Migrations are registered in order at startup and applied through either
//! the base [`MigrationRunner`] (batched, sequential, tracked in
//! `__migrations`) or the [`EnhancedRunner`], which adds integrity
//! validation around every run, retry with exponential backoff, automatic
//! file-system backups with restore, cascading auto-rollback, and a
//! persisted log of migration attempts.
//!
//! ```
//! use std::time::Duration;
//! use stockdb::{Database, EnhancedRunner, Migration};
//!
//! # fn main() -> anyhow::Result<()> {
//! let db = Database::in_memory()?;
//! let mut runner = EnhancedRunner::new(db)?;
//! runner.register(Migration::from_sql(
//!     "001_v1.0_create_watchlist",
//!     "Create watchlist table",
//!     "CREATE TABLE watchlist (symbol TEXT PRIMARY KEY)",
//!     "DROP TABLE watchlist",
//! ));
//!
//! let result = runner.run_enhanced(Duration::from_secs(30));
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod db;
pub mod migration;

pub use backup::BackupStore;
pub use db::statement::{
    Query, QueryFormatError, SqlFragment, SqlValue, StatementAdapter, StatementError,
};
pub use db::{Database, DbLocation};
pub use migration::enhanced::{BACKUP_DIR_ENV, CoreTablesCheck, EnhancedConfig, EnhancedRunner};
pub use migration::runner::MigrationRunner;
pub use migration::{
    AppliedMigration, BackupDescriptor, Direction, HealthReport, HealthStatus, IntegrityReport,
    Migration, MigrationError, MigrationLogEntry, MigrationStatus, RollbackResult, RunResult,
    ValidationReport,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn engine_accessible_from_crate_root() {
        let db = Database::in_memory().unwrap();
        let mut runner = EnhancedRunner::new(db).unwrap();
        runner.register(Migration::from_sql(
            "001_v1.0_create_watchlist",
            "Create watchlist table",
            "CREATE TABLE watchlist (symbol TEXT PRIMARY KEY)",
            "DROP TABLE watchlist",
        ));

        assert!(runner.validate().valid);
        let result = runner.run_enhanced(Duration::from_secs(5));
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.applied, vec!["001_v1.0_create_watchlist"]);
    }
}
