//! Backup store: point-in-time snapshots of the database file, catalogued in
//! the `__migration_backups` table and pruned by age.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use crate::db::Database;
use crate::migration::{BackupDescriptor, now_unix};

const BACKUPS_TABLE: &str = "__migration_backups";

/// Manages creation, cataloguing, restoration, and pruning of database
/// snapshots under a single backup directory.
///
/// Concurrent backup creation is not serialized here; it inherits the
/// engine's single-logical-writer assumption.
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    /// Creates a store rooted at `dir`.
    ///
    /// The directory is created on first use, so in-memory databases never
    /// touch the file system.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Ensures the catalogue table exists on the given connection.
    pub fn ensure_catalog(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS __migration_backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                migration_id TEXT,
                backup_path TEXT,
                file_size INTEGER,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            )",
        )
        .context("Failed to create backup catalogue table")?;
        Ok(())
    }

    /// The directory backups are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshots the database before a migration attempt.
    ///
    /// Returns `None` for in-memory databases, which have no file to copy.
    /// Uses SQLite's online backup API so the copy is consistent even with
    /// the live connection open.
    pub fn create_backup(
        &self,
        db: &Database,
        migration_id: &str,
    ) -> Result<Option<BackupDescriptor>> {
        if !db.is_file_backed() {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create backup directory {}", self.dir.display()))?;
        let path = self.dir.join(format!(
            "backup_{}_{}.db",
            migration_id,
            timestamp_slug(OffsetDateTime::now_utc())
        ));

        {
            let mut dest = Connection::open(&path)
                .with_context(|| format!("Failed to open backup file {}", path.display()))?;
            let backup = rusqlite::backup::Backup::new(db.connection(), &mut dest)
                .context("Failed to initialize backup")?;
            backup
                .run_to_completion(64, Duration::from_millis(25), None)
                .with_context(|| format!("Backup to {} failed", path.display()))?;
        }

        let file_size = std::fs::metadata(&path)
            .with_context(|| format!("Failed to stat backup file {}", path.display()))?
            .len() as i64;

        let descriptor = BackupDescriptor {
            migration_id: migration_id.to_string(),
            path,
            file_size,
            created_at: now_unix(),
        };
        self.catalog(db, &descriptor)?;

        info!(migration_id, path = %descriptor.path.display(), file_size, "backup created");
        Ok(Some(descriptor))
    }

    /// Records a backup descriptor in the catalogue.
    ///
    /// `create_backup` does this itself; restoring from a backup rewinds the
    /// catalogue to the snapshot's state, so the engine re-records the
    /// descriptor of the backup it restored from. Without that the file
    /// would be uncatalogued and `cleanup_old_backups` could never prune it.
    pub fn catalog(&self, db: &Database, descriptor: &BackupDescriptor) -> Result<()> {
        db.connection()
            .execute(
                &format!(
                    "INSERT INTO {BACKUPS_TABLE} (migration_id, backup_path, file_size, created_at)
                     VALUES (?1, ?2, ?3, ?4)"
                ),
                params![
                    descriptor.migration_id,
                    descriptor.path.to_string_lossy(),
                    descriptor.file_size,
                    descriptor.created_at
                ],
            )
            .context("Failed to record backup descriptor")?;
        Ok(())
    }

    /// Overwrites the live database file with a backup and reopens.
    ///
    /// No-op for in-memory databases.
    pub fn restore_from_backup(&self, db: &mut Database, path: &Path) -> Result<()> {
        if !db.is_file_backed() {
            return Ok(());
        }
        anyhow::ensure!(
            path.exists(),
            "Backup file {} does not exist",
            path.display()
        );
        db.overwrite_from(path)?;
        info!(path = %path.display(), "database restored from backup");
        Ok(())
    }

    /// All catalogued backups, oldest first.
    pub fn list_backups(&self, db: &Database) -> Result<Vec<BackupDescriptor>> {
        let mut stmt = db.connection().prepare(&format!(
            "SELECT migration_id, backup_path, file_size, created_at
             FROM {BACKUPS_TABLE} ORDER BY created_at ASC, id ASC"
        ))?;
        let descriptors = stmt
            .query_map([], |row| {
                Ok(BackupDescriptor {
                    migration_id: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                    file_size: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(descriptors)
    }

    /// Deletes backups older than `retain_days`, files and descriptors both.
    ///
    /// A file that fails to delete is logged and skipped; its descriptor is
    /// kept so a later sweep can retry. Returns how many backups were
    /// removed.
    pub fn cleanup_old_backups(&self, db: &Database, retain_days: i64) -> Result<usize> {
        let cutoff = now_unix() - retain_days * 24 * 60 * 60;

        let stale: Vec<(i64, String)> = {
            let mut stmt = db.connection().prepare(&format!(
                "SELECT id, backup_path FROM {BACKUPS_TABLE} WHERE created_at < ?1"
            ))?;
            stmt.query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut removed = 0usize;
        for (row_id, path) in stale {
            let file = Path::new(&path);
            if file.exists() {
                if let Err(e) = std::fs::remove_file(file) {
                    warn!(path = %path, error = %e, "failed to delete old backup file");
                    continue;
                }
            }
            db.connection().execute(
                &format!("DELETE FROM {BACKUPS_TABLE} WHERE id = ?1"),
                params![row_id],
            )?;
            removed += 1;
        }

        if removed > 0 {
            info!(removed, retain_days, "pruned old backups");
        }
        Ok(removed)
    }
}

/// Formats a timestamp for a backup file name: RFC 3339 with the characters
/// SQLite file names dislike (`:` and `.`) replaced by dashes.
fn timestamp_slug(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
        .replace([':', '.'], "-")
}
