pub mod statement;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Where the database lives.
///
/// The migration engine behaves differently for ephemeral databases:
/// file-system backups are skipped because there is no file to copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    /// Ephemeral in-memory database, lost when the connection closes.
    InMemory,
    /// File-backed database at the given path.
    File(PathBuf),
}

/// Database wrapper providing connection management for the migration engine.
///
/// Tracks whether the database is file-backed so the backup store can decide
/// whether a point-in-time snapshot is possible, and supports swapping the
/// live connection out from under itself during a backup restore.
pub struct Database {
    conn: Connection,
    location: DbLocation,
}

impl Database {
    /// Opens an ephemeral in-memory SQLite database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn,
            location: DbLocation::InMemory,
        };
        db.apply_pragmas()?;
        Ok(db)
    }

    /// Opens a file-backed SQLite database at the given path.
    ///
    /// Creates the database file if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self {
            conn,
            location: DbLocation::File(path.to_path_buf()),
        };
        db.apply_pragmas()?;
        Ok(db)
    }

    /// Opens a database from a location string.
    ///
    /// The special value `":memory:"` denotes an ephemeral in-memory
    /// instance; anything else is treated as a file path.
    pub fn open_location(location: &str) -> Result<Self> {
        if location == ":memory:" {
            Self::in_memory()
        } else {
            Self::open(location)
        }
    }

    fn apply_pragmas(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to set connection pragmas")?;
        Ok(())
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Returns where this database lives.
    pub fn location(&self) -> &DbLocation {
        &self.location
    }

    /// Returns the database file path, or `None` for in-memory databases.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.location {
            DbLocation::InMemory => None,
            DbLocation::File(path) => Some(path.as_path()),
        }
    }

    /// Whether this database is backed by a file on disk.
    pub fn is_file_backed(&self) -> bool {
        matches!(self.location, DbLocation::File(_))
    }

    /// Closes the live connection and reopens it against the same file.
    ///
    /// Used by backup restore, which must overwrite the database file while
    /// no connection holds it open. Fails for in-memory databases, which
    /// would lose all state on reopen.
    pub fn reopen(&mut self) -> Result<()> {
        let path = match &self.location {
            DbLocation::InMemory => {
                anyhow::bail!("Cannot reopen an in-memory database")
            }
            DbLocation::File(path) => path.clone(),
        };
        // Drop the old connection before touching the file again.
        let stale = std::mem::replace(&mut self.conn, Connection::open_in_memory()?);
        stale
            .close()
            .map_err(|(_, e)| e)
            .context("Failed to close stale connection")?;
        self.conn = Connection::open(&path)
            .with_context(|| format!("Failed to reopen database at {}", path.display()))?;
        self.apply_pragmas()?;
        Ok(())
    }

    /// Replaces the database file with the contents of `source` and reopens.
    ///
    /// The live connection is closed before the copy so no handle holds the
    /// file open while it is overwritten. No-op restores are the caller's
    /// concern; this fails for in-memory databases.
    pub fn overwrite_from(&mut self, source: &Path) -> Result<()> {
        let path = match &self.location {
            DbLocation::InMemory => {
                anyhow::bail!("Cannot overwrite an in-memory database from a file")
            }
            DbLocation::File(path) => path.clone(),
        };
        let stale = std::mem::replace(&mut self.conn, Connection::open_in_memory()?);
        stale
            .close()
            .map_err(|(_, e)| e)
            .context("Failed to close stale connection")?;
        // Reopen even when the copy fails, so the wrapper never keeps
        // pointing at the placeholder in-memory connection.
        let copied = std::fs::copy(source, &path);
        self.conn = Connection::open(&path)
            .with_context(|| format!("Failed to reopen database at {}", path.display()))?;
        self.apply_pragmas()?;
        copied.with_context(|| {
            format!(
                "Failed to copy {} over {}",
                source.display(),
                path.display()
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn in_memory_opens_successfully() {
        let db = Database::in_memory().unwrap();
        assert!(!db.is_file_backed());
        assert_eq!(db.file_path(), None);
    }

    #[test]
    fn open_creates_database_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("stocks.db");

        let db = Database::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert!(db.is_file_backed());
        assert_eq!(db.file_path(), Some(db_path.as_path()));
    }

    #[test]
    fn open_location_maps_memory_sentinel() {
        let db = Database::open_location(":memory:").unwrap();
        assert_eq!(*db.location(), DbLocation::InMemory);
    }

    #[test]
    fn foreign_keys_enabled() {
        let db = Database::in_memory().unwrap();
        let fk_enabled: i32 = db
            .connection()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk_enabled, 1);
    }

    #[test]
    fn reopen_preserves_file_data() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("stocks.db");

        let mut db = Database::open(&db_path).unwrap();
        db.connection()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();

        db.reopen().unwrap();

        let count: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn reopen_rejects_in_memory() {
        let mut db = Database::in_memory().unwrap();
        assert!(db.reopen().is_err());
    }
}
