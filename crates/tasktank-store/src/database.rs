//! Opening the device database.
//!
//! Every way of opening a [`Database`] ends in the same place: schema
//! migrations applied and this installation's device id present, so the
//! sync engine can rely on both from its first call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

const DB_FILE: &str = "tasktank.db";

/// How long a write waits on another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform data directory for TaskTank, e.g. `~/.local/share/tasktank` on
/// Linux.
pub fn data_dir() -> Result<PathBuf> {
    ProjectDirs::from("com", "tasktank", "tasktank")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StoreError::NoDataDir)
}

/// A device's local store: settings, sync keys and file blobs.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the database in the platform data directory, creating both on
    /// first run.
    pub fn open_default() -> Result<Self> {
        let dir = data_dir()?;
        std::fs::create_dir_all(&dir)?;
        Self::open_at(&dir.join(DB_FILE))
    }

    /// Open (or create) a database file.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self::ready(conn)?;
        tracing::info!(path = %path.display(), "opened database");
        Ok(db)
    }

    /// Throwaway store with a fresh device id.
    pub fn open_in_memory() -> Result<Self> {
        Self::ready(Connection::open_in_memory()?)
    }

    fn ready(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        let db = Self { conn };
        let device = db.device_id()?;
        tracing::debug!(
            device = %device.short(),
            schema = db.schema_version()?,
            "database ready"
        );
        Ok(db)
    }

    /// Last migration applied to this file.
    pub fn schema_version(&self) -> Result<u32> {
        Ok(self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// `None` for in-memory databases.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().filter(|p| !p.is_empty()).map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_database_is_ready_to_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phone.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some_and(|p| p.ends_with("phone.db")));
        assert_eq!(db.schema_version().unwrap(), migrations::CURRENT_VERSION);

        let mode: String = db
            .conn()
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let busy: i64 = db
            .conn()
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(busy, BUSY_TIMEOUT.as_millis() as i64);
    }

    #[test]
    fn device_id_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phone.db");

        let first = Database::open_at(&path).unwrap();
        let id = first.get_setting("device_id").unwrap().expect("stored on open");
        drop(first);

        let again = Database::open_at(&path).unwrap();
        assert_eq!(again.device_id().unwrap().as_str(), id);
        assert_eq!(again.schema_version().unwrap(), migrations::CURRENT_VERSION);
    }

    #[test]
    fn in_memory_stores_are_separate_devices() {
        let a = Database::open_in_memory().unwrap();
        let b = Database::open_in_memory().unwrap();
        assert!(a.path().is_none());
        assert_ne!(a.device_id().unwrap(), b.device_id().unwrap());
    }
}
