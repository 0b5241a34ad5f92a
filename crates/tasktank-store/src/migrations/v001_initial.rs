//! v001 -- Initial schema creation.
//!
//! Creates the `settings` key-value table and the `files` blob table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Settings (sync keys, device group, relay cache)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS settings (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,             -- JSON
    updated_at TEXT NOT NULL              -- RFC-3339
);

-- ----------------------------------------------------------------
-- File blobs attached to fish
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    file_id    TEXT PRIMARY KEY NOT NULL,
    name       TEXT NOT NULL,
    mime_type  TEXT,
    size       INTEGER NOT NULL,
    checksum   TEXT,                      -- hex BLAKE3 of data
    data       BLOB NOT NULL,
    tank_id    TEXT NOT NULL,
    fish_id    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_fish ON files(fish_id);
CREATE INDEX IF NOT EXISTS idx_files_tank ON files(tank_id);
"#;

/// Apply the v001 migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
