use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tasktank_shared::types::{FileId, FishId, TankId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::FileBlob;

const SELECT_COLUMNS: &str =
    "SELECT file_id, name, mime_type, size, checksum, data, tank_id, fish_id, created_at FROM files";

impl Database {
    /// Insert or replace a blob. A full disk surfaces as
    /// [`StoreError::StorageFull`].
    pub fn store_file(&self, blob: &FileBlob) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO files
                     (file_id, name, mime_type, size, checksum, data, tank_id, fish_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    blob.file_id.as_str(),
                    blob.name,
                    blob.mime_type,
                    blob.size as i64,
                    blob.checksum,
                    blob.data,
                    blob.tank_id.as_str(),
                    blob.fish_id.as_str(),
                    blob.created_at.to_rfc3339(),
                ],
            )
            .map_err(StoreError::from_write)?;
        Ok(())
    }

    pub fn get_file(&self, file_id: &FileId) -> Result<Option<FileBlob>> {
        Ok(self
            .conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE file_id = ?1"),
                params![file_id.as_str()],
                row_to_file,
            )
            .optional()?)
    }

    pub fn has_file(&self, file_id: &FileId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM files WHERE file_id = ?1",
            params![file_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_files_for_tank(&self, tank_id: &TankId) -> Result<Vec<FileBlob>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{SELECT_COLUMNS} WHERE tank_id = ?1 ORDER BY created_at"))?;

        let rows = stmt.query_map(params![tank_id.as_str()], row_to_file)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    pub fn delete_file(&self, file_id: &FileId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM files WHERE file_id = ?1", params![file_id.as_str()])?;
        Ok(affected > 0)
    }

    /// Remove every blob owned by a fish. Returns how many were removed.
    pub fn delete_files_for_fish(&self, fish_id: &FishId) -> Result<usize> {
        let affected = self
            .conn()
            .execute("DELETE FROM files WHERE fish_id = ?1", params![fish_id.as_str()])?;
        Ok(affected)
    }

    /// Remove every blob owned by a tank. Returns how many were removed.
    pub fn delete_files_for_tank(&self, tank_id: &TankId) -> Result<usize> {
        let affected = self
            .conn()
            .execute("DELETE FROM files WHERE tank_id = ?1", params![tank_id.as_str()])?;
        Ok(affected)
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileBlob> {
    let file_id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let mime_type: Option<String> = row.get(2)?;
    let size: i64 = row.get(3)?;
    let checksum: Option<String> = row.get(4)?;
    let data: Vec<u8> = row.get(5)?;
    let tank_id: String = row.get(6)?;
    let fish_id: String = row.get(7)?;
    let created_str: String = row.get(8)?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(FileBlob {
        file_id: FileId(file_id),
        name,
        mime_type,
        size: size.max(0) as u64,
        checksum,
        data,
        tank_id: TankId(tank_id),
        fish_id: FishId(fish_id),
        created_at,
    })
}
