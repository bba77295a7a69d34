use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::models::{UploadRow, to_millis};
use crate::{Database, StoreError};

impl Database {
    // -- Users --

    /// Record the display name the auth service vouched for. Deleted users
    /// stay deleted.
    pub fn touch_user(&self, id: Uuid, name: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| upsert_user(conn, id, name))
    }

    /// Mark an account as removed. Its messages keep their rows but resolve
    /// to a deleted sender from now on.
    pub fn mark_user_deleted(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                rusqlite::params![id.to_string(), to_millis(now)],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Uploads --

    pub fn insert_upload(&self, row: &UploadRow) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO uploads (id, uploader_id, filename, mime_type, size_bytes, sha256, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    row.id,
                    row.uploader_id,
                    row.filename,
                    row.mime_type,
                    row.size_bytes,
                    row.sha256,
                    row.created_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_upload(&self, id: Uuid) -> Result<Option<UploadRow>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, uploader_id, filename, mime_type, size_bytes, sha256, created_at
                     FROM uploads WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok(UploadRow {
                            id: row.get(0)?,
                            uploader_id: row.get(1)?,
                            filename: row.get(2)?,
                            mime_type: row.get(3)?,
                            size_bytes: row.get(4)?,
                            sha256: row.get(5)?,
                            created_at: row.get(6)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }
}

pub(crate) fn upsert_user(conn: &Connection, id: Uuid, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO users (id, name) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name WHERE users.deleted_at IS NULL",
        rusqlite::params![id.to_string(), name],
    )?;
    Ok(())
}
