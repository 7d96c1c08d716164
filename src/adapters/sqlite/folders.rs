//! Folder store

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;

use super::{from_millis, now_millis, Database};
use crate::types::error::Result;
use crate::types::CachedFolder;

const FOLDER_COLUMNS: &str = "id, name, folder_type, total_count, unread_count, cached_at";

#[derive(Clone)]
pub struct FolderStore {
    db: Arc<Database>,
}

impl FolderStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn put(&self, folder: &CachedFolder) -> Result<DateTime<Utc>> {
        let conn = self.db.connection()?;
        let cached_at = upsert(&conn, folder, now_millis())?;
        Ok(from_millis(cached_at))
    }

    pub fn put_batch(&self, folders: &[CachedFolder]) -> Result<usize> {
        if folders.is_empty() {
            return Ok(0);
        }

        let conn = self.db.connection()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_millis();
        for folder in folders {
            upsert(&tx, folder, now)?;
        }
        tx.commit()?;

        Ok(folders.len())
    }

    pub fn get(&self, id: &str) -> Result<Option<CachedFolder>> {
        let conn = self.db.connection()?;
        let sql = format!("SELECT {} FROM folders WHERE id = ?1", FOLDER_COLUMNS);
        let folder = conn
            .query_row(&sql, params![id], row_to_folder)
            .optional()?;
        Ok(folder)
    }

    /// System folders first, then user folders by name
    pub fn list(&self) -> Result<Vec<CachedFolder>> {
        let conn = self.db.connection()?;
        let sql = format!(
            "SELECT {} FROM folders
             ORDER BY CASE WHEN folder_type = '' THEN 1 ELSE 0 END, name ASC",
            FOLDER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let folders = stmt
            .query_map([], row_to_folder)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(folders)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn.execute("DELETE FROM folders WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM folders", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn upsert(conn: &Connection, folder: &CachedFolder, now: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO folders (id, name, folder_type, total_count, unread_count, cached_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            folder_type = excluded.folder_type,
            total_count = excluded.total_count,
            unread_count = excluded.unread_count,
            cached_at = MAX(excluded.cached_at, folders.cached_at)
         RETURNING cached_at",
        params![
            folder.id,
            folder.name,
            folder.folder_type,
            folder.total_count,
            folder.unread_count,
            now,
        ],
        |row| row.get(0),
    )
}

fn row_to_folder(row: &Row) -> rusqlite::Result<CachedFolder> {
    Ok(CachedFolder {
        id: row.get(0)?,
        name: row.get(1)?,
        folder_type: row.get(2)?,
        total_count: row.get(3)?,
        unread_count: row.get(4)?,
        cached_at: from_millis(row.get(5)?),
    })
}
