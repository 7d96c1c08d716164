//! Contact photo cache
//!
//! Photos are shared across accounts and live in their own database file.
//! Entries older than the TTL read as misses and are removed by [`PhotoStore::prune`].
//!
//! Both removal paths are single guarded `DELETE` statements keyed on the
//! stale `cached_at`, so a concurrent `put` that refreshes a row is never
//! undone by a prune or an expired read.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{from_millis, now_millis, Database};
use crate::types::error::{CacheError, Result};
use crate::types::CachedPhoto;

/// Default time-to-live for cached photos (30 days)
pub const DEFAULT_PHOTO_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Summary of the photo cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoCacheStats {
    pub count: usize,
    pub total_size: i64,
    pub ttl_days: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct PhotoStore {
    db: Arc<Database>,
    ttl: Duration,
}

impl PhotoStore {
    /// A zero TTL falls back to [`DEFAULT_PHOTO_TTL`]
    pub fn new(db: Arc<Database>, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_PHOTO_TTL } else { ttl };
        Self { db, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn ttl_millis(&self) -> i64 {
        i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX)
    }

    fn cutoff(&self) -> i64 {
        now_millis().saturating_sub(self.ttl_millis())
    }

    pub fn put(&self, contact_id: &str, content_type: &str, data: &[u8]) -> Result<()> {
        if contact_id.is_empty() {
            return Err(CacheError::InvalidInput("empty contact id".to_string()));
        }
        self.put_at(contact_id, content_type, data, now_millis())
    }

    fn put_at(&self, contact_id: &str, content_type: &str, data: &[u8], at: i64) -> Result<()> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO photos (contact_id, content_type, data, size, cached_at, accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(contact_id) DO UPDATE SET
                content_type = excluded.content_type,
                data = excluded.data,
                size = excluded.size,
                cached_at = excluded.cached_at,
                accessed_at = excluded.accessed_at",
            params![contact_id, content_type, data, data.len() as i64, at],
        )?;
        Ok(())
    }

    /// Photo bytes and content type, or `None` if absent or expired
    pub fn get(&self, contact_id: &str) -> Result<Option<(Vec<u8>, String)>> {
        let conn = self.db.connection()?;
        let row = conn
            .query_row(
                "SELECT data, content_type, cached_at FROM photos WHERE contact_id = ?1",
                params![contact_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((data, content_type, cached_at)) = row else {
            return Ok(None);
        };

        let now = now_millis();
        if now.saturating_sub(cached_at) > self.ttl_millis() {
            drop(conn);
            self.remove_version(contact_id, cached_at)?;
            debug!("Expired photo for contact {}", contact_id);
            return Ok(None);
        }

        conn.execute(
            "UPDATE photos SET accessed_at = ?2 WHERE contact_id = ?1",
            params![contact_id, now],
        )?;

        Ok(Some((data, content_type)))
    }

    /// Delete the row only if it still holds the version cached at
    /// `cached_at`; a concurrent put has a newer one
    fn remove_version(&self, contact_id: &str, cached_at: i64) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn.execute(
            "DELETE FROM photos WHERE contact_id = ?1 AND cached_at = ?2",
            params![contact_id, cached_at],
        )?;
        Ok(changed > 0)
    }

    /// Metadata without the image bytes, regardless of expiry
    pub fn metadata(&self, contact_id: &str) -> Result<Option<CachedPhoto>> {
        let conn = self.db.connection()?;
        let photo = conn
            .query_row(
                "SELECT contact_id, content_type, size, cached_at, accessed_at
                 FROM photos WHERE contact_id = ?1",
                params![contact_id],
                |row| {
                    Ok(CachedPhoto {
                        contact_id: row.get(0)?,
                        content_type: row.get(1)?,
                        size: row.get(2)?,
                        cached_at: from_millis(row.get(3)?),
                        accessed_at: from_millis(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(photo)
    }

    /// Cached and not expired. Storage errors count as invalid.
    pub fn is_valid(&self, contact_id: &str) -> bool {
        let Ok(conn) = self.db.connection() else {
            return false;
        };
        conn.query_row(
            "SELECT cached_at FROM photos WHERE contact_id = ?1",
            params![contact_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|cached_at| now_millis().saturating_sub(cached_at) <= self.ttl_millis())
        .unwrap_or(false)
    }

    pub fn delete(&self, contact_id: &str) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn.execute(
            "DELETE FROM photos WHERE contact_id = ?1",
            params![contact_id],
        )?;
        Ok(changed > 0)
    }

    /// Remove every expired photo. Returns the number of rows removed.
    pub fn prune(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let removed = conn.execute(
            "DELETE FROM photos WHERE cached_at < ?1",
            params![self.cutoff()],
        )?;
        if removed > 0 {
            debug!("Pruned {} expired photos", removed);
        }
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Total bytes of cached image data
    pub fn total_size(&self) -> Result<i64> {
        let conn = self.db.connection()?;
        let size: i64 =
            conn.query_row("SELECT COALESCE(SUM(size), 0) FROM photos", [], |row| {
                row.get(0)
            })?;
        Ok(size)
    }

    pub fn stats(&self) -> Result<PhotoCacheStats> {
        let conn = self.db.connection()?;
        let (count, total_size, oldest, newest) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0), MIN(cached_at), MAX(cached_at) FROM photos",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        )?;

        Ok(PhotoCacheStats {
            count: count as usize,
            total_size,
            ttl_days: self.ttl.as_secs() / 86_400,
            oldest: oldest.map(from_millis),
            newest: newest.map(from_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::schema::initialize_photo_schema;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    fn store(ttl: Duration) -> PhotoStore {
        let db = Database::in_memory().expect("Failed to create database");
        initialize_photo_schema(&db.connection().unwrap()).unwrap();
        PhotoStore::new(Arc::new(db), ttl)
    }

    #[test]
    fn test_put_get_fresh_photo() {
        let store = store(DEFAULT_PHOTO_TTL);
        store.put("c1", "image/png", &[1, 2, 3]).unwrap();

        let (data, content_type) = store.get("c1").unwrap().expect("photo cached");
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(content_type, "image/png");
        assert!(store.is_valid("c1"));
        assert!(store.get("c2").unwrap().is_none());
        assert!(!store.is_valid("c2"));
    }

    #[test]
    fn test_expired_photo_is_a_miss_and_removed() {
        let store = store(Duration::from_secs(3600));
        store
            .put_at("old", "image/jpeg", &[9; 16], now_millis() - 2 * HOUR_MS)
            .unwrap();

        assert!(!store.is_valid("old"));
        assert!(store.get("old").unwrap().is_none());
        assert!(store.metadata("old").unwrap().is_none());
    }

    #[test]
    fn test_prune_is_idempotent() {
        let store = store(Duration::from_secs(3600));
        let stale = now_millis() - 2 * HOUR_MS;
        store.put_at("a", "image/png", &[1], stale).unwrap();
        store.put_at("b", "image/png", &[2], stale).unwrap();
        store.put("c", "image/png", &[3, 3]).unwrap();

        assert_eq!(store.prune().unwrap(), 2);
        assert_eq!(store.prune().unwrap(), 0);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.total_size().unwrap(), 2);
    }

    #[test]
    fn test_refreshed_photo_survives_removal_of_stale_version() {
        let store = store(Duration::from_secs(3600));
        let stale = now_millis() - 2 * HOUR_MS;
        store.put_at("c1", "image/png", &[1], stale).unwrap();

        // Refreshed after an expired read saw the stale version
        store.put("c1", "image/png", &[2]).unwrap();
        assert!(!store.remove_version("c1", stale).unwrap());
        assert_eq!(store.prune().unwrap(), 0);
        assert_eq!(store.get("c1").unwrap().unwrap().0, vec![2]);
    }

    #[test]
    fn test_prune_never_removes_concurrent_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("photos.db")).unwrap();
        initialize_photo_schema(&db.connection().unwrap()).unwrap();
        let store = PhotoStore::new(Arc::new(db), Duration::from_secs(3600));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200u8 {
                    let stale = now_millis() - 2 * HOUR_MS;
                    store.put_at("c1", "image/png", &[i], stale).unwrap();
                    store.put("c1", "image/png", &[i]).unwrap();
                    // No prune may take the fresh version
                    assert!(store.metadata("c1").unwrap().is_some(), "iteration {}", i);
                }
            })
        };
        let pruner = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    store.prune().unwrap();
                }
            })
        };

        writer.join().unwrap();
        pruner.join().unwrap();
        assert_eq!(store.get("c1").unwrap().unwrap().0, vec![199]);
    }

    #[test]
    fn test_stats() {
        let store = store(Duration::ZERO);
        assert_eq!(store.ttl(), DEFAULT_PHOTO_TTL);

        let empty = store.stats().unwrap();
        assert_eq!(empty.count, 0);
        assert_eq!(empty.oldest, None);

        store.put_at("a", "image/png", &[0; 10], 1_000).unwrap();
        store.put("b", "image/png", &[0; 5]).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_size, 15);
        assert_eq!(stats.ttl_days, 30);
        assert_eq!(stats.oldest, Some(from_millis(1_000)));

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
    }
}
