//! Attachment cache
//!
//! Metadata rows live in the shared attachments database, keyed by account
//! and attachment id. Content is stored once per SHA-256 under
//! `<dir>/<first two hex digits>/<hash>`, so the same file attached to many
//! emails (or in many accounts) takes space once. A content file is removed
//! when its last row goes.
//!
//! Every operation that creates or removes content files runs inside an
//! immediate transaction, which serializes it against the others.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{from_millis, now_millis, Database};
use crate::types::error::{CacheError, Result};
use crate::types::CachedAttachment;

/// Content directory name under the cache directory
pub const ATTACHMENTS_DIR: &str = "attachments";

/// Default size budget (100 MB)
pub const DEFAULT_ATTACHMENT_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// [`AttachmentStore::prune`] evicts down to this share of the budget
const PRUNE_TARGET_PERCENT: u64 = 80;

const ATTACHMENT_COLUMNS: &str =
    "account, id, email_id, filename, content_type, size, hash, cached_at, accessed_at";

/// Identity of an attachment being stored
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentMeta {
    pub id: String,
    pub email_id: String,
    pub filename: String,
    pub content_type: String,
}

/// Summary of the attachment cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentCacheStats {
    pub count: usize,
    pub total_size: u64,
    pub max_size: u64,
    /// `total_size` as a percentage of `max_size`
    pub usage_percent: f64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct AttachmentStore {
    db: Arc<Database>,
    dir: PathBuf,
    max_size: u64,
}

impl AttachmentStore {
    /// `max_size` is in bytes. Creates `dir` if needed.
    pub fn new(db: Arc<Database>, dir: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { db, dir, max_size })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    fn content_path(&self, hash: &str) -> PathBuf {
        let prefix = hash.get(..2).unwrap_or("00");
        self.dir.join(prefix).join(hash)
    }

    /// Store `content` for `meta` in `account`, replacing any previous
    /// version of the same attachment id
    pub fn put(
        &self,
        account: &str,
        meta: &AttachmentMeta,
        content: &[u8],
    ) -> Result<CachedAttachment> {
        if account.is_empty() || meta.id.is_empty() {
            return Err(CacheError::InvalidInput(
                "attachment needs an account and an id".to_string(),
            ));
        }

        let hash = format!("{:x}", Sha256::digest(content));
        let path = self.content_path(&hash);
        let now = now_millis();

        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT hash FROM attachments WHERE account = ?1 AND id = ?2",
                params![account, meta.id],
                |row| row.get(0),
            )
            .optional()?;

        if path.exists() {
            debug!("Attachment content {} already cached", hash);
        } else {
            write_content(&path, content)?;
            debug!("Stored attachment content {} ({} bytes)", hash, content.len());
        }

        tx.execute(
            "INSERT INTO attachments (
                account, id, email_id, filename, content_type, size, hash, cached_at, accessed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(account, id) DO UPDATE SET
                email_id = excluded.email_id,
                filename = excluded.filename,
                content_type = excluded.content_type,
                size = excluded.size,
                hash = excluded.hash,
                cached_at = excluded.cached_at,
                accessed_at = excluded.accessed_at",
            params![
                account,
                meta.id,
                meta.email_id,
                meta.filename,
                meta.content_type,
                content.len() as i64,
                hash,
                now,
            ],
        )?;

        if let Some(old) = previous.filter(|old| *old != hash) {
            self.release_if_unreferenced(&tx, &old)?;
        }
        tx.commit()?;

        Ok(CachedAttachment {
            account: account.to_string(),
            id: meta.id.clone(),
            email_id: meta.email_id.clone(),
            filename: meta.filename.clone(),
            content_type: meta.content_type.clone(),
            size: content.len() as i64,
            local_path: path,
            hash,
            cached_at: from_millis(now),
            accessed_at: from_millis(now),
        })
    }

    /// Metadata of one attachment, marking it as recently used. A row whose
    /// content file has gone missing is dropped and reads as a miss.
    pub fn get(&self, account: &str, id: &str) -> Result<Option<CachedAttachment>> {
        let conn = self.db.connection()?;
        let sql = format!(
            "SELECT {} FROM attachments WHERE account = ?1 AND id = ?2",
            ATTACHMENT_COLUMNS
        );
        let Some(mut attachment) = conn
            .query_row(&sql, params![account, id], |row| self.row_to_attachment(row))
            .optional()?
        else {
            return Ok(None);
        };

        if !attachment.local_path.exists() {
            warn!(
                "Content of attachment {} for {} is missing, dropping it",
                id, account
            );
            conn.execute(
                "DELETE FROM attachments WHERE account = ?1 AND id = ?2",
                params![account, id],
            )?;
            return Ok(None);
        }

        let now = now_millis();
        conn.execute(
            "UPDATE attachments SET accessed_at = ?3 WHERE account = ?1 AND id = ?2",
            params![account, id, now],
        )?;
        attachment.accessed_at = from_millis(now);
        Ok(Some(attachment))
    }

    /// Content bytes of one attachment
    pub fn read(&self, account: &str, id: &str) -> Result<Option<Vec<u8>>> {
        let Some(attachment) = self.get(account, id)? else {
            return Ok(None);
        };
        match fs::read(&attachment.local_path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Any attachment of `account` with this content
    pub fn get_by_hash(&self, account: &str, hash: &str) -> Result<Option<CachedAttachment>> {
        let conn = self.db.connection()?;
        let sql = format!(
            "SELECT {} FROM attachments WHERE account = ?1 AND hash = ?2 ORDER BY id LIMIT 1",
            ATTACHMENT_COLUMNS
        );
        let attachment = conn
            .query_row(&sql, params![account, hash], |row| self.row_to_attachment(row))
            .optional()?;
        Ok(attachment)
    }

    /// Attachments of one email, by filename
    pub fn list_by_email(&self, account: &str, email_id: &str) -> Result<Vec<CachedAttachment>> {
        let conn = self.db.connection()?;
        let sql = format!(
            "SELECT {} FROM attachments WHERE account = ?1 AND email_id = ?2
             ORDER BY filename ASC, id",
            ATTACHMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let attachments = stmt
            .query_map(params![account, email_id], |row| self.row_to_attachment(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(attachments)
    }

    pub fn delete(&self, account: &str, id: &str) -> Result<bool> {
        let removed = self.delete_matching(
            "account = ? AND id = ?",
            vec![Value::from(account.to_string()), Value::from(id.to_string())],
        )?;
        Ok(removed > 0)
    }

    pub fn delete_by_email(&self, account: &str, email_id: &str) -> Result<usize> {
        self.delete_matching(
            "account = ? AND email_id = ?",
            vec![
                Value::from(account.to_string()),
                Value::from(email_id.to_string()),
            ],
        )
    }

    /// Drop every attachment of one account
    pub fn delete_account(&self, account: &str) -> Result<usize> {
        let removed =
            self.delete_matching("account = ?", vec![Value::from(account.to_string())])?;
        if removed > 0 {
            info!("Removed {} cached attachments of {}", removed, account);
        }
        Ok(removed)
    }

    fn delete_matching(&self, condition: &str, values: Vec<Value>) -> Result<usize> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let hashes: Vec<String> = {
            let sql = format!("SELECT DISTINCT hash FROM attachments WHERE {}", condition);
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let sql = format!("DELETE FROM attachments WHERE {}", condition);
        let removed = tx.execute(&sql, params_from_iter(values.iter()))?;
        for hash in &hashes {
            self.release_if_unreferenced(&tx, hash)?;
        }

        tx.commit()?;
        Ok(removed)
    }

    /// Remove the content file of `hash` once no row refers to it
    fn release_if_unreferenced(&self, conn: &Connection, hash: &str) -> Result<bool> {
        let referenced: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM attachments WHERE hash = ?1)",
            params![hash],
            |row| row.get(0),
        )?;
        if referenced {
            return Ok(false);
        }

        match fs::remove_file(self.content_path(hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Sum of the sizes of every row. Shared content counts once per row.
    pub fn total_size(&self) -> Result<u64> {
        let conn = self.db.connection()?;
        let size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM attachments",
            [],
            |row| row.get(0),
        )?;
        Ok(size.max(0) as u64)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM attachments", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// When over budget, evict the least recently used attachments until
    /// the cache is down to 80% of it. Returns the number evicted.
    pub fn prune(&self) -> Result<usize> {
        let total = self.total_size()?;
        if total <= self.max_size {
            return Ok(0);
        }

        let target = self.max_size.saturating_mul(PRUNE_TARGET_PERCENT) / 100;
        let evicted = self.lru_evict(total - target)?;
        info!(
            "Attachment cache over budget ({} > {} bytes), evicted {}",
            total, self.max_size, evicted
        );
        Ok(evicted)
    }

    /// Evict least recently used attachments until at least `bytes_to_free`
    /// bytes of rows are gone. Returns the number evicted.
    pub fn lru_evict(&self, bytes_to_free: u64) -> Result<usize> {
        if bytes_to_free == 0 {
            return Ok(0);
        }

        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<(String, String, i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT account, id, size, hash FROM attachments
                 ORDER BY accessed_at ASC, cached_at ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut freed: u64 = 0;
        let mut hashes = HashSet::new();
        let mut evicted = 0;
        for (account, id, size, hash) in candidates {
            if freed >= bytes_to_free {
                break;
            }
            tx.execute(
                "DELETE FROM attachments WHERE account = ?1 AND id = ?2",
                params![account, id],
            )?;
            freed += size.max(0) as u64;
            hashes.insert(hash);
            evicted += 1;
        }

        for hash in &hashes {
            self.release_if_unreferenced(&tx, hash)?;
        }
        tx.commit()?;

        debug!("Evicted {} attachments ({} bytes)", evicted, freed);
        Ok(evicted)
    }

    /// Delete files under the content directory that no row refers to,
    /// including partial writes left by a crash. Returns the number removed.
    pub fn remove_orphaned(&self) -> Result<usize> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let known: HashSet<String> = {
            let mut stmt = tx.prepare("SELECT DISTINCT hash FROM attachments")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut removed = 0;
        for prefix in fs::read_dir(&self.dir)? {
            let prefix = prefix?;
            if !prefix.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(prefix.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type()?.is_file() && !known.contains(&name) {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
            // Only succeeds once the prefix directory is empty
            let _ = fs::remove_dir(prefix.path());
        }

        tx.commit()?;
        if removed > 0 {
            warn!("Removed {} orphaned attachment files", removed);
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<AttachmentCacheStats> {
        let conn = self.db.connection()?;
        let (count, total_size, oldest, newest) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0), MIN(cached_at), MAX(cached_at)
             FROM attachments",
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

        let total_size = total_size.max(0) as u64;
        let usage_percent = if self.max_size == 0 {
            0.0
        } else {
            total_size as f64 / self.max_size as f64 * 100.0
        };

        Ok(AttachmentCacheStats {
            count: count as usize,
            total_size,
            max_size: self.max_size,
            usage_percent,
            oldest: oldest.map(from_millis),
            newest: newest.map(from_millis),
        })
    }

    fn row_to_attachment(&self, row: &Row) -> rusqlite::Result<CachedAttachment> {
        let hash: String = row.get(6)?;
        Ok(CachedAttachment {
            account: row.get(0)?,
            id: row.get(1)?,
            email_id: row.get(2)?,
            filename: row.get(3)?,
            content_type: row.get(4)?,
            size: row.get(5)?,
            local_path: self.content_path(&hash),
            hash,
            cached_at: from_millis(row.get(7)?),
            accessed_at: from_millis(row.get(8)?),
        })
    }
}

/// Write through a `.part` file and rename, so a crash never leaves a
/// truncated file under a content hash
fn write_content(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = path.with_extension("part");
    fs::write(&partial, content)?;
    fs::rename(&partial, path)?;
    Ok(())
}
