//! Per-account storage
//!
//! Every account gets its own SQLite file under the cache directory, so no
//! query can ever see another account's rows. Handles are opened lazily on
//! first use and shared by the sync loop and request handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::adapters::sqlite::calendars::CalendarStore;
use crate::adapters::sqlite::contacts::ContactStore;
use crate::adapters::sqlite::emails::EmailStore;
use crate::adapters::sqlite::events::EventStore;
use crate::adapters::sqlite::folders::FolderStore;
use crate::adapters::sqlite::offline_queue::OfflineQueue;
use crate::adapters::sqlite::schema::initialize_account_schema;
use crate::adapters::sqlite::sync_state::SyncStateStore;
use crate::adapters::sqlite::Database;
use crate::types::error::{CacheError, Result};

/// Shared photo database file name
pub const PHOTOS_DB: &str = "photos.db";

/// Shared attachment metadata database file name
pub const ATTACHMENTS_DB: &str = "attachments.db";

/// Shared handle to one account's storage
pub type StorageHandle = Arc<AccountStorage>;

/// One account's open cache database
pub struct AccountStorage {
    account: String,
    db: Arc<Database>,
}

impl AccountStorage {
    /// Open (creating if needed) the database at `path`, apply the schema and
    /// return any actions left claimed by an interrupted drain to the queue.
    pub fn open(account: &str, path: &Path) -> Result<Self> {
        let db = Database::open(path)?;
        Self::init(account, db)
    }

    /// Create an in-memory storage (for testing)
    pub fn in_memory(account: &str) -> Result<Self> {
        Self::init(account, Database::in_memory()?)
    }

    fn init(account: &str, db: Database) -> Result<Self> {
        {
            let conn = db.connection()?;
            initialize_account_schema(&conn)?;
        }

        let storage = Self {
            account: account.to_string(),
            db: Arc::new(db),
        };
        storage.queue().recover_in_flight()?;
        Ok(storage)
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn emails(&self) -> EmailStore {
        EmailStore::new(self.db.clone())
    }

    pub fn events(&self) -> EventStore {
        EventStore::new(self.db.clone())
    }

    pub fn calendars(&self) -> CalendarStore {
        CalendarStore::new(self.db.clone())
    }

    pub fn contacts(&self) -> ContactStore {
        ContactStore::new(self.db.clone())
    }

    pub fn folders(&self) -> FolderStore {
        FolderStore::new(self.db.clone())
    }

    pub fn sync_state(&self) -> SyncStateStore {
        SyncStateStore::new(self.db.clone())
    }

    pub fn queue(&self) -> OfflineQueue {
        OfflineQueue::new(self.db.clone())
    }

    pub fn path(&self) -> Option<&Path> {
        self.db.path()
    }

    pub fn close(&self) -> Result<()> {
        self.db.close()
    }

    pub fn is_closed(&self) -> bool {
        self.db.is_closed()
    }
}

/// Statistics about one account's cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub account: String,
    pub size_bytes: u64,
    pub email_count: usize,
    pub event_count: usize,
    pub contact_count: usize,
    pub pending_actions: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Storage manager - owns one storage handle per account
pub struct StorageManager {
    base_path: PathBuf,
    handles: RwLock<HashMap<String, StorageHandle>>,
}

impl StorageManager {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        info!("Cache directory: {:?}", base_path);

        Self {
            base_path,
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Database file for an account: `<base>/<email>.db` with path
    /// separators and `:` replaced by `_`
    pub fn db_path(&self, account: &str) -> PathBuf {
        self.base_path.join(sanitize_account(account))
    }

    /// Return the open handle for `account`, opening it on first use.
    ///
    /// Concurrent callers for the same account always get the same handle.
    pub fn get_storage(&self, account: &str) -> Result<StorageHandle> {
        if account.trim().is_empty() {
            return Err(CacheError::InvalidInput("empty account".to_string()));
        }

        {
            let handles = self.read_handles()?;
            if let Some(handle) = handles.get(account) {
                return Ok(handle.clone());
            }
        }

        let mut handles = self.write_handles()?;

        // Double-check after acquiring the write lock
        if let Some(handle) = handles.get(account) {
            return Ok(handle.clone());
        }

        let path = self.db_path(account);
        info!("Opening cache for {} at {:?}", account, path);

        let storage = fs::create_dir_all(&self.base_path)
            .map_err(CacheError::from)
            .and_then(|_| AccountStorage::open(account, &path))
            .map_err(|e| CacheError::StorageUnavailable {
                account: account.to_string(),
                message: e.to_string(),
            })?;

        let handle = Arc::new(storage);
        handles.insert(account.to_string(), handle.clone());
        Ok(handle)
    }

    /// Handle for `account` if it is already open
    pub fn get_open(&self, account: &str) -> Option<StorageHandle> {
        self.read_handles()
            .ok()
            .and_then(|handles| handles.get(account).cloned())
    }

    /// Accounts with an open handle
    pub fn open_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .read_handles()
            .map(|handles| handles.keys().cloned().collect())
            .unwrap_or_default();
        accounts.sort();
        accounts
    }

    /// Close one account's handle. Returns false if it was not open.
    pub fn close(&self, account: &str) -> Result<bool> {
        let handle = self.write_handles()?.remove(account);
        match handle {
            Some(handle) => {
                handle.close()?;
                debug!("Closed cache for {}", account);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every open handle. All handles are closed even if some fail.
    pub fn close_all(&self) -> Result<()> {
        let drained: Vec<(String, StorageHandle)> = self.write_handles()?.drain().collect();

        let mut errors = Vec::new();
        for (account, handle) in drained {
            if let Err(e) = handle.close() {
                warn!("Failed to close cache for {}: {}", account, e);
                errors.push(format!("{}: {}", account, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CacheError::Database(format!(
                "Failed to close caches: {}",
                errors.join("; ")
            )))
        }
    }

    /// Close the account's handle and delete its database files
    pub fn clear_cache(&self, account: &str) -> Result<()> {
        self.close(account)?;
        remove_db_files(&self.db_path(account))?;
        info!("Cleared cache for {}", account);
        Ok(())
    }

    /// Close every handle and delete every account database.
    /// Shared databases such as the photo and attachment caches are kept.
    pub fn clear_all(&self) -> Result<()> {
        self.close_all()?;

        let entries = match fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_account_db(&name) {
                remove_db_files(&entry.path())?;
            }
        }

        info!("Cleared all account caches in {:?}", self.base_path);
        Ok(())
    }

    /// Accounts that have a database file on disk, sorted
    pub fn list_cached_accounts(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut accounts = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().to_string();
            if is_account_db(&name) {
                if let Some(account) = name.strip_suffix(".db") {
                    accounts.push(account.to_string());
                }
            }
        }
        accounts.sort();
        Ok(accounts)
    }

    /// Size, record counts and last sync of an account's cache
    pub fn stats(&self, account: &str) -> Result<CacheStats> {
        let storage = self.get_storage(account)?;

        let size_bytes = fs::metadata(self.db_path(account))
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(CacheStats {
            account: account.to_string(),
            size_bytes,
            email_count: storage.emails().count()?,
            event_count: storage.events().count()?,
            contact_count: storage.contacts().count()?,
            pending_actions: storage.queue().len()?,
            last_sync: storage.sync_state().latest()?.map(|s| s.last_sync),
        })
    }

    /// Bytes used by every database file in the cache directory, shared
    /// databases and write-ahead logs included
    pub fn disk_usage(&self) -> Result<u64> {
        let entries = match fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut total = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.contains(".db") {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }

    /// Open a database shared by all accounts, e.g. [`PHOTOS_DB`]
    pub fn open_shared(&self, filename: &str) -> Result<Database> {
        fs::create_dir_all(&self.base_path)?;
        Database::open(self.base_path.join(filename))
    }

    fn read_handles(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, StorageHandle>>> {
        self.handles
            .read()
            .map_err(|_| CacheError::Other("storage manager lock poisoned".to_string()))
    }

    fn write_handles(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, StorageHandle>>> {
        self.handles
            .write()
            .map_err(|_| CacheError::Other("storage manager lock poisoned".to_string()))
    }
}

/// Account email to database file name
pub fn sanitize_account(account: &str) -> String {
    let safe: String = account
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect();
    format!("{}.db", safe)
}

fn is_account_db(name: &str) -> bool {
    name.ends_with(".db") && name != PHOTOS_DB && name != ATTACHMENTS_DB
}

fn remove_db_files(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = fs::remove_file(PathBuf::from(sidecar));
    }
    Ok(())
}
