//! Cache root
//!
//! [`AirCache`] owns the storage manager, the connectivity state, the shared
//! photo and attachment stores and one sync loop per account. Request
//! handlers read through the store accessors and route mutations through
//! [`AirCache::apply`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::sqlite::attachments::{AttachmentStore, ATTACHMENTS_DIR};
use crate::adapters::sqlite::calendars::CalendarStore;
use crate::adapters::sqlite::contacts::ContactStore;
use crate::adapters::sqlite::emails::EmailStore;
use crate::adapters::sqlite::events::EventStore;
use crate::adapters::sqlite::folders::FolderStore;
use crate::adapters::sqlite::offline_queue::OfflineQueue;
use crate::adapters::sqlite::photos::PhotoStore;
use crate::adapters::sqlite::schema::{initialize_attachment_schema, initialize_photo_schema};
use crate::adapters::sqlite::search::{unified_search, UnifiedSearchResult};
use crate::adapters::sqlite::sync_state::SyncStateStore;
use crate::adapters::sqlite::Database;
use crate::backend::RemoteService;
use crate::config::CacheConfig;
use crate::state::connectivity::Connectivity;
use crate::state::storage_manager::{
    CacheStats, StorageHandle, StorageManager, ATTACHMENTS_DB, PHOTOS_DB,
};
use crate::sync::action_queue::{execute_action, write_through, DrainReport, ReplayResult};
use crate::sync::engine::{LoopState, PassReport, SyncLoop, SyncLoopConfig};
use crate::sync::events::{CacheEvent, EventSink};
use crate::types::action::{ActionOutcome, EmailAction, QueuedAction};
use crate::types::error::{CacheError, Result};

/// What one [`AirCache::maintain`] run removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub photos_pruned: usize,
    /// Evicted by the attachment budget
    pub attachments_pruned: usize,
    pub orphaned_files: usize,
    /// Evicted to bring the whole cache under `max_size_mb`
    pub attachments_evicted: usize,
    /// Still over `max_size_mb` after eviction
    pub over_budget: bool,
}

struct RunningLoop {
    state: watch::Receiver<LoopState>,
    handle: JoinHandle<()>,
}

/// Local cache and background sync for every connected account
pub struct AirCache {
    config: CacheConfig,
    storage: Arc<StorageManager>,
    connectivity: Arc<Connectivity>,
    remote: Arc<dyn RemoteService>,
    photo_db: Option<Arc<Database>>,
    attachment_db: Option<Arc<Database>>,
    events: EventSink,
    cancel: CancellationToken,
    loops: Mutex<HashMap<String, RunningLoop>>,
}

impl AirCache {
    /// Build the cache and the receiving end of its notifications.
    ///
    /// Nothing here fails: a photo or attachment database that cannot be
    /// opened only disables that cache, and account databases open lazily.
    pub fn new(
        config: CacheConfig,
        remote: Arc<dyn RemoteService>,
    ) -> (Self, flume::Receiver<CacheEvent>) {
        let (events, rx) = EventSink::channel();
        let storage = Arc::new(StorageManager::new(config.base_path.clone()));
        let connectivity = Arc::new(Connectivity::new(
            storage.clone(),
            remote.clone(),
            events.clone(),
        ));

        let photo_db = if config.settings.enabled {
            match open_photo_db(&storage) {
                Ok(db) => Some(Arc::new(db)),
                Err(e) => {
                    warn!("Photo cache disabled: {}", e);
                    None
                }
            }
        } else {
            info!("Cache disabled by settings");
            None
        };

        let attachment_db =
            if config.settings.enabled && config.settings.attachment_cache_enabled {
                match open_attachment_db(&storage) {
                    Ok(db) => Some(Arc::new(db)),
                    Err(e) => {
                        warn!("Attachment cache disabled: {}", e);
                        None
                    }
                }
            } else {
                None
            };

        let cache = Self {
            config,
            storage,
            connectivity,
            remote,
            photo_db,
            attachment_db,
            events,
            cancel: CancellationToken::new(),
            loops: Mutex::new(HashMap::new()),
        };
        (cache, rx)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn storage_manager(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.connectivity
    }

    /// Storage for `account`, or `None` when caching is off or the
    /// account's database cannot be opened
    pub fn storage(&self, account: &str) -> Option<StorageHandle> {
        if !self.config.settings.enabled {
            return None;
        }
        match self.storage.get_storage(account) {
            Ok(storage) => Some(storage),
            Err(e) => {
                warn!("Cache unavailable for {}: {}", account, e);
                None
            }
        }
    }

    pub fn emails(&self, account: &str) -> Option<EmailStore> {
        self.storage(account).map(|s| s.emails())
    }

    pub fn events(&self, account: &str) -> Option<EventStore> {
        self.storage(account).map(|s| s.events())
    }

    pub fn calendars(&self, account: &str) -> Option<CalendarStore> {
        self.storage(account).map(|s| s.calendars())
    }

    pub fn contacts(&self, account: &str) -> Option<ContactStore> {
        self.storage(account).map(|s| s.contacts())
    }

    pub fn folders(&self, account: &str) -> Option<FolderStore> {
        self.storage(account).map(|s| s.folders())
    }

    pub fn sync_state(&self, account: &str) -> Option<SyncStateStore> {
        self.storage(account).map(|s| s.sync_state())
    }

    pub fn queue(&self, account: &str) -> Option<OfflineQueue> {
        self.storage(account).map(|s| s.queue())
    }

    /// Shared photo cache, `None` when it could not be opened
    pub fn photos(&self) -> Option<PhotoStore> {
        self.photo_db
            .as_ref()
            .map(|db| PhotoStore::new(db.clone(), self.config.settings.photo_ttl()))
    }

    /// Shared attachment cache, `None` when disabled or unavailable
    pub fn attachments(&self) -> Option<AttachmentStore> {
        let db = self.attachment_db.as_ref()?;
        let dir = self.config.base_path.join(ATTACHMENTS_DIR);
        match AttachmentStore::new(
            db.clone(),
            dir,
            self.config.settings.attachment_max_size_bytes(),
        ) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("Attachment cache unavailable: {}", e);
                None
            }
        }
    }

    /// Plain-text search over cached emails, events and contacts of one
    /// account. Operators such as `from:` only apply to
    /// [`EmailStore::search_advanced`].
    pub fn search(
        &self,
        account: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<UnifiedSearchResult>> {
        if !self.config.settings.enabled {
            return Err(CacheError::CacheDisabled);
        }
        let storage = self.storage.get_storage(account)?;
        unified_search(
            &storage.emails(),
            &storage.events(),
            &storage.contacts(),
            query,
            limit,
        )
    }

    /// Queue an action for replay on the next drain
    pub fn enqueue(&self, account: &str, action: &EmailAction) -> Result<QueuedAction> {
        if !self.config.settings.enabled {
            return Err(CacheError::CacheDisabled);
        }
        let queued = self.storage.get_storage(account)?.queue().enqueue(action)?;
        debug!(
            "Queued {} action {} for {}",
            action.type_str(),
            queued.id,
            account
        );
        Ok(queued)
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Record a connectivity change from outside the sync loops
    pub async fn set_online(&self, online: bool) -> Vec<DrainReport> {
        self.connectivity.set_online(online).await
    }

    /// Carry out a mutation for a request handler.
    ///
    /// Online, the remote call is made directly and its result written
    /// through to the cache. If it fails, or the process is offline, the
    /// action is queued and reported as deferred. Only a network failure
    /// marks the process offline. With the offline queue disabled remote
    /// errors are returned as they are.
    ///
    /// While the account has unsettled queued actions, including one a
    /// drain is replaying right now, the new action joins the tail of the
    /// queue and the queue is drained instead.
    pub async fn apply(&self, account: &str, action: EmailAction) -> Result<ActionOutcome> {
        if !self.config.settings.offline_queue_enabled {
            execute_action(self.remote.as_ref(), account, &action).await?;
            self.write_through(account, &action);
            return Ok(ActionOutcome::Applied);
        }

        if !self.connectivity.is_online() {
            debug!("Offline, deferring {} for {}", action.type_str(), account);
            return Ok(ActionOutcome::Deferred(self.enqueue(account, &action)?));
        }

        // No drain may run between the pending check and the direct call
        let drains = self.connectivity.lock_drains().await;

        if let Some(storage) = self.storage_with_pending(account) {
            let queued = self.enqueue(account, &action)?;
            let report = self.connectivity.drain_locked(&drains, &storage).await;
            let replayed = report
                .results
                .iter()
                .any(|r| *r == ReplayResult::Success { id: queued.id });
            return Ok(if replayed {
                ActionOutcome::Applied
            } else {
                ActionOutcome::Deferred(queued)
            });
        }

        let result = execute_action(self.remote.as_ref(), account, &action).await;
        match result {
            Ok(()) => {
                self.write_through(account, &action);
                Ok(ActionOutcome::Applied)
            }
            Err(e) => {
                warn!(
                    "{} for {} failed, deferring: {}",
                    action.type_str(),
                    account,
                    e
                );
                let queued = self.enqueue(account, &action)?;
                drop(drains);
                if e.is_network() {
                    self.connectivity.set_online(false).await;
                }
                Ok(ActionOutcome::Deferred(queued))
            }
        }
    }

    fn storage_with_pending(&self, account: &str) -> Option<StorageHandle> {
        self.storage(account).filter(|s| match s.queue().has_pending() {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Failed to read offline queue for {}: {}", account, e);
                false
            }
        })
    }

    fn write_through(&self, account: &str, action: &EmailAction) {
        if let Some(storage) = self.storage(account) {
            if let Err(e) = write_through(&storage, action) {
                warn!("Write-through for {} failed: {}", account, e);
            }
        }
    }

    /// Start one sync loop per account. Accounts already running are left
    /// alone. All accounts are registered for queue drains even when
    /// background sync is off.
    pub fn start(&self, accounts: &[String]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CacheError::Closed("cache has been stopped".to_string()));
        }

        for account in accounts {
            self.connectivity.register_account(account);
        }

        if !self.config.settings.enabled || !self.config.settings.background_sync_enabled {
            info!("Background sync disabled, not starting sync loops");
            return Ok(());
        }

        let mut loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());
        for account in accounts {
            if loops.contains_key(account) {
                debug!("Sync loop for {} already running", account);
                continue;
            }

            let sync_loop = self.sync_loop(account);
            let state = sync_loop.state();
            let handle = tokio::spawn(sync_loop.run(self.cancel.child_token()));
            loops.insert(account.clone(), RunningLoop { state, handle });
        }

        info!("Started {} sync loops", loops.len());
        Ok(())
    }

    /// Cancel every sync loop, wait for all of them to stop, then close
    /// every database. The cache cannot be started again afterwards.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping cache");
        self.cancel.cancel();

        let running: Vec<(String, RunningLoop)> = self
            .loops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .collect();

        for (account, running) in running {
            if let Err(e) = running.handle.await {
                warn!("Sync loop for {} ended abnormally: {}", account, e);
            }
        }

        self.storage.close_all()?;
        for db in self.photo_db.iter().chain(self.attachment_db.iter()) {
            db.close()?;
        }
        info!("Cache stopped");
        Ok(())
    }

    /// Current state of an account's sync loop
    pub fn loop_state(&self, account: &str) -> Option<LoopState> {
        self.loops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(account)
            .map(|running| *running.state.borrow())
    }

    /// Run one sync pass for `account` now, outside its loop
    pub async fn sync_now(&self, account: &str) -> Result<PassReport> {
        if !self.config.settings.enabled {
            return Err(CacheError::CacheDisabled);
        }
        Ok(self.sync_loop(account).run_pass().await)
    }

    fn sync_loop(&self, account: &str) -> SyncLoop {
        SyncLoop::new(
            account,
            self.storage.clone(),
            self.remote.clone(),
            self.connectivity.clone(),
            self.events.clone(),
            SyncLoopConfig::from_settings(&self.config.settings),
        )
    }

    /// Delete an account's database and its cached attachments
    pub fn clear_cache(&self, account: &str) -> Result<()> {
        if let Some(attachments) = self.attachments() {
            if let Err(e) = attachments.delete_account(account) {
                warn!("Failed to clear attachments of {}: {}", account, e);
            }
        }
        self.storage.clear_cache(account)
    }

    pub fn stats(&self, account: &str) -> Result<CacheStats> {
        if !self.config.settings.enabled {
            return Err(CacheError::CacheDisabled);
        }
        self.storage.stats(account)
    }

    /// Delete expired photos
    pub fn prune_photos(&self) -> Result<usize> {
        match self.photos() {
            Some(photos) => photos.prune(),
            None => Ok(0),
        }
    }

    /// Housekeeping: expire photos, keep attachments within their budget,
    /// drop unreferenced attachment files, then enforce `max_size_mb`.
    ///
    /// Only attachments are evicted for the overall budget. Account
    /// databases are never truncated; if they alone exceed it the report
    /// says so.
    pub fn maintain(&self) -> Result<MaintenanceReport> {
        if !self.config.settings.enabled {
            return Err(CacheError::CacheDisabled);
        }

        let mut report = MaintenanceReport {
            photos_pruned: self.prune_photos()?,
            ..Default::default()
        };

        let attachments = self.attachments();
        if let Some(attachments) = &attachments {
            report.attachments_pruned = attachments.prune()?;
            report.orphaned_files = attachments.remove_orphaned()?;
        }

        let max_size = self.config.settings.max_size_bytes();
        let attachment_bytes = match &attachments {
            Some(attachments) => attachments.total_size()?,
            None => 0,
        };
        let used = self.storage.disk_usage()? + attachment_bytes;
        if used > max_size {
            if let Some(attachments) = &attachments {
                report.attachments_evicted = attachments.lru_evict(used - max_size)?;
            }
            let remaining = match &attachments {
                Some(attachments) => self.storage.disk_usage()? + attachments.total_size()?,
                None => self.storage.disk_usage()?,
            };
            report.over_budget = remaining > max_size;
            if report.over_budget {
                warn!(
                    "Cache uses {} bytes, over its {} byte budget",
                    remaining, max_size
                );
            }
        }

        debug!("Maintenance: {:?}", report);
        Ok(report)
    }
}

fn open_attachment_db(storage: &StorageManager) -> Result<Database> {
    let db = storage.open_shared(ATTACHMENTS_DB)?;
    {
        let conn = db.connection()?;
        initialize_attachment_schema(&conn)?;
    }
    Ok(db)
}

fn open_photo_db(storage: &StorageManager) -> Result<Database> {
    let db = storage.open_shared(PHOTOS_DB)?;
    {
        let conn = db.connection()?;
        initialize_photo_schema(&conn)?;
    }
    Ok(db)
}
