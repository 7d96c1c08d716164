//! Online/offline state and the queue drain it triggers
//!
//! The flag sits behind a reader/writer lock that is only ever held for the
//! read or the flip itself. An offline to online flip drains the queue of
//! every known account.
//!
//! Drains are serialized through one lock, which [`AirCache::apply`] also
//! takes before a direct remote call, so a new action never reaches the
//! remote service ahead of an older queued one.
//!
//! [`AirCache::apply`]: crate::AirCache::apply

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backend::RemoteService;
use crate::state::storage_manager::{AccountStorage, StorageManager};
use crate::sync::action_queue::{drain_account, DrainReport};
use crate::sync::events::{CacheEvent, EventSink};

/// Held while draining, or while a mutation bypasses the queue
pub struct DrainGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

pub struct Connectivity {
    online: RwLock<bool>,
    drain_lock: Mutex<()>,
    accounts: RwLock<BTreeSet<String>>,
    storage: Arc<StorageManager>,
    remote: Arc<dyn RemoteService>,
    events: EventSink,
}

impl Connectivity {
    /// Starts online
    pub fn new(
        storage: Arc<StorageManager>,
        remote: Arc<dyn RemoteService>,
        events: EventSink,
    ) -> Self {
        Self {
            online: RwLock::new(true),
            drain_lock: Mutex::new(()),
            accounts: RwLock::new(BTreeSet::new()),
            storage,
            remote,
            events,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Record connectivity. Going from offline to online drains every
    /// account's queue before returning; the reports are returned.
    pub async fn set_online(&self, online: bool) -> Vec<DrainReport> {
        let was_online = {
            let mut guard = self.online.write().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *guard, online)
        };

        if was_online == online {
            return Vec::new();
        }

        if online {
            info!("Back online");
        } else {
            warn!("Gone offline");
        }
        self.events.emit(CacheEvent::OnlineChanged { online });

        if online {
            self.drain_all().await
        } else {
            Vec::new()
        }
    }

    /// Include an account in future drains even if its storage is not open yet
    pub fn register_account(&self, account: &str) {
        self.accounts
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(account.to_string());
    }

    /// Registered accounts plus every account with open storage
    pub fn known_accounts(&self) -> Vec<String> {
        let mut accounts = self
            .accounts
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        accounts.extend(self.storage.open_accounts());
        accounts.into_iter().collect()
    }

    /// Drain every account with pending actions, one account at a time.
    ///
    /// A failure in one account's drain never prevents the others from
    /// draining.
    pub async fn drain_all(&self) -> Vec<DrainReport> {
        let guard = self.lock_drains().await;

        let mut reports = Vec::new();
        for account in self.known_accounts() {
            let storage = match self.storage.get_storage(&account) {
                Ok(storage) => storage,
                Err(e) => {
                    warn!("Skipping queue drain for {}: {}", account, e);
                    continue;
                }
            };

            match storage.queue().has_pending() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("Skipping queue drain for {}: {}", account, e);
                    continue;
                }
            }

            debug!("Draining offline queue for {}", account);
            reports.push(self.drain_locked(&guard, &storage).await);
        }
        reports
    }

    /// Drain a single account
    pub async fn drain_account(&self, account: &str) -> crate::types::error::Result<DrainReport> {
        let guard = self.lock_drains().await;
        let storage = self.storage.get_storage(account)?;
        Ok(self.drain_locked(&guard, &storage).await)
    }

    /// Wait until no drain is running and keep others from starting
    pub async fn lock_drains(&self) -> DrainGuard<'_> {
        DrainGuard {
            _guard: self.drain_lock.lock().await,
        }
    }

    /// Drain one account under a held [`DrainGuard`].
    ///
    /// An action still claimed by a drain that was dropped mid-replay goes
    /// back to the head of the queue first and is replayed again.
    pub async fn drain_locked(
        &self,
        _guard: &DrainGuard<'_>,
        storage: &AccountStorage,
    ) -> DrainReport {
        if let Err(e) = storage.queue().recover_in_flight() {
            warn!(
                "Failed to recover interrupted actions for {}: {}",
                storage.account(),
                e
            );
        }
        drain_account(storage, self.remote.as_ref(), &self.events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        Calendar, Contact, Event, Folder, ListParams, Message, MessageUpdate, RemoteError,
    };
    use crate::sync::action_queue::ReplayResult;
    use crate::types::action::EmailAction;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    /// Fails every mutation whose message id is listed in `failing`
    #[derive(Default)]
    struct FakeRemote {
        failing: Vec<String>,
        calls: StdMutex<Vec<(String, String)>>,
    }

    impl FakeRemote {
        fn respond(&self, account: &str, message_id: &str) -> Result<(), RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push((account.to_string(), message_id.to_string()));
            if self.failing.iter().any(|id| id == message_id) {
                Err(RemoteError::Network("unreachable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RemoteService for FakeRemote {
        async fn list_messages(
            &self,
            _account: &str,
            _params: &ListParams,
        ) -> Result<Vec<Message>, RemoteError> {
            Ok(Vec::new())
        }

        async fn list_folders(&self, _account: &str) -> Result<Vec<Folder>, RemoteError> {
            Ok(Vec::new())
        }

        async fn list_calendars(&self, _account: &str) -> Result<Vec<Calendar>, RemoteError> {
            Ok(Vec::new())
        }

        async fn list_events(
            &self,
            _account: &str,
            _calendar_id: &str,
            _params: &ListParams,
        ) -> Result<Vec<Event>, RemoteError> {
            Ok(Vec::new())
        }

        async fn list_contacts(
            &self,
            _account: &str,
            _params: &ListParams,
        ) -> Result<Vec<Contact>, RemoteError> {
            Ok(Vec::new())
        }

        async fn update_message(
            &self,
            account: &str,
            message_id: &str,
            _update: &MessageUpdate,
        ) -> Result<(), RemoteError> {
            self.respond(account, message_id)
        }

        async fn delete_message(&self, account: &str, message_id: &str) -> Result<(), RemoteError> {
            self.respond(account, message_id)
        }
    }

    fn star(id: &str) -> EmailAction {
        EmailAction::Star {
            email_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_repeated_state_is_not_a_transition() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageManager::new(dir.path()));
        let (events, rx) = EventSink::channel();
        let connectivity = Connectivity::new(storage, Arc::new(FakeRemote::default()), events);

        assert!(connectivity.is_online());
        assert!(connectivity.set_online(true).await.is_empty());
        assert!(rx.is_empty());

        connectivity.set_online(false).await;
        connectivity.set_online(false).await;
        assert!(!connectivity.is_online());
        assert_eq!(
            rx.drain().collect::<Vec<_>>(),
            vec![CacheEvent::OnlineChanged { online: false }]
        );
    }

    #[tokio::test]
    async fn test_reconnect_drains_each_account_independently() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageManager::new(dir.path()));
        let remote = Arc::new(FakeRemote {
            failing: vec!["a1".to_string()],
            ..Default::default()
        });
        let connectivity =
            Connectivity::new(storage.clone(), remote.clone(), EventSink::disabled());

        let a = storage.get_storage("a@x.com").unwrap();
        let b = storage.get_storage("b@x.com").unwrap();
        a.queue().enqueue(&star("a1")).unwrap();
        a.queue().enqueue(&star("a2")).unwrap();
        b.queue().enqueue(&star("b1")).unwrap();

        connectivity.set_online(false).await;
        let reports = connectivity.set_online(true).await;
        assert_eq!(reports.len(), 2);

        assert_eq!(reports[0].account, "a@x.com");
        assert!(reports[0].stopped_on_failure());
        assert_eq!(reports[0].replayed(), 0);
        assert_eq!(reports[1].account, "b@x.com");
        assert_eq!(reports[1].replayed(), 1);

        // a2 waits behind the failed a1
        let pending: Vec<String> = a
            .queue()
            .list()
            .unwrap()
            .into_iter()
            .map(|q| q.resource_id)
            .collect();
        assert_eq!(pending, vec!["a1".to_string(), "a2".to_string()]);
        assert!(b.queue().is_empty().unwrap());

        let calls = remote.calls.lock().unwrap().clone();
        assert!(!calls.iter().any(|(_, id)| id == "a2"));

        // A drain failure does not change connectivity
        assert!(connectivity.is_online());
    }

    #[tokio::test]
    async fn test_registered_account_is_drained_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageManager::new(dir.path()));
        let connectivity = Connectivity::new(
            storage.clone(),
            Arc::new(FakeRemote::default()),
            EventSink::disabled(),
        );

        storage
            .get_storage("a@x.com")
            .unwrap()
            .queue()
            .enqueue(&star("m1"))
            .unwrap();
        storage.close("a@x.com").unwrap();
        connectivity.register_account("a@x.com");
        assert_eq!(connectivity.known_accounts(), vec!["a@x.com".to_string()]);

        connectivity.set_online(false).await;
        let reports = connectivity.set_online(true).await;
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports[0].results.as_slice(),
            [ReplayResult::Success { .. }]
        ));
    }

    #[tokio::test]
    async fn test_drain_replays_action_claimed_by_interrupted_drain() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageManager::new(dir.path()));
        let remote = Arc::new(FakeRemote::default());
        let connectivity =
            Connectivity::new(storage.clone(), remote.clone(), EventSink::disabled());

        let a = storage.get_storage("a@x.com").unwrap();
        a.queue().enqueue(&star("m1")).unwrap();
        a.queue().enqueue(&star("m2")).unwrap();
        // Claimed by a drain that never settled it
        a.queue().dequeue().unwrap().unwrap();
        assert!(a.queue().has_pending().unwrap());

        let report = connectivity.drain_account("a@x.com").await.unwrap();
        assert_eq!(report.replayed(), 2);
        assert!(a.queue().is_empty().unwrap());

        let order: Vec<String> = remote
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect();
        assert_eq!(order, vec!["m1".to_string(), "m2".to_string()]);
    }
}
