//! Background sync loop
//!
//! One loop per account. A loop runs an immediate pass when it starts, then
//! one pass per interval until its cancellation token fires. A pass pulls, in
//! order, emails, folders, calendars with their events, and contacts into the
//! account's stores.
//!
//! The email pull doubles as the connectivity check: a network failure there
//! marks the process offline and ends the pass. A pass in which any pull
//! reached the remote service marks it online again once every pull is done;
//! that transition drains the offline queues.
//!
//! The first email pull of an account only asks for the last
//! `initial_sync_days` of mail.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Calendar, ListParams, RemoteService};
use crate::config::{CacheSettings, MIN_SYNC_INTERVAL};
use crate::state::connectivity::Connectivity;
use crate::state::storage_manager::{AccountStorage, StorageManager};
use crate::sync::events::{CacheEvent, EventSink};
use crate::types::error::{CacheError, Result};
use crate::types::{
    resource, CachedCalendar, CachedContact, CachedEmail, CachedEvent, CachedFolder, SyncState,
};

/// Lifecycle of a sync loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Running the first pass
    Starting,
    /// Waiting on the interval between passes
    Running,
    Stopped,
}

/// Result of one resource pull within a pass
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PullOutcome {
    /// Number of records written
    Pulled(usize),
    Failed(String),
    #[default]
    Skipped,
}

impl PullOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, PullOutcome::Failed(_))
    }
}

/// What one sync pass did
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PassReport {
    pub account: String,
    pub emails: PullOutcome,
    pub folders: PullOutcome,
    pub calendars: PullOutcome,
    pub events: PullOutcome,
    pub contacts: PullOutcome,
    /// The email pull hit a network failure and the rest of the pass was skipped
    pub went_offline: bool,
    /// Storage for the account could not be opened; nothing was pulled
    pub storage_error: Option<String>,
}

impl PassReport {
    fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            ..Default::default()
        }
    }

    /// Resource names whose pull failed
    pub fn failed(&self) -> Vec<String> {
        [
            (resource::EMAILS, &self.emails),
            (resource::FOLDERS, &self.folders),
            (resource::CALENDARS, &self.calendars),
            (resource::EVENTS, &self.events),
            (resource::CONTACTS, &self.contacts),
        ]
        .into_iter()
        .filter(|(_, outcome)| outcome.is_failed())
        .map(|(name, _)| name.to_string())
        .collect()
    }
}

/// Timing and paging of a sync loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLoopConfig {
    pub interval: Duration,
    pub email_page_size: usize,
    /// How far back the first email pull of an account reaches
    pub initial_sync: Duration,
}

impl Default for SyncLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            email_page_size: 100,
            initial_sync: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl SyncLoopConfig {
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            interval: settings.sync_interval(),
            email_page_size: settings.email_page_size,
            initial_sync: settings.initial_sync(),
        }
    }

    /// Lower bound for the first email pull, `None` if out of range
    fn initial_since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.initial_sync)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
    }

    /// Interval actually waited between passes
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(MIN_SYNC_INTERVAL)
    }
}

/// Periodic pull of one account's data
pub struct SyncLoop {
    account: String,
    storage: Arc<StorageManager>,
    remote: Arc<dyn RemoteService>,
    connectivity: Arc<Connectivity>,
    events: EventSink,
    config: SyncLoopConfig,
    state_tx: watch::Sender<LoopState>,
}

impl SyncLoop {
    pub fn new(
        account: &str,
        storage: Arc<StorageManager>,
        remote: Arc<dyn RemoteService>,
        connectivity: Arc<Connectivity>,
        events: EventSink,
        config: SyncLoopConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Starting);
        Self {
            account: account.to_string(),
            storage,
            remote,
            connectivity,
            events,
            config,
            state_tx,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Subscribe to state changes
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: LoopState) {
        self.state_tx.send_replace(state);
    }

    /// Run until `cancel` fires. A pass in progress is abandoned at its next
    /// await point when cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.config.effective_interval();
        info!(
            "Starting sync loop for {} (interval: {}s)",
            self.account,
            interval.as_secs()
        );
        self.set_state(LoopState::Starting);

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            report = self.run_pass() => Some(report),
        };

        if first.is_some() {
            self.set_state(LoopState::Running);

            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let pass = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    report = self.run_pass() => Some(report),
                };
                if pass.is_none() {
                    break;
                }
            }
        }

        self.set_state(LoopState::Stopped);
        info!("Sync loop for {} stopped", self.account);
    }

    /// Pull every resource once
    pub async fn run_pass(&self) -> PassReport {
        let mut report = PassReport::new(&self.account);

        let storage = match self.storage.get_storage(&self.account) {
            Ok(storage) => storage,
            Err(e) => {
                warn!("Cache unavailable for {}, skipping sync: {}", self.account, e);
                report.storage_error = Some(e.to_string());
                return report;
            }
        };

        debug!("Sync pass for {}", self.account);
        self.events.emit(CacheEvent::SyncStarted {
            account: self.account.clone(),
        });

        let emails = self.pull_emails(&storage).await;
        let mut reachable = reached_remote(&emails);
        match emails {
            Ok(count) => report.emails = PullOutcome::Pulled(count),
            Err(e) if is_network_error(&e) => {
                warn!("Email pull for {} failed, going offline: {}", self.account, e);
                self.connectivity.set_online(false).await;
                report.emails = PullOutcome::Failed(e.to_string());
                report.went_offline = true;
                self.finish(&report);
                return report;
            }
            Err(e) => {
                warn!("Email pull for {} failed: {}", self.account, e);
                report.emails = PullOutcome::Failed(e.to_string());
            }
        }

        let folders = self.pull_folders(&storage).await;
        reachable |= reached_remote(&folders);
        report.folders = outcome(&self.account, resource::FOLDERS, folders);

        let calendars = self.pull_calendars(&storage).await;
        reachable |= reached_remote(&calendars);
        match calendars {
            Ok(calendars) => {
                report.calendars = PullOutcome::Pulled(calendars.len());
                report.events = self.pull_events(&storage, &calendars).await;
            }
            Err(e) => {
                warn!("Calendar pull for {} failed: {}", self.account, e);
                report.calendars = PullOutcome::Failed(e.to_string());
            }
        }

        let contacts = self.pull_contacts(&storage).await;
        reachable |= reached_remote(&contacts);
        report.contacts = outcome(&self.account, resource::CONTACTS, contacts);

        // Once per pass, after every pull
        if reachable {
            self.connectivity.set_online(true).await;
        }

        self.finish(&report);
        report
    }

    fn finish(&self, report: &PassReport) {
        let failed = report.failed();
        if failed.is_empty() {
            debug!("Sync pass for {} complete", self.account);
        } else {
            info!("Sync pass for {} finished with failures: {:?}", self.account, failed);
        }
        self.events.emit(CacheEvent::SyncCompleted {
            account: self.account.clone(),
            failed,
        });
    }

    fn record_sync(&self, storage: &AccountStorage, resource: &str) -> Result<()> {
        storage.sync_state().set(&SyncState::new(resource, Utc::now()))
    }

    async fn pull_emails(&self, storage: &AccountStorage) -> Result<usize> {
        let mut params = ListParams::with_limit(self.config.email_page_size);
        if matches!(storage.sync_state().get(resource::EMAILS), Ok(None)) {
            params.since = self.config.initial_since(Utc::now());
            debug!("First email pull for {} since {:?}", self.account, params.since);
        }
        let messages = self.remote.list_messages(&self.account, &params).await?;

        let emails: Vec<CachedEmail> = messages.iter().map(CachedEmail::from).collect();
        let stored = storage.emails().put_batch(&emails)?;
        self.record_sync(storage, resource::EMAILS)?;
        Ok(stored)
    }

    async fn pull_folders(&self, storage: &AccountStorage) -> Result<usize> {
        let folders = self.remote.list_folders(&self.account).await?;

        let folders: Vec<CachedFolder> = folders.iter().map(CachedFolder::from).collect();
        let stored = storage.folders().put_batch(&folders)?;
        self.record_sync(storage, resource::FOLDERS)?;
        Ok(stored)
    }

    async fn pull_calendars(&self, storage: &AccountStorage) -> Result<Vec<Calendar>> {
        let calendars = self.remote.list_calendars(&self.account).await?;

        let cached: Vec<CachedCalendar> = calendars.iter().map(CachedCalendar::from).collect();
        storage.calendars().put_batch(&cached)?;
        self.record_sync(storage, resource::CALENDARS)?;
        Ok(calendars)
    }

    /// Events of every calendar. One calendar failing does not stop the
    /// others, but the events pull as a whole is reported failed.
    async fn pull_events(&self, storage: &AccountStorage, calendars: &[Calendar]) -> PullOutcome {
        let mut stored = 0;
        let mut failed = Vec::new();

        for calendar in calendars {
            let events = match self
                .remote
                .list_events(&self.account, &calendar.id, &ListParams::default())
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(
                        "Event pull for calendar {} of {} failed: {}",
                        calendar.id, self.account, e
                    );
                    failed.push(calendar.id.clone());
                    continue;
                }
            };

            let cached: Vec<CachedEvent> = events
                .iter()
                .map(|event| CachedEvent {
                    calendar_id: calendar.id.clone(),
                    ..CachedEvent::from(event)
                })
                .collect();
            match storage.events().put_batch(&cached) {
                Ok(count) => stored += count,
                Err(e) => {
                    warn!("Failed to store events of calendar {}: {}", calendar.id, e);
                    failed.push(calendar.id.clone());
                }
            }
        }

        if !failed.is_empty() {
            return PullOutcome::Failed(format!("calendars failed: {}", failed.join(", ")));
        }
        if let Err(e) = self.record_sync(storage, resource::EVENTS) {
            return PullOutcome::Failed(e.to_string());
        }
        PullOutcome::Pulled(stored)
    }

    async fn pull_contacts(&self, storage: &AccountStorage) -> Result<usize> {
        let contacts = self
            .remote
            .list_contacts(&self.account, &ListParams::default())
            .await?;

        let contacts: Vec<CachedContact> = contacts.iter().map(CachedContact::from).collect();
        let stored = storage.contacts().put_batch(&contacts)?;
        self.record_sync(storage, resource::CONTACTS)?;
        Ok(stored)
    }
}

/// A pull reached the remote service unless the remote call itself failed
fn reached_remote<T>(result: &Result<T>) -> bool {
    !matches!(result, Err(CacheError::Remote(_)))
}

fn is_network_error(error: &CacheError) -> bool {
    matches!(error, CacheError::Remote(remote) if remote.is_network())
}

fn outcome(account: &str, resource: &str, result: Result<usize>) -> PullOutcome {
    match result {
        Ok(count) => PullOutcome::Pulled(count),
        Err(e) => {
            warn!("{} pull for {} failed: {}", resource, account, e);
            PullOutcome::Failed(e.to_string())
        }
    }
}
