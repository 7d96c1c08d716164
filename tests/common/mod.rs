//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use air_cache::backend::{
    Calendar, Contact, Event, Folder, ListParams, Message, MessageUpdate, Participant,
};
use air_cache::{AirCache, CacheConfig, CacheEvent, CacheSettings, RemoteError, RemoteService};

/// One call received by [`ScriptedRemote`]
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListMessages { account: String, limit: usize },
    ListFolders { account: String },
    ListCalendars { account: String },
    ListEvents { account: String, calendar_id: String },
    ListContacts { account: String },
    Update { account: String, message_id: String, update: MessageUpdate },
    Delete { account: String, message_id: String },
}

impl Call {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Call::Update { message_id, .. } | Call::Delete { message_id, .. } => {
                Some(message_id.as_str())
            }
            _ => None,
        }
    }
}

/// What the fake service returns
#[derive(Default)]
pub struct Script {
    pub messages: Vec<Message>,
    pub folders: Vec<Folder>,
    pub calendars: Vec<Calendar>,
    pub events: HashMap<String, Vec<Event>>,
    pub contacts: Vec<Contact>,
    /// Every call fails with a network error
    pub unreachable: bool,
    /// Contacts pull fails with an API error
    pub contacts_broken: bool,
    /// Errors returned by the next mutations, in order
    pub next_mutation_errors: VecDeque<RemoteError>,
    /// Messages whose mutations always fail with an API error
    pub rejected_messages: HashSet<String>,
    pub calls: Vec<Call>,
}

/// Parks the next mutation of one message until released
#[derive(Default)]
pub struct Hold {
    /// Notified once the mutation is parked
    pub reached: Notify,
    pub release: Notify,
}

/// In-memory remote service driven by a [`Script`]
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<Script>,
    hold: Mutex<Option<(String, Arc<Hold>)>>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.script().unreachable = unreachable;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script().calls.clone()
    }

    /// Message ids of every mutation received, in order
    pub fn mutated_ids(&self) -> Vec<String> {
        self.script()
            .calls
            .iter()
            .filter_map(|c| c.message_id().map(str::to_string))
            .collect()
    }

    /// Park the next mutation of `message_id` before it is recorded
    pub fn hold(&self, message_id: &str) -> Arc<Hold> {
        let hold = Arc::new(Hold::default());
        *self.hold.lock().unwrap() = Some((message_id.to_string(), hold.clone()));
        hold
    }

    async fn pause(&self, message_id: &str) {
        let hold = {
            let mut slot = self.hold.lock().unwrap();
            match slot.as_ref() {
                Some((id, _)) if id == message_id => slot.take().map(|(_, hold)| hold),
                _ => None,
            }
        };
        if let Some(hold) = hold {
            hold.reached.notify_one();
            hold.release.notified().await;
        }
    }

    fn record(&self, call: Call) -> Result<(), RemoteError> {
        let mut script = self.script();
        script.calls.push(call);
        if script.unreachable {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        Ok(())
    }

    fn mutate(&self, call: Call) -> Result<(), RemoteError> {
        let message_id = call.message_id().unwrap_or_default().to_string();
        self.record(call)?;

        let mut script = self.script();
        if let Some(error) = script.next_mutation_errors.pop_front() {
            return Err(error);
        }
        if script.rejected_messages.contains(&message_id) {
            return Err(RemoteError::Api {
                status: 422,
                message: format!("cannot modify {}", message_id),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteService for ScriptedRemote {
    async fn list_messages(
        &self,
        account: &str,
        params: &ListParams,
    ) -> Result<Vec<Message>, RemoteError> {
        self.record(Call::ListMessages {
            account: account.to_string(),
            limit: params.limit,
        })?;
        Ok(self.script().messages.clone())
    }

    async fn list_folders(&self, account: &str) -> Result<Vec<Folder>, RemoteError> {
        self.record(Call::ListFolders {
            account: account.to_string(),
        })?;
        Ok(self.script().folders.clone())
    }

    async fn list_calendars(&self, account: &str) -> Result<Vec<Calendar>, RemoteError> {
        self.record(Call::ListCalendars {
            account: account.to_string(),
        })?;
        Ok(self.script().calendars.clone())
    }

    async fn list_events(
        &self,
        account: &str,
        calendar_id: &str,
        _params: &ListParams,
    ) -> Result<Vec<Event>, RemoteError> {
        self.record(Call::ListEvents {
            account: account.to_string(),
            calendar_id: calendar_id.to_string(),
        })?;
        Ok(self
            .script()
            .events
            .get(calendar_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_contacts(
        &self,
        account: &str,
        _params: &ListParams,
    ) -> Result<Vec<Contact>, RemoteError> {
        self.record(Call::ListContacts {
            account: account.to_string(),
        })?;
        let script = self.script();
        if script.contacts_broken {
            return Err(RemoteError::Api {
                status: 503,
                message: "contacts unavailable".to_string(),
            });
        }
        Ok(script.contacts.clone())
    }

    async fn update_message(
        &self,
        account: &str,
        message_id: &str,
        update: &MessageUpdate,
    ) -> Result<(), RemoteError> {
        self.pause(message_id).await;
        self.mutate(Call::Update {
            account: account.to_string(),
            message_id: message_id.to_string(),
            update: update.clone(),
        })
    }

    async fn delete_message(&self, account: &str, message_id: &str) -> Result<(), RemoteError> {
        self.pause(message_id).await;
        self.mutate(Call::Delete {
            account: account.to_string(),
            message_id: message_id.to_string(),
        })
    }
}

pub fn message(id: &str, folder: &str) -> Message {
    Message {
        id: id.to_string(),
        thread_id: format!("t-{}", id),
        folders: vec![folder.to_string()],
        subject: format!("Subject {}", id),
        from: vec![Participant {
            name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
        }],
        unread: true,
        ..Default::default()
    }
}

/// A remote with one message, folder, calendar, event and contact
pub fn populated_remote() -> Arc<ScriptedRemote> {
    let remote = ScriptedRemote::new();
    {
        let mut script = remote.script();
        script.messages = vec![message("m1", "inbox"), message("m2", "inbox")];
        script.folders = vec![Folder {
            id: "inbox".to_string(),
            name: "Inbox".to_string(),
            system_folder: Some("inbox".to_string()),
            total_count: 2,
            unread_count: 2,
        }];
        script.calendars = vec![Calendar {
            id: "cal-1".to_string(),
            name: "Work".to_string(),
            is_primary: true,
            ..Default::default()
        }];
        script.events.insert(
            "cal-1".to_string(),
            vec![Event {
                id: "e1".to_string(),
                title: "Planning".to_string(),
                ..Default::default()
            }],
        );
        script.contacts = vec![Contact {
            id: "c1".to_string(),
            given_name: "Bob".to_string(),
            surname: "Stone".to_string(),
            emails: vec!["bob@example.com".to_string()],
            ..Default::default()
        }];
    }
    remote
}

pub fn settings() -> CacheSettings {
    CacheSettings {
        sync_interval_minutes: 1,
        ..Default::default()
    }
}

pub fn cache_at(
    base: &Path,
    remote: Arc<ScriptedRemote>,
) -> (AirCache, flume::Receiver<CacheEvent>) {
    AirCache::new(CacheConfig::new(base, settings()), remote)
}
