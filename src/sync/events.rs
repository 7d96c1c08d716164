use flume::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Capacity of the notification channel; events beyond it are dropped
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notification emitted by the cache for the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheEvent {
    OnlineChanged { online: bool },
    SyncStarted { account: String },
    SyncCompleted { account: String, failed: Vec<String> },
    QueueDrained { account: String, replayed: usize, remaining: usize },
    ActionAbandoned { account: String, action_id: i64, error: String },
}

/// Non-blocking sender half. A full or disconnected channel never stalls
/// the sync loop or the drain.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<CacheEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, Receiver<CacheEvent>) {
        let (tx, rx) = flume::bounded(EVENT_CHANNEL_CAPACITY);
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: CacheEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => debug!("Event channel full, dropping {:?}", event),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
