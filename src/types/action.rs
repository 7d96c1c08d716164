//! Offline mutations
//!
//! Every mutation a handler can defer is one [`EmailAction`] variant with its
//! own typed payload. The whole enum is serialized once at enqueue time and
//! decoded when the queue row is read back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Replays allowed before a queued action is abandoned
pub const MAX_ATTEMPTS: u32 = 3;

/// Types of actions that can be queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmailAction {
    MarkRead { email_id: String },
    MarkUnread { email_id: String },
    Star { email_id: String },
    Unstar { email_id: String },
    Delete { email_id: String },
    Move { email_id: String, folder_id: String },
}

impl EmailAction {
    /// Get the action type string for database storage
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::MarkRead { .. } => "mark_read",
            Self::MarkUnread { .. } => "mark_unread",
            Self::Star { .. } => "star",
            Self::Unstar { .. } => "unstar",
            Self::Delete { .. } => "delete",
            Self::Move { .. } => "move",
        }
    }

    /// The email this action targets
    pub fn resource_id(&self) -> &str {
        match self {
            Self::MarkRead { email_id }
            | Self::MarkUnread { email_id }
            | Self::Star { email_id }
            | Self::Unstar { email_id }
            | Self::Delete { email_id }
            | Self::Move { email_id, .. } => email_id,
        }
    }
}

/// A queued action with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    /// Queue position, strictly increasing per account
    pub id: i64,
    pub action: EmailAction,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// What happened to an action after a failed replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back at its original position, to be retried on the next drain
    Requeued { attempts: u32 },
    /// Retry bound reached; the row is gone
    Abandoned,
}

/// Result of a handler-side mutation
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Remote accepted the change and the cache was updated
    Applied,
    /// Change was queued for replay
    Deferred(QueuedAction),
}
