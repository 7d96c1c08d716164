pub mod action;
pub mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Cached email message
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CachedEmail {
    pub id: String,
    pub thread_id: String,
    pub folder_id: String,
    pub subject: String,
    pub snippet: String,
    pub from_name: String,
    pub from_email: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub date: DateTime<Utc>,
    pub unread: bool,
    pub starred: bool,
    pub has_attachments: bool,
    pub body_html: String,
    pub body_text: String,
    pub cached_at: DateTime<Utc>,
}

/// Cached calendar event
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CachedEvent {
    pub id: String,
    pub calendar_id: String,
    pub title: String,
    pub description: String,
    pub location: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub all_day: bool,
    pub recurring: bool,
    pub rrule: String,
    pub status: String,
    pub busy: bool,
    pub participants: Vec<String>,
    pub cached_at: DateTime<Utc>,
}

/// Cached calendar metadata
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CachedCalendar {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_primary: bool,
    pub read_only: bool,
    pub hex_color: String,
    pub cached_at: DateTime<Utc>,
}

/// Cached contact
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CachedContact {
    pub id: String,
    pub email: String,
    pub given_name: String,
    pub surname: String,
    pub display_name: String,
    pub phone: String,
    pub company: String,
    pub job_title: String,
    pub notes: String,
    pub photo_url: String,
    pub groups: Vec<String>,
    pub cached_at: DateTime<Utc>,
}

/// Cached mail folder
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CachedFolder {
    pub id: String,
    pub name: String,
    /// System folder kind ("inbox", "sent", "trash", ...), empty for user folders
    pub folder_type: String,
    pub total_count: i64,
    pub unread_count: i64,
    pub cached_at: DateTime<Utc>,
}

/// Last successful pull of one resource class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub resource: String,
    pub last_sync: DateTime<Utc>,
    /// Reserved for delta sync; stored but never consumed
    pub cursor: Option<String>,
}

impl SyncState {
    pub fn new(resource: impl Into<String>, last_sync: DateTime<Utc>) -> Self {
        Self {
            resource: resource.into(),
            last_sync,
            cursor: None,
        }
    }
}

/// Photo metadata without the image bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPhoto {
    pub contact_id: String,
    pub content_type: String,
    pub size: i64,
    pub cached_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

/// Metadata of a cached attachment. The bytes live in a content-addressed
/// file shared by every attachment with the same SHA-256.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAttachment {
    pub account: String,
    pub id: String,
    pub email_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    /// Lowercase hex SHA-256 of the content
    pub hash: String,
    pub local_path: PathBuf,
    pub cached_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

/// Resource class names recorded in the sync_state table
pub mod resource {
    pub const EMAILS: &str = "emails";
    pub const FOLDERS: &str = "folders";
    pub const CALENDARS: &str = "calendars";
    pub const EVENTS: &str = "events";
    pub const CONTACTS: &str = "contacts";
}
