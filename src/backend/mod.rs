//! Remote service boundary
//!
//! The cache never talks to the network itself. Everything it pulls or
//! replays goes through a [`RemoteService`] implementation supplied by the
//! host application.

pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use types::{Calendar, Contact, Event, Folder, ListParams, Message, MessageUpdate, Participant};

/// Failure reported by the remote service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    /// Whether the failure means the service is unreachable, as opposed to
    /// the service rejecting the request
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout)
    }
}

/// Operations the cache consumes from the remote mail/calendar/contacts API.
///
/// `account` is the account email address. Implementations are expected to be
/// safe to retry: a replayed mutation may already have been applied.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Most recent messages first
    async fn list_messages(
        &self,
        account: &str,
        params: &ListParams,
    ) -> Result<Vec<Message>, RemoteError>;

    async fn list_folders(&self, account: &str) -> Result<Vec<Folder>, RemoteError>;

    async fn list_calendars(&self, account: &str) -> Result<Vec<Calendar>, RemoteError>;

    async fn list_events(
        &self,
        account: &str,
        calendar_id: &str,
        params: &ListParams,
    ) -> Result<Vec<Event>, RemoteError>;

    async fn list_contacts(
        &self,
        account: &str,
        params: &ListParams,
    ) -> Result<Vec<Contact>, RemoteError>;

    async fn update_message(
        &self,
        account: &str,
        message_id: &str,
        update: &MessageUpdate,
    ) -> Result<(), RemoteError>;

    async fn delete_message(&self, account: &str, message_id: &str) -> Result<(), RemoteError>;
}
