//! Offline action replay
//!
//! Replays an account's queued actions against the remote service in FIFO
//! order, one at a time. The first failure ends the drain for that account so
//! a later action never overtakes an earlier one. Each success is written
//! through to the cached email.

use tracing::{debug, error, info, warn};

use crate::backend::{MessageUpdate, RemoteError, RemoteService};
use crate::state::storage_manager::AccountStorage;
use crate::sync::events::{CacheEvent, EventSink};
use crate::types::action::{EmailAction, FailureOutcome};
use crate::types::error::Result;

/// Result of replaying one action
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayResult {
    /// Action completed and was removed from the queue
    Success { id: i64 },
    /// Action failed but stays at the head for the next drain
    Retry { id: i64, error: String },
    /// Action failed for the last time and was dropped
    Discard { id: i64, error: String },
}

/// Outcome of draining one account's queue
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DrainReport {
    pub account: String,
    pub results: Vec<ReplayResult>,
    /// Set when the queue itself could not be read or updated
    pub storage_error: Option<String>,
}

impl DrainReport {
    pub fn replayed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, ReplayResult::Success { .. }))
            .count()
    }

    /// Whether the drain ended on a replay failure
    pub fn stopped_on_failure(&self) -> bool {
        matches!(
            self.results.last(),
            Some(ReplayResult::Retry { .. } | ReplayResult::Discard { .. })
        )
    }
}

/// Replay queued actions for one account until the queue is empty or an
/// action fails.
pub async fn drain_account(
    storage: &AccountStorage,
    remote: &dyn RemoteService,
    events: &EventSink,
) -> DrainReport {
    let account = storage.account();
    let queue = storage.queue();
    let mut report = DrainReport {
        account: account.to_string(),
        ..Default::default()
    };

    loop {
        let queued = match queue.dequeue() {
            Ok(Some(queued)) => queued,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read offline queue for {}: {}", account, e);
                report.storage_error = Some(e.to_string());
                break;
            }
        };

        let id = queued.id;
        debug!(
            "Replaying {} action {} for {}",
            queued.action.type_str(),
            id,
            account
        );

        match execute_action(remote, account, &queued.action).await {
            Ok(()) => {
                if let Err(e) = queue.complete(id) {
                    error!("Failed to remove replayed action {}: {}", id, e);
                    report.storage_error = Some(e.to_string());
                    break;
                }
                if let Err(e) = write_through(storage, &queued.action) {
                    warn!("Write-through after replay of action {} failed: {}", id, e);
                }
                report.results.push(ReplayResult::Success { id });
            }
            Err(remote_err) => {
                let message = remote_err.to_string();
                warn!("Action {} for {} failed: {}", id, account, message);

                match queue.mark_failed(id, &message) {
                    Ok(FailureOutcome::Requeued { .. }) => {
                        report.results.push(ReplayResult::Retry { id, error: message });
                    }
                    Ok(FailureOutcome::Abandoned) => {
                        events.emit(CacheEvent::ActionAbandoned {
                            account: account.to_string(),
                            action_id: id,
                            error: message.clone(),
                        });
                        report.results.push(ReplayResult::Discard { id, error: message });
                    }
                    Err(e) => {
                        error!("Failed to mark action {} as failed: {}", id, e);
                        report.storage_error = Some(e.to_string());
                    }
                }
                break;
            }
        }
    }

    let replayed = report.replayed();
    if !report.results.is_empty() {
        let remaining = queue.len().unwrap_or(0);
        info!(
            "Drained {} actions for {} ({} remaining)",
            replayed, account, remaining
        );
        events.emit(CacheEvent::QueueDrained {
            account: account.to_string(),
            replayed,
            remaining,
        });
    }

    report
}

/// The remote call that carries out one action
pub async fn execute_action(
    remote: &dyn RemoteService,
    account: &str,
    action: &EmailAction,
) -> std::result::Result<(), RemoteError> {
    match action {
        EmailAction::Delete { email_id } => remote.delete_message(account, email_id).await,
        other => {
            remote
                .update_message(account, other.resource_id(), &message_update(other))
                .await
        }
    }
}

/// Remote patch for a non-delete action
pub fn message_update(action: &EmailAction) -> MessageUpdate {
    match action {
        EmailAction::MarkRead { .. } => MessageUpdate {
            unread: Some(false),
            ..Default::default()
        },
        EmailAction::MarkUnread { .. } => MessageUpdate {
            unread: Some(true),
            ..Default::default()
        },
        EmailAction::Star { .. } => MessageUpdate {
            starred: Some(true),
            ..Default::default()
        },
        EmailAction::Unstar { .. } => MessageUpdate {
            starred: Some(false),
            ..Default::default()
        },
        EmailAction::Move { folder_id, .. } => MessageUpdate {
            folders: Some(vec![folder_id.clone()]),
            ..Default::default()
        },
        EmailAction::Delete { .. } => MessageUpdate::default(),
    }
}

/// Mirror a remote-confirmed action into the cached email.
/// A message that is not cached is left alone.
pub fn write_through(storage: &AccountStorage, action: &EmailAction) -> Result<()> {
    let emails = storage.emails();
    match action {
        EmailAction::MarkRead { email_id } => {
            emails.update_flags(email_id, Some(false), None)?;
        }
        EmailAction::MarkUnread { email_id } => {
            emails.update_flags(email_id, Some(true), None)?;
        }
        EmailAction::Star { email_id } => {
            emails.update_flags(email_id, None, Some(true))?;
        }
        EmailAction::Unstar { email_id } => {
            emails.update_flags(email_id, None, Some(false))?;
        }
        EmailAction::Delete { email_id } => {
            emails.delete(email_id)?;
        }
        EmailAction::Move {
            email_id,
            folder_id,
        } => {
            emails.move_to_folder(email_id, folder_id)?;
        }
    }
    Ok(())
}
