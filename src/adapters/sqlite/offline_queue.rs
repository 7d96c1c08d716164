//! Durable FIFO of pending offline mutations
//!
//! Rows are replayed in `id` order. A row is either `queued` or `in_flight`;
//! only the drain claims rows (see [`OfflineQueue::dequeue`]). A failed replay
//! puts the row back in `queued` at the same id, so it stays at the head until
//! it either succeeds or reaches [`MAX_ATTEMPTS`].

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{from_millis, now_millis, Database};
use crate::types::action::{EmailAction, FailureOutcome, QueuedAction, MAX_ATTEMPTS};
use crate::types::error::{CacheError, Result};

const QUEUE_COLUMNS: &str = "id, payload, resource_id, created_at, attempts, last_error";

/// Undecoded queue row
struct QueueRow {
    id: i64,
    payload: String,
    resource_id: String,
    created_at: i64,
    attempts: u32,
    last_error: Option<String>,
}

impl QueueRow {
    fn decode(self) -> std::result::Result<QueuedAction, serde_json::Error> {
        let action: EmailAction = serde_json::from_str(&self.payload)?;
        Ok(QueuedAction {
            id: self.id,
            action,
            resource_id: self.resource_id,
            created_at: from_millis(self.created_at),
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

#[derive(Clone)]
pub struct OfflineQueue {
    db: Arc<Database>,
}

impl OfflineQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an action at the tail of the queue
    pub fn enqueue(&self, action: &EmailAction) -> Result<QueuedAction> {
        let payload = serde_json::to_string(action)?;
        let created_at = now_millis();

        let conn = self.db.connection()?;
        let id: i64 = conn.query_row(
            "INSERT INTO offline_queue (type, resource_id, payload, created_at, attempts, state)
             VALUES (?1, ?2, ?3, ?4, 0, 'queued')
             RETURNING id",
            params![action.type_str(), action.resource_id(), payload, created_at],
            |row| row.get(0),
        )?;

        debug!("Queued {} action {} for {}", action.type_str(), id, action.resource_id());

        Ok(QueuedAction {
            id,
            action: action.clone(),
            resource_id: action.resource_id().to_string(),
            created_at: from_millis(created_at),
            attempts: 0,
            last_error: None,
        })
    }

    /// Claim the head of the queue for replay.
    ///
    /// The claimed row stays in storage as `in_flight` until [`complete`] or
    /// [`mark_failed`] settles it. Rows whose payload no longer decodes are
    /// dropped.
    ///
    /// [`complete`]: OfflineQueue::complete
    /// [`mark_failed`]: OfflineQueue::mark_failed
    pub fn dequeue(&self) -> Result<Option<QueuedAction>> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let claimed = loop {
            let Some(row) = head(&tx)? else {
                break None;
            };
            let id = row.id;
            match row.decode() {
                Ok(action) => {
                    tx.execute(
                        "UPDATE offline_queue SET state = 'in_flight' WHERE id = ?1",
                        params![id],
                    )?;
                    break Some(action);
                }
                Err(e) => {
                    error!("Dropping undecodable queued action {}: {}", id, e);
                    tx.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
                }
            }
        };

        tx.commit()?;
        Ok(claimed)
    }

    /// Record a failed replay.
    ///
    /// Below the retry bound the action returns to its original position.
    /// Reaching the bound deletes it for good.
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<FailureOutcome> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                "SELECT attempts, type, resource_id FROM offline_queue WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((attempts, action_type, resource_id)) = current else {
            return Err(CacheError::InvalidInput(format!(
                "No queued action with id {}",
                id
            )));
        };

        let attempts = attempts + 1;
        let outcome = if attempts >= MAX_ATTEMPTS {
            tx.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
            warn!(
                "Abandoning {} action {} for {} after {} attempts: {}",
                action_type, id, resource_id, attempts, error
            );
            FailureOutcome::Abandoned
        } else {
            tx.execute(
                "UPDATE offline_queue
                 SET attempts = ?2, last_error = ?3, state = 'queued'
                 WHERE id = ?1",
                params![id, attempts, error],
            )?;
            FailureOutcome::Requeued { attempts }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Remove an action after a successful replay
    pub fn complete(&self, id: i64) -> Result<bool> {
        self.remove(id)
    }

    /// Head of the queue without claiming it
    pub fn peek(&self) -> Result<Option<QueuedAction>> {
        let conn = self.db.connection()?;
        loop {
            let Some(row) = head(&conn)? else {
                return Ok(None);
            };
            let id = row.id;
            match row.decode() {
                Ok(action) => return Ok(Some(action)),
                Err(e) => {
                    error!("Dropping undecodable queued action {}: {}", id, e);
                    conn.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
                }
            }
        }
    }

    /// Every action in replay order, including one claimed by a running drain
    pub fn list(&self) -> Result<Vec<QueuedAction>> {
        let conn = self.db.connection()?;
        let sql = format!("SELECT {} FROM offline_queue ORDER BY id", QUEUE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_queue_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match row.decode() {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Skipping undecodable queued action {}: {}", id, e),
            }
        }
        Ok(actions)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Whether any action is still unsettled, including one claimed by a
    /// drain that has not finished with it. A new action must queue behind it.
    pub fn has_pending(&self) -> Result<bool> {
        let conn = self.db.connection()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM offline_queue)",
            [],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn remove(&self, id: i64) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn clear(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let removed = conn.execute("DELETE FROM offline_queue", [])?;
        Ok(removed)
    }

    /// Drop queued actions older than `max_age`
    pub fn remove_stale(&self, max_age: Duration) -> Result<usize> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(max_age_ms);

        let conn = self.db.connection()?;
        let removed = conn.execute(
            "DELETE FROM offline_queue WHERE created_at < ?1 AND state = 'queued'",
            params![cutoff],
        )?;
        if removed > 0 {
            warn!("Removed {} stale queued actions", removed);
        }
        Ok(removed)
    }

    /// Drop every queued action targeting one resource
    pub fn remove_by_resource(&self, resource_id: &str) -> Result<usize> {
        let conn = self.db.connection()?;
        let removed = conn.execute(
            "DELETE FROM offline_queue WHERE resource_id = ?1 AND state = 'queued'",
            params![resource_id],
        )?;
        Ok(removed)
    }

    /// Return actions claimed by an interrupted drain to the queue
    pub fn recover_in_flight(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let recovered = conn.execute(
            "UPDATE offline_queue SET state = 'queued' WHERE state = 'in_flight'",
            [],
        )?;
        if recovered > 0 {
            warn!("Recovered {} in-flight queued actions", recovered);
        }
        Ok(recovered)
    }
}

fn head(conn: &Connection) -> rusqlite::Result<Option<QueueRow>> {
    let sql = format!(
        "SELECT {} FROM offline_queue WHERE state = 'queued' ORDER BY id LIMIT 1",
        QUEUE_COLUMNS
    );
    conn.query_row(&sql, [], row_to_queue_row).optional()
}

fn row_to_queue_row(row: &Row) -> rusqlite::Result<QueueRow> {
    Ok(QueueRow {
        id: row.get(0)?,
        payload: row.get(1)?,
        resource_id: row.get(2)?,
        created_at: row.get(3)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::schema::initialize_account_schema;

    fn queue() -> OfflineQueue {
        let db = Database::in_memory().expect("Failed to create database");
        initialize_account_schema(&db.connection().unwrap()).unwrap();
        OfflineQueue::new(Arc::new(db))
    }

    fn mark_read(id: &str) -> EmailAction {
        EmailAction::MarkRead {
            email_id: id.to_string(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = queue();
        let a1 = queue.enqueue(&mark_read("m1")).unwrap();
        let a2 = queue.enqueue(&EmailAction::Delete {
            email_id: "m2".to_string(),
        })
        .unwrap();
        assert!(a2.id > a1.id);
        assert_eq!(queue.len().unwrap(), 2);

        let first = queue.dequeue().unwrap().unwrap();
        assert_eq!(first.id, a1.id);
        assert_eq!(first.action, mark_read("m1"));
        assert!(queue.complete(first.id).unwrap());

        let second = queue.dequeue().unwrap().unwrap();
        assert_eq!(second.id, a2.id);
        assert_eq!(second.resource_id, "m2");
        queue.complete(second.id).unwrap();

        assert!(queue.dequeue().unwrap().is_none());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_claimed_action_not_visible_as_queued() {
        let queue = queue();
        assert!(!queue.has_pending().unwrap());
        queue.enqueue(&mark_read("m1")).unwrap();

        let claimed = queue.dequeue().unwrap().unwrap();
        // Not claimable again, but still pending until settled
        assert!(queue.has_pending().unwrap());
        assert!(queue.peek().unwrap().is_none());
        assert!(queue.dequeue().unwrap().is_none());
        // Still stored until settled
        assert_eq!(queue.list().unwrap()[0].id, claimed.id);
    }

    #[test]
    fn test_failed_head_keeps_its_position() {
        let queue = queue();
        let a1 = queue.enqueue(&mark_read("m1")).unwrap();
        queue.enqueue(&mark_read("m2")).unwrap();

        let head = queue.dequeue().unwrap().unwrap();
        let outcome = queue.mark_failed(head.id, "timeout").unwrap();
        assert_eq!(outcome, FailureOutcome::Requeued { attempts: 1 });

        let retried = queue.dequeue().unwrap().unwrap();
        assert_eq!(retried.id, a1.id);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.last_error.as_deref(), Some("timeout"));
        assert_eq!(retried.action, head.action);
        assert_eq!(retried.created_at, head.created_at);
    }

    #[test]
    fn test_abandoned_after_max_attempts() {
        let queue = queue();
        let action = queue.enqueue(&mark_read("m1")).unwrap();

        for attempt in 1..MAX_ATTEMPTS {
            let head = queue.dequeue().unwrap().unwrap();
            assert_eq!(
                queue.mark_failed(head.id, "boom").unwrap(),
                FailureOutcome::Requeued { attempts: attempt }
            );
        }

        let head = queue.dequeue().unwrap().unwrap();
        assert_eq!(head.id, action.id);
        assert_eq!(
            queue.mark_failed(head.id, "boom").unwrap(),
            FailureOutcome::Abandoned
        );
        assert!(queue.dequeue().unwrap().is_none());
        assert_eq!(queue.len().unwrap(), 0);

        assert!(matches!(
            queue.mark_failed(head.id, "boom"),
            Err(CacheError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_recover_in_flight() {
        let queue = queue();
        queue.enqueue(&mark_read("m1")).unwrap();
        queue.enqueue(&mark_read("m2")).unwrap();
        let claimed = queue.dequeue().unwrap().unwrap();

        assert_eq!(queue.recover_in_flight().unwrap(), 1);
        assert_eq!(queue.peek().unwrap().unwrap().id, claimed.id);
        assert_eq!(queue.recover_in_flight().unwrap(), 0);
    }

    #[test]
    fn test_undecodable_rows_are_dropped() {
        let queue = queue();
        {
            let conn = queue.db.connection().unwrap();
            conn.execute(
                "INSERT INTO offline_queue (type, resource_id, payload, created_at)
                 VALUES ('mark_read', 'x', '{not json', 0)",
                [],
            )
            .unwrap();
        }
        let good = queue.enqueue(&mark_read("m1")).unwrap();

        assert_eq!(queue.list().unwrap().len(), 1);
        assert_eq!(queue.dequeue().unwrap().unwrap().id, good.id);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_remove_helpers() {
        let queue = queue();
        queue.enqueue(&mark_read("m1")).unwrap();
        queue
            .enqueue(&EmailAction::Star {
                email_id: "m1".to_string(),
            })
            .unwrap();
        let keep = queue.enqueue(&mark_read("m2")).unwrap();

        assert_eq!(queue.remove_by_resource("m1").unwrap(), 2);
        assert_eq!(queue.remove_stale(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(queue.peek().unwrap().unwrap().id, keep.id);

        assert!(queue.remove(keep.id).unwrap());
        queue.enqueue(&mark_read("m3")).unwrap();
        assert_eq!(queue.clear().unwrap(), 1);
        assert!(!queue.has_pending().unwrap());
    }
}
