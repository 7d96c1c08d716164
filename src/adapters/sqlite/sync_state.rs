use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use super::{from_millis, to_millis, Database};
use crate::types::error::Result;
use crate::types::SyncState;

/// Last successful pull per resource class
#[derive(Clone)]
pub struct SyncStateStore {
    db: Arc<Database>,
}

impl SyncStateStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, resource: &str) -> Result<Option<SyncState>> {
        let conn = self.db.connection()?;
        let state = conn
            .query_row(
                "SELECT resource, last_sync, cursor FROM sync_state WHERE resource = ?1",
                params![resource],
                row_to_state,
            )
            .optional()?;
        Ok(state)
    }

    pub fn set(&self, state: &SyncState) -> Result<()> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO sync_state (resource, last_sync, cursor) VALUES (?1, ?2, ?3)
             ON CONFLICT(resource) DO UPDATE SET
                last_sync = excluded.last_sync,
                cursor = excluded.cursor",
            params![state.resource, to_millis(&state.last_sync), state.cursor],
        )?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<SyncState>> {
        let conn = self.db.connection()?;
        let mut stmt =
            conn.prepare("SELECT resource, last_sync, cursor FROM sync_state ORDER BY resource")?;
        let states = stmt
            .query_map([], row_to_state)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(states)
    }

    /// Most recent sync of any resource
    pub fn latest(&self) -> Result<Option<SyncState>> {
        let conn = self.db.connection()?;
        let state = conn
            .query_row(
                "SELECT resource, last_sync, cursor FROM sync_state
                 ORDER BY last_sync DESC LIMIT 1",
                [],
                row_to_state,
            )
            .optional()?;
        Ok(state)
    }
}

fn row_to_state(row: &Row) -> rusqlite::Result<SyncState> {
    Ok(SyncState {
        resource: row.get(0)?,
        last_sync: from_millis(row.get(1)?),
        cursor: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::schema::initialize_account_schema;
    use chrono::{Duration, Utc};

    #[test]
    fn test_set_overwrites_per_resource() {
        let db = Database::in_memory().expect("Failed to create database");
        initialize_account_schema(&db.connection().unwrap()).unwrap();
        let store = SyncStateStore::new(Arc::new(db));

        assert!(store.get("emails").unwrap().is_none());
        assert!(store.latest().unwrap().is_none());

        let earlier = from_millis(to_millis(&(Utc::now() - Duration::minutes(10))));
        let now = from_millis(to_millis(&Utc::now()));

        store.set(&SyncState::new("emails", earlier)).unwrap();
        store.set(&SyncState::new("contacts", now)).unwrap();
        store
            .set(&SyncState {
                resource: "emails".to_string(),
                last_sync: earlier,
                cursor: Some("page-2".to_string()),
            })
            .unwrap();

        let emails = store.get("emails").unwrap().unwrap();
        assert_eq!(emails.cursor.as_deref(), Some("page-2"));
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.latest().unwrap().unwrap().resource, "contacts");
    }
}
