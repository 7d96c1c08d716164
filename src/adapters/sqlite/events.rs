//! Calendar event store

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::sync::Arc;

use super::{
    decode_list, encode_list, from_millis, now_millis, sql_limit, to_millis, token_filter,
    Database, DEFAULT_SEARCH_LIMIT,
};
use crate::types::error::Result;
use crate::types::CachedEvent;

const EVENT_COLUMNS: &str = "id, calendar_id, title, description, location, start_time, end_time,
     all_day, recurring, rrule, status, busy, participants, cached_at";

const SEARCH_COLUMNS: &[&str] = &["title", "description", "location", "participants"];

/// Filters for [`EventStore::list`]. `start`/`end` select events overlapping
/// the window.
#[derive(Debug, Clone, Default)]
pub struct EventListOptions {
    /// Zero means unlimited
    pub limit: usize,
    pub offset: usize,
    pub calendar_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct EventStore {
    db: Arc<Database>,
}

impl EventStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn put(&self, event: &CachedEvent) -> Result<DateTime<Utc>> {
        let conn = self.db.connection()?;
        let cached_at = upsert(&conn, event, now_millis())?;
        Ok(from_millis(cached_at))
    }

    pub fn put_batch(&self, events: &[CachedEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let conn = self.db.connection()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_millis();
        for event in events {
            upsert(&tx, event, now)?;
        }
        tx.commit()?;

        Ok(events.len())
    }

    pub fn get(&self, id: &str) -> Result<Option<CachedEvent>> {
        let conn = self.db.connection()?;
        let sql = format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS);
        let event = conn
            .query_row(&sql, params![id], row_to_event)
            .optional()?;
        Ok(event)
    }

    /// Earliest start first
    pub fn list(&self, opts: &EventListOptions) -> Result<Vec<CachedEvent>> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(calendar_id) = &opts.calendar_id {
            conditions.push("calendar_id = ?");
            values.push(Value::from(calendar_id.clone()));
        }
        if let Some(start) = &opts.start {
            conditions.push("end_time >= ?");
            values.push(Value::from(to_millis(start)));
        }
        if let Some(end) = &opts.end {
            conditions.push("start_time <= ?");
            values.push(Value::from(to_millis(end)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM events {} ORDER BY start_time ASC, id LIMIT ? OFFSET ?",
            EVENT_COLUMNS, where_clause
        );
        values.push(Value::from(sql_limit(opts.limit)));
        values.push(Value::from(opts.offset as i64));

        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(values), row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Events that have not ended yet
    pub fn upcoming(&self, limit: usize) -> Result<Vec<CachedEvent>> {
        self.list(&EventListOptions {
            start: Some(Utc::now()),
            limit,
            ..Default::default()
        })
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<CachedEvent>> {
        let Some((filter, patterns)) = token_filter(SEARCH_COLUMNS, query) else {
            return Ok(Vec::new());
        };
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        let mut values: Vec<Value> = patterns.into_iter().map(Value::from).collect();
        values.push(Value::from(limit as i64));

        let sql = format!(
            "SELECT {} FROM events WHERE {} ORDER BY start_time ASC, id LIMIT ?",
            EVENT_COLUMNS, filter
        );

        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(values), row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Drop every cached event of one calendar. Returns the number removed.
    pub fn delete_by_calendar(&self, calendar_id: &str) -> Result<usize> {
        let conn = self.db.connection()?;
        let removed = conn.execute(
            "DELETE FROM events WHERE calendar_id = ?1",
            params![calendar_id],
        )?;
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn upsert(conn: &Connection, event: &CachedEvent, now: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO events (
            id, calendar_id, title, description, location, start_time, end_time,
            all_day, recurring, rrule, status, busy, participants, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(id) DO UPDATE SET
            calendar_id = excluded.calendar_id,
            title = excluded.title,
            description = excluded.description,
            location = excluded.location,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            all_day = excluded.all_day,
            recurring = excluded.recurring,
            rrule = excluded.rrule,
            status = excluded.status,
            busy = excluded.busy,
            participants = excluded.participants,
            cached_at = MAX(excluded.cached_at, events.cached_at)
        RETURNING cached_at",
        params![
            event.id,
            event.calendar_id,
            event.title,
            event.description,
            event.location,
            to_millis(&event.start_time),
            to_millis(&event.end_time),
            event.all_day,
            event.recurring,
            event.rrule,
            event.status,
            event.busy,
            encode_list(&event.participants),
            now,
        ],
        |row| row.get(0),
    )
}

fn row_to_event(row: &Row) -> rusqlite::Result<CachedEvent> {
    Ok(CachedEvent {
        id: row.get(0)?,
        calendar_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        location: row.get(4)?,
        start_time: from_millis(row.get(5)?),
        end_time: from_millis(row.get(6)?),
        all_day: row.get(7)?,
        recurring: row.get(8)?,
        rrule: row.get(9)?,
        status: row.get(10)?,
        busy: row.get(11)?,
        participants: decode_list(&row.get::<_, String>(12)?),
        cached_at: from_millis(row.get(13)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::schema::initialize_account_schema;
    use chrono::Duration;

    fn store() -> EventStore {
        let db = Database::in_memory().expect("Failed to create database");
        initialize_account_schema(&db.connection().unwrap()).unwrap();
        EventStore::new(Arc::new(db))
    }

    fn event(id: &str, calendar: &str, starts_in_hours: i64) -> CachedEvent {
        let start = from_millis(now_millis()) + Duration::hours(starts_in_hours);
        CachedEvent {
            id: id.to_string(),
            calendar_id: calendar.to_string(),
            title: format!("Event {}", id),
            start_time: start,
            end_time: start + Duration::hours(1),
            busy: true,
            participants: vec!["Bob <bob@example.com>".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = store();
        let mut e = event("e1", "work", 2);
        e.rrule = "FREQ=WEEKLY".to_string();
        e.recurring = true;
        e.cached_at = store.put(&e).unwrap();

        assert_eq!(store.get("e1").unwrap(), Some(e));
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn test_list_window_and_calendar() {
        let store = store();
        store
            .put_batch(&[
                event("past", "work", -48),
                event("soon", "work", 1),
                event("later", "home", 24),
            ])
            .unwrap();

        let upcoming = store.upcoming(0).unwrap();
        let ids: Vec<_> = upcoming.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["soon", "later"]);

        let work = store
            .list(&EventListOptions {
                calendar_id: Some("work".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(work.len(), 2);
        assert_eq!(work[0].id, "past");

        let window = store
            .list(&EventListOptions {
                start: Some(Utc::now()),
                end: Some(Utc::now() + Duration::hours(3)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].id, "soon");
    }

    #[test]
    fn test_search_and_delete_by_calendar() {
        let store = store();
        let mut standup = event("s", "work", 1);
        standup.title = "Daily Standup".to_string();
        standup.location = "Room 4".to_string();
        store.put(&standup).unwrap();
        store.put(&event("x", "home", 2)).unwrap();

        let hits = store.search("standup room", 0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(store.search("bob@example", 10).unwrap().len(), 2);

        assert_eq!(store.delete_by_calendar("work").unwrap(), 1);
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.delete("x").unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_search_folds_non_ascii_case() {
        let store = store();
        let mut review = event("r", "work", 1);
        review.title = "Überprüfung im Café".to_string();
        store.put(&review).unwrap();

        assert_eq!(store.search("ÜBERPRÜFUNG", 0).unwrap().len(), 1);
        assert_eq!(store.search("café überprüfung", 0).unwrap()[0].id, "r");
        assert!(store.search("cafe", 0).unwrap().is_empty());
    }
}
