//! Calendar metadata store

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;

use super::{from_millis, now_millis, Database};
use crate::types::error::Result;
use crate::types::CachedCalendar;

const CALENDAR_COLUMNS: &str =
    "id, name, description, is_primary, read_only, hex_color, cached_at";

#[derive(Clone)]
pub struct CalendarStore {
    db: Arc<Database>,
}

impl CalendarStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn put(&self, calendar: &CachedCalendar) -> Result<DateTime<Utc>> {
        let conn = self.db.connection()?;
        let cached_at = upsert(&conn, calendar, now_millis())?;
        Ok(from_millis(cached_at))
    }

    pub fn put_batch(&self, calendars: &[CachedCalendar]) -> Result<usize> {
        if calendars.is_empty() {
            return Ok(0);
        }

        let conn = self.db.connection()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_millis();
        for calendar in calendars {
            upsert(&tx, calendar, now)?;
        }
        tx.commit()?;

        Ok(calendars.len())
    }

    pub fn get(&self, id: &str) -> Result<Option<CachedCalendar>> {
        let conn = self.db.connection()?;
        let sql = format!("SELECT {} FROM calendars WHERE id = ?1", CALENDAR_COLUMNS);
        let calendar = conn
            .query_row(&sql, params![id], row_to_calendar)
            .optional()?;
        Ok(calendar)
    }

    /// Primary calendar first, then by name
    pub fn list(&self) -> Result<Vec<CachedCalendar>> {
        let conn = self.db.connection()?;
        let sql = format!(
            "SELECT {} FROM calendars ORDER BY is_primary DESC, name ASC",
            CALENDAR_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let calendars = stmt
            .query_map([], row_to_calendar)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(calendars)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn.execute("DELETE FROM calendars WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM calendars", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn upsert(conn: &Connection, calendar: &CachedCalendar, now: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO calendars (id, name, description, is_primary, read_only, hex_color, cached_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            is_primary = excluded.is_primary,
            read_only = excluded.read_only,
            hex_color = excluded.hex_color,
            cached_at = MAX(excluded.cached_at, calendars.cached_at)
         RETURNING cached_at",
        params![
            calendar.id,
            calendar.name,
            calendar.description,
            calendar.is_primary,
            calendar.read_only,
            calendar.hex_color,
            now,
        ],
        |row| row.get(0),
    )
}

fn row_to_calendar(row: &Row) -> rusqlite::Result<CachedCalendar> {
    Ok(CachedCalendar {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        is_primary: row.get(3)?,
        read_only: row.get(4)?,
        hex_color: row.get(5)?,
        cached_at: from_millis(row.get(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::schema::initialize_account_schema;

    #[test]
    fn test_list_puts_primary_first() {
        let db = Database::in_memory().expect("Failed to create database");
        initialize_account_schema(&db.connection().unwrap()).unwrap();
        let store = CalendarStore::new(Arc::new(db));

        let calendars = vec![
            CachedCalendar {
                id: "a".to_string(),
                name: "Alpha".to_string(),
                ..Default::default()
            },
            CachedCalendar {
                id: "p".to_string(),
                name: "Work".to_string(),
                is_primary: true,
                ..Default::default()
            },
        ];
        assert_eq!(store.put_batch(&calendars).unwrap(), 2);

        let listed = store.list().unwrap();
        assert_eq!(listed[0].id, "p");
        assert_eq!(listed[1].id, "a");
        assert_eq!(store.get("a").unwrap().unwrap().name, "Alpha");

        assert!(store.delete("a").unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }
}
