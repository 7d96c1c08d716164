//! Contact store

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::sync::Arc;

use super::{
    decode_list, encode_list, from_millis, now_millis, sql_limit, token_filter, Database,
    DEFAULT_SEARCH_LIMIT,
};
use crate::types::error::Result;
use crate::types::CachedContact;

const CONTACT_COLUMNS: &str = "id, email, given_name, surname, display_name, phone, company,
     job_title, notes, photo_url, groups_json, cached_at";

const SEARCH_COLUMNS: &[&str] = &[
    "display_name",
    "given_name",
    "surname",
    "email",
    "company",
    "job_title",
    "notes",
];

#[derive(Debug, Clone, Default)]
pub struct ContactListOptions {
    /// Zero means unlimited
    pub limit: usize,
    pub offset: usize,
    /// Only contacts that belong to this group
    pub group: Option<String>,
}

#[derive(Clone)]
pub struct ContactStore {
    db: Arc<Database>,
}

impl ContactStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn put(&self, contact: &CachedContact) -> Result<DateTime<Utc>> {
        let conn = self.db.connection()?;
        let cached_at = upsert(&conn, contact, now_millis())?;
        Ok(from_millis(cached_at))
    }

    pub fn put_batch(&self, contacts: &[CachedContact]) -> Result<usize> {
        if contacts.is_empty() {
            return Ok(0);
        }

        let conn = self.db.connection()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_millis();
        for contact in contacts {
            upsert(&tx, contact, now)?;
        }
        tx.commit()?;

        Ok(contacts.len())
    }

    pub fn get(&self, id: &str) -> Result<Option<CachedContact>> {
        let conn = self.db.connection()?;
        let sql = format!("SELECT {} FROM contacts WHERE id = ?1", CONTACT_COLUMNS);
        let contact = conn
            .query_row(&sql, params![id], row_to_contact)
            .optional()?;
        Ok(contact)
    }

    /// Case-insensitive lookup by address
    pub fn get_by_email(&self, email: &str) -> Result<Option<CachedContact>> {
        let conn = self.db.connection()?;
        let sql = format!(
            "SELECT {} FROM contacts WHERE fold_case(email) = fold_case(?1) ORDER BY id LIMIT 1",
            CONTACT_COLUMNS
        );
        let contact = conn
            .query_row(&sql, params![email], row_to_contact)
            .optional()?;
        Ok(contact)
    }

    /// Alphabetical by display name
    pub fn list(&self, opts: &ContactListOptions) -> Result<Vec<CachedContact>> {
        let mut values: Vec<Value> = Vec::new();
        let where_clause = match &opts.group {
            Some(group) => {
                values.push(Value::from(group.clone()));
                "WHERE EXISTS (SELECT 1 FROM json_each(contacts.groups_json) WHERE value = ?)"
            }
            None => "",
        };

        let sql = format!(
            "SELECT {} FROM contacts {} ORDER BY display_name ASC, given_name ASC, id LIMIT ? OFFSET ?",
            CONTACT_COLUMNS, where_clause
        );
        values.push(Value::from(sql_limit(opts.limit)));
        values.push(Value::from(opts.offset as i64));

        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let contacts = stmt
            .query_map(params_from_iter(values), row_to_contact)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(contacts)
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<CachedContact>> {
        let Some((filter, patterns)) = token_filter(SEARCH_COLUMNS, query) else {
            return Ok(Vec::new());
        };
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        let mut values: Vec<Value> = patterns.into_iter().map(Value::from).collect();
        values.push(Value::from(limit as i64));

        let sql = format!(
            "SELECT {} FROM contacts WHERE {} ORDER BY display_name ASC, id LIMIT ?",
            CONTACT_COLUMNS, filter
        );

        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let contacts = stmt
            .query_map(params_from_iter(values), row_to_contact)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(contacts)
    }

    /// Every distinct group name, sorted
    pub fn list_groups(&self) -> Result<Vec<String>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT g.value
             FROM contacts, json_each(contacts.groups_json) AS g
             WHERE json_valid(contacts.groups_json) AND g.type = 'text'
             ORDER BY g.value",
        )?;
        let groups = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(groups)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn.execute("DELETE FROM contacts WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn upsert(conn: &Connection, contact: &CachedContact, now: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO contacts (
            id, email, given_name, surname, display_name, phone, company,
            job_title, notes, photo_url, groups_json, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(id) DO UPDATE SET
            email = excluded.email,
            given_name = excluded.given_name,
            surname = excluded.surname,
            display_name = excluded.display_name,
            phone = excluded.phone,
            company = excluded.company,
            job_title = excluded.job_title,
            notes = excluded.notes,
            photo_url = excluded.photo_url,
            groups_json = excluded.groups_json,
            cached_at = MAX(excluded.cached_at, contacts.cached_at)
        RETURNING cached_at",
        params![
            contact.id,
            contact.email,
            contact.given_name,
            contact.surname,
            contact.display_name,
            contact.phone,
            contact.company,
            contact.job_title,
            contact.notes,
            contact.photo_url,
            encode_list(&contact.groups),
            now,
        ],
        |row| row.get(0),
    )
}

fn row_to_contact(row: &Row) -> rusqlite::Result<CachedContact> {
    Ok(CachedContact {
        id: row.get(0)?,
        email: row.get(1)?,
        given_name: row.get(2)?,
        surname: row.get(3)?,
        display_name: row.get(4)?,
        phone: row.get(5)?,
        company: row.get(6)?,
        job_title: row.get(7)?,
        notes: row.get(8)?,
        photo_url: row.get(9)?,
        groups: decode_list(&row.get::<_, String>(10)?),
        cached_at: from_millis(row.get(11)?),
    })
}
