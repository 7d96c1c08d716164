//! Email store

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::sync::Arc;

use super::search::SearchQuery;
use super::{
    decode_list, encode_list, from_millis, like_clause, like_pattern, now_millis, sql_limit,
    to_millis, token_filter, Database, DEFAULT_SEARCH_LIMIT,
};
use crate::types::error::Result;
use crate::types::CachedEmail;

const EMAIL_COLUMNS: &str = "id, thread_id, folder_id, subject, snippet, from_name, from_email,
     to_json, cc_json, bcc_json, date, unread, starred, has_attachments,
     body_html, body_text, cached_at";

const SEARCH_COLUMNS: &[&str] = &[
    "subject",
    "snippet",
    "from_name",
    "from_email",
    "to_json",
    "body_text",
];

/// Filters for [`EmailStore::list`]
#[derive(Debug, Clone)]
pub struct EmailListOptions {
    /// Zero means unlimited
    pub limit: usize,
    pub offset: usize,
    pub folder_id: Option<String>,
    pub thread_id: Option<String>,
    pub unread_only: bool,
    pub starred_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

impl Default for EmailListOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            folder_id: None,
            thread_id: None,
            unread_only: false,
            starred_only: false,
            since: None,
            before: None,
        }
    }
}

impl EmailListOptions {
    pub fn folder(folder_id: impl Into<String>) -> Self {
        Self {
            folder_id: Some(folder_id.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct EmailStore {
    db: Arc<Database>,
}

impl EmailStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Upsert by id. Returns the `cached_at` actually written, which never
    /// moves backwards for an existing row.
    pub fn put(&self, email: &CachedEmail) -> Result<DateTime<Utc>> {
        let conn = self.db.connection()?;
        let cached_at = upsert(&conn, email, now_millis())?;
        Ok(from_millis(cached_at))
    }

    /// Upsert many emails in one transaction
    pub fn put_batch(&self, emails: &[CachedEmail]) -> Result<usize> {
        if emails.is_empty() {
            return Ok(0);
        }

        let conn = self.db.connection()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_millis();
        for email in emails {
            upsert(&tx, email, now)?;
        }
        tx.commit()?;

        Ok(emails.len())
    }

    pub fn get(&self, id: &str) -> Result<Option<CachedEmail>> {
        let conn = self.db.connection()?;
        let sql = format!("SELECT {} FROM emails WHERE id = ?1", EMAIL_COLUMNS);
        let email = conn
            .query_row(&sql, params![id], row_to_email)
            .optional()?;
        Ok(email)
    }

    /// Most recent first
    pub fn list(&self, opts: &EmailListOptions) -> Result<Vec<CachedEmail>> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(folder_id) = &opts.folder_id {
            conditions.push("folder_id = ?");
            values.push(Value::from(folder_id.clone()));
        }
        if let Some(thread_id) = &opts.thread_id {
            conditions.push("thread_id = ?");
            values.push(Value::from(thread_id.clone()));
        }
        if opts.unread_only {
            conditions.push("unread = 1");
        }
        if opts.starred_only {
            conditions.push("starred = 1");
        }
        if let Some(since) = &opts.since {
            conditions.push("date >= ?");
            values.push(Value::from(to_millis(since)));
        }
        if let Some(before) = &opts.before {
            conditions.push("date < ?");
            values.push(Value::from(to_millis(before)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT {} FROM emails {} ORDER BY date DESC, id LIMIT ? OFFSET ?",
            EMAIL_COLUMNS, where_clause
        );
        values.push(Value::from(sql_limit(opts.limit)));
        values.push(Value::from(opts.offset as i64));

        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map(params_from_iter(values), row_to_email)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(emails)
    }

    /// Every query token must appear in subject, snippet, sender, recipients
    /// or body text. A zero limit means the default.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<CachedEmail>> {
        let Some((filter, patterns)) = token_filter(SEARCH_COLUMNS, query) else {
            return Ok(Vec::new());
        };
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        let mut values: Vec<Value> = patterns.into_iter().map(Value::from).collect();
        values.push(Value::from(limit as i64));

        let sql = format!(
            "SELECT {} FROM emails WHERE {} ORDER BY date DESC, id LIMIT ?",
            EMAIL_COLUMNS, filter
        );

        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map(params_from_iter(values), row_to_email)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(emails)
    }

    /// Parse `query` for operators (`from:`, `is:unread`, `after:7d`, ...)
    /// and search with them
    pub fn search_advanced(&self, query: &str, limit: usize) -> Result<Vec<CachedEmail>> {
        self.search_with_query(&SearchQuery::parse(query), limit)
    }

    /// Every set filter of `query` must hold; its free text is matched like
    /// [`EmailStore::search`]. An empty query lists the most recent emails.
    pub fn search_with_query(&self, query: &SearchQuery, limit: usize) -> Result<Vec<CachedEmail>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some((filter, patterns)) = token_filter(SEARCH_COLUMNS, &query.text) {
            conditions.push(filter);
            values.extend(patterns.into_iter().map(Value::from));
        }
        if let Some(subject) = &query.subject {
            conditions.push(like_clause("subject"));
            values.push(Value::from(like_pattern(subject)));
        }
        if let Some(from) = &query.from {
            conditions.push(format!(
                "({} OR {})",
                like_clause("from_email"),
                like_clause("from_name")
            ));
            let pattern = like_pattern(from);
            values.push(Value::from(pattern.clone()));
            values.push(Value::from(pattern));
        }
        if let Some(to) = &query.to {
            conditions.push(like_clause("to_json"));
            values.push(Value::from(like_pattern(to)));
        }
        if let Some(has_attachment) = query.has_attachment {
            conditions.push("has_attachments = ?".to_string());
            values.push(Value::from(has_attachment));
        }
        if let Some(unread) = query.is_unread {
            conditions.push("unread = ?".to_string());
            values.push(Value::from(unread));
        }
        if let Some(starred) = query.is_starred {
            conditions.push("starred = ?".to_string());
            values.push(Value::from(starred));
        }
        if let Some(after) = &query.after {
            conditions.push("date >= ?".to_string());
            values.push(Value::from(to_millis(after)));
        }
        if let Some(before) = &query.before {
            conditions.push("date < ?".to_string());
            values.push(Value::from(to_millis(before)));
        }
        if let Some(folder) = &query.folder {
            conditions.push("folder_id = ?".to_string());
            values.push(Value::from(folder.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        values.push(Value::from(limit as i64));

        let sql = format!(
            "SELECT {} FROM emails {} ORDER BY date DESC, id LIMIT ?",
            EMAIL_COLUMNS, where_clause
        );

        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map(params_from_iter(values), row_to_email)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(emails)
    }

    /// Apply flag changes to a cached email. Returns false if it is not cached.
    pub fn update_flags(
        &self,
        id: &str,
        unread: Option<bool>,
        starred: Option<bool>,
    ) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn.execute(
            "UPDATE emails SET
                unread = COALESCE(?2, unread),
                starred = COALESCE(?3, starred),
                cached_at = MAX(?4, cached_at)
             WHERE id = ?1",
            params![id, unread, starred, now_millis()],
        )?;
        Ok(changed > 0)
    }

    pub fn move_to_folder(&self, id: &str, folder_id: &str) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn.execute(
            "UPDATE emails SET folder_id = ?2, cached_at = MAX(?3, cached_at) WHERE id = ?1",
            params![id, folder_id, now_millis()],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.connection()?;
        let changed = conn.execute("DELETE FROM emails WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM emails", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Unread emails, optionally restricted to one folder
    pub fn count_unread(&self, folder_id: Option<&str>) -> Result<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM emails WHERE unread = 1 AND (?1 IS NULL OR folder_id = ?1)",
            params![folder_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn upsert(conn: &Connection, email: &CachedEmail, now: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO emails (
            id, thread_id, folder_id, subject, snippet, from_name, from_email,
            to_json, cc_json, bcc_json, date, unread, starred, has_attachments,
            body_html, body_text, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT(id) DO UPDATE SET
            thread_id = excluded.thread_id,
            folder_id = excluded.folder_id,
            subject = excluded.subject,
            snippet = excluded.snippet,
            from_name = excluded.from_name,
            from_email = excluded.from_email,
            to_json = excluded.to_json,
            cc_json = excluded.cc_json,
            bcc_json = excluded.bcc_json,
            date = excluded.date,
            unread = excluded.unread,
            starred = excluded.starred,
            has_attachments = excluded.has_attachments,
            body_html = excluded.body_html,
            body_text = excluded.body_text,
            cached_at = MAX(excluded.cached_at, emails.cached_at)
        RETURNING cached_at",
        params![
            email.id,
            email.thread_id,
            email.folder_id,
            email.subject,
            email.snippet,
            email.from_name,
            email.from_email,
            encode_list(&email.to),
            encode_list(&email.cc),
            encode_list(&email.bcc),
            to_millis(&email.date),
            email.unread,
            email.starred,
            email.has_attachments,
            email.body_html,
            email.body_text,
            now,
        ],
        |row| row.get(0),
    )
}

fn row_to_email(row: &Row) -> rusqlite::Result<CachedEmail> {
    Ok(CachedEmail {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        folder_id: row.get(2)?,
        subject: row.get(3)?,
        snippet: row.get(4)?,
        from_name: row.get(5)?,
        from_email: row.get(6)?,
        to: decode_list(&row.get::<_, String>(7)?),
        cc: decode_list(&row.get::<_, String>(8)?),
        bcc: decode_list(&row.get::<_, String>(9)?),
        date: from_millis(row.get(10)?),
        unread: row.get(11)?,
        starred: row.get(12)?,
        has_attachments: row.get(13)?,
        body_html: row.get(14)?,
        body_text: row.get(15)?,
        cached_at: from_millis(row.get(16)?),
    })
}
