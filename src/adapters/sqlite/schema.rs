use rusqlite::Connection;

use crate::types::error::Result;

/// Tables of one account's cache file
pub fn initialize_account_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS emails (
            id              TEXT PRIMARY KEY,   -- remote message id
            thread_id       TEXT NOT NULL DEFAULT '',
            folder_id       TEXT NOT NULL DEFAULT '',
            subject         TEXT NOT NULL DEFAULT '',
            snippet         TEXT NOT NULL DEFAULT '',
            from_name       TEXT NOT NULL DEFAULT '',
            from_email      TEXT NOT NULL DEFAULT '',
            to_json         TEXT NOT NULL DEFAULT '[]',  -- JSON array
            cc_json         TEXT NOT NULL DEFAULT '[]',  -- JSON array
            bcc_json        TEXT NOT NULL DEFAULT '[]',  -- JSON array
            date            INTEGER NOT NULL,            -- unix epoch ms
            unread          INTEGER NOT NULL DEFAULT 0,
            starred         INTEGER NOT NULL DEFAULT 0,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            body_html       TEXT NOT NULL DEFAULT '',
            body_text       TEXT NOT NULL DEFAULT '',
            cached_at       INTEGER NOT NULL             -- unix epoch ms, never decreases
        );

        CREATE INDEX IF NOT EXISTS idx_emails_folder ON emails(folder_id, date DESC);
        CREATE INDEX IF NOT EXISTS idx_emails_thread ON emails(thread_id);
        CREATE INDEX IF NOT EXISTS idx_emails_date   ON emails(date DESC);

        CREATE TABLE IF NOT EXISTS events (
            id              TEXT PRIMARY KEY,
            calendar_id     TEXT NOT NULL DEFAULT '',
            title           TEXT NOT NULL DEFAULT '',
            description     TEXT NOT NULL DEFAULT '',
            location        TEXT NOT NULL DEFAULT '',
            start_time      INTEGER NOT NULL,
            end_time        INTEGER NOT NULL,
            all_day         INTEGER NOT NULL DEFAULT 0,
            recurring       INTEGER NOT NULL DEFAULT 0,
            rrule           TEXT NOT NULL DEFAULT '',
            status          TEXT NOT NULL DEFAULT '',
            busy            INTEGER NOT NULL DEFAULT 1,
            participants    TEXT NOT NULL DEFAULT '[]',  -- JSON array
            cached_at       INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_calendar ON events(calendar_id, start_time);
        CREATE INDEX IF NOT EXISTS idx_events_time     ON events(start_time, end_time);

        CREATE TABLE IF NOT EXISTS calendars (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL DEFAULT '',
            description     TEXT NOT NULL DEFAULT '',
            is_primary      INTEGER NOT NULL DEFAULT 0,
            read_only       INTEGER NOT NULL DEFAULT 0,
            hex_color       TEXT NOT NULL DEFAULT '',
            cached_at       INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contacts (
            id              TEXT PRIMARY KEY,
            email           TEXT NOT NULL DEFAULT '',
            given_name      TEXT NOT NULL DEFAULT '',
            surname         TEXT NOT NULL DEFAULT '',
            display_name    TEXT NOT NULL DEFAULT '',
            phone           TEXT NOT NULL DEFAULT '',
            company         TEXT NOT NULL DEFAULT '',
            job_title       TEXT NOT NULL DEFAULT '',
            notes           TEXT NOT NULL DEFAULT '',
            photo_url       TEXT NOT NULL DEFAULT '',
            groups_json     TEXT NOT NULL DEFAULT '[]',  -- JSON array
            cached_at       INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
        CREATE INDEX IF NOT EXISTS idx_contacts_name  ON contacts(display_name);

        CREATE TABLE IF NOT EXISTS folders (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL DEFAULT '',
            folder_type     TEXT NOT NULL DEFAULT '',    -- system folder kind
            total_count     INTEGER NOT NULL DEFAULT 0,
            unread_count    INTEGER NOT NULL DEFAULT 0,
            cached_at       INTEGER NOT NULL
        );

        -- One row per resource class
        CREATE TABLE IF NOT EXISTS sync_state (
            resource        TEXT PRIMARY KEY,
            last_sync       INTEGER NOT NULL,
            cursor          TEXT
        );

        -- Pending offline mutations. id order is replay order.
        CREATE TABLE IF NOT EXISTS offline_queue (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            type            TEXT NOT NULL,               -- mark_read | mark_unread | star | unstar | delete | move
            resource_id     TEXT NOT NULL,
            payload         TEXT NOT NULL,               -- JSON-encoded action
            created_at      INTEGER NOT NULL,
            attempts        INTEGER NOT NULL DEFAULT 0,
            last_error      TEXT,
            state           TEXT NOT NULL DEFAULT 'queued'  -- queued | in_flight
        );

        CREATE INDEX IF NOT EXISTS idx_offline_queue_resource ON offline_queue(resource_id);
        ",
    )?;

    Ok(())
}

/// Tables of the shared photos file
pub fn initialize_photo_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS photos (
            contact_id      TEXT PRIMARY KEY,
            content_type    TEXT NOT NULL,
            data            BLOB NOT NULL,
            size            INTEGER NOT NULL,
            cached_at       INTEGER NOT NULL,            -- unix epoch ms
            accessed_at     INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_photos_cached ON photos(cached_at);
        ",
    )?;

    Ok(())
}

/// Tables of the shared attachments file
pub fn initialize_attachment_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS attachments (
            account         TEXT NOT NULL,
            id              TEXT NOT NULL,
            email_id        TEXT NOT NULL,
            filename        TEXT NOT NULL DEFAULT '',
            content_type    TEXT NOT NULL DEFAULT '',
            size            INTEGER NOT NULL,
            hash            TEXT NOT NULL,               -- hex SHA-256, names the content file
            cached_at       INTEGER NOT NULL,            -- unix epoch ms
            accessed_at     INTEGER NOT NULL,
            PRIMARY KEY (account, id)
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_email    ON attachments(account, email_id);
        CREATE INDEX IF NOT EXISTS idx_attachments_hash     ON attachments(hash);
        CREATE INDEX IF NOT EXISTS idx_attachments_accessed ON attachments(accessed_at);
        ",
    )?;

    Ok(())
}
