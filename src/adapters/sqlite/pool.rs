use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

use crate::types::error::{CacheError, Result};

/// Database connection pool type
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

const MAX_CONNECTIONS: u32 = 8;

// Per-connection settings. journal_mode is persisted in the file and set once
// by the schema initializer.
const CONNECTION_PRAGMAS: &str = "PRAGMA busy_timeout = 5000;
     PRAGMA synchronous = NORMAL;
     PRAGMA cache_size = -8000;
     PRAGMA temp_store = MEMORY;
     PRAGMA foreign_keys = ON;";

/// SQL name of the Unicode lowercase function registered on every connection.
/// The built-in `LOWER()` only folds ASCII.
pub const FOLD_CASE_FN: &str = "fold_case";

fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CONNECTION_PRAGMAS)?;
    conn.create_scalar_function(
        FOLD_CASE_FN,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value: Option<String> = ctx.get(0)?;
            Ok(value.map(|s| s.to_lowercase()))
        },
    )
}

/// A pooled SQLite database that can be closed explicitly.
///
/// After [`Database::close`] every call to [`Database::connection`] fails with
/// [`CacheError::Closed`]. Connections checked out before the close finish
/// their work and are dropped when returned.
pub struct Database {
    label: String,
    path: Option<PathBuf>,
    pool: RwLock<Option<DbPool>>,
}

impl Database {
    /// Open (creating if needed) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let manager = SqliteConnectionManager::file(path).with_init(init_connection);
        let pool = Pool::builder()
            .max_size(MAX_CONNECTIONS)
            .connection_timeout(Duration::from_secs(10))
            .build(manager)
            .map_err(|e| {
                CacheError::Database(format!(
                    "Failed to create database pool for {}: {}",
                    path.display(),
                    e
                ))
            })?;

        debug!("Opened database pool at {}", path.display());

        Ok(Self {
            label: path.display().to_string(),
            path: Some(path.to_path_buf()),
            pool: RwLock::new(Some(pool)),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(init_connection);
        // Every in-memory connection is its own database
        let pool = Pool::builder().max_size(1).build(manager).map_err(|e| {
            CacheError::Database(format!("Failed to create in-memory database pool: {}", e))
        })?;

        Ok(Self {
            label: ":memory:".to_string(),
            path: None,
            pool: RwLock::new(Some(pool)),
        })
    }

    /// Get a connection from the pool
    pub fn connection(&self) -> Result<DbConnection> {
        let pool = {
            let guard = self
                .pool
                .read()
                .map_err(|_| CacheError::Other("database lock poisoned".to_string()))?;
            match guard.as_ref() {
                Some(pool) => pool.clone(),
                None => return Err(CacheError::Closed(self.label.clone())),
            }
        };

        pool.get().map_err(|e| {
            CacheError::Database(format!("Failed to get database connection: {}", e))
        })
    }

    /// Release the pool. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .pool
            .write()
            .map_err(|_| CacheError::Other("database lock poisoned".to_string()))?;
        if guard.take().is_some() {
            debug!("Closed database {}", self.label);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.pool.read().map(|g| g.is_none()).unwrap_or(true)
    }

    /// Backing file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_after_close_fails() {
        let db = Database::in_memory().expect("Failed to create database");
        db.connection().expect("open connection");

        db.close().unwrap();
        db.close().unwrap();

        assert!(db.is_closed());
        assert!(matches!(db.connection(), Err(CacheError::Closed(_))));
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::open(&path).expect("Failed to open database");

        let conn = db.connection().unwrap();
        let sync: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        // NORMAL
        assert_eq!(sync, 1);
        assert_eq!(db.path(), Some(path.as_path()));
    }

    #[test]
    fn test_fold_case_is_unicode_aware() {
        let db = Database::in_memory().expect("Failed to create database");
        let conn = db.connection().unwrap();

        let folded: String = conn
            .query_row("SELECT fold_case('ÉCLAIR Übersicht ΣΟΦΊΑ')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(folded, "éclair übersicht σοφία");

        let null: Option<String> = conn
            .query_row("SELECT fold_case(NULL)", [], |row| row.get(0))
            .unwrap();
        assert_eq!(null, None);
    }
}
