pub mod attachments;
pub mod calendars;
pub mod contacts;
pub mod emails;
pub mod events;
pub mod folders;
pub mod offline_queue;
pub mod photos;
pub mod pool;
pub mod schema;
pub mod search;
pub mod sync_state;

pub use pool::{Database, DbConnection, DbPool, FOLD_CASE_FN};

use chrono::{DateTime, TimeZone, Utc};

/// Default result limit for search
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Unix epoch milliseconds, the storage format of every timestamp column
pub(crate) fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Current time truncated to the stored precision
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// SQLite treats a negative LIMIT as unbounded
pub(crate) fn sql_limit(limit: usize) -> i64 {
    if limit == 0 {
        -1
    } else {
        limit as i64
    }
}

pub(crate) fn encode_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Malformed JSON reads back as an empty list
pub(crate) fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Case-insensitive substring match of one column against a bound pattern
/// from [`like_pattern`]
pub(crate) fn like_clause(column: &str) -> String {
    format!("{}({}) LIKE ? ESCAPE '\\'", FOLD_CASE_FN, column)
}

/// `%needle%` with the needle case-folded and its LIKE wildcards escaped
pub(crate) fn like_pattern(needle: &str) -> String {
    format!("%{}%", escape_like(&needle.to_lowercase()))
}

/// Build a token filter for case-insensitive substring search.
///
/// Every whitespace-separated token must match at least one of `columns`.
/// Both sides are folded by the same Unicode-aware function. Returns the SQL
/// fragment (without leading `WHERE`) and its parameters, or `None` when the
/// query has no tokens.
pub(crate) fn token_filter(columns: &[&str], query: &str) -> Option<(String, Vec<String>)> {
    let tokens: Vec<&str> = query.split_whitespace().collect();
    if tokens.is_empty() || columns.is_empty() {
        return None;
    }

    let mut clauses = Vec::with_capacity(tokens.len());
    let mut params = Vec::with_capacity(tokens.len() * columns.len());

    for token in tokens {
        let pattern = like_pattern(token);
        let per_column: Vec<String> = columns.iter().map(|col| like_clause(col)).collect();
        clauses.push(format!("({})", per_column.join(" OR ")));
        params.extend(std::iter::repeat(pattern).take(columns.len()));
    }

    Some((clauses.join(" AND "), params))
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
