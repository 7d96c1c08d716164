//! Search query operators and cross-store search
//!
//! A query such as `from:alice is:unread after:7d budget` is split into
//! field filters and the remaining free text. [`EmailStore::search_with_query`]
//! applies the filters; [`unified_search`] looks for the free text across
//! emails, events and contacts of one account.
//!
//! [`EmailStore::search_with_query`]: super::emails::EmailStore::search_with_query

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::contacts::ContactStore;
use super::emails::EmailStore;
use super::events::EventStore;
use crate::types::error::Result;

/// `name:value` or `name:"quoted value"`
static OPERATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w+):("[^"]+"|\S+)"#).expect("operator pattern is valid"));

/// `3d`, `2w`, `6m`: days, weeks or months ago
static RELATIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)([dwm])$").expect("relative date pattern is valid"));

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%b %d, %Y", "%B %d, %Y"];

/// Default and floor of per-kind results in [`unified_search`]
pub const DEFAULT_UNIFIED_LIMIT: usize = 20;
const MIN_PER_KIND: usize = 5;

/// A search string split into operators and free text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Whatever is left once the operators are removed
    pub text: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub has_attachment: Option<bool>,
    pub is_unread: Option<bool>,
    pub is_starred: Option<bool>,
    /// Inclusive lower bound on the message date
    pub after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the message date
    pub before: Option<DateTime<Utc>>,
    /// Folder id
    pub folder: Option<String>,
}

impl SearchQuery {
    /// Parse operators relative to the current time
    pub fn parse(query: &str) -> Self {
        Self::parse_at(query, Utc::now())
    }

    /// Parse with relative dates (`today`, `7d`, ...) resolved against `now`.
    ///
    /// Recognised operators are `from:`, `to:`, `subject:`, `has:attachment`,
    /// `is:unread`, `is:read`, `is:starred`, `after:`, `before:` and `in:`.
    /// Every `name:value` token is removed from the free text, including
    /// unknown operators and values that do not parse.
    pub fn parse_at(query: &str, now: DateTime<Utc>) -> Self {
        let mut parsed = SearchQuery::default();

        for caps in OPERATOR_RE.captures_iter(query) {
            let value = caps[2].trim_matches('"').to_string();
            match caps[1].to_lowercase().as_str() {
                "from" => parsed.from = Some(value),
                "to" => parsed.to = Some(value),
                "subject" => parsed.subject = Some(value),
                "has" => {
                    if value.eq_ignore_ascii_case("attachment")
                        || value.eq_ignore_ascii_case("attachments")
                    {
                        parsed.has_attachment = Some(true);
                    }
                }
                "is" => match value.to_lowercase().as_str() {
                    "unread" => parsed.is_unread = Some(true),
                    "read" => parsed.is_unread = Some(false),
                    "starred" => parsed.is_starred = Some(true),
                    _ => {}
                },
                "after" => parsed.after = parse_date(&value, now),
                "before" => parsed.before = parse_date(&value, now),
                "in" => parsed.folder = Some(value),
                other => debug!("Ignoring unknown search operator {}", other),
            }
        }

        let remaining = OPERATOR_RE.replace_all(query, " ");
        parsed.text = remaining.split_whitespace().collect::<Vec<_>>().join(" ");
        parsed
    }

    /// True when neither operators nor free text narrow the search
    pub fn is_empty(&self) -> bool {
        *self == SearchQuery::default()
    }
}

/// Absolute dates in a handful of common formats, or a time relative to
/// `now`. Absolute and named dates resolve to midnight UTC.
pub fn parse_date(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(midnight(date));
        }
    }

    let value = value.to_lowercase();
    let today = now.date_naive();
    match value.as_str() {
        "today" => return Some(midnight(today)),
        "yesterday" => return today.pred_opt().map(midnight),
        "week" | "thisweek" | "this-week" => {
            let since_sunday = i64::from(today.weekday().num_days_from_sunday());
            return Some(midnight(today - Duration::days(since_sunday)));
        }
        "month" | "thismonth" | "this-month" => return today.with_day(1).map(midnight),
        _ => {}
    }

    let caps = RELATIVE_RE.captures(&value)?;
    let count: u32 = caps[1].parse().ok()?;
    match &caps[2] {
        "d" => Some(now - Duration::days(i64::from(count))),
        "w" => Some(now - Duration::weeks(i64::from(count))),
        "m" => now.checked_sub_months(Months::new(count)),
        _ => None,
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Kind of record behind a [`UnifiedSearchResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Email,
    Event,
    Contact,
}

/// One hit of a cross-store search, shaped for a result list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedSearchResult {
    pub kind: ResultKind,
    pub id: String,
    pub title: String,
    pub subtitle: String,
    pub date: DateTime<Utc>,
}

/// Search emails, then events, then contacts of one account.
///
/// Each kind gets a third of `limit` (at least five). A store that fails is
/// skipped so the others still answer. A zero limit means
/// [`DEFAULT_UNIFIED_LIMIT`].
pub fn unified_search(
    emails: &EmailStore,
    events: &EventStore,
    contacts: &ContactStore,
    query: &str,
    limit: usize,
) -> Result<Vec<UnifiedSearchResult>> {
    let limit = if limit == 0 { DEFAULT_UNIFIED_LIMIT } else { limit };
    let per_kind = (limit / 3).max(MIN_PER_KIND);
    let mut results = Vec::new();

    match emails.search(query, per_kind) {
        Ok(hits) => results.extend(hits.into_iter().map(|e| UnifiedSearchResult {
            kind: ResultKind::Email,
            title: e.subject,
            subtitle: format!("{} <{}>", e.from_name, e.from_email),
            date: e.date,
            id: e.id,
        })),
        Err(e) => warn!("Email search failed: {}", e),
    }

    match events.search(query, per_kind) {
        Ok(hits) => results.extend(hits.into_iter().map(|e| UnifiedSearchResult {
            kind: ResultKind::Event,
            title: e.title,
            subtitle: e.location,
            date: e.start_time,
            id: e.id,
        })),
        Err(e) => warn!("Event search failed: {}", e),
    }

    match contacts.search(query, per_kind) {
        Ok(hits) => results.extend(hits.into_iter().map(|c| {
            let title = if c.display_name.is_empty() {
                format!("{} {}", c.given_name, c.surname).trim().to_string()
            } else {
                c.display_name
            };
            UnifiedSearchResult {
                kind: ResultKind::Contact,
                title,
                subtitle: c.email,
                date: c.cached_at,
                id: c.id,
            }
        })),
        Err(e) => warn!("Contact search failed: {}", e),
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::schema::initialize_account_schema;
    use crate::adapters::sqlite::Database;
    use crate::types::{CachedContact, CachedEmail, CachedEvent};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_operators_and_text() {
        let now = at(2026, 3, 18, 15);
        let q = SearchQuery::parse_at(
            r#"budget from:alice@example.com subject:"Q3 plan" is:unread has:attachment in:inbox review"#,
            now,
        );
        assert_eq!(q.text, "budget review");
        assert_eq!(q.from.as_deref(), Some("alice@example.com"));
        assert_eq!(q.subject.as_deref(), Some("Q3 plan"));
        assert_eq!(q.is_unread, Some(true));
        assert_eq!(q.has_attachment, Some(true));
        assert_eq!(q.folder.as_deref(), Some("inbox"));
        assert_eq!(q.is_starred, None);

        let q = SearchQuery::parse_at("IS:Read is:starred to:bob", now);
        assert_eq!(q.is_unread, Some(false));
        assert_eq!(q.is_starred, Some(true));
        assert_eq!(q.to.as_deref(), Some("bob"));
        assert!(q.text.is_empty());
    }

    #[test]
    fn test_unknown_and_unparsable_operators_are_dropped() {
        let q = SearchQuery::parse_at("lunch label:food after:someday", Utc::now());
        assert_eq!(q.text, "lunch");
        assert_eq!(q.after, None);
        assert!(SearchQuery::parse("   ").is_empty());
    }

    #[test]
    fn test_parse_absolute_dates() {
        let now = Utc::now();
        let expected = Some(at(2024, 1, 5, 0));
        assert_eq!(parse_date("2024-01-05", now), expected);
        assert_eq!(parse_date("2024/01/05", now), expected);
        assert_eq!(parse_date("01/05/2024", now), expected);
        assert_eq!(parse_date("Jan 5, 2024", now), expected);
        assert_eq!(parse_date("January 5, 2024", now), expected);
        assert_eq!(parse_date("5th of January", now), None);

        let q = SearchQuery::parse_at(r#"after:"Jan 5, 2024" before:2024-02-01"#, now);
        assert_eq!(q.after, expected);
        assert_eq!(q.before, Some(at(2024, 2, 1, 0)));
    }

    #[test]
    fn test_parse_relative_dates() {
        // A Wednesday
        let now = at(2026, 3, 18, 15);
        assert_eq!(parse_date("today", now), Some(at(2026, 3, 18, 0)));
        assert_eq!(parse_date("Yesterday", now), Some(at(2026, 3, 17, 0)));
        assert_eq!(parse_date("this-week", now), Some(at(2026, 3, 15, 0)));
        assert_eq!(parse_date("month", now), Some(at(2026, 3, 1, 0)));
        assert_eq!(parse_date("3d", now), Some(at(2026, 3, 15, 15)));
        assert_eq!(parse_date("2w", now), Some(at(2026, 3, 4, 15)));
        assert_eq!(parse_date("1m", now), Some(at(2026, 2, 18, 15)));
        assert_eq!(parse_date("3y", now), None);
    }

    #[test]
    fn test_unified_search_spans_stores() {
        let db = Arc::new(Database::in_memory().expect("Failed to create database"));
        initialize_account_schema(&db.connection().unwrap()).unwrap();
        let emails = EmailStore::new(db.clone());
        let events = EventStore::new(db.clone());
        let contacts = ContactStore::new(db);

        emails
            .put(&CachedEmail {
                id: "m1".to_string(),
                subject: "Launch checklist".to_string(),
                from_name: "Alice".to_string(),
                from_email: "alice@example.com".to_string(),
                ..Default::default()
            })
            .unwrap();
        events
            .put(&CachedEvent {
                id: "e1".to_string(),
                title: "Launch review".to_string(),
                location: "Room 2".to_string(),
                ..Default::default()
            })
            .unwrap();
        contacts
            .put(&CachedContact {
                id: "c1".to_string(),
                given_name: "Launch".to_string(),
                surname: "Partner".to_string(),
                email: "partner@example.com".to_string(),
                ..Default::default()
            })
            .unwrap();

        let results = unified_search(&emails, &events, &contacts, "launch", 0).unwrap();
        let kinds: Vec<ResultKind> = results.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![ResultKind::Email, ResultKind::Event, ResultKind::Contact]
        );
        assert_eq!(results[0].subtitle, "Alice <alice@example.com>");
        assert_eq!(results[1].subtitle, "Room 2");
        assert_eq!(results[2].title, "Launch Partner");

        assert!(unified_search(&emails, &events, &contacts, "nothing", 0)
            .unwrap()
            .is_empty());
    }
}
