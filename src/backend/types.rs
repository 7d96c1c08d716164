//! Records returned by the remote service, and their cached forms

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CachedCalendar, CachedContact, CachedEmail, CachedEvent, CachedFolder};

/// Paging for remote list calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListParams {
    /// Zero lets the service pick its page size
    pub limit: usize,
    pub since: Option<DateTime<Utc>>,
}

impl ListParams {
    pub fn with_limit(limit: usize) -> Self {
        Self { limit, since: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub email: String,
}

impl Participant {
    /// "Name <email>", or the bare address when there is no name
    pub fn display(&self) -> String {
        if self.name.is_empty() {
            self.email.clone()
        } else {
            format!("{} <{}>", self.name, self.email)
        }
    }
}

fn display_all(participants: &[Participant]) -> Vec<String> {
    participants.iter().map(Participant::display).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    /// Folder ids; the first one is the message's primary folder
    pub folders: Vec<String>,
    pub subject: String,
    pub snippet: String,
    pub from: Vec<Participant>,
    pub to: Vec<Participant>,
    pub cc: Vec<Participant>,
    pub bcc: Vec<Participant>,
    pub date: DateTime<Utc>,
    pub unread: bool,
    pub starred: bool,
    pub has_attachments: bool,
    pub body_html: String,
    pub body_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub system_folder: Option<String>,
    pub total_count: i64,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_primary: bool,
    pub read_only: bool,
    pub hex_color: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub calendar_id: String,
    pub title: String,
    pub description: String,
    pub location: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub all_day: bool,
    pub rrule: Option<String>,
    pub status: String,
    pub busy: bool,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub given_name: String,
    pub surname: String,
    pub display_name: Option<String>,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub company_name: String,
    pub job_title: String,
    pub notes: String,
    pub picture_url: String,
    pub groups: Vec<String>,
}

/// Partial update of a message. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub unread: Option<bool>,
    pub starred: Option<bool>,
    pub folders: Option<Vec<String>>,
}

impl From<&Message> for CachedEmail {
    fn from(msg: &Message) -> Self {
        let (from_name, from_email) = msg
            .from
            .first()
            .map(|p| (p.name.clone(), p.email.clone()))
            .unwrap_or_default();

        CachedEmail {
            id: msg.id.clone(),
            thread_id: msg.thread_id.clone(),
            folder_id: msg.folders.first().cloned().unwrap_or_default(),
            subject: msg.subject.clone(),
            snippet: msg.snippet.clone(),
            from_name,
            from_email,
            to: display_all(&msg.to),
            cc: display_all(&msg.cc),
            bcc: display_all(&msg.bcc),
            date: msg.date,
            unread: msg.unread,
            starred: msg.starred,
            has_attachments: msg.has_attachments,
            body_html: msg.body_html.clone(),
            body_text: msg.body_text.clone(),
            cached_at: Utc::now(),
        }
    }
}

impl From<&Folder> for CachedFolder {
    fn from(folder: &Folder) -> Self {
        CachedFolder {
            id: folder.id.clone(),
            name: folder.name.clone(),
            folder_type: folder.system_folder.clone().unwrap_or_default(),
            total_count: folder.total_count,
            unread_count: folder.unread_count,
            cached_at: Utc::now(),
        }
    }
}

impl From<&Calendar> for CachedCalendar {
    fn from(cal: &Calendar) -> Self {
        CachedCalendar {
            id: cal.id.clone(),
            name: cal.name.clone(),
            description: cal.description.clone(),
            is_primary: cal.is_primary,
            read_only: cal.read_only,
            hex_color: cal.hex_color.clone(),
            cached_at: Utc::now(),
        }
    }
}

impl From<&Event> for CachedEvent {
    fn from(evt: &Event) -> Self {
        CachedEvent {
            id: evt.id.clone(),
            calendar_id: evt.calendar_id.clone(),
            title: evt.title.clone(),
            description: evt.description.clone(),
            location: evt.location.clone(),
            start_time: evt.start_time,
            end_time: evt.end_time,
            all_day: evt.all_day,
            recurring: evt.rrule.is_some(),
            rrule: evt.rrule.clone().unwrap_or_default(),
            status: evt.status.clone(),
            busy: evt.busy,
            participants: display_all(&evt.participants),
            cached_at: Utc::now(),
        }
    }
}

impl From<&Contact> for CachedContact {
    fn from(c: &Contact) -> Self {
        let display_name = match &c.display_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("{} {}", c.given_name, c.surname).trim().to_string(),
        };

        CachedContact {
            id: c.id.clone(),
            email: c.emails.first().cloned().unwrap_or_default(),
            given_name: c.given_name.clone(),
            surname: c.surname.clone(),
            display_name,
            phone: c.phone_numbers.first().cloned().unwrap_or_default(),
            company: c.company_name.clone(),
            job_title: c.job_title.clone(),
            notes: c.notes.clone(),
            photo_url: c.picture_url.clone(),
            groups: c.groups.clone(),
            cached_at: Utc::now(),
        }
    }
}
