use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One feed item as known to the client.
///
/// `id` is assigned by the server and is globally unique; `(datetime, id)`
/// is the total order used as the sort and seek key everywhere. Everything
/// besides the status flags is display payload the sync core carries along
/// without interpreting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub datetime: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(rename = "sourcetitle", default)]
    pub source_title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    pub unread: bool,
    pub starred: bool,
}

impl Entry {
    /// The composite seek key.
    pub fn sort_key(&self) -> (DateTime<Utc>, i64) {
        (self.datetime, self.id)
    }
}

/// A status change for a single entry, as exchanged with the server
/// (`itemUpdates` in a sync response) and applied to the local cache.
/// Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryStatusUpdate {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starred: Option<bool>,
}

impl EntryStatusUpdate {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            datetime: None,
            unread: None,
            starred: None,
        }
    }

    pub fn unread(id: i64, unread: bool) -> Self {
        Self {
            unread: Some(unread),
            ..Self::new(id)
        }
    }

    pub fn starred(id: i64, starred: bool) -> Self {
        Self {
            starred: Some(starred),
            ..Self::new(id)
        }
    }
}

/// The two boolean statuses the server tracks per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusName {
    Unread,
    Starred,
}

impl StatusName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusName::Unread => "unread",
            StatusName::Starred => "starred",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "unread" => Some(StatusName::Unread),
            "starred" => Some(StatusName::Starred),
            _ => None,
        }
    }
}

/// A pending, not-yet-confirmed status change waiting in the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedStatus {
    pub id: i64,
    pub entry_id: i64,
    pub name: StatusName,
    pub value: bool,
    pub datetime: DateTime<Utc>,
}

impl QueuedStatus {
    /// Wire shape for the `updatedStatuses` sync parameter.
    pub fn to_update(&self) -> EntryStatusUpdate {
        let mut update = EntryStatusUpdate::new(self.entry_id);
        update.datetime = Some(self.datetime);
        match self.name {
            StatusName::Unread => update.unread = Some(self.value),
            StatusName::Starred => update.starred = Some(self.value),
        }
        update
    }
}

/// Aggregate counters as reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total: i64,
    pub unread: i64,
    pub starred: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub tag: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub unread: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub unread: i64,
}
