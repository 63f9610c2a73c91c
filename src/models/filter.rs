use chrono::{DateTime, Utc};

use super::Entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
    #[default]
    Newest,
    Unread,
    Starred,
}

impl FilterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterType::Newest => "newest",
            FilterType::Unread => "unread",
            FilterType::Starred => "starred",
        }
    }
}

/// Parameters of one list request, local or remote.
///
/// `from_datetime`/`from_id` together form the seek cursor: a page starts
/// strictly after that key in scan order. `extra_ids` pins entries that
/// must appear regardless of the active filter, e.g. a deep-linked entry.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub kind: FilterType,
    pub tag: Option<String>,
    pub source: Option<i64>,
    pub search: Option<String>,
    pub extra_ids: Vec<i64>,
    pub from_datetime: Option<DateTime<Utc>>,
    pub from_id: Option<i64>,
    pub offset: u32,
    pub items_per_page: u32,
}

impl Filter {
    pub fn new(kind: FilterType, items_per_page: u32) -> Self {
        Self {
            kind,
            items_per_page,
            ..Self::default()
        }
    }

    /// True when the filter uses a dimension the local cache cannot answer.
    pub fn needs_server(&self) -> bool {
        self.tag.is_some() || self.source.is_some() || self.search.is_some()
    }

    /// Continue this filter after the given entry.
    pub fn after(&self, entry: &Entry) -> Self {
        let mut next = self.clone();
        next.from_datetime = Some(entry.datetime);
        next.from_id = Some(entry.id);
        next.offset = 0;
        next
    }
}

/// One page of results plus whether more matches exist past it.
#[derive(Debug, Clone, Default)]
pub struct EntryPage {
    pub entries: Vec<Entry>,
    pub has_more: bool,
}
