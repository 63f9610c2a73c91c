use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Entry, EntryStatusUpdate, SourceInfo, Stats, Tag};

/// Parameters of one delta-sync round.
///
/// Sent as query parameters on a plain sync, or as a JSON body when
/// `updatedStatuses` carries outbox entries (the server treats that as a
/// write and expects a POST). Field names follow the server's API.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRequest {
    pub since: DateTime<Utc>,

    pub tags: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<bool>,

    /// Omitted entirely on the first-ever sync: with nothing synced yet
    /// there is no baseline to compute status deltas against.
    #[serde(rename = "itemsStatuses", skip_serializing_if = "Option::is_none")]
    pub items_statuses: Option<bool>,

    #[serde(rename = "updatedStatuses", skip_serializing_if = "Option::is_none")]
    pub updated_statuses: Option<Vec<EntryStatusUpdate>>,

    // Windowing hints so the server bounds how many new items it pushes
    // toward an offline-capable client.
    #[serde(rename = "itemsSinceId", skip_serializing_if = "Option::is_none")]
    pub items_since_id: Option<i64>,

    #[serde(rename = "itemsNotBefore", skip_serializing_if = "Option::is_none")]
    pub items_not_before: Option<DateTime<Utc>>,

    #[serde(rename = "itemsHowMany", skip_serializing_if = "Option::is_none")]
    pub items_how_many: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    #[serde(rename = "lastUpdate")]
    pub last_update: DateTime<Utc>,

    #[serde(rename = "newItems", default)]
    pub new_items: Option<Vec<Entry>>,

    /// Highest item id the server currently has, regardless of how many
    /// items this response actually carries.
    #[serde(rename = "lastId", default)]
    pub last_id: Option<i64>,

    #[serde(rename = "itemUpdates", default)]
    pub item_updates: Option<Vec<EntryStatusUpdate>>,

    #[serde(default)]
    pub stats: Option<Stats>,

    #[serde(default)]
    pub tags: Option<Vec<Tag>>,

    #[serde(default)]
    pub sources: Option<Vec<SourceInfo>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse {
    pub entries: Vec<Entry>,

    #[serde(rename = "hasMore")]
    pub has_more: bool,

    #[serde(default)]
    pub all: i64,
    #[serde(default)]
    pub unread: i64,
    #[serde(default)]
    pub starred: i64,

    #[serde(default)]
    pub tags: Option<Vec<Tag>>,

    #[serde(default)]
    pub sources: Option<Vec<SourceInfo>>,

    #[serde(rename = "lastUpdate", default)]
    pub last_update: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sync_request_omits_absent_fields() {
        let req = SyncRequest {
            since: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            tags: true,
            sources: None,
            items_statuses: None,
            updated_statuses: None,
            items_since_id: None,
            items_not_before: None,
            items_how_many: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("since"));
        assert!(obj.contains_key("tags"));
        assert!(!obj.contains_key("itemsStatuses"));
        assert!(!obj.contains_key("updatedStatuses"));
        assert!(!obj.contains_key("itemsSinceId"));
    }

    #[test]
    fn sync_response_parses_minimal_payload() {
        let data: SyncResponse =
            serde_json::from_str(r#"{"lastUpdate": "2024-05-01T12:00:00Z"}"#).unwrap();
        assert!(data.new_items.is_none());
        assert!(data.stats.is_none());
        assert_eq!(
            data.last_update,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn sync_response_parses_full_payload() {
        let data: SyncResponse = serde_json::from_str(
            r#"{
                "lastUpdate": "2024-05-01T12:00:00Z",
                "newItems": [{
                    "id": 7,
                    "datetime": "2024-05-01T11:59:00Z",
                    "title": "hello",
                    "content": "<p>hi</p>",
                    "link": "https://example.org/7",
                    "sourcetitle": "Example",
                    "unread": true,
                    "starred": false
                }],
                "lastId": 9,
                "itemUpdates": [{"id": 3, "unread": false}],
                "stats": {"total": 10, "unread": 4, "starred": 1}
            }"#,
        )
        .unwrap();
        let items = data.new_items.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, 7);
        assert_eq!(items[0].source_title.as_deref(), Some("Example"));
        assert_eq!(data.last_id, Some(9));
        let updates = data.item_updates.unwrap();
        assert_eq!(updates[0].unread, Some(false));
        assert_eq!(data.stats.unwrap().unread, 4);
    }
}
