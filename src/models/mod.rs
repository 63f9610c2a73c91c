mod entry;
mod filter;

pub use entry::{Entry, EntryStatusUpdate, QueuedStatus, SourceInfo, StatusName, Stats, Tag};
pub use filter::{EntryPage, Filter, FilterType};

/// Notifications the sync core pushes toward whatever front end is attached.
/// The core never renders anything itself; it only reports what changed.
#[derive(Debug, Clone)]
pub enum DbEvent {
    /// Authoritative server-side counters.
    StatsChanged(Stats),
    /// Recomputed counters over the locally cached entries only.
    OfflineCountsChanged { total: i64, unread: i64, starred: i64 },
    /// Status changes echoed by the server, already merged locally.
    EntryStatusesChanged(Vec<EntryStatusUpdate>),
    TagsChanged(Vec<Tag>),
    SourcesChanged(Vec<SourceInfo>),
    WentOnline,
    WentOffline,
    /// The local store failed a transaction and offline mode was disabled.
    StorageBroken { message: String },
    SyncFailed { message: String },
    /// The currently displayed list is stale and should be re-requested.
    ReloadRequested,
}
