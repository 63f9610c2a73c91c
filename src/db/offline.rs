use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{
    DbEvent, Entry, EntryPage, EntryStatusUpdate, Filter, FilterType, QueuedStatus, SourceInfo,
    StatusName, Stats, Tag,
};

use super::store::{
    entry_from_row, fmt_datetime, get_setting, get_stamp, offline_counts, parse_datetime,
    put_setting, put_stamp, upsert_entry, LocalStore, ENTRY_COLUMNS,
};
use super::SessionState;

const STAMP_LAST_ITEMS_UPDATE: &str = "lastItemsUpdate";
const STAMP_NEWEST_GCED: &str = "newestGCedEntry";
const STAMP_LAST_CLEANUP: &str = "lastCleanup";
const SETTING_OFFLINE_DAYS: &str = "offline_days";

/// The local cache and outbox. Owns the [`LocalStore`] exclusively; no
/// other component issues table writes.
pub struct OfflineDb {
    store: LocalStore,
    state: Arc<SessionState>,
    /// Handle to ourselves for background work spawned from the error seam.
    weak: Weak<OfflineDb>,
    unread_order_asc: bool,

    /// Highest entry id stored locally.
    last_item_id: AtomicI64,
    /// Datetime of the newest garbage collected entry: everything older
    /// may be missing locally.
    newest_gced: Mutex<DateTime<Utc>>,
    /// Retention window in days. Shrinks under storage-quota pressure and
    /// the shrink is persisted, so future sessions keep less history.
    offline_days: AtomicI64,

    newer_entries_missing: AtomicBool,
    should_load_entries_online: AtomicBool,
    older_entries_online: AtomicBool,
}

impl OfflineDb {
    /// Opens the store and restores session state from the persisted
    /// stamps: the delta-sync high-water mark and the GC boundary.
    pub async fn init(config: &Config, state: Arc<SessionState>) -> Result<Arc<Self>> {
        let (store, _created) = LocalStore::open(&config.db_path).await?;

        let db = Arc::new_cyclic(|weak| Self {
            store,
            state: Arc::clone(&state),
            weak: weak.clone(),
            unread_order_asc: config.unread_order_asc,
            last_item_id: AtomicI64::new(0),
            newest_gced: Mutex::new(Utc::now() - Duration::days(1)),
            offline_days: AtomicI64::new(i64::from(config.offline_days)),
            newer_entries_missing: AtomicBool::new(false),
            should_load_entries_online: AtomicBool::new(false),
            older_entries_online: AtomicBool::new(false),
        });

        let (last_update, gced_stamp, days_setting, last_id) = db
            .tr(|tx| {
                let last_update = get_stamp(tx, STAMP_LAST_ITEMS_UPDATE)?;
                let gced = get_stamp(tx, STAMP_NEWEST_GCED)?;
                let days = get_setting(tx, SETTING_OFFLINE_DAYS)?;
                let last_id: i64 =
                    tx.query_row("SELECT COALESCE(MAX(id), 0) FROM entries", [], |r| r.get(0))?;
                Ok((last_update, gced, days, last_id))
            })
            .await?;

        match last_update {
            Some(datetime) => {
                state.set_last_update(Some(datetime));
                state.set_first_sync(false);
            }
            // never synced: the first page has to come from the network
            None => db
                .should_load_entries_online
                .store(true, Ordering::SeqCst),
        }

        let now = Utc::now();
        let mut gced = gced_stamp.unwrap_or(now - Duration::days(1));
        if gced < now - Duration::days(3) {
            // stale stamp, pretend we only ever collected up to yesterday
            gced = now - Duration::days(1);
        }

        if let Some(days) = days_setting.and_then(|raw| raw.parse::<i64>().ok()) {
            db.offline_days.store(days, Ordering::SeqCst);
        }

        // The effective boundary is whichever is more recent: what was
        // actually collected, or the edge of the retention window.
        let retention_edge = now - Duration::days(db.offline_days.load(Ordering::SeqCst));
        if retention_edge > gced {
            gced = retention_edge;
        }
        *db.newest_gced.lock().unwrap() = gced;
        db.last_item_id.store(last_id, Ordering::SeqCst);

        db.reload_online_stats().await?;
        db.refresh_stats().await?;

        Ok(db)
    }

    /// The single error-handling seam every store transaction goes
    /// through: failures are reported, the cache is marked broken and
    /// offline mode disabled, the list is asked to reload from the
    /// network, and a quota failure additionally triggers one round of
    /// aggressive garbage collection. The failed write is not retried.
    async fn tr<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match self.store.transaction(f).await {
            Ok(value) => Ok(value),
            Err(error) => {
                self.state.emit(DbEvent::StorageBroken {
                    message: error.to_string(),
                });
                self.state.set_broken();
                self.state.emit(DbEvent::ReloadRequested);

                if matches!(error, AppError::StorageQuota) {
                    if let Some(db) = self.weak.upgrade() {
                        tokio::spawn(async move {
                            if let Err(gc_error) = db.gc_entries(true).await {
                                tracing::warn!("cleanup after quota failure failed: {}", gc_error);
                            }
                        });
                    }
                }

                Err(error)
            }
        }
    }

    pub fn last_item_id(&self) -> i64 {
        self.last_item_id.load(Ordering::SeqCst)
    }

    pub fn newest_gced(&self) -> DateTime<Utc> {
        *self.newest_gced.lock().unwrap()
    }

    pub fn offline_days(&self) -> i64 {
        self.offline_days.load(Ordering::SeqCst)
    }

    pub fn newer_entries_missing(&self) -> bool {
        self.newer_entries_missing.load(Ordering::SeqCst)
    }

    pub fn set_newer_entries_missing(&self, value: bool) {
        self.newer_entries_missing.store(value, Ordering::SeqCst);
    }

    pub fn should_load_entries_online(&self) -> bool {
        self.should_load_entries_online.load(Ordering::SeqCst)
    }

    pub fn set_should_load_entries_online(&self, value: bool) {
        self.should_load_entries_online.store(value, Ordering::SeqCst);
    }

    pub fn older_entries_online(&self) -> bool {
        self.older_entries_online.load(Ordering::SeqCst)
    }

    pub fn set_older_entries_online(&self, value: bool) {
        self.older_entries_online.store(value, Ordering::SeqCst);
    }

    /// Persists a batch of fetched entries. Garbage collection runs first
    /// in the same transaction, so the store never carries more than one
    /// cycle of excess before the new batch grows it again.
    pub async fn store_entries(&self, entries: Vec<Entry>) -> Result<()> {
        let boundary = self.newest_gced();
        let days = self.offline_days();

        let (collected, last_id, counts) = self
            .tr(move |tx| {
                let collected = gc_pass(tx, false, boundary, days, Utc::now())?;
                for entry in &entries {
                    upsert_entry(tx, entry)?;
                }
                let last_id: i64 =
                    tx.query_row("SELECT COALESCE(MAX(id), 0) FROM entries", [], |r| r.get(0))?;
                let counts = offline_counts(tx)?;
                Ok((collected, last_id, counts))
            })
            .await?;

        if let Some(boundary) = collected {
            *self.newest_gced.lock().unwrap() = boundary;
        }
        self.last_item_id.store(last_id, Ordering::SeqCst);
        self.emit_offline_counts(counts);
        Ok(())
    }

    /// Deletes read, unstarred entries older than the retention window.
    /// Runs at most once per day unless forced; `more` additionally
    /// shrinks the window first, which is the storage-pressure response:
    /// every quota failure permanently ratchets retention down.
    pub async fn gc_entries(&self, more: bool) -> Result<()> {
        if more {
            let kept_days = (Utc::now() - self.newest_gced()).num_days();
            let current = self.offline_days();
            let shrunk = (kept_days - 1).min(current - 1).max(0);
            self.offline_days.store(shrunk, Ordering::SeqCst);
        }

        let boundary = self.newest_gced();
        let days = self.offline_days();

        // Deliberately not routed through the error seam: this runs as the
        // seam's own recovery step.
        let collected = self
            .store
            .transaction(move |tx| {
                if more {
                    put_setting(tx, SETTING_OFFLINE_DAYS, &days.to_string())?;
                }
                gc_pass(tx, more, boundary, days, Utc::now())
            })
            .await?;

        if let Some(boundary) = collected {
            *self.newest_gced.lock().unwrap() = boundary;
        }
        Ok(())
    }

    /// The local paginated query.
    ///
    /// Scans `(datetime, id)` in page order and applies, per candidate:
    /// the pinned `extra_ids` bypass, the status filter, the offset skip,
    /// the seek cursor, and the fetch-one-extra `has_more` probe. For
    /// filters whose matches are not guaranteed to survive garbage
    /// collection, reaching a candidate older than the GC boundary means
    /// the store is incomplete past this point: the scan stops and the
    /// next page is forced online.
    pub async fn get_entries(&self, filter: &Filter) -> Result<EntryPage> {
        let ascending = self.unread_order_asc && filter.kind == FilterType::Unread;
        let boundary = self.newest_gced();
        let filter = filter.clone();

        let (entries, has_more, incomplete) = self
            .tr(move |tx| {
                let order = if ascending { "ASC" } else { "DESC" };
                let sql = format!(
                    "SELECT {} FROM entries ORDER BY datetime {}, id {}",
                    ENTRY_COLUMNS, order, order
                );
                let mut stmt = tx.prepare(&sql)?;
                let mut rows = stmt.query([])?;

                // unread and starred entries are exempt from GC, so those
                // filters can always be answered completely from the store
                let always_in_db =
                    matches!(filter.kind, FilterType::Unread | FilterType::Starred);
                let seek = filter.from_datetime.zip(filter.from_id);
                let page_size = filter.items_per_page as usize;
                let mut offset = filter.offset;

                let mut entries: Vec<Entry> = Vec::new();
                let mut has_more = false;
                let mut incomplete = false;

                while let Some(row) = rows.next()? {
                    let entry = entry_from_row(row)?;

                    let pinned = filter.extra_ids.contains(&entry.id);
                    if !pinned {
                        let keep = match filter.kind {
                            FilterType::Starred => entry.starred,
                            FilterType::Unread => entry.unread,
                            FilterType::Newest => true,
                        };
                        if !keep {
                            continue;
                        }
                        if offset > 0 {
                            offset -= 1;
                            continue;
                        }
                    }

                    // seek pagination: strictly past the cursor in scan
                    // order, ties on datetime broken by id
                    let in_page = match seek {
                        None => true,
                        Some(cursor) => {
                            if ascending {
                                entry.sort_key() > cursor
                            } else {
                                entry.sort_key() < cursor
                            }
                        }
                    };

                    if !ascending && !always_in_db && entry.datetime < boundary {
                        // older matching entries may have been collected;
                        // the next seek has to find them online
                        incomplete = true;
                        has_more = true;
                        break;
                    }

                    if in_page {
                        if entries.len() >= page_size {
                            // this candidate only existed to prove there
                            // is another page
                            has_more = true;
                            break;
                        }
                        entries.push(entry);
                    }
                }

                Ok((entries, has_more, incomplete))
            })
            .await?;

        if incomplete {
            self.older_entries_online.store(true, Ordering::SeqCst);
        }

        Ok(EntryPage { entries, has_more })
    }

    /// Point lookup by id.
    pub async fn get_entry(&self, id: i64) -> Result<Option<Entry>> {
        self.tr(move |tx| {
            tx.query_row(
                &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                entry_from_row,
            )
            .optional()
        })
        .await
    }

    /// Merges incoming status fields into matching local entries.
    ///
    /// With `update_stats`, counters are nudged only for actual
    /// transitions (the new value is compared against the stored one), so
    /// re-applying an unchanged status cannot double-count. With
    /// `dequeue` (status echoed back by the server), pending outbox rows
    /// for the entry are removed. A status for an entry missing locally
    /// flags the session for another sync instead of failing.
    pub async fn store_entry_statuses(
        &self,
        statuses: &[EntryStatusUpdate],
        dequeue: bool,
        update_stats: bool,
    ) -> Result<()> {
        let statuses = statuses.to_vec();

        let (missing, counts) = self
            .tr(move |tx| {
                let mut unread_diff = 0i64;
                let mut starred_diff = 0i64;
                let mut missing = false;

                for status in &statuses {
                    let current: Option<(bool, bool)> = tx
                        .query_row(
                            "SELECT unread, starred FROM entries WHERE id = ?1",
                            params![status.id],
                            |row| {
                                Ok((row.get::<_, i64>(0)? != 0, row.get::<_, i64>(1)? != 0))
                            },
                        )
                        .optional()?;

                    match current {
                        Some((was_unread, was_starred)) => {
                            if let Some(unread) = status.unread {
                                if update_stats && unread != was_unread {
                                    unread_diff += if unread { 1 } else { -1 };
                                }
                                tx.execute(
                                    "UPDATE entries SET unread = ?1 WHERE id = ?2",
                                    params![unread, status.id],
                                )?;
                            }
                            if let Some(starred) = status.starred {
                                if update_stats && starred != was_starred {
                                    starred_diff += if starred { 1 } else { -1 };
                                }
                                tx.execute(
                                    "UPDATE entries SET starred = ?1 WHERE id = ?2",
                                    params![starred, status.id],
                                )?;
                            }
                        }
                        // the status of an entry missing from the cache was
                        // updated: local state is behind the server
                        None => missing = true,
                    }

                    if dequeue {
                        tx.execute(
                            "DELETE FROM statusq WHERE entry_id = ?1",
                            params![status.id],
                        )?;
                    }
                }

                if update_stats {
                    for (name, diff) in [("unread", unread_diff), ("starred", starred_diff)] {
                        if diff != 0 {
                            tx.execute(
                                "UPDATE stats SET value = value + ?1 WHERE name = ?2",
                                params![diff, name],
                            )?;
                        }
                    }
                }

                let counts = offline_counts(tx)?;
                Ok((missing, counts))
            })
            .await?;

        if missing {
            self.state.set_needs_sync(true);
        }
        self.emit_offline_counts(counts);
        Ok(())
    }

    /// Locally issued read/unread changes, applied optimistically.
    pub async fn entries_mark(&self, ids: &[i64], unread: bool) -> Result<()> {
        self.state.set_stats_dirty(true);
        let statuses: Vec<EntryStatusUpdate> = ids
            .iter()
            .map(|&id| EntryStatusUpdate::unread(id, unread))
            .collect();
        self.store_entry_statuses(&statuses, false, true).await
    }

    pub async fn entry_mark(&self, id: i64, unread: bool) -> Result<()> {
        self.entries_mark(&[id], unread).await
    }

    pub async fn entry_star(&self, id: i64, starred: bool) -> Result<()> {
        self.store_entry_statuses(&[EntryStatusUpdate::starred(id, starred)], false, true)
            .await
    }

    /// Durably queues a status change for the server.
    pub async fn enqueue_statuses(
        &self,
        statuses: Vec<(i64, StatusName, bool)>,
    ) -> Result<()> {
        if statuses.is_empty() {
            return Ok(());
        }
        self.state.set_needs_sync(true);

        let now = Utc::now();
        self.tr(move |tx| {
            for (entry_id, name, value) in &statuses {
                tx.execute(
                    "INSERT INTO statusq (entry_id, name, value, datetime) VALUES (?1, ?2, ?3, ?4)",
                    params![entry_id, name.as_str(), value, fmt_datetime(now)],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn enqueue_status(
        &self,
        entry_id: i64,
        name: StatusName,
        value: bool,
    ) -> Result<()> {
        self.enqueue_statuses(vec![(entry_id, name, value)]).await
    }

    /// Everything currently waiting in the outbox, oldest first. Rows stay
    /// queued until the server echoes a superseding status back, so a sync
    /// interrupted between request and response loses nothing.
    pub async fn queued_statuses(&self) -> Result<Vec<QueuedStatus>> {
        self.tr(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, entry_id, name, value, datetime FROM statusq ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                let name: String = row.get(2)?;
                let datetime: String = row.get(4)?;
                Ok(QueuedStatus {
                    id: row.get(0)?,
                    entry_id: row.get(1)?,
                    name: StatusName::from_str(&name).unwrap_or(StatusName::Unread),
                    value: row.get::<_, i64>(3)? != 0,
                    datetime: parse_datetime(&datetime).unwrap_or_else(Utc::now),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    /// The outbox shaped into the sync call's `updatedStatuses` format.
    pub async fn queued_status_payload(&self) -> Result<Vec<EntryStatusUpdate>> {
        let queued = self.queued_statuses().await?;
        Ok(queued.iter().map(QueuedStatus::to_update).collect())
    }

    /// Mirrors server-reported counters into the store.
    pub async fn store_stats(&self, stats: Stats) -> Result<()> {
        self.tr(move |tx| {
            for (name, value) in [
                ("total", stats.total),
                ("unread", stats.unread),
                ("starred", stats.starred),
            ] {
                tx.execute(
                    "UPDATE stats SET value = ?1 WHERE name = ?2",
                    params![value, name],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.tr(|tx| {
            let mut stats = Stats::default();
            let mut stmt = tx.prepare("SELECT name, value FROM stats")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (name, value) = row?;
                match name.as_str() {
                    "total" => stats.total = value,
                    "unread" => stats.unread = value,
                    "starred" => stats.starred = value,
                    _ => {}
                }
            }
            Ok(stats)
        })
        .await
    }

    /// Pushes the persisted (server-mirrored) counters to the UI.
    pub async fn reload_online_stats(&self) -> Result<()> {
        let stats = self.stats().await?;
        self.state.emit(DbEvent::StatsChanged(stats));
        Ok(())
    }

    /// Recomputes counters over the stored entries. This full recount is
    /// authoritative and corrects any drift the incremental nudging of
    /// `stats` may have accumulated.
    pub async fn refresh_stats(&self) -> Result<()> {
        let counts = self.tr(offline_counts).await?;
        self.emit_offline_counts(counts);
        Ok(())
    }

    /// Advances the delta-sync high-water mark. Always written after the
    /// table writes it describes, never before.
    pub async fn store_last_update(&self, last_update: DateTime<Utc>) -> Result<()> {
        self.tr(move |tx| put_stamp(tx, STAMP_LAST_ITEMS_UPDATE, last_update))
            .await
    }

    pub async fn store_tags(&self, tags: &[Tag]) -> Result<()> {
        let tags = tags.to_vec();
        self.tr(move |tx| {
            tx.execute("DELETE FROM tags", [])?;
            for tag in &tags {
                tx.execute(
                    "INSERT INTO tags (tag, color, unread) VALUES (?1, ?2, ?3)",
                    params![tag.tag, tag.color, tag.unread],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn store_sources(&self, sources: &[SourceInfo]) -> Result<()> {
        let sources = sources.to_vec();
        self.tr(move |tx| {
            tx.execute("DELETE FROM sources", [])?;
            for source in &sources {
                tx.execute(
                    "INSERT INTO sources (id, title, unread) VALUES (?1, ?2, ?3)",
                    params![source.id, source.title, source.unread],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Drops all cached state, returning the store to its initial shape.
    pub async fn clear(&self) -> Result<()> {
        self.store
            .transaction(|tx| {
                for table in ["entries", "statusq", "stamps", "tags", "sources"] {
                    tx.execute(&format!("DELETE FROM {}", table), [])?;
                }
                tx.execute("UPDATE stats SET value = 0", [])?;
                tx.execute(
                    "DELETE FROM settings WHERE name = ?1",
                    params![SETTING_OFFLINE_DAYS],
                )?;
                Ok(())
            })
            .await?;

        self.last_item_id.store(0, Ordering::SeqCst);
        *self.newest_gced.lock().unwrap() = Utc::now() - Duration::days(1);
        self.state.set_last_update(None);
        self.state.set_first_sync(true);
        self.should_load_entries_online.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn emit_offline_counts(&self, (total, unread, starred): (i64, i64, i64)) {
        self.state.emit(DbEvent::OfflineCountsChanged {
            total,
            unread,
            starred,
        });
    }
}

/// One garbage collection pass inside an existing transaction. Gated to
/// once per day by the `lastCleanup` stamp unless forced. Deletes entries
/// older than the retention window that are neither unread nor starred,
/// then advances the boundary stamp to the newest deleted datetime.
fn gc_pass(
    tx: &Transaction,
    force: bool,
    boundary: DateTime<Utc>,
    offline_days: i64,
    now: DateTime<Utc>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let last_cleanup = get_stamp(tx, STAMP_LAST_CLEANUP)?;
    let due = force || last_cleanup.map_or(true, |at| now - at > Duration::days(1));
    if !due {
        return Ok(None);
    }

    let limit = fmt_datetime(now - Duration::days(offline_days));
    let newest_deleted: Option<String> = tx.query_row(
        "SELECT MAX(datetime) FROM entries WHERE datetime < ?1 AND unread = 0 AND starred = 0",
        params![limit],
        |row| row.get(0),
    )?;
    tx.execute(
        "DELETE FROM entries WHERE datetime < ?1 AND unread = 0 AND starred = 0",
        params![limit],
    )?;

    let mut boundary = boundary;
    if let Some(datetime) = newest_deleted.as_deref().and_then(parse_datetime) {
        if datetime > boundary {
            boundary = datetime;
        }
    }

    put_stamp(tx, STAMP_LAST_CLEANUP, now)?;
    put_stamp(tx, STAMP_NEWEST_GCED, boundary)?;
    Ok(Some(boundary))
}
