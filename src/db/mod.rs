//! Client data repository and offline storage.
//!
//! [`Db`] is the dispatcher and holds the logic for deciding whether the
//! client is running online with access to the server or offline against
//! the local cache. [`OnlineDb`] owns the network relationship and
//! [`OfflineDb`] owns the persisted store and the outbox.

mod offline;
mod online;
mod schema;
mod store;

pub use offline::OfflineDb;
pub use online::{OnlineDb, SyncOutcome, SyncPhase};
pub use store::LocalStore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::{AppError, Result};
use crate::models::{DbEvent, EntryPage, Filter, FilterType};

/// A sync is considered overdue after this long without one.
const SYNC_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Session-wide mode flags and timestamps, shared by the whole triad
/// instead of living in a global namespace. All flags are independent
/// booleans; `broken` is the near-terminal one that keeps offline mode
/// off until the store is reinitialized.
pub struct SessionState {
    online: AtomicBool,
    broken: AtomicBool,
    enable_offline: AtomicBool,
    has_storage: AtomicBool,
    authorized: AtomicBool,
    /// A local change is waiting to be pushed to the server.
    needs_sync: AtomicBool,
    /// Local counters were changed optimistically; a concurrently fetched
    /// server value would be staler than what we already show.
    stats_dirty: AtomicBool,
    /// Someone is synchronously blocked on the in-flight sync.
    user_waiting: AtomicBool,
    first_sync: AtomicBool,
    last_update: Mutex<Option<DateTime<Utc>>>,
    last_sync: Mutex<Option<Instant>>,
    events: mpsc::UnboundedSender<DbEvent>,
}

impl SessionState {
    pub fn new(events: mpsc::UnboundedSender<DbEvent>, enable_offline: bool) -> Self {
        Self {
            online: AtomicBool::new(true),
            broken: AtomicBool::new(false),
            enable_offline: AtomicBool::new(enable_offline),
            has_storage: AtomicBool::new(false),
            authorized: AtomicBool::new(true),
            needs_sync: AtomicBool::new(false),
            stats_dirty: AtomicBool::new(false),
            user_waiting: AtomicBool::new(false),
            first_sync: AtomicBool::new(true),
            last_update: Mutex::new(None),
            last_sync: Mutex::new(None),
            events,
        }
    }

    pub fn emit(&self, event: DbEvent) {
        // The receiver disappearing just means nobody is listening anymore.
        let _ = self.events.send(event);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Flips to online; returns true when this was an actual transition.
    pub fn mark_online(&self) -> bool {
        let was_offline = !self.online.swap(true, Ordering::SeqCst);
        if was_offline {
            self.emit(DbEvent::WentOnline);
        }
        was_offline
    }

    /// Degrades to offline mode, which is only possible with a usable
    /// local store to fall back on.
    pub fn try_set_offline(&self) -> Result<()> {
        if !self.has_storage() || self.broken() {
            return Err(AppError::OfflineStorageNotAvailable);
        }
        if self.online.swap(false, Ordering::SeqCst) {
            self.emit(DbEvent::WentOffline);
        }
        Ok(())
    }

    /// Marks the local store unusable for the rest of the session.
    pub fn set_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.enable_offline.store(false, Ordering::SeqCst);
    }

    pub fn broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub fn enable_offline(&self) -> bool {
        self.enable_offline.load(Ordering::SeqCst)
    }

    pub fn has_storage(&self) -> bool {
        self.has_storage.load(Ordering::SeqCst)
    }

    pub fn set_has_storage(&self, value: bool) {
        self.has_storage.store(value, Ordering::SeqCst);
    }

    pub fn authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    pub fn set_authorized(&self, value: bool) {
        self.authorized.store(value, Ordering::SeqCst);
    }

    pub fn needs_sync(&self) -> bool {
        self.needs_sync.load(Ordering::SeqCst)
    }

    pub fn set_needs_sync(&self, value: bool) {
        self.needs_sync.store(value, Ordering::SeqCst);
    }

    pub fn stats_dirty(&self) -> bool {
        self.stats_dirty.load(Ordering::SeqCst)
    }

    pub fn set_stats_dirty(&self, value: bool) {
        self.stats_dirty.store(value, Ordering::SeqCst);
    }

    pub fn user_waiting(&self) -> bool {
        self.user_waiting.load(Ordering::SeqCst)
    }

    pub fn set_user_waiting(&self, value: bool) {
        self.user_waiting.store(value, Ordering::SeqCst);
    }

    pub fn first_sync(&self) -> bool {
        self.first_sync.load(Ordering::SeqCst)
    }

    pub fn set_first_sync(&self, value: bool) {
        self.first_sync.store(value, Ordering::SeqCst);
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.lock().unwrap()
    }

    pub fn set_last_update(&self, value: Option<DateTime<Utc>>) {
        *self.last_update.lock().unwrap() = value;
    }

    pub fn last_sync(&self) -> Option<Instant> {
        *self.last_sync.lock().unwrap()
    }

    pub fn set_last_sync_now(&self) {
        *self.last_sync.lock().unwrap() = Some(Instant::now());
    }
}

/// The mode dispatcher: decides, per request, whether to answer from the
/// local cache, the server, or both.
pub struct Db {
    pub state: Arc<SessionState>,
    pub offline: Option<Arc<OfflineDb>>,
    pub online: Arc<OnlineDb>,
}

impl Db {
    pub fn new(
        state: Arc<SessionState>,
        offline: Option<Arc<OfflineDb>>,
        online: Arc<OnlineDb>,
    ) -> Self {
        Self {
            state,
            offline,
            online,
        }
    }

    /// Comes back online after a degradation: triggers an immediate sync
    /// so the local view catches up (tags ride along in the response).
    #[allow(dead_code)]
    pub async fn set_online(&self) -> Result<()> {
        if self.state.mark_online() {
            self.sync(true).await?;
        }
        Ok(())
    }

    pub async fn try_online(&self) -> Result<()> {
        self.sync(true).await
    }

    /// Degrades to offline mode. Fails with a typed error when there is no
    /// usable local store, so callers can explain instead of guessing.
    pub fn set_offline(&self) -> Result<()> {
        if !self.state.has_storage() || self.state.broken() {
            return Err(AppError::OfflineStorageNotAvailable);
        }
        self.online.abandon_flight();
        self.state.try_set_offline()
    }

    /// Syncs if one is overdue: forced, local changes are waiting, or the
    /// last successful sync is older than five minutes (or never happened).
    /// With offline caching enabled the round goes through the outbox
    /// drain so queued writes are included.
    pub async fn sync(&self, force: bool) -> Result<()> {
        let stale = self.state.last_update().is_none()
            || self
                .state
                .last_sync()
                .map_or(true, |at| at.elapsed() > SYNC_STALE_AFTER);
        let should_sync = force || self.state.needs_sync() || stale;

        if !(should_sync && self.state.authorized() && self.state.is_online()) {
            return Ok(());
        }

        if self.state.enable_offline() && self.offline.is_some() {
            self.online.send_new_statuses().await
        } else {
            self.online.sync(None, false).await
        }
    }

    /// Answers one list request from the right side of the cache divide.
    ///
    /// Goes to the server when the filter needs dimensions the local query
    /// does not support (tag, source, search), when offline caching is off,
    /// or when the cache is known to be missing data relevant to this
    /// request while we are online. A transport failure on the online path
    /// degrades to offline mode and retries from the cache when possible.
    pub async fn reload_list(
        &self,
        filter: &Filter,
        append: bool,
        wait_for_sync: bool,
    ) -> Result<EntryPage> {
        if let Some(offline) = &self.offline {
            if !append || filter.kind != FilterType::Newest {
                offline.set_older_entries_online(false);
            }
        }

        if wait_for_sync {
            if let Some(flight) = self.online.current_flight() {
                self.state.set_user_waiting(true);
                // outcome irrelevant here: either way we serve the freshest
                // data available below
                let _ = self.online.await_flight(flight).await;
            }
        }

        let offline_capable = self.state.enable_offline() && self.offline.is_some();
        let cache_incomplete = self
            .offline
            .as_ref()
            .map_or(false, |o| o.older_entries_online() || o.should_load_entries_online());
        let use_online = filter.needs_server()
            || !offline_capable
            || (self.state.is_online() && cache_incomplete);

        if !use_online {
            return self
                .offline
                .as_ref()
                .ok_or(AppError::OfflineStorageNotAvailable)?
                .get_entries(filter)
                .await;
        }

        match self.online.get_entries(filter).await {
            Ok(page) => Ok(page),
            Err(AppError::Aborted) => Err(AppError::Aborted),
            Err(error) if error.is_transport() => {
                if offline_capable && !filter.needs_server() && self.state.try_set_offline().is_ok()
                {
                    if let Some(offline) = &self.offline {
                        return offline.get_entries(filter).await;
                    }
                }
                Err(error)
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Arc<SessionState>, mpsc::UnboundedReceiver<DbEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(SessionState::new(tx, true)), rx)
    }

    #[test]
    fn offline_needs_a_usable_store() {
        let (state, _rx) = session();
        assert!(matches!(
            state.try_set_offline(),
            Err(AppError::OfflineStorageNotAvailable)
        ));
        assert!(state.is_online());

        state.set_has_storage(true);
        state.try_set_offline().unwrap();
        assert!(!state.is_online());
    }

    #[test]
    fn broken_store_blocks_offline_mode() {
        let (state, _rx) = session();
        state.set_has_storage(true);
        state.set_broken();
        assert!(matches!(
            state.try_set_offline(),
            Err(AppError::OfflineStorageNotAvailable)
        ));
        assert!(!state.enable_offline());
    }

    #[test]
    fn mode_transitions_are_reported_once() {
        let (state, mut rx) = session();
        state.set_has_storage(true);

        state.try_set_offline().unwrap();
        state.try_set_offline().unwrap();
        assert!(matches!(rx.try_recv(), Ok(DbEvent::WentOffline)));
        assert!(rx.try_recv().is_err());

        assert!(state.mark_online());
        assert!(!state.mark_online());
        assert!(matches!(rx.try_recv(), Ok(DbEvent::WentOnline)));
        assert!(rx.try_recv().is_err());
    }
}
