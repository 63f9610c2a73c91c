use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{AbortHandle, Abortable};
use tokio::sync::watch;

use crate::api::{ItemsApi, SyncRequest};
use crate::error::{AppError, Result};
use crate::models::{DbEvent, EntryPage, EntryStatusUpdate, Filter, Stats};

use super::{OfflineDb, SessionState};

/// How long a synchronously waiting caller observes an in-flight sync
/// before giving up and falling back to local data. The request itself
/// keeps running and its result still lands in the store.
const USER_WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Where the single-flight sync currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
    /// The round finished but left work behind: more items to fetch or an
    /// outbox to drain, handled by one chained follow-up round.
    ApplyingFollowUp,
}

/// What a finished sync resolved to, shared by every waiter.
pub type SyncOutcome = std::result::Result<(), Arc<AppError>>;

struct Flight {
    tx: watch::Sender<Option<SyncOutcome>>,
}

/// The network side: the delta-sync protocol and the direct list fetch.
pub struct OnlineDb {
    api: Arc<dyn ItemsApi>,
    state: Arc<SessionState>,
    offline: Option<Arc<OfflineDb>>,
    /// Handle to ourselves for the background task a sync runs as.
    weak: Weak<OnlineDb>,
    items_per_page: u32,
    /// Ask the server for per-source statistics (the sources panel is
    /// open, or the equivalent configuration is set).
    wants_sources: AtomicBool,

    flight: Mutex<Option<Flight>>,
    phase: Mutex<SyncPhase>,
    user_wait_limit: Duration,

    active_list: Mutex<Option<(u64, AbortHandle)>>,
    list_seq: AtomicU64,
}

impl OnlineDb {
    pub fn new(
        api: Arc<dyn ItemsApi>,
        state: Arc<SessionState>,
        offline: Option<Arc<OfflineDb>>,
        items_per_page: u32,
        wants_sources: bool,
    ) -> Arc<Self> {
        Self::build(api, state, offline, items_per_page, wants_sources, USER_WAIT_LIMIT)
    }

    fn build(
        api: Arc<dyn ItemsApi>,
        state: Arc<SessionState>,
        offline: Option<Arc<OfflineDb>>,
        items_per_page: u32,
        wants_sources: bool,
        user_wait_limit: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            api,
            state,
            offline,
            weak: weak.clone(),
            items_per_page,
            wants_sources: AtomicBool::new(wants_sources),
            flight: Mutex::new(None),
            phase: Mutex::new(SyncPhase::Idle),
            user_wait_limit,
            active_list: Mutex::new(None),
            list_seq: AtomicU64::new(0),
        })
    }

    /// Toggled when the UI opens or closes its sources panel.
    #[allow(dead_code)]
    pub fn set_wants_sources(&self, value: bool) {
        self.wants_sources.store(value, Ordering::SeqCst);
    }

    /// A receiver for the in-flight sync, if any.
    pub fn current_flight(&self) -> Option<watch::Receiver<Option<SyncOutcome>>> {
        self.flight
            .lock()
            .unwrap()
            .as_ref()
            .map(|flight| flight.tx.subscribe())
    }

    fn begin(&self) -> watch::Receiver<Option<SyncOutcome>> {
        let mut flight = self.flight.lock().unwrap();
        match &*flight {
            Some(existing) => existing.tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(None);
                *flight = Some(Flight { tx });
                rx
            }
        }
    }

    fn done(&self, outcome: SyncOutcome) {
        let flight = self.flight.lock().unwrap().take();
        if let Some(flight) = flight {
            let _ = flight.tx.send(Some(outcome));
        }
        self.state.set_user_waiting(false);
    }

    /// Stops observing the in-flight sync, e.g. when going offline.
    pub fn abandon_flight(&self) {
        self.done(Err(Arc::new(AppError::Aborted)));
    }

    /// Waits for a sync outcome. A caller the user is waiting on abandons
    /// observation after a grace period so the UI can fall back to local
    /// data while the request finishes unobserved.
    pub async fn await_flight(
        &self,
        mut rx: watch::Receiver<Option<SyncOutcome>>,
    ) -> Result<()> {
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome.map_err(|error| error.clone_for_waiter());
            }

            if self.state.user_waiting() {
                match tokio::time::timeout(self.user_wait_limit, rx.changed()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => return Err(AppError::SyncTimeout),
                    Err(_) => {
                        self.state.set_user_waiting(false);
                        return Err(AppError::SyncTimeout);
                    }
                }
            } else if rx.changed().await.is_err() {
                return Err(AppError::SyncTimeout);
            }
        }
    }

    /// One logical sync. At most one is in flight: a concurrent plain call
    /// joins it, while a concurrent call carrying statuses is rejected so
    /// the queued changes are not silently dropped (the caller retries).
    /// `chained` marks the follow-up round an earlier sync scheduled; it
    /// bypasses the join logic.
    pub fn sync<'a>(
        &'a self,
        updated_statuses: Option<Vec<EntryStatusUpdate>>,
        chained: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        // Boxed with a declared `Send` return type to break the
        // recursive-async auto-trait inference cycle (`sync` spawns a task
        // that may call `send_new_statuses`, which calls `sync` again).
        Box::pin(self.sync_inner(updated_statuses, chained))
    }

    async fn sync_inner(
        &self,
        updated_statuses: Option<Vec<EntryStatusUpdate>>,
        chained: bool,
    ) -> Result<()> {
        let joined = {
            let flight = self.flight.lock().unwrap();
            match &*flight {
                Some(existing) if !chained => {
                    if updated_statuses.is_some() {
                        return Err(AppError::SyncInProgress);
                    }
                    Some(existing.tx.subscribe())
                }
                _ => None,
            }
        };
        if let Some(rx) = joined {
            return self.await_flight(rx).await;
        }

        let rx = self.begin();
        *self.phase.lock().unwrap() = SyncPhase::Syncing;

        let Some(db) = self.weak.upgrade() else {
            // being torn down; nobody will run this flight
            self.done(Err(Arc::new(AppError::Aborted)));
            return Err(AppError::Aborted);
        };
        tokio::spawn(async move {
            match db.run_sync(updated_statuses).await {
                Ok(follow_up) => {
                    db.done(Ok(()));
                    if follow_up {
                        *db.phase.lock().unwrap() = SyncPhase::ApplyingFollowUp;
                        if let Err(error) = db.send_new_statuses().await {
                            tracing::warn!("chained sync failed: {}", error);
                        }
                    }
                }
                Err(error) => {
                    if error.is_transport() {
                        let _ = db.state.try_set_offline();
                    }
                    if matches!(error, AppError::Forbidden) {
                        db.state.set_authorized(false);
                    }
                    db.state.emit(DbEvent::SyncFailed {
                        message: error.to_string(),
                    });
                    db.done(Err(Arc::new(error)));
                }
            }
            *db.phase.lock().unwrap() = SyncPhase::Idle;
        });

        self.await_flight(rx).await
    }

    /// Drains the outbox into one batch and runs a chained sync with it.
    /// Rows are not removed here; only the server echoing the statuses
    /// back dequeues them, which makes the outbox at-least-once.
    pub async fn send_new_statuses(&self) -> Result<()> {
        let payload = match &self.offline {
            Some(offline) => {
                let statuses = offline.queued_status_payload().await?;
                (!statuses.is_empty()).then_some(statuses)
            }
            None => None,
        };

        self.sync(payload, true).await?;
        self.state.set_needs_sync(false);
        Ok(())
    }

    /// The actual protocol round. Returns whether a follow-up round is
    /// needed (items still missing on the server side, or local statuses
    /// still waiting).
    async fn run_sync(&self, updated_statuses: Option<Vec<EntryStatusUpdate>>) -> Result<bool> {
        let state = &self.state;

        let first_sync = state.first_sync() || state.last_update().is_none();
        let since = state
            .last_update()
            .filter(|_| !first_sync)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let offline = self
            .offline
            .as_ref()
            .filter(|_| state.enable_offline());

        let mut request = SyncRequest {
            since,
            tags: true,
            sources: self.wants_sources.load(Ordering::SeqCst).then_some(true),
            // on the very first sync there is nothing to delta against
            items_statuses: (!first_sync).then_some(true),
            updated_statuses,
            items_since_id: None,
            items_not_before: None,
            items_how_many: None,
        };
        if let Some(offline) = offline {
            request.items_since_id = Some(offline.last_item_id());
            request.items_not_before = Some(offline.newest_gced());
            request.items_how_many = Some(self.items_per_page);
        }

        state.set_stats_dirty(false);

        let data = self.api.sync(request).await?;

        state.mark_online();
        state.set_last_sync_now();
        state.set_first_sync(false);

        let mut follow_up = false;

        if let Some(offline) = offline {
            if let Some(new_items) = &data.new_items {
                let max_received = new_items.iter().map(|item| item.id).max().unwrap_or(0);
                // the server has newer items than it sent in this page
                let newer_missing = data.last_id.is_some_and(|last_id| {
                    last_id > offline.last_item_id() && last_id > max_received
                });
                offline.set_newer_entries_missing(newer_missing);
                offline.set_should_load_entries_online(data.last_id.is_some_and(|last_id| {
                    last_id - offline.last_item_id() > 2 * i64::from(self.items_per_page)
                }));

                offline.store_entries(new_items.clone()).await?;
                offline.store_last_update(data.last_update).await?;
            }

            follow_up = offline.newer_entries_missing() || state.needs_sync();

            if let Some(item_updates) = &data.item_updates {
                // refresh entry statuses and dequeue confirmed rows, but
                // leave the counters to the server-provided stats below
                offline
                    .store_entry_statuses(item_updates, true, false)
                    .await?;
                offline.store_last_update(data.last_update).await?;
            }

            if let Some(stats) = data.stats {
                offline.store_stats(stats).await?;
            }
            if let Some(tags) = &data.tags {
                offline.store_tags(tags).await?;
            }
            if let Some(sources) = &data.sources {
                offline.store_sources(sources).await?;
            }
        }

        if let Some(stats) = data.stats {
            // a fresher optimistic local value beats the server's snapshot
            if !state.stats_dirty() {
                state.emit(DbEvent::StatsChanged(stats));
            }
        }
        if let Some(tags) = data.tags {
            state.emit(DbEvent::TagsChanged(tags));
        }
        if let Some(sources) = data.sources {
            state.emit(DbEvent::SourcesChanged(sources));
        }
        if let Some(item_updates) = data.item_updates {
            state.emit(DbEvent::EntryStatusesChanged(item_updates));
        }

        // the high-water mark moves only after every write it describes
        state.set_last_update(Some(data.last_update));

        Ok(follow_up)
    }

    /// The direct paginated list fetch. Starting a new one cancels the
    /// previous one outright; the superseded request reports `Aborted`,
    /// which callers treat as a non-error.
    pub async fn get_entries(&self, filter: &Filter) -> Result<EntryPage> {
        let seq = self.list_seq.fetch_add(1, Ordering::SeqCst);
        let (handle, registration) = AbortHandle::new_pair();
        {
            let mut active = self.active_list.lock().unwrap();
            if let Some((_, previous)) = active.take() {
                previous.abort();
            }
            *active = Some((seq, handle));
        }

        let result = match Abortable::new(self.api.get_items(filter), registration).await {
            Err(futures::future::Aborted) => Err(AppError::Aborted),
            Ok(inner) => inner,
        };

        {
            let mut active = self.active_list.lock().unwrap();
            if matches!(&*active, Some((current, _)) if *current == seq) {
                *active = None;
            }
        }

        let data = result?;

        self.state.mark_online();
        if !self.state.enable_offline() {
            self.state.set_last_sync_now();
            if let Some(last_update) = data.last_update {
                self.state.set_last_update(Some(last_update));
            }
        }

        self.state.emit(DbEvent::StatsChanged(Stats {
            total: data.all,
            unread: data.unread,
            starred: data.starred,
        }));
        if let Some(tags) = data.tags {
            self.state.emit(DbEvent::TagsChanged(tags));
        }
        if let Some(sources) = data.sources {
            self.state.emit(DbEvent::SourcesChanged(sources));
        }

        Ok(EntryPage {
            entries: data.entries,
            has_more: data.has_more,
        })
    }

    /// Direct status writes for the optimistic online path.
    pub async fn set_entry_unread(&self, id: i64, unread: bool) -> Result<()> {
        self.api.set_unread(id, unread).await?;
        self.state.mark_online();
        Ok(())
    }

    pub async fn set_entry_starred(&self, id: i64, starred: bool) -> Result<()> {
        self.api.set_starred(id, starred).await?;
        self.state.mark_online();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::api::{ListResponse, SyncResponse};
    use crate::config::Config;
    use crate::db::Db;
    use crate::models::{Entry, FilterType, StatusName};

    enum SyncReply {
        Ok(SyncResponse),
        Transport,
        Forbidden,
    }

    enum ListReply {
        Ok(ListResponse),
        Transport,
    }

    struct MockApi {
        delay: Duration,
        sync_requests: Mutex<Vec<SyncRequest>>,
        sync_replies: Mutex<VecDeque<SyncReply>>,
        list_replies: Mutex<VecDeque<ListReply>>,
        list_calls: AtomicUsize,
    }

    impl MockApi {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                sync_requests: Mutex::new(Vec::new()),
                sync_replies: Mutex::new(VecDeque::new()),
                list_replies: Mutex::new(VecDeque::new()),
                list_calls: AtomicUsize::new(0),
            }
        }

        fn queue_sync(&self, reply: SyncReply) {
            self.sync_replies.lock().unwrap().push_back(reply);
        }

        fn queue_list(&self, reply: ListReply) {
            self.list_replies.lock().unwrap().push_back(reply);
        }

        fn sync_count(&self) -> usize {
            self.sync_requests.lock().unwrap().len()
        }

        fn sync_request(&self, index: usize) -> SyncRequest {
            self.sync_requests.lock().unwrap()[index].clone()
        }
    }

    // A refused local connect is the cheapest honest transport error.
    async fn transport_error() -> AppError {
        let error = reqwest::Client::new()
            .get("http://127.0.0.1:1/")
            .timeout(Duration::from_millis(250))
            .send()
            .await
            .expect_err("nothing should be listening on port 1");
        AppError::Network(error)
    }

    fn sync_response() -> SyncResponse {
        SyncResponse {
            last_update: Utc::now(),
            new_items: Some(vec![]),
            last_id: None,
            item_updates: None,
            stats: None,
            tags: None,
            sources: None,
        }
    }

    fn list_response(entries: Vec<Entry>) -> ListResponse {
        ListResponse {
            entries,
            has_more: false,
            all: 0,
            unread: 0,
            starred: 0,
            tags: None,
            sources: None,
            last_update: None,
        }
    }

    #[async_trait]
    impl ItemsApi for MockApi {
        async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
            tokio::time::sleep(self.delay).await;
            self.sync_requests.lock().unwrap().push(request);
            let reply = self.sync_replies.lock().unwrap().pop_front();
            match reply {
                Some(SyncReply::Ok(response)) => Ok(response),
                Some(SyncReply::Transport) => Err(transport_error().await),
                Some(SyncReply::Forbidden) => Err(AppError::Forbidden),
                None => Ok(sync_response()),
            }
        }

        async fn get_items(&self, _filter: &Filter) -> Result<ListResponse> {
            tokio::time::sleep(self.delay).await;
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.list_replies.lock().unwrap().pop_front();
            match reply {
                Some(ListReply::Ok(response)) => Ok(response),
                Some(ListReply::Transport) => Err(transport_error().await),
                None => Ok(list_response(vec![])),
            }
        }

        async fn set_unread(&self, _id: i64, _unread: bool) -> Result<()> {
            Ok(())
        }

        async fn set_starred(&self, _id: i64, _starred: bool) -> Result<()> {
            Ok(())
        }
    }

    fn session(enable_offline: bool) -> (Arc<SessionState>, mpsc::UnboundedReceiver<DbEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(SessionState::new(tx, enable_offline)), rx)
    }

    fn online_only(
        api: Arc<MockApi>,
        state: Arc<SessionState>,
    ) -> Arc<OnlineDb> {
        OnlineDb::new(api, state, None, 10, false)
    }

    fn test_config(dir: &TempDir) -> Config {
        Config {
            server_url: "http://localhost:1/".to_string(),
            username: None,
            password: None,
            db_path: dir.path().join("cache.db").to_string_lossy().to_string(),
            items_per_page: 10,
            enable_offline: true,
            offline_days: 10,
            unread_order_asc: false,
            source_stats: false,
            sync_interval_minutes: 5,
        }
    }

    async fn offline_setup(
        state: &Arc<SessionState>,
    ) -> (Arc<OfflineDb>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let offline = OfflineDb::init(&test_config(&dir), Arc::clone(state))
            .await
            .unwrap();
        state.set_has_storage(true);
        (offline, dir)
    }

    fn entry(id: i64, unread: bool) -> Entry {
        Entry {
            id,
            datetime: Utc::now() - chrono::Duration::minutes(id),
            title: format!("entry {}", id),
            content: String::new(),
            link: String::new(),
            author: None,
            source_title: None,
            tags: vec![],
            icon: None,
            thumbnail: None,
            unread,
            starred: false,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn concurrent_plain_syncs_share_one_request() {
        let api = Arc::new(MockApi::new(Duration::from_millis(100)));
        let (state, _rx) = session(false);
        let online = online_only(Arc::clone(&api), state);

        let (a, b) = tokio::join!(online.sync(None, false), online.sync(None, false));
        a.unwrap();
        b.unwrap();
        assert_eq!(api.sync_count(), 1);
    }

    #[tokio::test]
    async fn sync_carrying_statuses_is_rejected_not_joined() {
        let api = Arc::new(MockApi::new(Duration::from_millis(200)));
        let (state, _rx) = session(false);
        let online = online_only(Arc::clone(&api), state);

        let runner = Arc::clone(&online);
        let first = tokio::spawn(async move { runner.sync(None, false).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = online
            .sync(Some(vec![EntryStatusUpdate::unread(1, false)]), false)
            .await;
        assert!(matches!(result, Err(AppError::SyncInProgress)));

        first.await.unwrap().unwrap();
        assert_eq!(api.sync_count(), 1);
    }

    #[tokio::test]
    async fn first_sync_starts_from_epoch_without_status_deltas() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(false);
        let online = online_only(Arc::clone(&api), Arc::clone(&state));

        online.sync(None, false).await.unwrap();
        let first = api.sync_request(0);
        assert_eq!(first.since, DateTime::<Utc>::UNIX_EPOCH);
        assert!(first.items_statuses.is_none());
        assert!(first.tags);

        wait_until(|| *online.phase.lock().unwrap() == SyncPhase::Idle).await;
        assert!(state.last_update().is_some());
        assert!(!state.first_sync());

        online.sync(None, false).await.unwrap();
        wait_until(|| api.sync_count() >= 2).await;
        let second = api.sync_request(1);
        assert_eq!(second.items_statuses, Some(true));
        assert!(second.since > DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn offline_mode_adds_windowing_hints() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(true);
        let (offline, _dir) = offline_setup(&state).await;
        offline
            .store_entries(vec![entry(7, true)])
            .await
            .unwrap();

        let online = OnlineDb::new(
            Arc::clone(&api) as Arc<dyn ItemsApi>,
            Arc::clone(&state),
            Some(Arc::clone(&offline)),
            10,
            false,
        );

        online.sync(None, false).await.unwrap();
        let request = api.sync_request(0);
        assert_eq!(request.items_since_id, Some(7));
        assert_eq!(request.items_how_many, Some(10));
        assert!(request.items_not_before.is_some());
    }

    #[tokio::test]
    async fn missing_newer_items_chain_a_follow_up_round() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(true);
        let (offline, _dir) = offline_setup(&state).await;

        let mut first = sync_response();
        first.new_items = Some(vec![entry(5, true)]);
        first.last_id = Some(20);
        api.queue_sync(SyncReply::Ok(first));

        let online = OnlineDb::new(
            Arc::clone(&api) as Arc<dyn ItemsApi>,
            Arc::clone(&state),
            Some(Arc::clone(&offline)),
            10,
            false,
        );

        online.sync(None, false).await.unwrap();

        let api_probe = Arc::clone(&api);
        wait_until(move || api_probe.sync_count() >= 2).await;
        wait_until(|| !offline.newer_entries_missing()).await;

        assert!(offline.get_entry(5).await.unwrap().is_some());
        // the second page closed the gap; nothing further is scheduled
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(api.sync_count(), 2);
        // 20 - 0 > 2 * 10 is false, so no forced online reload either
        assert!(!offline.should_load_entries_online());
    }

    #[tokio::test]
    async fn echoed_statuses_dequeue_the_outbox() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(true);
        let (offline, _dir) = offline_setup(&state).await;
        offline.store_entries(vec![entry(1, true)]).await.unwrap();
        offline
            .enqueue_status(1, StatusName::Unread, false)
            .await
            .unwrap();
        assert!(state.needs_sync());

        let mut reply = sync_response();
        reply.item_updates = Some(vec![EntryStatusUpdate::unread(1, false)]);
        api.queue_sync(SyncReply::Ok(reply));

        let online = OnlineDb::new(
            Arc::clone(&api) as Arc<dyn ItemsApi>,
            Arc::clone(&state),
            Some(Arc::clone(&offline)),
            10,
            false,
        );

        online.send_new_statuses().await.unwrap();

        let sent = api.sync_request(0);
        let payload = sent.updated_statuses.expect("outbox payload");
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].id, 1);
        assert_eq!(payload[0].unread, Some(false));

        assert!(offline.queued_statuses().await.unwrap().is_empty());
        assert!(!offline.get_entry(1).await.unwrap().unwrap().unread);
        let state_probe = Arc::clone(&state);
        wait_until(move || !state_probe.needs_sync()).await;
    }

    #[tokio::test]
    async fn waiting_user_abandons_observation_but_sync_still_lands() {
        let api = Arc::new(MockApi::new(Duration::from_millis(300)));
        let (state, _rx) = session(false);
        let online = OnlineDb::build(
            Arc::clone(&api) as Arc<dyn ItemsApi>,
            Arc::clone(&state),
            None,
            10,
            false,
            Duration::from_millis(50),
        );

        state.set_user_waiting(true);
        let result = online.sync(None, false).await;
        assert!(matches!(result, Err(AppError::SyncTimeout)));
        assert!(!state.user_waiting());

        // the request was not cancelled, only unobserved
        let state_probe = Arc::clone(&state);
        wait_until(move || state_probe.last_update().is_some()).await;
        assert_eq!(api.sync_count(), 1);
    }

    #[tokio::test]
    async fn dirty_local_stats_are_not_overwritten() {
        let api = Arc::new(MockApi::new(Duration::from_millis(100)));
        let (state, mut rx) = session(false);
        let mut reply = sync_response();
        reply.stats = Some(Stats {
            total: 5,
            unread: 3,
            starred: 1,
        });
        api.queue_sync(SyncReply::Ok(reply));
        let online = online_only(Arc::clone(&api), Arc::clone(&state));

        let runner = Arc::clone(&online);
        let handle = tokio::spawn(async move { runner.sync(None, false).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        // an optimistic local change lands while the response is in flight
        state.set_stats_dirty(true);
        handle.await.unwrap().unwrap();

        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, DbEvent::StatsChanged(_)),
                "stale server stats must not overwrite a dirty local value"
            );
        }
    }

    #[tokio::test]
    async fn forbidden_revokes_authorization() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(false);
        api.queue_sync(SyncReply::Forbidden);
        let online = online_only(Arc::clone(&api), Arc::clone(&state));

        let result = online.sync(None, false).await;
        assert!(matches!(result, Err(AppError::Forbidden)));
        let state_probe = Arc::clone(&state);
        wait_until(move || !state_probe.authorized()).await;
        // a 403 is not a connectivity problem
        assert!(state.is_online());
    }

    #[tokio::test]
    async fn transport_failure_degrades_to_offline_mode() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(true);
        let (offline, _dir) = offline_setup(&state).await;
        api.queue_sync(SyncReply::Transport);

        let online = OnlineDb::new(
            Arc::clone(&api) as Arc<dyn ItemsApi>,
            Arc::clone(&state),
            Some(offline),
            10,
            false,
        );

        assert!(online.sync(None, false).await.is_err());
        let state_probe = Arc::clone(&state);
        wait_until(move || !state_probe.is_online()).await;
    }

    #[tokio::test]
    async fn newer_list_fetch_aborts_the_previous_one() {
        let api = Arc::new(MockApi::new(Duration::from_millis(200)));
        let (state, _rx) = session(false);
        let online = online_only(Arc::clone(&api), state);

        let racer = Arc::clone(&online);
        let first = tokio::spawn(async move {
            racer.get_entries(&Filter::new(FilterType::Newest, 10)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = online.get_entries(&Filter::new(FilterType::Newest, 10)).await;

        assert!(matches!(first.await.unwrap(), Err(AppError::Aborted)));
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn dispatcher_set_offline_needs_a_store() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(false);
        let online = online_only(api, Arc::clone(&state));
        let db = Db::new(Arc::clone(&state), None, online);

        assert!(matches!(
            db.set_offline(),
            Err(AppError::OfflineStorageNotAvailable)
        ));
        assert!(state.is_online());
    }

    #[tokio::test]
    async fn dispatcher_skips_sync_when_fresh() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(false);
        let online = online_only(Arc::clone(&api), Arc::clone(&state));
        let db = Db::new(Arc::clone(&state), None, online);

        state.set_last_update(Some(Utc::now()));
        state.set_last_sync_now();
        db.sync(false).await.unwrap();
        assert_eq!(api.sync_count(), 0);

        db.sync(true).await.unwrap();
        assert_eq!(api.sync_count(), 1);
    }

    #[tokio::test]
    async fn dispatcher_answers_supported_filters_from_the_cache() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(true);
        let (offline, _dir) = offline_setup(&state).await;
        offline
            .store_entries(vec![entry(1, true), entry(2, true)])
            .await
            .unwrap();

        let online = OnlineDb::new(
            Arc::clone(&api) as Arc<dyn ItemsApi>,
            Arc::clone(&state),
            Some(Arc::clone(&offline)),
            10,
            false,
        );
        let db = Db::new(Arc::clone(&state), Some(offline), online);

        let page = db
            .reload_list(&Filter::new(FilterType::Newest, 10), false, false)
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatcher_sends_server_side_filters_online() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(true);
        let (offline, _dir) = offline_setup(&state).await;

        let online = OnlineDb::new(
            Arc::clone(&api) as Arc<dyn ItemsApi>,
            Arc::clone(&state),
            Some(Arc::clone(&offline)),
            10,
            false,
        );
        let db = Db::new(Arc::clone(&state), Some(offline), online);

        let mut filter = Filter::new(FilterType::Newest, 10);
        filter.tag = Some("rust".to_string());
        db.reload_list(&filter, false, false).await.unwrap();
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatcher_falls_back_to_the_cache_on_transport_failure() {
        let api = Arc::new(MockApi::new(Duration::ZERO));
        let (state, _rx) = session(true);
        let (offline, _dir) = offline_setup(&state).await;
        offline.store_entries(vec![entry(1, true)]).await.unwrap();
        // the cache is known to be behind, so the fetch goes online first
        offline.set_should_load_entries_online(true);
        api.queue_list(ListReply::Transport);

        let online = OnlineDb::new(
            Arc::clone(&api) as Arc<dyn ItemsApi>,
            Arc::clone(&state),
            Some(Arc::clone(&offline)),
            10,
            false,
        );
        let db = Db::new(Arc::clone(&state), Some(offline), online);

        let page = db
            .reload_list(&Filter::new(FilterType::Newest, 10), false, false)
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);
        assert!(!state.is_online());
    }
}
