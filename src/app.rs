use std::sync::Arc;

use tokio::sync::mpsc;

use crate::api::ApiClient;
use crate::config::Config;
use crate::db::{Db, OfflineDb, OnlineDb, SessionState};
use crate::error::{AppError, Result};
use crate::models::{DbEvent, Entry, EntryPage, Filter, StatusName, Stats};

pub struct App {
    pub config: Config,
    pub db: Db,
    events: mpsc::UnboundedReceiver<DbEvent>,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState::new(events_tx, config.enable_offline));

        let offline = if config.enable_offline {
            match OfflineDb::init(&config, Arc::clone(&state)).await {
                Ok(offline) => {
                    state.set_has_storage(true);
                    Some(offline)
                }
                Err(error) => {
                    tracing::warn!("offline storage unavailable: {}", error);
                    state.set_broken();
                    None
                }
            }
        } else {
            None
        };

        let api = Arc::new(ApiClient::new(&config)?);
        let online = OnlineDb::new(
            api,
            Arc::clone(&state),
            offline.clone(),
            config.items_per_page,
            config.source_stats,
        );

        let db = Db::new(state, offline, online);

        Ok(Self {
            config,
            db,
            events: events_rx,
        })
    }

    pub async fn sync(&self, force: bool) -> Result<()> {
        self.db.sync(force).await
    }

    pub async fn list(&self, filter: &Filter, append: bool) -> Result<EntryPage> {
        self.db.reload_list(filter, append, true).await
    }

    /// Sets the read/unread status of an entry: local cache first, then the
    /// server, queueing for later when the server is unreachable.
    pub async fn mark_entry(&self, id: i64, unread: bool) -> Result<()> {
        self.db.state.set_stats_dirty(true);
        if let Some(offline) = &self.db.offline {
            offline.entry_mark(id, unread).await?;
        }
        self.push_status(id, StatusName::Unread, unread).await
    }

    pub async fn star_entry(&self, id: i64, starred: bool) -> Result<()> {
        if let Some(offline) = &self.db.offline {
            offline.entry_star(id, starred).await?;
        }
        self.push_status(id, StatusName::Starred, starred).await
    }

    /// The optimistic write path: try the direct endpoint while online; a
    /// transport failure degrades to offline mode and parks the change in
    /// the outbox instead of losing it.
    async fn push_status(&self, id: i64, name: StatusName, value: bool) -> Result<()> {
        if self.db.state.is_online() {
            let sent = match name {
                StatusName::Unread => self.db.online.set_entry_unread(id, value).await,
                StatusName::Starred => self.db.online.set_entry_starred(id, value).await,
            };
            match sent {
                Ok(()) => Ok(()),
                Err(error) if error.is_transport() => {
                    let _ = self.db.state.try_set_offline();
                    match &self.db.offline {
                        Some(offline) => offline.enqueue_status(id, name, value).await,
                        None => Err(error),
                    }
                }
                Err(error) => Err(error),
            }
        } else {
            match &self.db.offline {
                Some(offline) => offline.enqueue_status(id, name, value).await,
                None => Err(AppError::OfflineStorageNotAvailable),
            }
        }
    }

    pub async fn entry(&self, id: i64) -> Result<Option<Entry>> {
        match &self.db.offline {
            Some(offline) => offline.get_entry(id).await,
            None => Ok(None),
        }
    }

    pub async fn stats(&self) -> Result<Option<Stats>> {
        match &self.db.offline {
            Some(offline) => Ok(Some(offline.stats().await?)),
            None => Ok(None),
        }
    }

    /// Drops all locally cached state.
    pub async fn reset_cache(&self) -> Result<()> {
        match &self.db.offline {
            Some(offline) => offline.clear().await,
            None => Err(AppError::OfflineStorageNotAvailable),
        }
    }

    /// Drains pending notifications without blocking.
    pub fn poll_events(&mut self) -> Vec<DbEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}
