use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the feed server, e.g. "https://reader.example.org/".
    #[serde(default = "default_server_url")]
    pub server_url: String,

    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_items_per_page")]
    pub items_per_page: u32,

    /// Keep a local cache and an outbox so the client works without the
    /// server. Can be turned off to run as a thin online-only client.
    #[serde(default = "default_enable_offline")]
    pub enable_offline: bool,

    /// How many days of read, unstarred history the local cache keeps.
    /// Shrinks automatically when the storage device runs out of space.
    #[serde(default = "default_offline_days")]
    pub offline_days: u32,

    /// Show unread entries oldest first.
    #[serde(default)]
    pub unread_order_asc: bool,

    /// Request per-source statistics on every sync.
    #[serde(default)]
    pub source_stats: bool,

    #[serde(default = "default_sync_interval")]
    pub sync_interval_minutes: u32,
}

fn default_server_url() -> String {
    "http://localhost:8888/".to_string()
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drift-reader");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("cache.db").to_string_lossy().to_string()
}

fn default_items_per_page() -> u32 {
    50
}

fn default_enable_offline() -> bool {
    true
}

fn default_offline_days() -> u32 {
    10
}

fn default_sync_interval() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            username: None,
            password: None,
            db_path: default_db_path(),
            items_per_page: default_items_per_page(),
            enable_offline: default_enable_offline(),
            offline_days: default_offline_days(),
            unread_order_asc: false,
            source_stats: false,
            sync_interval_minutes: default_sync_interval(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("drift-reader")
            .join("config.toml")
    }
}
