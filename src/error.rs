use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("access forbidden, please log in again")]
    Forbidden,

    #[error("server error: {0}")]
    Api(String),

    #[error("request aborted")]
    Aborted,

    #[error("a sync is already running")]
    SyncInProgress,

    #[error("timed out waiting for sync, falling back to local data")]
    SyncTimeout,

    #[error("offline storage is not available")]
    OfflineStorageNotAvailable,

    #[error("offline storage is full")]
    StorageQuota,

    #[error("offline storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<tokio_rusqlite::Error> for AppError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(code, _)) = &err {
            if code.code == rusqlite::ErrorCode::DiskFull {
                return AppError::StorageQuota;
            }
        }
        AppError::Storage(err.to_string())
    }
}

impl AppError {
    /// True for failures that mean the server is unreachable rather than
    /// the request being wrong: these may be retried against the local
    /// cache. A 403 is deliberately not one of them.
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::Network(_))
    }

    /// Approximate clone for handing a shared sync outcome to multiple
    /// waiters. Variants carrying non-cloneable sources collapse to `Api`.
    pub fn clone_for_waiter(&self) -> AppError {
        match self {
            AppError::Forbidden => AppError::Forbidden,
            AppError::Aborted => AppError::Aborted,
            AppError::SyncInProgress => AppError::SyncInProgress,
            AppError::SyncTimeout => AppError::SyncTimeout,
            AppError::OfflineStorageNotAvailable => AppError::OfflineStorageNotAvailable,
            AppError::StorageQuota => AppError::StorageQuota,
            AppError::Storage(msg) => AppError::Storage(msg.clone()),
            AppError::Config(msg) => AppError::Config(msg.clone()),
            other => AppError::Api(other.to_string()),
        }
    }
}
