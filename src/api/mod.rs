mod client;
mod types;

pub use client::{ApiClient, ItemsApi};
pub use types::{ListResponse, SyncRequest, SyncResponse};
