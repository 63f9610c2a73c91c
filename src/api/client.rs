use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use url::Url;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::Filter;

use super::types::{ListResponse, SyncRequest, SyncResponse};

/// The item-related server calls the sync engine needs. Kept behind a trait
/// so the engine can run against a recording double in tests.
#[async_trait]
pub trait ItemsApi: Send + Sync {
    /// One delta-sync round: GET without outbox statuses, POST with them.
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse>;

    /// Direct paginated list fetch for the given filter.
    async fn get_items(&self, filter: &Filter) -> Result<ListResponse>;

    /// Direct status writes, used optimistically while online.
    async fn set_unread(&self, id: i64, unread: bool) -> Result<()>;
    async fn set_starred(&self, id: i64, starred: bool) -> Result<()>;
}

pub struct ApiClient {
    client: Client,
    base: Url,
    auth: Option<(String, String)>,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .cookie_store(true)
            .user_agent(concat!("drift-reader/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        let mut base = Url::parse(&config.server_url)
            .map_err(|e| AppError::Config(format!("invalid server_url: {}", e)))?;
        // A base URL must end with a slash for join() to append paths.
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        // Session mechanics are the server's concern; credentials just ride
        // along on each request when configured.
        let auth = config
            .username
            .clone()
            .zip(config.password.clone());

        Ok(Self { client, base, auth })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| AppError::Config(format!("invalid endpoint {}: {}", path, e)))
    }

    fn apply_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some((username, password)) => builder.basic_auth(username, Some(password)),
            None => builder,
        }
    }

    async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(AppError::Forbidden);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Api(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }
}

/// Flattened list-request parameters in the server's naming.
#[derive(Debug, Serialize)]
struct ListQuery {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    search: Option<String>,
    offset: u32,
    #[serde(rename = "fromDatetime", skip_serializing_if = "Option::is_none")]
    from_datetime: Option<DateTime<Utc>>,
    #[serde(rename = "fromId", skip_serializing_if = "Option::is_none")]
    from_id: Option<i64>,
    #[serde(rename = "extraIds", skip_serializing_if = "Option::is_none")]
    extra_ids: Option<String>,
    items: u32,
}

impl ListQuery {
    fn from_filter(filter: &Filter) -> Self {
        Self {
            kind: filter.kind.as_str(),
            tag: filter.tag.clone(),
            source: filter.source,
            search: filter.search.clone(),
            offset: filter.offset,
            from_datetime: filter.from_datetime,
            from_id: filter.from_id,
            extra_ids: if filter.extra_ids.is_empty() {
                None
            } else {
                Some(
                    filter
                        .extra_ids
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                )
            },
            items: filter.items_per_page,
        }
    }
}

#[async_trait]
impl ItemsApi for ApiClient {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
        let url = self.endpoint("items/sync")?;
        let builder = if request.updated_statuses.is_some() {
            self.client.post(url).json(&request)
        } else {
            self.client.get(url).query(&request)
        };
        let response = self.apply_auth(builder).send().await?;
        let response = self.check(response).await?;
        Ok(response.json().await?)
    }

    async fn get_items(&self, filter: &Filter) -> Result<ListResponse> {
        let url = self.endpoint("items")?;
        let builder = self.client.get(url).query(&ListQuery::from_filter(filter));
        let response = self.apply_auth(builder).send().await?;
        let response = self.check(response).await?;
        Ok(response.json().await?)
    }

    async fn set_unread(&self, id: i64, unread: bool) -> Result<()> {
        let path = format!("{}/{}", if unread { "unmark" } else { "mark" }, id);
        let url = self.endpoint(&path)?;
        let response = self.apply_auth(self.client.post(url)).send().await?;
        self.check(response).await?;
        Ok(())
    }

    async fn set_starred(&self, id: i64, starred: bool) -> Result<()> {
        let path = format!("{}/{}", if starred { "starr" } else { "unstarr" }, id);
        let url = self.endpoint(&path)?;
        let response = self.apply_auth(self.client.post(url)).send().await?;
        self.check(response).await?;
        Ok(())
    }
}
