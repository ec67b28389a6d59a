//! HTTP client for the AdGuard Home control API.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{FetchError, Result};
use crate::payload::{QueryLogPage, Stats, Status};
use crate::schema::Schema;

/// One of the control API endpoints polled every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Aggregate statistics (`/control/stats`).
    Stats,
    /// Service status (`/control/status`).
    Status,
    /// Recent query log page (`/control/querylog`).
    QueryLog,
}

impl Endpoint {
    /// All endpoints, in polling order.
    pub const ALL: [Endpoint; 3] = [Endpoint::Stats, Endpoint::Status, Endpoint::QueryLog];

    /// Stable lowercase name, used as the `source` label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Stats => "stats",
            Endpoint::Status => "status",
            Endpoint::QueryLog => "querylog",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection settings for the appliance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplianceConfig {
    /// Base URL, e.g. `http://192.168.1.2:3000`.
    pub url: String,

    /// Basic auth user. No `Authorization` header is sent when unset.
    pub username: Option<String>,

    /// Basic auth password.
    pub password: Option<String>,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,

    /// Endpoint paths relative to `url`.
    pub paths: EndpointPaths,

    /// `limit` query parameter for the query log (0 leaves it to the appliance).
    pub querylog_limit: u32,
}

impl Default for ApplianceConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000".to_string(),
            username: None,
            password: None,
            timeout_secs: 10,
            paths: EndpointPaths::default(),
            querylog_limit: 500,
        }
    }
}

/// Request paths of the three endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    pub stats: String,
    pub status: String,
    pub querylog: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            stats: "/control/stats".to_string(),
            status: "/control/status".to_string(),
            querylog: "/control/querylog".to_string(),
        }
    }
}

impl EndpointPaths {
    /// Path configured for an endpoint.
    pub fn get(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Stats => &self.stats,
            Endpoint::Status => &self.status,
            Endpoint::QueryLog => &self.querylog,
        }
    }
}

/// Source of raw JSON documents from the appliance.
///
/// The production implementation is [`AdGuardClient`]; tests substitute
/// canned documents.
pub trait ApplianceApi: Send + Sync {
    /// GET one endpoint and parse its body as JSON.
    ///
    /// Implementations must not retry; the caller's next cycle is the retry.
    fn get_json(&self, endpoint: Endpoint) -> impl Future<Output = Result<Value>> + Send;
}

/// `reqwest`-backed client with HTTP Basic auth and a bounded timeout.
#[derive(Debug, Clone)]
pub struct AdGuardClient {
    http: reqwest::Client,
    config: ApplianceConfig,
}

impl AdGuardClient {
    /// Build a client from configuration.
    pub fn new(config: ApplianceConfig) -> std::result::Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("guardsight/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, config })
    }

    /// Full URL for an endpoint.
    pub fn url_for(&self, endpoint: Endpoint) -> String {
        let base = self.config.url.trim_end_matches('/');
        let path = self.config.paths.get(endpoint);
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// The configuration this client was built from.
    pub fn config(&self) -> &ApplianceConfig {
        &self.config
    }
}

impl ApplianceApi for AdGuardClient {
    async fn get_json(&self, endpoint: Endpoint) -> Result<Value> {
        let url = self.url_for(endpoint);
        let mut request = self.http.get(&url);

        if endpoint == Endpoint::QueryLog && self.config.querylog_limit > 0 {
            request = request.query(&[("limit", self.config.querylog_limit)]);
        }

        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }

        trace!(%endpoint, url = %url, "Requesting");

        let response = request.send().await.map_err(|source| {
            if source.is_builder() {
                FetchError::Request {
                    endpoint,
                    message: source.to_string(),
                }
            } else {
                FetchError::Transport { endpoint, source }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { endpoint, status });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport { endpoint, source })?;

        debug!(%endpoint, bytes = body.len(), "Fetched");

        serde_json::from_slice(&body).map_err(|source| FetchError::Decode { endpoint, source })
    }
}

/// Pairs an [`ApplianceApi`] with the [`Schema`] used to decode its documents.
pub struct Fetcher<A> {
    api: A,
    schema: Schema,
}

impl<A: ApplianceApi> Fetcher<A> {
    /// Create a fetcher.
    pub fn new(api: A, schema: Schema) -> Self {
        Self { api, schema }
    }

    /// Fetch and decode aggregate statistics.
    pub async fn fetch_stats(&self) -> Result<Stats> {
        let doc = self.api.get_json(Endpoint::Stats).await?;
        Stats::decode(&doc, &self.schema.stats)
    }

    /// Fetch and decode service status.
    pub async fn fetch_status(&self) -> Result<Status> {
        let doc = self.api.get_json(Endpoint::Status).await?;
        Status::decode(&doc, &self.schema.status)
    }

    /// Fetch and decode the most recent query log page.
    pub async fn fetch_querylog(&self) -> Result<QueryLogPage> {
        let doc = self.api.get_json(Endpoint::QueryLog).await?;
        QueryLogPage::decode(&doc, &self.schema.querylog)
    }

    /// The underlying API.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// The decoding schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}
