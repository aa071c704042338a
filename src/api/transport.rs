//! The remote API as a capability: one GET through a given route.

use crate::api::proxy_pool::Route;
use crate::ingest::stream::StreamKind;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// What to ask the remote API for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTarget {
    Id(i64),
    Page { offset: i64, limit: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub kind: StreamKind,
    pub target: FetchTarget,
    /// Extra filter parameters (`map_name`, `modes_list_string`, `steamid64`, ...).
    pub filters: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn by_id(kind: StreamKind, id: i64) -> Self {
        Self {
            kind,
            target: FetchTarget::Id(id),
            filters: Vec::new(),
        }
    }

    pub fn page(kind: StreamKind, offset: i64, limit: i64) -> Self {
        Self {
            kind,
            target: FetchTarget::Page { offset, limit },
            filters: Vec::new(),
        }
    }

    pub fn with_filters(mut self, filters: &[(String, String)]) -> Self {
        self.filters = filters.to_vec();
        self
    }

    /// Absolute URL for this request under `base`.
    pub fn url(&self, base: &str) -> Result<url::Url> {
        let base = base.trim_end_matches('/');
        let path = match &self.target {
            FetchTarget::Id(id) => format!("{base}/{}/{id}", self.kind.endpoint()),
            FetchTarget::Page { .. } => format!("{base}/{}", self.kind.endpoint()),
        };
        let mut url = url::Url::parse(&path).with_context(|| format!("invalid API url {path}"))?;
        {
            let mut qp = url.query_pairs_mut();
            if let FetchTarget::Page { offset, limit } = &self.target {
                qp.append_pair("limit", &limit.to_string());
                qp.append_pair("offset", &offset.to_string());
            }
            for (k, v) in &self.filters {
                qp.append_pair(k, v);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }
}

/// Classified HTTP outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportResponse {
    Ok(Value),
    NotFound,
    RateLimited { retry_after: Option<Duration> },
    /// Any other non-success status.
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("request failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        route: &Route,
        request: &FetchRequest,
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport with one pooled client per route.
pub struct HttpTransport {
    base_url: String,
    direct: Client,
    proxied: HashMap<Route, Client>,
}

impl HttpTransport {
    pub fn new(base_url: &str, routes: &[Route], timeout: Duration) -> Result<Self> {
        let direct = Self::client_builder(timeout).build()?;
        let mut proxied = HashMap::new();
        for route in routes {
            if let Route::Proxy(url) = route {
                let proxy = reqwest::Proxy::all(url.as_ref())
                    .with_context(|| format!("invalid proxy url {url}"))?;
                let client = Self::client_builder(timeout).proxy(proxy).build()?;
                proxied.insert(route.clone(), client);
            }
        }
        Ok(Self {
            base_url: base_url.to_string(),
            direct,
            proxied,
        })
    }

    fn client_builder(timeout: Duration) -> reqwest::ClientBuilder {
        Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("kz-ingest/", env!("CARGO_PKG_VERSION")))
    }

    fn client_for(&self, route: &Route) -> &Client {
        self.proxied.get(route).unwrap_or(&self.direct)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        route: &Route,
        request: &FetchRequest,
    ) -> Result<TransportResponse, TransportError> {
        let url = request
            .url(&self.base_url)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        debug!(route = route.label(), %url, "GET");
        let resp = self
            .client_for(route)
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(TransportResponse::NotFound);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Ok(TransportResponse::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Ok(TransportResponse::Status(status.as_u16()));
        }
        let body: Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Decode(e.to_string())
            }
        })?;
        // The by-id endpoints answer 200 with `null` for unknown ids.
        if body.is_null() {
            return Ok(TransportResponse::NotFound);
        }
        Ok(TransportResponse::Ok(body))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() || e.is_request() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
