//! Terminology Service Clients
//!
//! Existence checks and free-text search against the configured
//! terminology endpoints. Both contracts are order-aligned with their
//! request payloads so callers can zip results back onto inputs.

use crate::error::EngineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A (system, code) pair submitted for an existence check
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodingKey {
    pub system: String,
    pub code: String,
}

/// Existence-check result, order-aligned with the request items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResult {
    pub exists: bool,
    /// Canonical display for the code, when the service knows one.
    pub display: Option<String>,
    pub normalized_system: Option<String>,
}

/// One terminology search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub system: String,
    pub code: String,
    pub display: String,
}

/// Terminology service contract
#[async_trait]
pub trait TerminologyClient: Send + Sync {
    /// Batch existence check; the result vector is order-aligned with
    /// `items`.
    async fn lookup(&self, items: &[CodingKey]) -> Result<Vec<LookupResult>, EngineError>;

    /// Free-text search; one hit list per term, order-aligned with
    /// `terms`. `systems` optionally restricts the searched systems.
    async fn search(
        &self,
        terms: &[String],
        systems: &[String],
    ) -> Result<Vec<Vec<SearchHit>>, EngineError>;
}

#[derive(Serialize)]
struct LookupRequest<'a> {
    items: &'a [CodingKey],
}

#[derive(Deserialize)]
struct LookupResponse {
    results: Vec<LookupResult>,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    terms: &'a [String],
    systems: &'a [String],
}

#[derive(Deserialize)]
struct SearchResponse {
    results: Vec<Vec<SearchHit>>,
}

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP terminology client
pub struct HttpTerminologyClient {
    client: Client,
    endpoint: String,
}

impl HttpTerminologyClient {
    pub fn new(endpoint: String) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Terminology(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, endpoint })
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp, EngineError> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::Terminology(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Terminology(format!(
                "{} returned {}: {}",
                path, status, body
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::Terminology(format!("malformed {} response: {}", path, e)))
    }
}

#[async_trait]
impl TerminologyClient for HttpTerminologyClient {
    async fn lookup(&self, items: &[CodingKey]) -> Result<Vec<LookupResult>, EngineError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let response: LookupResponse = self.post("lookup", &LookupRequest { items }).await?;
        if response.results.len() != items.len() {
            return Err(EngineError::Terminology(format!(
                "lookup returned {} results for {} items",
                response.results.len(),
                items.len()
            )));
        }
        Ok(response.results)
    }

    async fn search(
        &self,
        terms: &[String],
        systems: &[String],
    ) -> Result<Vec<Vec<SearchHit>>, EngineError> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let response: SearchResponse = self.post("search", &SearchRequest { terms, systems }).await?;
        if response.results.len() != terms.len() {
            return Err(EngineError::Terminology(format!(
                "search returned {} hit lists for {} terms",
                response.results.len(),
                terms.len()
            )));
        }
        Ok(response.results)
    }
}
