//! Schema Validator Client
//!
//! Submits one resource to the configured validator endpoint and reports
//! its issues. The refine loop treats error-severity issues as hard and
//! everything else as advisory.

use crate::error::EngineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Issue severity as reported by the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fatal,
    Error,
    Warning,
    Information,
}

/// One validation issue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: String,
    pub details: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// Validation outcome for one resource
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| matches!(i.severity, Severity::Fatal | Severity::Error))
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| matches!(i.severity, Severity::Fatal | Severity::Error))
    }
}

/// Schema validator contract
#[async_trait]
pub trait ValidatorClient: Send + Sync {
    async fn validate(&self, resource: &serde_json::Value) -> Result<ValidationReport, EngineError>;
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    resource: &'a serde_json::Value,
}

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP validator client
pub struct HttpValidatorClient {
    client: Client,
    endpoint: String,
}

impl HttpValidatorClient {
    pub fn new(endpoint: String) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Validator(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl ValidatorClient for HttpValidatorClient {
    async fn validate(&self, resource: &serde_json::Value) -> Result<ValidationReport, EngineError> {
        let url = format!("{}/validate", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&ValidateRequest { resource })
            .send()
            .await
            .map_err(|e| EngineError::Validator(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Validator(format!(
                "validate returned {}: {}",
                status, body
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::Validator(format!("malformed validate response: {}", e)))
    }
}
