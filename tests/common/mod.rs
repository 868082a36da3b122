//! Shared test doubles for the integration suite.

use async_trait::async_trait;
use chartsmith::error::{EngineError, GenerateError};
use chartsmith::generate::{Generator, RetryPolicy};
use chartsmith::pipeline::PipelineEnv;
use chartsmith::pool::CallPool;
use chartsmith::provider::{Completion, CompletionRequest, GenerativeClient, TokenUsage};
use chartsmith::refine::RefineSettings;
use chartsmith::terminology::{CodingKey, LookupResult, SearchHit, TerminologyClient};
use chartsmith::validator::{ValidationReport, ValidatorClient};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Routes each request to the first response whose marker appears in the
/// prompt. Counts every call it serves.
pub struct RouteProvider {
    routes: Vec<(String, String)>,
    pub calls: Mutex<Vec<String>>,
    /// When set, the first matching call for this marker parks until the
    /// gate is opened.
    gate: Option<(String, Arc<Notify>, Mutex<bool>)>,
}

impl RouteProvider {
    pub fn new(routes: Vec<(&str, String)>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|(marker, response)| (marker.to_string(), response))
                .collect(),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Park the first call whose prompt contains `marker` until the
    /// returned notify is signalled.
    pub fn gated_on(mut self, marker: &str) -> (Self, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        self.gate = Some((marker.to_string(), Arc::clone(&notify), Mutex::new(false)));
        (self, notify)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl GenerativeClient for RouteProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GenerateError> {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if let Some((marker, notify, tripped)) = &self.gate {
            let first = prompt.contains(marker.as_str()) && !std::mem::replace(&mut *tripped.lock(), true);
            if first {
                notify.notified().await;
            }
        }

        for (marker, response) in &self.routes {
            if prompt.contains(marker.as_str()) {
                self.calls.lock().push(marker.clone());
                return Ok(Completion {
                    content: response.clone(),
                    usage: TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 20,
                        total_tokens: 30,
                    },
                });
            }
        }
        Err(GenerateError::MissingContent)
    }
}

/// In-memory terminology service with registered codes and search hits.
#[derive(Default)]
pub struct TestTerminology {
    known: HashMap<(String, String), String>,
    hits: HashMap<String, Vec<SearchHit>>,
    pub search_calls: Mutex<usize>,
}

impl TestTerminology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code(mut self, system: &str, code: &str, display: &str) -> Self {
        self.known
            .insert((system.to_string(), code.to_string()), display.to_string());
        self
    }

    pub fn with_hits(mut self, term: &str, hits: Vec<SearchHit>) -> Self {
        self.hits.insert(term.to_lowercase(), hits);
        self
    }
}

#[async_trait]
impl TerminologyClient for TestTerminology {
    async fn lookup(&self, items: &[CodingKey]) -> Result<Vec<LookupResult>, EngineError> {
        Ok(items
            .iter()
            .map(|item| {
                match self.known.get(&(item.system.clone(), item.code.clone())) {
                    Some(display) => LookupResult {
                        exists: true,
                        display: Some(display.clone()),
                        normalized_system: Some(item.system.clone()),
                    },
                    None => LookupResult {
                        exists: false,
                        display: None,
                        normalized_system: None,
                    },
                }
            })
            .collect())
    }

    async fn search(
        &self,
        terms: &[String],
        _systems: &[String],
    ) -> Result<Vec<Vec<SearchHit>>, EngineError> {
        *self.search_calls.lock() += 1;
        Ok(terms
            .iter()
            .map(|term| self.hits.get(&term.to_lowercase()).cloned().unwrap_or_default())
            .collect())
    }
}

/// Validator that accepts every resource.
pub struct AcceptAllValidator;

#[async_trait]
impl ValidatorClient for AcceptAllValidator {
    async fn validate(
        &self,
        _resource: &serde_json::Value,
    ) -> Result<ValidationReport, EngineError> {
        Ok(ValidationReport {
            valid: true,
            issues: Vec::new(),
        })
    }
}

/// Pipeline environment wired with the given test doubles.
pub fn test_env(
    provider: Arc<RouteProvider>,
    terminology: Arc<TestTerminology>,
    turn_budget: usize,
) -> Arc<PipelineEnv> {
    let generator = Generator::new(
        provider,
        CallPool::new(4),
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    );
    Arc::new(PipelineEnv {
        generator,
        terminology,
        validator: Arc::new(AcceptAllValidator),
        refine: RefineSettings {
            turn_budget,
            fan_out: 2,
        },
    })
}
