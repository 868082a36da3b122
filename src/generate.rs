//! Retrying Call Wrapper
//!
//! Wraps one outbound generative call in bounded retries with exponential
//! backoff and jitter, gated by the call pool. All failure classes the wire
//! can produce are retryable here: transport errors, non-2xx statuses,
//! unparseable envelopes, embedded error objects, missing content, and
//! structured content that fails tolerant parsing. Exhaustion surfaces a
//! typed error carrying the last raw content for audit.

use crate::error::GenerateError;
use crate::pool::CallPool;
use crate::provider::{ChatMessage, CompletionRequest, GenerativeClient, TokenUsage};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Retry policy for generative calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt: base doubled per attempt,
    /// capped, plus uniform jitter of up to half the capped delay.
    fn backoff(&self, attempt: usize) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16) as u32);
        let capped = doubled.min(self.max_delay);
        let jitter_ms = if capped.as_millis() > 0 {
            rand::thread_rng().gen_range(0..=(capped.as_millis() as u64) / 2)
        } else {
            0
        };
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Successful generation result
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// Parsed JSON when structured output was requested, otherwise the
    /// text wrapped as a JSON string.
    pub value: serde_json::Value,
    /// Raw completion text, preserved for provenance.
    pub raw_text: String,
    pub usage: TokenUsage,
}

/// Retrying generative caller, shared across jobs
#[derive(Clone)]
pub struct Generator {
    client: Arc<dyn GenerativeClient>,
    pool: CallPool,
    policy: RetryPolicy,
}

impl Generator {
    pub fn new(client: Arc<dyn GenerativeClient>, pool: CallPool, policy: RetryPolicy) -> Self {
        Self {
            client,
            pool,
            policy,
        }
    }

    pub fn pool(&self) -> &CallPool {
        &self.pool
    }

    /// Run one generative task to completion or retry exhaustion.
    pub async fn call(
        &self,
        task: &str,
        prompt: &str,
        structured: bool,
    ) -> Result<GenerationOutcome, GenerateError> {
        let _permit = self.pool.acquire().await;

        let request = CompletionRequest {
            messages: vec![ChatMessage::user(prompt)],
            structured,
        };

        let mut last_error: Option<GenerateError> = None;
        for attempt in 1..=self.policy.max_attempts.max(1) {
            if attempt > 1 {
                tokio::time::sleep(self.policy.backoff(attempt - 1)).await;
            }

            let started = Instant::now();
            let outcome = self.client.complete(&request).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(completion) => {
                    if structured {
                        match parse_structured(&completion.content) {
                            Ok(value) => {
                                debug!(task, attempt, latency_ms, "generative call succeeded");
                                return Ok(GenerationOutcome {
                                    value,
                                    raw_text: completion.content,
                                    usage: completion.usage,
                                });
                            }
                            Err(raw) => {
                                warn!(
                                    task,
                                    attempt, latency_ms, "structured content failed parsing"
                                );
                                last_error = Some(GenerateError::Structured(raw));
                            }
                        }
                    } else {
                        debug!(task, attempt, latency_ms, "generative call succeeded");
                        return Ok(GenerationOutcome {
                            value: serde_json::Value::String(completion.content.clone()),
                            raw_text: completion.content,
                            usage: completion.usage,
                        });
                    }
                }
                Err(err) => {
                    warn!(task, attempt, latency_ms, error = %err, "generative call failed");
                    last_error = Some(err);
                }
            }
        }

        let (last_status, last_raw) = match &last_error {
            Some(GenerateError::Status { status, body }) => {
                (Some(*status), Some(body.clone()))
            }
            Some(err) => (None, err.raw_content().map(str::to_string)),
            None => (None, None),
        };
        Err(GenerateError::Exhausted {
            attempts: self.policy.max_attempts.max(1),
            last_status,
            last_raw,
        })
    }
}

/// Tolerant structured-output parsing.
///
/// Accepts bare JSON, JSON wrapped in markdown fences, and JSON embedded in
/// surrounding prose (outermost object or array brackets). Returns the raw
/// text on failure so the caller can preserve it.
pub fn parse_structured(text: &str) -> Result<serde_json::Value, String> {
    let trimmed = text.trim();

    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    if let Ok(value) = serde_json::from_str(unfenced) {
        return Ok(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (unfenced.find(open), unfenced.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&unfenced[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    Err(text.to_string())
}
