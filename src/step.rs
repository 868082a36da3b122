//! Step Executor
//!
//! Per-job memoized task runner. Each job run constructs a fresh
//! `RunContext` carrying the store, the retrying generator, the run epoch
//! and an execution stack for parent-key inference; concurrent runs never
//! share call-stack state. Done steps replay verbatim; generative steps are
//! content-addressed by a hash of (task, prompt) so identical prompts
//! replay across reruns and call sites.

use crate::error::EngineError;
use crate::generate::Generator;
use crate::store::{
    latest_artifact_version, ArtifactRecord, DocumentStore, JobRecord, LinkRecord, StepRecord,
    StepStatus,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Options for one step invocation
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub title: Option<String>,
    pub tags: serde_json::Map<String, serde_json::Value>,
    /// Explicit parent key; inferred from the execution stack when absent.
    pub parent_key: Option<String>,
    pub force_recompute: bool,
    pub prompt: Option<String>,
}

/// Execution context for one job run
pub struct RunContext {
    store: Arc<dyn DocumentStore>,
    generator: Generator,
    job_id: String,
    /// Epoch token captured at run start; compared against the job's
    /// persisted run_count on every mutating call.
    epoch: u64,
    stack: Mutex<Vec<String>>,
}

impl RunContext {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        generator: Generator,
        job: &JobRecord,
    ) -> Self {
        Self {
            store,
            generator,
            job_id: job.id.clone(),
            epoch: job.run_count,
            stack: Mutex::new(Vec::new()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Verify the job still exists and this execution is not superseded.
    ///
    /// Runs before every mutating write so a deleted job or a newer epoch
    /// aborts in-flight work with a typed signal instead of corrupting the
    /// newer run's output.
    pub async fn guard(&self) -> Result<JobRecord, EngineError> {
        let job = self
            .store
            .get_job(&self.job_id)
            .await?
            .ok_or_else(|| EngineError::JobDeleted(self.job_id.clone()))?;
        if job.run_count != self.epoch {
            return Err(EngineError::StaleRun {
                job_id: self.job_id.clone(),
                held_epoch: self.epoch,
                current_epoch: job.run_count,
            });
        }
        Ok(job)
    }

    /// Run a memoized step under a parent-qualified key.
    pub async fn step<T, F, Fut>(
        &self,
        key: &str,
        opts: StepOptions,
        f: F,
    ) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let parent = opts
            .parent_key
            .clone()
            .or_else(|| self.stack.lock().last().cloned());
        let effective_key = match &parent {
            Some(parent_key) => format!("{}:{}", parent_key, key),
            None => key.to_string(),
        };
        self.run_step(&effective_key, parent, opts, f).await
    }

    /// Run a memoized generative call.
    ///
    /// The key embeds a content hash of (task, prompt): identical prompts
    /// share one cached step regardless of call site or rerun. Token usage
    /// and the raw response land in the step's tags for audit without
    /// affecting the primary result.
    pub async fn generate(
        &self,
        task: &str,
        prompt: &str,
        structured: bool,
    ) -> Result<serde_json::Value, EngineError> {
        let key = llm_step_key(task, prompt);
        let parent = self.stack.lock().last().cloned();
        let opts = StepOptions {
            title: Some(format!("generate:{}", task)),
            prompt: Some(prompt.to_string()),
            ..StepOptions::default()
        };
        let generator = self.generator.clone();
        let task_name = task.to_string();
        let prompt_text = prompt.to_string();
        let step_key = key.clone();
        self.run_step(&key, parent, opts, || async move {
            let outcome = generator.call(&task_name, &prompt_text, structured).await?;
            self.annotate(
                &step_key,
                [
                    (
                        "usage".to_string(),
                        serde_json::json!({
                            "prompt_tokens": outcome.usage.prompt_tokens,
                            "completion_tokens": outcome.usage.completion_tokens,
                            "total_tokens": outcome.usage.total_tokens,
                        }),
                    ),
                    (
                        "raw_response".to_string(),
                        serde_json::Value::String(outcome.raw_text.clone()),
                    ),
                ],
            )
            .await?;
            Ok(outcome.value)
        })
        .await
    }

    async fn run_step<T, F, Fut>(
        &self,
        effective_key: &str,
        parent: Option<String>,
        opts: StepOptions,
        f: F,
    ) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.guard().await?;

        if !opts.force_recompute {
            if let Some(record) = self.store.get_step(&self.job_id, effective_key).await? {
                if record.status == StepStatus::Done {
                    let result = record.result.clone().unwrap_or(serde_json::Value::Null);
                    debug!(job_id = %self.job_id, key = effective_key, "step replayed");
                    return serde_json::from_value(result).map_err(|e| {
                        EngineError::StepFailed {
                            key: effective_key.to_string(),
                            message: format!("cached result failed to deserialize: {}", e),
                        }
                    });
                }
            }
        }

        let mut record = StepRecord::new(&self.job_id, effective_key);
        record.status = StepStatus::Running;
        record.parent_key = parent;
        record.title = opts.title.clone();
        record.prompt = opts.prompt.clone();
        record.tags = opts.tags.clone();
        self.guard().await?;
        self.store.upsert_step(&record).await?;

        self.stack.lock().push(effective_key.to_string());
        let started = Instant::now();
        let outcome = f().await;
        let duration_ms = started.elapsed().as_millis() as u64;
        {
            // Concurrent steps may have pushed after us; remove our own
            // key rather than whatever sits on top.
            let mut stack = self.stack.lock();
            if let Some(position) = stack.iter().rposition(|k| k == effective_key) {
                stack.remove(position);
            }
        }

        match outcome {
            Ok(value) => {
                // Re-read: nested calls may have annotated the record
                // while the producer ran.
                let mut record = self
                    .store
                    .get_step(&self.job_id, effective_key)
                    .await?
                    .unwrap_or(record);
                record.status = StepStatus::Done;
                record.result = Some(serde_json::to_value(&value).map_err(|e| {
                    EngineError::StepFailed {
                        key: effective_key.to_string(),
                        message: format!("result failed to serialize: {}", e),
                    }
                })?);
                record.duration_ms = Some(duration_ms);
                self.guard().await?;
                self.store.upsert_step(&record).await?;
                debug!(
                    job_id = %self.job_id,
                    key = effective_key,
                    duration_ms,
                    "step completed"
                );
                Ok(value)
            }
            Err(err) => {
                // Superseded or deleted runs abort silently; nothing is
                // recorded as a failure.
                if err.is_cancellation() {
                    return Err(err);
                }
                let mut record = self
                    .store
                    .get_step(&self.job_id, effective_key)
                    .await?
                    .unwrap_or(record);
                record.status = StepStatus::Failed;
                record.duration_ms = Some(duration_ms);
                record
                    .tags
                    .insert("error".to_string(), serde_json::Value::String(err.to_string()));
                record.tags.insert(
                    "error_chain".to_string(),
                    serde_json::Value::String(format!("{:?}", err)),
                );
                if let EngineError::Generate(generate_err) = &err {
                    if let Some(raw) = generate_err.raw_content() {
                        record.tags.insert(
                            "raw_response".to_string(),
                            serde_json::Value::String(raw.to_string()),
                        );
                    }
                }
                warn!(job_id = %self.job_id, key = effective_key, error = %err, "step failed");
                if self.guard().await.is_ok() {
                    self.store.upsert_step(&record).await?;
                }
                Err(err)
            }
        }
    }

    /// Merge tag entries into an existing step record.
    pub async fn annotate(
        &self,
        key: &str,
        entries: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Result<(), EngineError> {
        self.guard().await?;
        let mut record = self
            .store
            .get_step(&self.job_id, key)
            .await?
            .ok_or_else(|| EngineError::StepFailed {
                key: key.to_string(),
                message: "step record vanished during annotation".to_string(),
            })?;
        for (tag, value) in entries {
            record.tags.insert(tag, value);
        }
        self.store.upsert_step(&record).await?;
        Ok(())
    }

    /// Deserialized result of a done step; None otherwise.
    pub async fn get_step_result(&self, key: &str) -> Result<Option<serde_json::Value>, EngineError> {
        Ok(self
            .store
            .get_step(&self.job_id, key)
            .await?
            .filter(|record| record.status == StepStatus::Done)
            .and_then(|record| record.result))
    }

    /// True iff at least one step is keyed `phase:<name>:...` and all such
    /// steps are done.
    pub async fn is_phase_complete(&self, name: &str) -> Result<bool, EngineError> {
        let prefix = format!("phase:{}:", name);
        let steps = self.store.list_steps(&self.job_id).await?;
        let mut seen = false;
        for step in steps.iter().filter(|s| s.key.starts_with(&prefix)) {
            seen = true;
            if step.status != StepStatus::Done {
                return Ok(false);
            }
        }
        Ok(seen)
    }

    /// Record a versioned artifact for this job.
    ///
    /// The version is one past the highest existing version for the same
    /// (kind, tag-subset), so revision loops produce a monotone sequence.
    pub async fn save_artifact(
        &self,
        kind: &str,
        tags: BTreeMap<String, String>,
        content: serde_json::Value,
    ) -> Result<ArtifactRecord, EngineError> {
        self.guard().await?;
        let existing = self.store.list_artifacts(&self.job_id).await?;
        let version = latest_artifact_version(&existing, kind, &tags) + 1;
        let artifact = ArtifactRecord {
            id: artifact_id(&self.job_id, kind, version, &tags),
            job_id: self.job_id.clone(),
            kind: kind.to_string(),
            version,
            tags,
            content,
            created_at: Utc::now(),
        };
        self.guard().await?;
        self.store.upsert_artifact(&artifact).await?;
        Ok(artifact)
    }

    /// Replace an artifact's content in place, keeping its version.
    pub async fn rewrite_artifact(&self, artifact: &ArtifactRecord) -> Result<(), EngineError> {
        self.guard().await?;
        self.store.upsert_artifact(artifact).await?;
        Ok(())
    }

    /// Upsert a typed edge scoped to this job.
    pub async fn link(
        &self,
        from: (&str, &str),
        to: (&str, &str),
        role: &str,
    ) -> Result<(), EngineError> {
        self.guard().await?;
        self.store
            .upsert_link(&LinkRecord {
                job_id: self.job_id.clone(),
                from_type: from.0.to_string(),
                from_id: from.1.to_string(),
                to_type: to.0.to_string(),
                to_id: to.1.to_string(),
                role: role.to_string(),
            })
            .await?;
        Ok(())
    }
}

/// Content-addressed key for a generative step.
pub fn llm_step_key(task: &str, prompt: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(task.as_bytes());
    hasher.update(&[0]);
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    format!("llm:{}:{}", task, &hex::encode(digest.as_bytes())[..16])
}

fn artifact_id(job_id: &str, kind: &str, version: u64, tags: &BTreeMap<String, String>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(job_id.as_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(&version.to_le_bytes());
    for (tag, value) in tags {
        hasher.update(tag.as_bytes());
        hasher.update(&[0]);
        hasher.update(value.as_bytes());
        hasher.update(&[0]);
    }
    format!("art-{}", &hex::encode(hasher.finalize().as_bytes())[..16])
}
