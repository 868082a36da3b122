//! Job Scheduler
//!
//! Job lifecycle state machine plus dependency-gated auto-triggering.
//! Jobs move queued → running → done/failed; a job created with
//! dependencies starts blocked and is released by `trigger_ready_jobs`
//! once every dependency is done. Reruns bump the job's epoch so a
//! superseded in-flight execution can no longer write.

use crate::error::EngineError;
use crate::pipeline::{self, PipelineEnv};
use crate::step::RunContext;
use crate::store::{DocumentStore, JobRecord, JobStatus, JobType, StepStatus};
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parameters for creating a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub title: String,
    pub job_type: JobType,
    pub inputs: serde_json::Value,
    pub depends_on: Vec<String>,
}

/// Operator-facing summary of one job
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobSummary {
    pub id: String,
    pub title: String,
    pub status: JobStatus,
    pub run_count: u64,
    pub last_error: Option<String>,
    pub steps_done: usize,
    pub steps_failed: usize,
    pub steps_total: usize,
    /// Phase name → whether every step of that phase is done.
    pub phases: BTreeMap<String, bool>,
    pub artifacts: Vec<ArtifactSummary>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ArtifactSummary {
    pub kind: String,
    pub version: u64,
}

/// Job scheduler
pub struct Scheduler {
    store: Arc<dyn DocumentStore>,
    env: Arc<PipelineEnv>,
    /// Jobs currently being transitioned out of blocked/queued; guards
    /// trigger_ready_jobs against concurrent double-starts.
    starting: Mutex<HashSet<String>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn DocumentStore>, env: Arc<PipelineEnv>) -> Self {
        Self {
            store,
            env,
            starting: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Create a job and immediately attempt to release any ready jobs.
    ///
    /// The id is salted with the creation timestamp and a random nonce, so
    /// identical inputs never collide. Nonempty dependencies force the
    /// initial status to blocked unless every dependency is already done.
    pub async fn create(&self, new_job: NewJob) -> Result<JobRecord, EngineError> {
        pipeline::validate_inputs(new_job.job_type, &new_job.inputs)?;

        let mut all_deps_done = true;
        for dep in &new_job.depends_on {
            let dep_job = self
                .store
                .get_job(dep)
                .await?
                .ok_or_else(|| EngineError::InvalidInput(format!("unknown dependency: {}", dep)))?;
            if dep_job.status != JobStatus::Done {
                all_deps_done = false;
            }
        }

        let now = Utc::now();
        let status = if new_job.depends_on.is_empty() || all_deps_done {
            JobStatus::Queued
        } else {
            JobStatus::Blocked
        };
        let job = JobRecord {
            id: salted_job_id(&new_job.title, new_job.job_type),
            title: new_job.title,
            job_type: new_job.job_type,
            inputs: new_job.inputs,
            status,
            depends_on: new_job.depends_on,
            last_error: None,
            run_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.create_job(&job).await?;
        info!(job_id = %job.id, job_type = job.job_type.as_str(), ?status, "job created");

        self.trigger_ready_jobs().await?;
        Ok(job)
    }

    /// Build the job's phase pipeline and run it to completion.
    ///
    /// No-ops when the job is already running or done; errors when it is
    /// blocked. Stale-run and job-deleted signals abort silently; any
    /// other pipeline error marks the job failed and is re-raised.
    pub async fn start(&self, job_id: &str) -> Result<(), EngineError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobDeleted(job_id.to_string()))?;

        match job.status {
            JobStatus::Running | JobStatus::Done => {
                debug!(job_id, status = ?job.status, "start is a no-op");
                return Ok(());
            }
            JobStatus::Blocked => {
                return Err(EngineError::JobBlocked(job_id.to_string()));
            }
            JobStatus::Queued | JobStatus::Failed | JobStatus::Paused => {}
        }

        self.store
            .update_job_status(job_id, JobStatus::Running, None)
            .await?;
        info!(job_id, epoch = job.run_count, "job started");

        let ctx = RunContext::new(
            Arc::clone(&self.store),
            self.env.generator.clone(),
            &job,
        );
        let outcome = pipeline::run_pipeline(job.job_type, &ctx, &self.env, &job).await;

        match outcome {
            Ok(()) => {
                // Only the execution still holding the current epoch may
                // conclude the job.
                if let Some(current) = self.store.get_job(job_id).await? {
                    if current.run_count == job.run_count {
                        self.store
                            .update_job_status(job_id, JobStatus::Done, None)
                            .await?;
                        info!(job_id, "job done");
                        self.trigger_ready_jobs().await?;
                    }
                }
                Ok(())
            }
            Err(err) if err.is_cancellation() => {
                debug!(job_id, reason = %err, "run superseded or job deleted; aborting silently");
                Ok(())
            }
            Err(err) => {
                if let Some(current) = self.store.get_job(job_id).await? {
                    if current.run_count == job.run_count {
                        self.store
                            .update_job_status(job_id, JobStatus::Failed, Some(err.to_string()))
                            .await?;
                    }
                }
                warn!(job_id, error = %err, "job failed");
                Err(err)
            }
        }
    }

    /// Invalidate the previous execution and run the job again.
    ///
    /// Artifacts and links from prior runs are deleted; the step cache is
    /// preserved so unchanged steps replay instantly.
    pub async fn rerun(&self, job_id: &str) -> Result<(), EngineError> {
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobDeleted(job_id.to_string()))?;
        job.run_count += 1;
        job.status = JobStatus::Queued;
        job.last_error = None;
        self.store.update_job(&job).await?;
        self.store.delete_artifacts(job_id).await?;
        self.store.delete_links(job_id).await?;
        info!(job_id, epoch = job.run_count, "job rerun");
        self.start(job_id).await
    }

    /// Reset matching steps to pending without touching artifacts.
    ///
    /// A step matches when its key contains the filter; no filter matches
    /// every step. Matching steps recompute on the next start.
    pub async fn clear_cache(&self, job_id: &str, filter: Option<&str>) -> Result<usize, EngineError> {
        let steps = self.store.list_steps(job_id).await?;
        let mut cleared = 0;
        for mut step in steps {
            if filter.map_or(true, |f| step.key.contains(f)) {
                step.status = StepStatus::Pending;
                step.result = None;
                self.store.upsert_step(&step).await?;
                cleared += 1;
            }
        }
        info!(job_id, cleared, "step cache cleared");
        Ok(cleared)
    }

    /// Release every blocked job whose dependencies are all done.
    ///
    /// Safe against concurrent invocation: a per-scheduler starting set
    /// plus a status re-read keep each job from being started twice.
    pub fn trigger_ready_jobs(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let jobs = self.store.all_jobs().await?;
            for job in jobs.iter().filter(|j| j.status == JobStatus::Blocked) {
                let mut ready = true;
                for dep in &job.depends_on {
                    match self.store.get_job(dep).await? {
                        Some(dep_job) if dep_job.status == JobStatus::Done => {}
                        _ => {
                            ready = false;
                            break;
                        }
                    }
                }
                if !ready {
                    continue;
                }

                if !self.starting.lock().insert(job.id.clone()) {
                    continue;
                }
                let result = self.release_and_start(&job.id).await;
                self.starting.lock().remove(&job.id);
                if let Err(err) = result {
                    if !err.is_cancellation() {
                        warn!(job_id = %job.id, error = %err, "triggered job failed");
                    }
                }
            }
            Ok(())
        })
    }

    async fn release_and_start(&self, job_id: &str) -> Result<(), EngineError> {
        // Re-read under the starting guard: another invocation may have
        // transitioned this job already.
        let current = match self.store.get_job(job_id).await? {
            Some(job) if job.status == JobStatus::Blocked => job,
            _ => return Ok(()),
        };
        self.store
            .update_job_status(&current.id, JobStatus::Queued, None)
            .await?;
        self.start(job_id).await
    }

    /// Crash-recovery marker: any job observed running at process start
    /// was interrupted. Mark it paused; paused jobs are never auto-resumed.
    pub async fn recover_interrupted(&self) -> Result<usize, EngineError> {
        let jobs = self.store.all_jobs().await?;
        let mut paused = 0;
        for job in jobs.iter().filter(|j| j.status == JobStatus::Running) {
            self.store
                .update_job_status(&job.id, JobStatus::Paused, None)
                .await?;
            info!(job_id = %job.id, "interrupted job marked paused");
            paused += 1;
        }
        Ok(paused)
    }

    /// Delete a job with all of its steps, artifacts and links.
    pub async fn delete(&self, job_id: &str) -> Result<(), EngineError> {
        self.store.delete_steps(job_id).await?;
        self.store.delete_artifacts(job_id).await?;
        self.store.delete_links(job_id).await?;
        self.store.delete_job(job_id).await?;
        info!(job_id, "job deleted");
        Ok(())
    }

    /// Summarize a job for operator inspection.
    pub async fn status(&self, job_id: &str) -> Result<JobSummary, EngineError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobDeleted(job_id.to_string()))?;
        let steps = self.store.list_steps(job_id).await?;
        let artifacts = self.store.list_artifacts(job_id).await?;

        let mut phases: BTreeMap<String, bool> = BTreeMap::new();
        for step in &steps {
            let Some((name, _)) = step
                .key
                .strip_prefix("phase:")
                .and_then(|rest| rest.split_once(':'))
            else {
                continue;
            };
            let done = step.status == StepStatus::Done;
            phases
                .entry(name.to_string())
                .and_modify(|all| *all &= done)
                .or_insert(done);
        }

        Ok(JobSummary {
            id: job.id,
            title: job.title,
            status: job.status,
            run_count: job.run_count,
            last_error: job.last_error,
            steps_done: steps.iter().filter(|s| s.status == StepStatus::Done).count(),
            steps_failed: steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .count(),
            steps_total: steps.len(),
            phases,
            artifacts: artifacts
                .iter()
                .map(|a| ArtifactSummary {
                    kind: a.kind.clone(),
                    version: a.version,
                })
                .collect(),
        })
    }
}

/// Globally unique job id: content hash salted with the creation instant
/// and a random nonce.
fn salted_job_id(title: &str, job_type: JobType) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(title.as_bytes());
    hasher.update(job_type.as_str().as_bytes());
    hasher.update(&Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(&rand::thread_rng().gen::<u64>().to_le_bytes());
    format!("job-{}", &hex::encode(hasher.finalize().as_bytes())[..16])
}
