//! In-memory reference implementation of the `DocumentStore` contract.
//!
//! Backs tests and library embeddings that do not bring their own store.
//! Upsert semantics match the contract: repeated composite keys replace.

use crate::error::StoreError;
use crate::store::{ArtifactRecord, DocumentStore, JobRecord, JobStatus, LinkRecord, StepRecord};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct Tables {
    jobs: HashMap<String, JobRecord>,
    /// Keyed by (job_id, step key).
    steps: HashMap<(String, String), StepRecord>,
    artifacts: HashMap<String, ArtifactRecord>,
    links: Vec<LinkRecord>,
}

/// In-memory document store
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.jobs.contains_key(&job.id) {
            return Err(StoreError::Backend(format!(
                "job id already exists: {}",
                job.id
            )));
        }
        tables.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.tables.read().jobs.get(id).cloned())
    }

    async fn all_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs: Vec<JobRecord> = self.tables.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn update_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.jobs.contains_key(&job.id) {
            return Err(StoreError::JobNotFound(job.id.clone()));
        }
        let mut updated = job.clone();
        updated.updated_at = Utc::now();
        tables.jobs.insert(job.id.clone(), updated);
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        last_error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let job = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        job.status = status;
        if last_error.is_some() {
            job.last_error = last_error;
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        self.tables.write().jobs.remove(id);
        Ok(())
    }

    async fn list_jobs_depending_on(&self, id: &str) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .jobs
            .values()
            .filter(|job| job.depends_on.iter().any(|dep| dep == id))
            .cloned()
            .collect())
    }

    async fn get_step(&self, job_id: &str, key: &str) -> Result<Option<StepRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .steps
            .get(&(job_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn upsert_step(&self, step: &StepRecord) -> Result<(), StoreError> {
        let mut record = step.clone();
        record.updated_at = Utc::now();
        self.tables
            .write()
            .steps
            .insert((step.job_id.clone(), step.key.clone()), record);
        Ok(())
    }

    async fn list_steps(&self, job_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let mut steps: Vec<StepRecord> = self
            .tables
            .read()
            .steps
            .values()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        Ok(steps)
    }

    async fn delete_steps(&self, job_id: &str) -> Result<(), StoreError> {
        self.tables.write().steps.retain(|(jid, _), _| jid != job_id);
        Ok(())
    }

    async fn upsert_artifact(&self, artifact: &ArtifactRecord) -> Result<(), StoreError> {
        self.tables
            .write()
            .artifacts
            .insert(artifact.id.clone(), artifact.clone());
        Ok(())
    }

    async fn get_artifact(&self, id: &str) -> Result<Option<ArtifactRecord>, StoreError> {
        Ok(self.tables.read().artifacts.get(id).cloned())
    }

    async fn list_artifacts(&self, job_id: &str) -> Result<Vec<ArtifactRecord>, StoreError> {
        let mut artifacts: Vec<ArtifactRecord> = self
            .tables
            .read()
            .artifacts
            .values()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then(a.version.cmp(&b.version))
                .then(a.id.cmp(&b.id))
        });
        Ok(artifacts)
    }

    async fn delete_artifacts(&self, job_id: &str) -> Result<(), StoreError> {
        self.tables.write().artifacts.retain(|_, a| a.job_id != job_id);
        Ok(())
    }

    async fn upsert_link(&self, link: &LinkRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        // Replace on the full composite key; role participates in identity.
        if let Some(existing) = tables.links.iter_mut().find(|l| *l == link) {
            *existing = link.clone();
        } else {
            tables.links.push(link.clone());
        }
        Ok(())
    }

    async fn list_links(&self, job_id: &str) -> Result<Vec<LinkRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .links
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn delete_links(&self, job_id: &str) -> Result<(), StoreError> {
        self.tables.write().links.retain(|l| l.job_id != job_id);
        Ok(())
    }
}
