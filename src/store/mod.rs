//! Document Store
//!
//! Records and the persistence contract for jobs, steps, artifacts and
//! links. The engine depends on the `DocumentStore` trait only; the backing
//! technology lives outside the engine. An in-memory reference
//! implementation ships for tests and embedding.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Blocked,
    Paused,
}

/// Document kind produced by a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Narrative,
    Fhir,
    Trajectory,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Narrative => "narrative",
            JobType::Fhir => "fhir",
            JobType::Trajectory => "trajectory",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "narrative" => Ok(JobType::Narrative),
            "fhir" => Ok(JobType::Fhir),
            "trajectory" => Ok(JobType::Trajectory),
            other => Err(format!("unknown job type: {}", other)),
        }
    }
}

/// Top-level unit of work producing one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub title: String,
    pub job_type: JobType,
    /// Type-specific inputs, validated by the pipeline registry on create.
    pub inputs: serde_json::Value,
    pub status: JobStatus,
    pub depends_on: Vec<String>,
    pub last_error: Option<String>,
    /// Execution epoch. Incremented on rerun; a write from an execution
    /// holding an older epoch is rejected.
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// A memoized unit of work within a job, keyed by (job_id, key)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub job_id: String,
    pub key: String,
    pub status: StepStatus,
    /// Serialized result; present only when status is Done.
    pub result: Option<serde_json::Value>,
    /// Free-form provenance: token usage, raw responses, error payloads.
    pub tags: serde_json::Map<String, serde_json::Value>,
    pub parent_key: Option<String>,
    pub duration_ms: Option<u64>,
    pub prompt: Option<String>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(job_id: &str, key: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            key: key.to_string(),
            status: StepStatus::Pending,
            result: None,
            tags: serde_json::Map::new(),
            parent_key: None,
            duration_ms: None,
            prompt: None,
            title: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A versioned output object recorded for a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub job_id: String,
    pub kind: String,
    pub version: u64,
    /// Selection tags; a BTreeMap so tag subsets compare deterministically.
    pub tags: BTreeMap<String, String>,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A typed directed edge between two entities, scoped to a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub job_id: String,
    pub from_type: String,
    pub from_id: String,
    pub to_type: String,
    pub to_id: String,
    pub role: String,
}

/// Persistence contract required from a store backend.
///
/// Upserts replace on a repeated composite key rather than duplicating:
/// steps dedupe on (job_id, key), links on the full edge tuple, artifacts
/// on their id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    // Jobs
    async fn create_job(&self, job: &JobRecord) -> Result<(), StoreError>;
    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;
    async fn all_jobs(&self) -> Result<Vec<JobRecord>, StoreError>;
    async fn update_job(&self, job: &JobRecord) -> Result<(), StoreError>;
    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        last_error: Option<String>,
    ) -> Result<(), StoreError>;
    async fn delete_job(&self, id: &str) -> Result<(), StoreError>;
    /// Jobs whose depends_on contains the given job id.
    async fn list_jobs_depending_on(&self, id: &str) -> Result<Vec<JobRecord>, StoreError>;

    // Steps
    async fn get_step(&self, job_id: &str, key: &str) -> Result<Option<StepRecord>, StoreError>;
    async fn upsert_step(&self, step: &StepRecord) -> Result<(), StoreError>;
    async fn list_steps(&self, job_id: &str) -> Result<Vec<StepRecord>, StoreError>;
    async fn delete_steps(&self, job_id: &str) -> Result<(), StoreError>;

    // Artifacts
    async fn upsert_artifact(&self, artifact: &ArtifactRecord) -> Result<(), StoreError>;
    async fn get_artifact(&self, id: &str) -> Result<Option<ArtifactRecord>, StoreError>;
    async fn list_artifacts(&self, job_id: &str) -> Result<Vec<ArtifactRecord>, StoreError>;
    async fn delete_artifacts(&self, job_id: &str) -> Result<(), StoreError>;

    // Links
    async fn upsert_link(&self, link: &LinkRecord) -> Result<(), StoreError>;
    async fn list_links(&self, job_id: &str) -> Result<Vec<LinkRecord>, StoreError>;
    async fn delete_links(&self, job_id: &str) -> Result<(), StoreError>;
}

/// Highest artifact version for a (job, kind, tag-subset) selection.
///
/// `tags` is a subset match: an artifact qualifies when every given tag is
/// present with the same value.
pub fn latest_artifact_version(
    artifacts: &[ArtifactRecord],
    kind: &str,
    tags: &BTreeMap<String, String>,
) -> u64 {
    artifacts
        .iter()
        .filter(|a| a.kind == kind)
        .filter(|a| tags.iter().all(|(k, v)| a.tags.get(k) == Some(v)))
        .map(|a| a.version)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(kind: &str, version: u64, tags: &[(&str, &str)]) -> ArtifactRecord {
        ArtifactRecord {
            id: format!("{}-{}", kind, version),
            job_id: "job-1".to_string(),
            kind: kind.to_string(),
            version,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            content: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn latest_version_respects_kind_and_tag_subset() {
        let artifacts = vec![
            artifact("document", 1, &[("resource", "Condition/1")]),
            artifact("document", 3, &[("resource", "Condition/1")]),
            artifact("document", 7, &[("resource", "Observation/2")]),
            artifact("refine-trace", 9, &[("resource", "Condition/1")]),
        ];

        let tags: BTreeMap<String, String> =
            [("resource".to_string(), "Condition/1".to_string())].into();
        assert_eq!(latest_artifact_version(&artifacts, "document", &tags), 3);

        let empty = BTreeMap::new();
        assert_eq!(latest_artifact_version(&artifacts, "document", &empty), 7);
        assert_eq!(latest_artifact_version(&artifacts, "missing", &empty), 0);
    }

    #[test]
    fn job_type_round_trips_through_str() {
        for ty in [JobType::Narrative, JobType::Fhir, JobType::Trajectory] {
            assert_eq!(ty.as_str().parse::<JobType>().unwrap(), ty);
        }
        assert!("modal".parse::<JobType>().is_err());
    }
}
