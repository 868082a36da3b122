//! Error types for the clinical document orchestration engine.

use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Step not found: {0}/{1}")]
    StepNotFound(String, String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Retrying generative-call errors
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unparseable response envelope: {0}")]
    Envelope(String),

    #[error("Response is missing completion content")]
    MissingContent,

    #[error("Structured content failed parsing: {0}")]
    Structured(String),

    #[error("Generation exhausted after {attempts} attempts (last status: {last_status:?})")]
    Exhausted {
        attempts: usize,
        last_status: Option<u16>,
        last_raw: Option<String>,
    },
}

impl GenerateError {
    /// Raw upstream content carried by this error, if any.
    pub fn raw_content(&self) -> Option<&str> {
        match self {
            GenerateError::Status { body, .. } => Some(body.as_str()),
            GenerateError::Envelope(raw) | GenerateError::Structured(raw) => Some(raw.as_str()),
            GenerateError::Exhausted { last_raw, .. } => last_raw.as_deref(),
            _ => None,
        }
    }
}

/// Engine-level errors
///
/// `StaleRun` and `JobDeleted` are control-flow sentinels: the scheduler
/// swallows them without marking the job failed. Everything else that
/// escapes a pipeline is terminal for that run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Stale run: job {job_id} is now at epoch {current_epoch}, execution holds {held_epoch}")]
    StaleRun {
        job_id: String,
        held_epoch: u64,
        current_epoch: u64,
    },

    #[error("Job deleted: {0}")]
    JobDeleted(String),

    #[error("Job is blocked on unfinished dependencies: {0}")]
    JobBlocked(String),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Invalid job inputs: {0}")]
    InvalidInput(String),

    #[error("Step failed: {key}: {message}")]
    StepFailed { key: String, message: String },

    #[error("Invalid patch: {0}")]
    Patch(String),

    #[error("Invalid pointer: {0}")]
    Pointer(String),

    #[error("Terminology service error: {0}")]
    Terminology(String),

    #[error("Validator service error: {0}")]
    Validator(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Generation error: {0}")]
    Generate(#[from] GenerateError),
}

impl EngineError {
    /// True for the control-flow sentinels that abort a superseded or
    /// deleted run without surfacing a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::StaleRun { .. } | EngineError::JobDeleted(_))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}
