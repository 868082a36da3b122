//! Document Pipelines
//!
//! Closed registry over the document kinds the engine produces. Each kind
//! pairs an input validator with a phase-pipeline builder; dispatch is a
//! match over the type tag, not reflection. Phases issue memoized steps in
//! order; the fhir pipeline runs the validate-refine loop over every
//! drafted resource before assembling the bundle.

use crate::error::EngineError;
use crate::generate::Generator;
use crate::refine::{self, RefineSettings};
use crate::step::{RunContext, StepOptions};
use crate::store::{DocumentStore, JobRecord, JobType};
use crate::terminology::TerminologyClient;
use crate::validator::ValidatorClient;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Shared collaborators handed to every pipeline run.
pub struct PipelineEnv {
    pub generator: Generator,
    pub terminology: Arc<dyn TerminologyClient>,
    pub validator: Arc<dyn ValidatorClient>,
    pub refine: RefineSettings,
}

/// Validate type-specific inputs before a job is created.
pub fn validate_inputs(job_type: JobType, inputs: &Value) -> Result<(), EngineError> {
    match job_type {
        JobType::Narrative => narrative::validate(inputs),
        JobType::Fhir => fhir::validate(inputs),
        JobType::Trajectory => trajectory::validate(inputs),
    }
}

/// Run the phase pipeline for the job's document kind.
pub async fn run_pipeline(
    job_type: JobType,
    ctx: &RunContext,
    env: &PipelineEnv,
    job: &JobRecord,
) -> Result<(), EngineError> {
    match job_type {
        JobType::Narrative => narrative::run(ctx, job).await,
        JobType::Fhir => fhir::run(ctx, env, job).await,
        JobType::Trajectory => trajectory::run(ctx, job).await,
    }
}

fn require_patient(inputs: &Value) -> Result<&Value, EngineError> {
    inputs
        .get("patient")
        .filter(|p| p.is_object())
        .ok_or_else(|| EngineError::InvalidInput("inputs.patient must be an object".to_string()))
}

fn titled(title: &str) -> StepOptions {
    StepOptions {
        title: Some(title.to_string()),
        ..StepOptions::default()
    }
}

mod narrative {
    use super::*;

    pub fn validate(inputs: &Value) -> Result<(), EngineError> {
        require_patient(inputs)?;
        if let Some(instructions) = inputs.get("instructions") {
            if !instructions.is_string() {
                return Err(EngineError::InvalidInput(
                    "inputs.instructions must be a string".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub async fn run(ctx: &RunContext, job: &JobRecord) -> Result<(), EngineError> {
        let patient = job.inputs.get("patient").cloned().unwrap_or(Value::Null);
        let instructions = job
            .inputs
            .get("instructions")
            .and_then(Value::as_str)
            .unwrap_or("Write a clinical narrative for this patient.")
            .to_string();

        let outline_prompt = format!(
            "Plan a clinical narrative.\nPatient:\n{}\nInstructions: {}\n\
             Reply with JSON: {{\"sections\": [{{\"heading\": ..., \"focus\": ...}}]}}",
            patient, instructions
        );
        let outline: Value = ctx
            .step("phase:outline:compose", titled("Outline sections"), || async {
                ctx.generate("narrative-outline", &outline_prompt, true).await
            })
            .await?;

        let draft_prompt = format!(
            "Write the narrative following this outline.\nPatient:\n{}\nOutline:\n{}\nInstructions: {}",
            patient, outline, instructions
        );
        let draft: Value = ctx
            .step("phase:draft:compose", titled("Compose narrative"), || async {
                ctx.generate("narrative-draft", &draft_prompt, false).await
            })
            .await?;

        let tags: BTreeMap<String, String> =
            [("format".to_string(), "narrative".to_string())].into();
        let artifact = ctx
            .save_artifact(
                "document",
                tags,
                serde_json::json!({"outline": outline, "text": draft}),
            )
            .await?;
        ctx.link(
            ("artifact", artifact.id.as_str()),
            ("step", "phase:draft:compose"),
            "generated-by",
        )
        .await?;
        Ok(())
    }
}

mod fhir {
    use super::*;

    pub fn validate(inputs: &Value) -> Result<(), EngineError> {
        require_patient(inputs)?;
        let resources = inputs
            .get("resources")
            .and_then(Value::as_array)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                EngineError::InvalidInput("inputs.resources must be a nonempty array".to_string())
            })?;
        for (index, spec) in resources.iter().enumerate() {
            if spec.get("type").and_then(Value::as_str).is_none() {
                return Err(EngineError::InvalidInput(format!(
                    "inputs.resources[{}].type must be a string",
                    index
                )));
            }
        }
        Ok(())
    }

    pub async fn run(ctx: &RunContext, env: &PipelineEnv, job: &JobRecord) -> Result<(), EngineError> {
        let patient = job.inputs.get("patient").cloned().unwrap_or(Value::Null);
        let specs: Vec<Value> = job
            .inputs
            .get("resources")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if ctx.is_phase_complete("resources").await? {
            debug!(job_id = %ctx.job_id(), "resource drafts cached; replaying");
        }

        let mut drafts: Vec<(String, String, Value)> = Vec::new();
        for (index, spec) in specs.iter().enumerate() {
            let resource_type = spec
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("Resource")
                .to_string();
            let label = format!("{}/{}", resource_type, index);
            let key = format!("phase:resources:draft:{}", index);
            let prompt = format!(
                "Generate one FHIR {} resource as JSON.\nPatient:\n{}\nSpecification:\n{}",
                resource_type, patient, spec
            );
            let draft: Value = ctx
                .step(&key, titled(&format!("Draft {}", label)), || async {
                    ctx.generate(&format!("fhir-draft:{}", resource_type), &prompt, true)
                        .await
                })
                .await?;
            drafts.push((label, key, draft));
        }

        let outcomes = refine::refine_all(
            ctx,
            env.terminology.as_ref(),
            env.validator.as_ref(),
            &env.refine,
            drafts
                .iter()
                .map(|(label, _, draft)| (label.clone(), draft.clone()))
                .collect(),
        )
        .await?;

        let mut entry_ids: Vec<String> = Vec::new();
        let mut bundle_entries: Vec<Value> = Vec::new();
        for ((label, draft_key, _), outcome) in drafts.iter().zip(outcomes) {
            let tags: BTreeMap<String, String> = [
                ("format".to_string(), "fhir".to_string()),
                ("resource".to_string(), label.clone()),
            ]
            .into();
            let artifact = ctx
                .save_artifact("document", tags, outcome.resource.clone())
                .await?;
            ctx.link(
                ("artifact", artifact.id.as_str()),
                ("step", draft_key.as_str()),
                "generated-by",
            )
            .await?;

            // The loop persisted its trace artifact while running; tie it
            // to the document it explains.
            let artifacts = ctx.store().list_artifacts(ctx.job_id()).await?;
            if let Some(trace) = artifacts.iter().find(|a| {
                a.kind == "refine-trace" && a.tags.get("resource") == Some(label)
            }) {
                ctx.link(("artifact", trace.id.as_str()), ("artifact", artifact.id.as_str()), "trace-of")
                    .await?;
            }

            entry_ids.push(artifact.id.clone());
            bundle_entries.push(outcome.resource);
        }

        let tags: BTreeMap<String, String> = [("format".to_string(), "fhir".to_string())].into();
        let bundle = ctx
            .save_artifact(
                "bundle",
                tags,
                serde_json::json!({
                    "resourceType": "Bundle",
                    "type": "collection",
                    "entry": bundle_entries
                        .into_iter()
                        .map(|resource| serde_json::json!({"resource": resource}))
                        .collect::<Vec<_>>(),
                }),
            )
            .await?;
        for entry_id in entry_ids {
            ctx.link(("artifact", bundle.id.as_str()), ("artifact", entry_id.as_str()), "contains")
                .await?;
        }
        Ok(())
    }
}

mod trajectory {
    use super::*;

    /// Upper bound on generated episodes so a malformed timeline cannot
    /// fan out unbounded generative calls.
    const MAX_EPISODES: usize = 8;

    pub fn validate(inputs: &Value) -> Result<(), EngineError> {
        require_patient(inputs)?;
        Ok(())
    }

    pub async fn run(ctx: &RunContext, job: &JobRecord) -> Result<(), EngineError> {
        let patient = job.inputs.get("patient").cloned().unwrap_or(Value::Null);

        let timeline_prompt = format!(
            "Reconstruct the clinical trajectory for this patient.\nPatient:\n{}\n\
             Reply with JSON: {{\"episodes\": [{{\"label\": ..., \"period\": ..., \"focus\": ...}}]}}",
            patient
        );
        let timeline: Value = ctx
            .step("phase:timeline:compose", titled("Reconstruct timeline"), || async {
                ctx.generate("trajectory-timeline", &timeline_prompt, true).await
            })
            .await?;

        let episodes: Vec<Value> = timeline
            .get("episodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut summaries: Vec<Value> = Vec::new();
        for (index, episode) in episodes.iter().take(MAX_EPISODES).enumerate() {
            let key = format!("phase:episodes:summarize:{}", index);
            let prompt = format!(
                "Summarize this care episode.\nPatient:\n{}\nEpisode:\n{}",
                patient, episode
            );
            let summary: Value = ctx
                .step(&key, titled(&format!("Summarize episode {}", index)), || async {
                    ctx.generate("trajectory-episode", &prompt, false).await
                })
                .await?;
            summaries.push(serde_json::json!({
                "episode": episode,
                "summary": summary,
            }));
        }

        let tags: BTreeMap<String, String> =
            [("format".to_string(), "trajectory".to_string())].into();
        let artifact = ctx
            .save_artifact(
                "document",
                tags,
                serde_json::json!({"timeline": timeline, "episodes": summaries}),
            )
            .await?;
        ctx.link(
            ("artifact", artifact.id.as_str()),
            ("step", "phase:timeline:compose"),
            "generated-by",
        )
        .await?;
        Ok(())
    }
}
