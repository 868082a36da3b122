//! Validate-Refine Loop
//!
//! Repairs one generated resource under a fixed turn budget. Each turn
//! snapshots the outstanding issues (unresolved codings + validator
//! errors), asks the generative decision-maker for exactly one decision,
//! and applies it. The working resource is only ever replaced by a patched
//! clone that strictly improves the issue counts, so the loop never
//! regresses. Failure is visible, never silent: a resource that exhausts
//! its budget is emitted with an audit extension at every unresolved
//! pointer.

use crate::coding::{
    self, finalize_unresolved, CodingReason, CodingReportItem, CodingStatus, UnresolvedAnnotation,
};
use crate::error::EngineError;
use crate::patch;
use crate::pointer;
use crate::step::RunContext;
use crate::store::ArtifactRecord;
use crate::terminology::{SearchHit, TerminologyClient};
use crate::validator::{ValidationIssue, ValidatorClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Loop tuning
#[derive(Debug, Clone)]
pub struct RefineSettings {
    /// Decision turns available per resource.
    pub turn_budget: usize,
    /// Resources refined concurrently within one document.
    pub fan_out: usize,
}

impl Default for RefineSettings {
    fn default() -> Self {
        Self {
            turn_budget: 12,
            fan_out: 3,
        }
    }
}

/// Per-pointer history of terminology queries and their hits.
///
/// Anchors future proposals to observed candidates and prevents repeat
/// queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotebookEntry {
    pub queries: Vec<String>,
    pub hits: Vec<SearchHit>,
}

pub type SearchNotebook = BTreeMap<String, NotebookEntry>;

/// One audit-trace row, appended every turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub turn: usize,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub unresolved_before: usize,
    pub errors_before: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unresolved_after: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors_after: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub raw_decision: Value,
}

/// Final state of one refined resource
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    pub resource: Value,
    pub clean: bool,
    pub turns_used: usize,
    pub report: Vec<CodingReportItem>,
    pub error_count: usize,
    pub notebook: SearchNotebook,
    pub trace: Vec<TraceEntry>,
}

/// The decision shape requested from the generative service.
#[derive(Debug, Clone, Default, Deserialize)]
struct Decision {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    pointer: Option<String>,
    #[serde(default)]
    terms: Option<Vec<String>>,
    #[serde(default)]
    systems: Option<Vec<String>>,
    #[serde(default)]
    patch: Option<Value>,
    #[serde(default)]
    rationale: Option<String>,
}

struct IssueSnapshot {
    report: Vec<CodingReportItem>,
    errors: Vec<ValidationIssue>,
    fatal: bool,
}

impl IssueSnapshot {
    fn unresolved_count(&self) -> usize {
        self.report.iter().filter(|i| i.needs_work()).count()
    }

    fn error_count(&self) -> usize {
        self.errors.len()
    }

    fn clean(&self) -> bool {
        self.unresolved_count() == 0 && self.error_count() == 0
    }
}

/// Validate-refine loop over one resource
pub struct RefineLoop<'a> {
    ctx: &'a RunContext,
    terminology: &'a dyn TerminologyClient,
    validator: &'a dyn ValidatorClient,
    settings: &'a RefineSettings,
    /// Label identifying the resource inside its document, used for trace
    /// artifact tags and generative task names.
    label: String,
}

impl<'a> RefineLoop<'a> {
    pub fn new(
        ctx: &'a RunContext,
        terminology: &'a dyn TerminologyClient,
        validator: &'a dyn ValidatorClient,
        settings: &'a RefineSettings,
        label: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            terminology,
            validator,
            settings,
            label: label.into(),
        }
    }

    /// Drive the resource to clean or to budget exhaustion.
    pub async fn run(&self, resource: Value) -> Result<RefineOutcome, EngineError> {
        let mut working = resource;
        let mut notebook: SearchNotebook = SearchNotebook::new();
        let mut trace: Vec<TraceEntry> = Vec::new();
        let mut trace_artifact: Option<ArtifactRecord> = None;
        let mut turns_used = 0;
        let mut rejected_updates = 0;
        let mut initially_dirty: HashSet<String> = HashSet::new();
        let mut last_snapshot: Option<IssueSnapshot> = None;

        while turns_used < self.settings.turn_budget.max(1) {
            let mut snapshot = match self.snapshot(&working).await {
                Ok(snapshot) => snapshot,
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    // Service hiccups never abort the loop; they spend a
                    // turn and show up in the trace.
                    turns_used += 1;
                    let entry = TraceEntry {
                        turn: turns_used,
                        action: "snapshot_error".to_string(),
                        rationale: None,
                        unresolved_before: 0,
                        errors_before: 0,
                        unresolved_after: None,
                        errors_after: None,
                        outcome: Some(err.to_string()),
                        raw_decision: Value::Null,
                    };
                    trace.push(entry);
                    self.persist_trace(&trace, &mut trace_artifact).await?;
                    continue;
                }
            };

            for item in snapshot.report.iter().filter(|i| i.needs_work()) {
                initially_dirty.insert(item.pointer.clone());
            }

            if snapshot.clean() {
                last_snapshot = Some(snapshot);
                break;
            }

            let prompt = build_decision_prompt(&working, &snapshot, &notebook);
            let decision_value = match self
                .ctx
                .generate(&format!("refine:{}", self.label), &prompt, true)
                .await
            {
                Ok(value) => value,
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    turns_used += 1;
                    trace.push(TraceEntry {
                        turn: turns_used,
                        action: "decision_error".to_string(),
                        rationale: None,
                        unresolved_before: snapshot.unresolved_count(),
                        errors_before: snapshot.error_count(),
                        unresolved_after: None,
                        errors_after: None,
                        outcome: Some(err.to_string()),
                        raw_decision: Value::Null,
                    });
                    self.persist_trace(&trace, &mut trace_artifact).await?;
                    last_snapshot = Some(snapshot);
                    continue;
                }
            };

            turns_used += 1;
            let decision: Decision =
                serde_json::from_value(decision_value.clone()).unwrap_or_default();
            let mut entry = TraceEntry {
                turn: turns_used,
                action: decision.action.clone().unwrap_or_else(|| "unknown".to_string()),
                rationale: decision.rationale.clone(),
                unresolved_before: snapshot.unresolved_count(),
                errors_before: snapshot.error_count(),
                unresolved_after: None,
                errors_after: None,
                outcome: None,
                raw_decision: decision_value,
            };

            let mut stop = false;
            match decision.action.as_deref() {
                Some("search_for_coding") => {
                    entry.outcome = Some(
                        self.handle_search(&decision, &mut notebook)
                            .await
                            .unwrap_or_else(|err| format!("search_error: {}", err)),
                    );
                }
                Some("update") => {
                    let update = self.handle_update(&decision, &working, &snapshot).await?;
                    entry.outcome = Some(update.outcome);
                    entry.unresolved_after = update.unresolved_after;
                    entry.errors_after = update.errors_after;
                    if let Some((resource, after)) = update.accepted {
                        // The acceptance check already snapshotted the
                        // candidate; carry it so the final state needs no
                        // extra service round-trip.
                        working = resource;
                        snapshot = after;
                    }
                    rejected_updates += usize::from(entry.outcome.as_deref() != Some("accepted"));
                }
                Some("stop") => {
                    entry.outcome = Some("stopped".to_string());
                    stop = true;
                }
                other => {
                    // Malformed output spends a turn; the budget is what
                    // keeps the loop finite.
                    warn!(label = %self.label, action = ?other, "unknown refine decision");
                    entry.action = "unknown".to_string();
                }
            }

            trace.push(entry);
            self.persist_trace(&trace, &mut trace_artifact).await?;
            last_snapshot = Some(snapshot);
            if stop {
                break;
            }
        }

        // Settle the final issue state. Every completed turn leaves a
        // snapshot of the current working resource behind; only a loop
        // that never got one (snapshot errors throughout) recomputes.
        let final_snapshot = match last_snapshot {
            Some(snapshot) => snapshot,
            None => self.snapshot(&working).await?,
        };

        let mut report = final_snapshot.report;
        for item in report.iter_mut() {
            if item.status == CodingStatus::Ok && initially_dirty.contains(&item.pointer) {
                item.status = CodingStatus::Recoded;
            } else if item.needs_work() {
                item.status = CodingStatus::Unresolved;
            }
        }
        let clean = report.iter().all(|i| i.status != CodingStatus::Unresolved)
            && final_snapshot.errors.is_empty();

        let resource = if clean {
            info!(label = %self.label, turns_used, "resource refined clean");
            working
        } else {
            info!(
                label = %self.label,
                turns_used,
                unresolved = report.iter().filter(|i| i.status == CodingStatus::Unresolved).count(),
                errors = final_snapshot.errors.len(),
                "refine budget exhausted with unresolved issues"
            );
            let annotations =
                build_annotations(&working, &report, &final_snapshot.errors, &notebook, turns_used, rejected_updates);
            finalize_unresolved(&working, &annotations)?
        };

        Ok(RefineOutcome {
            resource,
            clean,
            turns_used,
            report,
            error_count: final_snapshot.errors.len(),
            notebook,
            trace,
        })
    }

    async fn snapshot(&self, resource: &Value) -> Result<IssueSnapshot, EngineError> {
        let report = coding::analyze(resource, self.terminology).await?;
        let validation = self.validator.validate(resource).await?;
        let fatal = validation
            .issues
            .iter()
            .any(|i| i.severity == crate::validator::Severity::Fatal);
        Ok(IssueSnapshot {
            report,
            errors: validation.errors().cloned().collect(),
            fatal,
        })
    }

    /// Execute only terms not already tried for the pointer
    /// (case-insensitive); append results to the notebook.
    async fn handle_search(
        &self,
        decision: &Decision,
        notebook: &mut SearchNotebook,
    ) -> Result<String, EngineError> {
        let Some(ptr) = decision.pointer.clone() else {
            return Ok("search_missing_pointer".to_string());
        };
        let terms = decision.terms.clone().unwrap_or_default();
        let systems = decision.systems.clone().unwrap_or_default();

        let entry = notebook.entry(ptr.clone()).or_default();
        let tried: HashSet<String> = entry.queries.iter().map(|q| q.to_lowercase()).collect();
        let mut new_terms: Vec<String> = Vec::new();
        for term in terms {
            let lowered = term.to_lowercase();
            if !tried.contains(&lowered)
                && !new_terms.iter().any(|t: &String| t.to_lowercase() == lowered)
            {
                new_terms.push(term);
            }
        }

        if new_terms.is_empty() {
            debug!(label = %self.label, pointer = %ptr, "all search terms already tried");
            return Ok("no_new_terms".to_string());
        }

        let hit_lists = self.terminology.search(&new_terms, &systems).await?;
        let hits_found: usize = hit_lists.iter().map(Vec::len).sum();
        entry.queries.extend(new_terms);
        entry.hits.extend(hit_lists.into_iter().flatten());
        Ok(format!("searched: {} hits", hits_found))
    }

    async fn handle_update(
        &self,
        decision: &Decision,
        working: &Value,
        before: &IssueSnapshot,
    ) -> Result<UpdateResult, EngineError> {
        let ops = match &decision.patch {
            Some(value) => match patch::parse(value) {
                Ok(ops) => ops,
                Err(err) => {
                    return Ok(UpdateResult::discarded(format!("invalid_patch: {}", err)))
                }
            },
            None => Vec::new(),
        };
        if ops.is_empty() {
            return Ok(UpdateResult::discarded("empty_patch".to_string()));
        }

        let candidate = match patch::apply(working, &ops) {
            Ok(candidate) => candidate,
            Err(err) => return Ok(UpdateResult::discarded(format!("invalid_patch: {}", err))),
        };

        let after = match self.snapshot(&candidate).await {
            Ok(after) => after,
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => return Ok(UpdateResult::discarded(format!("revalidate_error: {}", err))),
        };

        if after.fatal {
            return Ok(UpdateResult {
                outcome: "invalid_fhir".to_string(),
                unresolved_after: Some(after.unresolved_count()),
                errors_after: Some(after.error_count()),
                accepted: None,
            });
        }

        // Monotonic acceptance: strictly fewer unresolved codings, or the
        // same number with strictly fewer validator errors. Ties are
        // discarded even when the uncounted warning set changed.
        let improved = after.unresolved_count() < before.unresolved_count()
            || (after.unresolved_count() == before.unresolved_count()
                && after.error_count() < before.error_count());

        if improved {
            Ok(UpdateResult {
                outcome: "accepted".to_string(),
                unresolved_after: Some(after.unresolved_count()),
                errors_after: Some(after.error_count()),
                accepted: Some((candidate, after)),
            })
        } else {
            Ok(UpdateResult {
                outcome: "no_improvement".to_string(),
                unresolved_after: Some(after.unresolved_count()),
                errors_after: Some(after.error_count()),
                accepted: None,
            })
        }
    }

    async fn persist_trace(
        &self,
        trace: &[TraceEntry],
        artifact: &mut Option<ArtifactRecord>,
    ) -> Result<(), EngineError> {
        let content = serde_json::to_value(trace)
            .map_err(|e| EngineError::InvalidInput(format!("trace serialization: {}", e)))?;
        match artifact {
            Some(existing) => {
                existing.content = content;
                self.ctx.rewrite_artifact(existing).await
            }
            None => {
                let tags: BTreeMap<String, String> =
                    [("resource".to_string(), self.label.clone())].into();
                *artifact = Some(self.ctx.save_artifact("refine-trace", tags, content).await?);
                Ok(())
            }
        }
    }
}

struct UpdateResult {
    outcome: String,
    unresolved_after: Option<usize>,
    errors_after: Option<usize>,
    /// The accepted clone together with the snapshot that justified it.
    accepted: Option<(Value, IssueSnapshot)>,
}

impl UpdateResult {
    fn discarded(outcome: String) -> Self {
        Self {
            outcome,
            unresolved_after: None,
            errors_after: None,
            accepted: None,
        }
    }
}

/// Refine several resources concurrently, bounded by the fan-out setting.
/// Each resource's loop stays internally sequential.
pub async fn refine_all(
    ctx: &RunContext,
    terminology: &dyn TerminologyClient,
    validator: &dyn ValidatorClient,
    settings: &RefineSettings,
    resources: Vec<(String, Value)>,
) -> Result<Vec<RefineOutcome>, EngineError> {
    use futures::stream::{self, StreamExt, TryStreamExt};

    stream::iter(resources.into_iter().map(|(label, resource)| {
        let refine = RefineLoop::new(ctx, terminology, validator, settings, label);
        async move { refine.run(resource).await }
    }))
    .buffered(settings.fan_out.max(1))
    .try_collect()
    .await
}

/// Decision prompt: the resource with `.code` redacted at unresolved
/// pointers, the outstanding issues, and the full search notebook.
fn build_decision_prompt(
    working: &Value,
    snapshot: &IssueSnapshot,
    notebook: &SearchNotebook,
) -> String {
    let mut redacted = working.clone();
    for item in snapshot.report.iter().filter(|i| i.needs_work()) {
        if let Some(Value::Object(map)) = pointer::get(&redacted, &item.pointer).cloned() {
            let mut map = map;
            // Redacting the code keeps the decision-maker from anchoring
            // on a value already known to be wrong.
            map.remove("code");
            let _ = pointer::set(&mut redacted, &item.pointer, Value::Object(map));
        }
    }

    let unresolved: Vec<Value> = snapshot
        .report
        .iter()
        .filter(|i| i.needs_work())
        .map(|i| {
            serde_json::json!({
                "pointer": i.pointer,
                "reason": i.reason,
                "system": i.system,
                "display": i.display,
                "canonical_display": i.canonical_display,
            })
        })
        .collect();

    let tried: BTreeMap<&String, &Vec<String>> =
        notebook.iter().map(|(ptr, entry)| (ptr, &entry.queries)).collect();

    format!(
        "You are repairing a structured clinical resource.\n\
         Resource (codes redacted at unresolved pointers):\n{resource}\n\n\
         Unresolved codings:\n{unresolved}\n\n\
         Validator errors:\n{errors}\n\n\
         Queries already tried per pointer:\n{tried}\n\n\
         Search notebook (observed candidates; propose codes from these only):\n{notebook}\n\n\
         Reply with exactly one JSON decision:\n\
         {{\"action\": \"search_for_coding\", \"pointer\": ..., \"terms\": [...], \"systems\": [...], \"rationale\": ...}}\n\
         or {{\"action\": \"update\", \"patch\": [RFC6902 ops], \"rationale\": ...}}\n\
         or {{\"action\": \"stop\", \"rationale\": ...}}",
        resource = serde_json::to_string_pretty(&redacted).unwrap_or_default(),
        unresolved = serde_json::to_string_pretty(&unresolved).unwrap_or_default(),
        errors = serde_json::to_string_pretty(&snapshot.errors).unwrap_or_default(),
        tried = serde_json::to_string_pretty(&tried).unwrap_or_default(),
        notebook = serde_json::to_string_pretty(&notebook).unwrap_or_default(),
    )
}

const MAX_ANNOTATED_QUERIES: usize = 8;
const MAX_ANNOTATED_POTENTIALS: usize = 5;

fn build_annotations(
    working: &Value,
    report: &[CodingReportItem],
    errors: &[ValidationIssue],
    notebook: &SearchNotebook,
    turns_used: usize,
    rejected_updates: usize,
) -> Vec<(String, UnresolvedAnnotation)> {
    report
        .iter()
        .filter(|item| item.status == CodingStatus::Unresolved)
        .map(|item| {
            let entry = notebook.get(&item.pointer);
            let proposed = pointer::get(working, &item.pointer)
                .and_then(|element| element.get("proposed"))
                .cloned();
            let potentials = entry
                .map(|e| {
                    e.hits
                        .iter()
                        .take(MAX_ANNOTATED_POTENTIALS)
                        .map(|hit| hit.display.clone())
                        .collect()
                })
                .unwrap_or_default();
            let queries = entry.map(|e| {
                e.queries
                    .iter()
                    .take(MAX_ANNOTATED_QUERIES)
                    .cloned()
                    .collect::<Vec<_>>()
            });
            let failure = match item.reason {
                Some(CodingReason::NotFound) => Some("not_found".to_string()),
                Some(CodingReason::DisplayMismatch) => Some("display_mismatch".to_string()),
                None => None,
            };
            let note = (!errors.is_empty())
                .then(|| format!("{} validator errors outstanding", errors.len()));
            (
                item.pointer.clone(),
                UnresolvedAnnotation {
                    proposed,
                    potentials,
                    queries,
                    attempts: Some(format!(
                        "{} turns used, {} updates rejected",
                        turns_used, rejected_updates
                    )),
                    failure,
                    note,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::{Generator, RetryPolicy};
    use crate::pool::CallPool;
    use crate::provider::testing::MockGenerativeClient;
    use crate::store::{DocumentStore, JobRecord, JobStatus, JobType, MemoryStore};
    use crate::terminology::testing::MockTerminologyClient;
    use crate::validator::testing::{error, warning, MockValidatorClient};
    use crate::validator::ValidationReport;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn seeded_ctx(client: MockGenerativeClient) -> (Arc<MemoryStore>, RunContext) {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let job = JobRecord {
            id: "job-1".to_string(),
            title: "refine test".to_string(),
            job_type: JobType::Fhir,
            inputs: json!({}),
            status: JobStatus::Running,
            depends_on: Vec::new(),
            last_error: None,
            run_count: 0,
            created_at: now,
            updated_at: now,
        };
        store.create_job(&job).await.unwrap();
        let generator = Generator::new(
            Arc::new(client),
            CallPool::new(2),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        );
        let ctx = RunContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, generator, &job);
        (store, ctx)
    }

    fn condition_with_bad_code() -> Value {
        json!({
            "resourceType": "Condition",
            "code": {
                "coding": [
                    {"system": "http://snomed.info/sct", "code": "0000", "display": "Fever"}
                ]
            }
        })
    }

    fn settings(budget: usize) -> RefineSettings {
        RefineSettings {
            turn_budget: budget,
            fan_out: 2,
        }
    }

    #[tokio::test]
    async fn one_accepted_update_repairs_the_resource_in_turn_one() {
        let decision = json!({
            "action": "update",
            "patch": [
                {"op": "replace", "path": "/code/coding/0/code", "value": "386661006"},
                {"op": "replace", "path": "/code/coding/0/display", "value": "Fever"}
            ],
            "rationale": "notebook candidate matches the observed display"
        });
        let (_store, ctx) = seeded_ctx(MockGenerativeClient::replying(vec![decision.to_string()]))
        .await;
        let terminology = MockTerminologyClient::new().with_code(
            "http://snomed.info/sct",
            "386661006",
            "Fever",
        );
        let validator = MockValidatorClient::accepting();
        let cfg = settings(12);

        let refine = RefineLoop::new(&ctx, &terminology, &validator, &cfg, "Condition/0");
        let outcome = refine.run(condition_with_bad_code()).await.unwrap();

        assert!(outcome.clean);
        assert_eq!(outcome.turns_used, 1);
        assert_eq!(outcome.trace.len(), 1);
        assert_eq!(outcome.trace[0].outcome.as_deref(), Some("accepted"));
        assert_eq!(outcome.trace[0].unresolved_after, Some(0));
        assert_eq!(
            outcome.resource["code"]["coding"][0]["code"],
            "386661006"
        );
        assert!(outcome
            .report
            .iter()
            .all(|i| i.status == CodingStatus::Recoded));
    }

    #[tokio::test]
    async fn repeated_search_terms_issue_no_new_terminology_calls() {
        let search = json!({
            "action": "search_for_coding",
            "pointer": "/code/coding/0",
            "terms": ["Fever"],
            "systems": ["http://snomed.info/sct"]
        });
        // One scripted decision: the loop replays it from the step cache
        // whenever the issue state is unchanged.
        let (_store, ctx) =
            seeded_ctx(MockGenerativeClient::replying(vec![search.to_string()])).await;
        let terminology = MockTerminologyClient::new().with_hits(
            "fever",
            vec![SearchHit {
                system: "http://snomed.info/sct".to_string(),
                code: "386661006".to_string(),
                display: "Fever".to_string(),
            }],
        );
        let validator = MockValidatorClient::accepting();
        let cfg = settings(3);

        let refine = RefineLoop::new(&ctx, &terminology, &validator, &cfg, "Condition/0");
        let outcome = refine.run(condition_with_bad_code()).await.unwrap();

        assert_eq!(outcome.turns_used, 3);
        assert_eq!(terminology.search_call_count(), 1);
        assert_eq!(
            outcome.trace[1].outcome.as_deref(),
            Some("no_new_terms")
        );
        let entry = outcome.notebook.get("/code/coding/0").unwrap();
        assert_eq!(entry.queries, vec!["Fever"]);
        assert_eq!(entry.hits.len(), 1);
    }

    #[tokio::test]
    async fn accepted_updates_never_regress_issue_counts() {
        // First update fixes the coding; a later update cannot be accepted
        // unless it improves the counts further.
        let fix = json!({
            "action": "update",
            "patch": [
                {"op": "replace", "path": "/code/coding/0/code", "value": "386661006"}
            ]
        });
        let (_store, ctx) =
            seeded_ctx(MockGenerativeClient::replying(vec![fix.to_string()])).await;
        let terminology = MockTerminologyClient::new().with_code(
            "http://snomed.info/sct",
            "386661006",
            "Fever",
        );
        let validator = MockValidatorClient::accepting();
        let cfg = settings(12);

        let refine = RefineLoop::new(&ctx, &terminology, &validator, &cfg, "Condition/0");
        let outcome = refine.run(condition_with_bad_code()).await.unwrap();

        let mut previous = (usize::MAX, usize::MAX);
        for entry in outcome
            .trace
            .iter()
            .filter(|e| e.outcome.as_deref() == Some("accepted"))
        {
            let after = (entry.unresolved_after.unwrap(), entry.errors_after.unwrap());
            assert!(after <= previous, "acceptance regressed: {:?} -> {:?}", previous, after);
            previous = after;
        }
        assert!(outcome.clean);
    }

    #[tokio::test]
    async fn tie_with_changed_warnings_is_discarded() {
        // The patch swaps one warning for another without touching
        // unresolved or error counts; the heuristic discards it as-is.
        let cosmetic = json!({
            "action": "update",
            "patch": [{"op": "add", "path": "/note", "value": "tidied"}]
        });
        let (_store, ctx) =
            seeded_ctx(MockGenerativeClient::replying(vec![cosmetic.to_string()])).await;
        let terminology = MockTerminologyClient::new();
        let validator = MockValidatorClient::with_rule(|resource| {
            let issue = if resource.get("note").is_some() {
                warning("note without author")
            } else {
                warning("missing note")
            };
            ValidationReport {
                valid: true,
                issues: vec![issue],
            }
        });
        let cfg = settings(2);

        let refine = RefineLoop::new(&ctx, &terminology, &validator, &cfg, "Condition/0");
        let outcome = refine.run(condition_with_bad_code()).await.unwrap();

        assert!(outcome
            .trace
            .iter()
            .any(|e| e.outcome.as_deref() == Some("no_improvement")));
        // The cosmetic edit never landed.
        assert!(outcome.resource.get("note").is_none());
    }

    #[tokio::test]
    async fn fatally_invalid_clones_are_discarded() {
        let breaking = json!({
            "action": "update",
            "patch": [{"op": "remove", "path": "/resourceType"}]
        });
        let (_store, ctx) =
            seeded_ctx(MockGenerativeClient::replying(vec![breaking.to_string()])).await;
        let terminology = MockTerminologyClient::new().with_code(
            "http://snomed.info/sct",
            "0000",
            "Fever",
        );
        let validator = MockValidatorClient::with_rule(|resource| {
            if resource.get("resourceType").is_none() {
                ValidationReport {
                    valid: false,
                    issues: vec![crate::validator::ValidationIssue {
                        severity: crate::validator::Severity::Fatal,
                        code: "invalid".to_string(),
                        details: "not a resource".to_string(),
                        location: None,
                    }],
                }
            } else {
                ValidationReport {
                    valid: false,
                    issues: vec![error("missing subject", Some("/subject"))],
                }
            }
        });
        let cfg = settings(2);

        let refine = RefineLoop::new(&ctx, &terminology, &validator, &cfg, "Condition/0");
        let outcome = refine.run(condition_with_bad_code()).await.unwrap();

        assert!(outcome
            .trace
            .iter()
            .any(|e| e.outcome.as_deref() == Some("invalid_fhir")));
        assert_eq!(outcome.resource["resourceType"], "Condition");
    }

    #[tokio::test]
    async fn stop_ends_immediately_with_turns_unused() {
        let stop = json!({"action": "stop", "rationale": "cannot improve further"});
        let (_store, ctx) =
            seeded_ctx(MockGenerativeClient::replying(vec![stop.to_string()])).await;
        let terminology = MockTerminologyClient::new();
        let validator = MockValidatorClient::accepting();
        let cfg = settings(12);

        let refine = RefineLoop::new(&ctx, &terminology, &validator, &cfg, "Condition/0");
        let outcome = refine.run(condition_with_bad_code()).await.unwrap();

        assert_eq!(outcome.turns_used, 1);
        assert!(!outcome.clean);
    }

    #[tokio::test]
    async fn budget_exhaustion_embeds_the_audit_extension() {
        let nonsense = json!({"action": "recalibrate"});
        let (store, ctx) =
            seeded_ctx(MockGenerativeClient::replying(vec![nonsense.to_string()])).await;
        let terminology = MockTerminologyClient::new();
        let validator = MockValidatorClient::accepting();
        let cfg = settings(3);

        let refine = RefineLoop::new(&ctx, &terminology, &validator, &cfg, "Condition/0");
        let outcome = refine.run(condition_with_bad_code()).await.unwrap();

        assert!(!outcome.clean);
        assert_eq!(outcome.turns_used, 3);
        assert!(outcome.trace.iter().all(|e| e.action == "unknown"));

        let element = &outcome.resource["code"]["coding"][0];
        let extension = element
            .get("extension")
            .and_then(Value::as_array)
            .expect("unresolved coding carries the audit extension");
        assert_eq!(
            extension[0]["url"],
            coding::UNRESOLVED_EXTENSION_URL
        );
        let payload: Value =
            serde_json::from_str(extension[0]["valueString"].as_str().unwrap()).unwrap();
        assert_eq!(payload["failure"], "not_found");
        assert!(payload["attempts"]
            .as_str()
            .unwrap()
            .contains("3 turns used"));

        // The turn-by-turn trace is persisted as an artifact.
        let artifacts = store.list_artifacts("job-1").await.unwrap();
        let trace = artifacts
            .iter()
            .find(|a| a.kind == "refine-trace")
            .expect("trace artifact persisted");
        assert_eq!(trace.content.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn fan_out_refines_every_resource() {
        let stop = json!({"action": "stop"});
        let (_store, ctx) =
            seeded_ctx(MockGenerativeClient::replying(vec![stop.to_string()])).await;
        let terminology = MockTerminologyClient::new().with_code(
            "http://snomed.info/sct",
            "386661006",
            "Fever",
        );
        let validator = MockValidatorClient::accepting();
        let cfg = settings(2);

        let clean_resource = json!({
            "resourceType": "Condition",
            "code": {"coding": [
                {"system": "http://snomed.info/sct", "code": "386661006", "display": "Fever"}
            ]}
        });
        let outcomes = refine_all(
            &ctx,
            &terminology,
            &validator,
            &cfg,
            vec![
                ("Condition/0".to_string(), clean_resource.clone()),
                ("Condition/1".to_string(), clean_resource),
            ],
        )
        .await
        .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.clean && o.turns_used == 0));
    }
}
