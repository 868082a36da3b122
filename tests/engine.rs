//! Engine-level integration: replay, dependency gating, rerun safety.

mod common;

use chartsmith::job::{NewJob, Scheduler};
use chartsmith::store::{DocumentStore, JobStatus, JobType, MemoryStore};
use common::{test_env, RouteProvider, TestTerminology};
use serde_json::json;
use std::sync::Arc;

fn narrative_routes() -> Vec<(&'static str, String)> {
    vec![
        (
            "Plan a clinical narrative",
            json!({"sections": [{"heading": "Course", "focus": "fever"}]}).to_string(),
        ),
        (
            "Write the narrative following this outline",
            "Admitted febrile; defervesced on day 2.".to_string(),
        ),
    ]
}

fn narrative_job(title: &str, depends_on: Vec<String>) -> NewJob {
    NewJob {
        title: title.to_string(),
        job_type: JobType::Narrative,
        inputs: json!({"patient": {"name": "A", "age": 54}}),
        depends_on,
    }
}

#[tokio::test]
async fn rerun_replays_cached_steps_and_rebuilds_artifacts() {
    let provider = Arc::new(RouteProvider::new(narrative_routes()));
    let env = test_env(Arc::clone(&provider), Arc::new(TestTerminology::new()), 4);
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(Arc::clone(&store), env);

    let job = scheduler.create(narrative_job("discharge", vec![])).await.unwrap();
    scheduler.start(&job.id).await.unwrap();

    assert_eq!(provider.call_count(), 2);
    let first_artifacts = store.list_artifacts(&job.id).await.unwrap();
    assert_eq!(first_artifacts.len(), 1);
    assert_eq!(first_artifacts[0].version, 1);

    scheduler.rerun(&job.id).await.unwrap();

    // Both generative steps replayed from the cache.
    assert_eq!(provider.call_count(), 2);
    let job_after = store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job_after.status, JobStatus::Done);
    assert_eq!(job_after.run_count, 1);

    // Prior artifacts were deleted and rebuilt from the replayed steps.
    let artifacts = store.list_artifacts(&job.id).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].version, 1);
    let links = store.list_links(&job.id).await.unwrap();
    assert_eq!(links.len(), 1);
}

#[tokio::test]
async fn clear_cache_forces_recomputation_of_matching_steps_only() {
    let provider = Arc::new(RouteProvider::new(narrative_routes()));
    let env = test_env(Arc::clone(&provider), Arc::new(TestTerminology::new()), 4);
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(Arc::clone(&store), env);

    let job = scheduler.create(narrative_job("discharge", vec![])).await.unwrap();
    scheduler.start(&job.id).await.unwrap();
    assert_eq!(provider.call_count(), 2);

    let cleared = scheduler.clear_cache(&job.id, Some("draft")).await.unwrap();
    assert!(cleared >= 1);

    scheduler.rerun(&job.id).await.unwrap();
    // Outline replayed; only the draft was recomputed.
    assert_eq!(provider.call_count(), 3);
}

#[tokio::test]
async fn dependent_jobs_stay_blocked_until_the_dependency_is_done() {
    let provider = Arc::new(RouteProvider::new(narrative_routes()));
    let env = test_env(Arc::clone(&provider), Arc::new(TestTerminology::new()), 4);
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(Arc::clone(&store), env);

    let upstream = scheduler.create(narrative_job("workup", vec![])).await.unwrap();
    let downstream = scheduler
        .create(narrative_job("summary", vec![upstream.id.clone()]))
        .await
        .unwrap();

    assert_eq!(
        store.get_job(&downstream.id).await.unwrap().unwrap().status,
        JobStatus::Blocked
    );
    assert!(scheduler.start(&downstream.id).await.is_err());

    scheduler.start(&upstream.id).await.unwrap();

    // Completing the dependency auto-triggered the blocked job.
    let released = store.get_job(&downstream.id).await.unwrap().unwrap();
    assert_eq!(released.status, JobStatus::Done);

    // Both jobs generated their own steps; nothing ran twice.
    assert_eq!(provider.call_count(), 4);

    // Redundant concurrent triggers are no-ops.
    let (a, b) = tokio::join!(scheduler.trigger_ready_jobs(), scheduler.trigger_ready_jobs());
    a.unwrap();
    b.unwrap();
    assert_eq!(provider.call_count(), 4);
}

#[tokio::test]
async fn superseded_runs_leave_no_writes_behind() {
    let (provider, gate) = RouteProvider::new(narrative_routes())
        .gated_on("Plan a clinical narrative");
    let provider = Arc::new(provider);
    let env = test_env(Arc::clone(&provider), Arc::new(TestTerminology::new()), 4);
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), env));

    let job = scheduler.create(narrative_job("discharge", vec![])).await.unwrap();

    // First run parks inside its first generative call.
    let first_run = {
        let scheduler = Arc::clone(&scheduler);
        let job_id = job.id.clone();
        tokio::spawn(async move { scheduler.start(&job_id).await })
    };
    tokio::task::yield_now().await;

    // The rerun supersedes it and completes normally.
    scheduler.rerun(&job.id).await.unwrap();
    let job_after = store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job_after.status, JobStatus::Done);
    assert_eq!(job_after.run_count, 1);

    // Release the stale run; its writes must be rejected silently.
    gate.notify_waiters();
    first_run.await.unwrap().unwrap();

    let final_job = store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Done);
    let artifacts = store.list_artifacts(&job.id).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].version, 1);
    let links = store.list_links(&job.id).await.unwrap();
    assert_eq!(links.len(), 1);
}

#[tokio::test]
async fn interrupted_jobs_are_paused_and_never_auto_resumed() {
    let provider = Arc::new(RouteProvider::new(narrative_routes()));
    let env = test_env(Arc::clone(&provider), Arc::new(TestTerminology::new()), 4);
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(Arc::clone(&store), env);

    let job = scheduler.create(narrative_job("interrupted", vec![])).await.unwrap();
    store
        .update_job_status(&job.id, JobStatus::Running, None)
        .await
        .unwrap();

    assert_eq!(scheduler.recover_interrupted().await.unwrap(), 1);
    assert_eq!(
        store.get_job(&job.id).await.unwrap().unwrap().status,
        JobStatus::Paused
    );

    scheduler.trigger_ready_jobs().await.unwrap();
    assert_eq!(
        store.get_job(&job.id).await.unwrap().unwrap().status,
        JobStatus::Paused
    );
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn status_reports_phase_completion_and_artifact_versions() {
    let provider = Arc::new(RouteProvider::new(narrative_routes()));
    let env = test_env(Arc::clone(&provider), Arc::new(TestTerminology::new()), 4);
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(Arc::clone(&store), env);

    let job = scheduler.create(narrative_job("discharge", vec![])).await.unwrap();
    scheduler.start(&job.id).await.unwrap();

    let summary = scheduler.status(&job.id).await.unwrap();
    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(summary.steps_failed, 0);
    assert_eq!(summary.phases.get("outline"), Some(&true));
    assert_eq!(summary.phases.get("draft"), Some(&true));
    assert!(summary
        .artifacts
        .iter()
        .any(|a| a.kind == "document" && a.version == 1));
}

#[tokio::test]
async fn deleting_a_job_removes_all_of_its_records() {
    let provider = Arc::new(RouteProvider::new(narrative_routes()));
    let env = test_env(Arc::clone(&provider), Arc::new(TestTerminology::new()), 4);
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(Arc::clone(&store), env);

    let job = scheduler.create(narrative_job("ephemeral", vec![])).await.unwrap();
    scheduler.start(&job.id).await.unwrap();
    scheduler.delete(&job.id).await.unwrap();

    assert!(store.get_job(&job.id).await.unwrap().is_none());
    assert!(store.list_steps(&job.id).await.unwrap().is_empty());
    assert!(store.list_artifacts(&job.id).await.unwrap().is_empty());
    assert!(store.list_links(&job.id).await.unwrap().is_empty());
}
