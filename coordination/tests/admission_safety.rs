//! Admission safety: a backend role never sees more concurrent requests than
//! its configured capacity, whatever the workflow fans out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use maker_coordination::backend::{BackendCaller, BackendRequest, ScriptedBackend};
use maker_coordination::context::{CharCountEstimator, StaticSummarizer};
use maker_coordination::maker::CandidateGenerator;
use maker_coordination::{
    AdmissionController, BackendRole, InMemoryTaskStore, OrchestratorConfig, StageEvent, WorkflowEngine,
};

fn caller(backend: Arc<ScriptedBackend>, admission: AdmissionController) -> Arc<BackendCaller> {
    Arc::new(BackendCaller::new(backend, Arc::new(admission), Duration::from_secs(5)))
}

#[tokio::test]
async fn test_candidate_fanout_serialized_at_capacity_one() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(20)));
    let generator = CandidateGenerator::new(caller(backend.clone(), AdmissionController::new(1)), 10_000);

    let batch = generator
        .generate_candidates("sys", "write it", 5, &[0.2, 0.4, 0.6, 0.8, 1.0])
        .await;

    assert_eq!(batch.candidates.len(), 5);
    assert_eq!(backend.call_count(BackendRole::Coder), 5);
    assert_eq!(backend.peak_in_flight(BackendRole::Coder), 1);
}

#[tokio::test]
async fn test_candidate_fanout_bounded_by_role_override() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(30)));
    let overrides = BTreeMap::from([(BackendRole::Coder, 3)]);
    let admission = AdmissionController::with_overrides(1, &overrides);
    let caller = caller(backend.clone(), admission);
    let generator = CandidateGenerator::new(caller.clone(), 10_000);

    let batch = generator.generate_candidates("sys", "write it", 5, &[0.5]).await;

    assert_eq!(batch.candidates.len(), 5);
    let peak = backend.peak_in_flight(BackendRole::Coder);
    assert!(peak <= 3, "peak {peak} exceeded capacity");
    assert!(peak >= 2, "fan-out should run in parallel, peak {peak}");

    let stats = caller.admission().role_stats(BackendRole::Coder);
    assert_eq!(stats.total_request_count, 5);
    assert_eq!(stats.active_request_count, 0);
    assert_eq!(stats.peak_active_count, peak);
}

#[tokio::test]
async fn test_many_callers_one_role() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(5)));
    let caller = caller(backend.clone(), AdmissionController::new(2));

    let mut handles = Vec::new();
    for _ in 0..12 {
        let caller = caller.clone();
        handles.push(tokio::spawn(async move {
            caller
                .call(&BackendRequest::new(BackendRole::Reviewer, "", "review"))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(backend.call_count(BackendRole::Reviewer), 12);
    assert!(backend.peak_in_flight(BackendRole::Reviewer) <= 2);
    let stats = caller.admission().role_stats(BackendRole::Reviewer);
    assert_eq!(stats.active_request_count, 0);
    assert_eq!(stats.waiting_request_count, 0);
}

#[tokio::test]
async fn test_failed_call_releases_slot() {
    let backend = Arc::new(
        ScriptedBackend::new().with_default(BackendRole::Planner, "[BACKEND_ERROR] model crashed"),
    );
    let caller = caller(backend, AdmissionController::new(1));

    for _ in 0..3 {
        let err = caller
            .call(&BackendRequest::new(BackendRole::Planner, "", "plan"))
            .await
            .unwrap_err();
        assert_eq!(err.role(), BackendRole::Planner);
    }
    let stats = caller.admission().role_stats(BackendRole::Planner);
    assert_eq!(stats.total_request_count, 3);
    assert_eq!(stats.active_request_count, 0);
}

#[tokio::test]
async fn test_full_workflow_respects_capacity() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(10)));
    let engine = WorkflowEngine::new(OrchestratorConfig::default(), backend.clone(), InMemoryTaskStore::new().shared())
        .unwrap()
        .with_estimator(Arc::new(CharCountEstimator::default()))
        .with_summarizer(Arc::new(StaticSummarizer::replying("- summary")))
        .shared();

    let mut a = engine.submit("a", "first task").unwrap();
    let mut b = engine.submit("b", "second task").unwrap();
    for rx in [&mut a, &mut b] {
        while let Some(event) = rx.recv().await {
            if let StageEvent::Finished(outcome) = event {
                assert!(outcome.is_success());
                break;
            }
        }
    }

    for role in BackendRole::ALL {
        assert!(backend.peak_in_flight(role) <= 1, "{role} exceeded capacity");
    }
    let stats = engine.admission_stats();
    assert_eq!(stats[&BackendRole::Coder].total_request_count, 10);
    assert!(stats.values().all(|s| s.active_request_count == 0));
}
