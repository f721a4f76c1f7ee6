//! End-to-end pipeline runs against in-memory services.

mod common;

use std::sync::Arc;

use corpus_curator::error::{PipelineError, ServiceError, StateError};
use corpus_curator::models::{Actor, FinalStatus, ReasonCategory, Source, StopReason, Verdict};
use corpus_curator::orchestrator::Event;
use corpus_curator::services::SourceSearch;
use corpus_curator::{Orchestrator, RunOutcome, Stage};

use common::{FakeGraph, FakeSource, openalex_records, record, review, semantic_scholar_records};

fn sources() -> Vec<Arc<dyn SourceSearch>> {
    vec![
        Arc::new(FakeSource::new(Source::OpenAlex, openalex_records())),
        Arc::new(FakeSource::new(Source::SemanticScholar, semantic_scholar_records())),
    ]
}

fn orchestrator(review: corpus_curator::ReviewConfig, graph: FakeGraph) -> Orchestrator {
    let services = common::services(sources(), Arc::new(graph));
    Orchestrator::new(review, services, &common::config()).unwrap()
}

// =============================================================================
// Full runs
// =============================================================================

#[tokio::test]
async fn test_full_run_with_human_review() {
    let mut orch = orchestrator(review(), FakeGraph::default());

    let outcome = orch.run_until_pause().await.unwrap();
    assert_eq!(outcome, RunOutcome::AwaitingQueryApproval);
    assert_eq!(orch.current_stage(), Stage::QueryApproval);
    assert_eq!(orch.plan().map(|p| p.queries.len()), Some(2));

    orch.approve_queries(None).unwrap();
    let outcome = orch.run_until_pause().await.unwrap();
    assert_eq!(outcome, RunOutcome::AwaitingHumanReview { pending: 1 });
    assert_eq!(orch.current_stage(), Stage::HitlReview);
    assert_eq!(orch.screening().queue(), ["W6".to_string()]);

    let counts = orch.counts().clone();
    assert_eq!(counts.identified.get(&Source::OpenAlex), Some(&7));
    assert_eq!(counts.identified.get(&Source::SemanticScholar), Some(&2));
    assert_eq!(counts.duplicates_removed, 1);
    assert_eq!(counts.after_dedup, 8);
    assert_eq!(counts.screened, 8);
    assert_eq!(counts.excluded_pass1, 1);
    assert_eq!(counts.excluded_pass1_reasons.get(&ReasonCategory::OffTopic), Some(&1));

    // Pass 2 cannot start while the queue is non-empty.
    let err = orch.advance(Event::HumanReviewCompleted).unwrap_err();
    assert!(matches!(err, StateError::GuardFailed { .. }));
    assert_eq!(orch.current_stage(), Stage::HitlReview);

    orch.submit_human_decision("W6", Verdict::Include, "Adults on night shifts count").unwrap();
    let outcome = orch.run_until_pause().await.unwrap();
    assert_eq!(outcome, RunOutcome::Complete);
    assert_eq!(orch.current_stage(), Stage::Complete);

    let corpus = orch.final_corpus();
    assert_eq!(corpus.len(), 7);
    assert!(corpus.iter().all(|e| e.final_status == Some(FinalStatus::Included)));
    assert!(corpus.iter().all(|e| e.quality.as_ref().map(|q| q.score) == Some(72)));
    assert!(corpus.iter().all(|e| e.cluster_label.is_some()));
    assert!(corpus.iter().all(|e| {
        e.relevance_score.is_some_and(|score| (0.0..=100.0).contains(&score))
    }));
    assert!(corpus.iter().all(|e| e.coordinates.is_some()));

    let w6 = corpus.iter().find(|e| e.paper.id == "W6").unwrap();
    assert_eq!(w6.decisions.last().map(|d| d.actor), Some(Actor::Human));

    let counts = orch.counts();
    assert_eq!(counts.human_reviewed, 1);
    assert_eq!(counts.included, 7);
    assert_eq!(counts.full_text_assessed, 7);
    assert_eq!(counts.full_text_unavailable, 7);

    let report = orch.synthesis_report().unwrap();
    assert_eq!(report.paper_count, 7);
    assert!(!report.clusters.is_empty());
    assert_eq!(report.clusters.iter().map(|c| c.paper_count).sum::<usize>(), 7);
}

#[tokio::test]
async fn test_deferring_excludes_queued_papers() {
    let mut orch = orchestrator(review(), FakeGraph::default());
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    orch.run_until_pause().await.unwrap();

    assert_eq!(orch.defer_pending_reviews().unwrap(), 1);
    assert_eq!(orch.run_until_pause().await.unwrap(), RunOutcome::Complete);

    assert_eq!(orch.screening().final_status("W6"), Some(FinalStatus::Excluded));
    let decision = orch.screening().log().get("W6", Actor::Human).unwrap();
    assert_eq!(decision.reason, ReasonCategory::Deferred);
    assert_eq!(orch.counts().deferred, 1);
    assert_eq!(orch.counts().human_reviewed, 0);
    assert_eq!(orch.final_corpus().len(), 6);
}

#[tokio::test]
async fn test_hitl_disabled_skips_review_stage() {
    let mut review = review();
    review.hitl_enabled = false;
    let mut orch = orchestrator(review, FakeGraph::default());

    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    assert_eq!(orch.run_until_pause().await.unwrap(), RunOutcome::Complete);

    // A machine BORDERLINE without a human decision stays out.
    assert_eq!(orch.screening().final_status("W6"), Some(FinalStatus::Excluded));
    assert!(orch.audit_log().iter().any(|e| e.message.contains("HITL_REVIEW skipped")));
    assert!(orch.state().is_completed(Stage::HitlReview));
}

// =============================================================================
// Stage ordering and failure handling
// =============================================================================

#[tokio::test]
async fn test_stage_runner_rejects_wrong_stage() {
    let mut orch = orchestrator(review(), FakeGraph::default());
    let err = orch.run_search().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::State(StateError::WrongStage { expected: Stage::Searching, actual: Stage::Idle })
    ));
    assert!(orch.audit_log().is_empty());
}

#[tokio::test]
async fn test_all_sources_failing_keeps_searching_stage() {
    let services = common::services(
        vec![
            Arc::new(FakeSource::failing(Source::OpenAlex)),
            Arc::new(FakeSource::failing(Source::SemanticScholar)),
        ],
        Arc::new(FakeGraph::default()),
    );
    let mut orch = Orchestrator::new(review(), services, &common::config()).unwrap();
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();

    let err = orch.run_until_pause().await.unwrap_err();
    assert!(matches!(err, PipelineError::Service(ServiceError::SourceUnavailable { .. })));
    assert_eq!(orch.current_stage(), Stage::Searching);
    assert!(orch.audit_log().iter().any(|e| e.message == "Search failed"));
}

#[tokio::test]
async fn test_one_source_failing_degrades() {
    let services = common::services(
        vec![
            Arc::new(FakeSource::new(Source::OpenAlex, openalex_records())),
            Arc::new(FakeSource::failing(Source::SemanticScholar)),
        ],
        Arc::new(FakeGraph::default()),
    );
    let mut orch = Orchestrator::new(review(), services, &common::config()).unwrap();
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    orch.run_until_pause().await.unwrap();

    assert_eq!(orch.counts().identified.get(&Source::SemanticScholar), Some(&0));
    assert_eq!(orch.counts().after_dedup, 7);
    assert!(orch.audit_log().iter().any(|e| e.message.contains("semantic_scholar unavailable")));
}

#[tokio::test]
async fn test_rescreen_keeps_human_decisions() {
    let mut orch = orchestrator(review(), FakeGraph::default());
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    orch.run_until_pause().await.unwrap();
    orch.submit_human_decision("W6", Verdict::Include, "").unwrap();
    assert_eq!(orch.run_until_pause().await.unwrap(), RunOutcome::Complete);

    orch.rescreen().unwrap();
    assert_eq!(orch.current_stage(), Stage::ScreeningPass1);
    assert!(orch.synthesis_report().is_none());
    assert!(orch.screening().log().get("W1", Actor::MachinePass1).is_none());
    assert!(orch.screening().log().get("W6", Actor::Human).is_some());

    // W6 has a human decision, so nothing is queued the second time round.
    assert_eq!(orch.run_until_pause().await.unwrap(), RunOutcome::Complete);
    assert_eq!(orch.final_corpus().len(), 7);
}

#[tokio::test]
async fn test_audit_sequence_is_dense() {
    let mut orch = orchestrator(review(), FakeGraph::default());
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    orch.run_until_pause().await.unwrap();

    let sequences: Vec<usize> = orch.audit_log().iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (0..sequences.len()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_invalid_event_leaves_stage_and_audit_untouched() {
    let mut orch = orchestrator(review(), FakeGraph::default());
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    assert_eq!(orch.current_stage(), Stage::Searching);
    let audit_len = orch.audit_log().len();

    let err = orch.advance(Event::Pass1Completed).unwrap_err();
    assert_eq!(
        err,
        StateError::InvalidTransition { from: Stage::Searching, event: Event::Pass1Completed }
    );
    assert_eq!(orch.current_stage(), Stage::Searching);
    assert_eq!(orch.audit_log().len(), audit_len);
}

#[tokio::test]
async fn test_unconfigured_source_queries_are_audited() {
    let services = common::services(
        vec![Arc::new(FakeSource::new(Source::OpenAlex, openalex_records()))],
        Arc::new(FakeGraph::default()),
    );
    let mut orch = Orchestrator::new(review(), services, &common::config()).unwrap();
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    orch.run_until_pause().await.unwrap();

    let entry = orch
        .audit_log()
        .iter()
        .find(|e| e.message == "Skipped 1 queries for unconfigured sources")
        .unwrap();
    assert_eq!(entry.stage, Stage::Searching);
    assert_eq!(entry.detail["queries"][0]["source"], "semantic_scholar");
    assert_eq!(entry.detail["queries"][0]["text"], "sleep memory adults");
    assert_eq!(orch.counts().after_dedup, 7);
}

// =============================================================================
// Human review
// =============================================================================

#[tokio::test]
async fn test_human_resubmission_replaces_status_and_keeps_audit() {
    let mut orch = orchestrator(review(), FakeGraph::default());
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    orch.run_until_pause().await.unwrap();

    orch.submit_human_decision("W6", Verdict::Include, "Shift workers are adults").unwrap();
    assert_eq!(orch.screening().final_status("W6"), Some(FinalStatus::Included));
    orch.submit_human_decision("W6", Verdict::Exclude, "Outcome is fatigue, not memory").unwrap();
    assert_eq!(orch.screening().final_status("W6"), Some(FinalStatus::Excluded));

    let entries: Vec<_> =
        orch.audit_log().iter().filter(|e| e.message == "Human decision for W6").collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].detail["verdict"], "INCLUDE");
    assert_eq!(entries[0].detail["rationale"], "Shift workers are adults");
    assert_eq!(entries[1].detail["verdict"], "EXCLUDE");
    assert_eq!(entries[1].detail["previousStatus"], "INCLUDED");
    assert!(entries[0].sequence < entries[1].sequence);

    assert_eq!(orch.run_until_pause().await.unwrap(), RunOutcome::Complete);
    assert!(orch.final_corpus().iter().all(|e| e.paper.id != "W6"));
}

#[tokio::test]
async fn test_human_decision_outside_review_is_rejected() {
    let mut orch = orchestrator(review(), FakeGraph::default());
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    orch.run_until_pause().await.unwrap();
    orch.submit_human_decision("W6", Verdict::Include, "").unwrap();
    assert_eq!(orch.run_until_pause().await.unwrap(), RunOutcome::Complete);
    let audit_len = orch.audit_log().len();

    let err = orch.submit_human_decision("W6", Verdict::Exclude, "changed my mind").unwrap_err();
    assert!(matches!(
        err,
        PipelineError::State(StateError::WrongStage {
            expected: Stage::HitlReview,
            actual: Stage::Complete
        })
    ));
    assert_eq!(orch.screening().final_status("W6"), Some(FinalStatus::Included));
    assert_eq!(orch.audit_log().len(), audit_len);

    // Rescreening reopens the path back to review.
    orch.rescreen().unwrap();
    assert_eq!(orch.current_stage(), Stage::ScreeningPass1);
}

#[tokio::test]
async fn test_checkpoint_at_review_pause() {
    let mut orch = orchestrator(review(), FakeGraph::default());
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    let outcome = orch.run_until_pause().await.unwrap();

    let checkpoint = orch.checkpoint(outcome);
    assert_eq!(checkpoint.pending_review, vec!["W6".to_string()]);
    assert_eq!(checkpoint.state.session_id(), orch.state().session_id());

    let value = serde_json::to_value(&checkpoint).unwrap();
    assert_eq!(value["outcome"]["status"], "awaiting_human_review");
    assert_eq!(value["outcome"]["pending"], 1);
    assert_eq!(value["state"]["stage"], "HITL_REVIEW");
    assert_eq!(value["pendingReview"][0], "W6");
    assert_eq!(value["plan"]["queries"].as_array().map(Vec::len), Some(2));
    assert_eq!(
        value["state"]["audit"].as_array().map(Vec::len),
        Some(orch.audit_log().len())
    );
}

// =============================================================================
// Full-text screening
// =============================================================================

#[tokio::test]
async fn test_full_text_fallback_is_audited() {
    let mut review = review();
    review.hitl_enabled = false;
    let mut orch = orchestrator(review, FakeGraph::default());
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    assert_eq!(orch.run_until_pause().await.unwrap(), RunOutcome::Complete);

    let entry = orch
        .audit_log()
        .iter()
        .find(|e| e.message.starts_with("Full text unavailable for"))
        .unwrap();
    assert_eq!(entry.stage, Stage::ScreeningPass2);
    let degradations = entry.detail["degradations"].as_array().unwrap();
    assert_eq!(degradations.len(), orch.counts().full_text_unavailable);
    assert_eq!(degradations.len(), 6);
    assert!(degradations.iter().all(|d| d["paperId"].is_string() && d["fallback"].is_string()));
    assert!(degradations.iter().all(|d| d["paperId"] != "W6"));
}

// =============================================================================
// Snowballing
// =============================================================================

#[tokio::test]
async fn test_snowball_adds_and_screens_candidates() {
    let mut review = review();
    review.max_snowball_rounds = 3;
    review.hitl_enabled = false;

    let graph = FakeGraph::default()
        .cites("W1", &["R1", "R2", "R3"])
        .with_record(record("R1", "Sleep spindles and motor memory", None, Source::OpenAlex))
        .with_record(record("R2", "Unrelated soil chemistry", None, Source::OpenAlex))
        // Same DOI as W2: only contributes provenance.
        .with_record(record(
            "R3",
            "Overnight consolidation of motor sequence learning",
            Some("10.1000/A2"),
            Source::OpenAlex,
        ));
    let mut orch = orchestrator(review, graph);
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    assert_eq!(orch.run_until_pause().await.unwrap(), RunOutcome::Complete);

    let runs = orch.snowball_runs();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.rounds.len(), 2);
    assert_eq!(run.rounds[0].candidates, 3);
    assert_eq!(run.rounds[0].new_inclusions, 1);
    assert_eq!(run.rounds[1].candidates, 0);
    assert_eq!(run.stop_reason, StopReason::NoNewInclusions);
    assert_eq!(run.new_papers, vec!["R1".to_string(), "R2".to_string()]);
    assert_eq!(run.new_inclusions, vec!["R1".to_string()]);

    assert_eq!(orch.counts().identified_snowball, 2);
    assert_eq!(orch.corpus().get("R1").and_then(|p| p.snowball_round), Some(1));
    let w2 = orch.corpus().get("W2").unwrap();
    assert!(w2.provenance.iter().any(|p| p.record_id == "R3"));
    assert!(orch.corpus().get("R3").is_none());
    assert_eq!(orch.screening().final_status("R2"), Some(FinalStatus::Excluded));
}

#[tokio::test]
async fn test_snowball_candidate_cap_stops_before_screening() {
    let mut review = review();
    review.max_snowball_rounds = 3;
    review.max_candidates_per_round = 1;
    review.hitl_enabled = false;

    let graph = FakeGraph::default()
        .cites("W1", &["R1", "R2"])
        .with_record(record("R1", "Sleep spindles and motor memory", None, Source::OpenAlex))
        .with_record(record("R2", "Dreams and recall", None, Source::OpenAlex));
    let mut orch = orchestrator(review, graph);
    orch.run_until_pause().await.unwrap();
    orch.approve_queries(None).unwrap();
    orch.run_until_pause().await.unwrap();

    let run = &orch.snowball_runs()[0];
    assert_eq!(run.stop_reason, StopReason::CandidateCapExceeded);
    assert_eq!(run.rounds.len(), 1);
    assert_eq!(run.rounds[0].new_inclusions, 0);
    assert!(run.new_papers.is_empty());
    assert!(orch.corpus().get("R1").is_none());
}
