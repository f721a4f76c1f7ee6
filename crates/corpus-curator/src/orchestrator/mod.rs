//! Pipeline orchestrator.
//!
//! Sequences the stages, owns the canonical [`PipelineState`] and is the
//! only writer of counts and audit entries. Each stage runner checks the
//! current stage, does its work, finalises counts and then advances.

mod machine;
mod state;

use std::collections::HashSet;

use serde::Serialize;
use serde_json::json;

pub use machine::{Event, Guard, Stage, Transition, transition};
pub use state::{AuditEntry, FlowCounts, PipelineState, StageEntry};

use crate::classifier::BatchedClassifier;
use crate::config::Config;
use crate::corpus::{Corpus, CorpusEntry};
use crate::dedup::Deduplicator;
use crate::error::{PipelineError, PipelineResult, StateError};
use crate::models::{
    Actor, FinalStatus, Paper, QueryPlan, RawPaperRecord, ReasonCategory, ReviewConfig, Source,
    SynthesisReport, Verdict,
};
use crate::quality::QualityAssessor;
use crate::retry::{RetryPolicy, with_retry};
use crate::screening::{ScreeningCoordinator, VerdictSplit};
use crate::search::SearchRunner;
use crate::services::Services;
use crate::snowball::{SnowballExpander, SnowballRun, SnowballSettings};
use crate::synthesis::SynthesisCoordinator;
use crate::throttle::Throttle;

/// Where [`Orchestrator::run_until_pause`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Queries are waiting for approval.
    AwaitingQueryApproval,
    /// BORDERLINE papers are waiting for human decisions.
    AwaitingHumanReview {
        /// Queued papers.
        pending: usize,
    },
    /// The review is complete.
    Complete,
}

/// What a paused run leaves on disk: where it stopped and the full audit trail.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Why the run paused.
    pub outcome: RunOutcome,

    /// State at the pause.
    pub state: PipelineState,

    /// Proposed or approved query plan.
    pub plan: Option<QueryPlan>,

    /// Papers waiting for a human decision, in queue order.
    pub pending_review: Vec<String>,
}

/// Drives one review from research question to final corpus.
pub struct Orchestrator {
    review: ReviewConfig,
    services: Services,
    retry: RetryPolicy,
    classifier_throttle: Throttle,
    state: PipelineState,
    stage_complete: bool,
    plan: Option<QueryPlan>,
    raw_records: Vec<RawPaperRecord>,
    corpus: Corpus,
    seen: HashSet<String>,
    deduplicator: Deduplicator,
    search: SearchRunner,
    screening: ScreeningCoordinator,
    snowball: SnowballExpander,
    quality: QualityAssessor,
    synthesis: SynthesisCoordinator,
    snowball_runs: Vec<SnowballRun>,
    synthesis_report: Option<SynthesisReport>,
}

impl Orchestrator {
    /// Create an orchestrator in [`Stage::Idle`].
    ///
    /// # Errors
    ///
    /// Returns a validation error if the review configuration is invalid.
    pub fn new(review: ReviewConfig, services: Services, config: &Config) -> PipelineResult<Self> {
        review.validate()?;

        let retry = config.retry;
        let search_throttle = Throttle::new("search", config.search_limits);
        let classifier_throttle = Throttle::new("classifier", config.classifier_limits);
        let full_text_throttle = Throttle::new("full_text", config.full_text_limits);

        let classifier = BatchedClassifier::new(
            services.classifier.clone(),
            review.batch_size,
            classifier_throttle.clone(),
            retry,
        );
        let screening = ScreeningCoordinator::new(
            &review,
            classifier,
            services.full_text.clone(),
            full_text_throttle,
            retry,
        );
        let snowball = SnowballExpander::new(
            services.citations.clone(),
            SnowballSettings::from_review(&review),
            search_throttle.clone(),
            retry,
            review.similarity_threshold,
        );
        let search = SearchRunner::new(services.sources.clone(), search_throttle, retry);
        let quality =
            QualityAssessor::new(services.quality.clone(), classifier_throttle.clone(), retry);
        let synthesis = SynthesisCoordinator::new(
            services.embedder.clone(),
            services.clusterer.clone(),
            services.reducer.clone(),
            services.narrator.clone(),
            classifier_throttle.clone(),
            retry,
        );

        tracing::info!(question = %review.research_question, "Review created");
        Ok(Self {
            deduplicator: Deduplicator::new(review.similarity_threshold),
            review,
            services,
            retry,
            classifier_throttle,
            state: PipelineState::new(),
            stage_complete: false,
            plan: None,
            raw_records: Vec::new(),
            corpus: Corpus::new(),
            seen: HashSet::new(),
            search,
            screening,
            snowball,
            quality,
            synthesis,
            snowball_runs: Vec::new(),
            synthesis_report: None,
        })
    }

    // ---- state machine -------------------------------------------------

    /// Apply `event` to the current stage.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the event is not valid here; the state is
    /// left untouched.
    pub fn advance(&mut self, event: Event) -> Result<&PipelineState, StateError> {
        let guard = Guard {
            hitl_enabled: self.review.hitl_enabled,
            borderline_pending: self.screening.pending(),
            stage_complete: self.stage_complete,
        };
        let t = transition(self.state.stage(), event, &guard)?;
        self.state.apply(t, event);
        self.stage_complete = false;
        Ok(&self.state)
    }

    /// Current stage.
    #[must_use]
    pub const fn current_stage(&self) -> Stage {
        self.state.stage()
    }

    /// Audit log, oldest first.
    #[must_use]
    pub fn audit_log(&self) -> &[AuditEntry] {
        self.state.audit_log()
    }

    /// Pipeline state.
    #[must_use]
    pub const fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Owned copy of the state for display.
    #[must_use]
    pub fn snapshot(&self) -> PipelineState {
        self.state.clone()
    }

    /// Checkpoint for a run that stopped with `outcome`.
    #[must_use]
    pub fn checkpoint(&self, outcome: RunOutcome) -> Checkpoint {
        Checkpoint {
            outcome,
            state: self.snapshot(),
            plan: self.plan.clone(),
            pending_review: self.screening.queue().to_vec(),
        }
    }

    /// Flow diagram counts.
    #[must_use]
    pub const fn counts(&self) -> &FlowCounts {
        self.state.counts()
    }

    /// Review configuration.
    #[must_use]
    pub const fn review(&self) -> &ReviewConfig {
        &self.review
    }

    /// Current query plan.
    #[must_use]
    pub const fn plan(&self) -> Option<&QueryPlan> {
        self.plan.as_ref()
    }

    /// Papers table.
    #[must_use]
    pub const fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    /// Screening coordinator (decision history and review queue).
    #[must_use]
    pub const fn screening(&self) -> &ScreeningCoordinator {
        &self.screening
    }

    /// Snowball runs, one per pass-1 run.
    #[must_use]
    pub fn snowball_runs(&self) -> &[SnowballRun] {
        &self.snowball_runs
    }

    /// Synthesis output once the synthesis stage has run.
    #[must_use]
    pub const fn synthesis_report(&self) -> Option<&SynthesisReport> {
        self.synthesis_report.as_ref()
    }

    fn require(&self, expected: Stage) -> Result<(), StateError> {
        let actual = self.state.stage();
        if actual == expected {
            Ok(())
        } else {
            Err(StateError::WrongStage { expected, actual })
        }
    }

    fn finish(&mut self, event: Event) -> PipelineResult<()> {
        self.stage_complete = true;
        self.advance(event)?;
        Ok(())
    }

    // ---- stage runners -------------------------------------------------

    /// Start the review and formulate search queries.
    ///
    /// Ends in [`Stage::QueryApproval`]. If formulation fails the pipeline
    /// stays in [`Stage::QueryFormulation`] and `start` may be called again.
    pub async fn start(&mut self) -> PipelineResult<()> {
        if self.state.stage() == Stage::Idle {
            self.advance(Event::Start)?;
        }
        self.require(Stage::QueryFormulation)?;

        let formulator = &self.services.formulator;
        let throttle = &self.classifier_throttle;
        let review = &self.review;
        let result = with_retry(&self.retry, "query_formulation", || async move {
            let _permit = throttle.acquire().await?;
            formulator.formulate(review).await
        })
        .await
        .and_then(|value| QueryPlan::from_response(&value));

        let plan = match result {
            Ok(plan) => plan,
            Err(err) => {
                self.state.record("Query formulation failed", json!({ "error": err.to_string() }));
                return Err(err.into());
            }
        };
        self.state.record(
            "Search strategy formulated",
            json!({
                "queries": plan.queries.len(),
                "suggestedConcepts": plan.suggested_concepts,
            }),
        );
        self.plan = Some(plan);
        self.finish(Event::QueriesFormulated)
    }

    /// Approve the proposed queries, optionally replacing them.
    pub fn approve_queries(&mut self, edited: Option<QueryPlan>) -> PipelineResult<()> {
        self.require(Stage::QueryApproval)?;
        let edited_by_user = edited.is_some();
        if let Some(plan) = edited {
            if plan.is_empty() {
                return Err(PipelineError::validation("queries", "at least one query is required"));
            }
            self.plan = Some(plan);
        }
        let Some(plan) = &self.plan else {
            return Err(PipelineError::validation("queries", "no query plan to approve"));
        };
        let queries: Vec<_> = plan.queries.iter().map(|q| json!({"source": q.source, "query": q.text})).collect();
        self.state.record("Queries approved", json!({ "edited": edited_by_user, "queries": queries }));
        self.finish(Event::QueriesApproved)
    }

    /// Run every approved query.
    pub async fn run_search(&mut self) -> PipelineResult<()> {
        self.require(Stage::Searching)?;
        let plan = self.plan.clone().unwrap_or_default();
        let result = self
            .search
            .run(&plan, self.review.year_min, self.review.year_max, self.review.target_corpus_size)
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.state.record("Search failed", json!({ "error": err.to_string() }));
                return Err(err.into());
            }
        };
        for source in &outcome.unavailable {
            self.state.record(
                format!("Source {source} unavailable, continuing without it"),
                json!({ "source": source }),
            );
        }
        if !outcome.failures.is_empty() {
            self.state.record("Some queries failed", json!({ "failures": outcome.failures }));
        }
        if !outcome.skipped.is_empty() {
            self.state.record(
                format!("Skipped {} queries for unconfigured sources", outcome.skipped.len()),
                json!({ "queries": outcome.skipped }),
            );
        }

        self.state.counts_mut().identified.clone_from(&outcome.identified);
        self.state.record(
            format!("Identified {} records", outcome.records.len()),
            json!({ "identified": outcome.identified }),
        );
        self.raw_records = outcome.records;
        self.finish(Event::SearchCompleted)
    }

    /// Merge duplicate records into canonical papers.
    pub fn run_deduplication(&mut self) -> PipelineResult<()> {
        self.require(Stage::Deduplication)?;
        let raw = std::mem::take(&mut self.raw_records);
        let total = raw.len();
        let papers: Vec<Paper> = raw
            .into_iter()
            .filter_map(|r| {
                let fallback = r.source.unwrap_or(Source::OpenAlex);
                Paper::from_raw(r, fallback)
            })
            .collect();
        if papers.len() < total {
            self.state.record(
                "Dropped records without a title",
                json!({ "dropped": total - papers.len() }),
            );
        }

        let outcome = self.deduplicator.deduplicate(papers);
        for merge in &outcome.merges {
            self.state.record(
                format!("Merged {} duplicate records into {}", merge.absorbed_ids.len(), merge.canonical_id),
                serde_json::to_value(merge)?,
            );
        }

        self.seen = outcome
            .papers
            .iter()
            .flat_map(|p| {
                std::iter::once(p.id.clone()).chain(p.provenance.iter().map(|r| r.record_id.clone()))
            })
            .collect();
        let counts = self.state.counts_mut();
        counts.duplicates_removed = outcome.duplicates_removed();
        counts.after_dedup = outcome.papers.len();
        self.state.record(
            format!("{} unique papers after deduplication", outcome.papers.len()),
            json!({ "input": outcome.input_count, "duplicatesRemoved": outcome.duplicates_removed() }),
        );
        self.corpus.replace(outcome.papers);
        self.finish(Event::DeduplicationCompleted)
    }

    /// Title/abstract screening, then snowballing when enabled.
    ///
    /// Moves to [`Stage::HitlReview`] when papers were queued for a human,
    /// otherwise straight to [`Stage::ScreeningPass2`].
    pub async fn run_screening_pass1(&mut self) -> PipelineResult<()> {
        self.require(Stage::ScreeningPass1)?;

        let pending: Vec<Paper> = self
            .corpus
            .papers()
            .iter()
            .filter(|p| self.screening.log().get(&p.id, Actor::MachinePass1).is_none())
            .cloned()
            .collect();
        let report = self.screening.pass1(&pending).await;
        self.record_split("Title/abstract screening", &report.split);

        if self.review.max_snowball_rounds > 0 {
            let run = self
                .snowball
                .expand(&mut self.screening, self.corpus.papers_mut(), &mut self.seen)
                .await;
            self.record_snowball(&run);
            self.state.counts_mut().identified_snowball += run.new_papers.len();
            self.snowball_runs.push(run);
        }

        self.refresh_counts();
        self.finish(Event::Pass1Completed)
    }

    /// Record a human decision for a paper.
    ///
    /// Only accepted in HITL review; once pass 2 has started, changing a
    /// verdict needs [`Self::rescreen`]. A later decision replaces an earlier
    /// one without touching the audit entries already written.
    pub fn submit_human_decision(
        &mut self,
        paper_id: &str,
        verdict: Verdict,
        rationale: impl Into<String>,
    ) -> PipelineResult<()> {
        self.require(Stage::HitlReview)?;
        if self.corpus.get(paper_id).is_none() {
            return Err(PipelineError::UnknownPaper(paper_id.to_string()));
        }
        let previous = self.screening.final_status(paper_id);
        let decision = self.screening.submit_human(paper_id, verdict, rationale)?;
        self.state.record(
            format!("Human decision for {paper_id}"),
            json!({
                "paperId": paper_id,
                "verdict": decision.verdict,
                "previousStatus": previous,
                "rationale": decision.rationale,
            }),
        );
        self.refresh_counts();
        Ok(())
    }

    /// Exclude every queued paper with reason "deferred".
    pub fn defer_pending_reviews(&mut self) -> PipelineResult<usize> {
        self.require(Stage::HitlReview)?;
        let queued: Vec<String> = self.screening.queue().to_vec();
        let deferred = self.screening.defer_all();
        if deferred > 0 {
            self.state.record(
                format!("Deferred {deferred} papers without review"),
                json!({ "paperIds": queued }),
            );
        }
        self.refresh_counts();
        Ok(deferred)
    }

    /// Leave human review once the queue is empty.
    pub fn complete_human_review(&mut self) -> PipelineResult<()> {
        self.require(Stage::HitlReview)?;
        self.finish(Event::HumanReviewCompleted)
    }

    /// Full-text screening of papers included so far.
    pub async fn run_screening_pass2(&mut self) -> PipelineResult<()> {
        self.require(Stage::ScreeningPass2)?;
        let report = self.screening.pass2(self.corpus.papers()).await;

        if !report.degradations.is_empty() {
            self.state.record(
                format!("Full text unavailable for {} papers, screened on fallback text", report.degradations.len()),
                json!({ "degradations": report.degradations }),
            );
        }
        self.record_split("Full-text screening", &report.split);

        let counts = self.state.counts_mut();
        counts.full_text_assessed = report.assessed;
        counts.full_text_unavailable = report.degradations.len();
        self.refresh_counts();
        self.finish(Event::Pass2Completed)
    }

    /// Score included papers that have no quality assessment yet.
    pub async fn run_quality_assessment(&mut self) -> PipelineResult<()> {
        self.require(Stage::QualityAssessment)?;
        let unassessed: Vec<Paper> = self
            .corpus
            .included(self.screening.log())
            .into_iter()
            .filter(|p| self.corpus.quality(&p.id).is_none())
            .collect();

        let report = self.quality.assess(&self.review, &unassessed).await;
        if !report.failures.is_empty() {
            self.state.record(
                format!("Quality assessment failed for {} papers", report.failures.len()),
                json!({ "failures": report.failures }),
            );
        }
        let assessed = report.assessments.len();
        for (id, assessment) in report.assessments {
            self.corpus.set_quality(id, assessment);
        }
        self.state.record(format!("Assessed quality of {assessed} papers"), json!({ "assessed": assessed }));
        self.finish(Event::QualityAssessed)
    }

    /// Cluster, narrate and score the included papers.
    pub async fn run_synthesis(&mut self) -> PipelineResult<()> {
        self.require(Stage::Synthesis)?;
        let included = self.corpus.included(self.screening.log());
        let outcome = self.synthesis.run(&self.review, &included).await;

        if !outcome.degradations.is_empty() {
            self.state.record(
                "Synthesis degraded",
                json!({ "degradations": outcome.degradations }),
            );
        }
        self.corpus.apply_embeddings(outcome.embeddings);
        for (id, placement) in outcome.placements {
            self.corpus.set_placement(id, placement);
        }
        self.state.record(
            format!("Synthesised {} papers into {} clusters", outcome.report.paper_count, outcome.report.clusters.len()),
            json!({ "clusters": outcome.report.clusters.iter().map(|c| &c.label).collect::<Vec<_>>() }),
        );
        self.synthesis_report = Some(outcome.report);
        self.finish(Event::SynthesisCompleted)
    }

    /// Return to pass 1, dropping machine decisions and derived results.
    ///
    /// Human decisions are kept.
    pub fn rescreen(&mut self) -> PipelineResult<()> {
        self.advance(Event::Rescreen)?;
        self.screening.reset_machine_decisions();
        self.corpus.clear_derived();
        self.synthesis_report = None;
        self.refresh_counts();
        Ok(())
    }

    /// Drive stages until the pipeline needs the user or is complete.
    pub async fn run_until_pause(&mut self) -> PipelineResult<RunOutcome> {
        loop {
            match self.state.stage() {
                Stage::Idle | Stage::QueryFormulation => self.start().await?,
                Stage::QueryApproval => return Ok(RunOutcome::AwaitingQueryApproval),
                Stage::Searching => self.run_search().await?,
                Stage::Deduplication => self.run_deduplication()?,
                Stage::ScreeningPass1 => self.run_screening_pass1().await?,
                Stage::HitlReview => {
                    let pending = self.screening.pending();
                    if pending > 0 {
                        return Ok(RunOutcome::AwaitingHumanReview { pending });
                    }
                    self.complete_human_review()?;
                }
                Stage::ScreeningPass2 => self.run_screening_pass2().await?,
                Stage::QualityAssessment => self.run_quality_assessment().await?,
                Stage::Synthesis => self.run_synthesis().await?,
                Stage::Complete => return Ok(RunOutcome::Complete),
            }
        }
    }

    /// Every included paper with its decisions, scores and placement.
    #[must_use]
    pub fn final_corpus(&self) -> Vec<CorpusEntry> {
        self.corpus.entries(self.screening.log())
    }

    // ---- bookkeeping ---------------------------------------------------

    fn record_split(&mut self, what: &str, split: &VerdictSplit) {
        self.state.record(
            format!("{what}: {} screened", split.screened()),
            json!({
                "include": split.include.len(),
                "exclude": split.exclude.len(),
                "borderline": split.borderline.len(),
                "unresolved": split.unresolved,
                "exclusionReasons": split.exclusion_reasons,
                "soloRetries": split.solo_retries,
            }),
        );
    }

    fn record_snowball(&mut self, run: &SnowballRun) {
        for round in &run.rounds {
            self.state.record(
                format!(
                    "Snowball round {}: {} candidates, {} included",
                    round.round, round.candidates, round.new_inclusions
                ),
                json!(round),
            );
        }
        if !run.degradations.is_empty() {
            self.state.record(
                format!("{} citation lookups failed", run.degradations.len()),
                json!({ "failures": run.degradations }),
            );
        }
        self.state.record(
            format!("Snowballing stopped: {}", run.stop_reason),
            json!({ "stopReason": run.stop_reason, "newPapers": run.new_papers.len() }),
        );
    }

    /// Recompute screening counts from the decision history.
    fn refresh_counts(&mut self) {
        let log = self.screening.log();
        let mut screened = 0;
        let mut excluded_pass1 = 0;
        let mut excluded_pass2 = 0;
        let mut pass1_reasons = std::collections::BTreeMap::new();
        let mut pass2_reasons = std::collections::BTreeMap::new();
        let (mut human_reviewed, mut human_excluded, mut deferred, mut included) = (0, 0, 0, 0);
        let queued: HashSet<&str> = self.screening.queue().iter().map(String::as_str).collect();

        for paper in self.corpus.papers() {
            if log.get(&paper.id, Actor::MachinePass1).is_some() {
                screened += 1;
            }
            // Awaiting a human: not excluded yet.
            if queued.contains(paper.id.as_str()) {
                continue;
            }
            if let Some(human) = log.get(&paper.id, Actor::Human) {
                if human.reason == ReasonCategory::Deferred {
                    deferred += 1;
                } else {
                    human_reviewed += 1;
                    if human.verdict == Verdict::Exclude {
                        human_excluded += 1;
                    }
                }
            }
            match (log.final_status(&paper.id), log.governing(&paper.id)) {
                (Some(FinalStatus::Included), _) => included += 1,
                (Some(FinalStatus::Excluded), Some(d)) if d.actor == Actor::MachinePass1 => {
                    excluded_pass1 += 1;
                    *pass1_reasons.entry(d.reason).or_insert(0) += 1;
                }
                (Some(FinalStatus::Excluded), Some(d)) if d.actor == Actor::MachinePass2 => {
                    excluded_pass2 += 1;
                    *pass2_reasons.entry(d.reason).or_insert(0) += 1;
                }
                _ => {}
            }
        }

        let unresolved = self.screening.unresolved().len();
        let counts = self.state.counts_mut();
        counts.screened = screened;
        counts.excluded_pass1 = excluded_pass1;
        counts.excluded_pass1_reasons = pass1_reasons;
        counts.excluded_pass2 = excluded_pass2;
        counts.excluded_pass2_reasons = pass2_reasons;
        counts.human_reviewed = human_reviewed;
        counts.human_excluded = human_excluded;
        counts.deferred = deferred;
        counts.unresolved = unresolved;
        counts.included = included;
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stage", &self.state.stage())
            .field("papers", &self.corpus.len())
            .field("screening", &self.screening)
            .finish_non_exhaustive()
    }
}
