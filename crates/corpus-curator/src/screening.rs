//! Two-pass screening coordinator.
//!
//! Pass 1 screens titles and abstracts, pass 2 screens full text for papers
//! that survived pass 1. BORDERLINE verdicts are queued for a human when
//! review is enabled. The coordinator owns the decision history and derives
//! each paper's final status from it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::classifier::{BatchedClassifier, ClassificationOutcome};
use crate::config::pipeline;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    Actor, FinalStatus, Paper, ReasonCategory, ReviewConfig, ScreeningDecision, ScreeningPass,
    Verdict, derive_final_status, truncate_chars,
};
use crate::retry::{RetryPolicy, with_retry};
use crate::services::{ClassificationItem, FullTextResolver, ScreeningRequest};
use crate::throttle::Throttle;

/// Decision history keyed by paper and actor.
///
/// One decision per `(paper, actor)`: a later decision by the same actor
/// replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionLog {
    entries: HashMap<String, BTreeMap<Actor, ScreeningDecision>>,
}

impl DecisionLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decision, replacing any earlier one by the same actor.
    pub fn record(&mut self, decision: ScreeningDecision) {
        self.entries
            .entry(decision.paper_id.clone())
            .or_default()
            .insert(decision.actor, decision);
    }

    /// Decision by `actor` for `paper_id`.
    #[must_use]
    pub fn get(&self, paper_id: &str, actor: Actor) -> Option<&ScreeningDecision> {
        self.entries.get(paper_id)?.get(&actor)
    }

    /// All decisions for a paper, in precedence order (pass 1 first).
    pub fn for_paper(&self, paper_id: &str) -> impl Iterator<Item = &ScreeningDecision> {
        self.entries.get(paper_id).into_iter().flat_map(BTreeMap::values)
    }

    /// Final status: human > pass 2 > pass 1.
    #[must_use]
    pub fn final_status(&self, paper_id: &str) -> Option<FinalStatus> {
        derive_final_status(self.for_paper(paper_id))
    }

    /// Decision that determines the final status.
    #[must_use]
    pub fn governing(&self, paper_id: &str) -> Option<&ScreeningDecision> {
        self.entries.get(paper_id)?.values().next_back()
    }

    /// Returns true if any decision exists for the paper.
    #[must_use]
    pub fn contains(&self, paper_id: &str) -> bool {
        self.entries.contains_key(paper_id)
    }

    /// Remove every machine decision, keeping human ones.
    pub fn clear_machine(&mut self) {
        for decisions in self.entries.values_mut() {
            decisions.retain(|actor, _| !actor.is_machine());
        }
        self.entries.retain(|_, decisions| !decisions.is_empty());
    }

    /// Total number of recorded decisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// Check if no decisions are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How a pass-2 paper fell short of full text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradationKind {
    /// Paper has no DOI to resolve.
    NoDoi,
    /// No open-access copy.
    NotAvailable,
    /// The resolver failed.
    ResolverFailed {
        /// Error detail.
        message: String,
    },
}

/// Text screened in place of full text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackText {
    /// Abstract plus third-party summary.
    AbstractAndSummary,
    /// Abstract only.
    Abstract,
    /// Third-party summary only.
    Summary,
    /// Nothing but the title.
    TitleOnly,
}

/// A pass-2 paper screened without full text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Degradation {
    /// Paper id.
    pub paper_id: String,

    /// Why full text was unavailable.
    #[serde(flatten)]
    pub kind: DegradationKind,

    /// What was screened instead.
    pub fallback: FallbackText,
}

fn fallback_text(paper: &Paper) -> (String, FallbackText) {
    match (paper.abstract_text(), paper.summary.as_deref().filter(|s| !s.trim().is_empty())) {
        (Some(abs), Some(summary)) => {
            (format!("{abs}\n\nSummary: {summary}"), FallbackText::AbstractAndSummary)
        }
        (Some(abs), None) => (abs.to_string(), FallbackText::Abstract),
        (None, Some(summary)) => (format!("Summary: {summary}"), FallbackText::Summary),
        (None, None) => (String::new(), FallbackText::TitleOnly),
    }
}

/// Verdict partition shared by both pass reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictSplit {
    /// Papers with an INCLUDE verdict.
    pub include: Vec<String>,

    /// Papers with an EXCLUDE verdict.
    pub exclude: Vec<String>,

    /// Papers with a BORDERLINE verdict.
    pub borderline: Vec<String>,

    /// Papers with no decision after retries.
    pub unresolved: Vec<String>,

    /// Exclusions per reason category.
    pub exclusion_reasons: BTreeMap<ReasonCategory, usize>,

    /// Papers re-queued for solo classification.
    pub solo_retries: usize,
}

impl VerdictSplit {
    fn from_outcome(order: &[&str], outcome: &ClassificationOutcome) -> Self {
        let mut split = Self {
            unresolved: outcome.unresolved.clone(),
            solo_retries: outcome.solo_retries,
            ..Self::default()
        };
        for id in order {
            let Some(decision) = outcome.decisions.get(*id) else { continue };
            match decision.verdict {
                Verdict::Include => split.include.push((*id).to_string()),
                Verdict::Exclude => {
                    *split.exclusion_reasons.entry(decision.reason).or_default() += 1;
                    split.exclude.push((*id).to_string());
                }
                Verdict::Borderline => split.borderline.push((*id).to_string()),
            }
        }
        split
    }

    /// Papers with a decision.
    #[must_use]
    pub fn screened(&self) -> usize {
        self.include.len() + self.exclude.len() + self.borderline.len()
    }
}

/// Result of a title/abstract pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass1Report {
    /// Verdict partition.
    #[serde(flatten)]
    pub split: VerdictSplit,

    /// BORDERLINE papers added to the human review queue.
    pub queued: Vec<String>,

    /// Decisions recorded in this pass.
    pub decisions: Vec<ScreeningDecision>,
}

/// Result of a full-text pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass2Report {
    /// Verdict partition.
    #[serde(flatten)]
    pub split: VerdictSplit,

    /// Papers entering pass 2.
    pub assessed: usize,

    /// Papers screened on full text.
    pub full_text: Vec<String>,

    /// Papers screened on fallback text.
    pub degradations: Vec<Degradation>,
}

/// Drives both screening passes and the human review queue.
pub struct ScreeningCoordinator {
    classifier: BatchedClassifier,
    pass1_request: ScreeningRequest,
    pass2_request: ScreeningRequest,
    hitl_enabled: bool,
    full_text: Arc<dyn FullTextResolver>,
    full_text_throttle: Throttle,
    retry: RetryPolicy,
    log: DecisionLog,
    queue: Vec<String>,
    unresolved: BTreeSet<String>,
}

impl ScreeningCoordinator {
    /// Create a coordinator for one review.
    #[must_use]
    pub fn new(
        review: &ReviewConfig,
        classifier: BatchedClassifier,
        full_text: Arc<dyn FullTextResolver>,
        full_text_throttle: Throttle,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            classifier,
            pass1_request: ScreeningRequest::from_review(review, ScreeningPass::TitleAbstract),
            pass2_request: ScreeningRequest::from_review(review, ScreeningPass::FullText),
            hitl_enabled: review.hitl_enabled,
            full_text,
            full_text_throttle,
            retry,
            log: DecisionLog::new(),
            queue: Vec::new(),
            unresolved: BTreeSet::new(),
        }
    }

    /// Screen titles and abstracts.
    pub async fn pass1(&mut self, papers: &[Paper]) -> Pass1Report {
        let items: Vec<ClassificationItem> = papers
            .iter()
            .map(|p| ClassificationItem::from_paper(p, pipeline::PASS1_ABSTRACT_CHARS))
            .collect();
        let outcome = self.classifier.classify(&self.pass1_request, &items).await;

        let order: Vec<&str> = papers.iter().map(|p| p.id.as_str()).collect();
        let split = VerdictSplit::from_outcome(&order, &outcome);
        let decisions = self.absorb(&order, outcome);

        let mut queued = Vec::new();
        if self.hitl_enabled {
            for id in &split.borderline {
                if self.log.get(id, Actor::Human).is_none() && !self.queue.contains(id) {
                    self.queue.push(id.clone());
                    queued.push(id.clone());
                }
            }
        }

        tracing::info!(
            include = split.include.len(),
            exclude = split.exclude.len(),
            borderline = split.borderline.len(),
            unresolved = split.unresolved.len(),
            queued = queued.len(),
            "Pass 1 complete"
        );
        Pass1Report { split, queued, decisions }
    }

    /// Screen full text for papers whose current final status is INCLUDED.
    pub async fn pass2(&mut self, papers: &[Paper]) -> Pass2Report {
        let candidates: Vec<&Paper> = papers
            .iter()
            .filter(|p| self.final_status(&p.id) == Some(FinalStatus::Included))
            .collect();

        let this = &*self;
        let resolved: Vec<(&Paper, Result<String, DegradationKind>)> = stream::iter(candidates)
            .map(|paper| async move { (paper, this.resolve_text(paper).await) })
            .buffer_unordered(this.full_text_throttle.max_concurrent())
            .collect()
            .await;

        let mut by_id: HashMap<&str, ClassificationItem> = HashMap::new();
        let mut full_text = Vec::new();
        let mut degradations = Vec::new();
        for (paper, text) in resolved {
            let text = match text {
                Ok(text) => {
                    full_text.push(paper.id.clone());
                    text
                }
                Err(kind) => {
                    let (text, fallback) = fallback_text(paper);
                    tracing::debug!(id = %paper.id, kind = ?kind, fallback = ?fallback, "Full text unavailable");
                    degradations.push(Degradation { paper_id: paper.id.clone(), kind, fallback });
                    text
                }
            };
            let text = truncate_chars(&text, pipeline::PASS2_TEXT_CHARS);
            by_id.insert(paper.id.as_str(), ClassificationItem::with_text(paper, text));
        }

        // Screen in input order.
        let order: Vec<&str> =
            papers.iter().map(|p| p.id.as_str()).filter(|id| by_id.contains_key(id)).collect();
        let items: Vec<ClassificationItem> =
            order.iter().filter_map(|id| by_id.remove(id)).collect();
        full_text.sort_by_key(|id| order.iter().position(|o| *o == id.as_str()));
        degradations.sort_by_key(|d| order.iter().position(|o| *o == d.paper_id));

        let outcome = self.classifier.classify(&self.pass2_request, &items).await;
        let split = VerdictSplit::from_outcome(&order, &outcome);
        self.absorb(&order, outcome);

        tracing::info!(
            assessed = order.len(),
            full_text = full_text.len(),
            degraded = degradations.len(),
            excluded = split.exclude.len(),
            "Pass 2 complete"
        );
        Pass2Report { split, assessed: order.len(), full_text, degradations }
    }

    async fn resolve_text(&self, paper: &Paper) -> Result<String, DegradationKind> {
        let Some(doi) = paper.doi.as_deref() else {
            return Err(DegradationKind::NoDoi);
        };
        let resolver = &self.full_text;
        let throttle = &self.full_text_throttle;
        let result = with_retry(&self.retry, "full_text", || async move {
            let _permit = throttle.acquire().await?;
            resolver.resolve(doi).await
        })
        .await;
        match result {
            Ok(Some(text)) if !text.trim().is_empty() => Ok(text),
            Ok(_) => Err(DegradationKind::NotAvailable),
            Err(err) => Err(DegradationKind::ResolverFailed { message: err.to_string() }),
        }
    }

    fn absorb(&mut self, order: &[&str], outcome: ClassificationOutcome) -> Vec<ScreeningDecision> {
        for id in &outcome.unresolved {
            self.unresolved.insert(id.clone());
        }
        let mut decisions = outcome.decisions;
        let mut recorded = Vec::with_capacity(decisions.len());
        for id in order {
            if let Some(decision) = decisions.remove(*id) {
                self.unresolved.remove(*id);
                self.log.record(decision.clone());
                recorded.push(decision);
            }
        }
        recorded
    }

    /// Papers awaiting a human decision, in queue order.
    #[must_use]
    pub fn queue(&self) -> &[String] {
        &self.queue
    }

    /// Number of papers awaiting a human decision.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Record a human decision for a paper.
    ///
    /// Resubmitting replaces the earlier human decision.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a BORDERLINE verdict and
    /// [`PipelineError::UnknownPaper`] for a paper that was never screened.
    pub fn submit_human(
        &mut self,
        paper_id: &str,
        verdict: Verdict,
        rationale: impl Into<String>,
    ) -> PipelineResult<ScreeningDecision> {
        if verdict == Verdict::Borderline {
            return Err(PipelineError::validation(
                "verdict",
                "a human decision must be INCLUDE or EXCLUDE",
            ));
        }
        if !self.log.contains(paper_id) && !self.queue.iter().any(|id| id == paper_id) {
            return Err(PipelineError::UnknownPaper(paper_id.to_string()));
        }
        let decision =
            ScreeningDecision::human(paper_id, verdict, ReasonCategory::HumanJudgement, rationale);
        self.log.record(decision.clone());
        self.queue.retain(|id| id != paper_id);
        tracing::info!(paper = %paper_id, verdict = ?verdict, "Human decision recorded");
        Ok(decision)
    }

    /// Exclude every queued paper with reason [`ReasonCategory::Deferred`].
    pub fn defer_all(&mut self) -> usize {
        let deferred = std::mem::take(&mut self.queue);
        for id in &deferred {
            self.log.record(ScreeningDecision::human(
                id.clone(),
                Verdict::Exclude,
                ReasonCategory::Deferred,
                "deferred by reviewer",
            ));
        }
        if !deferred.is_empty() {
            tracing::info!(count = deferred.len(), "Deferred pending reviews");
        }
        deferred.len()
    }

    /// Final status: human > pass 2 > pass 1.
    #[must_use]
    pub fn final_status(&self, paper_id: &str) -> Option<FinalStatus> {
        self.log.final_status(paper_id)
    }

    /// Decision history.
    #[must_use]
    pub const fn log(&self) -> &DecisionLog {
        &self.log
    }

    /// Papers still without a decision after retries.
    #[must_use]
    pub const fn unresolved(&self) -> &BTreeSet<String> {
        &self.unresolved
    }

    /// Drop machine decisions and the queue ahead of a re-screen.
    pub fn reset_machine_decisions(&mut self) {
        self.log.clear_machine();
        self.queue.clear();
        self.unresolved.clear();
    }
}

impl std::fmt::Debug for ScreeningCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreeningCoordinator")
            .field("hitl_enabled", &self.hitl_enabled)
            .field("decisions", &self.log.len())
            .field("pending", &self.queue.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(actor: Actor, verdict: Verdict) -> ScreeningDecision {
        let mut d = ScreeningDecision::machine(
            "p",
            ScreeningPass::TitleAbstract,
            verdict,
            90,
            ReasonCategory::default_for(verdict),
            "",
        );
        d.actor = actor;
        d
    }

    #[test]
    fn test_log_replaces_same_actor() {
        let mut log = DecisionLog::new();
        log.record(decision(Actor::Human, Verdict::Include));
        log.record(decision(Actor::Human, Verdict::Exclude));
        assert_eq!(log.len(), 1);
        assert_eq!(log.final_status("p"), Some(FinalStatus::Excluded));
    }

    #[test]
    fn test_governing_decision_follows_precedence() {
        let mut log = DecisionLog::new();
        log.record(decision(Actor::MachinePass2, Verdict::Exclude));
        log.record(decision(Actor::MachinePass1, Verdict::Include));
        assert_eq!(log.governing("p").map(|d| d.actor), Some(Actor::MachinePass2));
        log.record(decision(Actor::Human, Verdict::Include));
        assert_eq!(log.final_status("p"), Some(FinalStatus::Included));
    }

    #[test]
    fn test_clear_machine_keeps_human() {
        let mut log = DecisionLog::new();
        log.record(decision(Actor::MachinePass1, Verdict::Borderline));
        log.record(decision(Actor::Human, Verdict::Include));
        log.clear_machine();
        assert_eq!(log.len(), 1);
        assert_eq!(log.governing("p").map(|d| d.actor), Some(Actor::Human));
    }

    #[test]
    fn test_fallback_text_prefers_abstract_and_summary() {
        let mut paper = Paper::from_raw(
            crate::models::RawPaperRecord {
                id: "p".to_string(),
                title: Some("T".to_string()),
                ..Default::default()
            },
            crate::models::Source::SemanticScholar,
        )
        .unwrap();
        assert_eq!(fallback_text(&paper).1, FallbackText::TitleOnly);
        paper.summary = Some("TLDR".to_string());
        assert_eq!(fallback_text(&paper).1, FallbackText::Summary);
        paper.r#abstract = Some("Abstract".to_string());
        let (text, kind) = fallback_text(&paper);
        assert_eq!(kind, FallbackText::AbstractAndSummary);
        assert!(text.contains("TLDR"));
    }
}
