//! Citation-network snowballing.
//!
//! Each round collects the references and/or citers of the seed papers,
//! drops everything already seen, hydrates the rest and screens it through
//! pass 1. The loop ends on exactly one [`StopReason`].

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::config::pipeline;
use crate::dedup::{DedupIndex, absorb_provenance};
use crate::error::ServiceResult;
use crate::models::{
    FinalStatus, Paper, ReviewConfig, SnowballDirection, SnowballRound, StopReason, yield_rate,
};
use crate::retry::{RetryPolicy, with_retry};
use crate::screening::{Pass1Report, ScreeningCoordinator};
use crate::services::CitationGraph;
use crate::throttle::Throttle;

/// Stop criteria and direction for one expansion run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnowballSettings {
    /// Which citation links to follow.
    pub direction: SnowballDirection,

    /// Hard limit on rounds.
    pub max_rounds: u32,

    /// Stop when a round's yield drops below this.
    pub yield_floor: f64,

    /// Stop once the included set reaches 1.5x this.
    pub target_corpus_size: usize,

    /// A round with more candidates than this is not screened.
    pub max_candidates_per_round: usize,
}

impl SnowballSettings {
    /// Settings taken from the review configuration.
    #[must_use]
    pub const fn from_review(review: &ReviewConfig) -> Self {
        Self {
            direction: review.snowball_direction,
            max_rounds: review.max_snowball_rounds,
            yield_floor: review.yield_floor,
            target_corpus_size: review.target_corpus_size,
            max_candidates_per_round: review.max_candidates_per_round,
        }
    }

    fn target_reached(&self, total_included: usize) -> bool {
        total_included as f64 >= self.target_corpus_size as f64 * 1.5
    }
}

impl Default for SnowballSettings {
    fn default() -> Self {
        Self {
            direction: SnowballDirection::Both,
            max_rounds: pipeline::MAX_SNOWBALL_ROUNDS,
            yield_floor: pipeline::YIELD_FLOOR,
            target_corpus_size: pipeline::TARGET_CORPUS_SIZE,
            max_candidates_per_round: pipeline::MAX_CANDIDATES_PER_ROUND,
        }
    }
}

/// Decide whether the run stops after `round`.
///
/// The candidate cap is checked first, then in order: round limit, no new
/// inclusions, yield floor, target corpus size.
#[must_use]
pub fn evaluate_stop(
    settings: &SnowballSettings,
    round: u32,
    candidates: usize,
    new_inclusions: usize,
    total_included: usize,
) -> Option<StopReason> {
    if candidates > settings.max_candidates_per_round {
        return Some(StopReason::CandidateCapExceeded);
    }
    if round >= settings.max_rounds {
        return Some(StopReason::MaxRoundsReached);
    }
    if new_inclusions == 0 {
        return Some(StopReason::NoNewInclusions);
    }
    if yield_rate(new_inclusions, candidates) < settings.yield_floor {
        return Some(StopReason::YieldBelowFloor);
    }
    if settings.target_reached(total_included) {
        return Some(StopReason::TargetCorpusReached);
    }
    None
}

/// Which lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    /// Cited references of a seed.
    References,
    /// Papers citing a seed.
    CitedBy,
    /// Hydrating candidate ids into records.
    Hydration,
}

/// A citation-graph call that failed after retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupFailure {
    /// Round the failure happened in.
    pub round: u32,

    /// Failed call.
    pub kind: LookupKind,

    /// Seed paper id, or the first id of the hydration chunk.
    pub subject: String,

    /// Error message.
    pub message: String,
}

/// Result of one expansion run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnowballRun {
    /// Rounds in order; the last one carries the stop reason.
    pub rounds: Vec<SnowballRound>,

    /// Why the run ended.
    pub stop_reason: StopReason,

    /// Ids of papers added to the corpus by this run.
    pub new_papers: Vec<String>,

    /// Ids of added papers that ended up included.
    pub new_inclusions: Vec<String>,

    /// Failed lookups.
    pub degradations: Vec<LookupFailure>,

    /// Pass-1 reports, one per screened round.
    #[serde(skip)]
    pub screening: Vec<Pass1Report>,
}

impl SnowballRun {
    fn stopped(stop_reason: StopReason) -> Self {
        Self {
            rounds: Vec::new(),
            stop_reason,
            new_papers: Vec::new(),
            new_inclusions: Vec::new(),
            degradations: Vec::new(),
            screening: Vec::new(),
        }
    }

    /// Total candidates across rounds.
    #[must_use]
    pub fn candidates(&self) -> usize {
        self.rounds.iter().map(|r| r.candidates).sum()
    }
}

/// Expands the corpus along citation links.
pub struct SnowballExpander {
    graph: Arc<dyn CitationGraph>,
    settings: SnowballSettings,
    throttle: Throttle,
    retry: RetryPolicy,
    similarity_threshold: f64,
}

impl SnowballExpander {
    /// Create an expander.
    #[must_use]
    pub fn new(
        graph: Arc<dyn CitationGraph>,
        settings: SnowballSettings,
        throttle: Throttle,
        retry: RetryPolicy,
        similarity_threshold: f64,
    ) -> Self {
        Self { graph, settings, throttle, retry, similarity_threshold }
    }

    /// Settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &SnowballSettings {
        &self.settings
    }

    /// Run rounds until a stop criterion fires.
    ///
    /// New papers are appended to `corpus` and their ids added to `seen`.
    /// Candidates that turn out to duplicate a corpus paper only contribute
    /// provenance to it.
    pub async fn expand(
        &self,
        screening: &mut ScreeningCoordinator,
        corpus: &mut Vec<Paper>,
        seen: &mut HashSet<String>,
    ) -> SnowballRun {
        for paper in corpus.iter() {
            seen.insert(paper.id.clone());
            seen.extend(paper.provenance.iter().map(|p| p.record_id.clone()));
            if let Some(id) = self.graph.lookup_id(paper) {
                seen.insert(id);
            }
        }

        let mut seeds: Vec<Paper> = corpus
            .iter()
            .filter(|p| screening.final_status(&p.id) == Some(FinalStatus::Included))
            .cloned()
            .collect();
        if seeds.is_empty() {
            tracing::info!("No included papers to snowball from");
            return SnowballRun::stopped(StopReason::NoSeeds);
        }
        if self.settings.max_rounds == 0 {
            return SnowballRun::stopped(StopReason::MaxRoundsReached);
        }

        let mut run = SnowballRun::stopped(StopReason::MaxRoundsReached);
        let mut index = DedupIndex::from_papers(self.similarity_threshold, corpus);
        let mut round = 0u32;

        loop {
            round += 1;
            let ids = self.collect_candidates(round, &seeds, seen, &mut run.degradations).await;
            seen.extend(ids.iter().cloned());
            let candidates = ids.len();
            tracing::info!(round, candidates, direction = %self.settings.direction, "Snowball round");

            if candidates > self.settings.max_candidates_per_round {
                tracing::warn!(
                    round,
                    candidates,
                    cap = self.settings.max_candidates_per_round,
                    "Candidate cap exceeded, round not screened"
                );
                let mut record = SnowballRound::new(round, self.settings.direction, candidates, 0);
                record.stop_reason = Some(StopReason::CandidateCapExceeded);
                run.rounds.push(record);
                run.stop_reason = StopReason::CandidateCapExceeded;
                return run;
            }

            let fresh = self.hydrate(round, &ids, &mut run.degradations).await;
            let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
            let mut taken = HashSet::new();
            let mut added = Vec::new();
            for mut paper in fresh {
                let unseen = requested.contains(paper.id.as_str()) || seen.insert(paper.id.clone());
                if !unseen || !taken.insert(paper.id.clone()) {
                    continue;
                }
                if let Some((slot, _)) = index.find(&paper) {
                    absorb_provenance(&mut corpus[slot], &paper);
                    continue;
                }
                paper.snowball_round = Some(round);
                index.insert(corpus.len(), &paper);
                added.push(paper.id.clone());
                corpus.push(paper);
            }

            let start = corpus.len() - added.len();
            let report = screening.pass1(&corpus[start..]).await;
            let newly_included: Vec<Paper> = corpus[start..]
                .iter()
                .filter(|p| screening.final_status(&p.id) == Some(FinalStatus::Included))
                .cloned()
                .collect();

            let total_included = corpus
                .iter()
                .filter(|p| screening.final_status(&p.id) == Some(FinalStatus::Included))
                .count();
            let mut record =
                SnowballRound::new(round, self.settings.direction, candidates, newly_included.len());
            let stop = evaluate_stop(
                &self.settings,
                round,
                candidates,
                newly_included.len(),
                total_included,
            );
            record.stop_reason = stop;
            tracing::info!(
                round,
                candidates,
                included = newly_included.len(),
                yield_rate = record.yield_rate,
                "Snowball round screened"
            );

            run.rounds.push(record);
            run.screening.push(report);
            run.new_papers.extend(added);
            run.new_inclusions.extend(newly_included.iter().map(|p| p.id.clone()));

            if let Some(reason) = stop {
                tracing::info!(round, reason = %reason, "Snowballing stopped");
                run.stop_reason = reason;
                return run;
            }
            seeds = newly_included;
        }
    }

    /// Unseen ids linked to the seeds, in first-encountered order.
    async fn collect_candidates(
        &self,
        round: u32,
        seeds: &[Paper],
        seen: &HashSet<String>,
        failures: &mut Vec<LookupFailure>,
    ) -> Vec<String> {
        let mut lookups = Vec::new();
        for seed in seeds {
            let Some(id) = self.graph.lookup_id(seed) else {
                tracing::debug!(paper = %seed.id, "No citation-graph id");
                continue;
            };
            if self.settings.direction.backward() {
                lookups.push((LookupKind::References, id.clone()));
            }
            if self.settings.direction.forward() {
                lookups.push((LookupKind::CitedBy, id));
            }
        }

        let mut results: Vec<(usize, LookupKind, String, ServiceResult<HashSet<String>>)> =
            stream::iter(lookups.into_iter().enumerate())
                .map(|(n, (kind, id))| async move {
                    let result = self.links(kind, &id).await;
                    (n, kind, id, result)
                })
                .buffer_unordered(self.throttle.max_concurrent())
                .collect()
                .await;
        results.sort_by_key(|(n, ..)| *n);

        let mut ids = Vec::new();
        let mut unique = HashSet::new();
        for (_, kind, subject, result) in results {
            match result {
                Ok(linked) => {
                    let mut linked: Vec<String> = linked.into_iter().collect();
                    linked.sort();
                    for id in linked {
                        if !seen.contains(&id) && unique.insert(id.clone()) {
                            ids.push(id);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(round, subject = %subject, kind = ?kind, error = %err, "Citation lookup failed");
                    failures.push(LookupFailure { round, kind, subject, message: err.to_string() });
                }
            }
        }
        ids
    }

    async fn links(&self, kind: LookupKind, id: &str) -> ServiceResult<HashSet<String>> {
        let graph = &self.graph;
        let throttle = &self.throttle;
        with_retry(&self.retry, "citation_graph", || async move {
            let _permit = throttle.acquire().await?;
            match kind {
                LookupKind::CitedBy => graph.cited_by(id).await,
                _ => graph.references(id).await,
            }
        })
        .await
    }

    /// Hydrate candidate ids in chunks; failed chunks are reported and skipped.
    async fn hydrate(
        &self,
        round: u32,
        ids: &[String],
        failures: &mut Vec<LookupFailure>,
    ) -> Vec<Paper> {
        let graph = &self.graph;
        let throttle = &self.throttle;
        let retry = &self.retry;
        let mut chunks: Vec<(usize, ServiceResult<Vec<Paper>>)> =
            stream::iter(ids.chunks(pipeline::HYDRATION_CHUNK).enumerate())
                .map(|(n, chunk)| async move {
                    let result = with_retry(retry, "hydration", || async move {
                        let _permit = throttle.acquire().await?;
                        graph.papers(chunk).await
                    })
                    .await
                    .map(|records| {
                        records
                            .into_iter()
                            .filter_map(|raw| Paper::from_raw(raw, graph.source()))
                            .collect::<Vec<_>>()
                    });
                    (n, result)
                })
                .buffer_unordered(self.throttle.max_concurrent())
                .collect()
                .await;
        chunks.sort_by_key(|(n, _)| *n);
        let mut papers = Vec::new();
        for (n, result) in chunks {
            match result {
                Ok(batch) => papers.extend(batch),
                Err(err) => {
                    let subject = ids
                        .get(n * pipeline::HYDRATION_CHUNK)
                        .cloned()
                        .unwrap_or_default();
                    tracing::warn!(round, subject = %subject, error = %err, "Hydration failed");
                    failures.push(LookupFailure {
                        round,
                        kind: LookupKind::Hydration,
                        subject,
                        message: err.to_string(),
                    });
                }
            }
        }
        papers
    }
}

impl std::fmt::Debug for SnowballExpander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowballExpander")
            .field("settings", &self.settings)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SnowballSettings {
        SnowballSettings {
            direction: SnowballDirection::Both,
            max_rounds: 3,
            yield_floor: 0.02,
            target_corpus_size: 50,
            max_candidates_per_round: 5000,
        }
    }

    #[test]
    fn test_yields_run_to_max_rounds() {
        let s = settings();
        // yields 0.15, 0.04, 0.01 over 100 candidates each
        assert_eq!(evaluate_stop(&s, 1, 100, 15, 20), None);
        assert_eq!(evaluate_stop(&s, 2, 100, 4, 24), None);
        assert_eq!(evaluate_stop(&s, 3, 100, 1, 25), Some(StopReason::MaxRoundsReached));
    }

    #[test]
    fn test_cap_fires_in_round_one() {
        let s = settings();
        assert_eq!(evaluate_stop(&s, 1, 6000, 6000, 6000), Some(StopReason::CandidateCapExceeded));
        assert_eq!(evaluate_stop(&s, 1, 5000, 100, 100), None);
    }

    #[test]
    fn test_no_inclusions_before_yield_floor() {
        let s = settings();
        assert_eq!(evaluate_stop(&s, 1, 100, 0, 10), Some(StopReason::NoNewInclusions));
        assert_eq!(evaluate_stop(&s, 1, 0, 0, 10), Some(StopReason::NoNewInclusions));
    }

    #[test]
    fn test_yield_floor_then_target() {
        let s = settings();
        assert_eq!(evaluate_stop(&s, 1, 1000, 10, 10), Some(StopReason::YieldBelowFloor));
        assert_eq!(evaluate_stop(&s, 1, 100, 10, 75), Some(StopReason::TargetCorpusReached));
        assert_eq!(evaluate_stop(&s, 1, 100, 10, 74), None);
    }

    #[test]
    fn test_settings_from_review() {
        let mut review = ReviewConfig::new("q");
        review.max_snowball_rounds = 5;
        review.snowball_direction = SnowballDirection::Backward;
        let s = SnowballSettings::from_review(&review);
        assert_eq!(s.max_rounds, 5);
        assert_eq!(s.direction, SnowballDirection::Backward);
        assert_eq!(s.max_candidates_per_round, 5000);
    }
}
