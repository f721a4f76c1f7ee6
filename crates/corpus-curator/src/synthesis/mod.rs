//! Synthesis coordinator.
//!
//! Embeds the included papers, clusters and projects them, narrates each
//! cluster and the corpus as a whole, and scores relevance to the research
//! question. Every capability failure degrades the output; no paper is ever
//! dropped from the results.

pub mod local;
pub mod relevance;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::config::pipeline;
use crate::models::{
    ClusterNarrative, ClusterSummary, OverallSynthesis, Paper, ReviewConfig, SynthesisReport,
    truncate_chars,
};
use crate::retry::{RetryPolicy, with_retry};
use crate::services::{Clusterer, Embedder, NarrativeGenerator, Reducer};
use crate::throttle::Throttle;

/// Label for embedded papers the clusterer marked as noise.
pub const NOISE_LABEL: &str = "Uncategorised";

/// Label used when a cluster could not be described.
pub const FALLBACK_LABEL: &str = "Research cluster";

const QUESTION_ID: &str = "__research_question__";

/// A capability failure during synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum SynthesisDegradation {
    /// Embedding failed; affected papers are not clustered.
    Embedding { message: String },
    /// Clustering failed; every paper has no cluster.
    Clustering { message: String },
    /// Projection failed; no coordinates.
    Projection { message: String },
    /// One cluster could not be described.
    ClusterNarrative { cluster_id: u32, message: String },
    /// Overall synthesis failed.
    Overall { message: String },
    /// Relevance fell back to keyword overlap.
    KeywordRelevance { message: String },
}

/// Where one paper landed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    /// Cluster id, `None` for noise or unembedded papers.
    pub cluster_id: Option<u32>,

    /// Cluster label.
    pub cluster_label: Option<String>,

    /// 2D coordinates.
    pub coordinates: Option<(f32, f32)>,

    /// Relevance to the research question, 0-100.
    pub relevance_score: f64,
}

/// Everything the synthesis stage produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisOutcome {
    /// Cluster summaries and overall narrative.
    pub report: SynthesisReport,

    /// Placement of every input paper.
    pub placements: HashMap<String, Placement>,

    /// Embeddings computed during this run, to store on the papers.
    #[serde(skip)]
    pub embeddings: HashMap<String, Vec<f32>>,

    /// Capability failures.
    pub degradations: Vec<SynthesisDegradation>,
}

/// Drives the synthesis capabilities.
pub struct SynthesisCoordinator {
    embedder: Arc<dyn Embedder>,
    clusterer: Arc<dyn Clusterer>,
    reducer: Arc<dyn Reducer>,
    narrator: Arc<dyn NarrativeGenerator>,
    throttle: Throttle,
    retry: RetryPolicy,
}

/// Text embedded for a paper: title plus the start of the abstract.
#[must_use]
pub fn embedding_text(paper: &Paper) -> String {
    match paper.abstract_text() {
        Some(text) => {
            format!("{} {}", paper.title, truncate_chars(text, pipeline::EMBEDDING_ABSTRACT_CHARS))
        }
        None => paper.title.clone(),
    }
}

impl SynthesisCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        clusterer: Arc<dyn Clusterer>,
        reducer: Arc<dyn Reducer>,
        narrator: Arc<dyn NarrativeGenerator>,
        throttle: Throttle,
        retry: RetryPolicy,
    ) -> Self {
        Self { embedder, clusterer, reducer, narrator, throttle, retry }
    }

    /// Synthesise the included papers.
    pub async fn run(&self, review: &ReviewConfig, papers: &[Paper]) -> SynthesisOutcome {
        let mut outcome = SynthesisOutcome::default();
        outcome.report.paper_count = papers.len();
        if papers.is_empty() {
            return outcome;
        }

        let vectors = self.embeddings(papers, &mut outcome).await;
        let clusters = self.assign_clusters(&vectors, &mut outcome).await;
        let coordinates = self.project(&vectors, &mut outcome).await;

        let mut members: BTreeMap<u32, Vec<Paper>> = BTreeMap::new();
        for paper in papers {
            if let Some(Some(id)) = clusters.get(&paper.id) {
                members.entry(*id).or_default().push(paper.clone());
            }
        }
        let labels = self.describe_clusters(&members, &mut outcome).await;
        outcome.report.clusters = labels.values().cloned().collect();

        let overall = {
            let narrator = &self.narrator;
            let throttle = &self.throttle;
            let summaries = &outcome.report.clusters;
            let count = papers.len();
            with_retry(&self.retry, "synthesis", || async move {
                let _permit = throttle.acquire().await?;
                narrator.synthesize(review, count, summaries).await
            })
            .await
        };
        outcome.report.overall = overall.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Overall synthesis failed");
            outcome.degradations.push(SynthesisDegradation::Overall { message: err.to_string() });
            OverallSynthesis::failed()
        });

        let relevance = self.relevance(review, papers, &vectors, &mut outcome).await;

        for paper in papers {
            let cluster_id = clusters.get(&paper.id).copied().flatten();
            let cluster_label = match (cluster_id, vectors.contains_key(&paper.id)) {
                (Some(id), _) => labels.get(&id).map(|c| c.label.clone()),
                (None, true) => Some(NOISE_LABEL.to_string()),
                (None, false) => None,
            };
            outcome.placements.insert(
                paper.id.clone(),
                Placement {
                    cluster_id,
                    cluster_label,
                    coordinates: coordinates.get(&paper.id).copied(),
                    relevance_score: relevance.get(&paper.id).copied().unwrap_or_default(),
                },
            );
        }

        tracing::info!(
            papers = papers.len(),
            clusters = outcome.report.clusters.len(),
            degradations = outcome.degradations.len(),
            "Synthesis complete"
        );
        outcome
    }

    /// Existing embeddings plus newly computed ones for papers lacking them.
    async fn embeddings(
        &self,
        papers: &[Paper],
        outcome: &mut SynthesisOutcome,
    ) -> HashMap<String, Vec<f32>> {
        let mut vectors: HashMap<String, Vec<f32>> = papers
            .iter()
            .filter_map(|p| p.embedding.clone().map(|v| (p.id.clone(), v)))
            .collect();
        let missing: Vec<(String, String)> = papers
            .iter()
            .filter(|p| !vectors.contains_key(&p.id))
            .map(|p| (p.id.clone(), embedding_text(p)))
            .collect();
        if missing.is_empty() {
            return vectors;
        }

        tracing::debug!(count = missing.len(), "Embedding papers");
        match self.embed(&missing).await {
            Ok(fresh) => {
                for (id, vector) in fresh {
                    if !vector.is_empty() && missing.iter().any(|(m, _)| *m == id) {
                        outcome.embeddings.insert(id.clone(), vector.clone());
                        vectors.insert(id, vector);
                    }
                }
            }
            Err(message) => {
                tracing::warn!(error = %message, "Embedding failed, affected papers stay unclustered");
                outcome.degradations.push(SynthesisDegradation::Embedding { message });
            }
        }
        vectors
    }

    async fn embed(&self, items: &[(String, String)]) -> Result<HashMap<String, Vec<f32>>, String> {
        let embedder = &self.embedder;
        let throttle = &self.throttle;
        with_retry(&self.retry, "embedding", || async move {
            let _permit = throttle.acquire().await?;
            embedder.embed(items).await
        })
        .await
        .map_err(|err| err.to_string())
    }

    async fn assign_clusters(
        &self,
        vectors: &HashMap<String, Vec<f32>>,
        outcome: &mut SynthesisOutcome,
    ) -> HashMap<String, Option<u32>> {
        if vectors.len() < pipeline::MIN_CLUSTER_PAPERS {
            return vectors.keys().map(|id| (id.clone(), Some(0))).collect();
        }
        let input = sorted(vectors);
        let clusterer = &self.clusterer;
        let input_ref = &input;
        let result = with_retry(&self.retry, "clustering", || async move {
            clusterer.cluster(input_ref).await
        })
        .await;
        match result {
            Ok(assigned) => assigned,
            Err(err) => {
                tracing::warn!(error = %err, "Clustering failed, papers kept without clusters");
                outcome.degradations.push(SynthesisDegradation::Clustering { message: err.to_string() });
                HashMap::new()
            }
        }
    }

    async fn project(
        &self,
        vectors: &HashMap<String, Vec<f32>>,
        outcome: &mut SynthesisOutcome,
    ) -> HashMap<String, (f32, f32)> {
        if vectors.len() < pipeline::MIN_CLUSTER_PAPERS {
            return HashMap::new();
        }
        let input = sorted(vectors);
        let reducer = &self.reducer;
        let input_ref = &input;
        let result = with_retry(&self.retry, "projection", || async move {
            reducer.reduce(input_ref).await
        })
        .await;
        result.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Projection failed");
            outcome.degradations.push(SynthesisDegradation::Projection { message: err.to_string() });
            HashMap::new()
        })
    }

    async fn describe_clusters(
        &self,
        members: &BTreeMap<u32, Vec<Paper>>,
        outcome: &mut SynthesisOutcome,
    ) -> BTreeMap<u32, ClusterSummary> {
        let narrator = &self.narrator;
        let throttle = &self.throttle;
        let retry = &self.retry;
        let described: Vec<(u32, usize, Result<ClusterNarrative, String>)> =
            stream::iter(members.iter())
                .map(|(id, papers)| async move {
                    let sample = &papers[..papers.len().min(pipeline::CLUSTER_SAMPLE)];
                    let result = with_retry(retry, "cluster_narrative", || async move {
                        let _permit = throttle.acquire().await?;
                        narrator.describe_cluster(sample).await
                    })
                    .await
                    .map_err(|err| err.to_string());
                    (*id, papers.len(), result)
                })
                .buffer_unordered(self.throttle.max_concurrent())
                .collect()
                .await;

        let mut summaries = BTreeMap::new();
        for (cluster_id, paper_count, result) in described {
            let narrative = result.unwrap_or_else(|message| {
                tracing::warn!(cluster = cluster_id, error = %message, "Cluster narrative failed");
                outcome
                    .degradations
                    .push(SynthesisDegradation::ClusterNarrative { cluster_id, message });
                ClusterNarrative { label: FALLBACK_LABEL.to_string(), summary: String::new() }
            });
            let label = if narrative.label.trim().is_empty() {
                format!("Cluster {}", cluster_id + 1)
            } else {
                narrative.label.trim().to_string()
            };
            summaries.insert(
                cluster_id,
                ClusterSummary { cluster_id, label, paper_count, summary: narrative.summary },
            );
        }
        summaries
    }

    /// Relevance per paper: cosine to the question where both embeddings
    /// exist, keyword overlap otherwise.
    async fn relevance(
        &self,
        review: &ReviewConfig,
        papers: &[Paper],
        vectors: &HashMap<String, Vec<f32>>,
        outcome: &mut SynthesisOutcome,
    ) -> HashMap<String, f64> {
        let mut question_vector = None;
        if !vectors.is_empty() {
            let item = [(QUESTION_ID.to_string(), review.research_question.clone())];
            match self.embed(&item).await {
                Ok(mut embedded) => question_vector = embedded.remove(QUESTION_ID),
                Err(message) => {
                    tracing::warn!(error = %message, "Question embedding failed, using keyword relevance");
                    outcome.degradations.push(SynthesisDegradation::KeywordRelevance { message });
                }
            }
        }

        let words = relevance::content_words(&review.research_question);
        papers
            .iter()
            .map(|paper| {
                let score = match (&question_vector, vectors.get(&paper.id)) {
                    (Some(q), Some(v)) => relevance::similarity_score(relevance::cosine(q, v)),
                    _ => relevance::keyword_score(
                        &words,
                        &format!("{} {}", paper.title, paper.abstract_text().unwrap_or_default()),
                    ),
                };
                (paper.id.clone(), score)
            })
            .collect()
    }
}

impl std::fmt::Debug for SynthesisCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisCoordinator").field("throttle", &self.throttle).finish_non_exhaustive()
    }
}

/// Vectors ordered by id so capability input is deterministic.
fn sorted(vectors: &HashMap<String, Vec<f32>>) -> Vec<(String, Vec<f32>)> {
    let mut input: Vec<(String, Vec<f32>)> =
        vectors.iter().map(|(id, v)| (id.clone(), v.clone())).collect();
    input.sort_by(|a, b| a.0.cmp(&b.0));
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ServiceError, ServiceResult};
    use crate::models::{RawPaperRecord, Source};

    struct AxisEmbedder {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(
            &self,
            items: &[(String, String)],
        ) -> ServiceResult<HashMap<String, Vec<f32>>> {
            if self.fail {
                return Err(ServiceError::permanent("embedding", "400"));
            }
            Ok(items
                .iter()
                .map(|(id, text)| {
                    let v = if text.contains("sleep") { vec![1.0, 0.0] } else { vec![0.0, 1.0] };
                    (id.clone(), v)
                })
                .collect())
        }
    }

    struct BrokenClusterer;

    #[async_trait::async_trait]
    impl Clusterer for BrokenClusterer {
        async fn cluster(
            &self,
            _vectors: &[(String, Vec<f32>)],
        ) -> ServiceResult<HashMap<String, Option<u32>>> {
            Err(ServiceError::permanent("clustering", "boom"))
        }
    }

    struct EchoNarrator;

    #[async_trait::async_trait]
    impl NarrativeGenerator for EchoNarrator {
        async fn describe_cluster(&self, papers: &[Paper]) -> ServiceResult<ClusterNarrative> {
            Ok(ClusterNarrative { label: String::new(), summary: format!("{} papers", papers.len()) })
        }

        async fn synthesize(
            &self,
            _review: &ReviewConfig,
            _paper_count: usize,
            _clusters: &[ClusterSummary],
        ) -> ServiceResult<OverallSynthesis> {
            Err(ServiceError::permanent("synthesis", "down"))
        }
    }

    fn paper(id: &str, title: &str) -> Paper {
        Paper::from_raw(
            RawPaperRecord { id: id.to_string(), title: Some(title.to_string()), ..Default::default() },
            Source::OpenAlex,
        )
        .unwrap()
    }

    fn coordinator(embed_fails: bool, clusterer: Arc<dyn Clusterer>) -> SynthesisCoordinator {
        SynthesisCoordinator::new(
            Arc::new(AxisEmbedder { fail: embed_fails }),
            clusterer,
            Arc::new(local::PrincipalComponents),
            Arc::new(EchoNarrator),
            Throttle::unlimited("synthesis"),
            RetryPolicy::none(),
        )
    }

    fn corpus() -> Vec<Paper> {
        vec![
            paper("a", "sleep and memory"),
            paper("b", "sleep spindles"),
            paper("c", "deep learning"),
            paper("d", "neural networks"),
            paper("e", "sleep deprivation"),
        ]
    }

    #[test]
    fn test_embedding_text_truncates_abstract() {
        let mut p = paper("a", "Title");
        p.r#abstract = Some("x".repeat(1000));
        assert_eq!(embedding_text(&p).chars().count(), "Title ".len() + 400);
    }

    #[tokio::test]
    async fn test_clusters_and_relevance() {
        let papers = corpus();
        let mut review = ReviewConfig::new("sleep");
        review.research_question = "sleep".to_string();
        let outcome = coordinator(false, Arc::new(local::KMeans)).run(&review, &papers).await;

        assert_eq!(outcome.placements.len(), 5);
        assert_eq!(outcome.embeddings.len(), 5);
        let a = &outcome.placements["a"];
        let c = &outcome.placements["c"];
        assert_eq!(a.cluster_id, outcome.placements["b"].cluster_id);
        assert_ne!(a.cluster_id, c.cluster_id);
        assert!((a.relevance_score - 100.0).abs() < 1e-9);
        assert!(c.relevance_score.abs() < 1e-9);
        assert!(a.coordinates.is_some());
        // empty labels fall back to the cluster number
        assert!(outcome.report.clusters.iter().all(|c| c.label.starts_with("Cluster ")));
        assert_eq!(outcome.report.overall.narrative_overview, "Synthesis generation failed.");
    }

    #[tokio::test]
    async fn test_clustering_failure_keeps_every_paper() {
        let papers = corpus();
        let outcome =
            coordinator(false, Arc::new(BrokenClusterer)).run(&ReviewConfig::new("sleep"), &papers).await;
        assert_eq!(outcome.placements.len(), 5);
        assert!(outcome.placements.values().all(|p| p.cluster_id.is_none()));
        assert!(outcome.placements.values().all(|p| p.cluster_label.as_deref() == Some(NOISE_LABEL)));
        assert!(
            outcome
                .degradations
                .iter()
                .any(|d| matches!(d, SynthesisDegradation::Clustering { .. }))
        );
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_keywords() {
        let papers = corpus();
        let outcome =
            coordinator(true, Arc::new(local::KMeans)).run(&ReviewConfig::new("sleep memory"), &papers).await;
        assert_eq!(outcome.placements.len(), 5);
        assert!(outcome.placements.values().all(|p| p.cluster_id.is_none()));
        assert!(outcome.placements["a"].relevance_score > 0.0);
        assert!(outcome.report.clusters.is_empty());
    }
}
