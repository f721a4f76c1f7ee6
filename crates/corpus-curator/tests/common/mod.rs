//! In-memory fakes for the consumed services.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};

use corpus_curator::Config;
use corpus_curator::error::{ServiceError, ServiceResult};
use corpus_curator::models::{
    AuthorRef, ClusterNarrative, ClusterSummary, OverallSynthesis, Paper, RawPaperRecord,
    ReviewConfig, Source,
};
use corpus_curator::services::{
    CitationGraph, ClassificationItem, Classifier, Embedder, FullTextResolver, NarrativeGenerator,
    QualityScorer, QueryFormulator, ScreeningRequest, SearchFilters, SearchPage, Services,
    SourceSearch,
};
use corpus_curator::synthesis::local::{KMeans, PrincipalComponents};

pub const QUESTION: &str = "Does sleep improve memory consolidation in adults?";

/// Test configuration: no rate ceilings, immediate retries.
pub fn config() -> Config {
    Config::for_testing("http://127.0.0.1:9")
}

/// Review with snowballing off unless a test turns it on.
pub fn review() -> ReviewConfig {
    let mut review = ReviewConfig::new(QUESTION);
    review.inclusion_criteria = "Adults; sleep manipulation; memory outcome".to_string();
    review.max_snowball_rounds = 0;
    review
}

pub fn record(id: &str, title: &str, doi: Option<&str>, source: Source) -> RawPaperRecord {
    RawPaperRecord {
        id: id.to_string(),
        source: Some(source),
        doi: doi.map(str::to_string),
        title: Some(title.to_string()),
        r#abstract: Some(format!("{title}. We studied sleep and memory in healthy adults.")),
        authors: vec![AuthorRef::named("Ada Lovelace")],
        year: Some(2020),
        citation_count: Some(10),
        ..Default::default()
    }
}

// ---- search --------------------------------------------------------------

/// Serves a fixed record list as a single page, or fails every call.
pub struct FakeSource {
    pub source: Source,
    pub records: Vec<RawPaperRecord>,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(source: Source, records: Vec<RawPaperRecord>) -> Self {
        Self { source, records, fail: false, calls: AtomicUsize::new(0) }
    }

    pub fn failing(source: Source) -> Self {
        Self { source, records: Vec::new(), fail: true, calls: AtomicUsize::new(0) }
    }
}

#[async_trait::async_trait]
impl SourceSearch for FakeSource {
    fn source(&self) -> Source {
        self.source
    }

    async fn search_page(
        &self,
        _query: &str,
        filters: &SearchFilters,
        _cursor: Option<&str>,
    ) -> ServiceResult<SearchPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ServiceError::unavailable(self.source.as_str(), "connection refused"));
        }
        let records = self.records.iter().take(filters.max_results).cloned().collect();
        Ok(SearchPage { records, next_cursor: None })
    }
}

// ---- citation graph ------------------------------------------------------

#[derive(Default)]
pub struct FakeGraph {
    pub references: HashMap<String, Vec<String>>,
    pub cited_by: HashMap<String, Vec<String>>,
    pub records: HashMap<String, RawPaperRecord>,
}

impl FakeGraph {
    pub fn cites(mut self, from: &str, to: &[&str]) -> Self {
        self.references.insert(from.to_string(), to.iter().map(|s| (*s).to_string()).collect());
        self
    }

    pub fn with_record(mut self, record: RawPaperRecord) -> Self {
        self.records.insert(record.id.clone(), record);
        self
    }
}

#[async_trait::async_trait]
impl CitationGraph for FakeGraph {
    fn source(&self) -> Source {
        Source::OpenAlex
    }

    async fn references(&self, paper_id: &str) -> ServiceResult<HashSet<String>> {
        Ok(self.references.get(paper_id).into_iter().flatten().cloned().collect())
    }

    async fn cited_by(&self, paper_id: &str) -> ServiceResult<HashSet<String>> {
        Ok(self.cited_by.get(paper_id).into_iter().flatten().cloned().collect())
    }

    async fn papers(&self, ids: &[String]) -> ServiceResult<Vec<RawPaperRecord>> {
        Ok(ids.iter().filter_map(|id| self.records.get(id).cloned()).collect())
    }
}

// ---- language-model capabilities ----------------------------------------

/// Decides on title keywords: "Unrelated" excludes, "Maybe" is borderline,
/// anything else is included with high confidence.
#[derive(Default)]
pub struct RuleClassifier {
    pub calls: AtomicUsize,
}

impl RuleClassifier {
    fn decide(item: &ClassificationItem) -> Value {
        if item.title.contains("Unrelated") {
            json!({"id": item.id, "decision": "EXCLUDE", "confidence": 95,
                   "reason": "Not about sleep.", "category": "off_topic"})
        } else if item.title.contains("Maybe") {
            json!({"id": item.id, "decision": "BORDERLINE", "confidence": 50,
                   "reason": "Population unclear."})
        } else {
            json!({"id": item.id, "decision": "INCLUDE", "confidence": 90,
                   "reason": "Meets all criteria.", "category": "meets_criteria"})
        }
    }
}

#[async_trait::async_trait]
impl Classifier for RuleClassifier {
    async fn classify(
        &self,
        _request: &ScreeningRequest,
        items: &[ClassificationItem],
    ) -> ServiceResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "decisions": items.iter().map(Self::decide).collect::<Vec<_>>() }))
    }
}

pub struct NoFullText;

#[async_trait::async_trait]
impl FullTextResolver for NoFullText {
    async fn resolve(&self, _doi: &str) -> ServiceResult<Option<String>> {
        Ok(None)
    }
}

/// Letter-frequency vectors: deterministic and never all-zero.
pub struct LetterEmbedder;

#[async_trait::async_trait]
impl Embedder for LetterEmbedder {
    async fn embed(&self, items: &[(String, String)]) -> ServiceResult<HashMap<String, Vec<f32>>> {
        Ok(items
            .iter()
            .map(|(id, text)| {
                let lower = text.to_lowercase();
                let count = |c: char| lower.chars().filter(|x| *x == c).count() as f32;
                (id.clone(), vec![count('a'), count('e'), count('s'), count('m'), 1.0])
            })
            .collect())
    }
}

pub struct TitleNarrator;

#[async_trait::async_trait]
impl NarrativeGenerator for TitleNarrator {
    async fn describe_cluster(&self, papers: &[Paper]) -> ServiceResult<ClusterNarrative> {
        Ok(ClusterNarrative {
            label: format!("Theme: {}", papers.first().map_or("", |p| p.title.as_str())),
            summary: format!("{} papers.", papers.len()),
        })
    }

    async fn synthesize(
        &self,
        _review: &ReviewConfig,
        paper_count: usize,
        clusters: &[ClusterSummary],
    ) -> ServiceResult<OverallSynthesis> {
        Ok(OverallSynthesis {
            narrative_overview: format!("{paper_count} papers in {} clusters.", clusters.len()),
            key_themes: clusters.iter().map(|c| c.label.clone()).collect(),
            ..Default::default()
        })
    }
}

pub struct FixedFormulator;

#[async_trait::async_trait]
impl QueryFormulator for FixedFormulator {
    async fn formulate(&self, _review: &ReviewConfig) -> ServiceResult<Value> {
        Ok(json!({
            "openalex_queries": [{"query": "sleep memory consolidation", "description": "core"}],
            "semantic_scholar_queries": [{"query": "sleep memory adults"}],
            "suggested_concepts": ["slow-wave sleep"],
            "notes_for_user": "Consider naps."
        }))
    }
}

pub struct FixedQuality;

#[async_trait::async_trait]
impl QualityScorer for FixedQuality {
    async fn assess(&self, _review: &ReviewConfig, _paper: &Paper) -> ServiceResult<Value> {
        Ok(json!({"quality_score": 72, "quality_notes": "Adequate design.", "strengths": ["RCT"]}))
    }
}

/// Services around the given sources and graph; everything else is a fake.
pub fn services(sources: Vec<Arc<dyn SourceSearch>>, graph: Arc<dyn CitationGraph>) -> Services {
    Services {
        sources,
        citations: graph,
        classifier: Arc::new(RuleClassifier::default()),
        full_text: Arc::new(NoFullText),
        embedder: Arc::new(LetterEmbedder),
        clusterer: Arc::new(KMeans),
        reducer: Arc::new(PrincipalComponents),
        narrator: Arc::new(TitleNarrator),
        formulator: Arc::new(FixedFormulator),
        quality: Arc::new(FixedQuality),
    }
}

/// Five relevant OpenAlex records, one borderline and one off-topic.
pub fn openalex_records() -> Vec<RawPaperRecord> {
    vec![
        record("W1", "Slow-wave sleep boosts declarative recall", Some("10.1000/a1"), Source::OpenAlex),
        record("W2", "Overnight consolidation of motor sequences", Some("10.1000/a2"), Source::OpenAlex),
        record("W3", "Napping and vocabulary retention in students", None, Source::OpenAlex),
        record("W4", "Sleep deprivation impairs working memory", Some("10.1000/a4"), Source::OpenAlex),
        record("W5", "Spindle density predicts episodic memory gains", None, Source::OpenAlex),
        record("W6", "Maybe relevant: shift work and recall", None, Source::OpenAlex),
        record("W7", "Unrelated cooking habits survey", None, Source::OpenAlex),
    ]
}

/// Two Semantic Scholar records, one duplicating W1 by DOI.
pub fn semantic_scholar_records() -> Vec<RawPaperRecord> {
    vec![
        record("s2-a", "Slow wave sleep boosts declarative recall", Some("https://doi.org/10.1000/A1"), Source::SemanticScholar),
        record("s2-b", "REM sleep and emotional memory processing", None, Source::SemanticScholar),
    ]
}
