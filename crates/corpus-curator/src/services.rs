//! Consumed capabilities.
//!
//! Every external collaborator the pipeline talks to is an async trait here.
//! Live HTTP implementations live in [`crate::client`]; tests plug in
//! in-memory fakes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;

use crate::error::ServiceResult;
use crate::models::{
    ClusterNarrative, ClusterSummary, DocumentType, OverallSynthesis, Paper, RawPaperRecord,
    ReviewConfig, ScreeningPass, Source, Strictness,
};

/// Filters applied to a source search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilters {
    /// Minimum publication year (inclusive).
    pub year_min: Option<i32>,

    /// Maximum publication year (inclusive).
    pub year_max: Option<i32>,

    /// Stop paginating after this many records.
    pub max_results: usize,
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    /// Records on this page.
    pub records: Vec<RawPaperRecord>,

    /// Cursor for the next page; `None` once the result set is exhausted.
    pub next_cursor: Option<String>,
}

impl SearchPage {
    /// Returns true if no further pages are available.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Paginated search against one bibliographic source.
#[async_trait::async_trait]
pub trait SourceSearch: Send + Sync {
    /// Source this implementation queries.
    fn source(&self) -> Source;

    /// Fetch one page. `cursor` is `None` for the first page.
    async fn search_page(
        &self,
        query: &str,
        filters: &SearchFilters,
        cursor: Option<&str>,
    ) -> ServiceResult<SearchPage>;
}

/// Lazily page through a source until it is exhausted or `max_results` is hit.
pub fn search_stream<'a>(
    search: &'a dyn SourceSearch,
    query: &'a str,
    filters: &'a SearchFilters,
) -> impl Stream<Item = ServiceResult<RawPaperRecord>> + Send + 'a {
    try_stream! {
        let mut cursor: Option<String> = None;
        let mut yielded = 0usize;
        'pages: loop {
            let page = search.search_page(query, filters, cursor.as_deref()).await?;
            let exhausted = page.is_exhausted() || page.records.is_empty();
            for record in page.records {
                if yielded >= filters.max_results {
                    break 'pages;
                }
                yielded += 1;
                yield record;
            }
            if exhausted || yielded >= filters.max_results {
                break;
            }
            cursor = page.next_cursor;
        }
    }
}

/// Citation network lookups.
#[async_trait::async_trait]
pub trait CitationGraph: Send + Sync {
    /// Source hydrated records are attributed to.
    fn source(&self) -> Source;

    /// Identifier this graph uses for `paper`, or `None` if it cannot look it up.
    fn lookup_id(&self, paper: &Paper) -> Option<String> {
        Some(paper.id.clone())
    }

    /// Papers cited by `paper_id` (backward).
    async fn references(&self, paper_id: &str) -> ServiceResult<HashSet<String>>;

    /// Papers citing `paper_id` (forward).
    async fn cited_by(&self, paper_id: &str) -> ServiceResult<HashSet<String>>;

    /// Hydrate ids into full records. Unknown ids are omitted.
    async fn papers(&self, ids: &[String]) -> ServiceResult<Vec<RawPaperRecord>>;
}

/// Criteria shared by every paper in a classification call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningRequest {
    /// Research question.
    pub research_question: String,

    /// Inclusion criteria.
    pub inclusion_criteria: String,

    /// Exclusion criteria.
    pub exclusion_criteria: String,

    /// Strictness level.
    pub strictness: Strictness,

    /// Year range as configured.
    pub year_min: Option<i32>,

    /// Year range as configured.
    pub year_max: Option<i32>,

    /// Pass being screened.
    pub pass: ScreeningPass,
}

impl ScreeningRequest {
    /// Build a request for `pass` from the review configuration.
    #[must_use]
    pub fn from_review(review: &ReviewConfig, pass: ScreeningPass) -> Self {
        Self {
            research_question: review.research_question.clone(),
            inclusion_criteria: review.inclusion_criteria.clone(),
            exclusion_criteria: review.exclusion_criteria.clone(),
            strictness: review.strictness,
            year_min: review.year_min,
            year_max: review.year_max,
            pass,
        }
    }
}

/// One paper as presented to the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationItem {
    /// Paper id; responses are matched on it.
    pub id: String,

    /// Title.
    pub title: String,

    /// Publication year.
    pub year: Option<i32>,

    /// Publication type.
    pub document_type: DocumentType,

    /// Abstract (pass 1) or full text / fallback text (pass 2).
    pub text: String,
}

/// Structured classification of a batch of papers.
#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    /// Classify 1..=10 items in one call.
    ///
    /// Returns the raw structured response; validation happens in
    /// [`crate::classifier::parse_batch_response`].
    async fn classify(
        &self,
        request: &ScreeningRequest,
        items: &[ClassificationItem],
    ) -> ServiceResult<Value>;
}

/// Open-access full-text resolution.
#[async_trait::async_trait]
pub trait FullTextResolver: Send + Sync {
    /// Resolve a DOI to plain text, `None` when no open copy exists.
    async fn resolve(&self, doi: &str) -> ServiceResult<Option<String>>;
}

/// Text embedding.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `(id, text)` pairs, returning vectors keyed by id.
    async fn embed(&self, items: &[(String, String)]) -> ServiceResult<HashMap<String, Vec<f32>>>;
}

/// Clustering of embedding vectors.
#[async_trait::async_trait]
pub trait Clusterer: Send + Sync {
    /// Assign cluster ids; `None` marks noise.
    async fn cluster(
        &self,
        vectors: &[(String, Vec<f32>)],
    ) -> ServiceResult<HashMap<String, Option<u32>>>;
}

/// Dimensionality reduction to 2D.
#[async_trait::async_trait]
pub trait Reducer: Send + Sync {
    /// Project vectors to 2D coordinates keyed by id.
    async fn reduce(
        &self,
        vectors: &[(String, Vec<f32>)],
    ) -> ServiceResult<HashMap<String, (f32, f32)>>;
}

/// Narrative generation for clusters and the overall synthesis.
#[async_trait::async_trait]
pub trait NarrativeGenerator: Send + Sync {
    /// Label and summarise one cluster from its member papers.
    async fn describe_cluster(&self, papers: &[Paper]) -> ServiceResult<ClusterNarrative>;

    /// Overall synthesis from cluster summaries.
    async fn synthesize(
        &self,
        review: &ReviewConfig,
        paper_count: usize,
        clusters: &[ClusterSummary],
    ) -> ServiceResult<OverallSynthesis>;
}

/// Turns a research question into a search strategy.
#[async_trait::async_trait]
pub trait QueryFormulator: Send + Sync {
    /// Raw structured response, validated by
    /// [`crate::models::QueryPlan::from_response`].
    async fn formulate(&self, review: &ReviewConfig) -> ServiceResult<Value>;
}

/// Methodological quality scoring.
#[async_trait::async_trait]
pub trait QualityScorer: Send + Sync {
    /// Raw structured response, validated by
    /// [`crate::models::QualityAssessment::from_response`].
    async fn assess(&self, review: &ReviewConfig, paper: &Paper) -> ServiceResult<Value>;
}

/// Every capability the orchestrator needs.
#[derive(Clone)]
pub struct Services {
    /// Search sources, primary first.
    pub sources: Vec<Arc<dyn SourceSearch>>,

    /// Citation graph for snowballing.
    pub citations: Arc<dyn CitationGraph>,

    /// Screening classifier.
    pub classifier: Arc<dyn Classifier>,

    /// Full-text resolver for pass 2.
    pub full_text: Arc<dyn FullTextResolver>,

    /// Embeddings for synthesis and relevance.
    pub embedder: Arc<dyn Embedder>,

    /// Clustering.
    pub clusterer: Arc<dyn Clusterer>,

    /// 2D projection.
    pub reducer: Arc<dyn Reducer>,

    /// Cluster and overall narratives.
    pub narrator: Arc<dyn NarrativeGenerator>,

    /// Query formulation.
    pub formulator: Arc<dyn QueryFormulator>,

    /// Quality scoring.
    pub quality: Arc<dyn QualityScorer>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sources: Vec<Source> = self.sources.iter().map(|s| s.source()).collect();
        f.debug_struct("Services").field("sources", &sources).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    struct PagedSource {
        pages: usize,
        per_page: usize,
    }

    #[async_trait::async_trait]
    impl SourceSearch for PagedSource {
        fn source(&self) -> Source {
            Source::OpenAlex
        }

        async fn search_page(
            &self,
            _query: &str,
            _filters: &SearchFilters,
            cursor: Option<&str>,
        ) -> ServiceResult<SearchPage> {
            let page: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
            let records = (0..self.per_page)
                .map(|i| RawPaperRecord {
                    id: format!("W{page}-{i}"),
                    title: Some(format!("Paper {page}-{i}")),
                    ..Default::default()
                })
                .collect();
            let next_cursor = (page + 1 < self.pages).then(|| (page + 1).to_string());
            Ok(SearchPage { records, next_cursor })
        }
    }

    fn filters(max_results: usize) -> SearchFilters {
        SearchFilters { year_min: None, year_max: None, max_results }
    }

    #[tokio::test]
    async fn test_stream_pages_until_exhausted() {
        let source = PagedSource { pages: 3, per_page: 4 };
        let f = filters(100);
        let records: Vec<_> = search_stream(&source, "q", &f).collect().await;
        assert_eq!(records.len(), 12);
        assert!(records.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_stream_stops_at_max_results() {
        let source = PagedSource { pages: 10, per_page: 4 };
        let f = filters(6);
        let records: Vec<_> = search_stream(&source, "q", &f).collect().await;
        assert_eq!(records.len(), 6);
    }

    #[test]
    fn test_screening_request_from_review() {
        let mut review = ReviewConfig::new("Does sleep affect memory?");
        review.inclusion_criteria = "adults".to_string();
        let request = ScreeningRequest::from_review(&review, ScreeningPass::FullText);
        assert_eq!(request.inclusion_criteria, "adults");
        assert_eq!(request.pass, ScreeningPass::FullText);
    }
}
