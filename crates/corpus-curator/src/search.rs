//! Search stage: run an approved query plan across every configured source.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;

use crate::error::{ServiceError, ServiceResult};
use crate::models::{QueryPlan, RawPaperRecord, SearchQuery, Source};
use crate::retry::{RetryPolicy, with_retry};
use crate::services::{SearchFilters, SearchPage, SourceSearch, search_stream};
use crate::throttle::Throttle;

/// Results per query for the primary source: `max(50, target * 4)`.
#[must_use]
pub fn primary_limit(target_corpus_size: usize) -> usize {
    (target_corpus_size * 4).max(50)
}

/// A query that failed part-way or entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFailure {
    /// Source queried.
    pub source: Source,

    /// Query text.
    pub query: String,

    /// Records retrieved before the failure.
    pub partial: usize,

    /// Error message.
    pub message: String,
}

/// Everything the search stage produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    /// Raw records in arrival order, source always set.
    #[serde(skip)]
    pub records: Vec<RawPaperRecord>,

    /// Records identified per source.
    pub identified: BTreeMap<Source, usize>,

    /// Failed queries.
    pub failures: Vec<QueryFailure>,

    /// Sources where every query failed.
    pub unavailable: Vec<Source>,

    /// Queries for sources with no configured client, never run.
    pub skipped: Vec<SearchQuery>,
}

/// Source wrapper that throttles and retries every page fetch.
struct Guarded<'a> {
    inner: &'a dyn SourceSearch,
    throttle: &'a Throttle,
    retry: &'a RetryPolicy,
}

#[async_trait::async_trait]
impl SourceSearch for Guarded<'_> {
    fn source(&self) -> Source {
        self.inner.source()
    }

    async fn search_page(
        &self,
        query: &str,
        filters: &SearchFilters,
        cursor: Option<&str>,
    ) -> ServiceResult<SearchPage> {
        let inner = self.inner;
        let throttle = self.throttle;
        with_retry(self.retry, "search", || async move {
            let _permit = throttle.acquire().await?;
            inner.search_page(query, filters, cursor).await
        })
        .await
    }
}

/// Runs query plans.
pub struct SearchRunner {
    sources: Vec<Arc<dyn SourceSearch>>,
    throttle: Throttle,
    retry: RetryPolicy,
}

impl SearchRunner {
    /// Create a runner; the first source is primary.
    #[must_use]
    pub fn new(sources: Vec<Arc<dyn SourceSearch>>, throttle: Throttle, retry: RetryPolicy) -> Self {
        Self { sources, throttle, retry }
    }

    fn source_for(&self, source: Source) -> Option<(usize, &dyn SourceSearch)> {
        self.sources.iter().position(|s| s.source() == source).map(|n| (n, self.sources[n].as_ref()))
    }

    /// Execute every query against its source.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnavailable` when no source produced a successful query.
    pub async fn run(
        &self,
        plan: &QueryPlan,
        year_min: Option<i32>,
        year_max: Option<i32>,
        target_corpus_size: usize,
    ) -> ServiceResult<SearchOutcome> {
        let primary = primary_limit(target_corpus_size);
        let mut futures = FuturesUnordered::new();
        let mut skipped = Vec::new();

        for (position, query) in plan.queries.iter().enumerate() {
            let Some((rank, source)) = self.source_for(query.source) else {
                tracing::warn!(source = %query.source, query = %query.text, "No client for source, skipping query");
                skipped.push(query.clone());
                continue;
            };
            let filters = SearchFilters {
                year_min,
                year_max,
                max_results: if rank == 0 { primary } else { primary / 2 },
            };
            let guarded = Guarded { inner: source, throttle: &self.throttle, retry: &self.retry };
            futures.push(async move {
                let (records, error) = collect_query(&guarded, query, &filters).await;
                (position, query, records, error)
            });
        }

        let mut finished = Vec::new();
        while let Some(result) = futures.next().await {
            finished.push(result);
        }
        finished.sort_by_key(|(position, ..)| *position);

        let mut outcome = SearchOutcome { skipped, ..SearchOutcome::default() };
        let mut attempted: BTreeMap<Source, (usize, usize)> = BTreeMap::new();
        for (_, query, records, error) in finished {
            let entry = attempted.entry(query.source).or_default();
            entry.0 += 1;
            *outcome.identified.entry(query.source).or_default() += records.len();
            if let Some(err) = error {
                entry.1 += 1;
                tracing::warn!(source = %query.source, query = %query.text, error = %err, "Query failed");
                outcome.failures.push(QueryFailure {
                    source: query.source,
                    query: query.text.clone(),
                    partial: records.len(),
                    message: err.to_string(),
                });
            }
            outcome.records.extend(records);
        }

        outcome.unavailable = attempted
            .iter()
            .filter(|(_, (total, failed))| total == failed)
            .map(|(source, _)| *source)
            .collect();
        for source in &outcome.unavailable {
            tracing::warn!(source = %source, "Source unavailable, continuing with remaining sources");
        }

        if attempted.is_empty() || outcome.unavailable.len() == attempted.len() {
            return Err(ServiceError::unavailable(
                "all sources",
                format!(
                    "no search query succeeded against any configured source ({} skipped for unconfigured sources)",
                    outcome.skipped.len()
                ),
            ));
        }

        tracing::info!(
            records = outcome.records.len(),
            failures = outcome.failures.len(),
            "Search complete"
        );
        Ok(outcome)
    }
}

impl std::fmt::Debug for SearchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sources: Vec<Source> = self.sources.iter().map(|s| s.source()).collect();
        f.debug_struct("SearchRunner").field("sources", &sources).finish_non_exhaustive()
    }
}

/// Drain one query's stream, keeping records retrieved before any error.
async fn collect_query(
    source: &dyn SourceSearch,
    query: &SearchQuery,
    filters: &SearchFilters,
) -> (Vec<RawPaperRecord>, Option<ServiceError>) {
    let mut records = Vec::new();
    let stream = search_stream(source, &query.text, filters);
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        match item {
            Ok(mut record) => {
                record.source.get_or_insert(query.source);
                record.query_source.get_or_insert_with(|| query.text.clone());
                records.push(record);
            }
            Err(err) => return (records, Some(err)),
        }
    }
    (records, None)
}
