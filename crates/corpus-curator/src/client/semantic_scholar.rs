//! Semantic Scholar Graph API: search, citation graph and TLDR summaries.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;

use super::{HttpClient, param, source_error};
use crate::config::Config;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{AuthorRef, Paper, RawPaperRecord, Source};
use crate::services::{CitationGraph, SearchFilters, SearchPage, SourceSearch};

/// Fields requested for every paper.
const PAPER_FIELDS: &str = "paperId,externalIds,title,abstract,authors,year,venue,\
citationCount,publicationTypes,tldr,isOpenAccess,openAccessPdf";

/// Largest page the search endpoint serves.
const SEARCH_PAGE: usize = 100;

/// Largest id list the batch endpoint accepts.
const BATCH_LIMIT: usize = 500;

/// Largest page of references or citations.
const GRAPH_PAGE: usize = 1000;

const SERVICE: &str = "semantic_scholar";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    paper_id: Option<String>,
    #[serde(default)]
    external_ids: Option<S2ExternalIds>,
    title: Option<String>,
    r#abstract: Option<String>,
    #[serde(default)]
    authors: Vec<S2Author>,
    year: Option<i32>,
    venue: Option<String>,
    citation_count: Option<i32>,
    #[serde(default)]
    publication_types: Option<Vec<String>>,
    tldr: Option<S2Tldr>,
    is_open_access: Option<bool>,
    open_access_pdf: Option<S2Pdf>,
}

#[derive(Debug, Default, Deserialize)]
struct S2ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct S2Author {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct S2Tldr {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct S2Pdf {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S2SearchResponse {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    next: Option<usize>,
    #[serde(default)]
    data: Vec<S2Paper>,
}

impl S2Paper {
    fn into_record(self) -> Option<RawPaperRecord> {
        let id = self.paper_id.filter(|id| !id.is_empty())?;
        Some(RawPaperRecord {
            id,
            source: Some(Source::SemanticScholar),
            doi: self.external_ids.and_then(|e| e.doi),
            title: self.title,
            r#abstract: self.r#abstract,
            authors: self
                .authors
                .into_iter()
                .filter_map(|a| a.name)
                .filter(|n| !n.is_empty())
                .map(AuthorRef::named)
                .collect(),
            year: self.year,
            venue: self.venue,
            citation_count: self.citation_count,
            document_type: self.publication_types.and_then(|t| t.into_iter().next()),
            full_text_available: self.is_open_access,
            open_access_url: self.open_access_pdf.and_then(|p| p.url),
            summary: self.tldr.and_then(|t| t.text),
            embedding: None,
            query_source: None,
        })
    }
}

/// Semantic Scholar API client.
#[derive(Clone)]
pub struct SemanticScholarClient {
    http: HttpClient,
    base_url: String,
    has_api_key: bool,
}

impl SemanticScholarClient {
    /// Create a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(ref key) = config.semantic_scholar_api_key {
            headers.insert("x-api-key", key.parse()?);
        }
        Ok(Self {
            http: HttpClient::new(config, headers)?,
            base_url: config.semantic_scholar_url.clone(),
            has_api_key: config.semantic_scholar_api_key.is_some(),
        })
    }

    /// Check if an API key is configured.
    #[must_use]
    pub const fn has_api_key(&self) -> bool {
        self.has_api_key
    }

    /// Ids on one side of a paper's citation edges.
    async fn edges(&self, paper_id: &str, edge: &str, side: &str) -> ServiceResult<HashSet<String>> {
        let url = format!("{}/paper/{}/{}", self.base_url, paper_id, edge);
        let params = vec![param("fields", format!("{side}.paperId")), param("limit", GRAPH_PAGE)];
        let value = self
            .http
            .get_json(&url, &params)
            .await
            .map_err(|e| ServiceError::from_client(SERVICE, e))?;

        let data = value
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| ServiceError::malformed(SERVICE, format!("{edge} response has no data")))?;
        Ok(data
            .iter()
            .filter_map(|entry| entry.get(side)?.get("paperId")?.as_str())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait::async_trait]
impl SourceSearch for SemanticScholarClient {
    fn source(&self) -> Source {
        Source::SemanticScholar
    }

    async fn search_page(
        &self,
        query: &str,
        filters: &SearchFilters,
        cursor: Option<&str>,
    ) -> ServiceResult<SearchPage> {
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let url = format!("{}/paper/search", self.base_url);
        let mut params = vec![
            param("query", query),
            param("fields", PAPER_FIELDS),
            param("offset", offset),
            param("limit", SEARCH_PAGE.min(filters.max_results.max(1))),
        ];
        match (filters.year_min, filters.year_max) {
            (Some(min), Some(max)) => params.push(param("year", format!("{min}-{max}"))),
            (Some(min), None) => params.push(param("year", format!("{min}-"))),
            (None, Some(max)) => params.push(param("year", format!("-{max}"))),
            (None, None) => {}
        }

        let value = self.http.get_json(&url, &params).await.map_err(|e| source_error(SERVICE, e))?;
        let response: S2SearchResponse = serde_json::from_value(value)
            .map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))?;

        let next_cursor = response
            .next
            .filter(|next| *next > offset && *next < response.total)
            .map(|next| next.to_string());
        let records = response
            .data
            .into_iter()
            .filter_map(S2Paper::into_record)
            .map(|mut r| {
                r.query_source = Some(query.to_string());
                r
            })
            .collect();

        tracing::debug!(offset, total = response.total, "Semantic Scholar page");
        Ok(SearchPage { records, next_cursor })
    }
}

#[async_trait::async_trait]
impl CitationGraph for SemanticScholarClient {
    fn source(&self) -> Source {
        Source::SemanticScholar
    }

    fn lookup_id(&self, paper: &Paper) -> Option<String> {
        paper
            .record_id_for(Source::SemanticScholar)
            .map(str::to_string)
            .or_else(|| paper.doi.as_ref().map(|doi| format!("DOI:{doi}")))
    }

    async fn references(&self, paper_id: &str) -> ServiceResult<HashSet<String>> {
        self.edges(paper_id, "references", "citedPaper").await
    }

    async fn cited_by(&self, paper_id: &str) -> ServiceResult<HashSet<String>> {
        self.edges(paper_id, "citations", "citingPaper").await
    }

    async fn papers(&self, ids: &[String]) -> ServiceResult<Vec<RawPaperRecord>> {
        let url = format!("{}/paper/batch", self.base_url);
        let params = vec![param("fields", PAPER_FIELDS)];
        let mut records = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(BATCH_LIMIT) {
            let body = serde_json::json!({ "ids": chunk });
            let value = self
                .http
                .post_json(&url, &params, &body)
                .await
                .map_err(|e| ServiceError::from_client(SERVICE, e))?;

            // The batch endpoint answers null for unknown ids
            let results: Vec<Option<S2Paper>> = serde_json::from_value(value)
                .map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))?;
            records.extend(results.into_iter().flatten().filter_map(S2Paper::into_record));
        }
        Ok(records)
    }
}

impl std::fmt::Debug for SemanticScholarClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticScholarClient").field("has_api_key", &self.has_api_key).finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_record_mapping() {
        let paper: S2Paper = serde_json::from_value(json!({
            "paperId": "abc",
            "externalIds": {"DOI": "10.1/x"},
            "title": "Sleep and memory",
            "authors": [{"name": "Ada"}, {"name": ""}],
            "year": 2020,
            "citationCount": 12,
            "publicationTypes": ["JournalArticle"],
            "tldr": {"text": "Sleep helps."},
            "isOpenAccess": true,
            "openAccessPdf": {"url": "https://example.org/a.pdf"}
        }))
        .unwrap();
        let record = paper.into_record().unwrap();
        assert_eq!(record.id, "abc");
        assert_eq!(record.doi.as_deref(), Some("10.1/x"));
        assert_eq!(record.authors, vec![AuthorRef::named("Ada")]);
        assert_eq!(record.summary.as_deref(), Some("Sleep helps."));
        assert_eq!(record.full_text_available, Some(true));
        assert_eq!(record.source, Some(Source::SemanticScholar));
    }

    #[test]
    fn test_record_without_id_is_dropped() {
        let paper: S2Paper = serde_json::from_value(json!({"title": "x"})).unwrap();
        assert!(paper.into_record().is_none());
    }
}
