//! OpenAlex works API: search, citation graph and abstract reconstruction.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::{HttpClient, param, source_error};
use crate::config::Config;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{AuthorRef, Paper, RawPaperRecord, Source};
use crate::services::{CitationGraph, SearchFilters, SearchPage, SourceSearch};

/// Fields selected for every work.
const WORK_FIELDS: &str = "id,doi,title,abstract_inverted_index,authorships,publication_year,\
primary_location,open_access,type,cited_by_count";

/// Largest page the works endpoint serves.
const PAGE_SIZE: usize = 200;

/// Ids per `openalex:` filter request.
const HYDRATION_CHUNK: usize = 50;

/// Search terms kept after sanitising.
const MAX_QUERY_TERMS: usize = 12;

const SERVICE: &str = "openalex";

static CONTENT_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:title|abstract|fulltext)\.search:(\S+)|\b(?:concepts|topics)\.id:(\S+)")
        .expect("valid regex")
});
static STRUCTURAL_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:publication_year|host_venue(?:\.\w+)*|type|language|open_access(?:\.\w+)*):\S+",
    )
    .expect("valid regex")
});
static DOTTED_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\w+(?:\.\w+)+:(\S+)").expect("valid regex")
});
static BARE_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w+:\S+").expect("valid regex"));
static YEARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}(?:-\d{4})?\b").expect("valid regex")
});
static OPERATORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:AND|OR|NOT)\b|[()"\[\]]"#).expect("valid regex")
});

/// Type labels that are filter values rather than search terms.
const SKIP_TERMS: &[&str] = &["journal_article", "journal", "article", "preprint", "book_chapter", "review"];

/// Reduce a query to plain keywords for the `search` parameter.
///
/// Field prefixes keep their value when they name content (`title.search:x`)
/// and are dropped with their value when they are structural
/// (`publication_year:2020`). Years, boolean operators and grouping
/// punctuation go; terms are lower-cased, de-duplicated and capped at twelve.
#[must_use]
pub fn sanitize_query(query: &str) -> String {
    let cleaned = CONTENT_FIELD.replace_all(query, "$1$2");
    let cleaned = STRUCTURAL_FIELD.replace_all(&cleaned, "");
    let cleaned = DOTTED_FIELD.replace_all(&cleaned, "$1");
    let cleaned = BARE_FIELD.replace_all(&cleaned, "");
    let cleaned = YEARS.replace_all(&cleaned, "");
    let cleaned = OPERATORS.replace_all(&cleaned, " ");

    let mut seen = HashSet::new();
    cleaned
        .split_whitespace()
        .map(|w| w.to_lowercase().trim_matches(|c| matches!(c, '.' | ',' | ';' | ':' | '-')).to_string())
        .filter(|w| w.chars().count() > 2 && !SKIP_TERMS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .take(MAX_QUERY_TERMS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rebuild plain text from an inverted-index abstract (`word -> [positions]`).
#[must_use]
pub fn reconstruct_abstract(index: &HashMap<String, Vec<usize>>) -> String {
    let mut positions: Vec<(usize, &str)> = index
        .iter()
        .flat_map(|(word, locs)| locs.iter().map(move |pos| (*pos, word.as_str())))
        .collect();
    positions.sort_unstable();
    positions.into_iter().map(|(_, word)| word).collect::<Vec<_>>().join(" ")
}

/// Short work id (`W123`) from a full OpenAlex URL.
fn short_id(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

#[derive(Debug, Default, Deserialize)]
struct Work {
    id: Option<String>,
    doi: Option<String>,
    title: Option<String>,
    abstract_inverted_index: Option<HashMap<String, Vec<usize>>>,
    #[serde(default)]
    authorships: Vec<Authorship>,
    publication_year: Option<i32>,
    primary_location: Option<Location>,
    open_access: Option<OpenAccess>,
    r#type: Option<String>,
    cited_by_count: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct Authorship {
    author: Option<WorkAuthor>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkAuthor {
    display_name: Option<String>,
    orcid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Location {
    source: Option<LocationSource>,
}

#[derive(Debug, Default, Deserialize)]
struct LocationSource {
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAccess {
    is_oa: Option<bool>,
    oa_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WorksMeta {
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorksResponse {
    #[serde(default)]
    meta: WorksMeta,
    #[serde(default)]
    results: Vec<Work>,
}

impl Work {
    fn into_record(self) -> Option<RawPaperRecord> {
        let id = self.id.as_deref().map(short_id).filter(|id| !id.is_empty())?.to_string();
        let open_access = self.open_access.unwrap_or_default();
        Some(RawPaperRecord {
            id,
            source: Some(Source::OpenAlex),
            doi: self.doi,
            title: self.title,
            r#abstract: self
                .abstract_inverted_index
                .as_ref()
                .map(reconstruct_abstract)
                .filter(|a| !a.is_empty()),
            authors: self
                .authorships
                .into_iter()
                .filter_map(|a| a.author)
                .filter_map(|a| {
                    let name = a.display_name.filter(|n| !n.is_empty())?;
                    Some(AuthorRef { name, orcid: a.orcid.filter(|o| !o.is_empty()) })
                })
                .collect(),
            year: self.publication_year,
            venue: self.primary_location.and_then(|l| l.source).and_then(|s| s.display_name),
            citation_count: self.cited_by_count,
            document_type: self.r#type,
            full_text_available: open_access.is_oa,
            open_access_url: open_access.oa_url,
            summary: None,
            embedding: None,
            query_source: None,
        })
    }
}

/// OpenAlex API client.
#[derive(Clone)]
pub struct OpenAlexClient {
    http: HttpClient,
    base_url: String,
    email: Option<String>,
}

impl OpenAlexClient {
    /// Create a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpClient::new(config, reqwest::header::HeaderMap::new())?,
            base_url: config.openalex_url.clone(),
            email: config.openalex_email.clone(),
        })
    }

    fn with_mailto(&self, mut params: Vec<(String, String)>) -> Vec<(String, String)> {
        if let Some(ref email) = self.email {
            params.push(param("mailto", email));
        }
        params
    }

    async fn works(&self, params: Vec<(String, String)>) -> ServiceResult<WorksResponse> {
        let url = format!("{}/works", self.base_url);
        let value = self
            .http
            .get_json(&url, &self.with_mailto(params))
            .await
            .map_err(|e| ServiceError::from_client(SERVICE, e))?;
        serde_json::from_value(value).map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))
    }
}

#[async_trait::async_trait]
impl SourceSearch for OpenAlexClient {
    fn source(&self) -> Source {
        Source::OpenAlex
    }

    async fn search_page(
        &self,
        query: &str,
        filters: &SearchFilters,
        cursor: Option<&str>,
    ) -> ServiceResult<SearchPage> {
        let clean = sanitize_query(query);
        if clean != query {
            tracing::debug!(query = %query, sanitized = %clean, "Sanitized OpenAlex query");
        }
        let mut params = vec![
            param("search", &clean),
            param("select", WORK_FIELDS),
            param("per-page", PAGE_SIZE.min(filters.max_results.max(1))),
            param("cursor", cursor.unwrap_or("*")),
        ];
        let mut year_filters = Vec::new();
        if let Some(min) = filters.year_min {
            year_filters.push(format!("publication_year:>{}", min - 1));
        }
        if let Some(max) = filters.year_max {
            year_filters.push(format!("publication_year:<{}", max + 1));
        }
        if !year_filters.is_empty() {
            params.push(param("filter", year_filters.join(",")));
        }

        let url = format!("{}/works", self.base_url);
        let value = self
            .http
            .get_json(&url, &self.with_mailto(params))
            .await
            .map_err(|e| source_error(SERVICE, e))?;
        let response: WorksResponse = serde_json::from_value(value)
            .map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))?;

        let records = response
            .results
            .into_iter()
            .filter_map(Work::into_record)
            .map(|mut r| {
                r.query_source = Some(query.to_string());
                r
            })
            .collect();
        Ok(SearchPage { records, next_cursor: response.meta.next_cursor.filter(|c| !c.is_empty()) })
    }
}

#[async_trait::async_trait]
impl CitationGraph for OpenAlexClient {
    fn source(&self) -> Source {
        Source::OpenAlex
    }

    fn lookup_id(&self, paper: &Paper) -> Option<String> {
        paper.record_id_for(Source::OpenAlex).map(str::to_string)
    }

    async fn references(&self, paper_id: &str) -> ServiceResult<HashSet<String>> {
        let url = format!("{}/works/{}", self.base_url, paper_id);
        let params = self.with_mailto(vec![param("select", "id,referenced_works")]);
        let value = self
            .http
            .get_json(&url, &params)
            .await
            .map_err(|e| ServiceError::from_client(SERVICE, e))?;

        let works = value
            .get("referenced_works")
            .and_then(Value::as_array)
            .ok_or_else(|| ServiceError::malformed(SERVICE, "work has no referenced_works"))?;
        Ok(works.iter().filter_map(Value::as_str).map(|id| short_id(id).to_string()).collect())
    }

    async fn cited_by(&self, paper_id: &str) -> ServiceResult<HashSet<String>> {
        let response = self
            .works(vec![
                param("filter", format!("cites:{paper_id}")),
                param("select", "id"),
                param("per-page", PAGE_SIZE),
            ])
            .await?;
        Ok(response
            .results
            .into_iter()
            .filter_map(|w| w.id)
            .map(|id| short_id(&id).to_string())
            .collect())
    }

    async fn papers(&self, ids: &[String]) -> ServiceResult<Vec<RawPaperRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(HYDRATION_CHUNK) {
            let response = self
                .works(vec![
                    param("filter", format!("openalex:{}", chunk.join("|"))),
                    param("select", WORK_FIELDS),
                    param("per-page", HYDRATION_CHUNK),
                ])
                .await?;
            records.extend(response.results.into_iter().filter_map(Work::into_record));
        }
        Ok(records)
    }
}

impl std::fmt::Debug for OpenAlexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAlexClient").field("polite_pool", &self.email.is_some()).finish()
    }
}
