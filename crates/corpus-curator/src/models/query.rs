//! Search strategy produced by query formulation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Source;
use crate::error::{ServiceError, ServiceResult};

/// One query against one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Source the query targets.
    pub source: Source,

    /// Plain keyword query string.
    pub text: String,

    /// What the query is meant to capture.
    #[serde(default)]
    pub description: String,
}

impl SearchQuery {
    /// Create a query.
    #[must_use]
    pub fn new(source: Source, text: impl Into<String>) -> Self {
        Self { source, text: text.into(), description: String::new() }
    }
}

/// A full search strategy awaiting approval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    /// Queries in execution order.
    pub queries: Vec<SearchQuery>,

    /// Concepts the formulator suggests the user consider.
    #[serde(default)]
    pub suggested_concepts: Vec<String>,

    /// Free-text notes for the reviewer.
    #[serde(default)]
    pub notes: String,
}

impl QueryPlan {
    /// Validate a query formulation response.
    ///
    /// Expected shape:
    /// `{"openalex_queries": [{"query", "description"}], "semantic_scholar_queries": [...],
    ///   "suggested_concepts": [...], "notes_for_user": "..."}`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` when a query entry is not an object with a
    /// non-empty `query`, or when the plan contains no queries at all.
    pub fn from_response(value: &Value) -> ServiceResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ServiceError::malformed("query formulation", "response is not an object"))?;

        let mut queries = Vec::new();
        for (key, source) in
            [("openalex_queries", Source::OpenAlex), ("semantic_scholar_queries", Source::SemanticScholar)]
        {
            let Some(entries) = obj.get(key) else { continue };
            let entries = entries.as_array().ok_or_else(|| {
                ServiceError::malformed("query formulation", format!("{key} is not an array"))
            })?;
            for entry in entries {
                let text = entry
                    .get("query")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .ok_or_else(|| {
                        ServiceError::malformed("query formulation", format!("{key} entry without query"))
                    })?;
                let description =
                    entry.get("description").and_then(Value::as_str).unwrap_or_default().to_string();
                queries.push(SearchQuery { source, text: text.to_string(), description });
            }
        }

        if queries.is_empty() {
            return Err(ServiceError::malformed("query formulation", "no queries in plan"));
        }

        let suggested_concepts = obj
            .get("suggested_concepts")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let notes = obj
            .get("notes_for_user")
            .or_else(|| obj.get("notes"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self { queries, suggested_concepts, notes })
    }

    /// Queries targeting `source`.
    pub fn for_source(&self, source: Source) -> impl Iterator<Item = &SearchQuery> {
        self.queries.iter().filter(move |q| q.source == source)
    }

    /// Check if the plan has no queries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parses_both_sources() {
        let plan = QueryPlan::from_response(&json!({
            "openalex_queries": [{"query": "sleep deprivation memory", "description": "core"}],
            "semantic_scholar_queries": [{"query": "sleep loss recall"}],
            "suggested_concepts": ["consolidation"],
            "notes_for_user": "Consider adding REM."
        }))
        .unwrap();
        assert_eq!(plan.queries.len(), 2);
        assert_eq!(plan.for_source(Source::OpenAlex).count(), 1);
        assert_eq!(plan.queries[1].source, Source::SemanticScholar);
        assert_eq!(plan.suggested_concepts, vec!["consolidation"]);
        assert_eq!(plan.notes, "Consider adding REM.");
    }

    #[test]
    fn test_rejects_empty_plan() {
        let err = QueryPlan::from_response(&json!({"openalex_queries": []})).unwrap_err();
        assert!(matches!(err, ServiceError::MalformedResponse { .. }));
    }

    #[test]
    fn test_rejects_entry_without_query() {
        let err =
            QueryPlan::from_response(&json!({"openalex_queries": [{"description": "x"}]})).unwrap_err();
        assert!(matches!(err, ServiceError::MalformedResponse { .. }));
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(QueryPlan::from_response(&json!(["q"])).is_err());
    }
}
