//! Batched screening classifier.
//!
//! Papers are grouped into batches of up to ten per classification call and
//! batches run concurrently under the classifier throttle. Responses are
//! validated entry by entry and matched to papers by id, so one bad entry
//! never invalidates its neighbours.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::config::pipeline;
use crate::error::ServiceError;
use crate::models::{Paper, ReasonCategory, ScreeningDecision, Strictness, Verdict, truncate_chars};
use crate::retry::{RetryPolicy, with_retry};
use crate::services::{ClassificationItem, Classifier, ScreeningRequest};
use crate::throttle::Throttle;

impl ClassificationItem {
    /// Item built from title and abstract, truncated to `max_chars`.
    #[must_use]
    pub fn from_paper(paper: &Paper, max_chars: usize) -> Self {
        let text = paper.abstract_text().map(|a| truncate_chars(a, max_chars)).unwrap_or_default();
        Self::with_text(paper, text)
    }

    /// Item carrying caller-supplied text (full text or a fallback).
    #[must_use]
    pub fn with_text(paper: &Paper, text: impl Into<String>) -> Self {
        Self {
            id: paper.id.clone(),
            title: paper.title.clone(),
            year: paper.year,
            document_type: paper.document_type,
            text: text.into(),
        }
    }
}

/// A validated verdict for one paper, before strictness is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawVerdict {
    /// Verdict as returned.
    pub verdict: Verdict,

    /// Confidence 0-100.
    pub confidence: u8,

    /// Reason category.
    pub reason: ReasonCategory,

    /// Free-text rationale.
    pub rationale: String,
}

impl RawVerdict {
    /// Apply strictness: an INCLUDE below the include threshold becomes
    /// BORDERLINE with reason [`ReasonCategory::LowConfidence`].
    #[must_use]
    pub fn apply_strictness(self, strictness: Strictness) -> Self {
        if self.verdict == Verdict::Include && self.confidence < strictness.include_threshold() {
            Self { verdict: Verdict::Borderline, reason: ReasonCategory::LowConfidence, ..self }
        } else {
            self
        }
    }
}

/// Why one entry of a batch response was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEntry {
    /// Paper id.
    pub id: String,

    /// Validation failure.
    pub message: String,
}

impl MalformedEntry {
    fn new(id: &str, message: impl Into<String>) -> Self {
        Self { id: id.to_string(), message: message.into() }
    }
}

fn entry_id(entry: &Value) -> Option<String> {
    match entry.get("id")? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_entry(id: &str, entry: &Value) -> Result<RawVerdict, MalformedEntry> {
    let verdict = entry
        .get("decision")
        .and_then(Value::as_str)
        .and_then(Verdict::parse)
        .ok_or_else(|| MalformedEntry::new(id, "missing or unknown decision"))?;
    let confidence = entry
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| (0.0..=100.0).contains(c))
        .ok_or_else(|| MalformedEntry::new(id, "confidence missing or outside 0-100"))?;
    let rationale = entry.get("reason").and_then(Value::as_str).unwrap_or_default().to_string();
    let reason = entry
        .get("category")
        .and_then(Value::as_str)
        .map_or_else(|| ReasonCategory::default_for(verdict), ReasonCategory::parse);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let confidence = confidence.round() as u8;
    Ok(RawVerdict { verdict, confidence, reason, rationale })
}

/// Validate a batch screening response.
///
/// Expected shape:
/// `{"decisions": [{"id", "decision", "confidence", "reason", "category"}]}`.
///
/// Every expected id gets an entry in the result: a validated verdict, or a
/// [`MalformedEntry`] if its entry is missing, invalid, or the response as a
/// whole does not match the schema. Entries for unexpected ids are ignored;
/// for duplicate ids the first valid entry wins.
#[must_use]
pub fn parse_batch_response(
    value: &Value,
    expected_ids: &[String],
) -> HashMap<String, Result<RawVerdict, MalformedEntry>> {
    let Some(entries) = value.get("decisions").and_then(Value::as_array) else {
        return expected_ids
            .iter()
            .map(|id| (id.clone(), Err(MalformedEntry::new(id, "response has no decisions array"))))
            .collect();
    };

    let expected: HashSet<&str> = expected_ids.iter().map(String::as_str).collect();
    let mut results: HashMap<String, Result<RawVerdict, MalformedEntry>> = HashMap::new();

    for entry in entries {
        let Some(id) = entry_id(entry) else {
            tracing::debug!("Skipping classifier entry without id");
            continue;
        };
        if !expected.contains(id.as_str()) {
            tracing::debug!(id = %id, "Skipping classifier entry for unexpected id");
            continue;
        }
        let parsed = parse_entry(&id, entry);
        if !matches!(results.get(&id), Some(Ok(_))) {
            results.insert(id, parsed);
        }
    }

    for id in expected_ids {
        results
            .entry(id.clone())
            .or_insert_with(|| Err(MalformedEntry::new(id, "no entry in response")));
    }
    results
}

/// Result of classifying a set of papers.
#[derive(Debug, Clone, Default)]
pub struct ClassificationOutcome {
    /// One decision per resolved paper.
    pub decisions: HashMap<String, ScreeningDecision>,

    /// Papers whose calls failed transiently past the retry budget.
    pub unresolved: Vec<String>,

    /// Papers re-queued for solo classification.
    pub solo_retries: usize,
}

enum BatchResult {
    Parsed(HashMap<String, Result<RawVerdict, MalformedEntry>>),
    Failed(ServiceError),
}

/// Batches papers into classification calls and maps responses back to papers.
#[derive(Clone)]
pub struct BatchedClassifier {
    classifier: Arc<dyn Classifier>,
    batch_size: usize,
    throttle: Throttle,
    retry: RetryPolicy,
}

impl BatchedClassifier {
    /// Create a batched classifier. `batch_size` is clamped to 1..=10.
    #[must_use]
    pub fn new(
        classifier: Arc<dyn Classifier>,
        batch_size: usize,
        throttle: Throttle,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            classifier,
            batch_size: batch_size.clamp(1, pipeline::MAX_BATCH_SIZE),
            throttle,
            retry,
        }
    }

    /// Effective batch size.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Classify `items`, producing at most one decision per item.
    ///
    /// Malformed entries are retried once on their own; a second failure
    /// yields BORDERLINE with [`ReasonCategory::ClassificationFailed`].
    /// Items whose calls keep failing are listed as unresolved.
    pub async fn classify(
        &self,
        request: &ScreeningRequest,
        items: &[ClassificationItem],
    ) -> ClassificationOutcome {
        let mut outcome = ClassificationOutcome::default();
        if items.is_empty() {
            return outcome;
        }

        let batches: Vec<&[ClassificationItem]> = items.chunks(self.batch_size).collect();
        tracing::info!(
            papers = items.len(),
            batches = batches.len(),
            pass = ?request.pass,
            "Classifying"
        );

        let results: Vec<_> = stream::iter(batches)
            .map(|batch| async move { (batch, self.call(request, batch).await) })
            .buffer_unordered(self.throttle.max_concurrent())
            .collect()
            .await;

        let by_id: HashMap<&str, &ClassificationItem> =
            items.iter().map(|item| (item.id.as_str(), item)).collect();
        let mut solo: Vec<&ClassificationItem> = Vec::new();

        for (batch, result) in results {
            match result {
                BatchResult::Parsed(parsed) => {
                    for (id, entry) in parsed {
                        match entry {
                            Ok(raw) => Self::record(&mut outcome, request, id, raw),
                            Err(malformed) => {
                                tracing::debug!(id = %malformed.id, reason = %malformed.message, "Malformed entry, retrying solo");
                                if let Some(&item) = by_id.get(id.as_str()) {
                                    solo.push(item);
                                }
                            }
                        }
                    }
                }
                BatchResult::Failed(ServiceError::MalformedResponse { message, .. }) => {
                    tracing::debug!(size = batch.len(), reason = %message, "Malformed batch, retrying solo");
                    solo.extend(batch.iter());
                }
                BatchResult::Failed(err) => {
                    tracing::warn!(size = batch.len(), error = %err, "Batch unresolved");
                    outcome.unresolved.extend(batch.iter().map(|item| item.id.clone()));
                }
            }
        }

        outcome.solo_retries = solo.len();
        let solo_results: Vec<_> = stream::iter(solo)
            .map(|item| async move {
                (item, self.call(request, std::slice::from_ref(item)).await)
            })
            .buffer_unordered(self.throttle.max_concurrent())
            .collect()
            .await;

        for (item, result) in solo_results {
            let entry = match result {
                BatchResult::Parsed(mut parsed) => parsed.remove(&item.id),
                BatchResult::Failed(ServiceError::MalformedResponse { .. }) => None,
                BatchResult::Failed(err) => {
                    tracing::warn!(id = %item.id, error = %err, "Solo classification unresolved");
                    outcome.unresolved.push(item.id.clone());
                    continue;
                }
            };
            match entry {
                Some(Ok(raw)) => Self::record(&mut outcome, request, item.id.clone(), raw),
                _ => {
                    tracing::warn!(id = %item.id, "Classification failed twice");
                    outcome.decisions.insert(
                        item.id.clone(),
                        ScreeningDecision::classification_failed(item.id.clone(), request.pass),
                    );
                }
            }
        }

        outcome.unresolved.sort();
        outcome
    }

    fn record(
        outcome: &mut ClassificationOutcome,
        request: &ScreeningRequest,
        id: String,
        raw: RawVerdict,
    ) {
        let raw = raw.apply_strictness(request.strictness);
        let decision = ScreeningDecision::machine(
            id.clone(),
            request.pass,
            raw.verdict,
            raw.confidence,
            raw.reason,
            raw.rationale,
        );
        outcome.decisions.insert(id, decision);
    }

    async fn call(&self, request: &ScreeningRequest, batch: &[ClassificationItem]) -> BatchResult {
        let ids: Vec<String> = batch.iter().map(|item| item.id.clone()).collect();
        let classifier = &self.classifier;
        let throttle = &self.throttle;
        let response = with_retry(&self.retry, "classify", || async move {
            let _permit = throttle.acquire().await?;
            classifier.classify(request, batch).await
        })
        .await;
        match response {
            Ok(value) => BatchResult::Parsed(parse_batch_response(&value, &ids)),
            Err(err) => BatchResult::Failed(err),
        }
    }
}

impl std::fmt::Debug for BatchedClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedClassifier")
            .field("batch_size", &self.batch_size)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}
