//! Methodological quality scoring for included papers.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::models::{Paper, QualityAssessment, ReviewConfig};
use crate::retry::{RetryPolicy, with_retry};
use crate::services::QualityScorer;
use crate::throttle::Throttle;

/// A paper whose assessment fell back to the neutral score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentFailure {
    /// Paper id.
    pub paper_id: String,

    /// Error message.
    pub message: String,
}

/// Output of one quality assessment run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    /// Assessment per paper id, fallbacks included.
    pub assessments: HashMap<String, QualityAssessment>,

    /// Papers that received the fallback assessment.
    pub failures: Vec<AssessmentFailure>,
}

/// Scores papers concurrently through a [`QualityScorer`].
pub struct QualityAssessor {
    scorer: Arc<dyn QualityScorer>,
    throttle: Throttle,
    retry: RetryPolicy,
}

impl QualityAssessor {
    /// Create an assessor.
    #[must_use]
    pub fn new(scorer: Arc<dyn QualityScorer>, throttle: Throttle, retry: RetryPolicy) -> Self {
        Self { scorer, throttle, retry }
    }

    /// Assess every paper. Never fails: a paper that cannot be scored gets
    /// [`QualityAssessment::failed`].
    pub async fn assess(&self, review: &ReviewConfig, papers: &[Paper]) -> QualityReport {
        let scorer = &self.scorer;
        let throttle = &self.throttle;
        let retry = &self.retry;
        let results: Vec<(&Paper, Result<QualityAssessment, String>)> = stream::iter(papers)
            .map(|paper| async move {
                let result = with_retry(retry, "quality", || async move {
                    let _permit = throttle.acquire().await?;
                    scorer.assess(review, paper).await
                })
                .await
                .and_then(|value| QualityAssessment::from_response(&value))
                .map_err(|err| err.to_string());
                (paper, result)
            })
            .buffer_unordered(self.throttle.max_concurrent())
            .collect()
            .await;

        let mut report = QualityReport::default();
        for (paper, result) in results {
            let assessment = result.unwrap_or_else(|message| {
                tracing::warn!(paper = %paper.id, error = %message, "Quality assessment failed");
                report
                    .failures
                    .push(AssessmentFailure { paper_id: paper.id.clone(), message });
                QualityAssessment::failed()
            });
            report.assessments.insert(paper.id.clone(), assessment);
        }
        report.failures.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));

        tracing::info!(
            assessed = report.assessments.len(),
            failed = report.failures.len(),
            "Quality assessment complete"
        );
        report
    }
}

impl std::fmt::Debug for QualityAssessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityAssessor").field("throttle", &self.throttle).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::error::{ServiceError, ServiceResult};
    use crate::models::{RawPaperRecord, Source};

    struct ScriptedScorer;

    #[async_trait::async_trait]
    impl QualityScorer for ScriptedScorer {
        async fn assess(&self, _review: &ReviewConfig, paper: &Paper) -> ServiceResult<Value> {
            match paper.id.as_str() {
                "good" => Ok(json!({"quality_score": 82, "quality_notes": "RCT", "flag": "none"})),
                "garbled" => Ok(json!({"notes": "no score"})),
                _ => Err(ServiceError::permanent("quality", "400")),
            }
        }
    }

    fn paper(id: &str) -> Paper {
        Paper::from_raw(
            RawPaperRecord { id: id.to_string(), title: Some(id.to_string()), ..Default::default() },
            Source::OpenAlex,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_failures_fall_back_to_neutral_score() {
        let assessor = QualityAssessor::new(
            Arc::new(ScriptedScorer),
            Throttle::unlimited("quality"),
            RetryPolicy::none(),
        );
        let papers = vec![paper("good"), paper("garbled"), paper("broken")];
        let report = assessor.assess(&ReviewConfig::new("q"), &papers).await;

        assert_eq!(report.assessments.len(), 3);
        assert_eq!(report.assessments["good"].score, 82);
        assert_eq!(report.assessments["garbled"].score, 50);
        assert_eq!(report.assessments["broken"].notes, "Assessment failed.");
        let failed: Vec<&str> = report.failures.iter().map(|f| f.paper_id.as_str()).collect();
        assert_eq!(failed, vec!["broken", "garbled"]);
    }
}
