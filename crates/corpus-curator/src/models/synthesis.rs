//! Quality assessments and synthesis results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ServiceError, ServiceResult};

/// Quality warning attached to a paper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Nothing notable.
    #[default]
    None,
    /// Very few citations for its age.
    LowCitations,
    /// Venue shows signs of predatory publishing.
    PredatoryJournalRisk,
    /// Weak methodology.
    MethodologyWeak,
    /// Retracted or at risk of retraction.
    RetractionRisk,
}

impl QualityFlag {
    /// Parse a flag label, unknown labels map to [`QualityFlag::None`].
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "low_citations" => Self::LowCitations,
            "predatory_journal_risk" => Self::PredatoryJournalRisk,
            "methodology_weak" => Self::MethodologyWeak,
            "retraction_risk" => Self::RetractionRisk,
            _ => Self::None,
        }
    }
}

/// Methodological quality of one included paper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityAssessment {
    /// Score 0-100.
    pub score: u8,

    /// Short summary of the assessment.
    #[serde(default)]
    pub notes: String,

    /// Strengths noted by the assessor.
    #[serde(default)]
    pub strengths: Vec<String>,

    /// Concerns noted by the assessor.
    #[serde(default)]
    pub concerns: Vec<String>,

    /// Warning flag.
    #[serde(default)]
    pub flag: QualityFlag,
}

impl QualityAssessment {
    /// Neutral score used when assessment fails.
    pub const FALLBACK_SCORE: u8 = 50;

    /// Placeholder recorded when the scorer could not assess the paper.
    #[must_use]
    pub fn failed() -> Self {
        Self {
            score: Self::FALLBACK_SCORE,
            notes: "Assessment failed.".to_string(),
            strengths: Vec::new(),
            concerns: Vec::new(),
            flag: QualityFlag::None,
        }
    }

    /// Validate a quality scoring response.
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` if `quality_score` is missing or not a number.
    pub fn from_response(value: &Value) -> ServiceResult<Self> {
        let score = value
            .get("quality_score")
            .and_then(Value::as_f64)
            .ok_or_else(|| ServiceError::malformed("quality", "missing quality_score"))?;
        let strings = |key: &str| -> Vec<String> {
            value
                .get(key)
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default()
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let score = score.clamp(0.0, 100.0).round() as u8;
        Ok(Self {
            score,
            notes: value.get("quality_notes").and_then(Value::as_str).unwrap_or_default().to_string(),
            strengths: strings("strengths"),
            concerns: strings("concerns"),
            flag: value.get("flag").and_then(Value::as_str).map(QualityFlag::parse).unwrap_or_default(),
        })
    }
}

/// Label and summary of one thematic cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    /// Cluster identifier from the clustering capability.
    pub cluster_id: u32,

    /// Short thematic label.
    pub label: String,

    /// Number of member papers.
    pub paper_count: usize,

    /// One-paragraph summary.
    #[serde(default)]
    pub summary: String,
}

/// Narrative for one cluster, as returned by the narrative capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNarrative {
    /// Thematic label.
    pub label: String,

    /// One-paragraph summary.
    #[serde(default)]
    pub summary: String,
}

/// Overall narrative synthesis across clusters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallSynthesis {
    /// Multi-paragraph overview.
    #[serde(default, alias = "narrative_overview")]
    pub narrative_overview: String,

    /// Main themes.
    #[serde(default, alias = "key_themes")]
    pub key_themes: Vec<String>,

    /// Points of agreement.
    #[serde(default, alias = "consensus_points")]
    pub consensus_points: Vec<String>,

    /// Open debates.
    #[serde(default, alias = "key_debates")]
    pub key_debates: Vec<String>,

    /// Gaps in the literature.
    #[serde(default, alias = "research_gaps")]
    pub research_gaps: Vec<String>,

    /// Observations on methods used across the corpus.
    #[serde(default, alias = "methodological_observations")]
    pub methodological_observations: String,

    /// Notes on the most central papers.
    #[serde(default, alias = "seminal_papers_notes")]
    pub seminal_papers_notes: String,
}

impl OverallSynthesis {
    /// Placeholder recorded when synthesis generation fails.
    #[must_use]
    pub fn failed() -> Self {
        Self { narrative_overview: "Synthesis generation failed.".to_string(), ..Self::default() }
    }
}

/// Output of the synthesis stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisReport {
    /// Number of papers synthesised.
    pub paper_count: usize,

    /// Per-cluster summaries, ordered by cluster id.
    pub clusters: Vec<ClusterSummary>,

    /// Overall narrative.
    pub overall: OverallSynthesis,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_quality_from_response() {
        let qa = QualityAssessment::from_response(&json!({
            "quality_score": 104.2,
            "strengths": ["large sample"],
            "concerns": [],
            "quality_notes": "Solid RCT.",
            "flag": "low_citations"
        }))
        .unwrap();
        assert_eq!(qa.score, 100);
        assert_eq!(qa.flag, QualityFlag::LowCitations);
        assert_eq!(qa.strengths, vec!["large sample"]);
    }

    #[test]
    fn test_quality_requires_score() {
        assert!(QualityAssessment::from_response(&json!({"quality_notes": "?"})).is_err());
    }

    #[test]
    fn test_failed_assessment_is_neutral() {
        let qa = QualityAssessment::failed();
        assert_eq!(qa.score, 50);
        assert_eq!(qa.notes, "Assessment failed.");
    }

    #[test]
    fn test_overall_synthesis_accepts_snake_case() {
        let overall: OverallSynthesis =
            serde_json::from_value(json!({"narrative_overview": "x", "key_themes": ["a"]})).unwrap();
        assert_eq!(overall.narrative_overview, "x");
        assert_eq!(overall.key_themes, vec!["a"]);
    }
}
