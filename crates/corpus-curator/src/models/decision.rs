//! Screening verdicts, decisions and final-status derivation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verdict for a single paper in a single pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Meets the criteria.
    Include,
    /// Fails the criteria.
    Exclude,
    /// Not enough confidence either way.
    Borderline,
}

impl Verdict {
    /// Parse a verdict label, case-insensitively.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "INCLUDE" => Some(Self::Include),
            "EXCLUDE" => Some(Self::Exclude),
            "BORDERLINE" => Some(Self::Borderline),
            _ => None,
        }
    }
}

/// Which screening pass produced a machine decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreeningPass {
    /// Title/abstract screening.
    TitleAbstract,
    /// Full-text screening.
    FullText,
}

impl ScreeningPass {
    /// Actor recorded for decisions of this pass.
    #[must_use]
    pub const fn actor(self) -> Actor {
        match self {
            Self::TitleAbstract => Actor::MachinePass1,
            Self::FullText => Actor::MachinePass2,
        }
    }
}

/// Who made a decision. Ordered by precedence, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Actor {
    /// Title/abstract classifier.
    #[serde(rename = "machine-pass-1")]
    MachinePass1,
    /// Full-text classifier.
    #[serde(rename = "machine-pass-2")]
    MachinePass2,
    /// Human reviewer.
    Human,
}

impl Actor {
    /// Returns true for classifier decisions.
    #[must_use]
    pub const fn is_machine(self) -> bool {
        !matches!(self, Self::Human)
    }
}

/// Reason categories for the flow diagram's exclusion breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    /// Meets the inclusion criteria.
    MeetsCriteria,
    /// Not about the research question.
    OffTopic,
    /// Population or setting does not match.
    WrongPopulation,
    /// Study design excluded by the criteria.
    WrongStudyDesign,
    /// Outside the configured year range.
    OutOfDateRange,
    /// Document type excluded by the criteria.
    WrongDocumentType,
    /// Not enough information to decide.
    InsufficientInformation,
    /// Include verdict demoted by the strictness threshold.
    LowConfidence,
    /// Classifier was unsure.
    Borderline,
    /// The classifier never produced a valid verdict.
    ClassificationFailed,
    /// Human reviewer deferred the decision.
    Deferred,
    /// Human reviewer's judgement.
    HumanJudgement,
    /// Anything else.
    Other,
}

impl ReasonCategory {
    /// Parse a category label, falling back to [`ReasonCategory::Other`].
    #[must_use]
    pub fn parse(label: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(
            label.trim().to_ascii_lowercase().replace([' ', '-'], "_"),
        ))
        .unwrap_or(Self::Other)
    }

    /// Default category for a verdict without an explicit one.
    #[must_use]
    pub const fn default_for(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Include => Self::MeetsCriteria,
            Verdict::Exclude => Self::Other,
            Verdict::Borderline => Self::Borderline,
        }
    }
}

/// Final inclusion status of a paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    /// In the final corpus.
    Included,
    /// Out of the final corpus.
    Excluded,
}

/// One decision for one paper in one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningDecision {
    /// Paper the decision applies to.
    pub paper_id: String,

    /// Verdict.
    pub verdict: Verdict,

    /// Confidence 0-100.
    pub confidence: u8,

    /// Reason category.
    pub reason: ReasonCategory,

    /// Free-text rationale.
    pub rationale: String,

    /// When the decision was made.
    pub timestamp: DateTime<Utc>,

    /// Who made it.
    pub actor: Actor,
}

impl ScreeningDecision {
    /// A classifier decision.
    #[must_use]
    pub fn machine(
        paper_id: impl Into<String>,
        pass: ScreeningPass,
        verdict: Verdict,
        confidence: u8,
        reason: ReasonCategory,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            paper_id: paper_id.into(),
            verdict,
            confidence: confidence.min(100),
            reason,
            rationale: rationale.into(),
            timestamp: Utc::now(),
            actor: pass.actor(),
        }
    }

    /// Decision recorded after the classifier failed twice for this paper.
    #[must_use]
    pub fn classification_failed(paper_id: impl Into<String>, pass: ScreeningPass) -> Self {
        Self::machine(
            paper_id,
            pass,
            Verdict::Borderline,
            0,
            ReasonCategory::ClassificationFailed,
            "classification failed",
        )
    }

    /// A human reviewer's decision.
    #[must_use]
    pub fn human(
        paper_id: impl Into<String>,
        verdict: Verdict,
        reason: ReasonCategory,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            paper_id: paper_id.into(),
            verdict,
            confidence: 100,
            reason,
            rationale: rationale.into(),
            timestamp: Utc::now(),
            actor: Actor::Human,
        }
    }

    /// Status this decision implies on its own.
    ///
    /// BORDERLINE never implies inclusion; it only becomes INCLUDED through a
    /// human decision.
    #[must_use]
    pub const fn implied_status(&self) -> FinalStatus {
        match self.verdict {
            Verdict::Include => FinalStatus::Included,
            Verdict::Exclude | Verdict::Borderline => FinalStatus::Excluded,
        }
    }
}

/// Derive the final status from a paper's decisions.
///
/// Precedence: human > pass 2 > pass 1; within an actor the latest wins.
#[must_use]
pub fn derive_final_status<'a>(
    decisions: impl IntoIterator<Item = &'a ScreeningDecision>,
) -> Option<FinalStatus> {
    decisions
        .into_iter()
        .max_by(|a, b| a.actor.cmp(&b.actor).then(a.timestamp.cmp(&b.timestamp)))
        .map(ScreeningDecision::implied_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(pass: ScreeningPass, verdict: Verdict) -> ScreeningDecision {
        ScreeningDecision::machine("p1", pass, verdict, 80, ReasonCategory::default_for(verdict), "")
    }

    #[test]
    fn test_no_decisions_no_status() {
        assert_eq!(derive_final_status(std::iter::empty()), None);
    }

    #[test]
    fn test_pass2_overrides_pass1() {
        let decisions = [
            machine(ScreeningPass::TitleAbstract, Verdict::Include),
            machine(ScreeningPass::FullText, Verdict::Exclude),
        ];
        assert_eq!(derive_final_status(&decisions), Some(FinalStatus::Excluded));
    }

    #[test]
    fn test_human_overrides_everything() {
        let decisions = [
            machine(ScreeningPass::FullText, Verdict::Exclude),
            ScreeningDecision::human("p1", Verdict::Include, ReasonCategory::HumanJudgement, ""),
            machine(ScreeningPass::TitleAbstract, Verdict::Exclude),
        ];
        assert_eq!(derive_final_status(&decisions), Some(FinalStatus::Included));
    }

    #[test]
    fn test_borderline_is_not_included() {
        let decisions = [machine(ScreeningPass::TitleAbstract, Verdict::Borderline)];
        assert_eq!(derive_final_status(&decisions), Some(FinalStatus::Excluded));
    }

    #[test]
    fn test_actor_serde_labels() {
        assert_eq!(serde_json::to_value(Actor::MachinePass1).unwrap(), "machine-pass-1");
        assert_eq!(serde_json::to_value(Actor::MachinePass2).unwrap(), "machine-pass-2");
        assert_eq!(serde_json::to_value(Actor::Human).unwrap(), "human");
    }

    #[test]
    fn test_reason_category_parse() {
        assert_eq!(ReasonCategory::parse("off topic"), ReasonCategory::OffTopic);
        assert_eq!(ReasonCategory::parse("Wrong-Study-Design"), ReasonCategory::WrongStudyDesign);
        assert_eq!(ReasonCategory::parse("cosmic rays"), ReasonCategory::Other);
    }

    #[test]
    fn test_verdict_parse() {
        assert_eq!(Verdict::parse(" include "), Some(Verdict::Include));
        assert_eq!(Verdict::parse("maybe"), None);
    }
}
