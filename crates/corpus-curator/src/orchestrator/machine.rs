//! Stage transition table.
//!
//! [`transition`] is a pure function of the current stage, the event and the
//! guard; it never mutates anything.

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Nothing started.
    Idle,
    /// Generating search queries.
    QueryFormulation,
    /// Waiting for the user to approve the queries.
    QueryApproval,
    /// Running searches.
    Searching,
    /// Merging duplicate records.
    Deduplication,
    /// Title/abstract screening and snowballing.
    #[serde(rename = "SCREENING_PASS_1")]
    ScreeningPass1,
    /// Waiting for human decisions on BORDERLINE papers.
    HitlReview,
    /// Full-text screening.
    #[serde(rename = "SCREENING_PASS_2")]
    ScreeningPass2,
    /// Quality scoring.
    QualityAssessment,
    /// Clustering and narratives.
    Synthesis,
    /// Done.
    Complete,
}

impl Stage {
    /// Every stage in order.
    pub const ALL: [Self; 11] = [
        Self::Idle,
        Self::QueryFormulation,
        Self::QueryApproval,
        Self::Searching,
        Self::Deduplication,
        Self::ScreeningPass1,
        Self::HitlReview,
        Self::ScreeningPass2,
        Self::QualityAssessment,
        Self::Synthesis,
        Self::Complete,
    ];

    /// The stage after this one, `None` for [`Stage::Complete`].
    #[must_use]
    pub fn next(self) -> Option<Self> {
        let position = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(position + 1).copied()
    }

    /// SCREAMING_SNAKE_CASE name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::QueryFormulation => "QUERY_FORMULATION",
            Self::QueryApproval => "QUERY_APPROVAL",
            Self::Searching => "SEARCHING",
            Self::Deduplication => "DEDUPLICATION",
            Self::ScreeningPass1 => "SCREENING_PASS_1",
            Self::HitlReview => "HITL_REVIEW",
            Self::ScreeningPass2 => "SCREENING_PASS_2",
            Self::QualityAssessment => "QUALITY_ASSESSMENT",
            Self::Synthesis => "SYNTHESIS",
            Self::Complete => "COMPLETE",
        }
    }

    /// Stages that wait on the user rather than doing work.
    #[must_use]
    pub const fn is_pause(self) -> bool {
        matches!(self, Self::QueryApproval | Self::HitlReview)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Begin a review.
    Start,
    /// Queries are ready for approval.
    QueriesFormulated,
    /// The user approved the queries.
    QueriesApproved,
    /// All searches finished.
    SearchCompleted,
    /// Deduplication finished.
    DeduplicationCompleted,
    /// Pass 1 (and snowballing) finished.
    Pass1Completed,
    /// Every queued paper has a human decision.
    HumanReviewCompleted,
    /// Pass 2 finished.
    Pass2Completed,
    /// Quality scores recorded.
    QualityAssessed,
    /// Synthesis finished.
    SynthesisCompleted,
    /// User-requested return to pass 1.
    Rescreen,
}

/// Conditions a transition may depend on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Guard {
    /// Human review enabled for this review.
    pub hitl_enabled: bool,

    /// Papers waiting for a human decision.
    pub borderline_pending: usize,

    /// The current stage has finalised its counts.
    pub stage_complete: bool,
}

/// An accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    /// Stage left.
    pub from: Stage,

    /// Stage entered.
    pub to: Stage,

    /// Stage passed over, if any.
    pub skipped: Option<Stage>,
}

impl Transition {
    const fn to(from: Stage, to: Stage) -> Self {
        Self { from, to, skipped: None }
    }
}

/// Compute the transition for `event` in `stage`.
///
/// # Errors
///
/// [`StateError::InvalidTransition`] when no row of the table matches,
/// [`StateError::GuardFailed`] when a row matches but its guard does not hold.
pub fn transition(stage: Stage, event: Event, guard: &Guard) -> Result<Transition, StateError> {
    use Event as E;
    use Stage as S;

    let guard_failed = |reason: &str| StateError::GuardFailed {
        stage,
        event,
        reason: reason.to_string(),
    };

    if event == E::Rescreen {
        return if stage > S::ScreeningPass1 {
            Ok(Transition::to(stage, S::ScreeningPass1))
        } else {
            Err(StateError::InvalidTransition { from: stage, event })
        };
    }

    let target = match (stage, event) {
        (S::Idle, E::Start) => S::QueryFormulation,
        (S::QueryFormulation, E::QueriesFormulated) => S::QueryApproval,
        (S::QueryApproval, E::QueriesApproved) => S::Searching,
        (S::Searching, E::SearchCompleted) => S::Deduplication,
        (S::Deduplication, E::DeduplicationCompleted) => S::ScreeningPass1,
        (S::ScreeningPass1, E::Pass1Completed) => S::HitlReview,
        (S::HitlReview, E::HumanReviewCompleted) => S::ScreeningPass2,
        (S::ScreeningPass2, E::Pass2Completed) => S::QualityAssessment,
        (S::QualityAssessment, E::QualityAssessed) => S::Synthesis,
        (S::Synthesis, E::SynthesisCompleted) => S::Complete,
        _ => return Err(StateError::InvalidTransition { from: stage, event }),
    };

    if !stage.is_pause() && stage != S::Idle && !guard.stage_complete {
        return Err(guard_failed("stage counts are not finalised"));
    }

    match target {
        S::HitlReview if !guard.hitl_enabled || guard.borderline_pending == 0 => Ok(Transition {
            from: stage,
            to: S::ScreeningPass2,
            skipped: Some(S::HitlReview),
        }),
        S::ScreeningPass2 if stage == S::HitlReview && guard.borderline_pending > 0 => Err(
            guard_failed(&format!("{} papers still await a human decision", guard.borderline_pending)),
        ),
        _ => Ok(Transition::to(stage, target)),
    }
}
