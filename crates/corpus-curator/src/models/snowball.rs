//! Snowball round records and stop reasons.

use serde::{Deserialize, Serialize};

use super::SnowballDirection;

/// Why a snowball run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A round produced more candidates than the hard cap.
    CandidateCapExceeded,
    /// `round >= max_rounds`.
    MaxRoundsReached,
    /// The round included nothing new.
    NoNewInclusions,
    /// Yield rate fell below the floor.
    YieldBelowFloor,
    /// Included total reached 1.5x the target corpus size.
    TargetCorpusReached,
    /// No included paper to expand from.
    NoSeeds,
}

impl StopReason {
    /// Human-readable description.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::CandidateCapExceeded => "candidate cap exceeded",
            Self::MaxRoundsReached => "round >= max_rounds",
            Self::NoNewInclusions => "no new inclusions",
            Self::YieldBelowFloor => "yield rate below floor",
            Self::TargetCorpusReached => "target corpus size reached",
            Self::NoSeeds => "no included seed papers",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// One snowball iteration. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnowballRound {
    /// Round number, starting at 1.
    pub round: u32,

    /// Traversal direction.
    pub direction: SnowballDirection,

    /// Unseen candidates found this round.
    pub candidates: usize,

    /// Candidates whose final status is INCLUDED.
    pub new_inclusions: usize,

    /// `new_inclusions / candidates`, 0 when there were no candidates.
    pub yield_rate: f64,

    /// Set on the round that terminated the run.
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
}

impl SnowballRound {
    /// Create a round record without a stop reason.
    #[must_use]
    pub fn new(
        round: u32,
        direction: SnowballDirection,
        candidates: usize,
        new_inclusions: usize,
    ) -> Self {
        Self {
            round,
            direction,
            candidates,
            new_inclusions,
            yield_rate: yield_rate(new_inclusions, candidates),
            stop_reason: None,
        }
    }
}

/// Fraction of candidates included, 0 for an empty round.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn yield_rate(included: usize, candidates: usize) -> f64 {
    if candidates == 0 { 0.0 } else { included as f64 / candidates as f64 }
}
