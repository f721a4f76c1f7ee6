//! Review configuration supplied by the user.

use serde::{Deserialize, Serialize};

use super::SnowballDirection;
use crate::config::pipeline;
use crate::error::{PipelineError, PipelineResult};

/// Screening strictness, 1 (inclusive) to 5 (very selective).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Strictness(u8);

impl Strictness {
    /// Most inclusive level.
    pub const MIN: u8 = 1;

    /// Most selective level.
    pub const MAX: u8 = 5;

    /// Create a strictness level, rejecting values outside 1..=5.
    ///
    /// # Errors
    ///
    /// Returns a validation error for out-of-range levels.
    pub fn new(level: u8) -> PipelineResult<Self> {
        if (Self::MIN..=Self::MAX).contains(&level) {
            Ok(Self(level))
        } else {
            Err(PipelineError::validation(
                "strictness",
                format!("must be between {} and {}, got {level}", Self::MIN, Self::MAX),
            ))
        }
    }

    /// Numeric level.
    #[must_use]
    pub const fn level(self) -> u8 {
        self.0
    }

    /// Minimum confidence for a machine INCLUDE to stand.
    ///
    /// Below it the verdict is demoted to BORDERLINE. Rises with strictness:
    /// 1 → 50, 3 → 70, 5 → 90.
    #[must_use]
    pub const fn include_threshold(self) -> u8 {
        40 + self.0 * 10
    }
}

impl Default for Strictness {
    fn default() -> Self {
        Self(pipeline::STRICTNESS)
    }
}

/// User-supplied constraints and thresholds for one review.
///
/// Immutable once the orchestrator is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewConfig {
    /// Natural-language research question.
    pub research_question: String,

    /// Free-text inclusion criteria.
    #[serde(default)]
    pub inclusion_criteria: String,

    /// Free-text exclusion criteria.
    #[serde(default)]
    pub exclusion_criteria: String,

    /// Kind of review (systematic review, scoping review, ...).
    #[serde(default = "default_review_type")]
    pub review_type: String,

    /// Minimum publication year (inclusive).
    #[serde(default)]
    pub year_min: Option<i32>,

    /// Maximum publication year (inclusive).
    #[serde(default)]
    pub year_max: Option<i32>,

    /// Screening strictness.
    #[serde(default)]
    pub strictness: Strictness,

    /// Target number of included papers.
    #[serde(default = "default_target_corpus_size")]
    pub target_corpus_size: usize,

    /// Maximum snowball rounds (0 disables snowballing).
    #[serde(default = "default_max_snowball_rounds")]
    pub max_snowball_rounds: u32,

    /// Snowball stops when a round's yield rate drops below this.
    #[serde(default = "default_yield_floor")]
    pub yield_floor: f64,

    /// Hard cap on candidates per snowball round.
    #[serde(default = "default_max_candidates")]
    pub max_candidates_per_round: usize,

    /// Citation direction for snowballing.
    #[serde(default)]
    pub snowball_direction: SnowballDirection,

    /// Route BORDERLINE verdicts to a human reviewer.
    #[serde(default = "default_true")]
    pub hitl_enabled: bool,

    /// Papers per classification call (1..=10).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Title similarity at which DOI-less records merge.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

fn default_review_type() -> String {
    "systematic review".to_string()
}

fn default_target_corpus_size() -> usize {
    pipeline::TARGET_CORPUS_SIZE
}

fn default_max_snowball_rounds() -> u32 {
    pipeline::MAX_SNOWBALL_ROUNDS
}

fn default_yield_floor() -> f64 {
    pipeline::YIELD_FLOOR
}

fn default_max_candidates() -> usize {
    pipeline::MAX_CANDIDATES_PER_ROUND
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    pipeline::BATCH_SIZE
}

fn default_similarity_threshold() -> f64 {
    pipeline::SIMILARITY_THRESHOLD
}

impl ReviewConfig {
    /// Review config with defaults for everything but the question.
    #[must_use]
    pub fn new(research_question: impl Into<String>) -> Self {
        Self {
            research_question: research_question.into(),
            inclusion_criteria: String::new(),
            exclusion_criteria: String::new(),
            review_type: default_review_type(),
            year_min: None,
            year_max: None,
            strictness: Strictness::default(),
            target_corpus_size: default_target_corpus_size(),
            max_snowball_rounds: default_max_snowball_rounds(),
            yield_floor: default_yield_floor(),
            max_candidates_per_round: default_max_candidates(),
            snowball_direction: SnowballDirection::default(),
            hitl_enabled: true,
            batch_size: default_batch_size(),
            similarity_threshold: default_similarity_threshold(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first field that fails validation.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.research_question.trim().is_empty() {
            return Err(PipelineError::validation("researchQuestion", "cannot be empty"));
        }
        if let (Some(min), Some(max)) = (self.year_min, self.year_max) {
            if min > max {
                return Err(PipelineError::validation(
                    "yearMin",
                    format!("{min} is after yearMax {max}"),
                ));
            }
        }
        Strictness::new(self.strictness.level())?;
        if self.target_corpus_size == 0 {
            return Err(PipelineError::validation("targetCorpusSize", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.yield_floor) {
            return Err(PipelineError::validation("yieldFloor", "must be within [0, 1]"));
        }
        if self.batch_size == 0 || self.batch_size > pipeline::MAX_BATCH_SIZE {
            return Err(PipelineError::validation(
                "batchSize",
                format!("must be between 1 and {}", pipeline::MAX_BATCH_SIZE),
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) || self.similarity_threshold == 0.0 {
            return Err(PipelineError::validation("similarityThreshold", "must be within (0, 1]"));
        }
        if self.max_candidates_per_round == 0 {
            return Err(PipelineError::validation("maxCandidatesPerRound", "must be positive"));
        }
        Ok(())
    }

    /// Year range as `(min, max)`.
    #[must_use]
    pub const fn year_range(&self) -> (Option<i32>, Option<i32>) {
        (self.year_min, self.year_max)
    }
}
