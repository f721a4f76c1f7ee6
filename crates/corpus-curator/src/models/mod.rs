//! Data models for papers, decisions and review settings.
//!
//! All models use `#[serde(default)]` for optional fields and
//! `#[serde(rename_all = "camelCase")]` for persisted and exported shapes.

mod decision;
mod enums;
mod paper;
mod query;
mod review;
mod snowball;
mod synthesis;

pub use decision::{
    Actor, FinalStatus, ReasonCategory, ScreeningDecision, ScreeningPass, Verdict,
    derive_final_status,
};
pub use enums::{ResponseFormat, SnowballDirection};
pub use paper::{
    AuthorRef, DocumentType, Paper, Provenance, RawPaperRecord, Source, truncate_chars,
};
pub use query::{QueryPlan, SearchQuery};
pub use review::{ReviewConfig, Strictness};
pub use snowball::{SnowballRound, StopReason, yield_rate};
pub use synthesis::{
    ClusterNarrative, ClusterSummary, OverallSynthesis, QualityAssessment, QualityFlag,
    SynthesisReport,
};
