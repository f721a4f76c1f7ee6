//! Canonical pipeline state and the audit log.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::machine::{Event, Stage, Transition};
use crate::models::{ReasonCategory, Source};

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Position in the log, starting at 0.
    pub sequence: usize,

    /// Stage the entry was written in.
    pub stage: Stage,

    /// Human-readable message.
    pub message: String,

    /// Structured detail.
    pub detail: Value,

    /// When it was written.
    pub timestamp: DateTime<Utc>,
}

/// When a stage was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEntry {
    /// Stage entered.
    pub stage: Stage,

    /// Entry time.
    pub entered_at: DateTime<Utc>,
}

/// Counts for the PRISMA flow diagram.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowCounts {
    /// Records identified per source.
    pub identified: BTreeMap<Source, usize>,

    /// Papers added by snowballing.
    pub identified_snowball: usize,

    /// Records merged away by deduplication.
    pub duplicates_removed: usize,

    /// Canonical papers after deduplication.
    pub after_dedup: usize,

    /// Papers screened on title and abstract.
    pub screened: usize,

    /// Papers excluded by pass 1.
    pub excluded_pass1: usize,

    /// Pass 1 exclusions by reason.
    pub excluded_pass1_reasons: BTreeMap<ReasonCategory, usize>,

    /// Papers with a human decision (deferrals excluded).
    pub human_reviewed: usize,

    /// Human decisions that excluded.
    pub human_excluded: usize,

    /// Papers deferred without review.
    pub deferred: usize,

    /// Papers screened in pass 2.
    pub full_text_assessed: usize,

    /// Pass 2 papers screened without full text.
    pub full_text_unavailable: usize,

    /// Papers excluded by pass 2.
    pub excluded_pass2: usize,

    /// Pass 2 exclusions by reason.
    pub excluded_pass2_reasons: BTreeMap<ReasonCategory, usize>,

    /// Papers still without a decision.
    pub unresolved: usize,

    /// Papers in the final corpus.
    pub included: usize,
}

impl FlowCounts {
    /// Records identified across all search sources.
    #[must_use]
    pub fn identified_total(&self) -> usize {
        self.identified.values().sum()
    }
}

/// Single source of truth for one review session.
///
/// Only the orchestrator mutates it; everything else reads snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    session_id: Uuid,
    stage: Stage,
    completed: BTreeSet<Stage>,
    counts: FlowCounts,
    transitions: Vec<StageEntry>,
    audit: Vec<AuditEntry>,
}

impl PipelineState {
    /// Fresh state in [`Stage::Idle`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            stage: Stage::Idle,
            completed: BTreeSet::new(),
            counts: FlowCounts::default(),
            transitions: vec![StageEntry { stage: Stage::Idle, entered_at: Utc::now() }],
            audit: Vec::new(),
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Current stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Returns true if `stage` has been completed (and not re-opened).
    #[must_use]
    pub fn is_completed(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }

    /// Flow diagram counts.
    #[must_use]
    pub const fn counts(&self) -> &FlowCounts {
        &self.counts
    }

    /// Stage entry times, oldest first.
    #[must_use]
    pub fn transitions(&self) -> &[StageEntry] {
        &self.transitions
    }

    /// Audit log, oldest first.
    #[must_use]
    pub fn audit_log(&self) -> &[AuditEntry] {
        &self.audit
    }

    pub(super) fn counts_mut(&mut self) -> &mut FlowCounts {
        &mut self.counts
    }

    /// Append an audit entry in the current stage.
    pub(super) fn record(&mut self, message: impl Into<String>, detail: Value) {
        let entry = AuditEntry {
            sequence: self.audit.len(),
            stage: self.stage,
            message: message.into(),
            detail,
            timestamp: Utc::now(),
        };
        tracing::info!(stage = %entry.stage, seq = entry.sequence, detail = %entry.detail, "{}", entry.message);
        self.audit.push(entry);
    }

    /// Apply an accepted transition and write its single audit entry.
    pub(super) fn apply(&mut self, transition: Transition, event: Event) {
        let now = Utc::now();
        if event == Event::Rescreen {
            self.completed.retain(|s| *s < Stage::ScreeningPass1);
        } else {
            self.completed.insert(transition.from);
            if let Some(skipped) = transition.skipped {
                self.completed.insert(skipped);
            }
        }
        self.stage = transition.to;
        self.transitions.push(StageEntry { stage: transition.to, entered_at: now });

        let message = match transition.skipped {
            Some(skipped) => format!("{} -> {} ({skipped} skipped)", transition.from, transition.to),
            None => format!("{} -> {}", transition.from, transition.to),
        };
        self.record(
            message,
            serde_json::json!({
                "event": event,
                "from": transition.from,
                "to": transition.to,
                "skipped": transition.skipped,
            }),
        );
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}
