//! In-memory papers table with per-paper scores and placements.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::{FinalStatus, Paper, QualityAssessment, ScreeningDecision};
use crate::screening::DecisionLog;
use crate::synthesis::Placement;

/// One paper of the final corpus, ready for export.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorpusEntry {
    /// Canonical paper.
    pub paper: Paper,

    /// Derived final status.
    pub final_status: Option<FinalStatus>,

    /// Decision history, machine pass 1 first.
    pub decisions: Vec<ScreeningDecision>,

    /// Quality assessment.
    pub quality: Option<QualityAssessment>,

    /// Relevance to the research question, 0-100.
    pub relevance_score: Option<f64>,

    /// Cluster id.
    pub cluster_id: Option<u32>,

    /// Cluster label.
    pub cluster_label: Option<String>,

    /// 2D coordinates from the projection.
    pub coordinates: Option<(f32, f32)>,
}

/// Papers keyed by canonical id, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    papers: Vec<Paper>,
    quality: HashMap<String, QualityAssessment>,
    placements: HashMap<String, Placement>,
}

impl Corpus {
    /// Create an empty corpus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every paper, e.g. with the deduplicated set.
    pub fn replace(&mut self, papers: Vec<Paper>) {
        self.papers = papers;
    }

    /// All papers.
    #[must_use]
    pub fn papers(&self) -> &[Paper] {
        &self.papers
    }

    /// Mutable paper table, for stages that append papers.
    pub fn papers_mut(&mut self) -> &mut Vec<Paper> {
        &mut self.papers
    }

    /// Look up a paper by canonical id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Paper> {
        self.papers.iter().find(|p| p.id == id)
    }

    /// Number of papers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.papers.len()
    }

    /// Returns true if the corpus holds no papers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.papers.is_empty()
    }

    /// Papers whose final status is INCLUDED.
    #[must_use]
    pub fn included(&self, log: &DecisionLog) -> Vec<Paper> {
        self.papers
            .iter()
            .filter(|p| log.final_status(&p.id) == Some(FinalStatus::Included))
            .cloned()
            .collect()
    }

    /// Record a quality assessment.
    pub fn set_quality(&mut self, id: impl Into<String>, assessment: QualityAssessment) {
        self.quality.insert(id.into(), assessment);
    }

    /// Quality assessment for a paper.
    #[must_use]
    pub fn quality(&self, id: &str) -> Option<&QualityAssessment> {
        self.quality.get(id)
    }

    /// Record where synthesis placed a paper.
    pub fn set_placement(&mut self, id: impl Into<String>, placement: Placement) {
        self.placements.insert(id.into(), placement);
    }

    /// Placement for a paper.
    #[must_use]
    pub fn placement(&self, id: &str) -> Option<&Placement> {
        self.placements.get(id)
    }

    /// Store embeddings computed during synthesis.
    pub fn apply_embeddings(&mut self, mut embeddings: HashMap<String, Vec<f32>>) {
        for paper in &mut self.papers {
            if let Some(vector) = embeddings.remove(&paper.id) {
                paper.embedding = Some(vector);
            }
        }
    }

    /// Drop synthesis and quality results ahead of a re-screen.
    pub fn clear_derived(&mut self) {
        self.quality.clear();
        self.placements.clear();
    }

    /// Export rows for the included papers.
    #[must_use]
    pub fn entries(&self, log: &DecisionLog) -> Vec<CorpusEntry> {
        self.papers
            .iter()
            .filter(|p| log.final_status(&p.id) == Some(FinalStatus::Included))
            .map(|paper| {
                let placement = self.placements.get(&paper.id);
                CorpusEntry {
                    paper: paper.clone(),
                    final_status: log.final_status(&paper.id),
                    decisions: log.for_paper(&paper.id).cloned().collect(),
                    quality: self.quality.get(&paper.id).cloned(),
                    relevance_score: placement.map(|p| p.relevance_score),
                    cluster_id: placement.and_then(|p| p.cluster_id),
                    cluster_label: placement.and_then(|p| p.cluster_label.clone()),
                    coordinates: placement.and_then(|p| p.coordinates),
                }
            })
            .collect()
    }
}
