//! Paper deduplication.
//!
//! Records are merged by normalised DOI first, then by fuzzy title match
//! within the same publication year. The richer record survives, missing
//! fields are filled from the absorbed one and provenance is unioned.
//! Passes repeat until nothing merges, so running the deduplicator over its
//! own output is a no-op.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::config::pipeline;
use crate::models::Paper;

/// Rule that matched two records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum MatchRule {
    /// Same normalised DOI.
    Doi,
    /// Same year, title similarity at or above the threshold.
    Title {
        /// Token-set similarity of the normalised titles.
        similarity: f64,
    },
}

/// One merge, for the audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRecord {
    /// Id of the surviving paper after the merge.
    pub canonical_id: String,

    /// Source record ids of the absorbed paper.
    pub absorbed_ids: Vec<String>,

    /// Rule that matched.
    #[serde(flatten)]
    pub rule: MatchRule,
}

/// Result of a deduplication run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    /// Canonical papers in first-appearance order.
    pub papers: Vec<Paper>,

    /// Merges performed, in order.
    pub merges: Vec<MergeRecord>,

    /// Number of input records.
    pub input_count: usize,
}

impl DedupOutcome {
    /// Records removed as duplicates.
    #[must_use]
    pub fn duplicates_removed(&self) -> usize {
        self.input_count.saturating_sub(self.papers.len())
    }
}

/// Normalise a DOI: strip resolver prefixes and `doi:`, trim, lower-case.
#[must_use]
pub fn normalize_doi(doi: &str) -> Option<String> {
    const PREFIXES: [&str; 5] =
        ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "http://dx.doi.org/", "doi:"];

    let mut doi = doi.trim().to_lowercase();
    for prefix in PREFIXES {
        if let Some(rest) = doi.strip_prefix(prefix) {
            doi = rest.trim().to_string();
            break;
        }
    }
    (!doi.is_empty()).then_some(doi)
}

/// Normalise a title: lower-case, punctuation stripped, whitespace collapsed.
#[must_use]
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_tokens(title: &str) -> HashSet<String> {
    normalize_title(title).split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect()
}

#[allow(clippy::cast_precision_loss)]
fn token_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => a.intersection(b).count() as f64 / a.len().max(b.len()) as f64,
    }
}

/// Token-set similarity of two titles: `|A ∩ B| / max(|A|, |B|)` over
/// normalised tokens.
#[must_use]
pub fn token_set_similarity(a: &str, b: &str) -> f64 {
    token_overlap(&title_tokens(a), &title_tokens(b))
}

/// Lookup structure for matching a paper against an existing set.
///
/// Slots are caller-defined positions (index into the caller's vector).
/// Two records that both carry a DOI only match on that DOI; a similar
/// title never merges papers whose DOIs differ.
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    threshold: f64,
    dois: HashMap<String, usize>,
    slots_with_doi: HashSet<usize>,
    titles: HashMap<i32, Vec<(usize, HashSet<String>)>>,
}

impl DedupIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold, dois: HashMap::new(), slots_with_doi: HashSet::new(), titles: HashMap::new() }
    }

    /// Index every paper at its position in `papers`.
    #[must_use]
    pub fn from_papers(threshold: f64, papers: &[Paper]) -> Self {
        let mut index = Self::new(threshold);
        for (slot, paper) in papers.iter().enumerate() {
            index.insert(slot, paper);
        }
        index
    }

    /// Register `paper` under `slot`. An already-indexed DOI keeps its slot.
    pub fn insert(&mut self, slot: usize, paper: &Paper) {
        if let Some(doi) = paper.doi.as_deref().and_then(normalize_doi) {
            self.dois.entry(doi).or_insert(slot);
            self.slots_with_doi.insert(slot);
        }
        if let Some(year) = paper.year {
            self.titles.entry(year).or_default().push((slot, title_tokens(&paper.title)));
        }
    }

    /// Find the slot `paper` duplicates, DOI first.
    #[must_use]
    pub fn find(&self, paper: &Paper) -> Option<(usize, MatchRule)> {
        let doi = paper.doi.as_deref().and_then(normalize_doi);
        if let Some(slot) = doi.as_ref().and_then(|doi| self.dois.get(doi)) {
            return Some((*slot, MatchRule::Doi));
        }

        let year = paper.year?;
        let tokens = title_tokens(&paper.title);
        self.titles
            .get(&year)?
            .iter()
            .filter(|(slot, _)| doi.is_none() || !self.slots_with_doi.contains(slot))
            .map(|(slot, other)| (*slot, token_overlap(&tokens, other)))
            .filter(|(_, similarity)| *similarity >= self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(slot, similarity)| (slot, MatchRule::Title { similarity }))
    }
}

/// Ordering key for "richer metadata": abstract, known full-text flag,
/// author count, citation count.
fn richness(paper: &Paper) -> (bool, bool, usize, i32) {
    (
        paper.has_abstract(),
        paper.full_text_available.is_some(),
        paper.authors.len(),
        paper.citation_count,
    )
}

/// Merge `other` into `survivor`.
///
/// The richer record becomes the survivor (ties keep the existing one);
/// missing fields are filled from the other; provenance is unioned.
pub fn merge_into(survivor: &mut Paper, mut other: Paper) {
    if richness(&other) > richness(survivor) {
        std::mem::swap(survivor, &mut other);
        // Keep first-seen provenance order.
        let mut provenance = std::mem::take(&mut other.provenance);
        for p in std::mem::take(&mut survivor.provenance) {
            if !provenance.contains(&p) {
                provenance.push(p);
            }
        }
        survivor.provenance = provenance;
    } else {
        for p in std::mem::take(&mut other.provenance) {
            if !survivor.provenance.contains(&p) {
                survivor.provenance.push(p);
            }
        }
    }

    if survivor.doi.is_none() {
        survivor.doi = other.doi.take();
    }
    if !survivor.has_abstract() && other.has_abstract() {
        survivor.r#abstract = other.r#abstract;
    }
    if survivor.authors.is_empty() {
        survivor.authors = other.authors;
    }
    survivor.year = survivor.year.or(other.year);
    survivor.venue = survivor.venue.take().or(other.venue);
    survivor.citation_count = survivor.citation_count.max(other.citation_count);
    survivor.embedding = survivor.embedding.take().or(other.embedding);
    survivor.full_text_available = match (survivor.full_text_available, other.full_text_available) {
        (Some(a), Some(b)) => Some(a || b),
        (a, b) => a.or(b),
    };
    survivor.open_access_url = survivor.open_access_url.take().or(other.open_access_url);
    survivor.summary = survivor.summary.take().or(other.summary);
    survivor.snowball_round = match (survivor.snowball_round, other.snowball_round) {
        (Some(a), Some(b)) => Some(a.min(b)),
        _ => None,
    };
}

/// Union `other`'s provenance into `target` without changing `target`'s id.
///
/// Used when a late arrival matches a paper that already carries decisions.
pub fn absorb_provenance(target: &mut Paper, other: &Paper) {
    for p in &other.provenance {
        if !target.provenance.contains(p) {
            target.provenance.push(p.clone());
        }
    }
}

/// Merges paper records into a canonical set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deduplicator {
    threshold: f64,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(pipeline::SIMILARITY_THRESHOLD)
    }
}

impl Deduplicator {
    /// Create a deduplicator with the given title similarity threshold.
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Title similarity threshold.
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Deduplicate `papers`.
    #[must_use]
    pub fn deduplicate(&self, papers: impl IntoIterator<Item = Paper>) -> DedupOutcome {
        let mut current: Vec<Paper> = papers.into_iter().collect();
        let input_count = current.len();
        let mut merges = Vec::new();

        loop {
            let before = merges.len();
            current = self.pass(current, &mut merges);
            if merges.len() == before {
                break;
            }
        }

        tracing::info!(
            input = input_count,
            output = current.len(),
            merges = merges.len(),
            "Deduplication complete"
        );
        DedupOutcome { papers: current, merges, input_count }
    }

    fn pass(&self, papers: Vec<Paper>, merges: &mut Vec<MergeRecord>) -> Vec<Paper> {
        let mut index = DedupIndex::new(self.threshold);
        let mut out: Vec<Paper> = Vec::with_capacity(papers.len());

        for paper in papers {
            match index.find(&paper) {
                Some((slot, rule)) => {
                    let absorbed_ids: Vec<String> =
                        paper.provenance.iter().map(|p| p.record_id.clone()).collect();
                    // Index the absorbed record's DOI and title too.
                    index.insert(slot, &paper);
                    merge_into(&mut out[slot], paper);
                    let canonical_id = out[slot].id.clone();
                    tracing::debug!(
                        canonical = %canonical_id,
                        absorbed = ?absorbed_ids,
                        rule = ?rule,
                        "Merged duplicate"
                    );
                    merges.push(MergeRecord { canonical_id, absorbed_ids, rule });
                }
                None => {
                    index.insert(out.len(), &paper);
                    out.push(paper);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthorRef, Provenance, RawPaperRecord, Source};

    fn paper(id: &str, doi: Option<&str>, title: &str, year: Option<i32>) -> Paper {
        Paper::from_raw(
            RawPaperRecord {
                id: id.to_string(),
                source: Some(Source::OpenAlex),
                doi: doi.map(str::to_string),
                title: Some(title.to_string()),
                year,
                ..Default::default()
            },
            Source::OpenAlex,
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_doi() {
        assert_eq!(normalize_doi("https://doi.org/10.1/ABC"), Some("10.1/abc".to_string()));
        assert_eq!(normalize_doi("http://dx.doi.org/10.1/abc"), Some("10.1/abc".to_string()));
        assert_eq!(normalize_doi(" DOI:10.1/Abc "), Some("10.1/abc".to_string()));
        assert_eq!(normalize_doi("  "), None);
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("  Deep   Learning: for X!  "), "deep learning for x");
    }

    #[test]
    fn test_similarity() {
        assert!((token_set_similarity("Deep Learning for X", "deep learning for x") - 1.0).abs() < 1e-9);
        assert!((token_set_similarity("Deep Learning for X", "Deep Learning for Y") - 0.75).abs() < 1e-9);
        assert!((token_set_similarity("", "") - 1.0).abs() < 1e-9);
        assert!(token_set_similarity("", "a").abs() < 1e-9);
    }

    #[test]
    fn test_doi_case_insensitive_merge() {
        let outcome = Deduplicator::default().deduplicate(vec![
            paper("a", Some("10.1/ABC"), "Some title", Some(2020)),
            paper("b", Some("10.1/abc"), "Entirely different wording", Some(2021)),
        ]);
        assert_eq!(outcome.papers.len(), 1);
        assert_eq!(outcome.merges.len(), 1);
        assert_eq!(outcome.merges[0].rule, MatchRule::Doi);
        assert_eq!(outcome.papers[0].provenance.len(), 2);
        assert_eq!(outcome.duplicates_removed(), 1);
    }

    #[test]
    fn test_fuzzy_title_merge() {
        let outcome = Deduplicator::default().deduplicate(vec![
            paper("a", None, "Deep Learning for X", Some(2021)),
            paper("b", None, "deep learning for x", Some(2021)),
            paper("c", None, "Deep Learning for Y", Some(2021)),
        ]);
        assert_eq!(outcome.papers.len(), 2);
        assert_eq!(outcome.papers[0].id, "a");
        assert_eq!(outcome.papers[1].id, "c");
    }

    #[test]
    fn test_fuzzy_requires_same_year() {
        let outcome = Deduplicator::default().deduplicate(vec![
            paper("a", None, "Deep Learning for X", Some(2021)),
            paper("b", None, "Deep Learning for X", Some(2022)),
            paper("c", None, "Deep Learning for X", None),
        ]);
        assert_eq!(outcome.papers.len(), 3);
    }

    #[test]
    fn test_conflicting_dois_never_title_merge() {
        let outcome = Deduplicator::default().deduplicate(vec![
            paper("a", Some("10.1/preprint"), "Deep Learning for X", Some(2021)),
            paper("b", Some("10.1/journal"), "Deep learning for X", Some(2021)),
            paper("c", None, "deep learning for x", Some(2021)),
        ]);
        assert_eq!(outcome.papers.len(), 2);
        assert_eq!(outcome.papers[0].doi.as_deref(), Some("10.1/preprint"));
        assert_eq!(outcome.papers[1].doi.as_deref(), Some("10.1/journal"));

        // A record without a DOI still folds into the first match.
        let ids: Vec<&str> =
            outcome.papers[0].provenance.iter().map(|p| p.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_richer_record_survives_and_fills() {
        let mut thin = paper("thin", Some("10.1/x"), "Title", Some(2020));
        thin.venue = Some("Journal".to_string());
        let mut rich = paper("rich", Some("10.1/X"), "Title", None);
        rich.r#abstract = Some("An abstract.".to_string());
        rich.authors = vec![AuthorRef::named("Ada")];

        let outcome = Deduplicator::default().deduplicate(vec![thin, rich]);
        let merged = &outcome.papers[0];
        assert_eq!(merged.id, "rich");
        assert_eq!(merged.year, Some(2020));
        assert_eq!(merged.venue.as_deref(), Some("Journal"));
        assert_eq!(
            merged.provenance,
            vec![
                Provenance { source: Source::OpenAlex, record_id: "thin".to_string() },
                Provenance { source: Source::OpenAlex, record_id: "rich".to_string() },
            ]
        );
        assert_eq!(outcome.merges[0].canonical_id, "rich");
    }

    #[test]
    fn test_transitive_merge_is_idempotent() {
        // c is richer than b, so b's surviving title becomes a's title and
        // the second pass folds it into a.
        let mut c = paper("c", Some("10.1/D"), "Sleep and memory consolidation", Some(2020));
        c.r#abstract = Some("Abstract.".to_string());
        let input = vec![
            paper("a", None, "Sleep and memory consolidation", Some(2020)),
            paper("b", Some("10.1/d"), "Unrelated looking title here", Some(2020)),
            c,
        ];
        let dedup = Deduplicator::default();
        let once = dedup.deduplicate(input);
        assert_eq!(once.papers.len(), 1);
        assert_eq!(once.papers[0].id, "c");
        let ids: Vec<&str> =
            once.papers[0].provenance.iter().map(|p| p.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let twice = dedup.deduplicate(once.papers.clone());
        assert_eq!(twice.papers, once.papers);
        assert!(twice.merges.is_empty());
    }

    #[test]
    fn test_index_finds_existing() {
        let existing = vec![paper("a", Some("10.1/a"), "Alpha beta gamma", Some(2020))];
        let index = DedupIndex::from_papers(0.9, &existing);
        assert_eq!(index.find(&paper("z", Some("doi:10.1/A"), "x", None)), Some((0, MatchRule::Doi)));
        assert!(matches!(
            index.find(&paper("y", None, "alpha, beta gamma", Some(2020))),
            Some((0, MatchRule::Title { .. }))
        ));
        assert_eq!(index.find(&paper("w", None, "alpha beta gamma", Some(2019))), None);
    }
}
