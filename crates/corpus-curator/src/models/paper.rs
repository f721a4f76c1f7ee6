//! Paper records: raw source records and canonical papers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// External system a record was retrieved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// OpenAlex works API.
    #[serde(rename = "openalex")]
    OpenAlex,
    /// Semantic Scholar Graph API.
    SemanticScholar,
}

impl Source {
    /// Stable name used in logs and audit details.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAlex => "openalex",
            Self::SemanticScholar => "semantic_scholar",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publication type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    /// Journal article.
    #[default]
    Article,
    /// Review article.
    Review,
    /// Preprint.
    Preprint,
    /// Conference paper.
    ConferencePaper,
    /// Book chapter.
    BookChapter,
    /// Anything else.
    Other,
}

impl DocumentType {
    /// Map a source-specific type label.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "article" | "journalarticle" | "journal_article" => Self::Article,
            "review" => Self::Review,
            "preprint" | "posted_content" => Self::Preprint,
            "conference" | "conference_paper" | "proceedings_article" => Self::ConferencePaper,
            "book_chapter" | "bookchapter" => Self::BookChapter,
            _ => Self::Other,
        }
    }
}

/// Author reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRef {
    /// Display name.
    pub name: String,

    /// ORCID iD, when the source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orcid: Option<String>,
}

impl AuthorRef {
    /// Author without ORCID.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), orcid: None }
    }
}

/// Where one source record behind a canonical paper came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Origin system.
    pub source: Source,

    /// The record's identifier in that system.
    pub record_id: String,
}

/// A paper record as returned by a search source or the citation graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPaperRecord {
    /// Identifier within the source.
    pub id: String,

    /// Source the record came from.
    pub source: Option<Source>,

    /// DOI, any format.
    #[serde(default)]
    pub doi: Option<String>,

    /// Title.
    #[serde(default)]
    pub title: Option<String>,

    /// Plain-text abstract.
    #[serde(default)]
    pub r#abstract: Option<String>,

    /// Authors in order.
    #[serde(default)]
    pub authors: Vec<AuthorRef>,

    /// Publication year.
    #[serde(default)]
    pub year: Option<i32>,

    /// Journal or conference.
    #[serde(default)]
    pub venue: Option<String>,

    /// Citation count.
    #[serde(default)]
    pub citation_count: Option<i32>,

    /// Source type label.
    #[serde(default)]
    pub document_type: Option<String>,

    /// Open-access full text known to exist.
    #[serde(default)]
    pub full_text_available: Option<bool>,

    /// Open-access location.
    #[serde(default)]
    pub open_access_url: Option<String>,

    /// Short third-party summary (e.g. TLDR).
    #[serde(default)]
    pub summary: Option<String>,

    /// Embedding vector, if the source ships one.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,

    /// Query that surfaced the record.
    #[serde(default)]
    pub query_source: Option<String>,
}

/// Canonical paper within a review session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paper {
    /// Stable identifier, unique within the session.
    pub id: String,

    /// DOI as provided by the surviving record.
    #[serde(default)]
    pub doi: Option<String>,

    /// Title.
    pub title: String,

    /// Plain-text abstract.
    #[serde(default)]
    pub r#abstract: Option<String>,

    /// Authors in order.
    #[serde(default)]
    pub authors: Vec<AuthorRef>,

    /// Publication year.
    #[serde(default)]
    pub year: Option<i32>,

    /// Journal or conference.
    #[serde(default)]
    pub venue: Option<String>,

    /// Every source record merged into this paper.
    pub provenance: Vec<Provenance>,

    /// Citation count.
    #[serde(default)]
    pub citation_count: i32,

    /// Publication type.
    #[serde(default)]
    pub document_type: DocumentType,

    /// Embedding vector.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,

    /// Open-access full text known to exist (`None` = unknown).
    #[serde(default)]
    pub full_text_available: Option<bool>,

    /// Open-access location.
    #[serde(default)]
    pub open_access_url: Option<String>,

    /// Short third-party summary.
    #[serde(default)]
    pub summary: Option<String>,

    /// Snowball round that discovered the paper (`None` = database search).
    #[serde(default)]
    pub snowball_round: Option<u32>,
}

impl Paper {
    /// Build a canonical paper from a raw record.
    ///
    /// Records without a title are unusable for screening and yield `None`.
    #[must_use]
    pub fn from_raw(raw: RawPaperRecord, fallback_source: Source) -> Option<Self> {
        let title = raw.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())?;
        let source = raw.source.unwrap_or(fallback_source);
        Some(Self {
            provenance: vec![Provenance { source, record_id: raw.id.clone() }],
            id: raw.id,
            doi: raw.doi.filter(|d| !d.trim().is_empty()),
            title,
            r#abstract: raw.r#abstract.filter(|a| !a.trim().is_empty()),
            authors: raw.authors,
            year: raw.year,
            venue: raw.venue.filter(|v| !v.is_empty()),
            citation_count: raw.citation_count.unwrap_or(0),
            document_type: raw
                .document_type
                .as_deref()
                .map(DocumentType::from_label)
                .unwrap_or_default(),
            embedding: raw.embedding.filter(|v| !v.is_empty()),
            full_text_available: raw.full_text_available,
            open_access_url: raw.open_access_url,
            summary: raw.summary.filter(|s| !s.is_empty()),
            snowball_round: None,
        })
    }

    /// Get the abstract if present and non-empty.
    #[must_use]
    pub fn abstract_text(&self) -> Option<&str> {
        self.r#abstract.as_deref().filter(|a| !a.trim().is_empty())
    }

    /// Check if this paper has an abstract.
    #[must_use]
    pub fn has_abstract(&self) -> bool {
        self.abstract_text().is_some()
    }

    /// Origin systems, deduplicated.
    #[must_use]
    pub fn sources(&self) -> BTreeSet<Source> {
        self.provenance.iter().map(|p| p.source).collect()
    }

    /// Record id this paper carries for `source`, if any.
    #[must_use]
    pub fn record_id_for(&self, source: Source) -> Option<&str> {
        self.provenance.iter().find(|p| p.source == source).map(|p| p.record_id.as_str())
    }

    /// Get the first author's name if available.
    #[must_use]
    pub fn first_author(&self) -> Option<&str> {
        self.authors.first().map(|a| a.name.as_str())
    }

    /// Get author names as a comma-separated string.
    #[must_use]
    pub fn author_names(&self) -> String {
        self.authors.iter().map(|a| a.name.as_str()).collect::<Vec<_>>().join(", ")
    }

    /// Title followed by a truncated abstract, as sent to embedding and
    /// narrative capabilities.
    #[must_use]
    pub fn title_and_abstract(&self, max_abstract_chars: usize) -> String {
        match self.abstract_text() {
            Some(text) => format!("{} {}", self.title, truncate_chars(text, max_abstract_chars)),
            None => self.title.clone(),
        }
    }
}

/// Truncate to at most `max` characters on a char boundary.
#[must_use]
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, title: Option<&str>) -> RawPaperRecord {
        RawPaperRecord {
            id: id.to_string(),
            source: Some(Source::OpenAlex),
            title: title.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_from_raw_requires_title() {
        assert!(Paper::from_raw(raw("W1", None), Source::OpenAlex).is_none());
        assert!(Paper::from_raw(raw("W1", Some("   ")), Source::OpenAlex).is_none());

        let paper = Paper::from_raw(raw("W1", Some(" A title ")), Source::OpenAlex).unwrap();
        assert_eq!(paper.title, "A title");
        assert_eq!(paper.provenance.len(), 1);
        assert_eq!(paper.record_id_for(Source::OpenAlex), Some("W1"));
    }

    #[test]
    fn test_from_raw_uses_fallback_source() {
        let mut record = raw("abc", Some("Paper"));
        record.source = None;
        let paper = Paper::from_raw(record, Source::SemanticScholar).unwrap();
        assert_eq!(paper.sources().into_iter().collect::<Vec<_>>(), vec![Source::SemanticScholar]);
    }

    #[test]
    fn test_raw_record_deserialize_minimal() {
        let json = r#"{"id": "W123", "source": "openalex", "title": "Test"}"#;
        let record: RawPaperRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "W123");
        assert_eq!(record.source, Some(Source::OpenAlex));
        assert!(record.authors.is_empty());
    }

    #[test]
    fn test_document_type_labels() {
        assert_eq!(DocumentType::from_label("JournalArticle"), DocumentType::Article);
        assert_eq!(DocumentType::from_label("posted-content"), DocumentType::Preprint);
        assert_eq!(DocumentType::from_label("dataset"), DocumentType::Other);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
