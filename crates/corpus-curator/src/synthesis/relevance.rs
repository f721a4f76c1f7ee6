//! Relevance of included papers to the research question.

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "of", "in", "to", "for", "is", "are", "was", "were", "be",
    "been", "being", "that", "this", "which", "with", "by", "from", "as",
];

/// Cosine similarity, 0 when either vector has zero length or the
/// dimensions differ.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Map a cosine similarity to 0-100.
///
/// Related texts sit roughly in `[0.3, 1.0]`, so that band is stretched to
/// the full scale.
#[must_use]
pub fn similarity_score(similarity: f64) -> f64 {
    round1(((similarity - 0.3) / 0.7 * 100.0).clamp(0.0, 100.0))
}

/// Content words: lower-cased, punctuation stripped, stopwords and words of
/// two characters or fewer dropped.
#[must_use]
pub fn content_words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect::<String>()
        .split_whitespace()
        .filter(|w| w.chars().count() > 2 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Keyword-overlap score used when embeddings are unavailable.
#[must_use]
pub fn keyword_score(question_words: &HashSet<String>, text: &str) -> f64 {
    let words = content_words(text);
    let overlap = question_words.intersection(&words).count() as f64;
    let share = overlap / question_words.len().max(1) as f64;
    round1((share * 150.0).min(100.0))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
