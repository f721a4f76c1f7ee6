//! JSON output formatting.

use serde_json::{Value, json};

use crate::corpus::CorpusEntry;
use crate::models::SynthesisReport;
use crate::orchestrator::FlowCounts;
use crate::snowball::SnowballRun;

/// Compact representation of one corpus entry.
///
/// Optional fields are only present when set.
#[must_use]
pub fn compact_entry(entry: &CorpusEntry) -> Value {
    let paper = &entry.paper;
    let mut obj = json!({
        "id": paper.id,
        "title": paper.title,
        "year": paper.year,
        "citations": paper.citation_count,
        "sources": paper.sources(),
    });

    if !paper.authors.is_empty() {
        obj["authors"] = json!(paper.authors.iter().map(|a| a.name.as_str()).collect::<Vec<_>>());
    }

    if let Some(venue) = &paper.venue {
        obj["venue"] = json!(venue);
    }

    if let Some(doi) = &paper.doi {
        obj["doi"] = json!(doi);
    }

    if let Some(round) = paper.snowball_round {
        obj["snowballRound"] = json!(round);
    }

    if let Some(status) = entry.final_status {
        obj["status"] = json!(status);
    }

    if let Some(decision) = entry.decisions.last() {
        obj["decidedBy"] = json!(decision.actor);
        obj["reason"] = json!(decision.reason);
    }

    if let Some(quality) = &entry.quality {
        obj["quality"] = json!(quality.score);
    }

    if let Some(relevance) = entry.relevance_score {
        obj["relevance"] = json!(relevance);
    }

    if let Some(label) = &entry.cluster_label {
        obj["cluster"] = json!(label);
    }

    if let Some((x, y)) = entry.coordinates {
        obj["xy"] = json!([x, y]);
    }

    obj
}

/// The final corpus as a JSON array.
#[must_use]
pub fn corpus_json(entries: &[CorpusEntry]) -> Value {
    Value::Array(entries.iter().map(compact_entry).collect())
}

/// Full review report: flow counts, snowball rounds, corpus and synthesis.
#[must_use]
pub fn report_json(
    counts: &FlowCounts,
    snowball: &[SnowballRun],
    entries: &[CorpusEntry],
    synthesis: Option<&SynthesisReport>,
) -> Value {
    let rounds: Vec<Value> = snowball
        .iter()
        .map(|run| json!({ "rounds": run.rounds, "stopReason": run.stop_reason }))
        .collect();

    let mut obj = json!({
        "flow": counts,
        "snowball": rounds,
        "corpus": corpus_json(entries),
    });

    if let Some(report) = synthesis {
        obj["synthesis"] = json!(report);
    }

    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthorRef, Paper, RawPaperRecord, Source};

    fn entry() -> CorpusEntry {
        let paper = Paper::from_raw(
            RawPaperRecord {
                id: "W1".to_string(),
                title: Some("Sleep and memory".to_string()),
                authors: vec![AuthorRef::named("Ada Lovelace")],
                year: Some(2021),
                citation_count: Some(7),
                ..Default::default()
            },
            Source::OpenAlex,
        )
        .unwrap();
        CorpusEntry {
            paper,
            final_status: None,
            decisions: Vec::new(),
            quality: None,
            relevance_score: Some(81.5),
            cluster_id: None,
            cluster_label: None,
            coordinates: Some((0.5, -1.0)),
        }
    }

    #[test]
    fn test_compact_entry() {
        let obj = compact_entry(&entry());
        assert_eq!(obj["id"], "W1");
        assert_eq!(obj["title"], "Sleep and memory");
        assert_eq!(obj["citations"], 7);
        assert_eq!(obj["authors"][0], "Ada Lovelace");
        assert_eq!(obj["sources"][0], "openalex");
        assert_eq!(obj["relevance"], 81.5);
        assert_eq!(obj["xy"][1], -1.0);
        assert!(obj.get("doi").is_none());
        assert!(obj.get("cluster").is_none());
        assert!(obj.get("quality").is_none());
    }

    #[test]
    fn test_report_json_shape() {
        let mut counts = FlowCounts::default();
        counts.included = 1;
        let report = report_json(&counts, &[], &[entry()], None);
        assert_eq!(report["flow"]["included"], 1);
        assert_eq!(report["corpus"].as_array().map(Vec::len), Some(1));
        assert!(report.get("synthesis").is_none());
    }
}
