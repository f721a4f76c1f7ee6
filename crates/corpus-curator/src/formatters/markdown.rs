//! Markdown output formatting.

use std::borrow::Cow;

use crate::corpus::CorpusEntry;
use crate::models::{ReasonCategory, SynthesisReport, truncate_chars};
use crate::orchestrator::{FlowCounts, PipelineState, Stage};

/// Audit entries shown in the progress view.
const RECENT_AUDIT: usize = 10;

fn reason_label(reason: ReasonCategory) -> Cow<'static, str> {
    match serde_json::to_value(reason) {
        Ok(serde_json::Value::String(s)) => Cow::Owned(s.replace('_', " ")),
        _ => Cow::Borrowed("other"),
    }
}

/// Format pipeline progress: stage checklist and the latest audit entries.
#[must_use]
pub fn format_progress_markdown(state: &PipelineState) -> String {
    let mut output = format!("# Review progress\n\n**Session**: {}\n\n", state.session_id());

    for stage in Stage::ALL {
        let marker = if stage == state.stage() {
            "▶"
        } else if state.is_completed(stage) {
            "✓"
        } else {
            " "
        };
        output.push_str(&format!("- [{marker}] {stage}\n"));
    }

    let audit = state.audit_log();
    if !audit.is_empty() {
        output.push_str("\n## Recent activity\n\n");
        for entry in audit.iter().skip(audit.len().saturating_sub(RECENT_AUDIT)) {
            output.push_str(&format!(
                "- `{}` **{}** {}\n",
                entry.timestamp.format("%H:%M:%S"),
                entry.stage,
                entry.message
            ));
        }
    }

    output
}

/// Format the PRISMA flow counts as a Markdown table.
#[must_use]
pub fn format_flow_markdown(counts: &FlowCounts) -> String {
    let mut output = String::from("# PRISMA flow\n\n| Stage | Records |\n|---|---:|\n");

    for (source, n) in &counts.identified {
        output.push_str(&format!("| Identified ({source}) | {n} |\n"));
    }
    output.push_str(&format!("| Identified via snowballing | {} |\n", counts.identified_snowball));
    output.push_str(&format!("| Duplicates removed | {} |\n", counts.duplicates_removed));
    output.push_str(&format!("| Records after deduplication | {} |\n", counts.after_dedup));
    output.push_str(&format!("| Screened (title/abstract) | {} |\n", counts.screened));
    output.push_str(&format!("| Excluded at title/abstract | {} |\n", counts.excluded_pass1));
    output.push_str(&format!("| Human reviewed | {} |\n", counts.human_reviewed));
    output.push_str(&format!("| Excluded by reviewer | {} |\n", counts.human_excluded));
    output.push_str(&format!("| Deferred without review | {} |\n", counts.deferred));
    output.push_str(&format!("| Full text assessed | {} |\n", counts.full_text_assessed));
    output.push_str(&format!("| Full text unavailable | {} |\n", counts.full_text_unavailable));
    output.push_str(&format!("| Excluded at full text | {} |\n", counts.excluded_pass2));
    output.push_str(&format!("| Unresolved | {} |\n", counts.unresolved));
    output.push_str(&format!("| **Included** | **{}** |\n", counts.included));

    for (title, reasons) in [
        ("Title/abstract exclusions", &counts.excluded_pass1_reasons),
        ("Full-text exclusions", &counts.excluded_pass2_reasons),
    ] {
        if reasons.is_empty() {
            continue;
        }
        output.push_str(&format!("\n**{title}**: "));
        let parts: Vec<String> =
            reasons.iter().map(|(reason, n)| format!("{} ({n})", reason_label(*reason))).collect();
        output.push_str(&parts.join(", "));
        output.push('\n');
    }

    output
}

/// Format the final corpus as Markdown.
#[must_use]
pub fn format_corpus_markdown(entries: &[CorpusEntry]) -> String {
    if entries.is_empty() {
        return "No papers included.".to_string();
    }

    let mut output = format!("# Final corpus ({} papers)\n\n", entries.len());

    for (i, entry) in entries.iter().enumerate() {
        output.push_str(&format_entry_markdown(entry, i + 1));
        output.push_str("\n---\n\n");
    }

    output
}

fn format_entry_markdown(entry: &CorpusEntry, index: usize) -> String {
    let paper = &entry.paper;
    let mut output = format!("## {}. {}\n\n", index, paper.title);

    if !paper.authors.is_empty() {
        output.push_str(&format!("**Authors**: {}\n\n", paper.author_names()));
    }

    let mut meta = Vec::new();
    if let Some(year) = paper.year {
        meta.push(format!("**Year**: {year}"));
    }
    meta.push(format!("**Citations**: {}", paper.citation_count));
    if let Some(venue) = &paper.venue {
        meta.push(format!("**Venue**: {venue}"));
    }
    output.push_str(&format!("{}\n\n", meta.join(" | ")));

    let mut scores = Vec::new();
    if let Some(quality) = &entry.quality {
        scores.push(format!("**Quality**: {}/100", quality.score));
    }
    if let Some(relevance) = entry.relevance_score {
        scores.push(format!("**Relevance**: {relevance:.1}"));
    }
    if let Some(label) = &entry.cluster_label {
        scores.push(format!("**Cluster**: {label}"));
    }
    if !scores.is_empty() {
        output.push_str(&format!("{}\n\n", scores.join(" | ")));
    }

    if let Some(doi) = &paper.doi {
        output.push_str(&format!("**DOI**: [{doi}](https://doi.org/{doi})\n\n"));
    }

    if let Some(decision) = entry.decisions.last() {
        if !decision.rationale.is_empty() {
            output.push_str(&format!("> {}\n\n", decision.rationale));
        }
    }

    if let Some(abs) = paper.abstract_text() {
        let truncated = truncate_chars(abs, 300);
        let ellipsis = if truncated.len() < abs.len() { "..." } else { "" };
        output.push_str(&format!("**Abstract**: {truncated}{ellipsis}\n"));
    }

    output
}

/// Format cluster summaries and the overall narrative.
#[must_use]
pub fn format_synthesis_markdown(report: &SynthesisReport) -> String {
    let mut output = format!("# Synthesis ({} papers)\n\n", report.paper_count);
    let overall = &report.overall;

    if !overall.narrative_overview.is_empty() {
        output.push_str(&format!("{}\n\n", overall.narrative_overview));
    }

    if !report.clusters.is_empty() {
        output.push_str("## Clusters\n\n");
        for cluster in &report.clusters {
            output.push_str(&format!("### {} ({} papers)\n\n", cluster.label, cluster.paper_count));
            if !cluster.summary.is_empty() {
                output.push_str(&format!("{}\n\n", cluster.summary));
            }
        }
    }

    for (heading, items) in [
        ("Key themes", &overall.key_themes),
        ("Consensus", &overall.consensus_points),
        ("Debates", &overall.key_debates),
        ("Research gaps", &overall.research_gaps),
    ] {
        if items.is_empty() {
            continue;
        }
        output.push_str(&format!("## {heading}\n\n"));
        for item in items {
            output.push_str(&format!("- {item}\n"));
        }
        output.push('\n');
    }

    if !overall.methodological_observations.is_empty() {
        output.push_str(&format!(
            "## Methodological observations\n\n{}\n",
            overall.methodological_observations
        ));
    }

    output
}
