//! Corpus Curator - Entry Point
//!
//! Runs one review from a JSON review file and prints the report.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use corpus_curator::client::{
    ChatClient, OpenAlexClient, SemanticScholarClient, UnpaywallResolver,
};
use corpus_curator::formatters::{
    format_corpus_markdown, format_flow_markdown, format_progress_markdown,
    format_synthesis_markdown, report_json,
};
use corpus_curator::models::{QueryPlan, ResponseFormat, Verdict};
use corpus_curator::services::SourceSearch;
use corpus_curator::synthesis::local::{KMeans, PrincipalComponents};
use corpus_curator::{Config, Orchestrator, ReviewConfig, RunOutcome, Services};

#[derive(Parser, Debug)]
#[command(name = "corpus-curator")]
#[command(about = "Curate a literature corpus from a research question")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a review end to end
    Run {
        /// Review configuration (JSON)
        #[arg(long)]
        review: PathBuf,

        /// Report format
        #[arg(long, default_value = "markdown")]
        format: Format,

        /// Replacement query plan (JSON), approved in place of the proposed one
        #[arg(long)]
        queries: Option<PathBuf>,

        /// Approve the proposed queries without stopping
        #[arg(long)]
        auto_approve: bool,

        /// Human decisions for queued papers (JSON array)
        #[arg(long)]
        decisions: Option<PathBuf>,

        /// Exclude papers still queued for human review as deferred
        #[arg(long)]
        defer_borderline: bool,

        /// Where to write the pipeline state when the run pauses
        #[arg(long, default_value = "curator-checkpoint.json")]
        checkpoint: PathBuf,
    },

    /// Check a review configuration without running it
    Validate {
        /// Review configuration (JSON)
        #[arg(long)]
        review: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum Format {
    /// Human-readable Markdown
    #[default]
    Markdown,
    /// Machine-readable JSON
    Json,
}

impl From<Format> for ResponseFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Markdown => Self::Markdown,
            Format::Json => Self::Json,
        }
    }
}

/// One entry of the `--decisions` file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HumanDecision {
    paper_id: String,
    verdict: Verdict,
    #[serde(default)]
    rationale: String,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Reports go to stdout, logs to stderr
    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn build_services(config: &Config) -> anyhow::Result<Services> {
    let openalex = Arc::new(OpenAlexClient::new(config)?);
    let semantic_scholar = Arc::new(SemanticScholarClient::new(config)?);
    let chat = Arc::new(ChatClient::new(config)?);

    if !semantic_scholar.has_api_key() {
        tracing::warn!("SEMANTIC_SCHOLAR_API_KEY not set, searching at the shared rate limit");
    }

    Ok(Services {
        sources: vec![openalex.clone() as Arc<dyn SourceSearch>, semantic_scholar],
        citations: openalex,
        classifier: chat.clone(),
        full_text: Arc::new(UnpaywallResolver::new(config)?),
        embedder: chat.clone(),
        clusterer: Arc::new(KMeans),
        reducer: Arc::new(PrincipalComponents),
        narrator: chat.clone(),
        formulator: chat.clone(),
        quality: chat,
    })
}

fn print_report(orchestrator: &Orchestrator, format: ResponseFormat) -> anyhow::Result<()> {
    let entries = orchestrator.final_corpus();
    if format.is_json() {
        let report = report_json(
            orchestrator.counts(),
            orchestrator.snowball_runs(),
            &entries,
            orchestrator.synthesis_report(),
        );
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", format_progress_markdown(orchestrator.state()));
    println!("{}", format_flow_markdown(orchestrator.counts()));
    if let Some(synthesis) = orchestrator.synthesis_report() {
        println!("{}", format_synthesis_markdown(synthesis));
    }
    println!("{}", format_corpus_markdown(&entries));
    Ok(())
}

struct RunArgs {
    review: PathBuf,
    format: ResponseFormat,
    queries: Option<PathBuf>,
    auto_approve: bool,
    decisions: Option<PathBuf>,
    defer_borderline: bool,
    checkpoint: PathBuf,
}

fn write_checkpoint(orchestrator: &Orchestrator, outcome: RunOutcome, path: &Path) -> anyhow::Result<()> {
    let checkpoint = orchestrator.checkpoint(outcome);
    let raw = serde_json::to_string_pretty(&checkpoint)?;
    std::fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        stage = %checkpoint.state.stage(),
        session = %checkpoint.state.session_id(),
        "Checkpoint written"
    );
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let review: ReviewConfig = read_json(&args.review)?;
    let config = Config::from_env()?;
    let services = build_services(&config)?;
    let mut orchestrator = Orchestrator::new(review, services, &config)
        .map_err(|e| anyhow::anyhow!(e.to_user_message()))?;

    let mut edited_plan: Option<QueryPlan> = match &args.queries {
        Some(path) => Some(read_json(path)?),
        None => None,
    };
    let mut decisions: Vec<HumanDecision> = match &args.decisions {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };
    let mut plan_pending = edited_plan.is_some() || args.auto_approve;

    loop {
        let outcome = orchestrator
            .run_until_pause()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_user_message()))?;

        match outcome {
            RunOutcome::AwaitingQueryApproval if plan_pending => {
                plan_pending = false;
                orchestrator.approve_queries(edited_plan.take())?;
            }
            RunOutcome::AwaitingQueryApproval => {
                write_checkpoint(&orchestrator, outcome, &args.checkpoint)?;
                let plan = orchestrator.plan().cloned().unwrap_or_default();
                tracing::info!("Queries need approval; rerun with --auto-approve or --queries");
                println!("{}", serde_json::to_string_pretty(&plan)?);
                return Ok(());
            }
            RunOutcome::AwaitingHumanReview { pending } if !decisions.is_empty() => {
                tracing::info!(pending, supplied = decisions.len(), "Applying human decisions");
                for d in decisions.drain(..) {
                    if let Err(e) = orchestrator.submit_human_decision(&d.paper_id, d.verdict, d.rationale) {
                        tracing::warn!(paper = %d.paper_id, error = %e, "Skipping human decision");
                    }
                }
            }
            RunOutcome::AwaitingHumanReview { .. } if args.defer_borderline => {
                orchestrator.defer_pending_reviews()?;
            }
            RunOutcome::AwaitingHumanReview { pending } => {
                write_checkpoint(&orchestrator, outcome, &args.checkpoint)?;
                tracing::info!(pending, "Papers need human review; rerun with --decisions or --defer-borderline");
                let queue: Vec<_> = orchestrator
                    .screening()
                    .queue()
                    .iter()
                    .filter_map(|id| orchestrator.corpus().get(id))
                    .map(|p| serde_json::json!({ "paperId": p.id, "title": p.title, "year": p.year }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&queue)?);
                return Ok(());
            }
            RunOutcome::Complete => break,
        }
    }

    print_report(&orchestrator, args.format)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting corpus curator");

    match cli.command {
        Command::Run { review, format, queries, auto_approve, decisions, defer_borderline, checkpoint } => {
            run(RunArgs {
                review,
                format: format.into(),
                queries,
                auto_approve,
                decisions,
                defer_borderline,
                checkpoint,
            })
            .await
        }
        Command::Validate { review } => {
            let review: ReviewConfig = read_json(&review)?;
            review.validate().map_err(|e| anyhow::anyhow!(e.to_user_message()))?;
            println!("Review configuration is valid.");
            Ok(())
        }
    }
}
