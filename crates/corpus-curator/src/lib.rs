//! Corpus Curator
//!
//! A pipeline that turns a research question into a screened, deduplicated
//! and synthesised corpus of academic papers, with a PRISMA-style audit
//! trail of every decision.
//!
//! # Features
//!
//! - **Staged pipeline**: query formulation, search, deduplication, two-pass
//!   screening with human review, snowballing, quality scoring and synthesis
//! - **Async-first**: Built on Tokio with streaming pagination and bounded
//!   concurrency per external service
//! - **Resilient**: Transient failures are retried with backoff; unavailable
//!   sources degrade the run instead of aborting it
//! - **Pluggable**: Every external service is a trait in [`services`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use corpus_curator::client::{ChatClient, OpenAlexClient, SemanticScholarClient, UnpaywallResolver};
//! use corpus_curator::services::SourceSearch;
//! use corpus_curator::synthesis::local::{KMeans, PrincipalComponents};
//! use corpus_curator::{Config, Orchestrator, ReviewConfig, Services};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let openalex = Arc::new(OpenAlexClient::new(&config)?);
//!     let chat = Arc::new(ChatClient::new(&config)?);
//!     let services = Services {
//!         sources: vec![
//!             openalex.clone() as Arc<dyn SourceSearch>,
//!             Arc::new(SemanticScholarClient::new(&config)?),
//!         ],
//!         citations: openalex,
//!         classifier: chat.clone(),
//!         full_text: Arc::new(UnpaywallResolver::new(&config)?),
//!         embedder: chat.clone(),
//!         clusterer: Arc::new(KMeans),
//!         reducer: Arc::new(PrincipalComponents),
//!         narrator: chat.clone(),
//!         formulator: chat.clone(),
//!         quality: chat,
//!     };
//!
//!     let review = ReviewConfig::new("Does sleep improve memory consolidation in adults?");
//!     let mut orchestrator = Orchestrator::new(review, services, &config)?;
//!     orchestrator.run_until_pause().await?;
//!     Ok(())
//! }
//! ```

pub mod classifier;
pub mod client;
pub mod config;
pub mod corpus;
pub mod dedup;
pub mod error;
pub mod formatters;
pub mod models;
pub mod orchestrator;
pub mod quality;
pub mod retry;
pub mod screening;
pub mod search;
pub mod services;
pub mod snowball;
pub mod synthesis;
pub mod throttle;

pub use config::Config;
pub use error::{ClientError, PipelineError, ServiceError, StateError};
pub use models::ReviewConfig;
pub use orchestrator::{Checkpoint, Orchestrator, RunOutcome, Stage};
pub use services::Services;
