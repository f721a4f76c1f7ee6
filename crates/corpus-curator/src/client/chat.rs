//! OpenAI-compatible chat completions and embeddings.
//!
//! One client backs the classifier, query formulation, quality scoring,
//! cluster narratives and embeddings. Every chat call asks for a JSON object
//! and returns it unvalidated; validation belongs to the caller.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::Deserialize;
use serde_json::{Value, json};

use super::HttpClient;
use crate::config::{Config, pipeline};
use crate::error::{ServiceError, ServiceResult};
use crate::models::{
    ClusterNarrative, ClusterSummary, OverallSynthesis, Paper, ReviewConfig, ScreeningPass,
    truncate_chars,
};
use crate::services::{
    ClassificationItem, Classifier, Embedder, NarrativeGenerator, QualityScorer, QueryFormulator,
    ScreeningRequest,
};

const SERVICE: &str = "chat";

/// Texts per embeddings request.
const EMBEDDING_CHUNK: usize = 512;

const TEMPERATURE: f64 = 0.2;

mod prompts {
    pub const QUERY_SYSTEM: &str = "You are a research librarian designing the search strategy \
for a literature review. Reply with a single JSON object.";

    pub const SCREENING_SYSTEM: &str = "You screen papers for a literature review against \
explicit criteria. Judge every paper on its own merits and justify each decision in one \
sentence. Reply with a single JSON object.";

    pub const QUALITY_SYSTEM: &str = "You assess the methodological quality of research papers \
for a literature review. Be rigorous and fair. Reply with a single JSON object.";

    pub const CLUSTER_SYSTEM: &str = "You name and summarise thematic clusters of research \
papers. Reply with a single JSON object.";

    pub const SYNTHESIS_SYSTEM: &str = "You write the synthesis section of a literature review \
for an academic audience. Reply with a single JSON object.";
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingEntry>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}

fn year_range(min: Option<i32>, max: Option<i32>) -> String {
    let show = |y: Option<i32>| y.map_or_else(|| "any".to_string(), |y| y.to_string());
    format!("{} to {}", show(min), show(max))
}

fn or_none(text: &str) -> &str {
    if text.trim().is_empty() { "none specified" } else { text }
}

fn query_prompt(review: &ReviewConfig) -> String {
    format!(
        "Research question: {question}\n\
         Review type: {review_type}\n\
         Years: {years}\n\
         Inclusion criteria: {inclusion}\n\
         Exclusion criteria: {exclusion}\n\n\
         Write search queries for two databases. Use plain keywords only: no field prefixes, \
         no boolean operators, no parentheses, at most ten words per query. Give three to six \
         queries per database, each covering a different angle of the question.\n\n\
         Return:\n\
         {{\"openalex_queries\": [{{\"query\": \"...\", \"description\": \"...\"}}],\n \
         \"semantic_scholar_queries\": [{{\"query\": \"...\", \"description\": \"...\"}}],\n \
         \"suggested_concepts\": [\"...\"],\n \
         \"notes_for_user\": \"...\"}}",
        question = review.research_question,
        review_type = review.review_type,
        years = year_range(review.year_min, review.year_max),
        inclusion = or_none(&review.inclusion_criteria),
        exclusion = or_none(&review.exclusion_criteria),
    )
}

fn screening_prompt(request: &ScreeningRequest, items: &[ClassificationItem]) -> ServiceResult<String> {
    let papers = serde_json::to_string_pretty(items)
        .map_err(|e| ServiceError::permanent(SERVICE, e.to_string()))?;
    let basis = match request.pass {
        ScreeningPass::TitleAbstract => "title and abstract",
        ScreeningPass::FullText => "full text (or the best available substitute)",
    };
    Ok(format!(
        "Research question: {question}\n\
         Strictness: {level}/5 (1 = inclusive, 5 = very selective)\n\
         Years: {years}\n\
         Inclusion criteria: {inclusion}\n\
         Exclusion criteria: {exclusion}\n\n\
         Classify each paper below as INCLUDE, EXCLUDE or BORDERLINE based on its {basis}.\n\n\
         Papers:\n{papers}\n\n\
         Return exactly {n} decisions, one per paper id:\n\
         {{\"decisions\": [{{\"id\": \"<paper id>\", \"decision\": \"INCLUDE|EXCLUDE|BORDERLINE\", \
         \"confidence\": <0-100>, \"reason\": \"<one sentence>\", \
         \"category\": \"off_topic|wrong_population|wrong_study_design|out_of_date_range|wrong_document_type|insufficient_information|other\"}}]}}",
        question = request.research_question,
        level = request.strictness.level(),
        years = year_range(request.year_min, request.year_max),
        inclusion = or_none(&request.inclusion_criteria),
        exclusion = or_none(&request.exclusion_criteria),
        n = items.len(),
    ))
}

fn quality_prompt(review: &ReviewConfig, paper: &Paper) -> String {
    format!(
        "Research question: {question}\n\
         Review type: {review_type}\n\n\
         Title: {title}\n\
         Abstract: {abstract_text}\n\
         Year: {year}\n\
         Venue: {venue}\n\
         Citations: {citations}\n\
         Type: {doc_type:?}\n\n\
         Score the paper's methodological quality from 0 to 100 and list strengths and concerns.\n\n\
         Return:\n\
         {{\"quality_score\": <0-100>, \"strengths\": [\"...\"], \"concerns\": [\"...\"], \
         \"quality_notes\": \"<two or three sentences>\", \
         \"flag\": \"none|low_citations|predatory_journal_risk|methodology_weak|retraction_risk\"}}",
        question = review.research_question,
        review_type = review.review_type,
        title = paper.title,
        abstract_text = paper
            .abstract_text()
            .map_or("not available", |a| truncate_chars(a, pipeline::QUALITY_ABSTRACT_CHARS)),
        year = paper.year.map_or_else(|| "unknown".to_string(), |y| y.to_string()),
        venue = paper.venue.as_deref().unwrap_or("unknown"),
        citations = paper.citation_count,
        doc_type = paper.document_type,
    )
}

fn cluster_prompt(papers: &[Paper]) -> String {
    let mut listing = String::new();
    for paper in papers {
        let _ = writeln!(listing, "- {}", paper.title_and_abstract(pipeline::CLUSTER_ABSTRACT_CHARS));
    }
    format!(
        "These papers form one thematic cluster:\n{listing}\n\
         Give the cluster a label of four to eight words and a one-paragraph summary of its \
         themes and findings.\n\n\
         Return:\n{{\"label\": \"...\", \"summary\": \"...\"}}"
    )
}

fn synthesis_prompt(review: &ReviewConfig, paper_count: usize, clusters: &[ClusterSummary]) -> String {
    let mut listing = String::new();
    for cluster in clusters {
        let _ = writeln!(
            listing,
            "- {} ({} papers): {}",
            cluster.label, cluster.paper_count, cluster.summary
        );
    }
    format!(
        "Research question: {question}\n\
         Review type: {review_type}\n\
         Papers included: {paper_count}\n\n\
         Clusters:\n{listing}\n\
         Write a synthesis of this literature: an overview, the main themes and points of \
         consensus, open debates, research gaps and methodological observations.\n\n\
         Return:\n\
         {{\"narrative_overview\": \"...\", \"key_themes\": [\"...\"], \"consensus_points\": [\"...\"], \
         \"key_debates\": [\"...\"], \"research_gaps\": [\"...\"], \
         \"methodological_observations\": \"...\", \"seminal_papers_notes\": \"...\"}}",
        question = review.research_question,
        review_type = review.review_type,
    )
}

/// OpenAI-compatible API client.
#[derive(Clone)]
pub struct ChatClient {
    http: HttpClient,
    base_url: String,
    model: String,
    embedding_model: String,
}

impl ChatClient {
    /// Create a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(ref key) = config.chat_api_key {
            headers.insert(reqwest::header::AUTHORIZATION, format!("Bearer {key}").parse()?);
        }
        Ok(Self {
            http: HttpClient::new(config, headers)?,
            base_url: config.chat_url.clone(),
            model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    /// Send a system + user prompt and parse the reply as a JSON object.
    pub async fn complete_json(&self, system: &str, user: &str) -> ServiceResult<Value> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "temperature": TEMPERATURE,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let value = self
            .http
            .post_json(&url, &[], &body)
            .await
            .map_err(|e| ServiceError::from_client(SERVICE, e))?;
        let response: ChatResponse = serde_json::from_value(value)
            .map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::malformed(SERVICE, "response has no content"))?;
        serde_json::from_str(&content).map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))
    }
}

#[async_trait::async_trait]
impl Classifier for ChatClient {
    async fn classify(
        &self,
        request: &ScreeningRequest,
        items: &[ClassificationItem],
    ) -> ServiceResult<Value> {
        let prompt = screening_prompt(request, items)?;
        self.complete_json(prompts::SCREENING_SYSTEM, &prompt).await
    }
}

#[async_trait::async_trait]
impl QueryFormulator for ChatClient {
    async fn formulate(&self, review: &ReviewConfig) -> ServiceResult<Value> {
        self.complete_json(prompts::QUERY_SYSTEM, &query_prompt(review)).await
    }
}

#[async_trait::async_trait]
impl QualityScorer for ChatClient {
    async fn assess(&self, review: &ReviewConfig, paper: &Paper) -> ServiceResult<Value> {
        self.complete_json(prompts::QUALITY_SYSTEM, &quality_prompt(review, paper)).await
    }
}

#[async_trait::async_trait]
impl NarrativeGenerator for ChatClient {
    async fn describe_cluster(&self, papers: &[Paper]) -> ServiceResult<ClusterNarrative> {
        let value = self.complete_json(prompts::CLUSTER_SYSTEM, &cluster_prompt(papers)).await?;
        serde_json::from_value(value).map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))
    }

    async fn synthesize(
        &self,
        review: &ReviewConfig,
        paper_count: usize,
        clusters: &[ClusterSummary],
    ) -> ServiceResult<OverallSynthesis> {
        let prompt = synthesis_prompt(review, paper_count, clusters);
        let value = self.complete_json(prompts::SYNTHESIS_SYSTEM, &prompt).await?;
        serde_json::from_value(value).map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))
    }
}

#[async_trait::async_trait]
impl Embedder for ChatClient {
    async fn embed(&self, items: &[(String, String)]) -> ServiceResult<HashMap<String, Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let mut vectors = HashMap::with_capacity(items.len());

        for chunk in items.chunks(EMBEDDING_CHUNK) {
            let input: Vec<&str> = chunk.iter().map(|(_, text)| text.as_str()).collect();
            let body = json!({ "model": self.embedding_model, "input": input });
            let value = self
                .http
                .post_json(&url, &[], &body)
                .await
                .map_err(|e| ServiceError::from_client(SERVICE, e))?;
            let response: EmbeddingResponse = serde_json::from_value(value)
                .map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))?;

            for entry in response.data {
                let Some((id, _)) = chunk.get(entry.index) else {
                    return Err(ServiceError::malformed(
                        SERVICE,
                        format!("embedding index {} out of range", entry.index),
                    ));
                };
                vectors.insert(id.clone(), entry.embedding);
            }
        }
        Ok(vectors)
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentType, RawPaperRecord, Source};

    #[test]
    fn test_screening_prompt_lists_every_item() {
        let review = ReviewConfig::new("Does sleep affect memory?");
        let request = ScreeningRequest::from_review(&review, ScreeningPass::TitleAbstract);
        let items: Vec<ClassificationItem> = ["p1", "p2"]
            .iter()
            .map(|id| ClassificationItem {
                id: (*id).to_string(),
                title: format!("Title {id}"),
                year: Some(2020),
                document_type: DocumentType::Article,
                text: String::new(),
            })
            .collect();
        let prompt = screening_prompt(&request, &items).unwrap();
        assert!(prompt.contains("\"p1\""));
        assert!(prompt.contains("\"p2\""));
        assert!(prompt.contains("exactly 2 decisions"));
        assert!(prompt.contains("title and abstract"));
    }

    #[test]
    fn test_query_prompt_defaults() {
        let review = ReviewConfig::new("Does sleep affect memory?");
        let prompt = query_prompt(&review);
        assert!(prompt.contains("Years: any to any"));
        assert!(prompt.contains("Inclusion criteria: none specified"));
    }

    #[test]
    fn test_cluster_prompt_truncates_abstracts() {
        let paper = Paper::from_raw(
            RawPaperRecord {
                id: "p".to_string(),
                title: Some("T".to_string()),
                r#abstract: Some("x".repeat(1000)),
                ..Default::default()
            },
            Source::OpenAlex,
        )
        .unwrap();
        let prompt = cluster_prompt(&[paper]);
        assert!(prompt.contains(&"x".repeat(pipeline::CLUSTER_ABSTRACT_CHARS)));
        assert!(!prompt.contains(&"x".repeat(pipeline::CLUSTER_ABSTRACT_CHARS + 1)));
    }
}
