//! Request-level orchestration
//!
//! [`RagService`] owns every collaborator a chat turn needs and is shared
//! across requests behind an `Arc`. Per-request state (the conversation
//! history) is supplied by the caller.

#[cfg(test)]
mod tests;

use chrono::TimeDelta;
use pulldown_cmark::{Options, Parser, html};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::{ContextAssembler, ConversationHistory, ConversationTurn, model_parts};
use crate::embeddings::{Embedder, OllamaClient};
use crate::feedback::{FeedbackEvaluator, FeedbackRecord, FeedbackSubmission};
use crate::index::{IndexHandle, IndexStore};
use crate::ingest::{IngestOutcome, IngestionPipeline, RebuildSummary};
use crate::llm::{GeminiClient, GenerativeModel, PageRasterizer, Part, PdftoppmRasterizer};
use crate::web::{CrawlerConfig, SearchCache, SearchProvider, SerpApiProvider, WebCrawler, WebSearcher};
use crate::{RagError, Result};

/// Environment variable holding the generation API key
pub const GEMINI_API_KEY_VAR: &str = "GEMINI_API_KEY";
/// Environment variable holding the web search API key
pub const SERPAPI_KEY_VAR: &str = "SERPAPI_KEY";

const SEARCH_SOURCE_LIMIT: usize = 3;

/// Credentials read from the environment, never from the config file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiKeys {
    pub gemini: Option<String>,
    pub serpapi: Option<String>,
}

impl ApiKeys {
    #[inline]
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
        };
        Self {
            gemini: read(GEMINI_API_KEY_VAR),
            serpapi: read(SERPAPI_KEY_VAR),
        }
    }
}

/// The external collaborators a [`RagService`] is built from
pub struct ServiceDeps {
    pub embedder: Arc<dyn Embedder>,
    pub model: Option<Arc<dyn GenerativeModel>>,
    pub search_provider: Arc<dyn SearchProvider>,
    pub rasterizer: Arc<dyn PageRasterizer>,
}

impl ServiceDeps {
    /// Production collaborators: Ollama embeddings, Gemini, SerpAPI, pdftoppm
    #[inline]
    pub fn from_config(config: &Config, keys: ApiKeys) -> Result<Self> {
        let embedder = OllamaClient::new(&config.embedding)?;
        let model = keys
            .gemini
            .map(|key| GeminiClient::new(&config.llm, key))
            .transpose()?
            .map(|client| Arc::new(client) as Arc<dyn GenerativeModel>);
        if model.is_none() {
            warn!(
                "{} is not set; chat and image/PDF ingestion are unavailable",
                GEMINI_API_KEY_VAR
            );
        }
        let search_provider = SerpApiProvider::new(&config.web, keys.serpapi)?;

        Ok(Self {
            embedder: Arc::new(embedder),
            model,
            search_provider: Arc::new(search_provider),
            rasterizer: Arc::new(PdftoppmRasterizer::default()),
        })
    }
}

/// One user turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    #[serde(default, skip_serializing)]
    pub image: Option<Vec<u8>>,
    #[serde(default)]
    pub web_search: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSource {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Model answer rendered from Markdown to HTML
    pub response: String,
    /// Model answer as returned, in Markdown
    #[serde(skip)]
    pub answer: String,
    /// Local documents retrieved for the question; web results are not included
    pub context_docs: Vec<String>,
    pub web_search_performed: bool,
    pub web_results_count: usize,
    pub crawled_pages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_sources: Option<Vec<SearchSource>>,
}

/// Published index generation as reported by [`RagService::index_status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    pub generation: String,
    pub chunks: usize,
    pub dimension: usize,
}

/// Render model Markdown as HTML
#[inline]
pub fn render_markdown(markdown: &str) -> String {
    let parser = Parser::new_ext(markdown, Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH);
    let mut rendered = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut rendered, parser);
    rendered
}

pub struct RagService {
    config: Config,
    model: Option<Arc<dyn GenerativeModel>>,
    index: Arc<IndexHandle>,
    assembler: ContextAssembler,
    pipeline: Arc<IngestionPipeline>,
    evaluator: Arc<FeedbackEvaluator>,
    request_deadline: Duration,
}

impl std::fmt::Debug for RagService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagService")
            .field("base_dir", &self.config.base_dir)
            .field("has_model", &self.model.is_some())
            .field("assembler", &self.assembler)
            .field("pipeline", &self.pipeline)
            .field("request_deadline", &self.request_deadline)
            .finish_non_exhaustive()
    }
}

impl RagService {
    #[inline]
    pub fn new(config: Config, deps: ServiceDeps) -> Self {
        let index = Arc::new(IndexHandle::new(IndexStore::new(config.index_dir())));
        let cache_ttl = i64::try_from(config.web.cache_ttl_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .unwrap_or(TimeDelta::MAX);
        let searcher = WebSearcher::new(
            deps.search_provider,
            SearchCache::new(config.web_cache_path(), cache_ttl),
        );
        let crawler = WebCrawler::new(CrawlerConfig::from(&config.web));
        let assembler = ContextAssembler::new(
            &config,
            Arc::clone(&deps.embedder),
            Arc::clone(&index),
            searcher,
            crawler,
        );
        let pipeline = IngestionPipeline::new(
            &config,
            Arc::clone(&deps.embedder),
            deps.model.as_ref().map(Arc::clone),
            deps.rasterizer,
        )
        .with_progress(console::user_attended_stderr());
        let evaluator = FeedbackEvaluator::new(&config, deps.embedder);
        let request_deadline = Duration::from_secs(config.web.request_deadline_seconds);

        Self {
            config,
            model: deps.model,
            index,
            assembler,
            pipeline: Arc::new(pipeline),
            evaluator: Arc::new(evaluator),
            request_deadline,
        }
    }

    /// Build with production collaborators and the given credentials
    #[inline]
    pub fn from_config(config: Config, keys: ApiKeys) -> Result<Self> {
        let deps = ServiceDeps::from_config(&config, keys)?;
        Ok(Self::new(config, deps))
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    /// Answer one turn and record it in `history`
    ///
    /// Context retrieval degrades to empty results on failure; only invalid
    /// input and a failed generation call are errors. Outstanding crawls are
    /// cancelled once the request deadline passes.
    #[inline]
    pub async fn chat(
        &self,
        request: ChatRequest,
        history: &mut ConversationHistory,
    ) -> Result<ChatResponse> {
        let request_id = Uuid::new_v4();
        self.chat_inner(request, history)
            .instrument(info_span!("chat", %request_id))
            .await
    }

    async fn chat_inner(
        &self,
        request: ChatRequest,
        history: &mut ConversationHistory,
    ) -> Result<ChatResponse> {
        let ChatRequest {
            text,
            image,
            web_search,
        } = request;

        if text.trim().is_empty() {
            return Err(RagError::InvalidInput("message text is empty".to_string()));
        }
        let image = image.map(Part::image).transpose()?;
        let Some(model) = self.model.as_ref().map(Arc::clone) else {
            return Err(RagError::ExternalService(
                "no generative model is configured".to_string(),
            ));
        };

        info!("Chat request (web search forced: {})", web_search);

        let cancel = CancellationToken::new();
        let deadline = tokio::spawn({
            let cancel = cancel.clone();
            let after = self.request_deadline;
            async move {
                tokio::time::sleep(after).await;
                warn!("Request deadline of {:?} reached, cancelling crawls", after);
                cancel.cancel();
            }
        });
        let assembled = self.assembler.assemble(&text, web_search, history, &cancel).await;
        deadline.abort();
        let context = assembled?;

        let parts = model_parts(&context, &text, image);
        let answer = tokio::task::spawn_blocking(move || model.generate(&parts))
            .await
            .map_err(|e| RagError::Other(anyhow::anyhow!("generation task failed: {e}")))??;

        history.push(ConversationTurn {
            user: text.clone(),
            bot: answer.clone(),
        });

        self.evaluate(text, context.all_context(), answer.clone()).await;

        let search_sources = context.web_search_performed().then(|| {
            context
                .search_results
                .iter()
                .take(SEARCH_SOURCE_LIMIT)
                .map(|result| SearchSource {
                    title: result.title.clone(),
                    url: result.url.clone(),
                })
                .collect()
        });

        Ok(ChatResponse {
            response: render_markdown(&answer),
            answer,
            web_search_performed: context.web_search_performed(),
            web_results_count: context.web_results.len(),
            crawled_pages: context.crawled_pages,
            context_docs: context.local_docs,
            search_sources,
        })
    }

    async fn evaluate(&self, query: String, docs: Vec<String>, answer: String) {
        let evaluator = Arc::clone(&self.evaluator);
        match tokio::task::spawn_blocking(move || evaluator.evaluate_turn(&query, &docs, &answer)).await {
            Ok(Ok(Some(record))) => debug!("Turn evaluated against {:?}", record.previous_query),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!("Feedback evaluation failed: {}", e),
            Err(e) => warn!("Feedback evaluation task failed: {}", e),
        }
    }

    /// Validate and log a feedback payload
    #[inline]
    pub fn submit_feedback(&self, payload: Value) -> Result<FeedbackRecord> {
        self.evaluator
            .feedback_log()
            .submit(FeedbackSubmission::new(payload))
    }

    /// Ingest one file on a blocking thread
    #[inline]
    pub async fn ingest_file(&self, path: PathBuf) -> Result<IngestOutcome> {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || pipeline.ingest_file(&path))
            .await
            .map_err(|e| RagError::Other(anyhow::anyhow!("ingestion task failed: {e}")))?
    }

    /// Rebuild the index from every stored artifact on a blocking thread
    #[inline]
    pub async fn rebuild(&self) -> Result<RebuildSummary> {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || pipeline.rebuild())
            .await
            .map_err(|e| RagError::Other(anyhow::anyhow!("rebuild task failed: {e}")))?
    }

    /// The generation new requests are served from, if any
    #[inline]
    pub fn index_status(&self) -> Result<Option<IndexStatus>> {
        let status = self.index.current()?.map(|generation| IndexStatus {
            generation: generation.id.clone(),
            chunks: generation.mapping.len(),
            dimension: generation.index.dimension(),
        });
        debug!("Index status: {:?}", status);
        Ok(status)
    }

    /// A fresh history sized from the config
    #[inline]
    pub fn new_history(&self) -> ConversationHistory {
        ConversationHistory::new(self.config.history.max_turns)
    }
}
