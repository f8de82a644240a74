//! Prompt context assembly
//!
//! Local retrieval hits, optional live web results and the bounded
//! conversation history are merged into one leading context block. The
//! model then sees that block first, the user's message second and any
//! image attachment last.

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embeddings::Embedder;
use crate::index::IndexHandle;
use crate::llm::Part;
use crate::web::{PageContent, SearchResult, WebCrawler, WebSearcher, save_crawled_data};
use crate::{RagError, Result};

/// Phrases that suggest the user wants fresh information
pub const WEB_INDICATORS: &[&str] = &[
    "latest",
    "recent",
    "current",
    "news",
    "today",
    "now",
    "what is happening",
    "updates",
    "breaking",
    "new",
    "search for",
    "find information about",
    "look up",
];

pub const DOC_SEPARATOR: &str = "\n---\n";
pub const NO_LOCAL_CONTEXT: &str = "No local context found.";
pub const WEB_CONTEXT_NOTE: &str = "The following are web search results (if any) related to the user's question. Use this information to provide a more accurate and up-to-date answer.";

/// Case-insensitive substring match against [`WEB_INDICATORS`]
#[inline]
pub fn should_use_web_search(query: &str) -> bool {
    let query = query.to_lowercase();
    WEB_INDICATORS
        .iter()
        .any(|indicator| query.contains(indicator))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user: String,
    pub bot: String,
}

/// Ring buffer of the most recent turns, oldest evicted first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ConversationHistory {
    #[inline]
    pub fn new(max_turns: usize) -> Self {
        let max_turns = max_turns.max(1);
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns,
        }
    }

    /// Rebuild a history from stored turns, keeping only the newest `max_turns`
    #[inline]
    pub fn from_turns(turns: impl IntoIterator<Item = ConversationTurn>, max_turns: usize) -> Self {
        let mut history = Self::new(max_turns);
        for turn in turns {
            history.push(turn);
        }
        history
    }

    #[inline]
    pub fn push(&mut self, turn: ConversationTurn) {
        while self.turns.len() >= self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    #[inline]
    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Turns oldest first
    #[inline]
    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// `User: …\nAssistant: …` blocks separated by blank lines
    #[inline]
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|turn| format!("User: {}\nAssistant: {}", turn.user, turn.bot))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Everything the model is shown besides the user's own message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssembledContext {
    pub prompt: String,
    pub local_docs: Vec<String>,
    pub web_results: Vec<String>,
    pub search_results: Vec<SearchResult>,
    pub crawled_pages: usize,
}

impl AssembledContext {
    #[inline]
    pub fn web_search_performed(&self) -> bool {
        !self.web_results.is_empty()
    }

    /// Local docs followed by web results, as recorded for evaluation
    #[inline]
    pub fn all_context(&self) -> Vec<String> {
        self.local_docs
            .iter()
            .chain(&self.web_results)
            .cloned()
            .collect()
    }
}

/// One web result block, with a preview of the crawled body when available
#[inline]
pub fn format_web_result(result: &SearchResult, page: Option<&PageContent>, preview_chars: usize) -> String {
    let mut block = format!(
        "Title: {}\nSnippet: {}\nURL: {}",
        result.title, result.snippet, result.url
    );
    if let Some(page) = page {
        let preview: String = page.content.chars().take(preview_chars).collect();
        block.push_str("\nContent: ");
        block.push_str(&preview);
        block.push_str("...");
    }
    block
}

/// Fill the prompt template
#[inline]
pub fn render_prompt(history: &ConversationHistory, local_docs: &[String], web_results: &[String]) -> String {
    let context_docs = if local_docs.is_empty() {
        NO_LOCAL_CONTEXT.to_string()
    } else {
        local_docs.join(DOC_SEPARATOR)
    };
    let (web_note, web_block) = if web_results.is_empty() {
        ("", String::new())
    } else {
        (WEB_CONTEXT_NOTE, web_results.join(DOC_SEPARATOR))
    };

    format!(
        "You are a helpful analyst chatbot that answers user questions based on the local knowledge base, web search results, and prior context.

[Conversation History]
{history}

[Retrieved Context from Knowledge Base]
{context_docs}

{web_note}
{web_block}

Instructions:
- Prioritize recent web information when answering questions about current events or latest information
- Combine information from both local knowledge base and web results when relevant
- Cite sources when possible (mention if information is from web search)
- If web search was performed, indicate this in your response

Now answer the user's new question based on the above context.
",
        history = history.render(),
    )
}

/// Model input order: context block, then user text, then the image
#[inline]
pub fn model_parts(context: &AssembledContext, user_text: &str, image: Option<Part>) -> Vec<Part> {
    let mut parts = vec![Part::text(context.prompt.clone()), Part::text(user_text)];
    parts.extend(image);
    parts
}

/// Gathers local and web context for one query
pub struct ContextAssembler {
    embedder: Arc<dyn Embedder>,
    index: Arc<IndexHandle>,
    searcher: WebSearcher,
    crawler: WebCrawler,
    top_k: usize,
    num_results: usize,
    crawl_top: usize,
    preview_chars: usize,
    crawled_data_dir: Option<PathBuf>,
}

impl std::fmt::Debug for ContextAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextAssembler")
            .field("top_k", &self.top_k)
            .field("num_results", &self.num_results)
            .field("crawl_top", &self.crawl_top)
            .field("preview_chars", &self.preview_chars)
            .finish_non_exhaustive()
    }
}

impl ContextAssembler {
    #[inline]
    pub fn new(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<IndexHandle>,
        searcher: WebSearcher,
        crawler: WebCrawler,
    ) -> Self {
        Self {
            embedder,
            index,
            searcher,
            crawler,
            top_k: config.index.top_k,
            num_results: config.web.num_results,
            crawl_top: config.web.crawl_top,
            preview_chars: config.web.preview_chars,
            crawled_data_dir: Some(config.crawled_data_dir()),
        }
    }

    /// Keep crawled pages in memory only
    #[inline]
    pub fn without_crawl_archive(mut self) -> Self {
        self.crawled_data_dir = None;
        self
    }

    /// Retrieve local and (when triggered) web context and render the prompt
    ///
    /// Retrieval failures degrade to empty context; only an empty query is an error.
    #[inline]
    pub async fn assemble(
        &self,
        query: &str,
        force_web: bool,
        history: &ConversationHistory,
        cancel: &CancellationToken,
    ) -> Result<AssembledContext> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidInput("query is empty".to_string()));
        }

        let local_docs = self.retrieve_local(query).await;

        let mut context = AssembledContext {
            local_docs,
            ..AssembledContext::default()
        };

        if force_web || should_use_web_search(query) {
            self.add_web_context(query, &mut context, cancel).await;
        }

        info!(
            "Retrieved {} local docs, {} web results",
            context.local_docs.len(),
            context.web_results.len()
        );

        context.prompt = render_prompt(history, &context.local_docs, &context.web_results);
        Ok(context)
    }

    async fn retrieve_local(&self, query: &str) -> Vec<String> {
        let embedder = Arc::clone(&self.embedder);
        let index = Arc::clone(&self.index);
        let query = query.to_string();
        let top_k = self.top_k;

        let retrieved = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let Some(generation) = index.current()? else {
                debug!("No index generation published yet");
                return Ok(Vec::new());
            };
            let embedding = embedder.embed(&query)?;
            Ok(generation
                .retrieve(&embedding, top_k)?
                .into_iter()
                .map(|chunk| chunk.text.clone())
                .collect())
        })
        .await;

        match retrieved {
            Ok(Ok(docs)) => docs,
            Ok(Err(e)) => {
                warn!("Local retrieval failed, continuing without it: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!("Local retrieval task failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn add_web_context(&self, query: &str, context: &mut AssembledContext, cancel: &CancellationToken) {
        let searcher = self.searcher.clone();
        let owned_query = query.to_string();
        let num_results = self.num_results;
        let results = tokio::task::spawn_blocking(move || searcher.search(&owned_query, num_results))
            .await
            .unwrap_or_else(|e| {
                warn!("Web search task failed: {}", e);
                Vec::new()
            });

        if results.is_empty() {
            return;
        }

        let urls: Vec<String> = results
            .iter()
            .take(self.crawl_top)
            .map(|result| result.url.clone())
            .collect();
        let pages = self.crawler.crawl_multiple(&urls, cancel).await;

        if let Some(dir) = &self.crawled_data_dir {
            if let Err(e) = save_crawled_data(dir, &pages) {
                warn!("Failed to save crawled pages: {}", e);
            }
        }

        context.web_results = results
            .iter()
            .map(|result| {
                let page = pages.iter().find(|page| page.url == result.url);
                format_web_result(result, page, self.preview_chars)
            })
            .collect();
        context.crawled_pages = pages.len();
        context.search_results = results;
    }
}
