
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ureq::Agent;
use url::Url;
use uuid::Uuid;

use crate::config::WebConfig;
use crate::{RagError, Result};

const NO_TITLE: &str = "No title";
const TRUNCATION_MARKER: &str = "...";
const UNWANTED_ELEMENTS: &str = "script, style, nav, footer, header";

/// Configuration for the web crawler
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// User agent string to use for requests
    pub user_agent: String,
    /// Timeout for a single page fetch
    pub timeout: Duration,
    /// Extracted text longer than this many characters is truncated
    pub max_content_length: usize,
    /// Maximum number of pages fetched at once
    pub concurrency: usize,
}

impl Default for CrawlerConfig {
    #[inline]
    fn default() -> Self {
        Self::from(&WebConfig::default())
    }
}

impl From<&WebConfig> for CrawlerConfig {
    #[inline]
    fn from(config: &WebConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            max_content_length: config.max_content_length,
            concurrency: config.concurrency.max(1),
        }
    }
}

/// Readable text of one crawled page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,
    pub title: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Length of `content` in characters, truncation marker included
    pub content_length: usize,
}

/// Validate a URL before any network call: absolute http(s) with a host
#[inline]
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str)
        .map_err(|e| RagError::InvalidInput(format!("Invalid URL format: {url_str}: {e}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(RagError::InvalidInput(format!(
            "URL must use HTTP or HTTPS scheme: {url_str}"
        )));
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(RagError::InvalidInput(format!(
            "URL must have a valid host: {url_str}"
        )));
    }

    Ok(url)
}

/// Page title, or "No title" when the document has none
#[inline]
pub fn extract_title(document: &Html) -> String {
    let Ok(selector) = Selector::parse("title") else {
        return NO_TITLE.to_string();
    };

    document
        .select(&selector)
        .next()
        .map(|title| title.text().collect::<String>().trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| NO_TITLE.to_string())
}

/// Visible text with script, style and page chrome removed
///
/// Each line is whitespace-collapsed and blank lines are dropped.
#[inline]
pub fn extract_text(document: &Html) -> String {
    let mut cleaned = document.clone();
    if let Ok(unwanted) = Selector::parse(UNWANTED_ELEMENTS) {
        remove_unwanted_elements(&mut cleaned, &unwanted);
    }

    let body = Selector::parse("body")
        .ok()
        .and_then(|selector| cleaned.select(&selector).next().map(|body| body.text().collect::<String>()));
    let raw = body.unwrap_or_else(|| cleaned.root_element().text().collect());

    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn remove_unwanted_elements(document: &mut Html, unwanted_selector: &Selector) {
    // Collect node ids first; detaching while selecting would alias the tree
    let unwanted_node_ids: Vec<_> = document
        .select(unwanted_selector)
        .map(|element| element.id())
        .collect();

    for node_id in unwanted_node_ids {
        if let Some(mut node) = document.tree.get_mut(node_id) {
            node.detach();
        }
    }
}

/// Cut `text` to `max_chars` characters, marking the cut with "..."
#[inline]
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// Build a page record from fetched HTML
#[inline]
pub fn page_from_html(url: &str, html: &str, max_content_length: usize) -> PageContent {
    let document = Html::parse_document(html);
    let content = truncate(&extract_text(&document), max_content_length);

    PageContent {
        url: url.to_string(),
        title: extract_title(&document),
        content_length: content.chars().count(),
        content,
        timestamp: Utc::now(),
    }
}

/// Fetches pages and reduces them to readable text
#[derive(Debug, Clone)]
pub struct WebCrawler {
    agent: Agent,
    config: CrawlerConfig,
}

impl Default for WebCrawler {
    #[inline]
    fn default() -> Self {
        Self::new(CrawlerConfig::default())
    }
}

impl WebCrawler {
    #[inline]
    pub fn new(config: CrawlerConfig) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(config.timeout))
            .user_agent(&config.user_agent)
            .build()
            .into();

        Self { agent, config }
    }

    #[inline]
    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Fetch one page; non-HTML responses are rejected
    #[inline]
    pub fn fetch(&self, url_str: &str) -> Result<PageContent> {
        let url = validate_url(url_str)?;
        debug!("Making HTTP GET request to: {}", url);

        let mut response = self.agent.get(url.as_str()).call().map_err(|e| {
            RagError::ExternalService(format!("Failed to fetch {url_str}: {e}"))
        })?;

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.contains("html") {
            return Err(RagError::ExternalService(format!(
                "{url_str} is not HTML (content-type: {content_type:?})"
            )));
        }

        let html = response
            .body_mut()
            .read_to_string()
            .with_context(|| format!("Failed to read response body from {url_str}"))?;
        debug!("Successfully read {} bytes from {}", html.len(), url_str);

        Ok(page_from_html(url_str, &html, self.config.max_content_length))
    }

    /// Fetch one page, logging and swallowing any failure
    #[inline]
    pub fn crawl(&self, url: &str) -> Option<PageContent> {
        match self.fetch(url) {
            Ok(page) => Some(page),
            Err(e) => {
                warn!("Error crawling {}: {}", url, e);
                None
            }
        }
    }

    /// Crawl `urls` on a bounded pool of blocking workers
    ///
    /// Failed, timed-out and cancelled crawls are dropped; successful pages
    /// come back in the order their URLs were given.
    #[inline]
    pub async fn crawl_multiple(&self, urls: &[String], cancel: &CancellationToken) -> Vec<PageContent> {
        let timeout = self.config.timeout;

        let mut pages: Vec<(usize, PageContent)> = stream::iter(urls.iter().cloned().enumerate())
            .map(|(position, url)| {
                let crawler = self.clone();
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }

                    let task_url = url.clone();
                    let task = tokio::task::spawn_blocking(move || crawler.crawl(&task_url));

                    tokio::select! {
                        () = cancel.cancelled() => {
                            debug!("Crawl of {} cancelled by request deadline", url);
                            None
                        }
                        result = tokio::time::timeout(timeout, task) => match result {
                            Ok(Ok(page)) => page.map(|page| (position, page)),
                            Ok(Err(e)) => {
                                warn!("Crawl worker for {} failed: {}", url, e);
                                None
                            }
                            Err(_) => {
                                warn!("Crawl of {} timed out after {:?}", url, timeout);
                                None
                            }
                        },
                    }
                }
            })
            .buffer_unordered(self.config.concurrency)
            .filter_map(|page| async move { page })
            .collect()
            .await;

        pages.sort_by_key(|(position, _)| *position);
        info!("Crawled {}/{} pages", pages.len(), urls.len());

        pages.into_iter().map(|(_, page)| page).collect()
    }
}

/// Write crawled pages to `crawled_<YYYYmmdd_HHMMSS_micros>_<uuid>.json` under `dir`
///
/// Every call gets its own file, so concurrent requests never overwrite
/// each other's archive. Returns `None` without touching the filesystem
/// when there is nothing to save.
#[inline]
pub fn save_crawled_data(dir: &Path, pages: &[PageContent]) -> Result<Option<PathBuf>> {
    if pages.is_empty() {
        return Ok(None);
    }

    fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "crawled_{}_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S_%6f"),
        Uuid::new_v4().simple()
    ));
    let json = serde_json::to_string_pretty(pages).context("Failed to serialize crawled pages")?;
    let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    file.write_all(json.as_bytes())?;

    debug!("Saved {} crawled pages to {}", pages.len(), path.display());
    Ok(Some(path))
}
