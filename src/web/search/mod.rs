
use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WebConfig;
use crate::{RagError, Result};

/// One organic search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub source: String,
}

/// An external web search service
pub trait SearchProvider: Send + Sync {
    /// Whether the provider can be called at all (credentials present)
    fn is_available(&self) -> bool {
        true
    }

    fn search(&self, query: &str, num_results: usize) -> Result<Vec<SearchResult>>;
}

#[derive(Debug, Deserialize)]
struct SerpApiResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
}

/// Google results through SerpAPI
#[derive(Debug, Clone)]
pub struct SerpApiProvider {
    endpoint: Url,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl SerpApiProvider {
    #[inline]
    pub fn new(config: &WebConfig, api_key: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(&config.serpapi_url).map_err(|e| {
            RagError::Config(format!("invalid search endpoint {}: {e}", config.serpapi_url))
        })?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_seconds)))
            .build()
            .into();

        Ok(Self {
            endpoint,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            agent,
        })
    }
}

impl SearchProvider for SerpApiProvider {
    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn search(&self, query: &str, num_results: usize) -> Result<Vec<SearchResult>> {
        let Some(api_key) = &self.api_key else {
            return Ok(Vec::new());
        };

        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("engine", "google")
            .append_pair("q", query)
            .append_pair("num", &num_results.to_string())
            .append_pair("api_key", api_key);

        debug!("Searching SerpAPI for {:?} ({} results)", query, num_results);

        let body = self
            .agent
            .get(url.as_str())
            .call()
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(|e| RagError::ExternalService(format!("SerpAPI request failed: {e}")))?;

        let response: SerpApiResponse = serde_json::from_str(&body)
            .map_err(|e| RagError::ExternalService(format!("malformed SerpAPI response: {e}")))?;

        Ok(response
            .organic_results
            .into_iter()
            .map(|result| SearchResult {
                title: result.title,
                url: result.link,
                snippet: result.snippet,
                source: "serpapi".to_string(),
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub results: Vec<SearchResult>,
    pub timestamp: DateTime<Utc>,
}

/// Persistent search cache, one JSON object keyed by query hash
///
/// Writers serialize on an exclusive lock of a sidecar `.lock` file and
/// replace the cache file by rename, so readers never see a partial write.
#[derive(Debug, Clone)]
pub struct SearchCache {
    path: PathBuf,
    ttl: TimeDelta,
}

impl SearchCache {
    #[inline]
    pub fn new(path: impl Into<PathBuf>, ttl: TimeDelta) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hex SHA-256 of `"{query}_{num_results}"`
    #[inline]
    pub fn key(query: &str, num_results: usize) -> String {
        hex::encode(Sha256::digest(format!("{query}_{num_results}").as_bytes()))
    }

    /// Cached results younger than the TTL at `now`
    #[inline]
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Vec<SearchResult>>> {
        let entries = self.read_entries()?;
        Ok(entries
            .get(key)
            .filter(|entry| now.signed_duration_since(entry.timestamp) < self.ttl)
            .map(|entry| entry.results.clone()))
    }

    #[inline]
    pub fn put(&self, key: &str, results: &[SearchResult], now: DateTime<Utc>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        lock.lock_exclusive()?;

        let result = self.write_entry(key, results, now);

        if let Err(e) = FileExt::unlock(&lock) {
            warn!("Failed to release search cache lock: {}", e);
        }
        result
    }

    fn write_entry(&self, key: &str, results: &[SearchResult], now: DateTime<Utc>) -> Result<()> {
        let mut entries = self.read_entries().unwrap_or_else(|e| {
            warn!("Discarding unreadable search cache: {}", e);
            HashMap::new()
        });
        entries.insert(
            key.to_string(),
            CacheEntry {
                results: results.to_vec(),
                timestamp: now,
            },
        );

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, &entries)
                .context("Failed to serialize search cache")?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read_entries(&self) -> Result<HashMap<String, CacheEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let entries = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse search cache {}", self.path.display()))?;
        Ok(entries)
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }
}

/// Cached web search that degrades to empty results instead of failing
#[derive(Clone)]
pub struct WebSearcher {
    provider: Arc<dyn SearchProvider>,
    cache: SearchCache,
}

impl std::fmt::Debug for WebSearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSearcher")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl WebSearcher {
    #[inline]
    pub fn new(provider: Arc<dyn SearchProvider>, cache: SearchCache) -> Self {
        Self { provider, cache }
    }

    #[inline]
    pub fn search(&self, query: &str, num_results: usize) -> Vec<SearchResult> {
        self.search_at(query, num_results, Utc::now())
    }

    /// Search as of `now`: fresh cache hits are returned as-is, otherwise
    /// the provider is called once and its outcome (even an empty one) cached
    #[inline]
    pub fn search_at(&self, query: &str, num_results: usize, now: DateTime<Utc>) -> Vec<SearchResult> {
        if !self.provider.is_available() {
            warn!("Web search requested but no search provider credentials are configured");
            return Vec::new();
        }

        let key = SearchCache::key(query, num_results);
        match self.cache.get(&key, now) {
            Ok(Some(results)) => {
                debug!("Search cache hit for {:?}", query);
                return results;
            }
            Ok(None) => {}
            Err(e) => warn!("Search cache unavailable, treating as miss: {}", e),
        }

        let results = match self.provider.search(query, num_results) {
            Ok(results) => {
                info!("Web search for {:?} returned {} results", query, results.len());
                results
            }
            Err(e) => {
                warn!("Web search for {:?} failed: {}", query, e);
                Vec::new()
            }
        };

        if let Err(e) = self.cache.put(&key, &results, now) {
            warn!("Failed to update search cache: {}", e);
        }

        results
    }
}
