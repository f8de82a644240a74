//! Ingestion of source files into the knowledge base
//!
//! A file moves through `Received -> Copied -> Chunked -> Persisted`, and
//! then every persisted artifact is re-embedded into a brand-new index
//! generation (`Embedded -> Indexed`). Nothing readers can see changes
//! until the new generation is published, so a failure at any step leaves
//! the previous generation serving queries.

pub mod artifacts;
pub mod chunking;

#[cfg(test)]
mod tests;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embeddings::Embedder;
use crate::index::{Chunk, DocumentMapping, IndexStore, VectorIndex};
use crate::llm::{GenerativeModel, PageRasterizer, Part, summarize_image};
use crate::{RagError, Result};

pub use artifacts::{ArtifactStore, FileArtifact};
pub use chunking::{ChunkBoundary, ChunkingConfig, split_csv, split_text};

const EMBED_PROGRESS_BATCH: usize = 64;

/// Progress of a single file through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestState {
    Received,
    Copied,
    Chunked,
    Persisted,
    Embedded,
    Indexed,
}

/// How a source file is turned into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Text,
    Tabular,
    Image,
    Paged,
}

impl FileKind {
    /// Dispatch on the (case-insensitive) extension; `None` when unsupported
    #[inline]
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "txt" | "md" => Some(Self::Text),
            "csv" => Some(Self::Tabular),
            "png" | "jpg" | "jpeg" | "webp" => Some(Self::Image),
            "pdf" => Some(Self::Paged),
            _ => None,
        }
    }

    #[inline]
    pub fn needs_model(self) -> bool {
        matches!(self, Self::Image | Self::Paged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildSummary {
    pub generation: String,
    pub files: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// Base name the file is stored and referenced under
    pub source_name: String,
    pub kind: Option<FileKind>,
    /// Last state the file reached
    pub state: IngestState,
    pub chunk_count: usize,
    pub rebuild: Option<RebuildSummary>,
}

/// Pacing between calls to the summarization service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryPacing {
    pub page_delay: Duration,
    pub document_cooldown: Duration,
}

impl Default for SummaryPacing {
    #[inline]
    fn default() -> Self {
        Self {
            page_delay: Duration::from_millis(1000),
            document_cooldown: Duration::from_millis(10_000),
        }
    }
}

pub struct IngestionPipeline {
    knowledge_dir: PathBuf,
    artifacts: ArtifactStore,
    store: IndexStore,
    chunking: ChunkingConfig,
    n_trees: usize,
    embedder: Arc<dyn Embedder>,
    model: Option<Arc<dyn GenerativeModel>>,
    rasterizer: Arc<dyn PageRasterizer>,
    pacing: SummaryPacing,
    rebuild_guard: Mutex<()>,
    show_progress: bool,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("knowledge_dir", &self.knowledge_dir)
            .field("artifacts", &self.artifacts)
            .field("store", &self.store)
            .field("chunking", &self.chunking)
            .field("n_trees", &self.n_trees)
            .field("has_model", &self.model.is_some())
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    #[inline]
    pub fn new(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        model: Option<Arc<dyn GenerativeModel>>,
        rasterizer: Arc<dyn PageRasterizer>,
    ) -> Self {
        Self {
            knowledge_dir: config.knowledge_dir(),
            artifacts: ArtifactStore::new(config.artifacts_dir()),
            store: IndexStore::new(config.index_dir()),
            chunking: config.chunking.clone(),
            n_trees: config.index.n_trees,
            embedder,
            model,
            rasterizer,
            pacing: SummaryPacing {
                page_delay: Duration::from_millis(config.llm.page_delay_ms),
                document_cooldown: Duration::from_millis(config.llm.document_cooldown_ms),
            },
            rebuild_guard: Mutex::new(()),
            show_progress: false,
        }
    }

    #[inline]
    pub fn with_pacing(mut self, pacing: SummaryPacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Show a progress bar on stderr while embedding, if stderr is a terminal
    #[inline]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    #[inline]
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    #[inline]
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Run one file through every pipeline state, finishing with a full rebuild
    ///
    /// Unsupported file types stop after the copy without error.
    #[inline]
    pub fn ingest_file(&self, path: &Path) -> Result<IngestOutcome> {
        let source_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                RagError::InvalidInput(format!("not a file name: {}", path.display()))
            })?;

        if !path.is_file() {
            return Err(RagError::InvalidInput(format!(
                "no such file: {}",
                path.display()
            )));
        }

        let kind = FileKind::from_path(path);
        if kind.is_some_and(FileKind::needs_model) && self.model.is_none() {
            return Err(RagError::ExternalService(format!(
                "{source_name} needs the summarization model, which is not configured"
            )));
        }

        info!("Ingesting {}", source_name);
        let stored = self.copy_into_knowledge(path, &source_name)?;

        let Some(kind) = kind else {
            warn!("Unsupported file type for {}; copied but not indexed", source_name);
            return Ok(IngestOutcome {
                source_name,
                kind: None,
                state: IngestState::Copied,
                chunk_count: 0,
                rebuild: None,
            });
        };

        let pages = self.chunk_file(kind, &stored)?;
        debug!("{} produced {} chunks", source_name, pages.len());
        let chunk_count = pages.len();

        let artifact = FileArtifact {
            file_type: extension_of(&stored),
            pages,
        };
        self.artifacts.save(&source_name, &artifact)?;

        let summary = self.rebuild()?;

        Ok(IngestOutcome {
            source_name,
            kind: Some(kind),
            state: IngestState::Indexed,
            chunk_count,
            rebuild: Some(summary),
        })
    }

    /// Rebuild the index and mapping from every persisted artifact
    ///
    /// Only one rebuild runs at a time, in this process and across processes.
    #[inline]
    pub fn rebuild(&self) -> Result<RebuildSummary> {
        let _guard = self
            .rebuild_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _lock = self.store.lock_rebuild()?;

        let artifacts = self.artifacts.load_all()?;
        let files = artifacts.len();
        let chunks = collect_chunks(artifacts);

        let embeddings = self.embed_chunks(&chunks)?;
        let index = VectorIndex::build(&embeddings, self.n_trees)?;
        let mapping = DocumentMapping::new(chunks);
        let generation = self.store.publish(&index, &mapping)?;

        info!(
            "Rebuilt index generation {} from {} files ({} chunks)",
            generation,
            files,
            mapping.len()
        );

        Ok(RebuildSummary {
            generation,
            files,
            chunks: mapping.len(),
        })
    }

    /// Copy into the knowledge directory; copying a file onto itself is a no-op
    fn copy_into_knowledge(&self, path: &Path, source_name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.knowledge_dir)?;
        let destination = self.knowledge_dir.join(source_name);

        let same_file = match (fs::canonicalize(path), fs::canonicalize(&destination)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };

        if same_file {
            debug!("{} is already in the knowledge directory", source_name);
        } else {
            fs::copy(path, &destination)?;
        }

        Ok(destination)
    }

    fn chunk_file(&self, kind: FileKind, path: &Path) -> Result<Vec<String>> {
        match kind {
            FileKind::Text => {
                let bytes = fs::read(path)?;
                Ok(split_text(&String::from_utf8_lossy(&bytes), &self.chunking))
            }
            FileKind::Tabular => {
                let bytes = fs::read(path)?;
                Ok(split_csv(&bytes, &self.chunking)?)
            }
            FileKind::Image => {
                let model = self.require_model()?;
                let image = Part::image(fs::read(path)?)?;
                Ok(vec![summarize_image(model, image)?])
            }
            FileKind::Paged => self.summarize_pages(path),
        }
    }

    fn summarize_pages(&self, path: &Path) -> Result<Vec<String>> {
        let model = self.require_model()?;
        let pages = self.rasterizer.rasterize(path)?;
        let total = pages.len();
        let mut summaries = Vec::with_capacity(total);

        for (number, page) in pages.into_iter().enumerate() {
            if number > 0 {
                std::thread::sleep(self.pacing.page_delay);
            }
            debug!("Summarizing page {}/{} of {}", number + 1, total, path.display());
            summaries.push(summarize_image(model, Part::image(page)?)?);
        }

        std::thread::sleep(self.pacing.document_cooldown);
        Ok(summaries)
    }

    fn require_model(&self) -> Result<&dyn GenerativeModel> {
        self.model.as_deref().ok_or_else(|| {
            RagError::ExternalService("summarization model is not configured".to_string())
        })
    }

    fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<crate::embeddings::Embedding>> {
        let bar = if self.show_progress && console::user_attended_stderr() {
            ProgressStyle::with_template("{bar:40} [{pos}/{len}] Embedding chunks")
                .map(|style| ProgressBar::new(chunks.len() as u64).with_style(style))
                .unwrap_or_else(|_| ProgressBar::new(chunks.len() as u64))
        } else {
            ProgressBar::hidden()
        };

        let mut embeddings = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_PROGRESS_BATCH) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            embeddings.extend(self.embedder.embed_batch(&texts)?);
            bar.inc(batch.len() as u64);
        }
        bar.finish_and_clear();

        Ok(embeddings)
    }
}

/// Concatenate artifacts in enumeration order into position-ordered chunks
///
/// Whitespace-only pages cannot be embedded and are left out of the index.
/// Their sequence numbers stay reserved, so stored artifacts still hold the
/// full `ceil(len / (size - overlap))` window count while the index holds
/// only the non-blank windows.
fn collect_chunks(artifacts: Vec<(String, FileArtifact)>) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for (source_name, artifact) in artifacts {
        for (sequence_no, text) in artifact.pages.into_iter().enumerate() {
            if text.trim().is_empty() {
                warn!("Skipping blank chunk {} of {}", sequence_no, source_name);
                continue;
            }
            chunks.push(Chunk::new(source_name.clone(), sequence_no, text));
        }
    }
    chunks
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}
