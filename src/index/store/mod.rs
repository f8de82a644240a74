//! Persisted position-to-chunk mapping and index generations
//!
//! Every successful rebuild publishes a new generation directory holding
//! both the vector index and its document mapping. The `CURRENT` file names
//! the live generation and is replaced atomically, so readers always see a
//! matching index/mapping pair and an interrupted rebuild leaves the
//! previous generation in place.


use anyhow::Context;
use fs2::FileExt;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::VectorIndex;
use crate::embeddings::Embedding;
use crate::{RagError, Result};

const CURRENT_FILE: &str = "CURRENT";
const GENERATIONS_DIR: &str = "generations";
const INDEX_FILE: &str = "vectors.idx";
const MAPPING_FILE: &str = "mapping.json";
const LOCK_FILE: &str = ".rebuild.lock";
const STAGING_PREFIX: &str = ".staging-";
const KEEP_GENERATIONS: usize = 2;

/// A bounded unit of source text, as stored in the document mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(rename = "file_name")]
    pub source_file: String,
    #[serde(rename = "page_no")]
    pub sequence_no: usize,
    pub text: String,
}

impl Chunk {
    #[inline]
    pub fn new(source_file: impl Into<String>, sequence_no: usize, text: impl Into<String>) -> Self {
        Self {
            source_file: source_file.into(),
            sequence_no,
            text: text.into(),
        }
    }
}

/// Dense mapping from index position to chunk
///
/// Serialized as a JSON object with string-encoded integer keys. Loading
/// rejects mappings whose keys are not exactly `0..len`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "HashMap<String, Chunk>")]
pub struct DocumentMapping {
    records: Vec<Chunk>,
}

impl DocumentMapping {
    #[inline]
    pub fn new(records: Vec<Chunk>) -> Self {
        Self { records }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn get(&self, position: usize) -> Option<&Chunk> {
        self.records.get(position)
    }

    #[inline]
    pub fn records(&self) -> &[Chunk] {
        &self.records
    }

    #[inline]
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .with_context(|| format!("Failed to write document mapping to {}", path.display()))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    #[inline]
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            RagError::Consistency(format!(
                "invalid document mapping {}: {}",
                path.display(),
                e
            ))
        })
    }
}

impl Serialize for DocumentMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.records.len()))?;
        for (position, chunk) in self.records.iter().enumerate() {
            map.serialize_entry(&position.to_string(), chunk)?;
        }
        map.end()
    }
}

impl TryFrom<HashMap<String, Chunk>> for DocumentMapping {
    type Error = String;

    fn try_from(raw: HashMap<String, Chunk>) -> std::result::Result<Self, Self::Error> {
        let len = raw.len();
        let mut slots: Vec<Option<Chunk>> = vec![None; len];

        for (key, chunk) in raw {
            let position: usize = key
                .parse()
                .map_err(|_| format!("mapping key {key:?} is not a position"))?;
            let slot = slots
                .get_mut(position)
                .ok_or_else(|| format!("mapping position {position} is out of range 0..{len}"))?;
            // Distinct keys can still parse to the same position ("1" and "01")
            if slot.replace(chunk).is_some() {
                return Err(format!("mapping position {position} appears twice"));
            }
        }

        let records = slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| slot.ok_or_else(|| format!("mapping position {position} is missing")))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { records })
    }
}

/// A loaded, mutually consistent index and mapping pair
#[derive(Debug)]
pub struct IndexGeneration {
    pub id: String,
    pub index: VectorIndex,
    pub mapping: DocumentMapping,
}

impl IndexGeneration {
    /// Chunks closest to `query`, nearest first
    #[inline]
    pub fn retrieve(&self, query: &Embedding, k: usize) -> Result<Vec<&Chunk>> {
        self.index
            .query(query, k)?
            .into_iter()
            .map(|position| {
                self.mapping.get(position).ok_or_else(|| {
                    RagError::Consistency(format!(
                        "generation {} has no mapping entry for position {}",
                        self.id, position
                    ))
                })
            })
            .collect()
    }
}

/// Exclusive cross-process rebuild lock, released on drop
#[derive(Debug)]
pub struct RebuildLock {
    file: File,
}

impl Drop for RebuildLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release rebuild lock: {}", e);
        }
    }
}

/// On-disk home of all index generations
#[derive(Debug, Clone)]
pub struct IndexStore {
    root: PathBuf,
}

impl IndexStore {
    #[inline]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generations_dir(&self) -> PathBuf {
        self.root.join(GENERATIONS_DIR)
    }

    fn generation_dir(&self, id: &str) -> PathBuf {
        self.generations_dir().join(id)
    }

    /// Block until no other process is rebuilding this store
    #[inline]
    pub fn lock_rebuild(&self) -> Result<RebuildLock> {
        fs::create_dir_all(&self.root)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(RebuildLock { file })
    }

    /// Id of the live generation, if any generation was ever published
    #[inline]
    pub fn current_id(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(CURRENT_FILE)) {
            Ok(contents) => {
                let id = contents.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of all published generations, oldest first
    #[inline]
    pub fn generation_ids(&self) -> Result<Vec<String>> {
        let dir = self.generations_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Write a new generation and make it current
    ///
    /// Nothing visible to readers changes until the final rename of the
    /// `CURRENT` pointer.
    #[inline]
    pub fn publish(&self, index: &VectorIndex, mapping: &DocumentMapping) -> Result<String> {
        if index.len() != mapping.len() {
            return Err(RagError::Consistency(format!(
                "index has {} entries but mapping has {}",
                index.len(),
                mapping.len()
            )));
        }

        let generations = self.generations_dir();
        fs::create_dir_all(&generations)?;

        let id = self.next_generation_id()?;
        let staging = generations.join(format!("{STAGING_PREFIX}{id}"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        index.save(&staging.join(INDEX_FILE))?;
        mapping.save(&staging.join(MAPPING_FILE))?;
        fs::rename(&staging, self.generation_dir(&id))?;

        self.write_current(&id)?;
        info!(
            "Published index generation {} with {} entries",
            id,
            mapping.len()
        );

        self.prune(&id)?;
        Ok(id)
    }

    /// Load the live generation
    #[inline]
    pub fn load_current(&self) -> Result<Option<IndexGeneration>> {
        match self.current_id()? {
            Some(id) => self.load_generation(&id).map(Some),
            None => Ok(None),
        }
    }

    #[inline]
    pub fn load_generation(&self, id: &str) -> Result<IndexGeneration> {
        let dir = self.generation_dir(id);
        let index = VectorIndex::load(&dir.join(INDEX_FILE))
            .map_err(|e| RagError::Consistency(format!("generation {id}: {e}")))?;
        let mapping = DocumentMapping::load(&dir.join(MAPPING_FILE))?;

        if index.len() != mapping.len() {
            return Err(RagError::Consistency(format!(
                "generation {} has {} index entries but {} mapping entries",
                id,
                index.len(),
                mapping.len()
            )));
        }

        debug!("Loaded index generation {} ({} entries)", id, mapping.len());
        Ok(IndexGeneration {
            id: id.to_string(),
            index,
            mapping,
        })
    }

    fn next_generation_id(&self) -> Result<String> {
        let latest = self
            .generation_ids()?
            .iter()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok(format!("{:08}", latest + 1))
    }

    fn write_current(&self, id: &str) -> Result<()> {
        let tmp = self.root.join(format!("{CURRENT_FILE}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(id.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.root.join(CURRENT_FILE))?;
        Ok(())
    }

    fn prune(&self, current: &str) -> Result<()> {
        let ids = self.generation_ids()?;
        let excess = ids.len().saturating_sub(KEEP_GENERATIONS);

        for id in ids.iter().take(excess).filter(|id| id.as_str() != current) {
            debug!("Removing old index generation {}", id);
            if let Err(e) = fs::remove_dir_all(self.generation_dir(id)) {
                warn!("Failed to remove old index generation {}: {}", id, e);
            }
        }
        Ok(())
    }
}

/// Shared read access to the live generation
///
/// The loaded generation is cached and reloaded only when `CURRENT` moves,
/// so requests already holding an `Arc` keep querying the generation they
/// started with.
#[derive(Debug)]
pub struct IndexHandle {
    store: IndexStore,
    cached: RwLock<Option<Arc<IndexGeneration>>>,
}

impl IndexHandle {
    #[inline]
    pub fn new(store: IndexStore) -> Self {
        Self {
            store,
            cached: RwLock::new(None),
        }
    }

    #[inline]
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// The live generation, or `None` before the first rebuild
    #[inline]
    pub fn current(&self) -> Result<Option<Arc<IndexGeneration>>> {
        let Some(id) = self.store.current_id()? else {
            return Ok(None);
        };

        {
            let cached = self.cached.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(generation) = cached.as_ref().filter(|g| g.id == id) {
                return Ok(Some(Arc::clone(generation)));
            }
        }

        let generation = Arc::new(self.store.load_generation(&id)?);
        let mut cached = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        *cached = Some(Arc::clone(&generation));
        Ok(Some(generation))
    }
}
