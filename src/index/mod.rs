//! Approximate nearest-neighbour index over unit-length embeddings
//!
//! Search runs on an HNSW graph from `hnsw_rs`. Graph hits are only
//! candidates: they are re-ranked exactly by angular distance. When the k-th
//! and (k+1)-th candidates share a distance, every entry at that distance is
//! collected by a full scan, so ties resolve by position (lower position
//! first) even when the graph reached only some of them.
//!
//! Indexes are immutable: `build` constructs one from scratch and there is
//! no insert API. Only the vectors are persisted; the graph is rebuilt from
//! them in position order on load.

pub mod store;


use anyhow::Context;
use hnsw_rs::hnsw::{Hnsw, Neighbour};
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

use crate::embeddings::{Embedding, dot};
use crate::{RagError, Result};

pub use store::{Chunk, DocumentMapping, IndexGeneration, IndexHandle, IndexStore};

/// Connections kept per graph node
pub const MAX_CONNECTIONS: usize = 16;

/// Candidate list width while inserting into the graph
pub const EF_CONSTRUCTION: usize = 200;

/// Lower bound on the candidate list width while searching
pub const MIN_EF_SEARCH: usize = 64;

const MAX_LAYERS: usize = 16;
const FORMAT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexData {
    version: u32,
    dimension: usize,
    trees: usize,
    vectors: Vec<Vec<f32>>,
}

/// Read-only approximate nearest-neighbour index
pub struct VectorIndex {
    data: IndexData,
    graph: Hnsw<'static, f32, DistCosine>,
}

impl fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorIndex")
            .field("len", &self.len())
            .field("dimension", &self.data.dimension)
            .field("trees", &self.data.trees)
            .finish_non_exhaustive()
    }
}

impl PartialEq for VectorIndex {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl VectorIndex {
    /// Build an index from scratch
    ///
    /// `trees` scales search breadth: a query for `k` entries explores at
    /// least `k * trees` graph candidates before the exact re-rank.
    #[inline]
    pub fn build(vectors: &[Embedding], trees: usize) -> Result<Self> {
        if trees == 0 {
            return Err(RagError::Index("an index needs a search breadth of at least one".to_string()));
        }

        let dimension = vectors.first().map_or(0, Embedding::dimension);
        if let Some((position, bad)) = vectors
            .iter()
            .enumerate()
            .find(|(_, v)| v.dimension() != dimension)
        {
            return Err(RagError::Index(format!(
                "vector {} has {} dimensions, expected {}",
                position,
                bad.dimension(),
                dimension
            )));
        }

        let data = IndexData {
            version: FORMAT_VERSION,
            dimension,
            trees,
            vectors: vectors.iter().map(|v| v.as_slice().to_vec()).collect(),
        };
        let index = Self::from_data(data);

        info!(
            "Built vector index: {} vectors, {} dimensions, search breadth {}",
            index.len(),
            index.data.dimension,
            trees
        );

        Ok(index)
    }

    fn from_data(data: IndexData) -> Self {
        let mut graph: Hnsw<'static, f32, DistCosine> = Hnsw::new(
            MAX_CONNECTIONS,
            data.vectors.len().max(1),
            MAX_LAYERS,
            EF_CONSTRUCTION,
            DistCosine,
        );

        // Serial inserts in position order keep the graph reproducible
        for (position, vector) in data.vectors.iter().enumerate() {
            graph.insert((vector, position));
        }

        graph.set_searching_mode(true);

        Self { data, graph }
    }

    /// Number of indexed vectors
    #[inline]
    pub fn len(&self) -> usize {
        self.data.vectors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.vectors.is_empty()
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.data.dimension
    }

    #[inline]
    pub fn trees(&self) -> usize {
        self.data.trees
    }

    /// Positions of the `k` entries closest to `vector` by angular distance,
    /// nearest first
    #[inline]
    pub fn query(&self, vector: &Embedding, k: usize) -> Result<Vec<usize>> {
        Ok(self
            .query_with_distances(vector, k)?
            .into_iter()
            .map(|(position, _)| position)
            .collect())
    }

    /// Like [`query`](Self::query) but also returns the angular distance of each hit
    #[inline]
    pub fn query_with_distances(&self, vector: &Embedding, k: usize) -> Result<Vec<(usize, f32)>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        if vector.dimension() != self.data.dimension {
            return Err(RagError::Index(format!(
                "query has {} dimensions, index has {}",
                vector.dimension(),
                self.data.dimension
            )));
        }

        let query = vector.as_slice();
        let ef_search = k.saturating_mul(self.data.trees).max(MIN_EF_SEARCH);

        // A graph walk this wide would visit every entry anyway
        let mut scored: Vec<(usize, f32)> = if ef_search >= self.len() {
            self.scan(query, |_| true)
        } else {
            let query_vec = query.to_vec();
            let neighbours: Vec<Neighbour> = self.graph.search(&query_vec, ef_search, ef_search);
            neighbours
                .into_iter()
                .filter(|n| n.d_id < self.len())
                .map(|n| (n.d_id, angular_distance(query, &self.data.vectors[n.d_id])))
                .collect()
        };
        sort_hits(&mut scored);

        if scored.len() > k && scored[k - 1].1.total_cmp(&scored[k].1).is_eq() {
            let boundary = scored[k - 1].1;
            debug!("Distance tie at rank {}, collecting all entries at {}", k, boundary);
            scored = self.scan(query, |distance| distance <= boundary);
            sort_hits(&mut scored);
        }

        scored.truncate(k);
        Ok(scored)
    }

    fn scan(&self, query: &[f32], keep: impl Fn(f32) -> bool) -> Vec<(usize, f32)> {
        self.data
            .vectors
            .iter()
            .enumerate()
            .map(|(position, v)| (position, angular_distance(query, v)))
            .filter(|&(_, distance)| keep(distance))
            .collect()
    }

    /// Write the index to `path`
    #[inline]
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &self.data)
            .with_context(|| format!("Failed to serialize index to {}", path.display()))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        debug!("Saved vector index with {} vectors to {}", self.len(), path.display());
        Ok(())
    }

    /// Read an index written by [`save`](Self::save), validating it and
    /// rebuilding its search graph
    #[inline]
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let data: IndexData = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("Failed to deserialize index from {}", path.display()))?;
        validate(&data)?;
        let index = Self::from_data(data);
        debug!("Loaded vector index with {} vectors from {}", index.len(), path.display());
        Ok(index)
    }
}

fn validate(data: &IndexData) -> Result<()> {
    if data.version != FORMAT_VERSION {
        return Err(RagError::Index(format!(
            "unsupported index format version {}",
            data.version
        )));
    }

    if data.trees == 0 {
        return Err(RagError::Index("stored search breadth is zero".to_string()));
    }

    if data.vectors.iter().any(|v| v.len() != data.dimension) {
        return Err(RagError::Index("stored vectors have mixed dimensions".to_string()));
    }

    if data.vectors.iter().flatten().any(|x| !x.is_finite()) {
        return Err(RagError::Index("stored vectors contain non-finite values".to_string()));
    }

    Ok(())
}

fn sort_hits(hits: &mut [(usize, f32)]) {
    hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
}

/// Angular distance between unit vectors: `sqrt(2 - 2 cos)`
fn angular_distance(a: &[f32], b: &[f32]) -> f32 {
    (2.0 - 2.0 * dot(a, b)).max(0.0).sqrt()
}
