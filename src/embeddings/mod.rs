// Embeddings module
// Text-to-vector contract plus the Ollama-backed and local hashing implementations

pub mod hashing;
pub mod ollama;

#[cfg(test)]
mod tests;

use crate::{RagError, Result};

pub use hashing::HashEmbedder;
pub use ollama::OllamaClient;

/// A unit-length embedding vector
///
/// Construction always normalizes, so cosine similarity between two
/// embeddings is their dot product.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Normalize raw model output into an embedding
    ///
    /// Rejects empty, non-finite and zero-length vectors instead of
    /// producing a degenerate embedding.
    #[inline]
    pub fn from_raw(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(RagError::Embedding("embedding has no dimensions".to_string()));
        }

        if values.iter().any(|v| !v.is_finite()) {
            return Err(RagError::Embedding(
                "embedding contains NaN or infinite values".to_string(),
            ));
        }

        let norm = l2_norm(&values);
        if norm <= f32::EPSILON {
            return Err(RagError::Embedding("embedding has zero length".to_string()));
        }

        Ok(Self(values.into_iter().map(|v| v / norm).collect()))
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    #[inline]
    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// Cosine similarity with another embedding of the same dimension
    #[inline]
    pub fn cosine_similarity(&self, other: &Self) -> f32 {
        cosine_similarity(&self.0, &other.0)
    }
}

/// Turns text into fixed-dimension unit vectors
///
/// Implementations must be deterministic for a fixed model, and
/// `embed_batch` must agree with `embed` item for item.
pub trait Embedder: Send + Sync {
    /// Output dimension of every embedding this embedder produces
    fn dimension(&self) -> usize;

    /// Embed a single text. Empty or whitespace-only input is an input error.
    fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed many texts, preserving order
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Reject input that cannot be meaningfully embedded
#[inline]
pub fn ensure_embeddable(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(RagError::InvalidInput(
            "cannot embed empty text".to_string(),
        ));
    }
    Ok(())
}

/// Cosine similarity of two raw vectors; 0.0 when either has zero length
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}

#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}
