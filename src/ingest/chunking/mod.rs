
use anyhow::{Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// How text is cut into chunks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkBoundary {
    /// Merge separator-delimited pieces up to the chunk size
    #[default]
    Lines,
    /// Exact fixed-size character windows
    Characters,
}

/// Configuration for text chunking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size in characters
    pub chunk_size: usize,
    /// Characters shared between adjacent chunks
    pub chunk_overlap: usize,
    /// Piece separator for line-based chunking
    pub separator: String,
    pub boundary: ChunkBoundary,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            separator: "\n".to_string(),
            boundary: ChunkBoundary::Lines,
        }
    }
}

/// Split text into overlapping chunks according to `config`
///
/// Sizes are counted in characters. Callers are expected to pass a
/// validated config (`chunk_overlap < chunk_size`).
#[inline]
pub fn split_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let chunks = match config.boundary {
        ChunkBoundary::Lines => split_on_separator(text, config),
        ChunkBoundary::Characters => split_windows(text, config.chunk_size, config.chunk_overlap),
    };

    debug!(
        "Split {} characters into {} chunks ({:?} boundary)",
        text.chars().count(),
        chunks.len(),
        config.boundary
    );
    chunks
}

/// Flatten CSV data into one line per record, cells joined by `" | "`
///
/// The first record is treated as a header and skipped.
#[inline]
pub fn csv_rows_as_text(data: &[u8]) -> Result<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data);

    let mut lines = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to parse CSV row {}", row + 1))?;
        lines.push(record.iter().join(" | "));
    }

    Ok(lines.join("\n"))
}

#[inline]
pub fn split_csv(data: &[u8], config: &ChunkingConfig) -> Result<Vec<String>> {
    let text = csv_rows_as_text(data)?;
    Ok(split_text(&text, config))
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Greedy merge of separator pieces, carrying trailing pieces as overlap
fn split_on_separator(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let separator = config.separator.as_str();
    let separator_len = char_len(separator);
    let pieces = text.split(separator).filter(|piece| !piece.is_empty());

    let mut chunks = Vec::new();
    let mut current: VecDeque<&str> = VecDeque::new();
    let mut total = 0;
    let joined_len = |current: &VecDeque<&str>| if current.is_empty() { 0 } else { separator_len };

    for piece in pieces {
        let piece_len = char_len(piece);

        if total + piece_len + joined_len(&current) > config.chunk_size && !current.is_empty() {
            push_trimmed(&mut chunks, &current.iter().join(separator));

            while total > config.chunk_overlap
                || (total > 0 && total + piece_len + joined_len(&current) > config.chunk_size)
            {
                let Some(dropped) = current.pop_front() else {
                    break;
                };
                total -= char_len(dropped) + if current.is_empty() { 0 } else { separator_len };
            }
        }

        if piece_len > config.chunk_size {
            warn!(
                "Piece of {} characters exceeds chunk size {}; keeping it whole",
                piece_len, config.chunk_size
            );
        }

        total += piece_len + joined_len(&current);
        current.push_back(piece);
    }

    if !current.is_empty() {
        push_trimmed(&mut chunks, &current.iter().join(separator));
    }

    chunks
}

/// Only the outer whitespace of a merged chunk is stripped; inner lines keep
/// their indentation
fn push_trimmed(chunks: &mut Vec<String>, chunk: &str) {
    let chunk = chunk.trim();
    if !chunk.is_empty() {
        chunks.push(chunk.to_string());
    }
}

/// Fixed windows of `size` characters, each starting `size - overlap` after the last
fn split_windows(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }

    chunks
}
