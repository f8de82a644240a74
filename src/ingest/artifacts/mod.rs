
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::Result;

const ARTIFACT_EXTENSION: &str = "json";

/// Chunked form of one ingested file, persisted so rebuilds never re-chunk
/// or re-summarize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileArtifact {
    /// Lowercased extension of the source file
    #[serde(rename = "type")]
    pub file_type: String,
    pub pages: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    #[inline]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[inline]
    pub fn path_for(&self, source_name: &str) -> PathBuf {
        self.dir.join(format!("{source_name}.{ARTIFACT_EXTENSION}"))
    }

    /// Persist the artifact for `source_name`, replacing any earlier one
    #[inline]
    pub fn save(&self, source_name: &str, artifact: &FileArtifact) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(source_name);
        let tmp = path.with_extension(format!("{ARTIFACT_EXTENSION}.tmp"));

        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, artifact)
                .with_context(|| format!("Failed to serialize artifact for {source_name}"))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(
            "Saved artifact for {} with {} pages",
            source_name,
            artifact.pages.len()
        );
        Ok(path)
    }

    #[inline]
    pub fn load(&self, source_name: &str) -> Result<FileArtifact> {
        let path = self.path_for(source_name);
        let file = File::open(&path)?;
        let artifact = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse artifact {}", path.display()))?;
        Ok(artifact)
    }

    /// Every stored artifact with its source name, sorted by source name
    #[inline]
    pub fn load_all(&self) -> Result<Vec<(String, FileArtifact)>> {
        let names = self.source_names()?;
        names
            .into_iter()
            .map(|name| {
                let artifact = self.load(&name)?;
                Ok((name, artifact))
            })
            .collect()
    }

    /// Source names that have an artifact, in the order rebuilds consume them
    #[inline]
    pub fn source_names(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }

        names.sort();
        Ok(names)
    }
}
