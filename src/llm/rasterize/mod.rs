
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::{RagError, Result};

const DEFAULT_DPI: u32 = 150;

/// Renders each page of a paged document to an encoded image
pub trait PageRasterizer: Send + Sync {
    /// PNG bytes for every page, in page order
    fn rasterize(&self, document: &Path) -> Result<Vec<Vec<u8>>>;
}

/// Rasterizer backed by poppler's `pdftoppm` executable
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    program: PathBuf,
    dpi: u32,
}

impl Default for PdftoppmRasterizer {
    #[inline]
    fn default() -> Self {
        Self {
            program: PathBuf::from("pdftoppm"),
            dpi: DEFAULT_DPI,
        }
    }
}

impl PdftoppmRasterizer {
    #[inline]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    #[inline]
    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi.max(1);
        self
    }
}

impl PageRasterizer for PdftoppmRasterizer {
    fn rasterize(&self, document: &Path) -> Result<Vec<Vec<u8>>> {
        let output_dir = tempfile::tempdir()?;
        let prefix = output_dir.path().join("page");

        let output = Command::new(&self.program)
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(document)
            .arg(&prefix)
            .output()
            .map_err(|e| {
                RagError::ExternalService(format!(
                    "failed to run {}: {e}",
                    self.program.display()
                ))
            })?;

        if !output.status.success() {
            return Err(RagError::ExternalService(format!(
                "{} failed on {}: {}",
                self.program.display(),
                document.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let pages = page_files(output_dir.path())?;
        debug!("Rasterized {} into {} pages", document.display(), pages.len());

        pages
            .iter()
            .map(|page| fs::read(page).map_err(RagError::from))
            .collect()
    }
}

/// Rendered page images in page order
///
/// Page numbers are zero-padded to a common width, so name order is page order.
fn page_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pages: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("png"))
        .collect();
    pages.sort();
    Ok(pages)
}
