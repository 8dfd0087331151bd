// Archive format adapters
pub mod common;
pub mod tar_handler;
pub mod zip_handler;

#[path = "7z_handler.rs"]
pub mod sevenz_handler;

#[cfg(feature = "rar")]
pub mod rar_handler;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::registry::FormatId;
use crate::models::{ArchiveError, Result};
use common::ArchiveBackend;
use sevenz_handler::SevenZHandler;
use tar_handler::TarHandler;
use zip_handler::ZipHandler;

/// Routes each format to the backend that implements it
///
/// Workflow:
/// 1. The registry identifies the format of an archive
/// 2. `get_handler` picks the backend for that format
/// 3. The session drives list / extract / test / write through it
pub struct ArchiveProcessor {
    handlers: Vec<Arc<dyn ArchiveBackend>>,
}

impl ArchiveProcessor {
    /// Create a processor with every backend compiled into this build
    pub fn new() -> Self {
        #[allow(unused_mut)]
        let mut handlers: Vec<Arc<dyn ArchiveBackend>> = vec![
            Arc::new(ZipHandler::new()),
            Arc::new(SevenZHandler::new()),
            Arc::new(TarHandler::new()),
        ];
        #[cfg(feature = "rar")]
        handlers.push(Arc::new(rar_handler::RarHandler::new()));

        Self { handlers }
    }

    /// Get the backend for a format
    ///
    /// # Arguments
    /// * `format` - Format reported by the registry
    ///
    /// # Returns
    /// * Backend that supports this format
    pub fn get_handler(&self, format: FormatId) -> Result<Arc<dyn ArchiveBackend>> {
        for handler in &self.handlers {
            if handler.supports(format) {
                return Ok(Arc::clone(handler));
            }
        }

        Err(ArchiveError::UnsupportedFormat(format!(
            "{} support is not compiled into this build",
            format
        )))
    }

    /// Check if a format has a backend in this build
    pub fn is_supported(&self, format: FormatId) -> bool {
        self.handlers.iter().any(|h| h.supports(format))
    }

    /// Default extraction directory next to an archive
    ///
    /// # Example
    /// ```ignore
    /// "photos.zip" -> "photos"
    /// "backup.tar.gz" -> "backup"
    /// ```
    pub fn default_extract_dir(archive_path: &Path) -> PathBuf {
        let name = archive_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("archive");
        let lower = name.to_ascii_lowercase();

        let stem_len = [
            ".tar.gz", ".tar.bz2", ".tar.xz", ".tar.zst", ".tgz", ".tbz2", ".txz", ".tzst",
        ]
        .iter()
        .find(|suffix| lower.ends_with(*suffix))
        .map(|suffix| name.len() - suffix.len())
        .or_else(|| name.rfind('.').filter(|i| *i > 0))
        .unwrap_or(name.len());

        let stem = &name[..stem_len];
        let stem = if stem.is_empty() { "archive" } else { stem };
        match archive_path.parent() {
            Some(p) => p.join(stem),
            None => PathBuf::from(stem),
        }
    }
}

impl Default for ArchiveProcessor {
    fn default() -> Self {
        Self::new()
    }
}
