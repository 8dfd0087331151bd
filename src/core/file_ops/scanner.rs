use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::{ArchiveError, Result};

/// A file or directory on disk destined for an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    /// Absolute or caller-relative path on disk
    pub source: PathBuf,
    /// Entry name inside the archive, forward slashes
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Recursive source scanner for archive creation
///
/// Each given path becomes a top-level entry named after its final component;
/// directories are expanded recursively beneath that name. Maintains relative
/// paths for preserving directory hierarchy.
pub struct FileScanner {
    follow_links: bool,
}

impl FileScanner {
    pub fn new() -> Self {
        Self {
            follow_links: false,
        }
    }

    /// Expand the given paths into archive entries
    ///
    /// # Arguments
    /// * `sources` - Files and directories chosen by the caller
    ///
    /// # Returns
    /// * Entries in a stable order: sources as given, directory contents sorted by name
    pub fn collect(&self, sources: &[PathBuf]) -> Result<Vec<SourceItem>> {
        let mut items = Vec::new();

        for source in sources {
            let metadata =
                fs::metadata(source).map_err(|e| ArchiveError::from_io(e, source.display()))?;
            let base_name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    ArchiveError::InvalidConfig(format!(
                        "Source has no file name: {}",
                        source.display()
                    ))
                })?;

            if metadata.is_file() {
                items.push(SourceItem {
                    source: source.clone(),
                    name: base_name,
                    is_dir: false,
                    size: metadata.len(),
                });
                continue;
            }

            // Walk directory tree
            for entry in WalkDir::new(source)
                .follow_links(self.follow_links)
                .sort_by_file_name()
            {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        log::warn!("Skipping unreadable path under {}: {}", source.display(), e);
                        continue;
                    }
                };
                let path = entry.path();
                let relative = path.strip_prefix(source).map_err(|e| {
                    ArchiveError::InvalidConfig(format!("Failed to calculate relative path: {}", e))
                })?;
                let name = if relative.as_os_str().is_empty() {
                    base_name.clone()
                } else {
                    format!("{}/{}", base_name, to_entry_name(relative))
                };

                let file_type = entry.file_type();
                if file_type.is_dir() {
                    items.push(SourceItem {
                        source: path.to_path_buf(),
                        name,
                        is_dir: true,
                        size: 0,
                    });
                } else if file_type.is_file() {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    items.push(SourceItem {
                        source: path.to_path_buf(),
                        name,
                        is_dir: false,
                        size,
                    });
                }
            }
        }

        Ok(items)
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Relative path to an archive entry name
pub fn to_entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn total_size(items: &[SourceItem]) -> u64 {
    items.iter().map(|i| i.size).sum()
}
