use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::models::{ArchiveError, Result};

/// A new archive being written next to its final location
///
/// The bytes go to a hidden temporary file in the target's directory, so the
/// final rename stays on one filesystem. `commit` moves it over the target;
/// dropping without commit deletes it, which leaves the target untouched on
/// cancellation or failure.
pub struct StagedArchive {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedArchive {
    /// Stage a replacement for `target`
    ///
    /// # Arguments
    /// * `target` - Final archive path; its parent directory must exist
    pub fn new(target: &Path) -> Result<Self> {
        let parent = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "archive".to_string());

        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", name))
            .suffix(".partial")
            .tempfile_in(&parent)
            .map_err(|e| ArchiveError::from_io(e, parent.display()))?;

        log::debug!(
            "Staging {} at {}",
            target.display(),
            temp.path().display()
        );

        Ok(Self {
            temp,
            target: target.to_path_buf(),
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        self.temp.as_file_mut()
    }

    /// Temporary location of the staged bytes
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Atomically replace the target with the staged file
    pub fn commit(self) -> Result<PathBuf> {
        self.temp.as_file().sync_all().map_err(|e| ArchiveError::from_io(e, self.target.display()))?;
        log::debug!("Moving {} over {}", self.path().display(), self.target.display());
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| ArchiveError::from_io(e.error, target.display()))?;
        Ok(target)
    }
}
