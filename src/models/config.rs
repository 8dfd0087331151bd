use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::ArchiveError;

/// Smallest streaming buffer; smaller chunks only add syscall overhead.
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
/// Largest streaming buffer; bigger chunks delay cancellation checks too much.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// What to do when an extracted entry already exists on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverwritePolicy {
    /// Leave the existing file alone and record the entry as skipped
    #[default]
    Skip,
    /// Replace the existing file
    Overwrite,
    /// Write next to the existing file as `name (1).ext`, `name (2).ext`, ...
    Rename,
}

/// How a batch reacts to a failed item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Record the failure and keep going
    #[default]
    ContinueOnError,
    /// Stop at the first failure; remaining items are recorded as skipped
    AbortOnError,
}

/// Engine configuration
///
/// Supplied by the configuration collaborator. The engine treats every value
/// as a default that individual requests may override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Compression level used when a request does not name one (0 - 9)
    pub compression_level: u32,
    pub overwrite_policy: OverwritePolicy,
    pub failure_policy: FailurePolicy,
    /// Streaming buffer size in bytes; bounds both memory and cancellation latency
    pub chunk_size: usize,
    /// Emit a progress event at least every this many bytes
    pub progress_granularity: u64,
    /// Archives processed in parallel by a batch (0 = one per CPU core)
    pub worker_limit: usize,
    /// Compute a SHA-256 digest of every extracted entry
    pub compute_digest: bool,
    /// Opaque to the engine, carried for the caller
    pub last_extract_dir: Option<PathBuf>,
    /// Opaque to the engine, carried for the caller
    pub last_archive_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
            overwrite_policy: OverwritePolicy::Skip,
            failure_policy: FailurePolicy::ContinueOnError,
            chunk_size: 64 * 1024,
            progress_granularity: 1024 * 1024,
            worker_limit: 1,
            compute_digest: false,
            last_extract_dir: None,
            last_archive_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file. Missing fields fall back to defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ArchiveError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ArchiveError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ArchiveError> {
        let config: EngineConfig = serde_json::from_str(content)
            .map_err(|e| ArchiveError::InvalidConfig(format!("Malformed configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.compression_level > 9 {
            return Err(ArchiveError::InvalidConfig(format!(
                "compressionLevel must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ArchiveError::InvalidConfig(format!(
                "chunkSize must be between {} and {} bytes, got {}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        if self.progress_granularity == 0 {
            return Err(ArchiveError::InvalidConfig(
                "progressGranularity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of worker threads a batch may use
    pub fn effective_workers(&self) -> usize {
        if self.worker_limit == 0 {
            num_cpus::get()
        } else {
            self.worker_limit
        }
    }
}
