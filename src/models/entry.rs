use std::path::PathBuf;
use std::time::SystemTime;

use serde::Serialize;

use crate::models::{ArchiveError, ErrorKind};

/// One logical member of an archive, as reported by a listing
///
/// Listings keep archive-native order; nothing here is re-sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDescriptor {
    /// Relative path with forward slashes, no trailing slash
    pub path: String,
    pub size: u64,
    /// Unknown for members of a compressed TAR stream
    pub compressed_size: Option<u64>,
    pub modified: Option<SystemTime>,
    /// Stored CRC-32, when the format keeps one
    pub crc32: Option<u32>,
    pub is_directory: bool,
    pub is_encrypted: bool,
}

impl EntryDescriptor {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            compressed_size: None,
            modified: None,
            crc32: None,
            is_directory: false,
            is_encrypted: false,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            is_directory: true,
            ..Self::file(path, 0)
        }
    }
}

/// Why an entry or batch item was not processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// The destination already existed and the overwrite policy is `Skip`
    AlreadyExists,
    /// An earlier item failed under `AbortOnError`
    AbortedAfterError,
    /// The job was cancelled before this item ran
    Cancelled,
    /// Links, devices and other members that have no file to extract
    UnsupportedEntryType,
}

/// Result of processing one entry or one batch item
#[derive(Debug)]
pub enum OutcomeStatus {
    Succeeded,
    Skipped(SkipReason),
    Failed(ArchiveError),
}

impl OutcomeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeStatus::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, OutcomeStatus::Failed(_))
    }

    pub fn error(&self) -> Option<&ArchiveError> {
        match self {
            OutcomeStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Per-entry outcome produced by a codec adapter
#[derive(Debug)]
pub struct EntryOutcome {
    pub path: String,
    pub status: OutcomeStatus,
    /// Uncompressed bytes moved for this entry
    pub bytes: u64,
    /// Where the entry landed on disk (extraction only)
    pub target: Option<PathBuf>,
    /// Hex SHA-256 of the extracted content, when requested
    pub digest: Option<String>,
}

impl EntryOutcome {
    pub fn succeeded(path: impl Into<String>, bytes: u64) -> Self {
        Self {
            path: path.into(),
            status: OutcomeStatus::Succeeded,
            bytes,
            target: None,
            digest: None,
        }
    }

    pub fn skipped(path: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            path: path.into(),
            status: OutcomeStatus::Skipped(reason),
            bytes: 0,
            target: None,
            digest: None,
        }
    }

    pub fn failed(path: impl Into<String>, error: ArchiveError) -> Self {
        Self {
            path: path.into(),
            status: OutcomeStatus::Failed(error),
            bytes: 0,
            target: None,
            digest: None,
        }
    }

    pub fn with_target(mut self, target: PathBuf) -> Self {
        self.target = Some(target);
        self
    }
}

/// Verdict of an integrity test for a single entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum IntegrityStatus {
    Ok,
    Failed { kind: ErrorKind, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityResult {
    pub path: String,
    pub status: IntegrityStatus,
}

impl IntegrityResult {
    pub fn is_ok(&self) -> bool {
        self.status == IntegrityStatus::Ok
    }
}

impl From<EntryOutcome> for IntegrityResult {
    fn from(outcome: EntryOutcome) -> Self {
        let status = match outcome.status {
            OutcomeStatus::Succeeded | OutcomeStatus::Skipped(_) => IntegrityStatus::Ok,
            OutcomeStatus::Failed(err) => IntegrityStatus::Failed {
                kind: err.kind(),
                reason: err.to_string(),
            },
        };
        Self {
            path: outcome.path,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_from_failed_outcome() {
        let outcome = EntryOutcome::failed(
            "docs/a.txt",
            ArchiveError::CorruptEntry {
                entry: "docs/a.txt".into(),
                reason: "crc mismatch".into(),
            },
        );
        let result = IntegrityResult::from(outcome);
        assert!(!result.is_ok());
        match result.status {
            IntegrityStatus::Failed { kind, reason } => {
                assert_eq!(kind, ErrorKind::CorruptEntry);
                assert!(reason.contains("crc mismatch"));
            }
            IntegrityStatus::Ok => panic!("Expected failed verdict"),
        }
    }

    #[test]
    fn test_integrity_from_success() {
        let result = IntegrityResult::from(EntryOutcome::succeeded("a", 10));
        assert!(result.is_ok());
    }

    #[test]
    fn test_directory_descriptor() {
        let dir = EntryDescriptor::directory("nested/dir");
        assert!(dir.is_directory);
        assert_eq!(dir.size, 0);
        assert!(!dir.is_encrypted);
    }
}
