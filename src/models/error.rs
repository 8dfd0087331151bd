use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Error types for the archive engine
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupted archive {}: {reason}", .path.display())]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("Corrupted entry {entry}: {reason}")]
    CorruptEntry { entry: String, reason: String },

    #[error("Wrong passphrase for {0}")]
    WrongPassphrase(String),

    #[error("Passphrase required for {0}")]
    PassphraseRequired(String),

    #[error("Archive is locked by another writer: {}", .0.display())]
    ArchiveLocked(PathBuf),

    #[error("Insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{failed} of {total} batch items failed")]
    PartialBatchFailure { failed: usize, total: usize },

    #[error("Archive is read-only: {0}")]
    ReadOnly(String),

    #[error("Entry path escapes the destination: {0}")]
    UnsafeEntryPath(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Invalid entry selector: {0}")]
    InvalidSelector(String),

    #[error("Session is closed: {}", .0.display())]
    SessionClosed(PathBuf),

    #[error("Batch job has already run")]
    JobAlreadyFinished,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Error classification without payload, used in summaries and integrity reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    UnsupportedFormat,
    CorruptArchive,
    CorruptEntry,
    WrongPassphrase,
    PassphraseRequired,
    ArchiveLocked,
    InsufficientSpace,
    PermissionDenied,
    Cancelled,
    PartialBatchFailure,
    ReadOnly,
    UnsafeEntryPath,
    EntryNotFound,
    InvalidSelector,
    SessionClosed,
    JobAlreadyFinished,
    InvalidConfig,
    Io,
}

impl ArchiveError {
    /// Map an IO error to the dedicated kinds for permission and disk-space failures.
    ///
    /// `context` names the file or entry being written and ends up in the message.
    pub fn from_io(err: io::Error, context: impl fmt::Display) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                ArchiveError::PermissionDenied(format!("{}: {}", context, err))
            }
            io::ErrorKind::StorageFull => {
                ArchiveError::InsufficientSpace(format!("{}: {}", context, err))
            }
            _ if is_out_of_space(&err) => {
                ArchiveError::InsufficientSpace(format!("{}: {}", context, err))
            }
            _ => ArchiveError::Io(io::Error::new(err.kind(), format!("{}: {}", context, err))),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            ArchiveError::CorruptArchive { .. } => ErrorKind::CorruptArchive,
            ArchiveError::CorruptEntry { .. } => ErrorKind::CorruptEntry,
            ArchiveError::WrongPassphrase(_) => ErrorKind::WrongPassphrase,
            ArchiveError::PassphraseRequired(_) => ErrorKind::PassphraseRequired,
            ArchiveError::ArchiveLocked(_) => ErrorKind::ArchiveLocked,
            ArchiveError::InsufficientSpace(_) => ErrorKind::InsufficientSpace,
            ArchiveError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ArchiveError::Cancelled => ErrorKind::Cancelled,
            ArchiveError::PartialBatchFailure { .. } => ErrorKind::PartialBatchFailure,
            ArchiveError::ReadOnly(_) => ErrorKind::ReadOnly,
            ArchiveError::UnsafeEntryPath(_) => ErrorKind::UnsafeEntryPath,
            ArchiveError::EntryNotFound(_) => ErrorKind::EntryNotFound,
            ArchiveError::InvalidSelector(_) => ErrorKind::InvalidSelector,
            ArchiveError::SessionClosed(_) => ErrorKind::SessionClosed,
            ArchiveError::JobAlreadyFinished => ErrorKind::JobAlreadyFinished,
            ArchiveError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            ArchiveError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ArchiveError::Cancelled)
    }

    /// True for errors that mean "ask the user for a (different) passphrase".
    pub fn is_credential_error(&self) -> bool {
        matches!(
            self,
            ArchiveError::WrongPassphrase(_) | ArchiveError::PassphraseRequired(_)
        )
    }
}

#[cfg(unix)]
fn is_out_of_space(err: &io::Error) -> bool {
    // ENOSPC / EDQUOT
    matches!(err.raw_os_error(), Some(28) | Some(122))
}

#[cfg(windows)]
fn is_out_of_space(err: &io::Error) -> bool {
    // ERROR_HANDLE_DISK_FULL / ERROR_DISK_FULL
    matches!(err.raw_os_error(), Some(39) | Some(112))
}

#[cfg(not(any(unix, windows)))]
fn is_out_of_space(_err: &io::Error) -> bool {
    false
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
