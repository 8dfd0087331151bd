use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::credentials::Passphrase;
use crate::models::{ArchiveError, OutcomeStatus, OverwritePolicy, Result, SkipReason};

/// Which entries of an archive an operation applies to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum EntrySelector {
    #[default]
    All,
    /// One entry by path; a directory path also selects everything below it
    Path(String),
    /// Shell-style pattern matched against the full entry path
    Glob(String),
}

impl EntrySelector {
    pub fn path(path: impl Into<String>) -> Self {
        EntrySelector::Path(path.into())
    }

    pub fn glob(pattern: impl Into<String>) -> Self {
        EntrySelector::Glob(pattern.into())
    }

    /// Compile the selector. Fails with `InvalidSelector` on a malformed glob.
    pub fn matcher(&self) -> Result<SelectorMatcher> {
        let inner = match self {
            EntrySelector::All => Matcher::All,
            EntrySelector::Path(p) => {
                let normalized = normalize_selector_path(p);
                if normalized.is_empty() {
                    return Err(ArchiveError::InvalidSelector(p.clone()));
                }
                Matcher::Path(normalized)
            }
            EntrySelector::Glob(pattern) => {
                let compiled = glob::Pattern::new(pattern)
                    .map_err(|e| ArchiveError::InvalidSelector(format!("{}: {}", pattern, e)))?;
                Matcher::Glob(compiled)
            }
        };
        Ok(SelectorMatcher { inner })
    }
}

fn normalize_selector_path(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

enum Matcher {
    All,
    Path(String),
    Glob(glob::Pattern),
}

/// Compiled form of an [`EntrySelector`]
pub struct SelectorMatcher {
    inner: Matcher,
}

impl SelectorMatcher {
    pub fn matches(&self, entry_path: &str) -> bool {
        match &self.inner {
            Matcher::All => true,
            Matcher::Path(wanted) => {
                let entry = entry_path.trim_end_matches('/');
                entry == wanted
                    || (entry.len() > wanted.len()
                        && entry.starts_with(wanted.as_str())
                        && entry.as_bytes()[wanted.len()] == b'/')
            }
            Matcher::Glob(pattern) => pattern.matches(entry_path.trim_end_matches('/')),
        }
    }

    /// A single-path selector must match something; globs and `All` may match nothing.
    pub fn requires_match(&self) -> Option<&str> {
        match &self.inner {
            Matcher::Path(p) => Some(p.as_str()),
            _ => None,
        }
    }
}

/// Kind of work requested for one archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    ExtractEntry,
    ExtractAll,
    AddEntry,
    RemoveEntry,
    TestIntegrity,
    CreateArchive,
}

impl OperationKind {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            OperationKind::AddEntry | OperationKind::RemoveEntry | OperationKind::CreateArchive
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            OperationKind::ExtractEntry => "extract entry",
            OperationKind::ExtractAll => "extract all",
            OperationKind::AddEntry => "add",
            OperationKind::RemoveEntry => "remove",
            OperationKind::TestIntegrity => "test",
            OperationKind::CreateArchive => "create",
        }
    }
}

/// One unit of work submitted to the batch engine
///
/// Deserializable so batch jobs can be read from JSON; never serialized since
/// it may carry a passphrase.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub archive: PathBuf,
    #[serde(default)]
    pub selector: EntrySelector,
    /// Files and directories to add (AddEntry / CreateArchive)
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    /// Extraction target directory
    #[serde(default)]
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<Passphrase>,
    /// Falls back to the engine default when absent
    #[serde(default)]
    pub overwrite: Option<OverwritePolicy>,
    #[serde(default)]
    pub compression_level: Option<u32>,
}

impl OperationRequest {
    fn new(kind: OperationKind, archive: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            archive: archive.into(),
            selector: EntrySelector::All,
            sources: Vec::new(),
            destination: None,
            passphrase: None,
            overwrite: None,
            compression_level: None,
        }
    }

    pub fn extract_all(archive: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: Some(destination.into()),
            ..Self::new(OperationKind::ExtractAll, archive)
        }
    }

    pub fn extract_entry(
        archive: impl Into<PathBuf>,
        selector: EntrySelector,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            selector,
            destination: Some(destination.into()),
            ..Self::new(OperationKind::ExtractEntry, archive)
        }
    }

    pub fn add(archive: impl Into<PathBuf>, sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            ..Self::new(OperationKind::AddEntry, archive)
        }
    }

    pub fn remove(archive: impl Into<PathBuf>, selector: EntrySelector) -> Self {
        Self {
            selector,
            ..Self::new(OperationKind::RemoveEntry, archive)
        }
    }

    pub fn test(archive: impl Into<PathBuf>) -> Self {
        Self::new(OperationKind::TestIntegrity, archive)
    }

    pub fn create(archive: impl Into<PathBuf>, sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            ..Self::new(OperationKind::CreateArchive, archive)
        }
    }

    pub fn with_passphrase(mut self, passphrase: Passphrase) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    pub fn with_overwrite(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = Some(policy);
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = Some(level);
        self
    }

    /// Check the request shape before any archive is touched
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            OperationKind::ExtractEntry | OperationKind::ExtractAll => {
                if self.destination.is_none() {
                    return Err(ArchiveError::InvalidConfig(format!(
                        "{} request for {} has no destination",
                        self.kind.label(),
                        self.archive.display()
                    )));
                }
            }
            OperationKind::AddEntry | OperationKind::CreateArchive => {
                if self.sources.is_empty() {
                    return Err(ArchiveError::InvalidConfig(format!(
                        "{} request for {} has no sources",
                        self.kind.label(),
                        self.archive.display()
                    )));
                }
            }
            OperationKind::RemoveEntry | OperationKind::TestIntegrity => {}
        }
        if let Some(level) = self.compression_level {
            if level > 9 {
                return Err(ArchiveError::InvalidConfig(format!(
                    "compression level must be between 0 and 9, got {}",
                    level
                )));
            }
        }
        // Surfaces malformed globs early
        self.selector.matcher()?;
        Ok(())
    }
}

/// Lifecycle of a batch job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

/// Outcome of one batch item: an archive entry, a source file, or a whole request
#[derive(Debug)]
pub struct ItemOutcome {
    /// Index into the job's request list
    pub request_index: usize,
    pub archive: PathBuf,
    /// Entry path or source name; empty when the item is the whole request
    pub item: String,
    pub status: OutcomeStatus,
    pub bytes: u64,
    pub digest: Option<String>,
}

impl ItemOutcome {
    pub fn label(&self) -> String {
        if self.item.is_empty() {
            self.archive.display().to_string()
        } else {
            format!("{} :: {}", self.archive.display(), self.item)
        }
    }
}

/// Ordered requests plus the aggregate state the engine maintains while running them
///
/// Only the batch engine mutates a job. Once terminal it is immutable and a
/// second run fails with `JobAlreadyFinished`.
#[derive(Debug)]
pub struct BatchJob {
    pub(crate) requests: Vec<OperationRequest>,
    pub(crate) status: JobStatus,
    pub(crate) outcomes: Vec<ItemOutcome>,
    pub(crate) total_items: u64,
    pub(crate) completed_items: u64,
    pub(crate) total_bytes: Option<u64>,
    pub(crate) completed_bytes: u64,
}

impl BatchJob {
    pub fn new(requests: Vec<OperationRequest>) -> Self {
        Self {
            requests,
            status: JobStatus::Pending,
            outcomes: Vec::new(),
            total_items: 0,
            completed_items: 0,
            total_bytes: None,
            completed_bytes: 0,
        }
    }

    /// Read a job description from a JSON array of requests
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ArchiveError::from_io(e, path.display()))?;
        let requests: Vec<OperationRequest> = serde_json::from_str(&content).map_err(|e| {
            ArchiveError::InvalidConfig(format!("Malformed batch file {}: {}", path.display(), e))
        })?;
        Ok(Self::new(requests))
    }

    pub fn requests(&self) -> &[OperationRequest] {
        &self.requests
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn outcomes(&self) -> &[ItemOutcome] {
        &self.outcomes
    }

    pub fn total_items(&self) -> u64 {
        self.total_items
    }

    pub fn completed_items(&self) -> u64 {
        self.completed_items
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes
    }

    pub fn summary(&self) -> BatchSummary<'_> {
        let mut summary = BatchSummary {
            status: self.status,
            succeeded: 0,
            failed: Vec::new(),
            skipped: Vec::new(),
        };
        for outcome in &self.outcomes {
            match outcome.status {
                OutcomeStatus::Succeeded => summary.succeeded += 1,
                OutcomeStatus::Failed(_) => summary.failed.push(outcome),
                OutcomeStatus::Skipped(_) => summary.skipped.push(outcome),
            }
        }
        summary
    }
}

/// Terminal report of a batch job
#[derive(Debug)]
pub struct BatchSummary<'a> {
    pub status: JobStatus,
    pub succeeded: usize,
    pub failed: Vec<&'a ItemOutcome>,
    pub skipped: Vec<&'a ItemOutcome>,
}

impl BatchSummary<'_> {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed.len() + self.skipped.len()
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Skipped(r) if r == reason))
            .count()
    }

    /// `Cancelled` for a cancelled job, `PartialBatchFailure` when any item failed.
    pub fn into_result(self) -> Result<()> {
        if self.status == JobStatus::Cancelled {
            return Err(ArchiveError::Cancelled);
        }
        if !self.failed.is_empty() {
            return Err(ArchiveError::PartialBatchFailure {
                failed: self.failed.len(),
                total: self.total(),
            });
        }
        Ok(())
    }
}
