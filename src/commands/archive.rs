use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::batch::{self, JobHandle};
use crate::core::compression::ArchiveProcessor;
use crate::core::credentials::Passphrase;
use crate::core::registry::{Capabilities, Confidence, FormatId};
use crate::core::session::{ArchiveSession, OpenOptions};
use crate::models::{
    BatchJob, EngineConfig, EntryDescriptor, OperationRequest, Result,
};
use crate::utils::{CancellationToken, ProgressEmitter, ProgressSink};

/// Summary of an archive for display
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub format: FormatId,
    /// Whether the format came from a signature or only from the file name
    pub confidence: Confidence,
    pub capabilities: Capabilities,
    pub multi_volume: bool,
    pub entry_count: usize,
    /// Sum of uncompressed file sizes
    pub total_size: u64,
    pub encrypted_entries: usize,
}

/// Open an archive for reading
pub fn open_archive(path: impl AsRef<Path>) -> Result<ArchiveSession> {
    ArchiveSession::open(path.as_ref(), OpenOptions::default())
}

/// Open an archive with an explicit mode and/or passphrase
///
/// # Arguments
/// * `path` - Archive on disk
/// * `options` - `OpenOptions::read_write()` for add/remove, a passphrase for
///   header-encrypted archives
pub fn open_archive_with(path: impl AsRef<Path>, options: OpenOptions) -> Result<ArchiveSession> {
    ArchiveSession::open(path.as_ref(), options)
}

/// Entry metadata of an open archive; no entry body is decoded
pub fn list_entries(session: &ArchiveSession) -> Result<Arc<Vec<EntryDescriptor>>> {
    session.list_entries()
}

/// Describe an archive: format, capabilities and entry totals
///
/// # Arguments
/// * `path` - Archive on disk
/// * `passphrase` - Needed only when entry names are encrypted
///
/// # Returns
/// * Archive summary
pub fn archive_info(path: impl AsRef<Path>, passphrase: Option<Passphrase>) -> Result<ArchiveInfo> {
    let session = ArchiveSession::open(
        path.as_ref(),
        OpenOptions {
            passphrase,
            ..OpenOptions::default()
        },
    )?;
    let entries = session.list_entries()?;
    let handle = session.handle();

    let info = ArchiveInfo {
        path: handle.path.clone(),
        format: handle.format,
        confidence: handle.confidence,
        capabilities: handle.capabilities,
        multi_volume: handle.multi_volume,
        entry_count: entries.len(),
        total_size: entries
            .iter()
            .filter(|e| !e.is_directory)
            .map(|e| e.size)
            .sum(),
        encrypted_entries: entries.iter().filter(|e| e.is_encrypted).count(),
    };
    session.close();
    Ok(info)
}

/// Start a batch job on a background thread
///
/// # Arguments
/// * `job` - Pending job with its ordered requests
/// * `config` - Engine defaults
/// * `sink` - Progress subscriber; events arrive from worker threads
///
/// # Returns
/// * Handle to cancel or wait for the job
pub fn submit_batch(job: BatchJob, config: EngineConfig, sink: Arc<dyn ProgressSink>) -> JobHandle {
    batch::submit_batch(job, config, sink)
}

/// Request cancellation of a running job
pub fn cancel(handle: &JobHandle) {
    handle.cancel();
}

/// Run a single request to completion on the calling thread
///
/// # Returns
/// * The finished job, holding one outcome per touched entry
pub fn run_request(
    request: OperationRequest,
    config: &EngineConfig,
    sink: Arc<dyn ProgressSink>,
) -> Result<BatchJob> {
    let mut job = BatchJob::new(vec![request]);
    batch::run_batch(
        &mut job,
        config,
        ProgressEmitter::new(sink),
        &CancellationToken::new(),
    )?;
    Ok(job)
}

/// Default extraction directory for an archive
///
/// # Arguments
/// * `archive_path` - Archive on disk
/// * `config` - `last_extract_dir` wins over the archive's own directory
pub fn default_extract_dir(archive_path: &Path, config: &EngineConfig) -> PathBuf {
    let beside = ArchiveProcessor::default_extract_dir(archive_path);
    match (&config.last_extract_dir, beside.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => beside,
    }
}
