use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::core::compression::common::{
    ArchiveBackend, ArchiveHandle, ExtractOptions, OpenMode, OperationContext, OutcomeSink,
    UpdateReport, WriteOptions,
};
use crate::core::compression::ArchiveProcessor;
use crate::core::credentials::Passphrase;
use crate::core::file_ops::FileScanner;
use crate::core::registry::{self, capabilities_of, Capabilities, FormatId};
use crate::models::{
    ArchiveError, EntryDescriptor, EntryOutcome, EntrySelector, IntegrityResult, OverwritePolicy,
    Result, SelectorMatcher,
};
use crate::utils::CancellationToken;

/// How to open an archive
#[derive(Debug, Default, Clone)]
pub struct OpenOptions {
    pub mode: OpenMode,
    pub passphrase: Option<Passphrase>,
}

impl OpenOptions {
    pub fn read_write() -> Self {
        Self {
            mode: OpenMode::ReadWrite,
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: Passphrase) -> Self {
        self.passphrase = Some(passphrase);
        self
    }
}

/// Per-call extraction settings
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractSettings {
    pub overwrite: OverwritePolicy,
    pub stop_on_error: bool,
    pub compute_digest: bool,
}

/// Per-call settings for create, add and remove
#[derive(Debug, Clone, Copy)]
pub struct WriteSettings {
    /// 0 - 9
    pub compression_level: u32,
    pub stop_on_error: bool,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            compression_level: 6,
            stop_on_error: false,
        }
    }
}

/// Observable state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Ready,
    Reading,
    Writing,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    Closing,
    Closed,
}

struct LockState {
    phase: Phase,
    readers: usize,
    writer: bool,
    /// A writer is waiting for readers to drain; new readers wait behind it
    writer_pending: bool,
}

/// One open archive
///
/// Any number of reads may run at once. A write waits for running reads to
/// finish and holds new ones back meanwhile; a second concurrent write is
/// refused with `ArchiveLocked` instead of queueing.
pub struct ArchiveSession {
    handle: ArchiveHandle,
    backend: Arc<dyn ArchiveBackend>,
    passphrase: Mutex<Option<Passphrase>>,
    lock: Mutex<LockState>,
    changed: Condvar,
    /// First listing, dropped by every write
    cache: Mutex<Option<Arc<Vec<EntryDescriptor>>>>,
    /// Tripped by `close`; operations stop at the next entry boundary
    drain: CancellationToken,
}

struct ReadGuard<'a>(&'a ArchiveSession);

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock_state();
        state.readers -= 1;
        self.0.changed.notify_all();
    }
}

struct WriteGuard<'a>(&'a ArchiveSession);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.invalidate_cache();
        let mut state = self.0.lock_state();
        state.writer = false;
        self.0.changed.notify_all();
    }
}

impl ArchiveSession {
    /// Open an archive: detect its format, pick a backend and read the listing
    ///
    /// # Arguments
    /// * `path` - Archive on disk
    /// * `options` - Open mode and optional passphrase
    ///
    /// # Returns
    /// * A ready session, with the listing already cached
    pub fn open(path: &Path, options: OpenOptions) -> Result<Self> {
        let detection = registry::detect_path(path)?;
        let capabilities = capabilities_of(detection.format);
        check_capabilities(detection.format, capabilities, options.mode, options.passphrase.as_ref())?;

        let backend = ArchiveProcessor::new().get_handler(detection.format)?;
        let handle = ArchiveHandle {
            path: path.to_path_buf(),
            format: detection.format,
            confidence: detection.confidence,
            mode: options.mode,
            has_passphrase: options.passphrase.is_some(),
            capabilities,
            multi_volume: detection.format == FormatId::Rar && registry::is_multi_volume_name(path),
        };

        // Header-encrypted archives fail here without the right passphrase
        let entries = backend.list(&handle, options.passphrase.as_ref())?;
        log::info!(
            "Opened {} archive {} ({} entries)",
            handle.format,
            path.display(),
            entries.len()
        );

        Ok(Self {
            handle,
            backend,
            passphrase: Mutex::new(options.passphrase),
            lock: Mutex::new(LockState {
                phase: Phase::Ready,
                readers: 0,
                writer: false,
                writer_pending: false,
            }),
            changed: Condvar::new(),
            cache: Mutex::new(Some(Arc::new(entries))),
            drain: CancellationToken::new(),
        })
    }

    pub fn handle(&self) -> &ArchiveHandle {
        &self.handle
    }

    pub fn path(&self) -> &Path {
        &self.handle.path
    }

    pub fn format(&self) -> FormatId {
        self.handle.format
    }

    pub fn state(&self) -> SessionState {
        let state = self.lock_state();
        match state.phase {
            Phase::Closed => SessionState::Closed,
            Phase::Closing => SessionState::Closing,
            Phase::Ready if state.writer => SessionState::Writing,
            Phase::Ready if state.readers > 0 => SessionState::Reading,
            Phase::Ready => SessionState::Ready,
        }
    }

    /// Entry metadata, served from the cache after the first listing
    pub fn list_entries(&self) -> Result<Arc<Vec<EntryDescriptor>>> {
        let _guard = self.begin_read()?;
        if let Some(cached) = self.cache().as_ref() {
            return Ok(Arc::clone(cached));
        }
        let passphrase = self.passphrase();
        let entries = Arc::new(self.backend.list(&self.handle, passphrase.as_ref())?);
        *self.cache() = Some(Arc::clone(&entries));
        Ok(entries)
    }

    /// Extract selected entries, handing each outcome to `on_outcome` as it is produced
    pub fn extract(
        &self,
        selector: &SelectorMatcher,
        destination: &Path,
        settings: ExtractSettings,
        ctx: &OperationContext,
        on_outcome: &mut dyn FnMut(EntryOutcome),
    ) -> Result<()> {
        let _guard = self.begin_read()?;
        let passphrase = self.passphrase();
        let options = ExtractOptions {
            selector,
            destination,
            passphrase: passphrase.as_ref(),
            overwrite: settings.overwrite,
            stop_on_error: settings.stop_on_error,
            compute_digest: settings.compute_digest,
        };
        let ctx = ctx.clone().with_drain(self.drain.clone());
        let mut sink = OutcomeSink::new(on_outcome, settings.stop_on_error);
        self.backend.extract(&self.handle, &options, &ctx, &mut sink)
    }

    /// Extract every entry and collect the outcomes
    pub fn extract_all(
        &self,
        destination: &Path,
        settings: ExtractSettings,
        ctx: &OperationContext,
    ) -> Result<Vec<EntryOutcome>> {
        let matcher = EntrySelector::All.matcher()?;
        let mut outcomes = Vec::new();
        self.extract(&matcher, destination, settings, ctx, &mut |o| outcomes.push(o))?;
        Ok(outcomes)
    }

    /// Decode every entry and verify it, streaming one outcome per entry
    pub fn test_entries(
        &self,
        stop_on_error: bool,
        ctx: &OperationContext,
        on_outcome: &mut dyn FnMut(EntryOutcome),
    ) -> Result<()> {
        let _guard = self.begin_read()?;
        let passphrase = self.passphrase();
        let ctx = ctx.clone().with_drain(self.drain.clone());
        let mut sink = OutcomeSink::new(on_outcome, stop_on_error);
        self.backend
            .test_integrity(&self.handle, passphrase.as_ref(), &ctx, &mut sink)
    }

    /// Integrity verdict for every entry; the archive is left untouched
    pub fn test_integrity(&self, ctx: &OperationContext) -> Result<Vec<IntegrityResult>> {
        let mut results = Vec::new();
        self.test_entries(false, ctx, &mut |o| results.push(IntegrityResult::from(o)))?;
        Ok(results)
    }

    /// Add files and directories, replacing entries with the same name
    pub fn add(
        &self,
        sources: &[PathBuf],
        settings: WriteSettings,
        ctx: &OperationContext,
    ) -> Result<UpdateReport> {
        let items = FileScanner::new().collect(sources)?;
        let _guard = self.begin_write()?;
        let passphrase = self.passphrase();
        let options = WriteOptions {
            passphrase: passphrase.as_ref(),
            compression_level: settings.compression_level,
            stop_on_error: settings.stop_on_error,
        };
        let ctx = ctx.clone().with_drain(self.drain.clone());
        self.backend.update(&self.handle, &items, None, &options, &ctx)
    }

    /// Remove entries matching `selector`; a single-path selector must match something
    pub fn remove(
        &self,
        selector: &SelectorMatcher,
        settings: WriteSettings,
        ctx: &OperationContext,
    ) -> Result<UpdateReport> {
        let _guard = self.begin_write()?;
        let passphrase = self.passphrase();
        let options = WriteOptions {
            passphrase: passphrase.as_ref(),
            compression_level: settings.compression_level,
            stop_on_error: settings.stop_on_error,
        };
        let ctx = ctx.clone().with_drain(self.drain.clone());
        self.backend
            .update(&self.handle, &[], Some(selector), &options, &ctx)
    }

    /// Check a passphrase by decoding the smallest encrypted entry
    ///
    /// # Returns
    /// * `true` when it decodes (or nothing is encrypted), `false` for a wrong passphrase
    pub fn verify_passphrase(&self, passphrase: &Passphrase) -> Result<bool> {
        let entries = self.list_entries()?;
        let Some(smallest) = entries
            .iter()
            .filter(|e| e.is_encrypted && !e.is_directory)
            .min_by_key(|e| e.size)
        else {
            return Ok(true);
        };

        let _guard = self.begin_read()?;
        let scratch = tempfile::TempDir::new().map_err(|e| ArchiveError::from_io(e, "scratch directory"))?;
        let matcher = EntrySelector::path(smallest.path.clone()).matcher()?;
        let options = ExtractOptions {
            selector: &matcher,
            destination: scratch.path(),
            passphrase: Some(passphrase),
            overwrite: OverwritePolicy::Overwrite,
            stop_on_error: true,
            compute_digest: false,
        };
        let mut verdict = None;
        let mut deliver = |o: EntryOutcome| {
            verdict.get_or_insert(o.status);
        };
        let mut sink = OutcomeSink::new(&mut deliver, true);
        let result = self
            .backend
            .extract(&self.handle, &options, &OperationContext::detached(), &mut sink);
        drop(sink);

        match result {
            Err(e) if e.is_credential_error() => return Ok(false),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        match verdict.as_ref().and_then(|s| s.error()) {
            Some(e) if e.is_credential_error() => Ok(false),
            Some(e) => Err(ArchiveError::CorruptEntry {
                entry: smallest.path.clone(),
                reason: e.to_string(),
            }),
            None => Ok(true),
        }
    }

    /// Stop in-flight operations at their next entry boundary and release the archive
    ///
    /// Waits for running operations to reach that point. Later calls on the
    /// session fail with `SessionClosed`; closing twice is a no-op.
    pub fn close(&self) {
        let mut state = self.lock_state();
        if state.phase == Phase::Closed {
            return;
        }
        state.phase = Phase::Closing;
        self.drain.cancel();
        self.changed.notify_all();
        while state.readers > 0 || state.writer {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.phase = Phase::Closed;
        drop(state);

        self.invalidate_cache();
        self.passphrase.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.changed.notify_all();
        log::debug!("Closed session for {}", self.handle.path.display());
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cache(&self) -> MutexGuard<'_, Option<Arc<Vec<EntryDescriptor>>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn invalidate_cache(&self) {
        self.cache().take();
    }

    fn passphrase(&self) -> Option<Passphrase> {
        self.passphrase
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn closed_error(&self) -> ArchiveError {
        ArchiveError::SessionClosed(self.handle.path.clone())
    }

    fn begin_read(&self) -> Result<ReadGuard<'_>> {
        let mut state = self.lock_state();
        loop {
            if state.phase != Phase::Ready {
                return Err(self.closed_error());
            }
            if !state.writer && !state.writer_pending {
                state.readers += 1;
                return Ok(ReadGuard(self));
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn begin_write(&self) -> Result<WriteGuard<'_>> {
        if self.handle.mode != OpenMode::ReadWrite {
            return Err(ArchiveError::ReadOnly(format!(
                "{} was opened read-only",
                self.handle.path.display()
            )));
        }
        let mut state = self.lock_state();
        if state.phase != Phase::Ready {
            return Err(self.closed_error());
        }
        if state.writer || state.writer_pending {
            return Err(ArchiveError::ArchiveLocked(self.handle.path.clone()));
        }
        state.writer_pending = true;
        while state.readers > 0 {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
            if state.phase != Phase::Ready {
                state.writer_pending = false;
                self.changed.notify_all();
                return Err(self.closed_error());
            }
        }
        state.writer_pending = false;
        state.writer = true;
        Ok(WriteGuard(self))
    }
}

/// Refuse writes to read-only formats and passphrases for formats without encryption
fn check_capabilities(
    format: FormatId,
    capabilities: Capabilities,
    mode: OpenMode,
    passphrase: Option<&Passphrase>,
) -> Result<()> {
    if mode == OpenMode::ReadWrite && !capabilities.can_write {
        return Err(ArchiveError::ReadOnly(format!("{} archives cannot be modified", format)));
    }
    if passphrase.is_some() && !capabilities.can_password {
        return Err(ArchiveError::InvalidConfig(format!(
            "{} archives do not support passphrases",
            format
        )));
    }
    Ok(())
}

/// Write a new archive whose format follows the target's file name
///
/// # Arguments
/// * `target` - Archive to create; replaced atomically if it exists
/// * `sources` - Files and directories to pack
/// * `passphrase` - Encrypts entries for formats that support it
///
/// # Returns
/// * One outcome per packed item
pub fn create_archive(
    target: &Path,
    sources: &[PathBuf],
    passphrase: Option<&Passphrase>,
    settings: WriteSettings,
    ctx: &OperationContext,
) -> Result<Vec<EntryOutcome>> {
    let format = FormatId::from_output_path(target)?;
    check_capabilities(format, capabilities_of(format), OpenMode::ReadWrite, passphrase)?;
    let backend = ArchiveProcessor::new().get_handler(format)?;
    let items = FileScanner::new().collect(sources)?;

    let options = WriteOptions {
        passphrase,
        compression_level: settings.compression_level,
        stop_on_error: settings.stop_on_error,
    };
    backend.create(target, format, &items, &options, ctx)
}
