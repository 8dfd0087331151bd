// Archive backend trait and helpers shared by every format adapter

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::core::credentials::{classify_decode_failure, Passphrase};
use crate::core::file_ops::SourceItem;
use crate::core::registry::{Capabilities, Confidence, FormatId};
use crate::models::{
    ArchiveError, EntryDescriptor, EntryOutcome, OverwritePolicy, Result, SelectorMatcher,
    SkipReason,
};
use crate::utils::{CancellationToken, ProgressReporter};

/// How a session was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpenMode {
    #[default]
    Read,
    ReadWrite,
}

/// An opened archive as seen by a backend
#[derive(Debug, Clone)]
pub struct ArchiveHandle {
    pub path: PathBuf,
    pub format: FormatId,
    pub confidence: Confidence,
    pub mode: OpenMode,
    pub has_passphrase: bool,
    pub capabilities: Capabilities,
    pub multi_volume: bool,
}

/// Options for extraction
pub struct ExtractOptions<'a> {
    pub selector: &'a SelectorMatcher,
    pub destination: &'a Path,
    pub passphrase: Option<&'a Passphrase>,
    pub overwrite: OverwritePolicy,
    pub stop_on_error: bool,
    pub compute_digest: bool,
}

/// Options for create and update
pub struct WriteOptions<'a> {
    pub passphrase: Option<&'a Passphrase>,
    /// 0 - 9
    pub compression_level: u32,
    pub stop_on_error: bool,
}

/// Result of an in-place update
#[derive(Debug, Default)]
pub struct UpdateReport {
    /// One outcome per source item that was asked to be added
    pub added: Vec<EntryOutcome>,
    /// Entry paths dropped from the archive, including ones replaced by an added item
    pub removed: Vec<String>,
}

/// Trait for handling different archive formats
///
/// Per-entry problems are reported as outcomes; an `Err` return means the
/// whole operation failed (unreadable archive, cancellation, ...).
pub trait ArchiveBackend: Send + Sync {
    /// Check if this backend handles the given format
    fn supports(&self, format: FormatId) -> bool;

    /// Read entry metadata without decoding any entry body
    fn list(
        &self,
        handle: &ArchiveHandle,
        passphrase: Option<&Passphrase>,
    ) -> Result<Vec<EntryDescriptor>>;

    /// Extract selected entries, reporting one outcome per selected entry
    fn extract(
        &self,
        handle: &ArchiveHandle,
        options: &ExtractOptions<'_>,
        ctx: &OperationContext,
        sink: &mut OutcomeSink<'_>,
    ) -> Result<()>;

    /// Decode every entry and verify its checksum without writing anything
    fn test_integrity(
        &self,
        handle: &ArchiveHandle,
        passphrase: Option<&Passphrase>,
        ctx: &OperationContext,
        sink: &mut OutcomeSink<'_>,
    ) -> Result<()>;

    /// Write a new archive at `target`
    fn create(
        &self,
        target: &Path,
        _format: FormatId,
        _sources: &[SourceItem],
        _options: &WriteOptions<'_>,
        _ctx: &OperationContext,
    ) -> Result<Vec<EntryOutcome>> {
        Err(ArchiveError::ReadOnly(target.display().to_string()))
    }

    /// Add and/or remove entries, rewriting the archive
    fn update(
        &self,
        handle: &ArchiveHandle,
        _add: &[SourceItem],
        _remove: Option<&SelectorMatcher>,
        _options: &WriteOptions<'_>,
        _ctx: &OperationContext,
    ) -> Result<UpdateReport> {
        Err(ArchiveError::ReadOnly(handle.path.display().to_string()))
    }
}

/// Cancellation, progress and buffering shared by one running operation
#[derive(Clone)]
pub struct OperationContext {
    cancel: CancellationToken,
    /// Set when the owning session is closing; honored at entry boundaries only
    drain: Option<CancellationToken>,
    progress: Arc<ProgressReporter>,
    chunk_size: usize,
}

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

impl OperationContext {
    pub fn new(cancel: CancellationToken, progress: Arc<ProgressReporter>, chunk_size: usize) -> Self {
        Self {
            cancel,
            drain: None,
            progress,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Context with its own token and no progress subscriber
    pub fn detached() -> Self {
        Self::new(
            CancellationToken::new(),
            Arc::new(ProgressReporter::silent()),
            DEFAULT_CHUNK_SIZE,
        )
    }

    pub fn with_drain(mut self, drain: CancellationToken) -> Self {
        self.drain = Some(drain);
        self
    }

    /// Between chunks: only explicit cancellation interrupts an entry
    pub fn check_chunk(&self) -> Result<()> {
        self.cancel.check()
    }

    /// Between entries: cancellation or a closing session stops the operation
    pub fn check_entry(&self) -> Result<()> {
        self.cancel.check()?;
        match &self.drain {
            Some(drain) => drain.check(),
            None => Ok(()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Delivers per-entry outcomes and tracks whether the operation should stop
pub struct OutcomeSink<'a> {
    deliver: &'a mut dyn FnMut(EntryOutcome),
    stop_on_error: bool,
    failed: bool,
}

impl<'a> OutcomeSink<'a> {
    pub fn new(deliver: &'a mut dyn FnMut(EntryOutcome), stop_on_error: bool) -> Self {
        Self {
            deliver,
            stop_on_error,
            failed: false,
        }
    }

    /// Record an outcome. Returns `false` when the adapter should stop.
    pub fn record(&mut self, outcome: EntryOutcome) -> bool {
        if let Some(err) = outcome.status.error() {
            log::warn!("Entry {} failed: {}", outcome.path, err);
            self.failed = true;
        }
        (self.deliver)(outcome);
        !(self.failed && self.stop_on_error)
    }

    pub fn should_stop(&self) -> bool {
        self.failed && self.stop_on_error
    }
}

/// Totals of one streamed entry
#[derive(Debug, Clone, Default)]
pub struct CopyStats {
    pub bytes: u64,
    pub crc32: u32,
    pub digest: Option<String>,
}

/// Which side of a copy failed
#[derive(Debug)]
pub enum CopyError {
    Read(io::Error),
    Write(io::Error),
    Cancelled,
}

/// Stream `reader` into `writer` in `chunk_size` pieces
///
/// Checks for cancellation before every chunk and reports bytes to the
/// context's progress reporter as they move.
pub fn copy_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    ctx: &OperationContext,
    compute_digest: bool,
) -> std::result::Result<CopyStats, CopyError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; ctx.chunk_size()];
    let mut crc = crc32fast::Hasher::new();
    let mut sha = compute_digest.then(Sha256::new);
    let mut total = 0u64;

    loop {
        if ctx.check_chunk().is_err() {
            return Err(CopyError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        writer.write_all(&buf[..n]).map_err(CopyError::Write)?;
        crc.update(&buf[..n]);
        if let Some(sha) = sha.as_mut() {
            sha.update(&buf[..n]);
        }
        total += n as u64;
        ctx.progress().add_bytes(n as u64);
    }
    writer.flush().map_err(CopyError::Write)?;

    Ok(CopyStats {
        bytes: total,
        crc32: crc.finalize(),
        digest: sha.map(|s| format!("{:x}", s.finalize())),
    })
}

/// Read an unwanted body to its end, checking for cancellation between chunks
///
/// Skipped bytes are not reported as progress.
pub fn discard<R: Read + ?Sized>(
    reader: &mut R,
    ctx: &OperationContext,
) -> std::result::Result<u64, CopyError> {
    let mut buf = vec![0u8; ctx.chunk_size()];
    let mut total = 0u64;
    loop {
        if ctx.check_chunk().is_err() {
            return Err(CopyError::Cancelled);
        }
        match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n as u64,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        }
    }
}

/// Stream an entry into a new file, removing the partial file on any failure
pub fn extract_to_file<R: Read + ?Sized>(
    reader: &mut R,
    target: &Path,
    ctx: &OperationContext,
    compute_digest: bool,
) -> std::result::Result<CopyStats, CopyError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(CopyError::Write)?;
    }
    let mut file = File::create(target).map_err(CopyError::Write)?;
    match copy_stream(reader, &mut file, ctx, compute_digest) {
        Ok(stats) => Ok(stats),
        Err(e) => {
            drop(file);
            remove_partial(target);
            Err(e)
        }
    }
}

/// Either a path to write an entry to, or the entry's final outcome
pub enum Prepared {
    Target(PathBuf),
    Done(EntryOutcome),
}

/// Resolve where an entry goes; directories are created here and finish immediately
pub fn prepare_entry_target(options: &ExtractOptions<'_>, name: &str, is_dir: bool) -> Prepared {
    let target = match resolve_target(options.destination, name, is_dir, options.overwrite) {
        Ok(TargetDecision::Write(target)) => target,
        Ok(TargetDecision::Skip(reason)) => return Prepared::Done(EntryOutcome::skipped(name, reason)),
        Err(e) => return Prepared::Done(EntryOutcome::failed(name, e)),
    };
    if !is_dir {
        return Prepared::Target(target);
    }
    Prepared::Done(match fs::create_dir_all(&target) {
        Ok(()) => EntryOutcome::succeeded(name, 0).with_target(target),
        Err(e) => EntryOutcome::failed(name, ArchiveError::from_io(e, target.display())),
    })
}

/// Turn the result of extracting one entry into its outcome
///
/// `expected_crc` is checked when the format's reader does not verify it
/// itself. Only cancellation escapes as `Err`.
pub fn extraction_outcome(
    name: &str,
    target: PathBuf,
    result: std::result::Result<CopyStats, CopyError>,
    expected_crc: Option<u32>,
    encrypted: bool,
    has_passphrase: bool,
) -> Result<EntryOutcome> {
    match result {
        Ok(stats) => {
            if let Some(expected) = expected_crc.filter(|crc| *crc != stats.crc32) {
                remove_partial(&target);
                return Ok(EntryOutcome::failed(
                    name,
                    classify_decode_failure(
                        name,
                        encrypted,
                        has_passphrase,
                        format!("CRC mismatch: expected {:08x}, got {:08x}", expected, stats.crc32),
                    ),
                ));
            }
            let mut outcome = EntryOutcome::succeeded(name, stats.bytes).with_target(target);
            outcome.digest = stats.digest;
            Ok(outcome)
        }
        Err(CopyError::Cancelled) => Err(ArchiveError::Cancelled),
        Err(CopyError::Write(e)) => Ok(EntryOutcome::failed(
            name,
            ArchiveError::from_io(e, target.display()),
        )),
        Err(CopyError::Read(e)) => Ok(EntryOutcome::failed(
            name,
            classify_decode_failure(name, encrypted, has_passphrase, e),
        )),
    }
}

/// Decode an entry into nothing, checking its CRC when one is known
pub fn verify_entry<R: Read + ?Sized>(
    name: &str,
    reader: &mut R,
    ctx: &OperationContext,
    expected_crc: Option<u32>,
    encrypted: bool,
    has_passphrase: bool,
) -> Result<EntryOutcome> {
    match copy_stream(reader, &mut io::sink(), ctx, false) {
        Ok(stats) => match expected_crc {
            Some(expected) if expected != stats.crc32 => Ok(EntryOutcome::failed(
                name,
                classify_decode_failure(
                    name,
                    encrypted,
                    has_passphrase,
                    format!("CRC mismatch: expected {:08x}, got {:08x}", expected, stats.crc32),
                ),
            )),
            _ => Ok(EntryOutcome::succeeded(name, stats.bytes)),
        },
        Err(CopyError::Cancelled) => Err(ArchiveError::Cancelled),
        Err(CopyError::Read(e)) | Err(CopyError::Write(e)) => Ok(EntryOutcome::failed(
            name,
            classify_decode_failure(name, encrypted, has_passphrase, e),
        )),
    }
}

/// Counts bytes read from a source and stops on cancellation
///
/// Used where a codec library pulls from a reader itself, so the engine never
/// sees individual chunks.
pub struct ProgressReader<'a, R> {
    inner: R,
    ctx: &'a OperationContext,
    bytes: u64,
    report: bool,
}

impl<'a, R: Read> ProgressReader<'a, R> {
    pub fn new(inner: R, ctx: &'a OperationContext) -> Self {
        Self {
            inner,
            ctx,
            bytes: 0,
            report: true,
        }
    }

    /// Only watch for cancellation; the bytes are not part of the planned totals
    pub fn unreported(inner: R, ctx: &'a OperationContext) -> Self {
        Self {
            report: false,
            ..Self::new(inner, ctx)
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.ctx.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "operation cancelled"));
        }
        let n = self.inner.read(buf)?;
        self.bytes += n as u64;
        if self.report {
            self.ctx.progress().add_bytes(n as u64);
        }
        Ok(n)
    }
}

/// Hex SHA-256 of a file on disk
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut sha = Sha256::new();
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha.update(&buf[..n]);
    }
    Ok(format!("{:x}", sha.finalize()))
}

pub fn remove_partial(target: &Path) {
    if let Err(e) = fs::remove_file(target) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove partial file {}: {}", target.display(), e);
        }
    }
}

/// Where an entry should be written, after applying the overwrite policy
#[derive(Debug, PartialEq, Eq)]
pub enum TargetDecision {
    Write(PathBuf),
    Skip(SkipReason),
}

/// Resolve an entry name against the destination directory
///
/// Absolute names and names climbing out of `destination` fail with
/// `UnsafeEntryPath`. Directories are always "written" (created).
pub fn resolve_target(
    destination: &Path,
    entry_name: &str,
    is_dir: bool,
    policy: OverwritePolicy,
) -> Result<TargetDecision> {
    let relative = sanitize_entry_path(entry_name)?;
    let target = destination.join(relative);

    if is_dir || !target.exists() {
        return Ok(TargetDecision::Write(target));
    }
    match policy {
        OverwritePolicy::Skip => Ok(TargetDecision::Skip(SkipReason::AlreadyExists)),
        OverwritePolicy::Overwrite => Ok(TargetDecision::Write(target)),
        OverwritePolicy::Rename => Ok(TargetDecision::Write(next_free_name(&target))),
    }
}

/// Normalize an archive entry name to a relative path that cannot escape its base
pub fn sanitize_entry_path(entry_name: &str) -> Result<PathBuf> {
    let unsafe_path = || ArchiveError::UnsafeEntryPath(entry_name.to_string());
    let normalized = entry_name.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(unsafe_path());
    }

    let mut result = PathBuf::new();
    let mut depth = 0usize;
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => {
                result.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(unsafe_path());
                }
                result.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(unsafe_path()),
        }
    }
    if depth == 0 {
        return Err(unsafe_path());
    }
    Ok(result)
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// `report.pdf` -> `report (1).pdf`, `report (2).pdf`, ...
fn next_free_name(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = target
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = target.parent().unwrap_or_else(|| Path::new(""));

    let mut n = 1u32;
    loop {
        let candidate = parent.join(format!("{} ({}){}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Archive-native name to the canonical form used in listings
pub fn normalize_entry_name(name: &str) -> String {
    name.replace('\\', "/").trim_end_matches('/').to_string()
}

/// Convert MS-DOS packed date and time fields to `SystemTime`
///
/// Date: bits 15-9 year-1980, 8-5 month, 4-0 day. Time: bits 15-11 hours,
/// 10-5 minutes, 4-0 seconds/2. Interpreted as UTC.
pub fn dos_datetime_to_system_time(date: u16, time: u16) -> Option<SystemTime> {
    if date == 0 {
        return None;
    }
    let year = ((date >> 9) & 0x7F) as i64 + 1980;
    let month = ((date >> 5) & 0x0F) as i64;
    let day = (date & 0x1F) as i64;
    let hour = ((time >> 11) & 0x1F) as i64;
    let minute = ((time >> 5) & 0x3F) as i64;
    let second = ((time & 0x1F) * 2) as i64;
    if !(1..=12).contains(&month) || day == 0 {
        return None;
    }
    let secs = days_from_civil(year, month, day) * 86_400 + hour * 3600 + minute * 60 + second;
    u64::try_from(secs)
        .ok()
        .and_then(|s| SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(s)))
}

// Howard Hinnant's days_from_civil
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Returns true for formats that are already compressed and won't benefit from Deflate.
/// Storing them avoids wasting CPU trying to compress incompressible data.
pub fn is_already_compressed(name: &str) -> bool {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    matches!(
        ext.as_str(),
        "png" | "jpg" | "jpeg" | "gif" | "webp"
            | "mp3" | "mp4" | "mkv" | "ogg" | "wav" | "aac" | "flac"
            | "zip" | "7z" | "rar" | "gz" | "bz2" | "xz" | "zst"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_rejects_escapes() {
        assert!(sanitize_entry_path("../evil.txt").is_err());
        assert!(sanitize_entry_path("a/../../evil.txt").is_err());
        assert!(sanitize_entry_path("/etc/passwd").is_err());
        assert!(sanitize_entry_path("C:\\Windows\\x.dll").is_err());
        assert!(sanitize_entry_path("./").is_err());
    }

    #[test]
    fn test_sanitize_normalizes() {
        assert_eq!(
            sanitize_entry_path("a/./b/../c.txt").unwrap(),
            PathBuf::from("a").join("c.txt")
        );
        assert_eq!(
            sanitize_entry_path("dir\\file.txt").unwrap(),
            PathBuf::from("dir").join("file.txt")
        );
    }

    #[test]
    fn test_resolve_target_policies() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("report.pdf"), b"x").unwrap();
        fs::write(dir.path().join("report (1).pdf"), b"x").unwrap();

        assert_eq!(
            resolve_target(dir.path(), "report.pdf", false, OverwritePolicy::Skip).unwrap(),
            TargetDecision::Skip(SkipReason::AlreadyExists)
        );
        assert_eq!(
            resolve_target(dir.path(), "report.pdf", false, OverwritePolicy::Overwrite).unwrap(),
            TargetDecision::Write(dir.path().join("report.pdf"))
        );
        assert_eq!(
            resolve_target(dir.path(), "report.pdf", false, OverwritePolicy::Rename).unwrap(),
            TargetDecision::Write(dir.path().join("report (2).pdf"))
        );
        assert_eq!(
            resolve_target(dir.path(), "new.txt", false, OverwritePolicy::Skip).unwrap(),
            TargetDecision::Write(dir.path().join("new.txt"))
        );
    }

    #[test]
    fn test_copy_stream_crc_and_digest() {
        let ctx = OperationContext::detached();
        let mut out = Vec::new();
        let stats = copy_stream(&mut Cursor::new(b"hello world"), &mut out, &ctx, true).unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(stats.bytes, 11);
        assert_eq!(stats.crc32, crc32fast::hash(b"hello world"));
        assert_eq!(
            stats.digest.as_deref(),
            Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
        );
    }

    #[test]
    fn test_copy_stream_observes_cancel() {
        let ctx = OperationContext::detached();
        ctx.cancel_token().cancel();
        let result = copy_stream(&mut Cursor::new(vec![0u8; 10]), &mut io::sink(), &ctx, false);
        assert!(matches!(result, Err(CopyError::Cancelled)));
    }

    #[test]
    fn test_extract_to_file_removes_partial_output() {
        struct Failing(usize);
        impl Read for Failing {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "broken"));
                }
                self.0 -= 1;
                buf[0] = 1;
                Ok(1)
            }
        }
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested/out.bin");
        let result = extract_to_file(&mut Failing(3), &target, &OperationContext::detached(), false);
        assert!(matches!(result, Err(CopyError::Read(_))));
        assert!(!target.exists());
    }

    #[test]
    fn test_discard_checks_cancellation_without_progress() {
        let reporter = Arc::new(ProgressReporter::silent());
        let ctx = OperationContext::new(CancellationToken::new(), Arc::clone(&reporter), 1024);
        let skipped = discard(&mut Cursor::new(vec![7u8; 10_000]), &ctx).unwrap();
        assert_eq!(skipped, 10_000);
        assert_eq!(reporter.snapshot().bytes_done, 0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = OperationContext::new(cancel, reporter, 1024);
        assert!(matches!(
            discard(&mut Cursor::new(vec![7u8; 10_000]), &ctx),
            Err(CopyError::Cancelled)
        ));
    }

    #[test]
    fn test_unreported_reader_still_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let reporter = Arc::new(ProgressReporter::silent());
        let ctx = OperationContext::new(cancel.clone(), Arc::clone(&reporter), 1024);
        let mut reader = ProgressReader::unreported(Cursor::new(vec![1u8; 4096]), &ctx);
        let mut buf = [0u8; 1024];
        assert_eq!(reader.read(&mut buf).unwrap(), 1024);
        assert_eq!(reader.bytes_read(), 1024);
        assert_eq!(reporter.snapshot().bytes_done, 0);

        cancel.cancel();
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn test_drain_only_stops_at_entry_boundary() {
        let drain = CancellationToken::new();
        let ctx = OperationContext::detached().with_drain(drain.clone());
        drain.cancel();
        assert!(ctx.check_chunk().is_ok());
        assert!(ctx.check_entry().is_err());
    }

    #[test]
    fn test_dos_datetime() {
        // 2024-03-15 13:45:30
        let date = ((2024 - 1980) << 9) | (3 << 5) | 15;
        let time = (13 << 11) | (45 << 5) | (30 / 2);
        let ts = dos_datetime_to_system_time(date, time).unwrap();
        assert_eq!(ts.duration_since(UNIX_EPOCH).unwrap().as_secs(), 1_710_510_330);
        assert!(dos_datetime_to_system_time(0, 0).is_none());
    }

    #[test]
    fn test_outcome_sink_stop_on_error() {
        let mut seen = Vec::new();
        let mut deliver = |o: EntryOutcome| seen.push(o.path);
        let mut sink = OutcomeSink::new(&mut deliver, true);
        assert!(sink.record(EntryOutcome::succeeded("a", 1)));
        assert!(!sink.record(EntryOutcome::failed("b", ArchiveError::Cancelled)));
        assert!(sink.should_stop());
        drop(sink);
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_is_already_compressed() {
        assert!(is_already_compressed("photo.JPG"));
        assert!(is_already_compressed("nested/archive.7z"));
        assert!(!is_already_compressed("notes.txt"));
    }
}
