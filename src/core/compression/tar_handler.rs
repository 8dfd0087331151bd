use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tar::{Builder, EntryType, Header};

use crate::core::compression::common::{
    discard, extraction_outcome, extract_to_file, normalize_entry_name, prepare_entry_target,
    verify_entry, ArchiveBackend, ArchiveHandle, CopyError, ExtractOptions, OperationContext,
    OutcomeSink, Prepared, ProgressReader, UpdateReport, WriteOptions,
};
use crate::core::credentials::Passphrase;
use crate::core::file_ops::{SourceItem, StagedArchive};
use crate::core::registry::{FormatId, TarCompression};
use crate::models::{
    ArchiveError, EntryDescriptor, EntryOutcome, Result, SelectorMatcher, SkipReason,
};

/// TAR archive handler, plain or wrapped in gzip, bzip2, xz or zstd
///
/// A compressed tar is one stream: listing has to decode it (bodies are
/// skipped, never kept), and updates rewrite the whole stream.
pub struct TarHandler;

impl TarHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TarHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn compression_of(format: FormatId) -> Result<TarCompression> {
    match format {
        FormatId::Tar(compression) => Ok(compression),
        other => Err(ArchiveError::UnsupportedFormat(format!(
            "{} is not a TAR format",
            other
        ))),
    }
}

fn corrupt(path: &Path, err: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::CorruptArchive {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Open the archive file behind the right decompressor
fn open_stream(path: &Path, compression: TarCompression) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|e| ArchiveError::from_io(e, path.display()))?;
    let buffered = BufReader::new(file);
    let stream: Box<dyn Read> = match compression {
        TarCompression::None => Box::new(buffered),
        TarCompression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(buffered)),
        TarCompression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(buffered)),
        TarCompression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(buffered)),
        TarCompression::Zstd => Box::new(
            zstd::stream::read::Decoder::with_buffer(buffered).map_err(|e| corrupt(path, e))?,
        ),
    };
    Ok(stream)
}

/// Compressing writer under a tar builder
enum TarSink<W: Write> {
    Plain(W),
    Gzip(flate2::write::GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
    Xz(xz2::write::XzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> TarSink<W> {
    fn new(inner: W, compression: TarCompression, level: u32) -> io::Result<Self> {
        Ok(match compression {
            TarCompression::None => TarSink::Plain(inner),
            TarCompression::Gzip => {
                TarSink::Gzip(flate2::write::GzEncoder::new(inner, flate2::Compression::new(level)))
            }
            TarCompression::Bzip2 => TarSink::Bzip2(bzip2::write::BzEncoder::new(
                inner,
                bzip2::Compression::new(level.clamp(1, 9)),
            )),
            TarCompression::Xz => TarSink::Xz(xz2::write::XzEncoder::new(inner, level)),
            // zstd level 0 selects its default
            TarCompression::Zstd => {
                TarSink::Zstd(zstd::stream::write::Encoder::new(inner, level as i32)?)
            }
        })
    }

    /// Write the compressor trailer and hand back the inner writer
    fn finish(self) -> io::Result<W> {
        match self {
            TarSink::Plain(w) => Ok(w),
            TarSink::Gzip(e) => e.finish(),
            TarSink::Bzip2(e) => e.finish(),
            TarSink::Xz(e) => e.finish(),
            TarSink::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for TarSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TarSink::Plain(w) => w.write(buf),
            TarSink::Gzip(e) => e.write(buf),
            TarSink::Bzip2(e) => e.write(buf),
            TarSink::Xz(e) => e.write(buf),
            TarSink::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TarSink::Plain(w) => w.flush(),
            TarSink::Gzip(e) => e.flush(),
            TarSink::Bzip2(e) => e.flush(),
            TarSink::Xz(e) => e.flush(),
            TarSink::Zstd(e) => e.flush(),
        }
    }
}

/// Member name in canonical form; `None` for the archive root (`./`)
fn member_name<R: Read>(entry: &tar::Entry<'_, R>) -> io::Result<Option<String>> {
    let raw = entry.path()?.to_string_lossy().replace('\\', "/");
    let trimmed = raw.trim_start_matches("./");
    let name = normalize_entry_name(trimmed);
    Ok((!name.is_empty() && name != ".").then_some(name))
}

fn is_regular(kind: EntryType) -> bool {
    matches!(kind, EntryType::Regular | EntryType::Continuous)
}

fn describe<R: Read>(entry: &tar::Entry<'_, R>, name: String, compressed: bool) -> EntryDescriptor {
    let header = entry.header();
    let is_directory = header.entry_type().is_dir();
    let size = if is_directory { 0 } else { entry.size() };
    let modified = header
        .mtime()
        .ok()
        .filter(|t| *t > 0)
        .and_then(|t| SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(t)));
    EntryDescriptor {
        path: name,
        size,
        // Members of a compressed stream have no size of their own
        compressed_size: (!compressed).then_some(size),
        modified,
        crc32: None,
        is_directory,
        is_encrypted: false,
    }
}

impl ArchiveBackend for TarHandler {
    fn supports(&self, format: FormatId) -> bool {
        matches!(format, FormatId::Tar(_))
    }

    fn list(
        &self,
        handle: &ArchiveHandle,
        _passphrase: Option<&Passphrase>,
    ) -> Result<Vec<EntryDescriptor>> {
        let compression = compression_of(handle.format)?;
        let path = handle.path.as_path();
        let mut entries = Vec::new();

        if compression == TarCompression::None {
            // Plain tar can seek past bodies
            let file = File::open(path).map_err(|e| ArchiveError::from_io(e, path.display()))?;
            let mut archive = tar::Archive::new(file);
            for entry in archive.entries_with_seek().map_err(|e| corrupt(path, e))? {
                let entry = entry.map_err(|e| corrupt(path, e))?;
                if let Some(name) = member_name(&entry).map_err(|e| corrupt(path, e))? {
                    entries.push(describe(&entry, name, false));
                }
            }
        } else {
            let mut archive = tar::Archive::new(open_stream(path, compression)?);
            for entry in archive.entries().map_err(|e| corrupt(path, e))? {
                let entry = entry.map_err(|e| corrupt(path, e))?;
                if let Some(name) = member_name(&entry).map_err(|e| corrupt(path, e))? {
                    entries.push(describe(&entry, name, true));
                }
            }
        }

        Ok(entries)
    }

    /// Extract TAR members to destination directory
    ///
    /// # Behavior
    /// - Regular files and directories are extracted
    /// - Links, devices and other special members are skipped
    /// - A damaged stream ends the operation; later members are unreachable
    fn extract(
        &self,
        handle: &ArchiveHandle,
        options: &ExtractOptions<'_>,
        ctx: &OperationContext,
        sink: &mut OutcomeSink<'_>,
    ) -> Result<()> {
        let compression = compression_of(handle.format)?;
        let path = handle.path.as_path();
        let mut archive = tar::Archive::new(open_stream(path, compression)?);
        let mut matched = false;

        for entry in archive.entries().map_err(|e| corrupt(path, e))? {
            let mut entry = entry.map_err(|e| corrupt(path, e))?;
            let Some(name) = member_name(&entry).map_err(|e| corrupt(path, e))? else {
                continue;
            };
            if !options.selector.matches(&name) {
                skip_body(&mut entry, path, ctx)?;
                continue;
            }
            matched = true;
            ctx.check_entry()?;
            ctx.progress().begin_entry(&name);

            let kind = entry.header().entry_type();
            let size = entry.size();
            let outcome = if !kind.is_dir() && !is_regular(kind) {
                EntryOutcome::skipped(&name, SkipReason::UnsupportedEntryType)
            } else {
                match prepare_entry_target(options, &name, kind.is_dir()) {
                    Prepared::Done(outcome) => outcome,
                    Prepared::Target(target) => {
                        let result =
                            extract_to_file(&mut entry, &target, ctx, options.compute_digest);
                        let outcome =
                            extraction_outcome(&name, target.clone(), result, None, false, false)?;
                        #[cfg(unix)]
                        if outcome.status.is_success() {
                            if let Ok(mode) = entry.header().mode() {
                                use std::os::unix::fs::PermissionsExt;
                                let permissions = fs::Permissions::from_mode(mode & 0o777);
                                if let Err(e) = fs::set_permissions(&target, permissions) {
                                    log::debug!(
                                        "Failed to set permissions on {}: {}",
                                        target.display(),
                                        e
                                    );
                                }
                            }
                        }
                        outcome
                    }
                }
            };

            ctx.progress().finish_entry(size, outcome.bytes);
            if !sink.record(outcome) {
                break;
            }
        }

        if !matched {
            if let Some(wanted) = options.selector.requires_match() {
                return Err(ArchiveError::EntryNotFound(wanted.to_string()));
            }
        }
        Ok(())
    }

    fn test_integrity(
        &self,
        handle: &ArchiveHandle,
        _passphrase: Option<&Passphrase>,
        ctx: &OperationContext,
        sink: &mut OutcomeSink<'_>,
    ) -> Result<()> {
        let compression = compression_of(handle.format)?;
        let path = handle.path.as_path();
        let mut archive = tar::Archive::new(open_stream(path, compression)?);

        for entry in archive.entries().map_err(|e| corrupt(path, e))? {
            let mut entry = entry.map_err(|e| corrupt(path, e))?;
            let Some(name) = member_name(&entry).map_err(|e| corrupt(path, e))? else {
                continue;
            };
            ctx.check_entry()?;
            ctx.progress().begin_entry(&name);
            let size = entry.size();
            // Header checksums are verified by the reader; bodies carry none
            let outcome = verify_entry(&name, &mut entry, ctx, None, false, false)?;
            ctx.progress().finish_entry(size, outcome.bytes);
            if !sink.record(outcome) {
                break;
            }
        }
        Ok(())
    }

    /// Create TAR archive from source items
    ///
    /// # Behavior
    /// - GNU headers, so long names are kept
    /// - A source that fails mid-read aborts the archive
    fn create(
        &self,
        target: &Path,
        format: FormatId,
        sources: &[SourceItem],
        options: &WriteOptions<'_>,
        ctx: &OperationContext,
    ) -> Result<Vec<EntryOutcome>> {
        let compression = compression_of(format)?;
        reject_passphrase(options)?;

        let mut staged = StagedArchive::new(target)?;
        let outcomes = {
            let sink = TarSink::new(staged.file_mut(), compression, options.compression_level)
                .map_err(|e| ArchiveError::from_io(e, target.display()))?;
            let mut builder = Builder::new(sink);
            let outcomes = append_sources(&mut builder, sources, options, ctx)?;
            finish_builder(builder, target)?;
            outcomes
        };
        staged.commit()?;
        log::info!(
            "Created {} archive {} ({} items)",
            format,
            target.display(),
            outcomes.len()
        );
        Ok(outcomes)
    }

    /// Rewrite the stream without removed members and with added ones appended
    fn update(
        &self,
        handle: &ArchiveHandle,
        add: &[SourceItem],
        remove: Option<&SelectorMatcher>,
        options: &WriteOptions<'_>,
        ctx: &OperationContext,
    ) -> Result<UpdateReport> {
        let compression = compression_of(handle.format)?;
        reject_passphrase(options)?;
        let path = handle.path.as_path();
        let replaced: HashSet<&str> = add.iter().map(|i| i.name.as_str()).collect();
        let mut report = UpdateReport::default();
        let mut remove_matched = false;

        let mut staged = StagedArchive::new(path)?;
        {
            let sink = TarSink::new(staged.file_mut(), compression, options.compression_level)
                .map_err(|e| ArchiveError::from_io(e, path.display()))?;
            let mut builder = Builder::new(sink);
            let mut source = tar::Archive::new(open_stream(path, compression)?);

            for entry in source.entries().map_err(|e| corrupt(path, e))? {
                let mut entry = entry.map_err(|e| corrupt(path, e))?;
                ctx.check_entry()?;
                let Some(name) = member_name(&entry).map_err(|e| corrupt(path, e))? else {
                    continue;
                };
                let selected = remove.map_or(false, |m| m.matches(&name));
                remove_matched |= selected;
                if selected || replaced.contains(name.as_str()) {
                    skip_body(&mut entry, path, ctx)?;
                    report.removed.push(name);
                    continue;
                }
                let mut header = entry.header().clone();
                let mut body = ProgressReader::unreported(&mut entry, ctx);
                match builder.append_data(&mut header, &name, &mut body) {
                    Ok(()) => {}
                    Err(_) if ctx.is_cancelled() => return Err(ArchiveError::Cancelled),
                    Err(e) => return Err(corrupt(path, e)),
                }
            }

            if let Some(wanted) = remove.and_then(|m| m.requires_match()) {
                if !remove_matched {
                    return Err(ArchiveError::EntryNotFound(wanted.to_string()));
                }
            }

            report.added = append_sources(&mut builder, add, options, ctx)?;
            finish_builder(builder, path)?;
        }

        staged.commit()?;
        log::info!(
            "Updated {} archive {}: {} added, {} removed",
            handle.format,
            path.display(),
            report.added.len(),
            report.removed.len()
        );
        Ok(report)
    }
}

/// Read past a member body so cancellation is seen inside large members
fn skip_body<R: Read>(entry: &mut tar::Entry<'_, R>, path: &Path, ctx: &OperationContext) -> Result<()> {
    match discard(entry, ctx) {
        Ok(_) => Ok(()),
        Err(CopyError::Cancelled) => Err(ArchiveError::Cancelled),
        Err(CopyError::Read(e)) | Err(CopyError::Write(e)) => Err(corrupt(path, e)),
    }
}

fn reject_passphrase(options: &WriteOptions<'_>) -> Result<()> {
    if options.passphrase.is_some() {
        return Err(ArchiveError::InvalidConfig(
            "TAR archives do not support encryption".to_string(),
        ));
    }
    Ok(())
}

fn finish_builder(builder: Builder<TarSink<&mut File>>, path: &Path) -> Result<()> {
    let sink = builder
        .into_inner()
        .map_err(|e| ArchiveError::from_io(e, path.display()))?;
    sink.finish()
        .map_err(|e| ArchiveError::from_io(e, path.display()))?;
    Ok(())
}

fn append_sources<W: Write>(
    builder: &mut Builder<W>,
    sources: &[SourceItem],
    options: &WriteOptions<'_>,
    ctx: &OperationContext,
) -> Result<Vec<EntryOutcome>> {
    let mut outcomes = Vec::with_capacity(sources.len());

    for item in sources {
        ctx.check_entry()?;
        ctx.progress().begin_entry(&item.name);

        let outcome = match fs::metadata(&item.source) {
            Err(e) => EntryOutcome::failed(&item.name, ArchiveError::from_io(e, item.source.display())),
            Ok(metadata) => {
                let mut header = Header::new_gnu();
                header.set_metadata(&metadata);
                if item.is_dir {
                    header.set_size(0);
                    builder
                        .append_data(&mut header, &item.name, io::empty())
                        .map_err(|e| ArchiveError::from_io(e, &item.name))?;
                    EntryOutcome::succeeded(&item.name, 0)
                } else {
                    match File::open(&item.source) {
                        Err(e) => EntryOutcome::failed(
                            &item.name,
                            ArchiveError::from_io(e, item.source.display()),
                        ),
                        Ok(file) => {
                            let mut reader = ProgressReader::new(file, ctx);
                            match builder.append_data(&mut header, &item.name, &mut reader) {
                                Ok(()) => EntryOutcome::succeeded(&item.name, reader.bytes_read()),
                                Err(_) if ctx.is_cancelled() => return Err(ArchiveError::Cancelled),
                                Err(e) => return Err(ArchiveError::from_io(e, item.source.display())),
                            }
                        }
                    }
                }
            }
        };

        ctx.progress().finish_entry(item.size, outcome.bytes);
        let failed = outcome.status.is_failure();
        outcomes.push(outcome);
        if failed && options.stop_on_error {
            break;
        }
    }

    Ok(outcomes)
}
