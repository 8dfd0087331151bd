use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::SystemTime;
use sevenz_rust::{
    AesEncoderOptions, Password, SevenZArchiveEntry, SevenZMethod, SevenZMethodConfiguration,
    SevenZReader, SevenZWriter,
};

use crate::core::compression::common::{
    discard, extraction_outcome, extract_to_file, normalize_entry_name, prepare_entry_target,
    verify_entry, ArchiveBackend, ArchiveHandle, CopyError, ExtractOptions, OperationContext,
    OutcomeSink, Prepared, ProgressReader, UpdateReport, WriteOptions,
};
use crate::core::credentials::{classify_decode_failure, Passphrase};
use crate::core::file_ops::{SourceItem, StagedArchive};
use crate::core::registry::FormatId;
use crate::models::{ArchiveError, EntryDescriptor, EntryOutcome, Result, SelectorMatcher};

/// 7zAES coder id
const AES_METHOD_ID: [u8; 4] = [0x06, 0xF1, 0x07, 0x01];

/// 7z archive handler
///
/// Handles listing, extraction, testing and creation of 7z archives using
/// sevenz-rust. Entries live in solid folders, so a body is always decoded in
/// archive order; bodies that are not wanted are drained rather than skipped.
pub struct SevenZHandler;

impl SevenZHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SevenZHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn password_of(passphrase: Option<&Passphrase>) -> Password {
    passphrase
        .map(|p| Password::from(p.expose()))
        .unwrap_or_else(Password::empty)
}

fn open_reader(path: &Path, passphrase: Option<&Passphrase>) -> Result<SevenZReader<File>> {
    let file = File::open(path).map_err(|e| ArchiveError::from_io(e, path.display()))?;
    let len = file
        .metadata()
        .map_err(|e| ArchiveError::from_io(e, path.display()))?
        .len();
    SevenZReader::new(file, len, password_of(passphrase))
        .map_err(|e| map_open_error(e, path, passphrase.is_some()))
}

/// Errors raised while reading headers apply to the archive as a whole
fn map_open_error(err: sevenz_rust::Error, path: &Path, has_passphrase: bool) -> ArchiveError {
    let subject = path.display().to_string();
    match err {
        sevenz_rust::Error::PasswordRequired if !has_passphrase => {
            ArchiveError::PassphraseRequired(subject)
        }
        sevenz_rust::Error::PasswordRequired | sevenz_rust::Error::MaybeBadPassword(_) => {
            if has_passphrase {
                ArchiveError::WrongPassphrase(subject)
            } else {
                ArchiveError::PassphraseRequired(subject)
            }
        }
        sevenz_rust::Error::Io(e, _) => ArchiveError::from_io(e, subject),
        other => ArchiveError::CorruptArchive {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}

fn is_encrypted_archive(reader: &SevenZReader<File>) -> bool {
    reader.archive().folders.iter().any(|folder| {
        folder
            .coders
            .iter()
            .any(|coder| coder.decompression_method_id().starts_with(&AES_METHOD_ID))
    })
}

/// Entry metadata captured before the decode pass borrows the reader
struct EntryMeta {
    name: String,
    has_stream: bool,
    size: u64,
}

fn entry_metas(reader: &SevenZReader<File>) -> Vec<EntryMeta> {
    reader
        .archive()
        .files
        .iter()
        .map(|e| EntryMeta {
            name: normalize_entry_name(e.name()),
            has_stream: e.has_stream(),
            size: e.size(),
        })
        .collect()
}

fn expected_crc(entry: &SevenZArchiveEntry) -> Option<u32> {
    entry.has_crc.then_some(entry.crc as u32)
}

/// Decode a body nobody wants; `Ok(false)` means the operation was cancelled meanwhile
fn drain(reader: &mut dyn Read, ctx: &OperationContext) -> std::result::Result<bool, sevenz_rust::Error> {
    match discard(reader, ctx) {
        Ok(_) => Ok(true),
        Err(CopyError::Cancelled) => Ok(false),
        Err(CopyError::Read(e)) | Err(CopyError::Write(e)) => {
            Err(sevenz_rust::Error::other(e.to_string()))
        }
    }
}

/// Per-entry state carried through one decode pass
struct DecodePass<'s, 'a> {
    sink: &'s mut OutcomeSink<'a>,
    seen: HashSet<String>,
    stopped: bool,
    fatal: Option<ArchiveError>,
}

impl<'s, 'a> DecodePass<'s, 'a> {
    fn new(sink: &'s mut OutcomeSink<'a>) -> Self {
        Self {
            sink,
            seen: HashSet::new(),
            stopped: false,
            fatal: None,
        }
    }

    fn record(&mut self, name: &str, outcome: EntryOutcome) {
        self.seen.insert(name.to_string());
        if !self.sink.record(outcome) {
            self.stopped = true;
        }
    }

    /// Report entries the library never handed out after it gave up
    ///
    /// A folder whose decoder cannot be built (missing or wrong key, broken
    /// coder chain) takes every entry in it down.
    fn fail_unseen<'m>(
        &mut self,
        metas: impl Iterator<Item = &'m EntryMeta>,
        err: &sevenz_rust::Error,
        encrypted: bool,
        has_passphrase: bool,
        ctx: &OperationContext,
    ) {
        for meta in metas {
            // Directories and empty files never reach a decoder
            if self.stopped || !meta.has_stream || self.seen.contains(&meta.name) {
                continue;
            }
            let error = match err {
                sevenz_rust::Error::PasswordRequired if !has_passphrase => {
                    ArchiveError::PassphraseRequired(meta.name.clone())
                }
                _ => classify_decode_failure(&meta.name, encrypted, has_passphrase, err),
            };
            ctx.progress().begin_entry(&meta.name);
            ctx.progress().finish_entry(meta.size, 0);
            let name = meta.name.clone();
            self.record(&name, EntryOutcome::failed(&name, error));
        }
    }
}

impl ArchiveBackend for SevenZHandler {
    fn supports(&self, format: FormatId) -> bool {
        format == FormatId::SevenZ
    }

    fn list(
        &self,
        handle: &ArchiveHandle,
        passphrase: Option<&Passphrase>,
    ) -> Result<Vec<EntryDescriptor>> {
        let reader = open_reader(&handle.path, passphrase)?;
        let encrypted = is_encrypted_archive(&reader);

        let entries = reader
            .archive()
            .files
            .iter()
            .map(|e| {
                let modified: SystemTime = e.last_modified_date().into();
                EntryDescriptor {
                    path: normalize_entry_name(e.name()),
                    size: e.size(),
                    compressed_size: (e.compressed_size > 0).then_some(e.compressed_size),
                    modified: (e.has_last_modified_date && modified > SystemTime::UNIX_EPOCH)
                        .then_some(modified),
                    crc32: expected_crc(e),
                    is_directory: e.is_directory(),
                    is_encrypted: encrypted && e.has_stream(),
                }
            })
            .collect();
        Ok(entries)
    }

    /// Extract 7z entries to destination directory
    ///
    /// # Behavior
    /// - Preserves directory hierarchy
    /// - Creates parent directories as needed
    /// - Verifies each body against its stored CRC-32
    fn extract(
        &self,
        handle: &ArchiveHandle,
        options: &ExtractOptions<'_>,
        ctx: &OperationContext,
        sink: &mut OutcomeSink<'_>,
    ) -> Result<()> {
        let mut reader = open_reader(&handle.path, options.passphrase)?;
        let encrypted = is_encrypted_archive(&reader);
        let has_passphrase = options.passphrase.is_some();
        let metas = entry_metas(&reader);
        let mut pass = DecodePass::new(sink);

        let result = reader.for_each_entries(|entry, body| {
            let name = normalize_entry_name(entry.name());
            if !options.selector.matches(&name) {
                if !drain(body, ctx)? {
                    pass.fatal = Some(ArchiveError::Cancelled);
                    return Ok(false);
                }
                return Ok(true);
            }
            if let Err(e) = ctx.check_entry() {
                pass.fatal = Some(e);
                return Ok(false);
            }
            ctx.progress().begin_entry(&name);
            let entry_encrypted = encrypted && entry.has_stream();

            let outcome = match prepare_entry_target(options, &name, entry.is_directory()) {
                Prepared::Done(outcome) => {
                    if !drain(body, ctx)? {
                        pass.fatal = Some(ArchiveError::Cancelled);
                        return Ok(false);
                    }
                    outcome
                }
                Prepared::Target(target) => {
                    let result = extract_to_file(body, &target, ctx, options.compute_digest);
                    match extraction_outcome(
                        &name,
                        target,
                        result,
                        expected_crc(entry),
                        entry_encrypted,
                        has_passphrase,
                    ) {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            pass.fatal = Some(e);
                            return Ok(false);
                        }
                    }
                }
            };

            ctx.progress().finish_entry(entry.size(), outcome.bytes);
            pass.record(&name, outcome);
            Ok(!pass.stopped)
        });

        if let Some(fatal) = pass.fatal.take() {
            return Err(fatal);
        }
        if let Err(err) = result {
            log::warn!("7z decode stopped in {}: {}", handle.path.display(), err);
            let selected = metas.iter().filter(|m| options.selector.matches(&m.name));
            pass.fail_unseen(selected, &err, encrypted, has_passphrase, ctx);
        }

        let matched = metas.iter().any(|m| options.selector.matches(&m.name));
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
        passphrase: Option<&Passphrase>,
        ctx: &OperationContext,
        sink: &mut OutcomeSink<'_>,
    ) -> Result<()> {
        let mut reader = open_reader(&handle.path, passphrase)?;
        let encrypted = is_encrypted_archive(&reader);
        let has_passphrase = passphrase.is_some();
        let metas = entry_metas(&reader);
        let mut pass = DecodePass::new(sink);

        let result = reader.for_each_entries(|entry, body| {
            let name = normalize_entry_name(entry.name());
            if let Err(e) = ctx.check_entry() {
                pass.fatal = Some(e);
                return Ok(false);
            }
            ctx.progress().begin_entry(&name);
            let outcome = match verify_entry(
                &name,
                body,
                ctx,
                expected_crc(entry),
                encrypted && entry.has_stream(),
                has_passphrase,
            ) {
                Ok(outcome) => outcome,
                Err(e) => {
                    pass.fatal = Some(e);
                    return Ok(false);
                }
            };
            ctx.progress().finish_entry(entry.size(), outcome.bytes);
            pass.record(&name, outcome);
            Ok(!pass.stopped)
        });

        if let Some(fatal) = pass.fatal.take() {
            return Err(fatal);
        }
        if let Err(err) = result {
            log::warn!("7z test stopped in {}: {}", handle.path.display(), err);
            pass.fail_unseen(metas.iter(), &err, encrypted, has_passphrase, ctx);
        }
        Ok(())
    }

    /// Create 7z archive from source items
    ///
    /// # Behavior
    /// - LZMA2 at the requested preset, or stored at level 0
    /// - AES-256 content encryption when a passphrase is given
    /// - A source that fails mid-read aborts the archive; 7z streams cannot drop a
    ///   half-written entry
    fn create(
        &self,
        target: &Path,
        _format: FormatId,
        sources: &[SourceItem],
        options: &WriteOptions<'_>,
        ctx: &OperationContext,
    ) -> Result<Vec<EntryOutcome>> {
        let mut staged = StagedArchive::new(target)?;
        let outcomes = {
            let mut writer = new_writer(staged.file_mut(), options)?;
            let outcomes = push_sources(&mut writer, sources, options, ctx)?;
            writer
                .finish()
                .map_err(|e| ArchiveError::from_io(e, target.display()))?;
            outcomes
        };
        staged.commit()?;
        log::info!("Created 7z archive {} ({} items)", target.display(), outcomes.len());
        Ok(outcomes)
    }

    /// Rewrite the archive with entries removed and/or added
    ///
    /// Retained entries are decoded and re-encoded, so an encrypted archive
    /// needs its passphrase to be updated.
    fn update(
        &self,
        handle: &ArchiveHandle,
        add: &[SourceItem],
        remove: Option<&SelectorMatcher>,
        options: &WriteOptions<'_>,
        ctx: &OperationContext,
    ) -> Result<UpdateReport> {
        let mut reader = open_reader(&handle.path, options.passphrase)?;
        let encrypted = is_encrypted_archive(&reader);
        let metas = entry_metas(&reader);
        let replaced: HashSet<&str> = add.iter().map(|i| i.name.as_str()).collect();

        if let Some(wanted) = remove.and_then(|m| m.requires_match()) {
            if !metas.iter().any(|m| remove.map_or(false, |r| r.matches(&m.name))) {
                return Err(ArchiveError::EntryNotFound(wanted.to_string()));
            }
        }

        let mut report = UpdateReport::default();
        let mut staged = StagedArchive::new(&handle.path)?;
        {
            let mut writer = new_writer(staged.file_mut(), options)?;
            let mut failure: Option<ArchiveError> = None;

            let result = reader.for_each_entries(|entry, body| {
                let name = normalize_entry_name(entry.name());
                if remove.map_or(false, |m| m.matches(&name)) || replaced.contains(name.as_str()) {
                    report.removed.push(name);
                    if !drain(body, ctx)? {
                        failure = Some(ArchiveError::Cancelled);
                        return Ok(false);
                    }
                    return Ok(true);
                }
                if let Err(e) = ctx.check_entry() {
                    failure = Some(e);
                    return Ok(false);
                }
                let mut copy = entry.clone();
                copy.name = name.clone();
                let pushed = if entry.has_stream() {
                    writer
                        .push_archive_entry(copy, Some(ProgressReader::unreported(body, ctx)))
                        .map(|_| ())
                } else {
                    writer.push_archive_entry::<&[u8]>(copy, None).map(|_| ())
                };
                if let Err(e) = pushed {
                    failure = Some(if ctx.is_cancelled() {
                        ArchiveError::Cancelled
                    } else {
                        classify_decode_failure(
                            &name,
                            encrypted && entry.has_stream(),
                            options.passphrase.is_some(),
                            e,
                        )
                    });
                    return Ok(false);
                }
                Ok(true)
            });

            if let Some(err) = failure {
                return Err(err);
            }
            result.map_err(|e| map_open_error(e, &handle.path, options.passphrase.is_some()))?;

            report.added = push_sources(&mut writer, add, options, ctx)?;
            writer
                .finish()
                .map_err(|e| ArchiveError::from_io(e, handle.path.display()))?;
        }

        staged.commit()?;
        log::info!(
            "Updated 7z archive {}: {} added, {} removed",
            handle.path.display(),
            report.added.len(),
            report.removed.len()
        );
        Ok(report)
    }
}

fn new_writer<'f>(file: &'f mut File, options: &WriteOptions<'_>) -> Result<SevenZWriter<&'f mut File>> {
    let mut writer = SevenZWriter::new(file)
        .map_err(|e| ArchiveError::from_io(io::Error::other(e.to_string()), "7z writer"))?;

    let mut methods: Vec<SevenZMethodConfiguration> = Vec::new();
    if let Some(p) = options.passphrase {
        methods.push(AesEncoderOptions::new(Password::from(p.expose())).into());
    }
    if options.compression_level == 0 {
        methods.push(SevenZMethodConfiguration::new(SevenZMethod::COPY));
    } else {
        methods.push(sevenz_rust::lzma::LZMA2Options::with_preset(options.compression_level).into());
    }
    writer.set_content_methods(methods);
    Ok(writer)
}

fn push_sources(
    writer: &mut SevenZWriter<&mut File>,
    sources: &[SourceItem],
    options: &WriteOptions<'_>,
    ctx: &OperationContext,
) -> Result<Vec<EntryOutcome>> {
    let mut outcomes = Vec::with_capacity(sources.len());

    for item in sources {
        ctx.check_entry()?;
        ctx.progress().begin_entry(&item.name);
        let entry = SevenZArchiveEntry::from_path(&item.source, item.name.clone());

        let outcome = if item.is_dir {
            writer
                .push_archive_entry::<&[u8]>(entry, None)
                .map_err(|e| ArchiveError::from_io(io::Error::other(e.to_string()), &item.name))?;
            EntryOutcome::succeeded(&item.name, 0)
        } else {
            match File::open(&item.source) {
                // Nothing written yet, the entry can be left out
                Err(e) => EntryOutcome::failed(&item.name, ArchiveError::from_io(e, item.source.display())),
                Ok(file) => {
                    let mut source = ProgressReader::new(file, ctx);
                    match writer.push_archive_entry(entry, Some(&mut source)) {
                        Ok(_) => EntryOutcome::succeeded(&item.name, source.bytes_read()),
                        Err(_) if ctx.is_cancelled() => return Err(ArchiveError::Cancelled),
                        Err(e) => {
                            return Err(ArchiveError::from_io(
                                io::Error::other(e.to_string()),
                                item.source.display(),
                            ))
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
