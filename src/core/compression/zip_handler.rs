use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Seek, Write};
use std::path::Path;
use zip::read::ZipFile;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{AesMode, CompressionMethod, ZipArchive, ZipWriter};

use crate::core::compression::common::{
    copy_stream, dos_datetime_to_system_time, extraction_outcome, extract_to_file,
    is_already_compressed, normalize_entry_name, prepare_entry_target, verify_entry,
    ArchiveBackend, ArchiveHandle, CopyError, ExtractOptions, OperationContext, OutcomeSink,
    Prepared, UpdateReport, WriteOptions,
};
use crate::core::credentials::Passphrase;
use crate::core::file_ops::{SourceItem, StagedArchive};
use crate::core::registry::FormatId;
use crate::models::{ArchiveError, EntryDescriptor, EntryOutcome, Result, SelectorMatcher};

/// ZIP archive handler
///
/// Reads AES and ZipCrypto entries, writes AES-256. Updates copy retained
/// entries byte-for-byte into a staged archive, so encrypted entries survive
/// without a passphrase.
pub struct ZipHandler;

impl ZipHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ZipHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path).map_err(|e| ArchiveError::from_io(e, path.display()))?;
    ZipArchive::new(file).map_err(|e| archive_error(e, path))
}

fn archive_error(err: ZipError, path: &Path) -> ArchiveError {
    match err {
        ZipError::Io(e) => ArchiveError::from_io(e, path.display()),
        other => ArchiveError::CorruptArchive {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}

fn write_error(err: ZipError, subject: &str) -> ArchiveError {
    match err {
        ZipError::Io(e) => ArchiveError::from_io(e, subject),
        other => ArchiveError::CorruptEntry {
            entry: subject.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Metadata of one entry, read from the central directory without decoding
struct RawEntry {
    name: String,
    is_dir: bool,
    size: u64,
    encrypted: bool,
    unix_mode: Option<u32>,
}

fn raw_entry(archive: &mut ZipArchive<File>, index: usize, path: &Path) -> Result<RawEntry> {
    let file = archive
        .by_index_raw(index)
        .map_err(|e| archive_error(e, path))?;
    Ok(RawEntry {
        name: normalize_entry_name(file.name()),
        is_dir: file.is_dir(),
        size: file.size(),
        encrypted: file.encrypted(),
        unix_mode: file.unix_mode(),
    })
}

/// Open an entry for decoding, mapping password failures to their own kinds
fn open_entry<'a>(
    archive: &'a mut ZipArchive<File>,
    index: usize,
    name: &str,
    passphrase: Option<&Passphrase>,
) -> Result<ZipFile<'a>> {
    let result = match passphrase {
        Some(p) => archive.by_index_decrypt(index, p.as_bytes()),
        None => archive.by_index(index),
    };
    result.map_err(|e| match e {
        ZipError::InvalidPassword => ArchiveError::WrongPassphrase(name.to_string()),
        ZipError::UnsupportedArchive(msg) if msg == ZipError::PASSWORD_REQUIRED => {
            ArchiveError::PassphraseRequired(name.to_string())
        }
        other => ArchiveError::CorruptEntry {
            entry: name.to_string(),
            reason: other.to_string(),
        },
    })
}

/// Per-entry write options
///
/// Already-compressed formats (PNG, JPG, MP4…) are stored as-is; everything
/// else is deflated at the requested level.
fn entry_options<'k>(
    name: &str,
    is_dir: bool,
    level: u32,
    passphrase: Option<&'k Passphrase>,
) -> FileOptions<'k, ()> {
    let options = if is_dir || level == 0 || is_already_compressed(name) {
        FileOptions::<()>::default().compression_method(CompressionMethod::Stored)
    } else {
        FileOptions::<()>::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(level as i64))
    };
    let options = options.unix_permissions(if is_dir { 0o755 } else { 0o644 });
    match passphrase {
        Some(p) if !is_dir => options.with_aes_encryption(AesMode::Aes256, p.expose()),
        _ => options,
    }
}

/// Write source items into an open writer, one outcome per item
fn write_sources<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    sources: &[SourceItem],
    options: &WriteOptions<'_>,
    ctx: &OperationContext,
) -> Result<Vec<EntryOutcome>> {
    let mut outcomes = Vec::with_capacity(sources.len());

    for item in sources {
        ctx.check_entry()?;
        ctx.progress().begin_entry(&item.name);
        let opts = entry_options(
            &item.name,
            item.is_dir,
            options.compression_level,
            options.passphrase,
        );

        let outcome = if item.is_dir {
            match zip.add_directory(item.name.as_str(), opts) {
                Ok(()) => EntryOutcome::succeeded(&item.name, 0),
                Err(e) => EntryOutcome::failed(&item.name, write_error(e, &item.name)),
            }
        } else {
            write_file(zip, item, opts, ctx)?
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

fn write_file<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    item: &SourceItem,
    opts: FileOptions<'_, ()>,
    ctx: &OperationContext,
) -> Result<EntryOutcome> {
    let mut source = match File::open(&item.source) {
        Ok(f) => f,
        Err(e) => {
            return Ok(EntryOutcome::failed(
                &item.name,
                ArchiveError::from_io(e, item.source.display()),
            ))
        }
    };
    if let Err(e) = zip.start_file(item.name.as_str(), opts) {
        return Ok(EntryOutcome::failed(&item.name, write_error(e, &item.name)));
    }

    match copy_stream(&mut source, zip, ctx, false) {
        Ok(stats) => Ok(EntryOutcome::succeeded(&item.name, stats.bytes)),
        Err(err) => {
            // Drop the half-written entry so the archive stays consistent
            zip.abort_file()
                .map_err(|e| write_error(e, &item.name))?;
            match err {
                CopyError::Cancelled => Err(ArchiveError::Cancelled),
                CopyError::Read(e) => Ok(EntryOutcome::failed(
                    &item.name,
                    ArchiveError::from_io(e, item.source.display()),
                )),
                CopyError::Write(e) => Err(ArchiveError::from_io(e, &item.name)),
            }
        }
    }
}

impl ArchiveBackend for ZipHandler {
    fn supports(&self, format: FormatId) -> bool {
        format == FormatId::Zip
    }

    fn list(
        &self,
        handle: &ArchiveHandle,
        _passphrase: Option<&Passphrase>,
    ) -> Result<Vec<EntryDescriptor>> {
        let mut archive = open_archive(&handle.path)?;
        let mut entries = Vec::with_capacity(archive.len());

        for index in 0..archive.len() {
            let file = archive
                .by_index_raw(index)
                .map_err(|e| archive_error(e, &handle.path))?;
            let modified = file
                .last_modified()
                .and_then(|dt| dos_datetime_to_system_time(dt.datepart(), dt.timepart()));
            entries.push(EntryDescriptor {
                path: normalize_entry_name(file.name()),
                size: file.size(),
                compressed_size: Some(file.compressed_size()),
                modified,
                crc32: Some(file.crc32()),
                is_directory: file.is_dir(),
                is_encrypted: file.encrypted(),
            });
        }

        Ok(entries)
    }

    /// Extract ZIP entries to the destination directory
    ///
    /// # Behavior
    /// - Preserves directory hierarchy
    /// - Creates parent directories as needed
    /// - Sets file permissions on Unix systems
    fn extract(
        &self,
        handle: &ArchiveHandle,
        options: &ExtractOptions<'_>,
        ctx: &OperationContext,
        sink: &mut OutcomeSink<'_>,
    ) -> Result<()> {
        let mut archive = open_archive(&handle.path)?;
        let has_passphrase = options.passphrase.is_some();
        let mut matched = false;

        for index in 0..archive.len() {
            let entry = raw_entry(&mut archive, index, &handle.path)?;
            if !options.selector.matches(&entry.name) {
                continue;
            }
            matched = true;
            ctx.check_entry()?;
            ctx.progress().begin_entry(&entry.name);

            let outcome = match prepare_entry_target(options, &entry.name, entry.is_dir) {
                Prepared::Done(outcome) => outcome,
                Prepared::Target(target) => {
                    match open_entry(&mut archive, index, &entry.name, options.passphrase) {
                        Err(e) => EntryOutcome::failed(&entry.name, e),
                        Ok(mut file) => {
                            let result =
                                extract_to_file(&mut file, &target, ctx, options.compute_digest);
                            // The zip reader verifies CRC-32 itself
                            extraction_outcome(
                                &entry.name,
                                target,
                                result,
                                None,
                                entry.encrypted,
                                has_passphrase,
                            )?
                        }
                    }
                }
            };

            #[cfg(unix)]
            if let (Some(mode), Some(target)) = (entry.unix_mode, outcome.target.as_ref()) {
                use std::os::unix::fs::PermissionsExt;
                if outcome.status.is_success() && !entry.is_dir {
                    if let Err(e) = fs::set_permissions(target, fs::Permissions::from_mode(mode)) {
                        log::debug!("Failed to set permissions on {}: {}", target.display(), e);
                    }
                }
            }

            ctx.progress().finish_entry(entry.size, outcome.bytes);
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
        passphrase: Option<&Passphrase>,
        ctx: &OperationContext,
        sink: &mut OutcomeSink<'_>,
    ) -> Result<()> {
        let mut archive = open_archive(&handle.path)?;

        for index in 0..archive.len() {
            let entry = raw_entry(&mut archive, index, &handle.path)?;
            ctx.check_entry()?;
            ctx.progress().begin_entry(&entry.name);

            let outcome = if entry.is_dir {
                EntryOutcome::succeeded(&entry.name, 0)
            } else {
                match open_entry(&mut archive, index, &entry.name, passphrase) {
                    Err(e) => EntryOutcome::failed(&entry.name, e),
                    // The reader checks CRC-32, or the HMAC of AE-2 entries whose stored CRC is 0
                    Ok(mut file) => verify_entry(
                        &entry.name,
                        &mut file,
                        ctx,
                        None,
                        entry.encrypted,
                        passphrase.is_some(),
                    )?,
                }
            };

            ctx.progress().finish_entry(entry.size, outcome.bytes);
            if !sink.record(outcome) {
                break;
            }
        }
        Ok(())
    }

    /// Create ZIP archive from source items
    ///
    /// # Behavior
    /// - Streams each file through the writer in bounded chunks
    /// - Already-compressed formats are stored without re-compression
    /// - The archive only appears at `target` once fully written
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
            let mut zip = ZipWriter::new(staged.file_mut());
            let outcomes = write_sources(&mut zip, sources, options, ctx)?;
            zip.finish()
                .map_err(|e| write_error(e, &target.display().to_string()))?;
            outcomes
        };
        staged.commit()?;
        log::info!("Created ZIP archive {} ({} items)", target.display(), outcomes.len());
        Ok(outcomes)
    }

    fn update(
        &self,
        handle: &ArchiveHandle,
        add: &[SourceItem],
        remove: Option<&SelectorMatcher>,
        options: &WriteOptions<'_>,
        ctx: &OperationContext,
    ) -> Result<UpdateReport> {
        let mut source = open_archive(&handle.path)?;
        let replaced: HashSet<&str> = add.iter().map(|i| i.name.as_str()).collect();
        let mut report = UpdateReport::default();
        let mut remove_matched = false;
        let mut staged = StagedArchive::new(&handle.path)?;

        {
            let mut zip = ZipWriter::new(staged.file_mut());
            for index in 0..source.len() {
                ctx.check_entry()?;
                let file = source
                    .by_index_raw(index)
                    .map_err(|e| archive_error(e, &handle.path))?;
                let name = normalize_entry_name(file.name());
                let selected = remove.map_or(false, |m| m.matches(&name));
                remove_matched |= selected;
                if selected || replaced.contains(name.as_str()) {
                    report.removed.push(name);
                    continue;
                }
                zip.raw_copy_file(file).map_err(|e| write_error(e, &name))?;
            }

            if let Some(wanted) = remove.and_then(|m| m.requires_match()) {
                if !remove_matched {
                    return Err(ArchiveError::EntryNotFound(wanted.to_string()));
                }
            }

            report.added = write_sources(&mut zip, add, options, ctx)?;
            zip.finish()
                .map_err(|e| write_error(e, &handle.path.display().to_string()))?;
        }

        staged.commit()?;
        log::info!(
            "Updated ZIP archive {}: {} added, {} removed",
            handle.path.display(),
            report.added.len(),
            report.removed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::file_ops::FileScanner;
    use crate::core::registry::{capabilities_of, Confidence};
    use crate::core::compression::common::OpenMode;
    use crate::models::{EntrySelector, OutcomeStatus, OverwritePolicy};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_files(dir: &Path) -> PathBuf {
        let root = dir.join("payload");
        fs::create_dir_all(root.join("subdir")).unwrap();
        fs::write(root.join("file1.txt"), b"content1").unwrap();
        fs::write(root.join("file2.txt"), b"content2").unwrap();
        fs::write(root.join("subdir/file3.txt"), b"content3").unwrap();
        root
    }

    fn handle(path: &Path) -> ArchiveHandle {
        ArchiveHandle {
            path: path.to_path_buf(),
            format: FormatId::Zip,
            confidence: Confidence::Signature,
            mode: OpenMode::ReadWrite,
            has_passphrase: false,
            capabilities: capabilities_of(FormatId::Zip),
            multi_volume: false,
        }
    }

    fn write_opts(passphrase: Option<&Passphrase>) -> WriteOptions<'_> {
        WriteOptions {
            passphrase,
            compression_level: 6,
            stop_on_error: false,
        }
    }

    fn build_zip(dir: &Path, passphrase: Option<&Passphrase>) -> PathBuf {
        let root = create_test_files(dir);
        let sources = FileScanner::new().collect(&[root]).unwrap();
        let target = dir.join("test.zip");
        let outcomes = ZipHandler::new()
            .create(
                &target,
                FormatId::Zip,
                &sources,
                &write_opts(passphrase),
                &OperationContext::detached(),
            )
            .unwrap();
        assert!(outcomes.iter().all(|o| o.status.is_success()));
        target
    }

    fn extract_all(
        archive: &Path,
        dest: &Path,
        passphrase: Option<&Passphrase>,
    ) -> Vec<EntryOutcome> {
        let matcher = EntrySelector::All.matcher().unwrap();
        let options = ExtractOptions {
            selector: &matcher,
            destination: dest,
            passphrase,
            overwrite: OverwritePolicy::Overwrite,
            stop_on_error: false,
            compute_digest: false,
        };
        let mut outcomes = Vec::new();
        let mut deliver = |o: EntryOutcome| outcomes.push(o);
        let mut sink = OutcomeSink::new(&mut deliver, false);
        ZipHandler::new()
            .extract(&handle(archive), &options, &OperationContext::detached(), &mut sink)
            .unwrap();
        drop(sink);
        outcomes
    }

    #[test]
    fn test_supports() {
        let handler = ZipHandler::new();
        assert!(handler.supports(FormatId::Zip));
        assert!(!handler.supports(FormatId::SevenZ));
    }

    #[test]
    fn test_create_and_list() {
        let temp = TempDir::new().unwrap();
        let zip_path = build_zip(temp.path(), None);

        let entries = ZipHandler::new().list(&handle(&zip_path), None).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert!(names.contains(&"payload"));
        assert!(names.contains(&"payload/file1.txt"));
        assert!(names.contains(&"payload/subdir/file3.txt"));

        let file1 = entries.iter().find(|e| e.path == "payload/file1.txt").unwrap();
        assert_eq!(file1.size, 8);
        assert_eq!(file1.crc32, Some(crc32fast::hash(b"content1")));
        assert!(!file1.is_encrypted);
    }

    #[test]
    fn test_extract_preserves_hierarchy() {
        let temp = TempDir::new().unwrap();
        let zip_path = build_zip(temp.path(), None);
        let out = temp.path().join("out");

        let outcomes = extract_all(&zip_path, &out, None);
        assert!(outcomes.iter().all(|o| o.status.is_success()));
        assert_eq!(fs::read(out.join("payload/file1.txt")).unwrap(), b"content1");
        assert_eq!(fs::read(out.join("payload/subdir/file3.txt")).unwrap(), b"content3");
    }

    #[test]
    fn test_aes_round_trip_and_wrong_passphrase() {
        let temp = TempDir::new().unwrap();
        let right = Passphrase::from("correct horse");
        let zip_path = build_zip(temp.path(), Some(&right));

        let entries = ZipHandler::new().list(&handle(&zip_path), None).unwrap();
        assert!(entries.iter().filter(|e| !e.is_directory).all(|e| e.is_encrypted));

        let ok = extract_all(&zip_path, &temp.path().join("ok"), Some(&right));
        assert!(ok.iter().all(|o| o.status.is_success()));
        assert_eq!(
            fs::read(temp.path().join("ok/payload/file2.txt")).unwrap(),
            b"content2"
        );

        let wrong = Passphrase::from("battery staple");
        let bad = extract_all(&zip_path, &temp.path().join("bad"), Some(&wrong));
        let failures: Vec<_> = bad.iter().filter_map(|o| o.status.error()).collect();
        assert_eq!(failures.len(), 3);
        assert!(failures
            .iter()
            .all(|e| matches!(e, ArchiveError::WrongPassphrase(_))));

        let missing = extract_all(&zip_path, &temp.path().join("none"), None);
        assert!(missing
            .iter()
            .filter_map(|o| o.status.error())
            .all(|e| matches!(e, ArchiveError::PassphraseRequired(_))));
    }

    #[test]
    fn test_integrity_accepts_correct_aes_passphrase() {
        let temp = TempDir::new().unwrap();
        let right = Passphrase::from("correct horse");
        let zip_path = build_zip(temp.path(), Some(&right));

        let mut outcomes = Vec::new();
        let mut deliver = |o: EntryOutcome| outcomes.push(o);
        let mut sink = OutcomeSink::new(&mut deliver, false);
        ZipHandler::new()
            .test_integrity(&handle(&zip_path), Some(&right), &OperationContext::detached(), &mut sink)
            .unwrap();
        drop(sink);

        assert!(!outcomes.is_empty());
        assert!(outcomes.iter().all(|o| o.status.is_success()), "{:?}", outcomes);
    }

    #[test]
    fn test_update_add_and_remove() {
        let temp = TempDir::new().unwrap();
        let zip_path = build_zip(temp.path(), None);
        let extra = temp.path().join("extra.txt");
        fs::write(&extra, b"extra").unwrap();
        let add = FileScanner::new().collect(&[extra]).unwrap();
        let remove = EntrySelector::path("payload/subdir").matcher().unwrap();

        let report = ZipHandler::new()
            .update(
                &handle(&zip_path),
                &add,
                Some(&remove),
                &write_opts(None),
                &OperationContext::detached(),
            )
            .unwrap();
        assert_eq!(report.removed, vec!["payload/subdir", "payload/subdir/file3.txt"]);
        assert!(matches!(report.added[0].status, OutcomeStatus::Succeeded));

        let names: Vec<_> = ZipHandler::new()
            .list(&handle(&zip_path), None)
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert!(names.contains(&"extra.txt".to_string()));
        assert!(names.contains(&"payload/file1.txt".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("payload/subdir")));
    }

    #[test]
    fn test_update_missing_entry_leaves_archive_untouched() {
        let temp = TempDir::new().unwrap();
        let zip_path = build_zip(temp.path(), None);
        let before = fs::read(&zip_path).unwrap();
        let remove = EntrySelector::path("nope.txt").matcher().unwrap();

        let err = ZipHandler::new()
            .update(
                &handle(&zip_path),
                &[],
                Some(&remove),
                &write_opts(None),
                &OperationContext::detached(),
            )
            .unwrap_err();
        assert!(matches!(err, ArchiveError::EntryNotFound(_)));
        assert_eq!(fs::read(&zip_path).unwrap(), before);
    }

    #[test]
    fn test_zip_slip_entry_is_rejected() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("evil.zip");
        {
            let mut zip = ZipWriter::new(File::create(&zip_path).unwrap());
            zip.start_file("../escape.txt", FileOptions::<()>::default())
                .unwrap();
            zip.write_all(b"gotcha").unwrap();
            zip.start_file("fine.txt", FileOptions::<()>::default()).unwrap();
            zip.write_all(b"fine").unwrap();
            zip.finish().unwrap();
        }
        let out = temp.path().join("out");
        let outcomes = extract_all(&zip_path, &out, None);
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes[0].status.error(),
            Some(ArchiveError::UnsafeEntryPath(_))
        ));
        assert!(outcomes[1].status.is_success());
        assert!(!temp.path().join("escape.txt").exists());
    }
}
