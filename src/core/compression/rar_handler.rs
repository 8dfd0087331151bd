use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use unrar::error::{Code, UnrarError};
use unrar::{Archive, CursorBeforeHeader, OpenArchive, Process};

use crate::core::compression::common::{
    digest_file, dos_datetime_to_system_time, normalize_entry_name, prepare_entry_target,
    remove_partial, ArchiveBackend, ArchiveHandle, ExtractOptions, OperationContext, OutcomeSink,
    Prepared,
};
use crate::core::credentials::{classify_decode_failure, Passphrase};
use crate::core::registry::FormatId;
use crate::models::{ArchiveError, EntryDescriptor, EntryOutcome, Result};

/// RAR archive handler (read-only)
///
/// Wraps the bundled unrar library. The library extracts and tests whole
/// entries, so cancellation is honored between entries. A failed entry leaves
/// the library cursor unusable; the archive is reopened and the processed
/// headers skipped before carrying on.
pub struct RarHandler;

impl RarHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RarHandler {
    fn default() -> Self {
        Self::new()
    }
}

type Cursor = OpenArchive<Process, CursorBeforeHeader>;

fn archive_for<'a>(path: &'a Path, passphrase: Option<&'a Passphrase>) -> Archive<'a> {
    match passphrase {
        Some(p) => Archive::with_password(path, p.as_bytes()),
        None => Archive::new(path),
    }
}

/// Failures while opening or walking headers concern the whole archive
fn map_archive_error(err: UnrarError, path: &Path, has_passphrase: bool) -> ArchiveError {
    let subject = path.display().to_string();
    match err.code {
        Code::MissingPassword => ArchiveError::PassphraseRequired(subject),
        Code::BadPassword => ArchiveError::WrongPassphrase(subject),
        // Encrypted headers decode to garbage under a wrong key
        Code::BadData if has_passphrase => ArchiveError::WrongPassphrase(subject),
        Code::NoMemory => ArchiveError::Io(io::Error::new(io::ErrorKind::OutOfMemory, subject)),
        _ => ArchiveError::CorruptArchive {
            path: path.to_path_buf(),
            reason: format!("{:?}", err.code),
        },
    }
}

fn map_entry_error(err: &UnrarError, name: &str, encrypted: bool, has_passphrase: bool) -> ArchiveError {
    match err.code {
        Code::MissingPassword => ArchiveError::PassphraseRequired(name.to_string()),
        Code::BadPassword => ArchiveError::WrongPassphrase(name.to_string()),
        Code::ECreate | Code::EWrite | Code::EClose => ArchiveError::from_io(
            io::Error::other(format!("{:?}", err.code)),
            name,
        ),
        // EOpen mid-archive means a missing volume
        Code::EOpen => ArchiveError::CorruptEntry {
            entry: name.to_string(),
            reason: "next volume is missing".to_string(),
        },
        code => classify_decode_failure(name, encrypted, has_passphrase, format!("{:?}", code)),
    }
}

/// Open for processing and move past the first `skip` headers
fn open_at(path: &Path, passphrase: Option<&Passphrase>, skip: usize) -> Result<Option<Cursor>> {
    let has_passphrase = passphrase.is_some();
    let mut cursor = archive_for(path, passphrase)
        .open_for_processing()
        .map_err(|e| map_archive_error(e, path, has_passphrase))?;
    for _ in 0..skip {
        match cursor
            .read_header()
            .map_err(|e| map_archive_error(e, path, has_passphrase))?
        {
            Some(header) => {
                cursor = header
                    .skip()
                    .map_err(|e| map_archive_error(e, path, has_passphrase))?;
            }
            None => return Ok(None),
        }
    }
    Ok(Some(cursor))
}

/// Header fields read before the cursor is consumed
struct RarEntry {
    name: String,
    encrypted: bool,
    is_dir: bool,
    size: u64,
}

/// What to do with the entry under the cursor
enum Visit {
    Pass,
    Done(EntryOutcome),
    Extract(PathBuf),
    Test,
}

/// What happened to a visited entry
enum Ran {
    Done(EntryOutcome),
    Extracted(PathBuf, std::result::Result<(), UnrarError>),
    Tested(std::result::Result<(), UnrarError>),
}

/// Walk every header, letting `decide` choose per entry and `report` see results
///
/// Stops after the last header or when `report` returns `false`.
fn walk<D, R>(path: &Path, passphrase: Option<&Passphrase>, mut decide: D, mut report: R) -> Result<()>
where
    D: FnMut(&RarEntry) -> Result<Visit>,
    R: FnMut(&RarEntry, Ran) -> Result<bool>,
{
    let has_passphrase = passphrase.is_some();
    let archive_err = |e| map_archive_error(e, path, has_passphrase);
    let mut index = 0usize;
    let mut cursor = open_at(path, passphrase, 0)?;

    while let Some(current) = cursor.take() {
        let Some(header) = current.read_header().map_err(archive_err)? else {
            break;
        };
        let entry = {
            let h = header.entry();
            RarEntry {
                name: normalize_entry_name(&h.filename.to_string_lossy()),
                encrypted: h.is_encrypted(),
                is_dir: h.is_directory(),
                size: h.unpacked_size,
            }
        };
        index += 1;

        let ran = match decide(&entry)? {
            Visit::Pass => {
                cursor = Some(header.skip().map_err(archive_err)?);
                continue;
            }
            Visit::Done(outcome) => {
                cursor = Some(header.skip().map_err(archive_err)?);
                Ran::Done(outcome)
            }
            Visit::Extract(target) => match header.extract_to(&target) {
                Ok(next) => {
                    cursor = Some(next);
                    Ran::Extracted(target, Ok(()))
                }
                Err(e) => {
                    // The failed call consumed the cursor
                    cursor = open_at(path, passphrase, index)?;
                    Ran::Extracted(target, Err(e))
                }
            },
            Visit::Test => match header.test() {
                Ok(next) => {
                    cursor = Some(next);
                    Ran::Tested(Ok(()))
                }
                Err(e) => {
                    cursor = open_at(path, passphrase, index)?;
                    Ran::Tested(Err(e))
                }
            },
        };
        if !report(&entry, ran)? {
            break;
        }
    }
    Ok(())
}

impl ArchiveBackend for RarHandler {
    fn supports(&self, format: FormatId) -> bool {
        format == FormatId::Rar
    }

    fn list(
        &self,
        handle: &ArchiveHandle,
        passphrase: Option<&Passphrase>,
    ) -> Result<Vec<EntryDescriptor>> {
        let has_passphrase = passphrase.is_some();
        let listing = archive_for(&handle.path, passphrase)
            .open_for_listing()
            .map_err(|e| map_archive_error(e, &handle.path, has_passphrase))?;

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for header in listing {
            let header = header.map_err(|e| map_archive_error(e, &handle.path, has_passphrase))?;
            let path = normalize_entry_name(&header.filename.to_string_lossy());
            // Entries split across volumes show up once per volume
            if !seen.insert(path.clone()) {
                continue;
            }
            let stamp = header.file_time;
            entries.push(EntryDescriptor {
                path,
                size: header.unpacked_size,
                compressed_size: None,
                modified: dos_datetime_to_system_time((stamp >> 16) as u16, (stamp & 0xFFFF) as u16),
                crc32: Some(header.file_crc),
                is_directory: header.is_directory(),
                is_encrypted: header.is_encrypted(),
            });
        }
        Ok(entries)
    }

    /// Extract RAR entries to destination directory
    ///
    /// # Behavior
    /// - The library writes each file and checks its CRC
    /// - A failed entry's partial output is removed
    fn extract(
        &self,
        handle: &ArchiveHandle,
        options: &ExtractOptions<'_>,
        ctx: &OperationContext,
        sink: &mut OutcomeSink<'_>,
    ) -> Result<()> {
        let has_passphrase = options.passphrase.is_some();
        let mut matched = false;

        walk(
            &handle.path,
            options.passphrase,
            |entry| {
                if !options.selector.matches(&entry.name) {
                    return Ok(Visit::Pass);
                }
                matched = true;
                ctx.check_entry()?;
                ctx.progress().begin_entry(&entry.name);
                Ok(match prepare_entry_target(options, &entry.name, entry.is_dir) {
                    Prepared::Done(outcome) => Visit::Done(outcome),
                    Prepared::Target(target) => match target.parent().map(fs::create_dir_all) {
                        Some(Err(e)) => Visit::Done(EntryOutcome::failed(
                            &entry.name,
                            ArchiveError::from_io(e, target.display()),
                        )),
                        _ => Visit::Extract(target),
                    },
                })
            },
            |entry, ran| {
                let outcome = match ran {
                    Ran::Done(outcome) => outcome,
                    Ran::Extracted(target, Ok(())) => {
                        ctx.progress().add_bytes(entry.size);
                        let mut outcome = EntryOutcome::succeeded(&entry.name, entry.size)
                            .with_target(target.clone());
                        if options.compute_digest {
                            outcome.digest = digest_file(&target).ok();
                        }
                        outcome
                    }
                    Ran::Extracted(target, Err(e)) => {
                        remove_partial(&target);
                        EntryOutcome::failed(
                            &entry.name,
                            map_entry_error(&e, &entry.name, entry.encrypted, has_passphrase),
                        )
                    }
                    Ran::Tested(Ok(())) => EntryOutcome::succeeded(&entry.name, entry.size),
                    Ran::Tested(Err(e)) => EntryOutcome::failed(
                        &entry.name,
                        map_entry_error(&e, &entry.name, entry.encrypted, has_passphrase),
                    ),
                };
                ctx.progress().finish_entry(entry.size, outcome.bytes);
                Ok(sink.record(outcome))
            },
        )?;

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
        let has_passphrase = passphrase.is_some();
        walk(
            &handle.path,
            passphrase,
            |entry| {
                ctx.check_entry()?;
                ctx.progress().begin_entry(&entry.name);
                Ok(if entry.is_dir {
                    Visit::Done(EntryOutcome::succeeded(&entry.name, 0))
                } else {
                    Visit::Test
                })
            },
            |entry, ran| {
                let outcome = match ran {
                    Ran::Done(outcome) => outcome,
                    Ran::Tested(Ok(())) | Ran::Extracted(_, Ok(())) => {
                        ctx.progress().add_bytes(entry.size);
                        EntryOutcome::succeeded(&entry.name, entry.size)
                    }
                    Ran::Tested(Err(e)) | Ran::Extracted(_, Err(e)) => EntryOutcome::failed(
                        &entry.name,
                        map_entry_error(&e, &entry.name, entry.encrypted, has_passphrase),
                    ),
                };
                ctx.progress().finish_entry(entry.size, outcome.bytes);
                Ok(sink.record(outcome))
            },
        )
    }
}
