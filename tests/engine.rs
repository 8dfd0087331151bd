use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use archive_master::commands::archive as cmd;
use archive_master::core::compression::common::OperationContext;
use archive_master::core::registry::{capabilities_of, FormatId};
use archive_master::core::{
    create_archive, run_batch, ArchiveSession, ExtractSettings, OpenOptions, Passphrase,
    WriteSettings,
};
use archive_master::models::{
    BatchJob, EngineConfig, EntryOutcome, EntrySelector, ErrorKind, IntegrityStatus, JobStatus,
    OperationRequest, OutcomeStatus,
};
use archive_master::utils::{
    CancellationToken, FnSink, NullSink, ProgressEmitter, ProgressEvent, ProgressReporter,
};
use tempfile::TempDir;
use walkdir::WalkDir;

const CHUNK: usize = 64 * 1024;

/// Deterministic bytes that do not compress to nothing
fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

fn create_test_files(dir: &Path) -> PathBuf {
    let root = dir.join("tree");
    fs::create_dir_all(root.join("docs/deep")).unwrap();
    fs::create_dir_all(root.join("empty")).unwrap();
    fs::write(root.join("readme.txt"), b"hello archive").unwrap();
    fs::write(root.join("docs/notes.md"), "# notes\n".repeat(500)).unwrap();
    fs::write(root.join("docs/deep/blob.bin"), noise(300 * 1024, 7)).unwrap();
    fs::write(root.join("docs/zero.dat"), b"").unwrap();
    root
}

fn relative_files(root: &Path) -> Vec<(PathBuf, Option<Vec<u8>>)> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.unwrap())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
            let body = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
            (rel, body)
        })
        .collect()
}

fn settings() -> ExtractSettings {
    ExtractSettings::default()
}

fn round_trip(name: &str, passphrase: Option<Passphrase>) {
    let temp = TempDir::new().unwrap();
    let root = create_test_files(temp.path());
    let archive = temp.path().join(name);
    let created = create_archive(
        &archive,
        &[root.clone()],
        passphrase.as_ref(),
        WriteSettings::default(),
        &OperationContext::detached(),
    )
    .unwrap();
    assert!(created.iter().all(|o| o.status.is_success()), "{:?}", created);

    let options = OpenOptions {
        passphrase,
        ..OpenOptions::default()
    };
    let session = ArchiveSession::open(&archive, options).unwrap();
    let out = temp.path().join("out");
    let outcomes = session
        .extract_all(&out, settings(), &OperationContext::detached())
        .unwrap();
    assert!(outcomes.iter().all(|o| o.status.is_success()), "{:?}", outcomes);
    assert_eq!(relative_files(&root), relative_files(&out.join("tree")));
}

#[test]
fn round_trip_zip() {
    round_trip("tree.zip", None);
}

#[test]
fn round_trip_encrypted_zip() {
    round_trip("tree.zip", Some(Passphrase::new("correct horse")));
}

#[test]
fn round_trip_tar() {
    round_trip("tree.tar", None);
}

#[test]
fn round_trip_tar_gz() {
    round_trip("tree.tar.gz", None);
}

#[test]
fn round_trip_7z() {
    round_trip("tree.7z", None);
}

#[test]
fn integrity_test_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let root = create_test_files(temp.path());
    for name in ["t.zip", "t.7z", "t.tar.bz2", "t.tar.zst"] {
        let archive = temp.path().join(name);
        create_archive(
            &archive,
            &[root.clone()],
            None,
            WriteSettings::default(),
            &OperationContext::detached(),
        )
        .unwrap();
        let before = fs::read(&archive).unwrap();

        let session = ArchiveSession::open(&archive, OpenOptions::default()).unwrap();
        let first = session.test_integrity(&OperationContext::detached()).unwrap();
        let second = session.test_integrity(&OperationContext::detached()).unwrap();
        assert_eq!(first, second, "{}", name);
        assert!(first.iter().all(|r| r.is_ok()), "{}: {:?}", name, first);
        assert_eq!(before, fs::read(&archive).unwrap(), "{} was modified", name);
    }
}

/// Ten stored entries; the payload of `file05.txt` gets one flipped byte
fn create_damaged_zip(dir: &Path) -> PathBuf {
    let path = dir.join("damaged.zip");
    let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for i in 0..10 {
        writer.start_file(format!("file{:02}.txt", i), options).unwrap();
        writer
            .write_all(format!("payload-{:02}-", i).repeat(200).as_bytes())
            .unwrap();
    }
    writer.finish().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    let marker = b"payload-05-";
    let at = bytes
        .windows(marker.len())
        .position(|w| w == marker)
        .unwrap();
    bytes[at + 40] ^= 0xFF;
    fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn damaged_entry_does_not_affect_others() {
    let temp = TempDir::new().unwrap();
    let archive = create_damaged_zip(temp.path());
    let session = ArchiveSession::open(&archive, OpenOptions::default()).unwrap();

    let results = session.test_integrity(&OperationContext::detached()).unwrap();
    assert_eq!(results.len(), 10);
    let failed: Vec<_> = results.iter().filter(|r| !r.is_ok()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].path, "file05.txt");
    assert!(matches!(
        failed[0].status,
        IntegrityStatus::Failed {
            kind: ErrorKind::CorruptEntry,
            ..
        }
    ));

    let out = temp.path().join("out");
    let outcomes = session
        .extract_all(&out, settings(), &OperationContext::detached())
        .unwrap();
    assert_eq!(outcomes.iter().filter(|o| o.status.is_success()).count(), 9);
    assert!(!out.join("file05.txt").exists());
    assert!(out.join("file06.txt").exists());
}

#[test]
fn batch_reports_damaged_entry_and_finishes_the_rest() {
    let temp = TempDir::new().unwrap();
    let archive = create_damaged_zip(temp.path());
    let out = temp.path().join("out");
    let mut job = BatchJob::new(vec![OperationRequest::extract_all(&archive, &out)]);

    run_batch(
        &mut job,
        &EngineConfig::default(),
        ProgressEmitter::silent(),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(job.status(), JobStatus::Completed);
    let summary = job.summary();
    assert_eq!(summary.succeeded, 9);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].item, "file05.txt");
    match &summary.failed[0].status {
        OutcomeStatus::Failed(e) => assert_eq!(e.kind(), ErrorKind::CorruptEntry),
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(
        summary.into_result().unwrap_err().kind(),
        ErrorKind::PartialBatchFailure
    );
    assert!(out.join("file09.txt").exists());
}

#[test]
fn listing_does_not_read_bodies() {
    let temp = TempDir::new().unwrap();
    let archive = create_damaged_zip(temp.path());
    let session = cmd::open_archive(&archive).unwrap();
    let entries = cmd::list_entries(&session).unwrap();
    assert_eq!(entries.len(), 10);
    assert_eq!(entries[5].path, "file05.txt");
    assert_eq!(entries[5].size, 2200);
}

#[test]
fn wrong_passphrase_is_distinct_from_corruption() {
    let temp = TempDir::new().unwrap();
    let root = create_test_files(temp.path());
    let archive = temp.path().join("locked.zip");
    create_archive(
        &archive,
        &[root],
        Some(&Passphrase::new("right")),
        WriteSettings::default(),
        &OperationContext::detached(),
    )
    .unwrap();

    let session = ArchiveSession::open(
        &archive,
        OpenOptions::default().with_passphrase(Passphrase::new("wrong")),
    )
    .unwrap();
    let results = session.test_integrity(&OperationContext::detached()).unwrap();
    let kinds: Vec<ErrorKind> = results
        .iter()
        .filter_map(|r| match &r.status {
            IntegrityStatus::Failed { kind, .. } => Some(*kind),
            IntegrityStatus::Ok => None,
        })
        .collect();
    assert!(!kinds.is_empty());
    assert!(kinds.iter().all(|k| *k == ErrorKind::WrongPassphrase), "{:?}", kinds);

    let plain = ArchiveSession::open(&archive, OpenOptions::default()).unwrap();
    let results = plain.test_integrity(&OperationContext::detached()).unwrap();
    assert!(results.iter().any(|r| matches!(
        r.status,
        IntegrityStatus::Failed {
            kind: ErrorKind::PassphraseRequired,
            ..
        }
    )));
}

#[test]
fn integrity_test_accepts_correct_aes_passphrase() {
    let temp = TempDir::new().unwrap();
    let root = create_test_files(temp.path());
    let archive = temp.path().join("locked.zip");
    let right = Passphrase::new("right");
    create_archive(
        &archive,
        &[root],
        Some(&right),
        WriteSettings::default(),
        &OperationContext::detached(),
    )
    .unwrap();

    let session = ArchiveSession::open(
        &archive,
        OpenOptions::default().with_passphrase(right.clone()),
    )
    .unwrap();
    assert!(session.verify_passphrase(&right).unwrap());
    let results = session.test_integrity(&OperationContext::detached()).unwrap();
    assert!(results.len() >= 4);
    assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);
}

#[test]
fn cancellation_stops_within_a_few_chunks() {
    const THRESHOLD: u64 = 1024 * 1024;

    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("a_small.txt"), b"finished before the big one").unwrap();
    fs::write(src.join("b_big.bin"), noise(8 * 1024 * 1024, 3)).unwrap();
    let archive = temp.path().join("big.tar");
    create_archive(
        &archive,
        &[src],
        None,
        WriteSettings::default(),
        &OperationContext::detached(),
    )
    .unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    let sink = FnSink(move |event: &ProgressEvent| {
        if event.bytes_done >= THRESHOLD {
            trigger.cancel();
        }
    });
    let reporter = Arc::new(ProgressReporter::new(
        ProgressEmitter::new(Arc::new(sink)),
        CHUNK as u64,
    ));
    let ctx = OperationContext::new(token, Arc::clone(&reporter), CHUNK);

    let session = ArchiveSession::open(&archive, OpenOptions::default()).unwrap();
    let out = temp.path().join("out");
    let mut outcomes: Vec<EntryOutcome> = Vec::new();
    let matcher = EntrySelector::All.matcher().unwrap();
    let err = session
        .extract(&matcher, &out, settings(), &ctx, &mut |o| outcomes.push(o))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(outcomes
        .iter()
        .any(|o| o.path == "src/a_small.txt" && o.status.is_success()));
    assert!(out.join("src/a_small.txt").exists());
    assert!(!out.join("src/b_big.bin").exists());
    let moved = reporter.snapshot().bytes_done;
    assert!(moved < THRESHOLD + 4 * CHUNK as u64, "moved {} bytes", moved);
}

/// A large entry nobody selected still has its body read; cancellation must reach that read
fn skipping_unselected_entries_observes_cancellation(name: &str) {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("a_big.bin"), noise(2 * 1024 * 1024, 11)).unwrap();
    fs::write(src.join("b_small.txt"), b"small").unwrap();
    let archive = temp.path().join(name);
    create_archive(
        &archive,
        &[src],
        None,
        WriteSettings::default(),
        &OperationContext::detached(),
    )
    .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let ctx = OperationContext::new(token, Arc::new(ProgressReporter::silent()), CHUNK);
    let session = ArchiveSession::open(&archive, OpenOptions::default()).unwrap();
    let matcher = EntrySelector::glob("*.none").matcher().unwrap();
    let out = temp.path().join("out");
    let mut outcomes: Vec<EntryOutcome> = Vec::new();
    let err = session
        .extract(&matcher, &out, settings(), &ctx, &mut |o| outcomes.push(o))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled, "{}", name);
    assert!(outcomes.is_empty(), "{}: {:?}", name, outcomes);
}

#[test]
fn skipping_tar_entries_observes_cancellation() {
    skipping_unselected_entries_observes_cancellation("skip.tar.gz");
}

#[test]
fn skipping_7z_entries_observes_cancellation() {
    skipping_unselected_entries_observes_cancellation("skip.7z");
}

#[test]
fn concurrent_listings_are_identical() {
    let temp = TempDir::new().unwrap();
    let root = create_test_files(temp.path());
    let archive = temp.path().join("shared.tar.xz");
    create_archive(
        &archive,
        &[root],
        None,
        WriteSettings::default(),
        &OperationContext::detached(),
    )
    .unwrap();

    let listings: Vec<_> = (0..6)
        .map(|_| {
            let archive = archive.clone();
            thread::spawn(move || {
                let session = cmd::open_archive(&archive).unwrap();
                let entries = cmd::list_entries(&session).unwrap();
                (*entries).clone()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();
    assert!(listings.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(listings[0].len(), 8);
}

#[test]
fn rar_is_read_only() {
    assert!(!capabilities_of(FormatId::Rar).can_write);

    let temp = TempDir::new().unwrap();
    let root = create_test_files(temp.path());
    let err = create_archive(
        &temp.path().join("out.rar"),
        &[root],
        None,
        WriteSettings::default(),
        &OperationContext::detached(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadOnly);
}

#[test]
fn unknown_file_is_unsupported() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("notes.txt");
    fs::write(&path, b"just text, not an archive").unwrap();
    let err = cmd::open_archive(&path).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
}

#[test]
fn batch_job_from_json() {
    let temp = TempDir::new().unwrap();
    let root = create_test_files(temp.path());
    let archive = temp.path().join("job.zip");
    let out = temp.path().join("out");
    let job_file = temp.path().join("job.json");
    let requests = serde_json::json!([
        { "kind": "createArchive", "archive": archive, "sources": [root] },
        { "kind": "testIntegrity", "archive": archive },
        {
            "kind": "extractEntry",
            "archive": archive,
            "selector": { "type": "glob", "value": "tree/docs/*.md" },
            "destination": out
        },
        {
            "kind": "removeEntry",
            "archive": archive,
            "selector": { "type": "path", "value": "tree/docs/deep" }
        }
    ]);
    fs::write(&job_file, serde_json::to_string(&requests).unwrap()).unwrap();

    let job = BatchJob::from_json_file(&job_file).unwrap();
    let handle = cmd::submit_batch(job, EngineConfig::default(), Arc::new(NullSink));
    let job = handle.wait().unwrap();

    assert_eq!(job.status(), JobStatus::Completed);
    let summary = job.summary();
    assert!(summary.failed.is_empty(), "{:?}", summary.failed);
    assert!(out.join("tree/docs/notes.md").exists());
    assert!(!out.join("tree/readme.txt").exists());

    let session = cmd::open_archive(&archive).unwrap();
    let names: Vec<String> = cmd::list_entries(&session)
        .unwrap()
        .iter()
        .map(|e| e.path.clone())
        .collect();
    assert!(!names.iter().any(|n| n.starts_with("tree/docs/deep")));
    assert!(names.contains(&"tree/readme.txt".to_string()));
}

#[test]
fn job_handle_cancel_skips_remaining_requests() {
    let temp = TempDir::new().unwrap();
    let root = create_test_files(temp.path());
    let archive = temp.path().join("c.tar.gz");
    create_archive(
        &archive,
        &[root],
        None,
        WriteSettings::default(),
        &OperationContext::detached(),
    )
    .unwrap();

    let requests = (0..20)
        .map(|i| OperationRequest::extract_all(&archive, temp.path().join(format!("out{}", i))))
        .collect();
    let handle = cmd::submit_batch(BatchJob::new(requests), EngineConfig::default(), Arc::new(NullSink));
    cmd::cancel(&handle);
    let job = handle.wait().unwrap();

    assert_eq!(job.status(), JobStatus::Cancelled);
    let summary = job.summary();
    assert!(summary.failed.is_empty());
    assert!(job
        .outcomes()
        .iter()
        .any(|o| matches!(o.status, OutcomeStatus::Skipped(_))));
    assert_eq!(summary.into_result().unwrap_err().kind(), ErrorKind::Cancelled);
}
