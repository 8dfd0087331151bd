use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::core::compression::common::{OpenMode, OperationContext};
use crate::core::credentials::CredentialScope;
use crate::core::file_ops::{scanner::total_size, FileScanner};
use crate::core::session::{
    create_archive, ArchiveSession, ExtractSettings, OpenOptions, WriteSettings,
};
use crate::models::{
    ArchiveError, BatchJob, EngineConfig, EntryOutcome, EntrySelector, FailurePolicy, ItemOutcome, JobStatus,
    OperationKind, OperationRequest, OutcomeStatus, Result, SkipReason,
};
use crate::utils::{
    CancellationToken, ProgressEmitter, ProgressEvent, ProgressReporter, ProgressSink, WorkerPool,
};

/// What a request is expected to touch, worked out before anything runs
#[derive(Debug, Default)]
struct Plan {
    items: u64,
    /// `None` when the size could not be known up front
    bytes: Option<u64>,
    /// Entry names and sizes, when known
    entries: Vec<(String, u64)>,
}

impl Plan {
    fn unknown() -> Self {
        Self {
            items: 1,
            bytes: None,
            entries: Vec::new(),
        }
    }

    fn from_entries(entries: Vec<(String, u64)>) -> Self {
        Self {
            items: entries.len() as u64,
            bytes: Some(entries.iter().map(|(_, size)| size).sum()),
            entries,
        }
    }
}

struct Scheduled {
    index: usize,
    request: OperationRequest,
    plan: Plan,
}

/// Run every request of a job on the calling thread
///
/// # Arguments
/// * `job` - A pending job; it holds the outcomes and final status afterwards
/// * `config` - Defaults for overwrite policy, compression level, failure policy and workers
/// * `emitter` - Receives progress and status events
/// * `cancel` - Checked between items and between streaming chunks
///
/// # Returns
/// * `Ok` once the job reached a terminal status, whatever its items did.
///   Use `job.summary().into_result()` to turn item failures into an error.
pub fn run_batch(
    job: &mut BatchJob,
    config: &EngineConfig,
    emitter: ProgressEmitter,
    cancel: &CancellationToken,
) -> Result<()> {
    let reporter = Arc::new(ProgressReporter::new(emitter, config.progress_granularity));
    let status = Mutex::new(job.status);
    execute(job, config, reporter, cancel, &status)
}

fn execute(
    job: &mut BatchJob,
    config: &EngineConfig,
    reporter: Arc<ProgressReporter>,
    cancel: &CancellationToken,
    shared_status: &Mutex<JobStatus>,
) -> Result<()> {
    if job.status != JobStatus::Pending {
        return Err(ArchiveError::JobAlreadyFinished);
    }
    config.validate()?;

    let set_status = |job: &mut BatchJob, status: JobStatus| {
        job.status = status;
        *shared_status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    };
    set_status(job, JobStatus::Running);

    let emitter = reporter.emitter().clone();
    let request_count = job.requests.len();
    emitter.emit_status("planning", format!("Planning {} requests...", request_count));
    reporter.set_status("planning");

    let scheduled: Vec<Scheduled> = std::mem::take(&mut job.requests)
        .into_iter()
        .enumerate()
        .map(|(index, request)| {
            let plan = plan_request(&request);
            Scheduled {
                index,
                request,
                plan,
            }
        })
        .collect();

    let total_items = scheduled.iter().map(|s| s.plan.items).sum();
    let total_bytes = scheduled
        .iter()
        .try_fold(0u64, |acc, s| s.plan.bytes.map(|b| acc + b));
    job.total_items = total_items;
    job.total_bytes = total_bytes;
    reporter.set_totals(total_items, total_bytes);

    let groups = group_by_archive(scheduled);
    let workers = config.effective_workers();
    log::info!(
        "Running batch: {} requests over {} archives on {} workers",
        request_count,
        groups.len(),
        workers
    );
    emitter.emit_status("running", format!("Processing {} requests...", request_count));
    reporter.set_status("running");

    let aborted = AtomicBool::new(false);
    let abort_on_error = config.failure_policy == FailurePolicy::AbortOnError;
    let results = WorkerPool::with_threads(workers).run(groups, |group| {
        let ctx = OperationContext::new(cancel.clone(), Arc::clone(&reporter), config.chunk_size);
        run_group(group, config, &ctx, &aborted, abort_on_error)
    });

    let mut finished = match results {
        Ok(groups) => groups.into_iter().flatten().collect::<Vec<_>>(),
        Err(e) => {
            set_status(job, JobStatus::Failed);
            emitter.emit_error(e.to_string());
            return Err(e);
        }
    };
    finished.sort_by_key(|(index, _, _)| *index);

    let mut outcomes = Vec::new();
    for (_, mut request, request_outcomes) in finished {
        request.passphrase = None;
        job.requests.push(request);
        outcomes.extend(request_outcomes);
    }
    // Stable: per-request order is kept
    outcomes.sort_by_key(|o| o.request_index);
    job.outcomes = outcomes;

    let progress = reporter.snapshot();
    job.completed_items = progress.items_done;
    job.completed_bytes = progress.bytes_done;

    let final_status = if cancel.is_cancelled() {
        JobStatus::Cancelled
    } else if aborted.load(Ordering::Acquire) {
        JobStatus::Failed
    } else {
        JobStatus::Completed
    };
    set_status(job, final_status);

    let summary = job.summary();
    let message = format!(
        "{} succeeded, {} failed, {} skipped",
        summary.succeeded,
        summary.failed.len(),
        summary.skipped.len()
    );
    log::info!("Batch finished ({:?}): {}", final_status, message);
    match final_status {
        JobStatus::Failed => emitter.emit_error(message),
        JobStatus::Cancelled => emitter.emit_status("cancelled", message),
        _ => emitter.emit_complete(message),
    }
    reporter.set_status(match final_status {
        JobStatus::Cancelled => "cancelled",
        JobStatus::Failed => "failed",
        _ => "complete",
    });
    Ok(())
}

/// Requests on one archive keep their order; archives appear in first-use order
fn group_by_archive(scheduled: Vec<Scheduled>) -> Vec<Vec<Scheduled>> {
    let mut keys: Vec<PathBuf> = Vec::new();
    let mut groups: Vec<Vec<Scheduled>> = Vec::new();
    for item in scheduled {
        match keys.iter().position(|k| *k == item.request.archive) {
            Some(i) => groups[i].push(item),
            None => {
                keys.push(item.request.archive.clone());
                groups.push(vec![item]);
            }
        }
    }
    groups
}

fn plan_request(request: &OperationRequest) -> Plan {
    let planned = match request.kind {
        OperationKind::AddEntry | OperationKind::CreateArchive => FileScanner::new()
            .collect(&request.sources)
            .map(|items| Plan {
                items: items.len() as u64,
                bytes: Some(total_size(&items)),
                entries: items.into_iter().map(|i| (i.name, i.size)).collect(),
            }),
        OperationKind::ExtractAll
        | OperationKind::ExtractEntry
        | OperationKind::TestIntegrity
        | OperationKind::RemoveEntry => plan_from_listing(request),
    };
    planned.unwrap_or_else(|e| {
        log::debug!("Could not plan {}: {}", request.archive.display(), e);
        Plan::unknown()
    })
}

fn plan_from_listing(request: &OperationRequest) -> Result<Plan> {
    let matcher = match request.kind {
        OperationKind::TestIntegrity => EntrySelector::All.matcher()?,
        _ => request.selector.matcher()?,
    };
    let options = OpenOptions {
        mode: OpenMode::Read,
        passphrase: request.passphrase.clone(),
    };
    let session = ArchiveSession::open(&request.archive, options)?;
    let entries = session.list_entries()?;
    session.close();

    let selected = entries
        .iter()
        .filter(|e| matcher.matches(&e.path))
        .map(|e| (e.path.clone(), if e.is_directory { 0 } else { e.size }))
        .collect();
    let mut plan = Plan::from_entries(selected);
    if request.kind == OperationKind::RemoveEntry {
        // Removal moves no entry bytes
        plan.bytes = Some(0);
    }
    Ok(plan)
}

fn run_group(
    group: Vec<Scheduled>,
    config: &EngineConfig,
    ctx: &OperationContext,
    aborted: &AtomicBool,
    abort_on_error: bool,
) -> Vec<(usize, OperationRequest, Vec<ItemOutcome>)> {
    let mut finished = Vec::with_capacity(group.len());
    for Scheduled {
        index,
        mut request,
        plan,
    } in group
    {
        let skip = if ctx.is_cancelled() {
            Some(SkipReason::Cancelled)
        } else if aborted.load(Ordering::Acquire) {
            Some(SkipReason::AbortedAfterError)
        } else {
            None
        };

        let outcomes = match skip {
            Some(reason) => {
                if reason == SkipReason::AbortedAfterError {
                    ctx.progress().credit(plan.items, plan.bytes.unwrap_or(0));
                }
                request.passphrase = None;
                vec![request_outcome(
                    index,
                    &request.archive,
                    OutcomeStatus::Skipped(reason),
                )]
            }
            None => {
                let outcomes = run_request(index, &mut request, &plan, config, ctx, abort_on_error);
                if abort_on_error && outcomes.iter().any(|o| o.status.is_failure()) {
                    aborted.store(true, Ordering::Release);
                }
                outcomes
            }
        };
        finished.push((index, request, outcomes));
    }
    finished
}

fn request_outcome(index: usize, archive: &Path, status: OutcomeStatus) -> ItemOutcome {
    ItemOutcome {
        request_index: index,
        archive: archive.to_path_buf(),
        item: String::new(),
        status,
        bytes: 0,
        digest: None,
    }
}

fn item_outcome(index: usize, archive: &Path, outcome: EntryOutcome) -> ItemOutcome {
    ItemOutcome {
        request_index: index,
        archive: archive.to_path_buf(),
        item: outcome.path,
        status: outcome.status,
        bytes: outcome.bytes,
        digest: outcome.digest,
    }
}

/// Run one request and turn everything it produced into item outcomes
fn run_request(
    index: usize,
    request: &mut OperationRequest,
    plan: &Plan,
    config: &EngineConfig,
    ctx: &OperationContext,
    abort_on_error: bool,
) -> Vec<ItemOutcome> {
    let archive = request.archive.clone();
    log::debug!("Request {}: {} {}", index, request.kind.label(), archive.display());

    let mut outcomes = Vec::new();
    let result = {
        let mut record = |o: EntryOutcome| outcomes.push(item_outcome(index, &archive, o));
        dispatch(request, config, ctx, abort_on_error, &mut record)
    };

    match result {
        Ok(()) => {
            if abort_on_error && outcomes.iter().any(|o| o.status.is_failure()) {
                let seen: HashSet<&str> = outcomes.iter().map(|o| o.item.as_str()).collect();
                let remaining: Vec<(String, u64)> = plan
                    .entries
                    .iter()
                    .filter(|(name, _)| !seen.contains(name.as_str()))
                    .cloned()
                    .collect();
                for (name, size) in remaining {
                    ctx.progress().credit(1, size);
                    outcomes.push(ItemOutcome {
                        item: name,
                        ..request_outcome(
                            index,
                            &archive,
                            OutcomeStatus::Skipped(SkipReason::AbortedAfterError),
                        )
                    });
                }
            }
        }
        Err(e) if e.is_cancelled() => {
            log::info!("Request {} cancelled", index);
            outcomes.push(request_outcome(
                index,
                &archive,
                OutcomeStatus::Skipped(SkipReason::Cancelled),
            ));
        }
        Err(e) => {
            log::warn!("Request {} on {} failed: {}", index, archive.display(), e);
            let delivered = outcomes.len() as u64;
            let moved: u64 = outcomes.iter().map(|o| o.bytes).sum();
            ctx.progress().credit(
                plan.items.saturating_sub(delivered),
                plan.bytes.unwrap_or(0).saturating_sub(moved),
            );
            outcomes.push(request_outcome(index, &archive, OutcomeStatus::Failed(e)));
        }
    }
    outcomes
}

fn dispatch(
    request: &mut OperationRequest,
    config: &EngineConfig,
    ctx: &OperationContext,
    stop_on_error: bool,
    record: &mut dyn FnMut(EntryOutcome),
) -> Result<()> {
    // Taken before validation so the passphrase is wiped on every path
    let credentials = CredentialScope::acquire(&mut request.passphrase);
    request.validate()?;
    ctx.check_entry()?;

    let passphrase = credentials.passphrase();
    let write = WriteSettings {
        compression_level: request.compression_level.unwrap_or(config.compression_level),
        stop_on_error,
    };
    let open = |mode: OpenMode| {
        ArchiveSession::open(
            &request.archive,
            OpenOptions {
                mode,
                passphrase: passphrase.cloned(),
            },
        )
    };

    match request.kind {
        OperationKind::CreateArchive => {
            let outcomes =
                create_archive(&request.archive, &request.sources, passphrase, write, ctx)?;
            outcomes.into_iter().for_each(record);
            Ok(())
        }
        OperationKind::ExtractAll | OperationKind::ExtractEntry => {
            let destination = request.destination.as_deref().ok_or_else(|| {
                ArchiveError::InvalidConfig("extraction needs a destination".to_string())
            })?;
            let matcher = request.selector.matcher()?;
            let settings = ExtractSettings {
                overwrite: request.overwrite.unwrap_or(config.overwrite_policy),
                stop_on_error,
                compute_digest: config.compute_digest,
            };
            let session = open(OpenMode::Read)?;
            let result = session.extract(&matcher, destination, settings, ctx, record);
            session.close();
            result
        }
        OperationKind::TestIntegrity => {
            let session = open(OpenMode::Read)?;
            let result = session.test_entries(stop_on_error, ctx, record);
            session.close();
            result
        }
        OperationKind::AddEntry => {
            let session = open(OpenMode::ReadWrite)?;
            let result = session.add(&request.sources, write, ctx);
            session.close();
            result?.added.into_iter().for_each(record);
            Ok(())
        }
        OperationKind::RemoveEntry => {
            let matcher = request.selector.matcher()?;
            let session = open(OpenMode::ReadWrite)?;
            let result = session.remove(&matcher, write, ctx);
            session.close();
            for path in result?.removed {
                ctx.progress().begin_entry(&path);
                ctx.progress().finish_entry(0, 0);
                record(EntryOutcome::succeeded(path, 0));
            }
            Ok(())
        }
    }
}

/// A batch job running on its own thread
pub struct JobHandle {
    cancel: CancellationToken,
    status: Arc<Mutex<JobStatus>>,
    reporter: Arc<ProgressReporter>,
    thread: JoinHandle<Result<BatchJob>>,
}

impl JobHandle {
    /// Ask the job to stop; items already finished stay finished
    pub fn cancel(&self) {
        log::info!("Batch cancellation requested");
        self.cancel.cancel();
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest aggregate progress
    pub fn progress(&self) -> ProgressEvent {
        self.reporter.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the job reaches a terminal status and hand it back
    pub fn wait(self) -> Result<BatchJob> {
        self.thread.join().unwrap_or_else(|_| {
            Err(ArchiveError::Io(std::io::Error::other(
                "batch worker thread panicked",
            )))
        })
    }
}

/// Start a job on a background thread
///
/// # Arguments
/// * `job` - Must be pending; otherwise `wait` reports `JobAlreadyFinished`
/// * `config` - Engine defaults and worker limit
/// * `sink` - Receives progress and status events from worker threads
///
/// # Returns
/// * Handle to cancel, poll or wait for the job
pub fn submit_batch(mut job: BatchJob, config: EngineConfig, sink: Arc<dyn ProgressSink>) -> JobHandle {
    let cancel = CancellationToken::new();
    let status = Arc::new(Mutex::new(job.status));
    let reporter = Arc::new(ProgressReporter::new(
        ProgressEmitter::new(sink),
        config.progress_granularity,
    ));

    let thread = {
        let cancel = cancel.clone();
        let status = Arc::clone(&status);
        let reporter = Arc::clone(&reporter);
        thread::spawn(move || {
            execute(&mut job, &config, reporter, &cancel, &status)?;
            Ok(job)
        })
    };

    JobHandle {
        cancel,
        status,
        reporter,
        thread,
    }
}
