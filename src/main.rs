//! Command line front end for the archive engine.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use archive_master::commands::archive as cmd;
use archive_master::core::{OpenOptions, Passphrase};
use archive_master::models::{
    BatchJob, EngineConfig, EntrySelector, FailurePolicy, JobStatus, OperationRequest,
    OutcomeStatus, OverwritePolicy,
};
use archive_master::utils::{ProgressEvent, ProgressSink, StatusEvent};

/// Inspect, extract, verify and build ZIP, 7z, RAR and TAR archives
#[derive(Parser)]
#[command(name = "archive-master")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON engine configuration
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Passphrase for encrypted archives
    #[arg(long, short = 'p', global = true)]
    password: Option<String>,

    /// Archives processed in parallel by `batch` (0 = all cores)
    #[arg(long, short = 'w', global = true)]
    workers: Option<usize>,

    /// Stop at the first failed item
    #[arg(long, global = true)]
    abort_on_error: bool,

    /// Suppress the progress bar
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List entries without decoding them (alias: l)
    #[command(alias = "l")]
    List {
        archive: PathBuf,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show format, capabilities and totals
    Info { archive: PathBuf },

    /// Decode every entry and verify its checksum (alias: t)
    #[command(alias = "t")]
    Test { archive: PathBuf },

    /// Extract entries (alias: x)
    #[command(alias = "x")]
    Extract {
        archive: PathBuf,

        /// Output directory; defaults to one named after the archive
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Single entry (or directory entry) to extract
        #[arg(long, conflicts_with = "glob")]
        entry: Option<String>,

        /// Glob over entry paths
        #[arg(long)]
        glob: Option<String>,

        /// What to do when a target file exists
        #[arg(long, value_enum)]
        overwrite: Option<OverwriteArg>,
    },

    /// Create a new archive; the format follows the file name (alias: a)
    #[command(alias = "a")]
    Create {
        archive: PathBuf,

        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Compression level 0-9
        #[arg(short = 'l', long)]
        level: Option<u32>,
    },

    /// Add files to an existing archive, replacing same-named entries
    Add {
        archive: PathBuf,

        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Compression level 0-9
        #[arg(short = 'l', long)]
        level: Option<u32>,
    },

    /// Remove an entry (with its children) or every entry matching a glob
    Remove {
        archive: PathBuf,

        /// Entry path, or a glob pattern with --glob
        entry: String,

        #[arg(long)]
        glob: bool,
    },

    /// Run a JSON batch job file
    Batch { job: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum OverwriteArg {
    Skip,
    Overwrite,
    Rename,
}

impl From<OverwriteArg> for OverwritePolicy {
    fn from(arg: OverwriteArg) -> Self {
        match arg {
            OverwriteArg::Skip => OverwritePolicy::Skip,
            OverwriteArg::Overwrite => OverwritePolicy::Overwrite,
            OverwriteArg::Rename => OverwritePolicy::Rename,
        }
    }
}

/// Drives an indicatif bar from engine progress events
struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    fn new(quiet: bool) -> Self {
        if quiet {
            return Self {
                bar: ProgressBar::hidden(),
            };
        }
        let bar = ProgressBar::new(1000);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        Self { bar }
    }
}

impl ProgressSink for BarSink {
    fn on_progress(&self, event: &ProgressEvent) {
        self.bar.set_position((event.progress * 10.0) as u64);
        self.bar.set_message(format!(
            "{}/{} {}",
            event.items_done, event.total_items, event.current_item
        ));
    }

    fn on_status(&self, event: &StatusEvent) {
        match event.status.as_str() {
            "complete" | "error" | "cancelled" => self.bar.finish_with_message(event.message.clone()),
            _ => self.bar.set_message(event.message.clone()),
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.worker_limit = workers;
    }
    if cli.abort_on_error {
        config.failure_policy = FailurePolicy::AbortOnError;
    }
    config.validate()?;
    Ok(config)
}

fn with_password(request: OperationRequest, password: &Option<String>) -> OperationRequest {
    match password {
        Some(p) => request.with_passphrase(Passphrase::new(p.as_str())),
        None => request,
    }
}

/// Run a job with a progress bar and print its failures
fn run_job(job: BatchJob, config: EngineConfig, quiet: bool) -> anyhow::Result<()> {
    let sink = Arc::new(BarSink::new(quiet));
    let handle = cmd::submit_batch(job, config, sink.clone());
    let job = handle.wait()?;
    sink.bar.finish_and_clear();

    let summary = job.summary();
    for outcome in &summary.failed {
        if let OutcomeStatus::Failed(e) = &outcome.status {
            eprintln!("FAILED  {}: {}", outcome.label(), e);
        }
    }
    if !quiet {
        for outcome in &summary.skipped {
            if let OutcomeStatus::Skipped(reason) = &outcome.status {
                eprintln!("skipped {} ({:?})", outcome.label(), reason);
            }
        }
    }
    println!(
        "{}: {} succeeded, {} failed, {} skipped",
        match job.status() {
            JobStatus::Completed => "Done",
            JobStatus::Cancelled => "Cancelled",
            _ => "Stopped",
        },
        summary.succeeded,
        summary.failed.len(),
        summary.skipped.len()
    );
    summary.into_result()?;
    Ok(())
}

fn list(archive: &Path, password: &Option<String>, json: bool) -> anyhow::Result<()> {
    let options = OpenOptions {
        passphrase: password.as_deref().map(Passphrase::new),
        ..OpenOptions::default()
    };
    let session = cmd::open_archive_with(archive, options)?;
    let entries = cmd::list_entries(&session)?;

    if json {
        println!("{}", serde_json::to_string_pretty(entries.as_slice())?);
        return Ok(());
    }
    println!("{:>12} {:>12}  {}", "Size", "Packed", "Name");
    for entry in entries.iter() {
        let packed = entry
            .compressed_size
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let flag = if entry.is_encrypted { "*" } else { "" };
        let name = if entry.is_directory {
            format!("{}/", entry.path)
        } else {
            entry.path.clone()
        };
        println!("{:>12} {:>12}  {}{}", entry.size, packed, name, flag);
    }
    println!("{} entries", entries.len());
    session.close();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let password = cli.password.clone();

    let request = match cli.command {
        Commands::List { ref archive, json } => return list(archive, &password, json),
        Commands::Info { ref archive } => {
            let info = cmd::archive_info(archive, password.as_deref().map(Passphrase::new))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            return Ok(());
        }
        Commands::Batch { ref job } => {
            let job = BatchJob::from_json_file(job)?;
            return run_job(job, config, cli.quiet);
        }
        Commands::Test { ref archive } => OperationRequest::test(archive),
        Commands::Extract {
            ref archive,
            ref output,
            ref entry,
            ref glob,
            overwrite,
        } => {
            let destination = output
                .clone()
                .unwrap_or_else(|| cmd::default_extract_dir(archive, &config));
            let selector = match (entry, glob) {
                (Some(path), _) => EntrySelector::path(path.as_str()),
                (None, Some(pattern)) => EntrySelector::glob(pattern.as_str()),
                (None, None) => EntrySelector::All,
            };
            let mut request = if selector == EntrySelector::All {
                OperationRequest::extract_all(archive, destination)
            } else {
                OperationRequest::extract_entry(archive, selector, destination)
            };
            if let Some(policy) = overwrite {
                request = request.with_overwrite(policy.into());
            }
            request
        }
        Commands::Create {
            ref archive,
            ref files,
            level,
        } => {
            if archive.exists() {
                bail!("{} already exists; use `add` to update it", archive.display());
            }
            let request = OperationRequest::create(archive, files.clone());
            match level {
                Some(level) => request.with_compression_level(level),
                None => request,
            }
        }
        Commands::Add {
            ref archive,
            ref files,
            level,
        } => {
            let request = OperationRequest::add(archive, files.clone());
            match level {
                Some(level) => request.with_compression_level(level),
                None => request,
            }
        }
        Commands::Remove {
            ref archive,
            ref entry,
            glob,
        } => {
            let selector = if glob {
                EntrySelector::glob(entry.as_str())
            } else {
                EntrySelector::path(entry.as_str())
            };
            OperationRequest::remove(archive, selector)
        }
    };

    let job = BatchJob::new(vec![with_password(request, &password)]);
    run_job(job, config, cli.quiet)
}
