// Module declarations
pub mod commands;
pub mod core;
pub mod models;
pub mod utils;

pub use crate::core::{
    create_archive, submit_batch, ArchiveSession, FormatId, JobHandle, OpenOptions, Passphrase,
};
pub use crate::models::{
    ArchiveError, BatchJob, EngineConfig, EntryDescriptor, EntrySelector, ErrorKind,
    OperationRequest, Result,
};
pub use crate::utils::{CancellationToken, ProgressEvent, ProgressSink};
