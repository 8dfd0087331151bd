pub mod config;
pub mod entry;
pub mod error;
pub mod task;

// Re-export commonly used types
pub use config::{EngineConfig, FailurePolicy, OverwritePolicy};
pub use entry::{
    EntryDescriptor, EntryOutcome, IntegrityResult, IntegrityStatus, OutcomeStatus, SkipReason,
};
pub use error::{ArchiveError, ErrorKind, Result};
pub use task::{
    BatchJob, BatchSummary, EntrySelector, ItemOutcome, JobStatus, OperationKind,
    OperationRequest, SelectorMatcher,
};
