pub mod batch;
pub mod compression;
pub mod credentials;
pub mod file_ops;
pub mod registry;
pub mod session;

// Re-export commonly used types
pub use batch::{run_batch, submit_batch, JobHandle};
pub use credentials::{CredentialScope, Passphrase};
pub use registry::{Capabilities, Confidence, Detection, FormatId, TarCompression};
pub use session::{
    create_archive, ArchiveSession, ExtractSettings, OpenOptions, SessionState, WriteSettings,
};
