pub mod scanner;
pub mod temp_manager;

pub use scanner::{FileScanner, SourceItem};
pub use temp_manager::StagedArchive;
