pub mod cancel;
pub mod parallel;
pub mod progress;

pub use cancel::CancellationToken;
pub use parallel::WorkerPool;
pub use progress::{
    ChannelSink, FnSink, NullSink, ProgressEmitter, ProgressEvent, ProgressMessage,
    ProgressReporter, ProgressSink, StatusEvent,
};
