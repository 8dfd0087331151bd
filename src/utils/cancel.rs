use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::models::{ArchiveError, Result};

/// Cooperative cancellation flag shared between a caller and running operations
///
/// Cloning shares the flag. Operations poll it between entries and between
/// streaming chunks, so cancellation latency is bounded by one chunk.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ArchiveError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        assert!(token.check().is_ok());

        thread::spawn(move || other.cancel()).join().unwrap();

        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(ArchiveError::Cancelled)));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}
