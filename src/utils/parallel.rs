use rayon::prelude::*;
use std::io;

use crate::models::{ArchiveError, Result};

/// Worker pool for running independent archive groups side by side
///
/// Uses Rayon; with one thread everything runs inline on the caller's thread
/// and in order.
pub struct WorkerPool {
    thread_count: usize,
}

impl WorkerPool {
    /// Create a pool sized to all available CPU cores
    pub fn new() -> Self {
        Self {
            thread_count: num_cpus::get(),
        }
    }

    /// Create a pool with a custom thread count (at least one)
    pub fn with_threads(thread_count: usize) -> Self {
        Self {
            thread_count: thread_count.max(1),
        }
    }

    /// Run `work` once per group and collect the results in group order
    ///
    /// # Arguments
    /// * `groups` - Independent units of work; no ordering holds between them
    /// * `work` - Called once per group, possibly from several threads at once
    ///
    /// # Returns
    /// * One result per group, in the order the groups were given
    pub fn run<T, R, F>(&self, groups: Vec<T>, work: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        if self.thread_count == 1 || groups.len() <= 1 {
            return Ok(groups.into_iter().map(work).collect());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.thread_count.min(groups.len()))
            .build()
            .map_err(|e| {
                ArchiveError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("Failed to create thread pool: {}", e),
                ))
            })?;

        Ok(pool.install(|| groups.into_par_iter().map(work).collect()))
    }

    /// Get configured thread count
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
