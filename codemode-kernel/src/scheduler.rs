//! Concurrency gate for snippet runs.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::trace;

/// Default number of snippet runs allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENT_RUNS: NonZeroUsize = match NonZeroUsize::new(32) {
    Some(limit) => limit,
    None => unreachable!(),
};

/// Semaphore-backed limit on concurrently executing runs.
///
/// Callers over the limit wait for a permit; once closed, waiting and new
/// callers fail with [`SchedulerError::Closed`].
#[derive(Debug, Clone)]
pub struct RunScheduler {
    semaphore: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    max_concurrent: NonZeroUsize,
}

impl RunScheduler {
    /// Creates a scheduler admitting `max_concurrent` runs at a time.
    #[must_use]
    pub fn new(max_concurrent: NonZeroUsize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.get())),
            closed: Arc::new(AtomicBool::new(false)),
            max_concurrent,
        }
    }

    /// Configured concurrency limit.
    #[must_use]
    pub const fn max_concurrent(&self) -> NonZeroUsize {
        self.max_concurrent
    }

    /// Permits not currently held by a run.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Returns `true` if the scheduler has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops admitting runs. Runs already holding a permit finish normally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }

    /// Waits for a permit, then drives `future` to completion while holding it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] when the scheduler is closed before
    /// a permit is granted.
    pub async fn run<F, T>(&self, future: F) -> SchedulerResult<T>
    where
        F: Future<Output = T>,
    {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Closed)?;
        trace!(available = self.available(), "run permit acquired");
        let output = future.await;
        drop(permit);
        Ok(output)
    }
}

impl Default for RunScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_RUNS)
    }
}

/// Errors produced by the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Scheduler is closed and will not admit new runs.
    #[error("scheduler closed")]
    Closed,
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
