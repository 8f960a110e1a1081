// src/core/workers.rs

//! The auxiliary worker pool handed to the message handler for its own
//! concurrent, per-key work. The dispatcher never schedules onto it itself;
//! it only owns its lifecycle.

use crate::core::errors::SequencerError;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// An unbounded pool of tasks that can be closed to new work, awaited with a
/// grace period, and terminated.
///
/// Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    tracker: TaskTracker,
    terminate: CancellationToken,
}

impl WorkerPool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tracker: TaskTracker::new(),
            terminate: CancellationToken::new(),
        }
    }

    /// Spawns `task` on the pool. The returned handle yields `None` if the pool
    /// was terminated before the task finished.
    pub fn spawn<F>(&self, task: F) -> Result<JoinHandle<Option<F::Output>>, SequencerError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(SequencerError::WorkerPoolClosed);
        }
        let terminate = self.terminate.clone();
        Ok(self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = terminate.cancelled() => None,
                output = task => Some(output),
            }
        }))
    }

    /// Spawns cleanup work that must run to completion, even on a closed or
    /// terminated pool. [`WorkerPool::wait`] covers it like any other task.
    pub fn spawn_cleanup<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Stops accepting new tasks. Running tasks are unaffected.
    pub fn close(&self) {
        self.tracker.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Number of tasks that have not finished yet.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until the pool is closed and every task has finished, for at most
    /// `grace`. Returns false if the grace period ran out first.
    pub async fn wait(&self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                debug!("Worker pool '{}' terminated within its grace period.", self.name);
                true
            }
            Err(_) => {
                warn!(
                    "Worker pool '{}' still has {} running tasks after {:?}; no longer waiting.",
                    self.name,
                    self.tracker.len(),
                    grace
                );
                false
            }
        }
    }

    /// Closes the pool and cancels every running task at its next await point.
    pub fn terminate(&self) {
        self.tracker.close();
        self.terminate.cancel();
    }
}
