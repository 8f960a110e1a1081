// src/dispatcher/spawner.rs

//! Spawns the execution contexts of a running dispatcher.

use super::context::{DispatcherInner, RunningContext};
use super::intake_loop::{IntakeExit, IntakeLoop};
use super::teardown;
use crate::core::workers::WorkerPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Creates a fresh worker pool and spawns the intake loop onto its own task.
pub(crate) fn spawn_running_context(inner: &Arc<DispatcherInner>) -> RunningContext {
    let stop = CancellationToken::new();
    let workers = WorkerPool::new("handler-workers");

    let intake = IntakeLoop {
        destination: inner.destination.clone(),
        pool: inner.pool.clone(),
        extractor: inner.extractor.clone(),
        handler: inner.handler.clone(),
        workers: workers.clone(),
        stop: stop.clone(),
    };

    // The task must not keep the dispatcher alive on its own.
    let weak = Arc::downgrade(inner);
    let handle = tokio::spawn(async move {
        if let IntakeExit::Failed(cause) = intake.run().await {
            error!("CRITICAL: Intake loop failed: {}. Shutting down the dispatcher.", cause);
            // Shutdown waits for this task, so it has to run on another one.
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(teardown::shutdown_after_failure(inner, cause));
            }
        }
    });

    RunningContext {
        stop,
        intake: Some(handle),
        workers,
    }
}
