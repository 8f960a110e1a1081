// src/dispatcher/teardown.rs

//! Stop and shutdown sequences, and the reports they produce.
//!
//! Nothing in here propagates a cleanup failure: every failure is logged where
//! it happens and recorded in the report, and the sequence carries on.

use super::context::{DispatcherInner, RunningContext};
use crate::core::errors::{BrokerError, SequencerError};
use crate::core::lifecycle::{LifecycleAction, LifecycleState};
use crate::core::pool::DrainReport;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happened during a `stop`.
#[derive(Debug, Clone, PartialEq)]
pub struct StopReport {
    /// False if the intake loop was still running when its grace period ran out.
    pub intake_terminated: bool,
    /// False if handler tasks were still running when their grace period ran out.
    pub workers_terminated: bool,
    pub connection_stop_error: Option<BrokerError>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.connection_stop_error.is_none()
    }
}

/// Every cleanup failure encountered by a `shutdown`.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Present if the dispatcher was running when shutdown began.
    pub stop: Option<StopReport>,
    pub drain: DrainReport,
    pub connection_close_error: Option<BrokerError>,
    /// The error that triggered the shutdown, if the intake loop initiated it.
    pub cause: Option<SequencerError>,
}

impl ShutdownReport {
    /// True if no cleanup step failed. Grace-period expiry is not a failure.
    pub fn is_clean(&self) -> bool {
        self.failure_count() == 0
    }

    pub fn failure_count(&self) -> usize {
        let stop = self
            .stop
            .as_ref()
            .map_or(0, |s| usize::from(s.connection_stop_error.is_some()));
        stop + self.drain.failures.len() + usize::from(self.connection_close_error.is_some())
    }
}

/// Signals the intake loop, closes both execution contexts to new work, waits
/// for each up to the grace period, then stops the connection.
pub(crate) async fn stop_running(inner: &DispatcherInner, running: &mut RunningContext) -> StopReport {
    info!(destination = %inner.destination, "Stopping the intake loop.");
    running.stop.cancel();
    running.workers.close();

    let intake_terminated = await_intake(&mut running.intake, inner.grace).await;
    let workers_terminated = running.workers.wait(inner.grace).await;

    let connection_stop_error = match inner.connection.stop().await {
        Ok(()) => None,
        Err(e) => {
            error!("Failed to stop the broker connection: {}", e);
            Some(e)
        }
    };

    StopReport {
        intake_terminated,
        workers_terminated,
        connection_stop_error,
    }
}

async fn await_intake(intake: &mut Option<JoinHandle<()>>, grace: Duration) -> bool {
    let Some(handle) = intake.as_mut() else {
        return true;
    };
    let outcome = tokio::time::timeout(grace, handle).await;
    match outcome {
        Ok(joined) => {
            if let Err(e) = joined
                && e.is_panic()
            {
                error!("Intake task panicked: {e:?}");
            }
            *intake = None;
            true
        }
        Err(_) => {
            warn!(
                "Intake loop did not terminate within {:?}; no longer waiting.",
                grace
            );
            false
        }
    }
}

/// Cancels everything still running in `running`, waits for the intake task
/// to be gone and, up to `grace`, for the cleanup of cancelled handler tasks.
pub(crate) async fn terminate(running: RunningContext, grace: Duration) {
    let active = running.workers.active();
    if active > 0 {
        warn!("Terminating {} handler tasks that are still running.", active);
    }
    running.workers.terminate();
    running.stop.cancel();

    if let Some(handle) = running.intake {
        handle.abort();
        if let Err(e) = handle.await
            && e.is_panic()
        {
            error!("Intake task panicked: {e:?}");
        }
    }

    running.workers.wait(grace).await;
}

/// The full shutdown sequence. Fails only if the dispatcher is already shut down.
pub(crate) async fn shutdown(
    inner: &DispatcherInner,
    cause: Option<SequencerError>,
) -> Result<ShutdownReport, SequencerError> {
    let mut lifecycle = inner.lifecycle.lock().await;
    let next = lifecycle.state.transition(LifecycleAction::Shutdown)?;
    info!(destination = %inner.destination, "Shutting down the dispatcher.");

    let mut report = ShutdownReport {
        cause,
        ..Default::default()
    };

    if lifecycle.state == LifecycleState::Running
        && let Some(running) = lifecycle.running.as_mut()
    {
        report.stop = Some(stop_running(inner, running).await);
    }

    inner.handler.shutdown().await;

    if let Some(running) = lifecycle.running.take() {
        terminate(running, inner.grace).await;
    }

    report.drain = inner.pool.drain().await;

    match inner.connection.close().await {
        Ok(()) => debug!("Broker connection closed."),
        Err(e) => {
            error!("Failed to close the broker connection: {}", e);
            report.connection_close_error = Some(e);
        }
    }

    inner.enter(&mut lifecycle, next);
    if report.is_clean() {
        info!("Dispatcher shut down cleanly.");
    } else {
        warn!(
            "Dispatcher shut down with {} cleanup failures.",
            report.failure_count()
        );
    }
    Ok(report)
}

/// Runs the shutdown sequence on behalf of a failed intake loop.
pub(crate) async fn shutdown_after_failure(inner: Arc<DispatcherInner>, cause: SequencerError) {
    *inner.failure.lock() = Some(cause.clone());
    match shutdown(&inner, Some(cause)).await {
        Ok(report) => debug!(
            "Failure-triggered shutdown finished with {} cleanup failures.",
            report.failure_count()
        ),
        // Someone else shut it down first.
        Err(e) => debug!("Failure-triggered shutdown skipped: {}", e),
    }
}
