// src/dispatcher/mod.rs

//! The lifecycle controller: owns the broker connection, the session pool and
//! the execution contexts, and moves them through start, stop and shutdown.

use crate::broker::{BrokerConnection, ConnectionFactory};
use crate::config::DispatcherSettings;
use crate::core::errors::SequencerError;
use crate::core::handler::MessageHandler;
use crate::core::keys::KeyExtractor;
use crate::core::lifecycle::{LifecycleAction, LifecycleState};
use crate::core::pool::{PoolStats, SessionPool};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

mod context;
mod intake_loop;
mod spawner;
mod teardown;

use context::{DispatcherInner, Lifecycle};
pub use teardown::{ShutdownReport, StopReport};

/// A single-intake, session-pooled message dispatcher bound to one destination.
///
/// Cloning yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct SequencedDispatcher {
    inner: Arc<DispatcherInner>,
}

impl SequencedDispatcher {
    /// Creates the broker connection through `factory`. The connection is not
    /// started until [`start`](Self::start).
    pub async fn connect(
        settings: DispatcherSettings,
        factory: &dyn ConnectionFactory,
        extractor: Arc<dyn KeyExtractor>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, SequencerError> {
        let connection = factory.create_connection().await?;
        Ok(Self::with_connection(settings, connection, extractor, handler))
    }

    /// Builds a dispatcher around an existing, not yet started connection,
    /// which it takes exclusive ownership of.
    pub fn with_connection(
        settings: DispatcherSettings,
        connection: Arc<dyn BrokerConnection>,
        extractor: Arc<dyn KeyExtractor>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let pool = Arc::new(SessionPool::new(
            connection.clone(),
            settings.pool_warn_threshold,
        ));
        let (state_tx, _) = watch::channel(LifecycleState::Created);
        Self {
            inner: Arc::new(DispatcherInner {
                destination: Arc::from(settings.destination.as_str()),
                grace: settings.stop_grace_period,
                connection,
                pool,
                extractor,
                handler,
                lifecycle: tokio::sync::Mutex::new(Lifecycle {
                    state: LifecycleState::Created,
                    running: None,
                }),
                state_tx,
                failure: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Starts the connection and the intake loop. Allowed from `Created` and
    /// `Stopped`.
    pub async fn start(&self) -> Result<(), SequencerError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let next = lifecycle.state.transition(LifecycleAction::Start)?;

        self.inner.connection.start().await?;

        // Stragglers from the previous run that outlived the stop grace period.
        if let Some(previous) = lifecycle.running.take() {
            teardown::terminate(previous, self.inner.grace).await;
        }

        lifecycle.running = Some(spawner::spawn_running_context(&self.inner));
        info!(destination = %self.inner.destination, "Dispatcher started.");
        self.inner.enter(&mut lifecycle, next);
        Ok(())
    }

    /// Stops receiving. Waits up to the grace period for the intake loop and
    /// again for the handler's tasks, then stops (but keeps) the connection.
    pub async fn stop(&self) -> Result<StopReport, SequencerError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let next = lifecycle.state.transition(LifecycleAction::Stop)?;

        let report = match lifecycle.running.as_mut() {
            Some(running) => teardown::stop_running(&self.inner, running).await,
            None => {
                warn!("Dispatcher was running without execution contexts.");
                StopReport {
                    intake_terminated: true,
                    workers_terminated: true,
                    connection_stop_error: None,
                }
            }
        };
        self.inner.enter(&mut lifecycle, next);
        Ok(report)
    }

    /// Stops if running, shuts the handler down, terminates everything still
    /// running, drains the session pool and closes the connection.
    ///
    /// Cleanup failures are collected in the returned report. The only error
    /// is an [`SequencerError::InvalidTransition`] when already shut down.
    pub async fn shutdown(&self) -> Result<ShutdownReport, SequencerError> {
        teardown::shutdown(&self.inner, None).await
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state_tx.borrow()
    }

    /// Resolves once the dispatcher reaches `state`.
    pub async fn wait_for_state(&self, state: LifecycleState) {
        let mut rx = self.inner.state_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// The error that made the intake loop shut the dispatcher down, if any.
    pub fn failure(&self) -> Option<SequencerError> {
        self.inner.failure.lock().clone()
    }

    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.inner.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}
