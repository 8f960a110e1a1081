// src/dispatcher/context.rs

use crate::broker::BrokerConnection;
use crate::core::errors::SequencerError;
use crate::core::handler::MessageHandler;
use crate::core::keys::KeyExtractor;
use crate::core::lifecycle::LifecycleState;
use crate::core::metrics;
use crate::core::pool::SessionPool;
use crate::core::workers::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything a dispatcher owns from construction until shutdown.
pub(crate) struct DispatcherInner {
    pub destination: Arc<str>,
    pub grace: Duration,
    pub connection: Arc<dyn BrokerConnection>,
    pub pool: Arc<SessionPool>,
    pub extractor: Arc<dyn KeyExtractor>,
    pub handler: Arc<dyn MessageHandler>,
    /// Serializes start, stop and shutdown.
    pub lifecycle: tokio::sync::Mutex<Lifecycle>,
    pub state_tx: watch::Sender<LifecycleState>,
    /// The error that made the intake loop shut the dispatcher down, if any.
    pub failure: parking_lot::Mutex<Option<SequencerError>>,
}

pub(crate) struct Lifecycle {
    pub state: LifecycleState,
    /// The execution contexts of the most recent start. Kept after `stop` so
    /// stragglers that outlived the grace period can still be terminated.
    pub running: Option<RunningContext>,
}

/// The execution contexts created by one `start`.
pub(crate) struct RunningContext {
    pub stop: CancellationToken,
    /// `None` once the intake task has been observed to finish.
    pub intake: Option<JoinHandle<()>>,
    pub workers: WorkerPool,
}

impl DispatcherInner {
    /// Records a completed lifecycle transition.
    pub fn enter(&self, lifecycle: &mut Lifecycle, next: LifecycleState) {
        lifecycle.state = next;
        self.state_tx.send_replace(next);
        let label: &'static str = next.into();
        metrics::LIFECYCLE_TRANSITIONS_TOTAL
            .with_label_values(&[label])
            .inc();
        info!(destination = %self.destination, "Dispatcher is now {}.", next);
    }
}
