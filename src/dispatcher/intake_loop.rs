// src/dispatcher/intake_loop.rs

//! The intake loop: the only place messages are received.
//!
//! Each iteration leases a session, opens a consumer on the destination,
//! receives one message and hands it to the message handler, waiting for the
//! hand-off to return before the next receive. Hand-off order is therefore the
//! broker's delivery order.

use crate::broker::MessageConsumer;
use crate::core::errors::SequencerError;
use crate::core::handler::MessageHandler;
use crate::core::keys::{KeyExtractor, KeyedMessage};
use crate::core::metrics;
use crate::core::pool::{SessionLease, SessionPool};
use crate::core::workers::WorkerPool;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the loop ended.
#[derive(Debug)]
pub(crate) enum IntakeExit {
    /// The stop signal was observed.
    Stopped,
    /// An unrecoverable failure; the dispatcher must be shut down.
    Failed(SequencerError),
}

enum Cycle {
    Continue,
    Stop,
}

pub(crate) struct IntakeLoop {
    pub destination: Arc<str>,
    pub pool: Arc<SessionPool>,
    pub extractor: Arc<dyn KeyExtractor>,
    pub handler: Arc<dyn MessageHandler>,
    pub workers: WorkerPool,
    pub stop: CancellationToken,
}

impl IntakeLoop {
    pub async fn run(self) -> IntakeExit {
        info!(destination = %self.destination, "Intake loop started.");
        let exit = loop {
            if self.stop.is_cancelled() {
                break IntakeExit::Stopped;
            }

            let acquired = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break IntakeExit::Stopped,
                acquired = self.pool.acquire() => acquired,
            };
            let lease = match acquired {
                Ok(lease) => lease,
                Err(e) => break self.fail_unless_stopping(e),
            };

            match self.cycle(lease).await {
                Ok(Cycle::Continue) => {}
                Ok(Cycle::Stop) => break IntakeExit::Stopped,
                Err(e) => break self.fail_unless_stopping(e),
            }
        };

        match &exit {
            IntakeExit::Stopped => info!(destination = %self.destination, "Intake loop stopped."),
            IntakeExit::Failed(e) => error!(
                destination = %self.destination,
                "Intake loop terminated by an unrecoverable error: {}", e
            ),
        }
        exit
    }

    /// Errors caused by the teardown itself (closed worker pool, drained
    /// session pool, stopped connection) are not failures.
    fn fail_unless_stopping(&self, error: SequencerError) -> IntakeExit {
        if self.stop.is_cancelled() {
            debug!("Intake loop saw '{}' while stopping; treating it as a stop.", error);
            return IntakeExit::Stopped;
        }
        match error {
            SequencerError::WorkerPoolClosed | SequencerError::PoolDrained => IntakeExit::Stopped,
            other => IntakeExit::Failed(other),
        }
    }

    /// One receive cycle. Recoverable failures are handled here; an `Err`
    /// return is fatal for the loop.
    async fn cycle(&self, lease: SessionLease) -> Result<Cycle, SequencerError> {
        let mut consumer = match lease.session().create_consumer(&self.destination).await {
            Ok(consumer) => consumer,
            Err(e) => {
                self.abandon(lease, e.into()).await;
                return Ok(Cycle::Continue);
            }
        };

        let received = tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            received = consumer.receive() => Some(received),
        };

        let Some(received) = received else {
            debug!(session_id = lease.id(), "Stop signalled while waiting for a message.");
            close_consumer(&mut *consumer).await;
            if let Err(e) = lease.rollback_and_release().await {
                debug!("Could not return the session after the stop signal: {}", e);
            }
            return Ok(Cycle::Stop);
        };

        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(session_id = lease.id(), "Consumer closed by the broker.");
                close_consumer(&mut *consumer).await;
                if let Err(e) = lease.rollback_and_release().await {
                    warn!("Could not return the session after its consumer closed: {}", e);
                }
                return Ok(Cycle::Continue);
            }
            Err(e) => {
                close_consumer(&mut *consumer).await;
                self.abandon(lease, e.into()).await;
                return Ok(Cycle::Continue);
            }
        };

        let key = match self.extractor.extract_key(&message) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    redelivered = message.redelivered,
                    "Could not extract a key from the message; it will be redelivered."
                );
                close_consumer(&mut *consumer).await;
                self.abandon(lease, e).await;
                return Ok(Cycle::Continue);
            }
        };

        debug!(
            session_id = lease.id(),
            message_id = %message.message_id,
            key = %key,
            "Handing message to the handler."
        );
        let started = Instant::now();
        let handoff = AssertUnwindSafe(self.handler.on_message(
            KeyedMessage::new(message, key),
            lease,
            &self.workers,
        ))
        .catch_unwind()
        .await;
        metrics::HANDOFF_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
        metrics::MESSAGES_DISPATCHED_TOTAL.inc();

        // The session now belongs to the handler; only the consumer is ours.
        close_consumer(&mut *consumer).await;

        match handoff {
            Ok(Ok(())) => Ok(Cycle::Continue),
            Ok(Err(e)) if e.is_recoverable() => {
                warn!("Message handler reported a recoverable error: {}", e);
                metrics::RECEIVE_FAILURES_TOTAL.inc();
                Ok(Cycle::Continue)
            }
            Ok(Err(e)) => Err(e),
            Err(panic) => Err(SequencerError::HandlerPanicked(panic_message(panic.as_ref()))),
        }
    }

    /// Recovers from a failed receive cycle: the session is rolled back,
    /// closed and never leased again.
    async fn abandon(&self, lease: SessionLease, cause: SequencerError) {
        let session_id = lease.id();
        error!(session_id, "Receive cycle failed, abandoning the session: {}", cause);
        metrics::RECEIVE_FAILURES_TOTAL.inc();
        if let Err(e) = lease.discard().await {
            warn!(session_id, "Abandoned session did not close cleanly: {}", e);
        }
    }
}

async fn close_consumer(consumer: &mut dyn MessageConsumer) {
    if let Err(e) = consumer.close().await {
        debug!("Failed to close consumer: {}", e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
