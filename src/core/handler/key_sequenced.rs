// src/core/handler/key_sequenced.rs

//! A message handler that processes messages with the same key strictly in
//! order and messages with different keys concurrently.
//!
//! Each key with work outstanding owns a lane: a FIFO of (message, lease)
//! pairs plus exactly one lane worker running on the dispatcher's worker pool.
//! `on_message` only appends to a lane, so the intake loop is released as soon
//! as the message is queued. A lane is created together with its worker and
//! removed by that worker, atomically, once it finds the lane empty; a message
//! arriving for a key is therefore either appended to a lane whose worker will
//! still see it, or starts a new lane. A worker cancelled by the pool's
//! termination removes its lane too, and hands every lease it held back to the
//! broker.

use super::MessageHandler;
use crate::core::errors::SequencerError;
use crate::core::keys::{KeyedMessage, MessageKey};
use crate::core::pool::SessionLease;
use crate::core::workers::WorkerPool;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Business logic plugged into a [`KeySequencedHandler`].
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    /// Processes one message. `Ok` commits the message's session; `Err` rolls
    /// it back so the broker redelivers the message.
    async fn process(&self, message: &KeyedMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<P: MessageProcessor + ?Sized> MessageProcessor for Arc<P> {
    async fn process(&self, message: &KeyedMessage) -> anyhow::Result<()> {
        (**self).process(message).await
    }
}

struct Pending {
    message: KeyedMessage,
    lease: SessionLease,
}

struct Lanes<P> {
    processor: P,
    lanes: DashMap<MessageKey, VecDeque<Pending>>,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// See the module documentation.
pub struct KeySequencedHandler<P> {
    inner: Arc<Lanes<P>>,
}

impl<P: MessageProcessor> KeySequencedHandler<P> {
    pub fn new(processor: P) -> Self {
        Self {
            inner: Arc::new(Lanes {
                processor,
                lanes: DashMap::new(),
                committed: AtomicU64::new(0),
                rolled_back: AtomicU64::new(0),
            }),
        }
    }

    /// Number of keys that currently have queued or in-progress work.
    pub fn active_keys(&self) -> usize {
        self.inner.lanes.len()
    }

    /// Messages processed and committed so far.
    pub fn committed(&self) -> u64 {
        self.inner.committed.load(Ordering::Relaxed)
    }

    /// Messages whose processing failed and whose session was rolled back.
    pub fn rolled_back(&self) -> u64 {
        self.inner.rolled_back.load(Ordering::Relaxed)
    }
}

impl<P: MessageProcessor> Lanes<P> {
    async fn run_lane(self: Arc<Self>, key: MessageKey, workers: WorkerPool) {
        debug!(key = %key, "Lane worker started.");
        let mut guard = LaneGuard::new(self.clone(), key.clone(), workers);
        loop {
            let next = match self.lanes.get_mut(&key) {
                Some(mut lane) => lane.pop_front(),
                // Lanes were cleared by a shutdown.
                None => {
                    guard.set_finished();
                    return;
                }
            };
            match next {
                Some(Pending { message, lease }) => {
                    guard.in_flight = Some(lease);
                    let outcome = AssertUnwindSafe(self.processor.process(&message))
                        .catch_unwind()
                        .await;
                    if let Some(lease) = guard.in_flight.take() {
                        self.settle(&message, lease, outcome).await;
                    }
                }
                None => {
                    if self.lanes.remove_if(&key, |_, lane| lane.is_empty()).is_some() {
                        debug!(key = %key, "Lane worker finished.");
                        guard.set_finished();
                        return;
                    }
                }
            }
        }
    }

    async fn settle(
        &self,
        message: &KeyedMessage,
        lease: SessionLease,
        outcome: std::thread::Result<anyhow::Result<()>>,
    ) {
        match outcome {
            Ok(Ok(())) => match lease.commit_and_release().await {
                Ok(()) => {
                    self.committed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(
                    key = %message.key,
                    message_id = %message.message.message_id,
                    "Commit failed, the message will be redelivered: {}", e
                ),
            },
            Ok(Err(e)) => {
                warn!(
                    key = %message.key,
                    message_id = %message.message.message_id,
                    "Processing failed, rolling back: {:#}", e
                );
                self.roll_back(lease).await;
            }
            Err(_) => {
                error!(
                    key = %message.key,
                    message_id = %message.message.message_id,
                    "Processor panicked, rolling back."
                );
                self.roll_back(lease).await;
            }
        }
    }

    async fn roll_back(&self, lease: SessionLease) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = lease.rollback_and_release().await {
            warn!("Rollback failed: {}", e);
        }
    }
}

/// Owns a lane on behalf of its worker. If the worker is cancelled before it
/// retires the lane, dropping the guard removes the lane, so the next message
/// for the key starts a fresh one, and rolls back every lease the lane still
/// held on the worker pool, so the broker redelivers those messages.
struct LaneGuard<P: MessageProcessor> {
    lanes: Arc<Lanes<P>>,
    key: MessageKey,
    workers: WorkerPool,
    /// The lease of the message being processed, if any.
    in_flight: Option<SessionLease>,
    finished: bool,
}

impl<P: MessageProcessor> LaneGuard<P> {
    fn new(lanes: Arc<Lanes<P>>, key: MessageKey, workers: WorkerPool) -> Self {
        Self {
            lanes,
            key,
            workers,
            in_flight: None,
            finished: false,
        }
    }

    /// The worker retired the lane itself; nothing to clean up.
    fn set_finished(&mut self) {
        self.finished = true;
    }
}

impl<P: MessageProcessor> Drop for LaneGuard<P> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let mut leases: Vec<SessionLease> = self.in_flight.take().into_iter().collect();
        if let Some((_, lane)) = self.lanes.lanes.remove(&self.key) {
            leases.extend(lane.into_iter().map(|pending| pending.lease));
        }
        warn!(
            key = %self.key,
            "Lane worker terminated with {} unsettled messages; returning them to the broker.",
            leases.len()
        );
        if leases.is_empty() {
            return;
        }

        let key = self.key.clone();
        // Latest first: a rollback puts its messages back at the head of the queue.
        self.workers.spawn_cleanup(async move {
            for lease in leases.into_iter().rev() {
                if let Err(e) = lease.rollback_and_release().await {
                    warn!(key = %key, "Failed to return message of a terminated lane: {}", e);
                }
            }
        });
    }
}

#[async_trait]
impl<P: MessageProcessor> MessageHandler for KeySequencedHandler<P> {
    async fn on_message(
        &self,
        message: KeyedMessage,
        lease: SessionLease,
        workers: &WorkerPool,
    ) -> Result<(), SequencerError> {
        let key = message.key.clone();
        let starts_lane = match self.inner.lanes.entry(key.clone()) {
            Entry::Occupied(mut lane) => {
                lane.get_mut().push_back(Pending { message, lease });
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::from([Pending { message, lease }]));
                true
            }
        };
        if !starts_lane {
            return Ok(());
        }

        let inner = self.inner.clone();
        let lane_key = key.clone();
        if let Err(e) = workers.spawn(inner.run_lane(lane_key, workers.clone())) {
            // Nobody will run this lane; hand its messages back to the broker.
            if let Some((_, lane)) = self.inner.lanes.remove(&key) {
                for pending in lane {
                    self.inner.roll_back(pending.lease).await;
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let keys: Vec<MessageKey> = self
            .inner
            .lanes
            .iter()
            .map(|lane| lane.key().clone())
            .collect();

        let mut returned = 0usize;
        for key in keys {
            let Some((_, lane)) = self.inner.lanes.remove(&key) else {
                continue;
            };
            for pending in lane {
                if let Err(e) = pending.lease.rollback_and_release().await {
                    warn!(key = %key, "Failed to return queued message on shutdown: {}", e);
                }
                returned += 1;
            }
        }
        info!(
            "Key-sequenced handler shut down; {} queued messages returned to the broker.",
            returned
        );
    }
}
