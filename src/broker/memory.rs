// src/broker/memory.rs

//! An in-process, transacted broker.
//!
//! `MemoryBroker` keeps one FIFO queue per destination. Sessions are
//! transacted: a received message stays owned by the receiving session until
//! it commits, and goes back to the head of its queue (flagged as redelivered)
//! on rollback or close. Receives only make progress while the connection is
//! started, mirroring the usual broker client contract.
//!
//! Failures can be injected for receive, commit, session creation and session
//! close; every session also exposes a [`SessionProbe`] so callers can inspect
//! how it was used.

use super::{BrokerConnection, BrokerSession, ConnectionFactory, Message, MessageConsumer};
use crate::core::errors::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::debug;

/// Failures queued up to be returned by the next matching broker call.
#[derive(Debug, Default)]
struct FaultPlan {
    receive: VecDeque<BrokerError>,
    commit: VecDeque<BrokerError>,
    session_creation: VecDeque<BrokerError>,
    failing_closes: usize,
}

#[derive(Debug, Default)]
struct BrokerInner {
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
    faults: Mutex<FaultPlan>,
    sessions: Mutex<Vec<Arc<SessionProbe>>>,
    connections_created: AtomicUsize,
    next_session_id: AtomicU64,
    /// Woken whenever a receive may be able to make progress.
    activity: Notify,
}

/// A cheaply cloneable handle to an in-memory broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a message to `destination`, creating the queue if needed.
    /// Messages without an id are given a random one.
    pub fn send(&self, destination: &str, mut message: Message) {
        if message.message_id.is_empty() {
            message.message_id = uuid::Uuid::new_v4().to_string();
        }
        self.inner
            .queues
            .lock()
            .entry(destination.to_string())
            .or_default()
            .push_back(message);
        self.inner.activity.notify_waiters();
    }

    /// Convenience wrapper around [`MemoryBroker::send`] for a body plus properties.
    pub fn send_body<'a>(
        &self,
        destination: &str,
        body: impl Into<Bytes>,
        properties: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        let mut message = Message::new(String::new(), body);
        for (name, value) in properties {
            message = message.with_property(name, value);
        }
        self.send(destination, message);
    }

    /// The number of messages waiting on `destination` (not counting messages
    /// held by uncommitted sessions).
    pub fn queue_depth(&self, destination: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(destination)
            .map_or(0, VecDeque::len)
    }

    pub fn connections_created(&self) -> usize {
        self.inner.connections_created.load(Ordering::SeqCst)
    }

    /// Probes for every session created so far, in creation order.
    pub fn session_probes(&self) -> Vec<Arc<SessionProbe>> {
        self.inner.sessions.lock().clone()
    }

    pub fn sessions_created(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// The next receive call on any consumer fails with `error`.
    pub fn inject_receive_failure(&self, error: BrokerError) {
        self.inner.faults.lock().receive.push_back(error);
        self.inner.activity.notify_waiters();
    }

    /// The next commit on any session fails with `error`.
    pub fn inject_commit_failure(&self, error: BrokerError) {
        self.inner.faults.lock().commit.push_back(error);
    }

    /// The next session creation fails with `error`.
    pub fn inject_session_creation_failure(&self, error: BrokerError) {
        self.inner.faults.lock().session_creation.push_back(error);
    }

    /// The next `count` session closes report a failure. The sessions are
    /// closed regardless.
    pub fn inject_close_failures(&self, count: usize) {
        self.inner.faults.lock().failing_closes += count;
    }

    fn pop(&self, destination: &str) -> Option<Message> {
        self.inner
            .queues
            .lock()
            .get_mut(destination)
            .and_then(VecDeque::pop_front)
    }

    /// Puts rolled-back messages back at the head of their queues, preserving
    /// their original relative order.
    fn requeue(&self, receipts: Vec<(String, Message)>) {
        if receipts.is_empty() {
            return;
        }
        let mut queues = self.inner.queues.lock();
        for (destination, mut message) in receipts.into_iter().rev() {
            message.redelivered = true;
            queues.entry(destination).or_default().push_front(message);
        }
        drop(queues);
        self.inner.activity.notify_waiters();
    }
}

#[async_trait]
impl ConnectionFactory for MemoryBroker {
    async fn create_connection(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let id = self.inner.connections_created.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Memory broker opened connection #{}", id);
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            state: Arc::new(ConnectionState::default()),
        }))
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    started: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionState {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(())
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    state: Arc<ConnectionState>,
}

impl MemoryConnection {
    pub fn is_started(&self) -> bool {
        self.state.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn start(&self) -> Result<(), BrokerError> {
        self.state.check_open()?;
        self.state.started.store(true, Ordering::SeqCst);
        self.broker.inner.activity.notify_waiters();
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.state.check_open()?;
        self.state.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.started.store(false, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
        self.broker.inner.activity.notify_waiters();
        Ok(())
    }

    async fn create_session(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        self.state.check_open()?;
        if !self.is_started() {
            return Err(BrokerError::ConnectionNotStarted);
        }
        if let Some(error) = self.broker.inner.faults.lock().session_creation.pop_front() {
            return Err(error);
        }

        let id = self.broker.inner.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let probe = Arc::new(SessionProbe::new(id));
        self.broker.inner.sessions.lock().push(probe.clone());

        Ok(Arc::new(MemorySession {
            shared: Arc::new(SessionShared {
                broker: self.broker.clone(),
                connection: self.state.clone(),
                receipts: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                probe,
            }),
        }))
    }
}

/// Counters describing how a single session was used.
#[derive(Debug)]
pub struct SessionProbe {
    id: u64,
    close_calls: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    received: AtomicUsize,
}

impl SessionProbe {
    fn new(id: u64) -> Self {
        Self {
            id,
            close_calls: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

struct SessionShared {
    broker: MemoryBroker,
    connection: Arc<ConnectionState>,
    /// Messages received in the current transaction, with their destination.
    receipts: Mutex<Vec<(String, Message)>>,
    closed: AtomicBool,
    probe: Arc<SessionProbe>,
}

impl SessionShared {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::SessionClosed);
        }
        self.connection.check_open()
    }

    fn roll_back_receipts(&self) {
        let receipts = std::mem::take(&mut *self.receipts.lock());
        self.broker.requeue(receipts);
    }
}

/// A transacted session on a [`MemoryConnection`].
pub struct MemorySession {
    shared: Arc<SessionShared>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn create_consumer(
        &self,
        destination: &str,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        self.shared.check_open()?;
        Ok(Box::new(MemoryConsumer {
            session: self.shared.clone(),
            destination: destination.to_string(),
            closed: false,
        }))
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        self.shared.check_open()?;
        if let Some(error) = self.shared.broker.inner.faults.lock().commit.pop_front() {
            return Err(error);
        }
        self.shared.receipts.lock().clear();
        self.shared.probe.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BrokerError> {
        self.shared.check_open()?;
        self.shared.roll_back_receipts();
        self.shared.probe.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.probe.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.roll_back_receipts();
        }
        self.shared.broker.inner.activity.notify_waiters();

        let mut faults = self.shared.broker.inner.faults.lock();
        if faults.failing_closes > 0 {
            faults.failing_closes -= 1;
            return Err(BrokerError::Transport(format!(
                "injected close failure for session {}",
                self.shared.probe.id
            )));
        }
        Ok(())
    }
}

/// A consumer on a [`MemorySession`].
pub struct MemoryConsumer {
    session: Arc<SessionShared>,
    destination: String,
    closed: bool,
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn receive(&mut self) -> Result<Option<Message>, BrokerError> {
        let broker = self.session.broker.clone();
        loop {
            // Register interest before checking, so a notification sent between
            // the check and the await is not lost.
            let activity = broker.inner.activity.notified();
            tokio::pin!(activity);
            activity.as_mut().enable();

            if self.closed {
                return Ok(None);
            }
            self.session.check_open()?;
            if let Some(error) = broker.inner.faults.lock().receive.pop_front() {
                return Err(error);
            }

            if self.session.connection.started.load(Ordering::SeqCst)
                && let Some(message) = broker.pop(&self.destination)
            {
                self.session
                    .receipts
                    .lock()
                    .push((self.destination.clone(), message.clone()));
                self.session.probe.received.fetch_add(1, Ordering::SeqCst);
                return Ok(Some(message));
            }

            activity.await;
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        Ok(())
    }
}
