// src/core/pool.rs

//! The transactional session pool.
//!
//! Sessions are leased rather than shared: the pool keeps a map from session id
//! to lease state, and every state change happens under one lock. `acquire`
//! is additionally serialized as a whole, so two concurrent callers can never
//! both decide that no session is free and both create one for the same
//! demand, nor both pick the same free session.
//!
//! The pool grows on demand and never shrinks while running; sessions that fail
//! are closed and kept as `Abandoned` entries so they are neither reused nor
//! closed a second time. Only [`SessionPool::drain`] empties it.

use crate::broker::{BrokerConnection, BrokerSession};
use crate::core::errors::{BrokerError, SequencerError};
use crate::core::metrics;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Identifies a session within its pool.
pub type SessionId = u64;

/// The lease state of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Open and available for the next `acquire`.
    Free,
    /// Open and owned by exactly one holder.
    Leased,
    /// Closed after a failure; kept only so the pool never shrinks.
    Abandoned,
}

struct PooledSession {
    session: Arc<dyn BrokerSession>,
    state: LeaseState,
}

/// A point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Every entry, including abandoned sessions.
    pub total: usize,
    pub free: usize,
    pub leased: usize,
    pub abandoned: usize,
    /// Sessions created since the pool was built.
    pub created: u64,
    /// Leases served by an already existing session.
    pub reused: u64,
}

/// The outcome of [`SessionPool::drain`].
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Number of sessions on which `close` was called.
    pub closed: usize,
    /// Every close that failed. None of them stopped the drain.
    pub failures: Vec<(SessionId, BrokerError)>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A grow-only pool of transacted sessions created from one connection.
pub struct SessionPool {
    connection: Arc<dyn BrokerConnection>,
    entries: parking_lot::Mutex<IndexMap<SessionId, PooledSession>>,
    /// Serializes `acquire` (and `drain`) end to end, including session creation.
    acquire_lock: tokio::sync::Mutex<()>,
    drained: AtomicBool,
    next_id: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    /// Log a warning whenever the number of open sessions exceeds this.
    warn_threshold: Option<usize>,
}

impl SessionPool {
    pub fn new(connection: Arc<dyn BrokerConnection>, warn_threshold: Option<usize>) -> Self {
        Self {
            connection,
            entries: parking_lot::Mutex::new(IndexMap::new()),
            acquire_lock: tokio::sync::Mutex::new(()),
            drained: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            warn_threshold,
        }
    }

    /// Leases a free session, or creates, registers and leases a new one if
    /// none is free. Creation errors are returned to the caller.
    pub async fn acquire(self: &Arc<Self>) -> Result<SessionLease, SequencerError> {
        let _serial = self.acquire_lock.lock().await;
        if self.drained.load(Ordering::SeqCst) {
            return Err(SequencerError::PoolDrained);
        }

        if let Some((id, session)) = self.lease_free() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            metrics::SESSIONS_REUSED_TOTAL.inc();
            metrics::LEASED_SESSIONS.inc();
            debug!(session_id = id, "Reusing existing session.");
            return Ok(SessionLease::new(self.clone(), id, session));
        }

        debug!("No session available, creating a new session.");
        let session = self.connection.create_session().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let open = {
            let mut entries = self.entries.lock();
            entries.insert(
                id,
                PooledSession {
                    session: session.clone(),
                    state: LeaseState::Leased,
                },
            );
            entries
                .values()
                .filter(|e| e.state != LeaseState::Abandoned)
                .count()
        };
        self.created.fetch_add(1, Ordering::Relaxed);
        metrics::SESSIONS_CREATED_TOTAL.inc();
        metrics::POOLED_SESSIONS.inc();
        metrics::LEASED_SESSIONS.inc();
        info!(session_id = id, "Session created. Number of open sessions is {}", open);

        if let Some(threshold) = self.warn_threshold
            && open > threshold
        {
            warn!(
                "Session pool holds {} open sessions, above the configured warning threshold of {}.",
                open, threshold
            );
        }

        Ok(SessionLease::new(self.clone(), id, session))
    }

    /// Picks the most recently created free session and marks it leased.
    fn lease_free(&self) -> Option<(SessionId, Arc<dyn BrokerSession>)> {
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .rev()
            .find(|(_, entry)| entry.state == LeaseState::Free)
            .map(|(id, entry)| {
                entry.state = LeaseState::Leased;
                (*id, entry.session.clone())
            })
    }

    /// Returns a leased session to the pool.
    pub fn release(&self, id: SessionId) -> Result<(), SequencerError> {
        self.transition(id, LeaseState::Free)?;
        metrics::LEASED_SESSIONS.dec();
        debug!(session_id = id, "Session released.");
        Ok(())
    }

    /// Marks a leased session as abandoned. The caller is responsible for
    /// closing it; the pool will not hand it out or close it again.
    pub fn abandon(&self, id: SessionId) -> Result<(), SequencerError> {
        self.transition(id, LeaseState::Abandoned)?;
        metrics::LEASED_SESSIONS.dec();
        metrics::POOLED_SESSIONS.dec();
        metrics::SESSIONS_ABANDONED_TOTAL.inc();
        Ok(())
    }

    fn transition(&self, id: SessionId, to: LeaseState) -> Result<(), SequencerError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if entry.state == LeaseState::Leased => {
                entry.state = to;
                Ok(())
            }
            _ => Err(SequencerError::UnknownLease(id)),
        }
    }

    /// Closes every open session and empties the pool. Individual close
    /// failures are logged and reported, never propagated, and never stop the
    /// remaining sessions from being closed. After a drain `acquire` fails.
    pub async fn drain(&self) -> DrainReport {
        let _serial = self.acquire_lock.lock().await;
        self.drained.store(true, Ordering::SeqCst);
        let entries = std::mem::take(&mut *self.entries.lock());

        let mut report = DrainReport::default();
        for (id, entry) in entries {
            if entry.state == LeaseState::Abandoned {
                continue;
            }
            if entry.state == LeaseState::Leased {
                metrics::LEASED_SESSIONS.dec();
            }
            metrics::POOLED_SESSIONS.dec();

            report.closed += 1;
            if let Err(e) = entry.session.close().await {
                error!(session_id = id, "Failed to close session during drain: {}", e);
                metrics::DRAIN_FAILURES_TOTAL.inc();
                report.failures.push((id, e));
            }
        }

        info!(
            "Session pool drained: {} sessions closed, {} failures.",
            report.closed,
            report.failures.len()
        );
        report
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.entries.lock();
        let mut stats = PoolStats {
            total: entries.len(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in entries.values() {
            match entry.state {
                LeaseState::Free => stats.free += 1,
                LeaseState::Leased => stats.leased += 1,
                LeaseState::Abandoned => stats.abandoned += 1,
            }
        }
        stats
    }

    /// The lease state of a session, or `None` if the pool does not know it.
    pub fn state_of(&self, id: SessionId) -> Option<LeaseState> {
        self.entries.lock().get(&id).map(|e| e.state)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// The right to use one pooled session until it is settled.
///
/// A lease is settled by exactly one of [`commit_and_release`],
/// [`rollback_and_release`], [`release`] or [`discard`]. A lease dropped
/// unsettled keeps its session leased until the pool is drained.
///
/// [`commit_and_release`]: SessionLease::commit_and_release
/// [`rollback_and_release`]: SessionLease::rollback_and_release
/// [`release`]: SessionLease::release
/// [`discard`]: SessionLease::discard
pub struct SessionLease {
    pool: Arc<SessionPool>,
    id: SessionId,
    session: Arc<dyn BrokerSession>,
    settled: bool,
}

impl SessionLease {
    fn new(pool: Arc<SessionPool>, id: SessionId, session: Arc<dyn BrokerSession>) -> Self {
        Self {
            pool,
            id,
            session,
            settled: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The leased session. Callers may receive, commit and roll back through
    /// it, but must settle the lease instead of closing it directly.
    pub fn session(&self) -> &Arc<dyn BrokerSession> {
        &self.session
    }

    /// Commits the session's transaction and returns the session to the pool.
    /// If the commit fails the session is discarded and the error returned.
    pub async fn commit_and_release(mut self) -> Result<(), SequencerError> {
        match self.session.commit().await {
            Ok(()) => self.settle_free(),
            Err(e) => {
                warn!(session_id = self.id, "Commit failed, discarding session: {}", e);
                let _ = self.settle_abandoned(false).await;
                Err(e.into())
            }
        }
    }

    /// Rolls back the session's transaction and returns the session to the
    /// pool. If the rollback fails the session is discarded and the error returned.
    pub async fn rollback_and_release(mut self) -> Result<(), SequencerError> {
        match self.session.rollback().await {
            Ok(()) => self.settle_free(),
            Err(e) => {
                warn!(session_id = self.id, "Rollback failed, discarding session: {}", e);
                let _ = self.settle_abandoned(false).await;
                Err(e.into())
            }
        }
    }

    /// Returns the session to the pool without ending its transaction.
    pub fn release(mut self) -> Result<(), SequencerError> {
        self.settle_free()
    }

    /// Rolls back (best effort), closes and abandons the session. Returns the
    /// close error, if any; the session is abandoned either way.
    pub async fn discard(mut self) -> Result<(), SequencerError> {
        self.settle_abandoned(true).await
    }

    fn settle_free(&mut self) -> Result<(), SequencerError> {
        self.settled = true;
        self.pool.release(self.id)
    }

    async fn settle_abandoned(&mut self, rollback: bool) -> Result<(), SequencerError> {
        self.settled = true;
        if rollback && let Err(e) = self.session.rollback().await {
            debug!(session_id = self.id, "Rollback before discard failed: {}", e);
        }
        // Once the pool has been drained the session is already closed.
        if self.pool.abandon(self.id).is_err() {
            debug!(
                session_id = self.id,
                "Session no longer leased from the pool, skipping close."
            );
            return Ok(());
        }
        self.session.close().await.map_err(|e| {
            warn!(session_id = self.id, "Failed to close discarded session: {}", e);
            SequencerError::from(e)
        })
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                session_id = self.id,
                "Session lease dropped without being settled; the session stays leased until the pool is drained."
            );
        }
    }
}
