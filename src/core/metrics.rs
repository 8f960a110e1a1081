// src/core/metrics.rs

//! Defines and registers Prometheus metrics for dispatcher monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle. Every dispatcher in the process
//! reports into the same series.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Session Pool Gauges ---
    /// Sessions currently held by the pool (free and leased, not abandoned).
    pub static ref POOLED_SESSIONS: Gauge =
        register_gauge!("seqdispatch_pooled_sessions", "Number of open sessions owned by session pools.").unwrap();
    /// Sessions currently leased to the intake loop or a handler.
    pub static ref LEASED_SESSIONS: Gauge =
        register_gauge!("seqdispatch_leased_sessions", "Number of sessions currently leased out.").unwrap();


    // --- Session Pool Counters ---
    pub static ref SESSIONS_CREATED_TOTAL: Counter =
        register_counter!("seqdispatch_sessions_created_total", "Total number of broker sessions created.").unwrap();
    pub static ref SESSIONS_REUSED_TOTAL: Counter =
        register_counter!("seqdispatch_sessions_reused_total", "Total number of leases served by an existing session.").unwrap();
    pub static ref SESSIONS_ABANDONED_TOTAL: Counter =
        register_counter!("seqdispatch_sessions_abandoned_total", "Total number of sessions closed after a failure.").unwrap();
    /// Session closes that failed during a drain.
    pub static ref DRAIN_FAILURES_TOTAL: Counter =
        register_counter!("seqdispatch_drain_failures_total", "Total number of session close failures during drain.").unwrap();


    // --- Intake Counters ---
    pub static ref MESSAGES_DISPATCHED_TOTAL: Counter =
        register_counter!("seqdispatch_messages_dispatched_total", "Total number of messages handed to the message handler.").unwrap();
    /// Receive cycles that failed and were recovered by abandoning the session.
    pub static ref RECEIVE_FAILURES_TOTAL: Counter =
        register_counter!("seqdispatch_receive_failures_total", "Total number of recovered receive-cycle failures.").unwrap();
    /// Lifecycle transitions, labeled by the state reached.
    pub static ref LIFECYCLE_TRANSITIONS_TOTAL: CounterVec =
        register_counter_vec!("seqdispatch_lifecycle_transitions_total", "Total number of lifecycle transitions, labeled by target state.", &["state"]).unwrap();


    // --- Histograms ---
    /// Time the intake loop spends waiting on the handler for one message.
    pub static ref HANDOFF_LATENCY_SECONDS: Histogram =
        register_histogram!("seqdispatch_handoff_latency_seconds", "Duration of the synchronous hand-off to the message handler in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
