// src/lib.rs

pub mod broker;
pub mod config;
pub mod core;
pub mod dispatcher;

// Re-export
pub use crate::dispatcher::{SequencedDispatcher, ShutdownReport, StopReport};
