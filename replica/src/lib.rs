//! Replicated state application engine
//!
//! Persists consensus-critical values in crash-safe two-file slots and applies committed
//! log entries, in order and exactly once, into a fixed set of state machines.

pub mod apply;
pub mod cache;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod entry;
pub mod error;
pub mod health;
pub mod machines;
pub mod metrics;
pub mod storage;

pub use crate::engine::Engine;
pub use crate::error::{CommandRejected, Error, Result};
pub use crate::health::{Health, HealthState};
