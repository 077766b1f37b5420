//! Error types for the replicated state engine.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the storage layer, the applier and the state machines.
///
/// Anything surfacing as an `Error` from the apply path means local state may have
/// diverged from the rest of the cluster, the applier halts on it.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding of a log entry failed.
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A durable record payload could not be encoded or decoded.
    #[error("Marshal error: {0}")]
    Marshal(String),

    /// The persisted state of a durable slot could not be recovered.
    #[error("Failed to recover durable state '{name}': {source}")]
    Recovery {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// The log has no entry at this index.
    #[error("No log entry at index {0}")]
    EntryNotFound(u64),

    /// An append did not extend the log by exactly one index.
    #[error("Non contiguous append, expected index {expected}, got {actual}")]
    NonContiguousAppend { expected: u64, actual: u64 },

    /// A state machine failed while applying or flushing.
    #[error("State machine error: {0}")]
    Machine(String),

    /// The process health flag is down.
    #[error("Unhealthy: {0}")]
    Unhealthy(String),

    /// `start` was called twice.
    #[error("Engine already started")]
    AlreadyStarted,

    /// The engine is not running.
    #[error("Engine is not running")]
    NotRunning,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A term or vote update broke a consensus rule.
    #[error("Consensus violation: {0}")]
    ConsensusViolation(String),
}

impl Error {
    pub(crate) fn recovery(name: &str, source: Error) -> Self {
        Error::Recovery {
            name: name.to_string(),
            source: Box::new(source),
        }
    }
}

/// A command that was applied in log order but refused by its state machine.
///
/// Rejections are replicated behaviour, every member rejects the same command at the
/// same index, so they are reported to the waiter and never halt the applier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Command rejected: {0}")]
pub struct CommandRejected(pub String);
