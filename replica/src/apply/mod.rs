//! Command application pipeline
//!
//! Committed entries flow from the in-flight cache (or the log on a miss) through the
//! session tracker and the dispatcher into the state machines.

pub mod applier;
pub mod dispatcher;
pub mod progress;
pub mod session;

pub use self::applier::Applier;
pub use self::dispatcher::Dispatcher;
pub use self::progress::ProgressTracker;
pub use self::session::SessionTracker;
