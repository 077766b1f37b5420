//! Persistence primitives: the two-file durable record store and the replicated log.

pub mod durable;
pub mod log;
pub mod marshal;
mod segment;

pub use self::durable::DurableStore;
pub use self::log::{FileLog, MemoryLog, ReplicatedLog};
pub use self::marshal::{BincodeMarshal, IndexMarshal, Marshal};
