//! A concurrent, incremental, tricolor garbage collector for embedding
//! in Rust VMs (design §1-§2). One dedicated collector thread runs the
//! marking wave of [`collector::GarbageCollector`] while any number of
//! mutator threads allocate, read, and write through the barriered
//! handles in [`scan`] after registering via [`mutator::mutator_become`].
//!
//! The crate has no wire protocol, no CLI, and no persisted state
//! (design §6): it is a library whose boundary is the function-level
//! contracts re-exported at the crate root below. `log` is the one
//! observable side channel (design §4.8); nothing here reads the
//! environment or touches the filesystem.
pub mod bag;
pub mod collector;
pub mod color;
pub mod config;
pub mod epoch;
pub mod error;
pub mod mutator;
pub mod object;
pub mod ring_deque;
pub mod scan;
mod session;
pub mod skiplist;

#[cfg(test)]
pub(crate) mod tests_support;

pub use collector::GarbageCollector;
pub use config::GcConfig;
pub use error::{CollectorError, Error, SessionError};
pub use mutator::{alloc, mutator_become, mutator_handshake, mutator_resign};
pub use object::{GarbageCollected, GcHeader, GcRef, TracingContext};
pub use ring_deque::RingDeque;
pub use scan::{AtomicScan, Scan, ScanConst};
pub use skiplist::{SkipList, SkipListKey, SkipListMap};

/// Brings up process-wide GC state. Must run once, before any thread
/// calls [`mutator_become`] or constructs a [`GarbageCollector`]
/// (design §9: explicit init/shutdown rather than implicit static
/// initialisation order).
pub fn init() {
    epoch::init();
}

/// Tears down process-wide GC state. Only safe once every mutator has
/// resigned and the collector thread has stopped driving cycles.
pub fn shutdown() {
    epoch::shutdown();
}
