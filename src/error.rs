//! Typed failures that cross the library boundary, plus the trap path for
//! invariant violations that must never be recovered from.
use thiserror::Error;

/// Recoverable failures returned by fallible entry points.
///
/// Internal invariant violations (double-resign, grey-under-delete,
/// refcount underflow) are not represented here: they are programmer errors
/// and always [`trap`], never propagate as a `Result`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("collector error: {0}")]
    Collector(#[from] CollectorError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

#[derive(Debug, Error)]
pub enum CollectorError {
    /// The underlying page/bump allocator returned no memory. Propagated
    /// unchanged from the allocator; the collector never synthesizes this.
    #[error("allocator exhausted")]
    AllocatorExhausted,
    /// `collector_run_until`'s advisory deadline elapsed mid-cycle.
    #[error("collector deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// A session was asked to resign twice, or handshaken after resigning.
    /// Kept as a variant for completeness of the error hierarchy, but the
    /// collector itself raises this as a trap (see [`trap`]) rather than
    /// returning it, since recovering would mean continuing past a
    /// violated protocol invariant.
    #[error("session already resigned")]
    AlreadyResigned,
}

/// Logs `message` at `error!` and then panics.
///
/// Used for every condition the design calls a bug rather than a
/// recoverable error: these are never converted to a `Result` because
/// continuing past them means running on top of a corrupted invariant.
#[cold]
#[inline(never)]
pub(crate) fn trap(message: &str) -> ! {
    log::error!("{}", message);
    panic!("{}", message);
}
