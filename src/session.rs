//! The mutator <-> collector handshake channel.
//!
//! Each [`Session`] owns one atomic tagged pointer. The low 2 bits of the
//! word are the [`Tag`]; the remaining bits are a `*mut LogNode` (or null).
//! Pointers into `LogNode` are always at least 4-byte aligned (they are
//! `Box`-allocated, minimum alignment of a pointer-sized field), so the tag
//! bits never collide with a real address.
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::bag::Bag;
use crate::color::Color;
use crate::error::trap;
use crate::object::GcRef;

#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Tag {
    CollectorShouldConsume = 0,
    MutatorShouldPublish = 1,
    CollectorShouldConsumeAndRelease = 2,
    MutatorShouldPublishAndNotify = 3,
}

const TAG_MASK: usize = 0b11;

fn decode_tag(bits: usize) -> Tag {
    match bits {
        0 => Tag::CollectorShouldConsume,
        1 => Tag::MutatorShouldPublish,
        2 => Tag::CollectorShouldConsumeAndRelease,
        3 => Tag::MutatorShouldPublishAndNotify,
        _ => unreachable!("tag is masked to 2 bits"),
    }
}

fn encode(ptr: *mut LogNode, tag: Tag) -> usize {
    debug_assert_eq!(ptr as usize & TAG_MASK, 0, "LogNode must be pointer-aligned");
    (ptr as usize) | (tag as usize)
}

fn decode(word: usize) -> (*mut LogNode, Tag) {
    ((word & !TAG_MASK) as *mut LogNode, decode_tag(word & TAG_MASK))
}

/// One snapshot of a mutator's activity between two handshakes.
pub(crate) struct LogNode {
    next: *mut LogNode,
    pub allocations: Bag<GcRef>,
    /// Which grey bits the mutator raised on any pre-existing object via
    /// shading since the prior handshake.
    pub shaded: Color,
}

impl LogNode {
    /// Consumes the node, handing its allocation bag and shading report to
    /// the collector. `next` is dropped with it; the chain has already been
    /// unlinked by [`LogChain::next`] by the time a caller sees this.
    pub(crate) fn into_parts(self) -> (Bag<GcRef>, Color) {
        (self.allocations, self.shaded)
    }
}

/// A chain of drained log nodes, oldest last. Iterating consumes it and
/// frees each node as it is yielded.
pub(crate) struct LogChain(*mut LogNode);

impl Iterator for LogChain {
    type Item = Box<LogNode>;

    fn next(&mut self) -> Option<Box<LogNode>> {
        if self.0.is_null() {
            return None;
        }
        let node = unsafe { Box::from_raw(self.0) };
        self.0 = node.next;
        Some(node)
    }
}

impl Drop for LogChain {
    fn drop(&mut self) {
        for _ in self {}
    }
}

/// Per-mutator-thread state cached between handshakes: the pending
/// allocation bag, the shading report, and the collector's last published
/// allocation palette.
#[derive(Default)]
pub(crate) struct MutatorLocal {
    pub bag: Bag<GcRef>,
    pub color_did_shade: Color,
    pub color_for_allocation: Color,
}

/// One mutator's participation window. Held by exactly two owners at
/// creation (the mutator thread and the collector's session list); a
/// manual strong count tracks this so the session is freed only once both
/// have released it.
pub struct Session {
    pub(crate) next: AtomicPtr<Session>,
    tagged_head: AtomicUsize,
    is_done: AtomicBool,
    strong_count: AtomicU32,
    name: String,
    notify_mutex: Mutex<()>,
    notify_condvar: Condvar,
}

impl Session {
    pub(crate) fn new(name: String) -> Box<Session> {
        Box::new(Session {
            next: AtomicPtr::new(ptr::null_mut()),
            tagged_head: AtomicUsize::new(encode(ptr::null_mut(), Tag::CollectorShouldConsume)),
            is_done: AtomicBool::new(false),
            strong_count: AtomicU32::new(2),
            name,
            notify_mutex: Mutex::new(()),
            notify_condvar: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mutator-side publish used by both `handshake` and `resign`; the
    /// only difference is the tag left behind.
    fn publish(&self, local: &mut MutatorLocal, result_tag: Tag) {
        let node = Box::into_raw(Box::new(LogNode {
            next: ptr::null_mut(),
            allocations: std::mem::take(&mut local.bag),
            shaded: std::mem::replace(&mut local.color_did_shade, Color::WHITE),
        }));
        loop {
            let old = self.tagged_head.load(Ordering::Acquire);
            let (old_ptr, old_tag) = decode(old);
            unsafe {
                (*node).next = old_ptr;
            }
            let new = encode(node, result_tag);
            match self
                .tagged_head
                .compare_exchange(old, new, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => {
                    if old_tag == Tag::MutatorShouldPublishAndNotify {
                        let _guard = self.notify_mutex.lock();
                        self.notify_condvar.notify_all();
                    }
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    /// Publish if the collector is waiting for one; otherwise a no-op.
    /// Refreshes `local.color_for_allocation` from the global palette
    /// unconditionally, since the cache must never go stale even when
    /// nothing was published.
    pub(crate) fn handshake(&self, local: &mut MutatorLocal, current_color_for_allocation: Color) {
        let tag = decode(self.tagged_head.load(Ordering::Relaxed)).1;
        match tag {
            Tag::MutatorShouldPublish | Tag::MutatorShouldPublishAndNotify => {
                self.publish(local, Tag::CollectorShouldConsume);
            }
            Tag::CollectorShouldConsume => {}
            Tag::CollectorShouldConsumeAndRelease => {
                trap("mutator_handshake called on a resigned session");
            }
        }
        local.color_for_allocation = current_color_for_allocation;
    }

    /// Final publish. Must be called exactly once per session.
    pub(crate) fn resign(&self, local: &mut MutatorLocal) {
        if self.is_done.swap(true, Ordering::AcqRel) {
            trap("session resigned more than once");
        }
        self.publish(local, Tag::CollectorShouldConsumeAndRelease);
    }

    /// Collector-side drain (design §4.1 step 1): atomically swap the log
    /// stack out, leaving `(null, CollectorShouldConsume)` — "nothing to
    /// do" — behind. Returns the drained chain and the tag observed
    /// *before* the swap, since `CollectorShouldConsumeAndRelease` there
    /// means this was the session's last publish.
    pub(crate) fn drain(&self) -> (LogChain, Tag) {
        let quiescent = encode(ptr::null_mut(), Tag::CollectorShouldConsume);
        let old = self.tagged_head.swap(quiescent, Ordering::Acquire);
        let (old_ptr, old_tag) = decode(old);
        (LogChain(old_ptr), old_tag)
    }

    /// Collector-side (design §4.1 step 5): if this session's tag is
    /// already the quiescent "nothing to do" state, ask the mutator to
    /// publish. Returns whether this call performed that transition; a
    /// failed CAS means the mutator raced us, so the caller leaves it
    /// for the next cycle rather than waiting on it.
    pub(crate) fn request_publish(&self, notify: bool) -> bool {
        let quiescent = encode(ptr::null_mut(), Tag::CollectorShouldConsume);
        let requested = encode(
            ptr::null_mut(),
            if notify {
                Tag::MutatorShouldPublishAndNotify
            } else {
                Tag::MutatorShouldPublish
            },
        );
        self.tagged_head
            .compare_exchange(quiescent, requested, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Block until woken by a publish that observed
    /// `MutatorShouldPublishAndNotify`, or until `timeout` elapses.
    /// Returns `false` on timeout, which a caller should treat as
    /// diagnostic only (§7 "slow mutator": logged, never fatal) rather
    /// than retrying forever. Not called by [`crate::collector`]'s own
    /// `run_cycle`/`run_until` loop, since the collector thread may
    /// itself be a mutator (§5) and cannot always tell its own session
    /// apart from another one's; an embedder driving the collector from
    /// a thread it knows is not also a mutator can use this directly to
    /// sleep between cycles instead of spinning.
    pub(crate) fn wait_for_publish(&self, timeout: std::time::Duration) -> bool {
        let mut guard = self.notify_mutex.lock();
        !self
            .notify_condvar
            .wait_for(&mut guard, timeout)
            .timed_out()
    }

    /// Collector-side (design §4.1 step 2): called once a session's final
    /// log was observed tagged `CollectorShouldConsumeAndRelease`. Drops
    /// the collector's own strong reference.
    pub(crate) fn release_strong(session: *mut Session) {
        drop_strong(session);
    }
}

fn drop_strong(session: *mut Session) {
    let previous = unsafe { (*session).strong_count.fetch_sub(1, Ordering::Release) };
    match previous {
        0 => trap("session refcount underflow"),
        1 => {
            std::sync::atomic::fence(Ordering::Acquire);
            unsafe {
                drop(Box::from_raw(session));
            }
        }
        _ => {}
    }
}

/// An owning handle to a [`Session`], used by the mutator side. Dropping
/// it releases the mutator's strong reference; it does not resign the
/// session (callers must call `mutator_resign` explicitly, per the design's
/// "exactly once" contract).
pub(crate) struct SessionHandle(NonNullSession);

struct NonNullSession(*mut Session);

impl Session {
    pub(crate) fn into_handle(boxed: Box<Session>) -> SessionHandle {
        SessionHandle(NonNullSession(Box::into_raw(boxed)))
    }
}

impl std::ops::Deref for SessionHandle {
    type Target = Session;
    fn deref(&self) -> &Session {
        unsafe { &*self.0 .0 }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        drop_strong(self.0 .0);
    }
}

unsafe impl Send for SessionHandle {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_quiescent() {
        let session = Session::new("t".into());
        let (chain, tag) = session.drain();
        assert_eq!(tag, Tag::CollectorShouldConsume);
        assert!(chain.0.is_null());
    }

    #[test]
    fn handshake_publishes_only_when_requested() {
        let session = Session::new("t".into());
        let mut local = MutatorLocal::default();
        local.bag.push(crate::tests_support::dummy_ref());

        // Nothing requested yet: handshake is a no-op on the bag.
        session.handshake(&mut local, Color::WHITE);
        assert!(!local.bag.is_empty());

        session.request_publish(false);
        session.handshake(&mut local, Color::WHITE);
        assert!(local.bag.is_empty());

        let (mut chain, _) = session.drain();
        let node = chain.next().expect("one published node");
        assert!(!node.allocations.is_empty());
    }

    #[test]
    fn resign_then_handshake_traps() {
        let session = Session::new("t".into());
        let mut local = MutatorLocal::default();
        session.resign(&mut local);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            session.handshake(&mut local, Color::WHITE);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn double_resign_traps() {
        let session = Session::new("t".into());
        let mut local = MutatorLocal::default();
        session.resign(&mut local);
        let mut local2 = MutatorLocal::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            session.resign(&mut local2);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn wait_for_publish_times_out_when_nobody_wakes_it() {
        let session = Session::new("t".into());
        let woke = session.wait_for_publish(std::time::Duration::from_millis(10));
        assert!(!woke);
    }

    #[test]
    fn wait_for_publish_wakes_on_a_notify_tagged_publish() {
        use std::sync::Arc;

        let session = Arc::new(Session::new("t".into()));
        session.request_publish(true);
        assert_eq!(
            decode(session.tagged_head.load(Ordering::Relaxed)).1,
            Tag::MutatorShouldPublishAndNotify
        );

        // Start the waiter first and give it time to actually park on the
        // condvar before the publish fires; `wait_for_publish`'s 5s bound
        // is the real safety net if that race is ever lost.
        let waiter = session.clone();
        let handle = std::thread::spawn(move || waiter.wait_for_publish(std::time::Duration::from_secs(5)));
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut local = MutatorLocal::default();
        session.handshake(&mut local, Color::WHITE);

        assert!(handle.join().unwrap(), "publish should have notified the waiter");
    }
}
