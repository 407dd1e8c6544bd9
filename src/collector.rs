//! The collector thread's loop: palette advancement, session draining,
//! and the fused trace/sweep pass (design §4.1).
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Instant;

use crate::bag::Bag;
use crate::color::{AtomicColor, Color, PaletteHistory, ShadeHistory};
use crate::config::GcConfig;
use crate::error::{trap, CollectorError};
use crate::object::{GcRef, TracingContext};
use crate::session::{Session, Tag};

/// Written only by the collector thread; read (relaxed) by every
/// mutator's allocation path. Relaxed is sufficient because mutators
/// synchronise with the collector through the session protocol, not
/// through this word (§4.1 step 4).
pub(crate) static COLOR_FOR_ALLOCATION: AtomicColor = AtomicColor::new(Color::WHITE);

/// Treiber stack of sessions a mutator has created but the collector has
/// not yet folded into its own session list.
static ENTRANT_HEAD: AtomicPtr<Session> = AtomicPtr::new(ptr::null_mut());

pub(crate) fn current_color_for_allocation() -> Color {
    COLOR_FOR_ALLOCATION.load(Ordering::Relaxed)
}

/// Mutator-side: push a freshly created session onto the entrant stack.
pub(crate) fn publish_entrant(session: *mut Session) {
    loop {
        let head = ENTRANT_HEAD.load(Ordering::Relaxed);
        unsafe { (*session).next.store(head, Ordering::Relaxed) };
        if ENTRANT_HEAD
            .compare_exchange(head, session, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// The collector's process-wide handle. One exists per collector thread;
/// embedders own it and drive it via [`GarbageCollector::run_cycle`] or
/// [`GarbageCollector::run_until`].
pub struct GarbageCollector {
    config: GcConfig,
    sessions: Vec<*mut Session>,
    known_objects: Bag<GcRef>,
    color_in_use: Color,
    mask_for_tracing: Color,
    mask_for_deleting: Color,
    mask_for_clearing: Color,
    palette_history: PaletteHistory,
    shade_history: ShadeHistory,
}

unsafe impl Send for GarbageCollector {}

impl GarbageCollector {
    /// Builds a fresh collector and immediately seeds one active marking
    /// wave: without this, any object allocated before the first
    /// `run_cycle` would be stamped with `Color::WHITE` and could never
    /// be told apart from a legitimately-collected object (see
    /// DESIGN.md).
    pub fn new(config: GcConfig) -> Self {
        COLOR_FOR_ALLOCATION.store(Color::WHITE, Ordering::Relaxed);
        ENTRANT_HEAD.store(ptr::null_mut(), Ordering::Relaxed);
        let mut collector = GarbageCollector {
            config,
            sessions: Vec::new(),
            known_objects: Bag::new(),
            color_in_use: Color::WHITE,
            mask_for_tracing: Color::WHITE,
            mask_for_deleting: Color::WHITE,
            mask_for_clearing: Color::WHITE,
            palette_history: PaletteHistory::default(),
            shade_history: ShadeHistory::default(),
        };
        collector.advance_masks(Color::WHITE);
        collector
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Number of objects currently known to the collector. Exposed for
    /// tests; not part of the external contract.
    #[cfg(test)]
    pub(crate) fn known_object_count(&mut self) -> usize {
        let mut drained = Vec::new();
        while let Some(ptr) = self.known_objects.try_pop() {
            drained.push(ptr);
        }
        let count = drained.len();
        for ptr in drained {
            self.known_objects.push(ptr);
        }
        count
    }

    /// One full iteration of §4.1 steps 1–6.
    pub fn run_cycle(&mut self) {
        self.harvest_entrants();
        let shaded_this_era = self.drain_sessions();
        self.advance_masks(shaded_this_era);
        self.request_publishes();
        self.trace_and_sweep();
    }

    /// Drives `run_cycle` until the known-objects set empties out or
    /// `deadline` elapses, matching `collector_run_until`'s contract
    /// (§6): used both as the collector thread's real entry point and by
    /// tests that want to run "until quiescent".
    pub fn run_until(&mut self, deadline: Instant) -> Result<(), CollectorError> {
        loop {
            if Instant::now() >= deadline {
                return Err(CollectorError::DeadlineExceeded);
            }
            self.run_cycle();
            if self.known_objects.is_empty() {
                return Ok(());
            }
        }
    }

    fn harvest_entrants(&mut self) {
        let mut head = ENTRANT_HEAD.swap(ptr::null_mut(), Ordering::Acquire);
        while !head.is_null() {
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            self.sessions.push(head);
            head = next;
        }
    }

    /// §4.1 steps 1–2: drain every session's published log, splice its
    /// allocations into the known-objects bag, OR its shaded report into
    /// this era's total, and release any session that has resigned.
    fn drain_sessions(&mut self) -> Color {
        let mut shaded_this_era = Color::WHITE;
        let mut retained = Vec::with_capacity(self.sessions.len());
        for session_ptr in self.sessions.drain(..) {
            let session = unsafe { &*session_ptr };
            let (chain, tag) = session.drain();
            for node in chain {
                let (allocations, node_shaded) = node.into_parts();
                self.known_objects.splice(allocations);
                shaded_this_era = shaded_this_era.union(node_shaded);
            }
            if tag == Tag::CollectorShouldConsumeAndRelease {
                log::info!("session '{}' released", session.name());
                Session::release_strong(session_ptr);
            } else {
                retained.push(session_ptr);
            }
        }
        self.sessions = retained;
        shaded_this_era
    }

    /// §4.1 step 5: ask every quiescent session to publish at its next
    /// handshake. We never block waiting for the reply here: the
    /// collector thread is itself permitted to be a mutator (§5), so it
    /// cannot tell its own session apart from another thread's without
    /// extra bookkeeping, and blocking on a session that happens to be
    /// its own would deadlock. `Session::wait_for_publish` still exists
    /// for an embedder that dedicates a non-mutator thread to driving
    /// `run_cycle`/`run_until` and wants to sleep instead of spin
    /// between cycles, rather than being reachable automatically from
    /// here.
    fn request_publishes(&self) {
        for &session_ptr in &self.sessions {
            unsafe { (*session_ptr).request_publish(false) };
        }
    }

    /// Escalates the first quiescent session to notify on publish, then
    /// blocks the calling thread up to `config.handshake_timeout` for it
    /// to do so. Returns whether it published in time.
    ///
    /// `run_cycle`/`run_until` never call this: as noted on
    /// `request_publishes`, the collector thread may itself be a
    /// mutator and can't always tell its own session apart from another
    /// one's, so blocking here unconditionally risks waiting on itself
    /// forever. This is for an embedder whose collector-driving thread
    /// is known to never register as a mutator, and that wants to sleep
    /// between cycles instead of spin-polling `run_cycle`.
    pub fn wait_for_handshake(&self) -> bool {
        for &session_ptr in &self.sessions {
            let session = unsafe { &*session_ptr };
            if session.request_publish(true) {
                return session.wait_for_publish(self.config.handshake_timeout);
            }
        }
        false
    }

    /// §4.1 step 3: the per-cycle palette transition.
    fn advance_masks(&mut self, shaded_this_era: Color) {
        let old = current_color_for_allocation();

        self.palette_history.push(old);
        self.shade_history.push(shaded_this_era);

        // A k fully finished one cycle as `mask_for_clearing` last round:
        // safe to drop it from the global palette entirely and free it
        // up for a future marking wave.
        let recycled = self.mask_for_clearing;
        self.color_in_use = self.color_in_use.difference(recycled.as_both_halves());
        let mut new_color = old.difference(recycled.as_both_halves());

        // Last cycle's deleting mask becomes this cycle's clearing mask;
        // this cycle's deleting mask starts empty and is refilled below.
        self.mask_for_clearing = self.mask_for_deleting;
        self.mask_for_deleting = Color::WHITE;

        // A k confirmed grey for a full handshake round is safe to also
        // mark black in the allocation palette.
        let newly_grey = self.palette_history.get(0).low() & !self.palette_history.get(1).low();
        new_color = new_color.promote(Color::new(newly_grey as u64));

        // A k confirmed black for a full round starts being traced.
        let newly_black = self.palette_history.get(0).high() & !self.palette_history.get(1).high();
        self.mask_for_tracing = self.mask_for_tracing.union(Color::new(newly_black as u64));

        // A tracing k unshaded for `stability_handshakes` consecutive
        // handshakes has stopped finding new grey objects: promote it to
        // deleting.
        let mut stable = u32::MAX;
        for i in 0..self.config.stability_handshakes as usize {
            stable &= !self.shade_history.get(i).low();
        }
        let promoting = self.mask_for_tracing.low() & stable;
        self.mask_for_deleting = self.mask_for_deleting.union(Color::new(promoting as u64));
        self.mask_for_tracing = self.mask_for_tracing.difference(Color::new(promoting as u64));

        // No wave currently pending allocation: start a fresh one.
        if new_color.low() == 0 {
            if let Some(k) = (0..32u32).find(|k| !self.color_in_use.is_grey(*k)) {
                let bit = Color::new(1u64 << k);
                new_color = new_color.union(bit);
                self.color_in_use = self.color_in_use.union(bit);
            }
        }

        COLOR_FOR_ALLOCATION.store(new_color, Ordering::Relaxed);

        log::debug!(
            "palette advanced: alloc={:#x} tracing={:#x} deleting={:#x} clearing={:#x}",
            new_color.bits(),
            self.mask_for_tracing.bits(),
            self.mask_for_deleting.bits(),
            self.mask_for_clearing.bits(),
        );
    }

    /// §4.1 step 6: one fused trace-then-sweep pass over every known
    /// object.
    fn trace_and_sweep(&mut self) {
        let mut ctx = TracingContext::new(self.mask_for_tracing, self.mask_for_clearing.as_both_halves());

        let mut candidates = Vec::new();
        while let Some(ptr) = self.known_objects.try_pop() {
            candidates.push(ptr);
        }
        for &ptr in &candidates {
            ctx.trace(Some(ptr));
        }
        ctx.drain();

        let deleting_low = self.mask_for_deleting.low();
        let deleting_spread = self.mask_for_deleting.as_both_halves();
        let mut survivors = Bag::new();
        let mut traced = 0usize;
        let mut deleted = 0usize;

        for ptr in candidates {
            traced += 1;
            let obj = unsafe { ptr.as_ref() };
            let color = obj.header().color.load(Ordering::Relaxed);
            let black_under_delete = color.high() & deleting_low;
            let grey_under_delete = color.low() & deleting_low;
            let lives_elsewhere = (color.bits() & !deleting_spread.bits()) != 0;

            if black_under_delete != 0 || lives_elsewhere {
                survivors.push(ptr);
                continue;
            }
            if grey_under_delete != 0 {
                trap(&format!(
                    "grey-under-delete: object {:#x} color {:#x} deleting mask {:#x}",
                    ptr.as_ptr() as *const () as usize,
                    color.bits(),
                    self.mask_for_deleting.bits(),
                ));
            }

            let _ = obj.sweep();
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
            deleted += 1;
        }

        self.known_objects = survivors;
        log::trace!(
            "cycle: traced {traced} objects, deleted {deleted}, {} survive",
            traced - deleted
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator;
    use crate::object::{GarbageCollected, GcHeader};
    use crate::scan::Scan;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    // The global palette/entrant-stack statics are process-wide; tests
    // that drive a `GarbageCollector` must not run concurrently with one
    // another or they will race each other's palette state.
    static TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    struct Counted {
        header: GcHeader,
        next: Scan<Counted>,
        alive: Arc<AtomicUsize>,
    }

    unsafe impl GarbageCollected for Counted {
        fn header(&self) -> &GcHeader {
            &self.header
        }
        fn scan(&self, ctx: &mut TracingContext) {
            ctx.trace(self.next.as_gc_ref());
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn s1_chain_survives_while_rooted_then_is_freed() {
        let _guard = TEST_LOCK.lock();
        let config = GcConfig::default().with_stability_handshakes(1);
        let mut gc = GarbageCollector::new(config);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                mutator::mutator_become("root-holder");

                let alive = Arc::new(AtomicUsize::new(0));
                let chain_len = 64usize;
                let mut head: Option<std::ptr::NonNull<Counted>> = None;
                for _ in 0..chain_len {
                    alive.fetch_add(1, Ordering::SeqCst);
                    let node = Counted {
                        header: GcHeader::new(Color::WHITE),
                        next: Scan::new(head),
                        alive: alive.clone(),
                    };
                    head = Some(mutator::alloc(node));
                }
                let root: Scan<Counted> = Scan::new(head);
                mutator::mutator_handshake();

                // A few cycles with the root alive: nothing should be
                // freed (property 1, "no premature free").
                for _ in 0..8 {
                    gc.run_cycle();
                    mutator::mutator_handshake();
                }
                assert_eq!(alive.load(Ordering::SeqCst), chain_len);

                root.store(None);
                mutator::mutator_handshake();
                mutator::mutator_resign();

                gc.run_until(Instant::now() + Duration::from_secs(5))
                    .expect("collector should reach quiescence within the deadline");
                assert_eq!(alive.load(Ordering::SeqCst), 0);
            });
        });
    }

    #[test]
    fn s3_resignation_is_released_exactly_once() {
        let _guard = TEST_LOCK.lock();
        let mut gc = GarbageCollector::new(GcConfig::default());

        std::thread::scope(|scope| {
            scope.spawn(|| {
                mutator::mutator_become("short-lived");
                let alive = Arc::new(AtomicUsize::new(1));
                let node = Counted {
                    header: GcHeader::new(Color::WHITE),
                    next: Scan::new(None),
                    alive: alive.clone(),
                };
                mutator::alloc(node);
                mutator::mutator_resign();
            });
        });

        // Draining twice must not double-release or double-count: the
        // second cycle simply finds nothing new to drain.
        gc.run_cycle();
        gc.run_cycle();
    }

    #[test]
    fn wait_for_handshake_wakes_on_a_delayed_mutator_publish() {
        let _guard = TEST_LOCK.lock();
        let config = GcConfig::default().with_handshake_timeout(Duration::from_secs(5));
        let mut gc = GarbageCollector::new(config);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                mutator::mutator_become("handshake-waiter-mutator");
                std::thread::sleep(Duration::from_millis(50));
                mutator::mutator_handshake();
                mutator::mutator_resign();
            });

            // Entrant registration races the handshake wait below; poll
            // until the spawned thread's session has been folded in.
            let mut tries = 0;
            while gc.sessions.is_empty() && tries < 50 {
                gc.harvest_entrants();
                std::thread::sleep(Duration::from_millis(5));
                tries += 1;
            }
            assert!(!gc.sessions.is_empty(), "mutator session never registered");

            assert!(
                gc.wait_for_handshake(),
                "collector should have seen the delayed handshake publish"
            );
        });
    }

    #[test]
    fn s6_palette_recycles_k_bits_without_trapping() {
        let _guard = TEST_LOCK.lock();
        let config = GcConfig::default().with_stability_handshakes(1);
        let mut gc = GarbageCollector::new(config);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                mutator::mutator_become("churner");
                let alive = Arc::new(AtomicUsize::new(0));
                for _ in 0..40 {
                    alive.fetch_add(1, Ordering::SeqCst);
                    let node = Counted {
                        header: GcHeader::new(Color::WHITE),
                        next: Scan::new(None),
                        alive: alive.clone(),
                    };
                    // Unrooted: every node is immediately garbage.
                    mutator::alloc(node);
                    mutator::mutator_handshake();
                }
                mutator::mutator_resign();
            });
        });

        for _ in 0..24 {
            gc.run_cycle();
        }
        assert_eq!(gc.known_object_count(), 0);
    }
}
