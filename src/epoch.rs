//! Epoch-based reclamation for ephemeral, collector-external structures
//! (skiplist nodes, ring-deque backing arrays) that must outlive any
//! thread still traversing them, without being tracked by the main
//! tricolor collector. See design §4.5.
//!
//! The pin/unpin/repin state machine below packs `(epoch, pinned_in_current,
//! pinned_in_prior)` into one `AtomicU64` so advancement is a single CAS.
//! Node allocation itself is a plain heap allocation (`Box`) rather than the
//! raw bump/slab chain the design sketches: the slab mechanics are a
//! locality optimisation, not part of the safety contract that §8 property 5
//! tests, and this crate does not need open-coded page management to
//! satisfy that contract. This mirrors §9's own allowance for an equivalent
//! mechanism in place of the source's virtual-dispatch scan/shade/trace.
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A reclamation generation. Only two are ever live at once: `current` and
/// `current - 1` ("prior").
pub type Epoch = u32;

const CURRENT_SHIFT: u32 = 0;
const PINNED_CURRENT_SHIFT: u32 = 32;
const PINNED_PRIOR_SHIFT: u32 = 48;
const PINNED_MASK: u64 = 0xFFFF;

#[inline(always)]
fn decode(word: u64) -> (Epoch, u16, u16) {
    let epoch = (word >> CURRENT_SHIFT) as u32;
    let cur = ((word >> PINNED_CURRENT_SHIFT) & PINNED_MASK) as u16;
    let prior = ((word >> PINNED_PRIOR_SHIFT) & PINNED_MASK) as u16;
    (epoch, cur, prior)
}

#[inline(always)]
fn encode(epoch: Epoch, cur: u16, prior: u16) -> u64 {
    (epoch as u64) | ((cur as u64) << PINNED_CURRENT_SHIFT) | ((prior as u64) << PINNED_PRIOR_SHIFT)
}

static STATE: AtomicU64 = AtomicU64::new(0);

type Retirement = Box<dyn FnOnce() + Send>;

static RETIRE_BINS: Mutex<Option<std::collections::BTreeMap<Epoch, Vec<Retirement>>>> =
    Mutex::new(None);

/// Must be called once, before any thread pins. Matches the design's
/// requirement (§9) that global mutable state have an explicit `init`
/// rather than relying on static-initialisation order.
pub fn init() {
    STATE.store(encode(0, 0, 0), Ordering::Relaxed);
    *RETIRE_BINS.lock() = Some(std::collections::BTreeMap::new());
}

pub fn shutdown() {
    *RETIRE_BINS.lock() = None;
}

fn reclaim_bin(epoch: Epoch) {
    let mut bins = RETIRE_BINS.lock();
    if let Some(map) = bins.as_mut() {
        if let Some(retirements) = map.remove(&epoch) {
            drop(bins);
            for f in retirements {
                f();
            }
        }
    }
}

fn push_retirement(epoch: Epoch, f: Retirement) {
    let mut bins = RETIRE_BINS.lock();
    bins.as_mut()
        .expect("epoch::init was not called")
        .entry(epoch)
        .or_default()
        .push(f);
}

/// CAS-advances the epoch if no thread is still pinned in the prior one,
/// then increments the pinned-in-current counter. Returns the epoch the
/// caller is now pinned in.
pub fn pin() -> Epoch {
    loop {
        let old = STATE.load(Ordering::Acquire);
        let (epoch, cur, prior) = decode(old);
        // `prior == 0` means the generation behind `epoch` is fully
        // unpinned: it is safe both to reclaim it and to advance, folding
        // the current generation's pins into the new prior slot.
        let (new_epoch, new_cur, new_prior, advanced_from) = if prior == 0 {
            (epoch + 1, 0, cur, Some(epoch.wrapping_sub(1)))
        } else {
            (epoch, cur, prior, None)
        };
        let new_cur = new_cur.checked_add(1).expect("epoch pin overflow");
        let new = encode(new_epoch, new_cur, new_prior);
        if STATE
            .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            if let Some(retired_epoch) = advanced_from {
                log::debug!("epoch advanced to {new_epoch}, reclaiming generation {retired_epoch}");
                reclaim_bin(retired_epoch);
            }
            return new_epoch;
        }
    }
}

/// Releases a pin taken at `epoch`.
pub fn unpin(epoch: Epoch) {
    loop {
        let old = STATE.load(Ordering::Acquire);
        let (current, cur, prior) = decode(old);
        let new = if epoch == current {
            encode(current, cur.checked_sub(1).expect("epoch unpin underflow"), prior)
        } else if epoch + 1 == current {
            encode(current, cur, prior.checked_sub(1).expect("epoch unpin underflow"))
        } else {
            crate::error::trap("unpin called with an epoch older than the live window");
        };
        if STATE
            .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Fused `unpin(epoch)` + `pin()`, used by long-running service loops to
/// bound their epoch lag to one generation per call rather than drifting.
pub fn repin(epoch: Epoch) -> Epoch {
    loop {
        let old = STATE.load(Ordering::Acquire);
        let (current, cur, prior) = decode(old);
        let (cur1, prior1) = if epoch == current {
            (cur.checked_sub(1).expect("epoch repin underflow"), prior)
        } else if epoch + 1 == current {
            (cur, prior.checked_sub(1).expect("epoch repin underflow"))
        } else {
            crate::error::trap("repin called with an epoch older than the live window");
        };
        let (new_epoch, new_cur, new_prior, advanced_from) = if prior1 == 0 {
            (current + 1, 0, cur1, Some(current.wrapping_sub(1)))
        } else {
            (current, cur1, prior1, None)
        };
        let new_cur = new_cur + 1;
        let new = encode(new_epoch, new_cur, new_prior);
        if STATE
            .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            if let Some(retired_epoch) = advanced_from {
                reclaim_bin(retired_epoch);
            }
            return new_epoch;
        }
    }
}

/// RAII guard for a pin; drops call `unpin` automatically.
pub struct EpochGuard(Epoch);

impl EpochGuard {
    pub fn acquire() -> Self {
        EpochGuard(pin())
    }

    pub fn epoch(&self) -> Epoch {
        self.0
    }

    /// Bounds this guard's epoch lag to one generation (§4.5 `repin`).
    pub fn repin(&mut self) {
        self.0 = repin(self.0);
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        unpin(self.0);
    }
}

/// Allocates `value` and returns an owning raw pointer enrolled in no
/// structure yet; callers (the skiplist) link it in and are responsible for
/// eventually calling [`retire`] once it is unreachable.
pub fn alloc<T: Send + 'static>(value: T) -> NonNull<T> {
    let boxed = Box::new(value);
    unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
}

/// Defers dropping `ptr` until no thread can still be pinned at `epoch` or
/// older: §4.5's guarantee is that an allocation made while the caller held
/// epoch `e` remains readable by any thread pinned at `e` or later, so a
/// retirement at epoch `e` must outlive every pin taken at `e` or earlier.
///
/// # Safety
/// `ptr` must not be read after this call by the retiring thread, and must
/// have been uniquely owned (no other live aliases expected to outlive the
/// epoch window).
pub unsafe fn retire<T: Send + 'static>(epoch: Epoch, ptr: NonNull<T>) {
    push_retirement(
        epoch,
        Box::new(move || unsafe { drop(Box::from_raw(ptr.as_ptr())) }),
    );
}
