//! Write-barrier-aware pointer handles (design §4.3).
//!
//! All three flavours store a thin `*mut T` rather than a `GcRef` fat
//! pointer: the managed type behind a `Scan<T>` is always a concrete,
//! `Sized` `GarbageCollected` implementor, so plain `AtomicPtr<T>` already
//! gives the lock-free store/load the barrier needs. The fat `GcRef` is
//! only materialised at the point a shade actually has to happen.
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::color::Color;
use crate::object::{to_gc_ref, GarbageCollected, GcRef};

#[inline(always)]
fn to_raw<T>(ptr: Option<NonNull<T>>) -> *mut T {
    ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
}

#[inline(always)]
fn shade_both<T: GarbageCollected>(old: *mut T, new: Option<NonNull<T>>) {
    crate::mutator::shade(NonNull::new(old).map(to_gc_ref));
    crate::mutator::shade(new.map(to_gc_ref));
}

/// Immutable-after-construction handle. No store is ever offered, so no
/// barrier is needed on the handle itself; `T::scan` is responsible for
/// shading the held pointer like any other child when it is visited.
pub struct ScanConst<T: GarbageCollected> {
    ptr: Option<NonNull<T>>,
}

unsafe impl<T: GarbageCollected + Send> Send for ScanConst<T> {}
unsafe impl<T: GarbageCollected + Sync> Sync for ScanConst<T> {}

impl<T: GarbageCollected> ScanConst<T> {
    pub const fn new(ptr: Option<NonNull<T>>) -> Self {
        ScanConst { ptr }
    }

    #[inline(always)]
    pub fn load(&self) -> Option<NonNull<T>> {
        self.ptr
    }

    /// Convenience for `T::scan` overrides: the held child as a [`GcRef`].
    #[inline(always)]
    pub fn as_gc_ref(&self) -> Option<GcRef> {
        self.ptr.map(to_gc_ref)
    }
}

/// Single-writer atomic handle: one mutator thread owns the writes, the
/// collector only ever reads it during trace.
pub struct Scan<T: GarbageCollected> {
    ptr: AtomicPtr<T>,
}

unsafe impl<T: GarbageCollected + Send> Send for Scan<T> {}
unsafe impl<T: GarbageCollected + Sync> Sync for Scan<T> {}

impl<T: GarbageCollected> Scan<T> {
    pub fn new(ptr: Option<NonNull<T>>) -> Self {
        Scan {
            ptr: AtomicPtr::new(to_raw(ptr)),
        }
    }

    /// Load by the owning thread: relaxed, since the owner is the only
    /// writer and therefore already program-ordered with its own stores.
    #[inline(always)]
    pub fn load(&self) -> Option<NonNull<T>> {
        NonNull::new(self.ptr.load(Ordering::Relaxed))
    }

    /// Load used by the collector while tracing: acquire, to synchronise
    /// with the owning thread's release store.
    #[inline(always)]
    pub(crate) fn load_for_trace(&self) -> Option<NonNull<T>> {
        NonNull::new(self.ptr.load(Ordering::Acquire))
    }

    /// Barriered store: release-publish the new pointer, then shade both
    /// the overwritten and the newly-written value.
    pub fn store(&self, new: Option<NonNull<T>>) {
        let old = self.ptr.swap(to_raw(new), Ordering::Release);
        shade_both(old, new);
    }

    #[inline(always)]
    pub fn as_gc_ref(&self) -> Option<GcRef> {
        self.load_for_trace().map(to_gc_ref)
    }
}

/// Fully atomic, multi-writer handle.
pub struct AtomicScan<T: GarbageCollected> {
    ptr: AtomicPtr<T>,
}

unsafe impl<T: GarbageCollected + Send> Send for AtomicScan<T> {}
unsafe impl<T: GarbageCollected + Sync> Sync for AtomicScan<T> {}

impl<T: GarbageCollected> AtomicScan<T> {
    pub fn new(ptr: Option<NonNull<T>>) -> Self {
        AtomicScan {
            ptr: AtomicPtr::new(to_raw(ptr)),
        }
    }

    #[inline(always)]
    pub fn load(&self) -> Option<NonNull<T>> {
        NonNull::new(self.ptr.load(Ordering::Acquire))
    }

    pub fn store(&self, new: Option<NonNull<T>>) {
        let old = self.ptr.swap(to_raw(new), Ordering::AcqRel);
        shade_both(old, new);
    }

    /// Barriers both sides only when the exchange succeeds: a failed
    /// exchange observed no transition, so there is nothing to shade.
    pub fn compare_exchange(
        &self,
        current: Option<NonNull<T>>,
        new: Option<NonNull<T>>,
    ) -> Result<Option<NonNull<T>>, Option<NonNull<T>>> {
        match self.ptr.compare_exchange(
            to_raw(current),
            to_raw(new),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(old) => {
                shade_both(old, new);
                Ok(NonNull::new(old))
            }
            Err(actual) => Err(NonNull::new(actual)),
        }
    }

    #[inline(always)]
    pub fn as_gc_ref(&self) -> Option<GcRef> {
        self.load().map(to_gc_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{GcHeader, TracingContext};
    use std::sync::atomic::Ordering as O;

    struct Node {
        header: GcHeader,
    }

    unsafe impl GarbageCollected for Node {
        fn header(&self) -> &GcHeader {
            &self.header
        }
        fn scan(&self, _ctx: &mut TracingContext) {}
    }

    fn leak(color: Color) -> NonNull<Node> {
        let boxed = Box::new(Node {
            header: GcHeader::new(color),
        });
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    #[test]
    fn scan_const_is_a_plain_passthrough() {
        let target = leak(Color::WHITE);
        let handle = ScanConst::new(Some(target));
        assert_eq!(handle.load(), Some(target));
        assert!(handle.as_gc_ref().is_some());
    }

    #[test]
    fn scan_store_publishes_and_shades_both_sides() {
        let before = leak(Color::WHITE);
        let after = leak(Color::WHITE);
        let handle = Scan::new(Some(before));

        crate::mutator::set_local_allocation_color_for_test(Color::new(0b1));
        handle.store(Some(after));

        assert_eq!(handle.load(), Some(after));
        // both the overwritten and the newly-written object must have
        // been shaded with the active mask's grey bit.
        unsafe {
            assert!(before.as_ref().header().color.load(O::Relaxed).is_grey(0));
            assert!(after.as_ref().header().color.load(O::Relaxed).is_grey(0));
        }
    }

    #[test]
    fn atomic_scan_compare_exchange_shades_only_on_success() {
        let before = leak(Color::WHITE);
        let other = leak(Color::WHITE);
        let after = leak(Color::WHITE);
        let handle = AtomicScan::new(Some(before));

        crate::mutator::set_local_allocation_color_for_test(Color::new(0b1));

        let failed = handle.compare_exchange(Some(other), Some(after));
        assert!(failed.is_err());
        unsafe {
            assert!(after.as_ref().header().color.load(O::Relaxed).is_white(0));
        }

        let ok = handle.compare_exchange(Some(before), Some(after));
        assert!(ok.is_ok());
        unsafe {
            assert!(before.as_ref().header().color.load(O::Relaxed).is_grey(0));
            assert!(after.as_ref().header().color.load(O::Relaxed).is_grey(0));
        }
    }
}
