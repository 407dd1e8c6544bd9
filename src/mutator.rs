//! Per-thread mutator state and the external `mutator_*` entry points
//! (design §4.2, §6).
//!
//! State is kept in two `thread_local!`s rather than the teacher's
//! nightly `#[thread_local]` statics (see design notes §9): the bag/shade
//! report auto-vivifies on first use so the write barrier works even
//! before `mutator_become` runs (the collector thread shades roots this
//! way without itself needing a name registered yet), while the session
//! handle is `None` until `mutator_become` is called.
use std::cell::RefCell;
use std::ptr::NonNull;

use crate::collector;
use crate::color::Color;
use crate::object::{self, shade_with_mask, GarbageCollected, GcRef};
use crate::session::{MutatorLocal, Session, SessionHandle};

thread_local! {
    static LOCAL: RefCell<MutatorLocal> = RefCell::new(MutatorLocal::default());
    static SESSION: RefCell<Option<SessionHandle>> = RefCell::new(None);
}

/// Registers the calling thread as a mutator: creates a [`Session`],
/// hands the collector its raw pointer via the entrant stack, and keeps
/// the owning half as this thread's handle.
pub fn mutator_become(name: impl Into<String>) {
    let name = name.into();
    let boxed = Session::new(name.clone());
    let raw: *mut Session = &*boxed as *const Session as *mut Session;
    collector::publish_entrant(raw);
    let handle = Session::into_handle(boxed);
    SESSION.with(|cell| {
        if cell.borrow().is_some() {
            crate::error::trap("mutator_become called twice on the same thread");
        }
        *cell.borrow_mut() = Some(handle);
    });
    log::info!("mutator '{name}' registered");
}

fn with_session<R>(caller: &str, f: impl FnOnce(&Session) -> R) -> R {
    SESSION.with(|cell| {
        let borrow = cell.borrow();
        let session = borrow
            .as_ref()
            .unwrap_or_else(|| crate::error::trap(&format!("{caller} called before mutator_become")));
        f(session)
    })
}

/// May publish the thread-local bag and shade report; always refreshes
/// the cached allocation palette. Must be called frequently (§5).
pub fn mutator_handshake() {
    let current = collector::current_color_for_allocation();
    with_session("mutator_handshake", |session| {
        LOCAL.with(|local| session.handshake(&mut local.borrow_mut(), current));
    });
}

/// Final publish; the session is queued for collector-side release.
/// Must be called exactly once per thread that called `mutator_become`.
pub fn mutator_resign() {
    with_session("mutator_resign", |session| {
        LOCAL.with(|local| session.resign(&mut local.borrow_mut()));
        log::info!("mutator '{}' resigned", session.name());
    });
    SESSION.with(|cell| *cell.borrow_mut() = None);
}

/// Allocates `value`, stamps it with the thread's cached allocation
/// color, and enrolls it in the thread-local bag for the next handshake.
pub fn alloc<T: GarbageCollected + 'static>(value: T) -> NonNull<T> {
    LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        let boxed = Box::new(value);
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) };
        unsafe {
            ptr.as_ref()
                .header()
                .color
                .store(local.color_for_allocation, std::sync::atomic::Ordering::Relaxed);
        }
        local.bag.push(object::to_gc_ref(ptr));
        ptr
    })
}

/// Applies the thread's currently cached shading mask to `target`,
/// folding any newly-raised bits into the report the next handshake
/// publishes. Called by every [`crate::scan::Scan`] barrier variant.
pub(crate) fn shade(target: Option<GcRef>) {
    LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        let mask = Color::new(local.color_for_allocation.low() as u64);
        let newly = shade_with_mask(target, mask);
        local.color_did_shade = local.color_did_shade.union(newly);
    });
}

#[cfg(test)]
pub(crate) fn set_local_allocation_color_for_test(color: Color) {
    LOCAL.with(|local| local.borrow_mut().color_for_allocation = color);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support;

    #[test]
    #[should_panic(expected = "mutator_handshake called before mutator_become")]
    fn handshake_before_become_traps() {
        // Runs in its own OS thread so it cannot observe another test's
        // registration via the thread-local session.
        std::thread::spawn(mutator_handshake).join().unwrap();
    }

    #[test]
    fn become_then_alloc_then_resign_round_trips() {
        std::thread::spawn(|| {
            mutator_become("t1");
            set_local_allocation_color_for_test(Color::new(0b1));
            let ptr = alloc(tests_support::leaf_for_mutator_tests());
            unsafe {
                assert!(ptr
                    .as_ref()
                    .header()
                    .color
                    .load(std::sync::atomic::Ordering::Relaxed)
                    .is_grey(0));
            }
            mutator_handshake();
            mutator_resign();
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "mutator_resign called before mutator_become")]
    fn resign_before_become_traps() {
        std::thread::spawn(mutator_resign).join().unwrap();
    }
}
