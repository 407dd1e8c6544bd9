//! Minimal leaf `GarbageCollected` type shared by unit tests across
//! modules. Intentionally leaks its allocation: these tests exercise
//! bags/sessions/palette logic in isolation, not full collector-driven
//! reclamation (that is covered by the integration scenarios in
//! `collector.rs`).
use crate::color::Color;
use crate::object::{GarbageCollected, GcHeader, GcRef, TracingContext};

pub(crate) struct Leaf {
    header: GcHeader,
}

unsafe impl GarbageCollected for Leaf {
    fn header(&self) -> &GcHeader {
        &self.header
    }

    fn scan(&self, _ctx: &mut TracingContext) {}
}

pub(crate) fn dummy_ref() -> GcRef {
    dummy_ref_with_color(Color::WHITE)
}

pub(crate) fn dummy_ref_with_color(color: Color) -> GcRef {
    let boxed: Box<dyn GarbageCollected> = Box::new(Leaf {
        header: GcHeader::new(color),
    });
    unsafe { GcRef::new_unchecked(Box::into_raw(boxed)) }
}

/// A concrete, `Sized` leaf value for tests that need to go through
/// `mutator::alloc<T>` directly rather than a pre-boxed [`GcRef`].
pub(crate) fn leaf_for_mutator_tests() -> Leaf {
    Leaf {
        header: GcHeader::new(Color::WHITE),
    }
}
