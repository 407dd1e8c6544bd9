//! Insertion-only lock-free ordered skiplist (design §4.6), built over the
//! [`crate::epoch`] allocator rather than the tricolor collector: it is
//! used by consumers that need an ordered, concurrently-readable set of
//! *non*-managed keys (work queues, interning tables) without paying for
//! a full GC-traced object per node.
//!
//! Nodes are never unlinked. Reclamation happens wholesale when the whole
//! [`SkipList`] is dropped, matching the design's "monotonically grows
//! until the epoch it was allocated in is reclaimed": a `Drop` impl has
//! unique ownership by construction, so no concurrent reader can still be
//! traversing a node by the time it runs, and nodes are freed directly
//! rather than through [`crate::epoch::retire`].
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use rand::Rng;

use crate::epoch::EpochGuard;

/// A node's maximum height. The design's head sentinel holds 33 forward
/// pointers; level 32 is the highest a `1 + ctz(u32)` draw can reach.
const MAX_HEIGHT: usize = 33;

/// Lets [`SkipList`] be reused for both a plain ordered set (`T = K`) and
/// an ordered map (`T = Entry<K, V>`, ordered on `K` alone) without
/// threading a separate comparator type through every method, mirroring
/// how `ConcurrentSkiplistMap` is "built atop the set by pairing `Key`
/// with a comparator that only orders on the key half" (§4.6).
pub trait SkipListKey {
    type Key: Ord;
    fn key(&self) -> &Self::Key;
}

impl<K: Ord> SkipListKey for K {
    type Key = K;
    fn key(&self) -> &K {
        self
    }
}

/// `(Key, Value)` pair whose ordering depends only on `Key`.
pub struct Entry<K, V>(pub K, pub V);

impl<K: Ord, V> SkipListKey for Entry<K, V> {
    type Key = K;
    fn key(&self) -> &K {
        &self.0
    }
}

struct Node<T> {
    value: T,
    next: Box<[AtomicPtr<Node<T>>]>,
}

impl<T> Node<T> {
    fn height(&self) -> usize {
        self.next.len()
    }
}

struct Head<T> {
    top: CachePadded<AtomicUsize>,
    next: Box<[AtomicPtr<Node<T>>]>,
}

impl<T> Head<T> {
    fn new() -> Self {
        Head {
            top: CachePadded::new(AtomicUsize::new(1)),
            next: (0..MAX_HEIGHT).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }
}

/// A position to read/link a forward pointer from: either the head
/// sentinel or a concrete node. Unifies the descent logic so `find` and
/// `try_emplace` don't need separate code paths for "started at the head"
/// vs. "stepped forward onto a node".
#[derive(Clone, Copy)]
enum Cursor<'a, T> {
    Head(&'a Head<T>),
    Node(&'a Node<T>),
}

impl<'a, T> Cursor<'a, T> {
    fn next_at(&self, level: usize) -> &'a AtomicPtr<Node<T>> {
        match self {
            Cursor::Head(head) => &head.next[level],
            Cursor::Node(node) => &node.next[level],
        }
    }
}

fn random_height() -> usize {
    let word: u32 = rand::thread_rng().gen();
    (1 + word.trailing_zeros() as usize).min(32)
}

/// Lock-free ordered set/map exemplar (design §4.6). `T` carries its own
/// ordering key via [`SkipListKey`]; use [`SkipList<K>`] directly for a
/// set of `K`, or [`SkipListMap<K, V>`] for an ordered map.
pub struct SkipList<T: SkipListKey> {
    head: Box<Head<T>>,
}

unsafe impl<T: SkipListKey + Send> Send for SkipList<T> {}
unsafe impl<T: SkipListKey + Sync> Sync for SkipList<T> {}

impl<T: SkipListKey> Default for SkipList<T> {
    fn default() -> Self {
        SkipList::new()
    }
}

impl<T: SkipListKey> SkipList<T> {
    pub fn new() -> Self {
        SkipList { head: Box::new(Head::new()) }
    }

    /// §4.6 `find`: descend from `top - 1`; at each level, step forward
    /// while the candidate's key is less than `key`, drop a level on
    /// null-or-greater, and return on an exact match.
    pub fn find(&self, key: &T::Key) -> Option<&T> {
        let _pin = EpochGuard::acquire();
        let mut level = self.head.top.load(Ordering::Relaxed) - 1;
        let mut cursor = Cursor::Head(&self.head);
        loop {
            let candidate = cursor.next_at(level).load(Ordering::Acquire);
            match unsafe { candidate.as_ref() } {
                None => {
                    if level == 0 {
                        return None;
                    }
                    level -= 1;
                }
                Some(node) => {
                    if node.value.key() < key {
                        cursor = Cursor::Node(node);
                    } else if key < node.value.key() {
                        if level == 0 {
                            return None;
                        }
                        level -= 1;
                    } else {
                        return Some(&node.value);
                    }
                }
            }
        }
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.find(key).is_some()
    }

    /// Descends from the current `top` down to (and including)
    /// `target_level`, returning the rightmost cursor at that level whose
    /// next pointer is either null or points past `key`. Shared by
    /// `try_emplace`'s per-level insertion-point search.
    fn find_predecessor(&self, target_level: usize, key: &T::Key) -> Cursor<'_, T> {
        let top = self.head.top.load(Ordering::Relaxed);
        let mut level = top.saturating_sub(1).max(target_level);
        let mut cursor = Cursor::Head(&self.head);
        loop {
            let next = cursor.next_at(level).load(Ordering::Acquire);
            if let Some(node) = unsafe { next.as_ref() } {
                if node.value.key() < key {
                    cursor = Cursor::Node(node);
                    continue;
                }
            }
            if level == target_level {
                return cursor;
            }
            level -= 1;
        }
    }

    /// §4.6 `try_emplace`. Finds the bottom-level insertion point,
    /// speculatively builds a new node, and CAS-links it; a lost race
    /// (another thread linked a node at that spot first) restarts the
    /// bottom-level search rather than trying to repair in place, trading
    /// a little redundant work for a much simpler, still wait-free-per-
    /// level algorithm. Once level 0 is linked, every level above walks
    /// up, CAS-linking the node in turn: "every node, once linked at
    /// level L, is linked at all lower levels first" holds because level
    /// 0 always links before the loop over `1..height` begins.
    pub fn try_emplace(&self, mut value: T) -> (&T, bool)
    where
        T: 'static,
    {
        let _pin = EpochGuard::acquire();
        let mut node_ptr = loop {
            let left0 = self.find_predecessor(0, value.key());
            let expected = left0.next_at(0).load(Ordering::Acquire);
            if let Some(existing) = unsafe { expected.as_ref() } {
                if existing.value.key() == value.key() {
                    return (&existing.value, false);
                }
            }
            let height = random_height();
            let boxed = Box::new(Node {
                value,
                next: (0..height).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            });
            let candidate = crate::epoch::alloc(*boxed);
            unsafe { candidate.as_ref().next[0].store(expected, Ordering::Relaxed) };
            match left0
                .next_at(0)
                .compare_exchange(expected, candidate.as_ptr(), Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break candidate,
                Err(_) => {
                    // Lost the race. Recover `value` out of the node we
                    // speculatively built and retry from scratch; nothing
                    // observed this node, so a direct free is sound.
                    let recovered = unsafe { Box::from_raw(candidate.as_ptr()) };
                    value = recovered.value;
                    continue;
                }
            }
        };
        let height = unsafe { node_ptr.as_ref().height() };
        for level in 1..height {
            loop {
                let left = self.find_predecessor(level, unsafe { node_ptr.as_ref().value.key() });
                let expected = left.next_at(level).load(Ordering::Acquire);
                unsafe { node_ptr.as_ref().next[level].store(expected, Ordering::Release) };
                if left
                    .next_at(level)
                    .compare_exchange(expected, node_ptr.as_ptr(), Ordering::Release, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
        self.head.top.fetch_max(height, Ordering::Relaxed);
        (unsafe { &node_ptr.as_mut().value }, true)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: unsafe { self.head.next[0].load(Ordering::Acquire).as_ref() },
        }
    }
}

pub struct Iter<'a, T> {
    current: Option<&'a Node<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let node = self.current?;
        self.current = unsafe { node.next[0].load(Ordering::Acquire).as_ref() };
        Some(&node.value)
    }
}

impl<T: SkipListKey> Drop for SkipList<T> {
    fn drop(&mut self) {
        let mut current = *self.head.next[0].get_mut();
        while let Some(node) = unsafe { current.as_mut() } {
            let next = *node.next[0].get_mut();
            unsafe { drop(Box::from_raw(current)) };
            current = next;
        }
    }
}

/// Ordered map built atop [`SkipList`] by storing `Entry<K, V>` nodes,
/// whose [`SkipListKey`] impl orders on `K` alone (§4.6).
pub struct SkipListMap<K, V> {
    set: SkipList<Entry<K, V>>,
}

impl<K: Ord, V> Default for SkipListMap<K, V> {
    fn default() -> Self {
        SkipListMap { set: SkipList::new() }
    }
}

impl<K: Ord + 'static, V: 'static> SkipListMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &K) -> Option<&V> {
        self.set.find(key).map(|entry| &entry.1)
    }

    pub fn try_emplace(&self, key: K, value: V) -> (&V, bool) {
        let (entry, inserted) = self.set.try_emplace(Entry(key, value));
        (&entry.1, inserted)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.set.iter().map(|entry| (&entry.0, &entry.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn find_returns_none_on_empty_list() {
        let list: SkipList<i32> = SkipList::new();
        assert!(!list.contains(&5));
    }

    #[test]
    fn emplace_then_find_round_trips() {
        let list: SkipList<i32> = SkipList::new();
        for k in [5, 1, 9, 3, 7] {
            let (_, inserted) = list.try_emplace(k);
            assert!(inserted);
        }
        for k in [5, 1, 9, 3, 7] {
            assert!(list.contains(&k));
        }
        assert!(!list.contains(&42));
    }

    #[test]
    fn re_emplacing_an_existing_key_reports_not_inserted() {
        let list: SkipList<i32> = SkipList::new();
        assert!(list.try_emplace(1).1);
        assert!(!list.try_emplace(1).1);
    }

    #[test]
    fn iteration_is_in_ascending_order() {
        let list: SkipList<i32> = SkipList::new();
        for k in [5, 1, 9, 3, 7] {
            list.try_emplace(k);
        }
        let collected: Vec<i32> = list.iter().copied().collect();
        let mut sorted = collected.clone();
        sorted.sort();
        assert_eq!(collected, sorted);
    }

    #[test]
    fn map_orders_on_key_and_keeps_first_value_on_collision() {
        let map: SkipListMap<i32, &'static str> = SkipListMap::new();
        assert!(map.try_emplace(1, "one").1);
        let (value, inserted) = map.try_emplace(1, "uno");
        assert!(!inserted);
        assert_eq!(*value, "one");
        assert_eq!(map.find(&1), Some(&"one"));
    }

    // S4: several threads each insert many distinct random integers;
    // after quiescence, every inserted key is found and no others are.
    #[test]
    fn s4_concurrent_inserts_are_all_findable() {
        let list: Arc<SkipList<u32>> = Arc::new(SkipList::new());
        let thread_count = 4usize;
        let per_thread = 2_000u32;

        let mut expected = HashSet::new();
        std::thread::scope(|scope| {
            for t in 0..thread_count {
                let list = list.clone();
                scope.spawn(move || {
                    for i in 0..per_thread {
                        let key = (t as u32) * per_thread + i;
                        list.try_emplace(key);
                    }
                });
            }
        });
        for t in 0..thread_count {
            for i in 0..per_thread {
                expected.insert((t as u32) * per_thread + i);
            }
        }

        for &key in &expected {
            assert!(list.contains(&key), "missing inserted key {key}");
        }
        assert!(!list.contains(&(thread_count as u32 * per_thread + 1)));
    }
}
