use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::guard::Guard;
use crate::map::entry::{dealloc_value, Entry};
use crate::map::marked_ptr::MarkedPtr;

// Key-sorted lock-free singly linked list, in the style of Harris's
// 'A Pragmatic Implementation of Non-Blocking Linked-Lists'.
//
// List structure (sorted ascending by key):
// ┌──────┐    ┌──────┐    ┌──────┐    ┌──────┐    ┌──────┐
// │ HEAD │───►│  10  │───►│  20  │───►│  30  │───►│ NULL │
// │(sent)│    │      │    │      │    │      │    │      │
// └──────┘    └──────┘    └──────┘    └──────┘    └──────┘
//
// The mark bit on entry.next means the ENTRY is logically deleted.
//
// INVARIANTS:
// 1. Keys are strictly increasing along next links.
// 2. No two live entries share a key.
// 3. A marked entry must be physically unlinked before it is handed to the
//    guard. A later reader pins after the handoff and would otherwise still
//    be able to reach the freed entry through the list.
// 4. The HEAD sentinel is never marked or removed.
//
// DELETE is two-phase:
//   Phase 1: mark entry.next (logical delete, the linearisation point)
//   Phase 2: CAS pred.next from entry to entry's successor (physical unlink)
//
// When the phase-2 CAS fails, pred.next has moved:
//   - pred itself got marked: restart the traversal to find a live pred
//   - a new entry was linked between pred and entry: advance and retry
//   - another thread already snipped entry: nothing left to do
// Traversals tell these apart by key comparison against the dead entry's key:
// once the walk passes a larger key (or the end), the entry is gone.
//
// Traversal starts are hints, not trusted positions. Any hint that is null,
// marked, or at/past the target key falls back to HEAD.

/// Bounded link retries before the caller must re-derive its hint.
const LINK_RETRY_LIMIT: usize = 4;

/// Outcome of a keyed insertion attempt.
pub(crate) enum AddResult {
    /// A live entry with the key is already present; nothing was linked.
    Existed,
    /// The new entry is now linked into the list.
    Inserted,
    /// Repeated interference at the link point; the hint is stale and the
    /// caller should re-derive it before trying again.
    Restart,
}

/// A search position: `pred` is the last entry strictly below the key,
/// `curr` the first live entry at or above it (null at the end of the list).
struct Location<V> {
    pred: *mut Entry<V>,
    curr: *mut Entry<V>,
}

pub(crate) struct SortedList<V> {
    head: *mut Entry<V>,
    count: AtomicUsize,
}

unsafe impl<V: Send + Sync> Send for SortedList<V> {}
unsafe impl<V: Send + Sync> Sync for SortedList<V> {}

/// Walk raw links from `start` looking for a live entry with `key`.
///
/// Read-only: dead entries are stepped over, never snipped. Returns null as
/// soon as the walk passes a key greater than the target, which is what makes
/// hint-based lookups O(bucket chain) instead of O(list).
pub(crate) fn find_live_from<V>(start: *mut Entry<V>, key: usize) -> *mut Entry<V> {
    let mut curr = start;
    while !curr.is_null() {
        let entry = unsafe { &*curr };
        let next = entry.next_raw();
        if entry.key() == key {
            if !MarkedPtr::new(next).is_marked() {
                return curr;
            }
        } else if entry.key() > key {
            return ptr::null_mut();
        }
        curr = MarkedPtr::unmask(next);
    }
    ptr::null_mut()
}

/// First live entry at or after `start` (raw pointer walk, skips dead ones).
pub(crate) fn live_from<V>(start: *mut Entry<V>) -> *mut Entry<V> {
    let mut curr = start;
    while !curr.is_null() {
        let next = unsafe { (*curr).next_raw() };
        if !MarkedPtr::new(next).is_marked() {
            return curr;
        }
        curr = MarkedPtr::unmask(next);
    }
    ptr::null_mut()
}

/// The live successor of `entry`.
pub(crate) fn next_live<V>(entry: *mut Entry<V>) -> *mut Entry<V> {
    live_from(unsafe { (*entry).next() })
}

impl<V> SortedList<V> {
    pub(crate) fn new() -> Self {
        SortedList {
            head: Entry::alloc_sentinel(),
            count: AtomicUsize::new(0),
        }
    }

    /// Number of live entries. This is the authoritative map length.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// The smallest-keyed live entry, or null.
    pub(crate) fn first(&self) -> *mut Entry<V> {
        live_from(unsafe { (*self.head).next() })
    }

    /// Link `new` into the list unless its key is already present.
    ///
    /// Searches forward from `hint` (falling back to HEAD when the hint is
    /// null, dead, or not strictly below the key). A bounded number of failed
    /// link attempts yields `Restart` so the caller can fetch a fresh hint
    /// instead of spinning on a stale one.
    pub(crate) fn add(&self, new: *mut Entry<V>, hint: *mut Entry<V>) -> AddResult {
        let key = unsafe { (*new).key() };

        // A live hint carrying the key is already proof of existence.
        if !hint.is_null() {
            let h = unsafe { &*hint };
            if h.key() == key && !h.is_deleted() {
                return AddResult::Existed;
            }
        }

        for _ in 0..LINK_RETRY_LIMIT {
            let loc = self.locate(key, hint);
            if !loc.curr.is_null() && unsafe { (*loc.curr).key() } == key {
                return AddResult::Existed;
            }
            unsafe { (*new).set_next(loc.curr) };
            if unsafe { (*loc.pred).cas_next(loc.curr, new) }.is_ok() {
                self.count.fetch_add(1, Ordering::Relaxed);
                return AddResult::Inserted;
            }
            // Concurrent mutation at the link point, search again from the hint.
        }
        AddResult::Restart
    }

    /// Like `add`, but a matching live entry has its value replaced by the
    /// payload of `new` instead of failing.
    ///
    /// On success `new` is consumed (either linked in, or reduced to a husk
    /// and freed after its payload moved into the existing entry) and the
    /// entry now carrying the payload is returned, for the caller to hand to
    /// the index. `None` means concurrent interference exhausted the retry
    /// bound; the caller keeps ownership of `new` and must restart with a
    /// fresh hint.
    pub(crate) fn add_or_update<G: Guard>(
        &self,
        new: *mut Entry<V>,
        hint: *mut Entry<V>,
        guard: &G,
    ) -> Option<*mut Entry<V>> {
        let key = unsafe { (*new).key() };

        for _ in 0..LINK_RETRY_LIMIT {
            let loc = self.locate(key, hint);
            if !loc.curr.is_null() && unsafe { (*loc.curr).key() } == key {
                let curr = unsafe { &*loc.curr };
                if curr.is_deleted() {
                    // Lost to a racing delete between locate's recheck and
                    // here; the next locate pass snips it and we link fresh.
                    continue;
                }
                let payload = unsafe { (*new).value().take() };
                let old = curr.value().swap(payload);
                unsafe {
                    guard.defer_destroy(old, dealloc_value);
                    Entry::dealloc(new);
                }
                return Some(loc.curr);
            }
            unsafe { (*new).set_next(loc.curr) };
            if unsafe { (*loc.pred).cas_next(loc.curr, new) }.is_ok() {
                self.count.fetch_add(1, Ordering::Relaxed);
                return Some(new);
            }
        }
        None
    }

    /// Compare-and-swap the value of the live entry with `key`.
    ///
    /// Fails without retry: when the key is absent, when the current value
    /// does not equal `expected`, or when the slot moved under us. A failed
    /// compare is an outcome, not interference. Never inserts.
    pub(crate) fn cas_value<G: Guard>(
        &self,
        key: usize,
        hint: *mut Entry<V>,
        expected: &V,
        new: V,
        guard: &G,
    ) -> bool
    where
        V: PartialEq,
    {
        let start = if hint.is_null() {
            unsafe { (*self.head).next() }
        } else {
            hint
        };
        let entry = find_live_from(start, key);
        if entry.is_null() {
            return false;
        }

        let slot = unsafe { (*entry).value() };
        let current = slot.load();
        if unsafe { &*current } != expected {
            return false;
        }

        let replacement = Box::into_raw(Box::new(new));
        match slot.compare_exchange(current, replacement) {
            Ok(old) => {
                unsafe { guard.defer_destroy(old, dealloc_value) };
                true
            }
            Err(_) => {
                // The slot moved between the compare and the exchange.
                unsafe { drop(Box::from_raw(replacement)) };
                false
            }
        }
    }

    /// Logically delete `entry`, then physically unlink it.
    ///
    /// Returns false if another thread already owns the deletion, which makes
    /// repeated deletes of the same entry idempotent. On success the entry is
    /// confirmed unreachable before it is handed to the guard.
    pub(crate) fn delete<G: Guard>(
        &self,
        entry: *mut Entry<V>,
        hint: *mut Entry<V>,
        guard: &G,
    ) -> bool {
        let e = unsafe { &*entry };
        loop {
            let next = e.next_raw();
            let marked = MarkedPtr::new(next);
            if marked.is_marked() {
                return false;
            }
            if e.cas_next(next, marked.marked().as_raw()).is_ok() {
                self.count.fetch_sub(1, Ordering::Relaxed);
                self.unlink(entry, hint);
                unsafe { guard.defer_destroy(entry, Entry::dealloc) };
                return true;
            }
            // next moved (a concurrent insert behind us, or a racing delete);
            // reload and try the mark again.
        }
    }

    /// Physically unlink a marked entry, looping until it is confirmed gone.
    ///
    /// Completion before return is what invariant 3 above demands; deferring
    /// a still-reachable entry would let a freshly pinned reader walk into
    /// freed memory.
    fn unlink(&self, entry: *mut Entry<V>, hint: *mut Entry<V>) {
        let key = unsafe { (*entry).key() };

        'restart: loop {
            let mut pred = self.unlink_start(hint, entry, key);
            let mut curr = unsafe { (*pred).next() };

            loop {
                if curr.is_null() {
                    // End of list without meeting the entry: already gone.
                    return;
                }
                let c = unsafe { &*curr };
                let next = MarkedPtr::new(c.next_raw());

                if next.is_marked() {
                    // Snip whatever dead entry sits in the way; if it is ours
                    // the unlink is complete.
                    let target = curr == entry;
                    if unsafe { (*pred).cas_next(curr, next.as_ptr()) }.is_err() {
                        continue 'restart;
                    }
                    if target {
                        return;
                    }
                    curr = next.as_ptr();
                } else {
                    if c.key() > key {
                        // Walked past the position: another thread finished
                        // the unlink for us.
                        return;
                    }
                    pred = curr;
                    curr = next.as_ptr();
                }
            }
        }
    }

    fn unlink_start(&self, hint: *mut Entry<V>, entry: *mut Entry<V>, key: usize) -> *mut Entry<V> {
        if hint.is_null() || hint == entry {
            return self.head;
        }
        let h = unsafe { &*hint };
        if h.is_deleted() || h.key() >= key {
            return self.head;
        }
        hint
    }

    /// Write-path search with cleanup.
    ///
    /// Walks from the hint (or HEAD), snipping every marked entry it meets,
    /// and returns the first live entry at or above `key` together with its
    /// predecessor. A failed snip means the predecessor itself moved or died,
    /// so the whole walk restarts.
    fn locate(&self, key: usize, hint: *mut Entry<V>) -> Location<V> {
        'restart: loop {
            let mut pred = self.locate_start(hint, key);
            let mut curr = unsafe { (*pred).next() };

            loop {
                if curr.is_null() {
                    return Location {
                        pred,
                        curr: ptr::null_mut(),
                    };
                }
                let c = unsafe { &*curr };
                let next = MarkedPtr::new(c.next_raw());

                if next.is_marked() {
                    if unsafe { (*pred).cas_next(curr, next.as_ptr()) }.is_err() {
                        continue 'restart;
                    }
                    curr = next.as_ptr();
                } else if c.key() >= key {
                    // Position found; make sure curr did not die while we
                    // were looking at it.
                    if c.is_deleted() {
                        continue 'restart;
                    }
                    return Location { pred, curr };
                } else {
                    pred = curr;
                    curr = next.as_ptr();
                }
            }
        }
    }

    fn locate_start(&self, hint: *mut Entry<V>, key: usize) -> *mut Entry<V> {
        if hint.is_null() {
            return self.head;
        }
        let h = unsafe { &*hint };
        // A usable hint must be live and strictly below the key, otherwise it
        // cannot serve as a predecessor.
        if h.is_deleted() || h.key() >= key {
            return self.head;
        }
        hint
    }
}

impl<V> Drop for SortedList<V> {
    fn drop(&mut self) {
        // Exclusive access: free every entry still linked, sentinel included.
        // Deleted entries were unlinked before being deferred, so nothing
        // reachable here is owned by a guard.
        let mut curr = self.head;
        while !curr.is_null() {
            let next = unsafe { (*curr).next() };
            debug_assert!(
                curr == self.head || unsafe { !(*curr).is_deleted() },
                "deleted entry still linked at drop"
            );
            unsafe { Entry::dealloc(curr) };
            curr = next;
        }
    }
}
