use std::marker::PhantomData;

use crate::guard::Guard;
use crate::map::entry::Entry;
use crate::map::sorted_list::live_from;

/// Ascending-key iterator over a map.
///
/// Holds a pinned read guard for its whole lifetime, which is what keeps the
/// entries it touches alive. This is a live traversal, not a snapshot:
/// entries inserted ahead of the cursor show up, entries deleted concurrently
/// are skipped, and an entry read just before its deletion may still be
/// yielded.
pub struct Iter<'a, V, G: Guard> {
    _read: G::ReadGuard,
    current: *mut Entry<V>,
    _marker: PhantomData<&'a V>,
}

impl<V, G: Guard> Iter<'_, V, G> {
    pub(crate) fn from_parts(read: G::ReadGuard, first: *mut Entry<V>) -> Self {
        Iter {
            _read: read,
            current: first,
            _marker: PhantomData,
        }
    }
}

impl<V: Clone, G: Guard> Iterator for Iter<'_, V, G> {
    // Values are cloned under the read guard; handing out references would
    // tie their lifetime to a guard the iterator needs to keep moving.
    type Item = (usize, V);

    fn next(&mut self) -> Option<(usize, V)> {
        // The cursor is parked on a raw successor; entries deleted since the
        // last step are skipped here rather than yielded stale.
        let entry = live_from(self.current);
        if entry.is_null() {
            self.current = entry;
            return None;
        }
        let e = unsafe { &*entry };
        let value = unsafe { (*e.value().load()).clone() };
        self.current = e.next();
        Some((e.key(), value))
    }
}
