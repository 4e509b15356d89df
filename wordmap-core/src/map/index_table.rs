use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::map::entry::Entry;
use crate::map::MAX_FILL_RATE;

/// The hash index: a power-of-two array of atomic shortcuts into the list.
///
/// Bucketing uses the HIGH bits of the key: `bucket = key >> shift` with
/// `shift = usize::BITS - log2(len)`. High-bit buckets are order-preserving
/// (`bucket(a) <= bucket(b)` whenever `a <= b`), so one ascending walk of the
/// list visits buckets in order. That is what lets a rebuild place the
/// smallest-keyed entry of every bucket in a single pass, and it must not be
/// swapped for low-bit masking.
///
/// Slot contract: a non-null slot points at the smallest-keyed live entry of
/// its bucket. The pointer is a traversal hint, not necessarily the entry a
/// lookup wants, and may go stale the instant after it is loaded; stale hints
/// cost extra walking, never correctness.
///
/// `filled` counts slots that have transitioned null to non-null. The fill
/// rate (filled slots over bucket count) is what drives resize decisions.
pub(crate) struct IndexTable<V> {
    shift: u32,
    filled: AtomicUsize,
    slots: Box<[AtomicPtr<Entry<V>>]>,
}

impl<V> IndexTable<V> {
    /// Allocate a table with `buckets` slots. `buckets` must be a power of
    /// two.
    pub(crate) fn with_buckets(buckets: usize) -> Self {
        debug_assert!(buckets.is_power_of_two());
        let slots = (0..buckets)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        IndexTable {
            shift: usize::BITS - buckets.trailing_zeros(),
            filled: AtomicUsize::new(0),
            slots,
        }
    }

    #[inline]
    pub(crate) fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn shift(&self) -> u32 {
        self.shift
    }

    #[inline]
    pub(crate) fn bucket_of(&self, key: usize) -> usize {
        key >> self.shift
    }

    /// Filled-slot count.
    #[inline]
    pub(crate) fn filled(&self) -> usize {
        self.filled.load(Ordering::Relaxed)
    }

    /// Load the traversal hint for `key`.
    #[inline]
    pub(crate) fn hint(&self, key: usize) -> *mut Entry<V> {
        self.slots[self.bucket_of(key)].load(Ordering::Acquire)
    }

    /// Install `entry` as its bucket's hint if it would become the
    /// smallest-keyed entry there.
    ///
    /// Returns the new filled-slot count when a null slot was claimed, and 0
    /// otherwise. Only the null-to-entry transition counts; replacing a
    /// larger-keyed hint changes nothing about how full the table is.
    pub(crate) fn install(&self, entry: *mut Entry<V>) -> usize {
        let key = unsafe { (*entry).key() };
        let slot = &self.slots[self.bucket_of(key)];

        loop {
            let current = slot.load(Ordering::Acquire);
            if current.is_null() {
                if slot
                    .compare_exchange(current, entry, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    return self.filled.fetch_add(1, Ordering::Relaxed) + 1;
                }
                // Another entry claimed the slot first, compare against it.
                continue;
            }
            if key < unsafe { (*current).key() } {
                if slot
                    .compare_exchange(current, entry, Ordering::Release, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
            }
            return 0;
        }
    }

    /// One attempt at clearing `entry` out of its bucket's slot.
    ///
    /// The replacement is the entry's successor when that successor still
    /// lands in the same bucket, otherwise null. A lost CAS is fine: the slot
    /// already moved on to a different entry. Re-running while the owning
    /// table is still current is the caller's job; once the table has been
    /// swapped out, the post-swap rebuild repairs the slot instead.
    pub(crate) fn try_unlink(&self, entry: *mut Entry<V>) {
        let key = unsafe { (*entry).key() };
        let bucket = self.bucket_of(key);
        let slot = &self.slots[bucket];

        let mut next = unsafe { (*entry).next() };
        if !next.is_null() && self.bucket_of(unsafe { (*next).key() }) != bucket {
            next = ptr::null_mut();
        }
        let _ = slot.compare_exchange(entry, next, Ordering::Release, Ordering::Relaxed);
    }

    /// Whether a filled-slot count (as returned by `install`) puts the table
    /// over the resize threshold.
    #[inline]
    pub(crate) fn over_threshold(&self, count: usize) -> bool {
        count * 100 / self.slots.len() > MAX_FILL_RATE
    }

    /// Deallocation hook for tables handed to a guard after a resize swap.
    pub(crate) unsafe fn dealloc(ptr: *mut IndexTable<V>) {
        unsafe { drop(Box::from_raw(ptr)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::DEFAULT_BUCKET_COUNT;

    #[test]
    fn test_shift_matches_bucket_count() {
        for buckets in [2usize, 8, 64, 1024] {
            let table: IndexTable<u32> = IndexTable::with_buckets(buckets);
            assert_eq!(table.shift(), usize::BITS - buckets.trailing_zeros());
            assert_eq!(1usize << (usize::BITS - table.shift()), buckets);
        }
    }

    #[test]
    fn test_high_bit_bucketing_preserves_order() {
        let table: IndexTable<u32> = IndexTable::with_buckets(64);
        let w = usize::BITS as usize;
        let low = 1usize << (w - 6);
        let high = 3usize << (w - 6);
        assert!(table.bucket_of(low) < table.bucket_of(high));
        assert_eq!(table.bucket_of(0), 0);
        assert_eq!(table.bucket_of(usize::MAX), 63);
    }

    #[test]
    fn test_install_keeps_smallest_key() {
        let table: IndexTable<u32> = IndexTable::with_buckets(DEFAULT_BUCKET_COUNT);
        let w = usize::BITS as usize;

        // Both keys land in bucket 1 of an 8 slot table.
        let big = Entry::alloc(1usize << (w - 3) | 500, 0);
        let small = Entry::alloc(1usize << (w - 3) | 2, 0);

        assert_eq!(table.install(big), 1);
        assert_eq!(table.filled(), 1);
        // Smaller key replaces the hint but does not change the fill count.
        assert_eq!(table.install(small), 0);
        assert_eq!(table.hint(1usize << (w - 3)), small);
        // Re-installing the larger key leaves the smaller hint in place.
        assert_eq!(table.install(big), 0);
        assert_eq!(table.hint(1usize << (w - 3)), small);

        unsafe {
            Entry::dealloc(big);
            Entry::dealloc(small);
        }
    }

    #[test]
    fn test_try_unlink_same_bucket_successor() {
        let table: IndexTable<u32> = IndexTable::with_buckets(DEFAULT_BUCKET_COUNT);
        let w = usize::BITS as usize;
        let base = 1usize << (w - 3);

        let first = Entry::alloc(base, 0);
        let second = Entry::alloc(base + 1, 0);
        let foreign = Entry::alloc(2usize << (w - 3), 0);
        unsafe {
            (*first).set_next(second);
            (*second).set_next(foreign);
        }

        table.install(first);
        table.try_unlink(first);
        // Successor shares the bucket, so it becomes the new hint.
        assert_eq!(table.hint(base), second);

        table.try_unlink(second);
        // Successor lives in a different bucket, so the slot empties.
        assert!(table.hint(base).is_null());

        unsafe {
            Entry::dealloc(first);
            Entry::dealloc(second);
            Entry::dealloc(foreign);
        }
    }

    #[test]
    fn test_over_threshold() {
        let table: IndexTable<u32> = IndexTable::with_buckets(8);
        assert!(!table.over_threshold(0));
        assert!(!table.over_threshold(4));
        assert!(table.over_threshold(5));
    }
}
