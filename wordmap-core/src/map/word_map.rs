use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::guard::Guard;
use crate::map::entry::Entry;
use crate::map::index_table::IndexTable;
use crate::map::iter::Iter;
use crate::map::sorted_list::{find_live_from, next_live, AddResult, SortedList};
use crate::map::{DEFAULT_BUCKET_COUNT, MAX_FILL_RATE};

/// A lock-free concurrent map keyed by word-sized integers, optimised for
/// read-heavy workloads.
///
/// All live entries sit in one key-sorted lock-free list; a power-of-two
/// index table of atomic pointers shortcuts lookups to the right stretch of
/// that list. Every shared cell is an atomic word, there are no locks, and
/// readers never wait for writers.
///
/// The guard type `G` decides how unlinked entries, replaced values, and
/// superseded index tables get reclaimed. `DeferredGuard` parks everything
/// until the map drops (predictable, fine for tests); an epoch-based guard is
/// the production choice.
///
/// A fresh map owns no memory. The first write installs the list and an
/// 8-bucket table; the table doubles in the background whenever more than
/// half of its slots are occupied.
pub struct WordMap<V, G: Guard> {
    core: Arc<MapCore<V, G>>,
}

/// Shared state reachable from both the map handle and the resize worker.
///
/// `resizing` is the only coarse-grained exclusion in the map and it guards
/// exactly one thing: two resize protocols running at once. Ordinary
/// operations never take it and never wait on it.
struct MapCore<V, G: Guard> {
    /// Current index table; replaced wholesale by the resize protocol.
    index: AtomicPtr<IndexTable<V>>,
    /// The list; installed once by whichever writer gets there first.
    list: AtomicPtr<SortedList<V>>,
    /// 0 = idle, 1 = a resize owns the table pointer.
    resizing: AtomicUsize,
    guard: G,
}

unsafe impl<V: Send + Sync, G: Guard> Send for MapCore<V, G> {}
unsafe impl<V: Send + Sync, G: Guard> Sync for MapCore<V, G> {}

impl<V, G: Guard> MapCore<V, G> {
    fn empty() -> Self {
        MapCore {
            index: AtomicPtr::new(ptr::null_mut()),
            list: AtomicPtr::new(ptr::null_mut()),
            resizing: AtomicUsize::new(0),
            guard: G::default(),
        }
    }

    #[inline]
    fn table_ptr(&self) -> *mut IndexTable<V> {
        self.index.load(Ordering::Acquire)
    }

    #[inline]
    fn list_ptr(&self) -> *mut SortedList<V> {
        self.list.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        let list = self.list_ptr();
        if list.is_null() {
            0
        } else {
            unsafe { (*list).len() }
        }
    }

    /// Load the current table and the traversal hint for `key`.
    fn index_hint(&self, key: usize) -> (*mut IndexTable<V>, *mut Entry<V>) {
        let table = self.table_ptr();
        if table.is_null() {
            return (table, ptr::null_mut());
        }
        (table, unsafe { (*table).hint(key) })
    }

    /// First-write allocation.
    ///
    /// Installs the list (losing the race just discards the local copy; the
    /// pointer is set exactly once) and, when no table exists yet, runs a
    /// synchronous non-looping grow to `buckets`. The resize flag keeps this
    /// from clobbering a table a concurrent resize is about to publish.
    fn allocate(&self, buckets: usize) {
        if self.list_ptr().is_null() {
            let fresh = Box::into_raw(Box::new(SortedList::new()));
            if self
                .list
                .compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                unsafe { drop(Box::from_raw(fresh)) };
            }
        }

        if self.table_ptr().is_null()
            && self
                .resizing
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            if self.table_ptr().is_null() {
                self.grow_table(buckets, false);
            } else {
                self.resizing.store(0, Ordering::Release);
            }
        }
    }

    /// The resize protocol. Runs only while this thread owns the resize
    /// flag, and clears the flag on the way out.
    ///
    /// `requested` of 0 doubles the current table; anything else is rounded
    /// up to the next power of two. With `loop_mode` the protocol re-checks
    /// the freshly built table against the list length and keeps doubling
    /// until the fill rate drops to the threshold.
    fn grow_table(&self, requested: usize, loop_mode: bool) {
        let mut requested = requested;
        loop {
            let _read = G::pin();

            let current = self.table_ptr();
            let buckets = if requested == 0 {
                if current.is_null() {
                    DEFAULT_BUCKET_COUNT
                } else {
                    (unsafe { (*current).bucket_count() }) << 1
                }
            } else {
                requested.next_power_of_two()
            };

            let table = Box::into_raw(Box::new(IndexTable::with_buckets(buckets)));

            // First pass: seed the new table while lookups still go through
            // the old one.
            unsafe { self.rebuild(&*table) };

            let old = self.index.swap(table, Ordering::AcqRel);

            // Second pass, and not a redundant one. Writers that linked
            // entries between the first pass and the swap installed their
            // hints into the table that was visible to them, the outgoing
            // one. Walking the list again is what guarantees every live
            // entry has a hint in the table just published.
            unsafe { self.rebuild(&*table) };

            if !old.is_null() {
                unsafe { self.guard.defer_destroy(old, IndexTable::dealloc) };
            }

            if !loop_mode {
                break;
            }

            // The list may already be too big for the table we just built.
            if self.len() * 100 / buckets <= MAX_FILL_RATE {
                break;
            }
            requested = 0;
        }
        self.resizing.store(0, Ordering::Release);
    }

    /// One ordered walk of the list that installs the smallest-keyed live
    /// entry of every bucket into `table`.
    ///
    /// High-bit bucketing makes the walk visit buckets in ascending order,
    /// so the first entry seen for a bucket is its smallest key and one
    /// install per bucket suffices.
    ///
    /// # Safety
    /// The caller must hold a pinned read guard.
    unsafe fn rebuild(&self, table: &IndexTable<V>) {
        let list = self.list_ptr();
        if list.is_null() {
            return;
        }
        let first = unsafe { (*list).first() };
        let mut item = first;
        let mut last_bucket = 0;
        while !item.is_null() {
            let bucket = table.bucket_of(unsafe { (*item).key() });
            if item == first || bucket != last_bucket {
                table.install(item);
                last_bucket = bucket;
            }
            item = next_live(item);
        }
    }

    /// Drop `entry` out of the index on behalf of a deletion.
    ///
    /// A resize swapping the table mid-removal invalidates the attempt, so
    /// re-check the table pointer after each try. Once the pointer is stable
    /// the slot no longer names the entry; if a swap won instead, the
    /// post-swap rebuild has already installed the entry's successor (the
    /// entry itself is skipped there because it is marked).
    fn clear_index_hint(&self, entry: *mut Entry<V>) {
        loop {
            let table = self.table_ptr();
            if table.is_null() {
                return;
            }
            unsafe { (*table).try_unlink(entry) };
            if self.table_ptr() == table {
                return;
            }
        }
    }
}

impl<V, G: Guard> Drop for MapCore<V, G> {
    fn drop(&mut self) {
        let table = *self.index.get_mut();
        if !table.is_null() {
            unsafe { drop(Box::from_raw(table)) };
        }
        let list = *self.list.get_mut();
        if !list.is_null() {
            unsafe { drop(Box::from_raw(list)) };
        }
        // The guard field drops after this body and releases everything that
        // was deferred to it.
    }
}

impl<V, G> WordMap<V, G>
where
    V: Send + Sync + 'static,
    G: Guard,
{
    /// An empty map. Allocates nothing until the first write.
    pub fn new() -> Self {
        WordMap {
            core: Arc::new(MapCore::empty()),
        }
    }

    /// A map whose first table has `buckets` slots, rounded up to the next
    /// power of two. 0 means the default bucket count.
    pub fn with_capacity(buckets: usize) -> Self {
        let map = Self::new();
        let buckets = if buckets == 0 {
            DEFAULT_BUCKET_COUNT
        } else {
            buckets
        };
        map.core.allocate(buckets);
        map
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Occupied index slots divided by bucket count. Informational; this is
    /// the quantity the resize threshold is measured against.
    pub fn fill_rate(&self) -> f64 {
        let table = self.core.table_ptr();
        if table.is_null() {
            return 0.0;
        }
        let table = unsafe { &*table };
        table.filled() as f64 / table.bucket_count() as f64
    }

    /// Bucket count of the current index table (the fill-rate denominator),
    /// or 0 before the first allocation.
    pub fn capacity(&self) -> usize {
        let table = self.core.table_ptr();
        if table.is_null() {
            0
        } else {
            unsafe { (*table).bucket_count() }
        }
    }

    /// Whether a resize is currently running. Lookups and writes proceed
    /// normally during one; this exists so callers can await quiescence.
    pub fn resize_in_progress(&self) -> bool {
        self.core.resizing.load(Ordering::Acquire) != 0
    }

    /// Look up `key`. The returned reference is protected by the guard that
    /// observed it and stays valid for as long as the caller holds it.
    pub fn get(&self, key: usize) -> Option<G::GuardedRef<'_, V>> {
        let read = G::pin();
        let (table, hint) = self.core.index_hint(key);
        if table.is_null() {
            return None;
        }
        let entry = find_live_from(hint, key);
        if entry.is_null() {
            return None;
        }
        let value = unsafe { (*entry).value() }.load();
        Some(unsafe { G::make_ref(read, value) })
    }

    pub fn contains_key(&self, key: usize) -> bool {
        let _read = G::pin();
        let (table, hint) = self.core.index_hint(key);
        !table.is_null() && !find_live_from(hint, key).is_null()
    }

    /// Insert `key` if absent. Returns false, without overwriting, when a
    /// live entry with the key already exists.
    pub fn insert(&self, key: usize, value: V) -> bool {
        let entry = Entry::alloc(key, value);
        let _read = G::pin();
        if self.insert_entry(entry, false) {
            true
        } else {
            // Never linked; nothing else can see it.
            unsafe { Entry::dealloc(entry) };
            false
        }
    }

    /// Insert or overwrite. Afterwards a live entry with `key` holds
    /// `value`.
    pub fn set(&self, key: usize, value: V) {
        let entry = Entry::alloc(key, value);
        let _read = G::pin();
        self.insert_entry(entry, true);
    }

    /// Remove `key` if present. Idempotent.
    pub fn remove(&self, key: usize) {
        let _read = G::pin();
        let list = self.core.list_ptr();
        if list.is_null() {
            return;
        }
        let (_, hint) = self.core.index_hint(key);
        let entry = find_live_from(hint, key);
        if entry.is_null() {
            return;
        }
        self.core.clear_index_hint(entry);
        unsafe { (*list).delete(entry, hint, &self.core.guard) };
    }

    /// Replace the value under `key` only if the current value equals
    /// `expected`. Fails when the key is absent; never inserts.
    pub fn compare_and_swap(&self, key: usize, expected: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let _read = G::pin();
        let (table, hint) = self.core.index_hint(key);
        if table.is_null() {
            return false;
        }
        let list = self.core.list_ptr();
        if list.is_null() {
            return false;
        }
        unsafe { (*list).cas_value(key, hint, expected, new, &self.core.guard) }
    }

    /// Return the value under `key`, inserting `value` when the key is
    /// absent. The boolean is true when an existing value was loaded and
    /// false when `value` was stored.
    pub fn get_or_insert(&self, key: usize, value: V) -> (G::GuardedRef<'_, V>, bool) {
        let read = G::pin();
        // The candidate entry is built at most once and survives restarts.
        let mut pending: *mut Entry<V> = ptr::null_mut();
        let mut carried = Some(value);

        loop {
            let (table, hint) = self.core.index_hint(key);
            if table.is_null() {
                self.core.allocate(DEFAULT_BUCKET_COUNT);
                continue;
            }

            let existing = find_live_from(hint, key);
            if !existing.is_null() {
                if !pending.is_null() {
                    unsafe { Entry::dealloc(pending) };
                }
                let value = unsafe { (*existing).value() }.load();
                return (unsafe { G::make_ref(read, value) }, true);
            }

            let entry = match carried.take() {
                Some(value) => {
                    pending = Entry::alloc(key, value);
                    pending
                }
                None => pending,
            };
            if self.insert_entry(entry, false) {
                let value = unsafe { (*entry).value() }.load();
                return (unsafe { G::make_ref(read, value) }, false);
            }
            // Lost the race to a concurrent insert of the same key; loop
            // around and load whatever got there first.
        }
    }

    /// Request the index table be resized to at least `buckets` slots
    /// (rounded up to a power of two; 0 doubles the current size).
    ///
    /// Returns immediately; the work happens on a background worker. A no-op
    /// while another resize is already running.
    pub fn grow(&self, buckets: usize) {
        if self
            .core
            .resizing
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let core = Arc::clone(&self.core);
            thread::spawn(move || core.grow_table(buckets, true));
        }
    }

    /// Iterate entries in ascending key order. Not a snapshot; see [`Iter`].
    pub fn iter(&self) -> Iter<'_, V, G>
    where
        V: Clone,
    {
        let read = G::pin();
        let list = self.core.list_ptr();
        let first = if list.is_null() {
            ptr::null_mut()
        } else {
            unsafe { (*list).first() }
        };
        Iter::from_parts(read, first)
    }

    /// The retry loop shared by `insert`, `set` and `get_or_insert`.
    ///
    /// Two distinct retry causes flow through this loop and they are worth
    /// telling apart when diagnosing a spin: a missing table or list sends
    /// us through `allocate` (at most a handful of times, until the winner's
    /// allocation becomes visible), while `Restart`/false from the list
    /// means link-point interference and a stale hint, fixed by re-deriving
    /// the hint from the index on the next pass.
    fn insert_entry(&self, entry: *mut Entry<V>, update: bool) -> bool {
        let core = &*self.core;
        let key = unsafe { (*entry).key() };

        loop {
            let (table, hint) = core.index_hint(key);
            if table.is_null() {
                core.allocate(DEFAULT_BUCKET_COUNT);
                continue;
            }
            let list = core.list_ptr();
            if list.is_null() {
                // An explicit grow can install a table before any write
                // installs the list.
                core.allocate(DEFAULT_BUCKET_COUNT);
                continue;
            }
            let list = unsafe { &*list };

            // On the update path the husk entry dies inside the list call;
            // the index install must use whichever entry now carries the
            // value.
            let linked;
            if update {
                match list.add_or_update(entry, hint, &core.guard) {
                    Some(surviving) => linked = surviving,
                    None => continue,
                }
            } else {
                match list.add(entry, hint) {
                    AddResult::Existed => return false,
                    AddResult::Inserted => linked = entry,
                    AddResult::Restart => continue,
                }
            }

            // Install the hint, re-installing if a resize swapped tables
            // underneath (the mirror of the deletion-side re-check). Without
            // it, an entry linked just after the second rebuild pass walked
            // its position would leave its hint in the dead table only.
            let mut table = table;
            loop {
                let t = unsafe { &*table };
                let filled = t.install(linked);
                if filled != 0 && t.over_threshold(filled) {
                    self.trigger_grow();
                }
                let current = core.table_ptr();
                if current == table {
                    break;
                }
                table = current;
            }
            return true;
        }
    }

    fn trigger_grow(&self) {
        if self
            .core
            .resizing
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let core = Arc::clone(&self.core);
            thread::spawn(move || core.grow_table(0, true));
        }
    }
}

impl<V, G> Default for WordMap<V, G>
where
    V: Send + Sync + 'static,
    G: Guard,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, G> fmt::Debug for WordMap<V, G>
where
    V: Send + Sync + fmt::Debug + 'static,
    G: Guard,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _read = G::pin();
        let mut map = f.debug_map();
        let list = self.core.list_ptr();
        if !list.is_null() {
            let mut entry = unsafe { (*list).first() };
            while !entry.is_null() {
                let e = unsafe { &*entry };
                map.entry(&e.key(), unsafe { &*e.value().load() });
                entry = next_live(entry);
            }
        }
        map.finish()
    }
}

impl<V, G> FromIterator<(usize, V)> for WordMap<V, G>
where
    V: Send + Sync + 'static,
    G: Guard,
{
    fn from_iter<I: IntoIterator<Item = (usize, V)>>(iter: I) -> Self {
        let map = Self::new();
        for (key, value) in iter {
            map.set(key, value);
        }
        map
    }
}

impl<V, G> Extend<(usize, V)> for WordMap<V, G>
where
    V: Send + Sync + 'static,
    G: Guard,
{
    fn extend<I: IntoIterator<Item = (usize, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.set(key, value);
        }
    }
}
