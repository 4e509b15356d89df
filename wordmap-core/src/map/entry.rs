use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::map::marked_ptr::MarkedPtr;

/// An atomically swappable value cell.
///
/// The logical value lives on the heap behind an `AtomicPtr`; replacing it is
/// a pointer swap and comparing it for `cas` is a pointer compare-exchange.
/// The indirection stays inside this module, the public map API only ever
/// shows `&V`.
///
/// Ownership rule: the slot owns whatever pointer it currently holds. Every
/// pointer taken out of it (by `swap`, `compare_exchange` or `take`) moves
/// ownership to the caller, who either frees it directly (never published) or
/// defers it to a guard (possibly still visible to concurrent readers).
pub(crate) struct ValueSlot<V> {
    ptr: AtomicPtr<V>,
}

impl<V> ValueSlot<V> {
    pub(crate) fn new(value: V) -> Self {
        ValueSlot {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
        }
    }

    /// Load the current value pointer (Acquire).
    #[inline]
    pub(crate) fn load(&self) -> *mut V {
        self.ptr.load(Ordering::Acquire)
    }

    /// Replace the value, returning the previous pointer.
    #[inline]
    pub(crate) fn swap(&self, value: *mut V) -> *mut V {
        self.ptr.swap(value, Ordering::AcqRel)
    }

    /// CAS the value pointer. Failure returns the observed pointer.
    #[inline]
    pub(crate) fn compare_exchange(&self, expected: *mut V, new: *mut V) -> Result<*mut V, *mut V> {
        self.ptr
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Move the value pointer out, leaving the slot empty.
    ///
    /// Only valid on entries that were never linked into the list; a linked
    /// entry's slot must stay populated for concurrent readers.
    #[inline]
    pub(crate) fn take(&self) -> *mut V {
        self.ptr.swap(ptr::null_mut(), Ordering::Relaxed)
    }
}

impl<V> Drop for ValueSlot<V> {
    fn drop(&mut self) {
        let ptr = *self.ptr.get_mut();
        if !ptr.is_null() {
            // Owned exclusively at this point.
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }
}

/// Deallocation hook for replaced value payloads handed to a guard.
pub(crate) unsafe fn dealloc_value<V>(ptr: *mut V) {
    unsafe { drop(Box::from_raw(ptr)) };
}

/// A single list entry.
///
/// The key is immutable for the entry's lifetime. The value slot may be
/// replaced by `set` and `compare_and_swap`. The `next` link evolves
/// monotonically toward the correct successor and carries the delete flag in
/// its low bit.
pub(crate) struct Entry<V> {
    key: usize,
    value: ValueSlot<V>,
    next: AtomicPtr<Entry<V>>,
}

impl<V> Entry<V> {
    /// Allocate a new entry on the heap and return the raw pointer.
    pub(crate) fn alloc(key: usize, value: V) -> *mut Entry<V> {
        Box::into_raw(Box::new(Entry {
            key,
            value: ValueSlot::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Allocate the head sentinel. Its key and value are never read.
    pub(crate) fn alloc_sentinel() -> *mut Entry<V> {
        Box::into_raw(Box::new(Entry {
            key: 0,
            value: ValueSlot {
                ptr: AtomicPtr::new(ptr::null_mut()),
            },
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    #[inline]
    pub(crate) fn key(&self) -> usize {
        self.key
    }

    #[inline]
    pub(crate) fn value(&self) -> &ValueSlot<V> {
        &self.value
    }

    /// Load the raw `next` word, mark bit included (Acquire).
    #[inline]
    pub(crate) fn next_raw(&self) -> *mut Entry<V> {
        self.next.load(Ordering::Acquire)
    }

    /// The next entry in the list, mark stripped.
    #[inline]
    pub(crate) fn next(&self) -> *mut Entry<V> {
        MarkedPtr::unmask(self.next.load(Ordering::Acquire))
    }

    /// True once the entry has been logically deleted.
    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        MarkedPtr::new(self.next.load(Ordering::Acquire)).is_marked()
    }

    /// Store the `next` link (Release). Only used before the entry is linked.
    #[inline]
    pub(crate) fn set_next(&self, ptr: *mut Entry<V>) {
        self.next.store(ptr, Ordering::Release);
    }

    /// CAS the `next` word (Release/Relaxed).
    #[inline]
    pub(crate) fn cas_next(
        &self,
        expected: *mut Entry<V>,
        new: *mut Entry<V>,
    ) -> Result<*mut Entry<V>, *mut Entry<V>> {
        self.next
            .compare_exchange(expected, new, Ordering::Release, Ordering::Relaxed)
    }

    /// Deallocate an entry.
    ///
    /// # Safety
    /// - `ptr` must have been produced by `alloc`/`alloc_sentinel`
    /// - the entry must be unreachable from the list and the index
    /// - must only be called once per entry
    pub(crate) unsafe fn dealloc(ptr: *mut Entry<V>) {
        unsafe { drop(Box::from_raw(ptr)) };
    }
}
