//! Epoch-based guard implementation using crossbeam-epoch.

use crossbeam_epoch::{self as epoch, Guard as CrossbeamGuard};
use std::ops::Deref;

use wordmap_core::Guard;

/// Epoch-based memory reclamation.
///
/// A zero-sized type; all state lives in the global epoch collector. The
/// instance stored inside a map only schedules destruction, so the map stays
/// `Send + Sync` for free. Deferred nodes are freed once every thread has
/// moved past the epoch in which they were retired.
#[derive(Clone, Copy, Default)]
pub struct EpochGuard;

/// A reference protected by the pinned epoch guard that observed it.
///
/// Holding the `EpochRef` keeps the thread pinned; reclamation of the value
/// (and of the entry that carries it) cannot run before the ref drops.
pub struct EpochRef<'a, T> {
    _guard: CrossbeamGuard,
    reference: &'a T,
}

impl<T> Deref for EpochRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.reference
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for EpochRef<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EpochRef({:?})", self.reference)
    }
}

impl<T: std::fmt::Display> std::fmt::Display for EpochRef<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reference)
    }
}

impl Guard for EpochGuard {
    /// A real crossbeam pin; dropping it lets the epoch advance.
    type ReadGuard = CrossbeamGuard;

    type GuardedRef<'a, T: 'a> = EpochRef<'a, T>;

    fn pin() -> Self::ReadGuard {
        epoch::pin()
    }

    unsafe fn defer_destroy<N>(&self, node: *mut N, dealloc: unsafe fn(*mut N)) {
        let guard = epoch::pin();
        // The node is unreachable by contract; it dies once all threads
        // pinned right now have unpinned.
        unsafe {
            guard.defer_unchecked(move || dealloc(node));
        }
    }

    unsafe fn make_ref<'a, T: 'a>(read: Self::ReadGuard, ptr: *const T) -> Self::GuardedRef<'a, T> {
        // Safety: ptr was loaded while `read` was pinned, so nothing can
        // reclaim it while `read` lives inside the returned wrapper.
        EpochRef {
            _guard: read,
            reference: unsafe { &*ptr },
        }
    }
}
