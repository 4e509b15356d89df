//! Guard trait for memory reclamation strategies.
//!
//! The map never frees shared memory directly. Unlinked entries, replaced
//! values and superseded index tables are handed to a guard, which frees them
//! once no thread can still hold a pointer loaded from an atomic.
//!
//! Collections are generic over the strategy:
//!
//! ```text
//! WordMap<V, G: Guard>
//!     │
//!     ├── WordMap<V, EpochGuard>      epoch-based reclamation (production)
//!     └── WordMap<V, DeferredGuard>   everything parked until drop (tests)
//! ```

mod deferred_guard;

use std::ops::Deref;

pub use deferred_guard::{DeferredGuard, DeferredRef};

/// A memory reclamation strategy.
///
/// # Safety contract for implementations
///
/// 1. A pointer passed to `defer_destroy` is freed no earlier than the drop
///    of every `ReadGuard` pinned at the time of the call.
/// 2. `make_ref` keeps the referenced data valid for the returned wrapper's
///    lifetime by holding on to the read guard that observed the pointer.
///
/// The instance stored in a collection only schedules destruction; read
/// protection comes from the per-operation `pin()`.
pub trait Guard: Sized + Default + Send + Sync + 'static {
    /// An active guard protecting all reads for its lifetime.
    type ReadGuard;

    /// A reference bundled with the read guard that observed it.
    type GuardedRef<'a, T: 'a>: Deref<Target = T>;

    /// Pin the current thread. Every operation that follows pointers loaded
    /// from the map's atomics must hold one of these.
    fn pin() -> Self::ReadGuard;

    /// Schedule `node` for destruction once no reader can reach it.
    ///
    /// # Safety
    /// - `node` must be unreachable from the collection (unlinked or
    ///   replaced) by the time of the call
    /// - `dealloc` must be the matching deallocation function
    /// - each pointer may be deferred at most once
    unsafe fn defer_destroy<N>(&self, node: *mut N, dealloc: unsafe fn(*mut N));

    /// Bundle a pointer with the read guard under which it was loaded.
    ///
    /// # Safety
    /// `ptr` must have been loaded from the collection while `read` was
    /// already pinned.
    unsafe fn make_ref<'a, T: 'a>(read: Self::ReadGuard, ptr: *const T) -> Self::GuardedRef<'a, T>;
}
