//! Deferred guard implementation for testing.

use std::ops::Deref;
use std::sync::Mutex;

use super::Guard;

/// A guard that parks every deferred destruction until it is dropped.
///
/// Destruction timing is fully predictable, which is what the test suites
/// want, and reads need no per-operation pinning because nothing is ever
/// freed while the owning collection is alive. Memory accumulates for that
/// same reason, so this is not a guard for long-running processes.
pub struct DeferredGuard {
    parked: Mutex<Vec<ParkedNode>>,
}

struct ParkedNode {
    ptr: *mut (),
    dealloc: unsafe fn(*mut ()),
}

// The raw pointers are exclusively owned once deferred; the Mutex serialises
// the bookkeeping.
unsafe impl Send for ParkedNode {}

impl DeferredGuard {
    pub fn new() -> Self {
        DeferredGuard {
            parked: Mutex::new(Vec::new()),
        }
    }
}

impl Default for DeferredGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferredGuard {
    fn drop(&mut self) {
        let nodes = match self.parked.get_mut() {
            Ok(nodes) => nodes,
            Err(poisoned) => poisoned.into_inner(),
        };

        #[cfg(debug_assertions)]
        {
            let mut seen = std::collections::HashSet::new();
            for node in nodes.iter() {
                assert!(
                    seen.insert(node.ptr as usize),
                    "pointer {:#x} deferred twice",
                    node.ptr as usize
                );
            }
        }

        for node in nodes.drain(..) {
            unsafe { (node.dealloc)(node.ptr) };
        }
    }
}

/// A plain reference wrapper. Valid as long as the owning collection exists,
/// since nothing is freed before then.
pub struct DeferredRef<'a, T> {
    data: &'a T,
}

impl<T> Deref for DeferredRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl Guard for DeferredGuard {
    /// No per-operation pinning; protection comes from parking everything.
    type ReadGuard = ();

    type GuardedRef<'a, T: 'a> = DeferredRef<'a, T>;

    fn pin() -> Self::ReadGuard {}

    unsafe fn defer_destroy<N>(&self, node: *mut N, dealloc: unsafe fn(*mut N)) {
        let node = ParkedNode {
            ptr: node as *mut (),
            dealloc: unsafe {
                std::mem::transmute::<unsafe fn(*mut N), unsafe fn(*mut ())>(dealloc)
            },
        };
        match self.parked.lock() {
            Ok(mut parked) => parked.push(node),
            Err(poisoned) => poisoned.into_inner().push(node),
        }
    }

    unsafe fn make_ref<'a, T: 'a>(_read: Self::ReadGuard, ptr: *const T) -> Self::GuardedRef<'a, T> {
        // Safety: the caller loaded ptr from a live collection; nothing the
        // collection defers is freed before the collection itself drops.
        DeferredRef {
            data: unsafe { &*ptr },
        }
    }
}
