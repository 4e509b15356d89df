//! Lock-free read-optimised map keyed by word-sized integers.
//!
//! One key-sorted lock-free list holds every live entry; a power-of-two
//! index table of atomic pointers turns lookups into a short walk of the
//! right stretch of that list. The table doubles online, concurrently with
//! readers and writers, whenever more than half of its slots are occupied.
//!
//! Memory reclamation is pluggable through the [`Guard`] trait. This crate
//! ships [`DeferredGuard`] for tests; the `wordmap-crossbeam` crate provides
//! the epoch-based guard meant for production.
//!
//! ```ignore
//! use wordmap_core::WordMap;
//! use wordmap_crossbeam::EpochGuard;
//!
//! let map: WordMap<String, EpochGuard> = WordMap::new();
//! map.set(17, "seventeen".to_string());
//! assert_eq!(map.get(17).as_deref(), Some(&"seventeen".to_string()));
//! ```

pub mod guard;
pub mod map;

#[cfg(feature = "serde")]
mod serde;

pub use guard::{DeferredGuard, DeferredRef, Guard};
pub use map::{Iter, WordMap, DEFAULT_BUCKET_COUNT, MAX_FILL_RATE};
