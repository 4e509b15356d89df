//! Crossbeam-based memory reclamation for `wordmap`.
//!
//! This crate provides [`EpochGuard`], an implementation of the
//! `wordmap_core::Guard` trait on top of crossbeam-epoch, and the
//! [`WordMap`] alias pinned to it.
//!
//! ```
//! use wordmap_crossbeam::WordMap;
//!
//! let map: WordMap<&str> = WordMap::new();
//! map.set(42, "answer");
//! assert_eq!(map.get(42).as_deref(), Some(&"answer"));
//! ```

pub mod epoch_guard;

pub use epoch_guard::{EpochGuard, EpochRef};

/// A `wordmap_core::WordMap` with epoch-based memory reclamation.
pub type WordMap<V> = wordmap_core::WordMap<V, EpochGuard>;
