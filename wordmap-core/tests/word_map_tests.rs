use std::thread;
use std::time::Duration;

use wordmap_core::{DeferredGuard, WordMap, DEFAULT_BUCKET_COUNT};

type DeferredWordMap<V> = WordMap<V, DeferredGuard>;

fn wait_for_resize<V: Send + Sync + 'static>(map: &DeferredWordMap<V>) {
    while map.resize_in_progress() {
        thread::sleep(Duration::from_micros(50));
    }
}

#[test]
fn test_empty_map() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
    assert!(map.get(0).is_none());
    assert!(!map.contains_key(0));
    assert_eq!(map.iter().count(), 0);
    // Removing from an empty map is a no-op, not an error.
    map.remove(0);
    assert_eq!(map.len(), 0);
}

#[test]
fn test_grow_rounds_up_to_power_of_two() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    map.grow(63);
    wait_for_resize(&map);

    // 63 rounds up to 64 buckets, observable as the fill-rate denominator.
    assert_eq!(map.capacity(), 64);
    assert_eq!(map.fill_rate(), 0.0);
}

#[test]
fn test_small_table_preserves_values() {
    let map: DeferredWordMap<String> = DeferredWordMap::with_capacity(2);
    let item_count = 50;

    for i in 0..item_count {
        map.set(i, i.to_string());
    }
    assert_eq!(map.len(), item_count);
    wait_for_resize(&map);

    // Sequential small keys all share bucket 0 of the 2-slot table.
    assert_eq!(map.fill_rate(), 0.5);

    for i in 0..item_count {
        assert_eq!(map.get(i).as_deref(), Some(&i.to_string()), "key {}", i);
    }
}

#[test]
fn test_high_bit_keys_occupy_distinct_buckets() {
    let map: DeferredWordMap<String> = DeferredWordMap::with_capacity(64);
    let item_count = 16usize;
    let shift = usize::BITS as usize - 4;

    for i in 0..item_count {
        map.set(i << shift, i.to_string());
    }
    assert_eq!(map.len(), item_count);

    // One filled slot per key proves every key landed in its own bucket.
    assert_eq!(map.fill_rate(), item_count as f64 / 64.0);

    for i in 0..item_count {
        assert!(map.get(i << shift).is_some(), "key {} missing", i);
    }

    for i in 0..item_count {
        map.remove(i << shift);
    }
    assert_eq!(map.len(), 0);
    assert!(map.get(0).is_none());
}

#[test]
fn test_compare_and_swap_sequence() {
    let map: DeferredWordMap<&str> = DeferredWordMap::new();
    let key = 1usize << (usize::BITS - 2);

    map.set(key, "elephant");
    assert_eq!(map.len(), 1);

    assert!(map.compare_and_swap(key, &"elephant", "monkey"));
    assert_eq!(map.len(), 1);

    // The expectation no longer matches the stored value.
    assert!(!map.compare_and_swap(key, &"elephant", "monkey"));
    assert_eq!(map.len(), 1);

    assert_eq!(map.get(key).as_deref(), Some(&"monkey"));
}

#[test]
fn test_compare_and_swap_absent_key_fails() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    assert!(!map.compare_and_swap(9, &1, 2));
    map.set(9, 1);
    assert!(!map.compare_and_swap(10, &1, 2));
    // A failed CAS never inserts.
    assert_eq!(map.len(), 1);
    assert!(map.get(10).is_none());
}

#[test]
fn test_ordered_iteration() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    for key in [7usize, 2, 9, 0, 5] {
        map.set(key, key as u32);
    }
    let keys: Vec<usize> = map.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![0, 2, 5, 7, 9]);
}

#[test]
fn test_sorted_links_after_mixed_operations() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    for key in (0..200usize).rev() {
        map.set(key * 31, key as u32);
    }
    for key in (0..200usize).step_by(3) {
        map.remove(key * 31);
    }

    let keys: Vec<usize> = map.iter().map(|(k, _)| k).collect();
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "keys out of order: {:?}", pair);
    }
}

#[test]
fn test_len_agrees_with_walk() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    for key in 0..500usize {
        map.set(key * 7, 0);
    }
    for key in 0..250usize {
        map.remove(key * 14);
    }
    assert_eq!(map.len(), map.iter().count());
}

#[test]
fn test_round_trip() {
    let map: DeferredWordMap<String> = DeferredWordMap::new();
    for key in 0..64usize {
        map.set(key, format!("value {}", key));
        assert_eq!(
            map.get(key).as_deref(),
            Some(&format!("value {}", key)),
            "set/get for {}",
            key
        );
    }
    for key in 0..64usize {
        map.remove(key);
        assert!(map.get(key).is_none(), "remove/get for {}", key);
    }
}

#[test]
fn test_delete_is_idempotent() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    map.set(5, 50);
    map.remove(5);
    map.remove(5);
    assert_eq!(map.len(), 0);
    assert!(map.get(5).is_none());
}

#[test]
fn test_set_is_idempotent() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    map.set(5, 50);
    map.set(5, 50);
    map.set(5, 51);
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(5).as_deref(), Some(&51));
}

#[test]
fn test_insert_never_overwrites() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    assert!(map.insert(3, 30));
    assert!(!map.insert(3, 31));
    assert_eq!(map.get(3).as_deref(), Some(&30));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_get_or_insert() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();

    let (value, loaded) = map.get_or_insert(8, 80);
    assert_eq!((*value, loaded), (80, false));
    drop(value);

    let (value, loaded) = map.get_or_insert(8, 81);
    assert_eq!((*value, loaded), (80, true));
    drop(value);

    map.remove(8);
    let (value, loaded) = map.get_or_insert(8, 82);
    assert_eq!((*value, loaded), (82, false));
    drop(value);

    assert_eq!(map.len(), 1);
}

#[test]
fn test_fill_rate_quiescent() {
    let map: DeferredWordMap<u32> = DeferredWordMap::with_capacity(8);
    let shift = usize::BITS as usize - 3;

    // Four of eight buckets occupied.
    for i in 0..4usize {
        map.set(i << shift, 0);
    }
    wait_for_resize(&map);
    assert_eq!(map.capacity(), 8);
    assert_eq!(map.fill_rate(), 0.5);
}

#[test]
fn test_first_write_uses_default_buckets() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    map.set(1, 1);
    assert_eq!(map.capacity(), DEFAULT_BUCKET_COUNT);
}

#[test]
fn test_from_iterator_and_extend() {
    let mut map: DeferredWordMap<u32> = [(3usize, 30u32), (1, 10), (2, 20)].into_iter().collect();
    assert_eq!(map.len(), 3);
    assert_eq!(map.get(1).as_deref(), Some(&10));

    map.extend([(4usize, 40u32), (1, 11)]);
    assert_eq!(map.len(), 4);
    assert_eq!(map.get(1).as_deref(), Some(&11));
}

#[test]
fn test_iteration_skips_concurrently_deleted() {
    let map: DeferredWordMap<u32> = DeferredWordMap::new();
    for key in 0..10usize {
        map.set(key, key as u32);
    }
    let mut iter = map.iter();
    assert_eq!(iter.next().map(|(k, _)| k), Some(0));

    // Delete ahead of the cursor; the iterator must step over the gap.
    map.remove(1);
    map.remove(2);
    assert_eq!(iter.next().map(|(k, _)| k), Some(3));
}
