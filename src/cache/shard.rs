//! Sharded Map Implementation
//!
//! Concurrent hashmap partitioned into independently locked shards so that
//! operations on unrelated keys never serialize.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Cache-line padding between shards prevents false sharing

use parking_lot::RwLock;
use std::borrow::Borrow;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use super::CACHE_LINE_SIZE;

/// Single shard containing a hashmap and statistics
#[repr(C)]
pub struct Shard<K, V> {
    /// The hashmap for this shard
    map: RwLock<HashMap<K, V>>,
    /// Number of reads
    reads: AtomicU64,
    /// Number of writes
    writes: AtomicU64,
    /// Padding to prevent false sharing
    _padding: [u8; CACHE_LINE_SIZE - 16],
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            _padding: [0; CACHE_LINE_SIZE - 16],
        }
    }

    /// Get the number of entries in this shard
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().get(key).cloned()
    }

    fn matches<Q, F>(&self, key: &Q, pred: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().get(key).map_or(false, pred)
    }

    fn upsert<F>(&self, key: K, insert: V, update: F) -> bool
    where
        F: FnOnce(&mut V, V),
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        match self.map.write().entry(key) {
            Entry::Occupied(mut slot) => {
                update(slot.get_mut(), insert);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(insert);
                true
            }
        }
    }

    fn update<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V) -> bool,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        match self.map.write().get_mut(key) {
            Some(v) => f(v),
            None => false,
        }
    }

    fn remove_if<Q, F>(&self, key: &Q, pred: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        match guard.get(key) {
            Some(v) if pred(v) => guard.remove(key),
            _ => None,
        }
    }

    fn clear(&self) {
        self.map.write().clear();
    }
}

/// Sharded map with configurable shard count
pub struct ShardedMap<K, V, const N: usize = 64> {
    shards: Box<[Shard<K, V>]>,
}

impl<K, V, const N: usize> Default for ShardedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    /// Create a new sharded map
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "shard count must be a power of two");
        // Vec avoids building a large array on the stack
        let shards: Vec<Shard<K, V>> = (0..N).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    /// Total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    pub fn total_reads(&self) -> u64 {
        self.shards.iter().map(|s| s.read_count()).sum()
    }

    pub fn total_writes(&self) -> u64 {
        self.shards.iter().map(|s| s.write_count()).sum()
    }
}

impl<K: Eq + Hash, V, const N: usize> ShardedMap<K, V, N> {
    #[inline]
    fn shard_for<Q>(&self, key: &Q) -> &Shard<K, V>
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (N - 1)]
    }

    /// Get a clone of the value for `key`
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shard_for(key).get(key)
    }

    /// Whether a value is present and accepted by `pred`, without cloning it
    pub fn matches<Q, F>(&self, key: &Q, pred: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        self.shard_for(key).matches(key, pred)
    }

    /// Insert `value` if the key is vacant, otherwise hand the existing value and
    /// `value` to `update`. Returns true if the key was vacant.
    pub fn upsert<F>(&self, key: K, value: V, update: F) -> bool
    where
        F: FnOnce(&mut V, V),
    {
        self.shard_for(&key).upsert(key, value, update)
    }

    /// Mutate a present value in place; returns what `f` returns, or false if absent
    pub fn update<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V) -> bool,
    {
        self.shard_for(key).update(key, f)
    }

    /// Remove a value unconditionally
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).remove_if(key, |_| true)
    }

    /// Remove a value only if `pred` accepts it (checked under the shard lock)
    pub fn remove_if<Q, F>(&self, key: &Q, pred: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        self.shard_for(key).remove_if(key, pred)
    }

    /// Clear all shards
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }
}

/// Statistics for a sharded map
#[derive(Debug, Clone)]
pub struct ShardedMapStats {
    pub total_entries: usize,
    pub total_reads: u64,
    pub total_writes: u64,
    pub shard_entry_counts: Vec<usize>,
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    /// Get detailed statistics
    pub fn stats(&self) -> ShardedMapStats {
        let shard_entry_counts: Vec<usize> = self.shards.iter().map(|s| s.len()).collect();

        ShardedMapStats {
            total_entries: shard_entry_counts.iter().sum(),
            total_reads: self.total_reads(),
            total_writes: self.total_writes(),
            shard_entry_counts,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn replace(old: &mut i32, new: i32) {
        *old = new;
    }

    #[test]
    fn test_sharded_map_creation() {
        let map: ShardedMap<String, i32, 16> = ShardedMap::new();
        assert!(map.is_empty());
        assert_eq!(map.shard_count(), 16);
    }

    #[test]
    fn test_upsert_reports_vacancy() {
        let map: ShardedMap<String, i32, 16> = ShardedMap::new();

        assert!(map.upsert("key1".to_string(), 42, replace));
        assert!(!map.upsert("key1".to_string(), 7, replace));

        assert_eq!(map.len(), 1);
        assert_eq!(map.get("key1"), Some(7));
        assert_eq!(map.get("key2"), None);
    }

    #[test]
    fn test_upsert_can_keep_existing_fields() {
        let map: ShardedMap<String, (i32, u64), 16> = ShardedMap::new();
        map.upsert("k".to_string(), (1, 10), |old, new| old.0 = new.0);
        map.upsert("k".to_string(), (2, 20), |old, new| old.0 = new.0);
        assert_eq!(map.get("k"), Some((2, 10)));
    }

    #[test]
    fn test_remove_if() {
        let map: ShardedMap<String, i32, 16> = ShardedMap::new();
        map.upsert("key1".to_string(), 42, replace);

        assert_eq!(map.remove_if("key1", |v| *v == 0), None);
        assert_eq!(map.get("key1"), Some(42));
        assert!(map.matches("key1", |v| *v == 42));
        assert!(!map.matches("key2", |_| true));

        assert_eq!(map.remove_if("key1", |v| *v == 42), Some(42));
        assert_eq!(map.get("key1"), None);
        assert_eq!(map.remove("key1"), None);
    }

    #[test]
    fn test_update() {
        let map: ShardedMap<String, i32, 16> = ShardedMap::new();
        map.upsert("key1".to_string(), 42, replace);

        assert!(map.update("key1", |v| {
            *v += 10;
            true
        }));
        assert_eq!(map.get("key1"), Some(52));

        assert!(!map.update("nonexistent", |v| {
            *v += 10;
            true
        }));
    }

    #[test]
    fn test_clear() {
        let map: ShardedMap<String, i32, 16> = ShardedMap::new();
        for i in 0..100 {
            map.upsert(format!("key{}", i), i, replace);
        }
        assert_eq!(map.len(), 100);
        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_statistics() {
        let map: ShardedMap<String, i32, 16> = ShardedMap::new();
        for i in 0..100 {
            map.upsert(format!("key{}", i), i, replace);
        }
        for i in 0..50 {
            map.get(format!("key{}", i).as_str());
        }

        let stats = map.stats();
        assert_eq!(stats.total_entries, 100);
        assert_eq!(stats.total_writes, 100);
        assert_eq!(stats.total_reads, 50);
    }

    #[test]
    fn test_distribution() {
        let map: ShardedMap<String, i32, 16> = ShardedMap::new();
        for i in 0..1000 {
            map.upsert(format!("key{}", i), i, replace);
        }

        let stats = map.stats();
        let max_count = stats.shard_entry_counts.iter().max().unwrap();
        assert!(*max_count < 200, "Uneven distribution: max shard has {} entries", max_count);
        let min_count = stats.shard_entry_counts.iter().min().unwrap();
        assert!(*min_count > 20, "Uneven distribution: min shard has {} entries", min_count);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<ShardedMap<String, i32, 16>> = Arc::new(ShardedMap::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let key = format!("key-{}-{}", t, i);
                        map.upsert(key.clone(), i, replace);
                        map.get(key.as_str());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), 8000);
    }
}
