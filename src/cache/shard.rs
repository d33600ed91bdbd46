//! Sharded Ordered Map
//!
//! Concurrent map split into power-of-two shards, each an ordered
//! `BTreeMap` behind its own `RwLock`. Keys pick a shard by hash, so
//! writers on different shards never contend and readers only wait for a
//! writer on their own shard.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Keys are ordered within a shard

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::key::CacheKey;

/// Single shard containing an ordered map
pub struct Shard<V> {
    map: RwLock<BTreeMap<CacheKey, V>>,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Shard<V> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn get(&self, key: &CacheKey) -> Option<V>
    where
        V: Clone,
    {
        self.map.read().get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, value: V) -> Option<V> {
        self.map.write().insert(key, value)
    }

    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        self.map.write().remove(key)
    }

    /// Insert `value` unless `keep` holds for the current value.
    /// Returns whether `value` was stored.
    pub fn insert_unless<F>(&self, key: CacheKey, value: V, keep: F) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        let mut guard = self.map.write();
        if guard.get(&key).is_some_and(keep) {
            return false;
        }
        guard.insert(key, value);
        true
    }

    /// Remove `key` only if `pred` holds for its current value
    pub fn remove_if<F>(&self, key: &CacheKey, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut guard = self.map.write();
        if guard.get(key).is_some_and(pred) {
            guard.remove(key)
        } else {
            None
        }
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }
}

/// Sharded ordered map with a fixed shard count
pub struct ShardedMap<V, const N: usize = 64> {
    shards: Box<[Shard<V>]>,
}

impl<V, const N: usize> Default for ShardedMap<V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, const N: usize> ShardedMap<V, N> {
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "shard count must be a power of two");
        let shards: Vec<Shard<V>> = (0..N).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    #[inline]
    fn shard_for(&self, key: &CacheKey) -> &Shard<V> {
        &self.shards[key.shard_index(N)]
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    pub fn get(&self, key: &CacheKey) -> Option<V>
    where
        V: Clone,
    {
        self.shard_for(key).get(key)
    }

    pub fn insert(&self, key: CacheKey, value: V) -> Option<V> {
        let shard = &self.shards[key.shard_index(N)];
        shard.insert(key, value)
    }

    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        self.shard_for(key).remove(key)
    }

    pub fn insert_unless<F>(&self, key: CacheKey, value: V, keep: F) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        let shard = &self.shards[key.shard_index(N)];
        shard.insert_unless(key, value, keep)
    }

    pub fn remove_if<F>(&self, key: &CacheKey, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        self.shard_for(key).remove_if(key, pred)
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_operations() {
        let map: ShardedMap<u64, 16> = ShardedMap::new();
        assert!(map.is_empty());
        assert_eq!(map.shard_count(), 16);

        assert!(map.insert(CacheKey::from("a"), 1).is_none());
        assert_eq!(map.insert(CacheKey::from("a"), 2), Some(1));
        assert_eq!(map.get(&CacheKey::from("a")), Some(2));
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove(&CacheKey::from("a")), Some(2));
        assert!(map.get(&CacheKey::from("a")).is_none());
    }

    #[test]
    fn test_remove_if_checks_current_value() {
        let map: ShardedMap<u32, 4> = ShardedMap::new();
        map.insert(CacheKey::from("k"), 7);
        assert!(map.remove_if(&CacheKey::from("k"), |v| *v == 8).is_none());
        assert_eq!(map.remove_if(&CacheKey::from("k"), |v| *v == 7), Some(7));
        assert!(map.remove_if(&CacheKey::from("k"), |_| true).is_none());
    }

    #[test]
    fn test_insert_unless_keeps_current_value() {
        let map: ShardedMap<u32, 4> = ShardedMap::new();
        assert!(map.insert_unless(CacheKey::from("k"), 5, |_| true));
        assert!(!map.insert_unless(CacheKey::from("k"), 3, |cur| *cur > 3));
        assert_eq!(map.get(&CacheKey::from("k")), Some(5));
        assert!(map.insert_unless(CacheKey::from("k"), 9, |cur| *cur > 9));
        assert_eq!(map.get(&CacheKey::from("k")), Some(9));
    }

    #[test]
    fn test_concurrent_writers() {
        let map: Arc<ShardedMap<usize>> = Arc::new(ShardedMap::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = map.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        map.insert(CacheKey::from(format!("{}-{}", t, i).as_str()), i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 2000);
    }
}
