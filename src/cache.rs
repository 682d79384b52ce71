//! Capacity-bounded key/value store with oldest-touched eviction.
//!
//! The cache tracks recency only on insert and overwrite. Plain reads never
//! reorder entries, so this is an approximation of LRU rather than a strict
//! implementation.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::hash::Hash;

/// A stored value together with its position in the touch order.
#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    stamp: u64,
}

/// A bounded cache that evicts the least recently inserted or overwritten
/// entry once `capacity` is reached.
///
/// Every entry carries a monotonically increasing touch stamp. The `order`
/// index maps stamps back to keys, so the eviction victim is always the
/// first entry of `order`.
#[derive(Debug, Clone)]
pub struct BoundedCache<K, V> {
    entries: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    capacity: usize,
    next_stamp: u64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a cache holding at most `capacity` entries.
    ///
    /// A capacity of zero is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity.min(32_768)),
            order: BTreeMap::new(),
            capacity,
            next_stamp: 0,
        }
    }

    /// Insert or overwrite `key`.
    ///
    /// Overwriting keeps the size unchanged and moves the key to the most
    /// recently touched position. Inserting a new key into a full cache first
    /// evicts the least recently touched entry, which is returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let stamp = self.bump_stamp();

        if let Some(slot) = self.entries.get_mut(&key) {
            self.order.remove(&slot.stamp);
            slot.value = value;
            slot.stamp = stamp;
            self.order.insert(stamp, key);
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        self.order.insert(stamp, key.clone());
        self.entries.insert(key, Slot { value, stamp });
        evicted
    }

    /// Look up a value without touching its recency.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove `key`, returning its value. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.stamp);
        Some(slot.value)
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Keep only the entries for which `keep` returns `true`.
    ///
    /// Retained entries keep their relative order.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let result: Result<(), Infallible> = self.try_retain(|k, v| Ok(keep(k, v)));
        match result {
            Ok(()) => {}
            Err(never) => match never {},
        }
    }

    /// Fallible form of [`retain`](Self::retain).
    ///
    /// Every entry is judged before anything is removed, so an error from
    /// `keep` leaves the cache exactly as it was.
    pub fn try_retain<E, F>(&mut self, mut keep: F) -> Result<(), E>
    where
        F: FnMut(&K, &V) -> Result<bool, E>,
    {
        let mut doomed = Vec::new();
        for (stamp, key) in &self.order {
            if let Some(slot) = self.entries.get(key) {
                if !keep(key, &slot.value)? {
                    doomed.push(*stamp);
                }
            }
        }

        for stamp in doomed {
            if let Some(key) = self.order.remove(&stamp) {
                self.entries.remove(&key);
            }
        }
        Ok(())
    }

    /// Iterate keys from least to most recently touched.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.values()
    }

    fn evict_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.entries.remove(&key)?;
        Some((key, slot.value))
    }

    fn bump_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }
}
