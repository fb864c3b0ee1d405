//! Byte-Bounded LRU Cache Engine
//!
//! This module implements the storage engine behind emberkv. Every entry is
//! charged `key.len() + value.len()` bytes against a fixed capacity, and the
//! least recently used entries are evicted whenever a write would not fit.
//!
//! ## Layout
//!
//! ```text
//!   index: HashMap<Bytes, Handle>
//!            │
//!            ▼
//!   slots: [ Node | Node | (free) | Node | ... ]
//!             ▲ prev/next are slot handles, never pointers
//!
//!   head (MRU) ──> node ──> node ──> node <── tail (LRU)
//! ```
//!
//! Entries live in a slot arena. The recency list links slots by handle and
//! the index maps each key to the handle of its slot, so both structures are
//! updated together inside a single method call. Released slots go to a
//! free list and are reused by later inserts.
//!
//! ## Synchronization
//!
//! The engine has no internal locking. All methods take `&mut self` where
//! they may reorder entries (including [`CacheEngine::get`]), and sharing
//! across threads goes through [`crate::storage::SharedCache`].

use bytes::Bytes;
use std::collections::HashMap;

/// Position of an entry inside the slot arena.
type Handle = usize;

#[derive(Debug, Default)]
struct Node {
    key: Bytes,
    value: Bytes,
    prev: Option<Handle>,
    next: Option<Handle>,
}

impl Node {
    #[inline]
    fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Counters describing how the engine has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a live entry
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries dropped from the LRU end to make room
    pub evictions: u64,
    /// New entries created
    pub insertions: u64,
    /// Existing entries overwritten
    pub updates: u64,
    /// Entries removed by `delete`
    pub removals: u64,
}

/// An LRU cache bounded by the total byte size of its keys and values.
///
/// # Example
///
/// ```
/// use emberkv::storage::CacheEngine;
/// use bytes::Bytes;
///
/// let mut engine = CacheEngine::new(10);
///
/// assert!(engine.put(Bytes::from("a"), Bytes::from("12345")));
/// assert!(engine.put(Bytes::from("b"), Bytes::from("12345")));
///
/// // "a" was evicted to make room for "b"
/// assert_eq!(engine.get(b"a"), None);
/// assert_eq!(engine.get(b"b"), Some(Bytes::from("12345")));
/// ```
pub struct CacheEngine {
    /// Maximum total bytes of all keys and values
    capacity: usize,

    /// Sum of `key.len() + value.len()` over live entries
    current_size: usize,

    /// Slot arena; freed slots hold empty keys/values
    slots: Vec<Node>,

    /// Handles of released slots available for reuse
    free: Vec<Handle>,

    /// Key -> slot handle
    index: HashMap<Bytes, Handle>,

    /// Most recently used entry
    head: Option<Handle>,

    /// Least recently used entry
    tail: Option<Handle>,

    stats: CacheStats,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("capacity", &self.capacity)
            .field("current_size", &self.current_size)
            .field("len", &self.index.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl CacheEngine {
    /// Creates an empty engine holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            current_size: 0,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            stats: CacheStats::default(),
        }
    }

    /// Inserts or updates `key`.
    ///
    /// Returns `false` without touching the cache if the entry alone is larger
    /// than the capacity. Otherwise the entry ends up most recently used, and
    /// least recently used entries are evicted until it fits.
    pub fn put(&mut self, key: Bytes, value: Bytes) -> bool {
        if !self.fits(&key, &value) {
            return false;
        }

        match self.index.get(&key[..]).copied() {
            Some(handle) => self.replace_value(handle, value),
            None => self.insert(key, value),
        }
        true
    }

    /// Inserts `key` only if it is not already present.
    ///
    /// An existing entry keeps both its value and its recency position.
    pub fn put_if_absent(&mut self, key: Bytes, value: Bytes) -> bool {
        if !self.fits(&key, &value) || self.index.contains_key(&key[..]) {
            return false;
        }

        self.insert(key, value);
        true
    }

    /// Updates `key` only if it is already present.
    pub fn set(&mut self, key: Bytes, value: Bytes) -> bool {
        if !self.fits(&key, &value) {
            return false;
        }

        match self.index.get(&key[..]).copied() {
            Some(handle) => {
                self.replace_value(handle, value);
                true
            }
            None => false,
        }
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        match self.index.get(key).copied() {
            Some(handle) => {
                self.remove(handle);
                self.stats.removals += 1;
                true
            }
            None => false,
        }
    }

    /// Returns the value for `key` and marks it most recently used.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        match self.index.get(key).copied() {
            Some(handle) => {
                self.promote(handle);
                self.stats.hits += 1;
                Some(self.slots[handle].value.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Returns true if `key` is present. Does not affect recency.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    /// Drops every entry. Statistics are kept.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.current_size = 0;
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently charged against the capacity.
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Iterates over keys from most to least recently used.
    pub fn keys_by_recency(&self) -> impl Iterator<Item = &Bytes> + '_ {
        std::iter::successors(self.head, move |&handle| self.slots[handle].next)
            .map(move |handle| &self.slots[handle].key)
    }

    #[inline]
    fn fits(&self, key: &Bytes, value: &Bytes) -> bool {
        key.len() + value.len() <= self.capacity
    }

    /// Overwrites the value of a live entry and makes it most recently used.
    ///
    /// The entry is promoted before evicting so the loop below can never
    /// reach it: once it is the only entry left the size already fits.
    fn replace_value(&mut self, handle: Handle, value: Bytes) {
        self.promote(handle);

        let old_size = self.slots[handle].size();
        let new_size = self.slots[handle].key.len() + value.len();

        while self.current_size - old_size + new_size > self.capacity {
            match self.tail {
                Some(victim) if victim != handle => self.evict(victim),
                _ => break,
            }
        }

        self.current_size = self.current_size - old_size + new_size;
        self.slots[handle].value = value;
        self.stats.updates += 1;
    }

    fn insert(&mut self, key: Bytes, value: Bytes) {
        let size = key.len() + value.len();

        while self.current_size + size > self.capacity {
            match self.tail {
                Some(victim) => self.evict(victim),
                None => break,
            }
        }

        let handle = self.allocate(Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.push_front(handle);
        self.index.insert(key, handle);
        self.current_size += size;
        self.stats.insertions += 1;
    }

    fn evict(&mut self, handle: Handle) {
        self.remove(handle);
        self.stats.evictions += 1;
    }

    /// Unlinks a live entry, drops it from the index and frees its slot.
    fn remove(&mut self, handle: Handle) {
        self.unlink(handle);

        let node = std::mem::take(&mut self.slots[handle]);
        self.index.remove(&node.key[..]);
        self.current_size -= node.size();
        self.free.push(handle);
    }

    fn allocate(&mut self, node: Node) -> Handle {
        match self.free.pop() {
            Some(handle) => {
                self.slots[handle] = node;
                handle
            }
            None => {
                self.slots.push(node);
                self.slots.len() - 1
            }
        }
    }

    fn promote(&mut self, handle: Handle) {
        if self.head == Some(handle) {
            return;
        }
        self.unlink(handle);
        self.push_front(handle);
    }

    fn unlink(&mut self, handle: Handle) {
        let (prev, next) = {
            let node = &self.slots[handle];
            (node.prev, node.next)
        };

        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }

        let node = &mut self.slots[handle];
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, handle: Handle) {
        self.slots[handle].prev = None;
        self.slots[handle].next = self.head;

        match self.head {
            Some(old_head) => self.slots[old_head].prev = Some(handle),
            None => self.tail = Some(handle),
        }
        self.head = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    fn keys(engine: &CacheEngine) -> Vec<String> {
        engine
            .keys_by_recency()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    /// Walks the recency list in both directions and checks it agrees with
    /// the index and the size counter.
    fn check_invariants(engine: &CacheEngine) {
        let mut forward = Vec::new();
        let mut cursor = engine.head;
        let mut prev = None;
        while let Some(h) = cursor {
            assert_eq!(engine.slots[h].prev, prev, "broken back link");
            forward.push(h);
            prev = cursor;
            cursor = engine.slots[h].next;
        }
        assert_eq!(engine.tail, prev);
        assert_eq!(forward.len(), engine.index.len());

        let mut total = 0;
        for &h in &forward {
            let node = &engine.slots[h];
            assert_eq!(engine.index.get(&node.key[..]), Some(&h));
            total += node.size();
        }
        assert_eq!(total, engine.current_size);
        assert!(engine.current_size <= engine.capacity);
    }

    #[test]
    fn test_put_and_get() {
        let mut engine = CacheEngine::new(100);

        assert!(engine.put(b("key"), b("value")));
        assert_eq!(engine.get(b"key"), Some(b("value")));
        assert_eq!(engine.current_size(), 8);
        check_invariants(&engine);
    }

    #[test]
    fn test_get_missing() {
        let mut engine = CacheEngine::new(100);
        assert_eq!(engine.get(b"missing"), None);
        assert_eq!(engine.stats().misses, 1);
    }

    #[test]
    fn test_eviction_scenario() {
        let mut engine = CacheEngine::new(10);

        assert!(engine.put(b("a"), b("12345")));
        assert!(engine.put(b("b"), b("12345")));

        assert_eq!(keys(&engine), vec!["b"]);
        assert_eq!(engine.get(b"a"), None);
        assert_eq!(engine.current_size(), 6);
        assert_eq!(engine.stats().evictions, 1);
        check_invariants(&engine);
    }

    #[test]
    fn test_entry_larger_than_capacity_rejected() {
        let mut engine = CacheEngine::new(10);
        engine.put(b("a"), b("1"));

        assert!(!engine.put(b("big"), b("123456789")));
        assert!(!engine.put(b("a"), b("123456789ab")));

        // Nothing changed
        assert_eq!(engine.get(b"a"), Some(b("1")));
        assert_eq!(engine.current_size(), 2);
        check_invariants(&engine);
    }

    #[test]
    fn test_entry_exactly_capacity_fits() {
        let mut engine = CacheEngine::new(10);
        engine.put(b("x"), b("1"));

        assert!(engine.put(b("key"), b("1234567")));
        assert_eq!(keys(&engine), vec!["key"]);
        assert_eq!(engine.current_size(), 10);
    }

    #[test]
    fn test_get_promotes() {
        let mut engine = CacheEngine::new(9);
        engine.put(b("a"), b("aa"));
        engine.put(b("b"), b("bb"));
        engine.put(b("c"), b("cc"));
        assert_eq!(keys(&engine), vec!["c", "b", "a"]);

        engine.get(b"a");
        assert_eq!(keys(&engine), vec!["a", "c", "b"]);

        // "b" is now least recently used
        engine.put(b("d"), b("dd"));
        assert_eq!(keys(&engine), vec!["d", "a", "c"]);
        check_invariants(&engine);
    }

    #[test]
    fn test_put_existing_promotes() {
        let mut engine = CacheEngine::new(100);
        engine.put(b("a"), b("1"));
        engine.put(b("b"), b("2"));
        engine.put(b("c"), b("3"));

        assert!(engine.put(b("a"), b("updated")));
        assert_eq!(keys(&engine), vec!["a", "c", "b"]);
        assert_eq!(engine.get(b"a"), Some(b("updated")));
        assert_eq!(engine.current_size(), 1 + 7 + 2 + 2);
        check_invariants(&engine);
    }

    #[test]
    fn test_eviction_order_stops_once_write_fits() {
        let mut engine = CacheEngine::new(12);
        engine.put(b("a"), b("111")); // 4
        engine.put(b("b"), b("111")); // 4
        engine.put(b("c"), b("111")); // 4

        // Needs 6 bytes: evicts "a" then "b", keeps "c"
        engine.put(b("d"), b("22222"));
        assert_eq!(keys(&engine), vec!["d", "c"]);
        assert_eq!(engine.stats().evictions, 2);
        check_invariants(&engine);
    }

    #[test]
    fn test_growing_update_never_evicts_itself() {
        let mut engine = CacheEngine::new(10);
        engine.put(b("a"), b("1")); // LRU
        engine.put(b("b"), b("1"));
        engine.put(b("c"), b("1"));

        // "a" is least recently used, grows to fill the whole cache
        assert!(engine.put(b("a"), b("123456789")));
        assert_eq!(keys(&engine), vec!["a"]);
        assert_eq!(engine.current_size(), 10);
        check_invariants(&engine);
    }

    #[test]
    fn test_put_if_absent() {
        let mut engine = CacheEngine::new(100);

        assert!(engine.put_if_absent(b("a"), b("1")));
        engine.put(b("b"), b("2"));

        assert!(!engine.put_if_absent(b("a"), b("other")));
        assert_eq!(keys(&engine), vec!["b", "a"]);
        assert_eq!(engine.get(b"a"), Some(b("1")));
        check_invariants(&engine);
    }

    #[test]
    fn test_set_only_updates_existing() {
        let mut engine = CacheEngine::new(100);

        assert!(!engine.set(b("a"), b("1")));
        assert!(engine.is_empty());

        engine.put(b("a"), b("1"));
        engine.put(b("b"), b("2"));
        assert!(engine.set(b("a"), b("3")));
        assert_eq!(keys(&engine), vec!["a", "b"]);
        assert_eq!(engine.get(b"a"), Some(b("3")));
    }

    #[test]
    fn test_delete_frees_bytes() {
        let mut engine = CacheEngine::new(100);
        engine.put(b("a"), b("12345"));
        engine.put(b("b"), b("12345"));

        assert!(engine.delete(b"a"));
        assert!(!engine.delete(b"a"));
        assert_eq!(engine.current_size(), 6);
        assert_eq!(keys(&engine), vec!["b"]);

        // The freed slot is reused
        engine.put(b("c"), b("1"));
        assert_eq!(engine.slots.len(), 2);
        check_invariants(&engine);
    }

    #[test]
    fn test_clear() {
        let mut engine = CacheEngine::new(100);
        engine.put(b("a"), b("1"));
        engine.put(b("b"), b("2"));

        engine.clear();
        assert!(engine.is_empty());
        assert_eq!(engine.current_size(), 0);
        assert_eq!(engine.get(b"a"), None);

        engine.put(b("c"), b("3"));
        check_invariants(&engine);
    }

    #[test]
    fn test_random_operations_keep_invariants() {
        let mut engine = CacheEngine::new(64);
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;

        for _ in 0..5_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            let key = b(&format!("k{}", seed % 23));
            let value = Bytes::from(vec![b'v'; (seed >> 8) as usize % 40]);

            match (seed >> 32) % 5 {
                0 => {
                    engine.put(key.clone(), value.clone());
                    if key.len() + value.len() <= 64 {
                        assert_eq!(engine.get(&key), Some(value));
                    }
                }
                1 => {
                    engine.put_if_absent(key, value);
                }
                2 => {
                    engine.set(key, value);
                }
                3 => {
                    engine.delete(&key);
                }
                _ => {
                    engine.get(&key);
                }
            }
            check_invariants(&engine);
        }
    }
}
