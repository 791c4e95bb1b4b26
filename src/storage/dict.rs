//! Sharded Concurrent Map
//!
//! This module implements the keyspace primitive: an associative container
//! partitioned over N shards, each guarded by its own reader/writer lock.
//! Keys are routed to shards by hash, so threads touching different keys
//! usually touch different locks and proceed in parallel.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ShardedMap<V>                          │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Shard Selection
//!
//! `shard = fnv1a_32(key) & (shard_count - 1)`. The shard count is a power
//! of two fixed at construction, so the mask is exact. The striped lock
//! table uses the same formula, which lets callers line up a key's lock
//! stripe with its shard.
//!
//! ## Counting
//!
//! The element count is a single atomic maintained alongside the per-shard
//! maps. It is exact whenever no writer is in flight; during concurrent
//! mutation it may momentarily lag or lead.

use crate::storage::hash::fnv1a_32;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Smallest permitted shard count.
const MIN_SHARDS: usize = 16;

/// Largest permitted shard count (2^31).
const MAX_SHARDS: usize = 1 << 31;

/// Sampling attempts budget per requested key before
/// [`ShardedMap::random_distinct_keys`] falls back to a full scan.
const SAMPLE_ATTEMPTS_PER_KEY: usize = 64;

/// Rounds a requested shard count up to the next power of two, clamped to
/// `[MIN_SHARDS, MAX_SHARDS]`.
fn compute_capacity(requested: usize) -> usize {
    if requested <= MIN_SHARDS {
        return MIN_SHARDS;
    }
    requested
        .checked_next_power_of_two()
        .unwrap_or(MAX_SHARDS)
        .min(MAX_SHARDS)
}

/// A single shard holding a slice of the keyspace.
struct Shard<V> {
    entries: RwLock<HashMap<Bytes, V>>,
}

impl<V> Shard<V> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns one key from the shard's internal iteration order, which is
    /// deliberately unspecified.
    fn any_key(&self) -> Option<Bytes> {
        let entries = self.entries.read();
        entries.keys().next().cloned()
    }
}

/// The shard array plus its element count. Replaced wholesale by
/// [`ShardedMap::clear`]; readers in flight keep the old table alive
/// through their `Arc` until they finish.
struct Table<V> {
    shards: Vec<Shard<V>>,
    count: AtomicUsize,
}

impl<V> Table<V> {
    fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count).map(|_| Shard::new()).collect(),
            count: AtomicUsize::new(0),
        }
    }
}

/// A thread-safe map partitioned over power-of-two many shards.
///
/// Values are opaque to the map; callers instantiate `V` with whatever the
/// command layer stores (byte strings, paged lists, ...). Lookups clone
/// the value out, so `V` is expected to be cheap to clone - `Bytes`, an
/// `Arc`, or a small tagged enum of those.
///
/// # Example
///
/// ```
/// use corekv::storage::ShardedMap;
/// use bytes::Bytes;
///
/// let map: ShardedMap<Bytes> = ShardedMap::new(64);
/// map.put(Bytes::from("name"), Bytes::from("corekv"));
/// assert_eq!(map.get(b"name"), Some(Bytes::from("corekv")));
/// ```
pub struct ShardedMap<V> {
    table: RwLock<Arc<Table<V>>>,
    shard_count: usize,
}

impl<V: Clone> ShardedMap<V> {
    /// Creates a map with at least `shard_count` shards.
    ///
    /// The request is rounded up to the next power of two, with a minimum
    /// of 16 and a maximum of 2^31.
    pub fn new(shard_count: usize) -> Self {
        let shard_count = compute_capacity(shard_count);
        Self {
            table: RwLock::new(Arc::new(Table::new(shard_count))),
            shard_count,
        }
    }

    /// Returns the shard count chosen at construction.
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Snapshots the current table. The outer lock is held only for the
    /// `Arc` clone; shard locks are taken afterwards.
    fn current(&self) -> Arc<Table<V>> {
        self.table.read().clone()
    }

    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        (fnv1a_32(key) as usize) & (self.shard_count - 1)
    }

    /// Returns the value bound to `key`, if present.
    pub fn get(&self, key: &[u8]) -> Option<V> {
        let table = self.current();
        let shard = &table.shards[self.shard_index(key)];
        let entries = shard.entries.read();
        entries.get(key).cloned()
    }

    /// Binds `key` to `value`.
    ///
    /// Returns `true` if the key was inserted, `false` if an existing
    /// binding was replaced.
    pub fn put(&self, key: Bytes, value: V) -> bool {
        let table = self.current();
        let shard = &table.shards[self.shard_index(&key)];
        let mut entries = shard.entries.write();
        let inserted = entries.insert(key, value).is_none();
        if inserted {
            table.count.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    /// Binds `key` to `value` only if the key is absent.
    ///
    /// Returns `true` if the key was inserted, `false` if it already
    /// existed (the existing value is left untouched).
    pub fn put_if_absent(&self, key: Bytes, value: V) -> bool {
        let table = self.current();
        let shard = &table.shards[self.shard_index(&key)];
        let mut entries = shard.entries.write();
        match entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                table.count.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Rebinds `key` to `value` only if the key is present.
    ///
    /// Returns `true` if the binding was updated, `false` if the key does
    /// not exist. Never changes the element count.
    pub fn put_if_exists(&self, key: &[u8], value: V) -> bool {
        let table = self.current();
        let shard = &table.shards[self.shard_index(key)];
        let mut entries = shard.entries.write();
        match entries.get_mut(key) {
            Some(existing) => {
                *existing = value;
                true
            }
            None => false,
        }
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&self, key: &[u8]) -> Option<V> {
        let table = self.current();
        let shard = &table.shards[self.shard_index(key)];
        let mut entries = shard.entries.write();
        let removed = entries.remove(key);
        if removed.is_some() {
            table.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Returns the approximate number of keys in the map.
    pub fn len(&self) -> usize {
        self.current().count.load(Ordering::Relaxed)
    }

    /// Returns `true` if the map holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every binding by swapping in a fresh table with the same
    /// shard count.
    ///
    /// Readers that already snapshotted the old table finish against it;
    /// the old shards are freed when the last such reader lets go.
    pub fn clear(&self) {
        *self.table.write() = Arc::new(Table::new(self.shard_count));
    }

    /// Visits every binding, shard by shard.
    ///
    /// Each shard's shared lock is held while that shard is visited, so
    /// the consumer must not re-enter the map in a way that needs an
    /// exclusive lock on the shard it is being called from. Returning
    /// `false` stops the iteration after the current shard is released.
    /// Keys inserted concurrently into shards not yet visited may or may
    /// not be observed.
    pub fn for_each(&self, mut consumer: impl FnMut(&Bytes, &V) -> bool) {
        let table = self.current();
        'shards: for shard in &table.shards {
            let entries = shard.entries.read();
            for (key, value) in entries.iter() {
                if !consumer(key, value) {
                    break 'shards;
                }
            }
        }
    }

    /// Returns every key, in no particular order.
    ///
    /// The result buffer is pre-sized from `len()` and may grow past that
    /// if keys are inserted concurrently during the walk.
    pub fn keys(&self) -> Vec<Bytes> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.clone());
            true
        });
        keys
    }

    /// Returns `limit` keys sampled uniformly over shards; the result may
    /// contain duplicates. If `limit` covers the whole map, this is just
    /// [`keys`](Self::keys).
    ///
    /// Empty shards are resampled, so the caller must ensure the map is
    /// non-empty for the duration of the call.
    pub fn random_keys(&self, limit: usize) -> Vec<Bytes> {
        if limit >= self.len() {
            return self.keys();
        }
        let table = self.current();
        let mut rng = rand::rng();
        let mut result = Vec::with_capacity(limit);
        while result.len() < limit {
            let shard = &table.shards[rng.random_range(0..table.shards.len())];
            if let Some(key) = shard.any_key() {
                result.push(key);
            }
        }
        result
    }

    /// Returns up to `limit` distinct keys sampled uniformly over shards.
    ///
    /// Sampling retries until `limit` distinct keys are collected, with a
    /// bounded attempt budget: if the map shrinks concurrently and the
    /// sampler stops making progress, the remainder is filled from a full
    /// scan and the result may hold fewer than `limit` keys.
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<Bytes> {
        if limit >= self.len() {
            return self.keys();
        }
        let table = self.current();
        let mut rng = rand::rng();
        let mut seen: HashSet<Bytes> = HashSet::with_capacity(limit);
        let mut result = Vec::with_capacity(limit);
        let budget = limit.saturating_mul(SAMPLE_ATTEMPTS_PER_KEY);
        let mut attempts = 0;
        while result.len() < limit {
            attempts += 1;
            if attempts > budget {
                for key in self.keys() {
                    if seen.insert(key.clone()) {
                        result.push(key);
                        if result.len() == limit {
                            break;
                        }
                    }
                }
                break;
            }
            let shard = &table.shards[rng.random_range(0..table.shards.len())];
            if let Some(key) = shard.any_key() {
                if seen.insert(key.clone()) {
                    result.push(key);
                }
            }
        }
        result
    }
}

impl<V> std::fmt::Debug for ShardedMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shards", &self.shard_count)
            .field("count", &self.table.read().count.load(Ordering::Relaxed))
            .finish()
    }
}
