//! Striped Key Locking
//!
//! This module implements a fixed-size table of reader/writer locks onto
//! which keys are hashed. It gives multi-key commands key-granularity
//! locking with a bounded number of locks, independent of how many keys
//! the keyspace holds.
//!
//! ## Deadlock Avoidance
//!
//! Bulk operations never acquire stripes in caller order. Every input key
//! is mapped to its stripe, stripes are de-duplicated, and acquisition
//! proceeds in ascending stripe order (release in descending order). Two
//! overlapping bulk acquisitions therefore agree on a total order and
//! cannot deadlock each other.
//!
//! ## Stripe Equivalence
//!
//! The stripe of a key is `fnv1a_32(key) & (table_size - 1)` - the same
//! formula the sharded map uses for shard selection. Constructing the
//! table with the map's shard count makes stripe and shard identical for
//! every key.
//!
//! ## Explicit Release
//!
//! Acquire and release are separate calls: a command handler locks its
//! keys, runs against the storage layer, and unlocks. Acquired guards are
//! forgotten and released later through `force_unlock_*`; releasing a
//! stripe that is not held is a programmer error and not recoverable.

use crate::storage::hash::fnv1a_32;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::mem;

/// A fixed array of reader/writer locks with stable key-to-stripe routing.
///
/// The table is sized once at construction and shared process-wide, the
/// same way the sharded map is. All operations may block for an unbounded
/// time; there is no timeout primitive at this layer.
pub struct LockTable {
    table: Vec<RwLock<()>>,
}

impl LockTable {
    /// Creates a lock table with `table_size` stripes.
    ///
    /// `table_size` must be a power of two so the stripe mask is exact;
    /// callers normally pass the sharded map's shard count.
    pub fn new(table_size: usize) -> Self {
        assert!(
            table_size.is_power_of_two(),
            "lock table size must be a power of two, got {table_size}"
        );
        let table = (0..table_size).map(|_| RwLock::new(())).collect();
        Self { table }
    }

    /// Returns the number of stripes.
    pub fn table_size(&self) -> usize {
        self.table.len()
    }

    #[inline]
    fn stripe(&self, key: &[u8]) -> usize {
        (fnv1a_32(key) as usize) & (self.table.len() - 1)
    }

    /// Acquires the exclusive lock for one key's stripe.
    pub fn lock_one(&self, key: &[u8]) {
        mem::forget(self.table[self.stripe(key)].write());
    }

    /// Acquires the shared lock for one key's stripe.
    pub fn rlock_one(&self, key: &[u8]) {
        mem::forget(self.table[self.stripe(key)].read());
    }

    /// Releases the exclusive lock for one key's stripe.
    pub fn unlock_one(&self, key: &[u8]) {
        // SAFETY: the caller acquired this stripe with `lock_one` (or a bulk
        // write acquire covering it) and has not released it since.
        unsafe { self.table[self.stripe(key)].force_unlock_write() }
    }

    /// Releases the shared lock for one key's stripe.
    pub fn runlock_one(&self, key: &[u8]) {
        // SAFETY: the caller acquired this stripe with `rlock_one` (or a bulk
        // read acquire covering it) and has not released it since.
        unsafe { self.table[self.stripe(key)].force_unlock_read() }
    }

    /// Maps keys to stripes, de-duplicated, sorted ascending for acquire
    /// or descending for release.
    fn stripes<K: AsRef<[u8]>>(&self, keys: &[K], reverse: bool) -> Vec<usize> {
        let mut indices: Vec<usize> = keys.iter().map(|k| self.stripe(k.as_ref())).collect();
        indices.sort_unstable();
        indices.dedup();
        if reverse {
            indices.reverse();
        }
        indices
    }

    /// Acquires the exclusive lock for every distinct stripe of `keys`.
    ///
    /// Each stripe is taken exactly once, in ascending order; keys that
    /// collide on a stripe share a single acquisition.
    pub fn lock_many<K: AsRef<[u8]>>(&self, keys: &[K]) {
        for index in self.stripes(keys, false) {
            mem::forget(self.table[index].write());
        }
    }

    /// Acquires the shared lock for every distinct stripe of `keys`.
    pub fn rlock_many<K: AsRef<[u8]>>(&self, keys: &[K]) {
        for index in self.stripes(keys, false) {
            mem::forget(self.table[index].read());
        }
    }

    /// Releases the exclusive lock for every distinct stripe of `keys`,
    /// in descending order.
    pub fn unlock_many<K: AsRef<[u8]>>(&self, keys: &[K]) {
        for index in self.stripes(keys, true) {
            // SAFETY: each distinct stripe was write-locked by the matching
            // `lock_many` call and is released exactly once here.
            unsafe { self.table[index].force_unlock_write() }
        }
    }

    /// Releases the shared lock for every distinct stripe of `keys`,
    /// in descending order.
    pub fn runlock_many<K: AsRef<[u8]>>(&self, keys: &[K]) {
        for index in self.stripes(keys, true) {
            // SAFETY: each distinct stripe was read-locked by the matching
            // `rlock_many` call and is released exactly once here.
            unsafe { self.table[index].force_unlock_read() }
        }
    }

    /// Acquires locks for a mixed read/write key set.
    ///
    /// A stripe is taken exclusively if any of its keys appears in
    /// `write_keys`, shared otherwise. A key listed in both sets gets the
    /// exclusive lock, the safe superset. Duplicate keys are allowed.
    pub fn rwlock<K: AsRef<[u8]>>(&self, write_keys: &[K], read_keys: &[K]) {
        let write_set = self.write_stripe_set(write_keys);
        for index in self.union_stripes(write_keys, read_keys, false) {
            if write_set.contains(&index) {
                mem::forget(self.table[index].write());
            } else {
                mem::forget(self.table[index].read());
            }
        }
    }

    /// Releases locks taken by a matching [`rwlock`](Self::rwlock) call,
    /// in descending stripe order.
    pub fn rwunlock<K: AsRef<[u8]>>(&self, write_keys: &[K], read_keys: &[K]) {
        let write_set = self.write_stripe_set(write_keys);
        for index in self.union_stripes(write_keys, read_keys, true) {
            if write_set.contains(&index) {
                // SAFETY: stripes with a write key were write-locked by the
                // matching `rwlock` call.
                unsafe { self.table[index].force_unlock_write() }
            } else {
                // SAFETY: the remaining stripes were read-locked by the
                // matching `rwlock` call.
                unsafe { self.table[index].force_unlock_read() }
            }
        }
    }

    fn write_stripe_set<K: AsRef<[u8]>>(&self, write_keys: &[K]) -> HashSet<usize> {
        write_keys.iter().map(|k| self.stripe(k.as_ref())).collect()
    }

    fn union_stripes<K: AsRef<[u8]>>(
        &self,
        write_keys: &[K],
        read_keys: &[K],
        reverse: bool,
    ) -> Vec<usize> {
        let mut indices: Vec<usize> = write_keys
            .iter()
            .chain(read_keys.iter())
            .map(|k| self.stripe(k.as_ref()))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        if reverse {
            indices.reverse();
        }
        indices
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("stripes", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_stripe_ordering() {
        let locks = LockTable::new(4);

        // "alpha" and "b" land on stripes 3 and 1 under fnv1a_32 & 3.
        assert_eq!(locks.stripe(b"alpha"), 3);
        assert_eq!(locks.stripe(b"b"), 1);

        // Acquisition order is ascending regardless of caller order,
        // release order descending.
        assert_eq!(locks.stripes(&["alpha", "b"], false), vec![1, 3]);
        assert_eq!(locks.stripes(&["alpha", "b"], true), vec![3, 1]);
    }

    #[test]
    fn test_stripes_deduplicate() {
        let locks = LockTable::new(4);
        let stripes = locks.stripes(&["alpha", "alpha", "b", "b"], false);
        assert_eq!(stripes, vec![1, 3]);
    }

    #[test]
    fn test_lock_unlock_one() {
        let locks = LockTable::new(16);
        locks.lock_one(b"key");
        locks.unlock_one(b"key");
        // The stripe is free again: a second exclusive acquire must not block.
        locks.lock_one(b"key");
        locks.unlock_one(b"key");
    }

    #[test]
    fn test_shared_locks_coexist() {
        let locks = LockTable::new(16);
        locks.rlock_one(b"key");
        locks.rlock_one(b"key");
        locks.runlock_one(b"key");
        locks.runlock_one(b"key");
    }

    #[test]
    fn test_lock_many_balanced() {
        let locks = LockTable::new(4);
        // Keys colliding on a stripe must be acquired once; a double
        // acquire would self-deadlock right here.
        locks.lock_many(&["alpha", "alpha", "b"]);
        locks.unlock_many(&["alpha", "alpha", "b"]);
        locks.lock_many(&["alpha", "b"]);
        locks.unlock_many(&["alpha", "b"]);
    }

    #[test]
    fn test_rlock_many_balanced() {
        let locks = LockTable::new(4);
        locks.rlock_many(&["a", "b", "c"]);
        locks.runlock_many(&["a", "b", "c"]);
        locks.lock_many(&["a", "b", "c"]);
        locks.unlock_many(&["a", "b", "c"]);
    }

    #[test]
    fn test_rwlock_write_wins_over_read() {
        let locks = Arc::new(LockTable::new(16));

        // The same key in both lists takes the exclusive lock.
        locks.rwlock(&["k"], &["k"]);

        let (tx, rx) = mpsc::channel();
        let reader = Arc::clone(&locks);
        let handle = thread::spawn(move || {
            reader.rlock_one(b"k");
            tx.send(()).unwrap();
            reader.runlock_one(b"k");
        });

        // The shared acquire must block while the stripe is exclusive.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        locks.rwunlock(&["k"], &["k"]);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_rwlock_mixed_balanced() {
        let locks = LockTable::new(4);
        locks.rwlock(&["alpha"], &["b"]);
        locks.rwunlock(&["alpha"], &["b"]);
        // Every stripe must be free afterwards.
        locks.lock_many(&["alpha", "b"]);
        locks.unlock_many(&["alpha", "b"]);
    }

    #[test]
    fn test_overlapping_bulk_acquires_do_not_deadlock() {
        let locks = Arc::new(LockTable::new(16));
        let mut handles = Vec::new();

        // Two key sets that overlap on several stripes, locked in opposite
        // caller order from two threads. The ascending stripe order makes
        // this safe; without it this test would wedge.
        for keys in [["a", "b", "c"], ["c", "b", "d"]] {
            let locks = Arc::clone(&locks);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    locks.lock_many(&keys);
                    locks.unlock_many(&keys);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_power_of_two() {
        let _ = LockTable::new(10);
    }
}
