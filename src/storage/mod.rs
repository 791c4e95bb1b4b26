//! Concurrent storage core.
//!
//! Three containers and the hash that ties two of them together:
//!
//! - [`ShardedMap`]: the keyspace - a map partitioned over power-of-two
//!   many shards, each behind its own reader/writer lock.
//! - [`LockTable`]: striped key locks for multi-key commands, using the
//!   same key-to-stripe routing as the map.
//! - [`QuickList`]: the value-side paged list with O(1) pushes, O(n/P)
//!   indexed access, and split-on-full insertion.
//!
//! The map and the lock table are process-lifetime objects constructed
//! once by the owning server; the quicklist lives inside map values and
//! is guarded by whatever stripe lock the caller holds.

pub mod dict;
pub mod hash;
pub mod locks;
pub mod quicklist;

pub use dict::ShardedMap;
pub use hash::fnv1a_32;
pub use locks::LockTable;
pub use quicklist::{QuickList, PAGE_SIZE};
