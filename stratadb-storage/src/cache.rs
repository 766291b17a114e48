// SPDX-License-Identifier: AGPL-3.0-or-later
// StrataDB - Columnar Tablet Storage Engine
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Sharded LRU cache for fixed-charge objects (decoded index and data
//! blocks).
//!
//! ## Shape
//!
//! ```text
//!                hash(key) ── top 4 bits ──► shard
//!  ┌───────────────────────── one shard (one mutex) ────────────────────┐
//!  │  chained hash table            circular LRU list (dummy head)      │
//!  │  buckets: next_pow2(elems)     head.prev = newest, head.next = old │
//!  │  [ ]─►entry─►entry             entry.refs: cache +1, callers +n    │
//!  └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries are heap-allocated nodes threaded through both an intrusive
//! hash chain and an intrusive doubly linked LRU list. An entry is born
//! with two references: one for the cache and one for the returned
//! handle. Eviction drops only the cache's reference, so a handle stays
//! valid — content-stable, never freed — until the caller releases it;
//! the deleter runs exactly once, when the last reference goes away, and
//! the memory tracker is credited at the same moment.
//!
//! Insertion wins: a new entry for an existing key displaces the old one
//! unconditionally, and entries evict oldest-first while `usage` exceeds
//! the shard capacity. The one entry never evicted is the one just
//! inserted, so a single oversized insert can leave `usage` above
//! capacity until something else displaces it.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;

use stratadb_core::MemTracker;

/// log2 of the shard count.
pub const SHARD_BITS: u32 = 4;

/// Number of independent LRU shards.
pub const NUM_SHARDS: usize = 1 << SHARD_BITS;

/// Callback invoked exactly once per entry when its last reference is
/// released; receives the key and the owned value.
pub type CacheDeleter<T> = Arc<dyn Fn(&[u8], T) + Send + Sync>;

struct LruEntry<T> {
    /// Present from insertion until the final unref.
    value: Option<T>,
    deleter: Option<CacheDeleter<T>>,
    charge: usize,
    /// Full 32-bit hash; compared before key bytes and used to recover
    /// the owning shard on release.
    hash: u32,
    /// Guarded by the shard mutex.
    refs: u32,
    key: Box<[u8]>,
    next_hash: *mut LruEntry<T>,
    prev: *mut LruEntry<T>,
    next: *mut LruEntry<T>,
}

/// An outstanding reference to a cache entry. Must be given back through
/// [`ShardedLruCache::release`]; the entry's value stays readable and
/// pinned in memory until then.
pub struct CacheHandle<T>(NonNull<LruEntry<T>>);

unsafe impl<T: Send> Send for CacheHandle<T> {}
unsafe impl<T: Sync> Sync for CacheHandle<T> {}

impl<T> CacheHandle<T> {
    fn hash(&self) -> u32 {
        unsafe { self.0.as_ref().hash }
    }
}

/// Chained hash table over intrusive entries. Buckets are kept at
/// `next_pow2(elems)` so the average chain length stays at or below one;
/// resizing relinks nodes in place and never moves an entry.
struct HandleTable<T> {
    buckets: Vec<*mut LruEntry<T>>,
    elems: usize,
}

impl<T> HandleTable<T> {
    fn new() -> Self {
        Self {
            buckets: vec![ptr::null_mut(); 4],
            elems: 0,
        }
    }

    /// Slot that points at the entry matching `(hash, key)`, or at the
    /// terminating null of its chain. The hash field rejects mismatches
    /// before any key comparison.
    fn find_pointer(&mut self, key: &[u8], hash: u32) -> *mut *mut LruEntry<T> {
        let idx = (hash as usize) & (self.buckets.len() - 1);
        let mut slot: *mut *mut LruEntry<T> = &mut self.buckets[idx];
        unsafe {
            while !(*slot).is_null() && ((**slot).hash != hash || &*(**slot).key != key) {
                slot = &mut (**slot).next_hash;
            }
        }
        slot
    }

    fn lookup(&mut self, key: &[u8], hash: u32) -> *mut LruEntry<T> {
        unsafe { *self.find_pointer(key, hash) }
    }

    /// Link `e`, returning the displaced entry for the same key (null if
    /// none).
    fn insert(&mut self, e: *mut LruEntry<T>) -> *mut LruEntry<T> {
        unsafe {
            let key: &[u8] = &(*e).key;
            let slot = self.find_pointer(key, (*e).hash);
            let old = *slot;
            (*e).next_hash = if old.is_null() {
                ptr::null_mut()
            } else {
                (*old).next_hash
            };
            *slot = e;
            if old.is_null() {
                self.elems += 1;
                if self.elems > self.buckets.len() {
                    self.resize();
                }
            }
            old
        }
    }

    fn remove(&mut self, key: &[u8], hash: u32) -> *mut LruEntry<T> {
        unsafe {
            let slot = self.find_pointer(key, hash);
            let result = *slot;
            if !result.is_null() {
                *slot = (*result).next_hash;
                self.elems -= 1;
            }
            result
        }
    }

    fn resize(&mut self) {
        let mut new_len = 4;
        while new_len < self.elems {
            new_len *= 2;
        }
        let mut new_buckets: Vec<*mut LruEntry<T>> = vec![ptr::null_mut(); new_len];
        let mut count = 0;
        for bucket in &self.buckets {
            let mut e = *bucket;
            unsafe {
                while !e.is_null() {
                    let next = (*e).next_hash;
                    let idx = ((*e).hash as usize) & (new_len - 1);
                    (*e).next_hash = new_buckets[idx];
                    new_buckets[idx] = e;
                    e = next;
                    count += 1;
                }
            }
        }
        debug_assert_eq!(count, self.elems);
        self.buckets = new_buckets;
    }
}

struct ShardState<T> {
    usage: usize,
    /// Dummy head of the circular LRU list.
    lru: *mut LruEntry<T>,
    table: HandleTable<T>,
}

impl<T> ShardState<T> {
    unsafe fn lru_remove(e: *mut LruEntry<T>) {
        (*(*e).next).prev = (*e).prev;
        (*(*e).prev).next = (*e).next;
    }

    /// Splice `e` in as the newest entry (just before the dummy head).
    unsafe fn lru_append(&mut self, e: *mut LruEntry<T>) {
        (*e).next = self.lru;
        (*e).prev = (*self.lru).prev;
        (*(*e).prev).next = e;
        (*(*e).next).prev = e;
    }

    /// Drop one reference; at zero the deleter runs, the tracker is
    /// credited, and the node is freed.
    unsafe fn unref(&mut self, e: *mut LruEntry<T>, tracker: &MemTracker) {
        debug_assert!((*e).refs > 0);
        (*e).refs -= 1;
        if (*e).refs == 0 {
            self.usage -= (*e).charge;
            tracker.release((*e).charge as i64);
            let mut node = Box::from_raw(e);
            let value = node.value.take().expect("cache entry value already taken");
            if let Some(deleter) = node.deleter.take() {
                deleter(&node.key, value);
            }
        }
    }
}

/// A single LRU shard; every operation runs under its one mutex.
pub struct LruCacheShard<T> {
    capacity: usize,
    mem_tracker: Arc<MemTracker>,
    state: Mutex<ShardState<T>>,
}

unsafe impl<T: Send> Send for LruCacheShard<T> {}
unsafe impl<T: Send> Sync for LruCacheShard<T> {}

impl<T> LruCacheShard<T> {
    fn new(capacity: usize, mem_tracker: Arc<MemTracker>) -> Self {
        let head = Box::into_raw(Box::new(LruEntry::<T> {
            value: None,
            deleter: None,
            charge: 0,
            hash: 0,
            refs: 0,
            key: Box::from(&[][..]),
            next_hash: ptr::null_mut(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }));
        unsafe {
            (*head).next = head;
            (*head).prev = head;
        }
        Self {
            capacity,
            mem_tracker,
            state: Mutex::new(ShardState {
                usage: 0,
                lru: head,
                table: HandleTable::new(),
            }),
        }
    }

    fn insert(
        &self,
        key: &[u8],
        hash: u32,
        value: T,
        charge: usize,
        deleter: Option<CacheDeleter<T>>,
    ) -> CacheHandle<T> {
        let e = Box::into_raw(Box::new(LruEntry {
            value: Some(value),
            deleter,
            charge,
            hash,
            // One reference for the cache, one for the returned handle.
            refs: 2,
            key: Box::from(key),
            next_hash: ptr::null_mut(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }));

        let mut state = self.state.lock();
        self.mem_tracker.consume(charge as i64);
        unsafe {
            state.lru_append(e);
            state.usage += charge;

            let old = state.table.insert(e);
            if !old.is_null() {
                ShardState::<T>::lru_remove(old);
                state.unref(old, &self.mem_tracker);
            }

            // Never evict `e` itself: an oversized insert may leave usage
            // above capacity until a later insert displaces it.
            while state.usage > self.capacity
                && (*state.lru).next != state.lru
                && (*state.lru).next != e
            {
                let oldest = (*state.lru).next;
                ShardState::<T>::lru_remove(oldest);
                let oldest_key: &[u8] = &(*oldest).key;
                let removed = state.table.remove(oldest_key, (*oldest).hash);
                debug_assert_eq!(removed, oldest);
                state.unref(oldest, &self.mem_tracker);
            }

            CacheHandle(NonNull::new_unchecked(e))
        }
    }

    fn lookup(&self, key: &[u8], hash: u32) -> Option<CacheHandle<T>> {
        let mut state = self.state.lock();
        unsafe {
            let e = state.table.lookup(key, hash);
            if e.is_null() {
                return None;
            }
            (*e).refs += 1;
            ShardState::<T>::lru_remove(e);
            state.lru_append(e);
            Some(CacheHandle(NonNull::new_unchecked(e)))
        }
    }

    fn release(&self, handle: CacheHandle<T>) {
        let e = handle.0.as_ptr();
        let mut state = self.state.lock();
        unsafe { state.unref(e, &self.mem_tracker) };
    }

    fn erase(&self, key: &[u8], hash: u32) {
        let mut state = self.state.lock();
        unsafe {
            let e = state.table.remove(key, hash);
            if !e.is_null() {
                ShardState::<T>::lru_remove(e);
                state.unref(e, &self.mem_tracker);
            }
        }
    }

    fn usage(&self) -> usize {
        self.state.lock().usage
    }
}

impl<T> Drop for LruCacheShard<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        unsafe {
            let head = state.lru;
            let mut e = (*head).next;
            while e != head {
                let next = (*e).next;
                // A remaining entry must hold exactly the cache's own
                // reference; anything higher means a leaked handle.
                debug_assert_eq!((*e).refs, 1, "cache dropped with outstanding handles");
                state.unref(e, &self.mem_tracker);
                e = next;
            }
            drop(Box::from_raw(head));
        }
    }
}

/// Hash-sharded façade over [`NUM_SHARDS`] independent LRU shards.
pub struct ShardedLruCache<T> {
    mem_tracker: Arc<MemTracker>,
    shards: Vec<LruCacheShard<T>>,
    last_id: Mutex<u64>,
}

fn hash_key(key: &[u8]) -> u32 {
    // 64-bit hash truncated to the 32 bits the entries store.
    twox_hash::xxh3::hash64(key) as u32
}

fn shard_index(hash: u32) -> usize {
    (hash >> (32 - SHARD_BITS)) as usize
}

impl<T> ShardedLruCache<T> {
    /// A cache of `capacity` total charge units, split evenly (rounding
    /// up) across the shards.
    pub fn new(capacity: usize) -> ShardedLruCache<T> {
        let mem_tracker = MemTracker::root("sharded_lru_cache");
        let per_shard = capacity.div_ceil(NUM_SHARDS);
        let shards = (0..NUM_SHARDS)
            .map(|_| LruCacheShard::new(per_shard, Arc::clone(&mem_tracker)))
            .collect();
        ShardedLruCache {
            mem_tracker,
            shards,
            last_id: Mutex::new(0),
        }
    }

    /// Insert unconditionally, displacing any previous entry for the key,
    /// and return a handle holding one reference. Never fails; an
    /// over-capacity insert evicts instead.
    pub fn insert(
        &self,
        key: &[u8],
        value: T,
        charge: usize,
        deleter: Option<CacheDeleter<T>>,
    ) -> CacheHandle<T> {
        let hash = hash_key(key);
        self.shards[shard_index(hash)].insert(key, hash, value, charge, deleter)
    }

    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle<T>> {
        let hash = hash_key(key);
        self.shards[shard_index(hash)].lookup(key, hash)
    }

    /// Return a handle's reference. The owning shard is recovered from
    /// the hash stored in the entry.
    pub fn release(&self, handle: CacheHandle<T>) {
        let hash = handle.hash();
        self.shards[shard_index(hash)].release(handle)
    }

    /// Drop the cache's own reference to `key`, if present. Outstanding
    /// handles keep the entry alive.
    pub fn erase(&self, key: &[u8]) {
        let hash = hash_key(key);
        self.shards[shard_index(hash)].erase(key, hash)
    }

    /// The value behind a handle; stable for the handle's lifetime.
    pub fn value<'a>(&self, handle: &'a CacheHandle<T>) -> &'a T {
        match unsafe { &handle.0.as_ref().value } {
            Some(v) => v,
            None => unreachable!("live handle to a freed cache entry"),
        }
    }

    /// Process-unique monotonically increasing id, for namespacing cache
    /// keys between callers.
    pub fn new_id(&self) -> u64 {
        let mut id = self.last_id.lock();
        *id += 1;
        *id
    }

    /// Total charge currently accounted across all shards.
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|s| s.usage()).sum()
    }

    /// Per-shard charge totals, in shard order. Diagnostic: a healthy
    /// hash keeps these close to uniform.
    pub fn shard_usages(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.usage()).collect()
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Single-shard cache so LRU order is deterministic in tests.
    fn single_shard(capacity: usize) -> LruCacheShard<u64> {
        LruCacheShard::new(capacity, MemTracker::root("cache-test"))
    }

    fn put(shard: &LruCacheShard<u64>, key: &[u8], value: u64) {
        let h = shard.insert(key, hash_key(key), value, 1, None);
        shard.release(h);
    }

    fn get(shard: &LruCacheShard<u64>, key: &[u8]) -> Option<u64> {
        shard.lookup(key, hash_key(key)).map(|h| {
            let v = unsafe { h.0.as_ref().value.unwrap() };
            shard.release(h);
            v
        })
    }

    #[test]
    fn test_insert_lookup_roundtrip() {
        let shard = single_shard(8);
        put(&shard, b"a", 1);
        put(&shard, b"b", 2);
        assert_eq!(get(&shard, b"a"), Some(1));
        assert_eq!(get(&shard, b"b"), Some(2));
        assert_eq!(get(&shard, b"c"), None);
        assert_eq!(shard.usage(), 2);
    }

    #[test]
    fn test_lru_eviction_order_with_lookup_promotion() {
        let shard = single_shard(3);
        put(&shard, b"a", 1);
        put(&shard, b"b", 2);
        put(&shard, b"c", 3);
        // Touch "a" so "b" is now the oldest.
        assert_eq!(get(&shard, b"a"), Some(1));
        put(&shard, b"d", 4);
        assert_eq!(get(&shard, b"b"), None);
        assert_eq!(get(&shard, b"a"), Some(1));
        assert_eq!(get(&shard, b"c"), Some(3));
        assert_eq!(get(&shard, b"d"), Some(4));
    }

    #[test]
    fn test_fill_touch_then_evict_oldest_untouched() {
        let shard = single_shard(3);
        for (k, v) in [(b"A", 1u64), (b"B", 2), (b"C", 3), (b"D", 4)] {
            put(&shard, k, v);
        }
        // A was the oldest of the first three and fell out when D landed.
        assert_eq!(get(&shard, b"A"), None);
        assert_eq!(get(&shard, b"B"), Some(2));
        assert_eq!(get(&shard, b"C"), Some(3));
        assert_eq!(get(&shard, b"D"), Some(4));
        // The lookups re-ordered recency to B < C < D, so E displaces B.
        put(&shard, b"E", 5);
        assert_eq!(get(&shard, b"B"), None);
        assert_eq!(get(&shard, b"C"), Some(3));
    }

    #[test]
    fn test_duplicate_insert_displaces_old_entry() {
        let shard = single_shard(8);
        put(&shard, b"k", 1);
        put(&shard, b"k", 2);
        assert_eq!(get(&shard, b"k"), Some(2));
        assert_eq!(shard.usage(), 1);
    }

    #[test]
    fn test_oversized_insert_overflows_then_recovers() {
        let shard = single_shard(5);
        let h = shard.insert(b"big", hash_key(b"big"), 1, 10, None);
        shard.release(h);
        // The just-inserted entry is never self-evicted.
        assert_eq!(shard.usage(), 10);
        assert_eq!(get(&shard, b"big"), Some(1));

        // The next insert evicts it, restoring the invariant.
        let h = shard.insert(b"small", hash_key(b"small"), 2, 1, None);
        shard.release(h);
        assert_eq!(shard.usage(), 1);
        assert_eq!(get(&shard, b"big"), None);
    }

    #[test]
    fn test_handle_pins_entry_across_eviction() {
        let shard = single_shard(1);
        let pinned = shard.insert(b"p", hash_key(b"p"), 42, 1, None);
        // Evict "p" from the cache while the caller still holds it.
        put(&shard, b"q", 7);
        assert_eq!(get(&shard, b"p"), None);
        assert_eq!(unsafe { pinned.0.as_ref().value.unwrap() }, 42);
        shard.release(pinned);
    }

    #[test]
    fn test_erase_removes_cache_reference() {
        let shard = single_shard(8);
        put(&shard, b"a", 1);
        shard.erase(b"a", hash_key(b"a"));
        assert_eq!(get(&shard, b"a"), None);
        assert_eq!(shard.usage(), 0);
        // Erasing an absent key is a no-op.
        shard.erase(b"a", hash_key(b"a"));
    }

    #[test]
    fn test_deleter_runs_exactly_once_per_entry() {
        static DELETED: AtomicUsize = AtomicUsize::new(0);
        let deleter: CacheDeleter<u64> =
            Arc::new(|_k: &[u8], _v: u64| {
                DELETED.fetch_add(1, Ordering::SeqCst);
            });
        {
            let shard = single_shard(2);
            for i in 0..5u64 {
                let key = [i as u8];
                let h = shard.insert(&key, hash_key(&key), i, 1, Some(Arc::clone(&deleter)));
                shard.release(h);
            }
            // Three already evicted; the rest die with the shard.
            assert_eq!(DELETED.load(Ordering::SeqCst), 3);
        }
        assert_eq!(DELETED.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_tracker_accounting_matches_live_charges() {
        let tracker = MemTracker::root("cache-acct");
        let shard = LruCacheShard::<u64>::new(4, Arc::clone(&tracker));
        for i in 0..4u64 {
            let key = [i as u8];
            let h = shard.insert(&key, hash_key(&key), i, 1, None);
            shard.release(h);
        }
        assert_eq!(tracker.consumption(), 4);
        shard.erase(&[0], hash_key(&[0]));
        assert_eq!(tracker.consumption(), 3);
        drop(shard);
        assert_eq!(tracker.consumption(), 0);
    }

    #[test]
    fn test_sharded_facade_and_new_id() {
        let cache: ShardedLruCache<String> = ShardedLruCache::new(1024);
        let h = cache.insert(b"blk:1", "payload".to_string(), 1, None);
        assert_eq!(cache.value(&h), "payload");
        cache.release(h);

        let h = cache.lookup(b"blk:1").expect("present");
        assert_eq!(cache.value(&h), "payload");
        cache.release(h);

        cache.erase(b"blk:1");
        assert!(cache.lookup(b"blk:1").is_none());

        assert_eq!(cache.new_id(), 1);
        assert_eq!(cache.new_id(), 2);
        assert_eq!(cache.mem_tracker().id(), "sharded_lru_cache");
    }
}
