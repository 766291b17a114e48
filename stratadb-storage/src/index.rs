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

//! Concurrent Sorted Index
//!
//! Ordered map from encoded key bytes to a pointer-sized value slot,
//! built for the row-store write path: many concurrent point inserts,
//! lock-free ordered scans.
//!
//! ## Structure
//!
//! ```text
//! routing (RwLock<BTreeMap>): "" ──► [leaf]   "m" ──► [leaf]   ...
//!                                      │                 │
//!                                      ▼                 ▼
//!                     ┌──────────────────────┐   ┌──────────────────┐
//!                     │ Leaf                 │   │ Leaf             │
//!                     │  write spinlock      │──►│  (next sibling)  │──► ...
//!                     │  version counter     │   └──────────────────┘
//!                     │  snapshot (epoch):   │
//!                     │   sorted items       │
//!                     │   high_key / next    │
//!                     └──────────────────────┘
//! ```
//!
//! Each leaf owns a sorted run of entries. The current entry array is an
//! immutable snapshot published through `crossbeam-epoch`: writers hold
//! the leaf's spinlock, build the successor array, and release-publish it;
//! readers pin an epoch guard and traverse without locks, never observing
//! a torn array. Publication replaces the classic per-slot retry loop —
//! the version counter still advances on every publish, but a reader
//! never needs to re-read a slot.
//!
//! Writers to different leaves touch disjoint locks, so disjoint key
//! regions do not contend. Leaves split at a fixed fan-out; the routing
//! map is only an accelerator. Correct placement is guaranteed by the
//! B-link invariant: every leaf snapshot carries its exclusive upper
//! bound (`high_key`) and a pointer to its right sibling, and both
//! readers and writers move right whenever the probe key is at or past
//! the bound.
//!
//! Keys are unique and are never removed; deletion is a logical state of
//! the value, not of the index entry.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use stratadb_core::EncodedKey;

/// Split threshold: a leaf holding more entries than this hands its upper
/// half to a new right sibling.
const LEAF_MAX_ENTRIES: usize = 64;

/// Immutable, epoch-published contents of one leaf.
struct LeafSnapshot<V> {
    /// Entries sorted by key.
    items: Vec<(EncodedKey, V)>,
    /// Exclusive upper bound; `None` on the rightmost leaf.
    high_key: Option<EncodedKey>,
    /// Right sibling; `None` on the rightmost leaf.
    next: Option<Arc<Leaf<V>>>,
}

struct Leaf<V> {
    /// Writer lock. Held for the duration of a prepared mutation; reads
    /// never take it.
    locked: AtomicBool,
    /// Bumped on every snapshot publication.
    version: AtomicU64,
    snap: Atomic<LeafSnapshot<V>>,
}

impl<V> Leaf<V> {
    fn with_snapshot(snapshot: LeafSnapshot<V>) -> Arc<Leaf<V>> {
        Arc::new(Leaf {
            locked: AtomicBool::new(false),
            version: AtomicU64::new(0),
            snap: Atomic::new(snapshot),
        })
    }

    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Release-publish a new snapshot. Caller must hold the leaf lock.
    fn publish(&self, snapshot: LeafSnapshot<V>, guard: &Guard) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        let old = self.snap.swap(Owned::new(snapshot), Ordering::AcqRel, guard);
        self.version.fetch_add(1, Ordering::Release);
        unsafe { guard.defer_destroy(old) };
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl<V> Drop for Leaf<V> {
    fn drop(&mut self) {
        let snap = std::mem::replace(&mut self.snap, Atomic::null());
        unsafe { drop(snap.into_owned()) };
    }
}

/// Ordered concurrent map: encoded key → copyable value slot.
pub struct ConcurrentIndex<V> {
    /// Lower-bound key → leaf. The empty key always maps to the leftmost
    /// leaf, so every probe has a target.
    routing: RwLock<BTreeMap<Vec<u8>, Arc<Leaf<V>>>>,
    entry_count: AtomicUsize,
}

impl<V> Default for ConcurrentIndex<V>
where
    V: Copy + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ConcurrentIndex<V>
where
    V: Copy + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let first = Leaf::with_snapshot(LeafSnapshot {
            items: Vec::new(),
            high_key: None,
            next: None,
        });
        let mut routing = BTreeMap::new();
        routing.insert(Vec::new(), first);
        Self {
            routing: RwLock::new(routing),
            entry_count: AtomicUsize::new(0),
        }
    }

    /// Number of entries ever inserted (entries are never removed).
    pub fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Greatest-lower-bound leaf for `key` per the routing accelerator.
    /// The result may be stale across a concurrent split; callers follow
    /// `high_key`/`next` to the correct leaf.
    fn find_leaf(&self, key: &[u8]) -> Arc<Leaf<V>> {
        let routing = self.routing.read();
        let (_, leaf) = routing
            .range::<[u8], _>((std::ops::Bound::Unbounded, std::ops::Bound::Included(key)))
            .next_back()
            .expect("routing always contains the empty key");
        Arc::clone(leaf)
    }

    /// Locate `key`, taking the short-term writer lock on its leaf. The
    /// returned cursor holds the lock until dropped; an absent key can be
    /// inserted through it without re-traversal.
    pub fn prepare(&self, key: &[u8]) -> PreparedMutation<'_, V> {
        let mut leaf = self.find_leaf(key);
        leaf.lock();
        // Move right past any sibling split off since the routing lookup.
        loop {
            let guard = epoch::pin();
            let snap = unsafe { leaf.snap.load(Ordering::Acquire, &guard).deref() };
            let moved = match &snap.high_key {
                Some(h) if key >= h.as_slice() => {
                    let next = snap
                        .next
                        .clone()
                        .expect("bounded leaf always has a right sibling");
                    leaf.unlock();
                    next.lock();
                    Some(next)
                }
                _ => None,
            };
            match moved {
                Some(next) => leaf = next,
                None => {
                    let found = snap
                        .items
                        .binary_search_by(|(k, _)| k.as_slice().cmp(key));
                    let value = found.ok().map(|i| snap.items[i].1);
                    let mut probe = EncodedKey::new();
                    probe.extend_from_slice(key);
                    return PreparedMutation {
                        index: self,
                        leaf,
                        key: probe,
                        found,
                        value,
                    };
                }
            }
        }
    }

    /// Lock-free point lookup. Unlike `prepare`, this takes no lock and
    /// publishes nothing, so concurrent readers are unaffected.
    pub fn get(&self, key: &[u8]) -> Option<V> {
        let guard = epoch::pin();
        let mut leaf = self.find_leaf(key);
        loop {
            let snap = unsafe { leaf.snap.load(Ordering::Acquire, &guard).deref() };
            match &snap.high_key {
                Some(h) if key >= h.as_slice() => {
                    leaf = snap
                        .next
                        .clone()
                        .expect("bounded leaf always has a right sibling");
                }
                _ => {
                    return snap
                        .items
                        .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                        .ok()
                        .map(|i| snap.items[i].1);
                }
            }
        }
    }

    /// Forward iterator positioned at the first entry.
    pub fn iter(&self) -> IndexIterator<V> {
        let mut it = IndexIterator {
            items: Vec::new(),
            next_leaf: None,
            pos: 0,
        };
        let mut exact = false;
        it.seek_in(self, &[], &mut exact);
        it
    }

    /// Split `items` (already over the fan-out) between `leaf` and a new
    /// right sibling, then publish both sides. Caller holds the leaf lock.
    fn split_and_publish(
        &self,
        leaf: &Leaf<V>,
        mut items: Vec<(EncodedKey, V)>,
        high_key: Option<EncodedKey>,
        next: Option<Arc<Leaf<V>>>,
        guard: &Guard,
    ) {
        let mid = items.len() / 2;
        let right_items = items.split_off(mid);
        let split_key = right_items[0].0.clone();

        let right = Leaf::with_snapshot(LeafSnapshot {
            items: right_items,
            high_key,
            next,
        });

        // Make the sibling reachable through routing before shrinking the
        // left side, so probes between the two steps still find every key
        // either directly or through the B-link.
        self.routing
            .write()
            .insert(split_key.to_vec(), Arc::clone(&right));

        leaf.publish(
            LeafSnapshot {
                items,
                high_key: Some(split_key),
                next: Some(right),
            },
            guard,
        );
    }
}

/// A located key position whose leaf writer lock is held. Dropping the
/// cursor releases the lock.
pub struct PreparedMutation<'a, V>
where
    V: Copy + Send + Sync + 'static,
{
    index: &'a ConcurrentIndex<V>,
    leaf: Arc<Leaf<V>>,
    key: EncodedKey,
    found: Result<usize, usize>,
    value: Option<V>,
}

impl<'a, V> PreparedMutation<'a, V>
where
    V: Copy + Send + Sync + 'static,
{
    pub fn exists(&self) -> bool {
        self.found.is_ok()
    }

    /// The value slot at the prepared position. Only meaningful when
    /// `exists()`.
    pub fn current_value(&self) -> V {
        self.value.expect("current_value on an absent key")
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Insert a value at the prepared position. Returns false when the
    /// key already exists; under the held lock that is exactly the
    /// `exists()` case observed at prepare time.
    pub fn insert(self, value: V) -> bool {
        let pos = match self.found {
            Ok(_) => return false,
            Err(pos) => pos,
        };
        let guard = epoch::pin();
        let snap = unsafe { self.leaf.snap.load(Ordering::Acquire, &guard).deref() };

        let mut items = Vec::with_capacity(snap.items.len() + 1);
        items.extend_from_slice(&snap.items[..pos]);
        items.push((self.key.clone(), value));
        items.extend_from_slice(&snap.items[pos..]);

        if items.len() > LEAF_MAX_ENTRIES {
            self.index.split_and_publish(
                &self.leaf,
                items,
                snap.high_key.clone(),
                snap.next.clone(),
                &guard,
            );
        } else {
            self.leaf.publish(
                LeafSnapshot {
                    items,
                    high_key: snap.high_key.clone(),
                    next: snap.next.clone(),
                },
                &guard,
            );
        }
        self.index.entry_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Version of the underlying leaf at the time of the call; advances
    /// with every publication.
    pub fn leaf_version(&self) -> u64 {
        self.leaf.version()
    }
}

impl<'a, V> Drop for PreparedMutation<'a, V>
where
    V: Copy + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.leaf.unlock();
    }
}

/// Forward scan cursor. Each visited leaf is captured as one consistent
/// snapshot; entries inserted into an already-visited region during the
/// scan are not revisited.
pub struct IndexIterator<V> {
    items: Vec<(EncodedKey, V)>,
    next_leaf: Option<Arc<Leaf<V>>>,
    pos: usize,
}

impl<V> IndexIterator<V>
where
    V: Copy + Send + Sync + 'static,
{
    /// Position at the first entry whose key is `>= key`. Returns whether
    /// such an entry exists; `exact` reports an exact key match.
    pub fn seek_at_or_after(
        &mut self,
        index: &ConcurrentIndex<V>,
        key: &[u8],
        exact: &mut bool,
    ) -> bool {
        self.seek_in(index, key, exact)
    }

    fn seek_in(&mut self, index: &ConcurrentIndex<V>, key: &[u8], exact: &mut bool) -> bool {
        *exact = false;
        let guard = epoch::pin();
        let mut leaf = index.find_leaf(key);
        loop {
            let snap = unsafe { leaf.snap.load(Ordering::Acquire, &guard).deref() };
            if let Some(h) = &snap.high_key {
                if key >= h.as_slice() {
                    leaf = snap
                        .next
                        .clone()
                        .expect("bounded leaf always has a right sibling");
                    continue;
                }
            }
            match snap.items.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
                Ok(i) => {
                    *exact = true;
                    self.capture(snap, i);
                    return true;
                }
                Err(i) if i < snap.items.len() => {
                    self.capture(snap, i);
                    return true;
                }
                Err(_) => {
                    // All entries in this leaf sort below the probe; the
                    // answer, if any, starts at the right sibling.
                    self.capture(snap, snap.items.len());
                    return self.advance_leaf(&guard);
                }
            }
        }
    }

    fn capture(&mut self, snap: &LeafSnapshot<V>, pos: usize) {
        self.items = snap.items.clone();
        self.next_leaf = snap.next.clone();
        self.pos = pos;
    }

    /// Hop to the next non-empty leaf snapshot.
    fn advance_leaf(&mut self, guard: &Guard) -> bool {
        loop {
            let Some(leaf) = self.next_leaf.take() else {
                self.items.clear();
                self.pos = 0;
                return false;
            };
            let snap = unsafe { leaf.snap.load(Ordering::Acquire, guard).deref() };
            self.capture(snap, 0);
            if !self.items.is_empty() {
                return true;
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.pos < self.items.len()
    }

    /// Current entry; caller must check `is_valid` first.
    pub fn get_current_entry(&self) -> (&[u8], &V) {
        let (k, v) = &self.items[self.pos];
        (k.as_slice(), v)
    }

    /// Advance; returns whether the cursor is still valid.
    pub fn next(&mut self) -> bool {
        self.pos += 1;
        if self.pos < self.items.len() {
            return true;
        }
        let guard = epoch::pin();
        self.advance_leaf(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn insert(index: &ConcurrentIndex<u64>, k: &str, v: u64) -> bool {
        let prep = index.prepare(k.as_bytes());
        if prep.exists() {
            return false;
        }
        prep.insert(v)
    }

    fn collect(index: &ConcurrentIndex<u64>) -> Vec<(Vec<u8>, u64)> {
        let mut out = Vec::new();
        let mut it = index.iter();
        while it.is_valid() {
            let (k, v) = it.get_current_entry();
            out.push((k.to_vec(), *v));
            if !it.next() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_insert_and_get() {
        let index = ConcurrentIndex::new();
        assert!(insert(&index, "banana", 2));
        assert!(insert(&index, "apple", 1));
        assert!(!insert(&index, "apple", 99));

        assert_eq!(index.get(b"apple"), Some(1));
        assert_eq!(index.get(b"banana"), Some(2));
        assert_eq!(index.get(b"cherry"), None);
        assert_eq!(index.entry_count(), 2);
    }

    #[test]
    fn test_prepare_sees_existing_value() {
        let index = ConcurrentIndex::new();
        assert!(insert(&index, "k", 7));
        let prep = index.prepare(b"k");
        assert!(prep.exists());
        assert_eq!(prep.current_value(), 7);
    }

    #[test]
    fn test_iteration_in_order_across_splits() {
        let index = ConcurrentIndex::new();
        let mut keys: Vec<String> = (0..500).map(|i| format!("key{:05}", i * 7 % 500)).collect();
        for (i, k) in keys.iter().enumerate() {
            assert!(insert(&index, k, i as u64));
        }
        keys.sort();
        let got = collect(&index);
        assert_eq!(got.len(), 500);
        let got_keys: Vec<Vec<u8>> = got.iter().map(|(k, _)| k.clone()).collect();
        let want: Vec<Vec<u8>> = keys.iter().map(|k| key(k)).collect();
        assert_eq!(got_keys, want);
    }

    #[test]
    fn test_seek_at_or_after() {
        let index = ConcurrentIndex::new();
        for k in ["b", "d", "f"] {
            assert!(insert(&index, k, 0));
        }
        let mut it = index.iter();
        let mut exact = false;

        assert!(it.seek_at_or_after(&index, b"d", &mut exact));
        assert!(exact);
        assert_eq!(it.get_current_entry().0, b"d");

        assert!(it.seek_at_or_after(&index, b"c", &mut exact));
        assert!(!exact);
        assert_eq!(it.get_current_entry().0, b"d");

        assert!(!it.seek_at_or_after(&index, b"g", &mut exact));
        assert!(!it.is_valid());

        assert!(it.seek_at_or_after(&index, b"", &mut exact));
        assert_eq!(it.get_current_entry().0, b"b");
    }

    #[test]
    fn test_empty_index_iteration() {
        let index = ConcurrentIndex::<u64>::new();
        let it = index.iter();
        assert!(!it.is_valid());
        assert!(index.is_empty());
    }

    #[test]
    fn test_concurrent_distinct_inserts_all_visible() {
        let index = Arc::new(ConcurrentIndex::new());
        let threads = 8;
        let per_thread = 250;
        let mut handles = Vec::new();
        for t in 0..threads {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                for i in 0..per_thread {
                    let k = format!("t{t:02}-{i:04}");
                    let prep = index.prepare(k.as_bytes());
                    assert!(!prep.exists());
                    assert!(prep.insert((t * per_thread + i) as u64));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(index.entry_count(), threads * per_thread);
        let got = collect(&index);
        assert_eq!(got.len(), threads * per_thread);
        for w in got.windows(2) {
            assert!(w[0].0 < w[1].0, "scan out of order");
        }
    }

    #[test]
    fn test_readers_run_against_writers() {
        let index = Arc::new(ConcurrentIndex::new());
        let writer = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for i in 0..2000u64 {
                    let k = format!("{i:06}");
                    let prep = index.prepare(k.as_bytes());
                    assert!(prep.insert(i));
                }
            })
        };
        // Concurrent scans must always observe a sorted prefix-consistent view.
        for _ in 0..50 {
            let got = collect(&index);
            for w in got.windows(2) {
                assert!(w[0].0 < w[1].0);
            }
        }
        writer.join().unwrap();
        assert_eq!(collect(&index).len(), 2000);
    }
}
