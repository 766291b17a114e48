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

//! Per-row mutation chains.
//!
//! Every stored row carries a singly linked, append-only list of
//! [`Mutation`] nodes ordered oldest-to-newest. Nodes are arena-allocated
//! and never freed individually; the chain is drained wholesale when the
//! enclosing store is compacted away.
//!
//! Appending is the chain's sole serialization point: a writer fully
//! initializes the node, walks to the tail, and publishes with a
//! compare-and-swap carrying release semantics on the tail's null `next`
//! pointer (or the chain head when empty). The CAS winner order *is* the
//! logical mutation order. Readers traverse with acquire loads and
//! therefore observe a fully-published prefix; a node is invisible until
//! its CAS lands.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use stratadb_core::changelist::stringify_changelist;
use stratadb_core::{Arena, ArenaRef, Schema, Timestamp};

/// One timestamped change record. Arena-allocated; must stay `Drop`-free.
#[repr(C)]
pub struct Mutation {
    timestamp: Timestamp,
    changelist: ArenaRef,
    next: AtomicPtr<Mutation>,
}

impl Mutation {
    /// Allocate a node in `arena`, copying the encoded change list into
    /// the same arena so the node and its payload share a lifetime.
    pub fn new_in_arena(arena: &Arena, timestamp: Timestamp, changelist: &[u8]) -> *mut Mutation {
        let changelist = arena.alloc_copy(changelist);
        arena.alloc_object(Mutation {
            timestamp,
            changelist,
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The encoded change list. Valid while the owning arena is alive,
    /// which every holder of a chain reference guarantees.
    #[inline]
    pub fn changelist(&self) -> &[u8] {
        unsafe { self.changelist.as_slice() }
    }

    /// Next-older-to-newer link, acquire-loaded so the returned node is
    /// fully published.
    #[inline]
    pub fn next(&self) -> Option<&Mutation> {
        let p = self.next.load(Ordering::Acquire);
        unsafe { p.as_ref() }
    }

    /// Append `node` at the tail of the chain rooted at `head`.
    ///
    /// Lock-free: contending appenders race on the tail CAS and the loser
    /// re-walks from its observed position. The release ordering on the
    /// CAS publishes the node's contents to readers that acquire-load the
    /// link.
    ///
    /// # Safety
    ///
    /// `node` must point at a fully initialized mutation from the same
    /// arena as the chain, not yet linked into any chain.
    pub unsafe fn append_to_list_atomic(head: &AtomicPtr<Mutation>, node: *mut Mutation) {
        let mut link = head;
        loop {
            match link.compare_exchange(
                ptr::null_mut(),
                node,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(existing) => link = &(*existing).next,
            }
        }
    }

    /// Iterate a chain from its head pointer.
    pub fn iter_chain(head: &AtomicPtr<Mutation>) -> MutationIter<'_> {
        MutationIter {
            next: head.load(Ordering::Acquire),
            _marker: std::marker::PhantomData,
        }
    }

    /// Render a chain for diagnostics: `[@ts(change), ...]`.
    pub fn stringify_chain(schema: &Schema, head: &AtomicPtr<Mutation>) -> String {
        use std::fmt::Write;
        let mut out = String::from("[");
        for (i, m) in Mutation::iter_chain(head).enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(
                out,
                "@{}({})",
                m.timestamp(),
                stringify_changelist(schema, m.changelist())
            );
        }
        out.push(']');
        out
    }
}

pub struct MutationIter<'a> {
    next: *const Mutation,
    _marker: std::marker::PhantomData<&'a Mutation>,
}

impl<'a> Iterator for MutationIter<'a> {
    type Item = &'a Mutation;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = unsafe { self.next.as_ref()? };
        self.next = cur.next.load(Ordering::Acquire);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stratadb_core::MemTracker;

    fn arena() -> Arena {
        Arena::with_chunk_sizes(MemTracker::root("mutation-test"), 4096, 65536)
    }

    #[test]
    fn test_append_and_traverse_in_order() {
        let arena = arena();
        let head = AtomicPtr::new(ptr::null_mut());
        for ts in [5u64, 10, 15] {
            let m = Mutation::new_in_arena(&arena, ts, &[2]);
            unsafe { Mutation::append_to_list_atomic(&head, m) };
        }
        let timestamps: Vec<u64> = Mutation::iter_chain(&head).map(|m| m.timestamp()).collect();
        assert_eq!(timestamps, vec![5, 10, 15]);
    }

    #[test]
    fn test_changelist_payload_copied_into_arena() {
        let arena = arena();
        let head = AtomicPtr::new(ptr::null_mut());
        let payload = vec![1u8, 0, 0, 0, 0, 42, 0, 0, 0, 0, 0, 0, 0];
        let m = Mutation::new_in_arena(&arena, 1, &payload);
        unsafe { Mutation::append_to_list_atomic(&head, m) };
        drop(payload);
        let got: Vec<Vec<u8>> = Mutation::iter_chain(&head)
            .map(|m| m.changelist().to_vec())
            .collect();
        assert_eq!(got[0][5], 42);
    }

    #[test]
    fn test_concurrent_appends_all_land() {
        let arena = Arc::new(arena());
        let head = Arc::new(AtomicPtr::new(ptr::null_mut()));
        let threads = 8;
        let per_thread = 100u64;
        let mut handles = Vec::new();
        for t in 0..threads {
            let arena = Arc::clone(&arena);
            let head = Arc::clone(&head);
            handles.push(std::thread::spawn(move || {
                for i in 0..per_thread {
                    let ts = t as u64 * per_thread + i;
                    let m = Mutation::new_in_arena(&arena, ts, &[2]);
                    unsafe { Mutation::append_to_list_atomic(&head, m) };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut seen: Vec<u64> = Mutation::iter_chain(&head).map(|m| m.timestamp()).collect();
        assert_eq!(seen.len(), threads as usize * per_thread as usize);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), threads as usize * per_thread as usize);
    }
}
