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

//! Memory-tracked bump arena.
//!
//! The write path of the in-memory row store allocates row bodies, string
//! cells, and mutation nodes at high frequency and frees them all at once
//! when the store is flushed and torn down. A bump arena fits exactly:
//!
//! - Allocation is a `fetch_add` on the current chunk; no locks on the
//!   fast path, so concurrent writers do not contend.
//! - A new chunk is installed under a mutex when the current one fills.
//!   Chunks start at [`INITIAL_CHUNK_BYTES`] and double up to
//!   [`MAX_CHUNK_BYTES`].
//! - Every chunk is charged to the attached [`MemTracker`] on acquisition
//!   and the whole total is credited back when the arena drops.
//! - There is no per-object free. Objects placed in the arena must not
//!   require `Drop`.
//!
//! Pointers returned by the arena remain valid (and stable) until the
//! arena itself is dropped.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::memory::MemTracker;
use crate::slice::ArenaRef;

/// Size of the first chunk (1.5 MiB).
pub const INITIAL_CHUNK_BYTES: usize = 1536 * 1024;

/// Upper bound on chunk size (8 MiB); growth doubles until it hits this.
pub const MAX_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// Base alignment of every chunk; sufficient for all cell and node types.
const CHUNK_ALIGN: usize = 16;

struct Chunk {
    data: NonNull<u8>,
    layout: Layout,
    pos: AtomicUsize,
}

impl Chunk {
    fn new(size: usize) -> Box<Chunk> {
        let layout = Layout::from_size_align(size, CHUNK_ALIGN).expect("valid chunk layout");
        let raw = unsafe { std::alloc::alloc(layout) };
        let data = match NonNull::new(raw) {
            Some(p) => p,
            None => std::alloc::handle_alloc_error(layout),
        };
        Box::new(Chunk {
            data,
            layout,
            pos: AtomicUsize::new(0),
        })
    }

    /// Lock-free bump. Returns `None` when the chunk cannot satisfy the
    /// request.
    fn try_alloc(&self, len: usize, align: usize) -> Option<*mut u8> {
        debug_assert!(align <= CHUNK_ALIGN && align.is_power_of_two());
        let mut pos = self.pos.load(Ordering::Relaxed);
        loop {
            let aligned = (pos + align - 1) & !(align - 1);
            let end = aligned.checked_add(len)?;
            if end > self.layout.size() {
                return None;
            }
            match self
                .pos
                .compare_exchange_weak(pos, end, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Some(unsafe { self.data.as_ptr().add(aligned) }),
                Err(cur) => pos = cur,
            }
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.data.as_ptr(), self.layout) };
    }
}

unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

struct ArenaState {
    chunks: Vec<Box<Chunk>>,
    next_chunk_size: usize,
}

/// Thread-safe, memory-tracked bump allocator.
pub struct Arena {
    tracker: Arc<MemTracker>,
    max_chunk_size: usize,
    state: Mutex<ArenaState>,
    /// Points at the most recently installed chunk (owned by `state`).
    current: AtomicPtr<Chunk>,
    total_bytes: AtomicUsize,
}

impl Arena {
    /// Arena with the standard row-store chunk sizes.
    pub fn new(tracker: Arc<MemTracker>) -> Arena {
        Self::with_chunk_sizes(tracker, INITIAL_CHUNK_BYTES, MAX_CHUNK_BYTES)
    }

    /// Arena with explicit initial/max chunk sizes. Small consumers such as
    /// scan output blocks use this to avoid the 1.5 MiB floor.
    pub fn with_chunk_sizes(
        tracker: Arc<MemTracker>,
        initial_chunk_size: usize,
        max_chunk_size: usize,
    ) -> Arena {
        let first = Chunk::new(initial_chunk_size);
        tracker.consume(initial_chunk_size as i64);
        let current = AtomicPtr::new(&*first as *const Chunk as *mut Chunk);
        Arena {
            tracker,
            max_chunk_size,
            state: Mutex::new(ArenaState {
                chunks: vec![first],
                next_chunk_size: (initial_chunk_size * 2).min(max_chunk_size),
            }),
            current,
            total_bytes: AtomicUsize::new(initial_chunk_size),
        }
    }

    /// Allocate `len` bytes aligned to `align` (power of two, at most 16).
    /// The returned memory is uninitialized and lives until the arena drops.
    pub fn alloc_bytes(&self, len: usize, align: usize) -> *mut u8 {
        loop {
            let cur = self.current.load(Ordering::Acquire);
            if let Some(p) = unsafe { (*cur).try_alloc(len, align) } {
                return p;
            }
            if let Some(p) = self.grow_and_alloc(len, align) {
                return p;
            }
        }
    }

    /// Slow path: install a new chunk and satisfy the allocation from it.
    fn grow_and_alloc(&self, len: usize, align: usize) -> Option<*mut u8> {
        let mut state = self.state.lock();

        // Another thread may have grown the arena while we waited.
        let cur = self.current.load(Ordering::Acquire);
        if let Some(p) = unsafe { (*cur).try_alloc(len, align) } {
            return Some(p);
        }

        let mut size = state.next_chunk_size;
        if size < len + align {
            // Oversized request: give it a dedicated chunk.
            size = len + align;
        }
        let chunk = Chunk::new(size);
        self.tracker.consume(size as i64);
        let total = self.total_bytes.fetch_add(size, Ordering::Relaxed) + size;
        tracing::debug!(
            tracker = self.tracker.id(),
            chunk_bytes = size,
            total_bytes = total,
            "installed new arena chunk"
        );

        let p = chunk
            .try_alloc(len, align)
            .expect("fresh chunk must satisfy its first allocation");

        state.next_chunk_size = (state.next_chunk_size * 2).min(self.max_chunk_size);
        self.current
            .store(&*chunk as *const Chunk as *mut Chunk, Ordering::Release);
        state.chunks.push(chunk);
        Some(p)
    }

    /// Copy `bytes` into the arena and return a view over the copy.
    pub fn alloc_copy(&self, bytes: &[u8]) -> ArenaRef {
        if bytes.is_empty() {
            return ArenaRef::empty();
        }
        let p = self.alloc_bytes(bytes.len(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len());
            ArenaRef::from_raw(p, bytes.len())
        }
    }

    /// Place `value` in the arena and return a pointer valid for the
    /// arena's lifetime. `T` must not require `Drop`: the arena never runs
    /// destructors.
    pub fn alloc_object<T>(&self, value: T) -> *mut T {
        debug_assert!(
            !std::mem::needs_drop::<T>(),
            "arena-placed objects are never dropped"
        );
        let p = self.alloc_bytes(std::mem::size_of::<T>(), std::mem::align_of::<T>()) as *mut T;
        unsafe { p.write(value) };
        p
    }

    /// Roll the arena back to a single empty chunk, releasing every later
    /// chunk. Requires exclusive access; scan output blocks use this to
    /// recycle their per-block arena between fills.
    pub fn reset(&mut self) {
        let state = self.state.get_mut();
        state.chunks.truncate(1);
        let first = &state.chunks[0];
        first.pos.store(0, Ordering::Relaxed);
        let first_size = first.layout.size();
        state.next_chunk_size = (first_size * 2).min(self.max_chunk_size);
        self.current = AtomicPtr::new(&**first as *const Chunk as *mut Chunk);

        let total = self.total_bytes.get_mut();
        if *total > first_size {
            self.tracker.release((*total - first_size) as i64);
        }
        *total = first_size;
    }

    /// Total bytes held in chunks (the arena's footprint as charged to the
    /// memory tracker).
    pub fn memory_footprint(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.tracker
            .release(self.total_bytes.load(Ordering::Relaxed) as i64);
    }
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_arena() -> (Arc<MemTracker>, Arena) {
        let tracker = MemTracker::root("arena-test");
        let arena = Arena::with_chunk_sizes(Arc::clone(&tracker), 1024, 4096);
        (tracker, arena)
    }

    #[test]
    fn test_alloc_copy_roundtrip() {
        let (_t, arena) = small_arena();
        let r = arena.alloc_copy(b"hello world");
        assert_eq!(unsafe { r.as_slice() }, b"hello world");
        assert!(arena.alloc_copy(b"").is_empty());
    }

    #[test]
    fn test_chunk_growth_doubles_to_cap() {
        let (tracker, arena) = small_arena();
        assert_eq!(arena.memory_footprint(), 1024);
        // Exhaust several chunks: 1024 -> +2048 -> +4096 -> +4096 (capped).
        for _ in 0..40 {
            arena.alloc_bytes(512, 8);
        }
        assert!(arena.memory_footprint() >= 1024 + 2048 + 4096);
        assert_eq!(tracker.consumption() as usize, arena.memory_footprint());
    }

    #[test]
    fn test_oversized_allocation_gets_dedicated_chunk() {
        let (tracker, arena) = small_arena();
        let p = arena.alloc_bytes(64 * 1024, 8);
        assert!(!p.is_null());
        assert!(arena.memory_footprint() >= 1024 + 64 * 1024);
        assert_eq!(tracker.consumption() as usize, arena.memory_footprint());
    }

    #[test]
    fn test_drop_releases_tracker() {
        let tracker = MemTracker::root("arena-drop");
        {
            let arena = Arena::with_chunk_sizes(Arc::clone(&tracker), 1024, 4096);
            arena.alloc_bytes(2000, 8);
            assert!(tracker.consumption() > 0);
        }
        assert_eq!(tracker.consumption(), 0);
    }

    #[test]
    fn test_alignment() {
        let (_t, arena) = small_arena();
        arena.alloc_bytes(1, 1);
        let p = arena.alloc_bytes(8, 8);
        assert_eq!(p as usize % 8, 0);
        let p16 = arena.alloc_bytes(16, 16);
        assert_eq!(p16 as usize % 16, 0);
    }

    #[test]
    fn test_concurrent_alloc_disjoint_regions() {
        let tracker = MemTracker::root("arena-concurrent");
        let arena = Arc::new(Arena::with_chunk_sizes(tracker, 4096, 65536));
        let mut handles = Vec::new();
        for t in 0..4u8 {
            let arena = Arc::clone(&arena);
            handles.push(std::thread::spawn(move || {
                let mut refs = Vec::new();
                for i in 0..200usize {
                    let payload = [t, (i % 256) as u8, 0xAB];
                    refs.push((arena.alloc_copy(&payload), payload));
                }
                for (r, expected) in refs {
                    assert_eq!(unsafe { r.as_slice() }, &expected);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
