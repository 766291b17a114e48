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

//! StrataDB Storage
//!
//! The tablet server's in-memory storage cores:
//!
//! - **MemRowSet** (`memrowset`): write-absorbing row store — concurrent
//!   sorted index over arena-resident rows, MVCC mutation chains, snapshot
//!   iteration with projection and pushed key bounds, write throttling,
//!   and log-anchor maintenance.
//! - **Sharded LRU cache** (`cache`): refcounted block cache with
//!   insertion-wins LRU semantics, hash-sharded sixteen ways.
//! - **Concurrent sorted index** (`index`): the B-link leaf structure
//!   underneath the row store.
//! - **Anchors** (`anchor`): minimum-op-id registry that keeps the
//!   replicated log from reclaiming still-needed segments.

pub mod anchor;
pub mod cache;
pub mod index;
pub mod memrowset;
pub mod mutation;

pub use anchor::{OpIdAnchorRegistry, OpIdAnchorer};
pub use cache::{CacheDeleter, CacheHandle, ShardedLruCache, NUM_SHARDS, SHARD_BITS};
pub use memrowset::{
    EncodedKeyRange, MemRowSet, MemRowSetIterator, MemRowSetOptions, MemStoreTarget, OpResult,
    ProbeStats, RowKeyProbe, ScanSpec,
};
