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

//! StrataDB Core
//!
//! Fundamental types shared by the storage layer:
//!
//! - **Schema & rows**: fixed-layout rows with an order-preserving key
//!   codec and id-based projection.
//! - **Arenas & memory accounting**: tracked bump allocation for the
//!   write path.
//! - **Change lists**: the wire form of row mutations.
//! - **MVCC snapshots**: timestamp visibility predicates.

pub mod arena;
pub mod changelist;
pub mod error;
pub mod memory;
pub mod opid;
pub mod row;
pub mod schema;
pub mod slice;
pub mod snapshot;

pub use arena::Arena;
pub use error::{Result, StrataError};
pub use memory::MemTracker;
pub use opid::{OpId, Timestamp};
pub use schema::{ColumnSchema, ColumnType, Datum, EncodedKey, Schema};
pub use slice::ArenaRef;
pub use snapshot::MvccSnapshot;
