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

//! MVCC snapshots.
//!
//! A snapshot is a predicate over logical timestamps: a reader sees
//! exactly the operations whose timestamps the snapshot reports as
//! committed. Timestamp assignment and commit tracking live in the
//! transaction layer; this type only answers visibility queries.

use std::collections::HashSet;

use crate::opid::Timestamp;

#[derive(Debug, Clone)]
pub struct MvccSnapshot {
    all_committed: bool,
    committed: HashSet<Timestamp>,
}

impl MvccSnapshot {
    /// A snapshot in which every timestamp is committed; used by debug
    /// dumps and compaction-style full reads.
    pub fn all_committed() -> Self {
        Self {
            all_committed: true,
            committed: HashSet::new(),
        }
    }

    /// A snapshot committing exactly the given timestamps.
    pub fn from_committed(timestamps: impl IntoIterator<Item = Timestamp>) -> Self {
        Self {
            all_committed: false,
            committed: timestamps.into_iter().collect(),
        }
    }

    /// A snapshot that sees nothing.
    pub fn none_committed() -> Self {
        Self::from_committed([])
    }

    #[inline]
    pub fn is_committed(&self, ts: Timestamp) -> bool {
        self.all_committed || self.committed.contains(&ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility() {
        let snap = MvccSnapshot::from_committed([10, 20]);
        assert!(snap.is_committed(10));
        assert!(snap.is_committed(20));
        assert!(!snap.is_committed(15));

        assert!(MvccSnapshot::all_committed().is_committed(u64::MAX));
        assert!(!MvccSnapshot::none_committed().is_committed(0));
    }
}
