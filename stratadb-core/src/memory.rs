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

//! Hierarchical memory accounting.
//!
//! Every large consumer (row-store arenas, the block cache) charges its
//! bytes against a [`MemTracker`]. Trackers form a tree: consuming or
//! releasing on a child propagates to every ancestor, so a server-level
//! tracker observes the total footprint of all tablets below it.
//!
//! ```text
//! server                      (root)
//! └── tablet-7               consumption = Σ children
//!     ├── tablet-7-MemRowSet-0
//!     └── tablet-7-MemRowSet-1
//! ```
//!
//! Trackers do not enforce limits; they account. Back-pressure decisions
//! (for example the row-store write throttle) read `consumption()` and act
//! on it themselves.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A node in the memory accounting tree.
#[derive(Debug)]
pub struct MemTracker {
    id: String,
    consumption: AtomicI64,
    parent: Option<Arc<MemTracker>>,
}

impl MemTracker {
    /// Create a root tracker with no parent.
    pub fn root(id: impl Into<String>) -> Arc<MemTracker> {
        Arc::new(MemTracker {
            id: id.into(),
            consumption: AtomicI64::new(0),
            parent: None,
        })
    }

    /// Create a child tracker under `parent`.
    pub fn new_child(parent: &Arc<MemTracker>, id: impl Into<String>) -> Arc<MemTracker> {
        Arc::new(MemTracker {
            id: id.into(),
            consumption: AtomicI64::new(0),
            parent: Some(Arc::clone(parent)),
        })
    }

    /// Charge `bytes` against this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        self.consumption.fetch_add(bytes, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.consume(bytes);
        }
    }

    /// Credit `bytes` back to this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        self.consumption.fetch_sub(bytes, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.release(bytes);
        }
    }

    /// Bytes currently charged against this tracker (including children).
    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }
}
