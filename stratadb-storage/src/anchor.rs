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

//! Operation-id anchors.
//!
//! The replicated log layer may only reclaim a segment once no in-memory
//! state still depends on the operations it holds. Each consumer of log
//! durability registers a named *anchor* — the minimum operation id it
//! still needs — in a shared [`OpIdAnchorRegistry`]; the log retains every
//! segment whose operations are at or above the minimum live anchor.
//!
//! [`OpIdAnchorer`] is the per-consumer helper: it remembers the smallest
//! op id ever submitted and keeps the registry entry at that minimum.
//! Updates are idempotent, safe under concurrency, and the entry is
//! released when the anchorer drops.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use stratadb_core::OpId;

/// Shared name → anchor map. Internally synchronized; updates for a name
/// are last-writer-wins, which anchorers use to only ever lower their
/// entry.
#[derive(Debug, Default)]
pub struct OpIdAnchorRegistry {
    anchors: DashMap<String, OpId>,
}

impl OpIdAnchorRegistry {
    pub fn new() -> Arc<OpIdAnchorRegistry> {
        Arc::new(OpIdAnchorRegistry::default())
    }

    /// Insert or overwrite the anchor for `name`.
    pub fn update(&self, name: &str, op_id: OpId) {
        self.anchors.insert(name.to_string(), op_id);
    }

    /// Remove the anchor for `name`; idempotent.
    pub fn release(&self, name: &str) {
        self.anchors.remove(name);
    }

    /// The smallest live anchor; log segments with operations at or above
    /// it must be retained.
    pub fn min_anchor(&self) -> Option<OpId> {
        self.anchors.iter().map(|e| *e.value()).min()
    }

    pub fn anchor_for(&self, name: &str) -> Option<OpId> {
        self.anchors.get(name).map(|e| *e.value())
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// Tracks the minimum op id submitted by one consumer and mirrors it into
/// the registry under a stable name.
#[derive(Debug)]
pub struct OpIdAnchorer {
    registry: Arc<OpIdAnchorRegistry>,
    name: String,
    minimum: Mutex<Option<OpId>>,
}

impl OpIdAnchorer {
    pub fn new(registry: Arc<OpIdAnchorRegistry>, name: impl Into<String>) -> OpIdAnchorer {
        OpIdAnchorer {
            registry,
            name: name.into(),
            minimum: Mutex::new(None),
        }
    }

    /// Anchor `op_id` if it is smaller than everything seen so far. The
    /// registry entry moves monotonically downward.
    pub fn anchor_if_minimum(&self, op_id: OpId) {
        let mut min = self.minimum.lock();
        match *min {
            Some(cur) if cur <= op_id => {}
            _ => {
                *min = Some(op_id);
                self.registry.update(&self.name, op_id);
            }
        }
    }

    pub fn minimum(&self) -> Option<OpId> {
        *self.minimum.lock()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for OpIdAnchorer {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}
