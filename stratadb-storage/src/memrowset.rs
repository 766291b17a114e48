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

//! In-memory row store (MemRowSet).
//!
//! The write-absorbing front tier of a tablet: recently inserted rows live
//! here, fully in memory, until an external orchestrator flushes them into
//! durable column files and replaces the store wholesale.
//!
//! ## Data layout
//!
//! ```text
//! concurrent sorted index:  encoded key ──► RowCell (arena)
//!                                            ├─ insertion_timestamp
//!                                            ├─ body (row image, arena)
//!                                            └─ redo_head ──► Mutation ──► ...
//! ```
//!
//! A key, once inserted, is never removed from the index. Deletion is a
//! DELETE record on the row's mutation chain; a row whose chain replays to
//! a terminal DELETE is a *ghost* and is invisible to readers, but its
//! entry remains and a later insert of the same key appends a REINSERT
//! record instead of creating a second entry.
//!
//! Everything a row references — body, string cells, mutation nodes,
//! change lists — lives in the store's arena, so nothing here may outlive
//! the store. Iterators hold a strong reference for exactly that reason.
//!
//! Ghost rows and mutation chains accumulate until flush; the flush
//! trigger is external and keys off [`MemRowSet::memory_footprint`] and
//! [`MemRowSet::entry_count`].

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use stratadb_core::changelist::{ChangeType, DecodedChange, RowChangeListDecoder, RowChangeListEncoder};
use stratadb_core::row::{copy_row_to_arena, DeltaProjector, RowBlock, RowProjector, RowView};
use stratadb_core::{
    Arena, ArenaRef, EncodedKey, MemTracker, MvccSnapshot, OpId, Result, Schema, StrataError,
    Timestamp,
};

use crate::anchor::{OpIdAnchorRegistry, OpIdAnchorer};
use crate::index::{ConcurrentIndex, IndexIterator};
use crate::mutation::Mutation;

/// Tuning knobs; deserializable so a server config can carry them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemRowSetOptions {
    /// Soft ceiling in MiB beyond which mutators are slowed down;
    /// 0 disables throttling.
    pub throttle_mb: u64,
}

impl Default for MemRowSetOptions {
    fn default() -> Self {
        Self { throttle_mb: 0 }
    }
}

/// Per-request probe counters, reported back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeStats {
    /// How many in-memory row stores were consulted.
    pub mrs_consulted: u64,
}

/// Identifies an in-memory store touched by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStoreTarget {
    pub mrs_id: i64,
}

/// Accumulates which stores a mutation landed in.
#[derive(Debug, Clone, Default)]
pub struct OpResult {
    mutated_stores: Vec<MemStoreTarget>,
}

impl OpResult {
    pub fn add_mutated_store(&mut self, target: MemStoreTarget) {
        self.mutated_stores.push(target);
    }

    pub fn mutated_stores(&self) -> &[MemStoreTarget] {
        &self.mutated_stores
    }
}

/// A row key already encoded into comparable form.
#[derive(Debug, Clone)]
pub struct RowKeyProbe {
    encoded: EncodedKey,
}

impl RowKeyProbe {
    pub fn from_row(row: &RowView<'_>) -> RowKeyProbe {
        let mut encoded = EncodedKey::new();
        row.schema().encode_comparable_key(row, &mut encoded);
        RowKeyProbe { encoded }
    }

    pub fn from_encoded(bytes: &[u8]) -> RowKeyProbe {
        let mut encoded = EncodedKey::new();
        encoded.extend_from_slice(bytes);
        RowKeyProbe { encoded }
    }

    pub fn encoded_key(&self) -> &[u8] {
        &self.encoded
    }
}

/// The stored form of one row: header fields plus the arena-resident row
/// image. Lives in the store's arena; referenced from the index by
/// pointer.
#[repr(C)]
struct RowCell {
    insertion_timestamp: Timestamp,
    redo_head: AtomicPtr<Mutation>,
    body: ArenaRef,
}

/// Copyable index slot pointing at a [`RowCell`] in the arena.
#[derive(Clone, Copy)]
pub(crate) struct RowCellRef(*const RowCell);

// RowCells are arena-owned, immutable after publication except for the
// atomic chain head.
unsafe impl Send for RowCellRef {}
unsafe impl Sync for RowCellRef {}

/// Borrowed logical view of one stored row.
pub struct MRSRow<'a> {
    mrs: &'a MemRowSet,
    cell: &'a RowCell,
}

impl<'a> MRSRow<'a> {
    pub fn insertion_timestamp(&self) -> Timestamp {
        self.cell.insertion_timestamp
    }

    pub fn row_view(&self) -> RowView<'a> {
        RowView::new(self.mrs.schema(), unsafe { self.cell.body.as_slice() })
    }

    /// Replay the mutation chain and report whether the row's terminal
    /// state is deleted.
    ///
    /// Chain-order violations (DELETE on a ghost, REINSERT on a live row)
    /// and undecodable change lists indicate in-memory corruption and
    /// abort the process.
    pub fn is_ghost(&self) -> bool {
        let mut ghost = false;
        for m in Mutation::iter_chain(&self.cell.redo_head) {
            let decoder = RowChangeListDecoder::new(self.mrs.schema(), m.changelist());
            match decoder.change_type() {
                Ok(ChangeType::Delete) => {
                    if ghost {
                        panic!(
                            "DELETE mutation on ghost row @{}: mutation chain corrupted",
                            m.timestamp()
                        );
                    }
                    ghost = true;
                }
                Ok(ChangeType::Reinsert) => {
                    if !ghost {
                        panic!(
                            "REINSERT mutation on live row @{}: mutation chain corrupted",
                            m.timestamp()
                        );
                    }
                    ghost = false;
                }
                Ok(ChangeType::Update) => {}
                Err(e) => panic!("failed to decode mutation @{}: {e}", m.timestamp()),
            }
        }
        ghost
    }
}

/// In-memory row store bound to one schema and one anchor registry.
pub struct MemRowSet {
    id: i64,
    schema: Arc<Schema>,
    mem_tracker: Arc<MemTracker>,
    arena: Arena,
    index: ConcurrentIndex<RowCellRef>,
    anchorer: OpIdAnchorer,
    options: MemRowSetOptions,
    debug_insert_count: AtomicU64,
    debug_update_count: AtomicU64,
    has_logged_throttling: AtomicBool,
}

fn tracker_for_mrs(id: i64, parent: Option<&Arc<MemTracker>>) -> Arc<MemTracker> {
    match parent {
        Some(p) => MemTracker::new_child(p, format!("{}-MemRowSet-{}", p.id(), id)),
        None => MemTracker::root(format!("MemRowSet-{id}")),
    }
}

impl MemRowSet {
    pub fn new(
        id: i64,
        schema: Schema,
        registry: Arc<OpIdAnchorRegistry>,
        parent_tracker: Option<&Arc<MemTracker>>,
    ) -> Result<Arc<MemRowSet>> {
        Self::with_options(id, schema, registry, parent_tracker, MemRowSetOptions::default())
    }

    pub fn with_options(
        id: i64,
        schema: Schema,
        registry: Arc<OpIdAnchorRegistry>,
        parent_tracker: Option<&Arc<MemTracker>>,
        options: MemRowSetOptions,
    ) -> Result<Arc<MemRowSet>> {
        if !schema.has_column_ids() {
            return Err(StrataError::InvalidArgument(
                "row store schemas require column ids".into(),
            ));
        }
        let mem_tracker = tracker_for_mrs(id, parent_tracker);
        let arena = Arena::new(Arc::clone(&mem_tracker));
        Ok(Arc::new(MemRowSet {
            id,
            schema: Arc::new(schema),
            mem_tracker,
            arena,
            index: ConcurrentIndex::new(),
            anchorer: OpIdAnchorer::new(registry, format!("MemRowSet-{id}")),
            options,
            debug_insert_count: AtomicU64::new(0),
            debug_update_count: AtomicU64::new(0),
            has_logged_throttling: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    /// Bytes held by the store's arena; one of the two flush-trigger
    /// inputs (the other is `entry_count`).
    pub fn memory_footprint(&self) -> usize {
        self.arena.memory_footprint()
    }

    /// Number of index entries, ghosts included.
    pub fn entry_count(&self) -> usize {
        self.index.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Insert a full row at `timestamp`.
    ///
    /// If the key already exists and is live, returns `AlreadyPresent`.
    /// If it exists as a ghost, the row is revived with a REINSERT record
    /// carrying an arena-relocated copy of the new image.
    pub fn insert(&self, timestamp: Timestamp, row: &RowView<'_>, op_id: OpId) -> Result<()> {
        debug_assert_eq!(*row.schema(), **self.schema(), "row schema mismatch");

        let mut key = EncodedKey::new();
        self.schema.encode_comparable_key(row, &mut key);

        let prep = self.index.prepare(&key);
        if prep.exists() {
            let cell = unsafe { &*prep.current_value().0 };
            let mrs_row = MRSRow { mrs: self, cell };
            if !mrs_row.is_ghost() {
                return Err(StrataError::AlreadyPresent(
                    "entry already present in memrowset".into(),
                ));
            }
            self.append_reinsert(timestamp, row, cell);
            drop(prep);
        } else {
            let body = copy_row_to_arena(row, &self.arena);
            let cell = self.arena.alloc_object(RowCell {
                insertion_timestamp: timestamp,
                redo_head: AtomicPtr::new(ptr::null_mut()),
                body,
            });
            let inserted = prep.insert(RowCellRef(cell));
            debug_assert!(inserted, "prepared insert cannot race under its own lock");
        }

        self.debug_insert_count.fetch_add(1, Ordering::Relaxed);
        self.anchorer.anchor_if_minimum(op_id);
        self.slow_mutators();
        Ok(())
    }

    /// Revive a ghost row: relocate the new image into the arena, encode a
    /// REINSERT change list from the relocated copy, and append it.
    fn append_reinsert(&self, timestamp: Timestamp, row: &RowView<'_>, cell: &RowCell) {
        let body = copy_row_to_arena(row, &self.arena);
        let mut buf = Vec::new();
        let mut encoder = RowChangeListEncoder::new(&self.schema, &mut buf);
        encoder.set_to_reinsert(unsafe { body.as_slice() });
        let node = Mutation::new_in_arena(&self.arena, timestamp, &buf);
        unsafe { Mutation::append_to_list_atomic(&cell.redo_head, node) };
    }

    /// Apply an encoded change list to an existing live row.
    ///
    /// Absent and ghost keys report `NotFound`; a malformed change list
    /// reports `InvalidArgument` before anything is published.
    pub fn mutate_row(
        &self,
        timestamp: Timestamp,
        probe: &RowKeyProbe,
        changes: &[u8],
        op_id: OpId,
        stats: &mut ProbeStats,
        result: &mut OpResult,
    ) -> Result<()> {
        // Validate the encoding up front: replay paths treat stored chains
        // as trusted.
        let decoder = RowChangeListDecoder::new(&self.schema, changes);
        if decoder.change_type()? == ChangeType::Reinsert {
            return Err(StrataError::InvalidArgument(
                "REINSERT is only valid through insert()".into(),
            ));
        }
        decoder.decode()?;

        {
            let prep = self.index.prepare(probe.encoded_key());
            if !prep.exists() {
                return Err(StrataError::NotFound("not in memrowset".into()));
            }
            let cell = unsafe { &*prep.current_value().0 };
            let mrs_row = MRSRow { mrs: self, cell };
            if mrs_row.is_ghost() {
                return Err(StrataError::NotFound("not in memrowset (ghost)".into()));
            }

            let node = Mutation::new_in_arena(&self.arena, timestamp, changes);
            unsafe { Mutation::append_to_list_atomic(&cell.redo_head, node) };

            result.add_mutated_store(MemStoreTarget { mrs_id: self.id });
        }

        stats.mrs_consulted += 1;
        self.debug_update_count.fetch_add(1, Ordering::Relaxed);
        self.anchorer.anchor_if_minimum(op_id);
        self.slow_mutators();
        Ok(())
    }

    /// Whether a live (non-ghost) row exists for the probe key. Uses the
    /// index's read-only lookup, so concurrent readers are not perturbed.
    pub fn check_row_present(&self, probe: &RowKeyProbe, stats: &mut ProbeStats) -> Result<bool> {
        stats.mrs_consulted += 1;
        match self.index.get(probe.encoded_key()) {
            None => Ok(false),
            Some(slot) => {
                let cell = unsafe { &*slot.0 };
                let mrs_row = MRSRow { mrs: self, cell };
                Ok(!mrs_row.is_ghost())
            }
        }
    }

    /// Schema changes flush and recreate the store; the store itself is
    /// schema-immutable.
    pub fn alter_schema(&self, _schema: &Schema) -> Result<()> {
        Err(StrataError::NotSupported(
            "alter_schema not supported by MemRowSet".into(),
        ))
    }

    /// The store has no meaningful key bounds; scan layers treat it as
    /// spanning the full key range.
    pub fn get_bounds(&self) -> Result<(EncodedKey, EncodedKey)> {
        Err(StrataError::NotSupported(
            "MemRowSet does not expose key bounds".into(),
        ))
    }

    /// Snapshot iterator over `projection` (defaults to the full schema).
    /// The iterator keeps the store (and so its arena) alive.
    pub fn new_iterator(
        self: &Arc<Self>,
        projection: Option<&Arc<Schema>>,
        snapshot: MvccSnapshot,
    ) -> Result<MemRowSetIterator> {
        let projection = projection
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.schema));
        let projector = RowProjector::new(Arc::clone(&self.schema), Arc::clone(&projection))?;
        let delta_projector = DeltaProjector::new(&self.schema, projection)?;
        Ok(MemRowSetIterator {
            mrs: Arc::clone(self),
            iter: self.index.iter(),
            projector,
            delta_projector,
            snapshot,
            state: IterState::Uninitialized,
            upper_bound: None,
        })
    }

    /// Full-schema iterator seeing every operation; used by debug paths
    /// and tests.
    pub fn new_iterator_all(self: &Arc<Self>) -> Result<MemRowSetIterator> {
        self.new_iterator(None, MvccSnapshot::all_committed())
    }

    /// Render every stored row with its mutation chain.
    pub fn debug_dump(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut it = self.index.iter();
        while it.is_valid() {
            let (_, slot) = it.get_current_entry();
            let cell = unsafe { &*slot.0 };
            let view = RowView::new(self.schema(), unsafe { cell.body.as_slice() });
            lines.push(format!(
                "@{}: row {} mutations={}",
                cell.insertion_timestamp,
                self.schema.debug_row(&view),
                Mutation::stringify_chain(&self.schema, &cell.redo_head)
            ));
            if !it.next() {
                break;
            }
        }
        lines
    }

    /// Soft back-pressure: when the footprint exceeds the configured
    /// ceiling, the completing mutator sleeps proportionally to the
    /// overage. Runs outside every index lock so readers are unaffected.
    fn slow_mutators(&self) {
        if self.options.throttle_mb == 0 {
            return;
        }
        let over =
            self.memory_footprint() as i64 - self.options.throttle_mb as i64 * 1024 * 1024;
        if over > 0 {
            if !self.has_logged_throttling.swap(true, Ordering::Relaxed) {
                warn!(mrs_id = self.id, "throttling memrowset mutation rate");
            }
            let micros = over as u64 / 1024 / 512;
            std::thread::sleep(Duration::from_micros(micros));
        }
    }

    #[cfg(test)]
    fn debug_counts(&self) -> (u64, u64) {
        (
            self.debug_insert_count.load(Ordering::Relaxed),
            self.debug_update_count.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for MemRowSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemRowSet")
            .field("id", &self.id)
            .field("entries", &self.entry_count())
            .field("footprint", &self.memory_footprint())
            .finish()
    }
}

/// One scan predicate range over encoded keys: inclusive lower bound,
/// exclusive upper bound.
#[derive(Debug, Clone, Default)]
pub struct EncodedKeyRange {
    pub lower_bound: Option<Vec<u8>>,
    pub upper_bound: Option<Vec<u8>>,
}

impl EncodedKeyRange {
    pub fn new(lower_bound: Option<Vec<u8>>, upper_bound: Option<Vec<u8>>) -> Self {
        Self {
            lower_bound,
            upper_bound,
        }
    }
}

/// Pushed-down scan predicates.
#[derive(Debug, Clone, Default)]
pub struct ScanSpec {
    pub encoded_ranges: Vec<EncodedKeyRange>,
}

impl ScanSpec {
    pub fn add_range(&mut self, range: EncodedKeyRange) {
        self.encoded_ranges.push(range);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterState {
    Uninitialized,
    Scanning,
    Finished,
}

/// Snapshot scan over a store: projection, MVCC filtering, redo replay,
/// and pushed key bounds. Holds the store alive.
pub struct MemRowSetIterator {
    mrs: Arc<MemRowSet>,
    iter: IndexIterator<RowCellRef>,
    projector: RowProjector,
    delta_projector: DeltaProjector,
    snapshot: MvccSnapshot,
    state: IterState,
    upper_bound: Option<Vec<u8>>,
}

impl MemRowSetIterator {
    /// Resolve pushed key ranges and arm the scan. Across all ranges the
    /// scan starts at the greatest lower bound and terminates strictly
    /// before the smallest upper bound; a lower bound past the end of the
    /// index finishes the scan immediately.
    pub fn init(&mut self, spec: Option<&ScanSpec>) -> Result<()> {
        debug_assert_eq!(self.state, IterState::Uninitialized);

        let mut max_lower: Option<&[u8]> = None;
        if let Some(spec) = spec {
            for range in &spec.encoded_ranges {
                if let Some(lower) = &range.lower_bound {
                    if max_lower.is_none_or(|m| lower.as_slice() > m) {
                        max_lower = Some(lower);
                    }
                }
                if let Some(upper) = &range.upper_bound {
                    if self
                        .upper_bound
                        .as_ref()
                        .is_none_or(|m| upper.as_slice() < m.as_slice())
                    {
                        self.upper_bound = Some(upper.clone());
                    }
                }
            }
        }

        if let Some(lower) = max_lower {
            let mut exact = false;
            if !self.iter.seek_at_or_after(&self.mrs.index, lower, &mut exact) {
                // Nothing at or after the tightest lower bound.
                self.state = IterState::Finished;
                return Ok(());
            }
        }
        self.state = IterState::Scanning;
        Ok(())
    }

    /// Reposition at the first row whose key is at or after `key`, given
    /// as a row image whose key columns are filled. The empty key is a
    /// start-of-index sentinel and always succeeds.
    pub fn seek_at_or_after(&mut self, key: &[u8], exact: &mut bool) -> Result<()> {
        debug_assert_ne!(self.state, IterState::Uninitialized, "iterator not initialized");

        let mut encoded = EncodedKey::new();
        if !key.is_empty() {
            let row = RowView::new(self.mrs.schema(), key);
            self.mrs.schema.encode_comparable_key(&row, &mut encoded);
        }
        if self.iter.seek_at_or_after(&self.mrs.index, &encoded, exact) || key.is_empty() {
            Ok(())
        } else {
            Err(StrataError::NotFound("no match in memrowset".into()))
        }
    }

    pub fn has_upper_bound(&self) -> bool {
        self.upper_bound.is_some()
    }

    /// Fill `dst` with the next batch of projected rows.
    ///
    /// Returns `NotFound("end of iter")` once the underlying cursor is
    /// exhausted. Rows whose insertion is invisible to the snapshot are
    /// emitted unselected; committed mutations are replayed in chain
    /// order onto the projected image.
    pub fn next_block(&mut self, dst: &mut RowBlock) -> Result<()> {
        debug_assert_ne!(self.state, IterState::Uninitialized, "iterator not initialized");
        if !self.iter.is_valid() {
            dst.resize(0);
            return Err(StrataError::NotFound("end of iter".into()));
        }
        if self.state != IterState::Scanning {
            dst.resize(0);
            return Ok(());
        }
        if dst.row_capacity() == 0 {
            return Ok(());
        }

        dst.resize(dst.row_capacity());
        dst.reset_arena();
        dst.selection_vector_mut().set_all_true();

        let fetched = self.fetch_rows(dst);
        debug_assert!(fetched <= dst.row_capacity());
        dst.resize(fetched);
        Ok(())
    }

    fn fetch_rows(&mut self, dst: &mut RowBlock) -> usize {
        let mut fetched = 0;
        loop {
            let (cell_ptr, committed, past_bound) = {
                let (key, slot) = self.iter.get_current_entry();
                let cell = unsafe { &*slot.0 };
                let committed = self.snapshot.is_committed(cell.insertion_timestamp);
                let past_bound = committed
                    && self
                        .upper_bound
                        .as_ref()
                        .is_some_and(|ub| key >= ub.as_slice());
                (slot.0, committed, past_bound)
            };

            if committed {
                if past_bound {
                    self.state = IterState::Finished;
                    break;
                }
                let cell = unsafe { &*cell_ptr };
                let src = RowView::new(self.mrs.schema(), unsafe { cell.body.as_slice() });
                self.projector.project_row(&src, dst, fetched);
                self.apply_mutations(cell, dst, fetched);
            } else {
                // Insertion not visible in this snapshot.
                dst.selection_vector_mut().set_row_unselected(fetched);
            }

            fetched += 1;
            if !self.iter.next() || fetched >= dst.row_capacity() {
                break;
            }
        }
        fetched
    }

    /// Roll forward the committed prefix-visible mutations onto the
    /// projected row. Stored chains are trusted; decode failures here mean
    /// in-memory corruption and abort the process.
    fn apply_mutations(&self, cell: &RowCell, dst: &mut RowBlock, row_idx: usize) {
        for m in Mutation::iter_chain(&cell.redo_head) {
            if !self.snapshot.is_committed(m.timestamp()) {
                continue;
            }
            let decoder = RowChangeListDecoder::new(self.mrs.schema(), m.changelist());
            match decoder.decode() {
                Err(e) => panic!("failed to decode mutation @{}: {e}", m.timestamp()),
                Ok(DecodedChange::Delete) => {
                    dst.selection_vector_mut().set_row_unselected(row_idx);
                }
                Ok(DecodedChange::Reinsert(row_bytes)) => {
                    dst.selection_vector_mut().set_row_selected(row_idx);
                    let src = RowView::new(self.mrs.schema(), row_bytes);
                    self.projector.project_row(&src, dst, row_idx);
                }
                Ok(DecodedChange::Update(updates)) => {
                    for up in &updates {
                        if let Err(e) = self.delta_projector.apply_update(up, dst, row_idx) {
                            panic!("failed to apply mutation @{}: {e}", m.timestamp());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratadb_core::row::RowBuilder;
    use stratadb_core::{ColumnType, Datum};

    fn schema() -> Schema {
        Schema::builder()
            .key_column("key", ColumnType::String, 0)
            .column("val", ColumnType::Int64, 1)
            .build()
            .unwrap()
    }

    fn mrs() -> Arc<MemRowSet> {
        MemRowSet::new(1, schema(), OpIdAnchorRegistry::new(), None).unwrap()
    }

    fn insert_row(mrs: &Arc<MemRowSet>, ts: Timestamp, key: &str, val: i64) -> Result<()> {
        let mut b = RowBuilder::new(Arc::clone(mrs.schema()));
        b.add_string(key).add_i64(val);
        mrs.insert(ts, &b.row(), OpId::new(1, ts))
    }

    fn delete_row(mrs: &Arc<MemRowSet>, ts: Timestamp, key: &str) -> Result<()> {
        let mut buf = Vec::new();
        RowChangeListEncoder::new(mrs.schema(), &mut buf).set_to_delete();
        let probe = RowKeyProbe::from_encoded(key.as_bytes());
        mrs.mutate_row(
            ts,
            &probe,
            &buf,
            OpId::new(1, ts),
            &mut ProbeStats::default(),
            &mut OpResult::default(),
        )
    }

    #[test]
    fn test_schema_without_ids_rejected() {
        let s = Schema::builder()
            .key_column("key", ColumnType::String, 0)
            .column_without_id("val", ColumnType::Int64)
            .build();
        // Builder mixes ids, so construction itself fails.
        assert!(s.is_err());

        // A fully id-less schema builds, but the row store rejects it.
        let idless = Schema::new(
            vec![
                stratadb_core::ColumnSchema {
                    name: "key".into(),
                    ctype: ColumnType::String,
                    id: None,
                },
                stratadb_core::ColumnSchema {
                    name: "val".into(),
                    ctype: ColumnType::Int64,
                    id: None,
                },
            ],
            1,
        )
        .unwrap();
        assert!(matches!(
            MemRowSet::new(7, idless, OpIdAnchorRegistry::new(), None),
            Err(StrataError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_insert_then_present() {
        let mrs = mrs();
        insert_row(&mrs, 5, "k1", 10).unwrap();

        let mut stats = ProbeStats::default();
        let probe = RowKeyProbe::from_encoded(b"k1");
        assert!(mrs.check_row_present(&probe, &mut stats).unwrap());
        assert_eq!(stats.mrs_consulted, 1);

        let absent = RowKeyProbe::from_encoded(b"nope");
        assert!(!mrs.check_row_present(&absent, &mut stats).unwrap());
        assert_eq!(stats.mrs_consulted, 2);
    }

    #[test]
    fn test_double_insert_already_present() {
        let mrs = mrs();
        insert_row(&mrs, 5, "k1", 10).unwrap();
        let err = insert_row(&mrs, 6, "k1", 11).unwrap_err();
        assert!(err.is_already_present());
        assert_eq!(mrs.entry_count(), 1);
    }

    #[test]
    fn test_delete_then_reinsert_uses_same_entry() {
        let mrs = mrs();
        insert_row(&mrs, 5, "k1", 10).unwrap();
        delete_row(&mrs, 10, "k1").unwrap();

        let mut stats = ProbeStats::default();
        let probe = RowKeyProbe::from_encoded(b"k1");
        assert!(!mrs.check_row_present(&probe, &mut stats).unwrap());

        // Mutating a ghost reports NotFound.
        let mut buf = Vec::new();
        let mut enc = RowChangeListEncoder::new(mrs.schema(), &mut buf);
        enc.add_update(1, &Datum::Int64(99)).unwrap();
        let err = mrs
            .mutate_row(
                12,
                &probe,
                &buf,
                OpId::new(1, 12),
                &mut stats,
                &mut OpResult::default(),
            )
            .unwrap_err();
        assert!(err.is_not_found());

        // Reinsert goes through the existing entry.
        insert_row(&mrs, 15, "k1", 42).unwrap();
        assert_eq!(mrs.entry_count(), 1);
        assert!(mrs.check_row_present(&probe, &mut stats).unwrap());
    }

    #[test]
    fn test_mutate_records_target_and_stats() {
        let mrs = mrs();
        insert_row(&mrs, 5, "k1", 10).unwrap();

        let mut buf = Vec::new();
        let mut enc = RowChangeListEncoder::new(mrs.schema(), &mut buf);
        enc.add_update(1, &Datum::Int64(20)).unwrap();

        let mut stats = ProbeStats::default();
        let mut result = OpResult::default();
        mrs.mutate_row(
            20,
            &RowKeyProbe::from_encoded(b"k1"),
            &buf,
            OpId::new(1, 20),
            &mut stats,
            &mut result,
        )
        .unwrap();
        assert_eq!(stats.mrs_consulted, 1);
        assert_eq!(result.mutated_stores(), &[MemStoreTarget { mrs_id: 1 }]);
        assert_eq!(mrs.debug_counts(), (1, 1));
    }

    #[test]
    fn test_mutate_rejects_malformed_and_reinsert() {
        let mrs = mrs();
        insert_row(&mrs, 5, "k1", 10).unwrap();
        let probe = RowKeyProbe::from_encoded(b"k1");
        let mut stats = ProbeStats::default();
        let mut result = OpResult::default();

        for bad in [&[][..], &[9, 9][..]] {
            assert!(matches!(
                mrs.mutate_row(7, &probe, bad, OpId::new(1, 7), &mut stats, &mut result),
                Err(StrataError::InvalidArgument(_))
            ));
        }

        let mut buf = Vec::new();
        let row_image = vec![0u8; mrs.schema().row_width()];
        RowChangeListEncoder::new(mrs.schema(), &mut buf).set_to_reinsert(&row_image);
        assert!(matches!(
            mrs.mutate_row(7, &probe, &buf, OpId::new(1, 7), &mut stats, &mut result),
            Err(StrataError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_alter_schema_and_bounds_not_supported() {
        let mrs = mrs();
        assert!(matches!(
            mrs.alter_schema(&schema()),
            Err(StrataError::NotSupported(_))
        ));
        assert!(matches!(mrs.get_bounds(), Err(StrataError::NotSupported(_))));
    }

    #[test]
    fn test_anchor_tracks_minimum_op_id() {
        let registry = OpIdAnchorRegistry::new();
        let mrs = MemRowSet::new(3, schema(), Arc::clone(&registry), None).unwrap();
        insert_row(&mrs, 5, "b", 1).unwrap();
        insert_row(&mrs, 6, "a", 1).unwrap();
        assert_eq!(registry.anchor_for("MemRowSet-3"), Some(OpId::new(1, 5)));
        drop(mrs);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_tracker_naming_and_consumption() {
        let parent = MemTracker::root("tablet-9");
        let mrs = MemRowSet::new(0, schema(), OpIdAnchorRegistry::new(), Some(&parent)).unwrap();
        assert_eq!(mrs.mem_tracker().id(), "tablet-9-MemRowSet-0");
        assert_eq!(parent.consumption() as usize, mrs.memory_footprint());
        drop(mrs);
        assert_eq!(parent.consumption(), 0);
    }

    #[test]
    fn test_debug_dump_shows_mutations() {
        let mrs = mrs();
        insert_row(&mrs, 5, "k1", 10).unwrap();
        delete_row(&mrs, 10, "k1").unwrap();
        let lines = mrs.debug_dump();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("@5"), "line: {}", lines[0]);
        assert!(lines[0].contains("DELETE"), "line: {}", lines[0]);
    }
}
