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

//! Contiguous rows, scan output blocks, and projection.
//!
//! A row is a flat cell array laid out per its [`Schema`]: fixed-width
//! integers little-endian in place, strings as embedded 16-byte
//! [`ArenaRef`] cells pointing at out-of-line bytes. The types here cover
//! the full read path:
//!
//! - [`RowView`] / [`RowBuilder`] — borrowing view and owning builder.
//! - [`copy_row_to_arena`] — relocate a row (and its string cells) into an
//!   arena, producing the canonical stored copy.
//! - [`RowBlock`] + [`SelectionVector`] — batched scan output with a
//!   block-local arena and per-row visibility bits.
//! - [`RowProjector`] — maps source columns onto a projection schema by
//!   stable column id.
//! - [`DeltaProjector`] — applies decoded change lists onto already
//!   projected rows, dropping updates to unprojected columns.

use std::sync::Arc;

use crate::arena::Arena;
use crate::changelist::{ColumnUpdate, DatumView};
use crate::error::{Result, StrataError};
use crate::memory::MemTracker;
use crate::schema::{ColumnType, Schema};
use crate::slice::ArenaRef;

#[inline]
fn read_i32(data: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

#[inline]
fn read_i64(data: &[u8], off: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[off..off + 8]);
    i64::from_le_bytes(b)
}

#[inline]
fn read_arena_ref(data: &[u8], off: usize) -> ArenaRef {
    debug_assert!(off + 16 <= data.len());
    unsafe { std::ptr::read_unaligned(data.as_ptr().add(off) as *const ArenaRef) }
}

#[inline]
fn write_arena_ref(data: &mut [u8], off: usize, r: ArenaRef) {
    debug_assert!(off + 16 <= data.len());
    unsafe { std::ptr::write_unaligned(data.as_mut_ptr().add(off) as *mut ArenaRef, r) }
}

/// Borrowing view over one row.
///
/// `data` must be a well-formed row for `schema`; string cells must
/// reference memory that outlives the view.
#[derive(Clone, Copy)]
pub struct RowView<'a> {
    schema: &'a Schema,
    data: &'a [u8],
}

impl<'a> RowView<'a> {
    pub fn new(schema: &'a Schema, data: &'a [u8]) -> Self {
        debug_assert_eq!(data.len(), schema.row_width());
        Self { schema, data }
    }

    #[inline]
    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    #[inline]
    pub fn raw_bytes(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn i32_at(&self, idx: usize) -> i32 {
        debug_assert_eq!(self.schema.column(idx).ctype, ColumnType::Int32);
        read_i32(self.data, self.schema.cell_offset(idx))
    }

    #[inline]
    pub fn i64_at(&self, idx: usize) -> i64 {
        debug_assert_eq!(self.schema.column(idx).ctype, ColumnType::Int64);
        read_i64(self.data, self.schema.cell_offset(idx))
    }

    #[inline]
    pub fn string_at(&self, idx: usize) -> &'a [u8] {
        debug_assert_eq!(self.schema.column(idx).ctype, ColumnType::String);
        let r = read_arena_ref(self.data, self.schema.cell_offset(idx));
        unsafe { r.as_slice() }
    }
}

/// Owning row constructor; cells are appended in schema order.
pub struct RowBuilder {
    schema: Arc<Schema>,
    data: Vec<u8>,
    // Boxed so cell references stay stable as more strings are added.
    varlen: Vec<Box<[u8]>>,
    next_col: usize,
}

impl RowBuilder {
    pub fn new(schema: Arc<Schema>) -> Self {
        let width = schema.row_width();
        Self {
            schema,
            data: vec![0; width],
            varlen: Vec::new(),
            next_col: 0,
        }
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
        self.varlen.clear();
        self.next_col = 0;
    }

    pub fn add_i32(&mut self, v: i32) -> &mut Self {
        let idx = self.claim(ColumnType::Int32);
        let off = self.schema.cell_offset(idx);
        self.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
        self
    }

    pub fn add_i64(&mut self, v: i64) -> &mut Self {
        let idx = self.claim(ColumnType::Int64);
        let off = self.schema.cell_offset(idx);
        self.data[off..off + 8].copy_from_slice(&v.to_le_bytes());
        self
    }

    pub fn add_string(&mut self, s: impl AsRef<[u8]>) -> &mut Self {
        let idx = self.claim(ColumnType::String);
        let off = self.schema.cell_offset(idx);
        let boxed: Box<[u8]> = s.as_ref().into();
        let r = unsafe { ArenaRef::from_raw(boxed.as_ptr(), boxed.len()) };
        self.varlen.push(boxed);
        write_arena_ref(&mut self.data, off, r);
        self
    }

    fn claim(&mut self, expected: ColumnType) -> usize {
        let idx = self.next_col;
        assert!(idx < self.schema.num_columns(), "row already complete");
        assert_eq!(
            self.schema.column(idx).ctype,
            expected,
            "column '{}' type mismatch",
            self.schema.column(idx).name
        );
        self.next_col += 1;
        idx
    }

    /// View over the completed row.
    pub fn row(&self) -> RowView<'_> {
        assert_eq!(
            self.next_col,
            self.schema.num_columns(),
            "row is missing cells"
        );
        RowView::new(&self.schema, &self.data)
    }
}

/// Copy `row` into `arena`, relocating every string cell, and return the
/// canonical stored image.
pub fn copy_row_to_arena(row: &RowView<'_>, arena: &Arena) -> ArenaRef {
    let schema = row.schema();
    let width = schema.row_width();
    let dst = arena.alloc_bytes(width, 8);
    unsafe {
        std::ptr::copy_nonoverlapping(row.raw_bytes().as_ptr(), dst, width);
        let dst_slice = std::slice::from_raw_parts_mut(dst, width);
        for idx in 0..schema.num_columns() {
            if schema.column(idx).ctype == ColumnType::String {
                let relocated = arena.alloc_copy(row.string_at(idx));
                write_arena_ref(dst_slice, schema.cell_offset(idx), relocated);
            }
        }
        ArenaRef::from_raw(dst, width)
    }
}

/// Per-row visibility bitmap for a scan block.
pub struct SelectionVector {
    bits: Vec<u64>,
    nrows: usize,
}

impl SelectionVector {
    pub fn new(nrows: usize) -> Self {
        let mut sv = Self {
            bits: vec![0; nrows.div_ceil(64)],
            nrows,
        };
        sv.set_all_true();
        sv
    }

    pub fn resize(&mut self, nrows: usize) {
        self.bits.resize(nrows.div_ceil(64), 0);
        self.nrows = nrows;
        // Mask stale tail bits so counts stay exact.
        let tail = nrows % 64;
        if tail != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }

    pub fn set_all_true(&mut self) {
        self.bits.fill(u64::MAX);
        let tail = self.nrows % 64;
        if tail != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
    }

    #[inline]
    pub fn set_row_selected(&mut self, row: usize) {
        debug_assert!(row < self.nrows);
        self.bits[row / 64] |= 1 << (row % 64);
    }

    #[inline]
    pub fn set_row_unselected(&mut self, row: usize) {
        debug_assert!(row < self.nrows);
        self.bits[row / 64] &= !(1 << (row % 64));
    }

    #[inline]
    pub fn is_selected(&self, row: usize) -> bool {
        debug_assert!(row < self.nrows);
        self.bits[row / 64] & (1 << (row % 64)) != 0
    }

    pub fn count_selected(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }
}

/// Batched scan output: `capacity` rows in the projection schema's layout,
/// a block-local arena for relocated string data, and a selection vector.
pub struct RowBlock {
    schema: Arc<Schema>,
    data: Vec<u8>,
    arena: Arena,
    selection: SelectionVector,
    capacity: usize,
    nrows: usize,
}

impl RowBlock {
    pub fn new(schema: Arc<Schema>, capacity: usize) -> Self {
        let width = schema.row_width();
        let tracker = MemTracker::root("rowblock-arena");
        Self {
            schema,
            data: vec![0; width * capacity],
            arena: Arena::with_chunk_sizes(tracker, 4 * 1024, 256 * 1024),
            selection: SelectionVector::new(capacity),
            capacity,
            nrows: capacity,
        }
    }

    #[inline]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[inline]
    pub fn row_capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Set the logical row count; must not exceed capacity. Shrinking
    /// clears selection bits beyond the new count.
    pub fn resize(&mut self, nrows: usize) {
        assert!(nrows <= self.capacity);
        self.nrows = nrows;
        self.selection.resize(nrows);
    }

    pub fn reset_arena(&mut self) {
        self.arena.reset();
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn selection_vector(&self) -> &SelectionVector {
        &self.selection
    }

    pub fn selection_vector_mut(&mut self) -> &mut SelectionVector {
        &mut self.selection
    }

    #[inline]
    pub fn row_slice(&self, idx: usize) -> &[u8] {
        debug_assert!(idx < self.nrows);
        let w = self.schema.row_width();
        &self.data[idx * w..(idx + 1) * w]
    }

    pub fn row_view(&self, idx: usize) -> RowView<'_> {
        RowView::new(&self.schema, self.row_slice(idx))
    }
}

/// Maps source-schema rows onto a projection schema by stable column id.
pub struct RowProjector {
    src_schema: Arc<Schema>,
    dst_schema: Arc<Schema>,
    /// (dst column index, src column index)
    mapping: Vec<(usize, usize)>,
}

impl RowProjector {
    pub fn new(src_schema: Arc<Schema>, dst_schema: Arc<Schema>) -> Result<Self> {
        if !src_schema.has_column_ids() || !dst_schema.has_column_ids() {
            return Err(StrataError::InvalidArgument(
                "projection requires column ids on both schemas".into(),
            ));
        }
        let mut mapping = Vec::with_capacity(dst_schema.num_columns());
        for (dst_idx, col) in dst_schema.columns().iter().enumerate() {
            let id = col.id.expect("checked above");
            let src_idx = src_schema.find_column_by_id(id).ok_or_else(|| {
                StrataError::InvalidArgument(format!(
                    "projection column '{}' (id {id}) not present in source schema",
                    col.name
                ))
            })?;
            if src_schema.column(src_idx).ctype != col.ctype {
                return Err(StrataError::InvalidArgument(format!(
                    "projection column '{}' type mismatch",
                    col.name
                )));
            }
            mapping.push((dst_idx, src_idx));
        }
        Ok(Self {
            src_schema,
            dst_schema,
            mapping,
        })
    }

    pub fn src_schema(&self) -> &Arc<Schema> {
        &self.src_schema
    }

    pub fn dst_schema(&self) -> &Arc<Schema> {
        &self.dst_schema
    }

    /// Project `src_row` into row `row_idx` of `block`, relocating string
    /// cells into the block's arena.
    pub fn project_row(&self, src_row: &RowView<'_>, block: &mut RowBlock, row_idx: usize) {
        debug_assert!(row_idx < block.nrows);
        let width = self.dst_schema.row_width();
        let base = row_idx * width;
        for &(dst_idx, src_idx) in &self.mapping {
            let dst_off = base + self.dst_schema.cell_offset(dst_idx);
            let src_off = self.src_schema.cell_offset(src_idx);
            match self.dst_schema.column(dst_idx).ctype {
                ColumnType::Int32 => {
                    block.data[dst_off..dst_off + 4]
                        .copy_from_slice(&src_row.raw_bytes()[src_off..src_off + 4]);
                }
                ColumnType::Int64 => {
                    block.data[dst_off..dst_off + 8]
                        .copy_from_slice(&src_row.raw_bytes()[src_off..src_off + 8]);
                }
                ColumnType::String => {
                    let relocated = block.arena.alloc_copy(src_row.string_at(src_idx));
                    write_arena_ref(&mut block.data, dst_off, relocated);
                }
            }
        }
    }
}

/// Applies decoded change-list updates onto projected rows. Updates to
/// columns outside the projection are dropped.
pub struct DeltaProjector {
    dst_schema: Arc<Schema>,
}

impl DeltaProjector {
    pub fn new(src_schema: &Arc<Schema>, dst_schema: Arc<Schema>) -> Result<Self> {
        if !src_schema.has_column_ids() || !dst_schema.has_column_ids() {
            return Err(StrataError::InvalidArgument(
                "delta projection requires column ids on both schemas".into(),
            ));
        }
        for col in dst_schema.columns() {
            let id = col.id.expect("checked above");
            if let Some(src_idx) = src_schema.find_column_by_id(id) {
                if src_schema.column(src_idx).ctype != col.ctype {
                    return Err(StrataError::InvalidArgument(format!(
                        "delta projection column '{}' type mismatch",
                        col.name
                    )));
                }
            }
        }
        Ok(Self { dst_schema })
    }

    /// Apply one column update to row `row_idx` of `block`. Returns true
    /// when the update touched a projected column.
    pub fn apply_update(
        &self,
        update: &ColumnUpdate<'_>,
        block: &mut RowBlock,
        row_idx: usize,
    ) -> Result<bool> {
        let Some(dst_idx) = self.dst_schema.find_column_by_id(update.col_id) else {
            return Ok(false);
        };
        let width = self.dst_schema.row_width();
        let off = row_idx * width + self.dst_schema.cell_offset(dst_idx);
        match (self.dst_schema.column(dst_idx).ctype, update.value) {
            (ColumnType::Int32, DatumView::Int32(v)) => {
                block.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
            (ColumnType::Int64, DatumView::Int64(v)) => {
                block.data[off..off + 8].copy_from_slice(&v.to_le_bytes());
            }
            (ColumnType::String, DatumView::String(s)) => {
                let relocated = block.arena.alloc_copy(s);
                write_arena_ref(&mut block.data, off, relocated);
            }
            _ => {
                return Err(StrataError::InvalidArgument(format!(
                    "update value type mismatch for column id {}",
                    update.col_id
                )));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Datum;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .key_column("key", ColumnType::String, 0)
                .column("count", ColumnType::Int64, 1)
                .column("name", ColumnType::String, 2)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_builder_and_view() {
        let s = schema();
        let mut b = RowBuilder::new(Arc::clone(&s));
        b.add_string("k1").add_i64(42).add_string("alice");
        let row = b.row();
        assert_eq!(row.string_at(0), b"k1");
        assert_eq!(row.i64_at(1), 42);
        assert_eq!(row.string_at(2), b"alice");
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn test_builder_rejects_wrong_type() {
        let s = schema();
        let mut b = RowBuilder::new(s);
        b.add_i64(1);
    }

    #[test]
    fn test_copy_row_to_arena_relocates_strings() {
        let s = schema();
        let tracker = MemTracker::root("row-test");
        let arena = Arena::with_chunk_sizes(tracker, 1024, 4096);

        let copied = {
            let mut b = RowBuilder::new(Arc::clone(&s));
            b.add_string("k1").add_i64(7).add_string("bob");
            let copied = copy_row_to_arena(&b.row(), &arena);
            // The builder (and its string storage) dies here.
            copied
        };
        let view = RowView::new(&s, unsafe { copied.as_slice() });
        assert_eq!(view.string_at(0), b"k1");
        assert_eq!(view.i64_at(1), 7);
        assert_eq!(view.string_at(2), b"bob");
    }

    #[test]
    fn test_selection_vector() {
        let mut sv = SelectionVector::new(130);
        assert_eq!(sv.count_selected(), 130);
        sv.set_row_unselected(0);
        sv.set_row_unselected(64);
        sv.set_row_unselected(129);
        assert_eq!(sv.count_selected(), 127);
        assert!(!sv.is_selected(64));
        sv.set_row_selected(64);
        assert!(sv.is_selected(64));
        // Shrink to rows 0..65: row 0 is still unselected, 64 remain.
        sv.resize(65);
        assert_eq!(sv.count_selected(), 64);
    }

    #[test]
    fn test_projection_subset() {
        let s = schema();
        let proj = Arc::new(
            Schema::builder()
                .key_column("key", ColumnType::String, 0)
                .column("name", ColumnType::String, 2)
                .build()
                .unwrap(),
        );
        let projector = RowProjector::new(Arc::clone(&s), Arc::clone(&proj)).unwrap();
        let mut block = RowBlock::new(Arc::clone(&proj), 4);

        let mut b = RowBuilder::new(Arc::clone(&s));
        b.add_string("k9").add_i64(13).add_string("carol");
        projector.project_row(&b.row(), &mut block, 0);

        let out = block.row_view(0);
        assert_eq!(out.string_at(0), b"k9");
        assert_eq!(out.string_at(1), b"carol");
    }

    #[test]
    fn test_projection_missing_column_rejected() {
        let s = schema();
        let proj = Arc::new(
            Schema::builder()
                .key_column("key", ColumnType::String, 0)
                .column("absent", ColumnType::Int64, 99)
                .build()
                .unwrap(),
        );
        assert!(RowProjector::new(s, proj).is_err());
    }

    #[test]
    fn test_delta_projector_drops_unprojected() {
        let s = schema();
        let proj = Arc::new(
            Schema::builder()
                .key_column("key", ColumnType::String, 0)
                .column("count", ColumnType::Int64, 1)
                .build()
                .unwrap(),
        );
        let dp = DeltaProjector::new(&s, Arc::clone(&proj)).unwrap();
        let mut block = RowBlock::new(Arc::clone(&proj), 1);

        // Update to projected column applies.
        let mut buf = Vec::new();
        let mut enc = crate::changelist::RowChangeListEncoder::new(&s, &mut buf);
        enc.add_update(1, &Datum::Int64(55)).unwrap();
        enc.add_update(2, &Datum::String(b"dropped".to_vec())).unwrap();
        let dec = crate::changelist::RowChangeListDecoder::new(&s, &buf);
        match dec.decode().unwrap() {
            crate::changelist::DecodedChange::Update(ups) => {
                assert!(dp.apply_update(&ups[0], &mut block, 0).unwrap());
                assert!(!dp.apply_update(&ups[1], &mut block, 0).unwrap());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(block.row_view(0).i64_at(1), 55);
    }
}
