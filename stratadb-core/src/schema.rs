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

//! Row schema and order-preserving key encoding.
//!
//! A [`Schema`] describes a fixed-layout row: a prefix of key columns
//! followed by value columns. Rows are stored as contiguous cell arrays
//! (`Int32` = 4 bytes, `Int64` = 8 bytes, `String` = a 16-byte arena
//! reference), so cell offsets are computed once at schema construction.
//!
//! ## Comparable key encoding
//!
//! The ordered index compares keys with plain `memcmp`, so the key columns
//! are encoded into a byte string whose lexicographic order equals the
//! logical row order:
//!
//! - Signed integers: big-endian with the sign bit flipped, so negative
//!   values sort before positive ones.
//! - Strings: raw bytes if the column is the last key column; otherwise
//!   `0x00` is escaped to `0x00 0x01` and the column is terminated with
//!   `0x00 0x00`, which sorts before any continuation of a longer string.
//!
//! `decode_comparable_key` inverts the encoding; re-encoding a decoded key
//! reproduces the input byte-for-byte.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Result, StrataError};
use crate::row::RowView;

/// Buffer type for encoded keys; short keys stay inline.
pub type EncodedKey = SmallVec<[u8; 32]>;

/// Physical column types supported by the row layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int32,
    Int64,
    String,
}

impl ColumnType {
    /// Width of one cell of this type inside a row.
    #[inline]
    pub const fn cell_width(self) -> usize {
        match self {
            ColumnType::Int32 => 4,
            ColumnType::Int64 => 8,
            // (ptr, len) arena reference.
            ColumnType::String => 16,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ColumnType::Int32 => "int32",
            ColumnType::Int64 => "int64",
            ColumnType::String => "string",
        }
    }
}

/// A single typed value; used by row builders, change lists, and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datum {
    Int32(i32),
    Int64(i64),
    String(Vec<u8>),
}

impl Datum {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Datum::Int32(_) => ColumnType::Int32,
            Datum::Int64(_) => ColumnType::Int64,
            Datum::String(_) => ColumnType::String,
        }
    }
}

/// One column of a schema. The id is the stable identity used for
/// projection mapping across schema versions; rows destined for a row
/// store must carry ids on every column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub ctype: ColumnType,
    pub id: Option<u32>,
}

/// Fixed row layout: key column prefix + value columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
    cell_offsets: Vec<usize>,
    row_width: usize,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> Result<Schema> {
        if columns.is_empty() {
            return Err(StrataError::InvalidArgument(
                "schema requires at least one column".into(),
            ));
        }
        if num_key_columns == 0 || num_key_columns > columns.len() {
            return Err(StrataError::InvalidArgument(format!(
                "invalid key column count {} for {} columns",
                num_key_columns,
                columns.len()
            )));
        }
        let with_ids = columns.iter().filter(|c| c.id.is_some()).count();
        if with_ids != 0 && with_ids != columns.len() {
            return Err(StrataError::InvalidArgument(
                "column ids must be assigned to all columns or none".into(),
            ));
        }
        for (i, c) in columns.iter().enumerate() {
            if columns[..i].iter().any(|o| o.name == c.name) {
                return Err(StrataError::InvalidArgument(format!(
                    "duplicate column name '{}'",
                    c.name
                )));
            }
            if let Some(id) = c.id {
                if columns[..i].iter().any(|o| o.id == Some(id)) {
                    return Err(StrataError::InvalidArgument(format!(
                        "duplicate column id {id}"
                    )));
                }
            }
        }

        let mut cell_offsets = Vec::with_capacity(columns.len());
        let mut off = 0;
        for c in &columns {
            cell_offsets.push(off);
            off += c.ctype.cell_width();
        }
        Ok(Schema {
            columns,
            num_key_columns,
            cell_offsets,
            row_width: off,
        })
    }

    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    #[inline]
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    #[inline]
    pub fn column(&self, idx: usize) -> &ColumnSchema {
        &self.columns[idx]
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    #[inline]
    pub fn row_width(&self) -> usize {
        self.row_width
    }

    #[inline]
    pub fn cell_offset(&self, idx: usize) -> usize {
        self.cell_offsets[idx]
    }

    /// True when every column carries a stable id.
    pub fn has_column_ids(&self) -> bool {
        self.columns.iter().all(|c| c.id.is_some())
    }

    /// Position of the column with stable id `id`, if present.
    pub fn find_column_by_id(&self, id: u32) -> Option<usize> {
        self.columns.iter().position(|c| c.id == Some(id))
    }

    /// Position of the column named `name`, if present.
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Encode the key columns of `row` into a memcmp-ordered byte string.
    pub fn encode_comparable_key(&self, row: &RowView<'_>, buf: &mut EncodedKey) {
        buf.clear();
        for idx in 0..self.num_key_columns {
            let last = idx + 1 == self.num_key_columns;
            match self.columns[idx].ctype {
                ColumnType::Int32 => {
                    let v = row.i32_at(idx);
                    buf.extend_from_slice(&((v as u32) ^ 0x8000_0000).to_be_bytes());
                }
                ColumnType::Int64 => {
                    let v = row.i64_at(idx);
                    buf.extend_from_slice(&((v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
                }
                ColumnType::String => {
                    let s = row.string_at(idx);
                    if last {
                        buf.extend_from_slice(s);
                    } else {
                        for &b in s {
                            buf.push(b);
                            if b == 0 {
                                buf.push(1);
                            }
                        }
                        buf.extend_from_slice(&[0, 0]);
                    }
                }
            }
        }
    }

    /// Decode a comparable key back into its column values.
    pub fn decode_comparable_key(&self, encoded: &[u8]) -> Result<Vec<Datum>> {
        let mut out = Vec::with_capacity(self.num_key_columns);
        let mut rest = encoded;
        for idx in 0..self.num_key_columns {
            let last = idx + 1 == self.num_key_columns;
            match self.columns[idx].ctype {
                ColumnType::Int32 => {
                    if rest.len() < 4 {
                        return Err(StrataError::InvalidArgument(
                            "truncated int32 key column".into(),
                        ));
                    }
                    let raw = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                    out.push(Datum::Int32((raw ^ 0x8000_0000) as i32));
                    rest = &rest[4..];
                }
                ColumnType::Int64 => {
                    if rest.len() < 8 {
                        return Err(StrataError::InvalidArgument(
                            "truncated int64 key column".into(),
                        ));
                    }
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&rest[..8]);
                    let raw = u64::from_be_bytes(b);
                    out.push(Datum::Int64((raw ^ 0x8000_0000_0000_0000) as i64));
                    rest = &rest[8..];
                }
                ColumnType::String => {
                    if last {
                        out.push(Datum::String(rest.to_vec()));
                        rest = &[];
                    } else {
                        let mut s = Vec::new();
                        let mut i = 0;
                        loop {
                            if i >= rest.len() {
                                return Err(StrataError::InvalidArgument(
                                    "unterminated string key column".into(),
                                ));
                            }
                            if rest[i] == 0 {
                                if i + 1 >= rest.len() {
                                    return Err(StrataError::InvalidArgument(
                                        "truncated string key escape".into(),
                                    ));
                                }
                                match rest[i + 1] {
                                    0 => {
                                        i += 2;
                                        break;
                                    }
                                    1 => {
                                        s.push(0);
                                        i += 2;
                                    }
                                    b => {
                                        return Err(StrataError::InvalidArgument(format!(
                                            "invalid string key escape byte {b:#x}"
                                        )));
                                    }
                                }
                            } else {
                                s.push(rest[i]);
                                i += 1;
                            }
                        }
                        out.push(Datum::String(s));
                        rest = &rest[i..];
                    }
                }
            }
        }
        if !rest.is_empty() {
            return Err(StrataError::InvalidArgument(
                "trailing bytes after key columns".into(),
            ));
        }
        Ok(out)
    }

    /// Re-encode decoded key values (the inverse of `decode_comparable_key`).
    pub fn encode_key_datums(&self, datums: &[Datum], buf: &mut EncodedKey) -> Result<()> {
        if datums.len() != self.num_key_columns {
            return Err(StrataError::InvalidArgument(format!(
                "expected {} key values, got {}",
                self.num_key_columns,
                datums.len()
            )));
        }
        buf.clear();
        for (idx, d) in datums.iter().enumerate() {
            let last = idx + 1 == self.num_key_columns;
            match (self.columns[idx].ctype, d) {
                (ColumnType::Int32, Datum::Int32(v)) => {
                    buf.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes());
                }
                (ColumnType::Int64, Datum::Int64(v)) => {
                    buf.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
                }
                (ColumnType::String, Datum::String(s)) => {
                    if last {
                        buf.extend_from_slice(s);
                    } else {
                        for &b in s.iter() {
                            buf.push(b);
                            if b == 0 {
                                buf.push(1);
                            }
                        }
                        buf.extend_from_slice(&[0, 0]);
                    }
                }
                (ct, d) => {
                    return Err(StrataError::InvalidArgument(format!(
                        "key column {} expects {}, got {}",
                        idx,
                        ct.name(),
                        d.column_type().name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Human-readable rendering of a row, for diagnostics.
    pub fn debug_row(&self, row: &RowView<'_>) -> String {
        use std::fmt::Write;
        let mut out = String::from("(");
        for (idx, c) in self.columns.iter().enumerate() {
            if idx > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{} {}=", c.ctype.name(), c.name);
            match c.ctype {
                ColumnType::Int32 => {
                    let _ = write!(out, "{}", row.i32_at(idx));
                }
                ColumnType::Int64 => {
                    let _ = write!(out, "{}", row.i64_at(idx));
                }
                ColumnType::String => {
                    let _ = write!(out, "{:?}", String::from_utf8_lossy(row.string_at(idx)));
                }
            }
        }
        out.push(')');
        out
    }
}

/// Fluent schema construction; key columns must be declared before value
/// columns.
#[derive(Default)]
pub struct SchemaBuilder {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
    key_after_value: bool,
}

impl SchemaBuilder {
    pub fn key_column(mut self, name: &str, ctype: ColumnType, id: u32) -> Self {
        if self.columns.len() > self.num_key_columns {
            self.key_after_value = true;
        }
        self.columns.push(ColumnSchema {
            name: name.into(),
            ctype,
            id: Some(id),
        });
        self.num_key_columns += 1;
        self
    }

    pub fn column(mut self, name: &str, ctype: ColumnType, id: u32) -> Self {
        self.columns.push(ColumnSchema {
            name: name.into(),
            ctype,
            id: Some(id),
        });
        self
    }

    /// A column with no stable id; only valid for schemas that never feed
    /// a row store.
    pub fn column_without_id(mut self, name: &str, ctype: ColumnType) -> Self {
        self.columns.push(ColumnSchema {
            name: name.into(),
            ctype,
            id: None,
        });
        self
    }

    pub fn build(self) -> Result<Schema> {
        if self.key_after_value {
            return Err(StrataError::InvalidArgument(
                "key columns must precede value columns".into(),
            ));
        }
        Schema::new(self.columns, self.num_key_columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowBuilder;
    use std::sync::Arc;

    fn kv_schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .key_column("key", ColumnType::String, 0)
                .column("val", ColumnType::Int64, 1)
                .build()
                .unwrap(),
        )
    }

    fn composite_schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .key_column("host", ColumnType::String, 0)
                .key_column("port", ColumnType::Int32, 1)
                .column("metric", ColumnType::Int64, 2)
                .build()
                .unwrap(),
        )
    }

    fn encode(schema: &Arc<Schema>, key: &[u8], val: i64) -> EncodedKey {
        let mut b = RowBuilder::new(Arc::clone(schema));
        b.add_string(key).add_i64(val);
        let mut buf = EncodedKey::new();
        schema.encode_comparable_key(&b.row(), &mut buf);
        buf
    }

    #[test]
    fn test_layout_offsets() {
        let s = composite_schema();
        assert_eq!(s.row_width(), 16 + 4 + 8);
        assert_eq!(s.cell_offset(0), 0);
        assert_eq!(s.cell_offset(1), 16);
        assert_eq!(s.cell_offset(2), 20);
    }

    #[test]
    fn test_schema_validation() {
        assert!(Schema::new(vec![], 0).is_err());
        // Mixed ids rejected.
        let cols = vec![
            ColumnSchema {
                name: "a".into(),
                ctype: ColumnType::Int32,
                id: Some(0),
            },
            ColumnSchema {
                name: "b".into(),
                ctype: ColumnType::Int32,
                id: None,
            },
        ];
        assert!(Schema::new(cols, 1).is_err());
    }

    #[test]
    fn test_key_encoding_preserves_order() {
        let s = kv_schema();
        let keys: &[&[u8]] = &[b"", b"a", b"ab", b"b", b"b\x00", b"b\x01", b"ba"];
        for w in keys.windows(2) {
            let a = encode(&s, w[0], 0);
            let b = encode(&s, w[1], 0);
            assert!(a.as_slice() < b.as_slice(), "{:?} !< {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn test_int_key_encoding_preserves_order() {
        let s = Arc::new(
            Schema::builder()
                .key_column("k", ColumnType::Int64, 0)
                .column("v", ColumnType::Int32, 1)
                .build()
                .unwrap(),
        );
        let values = [i64::MIN, -5, -1, 0, 1, 42, i64::MAX];
        let mut prev: Option<EncodedKey> = None;
        for v in values {
            let mut b = RowBuilder::new(Arc::clone(&s));
            b.add_i64(v).add_i32(0);
            let mut buf = EncodedKey::new();
            s.encode_comparable_key(&b.row(), &mut buf);
            if let Some(p) = prev {
                assert!(p.as_slice() < buf.as_slice(), "order broken at {v}");
            }
            prev = Some(buf);
        }
    }

    #[test]
    fn test_composite_key_escaping_roundtrip() {
        let s = composite_schema();
        let host: &[u8] = b"db\x00east";
        let mut b = RowBuilder::new(Arc::clone(&s));
        b.add_string(host).add_i32(5432).add_i64(1);
        let mut buf = EncodedKey::new();
        s.encode_comparable_key(&b.row(), &mut buf);

        let datums = s.decode_comparable_key(&buf).unwrap();
        assert_eq!(datums[0], Datum::String(host.to_vec()));
        assert_eq!(datums[1], Datum::Int32(5432));

        let mut buf2 = EncodedKey::new();
        s.encode_key_datums(&datums, &mut buf2).unwrap();
        assert_eq!(buf.as_slice(), buf2.as_slice());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let s = composite_schema();
        // Unterminated first string column.
        assert!(s.decode_comparable_key(b"abc").is_err());
        // Bad escape byte.
        assert!(s.decode_comparable_key(b"a\x00\x07\x00\x00AAAA").is_err());
    }

    #[test]
    fn test_random_keys_roundtrip_and_order() {
        use rand::Rng;
        let s = composite_schema();
        let mut rng = rand::thread_rng();
        let mut encoded: Vec<(Vec<u8>, (Vec<u8>, i32))> = Vec::new();
        for _ in 0..500 {
            let len = rng.gen_range(0..12);
            let host: Vec<u8> = (0..len).map(|_| rng.gen_range(0..4u8)).collect();
            let port: i32 = rng.gen();
            let mut b = RowBuilder::new(Arc::clone(&s));
            b.add_string(&host).add_i32(port).add_i64(0);
            let mut buf = EncodedKey::new();
            s.encode_comparable_key(&b.row(), &mut buf);
            let datums = s.decode_comparable_key(&buf).unwrap();
            assert_eq!(datums[0], Datum::String(host.clone()));
            assert_eq!(datums[1], Datum::Int32(port));
            encoded.push((buf.to_vec(), (host, port)));
        }
        encoded.sort();
        for w in encoded.windows(2) {
            assert!(w[0].1 <= w[1].1, "memcmp order diverged from logical order");
        }
    }

    #[test]
    fn test_debug_row() {
        let s = kv_schema();
        let mut b = RowBuilder::new(Arc::clone(&s));
        b.add_string(b"alpha").add_i64(7);
        assert_eq!(s.debug_row(&b.row()), r#"(string key="alpha", int64 val=7)"#);
    }
}
