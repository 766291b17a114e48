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

//! Row change lists.
//!
//! A change list is the compact encoding of one mutation against a row:
//!
//! ```text
//! UPDATE   [0x01] ( [col_id: u32 LE] [value] )*
//! DELETE   [0x02]
//! REINSERT [0x03] [len: u32 LE] [row bytes]
//! ```
//!
//! Fixed-width values are stored little-endian at their cell width; string
//! values are length-prefixed. A REINSERT carries a full row image in the
//! source schema's layout (its variable-length cells reference arena
//! memory owned by the same store as the change list itself).
//!
//! Decoding is schema-driven: the column id determines the value type.
//! Malformed input surfaces as `InvalidArgument`; callers on the write
//! path validate before publishing so that replay never sees a bad list.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, StrataError};
use crate::row::RowView;
use crate::schema::{ColumnType, Datum, Schema};

const TAG_UPDATE: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_REINSERT: u8 = 3;

/// The kind of change a list encodes, readable from the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Update,
    Delete,
    Reinsert,
}

/// A decoded typed value borrowing from the change-list bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatumView<'a> {
    Int32(i32),
    Int64(i64),
    String(&'a [u8]),
}

/// One decoded column update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnUpdate<'a> {
    pub col_id: u32,
    pub value: DatumView<'a>,
}

/// A fully decoded change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedChange<'a> {
    Update(Vec<ColumnUpdate<'a>>),
    Delete,
    Reinsert(&'a [u8]),
}

/// Builds an encoded change list into a caller-owned buffer.
pub struct RowChangeListEncoder<'a> {
    schema: &'a Schema,
    buf: &'a mut Vec<u8>,
}

impl<'a> RowChangeListEncoder<'a> {
    pub fn new(schema: &'a Schema, buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { schema, buf }
    }

    pub fn set_to_delete(&mut self) {
        debug_assert!(self.buf.is_empty(), "change list already initialized");
        self.buf.push(TAG_DELETE);
    }

    /// Encode a REINSERT carrying `row_bytes`, a full row image laid out
    /// per the schema this encoder was created with.
    pub fn set_to_reinsert(&mut self, row_bytes: &[u8]) {
        debug_assert!(self.buf.is_empty(), "change list already initialized");
        debug_assert_eq!(row_bytes.len(), self.schema.row_width());
        self.buf.push(TAG_REINSERT);
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, row_bytes.len() as u32);
        self.buf.extend_from_slice(&len);
        self.buf.extend_from_slice(row_bytes);
    }

    /// Append one column update. The first update writes the UPDATE tag.
    pub fn add_update(&mut self, col_id: u32, value: &Datum) -> Result<()> {
        let idx = self.schema.find_column_by_id(col_id).ok_or_else(|| {
            StrataError::InvalidArgument(format!("unknown column id {col_id} in update"))
        })?;
        let ctype = self.schema.column(idx).ctype;
        if ctype != value.column_type() {
            return Err(StrataError::InvalidArgument(format!(
                "column id {col_id} expects {}, got {}",
                ctype.name(),
                value.column_type().name()
            )));
        }
        if self.buf.is_empty() {
            self.buf.push(TAG_UPDATE);
        } else if self.buf[0] != TAG_UPDATE {
            return Err(StrataError::InvalidArgument(
                "cannot add updates to a DELETE/REINSERT change list".into(),
            ));
        }
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, col_id);
        self.buf.extend_from_slice(&tmp);
        match value {
            Datum::Int32(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Datum::Int64(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Datum::String(s) => {
                LittleEndian::write_u32(&mut tmp, s.len() as u32);
                self.buf.extend_from_slice(&tmp);
                self.buf.extend_from_slice(s);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Decodes an encoded change list against a schema.
pub struct RowChangeListDecoder<'a> {
    schema: &'a Schema,
    data: &'a [u8],
}

impl<'a> RowChangeListDecoder<'a> {
    pub fn new(schema: &'a Schema, data: &'a [u8]) -> Self {
        Self { schema, data }
    }

    /// Peek the change kind without decoding the payload.
    pub fn change_type(&self) -> Result<ChangeType> {
        match self.data.first() {
            Some(&TAG_UPDATE) => Ok(ChangeType::Update),
            Some(&TAG_DELETE) => Ok(ChangeType::Delete),
            Some(&TAG_REINSERT) => Ok(ChangeType::Reinsert),
            Some(&b) => Err(StrataError::InvalidArgument(format!(
                "unknown change list tag {b:#x}"
            ))),
            None => Err(StrataError::InvalidArgument("empty change list".into())),
        }
    }

    pub fn decode(&self) -> Result<DecodedChange<'a>> {
        match self.change_type()? {
            ChangeType::Delete => {
                if self.data.len() != 1 {
                    return Err(StrataError::InvalidArgument(
                        "trailing bytes after DELETE".into(),
                    ));
                }
                Ok(DecodedChange::Delete)
            }
            ChangeType::Reinsert => {
                let payload = &self.data[1..];
                if payload.len() < 4 {
                    return Err(StrataError::InvalidArgument(
                        "truncated REINSERT length".into(),
                    ));
                }
                let len = LittleEndian::read_u32(payload) as usize;
                let row = &payload[4..];
                if row.len() != len || len != self.schema.row_width() {
                    return Err(StrataError::InvalidArgument(format!(
                        "REINSERT row image of {} bytes, expected {}",
                        row.len(),
                        self.schema.row_width()
                    )));
                }
                Ok(DecodedChange::Reinsert(row))
            }
            ChangeType::Update => {
                let mut rest = &self.data[1..];
                let mut updates = Vec::new();
                while !rest.is_empty() {
                    if rest.len() < 4 {
                        return Err(StrataError::InvalidArgument(
                            "truncated update column id".into(),
                        ));
                    }
                    let col_id = LittleEndian::read_u32(rest);
                    rest = &rest[4..];
                    let idx = self.schema.find_column_by_id(col_id).ok_or_else(|| {
                        StrataError::InvalidArgument(format!(
                            "update references unknown column id {col_id}"
                        ))
                    })?;
                    let value = match self.schema.column(idx).ctype {
                        ColumnType::Int32 => {
                            if rest.len() < 4 {
                                return Err(StrataError::InvalidArgument(
                                    "truncated int32 update value".into(),
                                ));
                            }
                            let v = LittleEndian::read_i32(rest);
                            rest = &rest[4..];
                            DatumView::Int32(v)
                        }
                        ColumnType::Int64 => {
                            if rest.len() < 8 {
                                return Err(StrataError::InvalidArgument(
                                    "truncated int64 update value".into(),
                                ));
                            }
                            let v = LittleEndian::read_i64(rest);
                            rest = &rest[8..];
                            DatumView::Int64(v)
                        }
                        ColumnType::String => {
                            if rest.len() < 4 {
                                return Err(StrataError::InvalidArgument(
                                    "truncated string update length".into(),
                                ));
                            }
                            let len = LittleEndian::read_u32(rest) as usize;
                            rest = &rest[4..];
                            if rest.len() < len {
                                return Err(StrataError::InvalidArgument(
                                    "truncated string update value".into(),
                                ));
                            }
                            let s = &rest[..len];
                            rest = &rest[len..];
                            DatumView::String(s)
                        }
                    };
                    updates.push(ColumnUpdate { col_id, value });
                }
                Ok(DecodedChange::Update(updates))
            }
        }
    }
}

/// Render a change list for diagnostics; decoding failures render inline
/// rather than propagating.
pub fn stringify_changelist(schema: &Schema, data: &[u8]) -> String {
    let decoder = RowChangeListDecoder::new(schema, data);
    match decoder.decode() {
        Err(e) => format!("<undecodable: {e}>"),
        Ok(DecodedChange::Delete) => "DELETE".to_string(),
        Ok(DecodedChange::Reinsert(row)) => {
            let view = RowView::new(schema, row);
            format!("REINSERT {}", schema.debug_row(&view))
        }
        Ok(DecodedChange::Update(ups)) => {
            use std::fmt::Write;
            let mut out = String::from("SET ");
            for (i, up) in ups.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let name = schema
                    .find_column_by_id(up.col_id)
                    .map(|idx| schema.column(idx).name.as_str())
                    .unwrap_or("?");
                match up.value {
                    DatumView::Int32(v) => {
                        let _ = write!(out, "{name}={v}");
                    }
                    DatumView::Int64(v) => {
                        let _ = write!(out, "{name}={v}");
                    }
                    DatumView::String(s) => {
                        let _ = write!(out, "{name}={:?}", String::from_utf8_lossy(s));
                    }
                }
            }
            out
        }
    }
}
