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

//! Arena-backed byte views.
//!
//! `ArenaRef` is a raw `(ptr, len)` view into bytes owned by an [`Arena`].
//! It is the cell representation for variable-length columns, the backing
//! reference for row bodies, and the storage for encoded change lists.
//!
//! Lifetime contract: an `ArenaRef` is valid exactly as long as the arena
//! that produced it. Holders (row cells, mutation nodes, iterators) must
//! keep the owning structure alive; the row store does this by handing out
//! iterators that hold a strong reference to the enclosing store.
//!
//! [`Arena`]: crate::arena::Arena

use std::fmt;
use std::ptr::NonNull;

/// A view into arena-owned bytes. 16 bytes, `Copy`, layout-stable so it can
/// be embedded directly inside fixed-width row cells.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ArenaRef {
    ptr: *const u8,
    len: usize,
}

impl ArenaRef {
    /// An empty view. Safe to dereference (zero-length).
    #[inline]
    pub const fn empty() -> Self {
        Self {
            ptr: NonNull::<u8>::dangling().as_ptr(),
            len: 0,
        }
    }

    /// Build a view over raw bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must reference `len` initialized bytes that outlive every use
    /// of the returned view.
    #[inline]
    pub const unsafe fn from_raw(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Reborrow the underlying bytes.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the owning arena is still alive and that
    /// the chosen lifetime does not outlive it.
    #[inline]
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        if self.len == 0 {
            // Zero-length views (including zero-filled cells) carry no
            // dereferenceable pointer.
            return &[];
        }
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    #[inline]
    pub fn len(self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        self.ptr
    }
}

// The pointee is immutable after publication and the arena is internally
// synchronized, so views may cross threads.
unsafe impl Send for ArenaRef {}
unsafe impl Sync for ArenaRef {}

impl fmt::Debug for ArenaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaRef({:p}, len={})", self.ptr, self.len)
    }
}

impl Default for ArenaRef {
    fn default() -> Self {
        Self::empty()
    }
}
