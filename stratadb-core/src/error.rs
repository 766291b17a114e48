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

//! Error types for StrataDB

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("already present: {0}")]
    AlreadyPresent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl StrataError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StrataError::NotFound(_))
    }

    pub fn is_already_present(&self) -> bool {
        matches!(self, StrataError::AlreadyPresent(_))
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
