// tracefork - Transaction Replay and Path Forensics
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
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

//! tracefork common - shared building blocks for replay and path analysis
//!
//! This crate holds the data model exchanged between the replay engine, its
//! tracing backends and its callers, together with the canonical encodings
//! used on the node wire and the logging setup shared by every component.

/// Data model: overrides, replay results, call frames and call snapshots
pub mod types;

/// Logging setup and utilities for consistent logging across components
pub mod logging;
/// Opcode-name classification used when reading step-level traces
pub mod opcode;
/// Canonical hex encodings and lenient numeric parsing for node payloads
pub mod quantity;

pub use logging::*;
pub use types::*;
pub use opcode::*;
pub use quantity::QuantityError;
