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

//! Error taxonomy for replay operations
//!
//! Every failure the engine reports carries one of a small number of
//! [`ErrorKind`]s. Callers (and the engine's own fallback chains) decide what
//! to do next from the kind alone:
//!
//! | Kind            | Meaning                                              | Fallback |
//! |-----------------|------------------------------------------------------|----------|
//! | `Transport`     | connection, HTTP or framing failure                  | never    |
//! | `Capability`    | node lacks a tracer or rejects an override shape     | yes      |
//! | `Input`         | malformed tree, transaction or encoding              | never    |
//! | `Node`          | node refused the request for another reason          | chain-specific |
//! | `SemanticEmpty` | nothing to report (no protected entry, empty trace)  | chain-specific |
//! | `Cancelled`     | caller cancelled or the deadline passed              | never    |
//!
//! Node error messages are classified with case-insensitive substring
//! patterns, in the same spirit as the proxy's provider error handling.

use alloy_primitives::Address;
use std::fmt;
use thiserror::Error;
use tracefork_common::QuantityError;

/// JSON-RPC code for an unknown or disabled method
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Messages meaning the requested tracer does not exist on this node
const UNSUPPORTED_TRACER_PATTERNS: &[&str] =
    &["unsupported tracer type", "unsupported tracer", "tracer not found", "unknown tracer"];

/// Messages meaning the node could not accept an override in the shape sent
const OVERRIDE_REJECTION_PATTERNS: &[&str] = &[
    "stateoverrides",
    "unexpected eof",
    "invalid length",
    "did not match any variant of untagged enum ethrpccall",
    "too many arguments",
];

/// Messages meaning a response outgrew a transport buffer
const TRANSPORT_LIMIT_PATTERNS: &[&str] =
    &["read limit exceeded", "message too long", "space limit exceeded", "capacity"];

fn matches_any(message: &str, patterns: &[&str]) -> bool {
    let lowered = message.to_lowercase();
    patterns.iter().any(|pattern| lowered.contains(pattern))
}

/// Whether a transport error message indicates an oversized response
pub fn is_transport_limit_message(message: &str) -> bool {
    matches_any(message, TRANSPORT_LIMIT_PATTERNS)
}

/// Missing node feature behind a capability error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// The tracer requested is not available
    UnsupportedTracer,
    /// The override parameter was rejected in the shape it was sent
    OverrideRejected,
    /// The RPC method is unknown or disabled
    MethodUnavailable,
    /// Local execution was required but no backend is attached
    LocalBackendUnavailable,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnsupportedTracer => "unsupported tracer",
            Self::OverrideRejected => "override rejected",
            Self::MethodUnavailable => "method unavailable",
            Self::LocalBackendUnavailable => "local backend unavailable",
        };
        f.write_str(name)
    }
}

/// Coarse error category driving fallback decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection or framing failure
    Transport,
    /// Missing node feature
    Capability,
    /// Malformed input or response encoding
    Input,
    /// Request refused by the node for a non-capability reason
    Node,
    /// Nothing to report
    SemanticEmpty,
    /// In-process execution backend failure
    Local,
    /// Cancelled by the caller or its deadline
    Cancelled,
}

/// Errors returned by replay operations
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Connection, HTTP status or framing failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Response exceeded a transport buffer limit
    #[error("response exceeded transport limits: {0}")]
    TransportLimit(String),

    /// JSON-RPC error object that matched no capability pattern
    #[error("node error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message as sent by the node
        message: String,
        /// Optional hex payload (revert data)
        data: Option<String>,
    },

    /// Node lacks a feature the request depends on
    #[error("{capability}: {message}")]
    Capability {
        /// Missing feature
        capability: Capability,
        /// Node message or explanation
        message: String,
    },

    /// Malformed caller input
    #[error("invalid input: {0}")]
    Input(String),

    /// Node response did not match the expected shape
    #[error("failed to decode {context}: {reason}")]
    Decode {
        /// What was being decoded
        context: &'static str,
        /// Underlying parse failure
        reason: String,
    },

    /// Trace came back without any step
    #[error("empty trace: {0}")]
    EmptyTrace(String),

    /// The protected contract was never entered
    #[error("no call into protected contract {0}")]
    NoMatchingCall(Address),

    /// Local execution backend failure
    #[error("local backend failed: {0}")]
    Local(String),

    /// Cancellation requested through the deadline token
    #[error("replay cancelled")]
    Cancelled,

    /// The deadline passed before the node answered
    #[error("replay deadline exceeded")]
    DeadlineExceeded,
}

impl ReplayError {
    /// Classify a JSON-RPC error object
    pub fn from_rpc(code: i64, message: impl Into<String>, data: Option<String>) -> Self {
        let message = message.into();
        if matches_any(&message, UNSUPPORTED_TRACER_PATTERNS) {
            Self::Capability { capability: Capability::UnsupportedTracer, message }
        } else if code == METHOD_NOT_FOUND {
            Self::Capability { capability: Capability::MethodUnavailable, message }
        } else {
            Self::Rpc { code, message, data }
        }
    }

    /// Build a decode error
    pub fn decode(context: &'static str, reason: impl fmt::Display) -> Self {
        Self::Decode { context, reason: reason.to_string() }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::TransportLimit(_) => ErrorKind::Transport,
            Self::Local(_) => ErrorKind::Local,
            Self::Capability { .. } => ErrorKind::Capability,
            Self::Input(_) | Self::Decode { .. } => ErrorKind::Input,
            Self::Rpc { .. } => ErrorKind::Node,
            Self::EmptyTrace(_) | Self::NoMatchingCall(_) => ErrorKind::SemanticEmpty,
            Self::Cancelled | Self::DeadlineExceeded => ErrorKind::Cancelled,
        }
    }

    /// Errors that must end any fallback chain immediately
    ///
    /// A local backend failure concerns one call only, so a call-graph walk
    /// records it and moves on to the next call.
    pub fn is_fatal(&self) -> bool {
        match self.kind() {
            ErrorKind::Transport | ErrorKind::Cancelled => true,
            ErrorKind::Local
            | ErrorKind::Capability
            | ErrorKind::Input
            | ErrorKind::Node
            | ErrorKind::SemanticEmpty => false,
        }
    }

    /// Whether this is the given capability error
    pub fn is_capability(&self, wanted: Capability) -> bool {
        matches!(self, Self::Capability { capability, .. } if *capability == wanted)
    }

    /// Whether the node rejected an override parameter in the shape it was sent
    ///
    /// Only meaningful for requests that carried an override.
    pub fn is_override_rejection(&self) -> bool {
        match self {
            Self::Rpc { message, .. } => matches_any(message, OVERRIDE_REJECTION_PATTERNS),
            Self::Capability { capability, .. } => {
                matches!(capability, Capability::OverrideRejected)
            }
            _ => false,
        }
    }
}

impl From<QuantityError> for ReplayError {
    fn from(err: QuantityError) -> Self {
        Self::decode("quantity", err)
    }
}
