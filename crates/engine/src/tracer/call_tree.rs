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

//! Call-tree strategy
//!
//! Last resort for nodes that only run the built-in call tracer. There are no
//! program counters at this level, so every visited frame contributes one
//! synthetic path entry whose pc is derived from the callee address. Paths
//! built this way compare meaningfully only against other call-tree paths.

use super::{NodeTracer, TraceRequest, TraceTarget};
use crate::{Deadline, ReplayError};
use alloy_primitives::Address;
use serde_json::json;
use tracefork_common::{CallEdge, CallFrame, ContractJumpDest, ProtectedWindow, ReplayResult, TraceSource};

/// Deterministic stand-in program counter for a call-level path entry
///
/// Big-endian value of the low eight bytes of `address`.
pub fn pseudo_pc(address: Address) -> u64 {
    let mut low = [0u8; 8];
    low.copy_from_slice(&address.as_slice()[12..]);
    u64::from_be_bytes(low)
}

/// Options selecting the built-in call tracer over the whole tree
pub(crate) fn call_tracer_options() -> serde_json::Value {
    json!({"tracer": "callTracer", "tracerConfig": {"onlyTopCall": false}})
}

/// Capture the call tree of `target`
pub(crate) async fn capture(
    tracer: &NodeTracer,
    target: &TraceTarget,
    deadline: &Deadline,
) -> Result<CallFrame, ReplayError> {
    tracer.trace(target, call_tracer_options(), false, deadline).await
}

pub(super) async fn trace(
    tracer: &NodeTracer,
    request: &TraceRequest,
    deadline: &Deadline,
) -> Result<ReplayResult, ReplayError> {
    let root = capture(tracer, &request.target, deadline).await?;
    Ok(from_tree(&root, request.protected))
}

/// Normalize a call tree into a call-level result
pub fn from_tree(root: &CallFrame, protected: Address) -> ReplayResult {
    let mut result = ReplayResult::new(TraceSource::CallTree);
    result.success = root.succeeded();
    result.gas_used = root.gas_used;
    result.return_data = root.output.clone();
    result.error = root.error.clone();

    for flat in root.flatten() {
        let Some(to) = flat.frame.to else { continue };
        result.contract_jump_dests.push(ContractJumpDest { contract: to, pc: pseudo_pc(to) });
        result.jump_dests.push(pseudo_pc(to));
        if flat.depth > 1 {
            result.call_targets.push(to);
            if let Some(caller) = flat.from {
                result.call_edges.push(CallEdge {
                    caller,
                    target: to,
                    op: flat.frame.call_type.clone(),
                    depth: flat.depth - 1,
                });
            }
        }
    }

    result.window = ProtectedWindow::scan(&result.contract_jump_dests, protected);
    result
}
