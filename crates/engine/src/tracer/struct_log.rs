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

//! Struct-log strategy
//!
//! The default tracer reports one entry per executed instruction, with depth
//! and stack but no notion of which contract is executing. The executing
//! contract is rebuilt from a stack of frames indexed by depth: a call-family
//! instruction names its target on the stack, the next step one level deeper
//! enters it, and a step at a shallower depth pops back to the parent.

use super::{NodeTracer, TraceRequest};
use crate::{Deadline, ReplayError};
use alloy_primitives::{Address, B256};
use serde::Deserialize;
use serde_json::json;
use tracefork_common::{
    quantity::{flexible_u64, parse_bytes, parse_word},
    CallEdge, ContractJumpDest, OpName, PathStep, ProtectedWindow, ReplayResult, StorageUpdate,
    TraceSource,
};
use tracing::trace;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructLogTrace {
    #[serde(default, with = "flexible_u64")]
    gas: u64,
    #[serde(default)]
    failed: bool,
    #[serde(default)]
    return_value: Option<String>,
    #[serde(default)]
    struct_logs: Vec<StructLogStep>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructLogStep {
    #[serde(with = "flexible_u64")]
    pc: u64,
    op: String,
    #[serde(default, with = "flexible_u64")]
    gas: u64,
    #[serde(default, with = "flexible_u64")]
    gas_cost: u64,
    #[serde(with = "flexible_u64")]
    depth: u64,
    #[serde(default)]
    stack: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

impl StructLogStep {
    /// Stack item `n` positions below the top
    ///
    /// Older nodes print stack words as bare hex without a prefix.
    fn peek(&self, n: usize) -> Option<B256> {
        let raw = self.stack.len().checked_sub(n + 1).map(|i| self.stack[i].as_str())?;
        let body = raw.strip_prefix("0x").unwrap_or(raw);
        parse_word(&format!("0x{body}")).ok()
    }

    /// Whether the frame running this step ends here without committing
    fn aborts_frame(&self) -> bool {
        self.error.is_some() || matches!(self.op.as_str(), "REVERT" | "INVALID")
    }
}

/// Code being run and the account whose storage it touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    code: Address,
    context: Address,
}

/// Storage writes made by one frame and the frames it returned from
#[derive(Debug, Default)]
struct Journal {
    writes: Vec<(Address, B256, B256)>,
    aborted: bool,
}

pub(super) async fn trace(
    tracer: &NodeTracer,
    request: &TraceRequest,
    deadline: &Deadline,
) -> Result<ReplayResult, ReplayError> {
    let options = json!({
        "disableStorage": true,
        "disableMemory": true,
        "disableStack": false,
        "enableMemory": false,
        "enableReturnData": true,
    });
    let raw: StructLogTrace = tracer.trace(&request.target, options, true, deadline).await?;
    if raw.struct_logs.is_empty() {
        return Err(ReplayError::EmptyTrace(format!("no struct logs for {}", request.target)));
    }
    let root = tracer.root_contract(request, deadline).await?;
    Ok(rebuild(raw, root, request.protected, tracer.record_instruction_path()))
}

fn rebuild(raw: StructLogTrace, root: Address, protected: Address, keep_path: bool) -> ReplayResult {
    let mut result = ReplayResult::new(TraceSource::StructLog);
    result.success = !raw.failed;
    result.gas_used = raw.gas;
    result.return_data = raw
        .return_value
        .as_deref()
        .and_then(|value| parse_bytes(value).ok())
        .unwrap_or_default();

    let root = Frame { code: root, context: root };
    let mut frames = vec![root];
    let mut journals = vec![Journal::default()];
    let mut pending: Option<Frame> = None;

    for step in &raw.struct_logs {
        let depth = step.depth.max(1) as usize;
        if depth > frames.len() {
            let parent = frames.last().copied().unwrap_or(root);
            // Creation frames have no stack-visible target and keep the parent's tag.
            let entered = pending.unwrap_or(parent);
            frames.resize(depth, entered);
            journals.resize_with(depth, Journal::default);
        } else if depth < frames.len() {
            frames.truncate(depth);
            unwind(&mut journals, depth);
        }
        pending = None;
        let current = frames.last().copied().unwrap_or(root);
        if let Some(journal) = journals.last_mut() {
            journal.aborted = step.aborts_frame();
        }

        if keep_path {
            result.execution_path.push(PathStep {
                pc: step.pc,
                op: step.op.clone(),
                gas: step.gas,
                gas_cost: step.gas_cost,
                depth,
                contract: current.code,
            });
        }

        let op = step.op.as_str();
        if op.is_jump_dest() {
            result.contract_jump_dests.push(ContractJumpDest { contract: current.code, pc: step.pc });
            result.jump_dests.push(step.pc);
        } else if op.is_call() {
            let Some(target) = step.peek(1).map(Address::from_word) else {
                trace!(pc = step.pc, "Call without a readable target");
                continue;
            };
            result.call_targets.push(target);
            result.call_edges.push(CallEdge {
                caller: current.context,
                target,
                op: step.op.clone(),
                depth,
            });
            pending = Some(if op.borrows_context() {
                Frame { code: target, context: current.context }
            } else {
                Frame { code: target, context: target }
            });
        } else if op.writes_storage() {
            result.storage_writes += 1;
            if let (Some(slot), Some(value), Some(journal)) =
                (step.peek(0), step.peek(1), journals.last_mut())
            {
                journal.writes.push((current.context, slot, value));
            }
        }
    }

    // The outermost frame's writes are kept even when it fails.
    unwind(&mut journals, 1);
    if let Some(journal) = journals.pop() {
        for (account, slot, value) in journal.writes {
            record_write(&mut result, account, slot, value);
        }
    }

    result.window = ProtectedWindow::scan(&result.contract_jump_dests, protected);
    result
}

/// Pop journals down to `depth`, folding committed frames into their parent
fn unwind(journals: &mut Vec<Journal>, depth: usize) {
    while journals.len() > depth.max(1) {
        let Some(child) = journals.pop() else { break };
        if child.aborted {
            trace!(writes = child.writes.len(), "Discarding writes of a reverted frame");
            continue;
        }
        if let Some(parent) = journals.last_mut() {
            parent.writes.extend(child.writes);
        }
    }
}

fn record_write(result: &mut ReplayResult, account: Address, slot: B256, value: B256) {
    let change = result.state_changes.entry(account).or_default();
    change
        .storage
        .entry(slot)
        .and_modify(|update| update.after = value)
        .or_insert(StorageUpdate { before: None, after: value });
}
