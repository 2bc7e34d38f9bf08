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

//! Script-tracer strategy
//!
//! Ships a JavaScript tracer that does the bookkeeping node-side: tagged jump
//! targets, call edges, storage writes with the value read just before the
//! first write, balances of value-transfer participants and logs. Windowing
//! happens while tracing. Recording of jump targets starts at the first entry
//! into the protected contract and the window ends after its last jump target.

use super::{NodeTracer, TraceRequest};
use crate::{Deadline, ReplayError};
use alloy_primitives::{Address, Bytes};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracefork_common::{
    quantity::{flexible_u64, lenient_bytes},
    CallEdge, ContractJumpDest, LogEntry, ProtectedWindow, ReplayResult, StateChange, TraceSource,
};
use tracing::debug;

const REPLAY_TRACER: &str = include_str!("js/replay.js");

/// Tracer source with the focus address and record-all flag filled in
pub(crate) fn tracer_source(protected: Address, record_all: bool) -> String {
    REPLAY_TRACER
        .replace("__PROTECTED__", &format!("0x{}", alloy_primitives::hex::encode(protected)))
        .replace("__RECORD_ALL__", if record_all { "true" } else { "false" })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptTrace {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default, with = "flexible_u64")]
    gas_used: u64,
    #[serde(default, with = "lenient_bytes")]
    return_data: Bytes,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    jumps: Vec<ContractJumpDest>,
    #[serde(default)]
    targets: Vec<Address>,
    #[serde(default)]
    edges: Vec<CallEdge>,
    #[serde(default)]
    changes: BTreeMap<Address, StateChange>,
    #[serde(default)]
    storage_writes: usize,
    #[serde(default)]
    logs: Vec<LogEntry>,
    #[serde(default = "unset_index")]
    window_start: i64,
    #[serde(default = "unset_index")]
    window_end: i64,
}

fn default_success() -> bool {
    true
}

fn unset_index() -> i64 {
    -1
}

pub(super) async fn trace(
    tracer: &NodeTracer,
    request: &TraceRequest,
    deadline: &Deadline,
) -> Result<ReplayResult, ReplayError> {
    let options = json!({
        "tracer": tracer_source(request.protected, request.record_all()),
        "tracerConfig": {"onlyTopCall": false},
    });
    let raw: ScriptTrace = tracer.trace(&request.target, options, false, deadline).await?;
    Ok(normalize(raw, request.protected))
}

fn normalize(raw: ScriptTrace, protected: Address) -> ReplayResult {
    let len = raw.jumps.len();
    let window = match (usize::try_from(raw.window_start), usize::try_from(raw.window_end)) {
        (Ok(start), Ok(end)) => ProtectedWindow::new(start, end, len),
        _ => None,
    };
    let window = window.or_else(|| {
        debug!(
            start = raw.window_start,
            end = raw.window_end,
            len,
            "Script tracer window unusable, scanning the path"
        );
        ProtectedWindow::scan(&raw.jumps, protected)
    });

    let mut result = ReplayResult::new(TraceSource::Script);
    result.success = raw.success && raw.error.is_none();
    result.gas_used = raw.gas_used;
    result.return_data = raw.return_data;
    result.error = raw.error;
    result.jump_dests = raw.jumps.iter().map(|jd| jd.pc).collect();
    result.contract_jump_dests = raw.jumps;
    result.call_targets = raw.targets;
    result.call_edges = raw.edges;
    result.state_changes = raw.changes;
    result.storage_writes = raw.storage_writes;
    result.logs = raw.logs;
    result.window = window;
    result
}
