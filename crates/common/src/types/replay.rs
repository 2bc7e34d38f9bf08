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

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Backend that produced a [`ReplayResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceSource {
    /// Step-by-step opcode log from the node's default tracer
    StructLog,
    /// Injected script tracer
    Script,
    /// Call-level tracer only; program counters are synthesized
    CallTree,
    /// Aggregate of a hooked call-graph replay
    Hooks,
    /// Local execution backend
    Local,
}

impl fmt::Display for TraceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StructLog => "struct-log",
            Self::Script => "script",
            Self::CallTree => "call-tree",
            Self::Hooks => "hooks",
            Self::Local => "local",
        };
        f.write_str(name)
    }
}

/// A jump target visited by a specific contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractJumpDest {
    /// Code address executing at the time
    pub contract: Address,
    /// Program counter of the JUMPDEST
    pub pc: u64,
}

/// One caller→target message call observed during execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEdge {
    /// Address issuing the call
    pub caller: Address,
    /// Address being called
    pub target: Address,
    /// Call opcode name (CALL, STATICCALL, ...)
    pub op: String,
    /// Depth of the calling frame; the outermost frame is depth 1
    pub depth: usize,
}

/// Storage slot transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUpdate {
    /// Value before the first write, when the backend could read it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<B256>,
    /// Value after the last write
    pub after: B256,
}

/// Per-account effect of an execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    /// Balance when the account was first touched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_before: Option<U256>,
    /// Balance at the end of execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<U256>,
    /// Written slots
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage: BTreeMap<B256, StorageUpdate>,
}

impl StateChange {
    /// Merge a later observation of the same account into this one
    ///
    /// The earliest known "before" values are kept; "after" values come from
    /// `later` whenever it has them.
    pub fn absorb(&mut self, later: &Self) {
        if self.balance_before.is_none() {
            self.balance_before = later.balance_before;
        }
        if later.balance_after.is_some() {
            self.balance_after = later.balance_after;
        }
        for (slot, update) in &later.storage {
            self.storage
                .entry(*slot)
                .and_modify(|existing| {
                    existing.after = update.after;
                    if existing.before.is_none() {
                        existing.before = update.before;
                    }
                })
                .or_insert(*update);
        }
    }
}

/// Merge `later` per-address changes into `acc`
pub fn merge_state_changes(
    acc: &mut BTreeMap<Address, StateChange>,
    later: &BTreeMap<Address, StateChange>,
) {
    for (address, change) in later {
        acc.entry(*address).or_default().absorb(change);
    }
}

/// Event emitted during execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Emitting contract (storage context)
    pub address: Address,
    /// Indexed topics
    #[serde(default)]
    pub topics: Vec<B256>,
    /// Unindexed payload
    #[serde(default)]
    pub data: Bytes,
}

/// One executed instruction, kept only when a raw path was requested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    /// Program counter
    pub pc: u64,
    /// Opcode name
    pub op: String,
    /// Remaining gas before the step
    pub gas: u64,
    /// Gas charged by the step
    pub gas_cost: u64,
    /// Call depth; the outermost frame is depth 1
    pub depth: usize,
    /// Code address executing the step
    pub contract: Address,
}

/// Half-open range `[start, end)` into a jump-destination path
///
/// A window can only be built through [`ProtectedWindow::new`] or
/// [`ProtectedWindow::scan`], both of which guarantee
/// `start <= end <= path length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedWindow {
    start: usize,
    end: usize,
}

impl ProtectedWindow {
    /// Validate raw bounds against a path of `len` entries
    pub fn new(start: usize, end: usize, len: usize) -> Option<Self> {
        (start <= end && end <= len).then_some(Self { start, end })
    }

    /// Window covering the whole path, or `None` for an empty path
    pub fn full(len: usize) -> Option<Self> {
        (len > 0).then_some(Self { start: 0, end: len })
    }

    /// Locate the first and last entries belonging to `focus`
    ///
    /// The zero address means "everything": the window spans the whole path.
    /// Returns `None` when `focus` never executes a jump target.
    pub fn scan(path: &[ContractJumpDest], focus: Address) -> Option<Self> {
        Self::scan_any(path, std::slice::from_ref(&focus))
    }

    /// Like [`ProtectedWindow::scan`] over several focus addresses
    pub fn scan_any(path: &[ContractJumpDest], focus: &[Address]) -> Option<Self> {
        if focus.is_empty() || focus.iter().any(|addr| addr.is_zero()) {
            return Self::full(path.len());
        }
        let start = path.iter().position(|jd| focus.contains(&jd.contract))?;
        let end = path.iter().rposition(|jd| focus.contains(&jd.contract))? + 1;
        Some(Self { start, end })
    }

    /// First index inside the window
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last index inside the window
    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of entries covered
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the window covers nothing
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Normalized outcome of replaying a transaction or a synthetic call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayResult {
    /// Backend that produced this result
    pub source: TraceSource,
    /// Whether the outermost frame completed without error
    pub success: bool,
    /// Gas consumed
    pub gas_used: u64,
    /// Output of the outermost frame
    pub return_data: Bytes,
    /// Visitation-ordered jump targets tagged with the executing contract
    pub contract_jump_dests: Vec<ContractJumpDest>,
    /// Flat program-counter list, parallel to `contract_jump_dests`
    pub jump_dests: Vec<u64>,
    /// Targets of every message call, in order
    pub call_targets: Vec<Address>,
    /// Caller→target edges, in order
    pub call_edges: Vec<CallEdge>,
    /// Effects per touched account
    pub state_changes: BTreeMap<Address, StateChange>,
    /// Emitted events
    pub logs: Vec<LogEntry>,
    /// Window of the path belonging to the protected contract
    pub window: Option<ProtectedWindow>,
    /// Raw instruction path, empty unless requested from a step-level backend
    pub execution_path: Vec<PathStep>,
    /// Storage-write instructions executed, reverted frames included
    #[serde(default)]
    pub storage_writes: usize,
    /// Human-readable failure provenance
    pub error: Option<String>,
}

impl ReplayResult {
    /// Empty successful result from `source`
    pub fn new(source: TraceSource) -> Self {
        Self {
            source,
            success: true,
            gas_used: 0,
            return_data: Bytes::new(),
            contract_jump_dests: Vec::new(),
            jump_dests: Vec::new(),
            call_targets: Vec::new(),
            call_edges: Vec::new(),
            state_changes: BTreeMap::new(),
            logs: Vec::new(),
            window: None,
            execution_path: Vec::new(),
            storage_writes: 0,
            error: None,
        }
    }

    /// Path entries inside the protected window
    pub fn protected_path(&self) -> &[ContractJumpDest] {
        match self.window {
            Some(window) => {
                self.contract_jump_dests.get(window.start..window.end).unwrap_or_default()
            }
            None => &[],
        }
    }

    /// Program counters inside the protected window
    pub fn protected_pcs(&self) -> Vec<u64> {
        self.protected_path().iter().map(|jd| jd.pc).collect()
    }
}
