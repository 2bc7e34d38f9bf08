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

//! Call snapshots at entries into the protected contract
//!
//! The snapshot tracer keeps a running cache of every storage write made by
//! the transaction and hooks frame entry, so delegate and static calls and
//! arbitrarily nested or reentrant entries into the protected contract are
//! all seen. At each entry it records the caller, callee, call data, value,
//! the balances read at the calling instruction and the cached writes of
//! both parties.
//!
//! A snapshot merged over the transaction's pre-state is the precondition
//! for replaying that single entry in isolation.

use crate::{tracer::NodeTracer, Deadline, ReplayError, TraceTarget};
use alloy_primitives::{Address, TxHash};
use serde_json::json;
use std::sync::Arc;
use tracefork_common::CallSnapshot;
use tracing::{debug, info, warn};

const SNAPSHOT_TRACER: &str = include_str!("js/snapshot.js");

fn tracer_source(protected: Address) -> String {
    SNAPSHOT_TRACER.replace("__PROTECTED__", &format!("0x{}", alloy_primitives::hex::encode(protected)))
}

/// Captures the state at every entry into a protected contract
#[derive(Debug, Clone)]
pub struct CallSnapshotExtractor {
    tracer: Arc<NodeTracer>,
}

impl CallSnapshotExtractor {
    /// Extractor issuing traces through `tracer`
    pub fn new(tracer: Arc<NodeTracer>) -> Self {
        Self { tracer }
    }

    /// Every entry into `protected` during `tx`, in execution order
    ///
    /// An empty list means the contract was never entered.
    pub async fn extract_all(
        &self,
        tx: TxHash,
        protected: Address,
        deadline: &Deadline,
    ) -> Result<Vec<CallSnapshot>, ReplayError> {
        let options = json!({
            "tracer": tracer_source(protected),
            "tracerConfig": {"onlyTopCall": false},
        });
        let snapshots: Vec<CallSnapshot> = self
            .tracer
            .trace(&TraceTarget::Transaction(tx), options, false, deadline)
            .await?;
        if snapshots.windows(2).any(|pair| pair[0].jump_dest_index > pair[1].jump_dest_index) {
            return Err(ReplayError::decode(
                "call snapshots",
                "capture indices are not in execution order",
            ));
        }
        info!(count = snapshots.len(), "Captured entries into {protected} during {tx}");
        Ok(snapshots)
    }

    /// The entry numbered `index` (zero-based) into `protected`
    ///
    /// An index past the last entry selects the last one.
    pub async fn extract(
        &self,
        tx: TxHash,
        protected: Address,
        index: usize,
        deadline: &Deadline,
    ) -> Result<CallSnapshot, ReplayError> {
        let snapshots = self.extract_all(tx, protected, deadline).await?;
        select_occurrence(snapshots, index, protected)
    }
}

/// Pick occurrence `index`, clamping to the last one
pub fn select_occurrence(
    mut snapshots: Vec<CallSnapshot>,
    index: usize,
    protected: Address,
) -> Result<CallSnapshot, ReplayError> {
    let count = snapshots.len();
    if count == 0 {
        return Err(ReplayError::NoMatchingCall(protected));
    }
    let chosen = if index >= count {
        warn!("Occurrence {index} requested but {protected} was entered {count} times, using the last");
        count - 1
    } else {
        index
    };
    debug!(chosen, count, "Selected call snapshot");
    Ok(snapshots.swap_remove(chosen))
}
