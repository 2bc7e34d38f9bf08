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

//! Replay engine facade
//!
//! [`Simulator`] ties the node client, the tracing backends and the state
//! builders together behind the operations callers actually use.
//!
//! # Workflow Overview
//!
//! 1. **Pre-state**: capture the accounts a transaction touched as a
//!    [`StateOverride`]
//! 2. **Replay**: trace the transaction, or a synthetic call against an
//!    overlay, through the [`StrategyChain`]
//! 3. **Call graph**: capture a call tree and replay its frames in order,
//!    optionally rewriting call data per target
//! 4. **Snapshots**: record the state at each entry into a protected
//!    contract and derive isolated replay preconditions from them
//! 5. **Comparison**: compare and classify the resulting paths with the
//!    [`analyzer`](crate::analyzer)
//!
//! Every remote operation takes a [`Deadline`]; cancelling it aborts the
//! in-flight request and nothing falls back past it.

use crate::{
    analyzer::{self, PathAnalysis},
    hooks::{CallExecutor, CallGraphWalker, MutatorSet},
    tracer::{self, NodeTracer, StrategyChain, TraceRequest, TraceTarget},
    CallSnapshotExtractor, Deadline, EngineConfig, NodeClient, ReplayError, StateOverrideBuilder,
};
use alloy_primitives::{Address, Bytes, TxHash};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracefork_common::{CallFrame, CallSnapshot, ReplayResult, StateOverride, SyntheticCall};
use tracing::{debug, info, warn};

/// Outcome of a plain `eth_call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationOutcome {
    /// Whether the call completed without reverting
    pub success: bool,
    /// Output, or revert data when the node supplied it
    pub return_data: Bytes,
    /// Failure reason reported by the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Entry point for replay, simulation and snapshot operations
#[derive(Debug)]
pub struct Simulator {
    config: EngineConfig,
    client: Arc<NodeClient>,
    tracer: Arc<NodeTracer>,
    chain: StrategyChain,
    prestate: StateOverrideBuilder,
    snapshots: CallSnapshotExtractor,
}

impl Simulator {
    /// Connect to the node named in `config`
    ///
    /// No request is sent until the first operation.
    pub fn new(config: EngineConfig) -> Result<Self, ReplayError> {
        let client = Arc::new(NodeClient::new(&config)?);
        let tracer = Arc::new(NodeTracer::new(client.clone(), &config));
        info!(url = client.url(), "Replay engine ready");
        Ok(Self {
            prestate: StateOverrideBuilder::new(client.clone()),
            snapshots: CallSnapshotExtractor::new(tracer.clone()),
            chain: StrategyChain::default(),
            config,
            client,
            tracer,
        })
    }

    /// Replace the strategy order used for replays
    pub fn with_strategies(mut self, chain: StrategyChain) -> Self {
        self.chain = chain;
        self
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying node client
    pub fn client(&self) -> &Arc<NodeClient> {
        &self.client
    }

    /// Trace dispatcher shared by every backend
    pub fn tracer(&self) -> &Arc<NodeTracer> {
        &self.tracer
    }

    /// Pre-state of `tx` as an overlay
    pub async fn build_state_override(
        &self,
        tx: TxHash,
        deadline: &Deadline,
    ) -> Result<StateOverride, ReplayError> {
        self.prestate.build(tx, deadline).await
    }

    /// Replay a mined transaction and window its path on `protected`
    ///
    /// The node replays the transaction at its own position in its block, so
    /// `block` is only recorded alongside the replay.
    pub async fn fork_and_replay(
        &self,
        block: Option<u64>,
        tx: TxHash,
        protected: Address,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        info!(?block, "Replaying {tx} with focus on {protected}");
        self.chain.run(&self.tracer, &TraceRequest::transaction(tx, protected), deadline).await
    }

    /// Re-execute a mined transaction's call message against `overlay`
    pub async fn replay_transaction_with_override(
        &self,
        tx: TxHash,
        block: Option<u64>,
        overlay: StateOverride,
        protected: Address,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        let call = self.client.transaction(tx, deadline).await?.to_call()?;
        debug!(slots = overlay.slot_count(), "Replaying {tx} as a call to {}", call.to);
        self.trace_call(&call, block, &overlay, protected, deadline).await
    }

    /// Trace one synthetic call windowed on `protected`
    pub async fn trace_call(
        &self,
        call: &SyntheticCall,
        block: Option<u64>,
        overlay: &StateOverride,
        protected: Address,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        let request = TraceRequest::call(call.clone(), block, overlay.clone(), protected);
        self.chain.run(&self.tracer, &request, deadline).await
    }

    /// Trace one synthetic call, recording the whole path
    pub async fn simulate_with_call_data(
        &self,
        call: &SyntheticCall,
        block: Option<u64>,
        overlay: &StateOverride,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        self.trace_call(call, block, overlay, Address::ZERO, deadline).await
    }

    /// Call tree of a transaction or a synthetic call
    pub async fn trace_call_tree(
        &self,
        target: &TraceTarget,
        deadline: &Deadline,
    ) -> Result<CallFrame, ReplayError> {
        let tree = tracer::capture_call_tree(&self.tracer, target, deadline).await?;
        debug!(frames = tree.count(), "Captured call tree of {target}");
        Ok(tree)
    }

    /// Plain `eth_call` without tracing
    ///
    /// A revert is reported as an unsuccessful outcome, not an error.
    pub async fn simulate_transaction(
        &self,
        call: &SyntheticCall,
        block: Option<u64>,
        deadline: &Deadline,
    ) -> Result<SimulationOutcome, ReplayError> {
        let params = json!([self.tracer.call_message(call), tracer::block_param(block)]);
        match self.client.request::<Bytes>("eth_call", params, deadline).await {
            Ok(return_data) => Ok(SimulationOutcome { success: true, return_data, error: None }),
            Err(ReplayError::Rpc { message, data, .. }) => {
                let return_data = match data.as_deref().map(str::parse::<Bytes>) {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        warn!("Unreadable revert data from eth_call: {e}");
                        Bytes::new()
                    }
                    None => Bytes::new(),
                };
                Ok(SimulationOutcome { success: false, return_data, error: Some(message) })
            }
            Err(err) => Err(err),
        }
    }

    /// Replay every frame of `tree` in order, folding state between calls
    pub async fn execute_with_hooks(
        &self,
        tree: &CallFrame,
        block: Option<u64>,
        base: StateOverride,
        mutators: &MutatorSet,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        CallGraphWalker::new(self, self.config.failed_call_policy)
            .walk(tree, block, base, mutators, deadline)
            .await
    }

    /// State at entry `index` into `protected` during `tx`
    pub async fn extract_snapshot_for_protected_call(
        &self,
        tx: TxHash,
        protected: Address,
        index: usize,
        deadline: &Deadline,
    ) -> Result<CallSnapshot, ReplayError> {
        self.snapshots.extract(tx, protected, index, deadline).await
    }

    /// State at every entry into `protected` during `tx`
    pub async fn extract_all_call_snapshots(
        &self,
        tx: TxHash,
        protected: Address,
        deadline: &Deadline,
    ) -> Result<Vec<CallSnapshot>, ReplayError> {
        self.snapshots.extract_all(tx, protected, deadline).await
    }

    /// Overlay that replays entry `index` into `protected` in isolation
    ///
    /// The transaction's pre-state with the snapshot's balances and cached
    /// writes laid over it.
    pub async fn precondition_for_protected_call(
        &self,
        tx: TxHash,
        protected: Address,
        index: usize,
        deadline: &Deadline,
    ) -> Result<StateOverride, ReplayError> {
        let mut overlay = self.build_state_override(tx, deadline).await?;
        let snapshot = self.extract_snapshot_for_protected_call(tx, protected, index, deadline).await?;
        overlay.merge_snapshot(&snapshot);
        Ok(overlay)
    }

    /// Similarity of two replays' jump paths
    pub fn similarity(&self, first: &ReplayResult, second: &ReplayResult) -> f64 {
        analyzer::similarity(&first.jump_dests, &second.jump_dests)
    }

    /// Structural summary of a replay
    pub fn analyze(&self, result: &ReplayResult) -> PathAnalysis {
        analyzer::analyze(result)
    }
}

impl CallExecutor for Simulator {
    async fn execute_call(
        &self,
        call: &SyntheticCall,
        block: Option<u64>,
        overlay: &StateOverride,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        self.simulate_with_call_data(call, block, overlay, deadline).await
    }
}
