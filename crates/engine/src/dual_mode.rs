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

//! Remote or local execution, chosen per call
//!
//! Remote tracing cannot rewrite call data in the middle of an execution, so
//! as soon as a mutator is registered calls go to a local execution backend
//! that can. Without mutators the node's debugging API is used. Both paths
//! produce the same [`ReplayResult`] shape.

use crate::{
    hooks::{CallExecutor, CallMutator, MutatorSet},
    Capability, Deadline, ReplayError, Simulator,
};
use alloy_primitives::{Address, Bytes};
use auto_impl::auto_impl;
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracefork_common::{
    CallEdge, CallFrame, ContractJumpDest, LogEntry, ProtectedWindow, ReplayResult, StateChange,
    StateOverride, SyntheticCall, TraceSource,
};
use tracing::{debug, info};

/// Everything a local backend needs to run one call
#[derive(Debug, Clone)]
pub struct LocalRequest {
    /// Call to execute
    pub call: SyntheticCall,
    /// Block whose state the call runs against; latest when absent
    pub block: Option<u64>,
    /// Account substitutions applied before execution
    pub overlay: StateOverride,
    /// Call-data rewrites to apply to nested calls while executing
    pub mutators: MutatorSet,
    /// Contracts whose part of the path is of interest
    pub protected: Vec<Address>,
}

/// Raw outcome reported by a local backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalExecution {
    /// Whether the outermost frame succeeded
    pub success: bool,
    /// Gas consumed
    pub gas_used: u64,
    /// Output of the outermost frame
    pub return_data: Bytes,
    /// Visitation-ordered jump targets
    pub jump_path: Vec<ContractJumpDest>,
    /// Message calls, in order
    pub call_edges: Vec<CallEdge>,
    /// Effects per account
    pub state_changes: BTreeMap<Address, StateChange>,
    /// Storage-write instructions executed
    pub storage_writes: usize,
    /// Emitted events
    pub logs: Vec<LogEntry>,
    /// Failure reason
    pub error: Option<String>,
}

impl LocalExecution {
    /// Normalize into a [`ReplayResult`] windowed over `protected`
    pub fn into_result(self, protected: &[Address]) -> ReplayResult {
        let mut result = ReplayResult::new(TraceSource::Local);
        result.success = self.success;
        result.gas_used = self.gas_used;
        result.return_data = self.return_data;
        result.jump_dests = self.jump_path.iter().map(|jd| jd.pc).collect();
        result.window = ProtectedWindow::scan_any(&self.jump_path, protected);
        result.contract_jump_dests = self.jump_path;
        result.call_targets = self.call_edges.iter().map(|edge| edge.target).collect();
        result.call_edges = self.call_edges;
        result.state_changes = self.state_changes;
        result.storage_writes = self.storage_writes;
        result.logs = self.logs;
        result.error = self.error;
        result
    }
}

/// Execution backend running calls in-process
///
/// Implementations are synchronous; the coordinator runs them on the
/// blocking thread pool.
#[auto_impl(&, Arc, Box)]
pub trait LocalExecutor: Send + Sync {
    /// Execute `request`, applying its mutators to matching nested calls
    fn execute(&self, request: &LocalRequest) -> eyre::Result<LocalExecution>;
}

/// Routes calls to the node or to a local backend
pub struct DualModeCoordinator {
    simulator: Arc<Simulator>,
    local: Option<Arc<dyn LocalExecutor>>,
    mutators: RwLock<MutatorSet>,
    protected: RwLock<Vec<Address>>,
    force_local: AtomicBool,
}

impl std::fmt::Debug for DualModeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualModeCoordinator")
            .field("local", &self.local.is_some())
            .field("mutators", &*self.mutators.read())
            .field("protected", &*self.protected.read())
            .field("force_local", &self.force_local.load(Ordering::Relaxed))
            .finish()
    }
}

impl DualModeCoordinator {
    /// Coordinator using only remote tracing until a backend is attached
    pub fn new(simulator: Arc<Simulator>) -> Self {
        Self {
            simulator,
            local: None,
            mutators: RwLock::new(MutatorSet::new()),
            protected: RwLock::new(Vec::new()),
            force_local: AtomicBool::new(false),
        }
    }

    /// Attach a local execution backend
    pub fn with_local_backend(mut self, backend: impl LocalExecutor + 'static) -> Self {
        self.local = Some(Arc::new(backend));
        self
    }

    /// Register a mutator for calls to `target`
    pub fn register_mutator(&self, target: Address, mutator: impl CallMutator + 'static) {
        self.mutators.write().register(target, mutator);
    }

    /// Remove the mutator for `target`
    pub fn unregister_mutator(&self, target: &Address) -> bool {
        self.mutators.write().unregister(target)
    }

    /// Remove every mutator
    pub fn clear_mutators(&self) {
        self.mutators.write().clear();
    }

    /// Route every call to the local backend, mutators or not
    pub fn set_force_local(&self, force: bool) {
        self.force_local.store(force, Ordering::Relaxed);
    }

    /// Contracts the result windows are anchored to
    pub fn set_protected(&self, protected: Vec<Address>) {
        *self.protected.write() = protected;
    }

    /// Whether the next call runs locally
    pub fn uses_local(&self) -> bool {
        self.force_local.load(Ordering::Relaxed) || !self.mutators.read().is_empty()
    }

    /// Execute one call in whichever mode applies
    pub async fn execute(
        &self,
        call: &SyntheticCall,
        block: Option<u64>,
        overlay: &StateOverride,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        let protected = self.protected.read().clone();
        if self.uses_local() {
            return self.execute_local(call, block, overlay, protected, deadline).await;
        }
        debug!("No mutators registered, tracing call to {} remotely", call.to);
        let mut result =
            self.simulator.trace_call(call, block, overlay, Address::ZERO, deadline).await?;
        if !protected.is_empty() {
            result.window = ProtectedWindow::scan_any(&result.contract_jump_dests, &protected);
        }
        Ok(result)
    }

    /// Execute a whole call tree
    ///
    /// Locally the root call runs once and the backend applies mutators to
    /// nested calls as they happen. Remotely every frame is replayed in turn.
    pub async fn execute_tree(
        &self,
        tree: &CallFrame,
        block: Option<u64>,
        overlay: StateOverride,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        if !self.uses_local() {
            return self
                .simulator
                .execute_with_hooks(tree, block, overlay, &MutatorSet::new(), deadline)
                .await;
        }
        let (Some(from), Some(to)) = (tree.from, tree.to) else {
            return Err(ReplayError::Input("call tree root needs both a caller and a callee".into()));
        };
        let mut call = SyntheticCall::new(from, to, tree.input.clone())
            .with_value(tree.value.unwrap_or_default());
        if tree.gas > 0 {
            call = call.with_gas(tree.gas);
        }
        let protected = self.protected.read().clone();
        self.execute_local(&call, block, &overlay, protected, deadline).await
    }

    async fn execute_local(
        &self,
        call: &SyntheticCall,
        block: Option<u64>,
        overlay: &StateOverride,
        protected: Vec<Address>,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        let Some(backend) = self.local.clone() else {
            return Err(ReplayError::Capability {
                capability: Capability::LocalBackendUnavailable,
                message: "local execution required but no backend is attached".into(),
            });
        };
        let request = LocalRequest {
            call: call.clone(),
            block,
            overlay: overlay.clone(),
            mutators: self.mutators.read().clone(),
            protected: protected.clone(),
        };
        info!(mutators = request.mutators.len(), "Executing call to {} locally", call.to);

        let execution = deadline
            .run(async move {
                tokio::task::spawn_blocking(move || backend.execute(&request))
                    .await
                    .map_err(|e| ReplayError::Local(format!("local backend task failed: {e}")))?
                    .map_err(|e| ReplayError::Local(format!("{e:#}")))
            })
            .await?;
        Ok(execution.into_result(&protected))
    }
}

impl CallExecutor for DualModeCoordinator {
    async fn execute_call(
        &self,
        call: &SyntheticCall,
        block: Option<u64>,
        overlay: &StateOverride,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        self.execute(call, block, overlay, deadline).await
    }
}
