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

//! Hooked call-graph replay
//!
//! A captured call tree is flattened depth-first and every frame is executed
//! on its own as a synthetic call, with its call data optionally rewritten by
//! a per-target [`CallMutator`]. Each execution sees the overlay left behind
//! by the previous one, so the walk is strictly sequential: the overlay is
//! threaded through the loop as an accumulator.

use crate::{Deadline, FailedCallPolicy, ReplayError};
use alloy_primitives::{Address, Bytes};
use std::{collections::BTreeMap, fmt, future::Future, sync::Arc};
use tracefork_common::{
    merge_state_changes, CallFrame, ProtectedWindow, ReplayResult, StateOverride, SyntheticCall,
    TraceSource,
};
use tracing::{debug, info, warn};

/// Rewrites the call data of calls to one target
///
/// `Ok(None)` keeps the original input. An error is logged and the original
/// input is used.
pub trait CallMutator: Send + Sync {
    /// Produce replacement call data for `frame`
    fn mutate(&self, frame: &CallFrame, original: &Bytes) -> eyre::Result<Option<Bytes>>;
}

impl<F> CallMutator for F
where
    F: Fn(&CallFrame, &Bytes) -> eyre::Result<Option<Bytes>> + Send + Sync,
{
    fn mutate(&self, frame: &CallFrame, original: &Bytes) -> eyre::Result<Option<Bytes>> {
        self(frame, original)
    }
}

/// Mutators keyed by call target
#[derive(Clone, Default)]
pub struct MutatorSet {
    mutators: BTreeMap<Address, Arc<dyn CallMutator>>,
}

impl fmt::Debug for MutatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.mutators.keys()).finish()
    }
}

impl MutatorSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `mutator` for calls to `target`, replacing any previous one
    pub fn register(&mut self, target: Address, mutator: impl CallMutator + 'static) {
        self.mutators.insert(target, Arc::new(mutator));
    }

    /// Register an already shared mutator
    pub fn register_shared(&mut self, target: Address, mutator: Arc<dyn CallMutator>) {
        self.mutators.insert(target, mutator);
    }

    /// Remove the mutator for `target`; returns whether one was registered
    pub fn unregister(&mut self, target: &Address) -> bool {
        self.mutators.remove(target).is_some()
    }

    /// Remove every mutator
    pub fn clear(&mut self) {
        self.mutators.clear();
    }

    /// Mutator registered for `target`
    pub fn get(&self, target: &Address) -> Option<&Arc<dyn CallMutator>> {
        self.mutators.get(target)
    }

    /// Targets with a mutator
    pub fn targets(&self) -> impl Iterator<Item = &Address> {
        self.mutators.keys()
    }

    /// Number of registered mutators
    pub fn len(&self) -> usize {
        self.mutators.len()
    }

    /// Whether no mutator is registered
    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty()
    }

    /// Call data to send for `frame`
    pub fn apply(&self, frame: &CallFrame, target: Address) -> Bytes {
        let Some(mutator) = self.mutators.get(&target) else {
            return frame.input.clone();
        };
        match mutator.mutate(frame, &frame.input) {
            Ok(Some(replacement)) => {
                debug!("Mutator replaced input of call to {target}");
                replacement
            }
            Ok(None) => frame.input.clone(),
            Err(err) => {
                warn!("Mutator for {target} failed, keeping original input: {err:#}");
                frame.input.clone()
            }
        }
    }
}

/// Executes one synthetic call against an overlay
pub trait CallExecutor: Send + Sync {
    /// Run `call` at `block` with `overlay` applied
    fn execute_call(
        &self,
        call: &SyntheticCall,
        block: Option<u64>,
        overlay: &StateOverride,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<ReplayResult, ReplayError>> + Send;
}

/// Sequential replay of a call tree through a [`CallExecutor`]
#[derive(Debug)]
pub struct CallGraphWalker<'a, E> {
    executor: &'a E,
    policy: FailedCallPolicy,
}

impl<'a, E: CallExecutor> CallGraphWalker<'a, E> {
    /// Walker executing through `executor`
    pub fn new(executor: &'a E, policy: FailedCallPolicy) -> Self {
        Self { executor, policy }
    }

    /// Replay every frame of `tree` in depth-first order
    ///
    /// Frames without a callee are rejected before anything runs. A failing
    /// sub-call is recorded in the aggregate's `success` and `error` and the
    /// walk continues; transport failures and cancellation abort it.
    pub async fn walk(
        &self,
        tree: &CallFrame,
        block: Option<u64>,
        base: StateOverride,
        mutators: &MutatorSet,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        let calls = tree.flatten();
        let mut targets = Vec::with_capacity(calls.len());
        for (index, flat) in calls.iter().enumerate() {
            let to = flat.frame.to.ok_or_else(|| {
                ReplayError::Input(format!("call #{index} in the tree has no target"))
            })?;
            targets.push(to);
        }
        info!(calls = calls.len(), mutators = mutators.len(), "Replaying call graph");

        let mut overlay = base;
        let mut aggregate = ReplayResult::new(TraceSource::Hooks);
        let mut failures = Vec::new();

        for (index, (flat, to)) in calls.iter().zip(targets).enumerate() {
            let input = mutators.apply(flat.frame, to);
            let mut call = SyntheticCall::new(flat.from.unwrap_or_default(), to, input)
                .with_value(flat.frame.value.unwrap_or_default());
            if flat.frame.gas > 0 {
                call = call.with_gas(flat.frame.gas);
            }

            let result = match self.executor.execute_call(&call, block, &overlay, deadline).await {
                Ok(result) => result,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!("Call #{index} to {to} failed: {err}");
                    failures.push(format!("call #{index} to {to}: {err}"));
                    continue;
                }
            };

            let keep_state = result.success || self.policy == FailedCallPolicy::FoldState;
            if !result.success {
                let reason = result.error.as_deref().unwrap_or("execution failed");
                debug!("Call #{index} to {to} did not succeed: {reason}");
                failures.push(format!("call #{index} to {to}: {reason}"));
            }
            if keep_state {
                overlay.fold(&result.state_changes);
                merge_state_changes(&mut aggregate.state_changes, &result.state_changes);
            }
            absorb(&mut aggregate, result);
        }

        aggregate.success = failures.is_empty();
        aggregate.error = (!failures.is_empty()).then(|| failures.join("; "));
        aggregate.window = ProtectedWindow::full(aggregate.contract_jump_dests.len());
        Ok(aggregate)
    }
}

fn absorb(aggregate: &mut ReplayResult, result: ReplayResult) {
    aggregate.gas_used = aggregate.gas_used.saturating_add(result.gas_used);
    aggregate.storage_writes += result.storage_writes;
    if !result.return_data.is_empty() {
        aggregate.return_data = result.return_data;
    }
    aggregate.contract_jump_dests.extend(result.contract_jump_dests);
    aggregate.jump_dests.extend(result.jump_dests);
    aggregate.call_targets.extend(result.call_targets);
    aggregate.call_edges.extend(result.call_edges);
    aggregate.logs.extend(result.logs);
    aggregate.execution_path.extend(result.execution_path);
}
