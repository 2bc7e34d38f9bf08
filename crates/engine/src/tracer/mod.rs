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

//! Multi-backend tracing
//!
//! Nodes expose very different debugging surfaces. A full geth-style node
//! returns a step-by-step struct log; some nodes only accept injected script
//! tracers; others only know the built-in call tracer. Each backend is a
//! [`TraceStrategy`], and a [`StrategyChain`] tries them in order until one
//! produces a [`ReplayResult`]:
//!
//! 1. [`TraceStrategy::StructLog`], falling through on any non-fatal error
//! 2. [`TraceStrategy::Script`], falling through on an unsupported-tracer error
//! 3. [`TraceStrategy::CallTree`], whose error is final
//!
//! Transport failures and cancellation end the chain at whichever strategy
//! they occur in.

mod call_tree;
mod dispatch;
#[cfg(test)]
pub(crate) mod js_host;
mod script;
mod struct_log;

pub(crate) use call_tree::capture as capture_call_tree;
pub use call_tree::{from_tree, pseudo_pc};
pub use dispatch::*;

use crate::{Capability, Deadline, ReplayError};
use alloy_primitives::{Address, TxHash};
use serde_json::Value;
use std::fmt;
use tracefork_common::{quantity::to_quantity_hex, ReplayResult, StateOverride, SyntheticCall};
use tracing::{debug, info};

/// Block parameter for a trace-call, `"latest"` when absent
pub fn block_param(block: Option<u64>) -> Value {
    match block {
        Some(number) => Value::String(to_quantity_hex(alloy_primitives::U256::from(number))),
        None => Value::String("latest".into()),
    }
}

/// A synthetic call positioned at a block, with the state it should observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    /// The call itself
    pub call: SyntheticCall,
    /// Block whose state the call runs against; latest when absent
    pub block: Option<u64>,
    /// Account substitutions applied before execution
    pub overlay: StateOverride,
}

/// What a trace runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceTarget {
    /// A mined transaction, replayed in its original position
    Transaction(TxHash),
    /// A synthetic call
    Call(CallTarget),
}

impl fmt::Display for TraceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction(hash) => write!(f, "transaction {hash}"),
            Self::Call(target) => write!(f, "call to {}", target.call.to),
        }
    }
}

/// A trace target plus the contract the path window is anchored to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRequest {
    /// What to trace
    pub target: TraceTarget,
    /// Protected contract; the zero address records everything
    pub protected: Address,
}

impl TraceRequest {
    /// Trace a mined transaction
    pub fn transaction(hash: TxHash, protected: Address) -> Self {
        Self { target: TraceTarget::Transaction(hash), protected }
    }

    /// Trace a synthetic call
    pub fn call(
        call: SyntheticCall,
        block: Option<u64>,
        overlay: StateOverride,
        protected: Address,
    ) -> Self {
        Self { target: TraceTarget::Call(CallTarget { call, block, overlay }), protected }
    }

    /// Whether windowing is disabled
    pub fn record_all(&self) -> bool {
        self.protected.is_zero()
    }
}

/// One way of obtaining a trace from a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceStrategy {
    /// Default struct-log tracer
    StructLog,
    /// Injected JavaScript tracer
    Script,
    /// Built-in call tracer, call-level resolution only
    CallTree,
}

impl fmt::Display for TraceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StructLog => "struct-log",
            Self::Script => "script",
            Self::CallTree => "call-tree",
        };
        f.write_str(name)
    }
}

impl TraceStrategy {
    /// Run this strategy once
    pub async fn try_trace(
        &self,
        tracer: &NodeTracer,
        request: &TraceRequest,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        match self {
            Self::StructLog => struct_log::trace(tracer, request, deadline).await,
            Self::Script => script::trace(tracer, request, deadline).await,
            Self::CallTree => call_tree::trace(tracer, request, deadline).await,
        }
    }

    /// Whether `err` from this strategy lets the chain move on
    ///
    /// Fatal errors never advance, whatever the strategy.
    pub fn advances_on(&self, err: &ReplayError) -> bool {
        if err.is_fatal() {
            return false;
        }
        match self {
            Self::StructLog => true,
            Self::Script => err.is_capability(Capability::UnsupportedTracer),
            Self::CallTree => false,
        }
    }
}

/// Ordered list of strategies tried until one succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyChain {
    strategies: Vec<TraceStrategy>,
}

impl Default for StrategyChain {
    fn default() -> Self {
        Self::new(vec![TraceStrategy::StructLog, TraceStrategy::Script, TraceStrategy::CallTree])
    }
}

impl StrategyChain {
    /// Chain trying `strategies` in the given order
    pub fn new(strategies: Vec<TraceStrategy>) -> Self {
        Self { strategies }
    }

    /// Strategies in attempt order
    pub fn strategies(&self) -> &[TraceStrategy] {
        &self.strategies
    }

    /// Trace `request`, walking the chain
    ///
    /// Each strategy runs at most once. The error of the last strategy tried
    /// is returned when none succeeds.
    pub async fn run(
        &self,
        tracer: &NodeTracer,
        request: &TraceRequest,
        deadline: &Deadline,
    ) -> Result<ReplayResult, ReplayError> {
        let mut strategies = self.strategies.iter().peekable();
        while let Some(strategy) = strategies.next() {
            debug!("Tracing {} with the {strategy} strategy", request.target);
            match strategy.try_trace(tracer, request, deadline).await {
                Ok(result) => {
                    info!(
                        source = %result.source,
                        jumps = result.contract_jump_dests.len(),
                        "Traced {}",
                        request.target
                    );
                    return Ok(result);
                }
                Err(err) if strategies.peek().is_some() && strategy.advances_on(&err) => {
                    debug!("The {strategy} strategy failed ({err}), falling back");
                }
                Err(err) => return Err(err),
            }
        }
        Err(ReplayError::Input("no tracing strategy configured".into()))
    }
}
