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

//! Request dispatch shared by every tracing strategy
//!
//! Transactions go to `debug_traceTransaction`. Synthetic calls go to
//! `debug_traceCall`, whose state-override parameter is not standardized:
//! geth nests it in the tracer options as `stateOverrides`, other clients
//! take it as a fourth positional argument. Both shapes are tried, and when
//! neither is accepted the overlay is written straight into node state
//! through the admin namespace before a plain retrace. Whichever shape works
//! is remembered for the lifetime of the tracer.
//!
//! The injection fallback mutates the node it talks to, so it is only safe
//! against a disposable fork.

use super::{block_param, CallTarget, TraceRequest, TraceTarget};
use crate::{Deadline, EngineConfig, NodeClient, ReplayError};
use alloy_primitives::{Address, U256};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tracefork_common::{quantity::to_quantity_hex, StateOverride, SyntheticCall};
use tracing::{debug, info, warn};

/// How this node accepts a trace-call state override
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverlayShape {
    /// Not negotiated yet
    Unknown = 0,
    /// `stateOverrides` field inside the tracer options
    Nested = 1,
    /// Fourth positional parameter
    Positional = 2,
    /// Written into node state through admin calls
    Inject = 3,
}

impl OverlayShape {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Nested,
            2 => Self::Positional,
            3 => Self::Inject,
            _ => Self::Unknown,
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Unknown | Self::Nested => Some(Self::Positional),
            Self::Positional => Some(Self::Inject),
            Self::Inject => None,
        }
    }
}

/// Issues trace requests against one node on behalf of the strategies
#[derive(Debug)]
pub struct NodeTracer {
    client: Arc<NodeClient>,
    admin_namespace: String,
    call_gas_limit: Option<u64>,
    record_instruction_path: bool,
    tracer_timeout: String,
    overlay_shape: AtomicU8,
}

impl NodeTracer {
    /// Tracer over `client` using the settings in `config`
    pub fn new(client: Arc<NodeClient>, config: &EngineConfig) -> Self {
        Self {
            client,
            admin_namespace: config.admin_namespace.clone(),
            call_gas_limit: config.call_gas_limit,
            record_instruction_path: config.record_instruction_path,
            tracer_timeout: format!("{}s", config.request_timeout_secs),
            overlay_shape: AtomicU8::new(OverlayShape::Unknown as u8),
        }
    }

    /// Underlying node client
    pub fn client(&self) -> &Arc<NodeClient> {
        &self.client
    }

    /// Whether step-level strategies keep the raw instruction path
    pub fn record_instruction_path(&self) -> bool {
        self.record_instruction_path
    }

    /// Overlay shape negotiated so far
    pub fn overlay_shape(&self) -> OverlayShape {
        OverlayShape::from_u8(self.overlay_shape.load(Ordering::Acquire))
    }

    fn remember_shape(&self, shape: OverlayShape) {
        let previous = self.overlay_shape.swap(shape as u8, Ordering::AcqRel);
        if previous != shape as u8 {
            info!("Node accepts trace-call overrides as {shape:?}");
        }
    }

    /// Trace `target` with the given tracer options
    ///
    /// `bulk` marks responses that may outgrow the primary transport.
    pub async fn trace<T: DeserializeOwned>(
        &self,
        target: &TraceTarget,
        options: Value,
        bulk: bool,
        deadline: &Deadline,
    ) -> Result<T, ReplayError> {
        let options = self.with_timeout(options);
        match target {
            TraceTarget::Transaction(hash) => {
                self.send("debug_traceTransaction", json!([hash, options]), bulk, deadline).await
            }
            TraceTarget::Call(call) => self.trace_call(call, options, bulk, deadline).await,
        }
    }

    async fn trace_call<T: DeserializeOwned>(
        &self,
        target: &CallTarget,
        options: Value,
        bulk: bool,
        deadline: &Deadline,
    ) -> Result<T, ReplayError> {
        let message = self.call_message(&target.call);
        let block = block_param(target.block);
        if target.overlay.is_empty() {
            return self
                .send("debug_traceCall", json!([message, block, options]), bulk, deadline)
                .await;
        }

        let mut shape = match self.overlay_shape() {
            OverlayShape::Unknown => OverlayShape::Nested,
            known => known,
        };
        loop {
            let params = match shape {
                OverlayShape::Unknown | OverlayShape::Nested => {
                    let mut nested = options.clone();
                    if let Value::Object(map) = &mut nested {
                        map.insert("stateOverrides".into(), overlay_value(&target.overlay)?);
                    }
                    json!([message, block, nested])
                }
                OverlayShape::Positional => {
                    json!([message, block, options, overlay_value(&target.overlay)?])
                }
                OverlayShape::Inject => {
                    self.inject(&target.overlay, deadline).await?;
                    // Injected state lives at the head of the fork.
                    json!([message, "latest", options])
                }
            };
            match self.send("debug_traceCall", params, bulk, deadline).await {
                Ok(trace) => {
                    self.remember_shape(shape);
                    return Ok(trace);
                }
                Err(err) if err.is_override_rejection() => match shape.next() {
                    Some(next) => {
                        debug!("Override shape {shape:?} rejected ({err}), trying {next:?}");
                        shape = next;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        bulk: bool,
        deadline: &Deadline,
    ) -> Result<T, ReplayError> {
        if bulk {
            self.client.request_bulk(method, params, deadline).await
        } else {
            self.client.request(method, params, deadline).await
        }
    }

    /// Write `overlay` into node state through the admin namespace
    ///
    /// Transport failures and cancellation abort. Any other failure of an
    /// individual write is logged and skipped so the retrace still runs.
    async fn inject(&self, overlay: &StateOverride, deadline: &Deadline) -> Result<(), ReplayError> {
        let ns = &self.admin_namespace;
        let mut writes = Vec::new();
        for (address, account) in overlay.iter() {
            if let Some(balance) = account.balance {
                writes.push((format!("{ns}_setBalance"), json!([address, to_quantity_hex(balance)])));
            }
            if let Some(nonce) = account.nonce {
                writes.push((
                    format!("{ns}_setNonce"),
                    json!([address, to_quantity_hex(U256::from(nonce))]),
                ));
            }
            if let Some(code) = account.code.as_ref().filter(|code| !code.is_empty()) {
                writes.push((format!("{ns}_setCode"), json!([address, code])));
            }
            for (slot, word) in &account.storage {
                writes.push((format!("{ns}_setStorageAt"), json!([address, slot, word])));
            }
        }

        let total = writes.len();
        let mut failed = 0usize;
        for (method, params) in writes {
            match self.client.request::<Value>(&method, params, deadline).await {
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    failed += 1;
                    warn!("State injection through {method} failed: {err}");
                }
            }
        }
        if failed > 0 {
            warn!("{failed} of {total} state writes were not applied");
        } else {
            debug!("Injected {total} state writes");
        }
        Ok(())
    }

    /// JSON call message for a synthetic call
    pub fn call_message(&self, call: &SyntheticCall) -> Value {
        let mut message = Map::new();
        message.insert("from".into(), json!(call.from));
        message.insert("to".into(), json!(call.to));
        message.insert("data".into(), json!(call.input));
        if !call.value.is_zero() {
            message.insert("value".into(), json!(to_quantity_hex(call.value)));
        }
        if let Some(gas) = call.gas.or(self.call_gas_limit) {
            message.insert("gas".into(), json!(to_quantity_hex(U256::from(gas))));
        }
        message.insert("gasPrice".into(), json!("0x0"));
        Value::Object(message)
    }

    /// Contract executing at the outermost frame
    ///
    /// A mined contract creation has no `to`; its receipt names the created
    /// contract instead.
    pub async fn root_contract(
        &self,
        request: &TraceRequest,
        deadline: &Deadline,
    ) -> Result<Address, ReplayError> {
        match &request.target {
            TraceTarget::Call(target) => Ok(target.call.to),
            TraceTarget::Transaction(hash) => {
                let tx = self.client.transaction(*hash, deadline).await?;
                if let Some(to) = tx.to {
                    return Ok(to);
                }
                self.client.created_contract(*hash, deadline).await?.ok_or_else(|| {
                    ReplayError::Input(format!("transaction {hash} has neither a callee nor a created contract"))
                })
            }
        }
    }

    fn with_timeout(&self, mut options: Value) -> Value {
        if let Value::Object(map) = &mut options {
            map.entry("timeout").or_insert_with(|| Value::String(self.tracer_timeout.clone()));
        }
        options
    }
}

fn overlay_value(overlay: &StateOverride) -> Result<Value, ReplayError> {
    serde_json::to_value(overlay).map_err(|e| ReplayError::decode("state override", e))
}
