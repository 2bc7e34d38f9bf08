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

use super::Transport;
use crate::{Deadline, EngineConfig, ReplayError};
use alloy_primitives::{Address, Bytes, TxHash, U256};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracefork_common::{
    quantity::{flexible_u256, flexible_u64, flexible_u64_opt, lenient_address_opt, lenient_bytes},
    SyntheticCall,
};
use tracing::{debug, info, warn};

/// JSON-RPC client for one node, with an optional redial endpoint
///
/// The client is safe to share between concurrent replays: HTTP requests are
/// independent and WebSocket requests are serialized on the connection.
#[derive(Debug)]
pub struct NodeClient {
    primary: Transport,
    fallback: Option<Transport>,
    next_id: AtomicU64,
}

impl NodeClient {
    /// Build a client from the engine configuration
    pub fn new(config: &EngineConfig) -> Result<Self, ReplayError> {
        let timeout = config.request_timeout();
        let primary = Transport::from_url(&config.rpc_url, timeout, config.max_response_bytes)?;
        let fallback = config
            .effective_fallback_url()
            .map(|url| Transport::from_url(&url, timeout, None))
            .transpose()?;
        if let Some(fallback) = &fallback {
            debug!("Oversized responses will be redialed on {}", fallback.url());
        }
        Ok(Self { primary, fallback, next_id: AtomicU64::new(1) })
    }

    /// Client for `url` with default settings
    pub fn from_url(url: &str) -> Result<Self, ReplayError> {
        Self::new(&EngineConfig::default().with_rpc_url(url))
    }

    /// Primary endpoint
    pub fn url(&self) -> &str {
        self.primary.url()
    }

    /// Issue a request and decode its result
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        deadline: &Deadline,
    ) -> Result<T, ReplayError> {
        let result = self.call_on(&self.primary, method, params, deadline).await?;
        decode_result(result)
    }

    /// Issue a request whose response may outgrow the primary transport
    ///
    /// A transport-limit failure is redialed once on the fallback endpoint.
    /// Without one, it surfaces as a transport error.
    pub async fn request_bulk<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        deadline: &Deadline,
    ) -> Result<T, ReplayError> {
        match self.call_on(&self.primary, method, params.clone(), deadline).await {
            Err(ReplayError::TransportLimit(reason)) => {
                let Some(fallback) = &self.fallback else {
                    return Err(ReplayError::Transport(format!(
                        "{reason}; no fallback endpoint configured"
                    )));
                };
                info!("Response to {method} exceeded transport limits, redialing {}", fallback.url());
                let result = self.call_on(fallback, method, params, deadline).await.map_err(
                    |err| match err {
                        ReplayError::TransportLimit(reason) => ReplayError::Transport(reason),
                        other => other,
                    },
                )?;
                decode_result(result)
            }
            other => decode_result(other?),
        }
    }

    async fn call_on(
        &self,
        transport: &Transport,
        method: &str,
        params: Value,
        deadline: &Deadline,
    ) -> Result<Value, ReplayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        debug!(method, id, url = transport.url(), "Sending request");
        let envelope = deadline.run(transport.send(&request)).await?;
        parse_envelope(envelope)
    }

    /// Fetch a mined transaction
    pub async fn transaction(
        &self,
        hash: TxHash,
        deadline: &Deadline,
    ) -> Result<MinedTransaction, ReplayError> {
        let tx: Option<MinedTransaction> =
            self.request("eth_getTransactionByHash", json!([hash]), deadline).await?;
        tx.ok_or_else(|| ReplayError::Input(format!("transaction {hash} not found")))
    }

    /// Address created by a contract-creation transaction, if any
    pub async fn created_contract(
        &self,
        hash: TxHash,
        deadline: &Deadline,
    ) -> Result<Option<Address>, ReplayError> {
        let receipt: Option<ReceiptFields> =
            self.request("eth_getTransactionReceipt", json!([hash]), deadline).await?;
        Ok(receipt.and_then(|r| r.contract_address))
    }

    /// Code currently deployed at `address`
    pub async fn code_at(&self, address: Address, deadline: &Deadline) -> Result<Bytes, ReplayError> {
        let code: Value = self.request("eth_getCode", json!([address, "latest"]), deadline).await?;
        match code {
            Value::Null => Ok(Bytes::new()),
            Value::String(raw) => tracefork_common::quantity::parse_bytes(&raw).map_err(Into::into),
            other => Err(ReplayError::decode("eth_getCode result", other)),
        }
    }
}

fn parse_envelope(mut envelope: Value) -> Result<Value, ReplayError> {
    if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        let data = error.get("data").map(|d| match d {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        debug!(code, %message, "Node returned an error");
        return Err(ReplayError::from_rpc(code, message, data));
    }
    match envelope.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => {
            warn!("Response envelope without result or error");
            Err(ReplayError::decode("response envelope", "missing `result`"))
        }
    }
}

fn decode_result<T: DeserializeOwned>(result: Value) -> Result<T, ReplayError> {
    serde_json::from_value(result).map_err(|e| ReplayError::decode("RPC result", e))
}

/// Fields of a mined transaction the engine relies on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinedTransaction {
    /// Sender
    pub from: Address,
    /// Callee; `None` for contract creation
    #[serde(default, with = "lenient_address_opt")]
    pub to: Option<Address>,
    /// Call data
    #[serde(default, with = "lenient_bytes")]
    pub input: Bytes,
    /// Transferred value
    #[serde(default, with = "flexible_u256")]
    pub value: U256,
    /// Gas limit
    #[serde(default, with = "flexible_u64")]
    pub gas: u64,
    /// Inclusion block, `None` while pending
    #[serde(default, with = "flexible_u64_opt")]
    pub block_number: Option<u64>,
}

impl MinedTransaction {
    /// Re-express the transaction as a synthetic call
    pub fn to_call(&self) -> Result<SyntheticCall, ReplayError> {
        let to = self.to.ok_or_else(|| {
            ReplayError::Input("contract-creation transactions cannot be replayed as calls".into())
        })?;
        Ok(SyntheticCall::new(self.from, to, self.input.clone())
            .with_value(self.value)
            .with_gas(self.gas))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptFields {
    #[serde(default, with = "lenient_address_opt")]
    contract_address: Option<Address>,
}
