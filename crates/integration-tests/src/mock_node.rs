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

//! A scripted JSON-RPC node
//!
//! Responses are registered per method, optionally narrowed by a body
//! fragment, the number of parameters or the callee of a traced call.

use alloy_primitives::{Address, Bytes};
use serde_json::{json, Value};
use std::str::FromStr;
use tracefork_engine::{EngineConfig, Simulator};
use wiremock::{matchers::method, Match, Mock, MockServer, Request, ResponseTemplate};

/// Successful JSON-RPC response
pub fn rpc_result(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

/// JSON-RPC error response
pub fn rpc_error(code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {"code": code, "message": message}
    }))
}

/// Matches JSON-RPC requests by method and optional narrowing conditions
#[derive(Debug, Clone)]
pub struct RpcMatcher {
    method: String,
    containing: Vec<String>,
    excluding: Vec<String>,
    params_len: Option<usize>,
    call_to: Option<Address>,
}

impl RpcMatcher {
    /// Requests for `method`
    pub fn method(method: &str) -> Self {
        Self {
            method: method.to_string(),
            containing: Vec::new(),
            excluding: Vec::new(),
            params_len: None,
            call_to: None,
        }
    }

    /// Only requests whose body contains `fragment`
    pub fn containing(mut self, fragment: &str) -> Self {
        self.containing.push(fragment.to_string());
        self
    }

    /// Only requests whose body does not contain `fragment`
    pub fn excluding(mut self, fragment: &str) -> Self {
        self.excluding.push(fragment.to_string());
        self
    }

    /// Only requests with exactly `len` parameters
    pub fn params_len(mut self, len: usize) -> Self {
        self.params_len = Some(len);
        self
    }

    /// Only traced calls whose message targets `to`
    pub fn call_to(mut self, to: Address) -> Self {
        self.call_to = Some(to);
        self
    }
}

impl Match for RpcMatcher {
    fn matches(&self, request: &Request) -> bool {
        let Some(parsed) = RpcRequest::parse(&request.body) else {
            return false;
        };
        let body = String::from_utf8_lossy(&request.body);
        parsed.method == self.method
            && self.containing.iter().all(|fragment| body.contains(fragment.as_str()))
            && !self.excluding.iter().any(|fragment| body.contains(fragment.as_str()))
            && self.params_len.is_none_or(|len| parsed.params().len() == len)
            && self.call_to.is_none_or(|to| parsed.call_to() == Some(to))
    }
}

/// A request received by the node
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// JSON-RPC method
    pub method: String,
    /// Raw parameters
    pub params: Value,
}

impl RpcRequest {
    fn parse(body: &[u8]) -> Option<Self> {
        let envelope: Value = serde_json::from_slice(body).ok()?;
        Some(Self {
            method: envelope.get("method")?.as_str()?.to_string(),
            params: envelope.get("params").cloned().unwrap_or(Value::Null),
        })
    }

    /// Parameters as a list
    pub fn params(&self) -> &[Value] {
        self.params.as_array().map(Vec::as_slice).unwrap_or_default()
    }

    /// Callee of a `debug_traceCall` / `eth_call` message
    pub fn call_to(&self) -> Option<Address> {
        let to = self.params().first()?.get("to")?.as_str()?;
        Address::from_str(to).ok()
    }

    /// Call data of a `debug_traceCall` / `eth_call` message
    pub fn call_data(&self) -> Option<Bytes> {
        let data = self.params().first()?.get("data")?.as_str()?;
        Bytes::from_str(data).ok()
    }

    /// Override sent for `address`, nested in the options or positional
    pub fn override_for(&self, address: Address) -> Option<&Value> {
        let params = self.params();
        let overrides = params
            .get(2)
            .and_then(|options| options.get("stateOverrides"))
            .or_else(|| params.get(3))?
            .as_object()?;
        overrides
            .iter()
            .find(|(key, _)| Address::from_str(key).is_ok_and(|parsed| parsed == address))
            .map(|(_, account)| account)
    }
}

/// A node answering from registered responses
pub struct MockNode {
    server: MockServer,
}

impl MockNode {
    /// Start a node on a random local port
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    /// HTTP endpoint of the node
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Engine configuration pointing at this node
    pub fn config(&self) -> EngineConfig {
        EngineConfig::default().with_rpc_url(self.uri())
    }

    /// Engine connected to this node with default settings
    pub fn simulator(&self) -> Simulator {
        Simulator::new(self.config()).expect("mock node URL is valid")
    }

    /// Answer every request matching `matcher` with `response`
    pub async fn respond(&self, matcher: RpcMatcher, response: ResponseTemplate) {
        Mock::given(method("POST")).and(matcher).respond_with(response).mount(&self.server).await;
    }

    /// Like [`MockNode::respond`], failing verification unless hit exactly `times`
    pub async fn respond_times(&self, matcher: RpcMatcher, response: ResponseTemplate, times: u64) {
        Mock::given(method("POST"))
            .and(matcher)
            .respond_with(response)
            .expect(times)
            .mount(&self.server)
            .await;
    }

    /// Check every `respond_times` expectation
    pub async fn verify(&self) {
        self.server.verify().await;
    }

    /// Every request received so far, in arrival order
    pub async fn requests(&self) -> Vec<RpcRequest> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|request| RpcRequest::parse(&request.body))
            .collect()
    }

    /// Requests received for `method`, in arrival order
    pub async fn requests_for(&self, method: &str) -> Vec<RpcRequest> {
        self.requests().await.into_iter().filter(|request| request.method == method).collect()
    }
}

/// Builders for node payloads
pub mod fixtures {
    use alloy_primitives::{hex, Address};
    use serde_json::{json, Value};

    /// 32-byte word holding `value`, as a stack entry or storage slot
    pub fn word(value: u64) -> String {
        format!("0x{value:064x}")
    }

    /// 32-byte stack word holding `address`
    pub fn address_word(address: Address) -> String {
        format!("0x{:0>64}", hex::encode(address))
    }

    /// One struct-log step
    pub fn step(pc: u64, op: &str, depth: u64, stack: &[String]) -> Value {
        json!({
            "pc": pc,
            "op": op,
            "gas": 100_000,
            "gasCost": 3,
            "depth": depth,
            "stack": stack,
        })
    }

    /// A successful struct-log trace
    pub fn struct_log(steps: Vec<Value>) -> Value {
        json!({
            "gas": 21_000,
            "failed": false,
            "returnValue": "",
            "structLogs": steps,
        })
    }

    /// Stack of a CALL to `target`, with the target second from the top
    pub fn call_stack(target: Address) -> Vec<String> {
        vec![word(0), word(0), word(0), word(0), word(0), address_word(target), word(50_000)]
    }

    /// Stack of an SSTORE of `value` into `slot`, with the slot on top
    pub fn sstore_stack(slot: u64, value: u64) -> Vec<String> {
        vec![word(value), word(slot)]
    }

    /// A mined call transaction
    pub fn mined_transaction(from: Address, to: Address, input: &str) -> Value {
        json!({
            "from": from,
            "to": to,
            "input": input,
            "value": "0x0",
            "gas": "0x7a120",
            "blockNumber": "0x10",
        })
    }

    /// A call-tracer frame without children
    pub fn call_frame(call_type: &str, from: Address, to: Address, input: &str) -> Value {
        json!({
            "type": call_type,
            "from": from,
            "to": to,
            "input": input,
            "gas": "0x10000",
            "gasUsed": "0x100",
        })
    }
}
