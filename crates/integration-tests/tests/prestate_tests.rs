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

//! Pre-state capture against a scripted node

use alloy_primitives::{address, bytes, Address, TxHash, U256};
use serde_json::{json, Map, Value};
use tracefork_engine::{Deadline, ReplayError};
use tracefork_integration_tests::{
    mock_node::{fixtures::word, rpc_error, rpc_result, MockNode, RpcMatcher},
    test_utils::init,
};
use wiremock::ResponseTemplate;

const USER: Address = address!("1000000000000000000000000000000000000001");
const POOL: Address = address!("2000000000000000000000000000000000000002");

fn tx() -> TxHash {
    TxHash::repeat_byte(0x33)
}

fn prestate_tracer() -> RpcMatcher {
    RpcMatcher::method("debug_traceTransaction").containing("prestateTracer")
}

fn captured_state() -> Value {
    json!({
        USER.to_string(): {"balance": "0xde0b6b3a7640000", "nonce": 12},
        POOL.to_string(): {
            "balance": "0x0",
            "nonce": 1,
            "code": "0x6080604052",
            "storage": {word(0): word(1), word(8): word(0xffff)}
        },
        "0x0000000000000000000000000000000000000000": {"balance": "0x0"}
    })
}

#[tokio::test]
async fn test_capture_normalizes_and_drops_trivial_accounts() {
    init::init_test_environment();
    let node = MockNode::start().await;
    node.respond_times(prestate_tracer(), rpc_result(captured_state()), 1).await;
    node.respond(RpcMatcher::method("eth_getCode"), rpc_result(json!("0x"))).await;

    let overlay = node.simulator().build_state_override(tx(), &Deadline::none()).await.unwrap();

    assert_eq!(overlay.len(), 2);
    assert_eq!(overlay[&USER].balance, Some(U256::from(1_000_000_000_000_000_000u64)));
    assert_eq!(overlay[&USER].nonce, Some(12));
    assert_eq!(overlay[&POOL].code, Some(bytes!("6080604052")));
    assert_eq!(overlay.slot_count(), 2);
    node.verify().await;
}

#[tokio::test]
async fn test_capture_survives_a_second_node() {
    init::init_test_environment();
    let first_node = MockNode::start().await;
    first_node.respond(prestate_tracer(), rpc_result(captured_state())).await;
    first_node.respond(RpcMatcher::method("eth_getCode"), rpc_result(json!("0x"))).await;
    let first = first_node.simulator().build_state_override(tx(), &Deadline::none()).await.unwrap();

    // A second node reports the captured overlay back in prestate form.
    let mut echoed = Map::new();
    for (address, account) in first.iter() {
        let mut fields = serde_json::to_value(account).unwrap();
        if let Some(storage) = fields.as_object_mut().and_then(|f| f.remove("stateDiff")) {
            fields["storage"] = storage;
        }
        echoed.insert(address.to_string(), fields);
    }
    let second_node = MockNode::start().await;
    second_node.respond(prestate_tracer(), rpc_result(Value::Object(echoed))).await;
    second_node.respond(RpcMatcher::method("eth_getCode"), rpc_result(json!("0x"))).await;
    let second = second_node.simulator().build_state_override(tx(), &Deadline::none()).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_missing_code_is_recovered() {
    init::init_test_environment();
    let node = MockNode::start().await;
    node.respond(
        prestate_tracer(),
        rpc_result(json!({
            POOL.to_string(): {"nonce": 1, "storage": {word(3): word(4)}},
            USER.to_string(): {"balance": "0x10"}
        })),
    )
    .await;
    node.respond(
        RpcMatcher::method("eth_getCode").containing("2000000000000000000000000000000000000002"),
        rpc_result(json!("0x60016001")),
    )
    .await;
    node.respond(RpcMatcher::method("eth_getCode"), rpc_error(-32000, "header not found")).await;

    let overlay = node.simulator().build_state_override(tx(), &Deadline::none()).await.unwrap();

    assert_eq!(overlay[&POOL].code, Some(bytes!("60016001")));
    assert_eq!(overlay[&USER].code, None, "a failed probe leaves the account as captured");
    assert_eq!(overlay[&USER].balance, Some(U256::from(16)));
}

#[tokio::test]
async fn test_capture_failure_is_returned() {
    init::init_test_environment();
    let node = MockNode::start().await;
    node.respond(prestate_tracer(), rpc_error(-32000, "transaction not found")).await;

    let err = node.simulator().build_state_override(tx(), &Deadline::none()).await.unwrap_err();
    assert!(matches!(err, ReplayError::Rpc { ref message, .. } if message == "transaction not found"));

    let node = MockNode::start().await;
    node.respond(prestate_tracer(), ResponseTemplate::new(500)).await;
    let err = node.simulator().build_state_override(tx(), &Deadline::none()).await.unwrap_err();
    assert!(err.is_fatal());
}
