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

//! Call-graph replay with mutators, and synthetic calls against overlays
//!
//! These tests verify:
//! - that state written by one replayed call is visible to the next
//! - that mutators rewrite only the calls they target, in tree order
//! - override negotiation down to direct state injection

use alloy_primitives::{address, bytes, Address, Bytes, B256, U256};
use serde_json::{json, Value};
use tracefork_common::{AccountOverride, CallFrame, StateOverride, SyntheticCall, TraceSource};
use tracefork_engine::{Deadline, FailedCallPolicy, MutatorSet, OverlayShape, ReplayError, Simulator};
use tracefork_integration_tests::{
    mock_node::{fixtures::*, rpc_error, rpc_result, MockNode, RpcMatcher},
    test_utils::init,
};

const SENDER: Address = address!("1000000000000000000000000000000000000001");
const AAA: Address = address!("2000000000000000000000000000000000000002");
const BBB: Address = address!("3000000000000000000000000000000000000003");

const SLOT: u64 = 7;

fn trace_call() -> RpcMatcher {
    RpcMatcher::method("debug_traceCall").containing("disableStorage")
}

/// Root call to AAA with one nested call from AAA to BBB, both with input 0x01
fn two_call_tree() -> CallFrame {
    let mut root = call_frame("CALL", SENDER, AAA, "0x01");
    root["calls"] = json!([call_frame("CALL", AAA, BBB, "0x01")]);
    serde_json::from_value(root).unwrap()
}

/// AAA writes 1 into SLOT
fn writes_slot(failed: bool) -> Value {
    let mut trace = struct_log(vec![
        step(1, "JUMPDEST", 1, &[]),
        step(2, "SSTORE", 1, &sstore_stack(SLOT, 1)),
        step(3, "STOP", 1, &[]),
    ]);
    trace["failed"] = json!(failed);
    trace
}

/// BBB reads SLOT
fn reads_slot() -> Value {
    struct_log(vec![
        step(5, "JUMPDEST", 1, &[]),
        step(6, "SLOAD", 1, &[word(SLOT)]),
        step(7, "STOP", 1, &[]),
    ])
}

fn slot() -> B256 {
    B256::from(U256::from(SLOT))
}

async fn causality_node() -> MockNode {
    let node = MockNode::start().await;
    node.respond(trace_call().call_to(AAA), rpc_result(writes_slot(false))).await;
    node.respond(trace_call().call_to(BBB), rpc_result(reads_slot())).await;
    node
}

#[tokio::test]
async fn test_later_call_sees_earlier_write() {
    init::init_test_environment();
    let node = causality_node().await;
    let simulator = node.simulator();

    let result = simulator
        .execute_with_hooks(
            &two_call_tree(),
            Some(16),
            StateOverride::new(),
            &MutatorSet::new(),
            &Deadline::none(),
        )
        .await
        .unwrap();

    assert_eq!(result.source, TraceSource::Hooks);
    assert!(result.success);
    assert_eq!(result.jump_dests, vec![1, 5]);
    assert_eq!(result.state_changes[&AAA].storage[&slot()].after, B256::from(U256::from(1)));

    let traces = node.requests_for("debug_traceCall").await;
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[0].call_to(), Some(AAA));
    assert!(traces[0].override_for(AAA).is_none());

    assert_eq!(traces[1].call_to(), Some(BBB));
    let seen = traces[1].override_for(AAA).expect("second call carries the first call's write");
    assert_eq!(seen["stateDiff"][word(SLOT)], json!(word(1)));
}

#[tokio::test]
async fn test_reverted_inner_frame_write_is_not_carried_forward() {
    init::init_test_environment();
    const HELPER: Address = address!("4000000000000000000000000000000000000004");
    let node = MockNode::start().await;
    // AAA calls a helper that writes its own SLOT and then reverts.
    let aaa_trace = struct_log(vec![
        step(1, "JUMPDEST", 1, &[]),
        step(2, "CALL", 1, &call_stack(HELPER)),
        step(0, "SSTORE", 2, &sstore_stack(SLOT, 1)),
        step(1, "REVERT", 2, &[word(0), word(0)]),
        step(3, "SSTORE", 1, &sstore_stack(SLOT + 1, 2)),
        step(4, "STOP", 1, &[]),
    ]);
    node.respond(trace_call().call_to(AAA), rpc_result(aaa_trace)).await;
    node.respond(trace_call().call_to(BBB), rpc_result(reads_slot())).await;

    let result = node
        .simulator()
        .execute_with_hooks(&two_call_tree(), None, StateOverride::new(), &MutatorSet::new(), &Deadline::none())
        .await
        .unwrap();

    assert!(result.success, "an inner revert does not fail the outer call");
    assert!(!result.state_changes.contains_key(&HELPER));
    assert_eq!(result.storage_writes, 2);

    let traces = node.requests_for("debug_traceCall").await;
    assert!(traces[1].override_for(HELPER).is_none(), "the reverted write never reaches the next call");
    let kept = traces[1].override_for(AAA).expect("the outer call's own write is folded");
    assert_eq!(kept["stateDiff"][word(SLOT + 1)], json!(word(2)));
}

#[tokio::test]
async fn test_failed_call_state_follows_policy() {
    init::init_test_environment();
    for (policy, expect_override) in
        [(FailedCallPolicy::FoldState, true), (FailedCallPolicy::SkipState, false)]
    {
        let node = MockNode::start().await;
        node.respond(trace_call().call_to(AAA), rpc_result(writes_slot(true))).await;
        node.respond(trace_call().call_to(BBB), rpc_result(reads_slot())).await;
        let simulator =
            Simulator::new(node.config().with_failed_call_policy(policy)).unwrap();

        let result = simulator
            .execute_with_hooks(
                &two_call_tree(),
                None,
                StateOverride::new(),
                &MutatorSet::new(),
                &Deadline::none(),
            )
            .await
            .unwrap();

        assert!(!result.success, "a failed sub-call fails the aggregate");
        assert!(result.error.as_deref().is_some_and(|error| error.contains("call #0")));
        assert_eq!(result.jump_dests, vec![1, 5], "the walk continues past the failure");

        let traces = node.requests_for("debug_traceCall").await;
        assert_eq!(traces[1].override_for(AAA).is_some(), expect_override, "{policy:?}");
    }
}

#[tokio::test]
async fn test_mutator_rewrites_only_its_target() {
    init::init_test_environment();
    let node = MockNode::start().await;
    node.respond(trace_call(), rpc_result(struct_log(vec![step(1, "JUMPDEST", 1, &[])]))).await;

    let mut mutators = MutatorSet::new();
    mutators.register(AAA, |_: &CallFrame, input: &Bytes| -> eyre::Result<Option<Bytes>> {
        Ok((input.as_ref() == [0x01]).then(|| bytes!("02")))
    });

    node.simulator()
        .execute_with_hooks(&two_call_tree(), None, StateOverride::new(), &mutators, &Deadline::none())
        .await
        .unwrap();

    let executed: Vec<_> = node
        .requests_for("debug_traceCall")
        .await
        .iter()
        .map(|request| (request.call_to().unwrap(), request.call_data().unwrap()))
        .collect();
    assert_eq!(executed, vec![(AAA, bytes!("02")), (BBB, bytes!("01"))]);
}

#[tokio::test]
async fn test_frame_without_target_runs_nothing() {
    init::init_test_environment();
    let node = MockNode::start().await;
    node.respond_times(trace_call(), rpc_result(reads_slot()), 0).await;

    let mut root = call_frame("CALL", SENDER, AAA, "0x01");
    root["calls"] = json!([{"type": "CREATE", "from": AAA, "input": "0x"}]);
    let tree: CallFrame = serde_json::from_value(root).unwrap();

    let err = node
        .simulator()
        .execute_with_hooks(&tree, None, StateOverride::new(), &MutatorSet::new(), &Deadline::none())
        .await
        .unwrap_err();
    assert!(matches!(err, ReplayError::Input(_)));
    node.verify().await;
}

#[tokio::test]
async fn test_override_negotiation_falls_back_to_injection() {
    init::init_test_environment();
    let node = MockNode::start().await;
    node.respond_times(
        RpcMatcher::method("debug_traceCall").containing("stateOverrides"),
        rpc_error(-32602, "invalid argument 2: json: unknown field \"stateOverrides\""),
        1,
    )
    .await;
    node.respond_times(
        RpcMatcher::method("debug_traceCall").params_len(4),
        rpc_error(-32602, "too many arguments, want at most 3"),
        1,
    )
    .await;
    node.respond_times(RpcMatcher::method("anvil_setBalance"), rpc_result(Value::Null), 2).await;
    node.respond_times(RpcMatcher::method("anvil_setStorageAt"), rpc_result(json!(true)), 2).await;
    node.respond_times(RpcMatcher::method("anvil_setNonce"), rpc_result(Value::Null), 0).await;
    node.respond_times(
        RpcMatcher::method("debug_traceCall").params_len(3).excluding("stateOverrides"),
        rpc_result(reads_slot()),
        2,
    )
    .await;

    let mut overlay = StateOverride::new();
    overlay.insert_account(
        AAA,
        AccountOverride {
            balance: Some(U256::from(100)),
            storage: [(slot(), B256::from(U256::from(5)))].into_iter().collect(),
            ..Default::default()
        },
    );
    let call = SyntheticCall::new(SENDER, BBB, bytes!("01"));
    let simulator = node.simulator();

    let first =
        simulator.simulate_with_call_data(&call, Some(16), &overlay, &Deadline::none()).await.unwrap();
    assert_eq!(first.source, TraceSource::StructLog);
    assert_eq!(simulator.tracer().overlay_shape(), OverlayShape::Inject);

    // The negotiated shape is reused without probing again.
    simulator.simulate_with_call_data(&call, Some(16), &overlay, &Deadline::none()).await.unwrap();

    let retraces: Vec<_> = node
        .requests_for("debug_traceCall")
        .await
        .into_iter()
        .filter(|request| request.params().len() == 3 && request.params()[2].get("stateOverrides").is_none())
        .collect();
    assert_eq!(retraces.len(), 2);
    assert!(retraces.iter().all(|request| request.params()[1] == json!("latest")));
    node.verify().await;
}

#[tokio::test]
async fn test_empty_overlay_sends_no_override() {
    init::init_test_environment();
    let node = MockNode::start().await;
    node.respond_times(trace_call().params_len(3).excluding("stateOverrides"), rpc_result(reads_slot()), 1)
        .await;

    let call = SyntheticCall::new(SENDER, BBB, bytes!("01")).with_value(U256::from(5));
    let result = node
        .simulator()
        .simulate_with_call_data(&call, Some(16), &StateOverride::new(), &Deadline::none())
        .await
        .unwrap();
    assert_eq!(result.window.map(|w| w.len()), Some(1), "zero focus records everything");

    let request = &node.requests_for("debug_traceCall").await[0];
    assert_eq!(request.params()[1], json!("0x10"));
    assert_eq!(request.params()[0]["value"], json!("0x5"));
    node.verify().await;
}
