//! Call-tree command - print the call hierarchy of a transaction

use alloy_primitives::TxHash;
use eyre::Result;
use serde_json::{json, Value};
use tracefork_engine::{Deadline, Simulator, TraceTarget};

/// Capture the call tree of `tx_hash`
pub async fn call_tree(simulator: &Simulator, tx_hash: TxHash, deadline: &Deadline) -> Result<Value> {
    let tree = simulator.trace_call_tree(&TraceTarget::Transaction(tx_hash), deadline).await?;
    Ok(json!({
        "tx": tx_hash,
        "frames": tree.count(),
        "succeeded": tree.succeeded(),
        "root": tree,
    }))
}
