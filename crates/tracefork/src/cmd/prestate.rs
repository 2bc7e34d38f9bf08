//! Prestate command - print a transaction's pre-state as an override

use alloy_primitives::TxHash;
use eyre::Result;
use serde_json::{json, Value};
use tracefork_engine::{Deadline, Simulator};

/// Capture the accounts `tx_hash` touched, as they were before it ran
pub async fn prestate(simulator: &Simulator, tx_hash: TxHash, deadline: &Deadline) -> Result<Value> {
    let overlay = simulator.build_state_override(tx_hash, deadline).await?;
    tracing::info!(accounts = overlay.len(), slots = overlay.slot_count(), "Captured pre-state of {tx_hash}");
    Ok(json!({
        "tx": tx_hash,
        "stateOverride": overlay,
    }))
}
