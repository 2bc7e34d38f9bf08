//! Snapshots command - print the state at each entry into a protected contract

use alloy_primitives::{Address, TxHash};
use eyre::Result;
use serde_json::{json, Value};
use tracefork_engine::{Deadline, ReplayError, Simulator};

/// Capture every entry into `protected`, or only entry `index`
///
/// A contract that is never entered yields an empty list rather than an
/// error, so scripts can tell "not involved" apart from a failed trace.
pub async fn snapshots(
    simulator: &Simulator,
    tx_hash: TxHash,
    protected: Address,
    index: Option<usize>,
    deadline: &Deadline,
) -> Result<Value> {
    let Some(index) = index else {
        let snapshots = simulator.extract_all_call_snapshots(tx_hash, protected, deadline).await?;
        return Ok(json!({
            "tx": tx_hash,
            "protected": protected,
            "count": snapshots.len(),
            "snapshots": snapshots,
        }));
    };

    let snapshot =
        match simulator.extract_snapshot_for_protected_call(tx_hash, protected, index, deadline).await {
            Ok(snapshot) => snapshot,
            Err(ReplayError::NoMatchingCall(_)) => {
                tracing::warn!("{protected} was never entered during {tx_hash}");
                return Ok(json!({
                    "tx": tx_hash,
                    "protected": protected,
                    "count": 0,
                    "snapshots": [],
                }));
            }
            Err(err) => return Err(err.into()),
        };

    let mut precondition = simulator.build_state_override(tx_hash, deadline).await?;
    precondition.merge_snapshot(&snapshot);
    Ok(json!({
        "tx": tx_hash,
        "protected": protected,
        "index": index,
        "snapshot": snapshot,
        "precondition": precondition,
    }))
}
