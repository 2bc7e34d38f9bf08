//! Replay command - trace a transaction and optionally analyze or compare it

use alloy_primitives::{Address, TxHash};
use eyre::Result;
use serde_json::{json, Value};
use tracefork_engine::{analyzer, Deadline, Simulator};

/// Flags of the replay command
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Block the replay is attributed to
    pub block: Option<u64>,
    /// Contract the window is anchored to; zero covers the whole path
    pub protected: Address,
    /// Whether to add a structural analysis
    pub analyze: bool,
    /// Second transaction to compare with
    pub compare: Option<TxHash>,
}

/// Replay `tx_hash` and render the result
pub async fn replay(
    simulator: &Simulator,
    tx_hash: TxHash,
    options: &ReplayOptions,
    deadline: &Deadline,
) -> Result<Value> {
    tracing::info!("Replaying transaction {tx_hash}");
    let result = simulator.fork_and_replay(options.block, tx_hash, options.protected, deadline).await?;
    tracing::info!(
        source = %result.source,
        jumps = result.contract_jump_dests.len(),
        window = result.protected_path().len(),
        "Replay finished"
    );

    let mut output = json!({
        "tx": tx_hash,
        "block": options.block,
        "protected": options.protected,
        "result": result,
    });

    if options.analyze {
        output["analysis"] = serde_json::to_value(simulator.analyze(&result))?;
    }

    if let Some(other) = options.compare {
        tracing::info!("Replaying {other} for comparison");
        let second = simulator.fork_and_replay(options.block, other, options.protected, deadline).await?;
        let detail = analyzer::compare_detailed(&result.protected_pcs(), &second.protected_pcs());
        output["comparison"] = json!({
            "tx": other,
            "source": second.source,
            "similarity": detail.similarity,
            "contractAwareSimilarity":
                analyzer::contract_aware_similarity(result.protected_path(), second.protected_path()),
            "lcsLength": detail.lcs_length,
            "isMatch": detail.is_match,
            "onlyFirst": detail.only_first,
            "onlySecond": detail.only_second,
        });
    }

    Ok(output)
}
