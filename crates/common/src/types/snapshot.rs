// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0

use alloy_primitives::{Address, Bytes, Selector, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State observed at one entry into the protected contract
///
/// Balances come from live queries at the moment of the call; storage comes
/// from the writes the transaction had made to each account so far, so slots
/// the transaction never wrote are absent and fall back to the pre-state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    /// Depth of the entered frame; the outermost frame is depth 1
    pub depth: usize,
    /// Account issuing the call
    pub caller: Address,
    /// Entered contract
    pub callee: Address,
    /// Caller balance, when it could be read
    #[serde(default)]
    pub caller_balance: Option<U256>,
    /// Slots the transaction had written in the caller
    #[serde(default)]
    pub caller_storage: BTreeMap<B256, B256>,
    /// Callee balance, when it could be read
    #[serde(default)]
    pub callee_balance: Option<U256>,
    /// Slots the transaction had written in the callee
    #[serde(default)]
    pub callee_storage: BTreeMap<B256, B256>,
    /// First four bytes of the call data, if present
    #[serde(default)]
    pub selector: Option<Selector>,
    /// Transferred value
    #[serde(default)]
    pub value: U256,
    /// Full call data
    #[serde(default)]
    pub input: Bytes,
    /// Number of jump targets executed before this entry
    #[serde(rename = "jumpDestIndex")]
    pub jump_dest_index: usize,
}
