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

use super::{CallSnapshot, StateChange};
use crate::quantity::{flexible_u256_opt, flexible_u64_opt};
use alloy_primitives::{Address, Bytes, B256, U256};
use derive_more::{Deref, DerefMut, From, IntoIterator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field substitutions for one account
///
/// Serializes to the shape nodes accept as a call override:
/// `{"balance": "0x..", "nonce": "0x..", "code": "0x..", "stateDiff": {slot: word}}`.
/// Slots not listed keep their on-chain value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOverride {
    /// Replacement balance
    #[serde(default, with = "flexible_u256_opt", skip_serializing_if = "Option::is_none")]
    pub balance: Option<U256>,
    /// Replacement nonce
    #[serde(default, with = "flexible_u64_opt", skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    /// Replacement code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Bytes>,
    /// Replacement storage words
    #[serde(rename = "stateDiff", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage: BTreeMap<B256, B256>,
}

impl AccountOverride {
    /// True when no field carries information worth sending to a node
    pub fn is_trivial(&self) -> bool {
        self.balance.is_none_or(|b| b.is_zero())
            && self.nonce.is_none_or(|n| n == 0)
            && !self.has_code()
            && self.storage.is_empty()
    }

    /// Whether non-empty code is set
    pub fn has_code(&self) -> bool {
        self.code.as_ref().is_some_and(|code| !code.is_empty())
    }

    /// Account looks like a contract whose code the capture left out
    pub fn is_missing_code(&self) -> bool {
        !self.has_code()
            && (self.balance.is_some_and(|b| !b.is_zero())
                || self.nonce.is_some_and(|n| n > 0)
                || !self.storage.is_empty())
    }
}

/// Per-address overrides applied before a replay
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref, DerefMut, From, IntoIterator,
)]
#[serde(transparent)]
pub struct StateOverride(BTreeMap<Address, AccountOverride>);

impl StateOverride {
    /// Empty override
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an account override, dropping it when it carries nothing
    pub fn insert_account(&mut self, address: Address, account: AccountOverride) {
        if account.is_trivial() {
            self.0.remove(&address);
        } else {
            self.0.insert(address, account);
        }
    }

    /// Number of storage slots across every account
    pub fn slot_count(&self) -> usize {
        self.0.values().map(|account| account.storage.len()).sum()
    }

    /// Apply the effects of an execution onto this override
    ///
    /// Balances take their post-execution value and written slots their
    /// final word, so the next replay observes the state the previous one
    /// left behind.
    pub fn fold(&mut self, changes: &BTreeMap<Address, StateChange>) {
        for (address, change) in changes {
            let account = self.0.entry(*address).or_default();
            if let Some(balance) = change.balance_after {
                account.balance = Some(balance);
            }
            for (slot, update) in &change.storage {
                account.storage.insert(*slot, update.after);
            }
        }
    }

    /// Owned variant of [`StateOverride::fold`] for accumulator threading
    pub fn folded(mut self, changes: &BTreeMap<Address, StateChange>) -> Self {
        self.fold(changes);
        self
    }

    /// Layer the state captured at a protected-call entry on top of this override
    ///
    /// Non-zero caller/callee balances replace the captured ones; cached
    /// storage writes replace the matching slots.
    pub fn merge_snapshot(&mut self, snapshot: &CallSnapshot) {
        let sides = [
            (snapshot.caller, snapshot.caller_balance, &snapshot.caller_storage),
            (snapshot.callee, snapshot.callee_balance, &snapshot.callee_storage),
        ];
        for (address, balance, storage) in sides {
            let balance = balance.filter(|b| !b.is_zero());
            if balance.is_none() && storage.is_empty() {
                continue;
            }
            let account = self.0.entry(address).or_default();
            if balance.is_some() {
                account.balance = balance;
            }
            account.storage.extend(storage.iter().map(|(slot, word)| (*slot, *word)));
        }
    }
}
