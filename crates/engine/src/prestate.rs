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

//! Pre-state capture
//!
//! Builds a [`StateOverride`] holding every touched account as it was right
//! before a transaction executed, as reported by the node's prestate tracer.

use crate::{Deadline, ErrorKind, NodeClient, ReplayError};
use alloy_primitives::{Address, TxHash};
use serde_json::{json, Map, Value};
use std::{collections::BTreeMap, str::FromStr, sync::Arc};
use tracefork_common::{
    quantity::{parse_bytes, parse_word, u256_from_value, u64_from_value},
    AccountOverride, QuantityError, StateOverride,
};
use tracing::{debug, info, warn};

/// Captures pre-transaction state and normalizes it into an override
#[derive(Debug, Clone)]
pub struct StateOverrideBuilder {
    client: Arc<NodeClient>,
}

impl StateOverrideBuilder {
    /// Builder reading from `client`
    pub fn new(client: Arc<NodeClient>) -> Self {
        Self { client }
    }

    /// Capture the pre-state of `tx`
    ///
    /// A failing capture request is returned as is. An account that cannot be
    /// parsed is skipped with a warning. Accounts that look like contracts but
    /// came back without code get their code from `eth_getCode`; a failed probe
    /// leaves the account as captured.
    pub async fn build(&self, tx: TxHash, deadline: &Deadline) -> Result<StateOverride, ReplayError> {
        let raw: Value = self
            .client
            .request_bulk(
                "debug_traceTransaction",
                json!([tx, {"tracer": "prestateTracer"}]),
                deadline,
            )
            .await?;
        let Value::Object(accounts) = raw else {
            return Err(ReplayError::decode("prestate trace", format!("expected an object, got {raw}")));
        };

        let mut overlay = from_prestate(&accounts);
        self.recover_code(&mut overlay, deadline).await?;
        info!(
            accounts = overlay.len(),
            slots = overlay.slot_count(),
            "Captured pre-state of {tx}"
        );
        Ok(overlay)
    }

    async fn recover_code(
        &self,
        overlay: &mut StateOverride,
        deadline: &Deadline,
    ) -> Result<(), ReplayError> {
        let missing: Vec<Address> = overlay
            .iter()
            .filter(|(_, account)| account.is_missing_code())
            .map(|(address, _)| *address)
            .collect();
        for address in missing {
            match self.client.code_at(address, deadline).await {
                Ok(code) if !code.is_empty() => {
                    debug!("Recovered {} bytes of code for {address}", code.len());
                    if let Some(account) = overlay.get_mut(&address) {
                        account.code = Some(code);
                    }
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Cancelled => return Err(err),
                Err(err) => warn!("Could not fetch code for {address}: {err}"),
            }
        }
        Ok(())
    }
}

/// Normalize a prestate-tracer result
///
/// Accounts that fail to parse are logged and left out; accounts without any
/// non-trivial field are dropped.
pub fn from_prestate(accounts: &Map<String, Value>) -> StateOverride {
    let mut overlay = StateOverride::new();
    for (raw_address, raw_account) in accounts {
        match parse_account(raw_address, raw_account) {
            Ok((address, account)) => overlay.insert_account(address, account),
            Err(err) => warn!("Skipping prestate account {raw_address}: {err}"),
        }
    }
    overlay
}

fn parse_account(
    raw_address: &str,
    raw: &Value,
) -> Result<(Address, AccountOverride), QuantityError> {
    let address = Address::from_str(raw_address.trim())
        .map_err(|_| QuantityError::InvalidHex(raw_address.to_string()))?;
    let Value::Object(fields) = raw else {
        return Err(QuantityError::UnsupportedValue(raw.to_string()));
    };

    let mut account = AccountOverride::default();
    if let Some(balance) = fields.get("balance").filter(|v| !v.is_null()) {
        account.balance = Some(u256_from_value(balance)?);
    }
    if let Some(nonce) = fields.get("nonce").filter(|v| !v.is_null()) {
        account.nonce = Some(u64_from_value(nonce)?);
    }
    match fields.get("code") {
        Some(Value::String(code)) => {
            let code = parse_bytes(&code.to_lowercase())?;
            account.code = (!code.is_empty()).then_some(code);
        }
        Some(Value::Null) | None => {}
        Some(other) => return Err(QuantityError::UnsupportedValue(other.to_string())),
    }
    match fields.get("storage") {
        Some(Value::Object(slots)) => {
            let mut storage = BTreeMap::new();
            for (slot, word) in slots {
                let word = word
                    .as_str()
                    .ok_or_else(|| QuantityError::UnsupportedValue(word.to_string()))?;
                storage.insert(parse_word(slot)?, parse_word(word)?);
            }
            account.storage = storage;
        }
        Some(Value::Null) | None => {}
        Some(other) => return Err(QuantityError::UnsupportedValue(other.to_string())),
    }
    Ok((address, account))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256, Bytes, U256};

    fn accounts(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_normalizes_fields() {
        let overlay = from_prestate(&accounts(json!({
            "0x00000000000000000000000000000000000000AA": {
                "balance": "0x0de0b6b3a7640000",
                "nonce": 5,
                "code": "0x6080ABCD",
                "storage": {
                    "0x1": "0x000000000000000000000000000000000000000000000000000000000000002A"
                }
            },
            "0x00000000000000000000000000000000000000bb": {
                "balance": "1000",
                "nonce": "0x1"
            }
        })));

        let aa = &overlay[&address!("00000000000000000000000000000000000000aa")];
        assert_eq!(aa.balance, Some(U256::from(1_000_000_000_000_000_000u128)));
        assert_eq!(aa.nonce, Some(5));
        assert_eq!(aa.code, Some(Bytes::from(vec![0x60, 0x80, 0xab, 0xcd])));
        assert_eq!(
            aa.storage[&b256!("0000000000000000000000000000000000000000000000000000000000000001")],
            b256!("000000000000000000000000000000000000000000000000000000000000002a")
        );

        let bb = &overlay[&address!("00000000000000000000000000000000000000bb")];
        assert_eq!(bb.balance, Some(U256::from(1000)));
        assert_eq!(bb.nonce, Some(1));
    }

    #[test]
    fn test_drops_trivial_and_skips_broken_accounts() {
        let overlay = from_prestate(&accounts(json!({
            "0x00000000000000000000000000000000000000aa": {"balance": "0x0", "nonce": 0, "code": "0x"},
            "0x00000000000000000000000000000000000000bb": {"balance": "not a number"},
            "0x00000000000000000000000000000000000000cc": {"balance": "0x1"},
            "garbage": {"balance": "0x1"}
        })));
        assert_eq!(overlay.len(), 1);
        assert!(overlay.contains_key(&address!("00000000000000000000000000000000000000cc")));
    }

    #[test]
    fn test_recapture_is_idempotent() {
        let captured = accounts(json!({
            "0x00000000000000000000000000000000000000aa": {
                "balance": "0x64",
                "nonce": 2,
                "code": "0x60016000",
                "storage": {
                    "0x0000000000000000000000000000000000000000000000000000000000000003":
                        "0x0000000000000000000000000000000000000000000000000000000000000009"
                }
            },
            "0x00000000000000000000000000000000000000ee": {"balance": "0x0", "nonce": 0}
        }));
        let first = from_prestate(&captured);

        // Re-express the overlay the way the prestate tracer reports state.
        let mut echoed = Map::new();
        for (address, account) in first.iter() {
            let mut fields = serde_json::to_value(account).unwrap();
            if let Some(storage) = fields.as_object_mut().and_then(|f| f.remove("stateDiff")) {
                fields["storage"] = storage;
            }
            echoed.insert(format!("{address:#x}"), fields);
        }
        assert_eq!(from_prestate(&echoed), first);
    }
}
