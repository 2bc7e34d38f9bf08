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

//! Canonical encodings for values exchanged with execution nodes
//!
//! Nodes disagree on how they print numbers: geth emits `0x`-prefixed hex,
//! some forks print decimal strings, and a few tracers hand back raw JSON
//! numbers. Everything entering the engine goes through this module so that
//! the rest of the code only ever sees typed values:
//!
//! - quantities (balances, nonces, values) parse from hex, decimal or JSON
//!   numbers and render as minimal lower-case hex (`0x0` for zero)
//! - storage slots and words are 32 bytes, left padded
//! - byte strings tolerate a missing `0x` prefix and odd length

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{de, Deserialize, Deserializer, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Failure to interpret a numeric or byte field
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    /// Not a valid hexadecimal number
    #[error("invalid hex quantity `{0}`")]
    InvalidHex(String),
    /// Not a valid decimal number
    #[error("invalid decimal quantity `{0}`")]
    InvalidDecimal(String),
    /// Value does not fit the target width
    #[error("quantity `{0}` overflows the target type")]
    Overflow(String),
    /// JSON value of a kind that cannot encode a number
    #[error("unsupported JSON value `{0}`")]
    UnsupportedValue(String),
}

fn strip_hex_prefix(raw: &str) -> Option<&str> {
    raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))
}

/// Parse a 256-bit quantity from hex (`0x..`), decimal, or the empty string (zero)
pub fn parse_u256(raw: &str) -> Result<U256, QuantityError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(U256::ZERO);
    }
    match strip_hex_prefix(trimmed) {
        Some("") => Ok(U256::ZERO),
        Some(body) => U256::from_str_radix(body, 16)
            .map_err(|_| QuantityError::InvalidHex(raw.to_string())),
        None => U256::from_str_radix(trimmed, 10)
            .map_err(|_| QuantityError::InvalidDecimal(raw.to_string())),
    }
}

/// Parse a 64-bit quantity with the same rules as [`parse_u256`]
pub fn parse_u64(raw: &str) -> Result<u64, QuantityError> {
    let value = parse_u256(raw)?;
    if value.bit_len() > 64 {
        return Err(QuantityError::Overflow(raw.to_string()));
    }
    Ok(value.as_limbs()[0])
}

/// Parse a 32-byte word, left padding short encodings
pub fn parse_word(raw: &str) -> Result<B256, QuantityError> {
    parse_u256(raw).map(word_from_u256)
}

/// Convert a quantity into its 32-byte big-endian word
pub fn word_from_u256(value: U256) -> B256 {
    B256::from(value.to_be_bytes::<32>())
}

/// Interpret the low 20 bytes of a stack word as an address
pub fn address_from_word(raw: &str) -> Result<Address, QuantityError> {
    parse_word(raw).map(Address::from_word)
}

/// Parse a byte string, accepting a missing `0x` prefix and odd length
pub fn parse_bytes(raw: &str) -> Result<Bytes, QuantityError> {
    let trimmed = raw.trim();
    let body = strip_hex_prefix(trimmed).unwrap_or(trimmed);
    let padded = if body.len() % 2 == 1 { format!("0{body}") } else { body.to_string() };
    alloy_primitives::hex::decode(&padded)
        .map(Bytes::from)
        .map_err(|_| QuantityError::InvalidHex(raw.to_string()))
}

/// Interpret an arbitrary JSON value as a 256-bit quantity
///
/// `null` and the empty string are zero; numbers must be non-negative integers.
pub fn u256_from_value(value: &Value) -> Result<U256, QuantityError> {
    match value {
        Value::Null => Ok(U256::ZERO),
        Value::String(s) => parse_u256(s),
        Value::Number(n) => {
            let rendered = n.to_string();
            U256::from_str_radix(&rendered, 10)
                .map_err(|_| QuantityError::InvalidDecimal(rendered.clone()))
        }
        other => Err(QuantityError::UnsupportedValue(other.to_string())),
    }
}

/// Interpret an arbitrary JSON value as a 64-bit quantity
pub fn u64_from_value(value: &Value) -> Result<u64, QuantityError> {
    let wide = u256_from_value(value)?;
    if wide.bit_len() > 64 {
        return Err(QuantityError::Overflow(value.to_string()));
    }
    Ok(wide.as_limbs()[0])
}

/// Render a quantity as minimal lower-case hex
pub fn to_quantity_hex(value: U256) -> String {
    format!("{value:#x}")
}

/// Serde adapter for `u64` fields: reads a JSON number, hex string or decimal
/// string and writes a hex quantity
pub mod flexible_u64 {
    use super::*;

    /// Serialize as a `0x`-prefixed quantity
    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    /// Deserialize from any numeric encoding a node might emit
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let value = Value::deserialize(deserializer)?;
        u64_from_value(&value).map_err(de::Error::custom)
    }
}

/// Optional variant of [`flexible_u64`]; `null` and missing fields are `None`
pub mod flexible_u64_opt {
    use super::*;

    /// Serialize as a `0x`-prefixed quantity, or `null`
    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => flexible_u64::serialize(v, serializer),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional quantity
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => u64_from_value(&value).map(Some).map_err(de::Error::custom),
        }
    }
}

/// Serde adapter for 256-bit quantities written in any numeric encoding
pub mod flexible_u256 {
    use super::*;

    /// Serialize as a `0x`-prefixed quantity
    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_quantity_hex(*value))
    }

    /// Deserialize from hex, decimal or a JSON number
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let value = Value::deserialize(deserializer)?;
        u256_from_value(&value).map_err(de::Error::custom)
    }
}

/// Optional variant of [`flexible_u256`]
pub mod flexible_u256_opt {
    use super::*;

    /// Serialize as a `0x`-prefixed quantity, or `null`
    pub fn serialize<S: Serializer>(
        value: &Option<U256>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => flexible_u256::serialize(v, serializer),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional quantity
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<U256>, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => u256_from_value(&value).map(Some).map_err(de::Error::custom),
        }
    }
}

/// Optional address that tolerates the empty string some tracers emit
pub mod lenient_address_opt {
    use super::*;

    /// Serialize the address or `null`
    pub fn serialize<S: Serializer>(
        value: &Option<Address>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(addr) => serializer.serialize_str(&format!("{addr:#x}")),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize; `null`, `""` and `"0x"` are `None`
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Address>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(raw) if raw.is_empty() || raw == "0x" => Ok(None),
            Some(raw) => address_from_word(&raw).map(Some).map_err(de::Error::custom),
        }
    }
}

/// Byte string that tolerates a missing prefix or odd length
pub mod lenient_bytes {
    use super::*;

    /// Serialize as `0x`-prefixed lower-case hex
    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserialize; `null` is the empty byte string
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Bytes::new()),
            Some(raw) => parse_bytes(&raw).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};
    use serde::Serialize;
    use serde_json::json;

    #[test]
    fn test_parse_u256_encodings() {
        assert_eq!(parse_u256("").unwrap(), U256::ZERO);
        assert_eq!(parse_u256("0x").unwrap(), U256::ZERO);
        assert_eq!(parse_u256("0x5f5e100").unwrap(), U256::from(100_000_000u64));
        assert_eq!(parse_u256("0X5F5E100").unwrap(), U256::from(100_000_000u64));
        assert_eq!(parse_u256("100000000").unwrap(), U256::from(100_000_000u64));
        assert!(matches!(parse_u256("0xzz"), Err(QuantityError::InvalidHex(_))));
        assert!(matches!(parse_u256("12ab"), Err(QuantityError::InvalidDecimal(_))));
    }

    #[test]
    fn test_parse_u64_rejects_overflow() {
        assert_eq!(parse_u64("0xffffffffffffffff").unwrap(), u64::MAX);
        assert!(matches!(parse_u64("0x10000000000000000"), Err(QuantityError::Overflow(_))));
    }

    #[test]
    fn test_quantity_rendering_is_minimal_lowercase() {
        assert_eq!(to_quantity_hex(U256::ZERO), "0x0");
        assert_eq!(to_quantity_hex(parse_u256("0x00000ABC").unwrap()), "0xabc");
        assert_eq!(to_quantity_hex(parse_u256("255").unwrap()), "0xff");
    }

    #[test]
    fn test_words_are_left_padded() {
        assert_eq!(
            parse_word("0x1").unwrap(),
            b256!("0000000000000000000000000000000000000000000000000000000000000001")
        );
    }

    #[test]
    fn test_address_from_stack_word() {
        let word = "0x000000000000000000000000a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
        assert_eq!(
            address_from_word(word).unwrap(),
            address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48")
        );
        // Short stack entries without padding still resolve.
        assert_eq!(
            address_from_word("0x4").unwrap(),
            address!("0000000000000000000000000000000000000004")
        );
    }

    #[test]
    fn test_parse_bytes_is_lenient() {
        assert_eq!(parse_bytes("0x").unwrap(), Bytes::new());
        assert_eq!(parse_bytes("").unwrap(), Bytes::new());
        assert_eq!(parse_bytes("abc").unwrap(), Bytes::from(vec![0x0a, 0xbc]));
        assert_eq!(parse_bytes("0xDEAD").unwrap(), Bytes::from(vec![0xde, 0xad]));
        assert!(parse_bytes("0xqq").is_err());
    }

    #[test]
    fn test_values_from_json() {
        assert_eq!(u64_from_value(&json!(100000000)).unwrap(), 100_000_000);
        assert_eq!(u64_from_value(&json!("0x5f5e100")).unwrap(), 100_000_000);
        assert_eq!(u64_from_value(&json!("100000000")).unwrap(), 100_000_000);
        assert_eq!(u64_from_value(&json!(null)).unwrap(), 0);
        assert!(u64_from_value(&json!(1.5)).is_err());
        assert!(u64_from_value(&json!(-1)).is_err());
        assert!(u64_from_value(&json!([1])).is_err());
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        #[serde(with = "flexible_u64")]
        gas: u64,
        #[serde(default, with = "flexible_u64_opt")]
        nonce: Option<u64>,
        #[serde(default, with = "lenient_address_opt")]
        to: Option<Address>,
    }

    #[test]
    fn test_serde_adapters() {
        let parsed: Sample =
            serde_json::from_value(json!({"gas": "21000", "nonce": 7, "to": ""})).unwrap();
        assert_eq!(parsed, Sample { gas: 21000, nonce: Some(7), to: None });

        let rendered = serde_json::to_value(&parsed).unwrap();
        assert_eq!(rendered, json!({"gas": "0x5208", "nonce": "0x7", "to": null}));
    }
}
