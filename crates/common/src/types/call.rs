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

use crate::quantity::{flexible_u256_opt, flexible_u64, lenient_address_opt, lenient_bytes};
use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// One frame of a call-level trace, as produced by a node's call tracer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    /// Call kind (CALL, STATICCALL, DELEGATECALL, CREATE, ...)
    #[serde(rename = "type", default)]
    pub call_type: String,
    /// Caller; synthetic trees may leave it out
    #[serde(default, with = "lenient_address_opt", skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    /// Callee
    #[serde(default, with = "lenient_address_opt", skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    /// Transferred value
    #[serde(default, with = "flexible_u256_opt", skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    /// Gas made available to the frame
    #[serde(default, with = "flexible_u64")]
    pub gas: u64,
    /// Gas consumed by the frame
    #[serde(default, with = "flexible_u64")]
    pub gas_used: u64,
    /// Call data
    #[serde(default, with = "lenient_bytes")]
    pub input: Bytes,
    /// Return data
    #[serde(default, with = "lenient_bytes")]
    pub output: Bytes,
    /// Failure reason, if the frame reverted or faulted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Nested calls, in execution order
    #[serde(rename = "calls", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<CallFrame>,
}

/// A frame visited by [`CallFrame::flatten`]
#[derive(Debug, Clone, Copy)]
pub struct FlatCall<'a> {
    /// Depth of the frame; the root is depth 1
    pub depth: usize,
    /// Caller, inherited from the parent's callee when the frame has none
    pub from: Option<Address>,
    /// The frame itself
    pub frame: &'a CallFrame,
}

impl CallFrame {
    /// Depth-first, pre-order list of every frame in the tree
    ///
    /// Frames without a `from` inherit their parent's `to`.
    pub fn flatten(&self) -> Vec<FlatCall<'_>> {
        let mut out = Vec::new();
        let mut pending = vec![(self, 1usize, self.from)];
        while let Some((frame, depth, inherited)) = pending.pop() {
            let from = frame.from.or(inherited);
            out.push(FlatCall { depth, from, frame });
            for child in frame.children.iter().rev() {
                pending.push((child, depth + 1, frame.to));
            }
        }
        out
    }

    /// Total number of frames in the tree
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Self::count).sum::<usize>()
    }

    /// Whether the frame completed without error
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A single message call to execute in isolation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticCall {
    /// Sender
    pub from: Address,
    /// Callee
    pub to: Address,
    /// Call data
    pub input: Bytes,
    /// Transferred value
    pub value: U256,
    /// Gas limit; the node's default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<u64>,
}

impl SyntheticCall {
    /// Call with no value and default gas
    pub fn new(from: Address, to: Address, input: Bytes) -> Self {
        Self { from, to, input, value: U256::ZERO, gas: None }
    }

    /// Set the transferred value
    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    /// Set the gas limit
    pub fn with_gas(mut self, gas: u64) -> Self {
        self.gas = Some(gas);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use serde_json::json;

    #[test]
    fn test_parse_call_tracer_output() {
        let raw = json!({
            "type": "CALL",
            "from": "0x00000000000000000000000000000000000000f1",
            "to": "0x00000000000000000000000000000000000000aa",
            "value": "0x0",
            "gas": "0x5208",
            "gasUsed": 21000,
            "input": "0x01",
            "output": "0x",
            "calls": [{
                "type": "STATICCALL",
                "to": "0x00000000000000000000000000000000000000bb",
                "input": "0x02",
                "gas": "0x100",
                "gasUsed": "0x10"
            }]
        });
        let frame: CallFrame = serde_json::from_value(raw).unwrap();
        assert_eq!(frame.gas, 21000);
        assert_eq!(frame.gas_used, 21000);
        assert_eq!(frame.children.len(), 1);
        assert_eq!(frame.children[0].from, None);
        assert_eq!(frame.children[0].input, Bytes::from(vec![0x02]));
        assert_eq!(frame.count(), 2);
    }

    #[test]
    fn test_flatten_is_preorder_and_inherits_from() {
        let a = address!("00000000000000000000000000000000000000aa");
        let b = address!("00000000000000000000000000000000000000bb");
        let c = address!("00000000000000000000000000000000000000cc");
        let d = address!("00000000000000000000000000000000000000dd");
        let tree = CallFrame {
            to: Some(a),
            children: vec![
                CallFrame {
                    to: Some(b),
                    children: vec![CallFrame { to: Some(c), ..Default::default() }],
                    ..Default::default()
                },
                CallFrame { from: Some(d), to: Some(d), ..Default::default() },
            ],
            ..Default::default()
        };

        let flat = tree.flatten();
        let order: Vec<_> = flat.iter().map(|f| (f.frame.to, f.depth, f.from)).collect();
        assert_eq!(
            order,
            vec![
                (Some(a), 1, None),
                (Some(b), 2, Some(a)),
                (Some(c), 3, Some(b)),
                (Some(d), 2, Some(d)),
            ]
        );
    }
}
