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

/// Classification of EVM opcodes by their mnemonic
///
/// Step-level traces from nodes identify instructions by name (`"SSTORE"`,
/// `"DELEGATECALL"`, ...), so the replay engine reasons about mnemonics rather
/// than raw opcode bytes. Names are matched case-sensitively, as every known
/// node prints them upper case.
///
/// # Example
/// ```rust
/// use tracefork_common::OpName;
///
/// assert!("STATICCALL".is_call());
/// assert!("CREATE2".is_create());
/// assert_eq!("LOG3".log_topics(), Some(3));
/// assert!(!"MSTORE".writes_storage());
/// ```
pub trait OpName {
    /// Message-call family: CALL, CALLCODE, DELEGATECALL, STATICCALL
    fn is_call(&self) -> bool;

    /// Contract creation: CREATE, CREATE2
    fn is_create(&self) -> bool;

    /// Calls that run foreign code in the caller's storage context
    fn borrows_context(&self) -> bool;

    /// Calls whose third stack argument is a value transfer
    fn transfers_value(&self) -> bool;

    /// Valid jump target marker
    fn is_jump_dest(&self) -> bool;

    /// Persistent storage write
    fn writes_storage(&self) -> bool;

    /// Number of topics for LOG0..LOG4, `None` for anything else
    fn log_topics(&self) -> Option<usize>;
}

impl OpName for str {
    fn is_call(&self) -> bool {
        matches!(self, "CALL" | "CALLCODE" | "DELEGATECALL" | "STATICCALL")
    }

    fn is_create(&self) -> bool {
        matches!(self, "CREATE" | "CREATE2")
    }

    fn borrows_context(&self) -> bool {
        matches!(self, "DELEGATECALL" | "CALLCODE")
    }

    fn transfers_value(&self) -> bool {
        matches!(self, "CALL" | "CALLCODE")
    }

    fn is_jump_dest(&self) -> bool {
        self == "JUMPDEST"
    }

    fn writes_storage(&self) -> bool {
        self == "SSTORE"
    }

    fn log_topics(&self) -> Option<usize> {
        match self {
            "LOG0" => Some(0),
            "LOG1" => Some(1),
            "LOG2" => Some(2),
            "LOG3" => Some(3),
            "LOG4" => Some(4),
            _ => None,
        }
    }
}

impl OpName for String {
    fn is_call(&self) -> bool {
        self.as_str().is_call()
    }

    fn is_create(&self) -> bool {
        self.as_str().is_create()
    }

    fn borrows_context(&self) -> bool {
        self.as_str().borrows_context()
    }

    fn transfers_value(&self) -> bool {
        self.as_str().transfers_value()
    }

    fn is_jump_dest(&self) -> bool {
        self.as_str().is_jump_dest()
    }

    fn writes_storage(&self) -> bool {
        self.as_str().writes_storage()
    }

    fn log_topics(&self) -> Option<usize> {
        self.as_str().log_topics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_family() {
        for op in ["CALL", "CALLCODE", "DELEGATECALL", "STATICCALL"] {
            assert!(op.is_call(), "{op} should be a call");
        }
        assert!(!"CREATE".is_call());
        assert!(!"call".is_call());
    }

    #[test]
    fn test_context_and_value_semantics() {
        assert!("DELEGATECALL".borrows_context());
        assert!("CALLCODE".borrows_context());
        assert!(!"STATICCALL".borrows_context());
        assert!("CALL".transfers_value());
        assert!(!"DELEGATECALL".transfers_value());
    }

    #[test]
    fn test_logs_and_storage() {
        assert_eq!("LOG0".log_topics(), Some(0));
        assert_eq!(String::from("LOG4").log_topics(), Some(4));
        assert_eq!("LOG5".log_topics(), None);
        assert!("SSTORE".writes_storage());
        assert!(!"TSTORE".writes_storage());
    }
}
