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

//! Execution-path comparison and structural pattern flags
//!
//! Similarity is the Dice coefficient over the longest common subsequence:
//! `2 * LCS(a, b) / (|a| + |b|)`, which is symmetric, lies in `[0, 1]` and is
//! `1` exactly for identical sequences. Two empty paths are identical; an
//! empty path shares nothing with a non-empty one.
//!
//! The pattern flags raised by [`analyze`] are heuristics. A repeated jump
//! target is not proof of a loop and deep nesting is not proof of recursion;
//! they point an analyst at traces worth reading.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, collections::BTreeSet, fmt};
use tracefork_common::{ContractJumpDest, OpName, ReplayResult};

/// Depth beyond which nesting is flagged as recursion
pub const RECURSION_DEPTH_THRESHOLD: usize = 3;

/// Storage writes beyond which a trace is flagged as storage heavy
pub const HEAVY_STORAGE_THRESHOLD: usize = 10;

/// Similarity at or above which two paths are considered a match
pub const MATCH_THRESHOLD: f64 = 0.8;

/// Dice score below which contract-aware similarity falls back to Jaccard
pub const JACCARD_FALLBACK_THRESHOLD: f64 = 0.3;

/// Length of the longest common subsequence of `a` and `b`
pub fn lcs_length<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut previous = vec![0usize; short.len() + 1];
    let mut current = vec![0usize; short.len() + 1];
    for x in long {
        for (j, y) in short.iter().enumerate() {
            current[j + 1] =
                if x == y { previous[j] + 1 } else { current[j].max(previous[j + 1]) };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[short.len()]
}

/// LCS-based Dice similarity of two sequences
pub fn similarity<T: PartialEq>(a: &[T], b: &[T]) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        _ => 2.0 * lcs_length(a, b) as f64 / (a.len() + b.len()) as f64,
    }
}

/// Set-based Jaccard index, ignoring order and repetition
pub fn jaccard<T: Ord>(a: &[T], b: &[T]) -> f64 {
    let left: BTreeSet<&T> = a.iter().collect();
    let right: BTreeSet<&T> = b.iter().collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 1.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

/// LCS length relative to the shorter sequence
pub fn overlap_coefficient<T: PartialEq>(a: &[T], b: &[T]) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        _ => lcs_length(a, b) as f64 / a.len().min(b.len()) as f64,
    }
}

/// Similarity of two contract-tagged paths
///
/// Uses the Dice score over `(contract, pc)` pairs, switching to the Jaccard
/// index when the ordered comparison finds little in common.
pub fn contract_aware_similarity(a: &[ContractJumpDest], b: &[ContractJumpDest]) -> f64 {
    let dice = similarity(a, b);
    if dice < JACCARD_FALLBACK_THRESHOLD {
        jaccard(a, b)
    } else {
        dice
    }
}

/// Similarity of `reference` against each candidate, in order
pub fn batch_compare<T: PartialEq>(reference: &[T], candidates: &[Vec<T>]) -> Vec<f64> {
    candidates.iter().map(|candidate| similarity(reference, candidate)).collect()
}

/// Indices of the candidates at least `threshold` similar to `reference`
pub fn filter_by_threshold<T: PartialEq>(
    reference: &[T],
    candidates: &[Vec<T>],
    threshold: f64,
) -> Vec<usize> {
    batch_compare(reference, candidates)
        .into_iter()
        .positions(|score| score >= threshold)
        .collect()
}

/// Detailed comparison of two paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathComparison<T> {
    /// Dice similarity
    pub similarity: f64,
    /// Longest common subsequence length
    pub lcs_length: usize,
    /// Distinct elements found in both paths
    pub common: Vec<T>,
    /// Distinct elements found only in the first path
    pub only_first: Vec<T>,
    /// Distinct elements found only in the second path
    pub only_second: Vec<T>,
    /// Whether the similarity reaches [`MATCH_THRESHOLD`]
    pub is_match: bool,
}

/// Compare two paths in detail
pub fn compare_detailed<T: Ord + Clone>(a: &[T], b: &[T]) -> PathComparison<T> {
    let left: BTreeSet<&T> = a.iter().collect();
    let right: BTreeSet<&T> = b.iter().collect();
    let score = similarity(a, b);
    PathComparison {
        similarity: score,
        lcs_length: lcs_length(a, b),
        common: left.intersection(&right).map(|x| (*x).clone()).collect(),
        only_first: left.difference(&right).map(|x| (*x).clone()).collect(),
        only_second: right.difference(&left).map(|x| (*x).clone()).collect(),
        is_match: score >= MATCH_THRESHOLD,
    }
}

/// Structural pattern raised by [`analyze`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternFlag {
    /// Some jump-target program counter is visited more than once
    LoopDetected,
    /// Nesting deeper than [`RECURSION_DEPTH_THRESHOLD`]
    RecursiveCall,
    /// More than [`HEAVY_STORAGE_THRESHOLD`] storage-write instructions
    ///
    /// Repeated writes to one slot each count.
    HeavyStorageOps,
    /// At least one message call
    ExternalCalls,
}

impl fmt::Display for PatternFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoopDetected => "LOOP_DETECTED",
            Self::RecursiveCall => "RECURSIVE_CALL",
            Self::HeavyStorageOps => "HEAVY_STORAGE_OPS",
            Self::ExternalCalls => "EXTERNAL_CALLS",
        };
        f.write_str(name)
    }
}

/// Summary statistics of one replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathAnalysis {
    /// Instructions executed, or path entries when no instruction path was kept
    pub total_steps: usize,
    /// Deepest call depth reached; the outermost frame is depth 1
    pub max_depth: usize,
    /// Occurrences per opcode name
    pub opcode_frequency: BTreeMap<String, usize>,
    /// Gas consumed
    pub total_gas: u64,
    /// Accounts with recorded effects
    pub state_changes: usize,
    /// Raised pattern flags, sorted
    pub patterns: Vec<PatternFlag>,
}

impl PathAnalysis {
    /// Whether `flag` was raised
    pub fn has(&self, flag: PatternFlag) -> bool {
        self.patterns.contains(&flag)
    }
}

/// Compute statistics and pattern flags for `result`
///
/// Uses the raw instruction path when one was recorded. Otherwise the
/// jump-target path, call edges and state diffs stand in for it.
pub fn analyze(result: &ReplayResult) -> PathAnalysis {
    let mut analysis = PathAnalysis {
        total_gas: result.gas_used,
        state_changes: result.state_changes.len(),
        ..Default::default()
    };

    let (storage_writes, has_calls) = if result.execution_path.is_empty() {
        analysis.total_steps = result.contract_jump_dests.len();
        analysis.max_depth = result
            .call_edges
            .iter()
            .map(|edge| edge.depth + 1)
            .max()
            .unwrap_or(usize::from(!result.contract_jump_dests.is_empty()));
        if !result.contract_jump_dests.is_empty() {
            analysis.opcode_frequency.insert("JUMPDEST".into(), result.contract_jump_dests.len());
        }
        for edge in &result.call_edges {
            *analysis.opcode_frequency.entry(edge.op.clone()).or_default() += 1;
        }
        // Backends that cannot count writes leave the counter at zero; the
        // written slots are then a lower bound.
        let slots: usize = result.state_changes.values().map(|change| change.storage.len()).sum();
        (result.storage_writes.max(slots), !result.call_edges.is_empty())
    } else {
        let path = &result.execution_path;
        analysis.total_steps = path.len();
        analysis.max_depth = path.iter().map(|step| step.depth).max().unwrap_or_default();
        analysis.opcode_frequency = path.iter().map(|step| step.op.clone()).counts().into_iter().collect();
        let writes = path.iter().filter(|step| step.op.writes_storage()).count();
        (writes, path.iter().any(|step| step.op.is_call()))
    };

    let mut flags = BTreeSet::new();
    if has_repeated_jump_target(result) {
        flags.insert(PatternFlag::LoopDetected);
    }
    if analysis.max_depth > RECURSION_DEPTH_THRESHOLD {
        flags.insert(PatternFlag::RecursiveCall);
    }
    if storage_writes > HEAVY_STORAGE_THRESHOLD {
        flags.insert(PatternFlag::HeavyStorageOps);
    }
    if has_calls {
        flags.insert(PatternFlag::ExternalCalls);
    }
    analysis.patterns = flags.into_iter().collect();
    analysis
}

fn has_repeated_jump_target(result: &ReplayResult) -> bool {
    let mut seen = BTreeSet::new();
    if result.jump_dests.is_empty() {
        result.contract_jump_dests.iter().any(|jd| !seen.insert(jd.pc))
    } else {
        result.jump_dests.iter().any(|pc| !seen.insert(*pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, Address, B256};
    use tracefork_common::{CallEdge, PathStep, StateChange, StorageUpdate, TraceSource};

    const A: Address = address!("00000000000000000000000000000000000000aa");
    const B: Address = address!("00000000000000000000000000000000000000bb");

    #[test]
    fn test_similarity_properties() {
        let empty: [u64; 0] = [];
        assert_eq!(similarity(&empty, &empty), 1.0);
        assert_eq!(similarity(&empty, &[1u64]), 0.0);
        assert_eq!(similarity(&[1u64], &empty), 0.0);

        let samples: [&[u64]; 4] = [&[1, 2, 3, 4], &[1, 3, 4], &[4, 3, 2, 1], &[9]];
        for a in samples {
            assert_eq!(similarity(a, a), 1.0);
            for b in samples {
                let ab = similarity(a, b);
                assert!((0.0..=1.0).contains(&ab));
                assert_eq!(ab, similarity(b, a));
            }
        }
        assert!((similarity(&[1u64, 2, 3, 4], &[1, 3, 4]) - 6.0 / 7.0).abs() < 1e-12);
        assert_eq!(similarity(&[1u64, 2], &[3, 4]), 0.0);
    }

    #[test]
    fn test_lcs_length() {
        assert_eq!(lcs_length(b"ABCBDAB", b"BDCABA"), 4);
        assert_eq!(lcs_length::<u8>(b"", b"ABC"), 0);
    }

    #[test]
    fn test_secondary_measures() {
        assert_eq!(jaccard(&[1u64, 2, 3], &[3, 2, 1, 1]), 1.0);
        assert_eq!(jaccard(&[1u64, 2], &[2, 3]), 1.0 / 3.0);
        assert_eq!(overlap_coefficient(&[1u64, 2], &[1, 2, 3, 4]), 1.0);

        let forward: Vec<_> = (0..10).map(|pc| ContractJumpDest { contract: A, pc }).collect();
        let backward: Vec<_> = forward.iter().rev().copied().collect();
        // reversed order: ordered score is low, set overlap is total
        assert_eq!(contract_aware_similarity(&forward, &backward), 1.0);
    }

    #[test]
    fn test_batch_and_filter() {
        let reference = vec![1u64, 2, 3];
        let candidates = vec![vec![1, 2, 3], vec![1, 2], vec![7, 8]];
        assert_eq!(batch_compare(&reference, &candidates), vec![1.0, 0.8, 0.0]);
        assert_eq!(filter_by_threshold(&reference, &candidates, 0.8), vec![0, 1]);
    }

    #[test]
    fn test_compare_detailed() {
        let comparison = compare_detailed(&[1u64, 2, 3, 4, 5], &[1, 2, 3, 4, 6]);
        assert_eq!(comparison.lcs_length, 4);
        assert_eq!(comparison.similarity, 0.8);
        assert_eq!(comparison.common, vec![1, 2, 3, 4]);
        assert_eq!(comparison.only_first, vec![5]);
        assert_eq!(comparison.only_second, vec![6]);
        assert!(comparison.is_match);
        assert!(!compare_detailed(&[1u64], &[2]).is_match);
    }

    fn step(op: &str, depth: usize, pc: u64) -> PathStep {
        PathStep { pc, op: op.into(), gas: 0, gas_cost: 0, depth, contract: A }
    }

    #[test]
    fn test_analyze_instruction_path() {
        let mut result = ReplayResult::new(TraceSource::StructLog);
        result.gas_used = 90_000;
        result.jump_dests = vec![5, 9, 5];
        result.execution_path = vec![step("JUMPDEST", 1, 5), step("CALL", 1, 6)];
        result.execution_path.extend((0..11).map(|i| step("SSTORE", 4, 20 + i)));

        let analysis = analyze(&result);
        assert_eq!(analysis.total_steps, 13);
        assert_eq!(analysis.max_depth, 4);
        assert_eq!(analysis.opcode_frequency["SSTORE"], 11);
        assert_eq!(analysis.total_gas, 90_000);
        assert_eq!(
            analysis.patterns,
            vec![
                PatternFlag::LoopDetected,
                PatternFlag::RecursiveCall,
                PatternFlag::HeavyStorageOps,
                PatternFlag::ExternalCalls
            ]
        );
    }

    #[test]
    fn test_analyze_without_instruction_path() {
        let mut result = ReplayResult::new(TraceSource::CallTree);
        result.contract_jump_dests =
            vec![ContractJumpDest { contract: A, pc: 0xaa }, ContractJumpDest { contract: B, pc: 0xbb }];
        result.jump_dests = vec![0xaa, 0xbb];
        result.call_edges.push(CallEdge { caller: A, target: B, op: "CALL".into(), depth: 1 });
        let mut change = StateChange::default();
        change.storage.insert(B256::ZERO, StorageUpdate { before: None, after: B256::ZERO });
        result.state_changes.insert(B, change);

        let analysis = analyze(&result);
        assert_eq!(analysis.total_steps, 2);
        assert_eq!(analysis.max_depth, 2);
        assert_eq!(analysis.state_changes, 1);
        assert_eq!(analysis.opcode_frequency["CALL"], 1);
        assert_eq!(analysis.patterns, vec![PatternFlag::ExternalCalls]);
        assert!(analysis.has(PatternFlag::ExternalCalls));
        assert!(!analysis.has(PatternFlag::LoopDetected));

        assert_eq!(analyze(&ReplayResult::new(TraceSource::Hooks)).max_depth, 0);
    }

    #[test]
    fn test_repeated_writes_to_one_slot_are_heavy() {
        let mut result = ReplayResult::new(TraceSource::Script);
        result.contract_jump_dests = vec![ContractJumpDest { contract: A, pc: 1 }];
        result.jump_dests = vec![1];
        let mut change = StateChange::default();
        change.storage.insert(B256::ZERO, StorageUpdate { before: None, after: B256::ZERO });
        result.state_changes.insert(A, change);
        result.storage_writes = HEAVY_STORAGE_THRESHOLD + 1;
        assert!(analyze(&result).has(PatternFlag::HeavyStorageOps));

        result.storage_writes = HEAVY_STORAGE_THRESHOLD;
        assert!(!analyze(&result).has(PatternFlag::HeavyStorageOps));

        // The instruction path wins over the counter when both exist.
        result.storage_writes = 0;
        result.execution_path = (0..12).map(|i| step("SSTORE", 1, i)).collect();
        assert!(analyze(&result).has(PatternFlag::HeavyStorageOps));
    }

    #[test]
    fn test_written_slots_stand_in_without_a_count() {
        let mut result = ReplayResult::new(TraceSource::Local);
        let mut change = StateChange::default();
        for i in 0..11u8 {
            change.storage.insert(B256::with_last_byte(i), StorageUpdate { before: None, after: B256::ZERO });
        }
        result.state_changes.insert(B, change);
        assert!(analyze(&result).has(PatternFlag::HeavyStorageOps));
    }
}
