//! Core types for Bitcoin mining
//!
//! Fundamental types used throughout the mining client: block templates as
//! returned by `getblocktemplate`, nonce ranges, worker state and mining
//! results, with proper validation and JSON serialization.

use crate::{crypto, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the u32 nonce domain (one past the largest nonce).
pub const NONCE_DOMAIN_END: u64 = 1 << 32;

/// A transaction entry inside a block template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateTransaction {
    /// Raw transaction bytes as hex
    #[serde(rename = "data")]
    pub data_hex: String,
    /// Transaction id (display-form hex, big-endian)
    pub txid: String,
    /// Witness hash (equals txid for non-segwit transactions)
    pub hash: String,
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub weight: u64,
}

/// Block template snapshot from `getblocktemplate`.
///
/// Immutable once fetched; template changes are handled by replacing the
/// whole snapshot, never by mutating one in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub version: i32,
    /// Previous block hash in display form (big-endian hex)
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    /// Node's current time, epoch seconds
    pub curtime: u32,
    /// Compact target encoding, 8 hex chars
    pub bits: String,
    /// 256-bit comparison threshold as 64 hex chars; some nodes omit it
    #[serde(default)]
    pub target: Option<String>,
    pub height: u64,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    /// Total funds available for the coinbase, in satoshis
    #[serde(rename = "coinbasevalue", default)]
    pub coinbase_value: u64,
}

impl BlockTemplate {
    /// The comparison threshold for this template as normalized 64-char hex.
    ///
    /// Prefers the node-supplied `target`; falls back to expanding the
    /// compact `bits` field when the node omits it.
    pub fn target_hex(&self) -> Result<String> {
        match &self.target {
            Some(t) => crypto::normalize_target_hex(t),
            None => {
                let bits = parse_bits(&self.bits)?;
                crypto::target_from_compact(bits)
            }
        }
    }

    /// True when `other` describes different work than this snapshot.
    pub fn is_superseded_by(&self, other: &BlockTemplate) -> bool {
        self.height != other.height
            || self.previous_block_hash != other.previous_block_hash
            || self.curtime != other.curtime
    }
}

/// Parse the 8-hex-char compact `bits` field.
pub fn parse_bits(bits: &str) -> Result<u32> {
    if bits.len() != 8 {
        return Err(Error::encoding(format!(
            "Invalid bits length: expected 8 hex chars, got {}",
            bits.len()
        )));
    }
    u32::from_str_radix(bits, 16)
        .map_err(|e| Error::encoding(format!("Invalid hex in bits: {}", e)))
}

/// An 80-byte Bitcoin block header, in field form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub previous_block_hash: String,
    pub merkle_root: String,
    pub time: u32,
    pub bits: String,
    pub nonce: u32,
}

/// Half-open nonce range `[start, end)` over the u32 domain.
///
/// Bounds are u64 so `end` can be 2^32, one past `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRange {
    pub start: u64,
    pub end: u64,
}

impl NonceRange {
    /// Create a range, validating bounds against the u32 domain.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end || end > NONCE_DOMAIN_END {
            return Err(Error::invalid_state(format!(
                "Invalid nonce range [{}, {})",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of nonces in the range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Split `[start, end)` into `count` contiguous sub-ranges.
    ///
    /// The ranges are gap-free and non-overlapping; any remainder after even
    /// division is attached to the last range. Workers beyond the range width
    /// receive empty ranges.
    pub fn partition(start: u64, end: u64, count: usize) -> Result<Vec<NonceRange>> {
        if count == 0 {
            return Err(Error::invalid_state("Cannot partition into 0 ranges"));
        }
        let domain = Self::new(start, end)?;
        let width = domain.len() / count as u64;

        let mut ranges = Vec::with_capacity(count);
        let mut cursor = start;
        for i in 0..count {
            let range_end = if i == count - 1 {
                end
            } else {
                (cursor + width).min(end)
            };
            ranges.push(NonceRange {
                start: cursor,
                end: range_end,
            });
            cursor = range_end;
        }
        Ok(ranges)
    }
}

impl fmt::Display for NonceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#010x}, {:#010x})", self.start, self.end)
    }
}

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Running,
    Exhausted,
    Found,
    Error,
    Stopped,
}

impl WorkerStatus {
    /// Terminal states end a worker's participation in the current epoch.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerStatus::Idle | WorkerStatus::Running)
    }
}

/// Snapshot of a single worker's progress, tracked by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: usize,
    pub current_nonce: u64,
    pub attempts_this_interval: u64,
    pub total_attempts: u64,
    pub status: WorkerStatus,
}

impl WorkerState {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            current_nonce: 0,
            attempts_this_interval: 0,
            total_attempts: 0,
            status: WorkerStatus::Idle,
        }
    }
}

/// Terminal outcome of a mining search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningResult {
    pub found: bool,
    pub nonce: Option<u32>,
    /// Winning block hash in display form
    pub hash: Option<String>,
    /// Total attempts summed across all workers and epochs
    pub attempts: u64,
    pub duration_secs: f64,
    pub hash_rate: HashRate,
}

/// Periodic status delivered to external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub epoch: u64,
    pub height: u64,
    pub total_attempts: u64,
    pub hash_rate: HashRate,
    pub active_workers: usize,
    pub elapsed_secs: f64,
}

/// Hash rate in hashes per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct HashRate(pub f64);

impl HashRate {
    pub fn new(rate: f64) -> Self {
        Self(rate)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Rate from a raw attempt count and elapsed seconds.
    pub fn from_attempts(attempts: u64, elapsed_secs: f64) -> Self {
        if elapsed_secs > 0.0 {
            Self(attempts as f64 / elapsed_secs)
        } else {
            Self(0.0)
        }
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::utils::format_hash_rate(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_template_json_field_names() {
        let json = r#"{
            "version": 536870912,
            "previousblockhash": "0000000000000000000123456789abcdef0123456789abcdef0123456789abcd",
            "curtime": 1700000000,
            "bits": "1d00ffff",
            "height": 840000,
            "transactions": [],
            "coinbasevalue": 312500000
        }"#;
        let template: BlockTemplate = serde_json::from_str(json).unwrap();
        assert_eq!(template.version, 536870912);
        assert_eq!(template.height, 840000);
        assert_eq!(template.coinbase_value, 312_500_000);
        assert!(template.target.is_none());
        assert!(template.transactions.is_empty());
    }

    #[test]
    fn test_template_target_falls_back_to_bits() {
        let template = BlockTemplate {
            version: 1,
            previous_block_hash: "00".repeat(32),
            curtime: 0,
            bits: "1d00ffff".to_string(),
            target: None,
            height: 0,
            transactions: vec![],
            coinbase_value: 0,
        };
        let target = template.target_hex().unwrap();
        assert_eq!(
            target,
            "00000000ffff0000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_template_supersession() {
        let mut a = BlockTemplate {
            version: 1,
            previous_block_hash: "00".repeat(32),
            curtime: 100,
            bits: "1d00ffff".to_string(),
            target: None,
            height: 10,
            transactions: vec![],
            coinbase_value: 0,
        };
        let same = a.clone();
        assert!(!a.is_superseded_by(&same));

        let mut taller = a.clone();
        taller.height = 11;
        assert!(a.is_superseded_by(&taller));

        a.curtime = 101;
        assert!(same.is_superseded_by(&a));
    }

    #[test]
    fn test_parse_bits() {
        assert_eq!(parse_bits("1d00ffff").unwrap(), 0x1d00ffff);
        assert!(parse_bits("1d00ff").is_err());
        assert!(parse_bits("1d00ffzz").is_err());
    }

    #[test]
    fn test_partition_remainder_on_last() {
        let ranges = NonceRange::partition(0, 10, 3).unwrap();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], NonceRange { start: 0, end: 3 });
        assert_eq!(ranges[1], NonceRange { start: 3, end: 6 });
        assert_eq!(ranges[2], NonceRange { start: 6, end: 10 });
    }

    #[test]
    fn test_partition_rejects_invalid() {
        assert!(NonceRange::partition(0, NONCE_DOMAIN_END, 0).is_err());
        assert!(NonceRange::partition(10, 5, 2).is_err());
        assert!(NonceRange::partition(0, NONCE_DOMAIN_END + 1, 2).is_err());
    }

    #[test]
    fn test_partition_more_workers_than_nonces() {
        let ranges = NonceRange::partition(0, 2, 8).unwrap();
        assert_eq!(ranges.len(), 8);
        let total: u64 = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(total, 2);
        assert_eq!(ranges.last().unwrap().end, 2);
    }

    proptest! {
        #[test]
        fn prop_partition_covers_domain_exactly(count in 1usize..=64) {
            let ranges = NonceRange::partition(0, NONCE_DOMAIN_END, count).unwrap();
            prop_assert_eq!(ranges.len(), count);
            prop_assert_eq!(ranges[0].start, 0);
            prop_assert_eq!(ranges.last().unwrap().end, NONCE_DOMAIN_END);
            // Adjacent ranges must touch: no gaps, no overlaps.
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
            let total: u64 = ranges.iter().map(|r| r.len()).sum();
            prop_assert_eq!(total, NONCE_DOMAIN_END);
        }

        #[test]
        fn prop_partition_covers_subset(start in 0u64..1000, width in 1u64..100_000, count in 1usize..=64) {
            let end = start + width;
            let ranges = NonceRange::partition(start, end, count).unwrap();
            prop_assert_eq!(ranges[0].start, start);
            prop_assert_eq!(ranges.last().unwrap().end, end);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }

    #[test]
    fn test_hash_rate_display_matches_formatter() {
        assert_eq!(HashRate::new(512.0).to_string(), "512.00 H/s");
        assert_eq!(HashRate::new(2_500_000.0).to_string(), "2.50 MH/s");
        assert_eq!(HashRate::new(3_000_000_000.0).to_string(), "3.00 GH/s");
        // Display and the status-line formatter must render identically.
        assert_eq!(
            HashRate::new(1234.5).to_string(),
            crate::utils::format_hash_rate(1234.5)
        );
    }

    #[test]
    fn test_hash_rate_from_attempts() {
        assert_eq!(HashRate::from_attempts(1000, 10.0).value(), 100.0);
        assert_eq!(HashRate::from_attempts(1000, 0.0).value(), 0.0);
    }

    #[test]
    fn test_worker_state_starts_idle() {
        let state = WorkerState::new(7);
        assert_eq!(state.id, 7);
        assert_eq!(state.total_attempts, 0);
        assert_eq!(state.status, WorkerStatus::Idle);
        assert!(!state.status.is_terminal());
    }

    #[test]
    fn test_worker_status_terminal() {
        assert!(!WorkerStatus::Idle.is_terminal());
        assert!(!WorkerStatus::Running.is_terminal());
        assert!(WorkerStatus::Found.is_terminal());
        assert!(WorkerStatus::Exhausted.is_terminal());
        assert!(WorkerStatus::Stopped.is_terminal());
        assert!(WorkerStatus::Error.is_terminal());
    }
}
