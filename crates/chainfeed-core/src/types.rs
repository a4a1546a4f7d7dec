//! Shared block types for the ingestion and push pipeline.

use serde::{Deserialize, Serialize};

/// Chain identifier (e.g. `"AELF"`, `"tDVV"`).
pub type ChainId = String;

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block as delivered by the block source, with its transactions and
/// their log events nested inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub chain_id: ChainId,
    pub block_hash: String,
    pub block_number: u64,
    pub previous_block_hash: String,
    /// Irreversible height claimed by the producer of this block (0 = none).
    #[serde(default)]
    pub lib_block_number: u64,
    #[serde(default)]
    pub is_confirmed: bool,
    /// Unix timestamp of the block (seconds since epoch).
    #[serde(default)]
    pub block_time: i64,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.block_number == parent.block_number + 1 && self.previous_block_hash == parent.block_hash
    }

    /// Total number of log events across all transactions.
    pub fn log_event_count(&self) -> usize {
        self.transactions.iter().map(|t| t.log_events.len()).sum()
    }
}

/// A transaction inside a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub method_name: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub log_events: Vec<LogEvent>,
}

/// A contract log event emitted by a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub contract_address: String,
    pub event_name: String,
    #[serde(default)]
    pub index: u32,
}

// ─── ScanMode ─────────────────────────────────────────────────────────────────

/// How a pusher is currently feeding its app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// Catching up from the subscription's start block to the chain head.
    Historical,
    /// Following newly confirmed blocks as they are reported.
    Live,
}

impl ScanMode {
    /// Mode for a subscription starting at `start_block_number` on a chain whose
    /// best height is `best_height`.
    pub fn for_start(start_block_number: u64, best_height: u64) -> Self {
        if start_block_number < best_height {
            Self::Historical
        } else {
            Self::Live
        }
    }
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Historical => write!(f, "historical"),
            Self::Live => write!(f, "live"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> Block {
        Block {
            chain_id: "AELF".into(),
            block_hash: hash.into(),
            block_number: number,
            previous_block_hash: parent.into(),
            lib_block_number: 0,
            is_confirmed: false,
            block_time: (number * 4) as i64,
            transactions: vec![],
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = block(100, "0xaaa", "0x000");
        let child = block(101, "0xbbb", "0xaaa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = block(100, "0xaaa", "0x000");
        let b = block(102, "0xccc", "0xaaa"); // gap
        assert!(!b.extends(&a));
    }

    #[test]
    fn scan_mode_from_start() {
        assert_eq!(ScanMode::for_start(100, 500), ScanMode::Historical);
        assert_eq!(ScanMode::for_start(500, 500), ScanMode::Live);
        assert_eq!(ScanMode::for_start(900, 500), ScanMode::Live);
    }

    #[test]
    fn block_deserializes_with_defaults() {
        let json = r#"{
            "chain_id": "AELF",
            "block_hash": "0x1",
            "block_number": 1,
            "previous_block_hash": "0x0"
        }"#;
        let b: Block = serde_json::from_str(json).unwrap();
        assert_eq!(b.lib_block_number, 0);
        assert!(!b.is_confirmed);
        assert!(b.transactions.is_empty());
    }
}
