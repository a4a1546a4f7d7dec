//! Scan cursor — tracks how far a pusher has delivered a chain.

use serde::{Deserialize, Serialize};

/// A pusher's position in its chain.
///
/// The cursor knows:
/// - The last confirmed block that was delivered (or skipped as unmatched)
/// - The first block the subscription asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Last confirmed block number handled; `None` before the first one.
    pub block_number: Option<u64>,
    /// First block the subscription wants.
    pub start_block_number: u64,
}

impl ScanCursor {
    /// Create a cursor that has not delivered anything yet.
    pub fn new(start_block_number: u64) -> Self {
        Self {
            block_number: None,
            start_block_number,
        }
    }

    /// Advance the cursor to a handled block.
    pub fn advance(&mut self, block_number: u64) {
        self.block_number = Some(block_number);
    }

    /// Returns the next block to deliver.
    pub fn next_block(&self) -> u64 {
        match self.block_number {
            Some(n) => n + 1,
            None => self.start_block_number,
        }
    }

    /// Returns `true` if `block_number` was already handled or lies before
    /// the subscription start.
    pub fn is_behind(&self, block_number: u64) -> bool {
        block_number < self.next_block()
    }

    /// Returns `true` if the cursor has reached `head`.
    pub fn reached(&self, head: u64) -> bool {
        self.next_block() > head
    }
}
