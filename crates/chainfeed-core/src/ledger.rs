//! Chain ledger — a forking window of recent blocks for one chain.
//!
//! The ledger accepts blocks whose parent it already knows, and uses the
//! library block number (LIB) each block reports to decide which blocks
//! have become irreversible:
//!
//! ```text
//!   seed ── 1 ── 2 ── 3 ── 4        block 4 reports lib = 2
//!                 └── 3' ── 4'
//!
//!   walk back from 4's parent to height 2, then confirm 2, 1, … down to
//!   the first block that was already confirmed (inclusive)
//! ```
//!
//! Pruning drops everything that can no longer become canonical: blocks
//! below the LIB height and forks that do not descend from the LIB block.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::types::{Block, ChainId};

/// One block tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub block: Block,
    /// Set on the entry whose application pruned the ledger.
    #[serde(default)]
    pub clear_marker: bool,
}

/// Fork-aware window of recent blocks for a single chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLedger {
    chain_id: ChainId,
    entries: HashMap<String, LedgerEntry>,
}

impl ChainLedger {
    /// Create an empty ledger. The first block recorded becomes the seed.
    pub fn new(chain_id: impl Into<ChainId>) -> Self {
        Self {
            chain_id: chain_id.into(),
            entries: HashMap::new(),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Number of blocks in the window.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a tracked block by hash.
    pub fn entry(&self, block_hash: &str) -> Option<&LedgerEntry> {
        self.entries.get(block_hash)
    }

    /// Highest confirmed block number, if any block is confirmed.
    pub fn confirmed_height(&self) -> Option<u64> {
        self.entries
            .values()
            .filter(|e| e.block.is_confirmed)
            .map(|e| e.block.block_number)
            .max()
    }

    /// Highest block number tracked on any branch.
    pub fn best_height(&self) -> Option<u64> {
        self.entries.values().map(|e| e.block.block_number).max()
    }

    /// Record a single block.
    ///
    /// Returns the blocks that became irreversible, oldest first. The list
    /// starts with the previous confirmed frontier whenever the walk reached
    /// it. `prune` lets this call discard blocks that can no longer become
    /// canonical once the LIB moved.
    pub fn record_block(&mut self, block: Block, prune: bool) -> Result<Vec<Block>, FeedError> {
        self.check_stale(block.block_number)?;
        if !self.entries.is_empty() && !self.entries.contains_key(&block.previous_block_hash) {
            return Err(self.discontinuous(&block));
        }
        self.apply(block, prune)
    }

    /// Record a batch of blocks submitted together.
    ///
    /// Stale and already-known blocks are dropped first. The batch is split
    /// at the last block carrying the highest LIB: blocks before it are
    /// appended as-is, that block runs the LIB walk (and is the only one
    /// allowed to prune), blocks after it are appended afterwards.
    pub fn record_blocks(&mut self, mut blocks: Vec<Block>) -> Result<Vec<Block>, FeedError> {
        let Some(highest) = blocks.iter().map(|b| b.block_number).max() else {
            return Ok(vec![]);
        };
        self.check_stale(highest)?;

        let confirmed = self.confirmed_height();
        blocks.retain(|b| {
            confirmed.map_or(true, |c| b.block_number > c) && !self.entries.contains_key(&b.block_hash)
        });
        if blocks.is_empty() {
            return Ok(vec![]);
        }
        self.check_batch_continuity(&blocks)?;

        let max_lib = blocks.iter().map(|b| b.lib_block_number).max().unwrap_or(0);
        let split = blocks.iter().rposition(|b| b.lib_block_number == max_lib);
        let (Some(split), true) = (split, max_lib > 0) else {
            for block in blocks {
                self.insert(block, false);
            }
            return Ok(vec![]);
        };

        let after = blocks.split_off(split + 1);
        let Some(pivot) = blocks.pop() else {
            return Ok(vec![]);
        };
        for block in blocks {
            self.insert(block, false);
        }
        let confirmed = self.apply(pivot, true)?;
        for block in after {
            // A block whose branch was pruned at the pivot is a dead fork.
            if !self.entries.contains_key(&block.previous_block_hash) {
                tracing::debug!(
                    chain = %self.chain_id,
                    block = block.block_number,
                    hash = %block.block_hash,
                    "dropping block on pruned fork"
                );
                continue;
            }
            self.insert(block, false);
        }
        Ok(confirmed)
    }

    /// Run the LIB walk for `block` and insert it.
    fn apply(&mut self, block: Block, prune: bool) -> Result<Vec<Block>, FeedError> {
        let lib = block.lib_block_number;
        let candidate = if lib > 0 {
            self.find_lib_block(&block.previous_block_hash, lib)
        } else {
            None
        };

        let confirmed = match &candidate {
            Some(hash) => self.confirm_from(hash),
            None => vec![],
        };

        let clear = prune && candidate.is_some();
        tracing::debug!(
            chain = %self.chain_id,
            block = block.block_number,
            lib,
            newly_confirmed = confirmed.len(),
            clear,
            "block recorded"
        );
        self.insert(block, clear);

        if let (true, Some(lib_hash)) = (clear, candidate) {
            self.prune(&lib_hash)?;
        }
        Ok(confirmed)
    }

    /// Insert or refresh an entry. A refresh never un-confirms a block.
    fn insert(&mut self, block: Block, clear_marker: bool) {
        match self.entries.get_mut(&block.block_hash) {
            Some(existing) => {
                let was_confirmed = existing.block.is_confirmed;
                existing.block = block;
                existing.block.is_confirmed |= was_confirmed;
                existing.clear_marker |= clear_marker;
            }
            None => {
                self.entries
                    .insert(block.block_hash.clone(), LedgerEntry { block, clear_marker });
            }
        }
    }

    /// Walk parent links from `from` to the block at height `lib`.
    fn find_lib_block(&self, from: &str, lib: u64) -> Option<String> {
        let mut hash = from;
        while let Some(entry) = self.entries.get(hash) {
            if entry.block.block_number == lib {
                return Some(hash.to_string());
            }
            if entry.block.block_number < lib {
                return None;
            }
            hash = &entry.block.previous_block_hash;
        }
        None
    }

    /// Confirm `hash` and its unconfirmed ancestors, stopping at (and
    /// including) the first ancestor that was already confirmed.
    fn confirm_from(&mut self, hash: &str) -> Vec<Block> {
        let mut confirmed = Vec::new();
        let mut current = hash.to_string();
        while let Some(entry) = self.entries.get_mut(&current) {
            if entry.block.is_confirmed {
                confirmed.push(entry.block.clone());
                break;
            }
            entry.block.is_confirmed = true;
            confirmed.push(entry.block.clone());
            current = entry.block.previous_block_hash.clone();
        }
        confirmed.reverse();
        confirmed
    }

    /// Keep only the LIB block and its descendants.
    fn prune(&mut self, lib_hash: &str) -> Result<(), FeedError> {
        let lib_height = match self.entries.get(lib_hash) {
            Some(e) if e.block.is_confirmed => e.block.block_number,
            _ => {
                return Err(FeedError::InvariantViolation(format!(
                    "{}: LIB block {lib_hash} missing or unconfirmed before pruning",
                    self.chain_id
                )))
            }
        };

        let keep: HashSet<String> = self
            .entries
            .keys()
            .filter(|hash| self.descends_from(hash, lib_hash, lib_height))
            .cloned()
            .collect();
        let before = self.entries.len();
        self.entries.retain(|hash, _| keep.contains(hash));

        if !self.entries.get(lib_hash).is_some_and(|e| e.block.is_confirmed) {
            return Err(FeedError::InvariantViolation(format!(
                "{}: pruning removed the confirmed frontier {lib_hash}",
                self.chain_id
            )));
        }
        tracing::debug!(
            chain = %self.chain_id,
            lib = lib_height,
            pruned = before - self.entries.len(),
            remaining = self.entries.len(),
            "ledger pruned"
        );
        Ok(())
    }

    fn descends_from(&self, hash: &str, ancestor: &str, ancestor_height: u64) -> bool {
        let mut current = hash;
        while let Some(entry) = self.entries.get(current) {
            if current == ancestor {
                return true;
            }
            if entry.block.block_number <= ancestor_height {
                return false;
            }
            current = &entry.block.previous_block_hash;
        }
        false
    }

    fn check_stale(&self, block_number: u64) -> Result<(), FeedError> {
        match self.confirmed_height() {
            Some(confirmed) if confirmed >= block_number => Err(FeedError::StaleBlock {
                chain_id: self.chain_id.clone(),
                block_number,
                confirmed_height: confirmed,
            }),
            _ => Ok(()),
        }
    }

    /// Every block must chain to the ledger or to an earlier block of the
    /// batch. The first block of a batch seeds an empty ledger.
    fn check_batch_continuity(&self, blocks: &[Block]) -> Result<(), FeedError> {
        let mut known: HashSet<&str> = self.entries.keys().map(String::as_str).collect();
        for (i, block) in blocks.iter().enumerate() {
            let seeds = i == 0 && self.entries.is_empty();
            if !seeds && !known.contains(block.previous_block_hash.as_str()) {
                return Err(self.discontinuous(block));
            }
            known.insert(&block.block_hash);
        }
        Ok(())
    }

    fn discontinuous(&self, block: &Block) -> FeedError {
        FeedError::DiscontinuousBlock {
            chain_id: self.chain_id.clone(),
            block_number: block.block_number,
            previous_block_hash: block.previous_block_hash.clone(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
