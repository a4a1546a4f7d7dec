//! Block source — where pushers fetch historical blocks from.
//!
//! The feed never polls a node itself. Live blocks arrive through
//! `ChainFeed::ingest_*`; the source is only asked for chain heights and for
//! confirmed ranges during historical catch-up.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use chainfeed_core::error::FeedError;
use chainfeed_core::types::{Block, ChainId};

/// Trait for reading blocks from a chain data provider.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Highest block the provider knows for `chain_id` (0 if none).
    async fn best_height(&self, chain_id: &str) -> Result<u64, FeedError>;

    /// Highest irreversible block for `chain_id` (0 if none).
    async fn confirmed_height(&self, chain_id: &str) -> Result<u64, FeedError>;

    /// Blocks in `[from, to]`, ascending. Missing heights are skipped.
    async fn blocks(&self, chain_id: &str, from: u64, to: u64) -> Result<Vec<Block>, FeedError>;
}

// ─── In-memory source (for testing) ──────────────────────────────────────────

/// In-memory block source for tests and replays.
///
/// A block counts as confirmed when it is flagged so, or when any stored
/// block reports a LIB at or above its height.
#[derive(Default)]
pub struct MemoryBlockSource {
    chains: Mutex<HashMap<ChainId, BTreeMap<u64, Block>>>,
    failures: Mutex<u32>,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block, replacing any block at the same height.
    pub fn push_block(&self, block: Block) {
        self.lock_chains()
            .entry(block.chain_id.clone())
            .or_default()
            .insert(block.block_number, block);
    }

    pub fn push_blocks(&self, blocks: impl IntoIterator<Item = Block>) {
        for block in blocks {
            self.push_block(block);
        }
    }

    /// Make the next `count` requests fail with a source error.
    pub fn fail_next(&self, count: u32) {
        *self.lock_failures() = count;
    }

    fn check_failure(&self) -> Result<(), FeedError> {
        let mut failures = self.lock_failures();
        if *failures > 0 {
            *failures -= 1;
            return Err(FeedError::Source("block source temporarily unavailable".into()));
        }
        Ok(())
    }

    fn confirmed_of(chain: &BTreeMap<u64, Block>) -> u64 {
        chain
            .values()
            .map(|b| if b.is_confirmed { b.block_number.max(b.lib_block_number) } else { b.lib_block_number })
            .max()
            .unwrap_or(0)
    }

    fn lock_chains(&self) -> std::sync::MutexGuard<'_, HashMap<ChainId, BTreeMap<u64, Block>>> {
        self.chains.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, u32> {
        self.failures.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn best_height(&self, chain_id: &str) -> Result<u64, FeedError> {
        self.check_failure()?;
        Ok(self
            .lock_chains()
            .get(chain_id)
            .and_then(|c| c.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn confirmed_height(&self, chain_id: &str) -> Result<u64, FeedError> {
        self.check_failure()?;
        Ok(self.lock_chains().get(chain_id).map(Self::confirmed_of).unwrap_or(0))
    }

    async fn blocks(&self, chain_id: &str, from: u64, to: u64) -> Result<Vec<Block>, FeedError> {
        self.check_failure()?;
        if to < from {
            return Ok(vec![]);
        }
        let chains = self.lock_chains();
        let Some(chain) = chains.get(chain_id) else {
            return Ok(vec![]);
        };
        let confirmed = Self::confirmed_of(chain);
        Ok(chain
            .range(from..=to)
            .map(|(_, block)| {
                let mut block = block.clone();
                block.is_confirmed |= block.block_number <= confirmed;
                block
            })
            .collect())
    }
}
