//! Chain ledger actor — owns one [`ChainLedger`] behind a mailbox.
//!
//! Each mutation runs on a copy of the ledger. The copy is persisted and
//! only then swapped in, so a failed write or an invariant violation leaves
//! the live ledger untouched.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error};

use chainfeed_core::error::FeedError;
use chainfeed_core::keys::{LedgerKey, StateKey};
use chainfeed_core::ledger::{ChainLedger, LedgerEntry};
use chainfeed_core::store::{load_state, save_state, StateStore};
use chainfeed_core::types::Block;

use crate::actor::{Actor, ActorDirectory, Context};

/// Blocks a ledger accepted and the blocks that became irreversible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recorded {
    /// Newly stored blocks, in input order.
    pub accepted: Vec<Block>,
    /// Newly irreversible blocks, ascending, including the prior frontier.
    pub confirmed: Vec<Block>,
}

/// Height summary of one ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub confirmed_height: Option<u64>,
    pub best_height: Option<u64>,
    pub entries: usize,
}

pub enum LedgerMessage {
    RecordBlock {
        block: Block,
        prune: bool,
        reply: oneshot::Sender<Result<Recorded, FeedError>>,
    },
    RecordBlocks {
        blocks: Vec<Block>,
        reply: oneshot::Sender<Result<Recorded, FeedError>>,
    },
    Status {
        reply: oneshot::Sender<LedgerStatus>,
    },
    Entry {
        block_hash: String,
        reply: oneshot::Sender<Option<LedgerEntry>>,
    },
}

pub struct LedgerActor {
    key: LedgerKey,
    ledger: ChainLedger,
    store: Arc<dyn StateStore>,
}

impl LedgerActor {
    fn status(&self) -> LedgerStatus {
        LedgerStatus {
            confirmed_height: self.ledger.confirmed_height(),
            best_height: self.ledger.best_height(),
            entries: self.ledger.len(),
        }
    }

    /// Blocks of `blocks` not yet tracked. A batch may still drop some of
    /// them, see [`Self::apply`].
    fn unseen(&self, blocks: &[Block]) -> Vec<Block> {
        let confirmed = self.ledger.confirmed_height();
        blocks
            .iter()
            .filter(|b| self.ledger.entry(&b.block_hash).is_none())
            .filter(|b| confirmed.map_or(true, |c| b.block_number > c))
            .cloned()
            .collect()
    }

    async fn apply(
        &mut self,
        mut accepted: Vec<Block>,
        mutate: impl FnOnce(&mut ChainLedger) -> Result<Vec<Block>, FeedError>,
    ) -> Result<Recorded, FeedError> {
        let mut next = self.ledger.clone();
        let confirmed = match mutate(&mut next) {
            Ok(confirmed) => confirmed,
            Err(e) => {
                if matches!(e, FeedError::InvariantViolation(_)) {
                    error!(ledger = %self.key, error = %e, "ledger invariant violated; block discarded");
                }
                return Err(e);
            }
        };
        // Kept entries, or blocks confirmed and pruned in the same call.
        // Anything else sat on a fork the batch pruned.
        accepted.retain(|b| {
            next.entry(&b.block_hash).is_some() || confirmed.iter().any(|c| c.block_hash == b.block_hash)
        });
        save_state(self.store.as_ref(), Self::KIND, &self.key.storage_key(), &next).await?;
        self.ledger = next;

        if !confirmed.is_empty() {
            debug!(
                ledger = %self.key,
                from = confirmed.first().map(|b| b.block_number),
                to = confirmed.last().map(|b| b.block_number),
                "blocks confirmed"
            );
        }
        Ok(Recorded { accepted, confirmed })
    }
}

#[async_trait]
impl Actor for LedgerActor {
    type Key = LedgerKey;
    type Message = LedgerMessage;
    type Deps = Arc<dyn StateStore>;

    const KIND: &'static str = "ledger";

    async fn activate(key: &LedgerKey, store: &Arc<dyn StateStore>) -> Result<Self, FeedError> {
        let ledger = load_state::<ChainLedger>(store.as_ref(), Self::KIND, &key.storage_key())
            .await?
            .unwrap_or_else(|| ChainLedger::new(key.chain_id.clone()));
        Ok(Self {
            key: key.clone(),
            ledger,
            store: Arc::clone(store),
        })
    }

    async fn handle(&mut self, message: LedgerMessage, _ctx: &Context<Self>) {
        match message {
            LedgerMessage::RecordBlock { block, prune, reply } => {
                let accepted = self.unseen(std::slice::from_ref(&block));
                let result = self.apply(accepted, |l| l.record_block(block, prune)).await;
                let _ = reply.send(result);
            }
            LedgerMessage::RecordBlocks { blocks, reply } => {
                let accepted = self.unseen(&blocks);
                let result = self.apply(accepted, |l| l.record_blocks(blocks)).await;
                let _ = reply.send(result);
            }
            LedgerMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
            LedgerMessage::Entry { block_hash, reply } => {
                let _ = reply.send(self.ledger.entry(&block_hash).cloned());
            }
        }
    }
}

// ─── Typed calls ──────────────────────────────────────────────────────────────

impl ActorDirectory<LedgerActor> {
    pub async fn record_block(&self, key: &LedgerKey, block: Block, prune: bool) -> Result<Recorded, FeedError> {
        self.ask(key, |reply| LedgerMessage::RecordBlock { block, prune, reply })
            .await?
    }

    pub async fn record_blocks(&self, key: &LedgerKey, blocks: Vec<Block>) -> Result<Recorded, FeedError> {
        self.ask(key, |reply| LedgerMessage::RecordBlocks { blocks, reply })
            .await?
    }

    pub async fn status(&self, key: &LedgerKey) -> Result<LedgerStatus, FeedError> {
        self.ask(key, |reply| LedgerMessage::Status { reply }).await
    }

    pub async fn entry(&self, key: &LedgerKey, block_hash: &str) -> Result<Option<LedgerEntry>, FeedError> {
        let block_hash = block_hash.to_string();
        self.ask(key, |reply| LedgerMessage::Entry { block_hash, reply }).await
    }
}
