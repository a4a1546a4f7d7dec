//! Block pusher — streams matching blocks for one (app, version, chain).
//!
//! # Historical mode
//! The subscription starts behind the chain. The pusher fetches confirmed
//! ranges from the [`BlockSource`] in steps of `catch_up_batch_size`. Each
//! step is its own mailbox message carrying the push token it was scheduled
//! under, so a `Stop` queued between steps rotates the token and the next
//! step drops itself.
//!
//! # Live mode
//! The registry forwards blocks as the chain ledger confirms them. The next
//! contiguous block is filtered, published and advances the cursor. A gap
//! means notifications were missed, so the pusher falls back to Historical.
//! Unconfirmed blocks are published as they arrive for items that accept
//! them, without moving the cursor.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chainfeed_core::cursor::ScanCursor;
use chainfeed_core::error::FeedError;
use chainfeed_core::filter::filter_block;
use chainfeed_core::keys::{PusherId, StateKey};
use chainfeed_core::manifest::SubscriptionItem;
use chainfeed_core::store::{load_state, save_state, StateStore};
use chainfeed_core::types::{Block, ScanMode};

use crate::actor::{Actor, ActorDirectory, Context};
use crate::bus::{MessageBus, PushMessage, StreamId};
use crate::config::FeedConfig;
use crate::source::BlockSource;

/// Collaborators of every pusher.
#[derive(Clone)]
pub struct PusherDeps {
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<dyn MessageBus>,
    pub source: Arc<dyn BlockSource>,
    pub config: FeedConfig,
}

/// Persisted state of one pusher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PusherState {
    pub item: Option<SubscriptionItem>,
    /// Allocated once, stable across stop/start.
    pub message_stream_id: Option<StreamId>,
    /// Rotated on every stop.
    pub push_token: Uuid,
    pub running: bool,
    pub mode: ScanMode,
    pub cursor: ScanCursor,
}

impl Default for PusherState {
    fn default() -> Self {
        Self {
            item: None,
            message_stream_id: None,
            push_token: Uuid::new_v4(),
            running: false,
            mode: ScanMode::Historical,
            cursor: ScanCursor::new(0),
        }
    }
}

pub enum PusherMessage {
    Initialize {
        item: SubscriptionItem,
        reply: oneshot::Sender<Result<StreamId, FeedError>>,
    },
    Start {
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    GetPushToken {
        reply: oneshot::Sender<Uuid>,
    },
    GetMessageStreamId {
        reply: oneshot::Sender<Option<StreamId>>,
    },
    IsRunning {
        token: Uuid,
        reply: oneshot::Sender<bool>,
    },
    GetState {
        reply: oneshot::Sender<PusherState>,
    },
    NewConfirmedBlocks {
        blocks: Vec<Block>,
    },
    NewBlocks {
        blocks: Vec<Block>,
    },
    CatchUp {
        token: Uuid,
    },
}

pub struct PusherActor {
    id: PusherId,
    state: PusherState,
    deps: PusherDeps,
}

impl PusherActor {
    async fn commit(&mut self, next: PusherState) -> Result<(), FeedError> {
        if next != self.state {
            save_state(self.deps.store.as_ref(), Self::KIND, &self.id.storage_key(), &next).await?;
            self.state = next;
        }
        Ok(())
    }

    /// Best height of the chain, or `None` if the source can't tell.
    async fn best_height(&self) -> Option<u64> {
        match self.deps.source.best_height(&self.id.chain_id).await {
            Ok(height) => Some(height),
            Err(e) => {
                warn!(pusher = %self.id, error = %e, "best height unavailable");
                None
            }
        }
    }

    async fn initialize(&mut self, item: SubscriptionItem) -> Result<StreamId, FeedError> {
        if item.chain_id != self.id.chain_id {
            return Err(FeedError::InvalidManifest(format!(
                "pusher {} got an item for chain '{}'",
                self.id, item.chain_id
            )));
        }
        let mut next = self.state.clone();
        let stream = match next.message_stream_id {
            Some(stream) => stream,
            None => {
                let stream = self.deps.bus.allocate_stream().await?;
                next.message_stream_id = Some(stream);
                stream
            }
        };

        if next.item.is_none() {
            next.cursor = ScanCursor::new(item.start_block_number);
            next.mode = match self.best_height().await {
                Some(best) => ScanMode::for_start(item.start_block_number, best),
                None => ScanMode::Historical,
            };
        } else if next.cursor.block_number.is_none() {
            next.cursor.start_block_number = item.start_block_number;
        }
        next.item = Some(item);
        self.commit(next).await?;

        debug!(pusher = %self.id, %stream, mode = %self.state.mode, "pusher initialised");
        Ok(stream)
    }

    async fn start(&mut self, ctx: &Context<Self>) -> Result<(), FeedError> {
        if self.state.item.is_none() {
            return Err(FeedError::InvalidManifest(format!(
                "pusher {} was never initialised",
                self.id
            )));
        }
        let catching_up = self.state.running && self.state.mode == ScanMode::Historical;

        let mut next = self.state.clone();
        next.running = true;
        if let Some(best) = self.best_height().await {
            next.mode = ScanMode::for_start(next.cursor.next_block(), best);
        }
        self.commit(next).await?;

        info!(
            pusher = %self.id,
            mode = %self.state.mode,
            next_block = self.state.cursor.next_block(),
            "pusher started"
        );
        if self.state.mode == ScanMode::Historical && !catching_up {
            ctx.notify(PusherMessage::CatchUp {
                token: self.state.push_token,
            });
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), FeedError> {
        let mut next = self.state.clone();
        next.running = false;
        next.push_token = Uuid::new_v4();
        self.commit(next).await?;
        info!(pusher = %self.id, "pusher stopped");
        Ok(())
    }

    async fn publish(&self, state: &PusherState, blocks: Vec<Block>) -> Result<(), FeedError> {
        let stream = state
            .message_stream_id
            .ok_or_else(|| FeedError::Transport(format!("pusher {} has no stream", self.id)))?;
        let count = blocks.len();
        let message = PushMessage {
            app_id: self.id.app_id.clone(),
            version: self.id.version,
            chain_id: self.id.chain_id.clone(),
            push_token: state.push_token,
            mode: state.mode,
            blocks,
            pushed_at: Utc::now(),
        };
        self.deps.bus.publish(stream, message).await?;
        debug!(pusher = %self.id, blocks = count, "blocks pushed");
        Ok(())
    }

    async fn on_confirmed(&mut self, blocks: Vec<Block>, ctx: &Context<Self>) {
        let Some(item) = self.state.item.clone() else {
            return;
        };
        if !self.state.running || self.state.mode != ScanMode::Live {
            return;
        }

        let mut next = self.state.clone();
        let mut matched = Vec::new();
        for block in blocks {
            if next.cursor.is_behind(block.block_number) {
                continue;
            }
            if block.block_number != next.cursor.next_block() {
                info!(
                    pusher = %self.id,
                    expected = next.cursor.next_block(),
                    got = block.block_number,
                    "gap in confirmed blocks, catching up"
                );
                next.mode = ScanMode::Historical;
                break;
            }
            if let Some(m) = filter_block(&block, &item) {
                matched.push(m);
            }
            next.cursor.advance(block.block_number);
        }

        if !matched.is_empty() {
            if let Err(e) = self.publish(&next, matched).await {
                // The cursor stays put; the next notification sees a gap.
                warn!(pusher = %self.id, error = %e, "push failed");
                return;
            }
        }
        if let Err(e) = self.commit(next).await {
            warn!(pusher = %self.id, error = %e, "failed to persist pusher");
            return;
        }
        if self.state.mode == ScanMode::Historical {
            ctx.notify(PusherMessage::CatchUp {
                token: self.state.push_token,
            });
        }
    }

    async fn on_unconfirmed(&mut self, blocks: Vec<Block>) {
        let Some(item) = &self.state.item else {
            return;
        };
        if !self.state.running || self.state.mode != ScanMode::Live || item.only_confirmed {
            return;
        }
        let matched: Vec<Block> = blocks
            .iter()
            .filter(|b| !b.is_confirmed && !self.state.cursor.is_behind(b.block_number))
            .filter_map(|b| filter_block(b, item))
            .collect();
        if matched.is_empty() {
            return;
        }
        if let Err(e) = self.publish(&self.state, matched).await {
            warn!(pusher = %self.id, error = %e, "push of unconfirmed blocks failed");
        }
    }

    async fn on_catch_up(&mut self, token: Uuid, ctx: &Context<Self>) {
        if token != self.state.push_token
            || !self.state.running
            || self.state.mode != ScanMode::Historical
        {
            debug!(pusher = %self.id, "stale catch-up step dropped");
            return;
        }
        match self.catch_up_step().await {
            Ok(true) => ctx.notify(PusherMessage::CatchUp { token }),
            Ok(false) => {
                info!(
                    pusher = %self.id,
                    block = ?self.state.cursor.block_number,
                    "caught up, switching to live"
                );
            }
            Err(e) => {
                warn!(pusher = %self.id, error = %e, "catch-up step failed, retrying");
                ctx.schedule(PusherMessage::CatchUp { token }, self.deps.config.catch_up_retry());
            }
        }
    }

    /// Push one confirmed range. Returns `true` while more remain.
    async fn catch_up_step(&mut self) -> Result<bool, FeedError> {
        let Some(item) = self.state.item.clone() else {
            return Ok(false);
        };
        let confirmed = self.deps.source.confirmed_height(&self.id.chain_id).await?;

        let mut next = self.state.clone();
        if !next.cursor.reached(confirmed) {
            let from = next.cursor.next_block();
            let to = from
                .saturating_add(self.deps.config.catch_up_batch_size.max(1) - 1)
                .min(confirmed);
            let blocks = self.deps.source.blocks(&self.id.chain_id, from, to).await?;
            let matched: Vec<Block> = blocks
                .into_iter()
                .filter(|b| (from..=to).contains(&b.block_number))
                .map(|mut b| {
                    // Everything up to the confirmed height is irreversible.
                    b.is_confirmed = true;
                    b
                })
                .filter_map(|b| filter_block(&b, &item))
                .collect();
            if !matched.is_empty() {
                self.publish(&next, matched).await?;
            }
            next.cursor.advance(to);
            debug!(pusher = %self.id, from, to, confirmed, "catch-up step");
        }

        let done = next.cursor.reached(confirmed);
        if done {
            next.mode = ScanMode::Live;
        }
        self.commit(next).await?;
        Ok(!done)
    }
}

#[async_trait]
impl Actor for PusherActor {
    type Key = PusherId;
    type Message = PusherMessage;
    type Deps = PusherDeps;

    const KIND: &'static str = "pusher";

    async fn activate(key: &PusherId, deps: &PusherDeps) -> Result<Self, FeedError> {
        let state = load_state::<PusherState>(deps.store.as_ref(), Self::KIND, &key.storage_key())
            .await?
            .unwrap_or_default();
        Ok(Self {
            id: key.clone(),
            state,
            deps: deps.clone(),
        })
    }

    async fn started(&mut self, ctx: &Context<Self>) {
        // Resume a catch-up interrupted by eviction or restart.
        if self.state.running && self.state.mode == ScanMode::Historical {
            ctx.notify(PusherMessage::CatchUp {
                token: self.state.push_token,
            });
        }
    }

    async fn handle(&mut self, message: PusherMessage, ctx: &Context<Self>) {
        match message {
            PusherMessage::Initialize { item, reply } => {
                let _ = reply.send(self.initialize(item).await);
            }
            PusherMessage::Start { reply } => {
                let _ = reply.send(self.start(ctx).await);
            }
            PusherMessage::Stop { reply } => {
                let _ = reply.send(self.stop().await);
            }
            PusherMessage::GetPushToken { reply } => {
                let _ = reply.send(self.state.push_token);
            }
            PusherMessage::GetMessageStreamId { reply } => {
                let _ = reply.send(self.state.message_stream_id);
            }
            PusherMessage::IsRunning { token, reply } => {
                let _ = reply.send(self.state.running && token == self.state.push_token);
            }
            PusherMessage::GetState { reply } => {
                let _ = reply.send(self.state.clone());
            }
            PusherMessage::NewConfirmedBlocks { blocks } => self.on_confirmed(blocks, ctx).await,
            PusherMessage::NewBlocks { blocks } => self.on_unconfirmed(blocks).await,
            PusherMessage::CatchUp { token } => self.on_catch_up(token, ctx).await,
        }
    }
}

// ─── Typed calls ──────────────────────────────────────────────────────────────

impl ActorDirectory<PusherActor> {
    pub async fn initialize(&self, id: &PusherId, item: SubscriptionItem) -> Result<StreamId, FeedError> {
        self.ask(id, |reply| PusherMessage::Initialize { item, reply }).await?
    }

    pub async fn start(&self, id: &PusherId) -> Result<(), FeedError> {
        self.ask(id, |reply| PusherMessage::Start { reply }).await?
    }

    pub async fn stop(&self, id: &PusherId) -> Result<(), FeedError> {
        self.ask(id, |reply| PusherMessage::Stop { reply }).await?
    }

    pub async fn push_token(&self, id: &PusherId) -> Result<Uuid, FeedError> {
        self.ask(id, |reply| PusherMessage::GetPushToken { reply }).await
    }

    pub async fn message_stream_id(&self, id: &PusherId) -> Result<Option<StreamId>, FeedError> {
        self.ask(id, |reply| PusherMessage::GetMessageStreamId { reply }).await
    }

    pub async fn is_running(&self, id: &PusherId, token: Uuid) -> Result<bool, FeedError> {
        self.ask(id, |reply| PusherMessage::IsRunning { token, reply }).await
    }

    pub async fn state(&self, id: &PusherId) -> Result<PusherState, FeedError> {
        self.ask(id, |reply| PusherMessage::GetState { reply }).await
    }

    /// Fire-and-forget delivery of newly confirmed blocks.
    pub fn notify_confirmed(&self, id: &PusherId, blocks: Vec<Block>) -> Result<(), FeedError> {
        self.tell(id, PusherMessage::NewConfirmedBlocks { blocks })
    }

    /// Fire-and-forget delivery of accepted, unconfirmed blocks.
    pub fn notify_new(&self, id: &PusherId, blocks: Vec<Block>) -> Result<(), FeedError> {
        self.tell(id, PusherMessage::NewBlocks { blocks })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chainfeed_core::manifest::LogEventCondition;
    use chainfeed_core::store::MemoryStateStore;
    use chainfeed_core::subscription::VersionId;
    use chainfeed_core::types::{LogEvent, Transaction};
    use tokio::sync::broadcast;

    use crate::bus::InMemoryBus;
    use crate::source::MemoryBlockSource;

    fn block(n: u64, lib: u64, confirmed: bool) -> Block {
        Block {
            chain_id: "AELF".into(),
            block_hash: format!("0x{n}"),
            block_number: n,
            previous_block_hash: format!("0x{}", n.saturating_sub(1)),
            lib_block_number: lib,
            is_confirmed: confirmed,
            block_time: 0,
            transactions: vec![Transaction {
                transaction_id: format!("tx{n}"),
                from: "Caller".into(),
                to: "Token".into(),
                method_name: "Transfer".into(),
                index: 0,
                log_events: vec![LogEvent {
                    contract_address: "Token".into(),
                    event_name: if n % 2 == 0 { "Transferred" } else { "Burned" }.into(),
                    index: 0,
                }],
            }],
        }
    }

    struct Harness {
        pushers: ActorDirectory<PusherActor>,
        bus: Arc<InMemoryBus>,
        source: Arc<MemoryBlockSource>,
        id: PusherId,
    }

    fn harness(batch: u64) -> Harness {
        let bus = Arc::new(InMemoryBus::new(64));
        let source = Arc::new(MemoryBlockSource::new());
        let config = FeedConfig {
            catch_up_batch_size: batch,
            catch_up_retry_ms: 10,
            ..FeedConfig::default()
        };
        let deps = PusherDeps {
            store: Arc::new(MemoryStateStore::new()),
            bus: Arc::clone(&bus) as Arc<dyn MessageBus>,
            source: Arc::clone(&source) as Arc<dyn BlockSource>,
            config,
        };
        Harness {
            pushers: ActorDirectory::new(deps, Duration::from_secs(60)),
            bus,
            source,
            id: PusherId::new("app", VersionId(1), "AELF"),
        }
    }

    async fn next_push(rx: &mut broadcast::Receiver<PushMessage>) -> PushMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("push timed out")
            .expect("stream closed")
    }

    fn numbers(message: &PushMessage) -> Vec<u64> {
        message.blocks.iter().map(|b| b.block_number).collect()
    }

    #[tokio::test]
    async fn initialize_allocates_stream_once() {
        let h = harness(10);
        let first = h.pushers.initialize(&h.id, SubscriptionItem::new("AELF", 1)).await.unwrap();
        let again = h.pushers.initialize(&h.id, SubscriptionItem::new("AELF", 1).only_confirmed()).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(h.bus.stream_count(), 1);
        assert!(h.pushers.state(&h.id).await.unwrap().item.unwrap().only_confirmed);

        let wrong_chain = h.pushers.initialize(&h.id, SubscriptionItem::new("tDVV", 1)).await;
        assert!(matches!(wrong_chain, Err(FeedError::InvalidManifest(_))));
    }

    #[tokio::test]
    async fn live_pusher_delivers_contiguous_confirmed_blocks() {
        let h = harness(10);
        let stream = h.pushers.initialize(&h.id, SubscriptionItem::new("AELF", 1)).await.unwrap();
        let mut rx = h.bus.subscribe(stream).unwrap();
        h.pushers.start(&h.id).await.unwrap();
        assert_eq!(h.pushers.state(&h.id).await.unwrap().mode, ScanMode::Live);

        let confirmed: Vec<Block> = (0..=3).map(|n| block(n, 0, true)).collect();
        h.pushers.notify_confirmed(&h.id, confirmed).unwrap();
        assert_eq!(numbers(&next_push(&mut rx).await), vec![1, 2, 3]);

        // Overlap with the previous frontier is skipped
        h.pushers.notify_confirmed(&h.id, vec![block(3, 0, true), block(4, 0, true)]).unwrap();
        let message = next_push(&mut rx).await;
        assert_eq!(numbers(&message), vec![4]);
        assert_eq!(message.mode, ScanMode::Live);
        assert_eq!(message.push_token, h.pushers.push_token(&h.id).await.unwrap());

        // Unconfirmed blocks are pushed without moving the cursor
        h.pushers.notify_new(&h.id, vec![block(5, 0, false)]).unwrap();
        assert_eq!(numbers(&next_push(&mut rx).await), vec![5]);
        assert_eq!(h.pushers.state(&h.id).await.unwrap().cursor.block_number, Some(4));
    }

    #[tokio::test]
    async fn only_confirmed_items_skip_unconfirmed_blocks() {
        let h = harness(10);
        let item = SubscriptionItem::new("AELF", 1)
            .only_confirmed()
            .log_event(LogEventCondition::contract("Token").event("Transferred"));
        let stream = h.pushers.initialize(&h.id, item).await.unwrap();
        let mut rx = h.bus.subscribe(stream).unwrap();
        h.pushers.start(&h.id).await.unwrap();

        h.pushers.notify_new(&h.id, vec![block(1, 0, false)]).unwrap();
        h.pushers
            .notify_confirmed(&h.id, (1..=4).map(|n| block(n, 0, true)).collect())
            .unwrap();
        // Only even blocks carry the wanted event
        assert_eq!(numbers(&next_push(&mut rx).await), vec![2, 4]);
    }

    #[tokio::test]
    async fn historical_catch_up_then_live() {
        let h = harness(3);
        // Best height 10, confirmed height 8
        h.source.push_blocks((1..=10).map(|n| block(n, n.saturating_sub(2), false)));

        let stream = h.pushers.initialize(&h.id, SubscriptionItem::new("AELF", 1)).await.unwrap();
        let mut rx = h.bus.subscribe(stream).unwrap();
        h.pushers.start(&h.id).await.unwrap();

        assert_eq!(numbers(&next_push(&mut rx).await), vec![1, 2, 3]);
        assert_eq!(numbers(&next_push(&mut rx).await), vec![4, 5, 6]);
        let last = next_push(&mut rx).await;
        assert_eq!(numbers(&last), vec![7, 8]);
        assert_eq!(last.mode, ScanMode::Historical);
        assert!(last.blocks.iter().all(|b| b.is_confirmed));

        let state = h.pushers.state(&h.id).await.unwrap();
        assert_eq!(state.mode, ScanMode::Live);
        assert_eq!(state.cursor.block_number, Some(8));

        h.pushers.notify_confirmed(&h.id, vec![block(9, 7, true)]).unwrap();
        assert_eq!(numbers(&next_push(&mut rx).await), vec![9]);
    }

    #[tokio::test]
    async fn gap_falls_back_to_catch_up() {
        let h = harness(10);
        let stream = h.pushers.initialize(&h.id, SubscriptionItem::new("AELF", 1)).await.unwrap();
        let mut rx = h.bus.subscribe(stream).unwrap();
        h.pushers.start(&h.id).await.unwrap();

        h.pushers.notify_confirmed(&h.id, vec![block(1, 0, true)]).unwrap();
        assert_eq!(numbers(&next_push(&mut rx).await), vec![1]);

        // Blocks 2-5 were never notified; the source has them
        h.source.push_blocks((1..=6).map(|n| block(n, 5, false)));
        h.pushers.notify_confirmed(&h.id, vec![block(5, 0, true)]).unwrap();
        assert_eq!(numbers(&next_push(&mut rx).await), vec![2, 3, 4, 5]);

        let state = h.pushers.state(&h.id).await.unwrap();
        assert_eq!(state.mode, ScanMode::Live);
        assert_eq!(state.cursor.block_number, Some(5));
    }

    #[tokio::test]
    async fn source_errors_are_retried() {
        let h = harness(100);
        h.source.push_blocks((1..=5).map(|n| block(n, 4, false)));
        let stream = h.pushers.initialize(&h.id, SubscriptionItem::new("AELF", 1)).await.unwrap();
        let mut rx = h.bus.subscribe(stream).unwrap();

        // Start's height probe and the first catch-up step both fail
        h.source.fail_next(2);
        h.pushers.start(&h.id).await.unwrap();
        assert_eq!(numbers(&next_push(&mut rx).await), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn stop_rotates_token_and_cancels_catch_up() {
        let h = harness(1);
        h.source.push_blocks((1..=50).map(|n| block(n, 49, false)));
        let stream = h.pushers.initialize(&h.id, SubscriptionItem::new("AELF", 1)).await.unwrap();
        let mut rx = h.bus.subscribe(stream).unwrap();

        h.pushers.start(&h.id).await.unwrap();
        let token = h.pushers.push_token(&h.id).await.unwrap();
        assert!(h.pushers.is_running(&h.id, token).await.unwrap());

        h.pushers.stop(&h.id).await.unwrap();
        assert!(!h.pushers.is_running(&h.id, token).await.unwrap());
        let rotated = h.pushers.push_token(&h.id).await.unwrap();
        assert_ne!(rotated, token);
        assert!(!h.pushers.is_running(&h.id, rotated).await.unwrap());

        // Whatever was pushed before the stop, nothing follows it
        let state = h.pushers.state(&h.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.pushers.state(&h.id).await.unwrap().cursor, state.cursor);
        assert!(!state.running);
        while let Ok(message) = rx.try_recv() {
            assert_eq!(message.push_token, token);
        }
        assert_eq!(h.pushers.message_stream_id(&h.id).await.unwrap(), Some(stream));
    }
}
