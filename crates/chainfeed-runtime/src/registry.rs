//! Pusher registry — the global index of running pushers by chain.
//!
//! The registry is the only writer of its chain → pusher-id sets. New-block
//! notifications for a chain are fanned out to every registered pusher with
//! fire-and-forget sends, so the registry never waits on a pusher.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use chainfeed_core::error::FeedError;
use chainfeed_core::keys::{PusherId, RegistryKey, StateKey};
use chainfeed_core::store::{load_state, save_state, StateStore};
use chainfeed_core::types::{Block, ChainId};

use crate::actor::{Actor, ActorDirectory, Context};
use crate::pusher::PusherActor;

/// Collaborators of the registry.
#[derive(Clone)]
pub struct RegistryDeps {
    pub store: Arc<dyn StateStore>,
    pub pushers: ActorDirectory<PusherActor>,
}

/// Active pusher ids per chain.
pub type ActivePushers = BTreeMap<ChainId, BTreeSet<PusherId>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct RegistryState {
    pushers: ActivePushers,
}

pub enum RegistryMessage {
    Add {
        ids: Vec<PusherId>,
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    Remove {
        ids: Vec<PusherId>,
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    Contains {
        id: PusherId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<ActivePushers>,
    },
    NotifyConfirmed {
        chain_id: ChainId,
        blocks: Vec<Block>,
    },
    NotifyNew {
        chain_id: ChainId,
        blocks: Vec<Block>,
    },
}

pub struct RegistryActor {
    state: RegistryState,
    deps: RegistryDeps,
}

impl RegistryActor {
    async fn commit(&mut self, next: RegistryState) -> Result<(), FeedError> {
        if next != self.state {
            save_state(self.deps.store.as_ref(), Self::KIND, &RegistryKey.storage_key(), &next).await?;
            self.state = next;
        }
        Ok(())
    }

    async fn add(&mut self, ids: Vec<PusherId>) -> Result<(), FeedError> {
        let mut next = self.state.clone();
        for id in ids {
            next.pushers.entry(id.chain_id.clone()).or_default().insert(id);
        }
        self.commit(next).await
    }

    async fn remove(&mut self, ids: Vec<PusherId>) -> Result<(), FeedError> {
        let mut next = self.state.clone();
        for id in &ids {
            if let Some(bucket) = next.pushers.get_mut(&id.chain_id) {
                bucket.remove(id);
            }
        }
        self.commit(next).await
    }

    fn fan_out(&self, chain_id: &str, blocks: Vec<Block>, confirmed: bool) {
        let Some(ids) = self.state.pushers.get(chain_id) else {
            return;
        };
        if ids.is_empty() || blocks.is_empty() {
            return;
        }
        debug!(chain = chain_id, pushers = ids.len(), blocks = blocks.len(), confirmed, "fan-out");
        for id in ids {
            let sent = if confirmed {
                self.deps.pushers.notify_confirmed(id, blocks.clone())
            } else {
                self.deps.pushers.notify_new(id, blocks.clone())
            };
            if let Err(e) = sent {
                warn!(pusher = %id, error = %e, "notification dropped");
            }
        }
    }
}

#[async_trait]
impl Actor for RegistryActor {
    type Key = RegistryKey;
    type Message = RegistryMessage;
    type Deps = RegistryDeps;

    const KIND: &'static str = "registry";

    async fn activate(key: &RegistryKey, deps: &RegistryDeps) -> Result<Self, FeedError> {
        let state = load_state::<RegistryState>(deps.store.as_ref(), Self::KIND, &key.storage_key())
            .await?
            .unwrap_or_default();
        Ok(Self {
            state,
            deps: deps.clone(),
        })
    }

    async fn handle(&mut self, message: RegistryMessage, _ctx: &Context<Self>) {
        match message {
            RegistryMessage::Add { ids, reply } => {
                let _ = reply.send(self.add(ids).await);
            }
            RegistryMessage::Remove { ids, reply } => {
                let _ = reply.send(self.remove(ids).await);
            }
            RegistryMessage::Contains { id, reply } => {
                let found = self
                    .state
                    .pushers
                    .get(&id.chain_id)
                    .is_some_and(|bucket| bucket.contains(&id));
                let _ = reply.send(found);
            }
            RegistryMessage::Snapshot { reply } => {
                let _ = reply.send(self.state.pushers.clone());
            }
            RegistryMessage::NotifyConfirmed { chain_id, blocks } => self.fan_out(&chain_id, blocks, true),
            RegistryMessage::NotifyNew { chain_id, blocks } => self.fan_out(&chain_id, blocks, false),
        }
    }
}

// ─── Typed calls ──────────────────────────────────────────────────────────────

impl ActorDirectory<RegistryActor> {
    /// Register pushers under their chains. Idempotent.
    pub async fn add_pushers(&self, ids: Vec<PusherId>) -> Result<(), FeedError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.ask(&RegistryKey, |reply| RegistryMessage::Add { ids, reply }).await?
    }

    /// Unregister pushers. Idempotent.
    pub async fn remove_pushers(&self, ids: Vec<PusherId>) -> Result<(), FeedError> {
        if ids.is_empty() {
            return Ok(());
        }
        let count = ids.len();
        self.ask(&RegistryKey, |reply| RegistryMessage::Remove { ids, reply })
            .await??;
        info!(pushers = count, "pushers unregistered");
        Ok(())
    }

    pub async fn contains(&self, id: &PusherId) -> Result<bool, FeedError> {
        let id = id.clone();
        self.ask(&RegistryKey, |reply| RegistryMessage::Contains { id, reply }).await
    }

    /// Snapshot of active pusher ids, including empty chain buckets.
    pub async fn active_pushers(&self) -> Result<ActivePushers, FeedError> {
        self.ask(&RegistryKey, |reply| RegistryMessage::Snapshot { reply }).await
    }

    pub fn notify_confirmed(&self, chain_id: &str, blocks: Vec<Block>) -> Result<(), FeedError> {
        self.tell(
            &RegistryKey,
            RegistryMessage::NotifyConfirmed {
                chain_id: chain_id.to_string(),
                blocks,
            },
        )
    }

    pub fn notify_new(&self, chain_id: &str, blocks: Vec<Block>) -> Result<(), FeedError> {
        self.tell(
            &RegistryKey,
            RegistryMessage::NotifyNew {
                chain_id: chain_id.to_string(),
                blocks,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chainfeed_core::manifest::SubscriptionItem;
    use chainfeed_core::store::MemoryStateStore;
    use chainfeed_core::subscription::VersionId;

    use crate::bus::{InMemoryBus, MessageBus};
    use crate::config::FeedConfig;
    use crate::pusher::PusherDeps;
    use crate::source::{BlockSource, MemoryBlockSource};

    fn setup(store: Arc<MemoryStateStore>) -> (ActorDirectory<RegistryActor>, ActorDirectory<PusherActor>, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new(16));
        let pushers: ActorDirectory<PusherActor> = ActorDirectory::new(
            PusherDeps {
                store: Arc::clone(&store) as Arc<dyn StateStore>,
                bus: Arc::clone(&bus) as Arc<dyn MessageBus>,
                source: Arc::new(MemoryBlockSource::new()) as Arc<dyn BlockSource>,
                config: FeedConfig::default(),
            },
            Duration::from_secs(60),
        );
        let registry = ActorDirectory::new(
            RegistryDeps {
                store: store as Arc<dyn StateStore>,
                pushers: pushers.clone(),
            },
            Duration::from_secs(60),
        );
        (registry, pushers, bus)
    }

    fn id(app: &str, version: u64, chain: &str) -> PusherId {
        PusherId::new(app, VersionId(version), chain)
    }

    #[tokio::test]
    async fn add_remove_is_idempotent_and_keeps_buckets() {
        let (registry, _, _) = setup(Arc::new(MemoryStateStore::new()));
        let a = id("app", 1, "AELF");
        let b = id("app", 1, "tDVV");

        registry.add_pushers(vec![a.clone(), b.clone()]).await.unwrap();
        registry.add_pushers(vec![a.clone()]).await.unwrap();
        let active = registry.active_pushers().await.unwrap();
        assert_eq!(active["AELF"].len(), 1);
        assert_eq!(active["tDVV"].len(), 1);
        assert!(registry.contains(&a).await.unwrap());

        registry.remove_pushers(vec![a.clone()]).await.unwrap();
        registry.remove_pushers(vec![a.clone()]).await.unwrap();
        let active = registry.active_pushers().await.unwrap();
        assert!(active["AELF"].is_empty());
        assert!(!registry.contains(&a).await.unwrap());
    }

    #[tokio::test]
    async fn registry_state_is_persisted() {
        let store = Arc::new(MemoryStateStore::new());
        let (registry, _, _) = setup(Arc::clone(&store));
        registry.add_pushers(vec![id("app", 2, "AELF")]).await.unwrap();
        registry.shutdown().await;

        let (registry, _, _) = setup(store);
        assert!(registry.contains(&id("app", 2, "AELF")).await.unwrap());
    }

    #[tokio::test]
    async fn fan_out_reaches_registered_pushers_of_the_chain() {
        let (registry, pushers, bus) = setup(Arc::new(MemoryStateStore::new()));
        let aelf = id("app", 1, "AELF");
        let other = id("other", 1, "tDVV");

        let stream = pushers.initialize(&aelf, SubscriptionItem::new("AELF", 1)).await.unwrap();
        let other_stream = pushers.initialize(&other, SubscriptionItem::new("tDVV", 1)).await.unwrap();
        let mut rx = bus.subscribe(stream).unwrap();
        let mut other_rx = bus.subscribe(other_stream).unwrap();
        pushers.start(&aelf).await.unwrap();
        pushers.start(&other).await.unwrap();
        registry.add_pushers(vec![aelf.clone(), other.clone()]).await.unwrap();

        let block = Block {
            chain_id: "AELF".into(),
            block_hash: "0x1".into(),
            block_number: 1,
            previous_block_hash: "0x0".into(),
            lib_block_number: 0,
            is_confirmed: true,
            block_time: 0,
            transactions: vec![],
        };
        registry.notify_confirmed("AELF", vec![block]).unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(message.blocks[0].block_number, 1);

        // Round-trip through both actors so any stray push would have landed
        registry.active_pushers().await.unwrap();
        pushers.state(&other).await.unwrap();
        assert!(other_rx.try_recv().is_err());
    }
}
