//! `ChainFeed` — the service boundary over the four actor kinds.
//!
//! ```text
//! ingest_block(s) ──► LedgerActor ──confirmed──► RegistryActor ══► PusherActor* ──► MessageBus
//! add/start/pause…──► AppActor ──► RegistryActor, PusherActor
//! ```
//!
//! Ledgers are addressed by (chain, anchor hash). The feed remembers which
//! ledger serves a chain and persists that route, so a restart picks up the
//! same ledger.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chainfeed_core::error::FeedError;
use chainfeed_core::keys::{AppId, LedgerKey, PusherId, RegistryKey};
use chainfeed_core::manifest::SubscriptionManifest;
use chainfeed_core::store::{load_state, save_state, StateStore};
use chainfeed_core::subscription::{AppSubscription, SubscriptionStatus, VersionId};
use chainfeed_core::types::{Block, ChainId};

use crate::actor::ActorDirectory;
use crate::app_actor::{AppActor, AppDeps, AppMessage};
use crate::bus::{MessageBus, StreamId};
use crate::config::FeedConfig;
use crate::ledger_actor::{LedgerActor, LedgerStatus, Recorded};
use crate::pusher::{PusherActor, PusherDeps};
use crate::registry::{ActivePushers, RegistryActor, RegistryDeps};
use crate::source::BlockSource;

const ROUTE_KIND: &str = "ledger-route";

/// Result of ingesting blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Everything was at or below the confirmed height; nothing changed.
    Stale,
    /// Blocks were recorded. `confirmed` lists the newly irreversible blocks
    /// in ascending order (empty when nothing was confirmed).
    Accepted { confirmed: Vec<Block> },
}

impl IngestOutcome {
    pub fn confirmed(&self) -> &[Block] {
        match self {
            Self::Stale => &[],
            Self::Accepted { confirmed } => confirmed,
        }
    }
}

/// The coordination layer: chain ledgers, app subscriptions and pushers.
pub struct ChainFeed {
    config: FeedConfig,
    store: Arc<dyn StateStore>,
    ledgers: ActorDirectory<LedgerActor>,
    apps: ActorDirectory<AppActor>,
    pushers: ActorDirectory<PusherActor>,
    registry: ActorDirectory<RegistryActor>,
    routes: Mutex<HashMap<ChainId, LedgerKey>>,
    audit_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChainFeed {
    /// Create a feed. Spawns the periodic audit when `audit_interval_ms` is
    /// set, so that case needs a Tokio runtime.
    pub fn new(
        config: FeedConfig,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn MessageBus>,
        source: Arc<dyn BlockSource>,
    ) -> Self {
        let idle = config.idle_timeout();
        let pushers: ActorDirectory<PusherActor> = ActorDirectory::new(
            PusherDeps {
                store: Arc::clone(&store),
                bus,
                source,
                config: config.clone(),
            },
            idle,
        );
        let registry: ActorDirectory<RegistryActor> = ActorDirectory::new(
            RegistryDeps {
                store: Arc::clone(&store),
                pushers: pushers.clone(),
            },
            idle,
        );
        let apps: ActorDirectory<AppActor> = ActorDirectory::new(
            AppDeps {
                store: Arc::clone(&store),
                pushers: pushers.clone(),
                registry: registry.clone(),
                config: config.clone(),
            },
            idle,
        );
        let ledgers: ActorDirectory<LedgerActor> = ActorDirectory::new(Arc::clone(&store), idle);

        let audit_task = config.audit_interval().map(|interval| {
            let apps = apps.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = audit_registry(&apps, &registry).await {
                        warn!(error = %e, "periodic registry audit failed");
                    }
                }
            })
        });

        info!(
            idle_timeout_ms = config.idle_timeout_ms,
            catch_up_batch_size = config.catch_up_batch_size,
            "chain feed created"
        );
        Self {
            config,
            store,
            ledgers,
            apps,
            pushers,
            registry,
            routes: Mutex::new(HashMap::new()),
            audit_task: Mutex::new(audit_task),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    // ─── Subscriptions ──────────────────────────────────────────────────────

    /// Attach a manifest as a new version of `app_id`.
    pub async fn add_subscription(&self, app_id: &str, manifest: SubscriptionManifest) -> Result<VersionId, FeedError> {
        self.apps
            .ask(&app_id.to_string(), |reply| AppMessage::Add { manifest, reply })
            .await?
    }

    /// Replace the manifest of an existing version.
    pub async fn update_subscription(
        &self,
        app_id: &str,
        version: VersionId,
        manifest: SubscriptionManifest,
    ) -> Result<(), FeedError> {
        self.apps
            .ask(&app_id.to_string(), |reply| AppMessage::Update { version, manifest, reply })
            .await?
    }

    /// Promote the pending version to current.
    pub async fn upgrade_version(&self, app_id: &str) -> Result<(), FeedError> {
        self.apps
            .ask(&app_id.to_string(), |reply| AppMessage::Upgrade { reply })
            .await?
    }

    pub async fn start_scan(&self, app_id: &str, version: VersionId) -> Result<(), FeedError> {
        self.apps
            .ask(&app_id.to_string(), |reply| AppMessage::Start { version, reply })
            .await?
    }

    pub async fn pause(&self, app_id: &str, version: VersionId) -> Result<(), FeedError> {
        self.apps
            .ask(&app_id.to_string(), |reply| AppMessage::Pause { version, reply })
            .await?
    }

    pub async fn stop(&self, app_id: &str, version: VersionId) -> Result<(), FeedError> {
        self.apps
            .ask(&app_id.to_string(), |reply| AppMessage::Stop { version, reply })
            .await?
    }

    pub async fn get_subscription(&self, app_id: &str) -> Result<AppSubscription, FeedError> {
        self.apps
            .ask(&app_id.to_string(), |reply| AppMessage::GetSubscription { reply })
            .await
    }

    /// Status of `version`. A version that is not running has its pushers
    /// removed from the registry on the way.
    pub async fn get_subscription_status(&self, app_id: &str, version: VersionId) -> Result<SubscriptionStatus, FeedError> {
        self.apps
            .ask(&app_id.to_string(), |reply| AppMessage::Status {
                version,
                repair: true,
                reply,
            })
            .await?
    }

    /// Transport streams of every chain of `version`, in manifest order.
    pub async fn get_message_stream_ids(&self, app_id: &str, version: VersionId) -> Result<Vec<StreamId>, FeedError> {
        self.apps
            .ask(&app_id.to_string(), |reply| AppMessage::StreamIds { version, reply })
            .await?
    }

    /// Current push token of one pusher.
    pub async fn get_push_token(&self, app_id: &str, version: VersionId, chain_id: &str) -> Result<Uuid, FeedError> {
        let chain_id = chain_id.to_string();
        self.apps
            .ask(&app_id.to_string(), |reply| AppMessage::PushToken {
                version,
                chain_id,
                reply,
            })
            .await?
    }

    /// Whether the pusher is registered, running, and still on `token`.
    /// A stale token is a plain `false`.
    pub async fn is_running(&self, chain_id: &str, app_id: &str, version: VersionId, token: Uuid) -> Result<bool, FeedError> {
        let id = PusherId::new(app_id, version, chain_id);
        if !self.registry.contains(&id).await? {
            return Ok(false);
        }
        self.pushers.is_running(&id, token).await
    }

    /// Registered pushers by chain.
    pub async fn get_all_active_pusher_ids(&self) -> Result<ActivePushers, FeedError> {
        self.registry.active_pushers().await
    }

    // ─── Blocks ─────────────────────────────────────────────────────────────

    /// Record one block and fan out what it accepted and confirmed.
    pub async fn ingest_block(&self, block: Block) -> Result<IngestOutcome, FeedError> {
        let chain_id = block.chain_id.clone();
        let key = self.ledger_key(&chain_id, &block.block_hash).await?;
        let recorded = self.ledgers.record_block(&key, block, true).await;
        self.dispatch(&chain_id, recorded)
    }

    /// Record a batch of consecutive blocks of `chain_id` atomically.
    pub async fn ingest_blocks(&self, chain_id: &str, blocks: Vec<Block>) -> Result<IngestOutcome, FeedError> {
        let Some(first) = blocks.first() else {
            return Ok(IngestOutcome::Accepted { confirmed: vec![] });
        };
        if let Some(foreign) = blocks.iter().find(|b| b.chain_id != chain_id) {
            return Err(FeedError::Source(format!(
                "block {} of chain '{}' in a batch for '{chain_id}'",
                foreign.block_number, foreign.chain_id
            )));
        }
        let key = self.ledger_key(chain_id, &first.block_hash).await?;
        let recorded = self.ledgers.record_blocks(&key, blocks).await;
        self.dispatch(chain_id, recorded)
    }

    /// Heights of the ledger serving `chain_id`, if the chain was ever ingested.
    pub async fn ledger_status(&self, chain_id: &str) -> Result<Option<LedgerStatus>, FeedError> {
        match self.route(chain_id).await? {
            Some(key) => self.ledgers.status(&key).await.map(Some),
            None => Ok(None),
        }
    }

    fn dispatch(&self, chain_id: &str, recorded: Result<Recorded, FeedError>) -> Result<IngestOutcome, FeedError> {
        let recorded = match recorded {
            Ok(recorded) => recorded,
            Err(e) if e.is_stale() => {
                debug!(chain = chain_id, error = %e, "stale block ignored");
                return Ok(IngestOutcome::Stale);
            }
            Err(e) => return Err(e),
        };

        let unconfirmed: Vec<Block> = recorded.accepted.into_iter().filter(|b| !b.is_confirmed).collect();
        if !unconfirmed.is_empty() {
            self.registry.notify_new(chain_id, unconfirmed)?;
        }
        if !recorded.confirmed.is_empty() {
            self.registry.notify_confirmed(chain_id, recorded.confirmed.clone())?;
        }
        Ok(IngestOutcome::Accepted {
            confirmed: recorded.confirmed,
        })
    }

    async fn route(&self, chain_id: &str) -> Result<Option<LedgerKey>, FeedError> {
        if let Some(key) = self.lock_routes().get(chain_id) {
            return Ok(Some(key.clone()));
        }
        let stored = load_state::<LedgerKey>(self.store.as_ref(), ROUTE_KIND, chain_id).await?;
        if let Some(key) = &stored {
            self.lock_routes()
                .entry(chain_id.to_string())
                .or_insert_with(|| key.clone());
        }
        Ok(stored)
    }

    /// The ledger serving `chain_id`, anchored at `anchor_hash` if new.
    async fn ledger_key(&self, chain_id: &str, anchor_hash: &str) -> Result<LedgerKey, FeedError> {
        if let Some(key) = self.route(chain_id).await? {
            return Ok(key);
        }
        let key = self
            .lock_routes()
            .entry(chain_id.to_string())
            .or_insert_with(|| LedgerKey::new(chain_id, anchor_hash))
            .clone();
        save_state(self.store.as_ref(), ROUTE_KIND, chain_id, &key).await?;
        info!(chain = chain_id, ledger = %key, "ledger anchored");
        Ok(key)
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, HashMap<ChainId, LedgerKey>> {
        self.routes.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ─── Maintenance ────────────────────────────────────────────────────────

    /// Remove registry entries whose version is not Started. Returns the
    /// number of entries removed.
    pub async fn audit(&self) -> Result<usize, FeedError> {
        audit_registry(&self.apps, &self.registry).await
    }

    /// Stop the audit task and every live actor.
    pub async fn shutdown(&self) {
        let audit_task = self
            .audit_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = audit_task {
            task.abort();
        }
        self.apps.shutdown().await;
        self.registry.shutdown().await;
        self.pushers.shutdown().await;
        self.ledgers.shutdown().await;
        info!("chain feed shut down");
    }
}

async fn audit_registry(
    apps: &ActorDirectory<AppActor>,
    registry: &ActorDirectory<RegistryActor>,
) -> Result<usize, FeedError> {
    let active = registry.active_pushers().await?;
    let mut by_version: BTreeMap<(AppId, VersionId), Vec<PusherId>> = BTreeMap::new();
    for id in active.into_values().flatten() {
        by_version
            .entry((id.app_id.clone(), id.version))
            .or_default()
            .push(id);
    }

    let mut removed = 0;
    for ((app_id, version), registered) in by_version {
        removed += apps.reconcile(&app_id, version, registered).await?;
    }
    if removed > 0 {
        warn!(pushers = removed, registry = %RegistryKey, "registry drift repaired");
    }
    Ok(removed)
}
