//! App subscription actor — drives one app's version slots.
//!
//! The actor owns an [`AppSubscriptionState`] and keeps the pushers and the
//! registry in step with it. Each operation first commits the new state,
//! then issues the pusher and registry calls for every chain of the affected
//! version within the same turn:
//!
//! | operation | pushers                    | registry          |
//! |-----------|----------------------------|-------------------|
//! | add       | initialise (stream ids)    | –                 |
//! | start     | start                      | add               |
//! | pause     | stop (token rotates)       | remove            |
//! | stop      | stop                       | remove            |
//! | upgrade   | stop the retired version   | remove retired    |

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chainfeed_core::error::FeedError;
use chainfeed_core::keys::{AppId, PusherId, StateKey};
use chainfeed_core::manifest::SubscriptionManifest;
use chainfeed_core::store::{load_state, save_state, StateStore};
use chainfeed_core::subscription::{
    AppSubscription, AppSubscriptionState, SubscriptionStatus, SubscriptionVersion, VersionId,
};

use crate::actor::{Actor, ActorDirectory, Context};
use crate::bus::StreamId;
use crate::config::FeedConfig;
use crate::pusher::PusherActor;
use crate::registry::RegistryActor;

/// Collaborators of every app actor.
#[derive(Clone)]
pub struct AppDeps {
    pub store: Arc<dyn StateStore>,
    pub pushers: ActorDirectory<PusherActor>,
    pub registry: ActorDirectory<RegistryActor>,
    pub config: FeedConfig,
}

pub enum AppMessage {
    Add {
        manifest: SubscriptionManifest,
        reply: oneshot::Sender<Result<VersionId, FeedError>>,
    },
    Update {
        version: VersionId,
        manifest: SubscriptionManifest,
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    Upgrade {
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    Start {
        version: VersionId,
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    Pause {
        version: VersionId,
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    Stop {
        version: VersionId,
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
    GetSubscription {
        reply: oneshot::Sender<AppSubscription>,
    },
    Status {
        version: VersionId,
        /// Unregister the version's pushers if it is not running.
        repair: bool,
        reply: oneshot::Sender<Result<SubscriptionStatus, FeedError>>,
    },
    StreamIds {
        version: VersionId,
        reply: oneshot::Sender<Result<Vec<StreamId>, FeedError>>,
    },
    PushToken {
        version: VersionId,
        chain_id: String,
        reply: oneshot::Sender<Result<Uuid, FeedError>>,
    },
    /// Drop the ids in `registered` this app no longer wants active.
    /// Replies with how many were removed.
    Reconcile {
        version: VersionId,
        registered: Vec<PusherId>,
        reply: oneshot::Sender<Result<usize, FeedError>>,
    },
}

pub struct AppActor {
    app_id: AppId,
    state: AppSubscriptionState,
    deps: AppDeps,
}

impl AppActor {
    async fn commit(&mut self, next: AppSubscriptionState) -> Result<(), FeedError> {
        save_state(self.deps.store.as_ref(), Self::KIND, &self.app_id.storage_key(), &next).await?;
        self.state = next;
        Ok(())
    }

    fn pusher_id(&self, version: VersionId, chain_id: &str) -> PusherId {
        PusherId::new(self.app_id.clone(), version, chain_id)
    }

    fn pusher_ids(&self, version: &SubscriptionVersion) -> Vec<PusherId> {
        version
            .manifest
            .chain_ids()
            .map(|chain| self.pusher_id(version.version, chain))
            .collect()
    }

    fn live_version(&self, version: VersionId) -> Result<&SubscriptionVersion, FeedError> {
        self.state.version(version).ok_or_else(|| FeedError::VersionNotFound {
            app_id: self.app_id.clone(),
            version,
        })
    }

    // ─── Pusher / registry effects ──────────────────────────────────────────

    async fn initialize_pushers(&self, version: VersionId, manifest: &SubscriptionManifest) -> Result<(), FeedError> {
        let pushers = &self.deps.pushers;
        try_join_all(manifest.items.iter().map(|item| {
            let id = self.pusher_id(version, &item.chain_id);
            let item = item.clone();
            async move { pushers.initialize(&id, item).await }
        }))
        .await?;
        Ok(())
    }

    async fn activate_pushers(&self, ids: Vec<PusherId>) -> Result<(), FeedError> {
        let pushers = &self.deps.pushers;
        try_join_all(ids.iter().map(|id| pushers.start(id))).await?;
        self.deps.registry.add_pushers(ids).await
    }

    async fn deactivate_pushers(&self, ids: Vec<PusherId>) -> Result<(), FeedError> {
        self.deps.registry.remove_pushers(ids.clone()).await?;
        let pushers = &self.deps.pushers;
        try_join_all(ids.iter().map(|id| pushers.stop(id))).await?;
        Ok(())
    }

    // ─── Operations ─────────────────────────────────────────────────────────

    async fn add(&mut self, manifest: SubscriptionManifest) -> Result<VersionId, FeedError> {
        let mut next = self.state.clone();
        let added = next.add(manifest.clone(), self.deps.config.replace_pending_version)?;
        self.commit(next).await?;
        info!(app = %self.app_id, version = %added.version, "subscription version added");

        if let Some(replaced) = &added.replaced {
            warn!(app = %self.app_id, replaced = %replaced.version, by = %added.version, "pending version replaced");
            self.deactivate_pushers(self.pusher_ids(replaced)).await?;
        }
        self.initialize_pushers(added.version, &manifest).await?;
        Ok(added.version)
    }

    async fn update(&mut self, version: VersionId, manifest: SubscriptionManifest) -> Result<(), FeedError> {
        let mut next = self.state.clone();
        let previous = next.update_manifest(version, manifest.clone())?;
        self.commit(next).await?;
        info!(app = %self.app_id, %version, "subscription manifest updated");

        let kept: BTreeSet<&str> = manifest.chain_ids().map(String::as_str).collect();
        let had: BTreeSet<&str> = previous.manifest.chain_ids().map(String::as_str).collect();
        let removed: Vec<PusherId> = had
            .difference(&kept)
            .map(|chain| self.pusher_id(version, chain))
            .collect();
        let added: Vec<PusherId> = kept
            .difference(&had)
            .map(|chain| self.pusher_id(version, chain))
            .collect();

        self.deactivate_pushers(removed).await?;
        self.initialize_pushers(version, &manifest).await?;
        if previous.status == SubscriptionStatus::Started {
            self.activate_pushers(added).await?;
        }
        Ok(())
    }

    async fn upgrade(&mut self) -> Result<(), FeedError> {
        let mut next = self.state.clone();
        let retired = next.upgrade()?;
        self.commit(next).await?;
        info!(
            app = %self.app_id,
            current = ?self.state.current_version.as_ref().map(|v| v.version),
            retired = ?retired.as_ref().map(|v| v.version),
            "subscription upgraded"
        );
        if let Some(retired) = retired {
            self.deactivate_pushers(self.pusher_ids(&retired)).await?;
        }
        Ok(())
    }

    async fn start(&mut self, version: VersionId) -> Result<(), FeedError> {
        let mut next = self.state.clone();
        let transition = next.start(version)?;
        self.commit(next).await?;
        info!(app = %self.app_id, %version, from = %transition.previous, "subscription started");
        self.activate_pushers(self.pusher_ids(&transition.version)).await
    }

    async fn pause(&mut self, version: VersionId) -> Result<(), FeedError> {
        let mut next = self.state.clone();
        let transition = next.pause(version)?;
        self.commit(next).await?;
        info!(app = %self.app_id, %version, "subscription paused");
        self.deactivate_pushers(self.pusher_ids(&transition.version)).await
    }

    async fn stop(&mut self, version: VersionId) -> Result<(), FeedError> {
        let mut next = self.state.clone();
        let transition = next.stop(version)?;
        self.commit(next).await?;
        info!(app = %self.app_id, %version, from = %transition.previous, "subscription stopped");
        self.deactivate_pushers(self.pusher_ids(&transition.version)).await
    }

    async fn status(&self, version: VersionId, repair: bool) -> Result<SubscriptionStatus, FeedError> {
        let live = self.live_version(version)?;
        if repair && live.status != SubscriptionStatus::Started {
            let ids = self.pusher_ids(live);
            debug!(app = %self.app_id, %version, status = %live.status, "clearing registry drift");
            self.deps.registry.remove_pushers(ids).await?;
        }
        Ok(live.status)
    }

    async fn stream_ids(&self, version: VersionId) -> Result<Vec<StreamId>, FeedError> {
        let ids = self.pusher_ids(self.live_version(version)?);
        let pushers = &self.deps.pushers;
        let streams = try_join_all(ids.iter().map(|id| pushers.message_stream_id(id))).await?;
        Ok(streams.into_iter().flatten().collect())
    }

    async fn push_token(&self, version: VersionId, chain_id: &str) -> Result<Uuid, FeedError> {
        let live = self.live_version(version)?;
        if live.manifest.item(chain_id).is_none() {
            return Err(FeedError::InvalidManifest(format!(
                "{} {version} does not subscribe to chain '{chain_id}'",
                self.app_id
            )));
        }
        self.deps.pushers.push_token(&self.pusher_id(version, chain_id)).await
    }

    /// Status check and removal happen in one turn, against the same state.
    async fn reconcile(&self, version: VersionId, registered: Vec<PusherId>) -> Result<usize, FeedError> {
        let stale: Vec<PusherId> = match self.state.version(version) {
            Some(live) if live.status == SubscriptionStatus::Started => registered
                .into_iter()
                .filter(|id| live.manifest.item(&id.chain_id).is_none())
                .collect(),
            _ => registered,
        };
        if stale.is_empty() {
            return Ok(0);
        }
        debug!(app = %self.app_id, %version, pushers = stale.len(), "clearing registry drift");
        let removed = stale.len();
        self.deps.registry.remove_pushers(stale).await?;
        Ok(removed)
    }
}

#[async_trait]
impl Actor for AppActor {
    type Key = AppId;
    type Message = AppMessage;
    type Deps = AppDeps;

    const KIND: &'static str = "app";

    async fn activate(key: &AppId, deps: &AppDeps) -> Result<Self, FeedError> {
        let state = load_state::<AppSubscriptionState>(deps.store.as_ref(), Self::KIND, &key.storage_key())
            .await?
            .unwrap_or_else(|| AppSubscriptionState::new(key.clone()));
        Ok(Self {
            app_id: key.clone(),
            state,
            deps: deps.clone(),
        })
    }

    async fn handle(&mut self, message: AppMessage, _ctx: &Context<Self>) {
        match message {
            AppMessage::Add { manifest, reply } => {
                let _ = reply.send(self.add(manifest).await);
            }
            AppMessage::Update { version, manifest, reply } => {
                let _ = reply.send(self.update(version, manifest).await);
            }
            AppMessage::Upgrade { reply } => {
                let _ = reply.send(self.upgrade().await);
            }
            AppMessage::Start { version, reply } => {
                let _ = reply.send(self.start(version).await);
            }
            AppMessage::Pause { version, reply } => {
                let _ = reply.send(self.pause(version).await);
            }
            AppMessage::Stop { version, reply } => {
                let _ = reply.send(self.stop(version).await);
            }
            AppMessage::GetSubscription { reply } => {
                let _ = reply.send(self.state.subscription());
            }
            AppMessage::Status { version, repair, reply } => {
                let _ = reply.send(self.status(version, repair).await);
            }
            AppMessage::StreamIds { version, reply } => {
                let _ = reply.send(self.stream_ids(version).await);
            }
            AppMessage::PushToken { version, chain_id, reply } => {
                let _ = reply.send(self.push_token(version, &chain_id).await);
            }
            AppMessage::Reconcile { version, registered, reply } => {
                let _ = reply.send(self.reconcile(version, registered).await);
            }
        }
    }
}

// ─── Typed calls ──────────────────────────────────────────────────────────────

impl ActorDirectory<AppActor> {
    /// Remove the registered ids of `version` that should not be active.
    pub async fn reconcile(
        &self,
        app_id: &AppId,
        version: VersionId,
        registered: Vec<PusherId>,
    ) -> Result<usize, FeedError> {
        self.ask(app_id, |reply| AppMessage::Reconcile {
            version,
            registered,
            reply,
        })
        .await?
    }
}
