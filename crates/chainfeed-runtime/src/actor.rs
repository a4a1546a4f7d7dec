//! Actor host — keyed mailboxes with lookup-or-create activation.
//!
//! An [`ActorDirectory`] maps a typed key to one running actor. The first
//! message for a key spawns a Tokio task that activates the actor (loading
//! its snapshot) and then drains its mailbox one message at a time. A
//! mailbox that stays empty for `idle_timeout` is evicted; the next message
//! for that key activates a fresh copy from the persisted snapshot.
//!
//! ```text
//! tell(key, msg) ──► mailboxes[key] ──► task: activate → handle → handle → … → evict
//!                        (missing) └──► spawn task, then enqueue
//! ```
//!
//! Every send happens under the directory lock, and eviction only removes a
//! mailbox under the same lock after checking it is empty, so no message is
//! ever enqueued into a mailbox that is about to go away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use chainfeed_core::error::FeedError;
use chainfeed_core::keys::StateKey;

/// A single-threaded, independently addressable unit of state.
#[async_trait]
pub trait Actor: Sized + Send + 'static {
    /// Address of one actor instance.
    type Key: StateKey;
    /// Mailbox message type.
    type Message: Send + 'static;
    /// Shared collaborators handed to every activation.
    type Deps: Clone + Send + Sync + 'static;

    /// Snapshot namespace, also used in logs.
    const KIND: &'static str;

    /// Build the actor for `key`, from its snapshot when one exists.
    async fn activate(key: &Self::Key, deps: &Self::Deps) -> Result<Self, FeedError>;

    /// Runs once after activation, before the first message.
    async fn started(&mut self, _ctx: &Context<Self>) {}

    /// Handle one message.
    async fn handle(&mut self, message: Self::Message, ctx: &Context<Self>);
}

enum Envelope<M> {
    Message(M),
    Stop,
}

struct Mailbox<M> {
    generation: u64,
    tx: mpsc::UnboundedSender<Envelope<M>>,
    task: JoinHandle<()>,
}

struct Inner<A: Actor> {
    deps: A::Deps,
    idle_timeout: Duration,
    mailboxes: Mutex<HashMap<A::Key, Mailbox<A::Message>>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

/// Directory of live actors of one kind.
pub struct ActorDirectory<A: Actor> {
    inner: Arc<Inner<A>>,
}

impl<A: Actor> Clone for ActorDirectory<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Actor> ActorDirectory<A> {
    pub fn new(deps: A::Deps, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                idle_timeout,
                mailboxes: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Collaborators shared by every actor of this directory.
    pub fn deps(&self) -> &A::Deps {
        &self.inner.deps
    }

    /// Enqueue `message` for `key`, activating the actor if needed.
    pub fn tell(&self, key: &A::Key, message: A::Message) -> Result<(), FeedError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(self.unavailable(key));
        }
        let mut mailboxes = self.lock();
        let message = match mailboxes.get(key) {
            Some(mailbox) => match mailbox.tx.send(Envelope::Message(message)) {
                Ok(()) => return Ok(()),
                // The task is gone (failed activation); start over.
                Err(mpsc::error::SendError(Envelope::Message(message))) => message,
                Err(mpsc::error::SendError(Envelope::Stop)) => return Ok(()),
            },
            None => message,
        };

        let mailbox = self.spawn(key);
        let sent = mailbox
            .tx
            .send(Envelope::Message(message))
            .map_err(|_| self.unavailable(key));
        mailboxes.insert(key.clone(), mailbox);
        sent
    }

    /// Send a request built around a reply channel and wait for the answer.
    pub async fn ask<R>(
        &self,
        key: &A::Key,
        request: impl FnOnce(oneshot::Sender<R>) -> A::Message,
    ) -> Result<R, FeedError> {
        let (reply, response) = oneshot::channel();
        self.tell(key, request(reply))?;
        response.await.map_err(|_| self.unavailable(key))
    }

    /// Returns `true` if `key` currently has a running activation.
    pub fn is_active(&self, key: &A::Key) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of running activations.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Stop every live actor after it drains its mailbox. Later sends fail
    /// with `ActorUnavailable`.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<Mailbox<A::Message>> = self.lock().drain().map(|(_, m)| m).collect();
        debug!(kind = A::KIND, actors = drained.len(), "shutting down actors");
        for mailbox in drained {
            let _ = mailbox.tx.send(Envelope::Stop);
            if let Err(e) = mailbox.task.await {
                warn!(kind = A::KIND, error = %e, "actor task ended abnormally");
            }
        }
    }

    fn spawn(&self, key: &A::Key) -> Mailbox<A::Message> {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(self.clone(), key.clone(), generation, rx));
        Mailbox { generation, tx, task }
    }

    /// Remove `key`'s mailbox if it still belongs to `generation`.
    fn forget(&self, key: &A::Key, generation: u64) {
        let mut mailboxes = self.lock();
        if mailboxes.get(key).map(|m| m.generation) == Some(generation) {
            mailboxes.remove(key);
        }
    }

    /// Evict an idle actor unless a message slipped in meanwhile.
    fn try_evict(
        &self,
        key: &A::Key,
        generation: u64,
        rx: &mut mpsc::UnboundedReceiver<Envelope<A::Message>>,
    ) -> Option<Envelope<A::Message>> {
        let mut mailboxes = self.lock();
        match rx.try_recv() {
            Ok(envelope) => Some(envelope),
            Err(_) => {
                if mailboxes.get(key).map(|m| m.generation) == Some(generation) {
                    mailboxes.remove(key);
                }
                None
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<A::Key, Mailbox<A::Message>>> {
        self.inner
            .mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unavailable(&self, key: &A::Key) -> FeedError {
        FeedError::ActorUnavailable(format!("{} {key}", A::KIND))
    }
}

async fn run<A: Actor>(
    directory: ActorDirectory<A>,
    key: A::Key,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<Envelope<A::Message>>,
) {
    let mut actor = match A::activate(&key, directory.deps()).await {
        Ok(actor) => actor,
        Err(e) => {
            error!(kind = A::KIND, key = %key, error = %e, "actor activation failed");
            directory.forget(&key, generation);
            return;
        }
    };
    debug!(kind = A::KIND, key = %key, "actor activated");

    let ctx = Context {
        key: key.clone(),
        directory: directory.clone(),
    };
    actor.started(&ctx).await;

    loop {
        let envelope = match tokio::time::timeout(directory.inner.idle_timeout, rx.recv()).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(_) => match directory.try_evict(&key, generation, &mut rx) {
                Some(envelope) => envelope,
                None => {
                    debug!(kind = A::KIND, key = %key, "idle actor evicted");
                    break;
                }
            },
        };
        match envelope {
            Envelope::Message(message) => actor.handle(message, &ctx).await,
            Envelope::Stop => break,
        }
    }
}

// ─── Context ──────────────────────────────────────────────────────────────────

/// What an actor knows about itself while handling a message.
pub struct Context<A: Actor> {
    key: A::Key,
    directory: ActorDirectory<A>,
}

impl<A: Actor> Context<A> {
    pub fn key(&self) -> &A::Key {
        &self.key
    }

    pub fn deps(&self) -> &A::Deps {
        self.directory.deps()
    }

    /// Append `message` to the actor's own mailbox.
    pub fn notify(&self, message: A::Message) {
        if let Err(e) = self.directory.tell(&self.key, message) {
            debug!(kind = A::KIND, key = %self.key, error = %e, "self-notification dropped");
        }
    }

    /// Deliver `message` to this key after `delay`, reactivating the actor
    /// if it was evicted meanwhile.
    pub fn schedule(&self, message: A::Message, delay: Duration) {
        let directory = self.directory.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = directory.tell(&key, message) {
                debug!(kind = A::KIND, key = %key, error = %e, "scheduled message dropped");
            }
        });
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
