//! chainfeed-runtime — the actors behind a multi-app block feed.
//!
//! ```text
//!                 ┌──────────────┐  ask   ┌───────────────┐
//!  ChainFeed ────►│  AppActor    │───────►│ RegistryActor │
//!      │          └──────┬───────┘        └──────┬────────┘
//!      │ ask             │ ask                   │ tell (fan-out)
//!      ▼                 ▼                       ▼
//!  LedgerActor      PusherActor ◄────────────────┘
//!                        │ publish
//!                        ▼
//!                    MessageBus
//! ```
//!
//! Each actor kind is hosted by an [`ActorDirectory`], which creates actors
//! on first message, evicts them when idle and restores them from their
//! persisted snapshot on the next message.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainfeed_core::{MemoryStateStore, SubscriptionItem, SubscriptionManifest};
//! use chainfeed_runtime::{FeedBuilder, InMemoryBus, MemoryBlockSource};
//!
//! # async fn demo() -> Result<(), chainfeed_core::FeedError> {
//! let feed = FeedBuilder::new().catch_up_batch_size(50).build(
//!     Arc::new(MemoryStateStore::new()),
//!     Arc::new(InMemoryBus::new(1024)),
//!     Arc::new(MemoryBlockSource::new()),
//! );
//! let manifest = SubscriptionManifest::new(vec![SubscriptionItem::new("AELF", 1)]);
//! let version = feed.add_subscription("my-app", manifest).await?;
//! feed.start_scan("my-app", version).await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod app_actor;
pub mod bus;
pub mod config;
pub mod feed;
pub mod ledger_actor;
pub mod pusher;
pub mod registry;
pub mod source;

pub use actor::{Actor, ActorDirectory, Context};
pub use bus::{InMemoryBus, MessageBus, PushMessage, StreamId};
pub use config::{FeedBuilder, FeedConfig};
pub use feed::{ChainFeed, IngestOutcome};
pub use ledger_actor::{LedgerStatus, Recorded};
pub use pusher::PusherState;
pub use registry::ActivePushers;
pub use source::{BlockSource, MemoryBlockSource};
