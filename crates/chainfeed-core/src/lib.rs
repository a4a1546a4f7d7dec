//! chainfeed-core — domain model for the fork-aware, multi-app block feed.
//!
//! # Architecture
//!
//! ```text
//! ChainFeed (runtime)
//!     ├── ChainLedger           (fork window, LIB walk, pruning)
//!     ├── AppSubscriptionState  (current / new version slots)
//!     ├── filter_block          (per-item transaction + log event matching)
//!     ├── ScanCursor            (per-pusher delivery position)
//!     └── StateStore            (snapshot persistence: memory / SQLite)
//! ```
//!
//! Everything here is plain data plus pure logic. The actors that own this
//! state live in `chainfeed-runtime`.

pub mod cursor;
pub mod error;
pub mod filter;
pub mod keys;
pub mod ledger;
pub mod manifest;
pub mod store;
pub mod subscription;
pub mod types;

pub use cursor::ScanCursor;
pub use error::FeedError;
pub use filter::filter_block;
pub use keys::{AppId, LedgerKey, PusherId, RegistryKey, StateKey};
pub use ledger::{ChainLedger, LedgerEntry};
pub use manifest::{LogEventCondition, SubscriptionItem, SubscriptionManifest, TransactionCondition};
pub use store::{MemoryStateStore, StateStore};
pub use subscription::{
    AppSubscription, AppSubscriptionState, SubscriptionStatus, SubscriptionVersion, VersionId,
};
pub use types::{Block, ChainId, LogEvent, ScanMode, Transaction};
