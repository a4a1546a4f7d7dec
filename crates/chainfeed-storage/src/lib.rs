//! chainfeed-storage — durable snapshot stores for ChainFeed actors.
//!
//! Backends:
//! - `MemoryStateStore` (re-exported from `chainfeed-core`) — no persistence
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use chainfeed_core::store::{MemoryStateStore, StateStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;
