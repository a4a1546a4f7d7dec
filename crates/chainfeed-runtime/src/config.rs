//! Feed configuration and the fluent builder.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainfeed_core::store::MemoryStateStore;
//! use chainfeed_runtime::{FeedBuilder, InMemoryBus, MemoryBlockSource};
//!
//! # async fn example() {
//! let feed = FeedBuilder::new()
//!     .catch_up_batch_size(50)
//!     .idle_timeout_ms(60_000)
//!     .build(
//!         Arc::new(MemoryStateStore::new()),
//!         Arc::new(InMemoryBus::new(1024)),
//!         Arc::new(MemoryBlockSource::new()),
//!     );
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chainfeed_core::store::StateStore;

use crate::bus::MessageBus;
use crate::feed::ChainFeed;
use crate::source::BlockSource;

/// Configuration for a feed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Evict an actor after this long without messages (milliseconds).
    pub idle_timeout_ms: u64,
    /// Blocks fetched per historical catch-up step.
    pub catch_up_batch_size: u64,
    /// Delay before retrying a failed catch-up step (milliseconds).
    pub catch_up_retry_ms: u64,
    /// A third `add_subscription` replaces the pending version instead of
    /// failing with `VersionSlotFull`.
    pub replace_pending_version: bool,
    /// Run a registry audit this often. `None` = only on demand.
    pub audit_interval_ms: Option<u64>,
    /// Buffered messages per stream in the in-memory bus.
    pub stream_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
            catch_up_batch_size: 100,
            catch_up_retry_ms: 1_000,
            replace_pending_version: false,
            audit_interval_ms: None,
            stream_capacity: 1_024,
        }
    }
}

impl FeedConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn catch_up_retry(&self) -> Duration {
        Duration::from_millis(self.catch_up_retry_ms)
    }

    pub fn audit_interval(&self) -> Option<Duration> {
        self.audit_interval_ms.map(Duration::from_millis)
    }
}

/// Fluent builder for [`FeedConfig`] and [`ChainFeed`].
#[derive(Default)]
pub struct FeedBuilder {
    config: FeedConfig,
}

impl FeedBuilder {
    pub fn new() -> Self {
        Self {
            config: FeedConfig::default(),
        }
    }

    /// Start from an existing configuration (e.g. loaded from a file).
    pub fn from_config(config: FeedConfig) -> Self {
        Self { config }
    }

    /// Set the actor idle timeout.
    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.config.idle_timeout_ms = ms;
        self
    }

    /// Set the number of blocks per catch-up step.
    pub fn catch_up_batch_size(mut self, size: u64) -> Self {
        self.config.catch_up_batch_size = size.max(1);
        self
    }

    /// Set the catch-up retry delay.
    pub fn catch_up_retry_ms(mut self, ms: u64) -> Self {
        self.config.catch_up_retry_ms = ms;
        self
    }

    /// Let a third added version replace the pending one.
    pub fn replace_pending_version(mut self, replace: bool) -> Self {
        self.config.replace_pending_version = replace;
        self
    }

    /// Audit the pusher registry periodically.
    pub fn audit_interval_ms(mut self, ms: u64) -> Self {
        self.config.audit_interval_ms = Some(ms);
        self
    }

    /// Set the in-memory bus capacity per stream.
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.config.stream_capacity = capacity;
        self
    }

    /// Build the `FeedConfig`.
    pub fn build_config(self) -> FeedConfig {
        self.config
    }

    /// Build the feed. Must be called inside a Tokio runtime when an audit
    /// interval is set.
    pub fn build(
        self,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn MessageBus>,
        source: Arc<dyn BlockSource>,
    ) -> ChainFeed {
        ChainFeed::new(self.config, store, bus, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = FeedBuilder::new().build_config();
        assert_eq!(cfg.idle_timeout_ms, 300_000);
        assert_eq!(cfg.catch_up_batch_size, 100);
        assert!(!cfg.replace_pending_version);
        assert_eq!(cfg.audit_interval(), None);
    }

    #[test]
    fn builder_custom() {
        let cfg = FeedBuilder::new()
            .idle_timeout_ms(1_000)
            .catch_up_batch_size(0)
            .catch_up_retry_ms(10)
            .replace_pending_version(true)
            .audit_interval_ms(5_000)
            .build_config();

        assert_eq!(cfg.idle_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.catch_up_batch_size, 1);
        assert_eq!(cfg.catch_up_retry(), Duration::from_millis(10));
        assert!(cfg.replace_pending_version);
        assert_eq!(cfg.audit_interval(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: FeedConfig = serde_json::from_str(r#"{ "catch_up_batch_size": 7 }"#).unwrap();
        assert_eq!(cfg.catch_up_batch_size, 7);
        assert_eq!(cfg.stream_capacity, 1_024);
    }
}
