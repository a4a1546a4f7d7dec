//! Error types for the chainfeed coordination layer.

use thiserror::Error;

use crate::subscription::{SubscriptionStatus, VersionId};

/// Errors that can occur while ingesting blocks or driving subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("Block {block_number} on {chain_id} is at or below confirmed height {confirmed_height}")]
    StaleBlock {
        chain_id: String,
        block_number: u64,
        confirmed_height: u64,
    },

    #[error("Block {block_number} on {chain_id} can't be processed now: previous block {previous_block_hash} is not in the ledger")]
    DiscontinuousBlock {
        chain_id: String,
        block_number: u64,
        previous_block_hash: String,
    },

    #[error("App '{app_id}' already holds a current and a pending version")]
    VersionSlotFull { app_id: String },

    #[error("App '{app_id}' has no version {version}")]
    VersionNotFound { app_id: String, version: VersionId },

    #[error("App '{app_id}' has no pending version to upgrade to")]
    NoPendingVersion { app_id: String },

    #[error("Version {version} can't {action} while {from}")]
    InvalidTransition {
        version: VersionId,
        from: SubscriptionStatus,
        action: &'static str,
    },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Block source error: {0}")]
    Source(String),

    #[error("Ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Actor '{0}' is unavailable")]
    ActorUnavailable(String),
}

impl FeedError {
    /// Returns `true` if the error is a stale-block no-op.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleBlock { .. })
    }

    /// Returns `true` if the caller can simply carry on (or retry later).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StaleBlock { .. } | Self::Source(_) | Self::Transport(_) | Self::ActorUnavailable(_)
        )
    }
}
