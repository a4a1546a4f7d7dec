//! Typed actor keys.
//!
//! Every actor is addressed by one of these keys. Each key knows how to
//! render itself for persistence, so no call site builds ids by hand.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::subscription::VersionId;
use crate::types::ChainId;

/// A key that addresses one actor and its persisted snapshot.
pub trait StateKey: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {
    /// Stable key under which the actor's snapshot is stored.
    fn storage_key(&self) -> String;
}

/// Identifier of a client app.
pub type AppId = String;

impl StateKey for String {
    fn storage_key(&self) -> String {
        self.clone()
    }
}

// ─── LedgerKey ────────────────────────────────────────────────────────────────

/// Addresses one chain ledger: the chain plus the hash of the block the
/// ledger was seeded with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub chain_id: ChainId,
    pub anchor_hash: String,
}

impl LedgerKey {
    pub fn new(chain_id: impl Into<ChainId>, anchor_hash: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            anchor_hash: anchor_hash.into(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.chain_id, self.anchor_hash)
    }
}

impl StateKey for LedgerKey {
    fn storage_key(&self) -> String {
        format!("{}/{}", self.chain_id, self.anchor_hash)
    }
}

// ─── PusherId ─────────────────────────────────────────────────────────────────

/// Deterministic id of the pusher serving one (app, version, chain) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PusherId {
    pub app_id: AppId,
    pub version: VersionId,
    pub chain_id: ChainId,
}

impl PusherId {
    pub fn new(app_id: impl Into<AppId>, version: VersionId, chain_id: impl Into<ChainId>) -> Self {
        Self {
            app_id: app_id.into(),
            version,
            chain_id: chain_id.into(),
        }
    }
}

impl fmt::Display for PusherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.app_id, self.version, self.chain_id)
    }
}

impl StateKey for PusherId {
    fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.app_id, self.version, self.chain_id)
    }
}

// ─── RegistryKey ──────────────────────────────────────────────────────────────

/// Key of the global pusher registry. There is exactly one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegistryKey;

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pusher-registry")
    }
}

impl StateKey for RegistryKey {
    fn storage_key(&self) -> String {
        "global".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pusher_id_is_deterministic() {
        let a = PusherId::new("app", VersionId(1), "AELF");
        let b = PusherId::new("app", VersionId(1), "AELF");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "app-v1-AELF");
        assert_eq!(a.storage_key(), "app/v1/AELF");
        assert_ne!(a, PusherId::new("app", VersionId(2), "AELF"));
    }

    #[test]
    fn pusher_storage_keys_do_not_collide_on_dashes() {
        let a = PusherId::new("my-app", VersionId(1), "AELF");
        let b = PusherId::new("my", VersionId(1), "app-v1-AELF");
        assert_ne!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn ledger_key_render() {
        let k = LedgerKey::new("tDVV", "0xabc");
        assert_eq!(k.to_string(), "tDVV@0xabc");
        assert_eq!(k.storage_key(), "tDVV/0xabc");
    }
}
