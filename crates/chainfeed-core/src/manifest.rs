//! Subscription manifests — what an app wants delivered, per chain.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::types::ChainId;

/// The per-chain subscription items of one app version, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionManifest {
    pub items: Vec<SubscriptionItem>,
}

impl SubscriptionManifest {
    pub fn new(items: Vec<SubscriptionItem>) -> Self {
        Self { items }
    }

    /// Rejects empty manifests, blank chain ids and duplicate chains.
    pub fn validate(&self) -> Result<(), FeedError> {
        if self.items.is_empty() {
            return Err(FeedError::InvalidManifest("no subscription items".into()));
        }
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.chain_id.trim().is_empty() {
                return Err(FeedError::InvalidManifest("empty chain id".into()));
            }
            if !seen.insert(item.chain_id.as_str()) {
                return Err(FeedError::InvalidManifest(format!(
                    "chain '{}' subscribed twice",
                    item.chain_id
                )));
            }
        }
        Ok(())
    }

    /// The item for `chain_id`, if subscribed.
    pub fn item(&self, chain_id: &str) -> Option<&SubscriptionItem> {
        self.items.iter().find(|i| i.chain_id == chain_id)
    }

    /// Subscribed chains, in declaration order.
    pub fn chain_ids(&self) -> impl Iterator<Item = &ChainId> {
        self.items.iter().map(|i| &i.chain_id)
    }
}

/// What one app wants from one chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub chain_id: ChainId,
    pub start_block_number: u64,
    /// Only deliver blocks once they are irreversible.
    #[serde(default)]
    pub only_confirmed: bool,
    #[serde(default)]
    pub transaction_conditions: Vec<TransactionCondition>,
    #[serde(default)]
    pub log_event_conditions: Vec<LogEventCondition>,
}

impl SubscriptionItem {
    /// Create an item for `chain_id` starting at `start_block_number`.
    pub fn new(chain_id: impl Into<ChainId>, start_block_number: u64) -> Self {
        Self {
            chain_id: chain_id.into(),
            start_block_number,
            ..Default::default()
        }
    }

    /// Restrict delivery to confirmed blocks.
    pub fn only_confirmed(mut self) -> Self {
        self.only_confirmed = true;
        self
    }

    /// Add a transaction condition.
    pub fn transaction(mut self, condition: TransactionCondition) -> Self {
        self.transaction_conditions.push(condition);
        self
    }

    /// Add a log-event condition.
    pub fn log_event(mut self, condition: LogEventCondition) -> Self {
        self.log_event_conditions.push(condition);
        self
    }

    /// Returns `true` if no condition narrows the item (match everything).
    pub fn is_unfiltered(&self) -> bool {
        self.transaction_conditions.is_empty() && self.log_event_conditions.is_empty()
    }
}

/// Matches transactions sent to `to`, optionally only for some methods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCondition {
    pub to: String,
    /// Empty = any method.
    #[serde(default)]
    pub method_names: Vec<String>,
}

impl TransactionCondition {
    pub fn to(address: impl Into<String>) -> Self {
        Self {
            to: address.into(),
            method_names: vec![],
        }
    }

    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.method_names.push(name.into());
        self
    }
}

/// Matches log events emitted by `contract_address`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEventCondition {
    pub contract_address: String,
    /// Empty = every event of the contract.
    #[serde(default)]
    pub event_names: Vec<String>,
}

impl LogEventCondition {
    pub fn contract(address: impl Into<String>) -> Self {
        Self {
            contract_address: address.into(),
            event_names: vec![],
        }
    }

    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.event_names.push(name.into());
        self
    }
}
