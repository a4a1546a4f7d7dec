//! Block-scan filter — decides what part of a block an app wants.

use crate::manifest::{LogEventCondition, SubscriptionItem, TransactionCondition};
use crate::types::{Block, LogEvent, Transaction};

/// Evaluate `block` against one subscription item.
///
/// Returns `None` when nothing in the block is wanted. Otherwise returns the
/// block cut down to the matching transactions: a transaction that matches a
/// transaction condition is kept whole, one that only matches through its log
/// events keeps just those events. An item without conditions takes the whole
/// block.
pub fn filter_block(block: &Block, item: &SubscriptionItem) -> Option<Block> {
    if block.chain_id != item.chain_id
        || block.block_number < item.start_block_number
        || (item.only_confirmed && !block.is_confirmed)
    {
        return None;
    }
    if item.is_unfiltered() {
        return Some(block.clone());
    }

    let transactions: Vec<Transaction> = block
        .transactions
        .iter()
        .filter_map(|tx| filter_transaction(tx, item))
        .collect();
    if transactions.is_empty() {
        return None;
    }

    Some(Block {
        transactions,
        ..block.clone_header()
    })
}

fn filter_transaction(tx: &Transaction, item: &SubscriptionItem) -> Option<Transaction> {
    if item.transaction_conditions.iter().any(|c| transaction_matches(c, tx)) {
        return Some(tx.clone());
    }
    let log_events: Vec<LogEvent> = tx
        .log_events
        .iter()
        .filter(|e| item.log_event_conditions.iter().any(|c| log_event_matches(c, e)))
        .cloned()
        .collect();
    if log_events.is_empty() {
        return None;
    }
    Some(Transaction {
        log_events,
        ..tx.clone_without_events()
    })
}

/// Exact (case-sensitive) `to` match, then method name if any are listed.
pub fn transaction_matches(condition: &TransactionCondition, tx: &Transaction) -> bool {
    condition.to == tx.to
        && (condition.method_names.is_empty() || condition.method_names.iter().any(|m| *m == tx.method_name))
}

/// Exact (case-sensitive) contract match, then event name if any are listed.
pub fn log_event_matches(condition: &LogEventCondition, event: &LogEvent) -> bool {
    condition.contract_address == event.contract_address
        && (condition.event_names.is_empty() || condition.event_names.iter().any(|n| *n == event.event_name))
}

impl Block {
    fn clone_header(&self) -> Block {
        Block {
            chain_id: self.chain_id.clone(),
            block_hash: self.block_hash.clone(),
            block_number: self.block_number,
            previous_block_hash: self.previous_block_hash.clone(),
            lib_block_number: self.lib_block_number,
            is_confirmed: self.is_confirmed,
            block_time: self.block_time,
            transactions: vec![],
        }
    }
}

impl Transaction {
    fn clone_without_events(&self) -> Transaction {
        Transaction {
            transaction_id: self.transaction_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            method_name: self.method_name.clone(),
            index: self.index,
            log_events: vec![],
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
