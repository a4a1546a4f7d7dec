//! Message bus — the transport pushers publish matched blocks to.
//!
//! Only the stream identifier returned by the bus is part of the feed's
//! contract. [`InMemoryBus`] fans each stream out through a
//! `tokio::sync::broadcast` channel:
//!
//! ```text
//! pusher ──publish(stream)──► broadcast::Sender<PushMessage> ──► subscribers
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use chainfeed_core::error::FeedError;
use chainfeed_core::keys::AppId;
use chainfeed_core::subscription::VersionId;
use chainfeed_core::types::{Block, ChainId, ScanMode};

/// Transport stream identifier.
pub type StreamId = Uuid;

/// One delivery to an app: the blocks matched in one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub app_id: AppId,
    pub version: VersionId,
    pub chain_id: ChainId,
    /// Token of the pusher run that produced the message.
    pub push_token: Uuid,
    pub mode: ScanMode,
    pub blocks: Vec<Block>,
    pub pushed_at: DateTime<Utc>,
}

/// Trait for the transport that carries pushes to apps.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Allocate a fresh stream.
    async fn allocate_stream(&self) -> Result<StreamId, FeedError>;

    /// Publish one message on `stream`, in order with earlier publishes.
    async fn publish(&self, stream: StreamId, message: PushMessage) -> Result<(), FeedError>;
}

/// In-process bus backed by one broadcast channel per stream.
pub struct InMemoryBus {
    capacity: usize,
    streams: Mutex<HashMap<StreamId, broadcast::Sender<PushMessage>>>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a stream. Only messages published afterwards are seen.
    pub fn subscribe(&self, stream: StreamId) -> Result<broadcast::Receiver<PushMessage>, FeedError> {
        self.lock()
            .get(&stream)
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| FeedError::Transport(format!("unknown stream {stream}")))
    }

    /// Number of allocated streams.
    pub fn stream_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, broadcast::Sender<PushMessage>>> {
        self.streams.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn allocate_stream(&self) -> Result<StreamId, FeedError> {
        let stream = Uuid::new_v4();
        let (tx, _) = broadcast::channel(self.capacity);
        self.lock().insert(stream, tx);
        tracing::debug!(%stream, "stream allocated");
        Ok(stream)
    }

    async fn publish(&self, stream: StreamId, message: PushMessage) -> Result<(), FeedError> {
        let streams = self.lock();
        let tx = streams
            .get(&stream)
            .ok_or_else(|| FeedError::Transport(format!("unknown stream {stream}")))?;
        // No subscriber is not an error: nobody is listening yet.
        if tx.send(message).is_err() {
            tracing::debug!(%stream, "published to a stream without subscribers");
        }
        Ok(())
    }
}
