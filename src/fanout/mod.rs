//! Session fan-out: best-effort replication of a turn's chunk stream to
//! every other participant of the same session.
//!
//! Channels are keyed by session id, not user id, so human-takeover and
//! multi-device participants all see the same stream. Publishing never
//! blocks the agent loop and never fails the turn; a session nobody is
//! subscribed to is simply a no-op.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::StreamChunk;

/// Fan-out collaborator contract: at-most-once, best-effort delivery.
#[async_trait]
pub trait FanOut: Send + Sync {
    async fn publish(&self, session_id: &str, chunk: &StreamChunk);
}

/// Disables fan-out. Useful for one-participant deployments and tests.
pub struct NoFanOut;

#[async_trait]
impl FanOut for NoFanOut {
    async fn publish(&self, _session_id: &str, _chunk: &StreamChunk) {}
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// In-process broker backed by tokio broadcast channels.
///
/// This is the single-process stand-in for an external broker; a
/// Redis-style implementation satisfies the same trait. Slow subscribers
/// lag and lose chunks rather than applying backpressure to the producer.
pub struct SessionBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<StreamChunk>>>,
    capacity: usize,
}

impl SessionBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to a session's live stream.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<StreamChunk> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for SessionBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanOut for SessionBroker {
    async fn publish(&self, session_id: &str, chunk: &StreamChunk) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = channels.get(session_id) else {
            return;
        };
        if sender.send(chunk.clone()).is_err() {
            // Last subscriber left; drop the channel.
            trace!(session_id, "dropping fan-out channel with no subscribers");
            channels.remove(session_id);
        }
    }
}
