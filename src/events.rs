//! Result publication.
//!
//! The pipeline hands every terminal outcome to a [`ResultSink`] and never
//! waits on whoever is listening.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::pipeline::types::ResultEvent;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, event: ResultEvent);
}

/// Fan-out of result events over a broadcast channel. Receivers that fall
/// behind lose the oldest events.
pub struct ResultBroadcaster {
    tx: broadcast::Sender<ResultEvent>,
}

impl ResultBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResultEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ResultBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultSink for ResultBroadcaster {
    async fn publish(&self, event: ResultEvent) {
        let message_id = event.message_id().to_string();
        if self.tx.send(event).is_err() {
            debug!(%message_id, "No result subscribers");
        }
    }
}
