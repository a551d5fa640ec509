//! Real-time event source connection.

pub mod backoff;
pub mod connection;
pub mod dedup;
pub mod protocol;

use async_trait::async_trait;

use crate::pipeline::types::InboundEvent;

pub use connection::{ConnectionState, GatewayConnectionManager};

/// Receives every inbound event accepted by the gateway or a poll cycle.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: InboundEvent);
}
