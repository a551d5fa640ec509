//! Signal Watch: real-time chat ingestion and trading-signal classification.

pub mod api;
pub mod channels;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod pipeline;
pub mod service;
pub mod store;
