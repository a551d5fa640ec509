//! `Database` trait — single async interface for all persistence.
//!
//! Covers the normalized message table, the append-only pipeline step
//! trace, and per-channel access state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::channels::access::ChannelAccessState;
use crate::error::DatabaseError;
use crate::pipeline::tracker::PipelineStepRecord;
use crate::pipeline::types::{Attachment, ClassificationResult, InboundEvent};

/// A persisted inbound message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    /// Upstream event id; unique.
    pub external_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub referenced_external_id: Option<String>,
    pub referenced_content: Option<String>,
    /// Upstream event timestamp.
    pub created_at: DateTime<Utc>,
    pub is_processed: bool,
    pub processing_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub result: Option<ClassificationResult>,
}

/// Outcome of inserting an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(String),
    /// The upstream id was already stored; carries the existing row id.
    Duplicate(String),
}

impl InsertOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Inserted(id) | Self::Duplicate(id) => id,
        }
    }
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Persist a normalized event. Idempotent on the upstream id.
    async fn insert_message(&self, event: &InboundEvent) -> Result<InsertOutcome, DatabaseError>;

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError>;

    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Messages in `channel_id` created strictly before `before`, newest first.
    async fn get_recent_messages(
        &self,
        channel_id: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Write the classification back and mark the message processed.
    /// `result.error` becomes `processing_error`.
    async fn save_result(
        &self,
        id: &str,
        result: &ClassificationResult,
    ) -> Result<(), DatabaseError>;

    /// Record a processing failure on a message that is still unprocessed.
    /// Returns false when the message is missing or already processed.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool, DatabaseError>;

    /// Messages carrying a `processing_error`, oldest first.
    async fn list_failed_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Unprocessed messages without an error, oldest first.
    async fn list_unprocessed_messages(
        &self,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Clear `processing_error` and the processed flag so the message can be
    /// classified again. Returns false when the message had no error.
    async fn reset_for_reprocess(&self, id: &str) -> Result<bool, DatabaseError>;

    // ── Pipeline steps ──────────────────────────────────────────────

    async fn insert_step(&self, step: &PipelineStepRecord) -> Result<(), DatabaseError>;

    /// Write the final state of a step. Only a step still `processing` is
    /// updated; returns false when it was already finalized.
    async fn finish_step(&self, step: &PipelineStepRecord) -> Result<bool, DatabaseError>;

    /// Fail every step of `message_id` still `processing`. Returns the count.
    async fn fail_open_steps(&self, message_id: &str, error: &str) -> Result<usize, DatabaseError>;

    /// All steps of a message ordered by `step_order`.
    async fn list_steps(&self, message_id: &str) -> Result<Vec<PipelineStepRecord>, DatabaseError>;

    /// Highest recorded `step_order`, 0 when none.
    async fn max_step_order(&self, message_id: &str) -> Result<u32, DatabaseError>;

    // ── Channel access ──────────────────────────────────────────────

    async fn list_channel_access(&self) -> Result<Vec<ChannelAccessState>, DatabaseError>;

    async fn upsert_channel_access(&self, state: &ChannelAccessState) -> Result<(), DatabaseError>;

    /// Returns false when no row existed.
    async fn delete_channel_access(&self, channel_id: &str) -> Result<bool, DatabaseError>;

    async fn clear_channel_access(&self) -> Result<usize, DatabaseError>;
}
