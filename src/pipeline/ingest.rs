//! Inbound event ingestion.
//!
//! Persists every event once (the store is idempotent on the upstream id),
//! computes its initial priority and hands it to the worker pool. Also
//! owns the two paths that put stored messages back on the queue: startup
//! recovery and operator reprocessing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::pool::WorkerPool;
use super::prefilter::Prefilter;
use super::queue::EnqueueError;
use super::types::{DEFAULT_PRIORITY, InboundEvent};
use crate::error::PipelineError;
use crate::gateway::EventHandler;
use crate::store::{Database, InsertOutcome, StoredMessage};

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Enqueued { message_id: String, priority: u8 },
    /// Already stored; not enqueued again.
    Duplicate { message_id: String },
    /// Stored, but the queue was full.
    Dropped { message_id: String },
    /// Stored; a task for it is already outstanding.
    AlreadyQueued { message_id: String },
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub duplicates: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    duplicates: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Result of a reprocess request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessReport {
    /// Failed messages found.
    pub found: usize,
    pub requeued: usize,
    /// Ids that could not be queued again.
    pub skipped: Vec<String>,
}

pub struct Ingestor {
    store: Arc<dyn Database>,
    pool: Arc<WorkerPool>,
    prefilter: Arc<Prefilter>,
    counters: Counters,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Database>, pool: Arc<WorkerPool>, prefilter: Arc<Prefilter>) -> Self {
        Self {
            store,
            pool,
            prefilter,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            received: self.counters.received.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Persist `event` and enqueue it for classification.
    pub async fn ingest(&self, event: &InboundEvent) -> Result<IngestOutcome, PipelineError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let message_id = match self.store.insert_message(event).await {
            Ok(InsertOutcome::Inserted(id)) => id,
            Ok(InsertOutcome::Duplicate(id)) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(external_id = %event.id, message_id = %id, "Duplicate event ignored");
                return Ok(IngestOutcome::Duplicate { message_id: id });
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let has_images = event.attachments.iter().any(|a| a.is_image());
        let priority = self.prefilter.initial_priority(
            &event.content,
            event.referenced_event.is_some(),
            has_images,
        );
        Ok(self.enqueue(message_id, priority))
    }

    fn enqueue(&self, message_id: String, priority: u8) -> IngestOutcome {
        match self.pool.enqueue(&message_id, priority) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Enqueued {
                    message_id,
                    priority,
                }
            }
            Err(EnqueueError::Full { .. }) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Dropped { message_id }
            }
            Err(EnqueueError::Duplicate) => IngestOutcome::AlreadyQueued { message_id },
        }
    }

    fn priority_of(&self, message: &StoredMessage) -> u8 {
        self.prefilter.initial_priority(
            &message.content,
            message.referenced_external_id.is_some(),
            message.attachments.iter().any(|a| a.is_image()),
        )
    }

    /// Re-enqueue messages stored but never processed, up to `limit` and the
    /// queue's free space. Returns how many were queued.
    pub async fn recover_unprocessed(&self, limit: usize) -> Result<usize, PipelineError> {
        let pending = self.store.list_unprocessed_messages(limit).await?;
        let found = pending.len();
        let mut recovered = 0;
        for message in pending {
            let priority = self.priority_of(&message);
            match self.enqueue(message.id, priority) {
                IngestOutcome::Enqueued { .. } => recovered += 1,
                IngestOutcome::Dropped { .. } => {
                    warn!(recovered, found, "Queue full during recovery, stopping");
                    break;
                }
                _ => {}
            }
        }
        info!(recovered, found, "Recovered unprocessed messages");
        Ok(recovered)
    }

    /// Clear the error of up to `limit` failed messages and queue them again
    /// at the default priority. Messages without an error are untouched, so
    /// repeating the call is a no-op. A message the full queue rejects keeps
    /// its error and is reported as skipped.
    pub async fn reprocess_failed(&self, limit: usize) -> Result<ReprocessReport, PipelineError> {
        let failed = self.store.list_failed_messages(limit).await?;
        let mut report = ReprocessReport {
            found: failed.len(),
            ..ReprocessReport::default()
        };

        for message in failed {
            if !self.store.reset_for_reprocess(&message.id).await? {
                report.skipped.push(message.id);
                continue;
            }
            match self.pool.enqueue(&message.id, DEFAULT_PRIORITY) {
                Ok(()) | Err(EnqueueError::Duplicate) => report.requeued += 1,
                Err(EnqueueError::Full { .. }) => {
                    // Put the error back so the message stays listed as failed.
                    let previous = message.processing_error.as_deref().unwrap_or("Queue full");
                    if let Err(e) = self.store.mark_failed(&message.id, previous).await {
                        error!(
                            message_id = %message.id,
                            error = %e,
                            "Failed to restore processing error"
                        );
                    }
                    report.skipped.push(message.id);
                }
            }
        }
        info!(
            found = report.found,
            requeued = report.requeued,
            skipped = report.skipped.len(),
            "Reprocessing failed messages"
        );
        Ok(report)
    }
}

#[async_trait]
impl EventHandler for Ingestor {
    async fn on_event(&self, event: InboundEvent) {
        match self.ingest(&event).await {
            Ok(IngestOutcome::Dropped { message_id }) => {
                warn!(%message_id, external_id = %event.id, "Event stored but not queued: queue full");
            }
            Ok(outcome) => debug!(?outcome, "Event ingested"),
            Err(e) => error!(external_id = %event.id, error = %e, "Failed to ingest event"),
        }
    }
}
