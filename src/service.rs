//! The pipeline service object.
//!
//! Owns the store, worker pool, ingestor and result broadcaster. Built
//! once in `main` and shared by reference with the gateway, the poller
//! and the admin router.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::channels::{ChannelAccessRegistry, ChannelAccessState};
use crate::classifier::ClassificationClient;
use crate::config::{PipelineConfig, PipelineConfigUpdate};
use crate::error::{DatabaseError, PipelineError};
use crate::events::{ResultBroadcaster, ResultSink};
use crate::pipeline::tracker::{PipelineStepRecord, WorkflowSummary};
use crate::pipeline::types::ResultEvent;
use crate::pipeline::{
    IngestStats, Ingestor, MessageProcessor, PoolStats, Prefilter, ReprocessReport, WorkerPool,
};
use crate::store::Database;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub uptime_secs: i64,
    pub pool: PoolStats,
    pub ingest: IngestStats,
    pub result_subscribers: usize,
    pub blacklisted_channels: usize,
}

/// Step trace of one message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageTrace {
    pub steps: Vec<PipelineStepRecord>,
    pub summary: WorkflowSummary,
}

pub struct PipelineService {
    store: Arc<dyn Database>,
    pool: Arc<WorkerPool>,
    ingestor: Arc<Ingestor>,
    broadcaster: Arc<ResultBroadcaster>,
    registry: Option<Arc<ChannelAccessRegistry>>,
    started_at: DateTime<Utc>,
}

impl PipelineService {
    pub fn new(
        store: Arc<dyn Database>,
        classifier: Arc<dyn ClassificationClient>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let prefilter = Arc::new(
            Prefilter::new()
                .map_err(|e| PipelineError::InvalidConfig(format!("keyword pattern: {e}")))?,
        );
        let broadcaster = Arc::new(ResultBroadcaster::new());
        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&store),
            classifier,
            Arc::clone(&prefilter),
            Arc::clone(&broadcaster) as Arc<dyn ResultSink>,
            &config,
        ));
        let pool = Arc::new(WorkerPool::new(processor, config));
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            prefilter,
        ));
        Ok(Self {
            store,
            pool,
            ingestor,
            broadcaster,
            registry: None,
            started_at: Utc::now(),
        })
    }

    /// Expose the channel blacklist through this service.
    pub fn with_registry(mut self, registry: Arc<ChannelAccessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Event handler for the gateway and the poller.
    pub fn ingestor(&self) -> Arc<Ingestor> {
        Arc::clone(&self.ingestor)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResultEvent> {
        self.broadcaster.subscribe()
    }

    pub async fn start(&self) {
        self.pool.start().await;
    }

    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    pub async fn is_running(&self) -> bool {
        self.pool.is_running().await
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            pool: self.pool.stats().await,
            ingest: self.ingestor.stats(),
            result_subscribers: self.broadcaster.subscriber_count(),
            blacklisted_channels: self
                .registry
                .as_ref()
                .map(|r| r.list_blacklisted().len())
                .unwrap_or(0),
        }
    }

    pub fn config(&self) -> PipelineConfig {
        self.pool.config()
    }

    pub async fn update_config(
        &self,
        update: &PipelineConfigUpdate,
    ) -> Result<PipelineConfig, PipelineError> {
        self.pool.reconfigure(update).await
    }

    pub fn clear_queue(&self) -> usize {
        self.pool.clear()
    }

    pub async fn recover_unprocessed(&self, limit: usize) -> Result<usize, PipelineError> {
        self.ingestor.recover_unprocessed(limit).await
    }

    pub async fn reprocess_failed(&self, limit: usize) -> Result<ReprocessReport, PipelineError> {
        self.ingestor.reprocess_failed(limit).await
    }

    /// `None` when the message does not exist.
    pub async fn message_trace(&self, message_id: &str) -> Result<Option<MessageTrace>, DatabaseError> {
        let steps = self.store.list_steps(message_id).await?;
        if steps.is_empty() && self.store.get_message(message_id).await?.is_none() {
            return Ok(None);
        }
        let summary = WorkflowSummary::from_steps(message_id, &steps);
        Ok(Some(MessageTrace { steps, summary }))
    }

    pub fn blacklisted_channels(&self) -> Vec<ChannelAccessState> {
        self.registry
            .as_ref()
            .map(|r| r.list_blacklisted())
            .unwrap_or_default()
    }

    /// Returns false when the channel had no recorded state.
    pub async fn clear_blacklist(&self, channel_id: &str) -> Result<bool, DatabaseError> {
        match &self.registry {
            Some(registry) => registry.clear(channel_id).await,
            None => Ok(false),
        }
    }
}
