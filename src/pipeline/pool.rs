//! Worker pool draining the ingestion queue.
//!
//! Each worker loop waits up to [`DEQUEUE_WAIT`] for work, drains a batch,
//! sorts it by priority and processes it sequentially. Per task: acquire a
//! rate-limit permit, re-check the message is still unprocessed, then run
//! the processor under the overall timeout.
//!
//! Workers of one start belong to a generation sharing one
//! `CancellationToken`. `stop()` cancels the generation and awaits every
//! loop, so a restart never overlaps old and new workers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::processor::MessageProcessor;
use super::queue::{EnqueueError, IngestionQueue, OutstandingTask, sort_batch};
use super::rate_limit::RateLimiter;
use super::types::ProcessingTask;
use crate::config::{PipelineConfig, PipelineConfigUpdate};
use crate::error::PipelineError;

/// Longest a worker blocks waiting for the first task of a batch.
pub const DEQUEUE_WAIT: Duration = Duration::from_secs(1);

/// Pause after a failed task before the worker continues.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Error stored for a run that exceeded the processing timeout.
fn timeout_error(timeout: Duration) -> String {
    PipelineError::Timeout(timeout).to_string()
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    already_processed: AtomicU64,
}

/// Live pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub running: bool,
    pub active_workers: usize,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub total_enqueued: u64,
    pub total_dropped: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    pub total_already_processed: u64,
    pub rate_limit_per_minute: usize,
    pub calls_in_window: usize,
}

enum TaskOutcome {
    Processed,
    AlreadyProcessed,
    Failed,
    Cancelled,
}

/// State shared by the pool handle and every worker.
struct Shared {
    processor: Arc<MessageProcessor>,
    limiter: RateLimiter,
    /// Replaced on capacity change; the write lock blocks enqueues during
    /// the swap.
    queue: RwLock<Arc<IngestionQueue>>,
    config: RwLock<PipelineConfig>,
    counters: Counters,
    active: AtomicUsize,
}

impl Shared {
    fn queue(&self) -> Arc<IngestionQueue> {
        Arc::clone(&self.queue.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn config(&self) -> PipelineConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Decrements the active worker count when a loop exits, however it exits.
struct ActiveWorker(Arc<Shared>);

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Generation {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    /// Serializes start, stop and reconfigure.
    lifecycle: Mutex<Option<Generation>>,
}

impl WorkerPool {
    pub fn new(processor: Arc<MessageProcessor>, config: PipelineConfig) -> Self {
        let shared = Shared {
            processor,
            limiter: RateLimiter::per_minute(config.rate_limit_per_minute),
            queue: RwLock::new(Arc::new(IngestionQueue::new(config.max_queue_size))),
            config: RwLock::new(config),
            counters: Counters::default(),
            active: AtomicUsize::new(0),
        };
        Self {
            shared: Arc::new(shared),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> PipelineConfig {
        self.shared.config()
    }

    /// Non-blocking enqueue. A full queue is counted as a drop and logged.
    pub fn enqueue(&self, message_id: &str, priority: u8) -> Result<(), EnqueueError> {
        let task = ProcessingTask::new(message_id, priority);
        let result = {
            let queue = self.shared.queue.read().unwrap_or_else(|e| e.into_inner());
            queue.try_enqueue(task)
        };
        match result {
            Ok(()) => {
                self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                debug!(message_id, priority, "Task enqueued");
            }
            Err(EnqueueError::Full { capacity }) => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(message_id, capacity, "Ingestion queue full, task dropped");
            }
            Err(EnqueueError::Duplicate) => {
                debug!(message_id, "Task already outstanding");
            }
        }
        result
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    /// Start the configured number of workers. No-op when running.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_none() {
            *lifecycle = Some(self.spawn_generation());
        }
    }

    /// Cancel every worker and wait for all of them to exit.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(generation) = lifecycle.take() {
            Self::stop_generation(generation).await;
        }
    }

    fn spawn_generation(&self) -> Generation {
        let workers = self.shared.config().max_workers.max(1);
        let cancel = CancellationToken::new();
        // Counted before spawning so stats are exact once start() returns.
        self.shared.active.fetch_add(workers, Ordering::SeqCst);
        let handles = (0..workers)
            .map(|worker_id| {
                let active = ActiveWorker(Arc::clone(&self.shared));
                tokio::spawn(worker_loop(
                    Arc::clone(&self.shared),
                    worker_id,
                    cancel.clone(),
                    active,
                ))
            })
            .collect();
        info!(workers, "Worker pool started");
        Generation { cancel, handles }
    }

    async fn stop_generation(generation: Generation) {
        generation.cancel.cancel();
        let workers = generation.handles.len();
        for result in join_all(generation.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!(workers, "Worker pool stopped");
    }

    /// Validate and apply a partial config update. A running pool is
    /// stopped and restarted around the change.
    pub async fn reconfigure(
        &self,
        update: &PipelineConfigUpdate,
    ) -> Result<PipelineConfig, PipelineError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let current = self.shared.config();
        let next = update.apply_to(&current);
        next.validate()?;

        let was_running = lifecycle.is_some();
        if let Some(generation) = lifecycle.take() {
            Self::stop_generation(generation).await;
        }

        if next.max_queue_size != current.max_queue_size {
            self.swap_queue(next.max_queue_size);
        }
        self.shared.limiter.set_limit(next.rate_limit_per_minute);
        self.shared.processor.apply_config(&next);
        *self
            .shared
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner()) = next.clone();
        info!(
            max_workers = next.max_workers,
            batch_size = next.batch_size,
            rate_limit_per_minute = next.rate_limit_per_minute,
            max_queue_size = next.max_queue_size,
            processing_timeout_secs = next.processing_timeout_secs,
            "Pipeline reconfigured"
        );

        if was_running {
            *lifecycle = Some(self.spawn_generation());
        }
        Ok(next)
    }

    /// Move queued tasks into a fresh queue of `capacity`. Tasks that do not
    /// fit are dropped with a warning.
    fn swap_queue(&self, capacity: usize) {
        let mut slot = self.shared.queue.write().unwrap_or_else(|e| e.into_inner());
        let pending = slot.drain();
        let fresh = IngestionQueue::new(capacity);
        let mut dropped = 0u64;
        for task in pending {
            let message_id = task.message_id.clone();
            if fresh.try_enqueue(task).is_err() {
                dropped += 1;
                warn!(%message_id, capacity, "Task dropped while resizing queue");
            }
        }
        if dropped > 0 {
            self.shared
                .counters
                .dropped
                .fetch_add(dropped, Ordering::Relaxed);
        }
        info!(capacity, kept = fresh.len(), dropped, "Ingestion queue resized");
        *slot = Arc::new(fresh);
    }

    /// Discard every queued task. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let cleared = self.shared.queue().drain().len();
        info!(cleared, "Ingestion queue cleared");
        cleared
    }

    pub async fn stats(&self) -> PoolStats {
        let queue = self.shared.queue();
        let counters = &self.shared.counters;
        PoolStats {
            running: self.is_running().await,
            active_workers: self.shared.active.load(Ordering::SeqCst),
            queue_size: queue.len(),
            queue_capacity: queue.capacity(),
            total_enqueued: counters.enqueued.load(Ordering::Relaxed),
            total_dropped: counters.dropped.load(Ordering::Relaxed),
            total_processed: counters.processed.load(Ordering::Relaxed),
            total_failed: counters.failed.load(Ordering::Relaxed),
            total_timed_out: counters.timed_out.load(Ordering::Relaxed),
            total_already_processed: counters.already_processed.load(Ordering::Relaxed),
            rate_limit_per_minute: self.shared.limiter.limit(),
            calls_in_window: self.shared.limiter.in_window_now(),
        }
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    worker_id: usize,
    cancel: CancellationToken,
    _active: ActiveWorker,
) {
    debug!(worker_id, "Worker started");
    while !cancel.is_cancelled() {
        let queue = shared.queue();
        let batch_size = shared.config().batch_size;
        let mut batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = queue.dequeue_batch(batch_size, DEQUEUE_WAIT) => batch,
        };
        if batch.is_empty() {
            continue;
        }
        sort_batch(&mut batch);
        debug!(worker_id, size = batch.len(), "Processing batch");

        let mut remaining = batch.into_iter();
        for task in remaining.by_ref() {
            let outcome = process_task(&shared, &task, &cancel).await;
            match outcome {
                TaskOutcome::Cancelled => {
                    requeue(&shared, task);
                    break;
                }
                TaskOutcome::Failed => {
                    drop(task);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
                TaskOutcome::Processed | TaskOutcome::AlreadyProcessed => drop(task),
            }
            tokio::task::yield_now().await;
        }
        // Whatever a cancelled worker did not reach goes back to the queue.
        for task in remaining {
            requeue(&shared, task);
        }
    }
    debug!(worker_id, "Worker stopped");
}

/// Put an unstarted task back so a later generation picks it up.
fn requeue(shared: &Shared, task: OutstandingTask) {
    let retry = task.task().clone();
    // Releases the outstanding id first.
    drop(task);
    if let Err(e) = shared.queue().try_enqueue(retry.clone()) {
        warn!(message_id = %retry.message_id, error = %e, "Could not requeue task");
    }
}

async fn process_task(
    shared: &Shared,
    task: &OutstandingTask,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let message_id = task.message_id();

    tokio::select! {
        _ = cancel.cancelled() => return TaskOutcome::Cancelled,
        _ = shared.limiter.acquire() => {}
    }

    match shared.processor.store().get_message(message_id).await {
        Ok(Some(message)) if message.is_processed => {
            shared
                .counters
                .already_processed
                .fetch_add(1, Ordering::Relaxed);
            debug!(message_id, "Message already processed, skipping");
            return TaskOutcome::AlreadyProcessed;
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(message_id, "Queued message no longer exists");
            return TaskOutcome::Failed;
        }
        Err(e) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(message_id, error = %e, "Failed to load queued message");
            return TaskOutcome::Failed;
        }
    }

    let timeout = shared.config().processing_timeout();
    let run = tokio::time::timeout(timeout, shared.processor.process(message_id));
    let result = tokio::select! {
        _ = cancel.cancelled() => return TaskOutcome::Cancelled,
        result = run => result,
    };

    match result {
        Ok(Ok(_)) => {
            shared.counters.processed.fetch_add(1, Ordering::Relaxed);
            TaskOutcome::Processed
        }
        Ok(Err(e)) => {
            error!(message_id, error = %e, "Message processing failed");
            let recorded = shared
                .processor
                .record_failure(message_id, &e.to_string())
                .await;
            failure_outcome(shared, recorded)
        }
        Err(_) => {
            shared.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            let error = timeout_error(timeout);
            warn!(message_id, timeout_secs = timeout.as_secs(), "Message processing timed out");
            if let Err(e) = shared
                .processor
                .store()
                .fail_open_steps(message_id, &error)
                .await
            {
                warn!(message_id, error = %e, "Failed to close open steps");
            }
            let recorded = shared.processor.record_failure(message_id, &error).await;
            failure_outcome(shared, recorded)
        }
    }
}

/// A failure that lost the race to a committed result counts as processed.
fn failure_outcome(shared: &Shared, recorded: bool) -> TaskOutcome {
    if recorded {
        shared.counters.failed.fetch_add(1, Ordering::Relaxed);
        TaskOutcome::Failed
    } else {
        shared.counters.processed.fetch_add(1, Ordering::Relaxed);
        TaskOutcome::Processed
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::classifier::{AnalysisRequest, ClassificationClient, SignalExtraction};
    use crate::events::{ResultBroadcaster, ResultSink};
    use crate::pipeline::prefilter::Prefilter;
    use crate::pipeline::processor::tests::{MockClassifier, event, relevant};
    use crate::pipeline::tracker::StepStatus;
    use crate::pipeline::types::{Analysis, ResultEvent};
    use crate::store::{Database, LibSqlBackend};

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    struct SlowClassifier;

    #[async_trait]
    impl ClassificationClient for SlowClassifier {
        async fn analyze(&self, _request: &AnalysisRequest) -> Analysis {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Analysis::unclassified("unreachable")
        }

        async fn extract_signal(&self, _content: &str, _analysis: &Analysis) -> SignalExtraction {
            SignalExtraction::default()
        }
    }

    async fn pool_with(
        classifier: Arc<dyn ClassificationClient>,
        config: PipelineConfig,
    ) -> (Arc<dyn Database>, WorkerPool, Arc<ResultBroadcaster>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sink = Arc::new(ResultBroadcaster::new());
        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&store),
            classifier,
            Arc::new(Prefilter::new().unwrap()),
            Arc::clone(&sink) as Arc<dyn ResultSink>,
            &config,
        ));
        (store, WorkerPool::new(processor, config), sink)
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            rate_limit_per_minute: 1000,
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn processes_enqueued_messages() {
        let classifier = Arc::new(MockClassifier::returning(relevant(2)));
        let (store, pool, sink) = pool_with(classifier, config()).await;
        let mut rx = sink.subscribe();

        let id = store
            .insert_message(&event("e1", "BTC pumping hard", 0))
            .await
            .unwrap()
            .id()
            .to_string();
        pool.enqueue(&id, 3).unwrap();
        pool.start().await;

        let published = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(published, ResultEvent::Classified { .. }));
        assert!(store.get_message(&id).await.unwrap().unwrap().is_processed);

        pool.stop().await;
        let stats = pool.stats().await;
        assert!(!stats.running);
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.total_processed, 1);
    }

    #[tokio::test]
    async fn already_processed_message_is_not_reclassified() {
        let classifier = Arc::new(MockClassifier::returning(relevant(2)));
        let (store, pool, _) = pool_with(
            Arc::clone(&classifier) as Arc<dyn ClassificationClient>,
            config(),
        )
        .await;
        let id = store
            .insert_message(&event("e1", "BTC pumping hard", 0))
            .await
            .unwrap()
            .id()
            .to_string();
        pool.shared.processor.process(&id).await.unwrap();

        pool.enqueue(&id, 3).unwrap();
        pool.start().await;
        tokio::time::timeout(TEST_TIMEOUT, async {
            while pool.stats().await.total_already_processed == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        pool.stop().await;
        assert_eq!(classifier.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_and_counts_drop() {
        let classifier = Arc::new(MockClassifier::returning(relevant(1)));
        let (_, pool, _) = pool_with(
            classifier,
            PipelineConfig {
                max_queue_size: 2,
                ..config()
            },
        )
        .await;
        pool.enqueue("a", 1).unwrap();
        pool.enqueue("b", 1).unwrap();
        assert_eq!(
            pool.enqueue("c", 5),
            Err(EnqueueError::Full { capacity: 2 })
        );
        let stats = pool.stats().await;
        assert_eq!(stats.queue_size, 2);
        assert_eq!(stats.total_dropped, 1);
    }

    #[tokio::test]
    async fn reconfigure_from_five_to_two_workers() {
        let classifier = Arc::new(MockClassifier::returning(relevant(1)));
        let (_, pool, _) = pool_with(classifier, config()).await;
        pool.start().await;
        assert_eq!(pool.stats().await.active_workers, 5);

        let applied = pool
            .reconfigure(&PipelineConfigUpdate {
                max_workers: Some(2),
                ..PipelineConfigUpdate::default()
            })
            .await
            .unwrap();
        assert_eq!(applied.max_workers, 2);

        let stats = pool.stats().await;
        assert!(stats.running);
        assert_eq!(stats.active_workers, 2);
        {
            let lifecycle = pool.lifecycle.lock().await;
            assert_eq!(lifecycle.as_ref().unwrap().handles.len(), 2);
        }

        pool.stop().await;
        assert_eq!(pool.stats().await.active_workers, 0);
    }

    #[tokio::test]
    async fn shrinking_queue_drops_overflow() {
        let classifier = Arc::new(MockClassifier::returning(relevant(1)));
        let (_, pool, _) = pool_with(classifier, config()).await;
        for id in ["a", "b", "c", "d"] {
            pool.enqueue(id, 1).unwrap();
        }
        pool.reconfigure(&PipelineConfigUpdate {
            max_queue_size: Some(3),
            ..PipelineConfigUpdate::default()
        })
        .await
        .unwrap();

        let stats = pool.stats().await;
        assert!(!stats.running);
        assert_eq!(stats.queue_capacity, 3);
        assert_eq!(stats.queue_size, 3);
        assert_eq!(stats.total_dropped, 1);
    }

    #[tokio::test]
    async fn invalid_update_is_rejected() {
        let classifier = Arc::new(MockClassifier::returning(relevant(1)));
        let (_, pool, _) = pool_with(classifier, config()).await;
        let err = pool
            .reconfigure(&PipelineConfigUpdate {
                batch_size: Some(0),
                ..PipelineConfigUpdate::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
        assert_eq!(pool.config().batch_size, 20);
    }

    #[tokio::test]
    async fn clear_discards_queued_tasks() {
        let classifier = Arc::new(MockClassifier::returning(relevant(1)));
        let (_, pool, _) = pool_with(classifier, config()).await;
        pool.enqueue("a", 1).unwrap();
        pool.enqueue("b", 2).unwrap();
        assert_eq!(pool.clear(), 2);
        assert_eq!(pool.stats().await.queue_size, 0);
        // Cleared ids are no longer outstanding.
        pool.enqueue("a", 1).unwrap();
    }

    #[tokio::test]
    async fn timeout_fails_task_and_closes_steps() {
        let (store, pool, sink) = pool_with(
            Arc::new(SlowClassifier),
            PipelineConfig {
                processing_timeout_secs: 1,
                ..config()
            },
        )
        .await;
        let mut rx = sink.subscribe();
        let id = store
            .insert_message(&event("e1", "BTC pumping hard", 0))
            .await
            .unwrap()
            .id()
            .to_string();
        pool.enqueue(&id, 1).unwrap();
        pool.start().await;

        let published = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        match published {
            ResultEvent::Failed { error, .. } => assert!(error.contains("timed out")),
            other => panic!("unexpected event: {other:?}"),
        }
        pool.stop().await;

        let stored = store.get_message(&id).await.unwrap().unwrap();
        assert!(!stored.is_processed);
        assert!(stored.processing_error.unwrap().contains("timed out"));
        let steps = store.list_steps(&id).await.unwrap();
        assert!(steps.iter().all(|s| s.status.is_terminal()));
        assert!(steps.iter().any(|s| s.status == StepStatus::Failed));
        assert_eq!(pool.stats().await.total_timed_out, 1);
    }
}
