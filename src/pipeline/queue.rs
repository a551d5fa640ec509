//! Bounded ingestion queue of `ProcessingTask`s.
//!
//! Enqueue never waits: a full queue or an already-outstanding message id
//! is reported back to the caller immediately. A message id stays
//! outstanding from enqueue until the worker drops the task's
//! [`OutstandingTask`] guard, so the same message cannot be queued twice
//! while it is waiting or in flight.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::types::ProcessingTask;

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue is full (capacity {capacity})")]
    Full { capacity: usize },
    #[error("message already has an outstanding task")]
    Duplicate,
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: VecDeque<ProcessingTask>,
    outstanding: HashSet<String>,
}

pub struct IngestionQueue {
    capacity: usize,
    state: Arc<Mutex<QueueState>>,
    notify: Notify,
}

impl IngestionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `message_id` is queued or being processed.
    pub fn is_outstanding(&self, message_id: &str) -> bool {
        self.lock().outstanding.contains(message_id)
    }

    /// Non-blocking enqueue. On error the queue is left untouched.
    pub fn try_enqueue(&self, task: ProcessingTask) -> Result<(), EnqueueError> {
        {
            let mut state = self.lock();
            if state.outstanding.contains(&task.message_id) {
                return Err(EnqueueError::Duplicate);
            }
            if state.tasks.len() >= self.capacity {
                return Err(EnqueueError::Full {
                    capacity: self.capacity,
                });
            }
            state.outstanding.insert(task.message_id.clone());
            state.tasks.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait up to `wait` for one task, then take whatever else is ready, up
    /// to `max` tasks in arrival order. Empty when nothing arrived in time.
    pub async fn dequeue_batch(&self, max: usize, wait: Duration) -> Vec<OutstandingTask> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_ready(max.max(1));
            if !batch.is_empty() {
                return batch;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    fn take_ready(&self, max: usize) -> Vec<OutstandingTask> {
        let mut state = self.lock();
        let n = state.tasks.len().min(max);
        let batch: Vec<OutstandingTask> = state
            .tasks
            .drain(..n)
            .map(|task| OutstandingTask {
                task,
                state: Arc::clone(&self.state),
            })
            .collect();
        let more = !state.tasks.is_empty();
        drop(state);
        // Pass the wakeup on so another idle worker picks up the rest.
        if more {
            self.notify.notify_one();
        }
        batch
    }

    /// Remove every queued task without processing it.
    pub fn drain(&self) -> Vec<ProcessingTask> {
        let mut state = self.lock();
        let drained: Vec<ProcessingTask> = state.tasks.drain(..).collect();
        for task in &drained {
            state.outstanding.remove(&task.message_id);
        }
        drained
    }
}

/// A dequeued task. Dropping it releases the message id.
#[derive(Debug)]
pub struct OutstandingTask {
    task: ProcessingTask,
    state: Arc<Mutex<QueueState>>,
}

impl OutstandingTask {
    pub fn task(&self) -> &ProcessingTask {
        &self.task
    }

    pub fn priority(&self) -> u8 {
        self.task.priority
    }

    pub fn message_id(&self) -> &str {
        &self.task.message_id
    }
}

impl Drop for OutstandingTask {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.outstanding.remove(&self.task.message_id);
    }
}

/// Order a batch by priority, highest first. Stable, so equal priorities
/// keep arrival order.
pub fn sort_batch(batch: &mut [OutstandingTask]) {
    batch.sort_by(|a, b| b.priority().cmp(&a.priority()));
}
