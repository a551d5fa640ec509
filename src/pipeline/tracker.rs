//! Per-message step trace.
//!
//! Each pipeline stage of a message becomes one `PipelineStepRecord`,
//! numbered 1, 2, 3… per message (numbering continues across reprocessing
//! runs). A step is inserted as `processing` when it starts and finalized
//! exactly once as `completed`, `failed` or `skipped`.
//!
//! [`StepGuard`] finalizes a started step on every exit path: dropping it
//! unfinished (early return, panic, cancellation by a timeout) records the
//! step as failed.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, PipelineError};
use crate::store::Database;

/// Longest string kept verbatim in step inputs and outputs.
const MAX_TRACE_STRING: usize = 2000;

/// Arrays of byte-sized integers longer than this are stored as a size.
const MAX_TRACE_BYTES: usize = 64;

/// Error recorded for a step whose guard was dropped before finishing.
pub const ABANDONED_STEP_ERROR: &str = "step abandoned before completion";

// ── Step record ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// One durable trace entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStepRecord {
    pub id: String,
    pub message_id: String,
    pub step_name: String,
    pub step_order: u32,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub processing_details: Value,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub api_calls: u32,
    pub cost_units: Decimal,
}

// ── Tracker ─────────────────────────────────────────────────────────

/// A started, not yet finalized step. Consumed by exactly one of
/// `complete_step` / `fail_step`.
#[derive(Debug)]
pub struct StepHandle {
    record: PipelineStepRecord,
    started: Instant,
    details: Map<String, Value>,
}

impl StepHandle {
    pub fn step_order(&self) -> u32 {
        self.record.step_order
    }

    pub fn step_name(&self) -> &str {
        &self.record.step_name
    }

    /// Attach a key to the step's `processing_details`.
    pub fn add_detail(&mut self, key: &str, value: Value) {
        self.details.insert(key.to_string(), make_json_safe(value));
    }

    fn finish(
        mut self,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> PipelineStepRecord {
        let end = Utc::now();
        let mut details = match self.record.processing_details.take() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        details.extend(self.details);
        self.record.status = status;
        self.record.output = output.map(make_json_safe);
        self.record.error = error;
        self.record.processing_details = Value::Object(details);
        self.record.end_time = Some(end);
        self.record.duration_ms = Some(self.started.elapsed().as_millis() as i64);
        self.record
    }
}

/// Records the stages of one message's processing run.
pub struct WorkflowTracker {
    store: Arc<dyn Database>,
    message_id: String,
    next_order: AtomicU32,
}

impl WorkflowTracker {
    /// Tracker continuing after any steps already recorded for the message.
    pub async fn for_message(
        store: Arc<dyn Database>,
        message_id: &str,
    ) -> Result<Self, DatabaseError> {
        let last = store.max_step_order(message_id).await?;
        Ok(Self {
            store,
            message_id: message_id.to_string(),
            next_order: AtomicU32::new(last + 1),
        })
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    fn new_record(&self, name: &str, status: StepStatus, input: Value) -> PipelineStepRecord {
        PipelineStepRecord {
            id: Uuid::new_v4().to_string(),
            message_id: self.message_id.clone(),
            step_name: name.to_string(),
            step_order: self.next_order.load(Ordering::SeqCst),
            status,
            input: make_json_safe(input),
            output: None,
            processing_details: json!({}),
            error: None,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            api_calls: 0,
            cost_units: Decimal::ZERO,
        }
    }

    /// Persist the record, then claim its order number.
    async fn append(&self, record: &PipelineStepRecord) -> Result<(), DatabaseError> {
        self.store.insert_step(record).await?;
        self.next_order.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn start_step(&self, name: &str, input: Value) -> Result<StepHandle, DatabaseError> {
        let record = self.new_record(name, StepStatus::Processing, input);
        self.append(&record).await?;
        debug!(
            message_id = %self.message_id,
            step = name,
            order = record.step_order,
            "Step started"
        );
        Ok(StepHandle {
            record,
            started: Instant::now(),
            details: Map::new(),
        })
    }

    pub async fn complete_step(
        &self,
        handle: StepHandle,
        output: Value,
        api_calls: u32,
        cost: Decimal,
    ) -> Result<(), DatabaseError> {
        let mut record = handle.finish(StepStatus::Completed, Some(output), None);
        record.api_calls = api_calls;
        record.cost_units = cost;
        self.store.finish_step(&record).await?;
        Ok(())
    }

    pub async fn fail_step(&self, handle: StepHandle, error: &str) -> Result<(), DatabaseError> {
        let record = handle.finish(StepStatus::Failed, None, Some(error.to_string()));
        warn!(
            message_id = %self.message_id,
            step = %record.step_name,
            error,
            "Step failed"
        );
        self.store.finish_step(&record).await?;
        Ok(())
    }

    /// Record a stage that did not run.
    pub async fn skip_step(
        &self,
        name: &str,
        reason: &str,
        input: Value,
    ) -> Result<u32, DatabaseError> {
        let mut record = self.new_record(name, StepStatus::Skipped, input);
        record.end_time = Some(record.start_time);
        record.duration_ms = Some(0);
        record.processing_details = json!({ "skip_reason": reason });
        self.append(&record).await?;
        debug!(message_id = %self.message_id, step = name, reason, "Step skipped");
        Ok(record.step_order)
    }

    /// Start a step wrapped in a guard that finalizes it on drop.
    pub async fn enter(&self, name: &str, input: Value) -> Result<StepGuard<'_>, DatabaseError> {
        let handle = self.start_step(name, input).await?;
        Ok(StepGuard {
            tracker: self,
            handle: Some(handle),
        })
    }

    /// Run `stage` as one step: completed on `Ok`, failed on `Err`, and
    /// failed by the guard if the future is dropped mid-way.
    pub async fn run_step<T, F>(&self, name: &str, input: Value, stage: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<StepOutput<T>, PipelineError>>,
    {
        let guard = self.enter(name, input).await?;
        match stage.await {
            Ok(out) => {
                guard.complete(out.output, out.api_calls, out.cost).await?;
                Ok(out.value)
            }
            Err(e) => {
                guard.fail(&e.to_string()).await?;
                Err(e)
            }
        }
    }
}

/// What a stage run through [`WorkflowTracker::run_step`] hands back.
#[derive(Debug)]
pub struct StepOutput<T> {
    pub value: T,
    pub output: Value,
    pub api_calls: u32,
    pub cost: Decimal,
}

impl<T> StepOutput<T> {
    pub fn new(value: T, output: Value) -> Self {
        Self {
            value,
            output,
            api_calls: 0,
            cost: Decimal::ZERO,
        }
    }

    pub fn with_cost(mut self, api_calls: u32, cost: Decimal) -> Self {
        self.api_calls = api_calls;
        self.cost = cost;
        self
    }
}

/// Scope object for a running step.
pub struct StepGuard<'a> {
    tracker: &'a WorkflowTracker,
    handle: Option<StepHandle>,
}

impl StepGuard<'_> {
    pub fn add_detail(&mut self, key: &str, value: Value) {
        if let Some(handle) = self.handle.as_mut() {
            handle.add_detail(key, value);
        }
    }

    pub async fn complete(
        mut self,
        output: Value,
        api_calls: u32,
        cost: Decimal,
    ) -> Result<(), DatabaseError> {
        match self.handle.take() {
            Some(handle) => {
                self.tracker
                    .complete_step(handle, output, api_calls, cost)
                    .await
            }
            None => Ok(()),
        }
    }

    pub async fn fail(mut self, error: &str) -> Result<(), DatabaseError> {
        match self.handle.take() {
            Some(handle) => self.tracker.fail_step(handle, error).await,
            None => Ok(()),
        }
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        let exception = if std::thread::panicking() {
            "panic"
        } else {
            "cancelled"
        };
        handle.add_detail("exception_type", json!(exception));
        let record = handle.finish(
            StepStatus::Failed,
            None,
            Some(ABANDONED_STEP_ERROR.to_string()),
        );
        let store = Arc::clone(&self.tracker.store);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = store.finish_step(&record).await {
                        warn!(step_id = %record.id, error = %e, "Failed to finalize abandoned step");
                    }
                });
            }
            Err(_) => {
                warn!(step_id = %record.id, "No runtime to finalize abandoned step");
            }
        }
    }
}

// ── Summary ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub step_order: u32,
    pub step_name: String,
    pub status: StepStatus,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

/// Aggregate view over all steps of one message.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub message_id: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub processing_steps: usize,
    pub total_duration_ms: i64,
    pub total_api_calls: u32,
    pub total_cost: Decimal,
    pub steps: Vec<StepSummary>,
}

impl WorkflowSummary {
    pub fn from_steps(message_id: &str, steps: &[PipelineStepRecord]) -> Self {
        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();
        Self {
            message_id: message_id.to_string(),
            total_steps: steps.len(),
            completed_steps: count(StepStatus::Completed),
            failed_steps: count(StepStatus::Failed),
            skipped_steps: count(StepStatus::Skipped),
            processing_steps: count(StepStatus::Processing),
            total_duration_ms: steps.iter().filter_map(|s| s.duration_ms).sum(),
            total_api_calls: steps.iter().map(|s| s.api_calls).sum(),
            total_cost: steps.iter().map(|s| s.cost_units).sum(),
            steps: steps
                .iter()
                .map(|s| StepSummary {
                    step_order: s.step_order,
                    step_name: s.step_name.clone(),
                    status: s.status,
                    duration_ms: s.duration_ms,
                    error: s.error.clone(),
                })
                .collect(),
        }
    }
}

pub async fn get_summary(
    store: &dyn Database,
    message_id: &str,
) -> Result<WorkflowSummary, DatabaseError> {
    let steps = store.list_steps(message_id).await?;
    Ok(WorkflowSummary::from_steps(message_id, &steps))
}

// ── JSON sanitizing ─────────────────────────────────────────────────

/// Make a value fit for the trace: binary payloads become
/// `{"type": "binary_data", "size": n}`, long strings are truncated.
pub fn make_json_safe(value: Value) -> Value {
    match value {
        Value::String(s) => sanitize_string(s),
        Value::Array(items) => {
            let is_bytes = items.len() > MAX_TRACE_BYTES
                && items
                    .iter()
                    .all(|v| v.as_u64().map(|n| n <= u8::MAX as u64).unwrap_or(false));
            if is_bytes {
                json!({ "type": "binary_data", "size": items.len() })
            } else {
                Value::Array(items.into_iter().map(make_json_safe).collect())
            }
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, make_json_safe(v)))
                .collect(),
        ),
        other => other,
    }
}

fn sanitize_string(s: String) -> Value {
    if s.starts_with("data:") && s.contains(";base64,") {
        return json!({ "type": "binary_data", "size": s.len() });
    }
    let chars = s.chars().count();
    if chars > MAX_TRACE_STRING {
        let kept: String = s.chars().take(MAX_TRACE_STRING).collect();
        return Value::String(format!(
            "{kept}…[truncated {} chars]",
            chars - MAX_TRACE_STRING
        ));
    }
    Value::String(s)
}
