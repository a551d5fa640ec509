//! Message processor: runs one stored message through the stages.
//!
//! Flow, each stage recorded by the [`WorkflowTracker`]:
//! 1. `prefilter` (no service call) → may short-circuit to a stored default
//! 2. `build_context` → recent channel history, referenced message
//! 3. `classify` → classification service
//! 4. `extract_signal` → only for relevant messages at or above the
//!    configured priority, otherwise recorded as skipped
//! 5. `save_result` → written back with `is_processed`
//!
//! Classification faults never fail the run: they are stored on the
//! message as `processing_error` next to the default result.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use super::prefilter::{PREFILTER_SKIP_SUMMARY, Prefilter, PrefilterDecision};
use super::tracker::{StepOutput, WorkflowTracker};
use super::types::{Analysis, ClassificationResult, ResultEvent, TradingSignal};
use crate::classifier::{AnalysisRequest, ClassificationClient};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::ResultSink;
use crate::store::{Database, StoredMessage};

/// Context messages shorter than this are left out.
const MIN_CONTEXT_CHARS: usize = 5;

pub const STEP_PREFILTER: &str = "prefilter";
pub const STEP_BUILD_CONTEXT: &str = "build_context";
pub const STEP_CLASSIFY: &str = "classify";
pub const STEP_EXTRACT_SIGNAL: &str = "extract_signal";
pub const STEP_SAVE_RESULT: &str = "save_result";

/// Context gathered for one message.
#[derive(Debug, Clone, Default)]
struct MessageContext {
    contents: Vec<String>,
    external_ids: Vec<String>,
    referenced_content: Option<String>,
}

pub struct MessageProcessor {
    store: Arc<dyn Database>,
    classifier: Arc<dyn ClassificationClient>,
    prefilter: Arc<Prefilter>,
    sink: Arc<dyn ResultSink>,
    context_limit: AtomicUsize,
    signal_min_priority: AtomicU8,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn Database>,
        classifier: Arc<dyn ClassificationClient>,
        prefilter: Arc<Prefilter>,
        sink: Arc<dyn ResultSink>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            prefilter,
            sink,
            context_limit: AtomicUsize::new(config.context_limit),
            signal_min_priority: AtomicU8::new(config.signal_min_priority),
        }
    }

    /// Pick up the stage settings of a new pipeline configuration.
    pub fn apply_config(&self, config: &PipelineConfig) {
        self.context_limit
            .store(config.context_limit, Ordering::Relaxed);
        self.signal_min_priority
            .store(config.signal_min_priority, Ordering::Relaxed);
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    /// Run every stage for `message_id` and store the result.
    pub async fn process(&self, message_id: &str) -> Result<ClassificationResult, PipelineError> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| PipelineError::MessageNotFound(message_id.to_string()))?;
        let tracker = WorkflowTracker::for_message(Arc::clone(&self.store), message_id).await?;

        let has_images = message.attachments.iter().any(|a| a.is_image());
        let decision = tracker
            .run_step(
                STEP_PREFILTER,
                json!({
                    "content": message.content,
                    "attachment_count": message.attachments.len(),
                }),
                async {
                    let decision = self.prefilter.evaluate(&message.content, has_images);
                    let reason = match decision {
                        PrefilterDecision::Pass => None,
                        PrefilterDecision::Skip(reason) => Some(reason.as_str()),
                    };
                    Ok(StepOutput::new(
                        decision,
                        json!({ "passed": decision.passed(), "reason": reason }),
                    ))
                },
            )
            .await?;

        let result = if decision.passed() {
            self.classify_message(&tracker, &message).await?
        } else {
            tracker
                .skip_step(
                    STEP_CLASSIFY,
                    PREFILTER_SKIP_SUMMARY,
                    json!({ "message_id": message.id }),
                )
                .await?;
            ClassificationResult::from_analysis(
                &Analysis::skipped(PREFILTER_SKIP_SUMMARY),
                None,
                Vec::new(),
            )
        };

        tracker
            .run_step(
                STEP_SAVE_RESULT,
                json!({
                    "is_relevant": result.is_relevant,
                    "priority": result.priority,
                    "error": result.error,
                }),
                async {
                    self.store.save_result(message_id, &result).await?;
                    Ok::<_, PipelineError>(StepOutput::new((), json!({ "saved": true })))
                },
            )
            .await?;

        info!(
            message_id,
            relevant = result.is_relevant,
            priority = result.priority,
            error = result.error.as_deref(),
            "Message processed"
        );
        self.sink
            .publish(ResultEvent::Classified {
                message_id: message.id.clone(),
                external_id: message.external_id.clone(),
                channel_id: message.channel_id.clone(),
                result: result.clone(),
                processed_at: Utc::now(),
            })
            .await;
        Ok(result)
    }

    async fn classify_message(
        &self,
        tracker: &WorkflowTracker,
        message: &StoredMessage,
    ) -> Result<ClassificationResult, PipelineError> {
        let context = tracker
            .run_step(
                STEP_BUILD_CONTEXT,
                json!({
                    "channel_id": message.channel_id,
                    "limit": self.context_limit.load(Ordering::Relaxed),
                }),
                async {
                    let context = self.build_context(message).await?;
                    let output = json!({
                        "context_count": context.contents.len(),
                        "context_message_ids": context.external_ids,
                        "has_reference": context.referenced_content.is_some(),
                        "attachment_count": message.attachments.len(),
                    });
                    Ok::<_, PipelineError>(StepOutput::new(context, output))
                },
            )
            .await?;

        let request = AnalysisRequest {
            content: message.content.clone(),
            context: context.contents.clone(),
            attachments: message.attachments.clone(),
            referenced_content: context.referenced_content.clone(),
        };
        let analysis = self.classify(tracker, &request).await?;

        let signal = self.extract_signal(tracker, message, &analysis).await?;
        Ok(ClassificationResult::from_analysis(
            &analysis,
            signal,
            context.external_ids,
        ))
    }

    /// Last `context_limit` channel messages before this one, oldest first.
    async fn build_context(&self, message: &StoredMessage) -> Result<MessageContext, PipelineError> {
        let limit = self.context_limit.load(Ordering::Relaxed);
        let recent = if limit == 0 {
            Vec::new()
        } else {
            self.store
                .get_recent_messages(&message.channel_id, message.created_at, limit)
                .await?
        };

        let mut context = MessageContext::default();
        for previous in recent.into_iter().rev() {
            if previous.content.trim().chars().count() > MIN_CONTEXT_CHARS {
                context.contents.push(previous.content);
                context.external_ids.push(previous.external_id);
            }
        }

        context.referenced_content = match (&message.referenced_content, &message.referenced_external_id)
        {
            (Some(content), _) if !content.trim().is_empty() => Some(content.clone()),
            (_, Some(external_id)) => self
                .store
                .get_message_by_external_id(external_id)
                .await?
                .map(|m| m.content)
                .filter(|c| !c.trim().is_empty()),
            _ => None,
        };
        debug!(
            message_id = %message.id,
            context = context.contents.len(),
            "Built message context"
        );
        Ok(context)
    }

    async fn classify(
        &self,
        tracker: &WorkflowTracker,
        request: &AnalysisRequest,
    ) -> Result<Analysis, PipelineError> {
        let mut step = tracker
            .enter(
                STEP_CLASSIFY,
                json!({
                    "content": request.content,
                    "context_count": request.context.len(),
                    "image_count": request.attachments.iter().filter(|a| a.is_image()).count(),
                    "referenced_content": request.referenced_content,
                }),
            )
            .await?;

        let analysis = self.classifier.analyze(request).await;
        let cost = self.classifier.cost(analysis.usage);
        step.add_detail("input_tokens", json!(analysis.usage.input_tokens));
        step.add_detail("output_tokens", json!(analysis.usage.output_tokens));

        match &analysis.error {
            Some(error) => {
                warn!(message_id = tracker.message_id(), error = %error, "Classification degraded");
                step.fail(error).await?;
            }
            None => {
                let output = serde_json::to_value(&analysis).unwrap_or_else(|_| json!({}));
                step.complete(output, 1, cost).await?;
            }
        }
        Ok(analysis)
    }

    async fn extract_signal(
        &self,
        tracker: &WorkflowTracker,
        message: &StoredMessage,
        analysis: &Analysis,
    ) -> Result<Option<TradingSignal>, PipelineError> {
        let min_priority = self.signal_min_priority.load(Ordering::Relaxed);
        let skip_reason = if analysis.error.is_some() {
            Some("classification failed")
        } else if !analysis.is_relevant {
            Some("not trading related")
        } else if analysis.priority < min_priority {
            Some("priority below signal threshold")
        } else {
            None
        };
        let input = json!({ "priority": analysis.priority, "min_priority": min_priority });
        if let Some(reason) = skip_reason {
            tracker.skip_step(STEP_EXTRACT_SIGNAL, reason, input).await?;
            return Ok(None);
        }

        let mut step = tracker.enter(STEP_EXTRACT_SIGNAL, input).await?;
        let extraction = self
            .classifier
            .extract_signal(&message.content, analysis)
            .await;
        let api_calls = u32::from(extraction.called);
        let cost = if extraction.called {
            self.classifier.cost(extraction.usage)
        } else {
            Decimal::ZERO
        };

        match &extraction.error {
            Some(error) => {
                step.add_detail("api_calls", json!(api_calls));
                step.fail(error).await?;
            }
            None => {
                step.complete(
                    json!({ "has_signal": extraction.signal.is_some(), "signal": extraction.signal }),
                    api_calls,
                    cost,
                )
                .await?;
            }
        }
        Ok(extraction.signal)
    }

    /// Record a run that could not finish and tell subscribers. Returns false
    /// when the message was already processed, in which case the stored
    /// result stands and nothing is published.
    pub async fn record_failure(&self, message_id: &str, error: &str) -> bool {
        match self.store.mark_failed(message_id, error).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(message_id, "Message already processed, failure not recorded");
                return false;
            }
            Err(e) => warn!(message_id, error = %e, "Failed to mark message as failed"),
        }
        self.sink
            .publish(ResultEvent::Failed {
                message_id: message_id.to_string(),
                error: error.to_string(),
            })
            .await;
        true
    }
}
