//! Shared types for the ingestion and classification pipeline.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound event ───────────────────────────────────────────────────

/// Raw chat event as delivered by the gateway or a poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Upstream event id. Duplicate deliveries carry the same id.
    pub id: String,
    pub channel_id: String,
    pub author: Author,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub referenced_event: Option<ReferencedEvent>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencedEvent {
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// File attached to an event. Either `url` or `bytes` carries the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing)]
    pub bytes: Option<Vec<u8>>,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "svg"];

impl Attachment {
    /// Image by declared content type, else by file extension.
    pub fn is_image(&self) -> bool {
        if let Some(ct) = &self.content_type
            && ct.to_ascii_lowercase().starts_with("image/")
        {
            return true;
        }
        Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// MIME type used when inlining bytes.
    pub fn mime_type(&self) -> String {
        if let Some(ct) = &self.content_type {
            return ct.clone();
        }
        let ext = Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "bmp" => "image/bmp",
            "webp" => "image/webp",
            "svg" => "image/svg+xml",
            _ => "application/octet-stream",
        }
        .to_string()
    }
}

// ── Processing task ─────────────────────────────────────────────────

/// Lowest task priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest task priority.
pub const MAX_PRIORITY: u8 = 5;
/// Priority used for operator-triggered reprocessing.
pub const DEFAULT_PRIORITY: u8 = MIN_PRIORITY;

/// Unit of work owned by the queue and worker pool until it is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingTask {
    pub message_id: String,
    /// Always within `MIN_PRIORITY..=MAX_PRIORITY`.
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl ProcessingTask {
    pub fn new(message_id: impl Into<String>, priority: u8) -> Self {
        Self {
            message_id: message_id.into(),
            priority: priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Token usage reported by the classification service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Output of `ClassificationClient::analyze`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub is_relevant: bool,
    pub priority: u8,
    pub category: String,
    pub keywords: Vec<String>,
    pub sentiment: String,
    pub confidence: f64,
    pub summary: String,
    /// Set when the service call or its response could not be used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl Analysis {
    /// The "could not classify" result, carrying `reason` as the error.
    pub fn unclassified(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            is_relevant: false,
            priority: MIN_PRIORITY,
            category: "Other".to_string(),
            keywords: Vec::new(),
            sentiment: "Neutral".to_string(),
            confidence: 0.0,
            summary: reason.clone(),
            error: Some(reason),
            usage: TokenUsage::default(),
        }
    }

    /// Result stored for messages the prefilter rejected. Not an error.
    pub fn skipped(summary: impl Into<String>) -> Self {
        Self {
            error: None,
            ..Self::unclassified(summary)
        }
    }
}

/// Concrete trade call extracted from a high-priority relevant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub signal_type: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub entry_price: Option<String>,
    #[serde(default)]
    pub target_price: Option<String>,
    #[serde(default)]
    pub stop_loss: Option<String>,
    #[serde(default)]
    pub time_frame: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
}

/// Final outcome written back to a message together with `is_processed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_relevant: bool,
    pub priority: u8,
    pub category: String,
    pub keywords: Vec<String>,
    pub sentiment: String,
    pub summary: String,
    pub confidence: f64,
    pub signal: Option<TradingSignal>,
    /// Upstream ids of the messages used as context.
    pub context_message_ids: Vec<String>,
    /// Stored as the message's `processing_error`.
    pub error: Option<String>,
}

impl ClassificationResult {
    pub fn from_analysis(
        analysis: &Analysis,
        signal: Option<TradingSignal>,
        context_message_ids: Vec<String>,
    ) -> Self {
        Self {
            is_relevant: analysis.is_relevant,
            priority: analysis.priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            category: analysis.category.clone(),
            keywords: analysis.keywords.clone(),
            sentiment: analysis.sentiment.clone(),
            summary: analysis.summary.clone(),
            confidence: analysis.confidence.clamp(0.0, 1.0),
            signal,
            context_message_ids,
            error: analysis.error.clone(),
        }
    }
}

// ── Result events ───────────────────────────────────────────────────

/// Published after a message reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultEvent {
    Classified {
        message_id: String,
        external_id: String,
        channel_id: String,
        result: ClassificationResult,
        processed_at: DateTime<Utc>,
    },
    Failed {
        message_id: String,
        error: String,
    },
}

impl ResultEvent {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Classified { message_id, .. } | Self::Failed { message_id, .. } => message_id,
        }
    }
}
