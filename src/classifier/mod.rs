//! Classification service client.
//!
//! The pipeline talks to the classification service only through
//! [`ClassificationClient`]. Both calls degrade instead of failing: a bad
//! or missing response becomes [`Analysis::unclassified`] (or no signal)
//! with the error text preserved.

pub mod openai;
pub mod parse;
mod prompts;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::pipeline::types::{Analysis, Attachment, TokenUsage, TradingSignal};

pub use openai::OpenAiClassifier;

/// Everything the classifier sees about one message.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub content: String,
    /// Recent channel messages, oldest first.
    pub context: Vec<String>,
    pub attachments: Vec<Attachment>,
    pub referenced_content: Option<String>,
}

/// Result of a signal extraction call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalExtraction {
    pub signal: Option<TradingSignal>,
    pub usage: TokenUsage,
    /// Whether a service call was made.
    pub called: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait ClassificationClient: Send + Sync {
    /// Classify one message. Never fails; see [`Analysis::unclassified`].
    async fn analyze(&self, request: &AnalysisRequest) -> Analysis;

    /// Pull a concrete trade call out of a message already judged relevant.
    async fn extract_signal(&self, content: &str, analysis: &Analysis) -> SignalExtraction;

    /// Cost of a call with the given token usage.
    fn cost(&self, _usage: TokenUsage) -> Decimal {
        Decimal::ZERO
    }
}

/// Price `usage` at per-1k-token rates.
pub fn token_cost(usage: TokenUsage, input_per_1k: Decimal, output_per_1k: Decimal) -> Decimal {
    let thousand = Decimal::from(1000);
    Decimal::from(usage.input_tokens) / thousand * input_per_1k
        + Decimal::from(usage.output_tokens) / thousand * output_per_1k
}
