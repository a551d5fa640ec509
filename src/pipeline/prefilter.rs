//! Cheap checks run before any classification call.
//!
//! Rejects reactions, greetings and very short chatter, and computes the
//! initial queue priority of a new message:
//! - base 1
//! - +1 when it replies to another message
//! - +1 when it carries an image
//! - +1 when it mentions a trading keyword

use regex::Regex;
use tracing::debug;

use super::types::{MAX_PRIORITY, MIN_PRIORITY};

/// Summary stored for messages the prefilter rejected.
pub const PREFILTER_SKIP_SUMMARY: &str = "Message did not pass prefilter";

const MIN_CONTENT_CHARS: usize = 5;
const MAX_REACTION_CHARS: usize = 10;
/// Longer messages are classified even without a keyword.
const LONG_MESSAGE_CHARS: usize = 50;

const REACTION_EMOJI: &[&str] = &[
    "😀", "😂", "🤣", "😊", "😍", "🔥", "💯", "👍", "👎", "❤️", "💰", "🚀", "📈", "📉",
];

const GREETINGS: &[&str] = &[
    "gm",
    "gn",
    "good morning",
    "good night",
    "hello",
    "hi",
    "bye",
    "thanks",
    "thx",
];

/// Matched on word boundaries, case-insensitive.
const TRADING_WORDS: &[&str] = &[
    // assets
    "btc", "bitcoin", "eth", "ethereum", "usdt", "bnb", "ada", "dot", "sol", "doge",
    // orders
    "buy", "sell", "long", "short", "entry", "exit", "tp", "sl",
    // price action
    "price", "pump", "dump", "breakout", "support", "resistance",
    // indicators
    "ma", "rsi", "macd", "kdj",
    // market
    "market", "trend", "bull", "bear", "bullish", "bearish",
];

/// Matched anywhere in the text.
const TRADING_TERMS_CJK: &[&str] = &[
    "买", "卖", "做多", "做空", "入场", "出场", "价格", "涨", "跌", "突破", "支撑", "阻力",
    "市场", "行情", "趋势", "牛市", "熊市",
];

/// Why a message was not sent to classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooShort,
    Reaction,
    Greeting,
    NotTradingRelated,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooShort => "too_short",
            Self::Reaction => "emoji_reaction",
            Self::Greeting => "greeting",
            Self::NotTradingRelated => "no_trading_keywords",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefilterDecision {
    Pass,
    Skip(SkipReason),
}

impl PrefilterDecision {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

pub struct Prefilter {
    /// `None` when the vocabulary is empty.
    keywords: Option<Regex>,
}

impl Prefilter {
    /// Prefilter with the built-in trading vocabulary.
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_keywords(TRADING_WORDS, TRADING_TERMS_CJK)
    }

    /// `words` match on word boundaries, `terms` anywhere.
    pub fn with_keywords(words: &[&str], terms: &[&str]) -> Result<Self, regex::Error> {
        let mut alternatives = Vec::new();
        if !words.is_empty() {
            let words: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
            alternatives.push(format!(r"\b(?:{})\b", words.join("|")));
        }
        alternatives.extend(terms.iter().map(|t| regex::escape(t)));
        if alternatives.is_empty() {
            return Ok(Self { keywords: None });
        }
        Ok(Self {
            keywords: Some(Regex::new(&format!("(?i){}", alternatives.join("|")))?),
        })
    }

    pub fn has_trading_keywords(&self, content: &str) -> bool {
        self.keywords.as_ref().is_some_and(|k| k.is_match(content))
    }

    pub fn evaluate(&self, content: &str, has_images: bool) -> PrefilterDecision {
        if has_images {
            return PrefilterDecision::Pass;
        }
        let trimmed = content.trim();
        let chars = trimmed.chars().count();
        let decision = if chars < MIN_CONTENT_CHARS {
            PrefilterDecision::Skip(SkipReason::TooShort)
        } else if chars <= MAX_REACTION_CHARS && REACTION_EMOJI.iter().any(|e| trimmed.contains(e))
        {
            PrefilterDecision::Skip(SkipReason::Reaction)
        } else if GREETINGS.contains(&trimmed.to_lowercase().as_str()) {
            PrefilterDecision::Skip(SkipReason::Greeting)
        } else if self.has_trading_keywords(trimmed) || chars > LONG_MESSAGE_CHARS {
            PrefilterDecision::Pass
        } else {
            PrefilterDecision::Skip(SkipReason::NotTradingRelated)
        };
        if let PrefilterDecision::Skip(reason) = decision {
            debug!(reason = reason.as_str(), "Prefilter rejected message");
        }
        decision
    }

    /// Queue priority for a newly ingested message.
    pub fn initial_priority(&self, content: &str, is_reply: bool, has_images: bool) -> u8 {
        let mut priority = MIN_PRIORITY;
        if is_reply {
            priority += 1;
        }
        if has_images {
            priority += 1;
        }
        if self.has_trading_keywords(content) {
            priority += 1;
        }
        priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
    }
}
