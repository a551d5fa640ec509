//! Tolerant parsing of classification service output.

use serde::Deserialize;
use serde_json::Value;

use crate::error::ClassifierError;
use crate::pipeline::types::{
    Analysis, MAX_PRIORITY, MIN_PRIORITY, TokenUsage, TradingSignal,
};

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default, alias = "is_trading_related")]
    is_relevant: Value,
    #[serde(default)]
    priority: Value,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    keywords: Value,
    #[serde(default)]
    sentiment: Option<String>,
    #[serde(default)]
    confidence: Value,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSignal {
    #[serde(default)]
    has_signal: Option<bool>,
    #[serde(default)]
    signal_type: Option<String>,
    #[serde(default)]
    symbols: Value,
    #[serde(default)]
    entry_price: Value,
    #[serde(default)]
    target_price: Value,
    #[serde(default)]
    stop_loss: Value,
    #[serde(default)]
    time_frame: Value,
    #[serde(default)]
    reasoning: Value,
    #[serde(default)]
    risk_level: Value,
}

/// Parse an analysis reply. Fields the service left out get the
/// "unclassified" defaults; priority and confidence are clamped.
pub fn parse_analysis(raw: &str) -> Result<Analysis, ClassifierError> {
    let json = checked_json(raw)?;
    let parsed: RawAnalysis = serde_json::from_str(&json)
        .map_err(|e| ClassifierError::InvalidResponse(format!("JSON parsing failed: {e}")))?;

    let priority = number(&parsed.priority)
        .filter(|p| p.is_finite())
        .map(|p| p.round().clamp(MIN_PRIORITY as f64, MAX_PRIORITY as f64) as u8)
        .unwrap_or(MIN_PRIORITY);

    Ok(Analysis {
        is_relevant: boolean(&parsed.is_relevant),
        priority,
        category: non_empty(parsed.category).unwrap_or_else(|| "Other".into()),
        keywords: strings(&parsed.keywords),
        sentiment: non_empty(parsed.sentiment).unwrap_or_else(|| "Neutral".into()),
        confidence: number(&parsed.confidence)
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(0.0),
        summary: parsed.summary.unwrap_or_default(),
        error: None,
        usage: TokenUsage::default(),
    })
}

/// Parse a signal reply. `has_signal: false` or a missing signal type
/// means no signal.
pub fn parse_signal(raw: &str) -> Result<Option<TradingSignal>, ClassifierError> {
    let json = checked_json(raw)?;
    let parsed: RawSignal = serde_json::from_str(&json)
        .map_err(|e| ClassifierError::InvalidResponse(format!("JSON parsing failed: {e}")))?;

    if parsed.has_signal == Some(false) {
        return Ok(None);
    }
    let Some(signal_type) = non_empty(parsed.signal_type) else {
        return Ok(None);
    };

    Ok(Some(TradingSignal {
        signal_type,
        symbols: strings(&parsed.symbols),
        entry_price: text(&parsed.entry_price),
        target_price: text(&parsed.target_price),
        stop_loss: text(&parsed.stop_loss),
        time_frame: text(&parsed.time_frame),
        reasoning: text(&parsed.reasoning),
        risk_level: text(&parsed.risk_level),
    }))
}

/// Reject empty and HTML bodies, then cut out the JSON object.
fn checked_json(raw: &str) -> Result<String, ClassifierError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ClassifierError::EmptyResponse);
    }
    if looks_like_html(trimmed) {
        return Err(ClassifierError::Misconfigured("HTML page returned".into()));
    }
    let json = extract_json_object(trimmed);
    if !json.starts_with('{') {
        return Err(ClassifierError::InvalidResponse(
            "JSON object not found".into(),
        ));
    }
    Ok(json)
}

/// A proxy or wrong base URL answers with a web page instead of JSON.
pub fn looks_like_html(text: &str) -> bool {
    let head: String = text.trim_start().chars().take(15).collect();
    let head = head.to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Extract a JSON object from model output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

// ── Value coercion ──────────────────────────────────────────────────

fn boolean(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(text).collect(),
        Value::String(s) => s
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(Some(s.clone())).filter(|s| !s.eq_ignore_ascii_case("null")),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
