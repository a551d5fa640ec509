use super::AnalysisRequest;

/// Context messages included in the analysis prompt.
const PROMPT_CONTEXT_MESSAGES: usize = 3;

pub(crate) const ANALYSIS_SYSTEM_PROMPT: &str = "\
You are a professional cryptocurrency trading message analyst. Analyze chat \
messages and decide whether they are trading related.

Reply with a single JSON object with these fields:
- is_trading_related: boolean
- priority: integer from 1 (lowest) to 5 (highest)
- keywords: array of strings
- category: one of \"Trading Signal\", \"Market Analysis\", \"Casual Chat\", \"Other\"
- sentiment: one of \"Bullish\", \"Bearish\", \"Neutral\"
- confidence: number between 0 and 1
- summary: one sentence summary

Images, when present, may contain charts or trade setups; include them in \
the analysis.";

pub(crate) const SIGNAL_SYSTEM_PROMPT: &str = "\
You are a trading signal extraction expert. Extract a concrete trading \
signal from the message if it contains one.

Reply with a single JSON object with these fields:
- has_signal: boolean
- signal_type: one of \"Buy\", \"Sell\", \"Hold\", \"Watch\"
- symbols: array of ticker symbols
- entry_price: string or null
- target_price: string or null
- stop_loss: string or null
- time_frame: string or null
- reasoning: string
- risk_level: one of \"Low\", \"Medium\", \"High\"";

pub(crate) fn analysis_user_text(request: &AnalysisRequest) -> String {
    let mut text = format!("Analyze the following message:\n\n{}", request.content);
    if let Some(referenced) = request
        .referenced_content
        .as_deref()
        .filter(|r| !r.trim().is_empty())
    {
        text.push_str("\n\nReferenced message:\n");
        text.push_str(referenced);
    }
    if !request.context.is_empty() {
        let skip = request.context.len().saturating_sub(PROMPT_CONTEXT_MESSAGES);
        text.push_str("\n\nContext messages:\n");
        text.push_str(&request.context[skip..].join("\n"));
    }
    text
}

pub(crate) fn signal_user_text(content: &str) -> String {
    format!("Extract trading signals from the following message:\n\n{content}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_keeps_last_three_context_messages() {
        let request = AnalysisRequest {
            content: "BTC long 68k".into(),
            context: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            attachments: Vec::new(),
            referenced_content: Some("ETH looks weak".into()),
        };
        let text = analysis_user_text(&request);
        assert!(text.starts_with("Analyze the following message:\n\nBTC long 68k"));
        assert!(text.contains("Referenced message:\nETH looks weak"));
        assert!(text.ends_with("Context messages:\nb\nc\nd"));
    }

    #[test]
    fn user_text_without_extras() {
        let request = AnalysisRequest {
            content: "hello".into(),
            ..AnalysisRequest::default()
        };
        assert_eq!(
            analysis_user_text(&request),
            "Analyze the following message:\n\nhello"
        );
    }
}
