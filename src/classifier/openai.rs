//! OpenAI-compatible chat-completions classifier.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use super::parse::{looks_like_html, parse_analysis, parse_signal};
use super::prompts::{
    ANALYSIS_SYSTEM_PROMPT, SIGNAL_SYSTEM_PROMPT, analysis_user_text, signal_user_text,
};
use super::{AnalysisRequest, ClassificationClient, SignalExtraction, token_cost};
use crate::config::ClassifierConfig;
use crate::error::ClassifierError;
use crate::pipeline::types::{Analysis, Attachment, TokenUsage};

const SIGNAL_TEMPERATURE: f32 = 0.2;
const SIGNAL_MAX_TOKENS: u32 = 300;

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

struct Completion {
    content: String,
    usage: TokenUsage,
}

pub struct OpenAiClassifier {
    client: reqwest::Client,
    config: ClassifierConfig,
}

impl OpenAiClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClassifierError::RequestFailed(format!("Failed to build client: {e}")))?;
        tracing::info!(model = %config.model, base_url = %config.base_url, "Using OpenAI-compatible classifier");
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn complete(
        &self,
        messages: Vec<Value>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion, ClassifierError> {
        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ClassifierError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ClassifierError::AuthFailed(
                "classification service rejected the API key".into(),
            ));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64);
            return Err(ClassifierError::RateLimited { retry_after });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ClassifierError::RequestFailed(e.to_string()))?;

        if looks_like_html(&text) {
            return Err(ClassifierError::Misconfigured("HTML page returned".into()));
        }
        if !status.is_success() {
            let snippet: String = text.chars().take(MAX_ERROR_BODY).collect();
            return Err(ClassifierError::RequestFailed(format!(
                "HTTP {}: {snippet}",
                status.as_u16()
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Classification call complete"
        );
        Ok(Completion { content, usage })
    }

    fn analysis_messages(&self, request: &AnalysisRequest) -> Vec<Value> {
        let text = analysis_user_text(request);
        let images = image_parts(&request.attachments);
        let user_content = if images.is_empty() {
            Value::String(text)
        } else {
            let mut parts = vec![json!({ "type": "text", "text": text })];
            parts.extend(images);
            Value::Array(parts)
        };
        vec![
            json!({ "role": "system", "content": ANALYSIS_SYSTEM_PROMPT }),
            json!({ "role": "user", "content": user_content }),
        ]
    }
}

fn log_failure(err: &ClassifierError, call: &str) {
    match err {
        ClassifierError::AuthFailed(_) | ClassifierError::Misconfigured(_) => {
            error!(call, error = %err, "Classification service misconfigured")
        }
        _ => warn!(call, error = %err, "Classification call failed"),
    }
}

/// `image_url` parts for the image attachments. Inline bytes become data
/// URLs; remote URLs are passed through.
fn image_parts(attachments: &[Attachment]) -> Vec<Value> {
    attachments
        .iter()
        .filter(|a| a.is_image())
        .filter_map(|a| {
            let url = match (&a.bytes, &a.url) {
                (Some(bytes), _) => format!(
                    "data:{};base64,{}",
                    a.mime_type(),
                    STANDARD.encode(bytes)
                ),
                (None, Some(url))
                    if url.starts_with("http://")
                        || url.starts_with("https://")
                        || url.starts_with("data:") =>
                {
                    url.clone()
                }
                _ => {
                    debug!(attachment = %a.filename, "Image attachment has no usable payload");
                    return None;
                }
            };
            Some(json!({
                "type": "image_url",
                "image_url": { "url": url, "detail": "low" },
            }))
        })
        .collect()
}

#[async_trait]
impl ClassificationClient for OpenAiClassifier {
    async fn analyze(&self, request: &AnalysisRequest) -> Analysis {
        let messages = self.analysis_messages(request);
        let completion = match self
            .complete(messages, self.config.temperature, self.config.max_tokens)
            .await
        {
            Ok(completion) => completion,
            Err(e) => {
                log_failure(&e, "analyze");
                return Analysis::unclassified(e.to_string());
            }
        };

        let mut analysis = parse_analysis(&completion.content).unwrap_or_else(|e| {
            log_failure(&e, "analyze");
            Analysis::unclassified(e.to_string())
        });
        analysis.usage = completion.usage;
        analysis
    }

    async fn extract_signal(&self, content: &str, analysis: &Analysis) -> SignalExtraction {
        if !analysis.is_relevant {
            return SignalExtraction::default();
        }
        let messages = vec![
            json!({ "role": "system", "content": SIGNAL_SYSTEM_PROMPT }),
            json!({ "role": "user", "content": signal_user_text(content) }),
        ];
        let completion = match self
            .complete(messages, SIGNAL_TEMPERATURE, SIGNAL_MAX_TOKENS)
            .await
        {
            Ok(completion) => completion,
            Err(e) => {
                log_failure(&e, "extract_signal");
                return SignalExtraction {
                    called: true,
                    error: Some(e.to_string()),
                    ..SignalExtraction::default()
                };
            }
        };

        match parse_signal(&completion.content) {
            Ok(signal) => SignalExtraction {
                signal,
                usage: completion.usage,
                called: true,
                error: None,
            },
            Err(e) => {
                log_failure(&e, "extract_signal");
                SignalExtraction {
                    signal: None,
                    usage: completion.usage,
                    called: true,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn cost(&self, usage: TokenUsage) -> Decimal {
        token_cost(
            usage,
            self.config.input_cost_per_1k,
            self.config.output_cost_per_1k,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode as HttpStatus;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use secrecy::SecretString;

    use super::*;

    #[derive(Clone)]
    struct Fake {
        status: HttpStatus,
        body: String,
        requests: Arc<Mutex<Vec<Value>>>,
    }

    async fn completions(State(fake): State<Fake>, body: axum::Json<Value>) -> Response {
        fake.requests.lock().unwrap().push(body.0);
        (fake.status, fake.body.clone()).into_response()
    }

    async fn serve(status: HttpStatus, body: String) -> (OpenAiClassifier, Arc<Mutex<Vec<Value>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(Fake {
                status,
                body,
                requests: Arc::clone(&requests),
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = ClassifierConfig {
            base_url: format!("http://{addr}/v1"),
            api_key: SecretString::from("sk-test".to_string()),
            request_timeout: Duration::from_secs(5),
            ..ClassifierConfig::default()
        };
        (OpenAiClassifier::new(config).unwrap(), requests)
    }

    fn chat(content: &str) -> String {
        json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 40 }
        })
        .to_string()
    }

    fn request(content: &str) -> AnalysisRequest {
        AnalysisRequest {
            content: content.into(),
            ..AnalysisRequest::default()
        }
    }

    #[tokio::test]
    async fn analyze_parses_reply_and_usage() {
        let reply = r#"{"is_trading_related": true, "priority": 4, "category": "Trading Signal",
                        "keywords": ["SOL"], "sentiment": "Bullish", "confidence": 0.8,
                        "summary": "SOL long"}"#;
        let (classifier, requests) = serve(HttpStatus::OK, chat(reply)).await;

        let analysis = classifier.analyze(&request("SOL long at 140")).await;
        assert!(analysis.is_relevant);
        assert_eq!(analysis.priority, 4);
        assert_eq!(analysis.usage.input_tokens, 120);
        assert!(classifier.cost(analysis.usage) > Decimal::ZERO);

        let sent = requests.lock().unwrap()[0].clone();
        assert_eq!(sent["response_format"]["type"], "json_object");
        assert_eq!(sent["messages"][0]["role"], "system");
        assert_eq!(sent["max_tokens"], 500);
    }

    #[tokio::test]
    async fn empty_content_degrades() {
        let (classifier, _) = serve(HttpStatus::OK, chat("")).await;
        let analysis = classifier.analyze(&request("BTC breakout")).await;
        assert!(!analysis.is_relevant);
        assert_eq!(analysis.error.as_deref(), Some("Empty response"));
        assert_eq!(analysis.usage.output_tokens, 40);
    }

    #[tokio::test]
    async fn html_body_is_configuration_error() {
        let (classifier, _) = serve(
            HttpStatus::OK,
            "<!DOCTYPE html><html><body>proxy login</body></html>".into(),
        )
        .await;
        let analysis = classifier.analyze(&request("BTC")).await;
        assert!(
            analysis
                .error
                .as_deref()
                .unwrap()
                .starts_with("API configuration error")
        );
    }

    #[tokio::test]
    async fn unauthorized_and_rate_limited_degrade() {
        let (classifier, _) = serve(HttpStatus::UNAUTHORIZED, "{}".into()).await;
        let analysis = classifier.analyze(&request("BTC")).await;
        assert!(analysis.error.as_deref().unwrap().starts_with("Authentication failed"));

        let (classifier, _) = serve(HttpStatus::TOO_MANY_REQUESTS, "{}".into()).await;
        let analysis = classifier.analyze(&request("BTC")).await;
        assert!(analysis.error.as_deref().unwrap().starts_with("Rate limited"));
    }

    #[tokio::test]
    async fn images_sent_as_low_detail_parts() {
        let (classifier, requests) = serve(HttpStatus::OK, chat(r#"{"priority": 2}"#)).await;
        let req = AnalysisRequest {
            content: "chart".into(),
            attachments: vec![
                Attachment {
                    id: "1".into(),
                    filename: "chart.png".into(),
                    content_type: None,
                    url: None,
                    bytes: Some(vec![1, 2, 3]),
                },
                Attachment {
                    id: "2".into(),
                    filename: "setup.jpg".into(),
                    content_type: Some("image/jpeg".into()),
                    url: Some("https://cdn.example.com/setup.jpg".into()),
                    bytes: None,
                },
            ],
            ..AnalysisRequest::default()
        };
        classifier.analyze(&req).await;

        let sent = requests.lock().unwrap()[0].clone();
        let parts = sent["messages"][1]["content"].as_array().unwrap().clone();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AQID");
        assert_eq!(parts[1]["image_url"]["detail"], "low");
        assert_eq!(
            parts[2]["image_url"]["url"],
            "https://cdn.example.com/setup.jpg"
        );
    }

    #[tokio::test]
    async fn signal_extraction() {
        let reply = r#"{"has_signal": true, "signal_type": "Sell", "symbols": ["BTC"],
                        "target_price": "60000"}"#;
        let (classifier, requests) = serve(HttpStatus::OK, chat(reply)).await;

        let mut analysis = Analysis::skipped("");
        let skipped = classifier.extract_signal("BTC short", &analysis).await;
        assert!(!skipped.called);
        assert!(requests.lock().unwrap().is_empty());

        analysis.is_relevant = true;
        let extraction = classifier.extract_signal("BTC short", &analysis).await;
        assert!(extraction.called);
        let signal = extraction.signal.unwrap();
        assert_eq!(signal.signal_type, "Sell");
        assert_eq!(signal.symbols, vec!["BTC"]);
        assert_eq!(requests.lock().unwrap()[0]["max_tokens"], 300);
    }
}
