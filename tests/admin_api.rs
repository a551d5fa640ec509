//! Integration tests for the admin REST surface.
//!
//! Each test serves `admin_routes` on a random port and talks to it with
//! reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use signal_watch::api::admin_routes;
use signal_watch::channels::ChannelAccessRegistry;
use signal_watch::classifier::{AnalysisRequest, ClassificationClient, SignalExtraction};
use signal_watch::config::{PipelineConfig, ProbeConfig};
use signal_watch::pipeline::types::{Analysis, Author, InboundEvent};
use signal_watch::service::PipelineService;
use signal_watch::store::{Database, LibSqlBackend};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Classifier stub (no real API calls).
struct StubClassifier;

#[async_trait]
impl ClassificationClient for StubClassifier {
    async fn analyze(&self, _request: &AnalysisRequest) -> Analysis {
        Analysis {
            is_relevant: true,
            priority: 2,
            category: "Discussion".into(),
            keywords: vec!["BTC".into()],
            sentiment: "Neutral".into(),
            confidence: 0.6,
            summary: "stub".into(),
            error: None,
            usage: Default::default(),
        }
    }

    async fn extract_signal(&self, _content: &str, _analysis: &Analysis) -> SignalExtraction {
        SignalExtraction::default()
    }
}

struct Server {
    base: String,
    client: reqwest::Client,
    service: Arc<PipelineService>,
    registry: Arc<ChannelAccessRegistry>,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn post(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.post(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn put(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .put(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn delete(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.delete(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }
}

async fn start_server() -> Server {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let registry = Arc::new(
        ChannelAccessRegistry::load(Arc::clone(&store), &ProbeConfig::default())
            .await
            .unwrap(),
    );
    let config = PipelineConfig {
        rate_limit_per_minute: 1000,
        ..PipelineConfig::default()
    };
    let service = Arc::new(
        PipelineService::new(store, Arc::new(StubClassifier), config)
            .unwrap()
            .with_registry(Arc::clone(&registry)),
    );
    let app = admin_routes(Arc::clone(&service));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        base: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
        service,
        registry,
    }
}

fn event(id: &str) -> InboundEvent {
    InboundEvent {
        id: id.to_string(),
        channel_id: "chan-1".to_string(),
        author: Author {
            id: "u-1".to_string(),
            display_name: "trader".to_string(),
        },
        content: format!("BTC update {id}"),
        attachments: Vec::new(),
        referenced_event: None,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn health_reports_pipeline_state() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, body) = server.get("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pipeline_running"], false);

        server.service.start().await;
        let (_, body) = server.get("/health").await;
        assert_eq!(body["pipeline_running"], true);
        server.service.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn config_update_applies_to_running_pool() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (_, body) = server.post("/api/pipeline/start").await;
        assert_eq!(body["running"], true);

        let (status, body) = server.get("/api/pipeline/config").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["max_workers"], 5);

        let (status, body) = server
            .put(
                "/api/pipeline/config",
                json!({ "max_workers": 2, "max_queue_size": 50 }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["max_workers"], 2);
        assert_eq!(body["max_queue_size"], 50);
        assert_eq!(body["batch_size"], 20);

        let (_, stats) = server.get("/api/pipeline/stats").await;
        assert_eq!(stats["pool"]["running"], true);
        assert_eq!(stats["pool"]["active_workers"], 2);
        assert_eq!(stats["pool"]["queue_capacity"], 50);

        let (_, body) = server.post("/api/pipeline/stop").await;
        assert_eq!(body["running"], false);
        let (_, stats) = server.get("/api/pipeline/stats").await;
        assert_eq!(stats["pool"]["running"], false);
        assert_eq!(stats["pool"]["active_workers"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, body) = server
            .put("/api/pipeline/config", json!({ "batch_size": 0 }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("batch_size"));

        // Unchanged.
        let (_, body) = server.get("/api/pipeline/config").await;
        assert_eq!(body["batch_size"], 20);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn clear_queue_discards_pending_tasks() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let ingestor = server.service.ingestor();
        for id in ["e-1", "e-2", "e-3"] {
            ingestor.ingest(&event(id)).await.unwrap();
        }
        let (_, stats) = server.get("/api/pipeline/stats").await;
        assert_eq!(stats["pool"]["queue_size"], 3);
        assert_eq!(stats["ingest"]["received"], 3);

        let (status, body) = server.post("/api/pipeline/clear-queue").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], 3);

        let (_, stats) = server.get("/api/pipeline/stats").await;
        assert_eq!(stats["pool"]["queue_size"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reprocess_limit_is_validated() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, _) = server.post("/api/pipeline/reprocess-failed?limit=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = server.post("/api/pipeline/reprocess-failed?limit=101").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = server.post("/api/pipeline/reprocess-failed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["found"], 0);
        assert_eq!(body["requeued"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn message_steps_after_processing() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, _) = server.get("/api/messages/missing/steps").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let mut results = server.service.subscribe();
        server.service.start().await;
        let outcome = server.service.ingestor().ingest(&event("e-1")).await.unwrap();
        let message_id = match outcome {
            signal_watch::pipeline::IngestOutcome::Enqueued { message_id, .. } => message_id,
            other => panic!("expected Enqueued, got {other:?}"),
        };
        results.recv().await.unwrap();

        let (status, body) = server
            .get(&format!("/api/messages/{message_id}/steps"))
            .await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["steps"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["step_name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["prefilter", "build_context", "classify", "extract_signal", "save_result"]
        );
        // Priority 2 is below the signal threshold.
        assert_eq!(body["steps"][3]["status"], "skipped");
        assert_eq!(body["summary"]["total_steps"], 5);
        assert_eq!(body["summary"]["skipped_steps"], 1);

        server.service.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn blacklist_listing_and_clearing() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        for _ in 0..3 {
            server
                .registry
                .record_result("chan-9", false, Some("Missing access"))
                .await
                .unwrap();
        }

        let (status, body) = server.get("/api/channels/blacklist").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["channels"][0]["channel_id"], "chan-9");

        let (_, stats) = server.get("/api/pipeline/stats").await;
        assert_eq!(stats["blacklisted_channels"], 1);

        let (status, body) = server.delete("/api/channels/blacklist/chan-9").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], "chan-9");
        assert!(!server.registry.is_blacklisted("chan-9"));

        let (status, _) = server.delete("/api/channels/blacklist/chan-9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}
