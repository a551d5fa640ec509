//! Integration tests for channel access probing and the poll cycle.
//!
//! Each test runs a fake REST API on a random port and points a real
//! `ChannelAccessProbe` at it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

use signal_watch::channels::{
    ChannelAccessProbe, ChannelAccessRegistry, ChannelPoller, PollReport, ProbeOutcome,
};
use signal_watch::config::ProbeConfig;
use signal_watch::error::GatewayError;
use signal_watch::gateway::EventHandler;
use signal_watch::pipeline::types::InboundEvent;
use signal_watch::store::{Database, LibSqlBackend};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const TOKEN: &str = "test-token";

#[derive(Default)]
struct FakeApi {
    hits: AtomicUsize,
    /// Channel ids whose messages were requested, in order.
    requested: Mutex<Vec<String>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("authorization").and_then(|v| v.to_str().ok()) == Some(TOKEN)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "code": 0, "message": "401: Unauthorized" })),
    )
        .into_response()
}

async fn current_user(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "id": "u-bot", "username": "watcher" })).into_response()
}

async fn guilds(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!([
        { "id": "g-1", "name": "Traders" },
        { "id": "g-2", "name": "Locked" }
    ]))
    .into_response()
}

async fn guild_channels(Path(guild_id): Path<String>) -> Response {
    match guild_id.as_str() {
        "g-1" => Json(json!([
            { "id": "cat", "name": "Info", "type": 4 },
            { "id": "open", "name": "signals", "type": 0, "guild_id": "g-1" },
            { "id": "voice", "name": "Voice", "type": 2 },
            { "id": "secret", "name": "staff", "type": 0 },
            { "id": "gone", "name": "old", "type": 0 },
            { "id": "news", "name": "announcements", "type": 5 }
        ]))
        .into_response(),
        _ => (
            StatusCode::FORBIDDEN,
            Json(json!({ "code": 50001, "message": "Missing Access" })),
        )
            .into_response(),
    }
}

async fn channel_messages(
    State(api): State<Arc<FakeApi>>,
    Path(channel_id): Path<String>,
) -> Response {
    api.hits.fetch_add(1, Ordering::SeqCst);
    api.requested.lock().await.push(channel_id.clone());
    match channel_id.as_str() {
        "news" => Json(json!([])).into_response(),
        "open" => Json(json!([
            {
                "id": "m-2",
                "channel_id": "open",
                "author": { "id": "u-1", "username": "trader" },
                "content": "BTC long 65000",
                "timestamp": "2026-01-01T10:01:00Z"
            },
            {
                "id": "m-1",
                "channel_id": "open",
                "author": { "id": "u-1", "username": "trader" },
                "content": "watching BTC",
                "timestamp": "2026-01-01T10:00:00Z"
            }
        ]))
        .into_response(),
        "gone" => (
            StatusCode::NOT_FOUND,
            Json(json!({ "code": 10003, "message": "Unknown Channel" })),
        )
            .into_response(),
        _ => (
            StatusCode::FORBIDDEN,
            Json(json!({ "code": 50001, "message": "Missing Access" })),
        )
            .into_response(),
    }
}

/// Start the fake API, return (base url, hit counter).
async fn start_api() -> (String, Arc<FakeApi>) {
    let api = Arc::new(FakeApi::default());
    let app = Router::new()
        .route("/channels/{id}/messages", get(channel_messages))
        .route("/users/@me", get(current_user))
        .route("/users/@me/guilds", get(guilds))
        .route("/guilds/{id}/channels", get(guild_channels))
        .with_state(Arc::clone(&api));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), api)
}

fn probe_config(api_base: String) -> ProbeConfig {
    ProbeConfig {
        api_base,
        token: SecretString::from(TOKEN.to_string()),
        requests_per_minute: 1000,
        max_permission_errors: 3,
        ..ProbeConfig::default()
    }
}

async fn setup(config: &ProbeConfig) -> (Arc<dyn Database>, Arc<ChannelAccessProbe>) {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let registry = Arc::new(
        ChannelAccessRegistry::load(Arc::clone(&store), config)
            .await
            .unwrap(),
    );
    let probe = Arc::new(ChannelAccessProbe::new(config.clone(), registry));
    (store, probe)
}

#[derive(Default)]
struct Collector {
    events: Mutex<Vec<InboundEvent>>,
}

#[async_trait]
impl EventHandler for Collector {
    async fn on_event(&self, event: InboundEvent) {
        self.events.lock().await.push(event);
    }
}

#[tokio::test]
async fn accessible_channel_returns_messages() {
    timeout(TEST_TIMEOUT, async {
        let (base, _api) = start_api().await;
        let config = probe_config(base);
        let (_store, probe) = setup(&config).await;

        match probe.check("open").await {
            ProbeOutcome::Accessible(messages) => assert_eq!(messages.len(), 2),
            other => panic!("expected Accessible, got {other:?}"),
        }
        let state = probe.registry().state("open").unwrap();
        assert_eq!(state.consecutive_permission_errors, 0);
        assert!(!state.is_blacklisted());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn three_forbidden_reads_blacklist_and_persist() {
    timeout(TEST_TIMEOUT, async {
        let (base, _api) = start_api().await;
        let config = probe_config(base);
        let (store, probe) = setup(&config).await;

        for _ in 0..2 {
            assert!(!probe.probe("secret").await);
            assert!(!probe.registry().is_blacklisted("secret"));
        }
        match probe.check("secret").await {
            ProbeOutcome::Denied { status, code, .. } => {
                assert_eq!(status, 403);
                assert_eq!(code, Some(50001));
            }
            other => panic!("expected Denied, got {other:?}"),
        }
        assert!(probe.registry().is_blacklisted("secret"));

        // A fresh registry over the same store sees the blacklist.
        let reloaded = ChannelAccessRegistry::load(store, &config).await.unwrap();
        assert!(reloaded.is_blacklisted("secret"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn not_found_counts_toward_blacklist() {
    timeout(TEST_TIMEOUT, async {
        let (base, _api) = start_api().await;
        let config = probe_config(base);
        let (_store, probe) = setup(&config).await;

        for _ in 0..3 {
            probe.check("gone").await;
        }
        assert!(probe.registry().is_blacklisted("gone"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreachable_api_is_inconclusive_and_not_recorded() {
    timeout(TEST_TIMEOUT, async {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = probe_config(format!("http://127.0.0.1:{port}"));
        let (_store, probe) = setup(&config).await;

        for _ in 0..4 {
            assert!(matches!(
                probe.check("open").await,
                ProbeOutcome::Inconclusive(_)
            ));
        }
        assert!(probe.registry().state("open").is_none());
        assert!(!probe.registry().is_blacklisted("open"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn poll_cycle_skips_blacklisted_channels() {
    timeout(TEST_TIMEOUT, async {
        let (base, api) = start_api().await;
        let config = probe_config(base);
        let (_store, probe) = setup(&config).await;
        let collector = Arc::new(Collector::default());
        let poller = ChannelPoller::new(
            Arc::clone(&probe),
            Arc::clone(&collector) as Arc<dyn EventHandler>,
            vec!["open".into(), "secret".into()],
            Duration::from_secs(60),
        );

        for _ in 0..3 {
            poller.poll_once().await;
        }
        assert!(probe.registry().is_blacklisted("secret"));
        let hits_before = api.hits.load(Ordering::SeqCst);
        assert_eq!(hits_before, 6);

        let report = poller.poll_once().await;
        assert_eq!(
            report,
            PollReport {
                checked: 1,
                skipped: 1,
                denied: 0,
                inconclusive: 0,
                delivered: 2,
            }
        );
        // Only the open channel was requested.
        assert_eq!(api.hits.load(Ordering::SeqCst), hits_before + 1);

        // Delivered oldest first.
        let events = collector.events.lock().await;
        assert_eq!(events.len(), 8);
        assert_eq!(events[0].id, "m-1");
        assert_eq!(events[1].id, "m-2");
        assert_eq!(events[1].author.display_name, "trader");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cleared_channel_is_polled_again() {
    timeout(TEST_TIMEOUT, async {
        let (base, api) = start_api().await;
        let config = probe_config(base);
        let (_store, probe) = setup(&config).await;
        let poller = ChannelPoller::new(
            Arc::clone(&probe),
            Arc::new(Collector::default()) as Arc<dyn EventHandler>,
            vec!["secret".into()],
            Duration::from_secs(60),
        );

        for _ in 0..3 {
            poller.poll_once().await;
        }
        assert_eq!(poller.poll_once().await.skipped, 1);

        assert!(probe.registry().clear("secret").await.unwrap());
        let before = api.hits.load(Ordering::SeqCst);
        let report = poller.poll_once().await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.denied, 1);
        assert_eq!(api.hits.load(Ordering::SeqCst), before + 1);
        assert!(!probe.registry().is_blacklisted("secret"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn token_is_verified() {
    timeout(TEST_TIMEOUT, async {
        let (base, _api) = start_api().await;
        let config = probe_config(base.clone());
        let (_store, access) = setup(&config).await;
        let user = access.verify_token().await.unwrap();
        assert_eq!(user.username, "watcher");

        let bad = ProbeConfig {
            token: SecretString::from("wrong".to_string()),
            ..probe_config(base)
        };
        let (_store, access) = setup(&bad).await;
        let err = access.verify_token().await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailed(_)));
        assert!(err.is_fatal());
        assert!(matches!(
            access.discover_channels(&[]).await,
            Err(GatewayError::AuthFailed(_))
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn discovery_keeps_readable_text_channels() {
    timeout(TEST_TIMEOUT, async {
        let (base, api) = start_api().await;
        let config = probe_config(base);
        let (_store, access) = setup(&config).await;
        for _ in 0..3 {
            access.registry().record_result("gone", false, None).await.unwrap();
        }

        let channels = access.discover_channels(&[]).await.unwrap();
        let ids: Vec<&str> = channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["open", "news"]);
        assert!(channels.iter().all(|c| c.guild_id.as_deref() == Some("g-1")));

        // Only text channels were read, and never the blacklisted one.
        assert_eq!(*api.requested.lock().await, vec!["open", "secret", "news"]);
        let secret = access.registry().state("secret").unwrap();
        assert_eq!(secret.consecutive_permission_errors, 1);
        assert!(!secret.is_blacklisted());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn discovery_restricted_to_configured_channels() {
    timeout(TEST_TIMEOUT, async {
        let (base, api) = start_api().await;
        let config = probe_config(base);
        let (_store, access) = setup(&config).await;

        let wanted = vec!["open".to_string(), "elsewhere".to_string()];
        let channels = access.discover_channels(&wanted).await.unwrap();
        let ids: Vec<&str> = channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["open"]);
        assert_eq!(*api.requested.lock().await, vec!["open"]);
    })
    .await
    .expect("test timed out");
}
