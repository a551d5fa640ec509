//! Per-channel read permission tracking and the blacklist.
//!
//! [`ChannelAccessProbe`] performs the minimal read call against a channel;
//! [`ChannelAccessRegistry`] turns its outcomes into consecutive-failure
//! counts and blacklists a channel once the threshold is reached. A
//! blacklisted channel stays blacklisted until an operator clears it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::error::{DatabaseError, GatewayError};
use crate::gateway::protocol::MessagePayload;
use crate::pipeline::rate_limit::RateLimiter;
use crate::store::Database;

/// Upstream JSON error code for "Missing Access".
pub const MISSING_ACCESS_CODE: u64 = 50001;

/// Wait used when a 429 carries no usable `retry_after`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAccessState {
    pub channel_id: String,
    pub accessible: bool,
    pub consecutive_permission_errors: u32,
    pub blacklisted_since: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ChannelAccessState {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            accessible: true,
            consecutive_permission_errors: 0,
            blacklisted_since: None,
            reason: None,
            last_checked_at: None,
        }
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted_since.is_some()
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// In-memory snapshot of channel access state, written through to the store.
///
/// Reads are synchronous and may be slightly stale relative to a write in
/// progress.
pub struct ChannelAccessRegistry {
    store: Arc<dyn Database>,
    states: RwLock<HashMap<String, ChannelAccessState>>,
    /// Serializes read-modify-write-persist sequences.
    write_lock: Mutex<()>,
    threshold: u32,
    enabled: bool,
}

impl ChannelAccessRegistry {
    /// Load persisted state. With `clear_blacklist_on_start` the table is
    /// wiped first.
    pub async fn load(
        store: Arc<dyn Database>,
        config: &ProbeConfig,
    ) -> Result<Self, DatabaseError> {
        if config.clear_blacklist_on_start {
            let cleared = store.clear_channel_access().await?;
            info!(cleared, "Channel blacklist cleared on start");
        }
        let states: HashMap<String, ChannelAccessState> = store
            .list_channel_access()
            .await?
            .into_iter()
            .map(|s| (s.channel_id.clone(), s))
            .collect();

        let blacklisted = states.values().filter(|s| s.is_blacklisted()).count();
        info!(
            channels = states.len(),
            blacklisted,
            enabled = config.blacklist_enabled,
            "Channel access state loaded"
        );
        for state in states.values().filter(|s| s.is_blacklisted()) {
            debug!(
                channel_id = %state.channel_id,
                reason = state.reason.as_deref().unwrap_or("unknown"),
                "Blacklisted channel"
            );
        }

        Ok(Self {
            store,
            states: RwLock::new(states),
            write_lock: Mutex::new(()),
            threshold: config.max_permission_errors.max(1),
            enabled: config.blacklist_enabled,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ChannelAccessState>> {
        self.states.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ChannelAccessState>> {
        self.states.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Always false while the blacklist is disabled.
    pub fn is_blacklisted(&self, channel_id: &str) -> bool {
        self.enabled
            && self
                .read()
                .get(channel_id)
                .is_some_and(ChannelAccessState::is_blacklisted)
    }

    pub fn state(&self, channel_id: &str) -> Option<ChannelAccessState> {
        self.read().get(channel_id).cloned()
    }

    pub fn list_blacklisted(&self) -> Vec<ChannelAccessState> {
        if !self.enabled {
            return Vec::new();
        }
        let mut list: Vec<ChannelAccessState> = self
            .read()
            .values()
            .filter(|s| s.is_blacklisted())
            .cloned()
            .collect();
        list.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        list
    }

    /// Fold one probe outcome into the channel's state.
    ///
    /// Success resets the failure count. A failure increments it, and at the
    /// threshold the channel is blacklisted. A blacklisted channel stays
    /// blacklisted whatever is recorded.
    pub async fn record_result(
        &self,
        channel_id: &str,
        accessible: bool,
        reason: Option<&str>,
    ) -> Result<ChannelAccessState, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut state = self
            .state(channel_id)
            .unwrap_or_else(|| ChannelAccessState::new(channel_id));
        state.last_checked_at = Some(now);

        if accessible {
            if !state.is_blacklisted() {
                state.accessible = true;
                state.consecutive_permission_errors = 0;
                state.reason = None;
            }
        } else {
            state.accessible = false;
            state.consecutive_permission_errors += 1;
            if !state.is_blacklisted() {
                state.reason = reason.map(String::from);
            }
            if self.enabled
                && !state.is_blacklisted()
                && state.consecutive_permission_errors >= self.threshold
            {
                state.blacklisted_since = Some(now);
                state.reason = Some(format!(
                    "Exceeded maximum permission errors ({}): {}",
                    self.threshold,
                    reason.unwrap_or("access denied")
                ));
                warn!(
                    channel_id,
                    errors = state.consecutive_permission_errors,
                    "Channel blacklisted"
                );
            } else if !state.is_blacklisted() {
                warn!(
                    channel_id,
                    attempt = state.consecutive_permission_errors,
                    threshold = self.threshold,
                    reason = reason.unwrap_or("access denied"),
                    "Channel permission check failed"
                );
            }
        }

        self.store.upsert_channel_access(&state).await?;
        self.write().insert(channel_id.to_string(), state.clone());
        Ok(state)
    }

    /// Forget a channel's state, lifting any blacklist. Returns false when
    /// nothing was recorded for it.
    pub async fn clear(&self, channel_id: &str) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let deleted = self.store.delete_channel_access(channel_id).await?;
        let removed = self.write().remove(channel_id).is_some();
        if removed || deleted {
            info!(channel_id, "Channel access state cleared");
        }
        Ok(removed || deleted)
    }

    pub async fn clear_all(&self) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let deleted = self.store.clear_channel_access().await?;
        let removed = {
            let mut states = self.write();
            let n = states.len();
            states.clear();
            n
        };
        info!(count = removed.max(deleted), "Channel access state cleared");
        Ok(removed.max(deleted))
    }
}

// ── Probe ───────────────────────────────────────────────────────────

/// Result of one read call against a channel.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Read succeeded; carries the fetched messages, newest first.
    Accessible(Vec<MessagePayload>),
    /// Permission or other non-success response.
    Denied {
        status: u16,
        code: Option<u64>,
        reason: String,
    },
    /// Transport failure or retries exhausted; says nothing about access.
    Inconclusive(String),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<u64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    retry_after: Option<f64>,
}

/// REST client testing read permission with `GET /channels/{id}/messages`.
/// Channel discovery (see [`super::discovery`]) goes through the same client.
///
/// Probes draw from their own rate budget, separate from classification.
pub struct ChannelAccessProbe {
    client: reqwest::Client,
    config: ProbeConfig,
    registry: Arc<ChannelAccessRegistry>,
    limiter: RateLimiter,
}

impl ChannelAccessProbe {
    pub fn new(config: ProbeConfig, registry: Arc<ChannelAccessRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let limiter = RateLimiter::per_minute(config.requests_per_minute);
        Self {
            client,
            config,
            registry,
            limiter,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelAccessRegistry> {
        &self.registry
    }

    /// Whether the channel can be read. Records the outcome unless it was
    /// inconclusive, which counts as not accessible for the caller only.
    pub async fn probe(&self, channel_id: &str) -> bool {
        matches!(self.check(channel_id).await, ProbeOutcome::Accessible(_))
    }

    /// Read the channel and record the outcome in the registry.
    pub async fn check(&self, channel_id: &str) -> ProbeOutcome {
        let outcome = self.fetch(channel_id).await;
        let recorded = match &outcome {
            ProbeOutcome::Accessible(_) => {
                self.registry.record_result(channel_id, true, None).await
            }
            ProbeOutcome::Denied { reason, .. } => {
                self.registry
                    .record_result(channel_id, false, Some(reason))
                    .await
            }
            ProbeOutcome::Inconclusive(reason) => {
                warn!(channel_id, reason = %reason, "Channel probe inconclusive");
                return outcome;
            }
        };
        if let Err(e) = recorded {
            warn!(channel_id, error = %e, "Failed to persist channel access state");
        }
        outcome
    }

    async fn fetch(&self, channel_id: &str) -> ProbeOutcome {
        let path = format!(
            "/channels/{channel_id}/messages?limit={}",
            self.config.fetch_limit.max(1)
        );
        let response = match self.get(&path).await {
            Ok(r) => r,
            Err(reason) => return ProbeOutcome::Inconclusive(reason),
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<Vec<MessagePayload>>().await {
                Ok(messages) => ProbeOutcome::Accessible(messages),
                Err(e) => {
                    warn!(channel_id, error = %e, "Unreadable channel messages");
                    ProbeOutcome::Accessible(Vec::new())
                }
            };
        }
        denied(status, response.json().await.ok())
    }

    /// GET a JSON resource. 401 maps to [`GatewayError::AuthFailed`], any
    /// other error status or an unreachable API to [`GatewayError::Http`].
    pub(super) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, GatewayError> {
        let response = self.get(path).await.map_err(GatewayError::Http)?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(GatewayError::AuthFailed(format!("{path} returned 401")));
        }
        if !status.is_success() {
            let detail = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_default();
            return Err(GatewayError::Http(format!(
                "{path} returned {}: {detail}",
                status.as_u16()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("{path}: {e}")))
    }

    /// GET within the probe's rate budget, retrying upstream 429s. Any other
    /// response is returned as is; `Err` says why no answer was obtained.
    async fn get(&self, path: &str) -> Result<reqwest::Response, String> {
        let url = format!("{}{path}", self.config.api_base.trim_end_matches('/'));
        let attempts = self.config.max_retries.max(1);

        for attempt in 1..=attempts {
            self.limiter.acquire().await;
            debug!(path, attempt, "Upstream request");

            let response = self
                .client
                .get(&url)
                .header("Authorization", self.config.token.expose_secret())
                .header("User-Agent", &self.config.user_agent)
                .send()
                .await
                .map_err(|e| format!("request failed: {e}"))?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            let retry_after_header = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok());
            let body: Option<ErrorBody> = response.json().await.ok();
            let wait = body
                .as_ref()
                .and_then(|b| b.retry_after)
                .or(retry_after_header)
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            warn!(
                path,
                attempt,
                wait_ms = wait.as_millis() as u64,
                "Upstream rate limited"
            );
            if attempt < attempts {
                tokio::time::sleep(wait).await;
            }
        }

        Err("rate limited on every attempt".into())
    }
}

fn denied(status: StatusCode, body: Option<ErrorBody>) -> ProbeOutcome {
    let code = body.as_ref().and_then(|b| b.code);
    let detail = body.and_then(|b| b.message);
    let reason = match (status.as_u16(), code) {
        (401, _) => "Authentication failed (401)".to_string(),
        (_, Some(MISSING_ACCESS_CODE)) => "Missing access".to_string(),
        (403, _) => format!(
            "Permission denied: {}",
            detail.as_deref().unwrap_or("no access to the channel")
        ),
        (404, _) => "Channel not found (404)".to_string(),
        (s, _) => format!("Unexpected response ({s})"),
    };
    ProbeOutcome::Denied {
        status: status.as_u16(),
        code,
        reason,
    }
}
