//! Configuration types.
//!
//! Every section loads from environment variables with `from_env()` and
//! falls back to its `Default` values.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PipelineError};

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Worker pool, queue and rate-limit settings. Adjustable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of concurrent worker loops.
    pub max_workers: usize,
    /// Maximum tasks drained per batch.
    pub batch_size: usize,
    /// Classification calls admitted per rolling 60s window.
    pub rate_limit_per_minute: usize,
    /// Ingestion queue capacity.
    pub max_queue_size: usize,
    /// Overall per-task pipeline timeout, in seconds.
    pub processing_timeout_secs: u64,
    /// Recent channel messages loaded as context.
    pub context_limit: usize,
    /// Minimum priority at which signal extraction runs.
    pub signal_min_priority: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            batch_size: 20,
            rate_limit_per_minute: 10,
            max_queue_size: 1000,
            processing_timeout_secs: 30,
            context_limit: 10,
            signal_min_priority: 4,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_workers: env_parse("AI_MAX_CONCURRENT_WORKERS").unwrap_or(d.max_workers),
            batch_size: env_parse("AI_BATCH_SIZE").unwrap_or(d.batch_size),
            rate_limit_per_minute: env_parse("AI_RATE_LIMIT_PER_MINUTE")
                .unwrap_or(d.rate_limit_per_minute),
            max_queue_size: env_parse("AI_MAX_QUEUE_SIZE").unwrap_or(d.max_queue_size),
            processing_timeout_secs: env_parse("AI_PROCESSING_TIMEOUT")
                .unwrap_or(d.processing_timeout_secs),
            context_limit: env_parse("AI_CONTEXT_LIMIT").unwrap_or(d.context_limit),
            signal_min_priority: env_parse("AI_SIGNAL_MIN_PRIORITY")
                .unwrap_or(d.signal_min_priority),
        }
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    /// Reject values that would stall or disable the pool.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let checks = [
            ("max_workers", self.max_workers),
            ("batch_size", self.batch_size),
            ("rate_limit_per_minute", self.rate_limit_per_minute),
            ("max_queue_size", self.max_queue_size),
            ("processing_timeout_secs", self.processing_timeout_secs as usize),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if !(1..=5).contains(&self.signal_min_priority) {
            return Err(PipelineError::InvalidConfig(
                "signal_min_priority must be within 1..=5".into(),
            ));
        }
        Ok(())
    }
}

/// Partial update applied through the admin surface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfigUpdate {
    pub max_workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub rate_limit_per_minute: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub processing_timeout_secs: Option<u64>,
    pub context_limit: Option<usize>,
    pub signal_min_priority: Option<u8>,
}

impl PipelineConfigUpdate {
    pub fn apply_to(&self, base: &PipelineConfig) -> PipelineConfig {
        PipelineConfig {
            max_workers: self.max_workers.unwrap_or(base.max_workers),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            rate_limit_per_minute: self
                .rate_limit_per_minute
                .unwrap_or(base.rate_limit_per_minute),
            max_queue_size: self.max_queue_size.unwrap_or(base.max_queue_size),
            processing_timeout_secs: self
                .processing_timeout_secs
                .unwrap_or(base.processing_timeout_secs),
            context_limit: self.context_limit.unwrap_or(base.context_limit),
            signal_min_priority: self.signal_min_priority.unwrap_or(base.signal_min_priority),
        }
    }
}

// ── Gateway ─────────────────────────────────────────────────────────

/// Persistent event-source connection settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: SecretString,
    /// Gateway intents bitfield sent with Identify.
    pub intents: u64,
    /// Channels whose events are accepted. Empty accepts every channel.
    pub channel_ids: Vec<String>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive failed attempts after which the backoff starts over.
    pub max_retries: u32,
    /// A connection that stayed up this long resets the backoff.
    pub stable_window: Duration,
    /// Fraction of the heartbeat interval the watchdog tolerates without an ack.
    pub watchdog_ratio: f64,
    /// Upper bound of remembered event ids for duplicate suppression.
    pub dedup_capacity: usize,
    /// Random extra delay added to each backoff, as a fraction of it.
    pub jitter: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "wss://gateway.discord.gg/?v=10&encoding=json".to_string(),
            token: SecretString::from(String::new()),
            // GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT
            intents: 1 | (1 << 9) | (1 << 15),
            channel_ids: Vec::new(),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_retries: 10,
            stable_window: Duration::from_secs(60),
            watchdog_ratio: 0.8,
            dedup_capacity: 10_000,
            jitter: 0.1,
        }
    }
}

impl GatewayConfig {
    /// Returns `None` when no source token is configured.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("DISCORD_USER_TOKEN")
            .or_else(|_| std::env::var("DISCORD_TOKEN"))
            .ok()
            .filter(|t| !t.trim().is_empty())?;
        let d = Self::default();
        Some(Self {
            url: std::env::var("DISCORD_GATEWAY_URL").unwrap_or(d.url),
            token: SecretString::from(token),
            intents: env_parse("DISCORD_GATEWAY_INTENTS").unwrap_or(d.intents),
            channel_ids: env_list("DISCORD_CHANNEL_IDS"),
            backoff_initial: env_parse("GATEWAY_BACKOFF_INITIAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.backoff_initial),
            backoff_max: env_parse("GATEWAY_BACKOFF_MAX_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.backoff_max),
            max_retries: env_parse("GATEWAY_MAX_RETRIES").unwrap_or(d.max_retries),
            stable_window: env_parse("GATEWAY_STABLE_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.stable_window),
            watchdog_ratio: env_parse("GATEWAY_WATCHDOG_RATIO").unwrap_or(d.watchdog_ratio),
            dedup_capacity: env_parse("GATEWAY_DEDUP_CAPACITY").unwrap_or(d.dedup_capacity),
            jitter: d.jitter,
        })
    }
}

// ── Channel probe / poller ──────────────────────────────────────────

/// REST probe, blacklist and poll-cycle settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub api_base: String,
    pub token: SecretString,
    pub user_agent: String,
    pub channel_ids: Vec<String>,
    /// Find readable channels through the guild listing at startup.
    pub discover: bool,
    /// Consecutive permission failures before a channel is blacklisted.
    pub max_permission_errors: u32,
    pub blacklist_enabled: bool,
    pub clear_blacklist_on_start: bool,
    /// Zero disables the poll cycle.
    pub poll_interval: Duration,
    /// Messages fetched per channel per cycle.
    pub fetch_limit: usize,
    /// Probe requests admitted per rolling 60s window.
    pub requests_per_minute: usize,
    /// Attempts per request when rate limited upstream.
    pub max_retries: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://discord.com/api/v9".to_string(),
            token: SecretString::from(String::new()),
            user_agent: format!("signal-watch/{}", env!("CARGO_PKG_VERSION")),
            channel_ids: Vec::new(),
            discover: true,
            max_permission_errors: 3,
            blacklist_enabled: true,
            clear_blacklist_on_start: false,
            poll_interval: Duration::from_secs(5),
            fetch_limit: 1,
            requests_per_minute: 120, // one request every 0.5s
            max_retries: 3,
        }
    }
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let token = std::env::var("DISCORD_USER_TOKEN")
            .or_else(|_| std::env::var("DISCORD_TOKEN"))
            .unwrap_or_default();
        Self {
            api_base: std::env::var("DISCORD_API_BASE").unwrap_or(d.api_base),
            token: SecretString::from(token),
            user_agent: std::env::var("DISCORD_USER_AGENT").unwrap_or(d.user_agent),
            channel_ids: env_list("DISCORD_CHANNEL_IDS"),
            discover: env_bool("CHANNEL_DISCOVERY", d.discover),
            max_permission_errors: env_parse("MAX_PERMISSION_ERRORS")
                .unwrap_or(d.max_permission_errors),
            blacklist_enabled: env_bool("ENABLE_CHANNEL_BLACKLIST", d.blacklist_enabled),
            clear_blacklist_on_start: env_bool(
                "CLEAR_BLACKLIST_ON_START",
                d.clear_blacklist_on_start,
            ),
            poll_interval: env_parse("CHANNEL_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.poll_interval),
            fetch_limit: env_parse("CHANNEL_FETCH_LIMIT").unwrap_or(d.fetch_limit),
            requests_per_minute: env_parse("CHANNEL_PROBE_PER_MINUTE")
                .unwrap_or(d.requests_per_minute),
            max_retries: env_parse("CHANNEL_PROBE_MAX_RETRIES").unwrap_or(d.max_retries),
        }
    }

    pub fn has_token(&self) -> bool {
        !self.token.expose_secret().trim().is_empty()
    }
}

// ── Classifier ──────────────────────────────────────────────────────

/// OpenAI-compatible classification endpoint.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    /// Cost per 1k input tokens.
    pub input_cost_per_1k: Decimal,
    /// Cost per 1k output tokens.
    pub output_cost_per_1k: Decimal,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: SecretString::from(String::new()),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            max_tokens: 500,
            request_timeout: Duration::from_secs(25),
            input_cost_per_1k: dec!(0.00015),
            output_cost_per_1k: dec!(0.0006),
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".into()))?;
        let d = Self::default();
        Ok(Self {
            base_url: std::env::var("OPENAI_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(d.base_url),
            api_key: SecretString::from(api_key),
            model: std::env::var("OPENAI_MODEL").unwrap_or(d.model),
            temperature: env_parse("OPENAI_TEMPERATURE").unwrap_or(d.temperature),
            max_tokens: env_parse("OPENAI_MAX_TOKENS").unwrap_or(d.max_tokens),
            request_timeout: env_parse("OPENAI_REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.request_timeout),
            input_cost_per_1k: env_parse("OPENAI_INPUT_COST_PER_1K").unwrap_or(d.input_cost_per_1k),
            output_cost_per_1k: env_parse("OPENAI_OUTPUT_COST_PER_1K")
                .unwrap_or(d.output_cost_per_1k),
        })
    }
}

// ── Application ─────────────────────────────────────────────────────

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub admin_port: u16,
    /// Daily rolling log files are written here when set.
    pub log_dir: Option<PathBuf>,
    /// Unprocessed messages re-enqueued on startup.
    pub recover_limit: usize,
    pub pipeline: PipelineConfig,
    pub probe: ProbeConfig,
    pub gateway: Option<GatewayConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let pipeline = PipelineConfig::from_env();
        pipeline.validate().map_err(|e| ConfigError::InvalidValue {
            key: "pipeline".into(),
            message: e.to_string(),
        })?;
        Ok(Self {
            db_path: std::env::var("SIGNAL_WATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/signal-watch.db")),
            admin_port: env_parse("SIGNAL_WATCH_ADMIN_PORT").unwrap_or(8080),
            log_dir: std::env::var("SIGNAL_WATCH_LOG_DIR").ok().map(PathBuf::from),
            recover_limit: env_parse("SIGNAL_WATCH_RECOVER_LIMIT").unwrap_or(500),
            pipeline,
            probe: ProbeConfig::from_env(),
            gateway: GatewayConfig::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults_validate() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.processing_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let config = PipelineConfig {
            batch_size: 0,
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn zero_timeout_rejected() {
        let config = PipelineConfig {
            processing_timeout_secs: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn update_overrides_only_given_fields() {
        let base = PipelineConfig::default();
        let update = PipelineConfigUpdate {
            max_workers: Some(2),
            max_queue_size: Some(10),
            ..Default::default()
        };
        let next = update.apply_to(&base);
        assert_eq!(next.max_workers, 2);
        assert_eq!(next.max_queue_size, 10);
        assert_eq!(next.batch_size, base.batch_size);
        assert_eq!(next.rate_limit_per_minute, base.rate_limit_per_minute);
    }

    #[test]
    fn gateway_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.backoff_max, Duration::from_secs(30));
        assert_eq!(config.stable_window, Duration::from_secs(60));
        assert!((config.watchdog_ratio - 0.8).abs() < f64::EPSILON);
    }
}
