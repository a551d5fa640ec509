//! Reconnect delay policy.

use std::time::Duration;

use rand::Rng;

use crate::config::GatewayConfig;

/// Bounded exponential backoff with jitter.
///
/// The delay for attempt `n` is `min(initial * 2^n, max)` plus up to
/// `jitter * delay` of random slack. The attempt counter starts over after
/// `max_retries` attempts, or when a connection stayed up for at least
/// `stable_window`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_retries: u32,
    stable_window: Duration,
    jitter: f64,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            max_retries: 10,
            stable_window: Duration::from_secs(60),
            jitter: 0.0,
            attempts: 0,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            initial: config.backoff_initial,
            max: config.backoff_max,
            max_retries: config.max_retries.max(1),
            stable_window: config.stable_window,
            jitter: config.jitter.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_stable_window(mut self, window: Duration) -> Self {
        self.stable_window = window;
        self
    }

    /// Consecutive attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Account for a finished connection. Long-lived ones reset the backoff.
    pub fn connection_ended(&mut self, lived: Duration) {
        if lived >= self.stable_window {
            self.reset();
        }
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        if self.attempts >= self.max_retries {
            tracing::info!(
                attempts = self.attempts,
                "Reconnect attempts exhausted, backoff starts over"
            );
            self.attempts = 0;
        }
        let base = self.base_delay(self.attempts);
        self.attempts += 1;
        if self.jitter > 0.0 {
            let slack = rand::thread_rng().gen_range(0.0..=self.jitter);
            base + base.mul_f64(slack)
        } else {
            base
        }
    }

    fn base_delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}
