//! Sliding-window rate limiter shared by all workers.
//!
//! `acquire()` never rejects: when the window is full the caller sleeps
//! until the oldest admission ages out. The timestamp list is held under
//! one async mutex for the whole prune-wait-append sequence, so waiting
//! callers are admitted one at a time in arrival order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Length of the rolling window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    max_per_window: AtomicUsize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Limiter admitting `max_per_minute` calls per rolling 60 seconds.
    pub fn per_minute(max_per_minute: usize) -> Self {
        Self::with_window(max_per_minute, RATE_WINDOW)
    }

    pub fn with_window(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window: AtomicUsize::new(max_per_window.max(1)),
            window,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.max_per_window.load(Ordering::Relaxed)
    }

    /// Change the limit. Takes effect on the next `acquire()`.
    pub fn set_limit(&self, max_per_window: usize) {
        self.max_per_window
            .store(max_per_window.max(1), Ordering::Relaxed);
    }

    /// Wait until a call may proceed, then record it.
    pub async fn acquire(&self) {
        let mut admitted = self.admitted.lock().await;
        let now = Instant::now();
        prune(&mut admitted, now, self.window);

        if admitted.len() >= self.limit() {
            // Only the oldest entries that must age out to free one slot matter.
            let excess = admitted.len() + 1 - self.limit();
            if let Some(&oldest) = admitted.get(excess - 1) {
                let wait = self.window.saturating_sub(now.duration_since(oldest));
                debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
                tokio::time::sleep(wait).await;
            }
            prune(&mut admitted, Instant::now(), self.window);
        }

        admitted.push_back(Instant::now());
    }

    /// Calls admitted in the current window.
    pub async fn in_window(&self) -> usize {
        let mut admitted = self.admitted.lock().await;
        prune(&mut admitted, Instant::now(), self.window);
        admitted.len()
    }

    /// Non-waiting variant of [`in_window`](Self::in_window). While a caller
    /// holds the window waiting for a slot, the window is full.
    pub fn in_window_now(&self) -> usize {
        match self.admitted.try_lock() {
            Ok(mut admitted) => {
                prune(&mut admitted, Instant::now(), self.window);
                admitted.len()
            }
            Err(_) => self.limit(),
        }
    }
}

fn prune(admitted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = admitted.front() {
        if now.duration_since(front) >= window {
            admitted.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_without_waiting() {
        let limiter = RateLimiter::per_minute(3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_window().await, 3);
        assert_eq!(limiter.in_window_now(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_oldest_ages_out() {
        let limiter = RateLimiter::per_minute(2);
        let start = Instant::now();
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.acquire().await;

        limiter.acquire().await;
        // Third call waits for the first admission (t=0) to leave the window.
        assert_eq!(start.elapsed(), RATE_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_limit_in_any_window_under_concurrency() {
        let limit = 4;
        let limiter = Arc::new(RateLimiter::per_minute(limit));
        let admissions = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            let admissions = Arc::clone(&admissions);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                admissions.lock().await.push(start.elapsed());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut times = admissions.lock().await.clone();
        times.sort();
        assert_eq!(times.len(), 10);
        for (i, t) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .take_while(|u| **u < *t + RATE_WINDOW)
                .count();
            assert!(in_window <= limit, "{in_window} calls within 60s of {t:?}");
        }
        // 10 calls at 4/min need two full windows of waiting.
        assert_eq!(*times.last().unwrap(), RATE_WINDOW * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lowering_limit_applies_to_next_acquire() {
        let limiter = RateLimiter::per_minute(5);
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.set_limit(2);
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), RATE_WINDOW);
        assert_eq!(limiter.limit(), 2);
    }
}
