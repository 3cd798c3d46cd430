//! Fixed-window rate limiter keyed by connection id.
//!
//! The first event from an unseen id opens a window. Events inside the
//! window bump a counter; once the counter passes `max_events` the rest of
//! the window is rejected. A window that has elapsed is reset lazily on the
//! next check, so no timer runs per key. A periodic sweep drops ids that
//! have been quiet for `stale_windows` window lengths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    counters: Mutex<HashMap<String, Counter>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<String, Counter>> {
        // a poisoned table only holds counters; keep serving from it
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one event for `id` and report whether it must be rejected.
    pub fn is_limited(&self, id: &str) -> bool {
        self.is_limited_at(id, Instant::now())
    }

    pub fn is_limited_at(&self, id: &str, now: Instant) -> bool {
        let mut counters = self.counters();
        let Some(counter) = counters.get_mut(id) else {
            counters.insert(id.to_string(), Counter { count: 1, window_start: now, last_seen: now });
            return false;
        };

        counter.last_seen = now;
        if now.saturating_duration_since(counter.window_start) > self.config.window {
            counter.count = 1;
            counter.window_start = now;
            return false;
        }

        counter.count = counter.count.saturating_add(1);
        counter.count > self.config.max_events
    }

    /// Forget `id`'s counter immediately.
    pub fn reset(&self, id: &str) {
        self.counters().remove(id);
    }

    /// Drop ids idle for longer than `stale_windows` windows. Returns how
    /// many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let stale_after = self.config.window * self.config.stale_windows;
        let mut counters = self.counters();
        let before = counters.len();
        counters.retain(|_, c| now.saturating_duration_since(c.last_seen) <= stale_after);
        before - counters.len()
    }

    pub fn tracked(&self) -> usize {
        self.counters().len()
    }

    /// Spawn the periodic sweep. Calling it again replaces the old task.
    pub fn start(self: &Arc<Self>) {
        let limiter = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else { break };
                let removed = limiter.sweep(Instant::now());
                if removed > 0 {
                    log::debug!("Rate limiter swept {removed} idle connections");
                }
            }
        });
        if let Some(old) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).replace(handle) {
            old.abort();
        }
    }

    /// Stop the sweep and drop all counters.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.counters().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(max_events: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_events,
            window: Duration::from_millis(1000),
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn test_exactly_n_events_pass() {
        let limiter = limiter(5);
        let t0 = Instant::now();
        for i in 0..5 {
            assert!(!limiter.is_limited_at("c1", t0 + Duration::from_millis(i)), "event {i}");
        }
        assert!(limiter.is_limited_at("c1", t0 + Duration::from_millis(10)));
        assert!(limiter.is_limited_at("c1", t0 + Duration::from_millis(20)));
    }

    #[test]
    fn test_window_elapse_resets() {
        let limiter = limiter(2);
        let t0 = Instant::now();
        limiter.is_limited_at("c1", t0);
        limiter.is_limited_at("c1", t0);
        assert!(limiter.is_limited_at("c1", t0));

        // boundary is exclusive: still the same window at exactly 1s
        assert!(limiter.is_limited_at("c1", t0 + Duration::from_millis(1000)));
        assert!(!limiter.is_limited_at("c1", t0 + Duration::from_millis(1001)));
    }

    #[test]
    fn test_ids_are_independent() {
        let limiter = limiter(1);
        let t0 = Instant::now();
        assert!(!limiter.is_limited_at("a", t0));
        assert!(limiter.is_limited_at("a", t0));
        assert!(!limiter.is_limited_at("b", t0));
    }

    #[test]
    fn test_reset_clears_penalty() {
        let limiter = limiter(1);
        let t0 = Instant::now();
        limiter.is_limited_at("a", t0);
        assert!(limiter.is_limited_at("a", t0));
        limiter.reset("a");
        assert!(!limiter.is_limited_at("a", t0));
    }

    #[test]
    fn test_sweep_drops_idle_ids() {
        let limiter = limiter(10);
        let t0 = Instant::now();
        limiter.is_limited_at("idle", t0);
        limiter.is_limited_at("busy", t0 + Duration::from_secs(9));

        assert_eq!(limiter.sweep(t0 + Duration::from_secs(10)), 0);
        assert_eq!(limiter.sweep(t0 + Duration::from_millis(10_001)), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            window: Duration::from_millis(100),
            stale_windows: 2,
            sweep_interval: Duration::from_secs(1),
            ..RateLimitConfig::default()
        }));
        limiter.start();
        limiter.is_limited("c1");
        assert_eq!(limiter.tracked(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(limiter.tracked(), 0);

        limiter.shutdown();
    }
}
