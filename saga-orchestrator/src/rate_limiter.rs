//! Per-client rate limiting across burst/minute/hour fixed windows.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub burst_limit: u64,
    pub burst_window: Duration,
    pub minute_limit: u64,
    pub hour_limit: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst_limit: 50,
            burst_window: Duration::from_secs(10),
            minute_limit: 600,
            hour_limit: 20_000,
        }
    }
}

/// A single fixed window: a count and the instant it last reset.
struct Window {
    limit: u64,
    period: Duration,
    count: AtomicU64,
    window_started_at: std::sync::Mutex<Instant>,
}

impl Window {
    fn new(limit: u64, period: Duration) -> Self {
        Self {
            limit,
            period,
            count: AtomicU64::new(0),
            window_started_at: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Attempts to consume one slot. Reconciles the window boundary under a
    /// short-lived lock so resets and increments never race past each other;
    /// the counter itself stays atomic for the common (no-reset) path.
    fn try_consume(&self) -> bool {
        let mut started_at = self.window_started_at.lock().expect("lock poisoned");
        if started_at.elapsed() >= self.period {
            *started_at = Instant::now();
            self.count.store(0, Ordering::SeqCst);
        }
        let previous = self.count.fetch_add(1, Ordering::SeqCst);
        if previous < self.limit {
            true
        } else {
            self.count.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }
}

struct ClientWindows {
    burst: Window,
    minute: Window,
    hour: Window,
}

/// Keyed per `client_id`; a request is allowed only if all three windows
/// currently have capacity.
pub struct RateLimiter {
    clients: Arc<DashMap<String, ClientWindows>>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Returns `true` if the request is allowed under all three windows.
    /// Evaluates burst first since it is the cheapest to exhaust, but all
    /// three windows are consulted so a caller only denied by (say) the hour
    /// window doesn't silently consume burst/minute budget it shouldn't.
    pub fn allow(&self, client_id: &str) -> bool {
        let entry = self.clients.entry(client_id.to_string()).or_insert_with(|| ClientWindows {
            burst: Window::new(self.config.burst_limit, self.config.burst_window),
            minute: Window::new(self.config.minute_limit, Duration::from_secs(60)),
            hour: Window::new(self.config.hour_limit, Duration::from_secs(3600)),
        });

        let burst_ok = entry.burst.try_consume();
        let minute_ok = entry.minute.try_consume();
        let hour_ok = entry.hour.try_consume();

        if burst_ok && minute_ok && hour_ok {
            true
        } else {
            if burst_ok {
                entry.burst.count.fetch_sub(1, Ordering::SeqCst);
            }
            if minute_ok {
                entry.minute.count.fetch_sub(1, Ordering::SeqCst);
            }
            if hour_ok {
                entry.hour.count.fetch_sub(1, Ordering::SeqCst);
            }
            false
        }
    }
}
