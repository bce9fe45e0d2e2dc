use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, info};

use crate::metrics::RATE_LIMITER_KEYS;

// Rate limit entry - tracks requests per IP/key
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_start: Instant,
}

impl RateLimitEntry {
    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) > window
    }
}

/// Fixed-window request throttle keyed by client identifier.
///
/// A client can burst up to `2 * max_requests` across a window boundary;
/// this is a coarse abuse guard, not a fairness mechanism.
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_requests,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_rate_limited(&self, key: &str) -> bool {
        self.is_rate_limited_at(key, Instant::now())
    }

    /// Records a request for `key` at `now` and reports whether it must be rejected.
    ///
    /// Rejected requests do not count against the window.
    pub fn is_rate_limited_at(&self, key: &str, now: Instant) -> bool {
        let mut entry = match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => {
                // first request from this key
                vacant.insert(RateLimitEntry {
                    count: 1,
                    window_start: now,
                });
                return false;
            }
        };

        // window expired..? reset it
        if entry.expired(now, self.window) {
            entry.count = 1;
            entry.window_start = now;
            return false;
        }

        if entry.count >= self.max_requests {
            return true;
        }

        entry.count += 1;
        false
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// Drops every entry whose window has elapsed at `now`. Returns how many were removed.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.expired(now, self.window));
        before.saturating_sub(self.entries.len())
    }
}

// Sweep task - runs cleanup on a fixed schedule to bound memory
pub async fn cleanup_task(limiter: Arc<RateLimiter>, every: Duration) {
    let mut interval = interval(every);

    info!(interval = ?every, "Rate limiter sweep started");

    loop {
        interval.tick().await;

        let removed = limiter.cleanup();
        RATE_LIMITER_KEYS.set(limiter.len() as f64);

        if removed > 0 {
            debug!(removed, remaining = limiter.len(), "Swept expired rate limit entries");
        }
    }
}
