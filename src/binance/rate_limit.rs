// =============================================================================
// Rate-Limit Tracker — monitors Binance request weight to avoid 429s
// =============================================================================
//
// Public futures endpoints share a request-weight budget of 2400 per minute.
// We hard-cap ourselves below that and refuse pulls that would cross it; the
// request cache then keeps serving whatever it still holds.
//
// The tracker reads the `X-MBX-USED-WEIGHT-1M` response header after every
// request and keeps atomic counters that any thread may query lock-free.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 2000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 1600;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    requests: AtomicU64,
    blocked: AtomicU64,
}

/// Immutable snapshot of the current rate-limit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
    pub requests: u64,
    pub blocked: u64,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            requests: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Update the weight counter from the HTTP response headers returned by
    /// Binance.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    /// Return `true` if we can afford to spend `weight` more request weight
    /// without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current.saturating_add(weight) <= WEIGHT_HARD_LIMIT;
        if !allowed {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked, would exceed rate-limit"
            );
        }
        allowed
    }

    /// Reset the 1-minute weight counter (call from a periodic timer).
    pub fn reset_1m_weight(&self) {
        self.used_weight_1m.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            hard_limit: WEIGHT_HARD_LIMIT,
            requests: self.requests.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .finish()
    }
}
