// =============================================================================
// Central Application State — tickhub
// =============================================================================
//
// Ties the distribution subsystems together for the HTTP / WebSocket layer and
// the background tasks started by `main`. Every subsystem manages its own
// interior mutability; AppState only holds `Arc`s to them.
//
// Wiring:
//   MemoryStore ──┬── ThresholdCache ──┐
//                 └── RequestCache     ├── FeedPipeline ── UpstreamFeed
//   OverrideTable ┬── ThresholdCache   │
//                 └── SubscriptionHub ─┘
// =============================================================================

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::binance::{BinanceClient, RateLimitTracker};
use crate::cache::{MemoryStore, OverrideTable, RequestCache, ThresholdCache};
use crate::feed::{FeedPipeline, UpstreamConfig, UpstreamFeed};
use crate::hub::SubscriptionHub;
use crate::runtime_config::RuntimeConfig;

// =============================================================================
// Error Log
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event, surfaced through `/api/v1/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// Optional machine-readable error code (e.g. `UPSTREAM_DISCONNECTED`).
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Bounded ring of recent operational errors.
#[derive(Debug, Default)]
pub struct ErrorLog {
    recent: RwLock<VecDeque<ErrorRecord>>,
}

impl ErrorLog {
    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    /// Record an error with an optional machine-readable code. The oldest
    /// entry is dropped once [`MAX_RECENT_ERRORS`] is reached.
    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut recent = self.recent.write();
        recent.push_back(record);
        while recent.len() > MAX_RECENT_ERRORS {
            recent.pop_front();
        }
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.recent.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.recent.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.read().is_empty()
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Configuration ───────────────────────────────────────────────────
    pub config: RwLock<RuntimeConfig>,
    /// Where admin changes are persisted. `None` disables persistence.
    pub config_path: Option<PathBuf>,
    /// Bearer token for `/api/v1/admin/*`. Admin routes are closed when unset.
    pub admin_token: Option<String>,

    // ── Caches ──────────────────────────────────────────────────────────
    pub store: Arc<MemoryStore>,
    pub overrides: Arc<OverrideTable>,
    pub threshold_cache: Arc<ThresholdCache>,
    pub request_cache: Arc<RequestCache>,

    // ── Distribution ────────────────────────────────────────────────────
    pub hub: Arc<SubscriptionHub>,
    pub pipeline: Arc<FeedPipeline>,
    pub upstream: Arc<UpstreamFeed>,

    // ── Exchange REST ───────────────────────────────────────────────────
    pub binance: Arc<BinanceClient>,
    pub rate_limit: Arc<RateLimitTracker>,

    pub errors: Arc<ErrorLog>,

    /// Instant when the process was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build every subsystem from `config`. Nothing is spawned here; `main`
    /// starts the background loops.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let overrides = Arc::new(OverrideTable::new());

        let threshold_cache = Arc::new(ThresholdCache::new(
            store.clone(),
            config.threshold_key_prefix.clone(),
            config.threshold_ttl(),
            config.thresholds,
            overrides.clone(),
        ));
        let request_cache = Arc::new(RequestCache::new(store.clone()));

        let hub = Arc::new(SubscriptionHub::new(config.hub.clone(), overrides.clone()));
        let pipeline = Arc::new(FeedPipeline::new(threshold_cache.clone(), hub.clone()));

        let errors = Arc::new(ErrorLog::default());
        let upstream = Arc::new(UpstreamFeed::new(
            UpstreamConfig {
                ws_base: config.upstream_ws_base.clone(),
                symbols: config.symbols.clone(),
                kline_intervals: config.kline_intervals.clone(),
                reconnect_delay: config.upstream_reconnect_delay(),
            },
            pipeline.clone(),
            errors.clone(),
        ));

        let rate_limit = Arc::new(RateLimitTracker::new());
        let binance = Arc::new(BinanceClient::new(
            config.rest_base_url.clone(),
            rate_limit.clone(),
        )?);

        Ok(Self {
            config: RwLock::new(config),
            config_path: None,
            admin_token: None,
            store,
            overrides,
            threshold_cache,
            request_cache,
            hub,
            pipeline,
            upstream,
            binance,
            rate_limit,
            errors,
            start_time: std::time::Instant::now(),
        })
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Blank tokens are treated as unset.
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Write the current runtime config to `config_path`, if any.
    pub fn persist_config(&self) -> Result<()> {
        match &self.config_path {
            Some(path) => self.config.read().save(path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelKey, DataKind};

    #[test]
    fn error_log_keeps_the_newest_records() {
        let log = ErrorLog::default();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            log.push_error(format!("err {i}"));
        }
        log.push_error_with_code("stream down".into(), Some("UPSTREAM_DISCONNECTED".into()));

        let recent = log.recent();
        assert_eq!(recent.len(), MAX_RECENT_ERRORS);
        assert_eq!(recent[0].message, "err 6");
        let last = recent.last().unwrap();
        assert_eq!(last.code.as_deref(), Some("UPSTREAM_DISCONNECTED"));
    }

    #[test]
    fn subsystems_share_the_override_table() {
        let state = AppState::new(RuntimeConfig::default()).unwrap();
        let channel = ChannelKey::new(DataKind::Ticker, "BTCUSDT", None).unwrap();
        let (tx, _rx) = state.hub.outbound_channel();
        let id = state.hub.register(tx).id;
        state.hub.activate(id).unwrap();

        let tight = crate::cache::ThresholdOverride {
            percentage: Some(0.01),
            absolute: None,
        };
        state.hub.subscribe(id, &channel, Some(tight)).unwrap();

        let effective = state.threshold_cache.effective_thresholds(&channel);
        assert_eq!(effective.percentage, Some(0.01));
        assert_eq!(state.overrides.len(), 1);
    }

    #[test]
    fn blank_admin_token_is_ignored() {
        let state = AppState::new(RuntimeConfig::default())
            .unwrap()
            .with_admin_token(Some("   ".into()));
        assert!(state.admin_token.is_none());
        assert!(state.persist_config().is_ok());
    }
}
