// =============================================================================
// Runtime Configuration — tickhub settings with atomic save
// =============================================================================
//
// Every tunable of the distribution layer lives here: which symbols and kline
// intervals are streamed, where the exchange endpoints are, the global
// significance thresholds, cache TTLs and hub liveness settings.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{ThresholdConfig, ThresholdOverride};
use crate::hub::HubConfig;
use crate::types::KLINE_INTERVALS;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_kline_intervals() -> Vec<String> {
    vec!["1m".to_string(), "5m".to_string()]
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upstream_ws_base() -> String {
    "wss://fstream.binance.com/stream".to_string()
}

fn default_rest_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_upstream_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_threshold_ttl_secs() -> u64 {
    60
}

fn default_threshold_key_prefix() -> String {
    "price".to_string()
}

fn default_store_purge_interval_secs() -> u64 {
    30
}

fn default_rest_prefix() -> String {
    "rest".to_string()
}

fn default_ticker_ttl_ms() -> u64 {
    2_000
}

fn default_klines_ttl_ms() -> u64 {
    10_000
}

fn default_depth_ttl_ms() -> u64 {
    1_000
}

fn default_mark_ttl_ms() -> u64 {
    3_000
}

// =============================================================================
// RequestCacheSettings
// =============================================================================

/// TTLs for REST pulls served through the request cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCacheSettings {
    #[serde(default = "default_rest_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_ticker_ttl_ms")]
    pub ticker_ttl_ms: u64,

    #[serde(default = "default_klines_ttl_ms")]
    pub klines_ttl_ms: u64,

    /// Order book snapshots go stale fastest.
    #[serde(default = "default_depth_ttl_ms")]
    pub depth_ttl_ms: u64,

    #[serde(default = "default_mark_ttl_ms")]
    pub mark_ttl_ms: u64,
}

impl Default for RequestCacheSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_rest_prefix(),
            ticker_ttl_ms: default_ticker_ttl_ms(),
            klines_ttl_ms: default_klines_ttl_ms(),
            depth_ttl_ms: default_depth_ttl_ms(),
            mark_ttl_ms: default_mark_ttl_ms(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Streams -------------------------------------------------------------

    /// Symbols streamed from the exchange.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Kline intervals subscribed per symbol.
    #[serde(default = "default_kline_intervals")]
    pub kline_intervals: Vec<String>,

    // --- Endpoints -----------------------------------------------------------

    /// Address the HTTP / WebSocket server listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Combined-stream WebSocket base.
    #[serde(default = "default_upstream_ws_base")]
    pub upstream_ws_base: String,

    /// Public REST base used for pull routes.
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// Fixed delay between upstream reconnect attempts.
    #[serde(default = "default_upstream_reconnect_delay_ms")]
    pub upstream_reconnect_delay_ms: u64,

    // --- Threshold cache -----------------------------------------------------

    /// Global significance thresholds.
    #[serde(default)]
    pub thresholds: ThresholdConfig,

    /// Lifetime of an accepted value without further significant updates.
    #[serde(default = "default_threshold_ttl_secs")]
    pub threshold_ttl_secs: u64,

    #[serde(default = "default_threshold_key_prefix")]
    pub threshold_key_prefix: String,

    /// How often expired store entries are swept.
    #[serde(default = "default_store_purge_interval_secs")]
    pub store_purge_interval_secs: u64,

    // --- Request cache -------------------------------------------------------

    #[serde(default)]
    pub request_cache: RequestCacheSettings,

    // --- Hub -----------------------------------------------------------------

    #[serde(default)]
    pub hub: HubConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            kline_intervals: default_kline_intervals(),
            bind_addr: default_bind_addr(),
            upstream_ws_base: default_upstream_ws_base(),
            rest_base_url: default_rest_base_url(),
            upstream_reconnect_delay_ms: default_upstream_reconnect_delay_ms(),
            thresholds: ThresholdConfig::default(),
            threshold_ttl_secs: default_threshold_ttl_secs(),
            threshold_key_prefix: default_threshold_key_prefix(),
            store_purge_interval_secs: default_store_purge_interval_secs(),
            request_cache: RequestCacheSettings::default(),
            hub: HubConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        config.normalize();

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            intervals = ?config.kline_intervals,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `TICKHUB_SYMBOLS` / `TICKHUB_BIND_ADDR` from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("TICKHUB_SYMBOLS") {
            self.symbols = syms.split(',').map(str::to_string).collect();
        }
        if let Ok(addr) = std::env::var("TICKHUB_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr.trim().to_string();
            }
        }
        self.normalize();
    }

    /// Upper-case and dedupe symbols, drop unsupported or repeated kline
    /// intervals, reset invalid thresholds and clamp the liveness period.
    pub fn normalize(&mut self) {
        let mut symbols: Vec<String> = Vec::with_capacity(self.symbols.len());
        for raw in &self.symbols {
            let sym = raw.trim().to_uppercase();
            if sym.is_empty() || symbols.contains(&sym) {
                continue;
            }
            if !sym.chars().all(|c| c.is_ascii_alphanumeric()) {
                warn!(symbol = %raw, "ignoring non-alphanumeric symbol");
                continue;
            }
            symbols.push(sym);
        }
        if symbols.is_empty() {
            warn!("no usable symbols configured, falling back to defaults");
            symbols = default_symbols();
        }
        self.symbols = symbols;

        let mut seen = HashSet::new();
        self.kline_intervals.retain(|iv| {
            if !KLINE_INTERVALS.contains(&iv.as_str()) {
                warn!(interval = %iv, "ignoring unsupported kline interval");
                return false;
            }
            seen.insert(iv.clone())
        });

        let global = ThresholdOverride {
            percentage: self.thresholds.percentage,
            absolute: self.thresholds.absolute,
        };
        if let Err(reason) = global.validate() {
            warn!(reason = %reason, "invalid global thresholds, using defaults");
            self.thresholds = ThresholdConfig::default();
        }

        if self.hub.liveness_interval_ms == 0 {
            warn!("hub liveness interval of 0 ms, using 1 ms");
            self.hub.liveness_interval_ms = 1;
        }
    }

    pub fn upstream_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.upstream_reconnect_delay_ms)
    }

    pub fn threshold_ttl(&self) -> Duration {
        Duration::from_secs(self.threshold_ttl_secs)
    }

    pub fn store_purge_interval(&self) -> Duration {
        Duration::from_secs(self.store_purge_interval_secs.max(1))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.symbols[4], "SOLUSDT");
        assert_eq!(cfg.upstream_reconnect_delay(), Duration::from_secs(5));
        assert_eq!(cfg.thresholds.percentage, Some(0.1));
        assert_eq!(cfg.thresholds.absolute, None);
        assert_eq!(cfg.hub.max_missed_pongs, 2);
        assert_eq!(cfg.threshold_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.kline_intervals, vec!["1m", "5m"]);
        assert_eq!(cfg.rest_base_url, "https://fapi.binance.com");
        assert_eq!(cfg.request_cache.key_prefix, "rest");
        assert_eq!(cfg.hub.liveness_interval_ms, 30_000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ethusdt"], "thresholds": { "absolute": 5.0 }, "hub": { "max_missed_pongs": 3 } }"#;
        let mut cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        cfg.normalize();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.thresholds.absolute, Some(5.0));
        assert_eq!(cfg.thresholds.percentage, Some(0.1));
        assert_eq!(cfg.thresholds.time_window_ms, 5_000);
        assert_eq!(cfg.hub.max_missed_pongs, 3);
        assert_eq!(cfg.hub.outbound_buffer, 256);
    }

    #[test]
    fn normalize_cleans_symbols_and_intervals() {
        let mut cfg = RuntimeConfig {
            symbols: vec![" btcusdt".into(), "BTCUSDT".into(), "bad-sym".into(), "".into()],
            kline_intervals: vec!["1m".into(), "7m".into(), "1M".into()],
            ..RuntimeConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.symbols, vec!["BTCUSDT"]);
        assert_eq!(cfg.kline_intervals, vec!["1m", "1M"]);
    }

    #[test]
    fn normalize_drops_repeated_intervals_anywhere() {
        let mut cfg = RuntimeConfig {
            kline_intervals: vec!["1m".into(), "5m".into(), "1m".into(), "5m".into()],
            ..RuntimeConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.kline_intervals, vec!["1m", "5m"]);
    }

    #[test]
    fn negative_file_thresholds_fall_back_to_defaults() {
        let json = r#"{ "thresholds": { "percentage": -1.0, "absolute": 2.0, "time_window_ms": 100 } }"#;
        let mut cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        cfg.normalize();
        assert_eq!(cfg.thresholds, ThresholdConfig::default());

        let json = r#"{ "thresholds": { "percentage": 0.5, "absolute": 2.0 } }"#;
        let mut cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        cfg.normalize();
        assert_eq!(cfg.thresholds.percentage, Some(0.5));
        assert_eq!(cfg.thresholds.absolute, Some(2.0));
    }

    #[test]
    fn zero_liveness_interval_is_clamped() {
        let json = r#"{ "hub": { "liveness_interval_ms": 0 } }"#;
        let mut cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        cfg.normalize();
        assert_eq!(cfg.hub.liveness_interval_ms, 1);
        assert_eq!(cfg.hub.liveness_interval(), Duration::from_millis(1));
    }

    #[test]
    fn save_then_load_roundtrips_through_disk() {
        let path = std::env::temp_dir().join(format!("tickhub-{}.json", uuid::Uuid::new_v4()));
        let mut cfg = RuntimeConfig::default();
        cfg.thresholds.absolute = Some(12.5);
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.thresholds, cfg.thresholds);
        assert_eq!(loaded.symbols, cfg.symbols);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(RuntimeConfig::load("/definitely/not/here/tickhub.json").is_err());
    }
}
