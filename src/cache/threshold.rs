// =============================================================================
// Threshold Cache — significance gate for streaming market values
// =============================================================================
//
// Holds the last *accepted* value per channel and decides whether a new
// observation is significant enough to persist and rebroadcast:
//
//   1. No stored entry                     -> store, Significant
//   2. |Δ| >= absolute or Δ% >= percentage -> store, Significant
//   3. remaining TTL < time window         -> store, Significant (refresh)
//   4. otherwise                           -> leave baseline, Suppressed
//
// Suppressed observations never touch the baseline, so small moves accumulate
// against the last accepted value until they cross the threshold.
//
// The effective threshold of a channel is reduced from its subscribers'
// requested overrides by the hub (see `OverrideTable`) and merged with the
// global config on read.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::keys::CacheKey;
use crate::cache::store::CacheStore;
use crate::error::CacheError;
use crate::types::{now_ms, ChannelKey};

// =============================================================================
// Threshold configuration
// =============================================================================

fn default_percentage() -> Option<f64> {
    Some(0.1)
}

fn default_time_window_ms() -> u64 {
    5_000
}

/// Process-wide significance thresholds. An unset bound is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Minimum percentage move relative to the stored baseline.
    #[serde(default = "default_percentage")]
    pub percentage: Option<f64>,

    /// Minimum absolute move relative to the stored baseline.
    #[serde(default)]
    pub absolute: Option<f64>,

    /// Entries whose remaining TTL drops below this window are refreshed by
    /// the next observation regardless of magnitude.
    #[serde(default = "default_time_window_ms")]
    pub time_window_ms: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            percentage: default_percentage(),
            absolute: None,
            time_window_ms: default_time_window_ms(),
        }
    }
}

impl ThresholdConfig {
    pub fn time_window(&self) -> Duration {
        Duration::from_millis(self.time_window_ms)
    }
}

/// Thresholds a single subscriber asked for. Unset fields follow the global
/// config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOverride {
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub absolute: Option<f64>,
}

impl ThresholdOverride {
    /// Both bounds, when present, must be finite and non-negative.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [("percentage", self.percentage), ("absolute", self.absolute)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("threshold {name} must be a non-negative number"));
                }
            }
        }
        Ok(())
    }
}

/// Smallest of two optional bounds where `None` means "disabled" (infinite).
fn min_bound(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

// =============================================================================
// Per-channel reduced thresholds
// =============================================================================

/// One bound reduced over a set of subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReducedBound {
    /// Smallest explicit request.
    pub min: Option<f64>,
    /// At least one subscriber follows the global value.
    pub includes_global: bool,
}

impl ReducedBound {
    fn push(&mut self, requested: Option<f64>) {
        match requested {
            Some(v) => self.min = min_bound(self.min, Some(v)),
            None => self.includes_global = true,
        }
    }

    fn merge(self, other: ReducedBound) -> ReducedBound {
        ReducedBound {
            min: min_bound(self.min, other.min),
            includes_global: self.includes_global || other.includes_global,
        }
    }

    fn resolve(&self, global: Option<f64>) -> Option<f64> {
        if self.includes_global {
            min_bound(self.min, global)
        } else {
            self.min
        }
    }
}

/// The most sensitive thresholds requested by a channel's active subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelThreshold {
    pub percentage: ReducedBound,
    pub absolute: ReducedBound,
}

impl ChannelThreshold {
    /// Reduce subscriber requests (`None` = no override) into one threshold.
    /// Returns `None` when there are no subscribers.
    pub fn reduce<'a, I>(requests: I) -> Option<ChannelThreshold>
    where
        I: IntoIterator<Item = Option<&'a ThresholdOverride>>,
    {
        let mut out = ChannelThreshold::default();
        let mut any = false;
        for request in requests {
            any = true;
            let o = request.copied().unwrap_or_default();
            out.percentage.push(o.percentage);
            out.absolute.push(o.absolute);
        }
        any.then_some(out)
    }

    fn merge(self, other: ChannelThreshold) -> ChannelThreshold {
        ChannelThreshold {
            percentage: self.percentage.merge(other.percentage),
            absolute: self.absolute.merge(other.absolute),
        }
    }

    /// Effective thresholds given the current global config.
    pub fn resolve(&self, global: &ThresholdConfig) -> ThresholdConfig {
        ThresholdConfig {
            percentage: self.percentage.resolve(global.percentage),
            absolute: self.absolute.resolve(global.absolute),
            time_window_ms: global.time_window_ms,
        }
    }
}

/// Channel → reduced subscriber thresholds. Written by the hub on membership
/// changes, read by the cache on every evaluate.
#[derive(Debug, Default)]
pub struct OverrideTable {
    channels: RwLock<HashMap<ChannelKey, ChannelThreshold>>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (or clear, with `None`) the reduced threshold of a channel.
    pub fn set(&self, channel: &ChannelKey, threshold: Option<ChannelThreshold>) {
        let mut map = self.channels.write();
        match threshold {
            Some(t) => {
                map.insert(channel.clone(), t);
            }
            None => {
                map.remove(channel);
            }
        }
    }

    pub fn get(&self, channel: &ChannelKey) -> Option<ChannelThreshold> {
        self.channels.read().get(channel).copied()
    }

    /// Effective thresholds for updates published on `channel`: merged over
    /// the channel and the ancestors that also receive it, falling back to
    /// `global` when nobody is subscribed.
    pub fn resolve(&self, channel: &ChannelKey, global: &ThresholdConfig) -> ThresholdConfig {
        let map = self.channels.read();
        let mut reduced: Option<ChannelThreshold> = map.get(channel).copied();
        for ancestor in channel.ancestors() {
            if let Some(t) = map.get(&ancestor) {
                reduced = Some(match reduced {
                    Some(r) => r.merge(*t),
                    None => *t,
                });
            }
        }
        match reduced {
            Some(r) => r.resolve(global),
            None => *global,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

// =============================================================================
// Cache entries
// =============================================================================

/// Value carried by an observation and stored on acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    /// Dominant numeric field (last price / close).
    pub primary: f64,
    /// Full normalized payload.
    pub data: serde_json::Value,
}

/// Stored baseline for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: CachedValue,
    /// Epoch ms when the value was accepted.
    pub accepted_at: i64,
    /// Epoch ms when the entry lapses without a further significant update.
    pub expires_at: i64,
}

/// Outcome of [`ThresholdCache::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Significant,
    Suppressed,
}

impl Verdict {
    pub fn is_significant(&self) -> bool {
        matches!(self, Self::Significant)
    }
}

/// Why an observation was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acceptance {
    First,
    Threshold,
    ForcedRefresh,
}

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdStats {
    pub significant: u64,
    pub suppressed: u64,
    pub forced_refresh: u64,
    pub fail_open: u64,
    pub overridden_channels: usize,
}

// =============================================================================
// ThresholdCache
// =============================================================================

pub struct ThresholdCache {
    store: Arc<dyn CacheStore>,
    prefix: String,
    entry_ttl: Duration,
    config: RwLock<ThresholdConfig>,
    overrides: Arc<OverrideTable>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,

    significant: AtomicU64,
    suppressed: AtomicU64,
    forced_refresh: AtomicU64,
    fail_open: AtomicU64,
}

impl ThresholdCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        prefix: impl Into<String>,
        entry_ttl: Duration,
        config: ThresholdConfig,
        overrides: Arc<OverrideTable>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            entry_ttl,
            config: RwLock::new(config),
            overrides,
            key_locks: Mutex::new(HashMap::new()),
            significant: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            forced_refresh: AtomicU64::new(0),
            fail_open: AtomicU64::new(0),
        }
    }

    /// Current global thresholds.
    pub fn thresholds(&self) -> ThresholdConfig {
        *self.config.read()
    }

    /// Replace the global thresholds. Applies to every later evaluate; stored
    /// entries are left as they are.
    pub fn set_thresholds(&self, config: ThresholdConfig) {
        let previous = std::mem::replace(&mut *self.config.write(), config);
        info!(?previous, current = ?config, "threshold config replaced");
    }

    /// Effective thresholds for a channel right now.
    pub fn effective_thresholds(&self, channel: &ChannelKey) -> ThresholdConfig {
        self.overrides.resolve(channel, &self.thresholds())
    }

    /// Last accepted value of a channel. Suppressed observations are never
    /// visible here.
    pub async fn get(&self, channel: &ChannelKey) -> Result<Option<CacheEntry>, CacheError> {
        let key = CacheKey::for_channel(&self.prefix, channel).to_string();
        match self.store.get(&key).await? {
            Some(stored) => Ok(Some(serde_json::from_str(&stored.data)?)),
            None => Ok(None),
        }
    }

    /// Gate an observation. Calls for the same channel are serialized; calls
    /// for different channels run independently.
    pub async fn evaluate(
        &self,
        channel: &ChannelKey,
        value: CachedValue,
    ) -> Result<Verdict, CacheError> {
        let key = CacheKey::for_channel(&self.prefix, channel).to_string();
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let thresholds = self.effective_thresholds(channel);

        let current = match self.store.get(&key).await? {
            Some(stored) => match serde_json::from_str::<CacheEntry>(&stored.data) {
                Ok(entry) => Some((entry, stored.remaining)),
                Err(e) => {
                    warn!(key = %key, error = %e, "undecodable cache entry, treating as absent");
                    None
                }
            },
            None => None,
        };

        let acceptance = match &current {
            None => Some(Acceptance::First),
            Some((entry, remaining)) => {
                let baseline = entry.value.primary;
                let absolute_change = (value.primary - baseline).abs();
                let percentage_change = if baseline != 0.0 {
                    absolute_change / baseline.abs() * 100.0
                } else if absolute_change > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                };

                let pct_hit = thresholds
                    .percentage
                    .is_some_and(|p| percentage_change >= p);
                let abs_hit = thresholds.absolute.is_some_and(|a| absolute_change >= a);

                if pct_hit || abs_hit {
                    Some(Acceptance::Threshold)
                } else if *remaining < thresholds.time_window() {
                    Some(Acceptance::ForcedRefresh)
                } else {
                    None
                }
            }
        };

        let Some(acceptance) = acceptance else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return Ok(Verdict::Suppressed);
        };

        let now = now_ms();
        let entry = CacheEntry {
            key: key.clone(),
            value,
            accepted_at: now,
            expires_at: now + self.entry_ttl.as_millis() as i64,
        };
        let encoded = serde_json::to_string(&entry)?;
        self.store.set(&key, encoded, self.entry_ttl).await?;

        self.significant.fetch_add(1, Ordering::Relaxed);
        if acceptance == Acceptance::ForcedRefresh {
            self.forced_refresh.fetch_add(1, Ordering::Relaxed);
        }
        debug!(key = %key, primary = entry.value.primary, ?acceptance, "observation accepted");
        Ok(Verdict::Significant)
    }

    /// Count an update forwarded without the gate because the store failed.
    pub fn record_fail_open(&self) {
        self.fail_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ThresholdStats {
        ThresholdStats {
            significant: self.significant.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            forced_refresh: self.forced_refresh.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            overridden_channels: self.overrides.len(),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

impl std::fmt::Debug for ThresholdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThresholdCache")
            .field("prefix", &self.prefix)
            .field("entry_ttl", &self.entry_ttl)
            .field("config", &*self.config.read())
            .finish()
    }
}
