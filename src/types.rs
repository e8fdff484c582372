// =============================================================================
// Shared types used across the tickhub distribution layer
// =============================================================================
//
// Channel keys, data kinds and the canonical market envelope that flows from
// the upstream feed through the threshold cache into the subscription hub and
// out to every client connection manager.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Kline intervals accepted by the exchange. Case-sensitive (`1m` != `1M`).
pub const KLINE_INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// DataKind
// =============================================================================

/// The kind of market data carried on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Ticker,
    Trade,
    Depth,
    Kline,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trade => "trade",
            Self::Depth => "depth",
            Self::Kline => "kline",
        }
    }

    /// The broadcast envelope type used for this kind.
    pub fn update_type(&self) -> UpdateType {
        match self {
            Self::Ticker => UpdateType::TickerUpdate,
            Self::Trade => UpdateType::PriceUpdate,
            Self::Depth => UpdateType::DepthUpdate,
            Self::Kline => UpdateType::KlineUpdate,
        }
    }

    /// Depth deltas are position-sensitive and never pass through the
    /// threshold gate.
    pub fn is_gated(&self) -> bool {
        !matches!(self, Self::Depth)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ticker" => Ok(Self::Ticker),
            "trade" => Ok(Self::Trade),
            "depth" => Ok(Self::Depth),
            "kline" => Ok(Self::Kline),
            other => Err(format!("unknown data kind '{other}'")),
        }
    }
}

/// `type` discriminator of a hub broadcast envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    PriceUpdate,
    TickerUpdate,
    DepthUpdate,
    KlineUpdate,
}

impl UpdateType {
    pub fn kind(&self) -> DataKind {
        match self {
            Self::PriceUpdate => DataKind::Trade,
            Self::TickerUpdate => DataKind::Ticker,
            Self::DepthUpdate => DataKind::Depth,
            Self::KlineUpdate => DataKind::Kline,
        }
    }
}

// =============================================================================
// ChannelKey
// =============================================================================

/// Canonical broadcast topic: `kind[:SYMBOL[:interval]]`.
///
/// Kind is lower-cased and the symbol upper-cased on parse; the interval is
/// kept verbatim and is only valid on kline channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelKey {
    kind: DataKind,
    symbol: Option<String>,
    interval: Option<String>,
}

impl ChannelKey {
    /// Build a channel for a concrete symbol (and optional kline interval).
    pub fn new(
        kind: DataKind,
        symbol: impl AsRef<str>,
        interval: Option<&str>,
    ) -> Result<Self, FeedError> {
        let mut raw = format!("{}:{}", kind.as_str(), symbol.as_ref());
        if let Some(iv) = interval {
            raw.push(':');
            raw.push_str(iv);
        }
        raw.parse()
    }

    /// The symbol-less firehose channel for a kind.
    pub fn firehose(kind: DataKind) -> Self {
        Self {
            kind,
            symbol: None,
            interval: None,
        }
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    pub fn interval(&self) -> Option<&str> {
        self.interval.as_deref()
    }

    /// Less specific channels that also receive this channel's broadcasts,
    /// most specific first. `kline:BTCUSDT:1m` yields `kline:BTCUSDT` and
    /// `kline`.
    pub fn ancestors(&self) -> Vec<ChannelKey> {
        let mut out = Vec::with_capacity(2);
        if self.interval.is_some() {
            out.push(Self {
                kind: self.kind,
                symbol: self.symbol.clone(),
                interval: None,
            });
        }
        if self.symbol.is_some() {
            out.push(Self::firehose(self.kind));
        }
        out
    }

    fn invalid(key: &str, reason: impl Into<String>) -> FeedError {
        FeedError::InvalidChannel {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl FromStr for ChannelKey {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(Self::invalid(s, "empty channel key"));
        }

        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() > 3 {
            return Err(Self::invalid(s, "too many segments"));
        }

        let kind: DataKind = parts[0].parse().map_err(|e: String| Self::invalid(s, e))?;

        let symbol = match parts.get(1) {
            Some(sym) => {
                if sym.is_empty() || !sym.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(Self::invalid(s, "symbol must be non-empty alphanumeric"));
                }
                Some(sym.to_ascii_uppercase())
            }
            None => None,
        };

        let interval = match parts.get(2) {
            Some(iv) => {
                if kind != DataKind::Kline {
                    return Err(Self::invalid(s, "interval is only valid on kline channels"));
                }
                if !KLINE_INTERVALS.contains(iv) {
                    return Err(Self::invalid(s, format!("unsupported interval '{iv}'")));
                }
                Some((*iv).to_string())
            }
            None => None,
        };

        Ok(Self {
            kind,
            symbol,
            interval,
        })
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        if let Some(sym) = &self.symbol {
            write!(f, ":{sym}")?;
        }
        if let Some(iv) = &self.interval {
            write!(f, ":{iv}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ChannelKey {
    type Error = FeedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> Self {
        key.to_string()
    }
}

// =============================================================================
// Canonical market payloads
// =============================================================================

/// 24h rolling ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerData {
    pub price: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub quote_volume: f64,
}

/// Single (aggregated) trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeData {
    pub price: f64,
    pub quantity: f64,
    pub trade_id: u64,
    pub is_buyer_maker: bool,
    pub trade_time: i64,
}

/// Order-book delta: `[price, quantity]` levels, quantity 0 removes a level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthData {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
}

/// OHLCV candle (possibly still open).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KlineData {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades: u64,
    pub is_closed: bool,
}

/// Normalized payload of one market update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MarketPayload {
    Ticker(TickerData),
    Trade(TradeData),
    Depth(DepthData),
    Kline(KlineData),
}

impl MarketPayload {
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Ticker(_) => DataKind::Ticker,
            Self::Trade(_) => DataKind::Trade,
            Self::Depth(_) => DataKind::Depth,
            Self::Kline(_) => DataKind::Kline,
        }
    }

    /// Dominant numeric field used by the threshold gate.
    pub fn primary(&self) -> Option<f64> {
        match self {
            Self::Ticker(t) => Some(t.price),
            Self::Trade(t) => Some(t.price),
            Self::Kline(k) => Some(k.close),
            Self::Depth(_) => None,
        }
    }
}

/// Canonical `{symbol, kind, payload, timestamp}` envelope produced by the
/// upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketEnvelope {
    pub symbol: String,
    pub interval: Option<String>,
    pub payload: MarketPayload,
    /// Exchange event time, epoch milliseconds.
    pub timestamp: i64,
}

impl MarketEnvelope {
    pub fn kind(&self) -> DataKind {
        self.payload.kind()
    }

    /// The most specific channel this update is published on.
    pub fn channel(&self) -> Result<ChannelKey, FeedError> {
        ChannelKey::new(self.kind(), &self.symbol, self.interval.as_deref())
    }

    /// Wire form broadcast to hub subscribers.
    pub fn to_broadcast(&self) -> Result<BroadcastEnvelope, serde_json::Error> {
        Ok(BroadcastEnvelope {
            kind: self.kind().update_type(),
            symbol: self.symbol.clone(),
            interval: self.interval.clone(),
            data: serde_json::to_value(&self.payload)?,
            timestamp: self.timestamp,
        })
    }
}

/// Hub → client broadcast frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    #[serde(rename = "type")]
    pub kind: UpdateType,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

impl BroadcastEnvelope {
    /// Channel this envelope was published on.
    pub fn channel(&self) -> Result<ChannelKey, FeedError> {
        ChannelKey::new(self.kind.kind(), &self.symbol, self.interval.as_deref())
    }
}
