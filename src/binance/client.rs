// =============================================================================
// Binance Futures REST Client — public market-data pulls
// =============================================================================
//
// Only unsigned `/fapi/v1` endpoints are used. Every call is checked against
// the shared request-weight tracker before it leaves the process and feeds the
// `X-MBX-USED-WEIGHT-1M` header back into it afterwards.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::rate_limit::RateLimitTracker;
use crate::types::{KlineData, TickerData};

/// Order-book snapshot as returned by `/fapi/v1/depth`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
}

/// Mark / index price and funding from `/fapi/v1/premiumIndex`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkPrice {
    pub symbol: String,
    pub mark_price: f64,
    pub index_price: f64,
    pub last_funding_rate: f64,
    pub next_funding_time: i64,
    pub time: i64,
}

/// Binance USDⓈ-M futures REST client (public endpoints only).
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(base_url: impl Into<String>, rate_limit: Arc<RateLimitTracker>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            rate_limit,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Weight-checked GET returning the raw JSON body.
    async fn get_json(&self, path: &str, query: &[(&str, String)], weight: u32) -> Result<Value> {
        if !self.rate_limit.can_send_request(weight) {
            anyhow::bail!("request weight budget exhausted, refusing GET {path}");
        }

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {} returned {}: {}", path, status, body);
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Market data (public, no signature required)
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/ticker/24hr for a single symbol.
    #[instrument(skip(self), name = "binance::ticker_24hr")]
    pub async fn ticker_24hr(&self, symbol: &str) -> Result<TickerData> {
        let body = self
            .get_json("/fapi/v1/ticker/24hr", &[("symbol", symbol.to_string())], 1)
            .await?;
        let ticker = parse_ticker(&body)?;
        debug!(symbol, price = ticker.price, "ticker retrieved");
        Ok(ticker)
    }

    /// GET /fapi/v1/klines: historical candlestick data.
    #[instrument(skip(self), name = "binance::klines")]
    pub async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<KlineData>> {
        let query = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let body = self
            .get_json("/fapi/v1/klines", &query, klines_weight(limit))
            .await?;

        let raw = body.as_array().context("klines response is not an array")?;
        let candles = raw
            .iter()
            .map(parse_kline_row)
            .collect::<Result<Vec<_>>>()?;

        debug!(symbol, interval, count = candles.len(), "klines retrieved");
        Ok(candles)
    }

    /// GET /fapi/v1/depth: order-book snapshot.
    #[instrument(skip(self), name = "binance::depth")]
    pub async fn depth(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot> {
        let query = [("symbol", symbol.to_string()), ("limit", limit.to_string())];
        let body = self
            .get_json("/fapi/v1/depth", &query, depth_weight(limit))
            .await?;
        let snapshot = parse_depth(&body)?;
        debug!(
            symbol,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "depth snapshot retrieved"
        );
        Ok(snapshot)
    }

    /// GET /fapi/v1/premiumIndex: mark price and funding.
    #[instrument(skip(self), name = "binance::mark_price")]
    pub async fn mark_price(&self, symbol: &str) -> Result<MarkPrice> {
        let body = self
            .get_json("/fapi/v1/premiumIndex", &[("symbol", symbol.to_string())], 1)
            .await?;
        parse_mark_price(&body)
    }
}

// Never leak the HTTP client internals into logs.
impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

// =============================================================================
// Request weights
// =============================================================================

fn klines_weight(limit: u32) -> u32 {
    match limit {
        0..=99 => 1,
        100..=499 => 2,
        500..=1000 => 5,
        _ => 10,
    }
}

fn depth_weight(limit: u32) -> u32 {
    match limit {
        0..=50 => 2,
        51..=100 => 5,
        101..=500 => 10,
        _ => 20,
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// Parse a JSON value that Binance sends as a decimal string.
fn parse_str_f64(v: &Value, field: &str) -> Result<f64> {
    match v {
        Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse '{field}' as f64: {s}")),
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("'{field}' is not a finite number")),
        other => anyhow::bail!("unexpected type for '{field}': {other}"),
    }
}

fn parse_i64(v: &Value, field: &str) -> Result<i64> {
    v.as_i64()
        .with_context(|| format!("'{field}' is missing or not an integer"))
}

fn parse_ticker(body: &Value) -> Result<TickerData> {
    Ok(TickerData {
        price: parse_str_f64(&body["lastPrice"], "lastPrice")?,
        price_change: parse_str_f64(&body["priceChange"], "priceChange")?,
        price_change_percent: parse_str_f64(&body["priceChangePercent"], "priceChangePercent")?,
        high: parse_str_f64(&body["highPrice"], "highPrice")?,
        low: parse_str_f64(&body["lowPrice"], "lowPrice")?,
        volume: parse_str_f64(&body["volume"], "volume")?,
        quote_volume: parse_str_f64(&body["quoteVolume"], "quoteVolume")?,
    })
}

/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume, trades, ...]`
fn parse_kline_row(row: &Value) -> Result<KlineData> {
    let arr = row.as_array().context("kline row is not an array")?;
    if arr.len() < 9 {
        anyhow::bail!("kline row has {} fields, expected at least 9", arr.len());
    }

    let close_time = parse_i64(&arr[6], "closeTime")?;
    Ok(KlineData {
        open_time: parse_i64(&arr[0], "openTime")?,
        close_time,
        open: parse_str_f64(&arr[1], "open")?,
        high: parse_str_f64(&arr[2], "high")?,
        low: parse_str_f64(&arr[3], "low")?,
        close: parse_str_f64(&arr[4], "close")?,
        volume: parse_str_f64(&arr[5], "volume")?,
        trades: arr[8].as_u64().context("'trades' is not an integer")?,
        is_closed: close_time < crate::types::now_ms(),
    })
}

fn parse_levels(v: &Value, side: &str) -> Result<Vec<[f64; 2]>> {
    v.as_array()
        .with_context(|| format!("depth '{side}' is not an array"))?
        .iter()
        .map(|level| -> Result<[f64; 2]> {
            let pair = level
                .as_array()
                .filter(|p| p.len() >= 2)
                .with_context(|| format!("malformed '{side}' level: {level}"))?;
            Ok([
                parse_str_f64(&pair[0], side)?,
                parse_str_f64(&pair[1], side)?,
            ])
        })
        .collect()
}

fn parse_depth(body: &Value) -> Result<DepthSnapshot> {
    Ok(DepthSnapshot {
        last_update_id: body["lastUpdateId"]
            .as_u64()
            .context("depth response missing 'lastUpdateId'")?,
        bids: parse_levels(&body["bids"], "bids")?,
        asks: parse_levels(&body["asks"], "asks")?,
    })
}

fn parse_mark_price(body: &Value) -> Result<MarkPrice> {
    Ok(MarkPrice {
        symbol: body["symbol"]
            .as_str()
            .context("premiumIndex response missing 'symbol'")?
            .to_string(),
        mark_price: parse_str_f64(&body["markPrice"], "markPrice")?,
        index_price: parse_str_f64(&body["indexPrice"], "indexPrice")?,
        last_funding_rate: parse_str_f64(&body["lastFundingRate"], "lastFundingRate")?,
        next_funding_time: parse_i64(&body["nextFundingTime"], "nextFundingTime")?,
        time: parse_i64(&body["time"], "time")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ticker_fields_are_decimal_strings() {
        let body = json!({
            "symbol": "BTCUSDT",
            "lastPrice": "64210.50",
            "priceChange": "-120.10",
            "priceChangePercent": "-0.187",
            "highPrice": "65000.00",
            "lowPrice": "63000.00",
            "volume": "1234.5",
            "quoteVolume": "79000000.0"
        });
        let t = parse_ticker(&body).unwrap();
        assert_eq!(t.price, 64210.5);
        assert_eq!(t.price_change, -120.1);
        assert_eq!(t.quote_volume, 79_000_000.0);
    }

    #[test]
    fn kline_row_parses_and_flags_closed_candles() {
        let row = json!([
            1_600_000_000_000i64, "1.0", "2.0", "0.5", "1.5", "100",
            1_600_000_059_999i64, "150", 42, "50", "75", "0"
        ]);
        let k = parse_kline_row(&row).unwrap();
        assert_eq!(k.open_time, 1_600_000_000_000);
        assert_eq!(k.close, 1.5);
        assert_eq!(k.trades, 42);
        assert!(k.is_closed);

        assert!(parse_kline_row(&json!([1, "2"])).is_err());
    }

    #[test]
    fn depth_snapshot_levels() {
        let body = json!({
            "lastUpdateId": 77,
            "bids": [["100.0", "1.5"], ["99.5", "2"]],
            "asks": [["100.5", "0.25"]]
        });
        let d = parse_depth(&body).unwrap();
        assert_eq!(d.last_update_id, 77);
        assert_eq!(d.bids, vec![[100.0, 1.5], [99.5, 2.0]]);
        assert_eq!(d.asks, vec![[100.5, 0.25]]);

        assert!(parse_depth(&json!({ "lastUpdateId": 1, "bids": [["x"]], "asks": [] })).is_err());
    }

    #[test]
    fn mark_price_parses() {
        let body = json!({
            "symbol": "ETHUSDT",
            "markPrice": "3100.12",
            "indexPrice": "3099.80",
            "lastFundingRate": "0.0001",
            "nextFundingTime": 1_700_000_000_000i64,
            "time": 1_699_999_000_000i64
        });
        let m = parse_mark_price(&body).unwrap();
        assert_eq!(m.symbol, "ETHUSDT");
        assert_eq!(m.mark_price, 3100.12);
        assert_eq!(m.last_funding_rate, 0.0001);
    }

    #[test]
    fn weights_follow_limit_tiers() {
        assert_eq!(klines_weight(50), 1);
        assert_eq!(klines_weight(500), 5);
        assert_eq!(klines_weight(1500), 10);
        assert_eq!(depth_weight(20), 2);
        assert_eq!(depth_weight(1000), 20);
    }

    #[tokio::test]
    async fn exhausted_budget_refuses_before_sending() {
        let tracker = Arc::new(RateLimitTracker::new());
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-MBX-USED-WEIGHT-1M",
            reqwest::header::HeaderValue::from_static("2000"),
        );
        tracker.update_from_headers(&headers);

        // Unroutable base URL: reaching the network would be a different error.
        let client = BinanceClient::new("http://127.0.0.1:1", tracker.clone()).unwrap();
        let err = client.ticker_24hr("BTCUSDT").await.unwrap_err();
        assert!(err.to_string().contains("budget exhausted"));
        assert_eq!(tracker.snapshot().blocked, 1);
    }
}
