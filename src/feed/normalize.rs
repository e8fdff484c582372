// =============================================================================
// Upstream frame normalization
// =============================================================================
//
// Binance futures push frames arrive either raw or wrapped by the combined
// stream endpoint:
//
//   { "stream": "btcusdt@aggTrade", "data": { "e": "aggTrade", ... } }
//
// `data` may also be an array (e.g. `!ticker@arr`). Each event is mapped onto
// the canonical `MarketEnvelope` using its `e` discriminator. Frames without
// an `e` (subscription results) and unknown event types are skipped.
// =============================================================================

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{FeedError, Result};
use crate::types::{DepthData, KlineData, MarketEnvelope, MarketPayload, TickerData, TradeData};

/// Exchange prices and quantities come as decimal strings; accept numbers too.
fn de_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        Str(String),
        F(f64),
    }
    match Num::deserialize(deserializer)? {
        Num::F(f) => Ok(f),
        Num::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<[f64; 2]>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<[String; 2]> = Vec::deserialize(deserializer)?;
    raw.into_iter()
        .map(|[p, q]| {
            let price: f64 = p.parse().map_err(serde::de::Error::custom)?;
            let qty: f64 = q.parse().map_err(serde::de::Error::custom)?;
            Ok([price, qty])
        })
        .collect()
}

// ── Raw exchange events ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawTicker {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c", deserialize_with = "de_f64")]
    last: f64,
    #[serde(rename = "p", deserialize_with = "de_f64")]
    change: f64,
    #[serde(rename = "P", deserialize_with = "de_f64")]
    change_percent: f64,
    #[serde(rename = "h", deserialize_with = "de_f64")]
    high: f64,
    #[serde(rename = "l", deserialize_with = "de_f64")]
    low: f64,
    #[serde(rename = "v", deserialize_with = "de_f64")]
    volume: f64,
    #[serde(rename = "q", deserialize_with = "de_f64")]
    quote_volume: f64,
}

#[derive(Deserialize)]
struct RawTrade {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    /// `a` on aggTrade, `t` on trade.
    #[serde(rename = "a", alias = "t")]
    id: u64,
    #[serde(rename = "p", deserialize_with = "de_f64")]
    price: f64,
    #[serde(rename = "q", deserialize_with = "de_f64")]
    quantity: f64,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

#[derive(Deserialize)]
struct RawDepth {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b", deserialize_with = "de_levels")]
    bids: Vec<[f64; 2]>,
    #[serde(rename = "a", deserialize_with = "de_levels")]
    asks: Vec<[f64; 2]>,
}

#[derive(Deserialize)]
struct RawKlineEvent {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: RawKline,
}

#[derive(Deserialize)]
struct RawKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o", deserialize_with = "de_f64")]
    open: f64,
    #[serde(rename = "h", deserialize_with = "de_f64")]
    high: f64,
    #[serde(rename = "l", deserialize_with = "de_f64")]
    low: f64,
    #[serde(rename = "c", deserialize_with = "de_f64")]
    close: f64,
    #[serde(rename = "v", deserialize_with = "de_f64")]
    volume: f64,
    #[serde(rename = "n")]
    trades: u64,
    #[serde(rename = "x")]
    is_closed: bool,
}

// ── Parsing ─────────────────────────────────────────────────────────────────

/// Normalize one upstream text frame into zero or more envelopes.
pub fn parse_frame(text: &str) -> Result<Vec<MarketEnvelope>> {
    let root: Value = serde_json::from_str(text)?;

    let data = match root {
        Value::Object(mut obj) if obj.contains_key("stream") && obj.contains_key("data") => {
            obj.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };

    match data {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(env) = parse_event(item)? {
                    out.push(env);
                }
            }
            Ok(out)
        }
        Value::Object(_) => Ok(parse_event(data)?.into_iter().collect()),
        _ => Err(FeedError::MalformedMessage(
            "expected an object or array payload".into(),
        )),
    }
}

fn parse_event(event: Value) -> Result<Option<MarketEnvelope>> {
    let Some(kind) = event.get("e").and_then(|e| e.as_str()).map(str::to_owned) else {
        return Ok(None);
    };

    let envelope = match kind.as_str() {
        "24hrTicker" => {
            let t: RawTicker = serde_json::from_value(event)?;
            MarketEnvelope {
                symbol: t.symbol,
                interval: None,
                payload: MarketPayload::Ticker(TickerData {
                    price: t.last,
                    price_change: t.change,
                    price_change_percent: t.change_percent,
                    high: t.high,
                    low: t.low,
                    volume: t.volume,
                    quote_volume: t.quote_volume,
                }),
                timestamp: t.event_time,
            }
        }
        "aggTrade" | "trade" => {
            let t: RawTrade = serde_json::from_value(event)?;
            MarketEnvelope {
                symbol: t.symbol,
                interval: None,
                payload: MarketPayload::Trade(TradeData {
                    price: t.price,
                    quantity: t.quantity,
                    trade_id: t.id,
                    is_buyer_maker: t.is_buyer_maker,
                    trade_time: t.trade_time,
                }),
                timestamp: t.event_time,
            }
        }
        "depthUpdate" => {
            let d: RawDepth = serde_json::from_value(event)?;
            MarketEnvelope {
                symbol: d.symbol,
                interval: None,
                payload: MarketPayload::Depth(DepthData {
                    first_update_id: d.first_update_id,
                    final_update_id: d.final_update_id,
                    bids: d.bids,
                    asks: d.asks,
                }),
                timestamp: d.event_time,
            }
        }
        "kline" => {
            let k: RawKlineEvent = serde_json::from_value(event)?;
            MarketEnvelope {
                symbol: k.symbol,
                interval: Some(k.kline.interval),
                payload: MarketPayload::Kline(KlineData {
                    open_time: k.kline.open_time,
                    close_time: k.kline.close_time,
                    open: k.kline.open,
                    high: k.kline.high,
                    low: k.kline.low,
                    close: k.kline.close,
                    volume: k.kline.volume,
                    trades: k.kline.trades,
                    is_closed: k.kline.is_closed,
                }),
                timestamp: k.event_time,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataKind;

    #[test]
    fn combined_agg_trade() {
        let frame = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1700000000123,"s":"BTCUSDT","a":5933014,"p":"37000.10","q":"0.123","f":100,"l":105,"T":1700000000120,"m":true}}"#;
        let out = parse_frame(frame).unwrap();
        assert_eq!(out.len(), 1);
        let env = &out[0];
        assert_eq!(env.kind(), DataKind::Trade);
        assert_eq!(env.symbol, "BTCUSDT");
        assert_eq!(env.timestamp, 1700000000123);
        match &env.payload {
            MarketPayload::Trade(t) => {
                assert_eq!(t.price, 37000.10);
                assert_eq!(t.trade_id, 5933014);
                assert!(t.is_buyer_maker);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn raw_kline_keeps_interval() {
        let frame = r#"{"e":"kline","E":1,"s":"ETHUSDT","k":{"t":0,"T":59999,"s":"ETHUSDT","i":"1m","f":1,"L":2,"o":"2000","c":"2001.5","h":"2002","l":"1999","v":"10","n":42,"x":false,"q":"20000","V":"5","Q":"10000","B":"0"}}"#;
        let env = parse_frame(frame).unwrap().remove(0);
        assert_eq!(env.interval.as_deref(), Some("1m"));
        assert_eq!(env.payload.primary(), Some(2001.5));
        assert_eq!(env.channel().unwrap().to_string(), "kline:ETHUSDT:1m");
    }

    #[test]
    fn depth_levels_parse() {
        let frame = r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","E":5,"T":4,"s":"BTCUSDT","U":10,"u":12,"pu":9,"b":[["37000.0","1.5"]],"a":[["37001.0","0"]]}}"#;
        let env = parse_frame(frame).unwrap().remove(0);
        match env.payload {
            MarketPayload::Depth(d) => {
                assert_eq!(d.bids, vec![[37000.0, 1.5]]);
                assert_eq!(d.asks, vec![[37001.0, 0.0]]);
                assert_eq!((d.first_update_id, d.final_update_id), (10, 12));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ticker_array_expands() {
        let frame = r#"{"stream":"!ticker@arr","data":[
            {"e":"24hrTicker","E":1,"s":"BTCUSDT","p":"10","P":"0.5","c":"37000","h":"37100","l":"36000","v":"100","q":"3700000"},
            {"e":"24hrTicker","E":1,"s":"ETHUSDT","p":"1","P":"0.1","c":"2000","h":"2100","l":"1900","v":"50","q":"100000"}
        ]}"#;
        let out = parse_frame(frame).unwrap();
        let symbols: Vec<&str> = out.iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(out[0].payload.primary(), Some(37000.0));
    }

    #[test]
    fn unknown_and_control_frames_are_skipped() {
        assert!(parse_frame(r#"{"result":null,"id":1}"#).unwrap().is_empty());
        assert!(parse_frame(r#"{"e":"markPriceUpdate","E":1,"s":"BTCUSDT"}"#).unwrap().is_empty());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(parse_frame("not json"), Err(FeedError::MalformedMessage(_))));
        assert!(matches!(
            parse_frame(r#"{"e":"aggTrade","s":"BTCUSDT","p":"abc"}"#),
            Err(FeedError::MalformedMessage(_))
        ));
        assert!(parse_frame("42").is_err());
    }
}
