// =============================================================================
// Upstream Feed — exchange push streams into the threshold gate and the hub
// =============================================================================
//
// One combined WebSocket per symbol carrying ticker, aggTrade, depth and one
// kline stream per configured interval. Each normalized update is:
//
//   ticker / trade / kline -> ThresholdCache::evaluate -> broadcast if significant
//   depth                  -> broadcast unconditionally
//
// If the cache is unreachable the update is forwarded ungated (fail open).
// Streams reconnect after a fixed delay, forever. Sockets are opened through a
// `Connector`, the same seam the hub client uses.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app_state::ErrorLog;
use crate::cache::{CachedValue, ThresholdCache, Verdict};
use crate::client::{Connector, TungsteniteConnector};
use crate::error::{FeedError, Result};
use crate::feed::normalize::parse_frame;
use crate::hub::SubscriptionHub;
use crate::types::MarketEnvelope;

// =============================================================================
// Pipeline
// =============================================================================

/// What happened to one normalized update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Broadcast to this many connections.
    Broadcast(usize),
    Suppressed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub processed: u64,
    pub broadcast: u64,
    pub suppressed: u64,
    pub ungated: u64,
}

/// Threshold gate + hub fan-out for normalized updates.
pub struct FeedPipeline {
    cache: Arc<ThresholdCache>,
    hub: Arc<SubscriptionHub>,
    processed: AtomicU64,
    broadcast: AtomicU64,
    suppressed: AtomicU64,
    ungated: AtomicU64,
}

impl FeedPipeline {
    pub fn new(cache: Arc<ThresholdCache>, hub: Arc<SubscriptionHub>) -> Self {
        Self {
            cache,
            hub,
            processed: AtomicU64::new(0),
            broadcast: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            ungated: AtomicU64::new(0),
        }
    }

    pub async fn process(&self, envelope: &MarketEnvelope) -> Result<Delivery> {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let channel = envelope.channel()?;
        let outbound = envelope.to_broadcast()?;

        if let (true, Some(primary)) = (envelope.kind().is_gated(), envelope.payload.primary()) {
            let value = CachedValue {
                primary,
                data: outbound.data.clone(),
            };
            match self.cache.evaluate(&channel, value).await {
                Ok(Verdict::Suppressed) => {
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    return Ok(Delivery::Suppressed);
                }
                Ok(Verdict::Significant) => {}
                Err(e) => {
                    warn!(channel = %channel, error = %FeedError::from(e), "threshold gate unavailable, forwarding ungated");
                    self.cache.record_fail_open();
                    self.ungated.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let recipients = self.hub.broadcast(&channel, &outbound);
        self.broadcast.fetch_add(1, Ordering::Relaxed);
        Ok(Delivery::Broadcast(recipients))
    }

    /// Normalize and process one raw upstream frame. Returns how many updates
    /// it carried.
    pub async fn process_frame(&self, text: &str) -> Result<usize> {
        let envelopes = parse_frame(text)?;
        for envelope in &envelopes {
            if let Err(e) = self.process(envelope).await {
                warn!(symbol = %envelope.symbol, error = %e, "dropping update");
            }
        }
        Ok(envelopes.len())
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            processed: self.processed.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            ungated: self.ungated.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Exchange streams
// =============================================================================

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Combined stream base, e.g. `wss://fstream.binance.com/stream`.
    pub ws_base: String,
    pub symbols: Vec<String>,
    pub kline_intervals: Vec<String>,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStats {
    pub frames: u64,
    pub malformed: u64,
    pub reconnects: u64,
    pub connected_streams: u64,
}

pub struct UpstreamFeed {
    config: UpstreamConfig,
    connector: Arc<dyn Connector>,
    pipeline: Arc<FeedPipeline>,
    errors: Arc<ErrorLog>,
    frames: AtomicU64,
    malformed: AtomicU64,
    reconnects: AtomicU64,
    connected: AtomicU64,
}

impl UpstreamFeed {
    pub fn new(config: UpstreamConfig, pipeline: Arc<FeedPipeline>, errors: Arc<ErrorLog>) -> Self {
        Self {
            config,
            connector: Arc::new(TungsteniteConnector),
            pipeline,
            errors,
            frames: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connected: AtomicU64::new(0),
        }
    }

    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Combined-stream URL for one symbol.
    pub fn stream_url(&self, symbol: &str) -> String {
        let lower = symbol.to_lowercase();
        let mut streams = vec![
            format!("{lower}@ticker"),
            format!("{lower}@aggTrade"),
            format!("{lower}@depth@100ms"),
        ];
        for interval in &self.config.kline_intervals {
            streams.push(format!("{lower}@kline_{interval}"));
        }
        format!(
            "{}?streams={}",
            self.config.ws_base.trim_end_matches('/'),
            streams.join("/")
        )
    }

    /// Spawn one reconnecting stream task per configured symbol.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.config
            .symbols
            .iter()
            .cloned()
            .map(|symbol| {
                let feed = self.clone();
                tokio::spawn(async move { feed.run_forever(&symbol).await })
            })
            .collect()
    }

    async fn run_forever(&self, symbol: &str) {
        let delay = self.config.reconnect_delay;
        loop {
            let reason = match self.run_stream(symbol).await {
                Ok(()) => "stream ended".to_string(),
                Err(e) => format!("{e:#}"),
            };
            let err = FeedError::UpstreamDisconnected {
                stream: symbol.to_string(),
                reason,
            };
            error!(symbol = %symbol, error = %err, delay_ms = delay.as_millis() as u64, "upstream stream down, reconnecting");
            self.errors.push_error_with_code(err.to_string(), Some("UPSTREAM_DISCONNECTED".into()));
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        }
    }

    /// Run a single connection until it closes or errors.
    async fn run_stream(&self, symbol: &str) -> anyhow::Result<()> {
        let url = self.stream_url(symbol);
        info!(url = %url, symbol = %symbol, "connecting to upstream stream");

        let mut transport = self
            .connector
            .connect(&url)
            .await
            .with_context(|| format!("failed to connect upstream stream for {symbol}"))?;

        info!(symbol = %symbol, "upstream stream connected");
        self.connected.fetch_add(1, Ordering::Relaxed);
        // The outbound half stays alive while we read; dropping it closes the socket.
        while let Some(text) = transport.inbound.recv().await {
            self.frames.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.pipeline.process_frame(&text).await {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %symbol, error = %e, "failed to process upstream frame");
            }
        }
        self.connected.fetch_sub(1, Ordering::Relaxed);
        debug!(symbol = %symbol, "upstream transport ended");
        Ok(())
    }

    pub fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            frames: self.frames.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected_streams: self.connected.load(Ordering::Relaxed),
        }
    }
}
