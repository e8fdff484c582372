// =============================================================================
// Subscription Hub — channel fan-out to downstream WebSocket clients
// =============================================================================
//
// Tracks every downstream connection, which channels it listens to and
// whether it is still alive. Owns:
//
//   - the connection registry (forward + reverse index, one lock)
//   - per-connection bounded outbound queues drained by a writer task
//   - liveness sweeps (ping / missed-pong eviction)
//   - the per-channel threshold reducer published into `OverrideTable`
//
// Broadcasts snapshot the recipients under the lock and enqueue after
// releasing it. A full queue drops the frame for that connection only.
// =============================================================================

pub mod protocol;
pub(crate) mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{OverrideTable, ThresholdOverride};
use crate::error::{FeedError, Result};
use crate::types::{BroadcastEnvelope, ChannelKey};

use self::protocol::{Ack, ClientRequest, Method, Reply, ServerFrame};
use self::registry::Registry;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    /// Terminate the transport.
    Close,
}

fn default_liveness_interval_ms() -> u64 {
    30_000
}

fn default_max_missed_pongs() -> u32 {
    2
}

fn default_outbound_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    /// Consecutive unanswered pings before a connection is evicted.
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            liveness_interval_ms: default_liveness_interval_ms(),
            max_missed_pongs: default_max_missed_pongs(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl HubConfig {
    /// Never zero; a timer needs a positive period.
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.max(1))
    }
}

/// A freshly registered connection.
pub struct Registration {
    pub id: ConnectionId,
    /// Notified when the hub evicts the connection. The socket task must stop
    /// reading and writing once it fires.
    pub terminated: Arc<Notify>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LivenessReport {
    pub pinged: usize,
    pub evicted: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub open_connections: usize,
    pub channels: usize,
    pub subscriptions: usize,
    pub broadcasts: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub evictions: u64,
    /// Longest time any open connection has gone without a pong.
    pub max_pong_age_ms: u64,
}

pub struct SubscriptionHub {
    registry: Mutex<Registry>,
    overrides: Arc<OverrideTable>,
    config: HubConfig,

    broadcasts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    evictions: AtomicU64,
}

impl SubscriptionHub {
    pub fn new(config: HubConfig, overrides: Arc<OverrideTable>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            overrides,
            config,
            broadcasts: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// A bounded outbound queue sized from the hub config.
    pub fn outbound_channel(&self) -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(self.config.outbound_buffer.max(1))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn register(&self, outbound: mpsc::Sender<Outbound>) -> Registration {
        let id = Uuid::new_v4();
        let terminated = self.registry.lock().insert(id, outbound);
        debug!(connection = %id, "connection registered");
        Registration { id, terminated }
    }

    pub fn activate(&self, id: ConnectionId) -> Result<()> {
        self.registry.lock().get_mut(&id)?.state = ConnectionState::Open;
        Ok(())
    }

    pub fn begin_close(&self, id: ConnectionId) -> Result<()> {
        self.registry.lock().get_mut(&id)?.state = ConnectionState::Closing;
        Ok(())
    }

    /// Close and forget a connection. Returns the channels it was subscribed
    /// to; unknown ids yield an empty list.
    pub fn remove(&self, id: ConnectionId) -> Vec<ChannelKey> {
        let mut reg = self.registry.lock();
        let Some((mut conn, drained)) = reg.remove(id) else {
            return Vec::new();
        };
        conn.state = ConnectionState::Closed;
        self.publish_overrides(&reg, &drained);
        drop(reg);

        debug!(connection = %id, channels = drained.len(), "connection removed");
        drained
    }

    /// Terminate the transport and remove the connection.
    pub fn evict(&self, id: ConnectionId) -> Vec<ChannelKey> {
        let handles = self
            .registry
            .lock()
            .get(&id)
            .map(|c| (c.outbound.clone(), c.terminated.clone()));
        let Some((outbound, terminated)) = handles else {
            return Vec::new();
        };
        // The close frame is best effort: a stalled client's queue is full.
        // The signal is what actually ends the socket task.
        let _ = outbound.try_send(Outbound::Close);
        terminated.notify_one();
        self.evictions.fetch_add(1, Ordering::Relaxed);
        info!(connection = %id, "connection evicted");
        self.remove(id)
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.registry.lock().get(&id).map(|c| c.state)
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Subscribe a connection to a channel. Idempotent; a repeat call only
    /// replaces the threshold override. Returns `true` on a new membership.
    pub fn subscribe(
        &self,
        id: ConnectionId,
        channel: &ChannelKey,
        threshold: Option<ThresholdOverride>,
    ) -> Result<bool> {
        let mut reg = self.registry.lock();
        let newly = reg.subscribe(id, channel, threshold)?;
        self.publish_overrides(&reg, std::slice::from_ref(channel));
        Ok(newly)
    }

    pub fn unsubscribe(&self, id: ConnectionId, channel: &ChannelKey) -> Result<bool> {
        let mut reg = self.registry.lock();
        let was_member = reg.unsubscribe(id, channel)?;
        if was_member {
            self.publish_overrides(&reg, std::slice::from_ref(channel));
        }
        Ok(was_member)
    }

    pub fn unsubscribe_all(&self, id: ConnectionId) -> Result<Vec<ChannelKey>> {
        let mut reg = self.registry.lock();
        let drained = reg.unsubscribe_all(id)?;
        self.publish_overrides(&reg, &drained);
        Ok(drained)
    }

    pub fn subscriptions(&self, id: ConnectionId) -> Vec<ChannelKey> {
        self.registry
            .lock()
            .get(&id)
            .map(|c| c.subscriptions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of connections subscribed to exactly this channel.
    pub fn subscriber_count(&self, channel: &ChannelKey) -> usize {
        self.registry
            .lock()
            .members(channel)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn publish_overrides(&self, reg: &Registry, channels: &[ChannelKey]) {
        for channel in channels {
            self.overrides.set(channel, reg.reduce(channel));
        }
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Deliver an update to every open subscriber of `channel` or one of its
    /// ancestors. Returns how many connections it was queued for.
    pub fn broadcast(&self, channel: &ChannelKey, envelope: &BroadcastEnvelope) -> usize {
        let text = match serde_json::to_string(envelope) {
            Ok(t) => t,
            Err(e) => {
                warn!(channel = %channel, error = %e, "failed to encode broadcast");
                return 0;
            }
        };

        let recipients = self.registry.lock().recipients(channel);
        self.broadcasts.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for (id, tx) in recipients {
            match tx.try_send(Outbound::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(connection = %id, channel = %channel, "outbound queue full, frame dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection = %id, "outbound queue closed");
                }
            }
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    pub fn record_pong(&self, id: ConnectionId) {
        let mut reg = self.registry.lock();
        if let Ok(conn) = reg.get_mut(&id) {
            conn.is_alive = true;
            conn.missed_pongs = 0;
            conn.last_pong_at = Instant::now();
        }
    }

    /// One liveness round: count unanswered pings, evict connections over the
    /// budget, ping the rest.
    pub fn sweep_liveness(&self) -> LivenessReport {
        let mut to_ping = Vec::new();
        let mut to_evict = Vec::new();
        {
            let mut reg = self.registry.lock();
            for (id, conn) in reg.connections_mut() {
                if conn.state != ConnectionState::Open {
                    continue;
                }
                if !conn.is_alive {
                    conn.missed_pongs += 1;
                }
                if conn.missed_pongs >= self.config.max_missed_pongs {
                    to_evict.push((*id, conn.last_pong_at.elapsed()));
                } else {
                    conn.is_alive = false;
                    to_ping.push((*id, conn.outbound.clone()));
                }
            }
        }

        let mut report = LivenessReport::default();
        for (id, tx) in to_ping {
            match tx.try_send(Outbound::Ping) {
                Ok(()) => report.pinged += 1,
                Err(e) => debug!(connection = %id, error = %e, "ping not queued"),
            }
        }
        for (id, silent_for) in to_evict {
            warn!(
                connection = %id,
                silent_for_ms = silent_for.as_millis() as u64,
                "no pong within budget, evicting"
            );
            self.evict(id);
            report.evicted.push(id);
        }
        report
    }

    /// Periodic liveness sweeps until the task is dropped.
    pub async fn run_liveness(self: Arc<Self>) {
        let period = self.config.liveness_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let report = self.sweep_liveness();
            if !report.evicted.is_empty() {
                info!(
                    pinged = report.pinged,
                    evicted = report.evicted.len(),
                    "liveness sweep"
                );
            }
        }
    }

    // =========================================================================
    // Request handling
    // =========================================================================

    /// Answer one inbound text frame. Never closes the connection.
    pub fn handle_frame(&self, id: ConnectionId, text: &str) -> Reply {
        let request: ClientRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                debug!(connection = %id, error = %e, "malformed client frame");
                return Reply::Frame(ServerFrame::error(format!("malformed message: {e}")));
            }
        };

        match request.method {
            Method::Ping => {
                self.record_pong(id);
                Reply::Frame(ServerFrame::pong(request.id))
            }
            Method::Subscribe => Reply::Ack(self.handle_subscribe(id, &request)),
            Method::Unsubscribe => Reply::Ack(self.handle_unsubscribe(id, &request)),
        }
    }

    fn handle_subscribe(&self, id: ConnectionId, request: &ClientRequest) -> Ack {
        if request.params.is_empty() {
            return Ack::error(request.id, "no channels given");
        }
        if let Some(threshold) = &request.threshold {
            if let Err(reason) = threshold.validate() {
                return Ack::error(request.id, reason);
            }
        }
        let channels = match parse_channels(&request.params) {
            Ok(c) => c,
            Err(e) => return Ack::error(request.id, e.to_string()),
        };

        let mut added = 0;
        for channel in &channels {
            match self.subscribe(id, channel, request.threshold) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => return Ack::error(request.id, e.to_string()),
            }
        }
        debug!(connection = %id, requested = channels.len(), added, "subscribe");
        Ack::success(
            request.id,
            format!("subscribed to {} channel(s)", channels.len()),
        )
    }

    fn handle_unsubscribe(&self, id: ConnectionId, request: &ClientRequest) -> Ack {
        if request.all {
            return match self.unsubscribe_all(id) {
                Ok(drained) => Ack::success(
                    request.id,
                    format!("unsubscribed from {} channel(s)", drained.len()),
                ),
                Err(e) => Ack::error(request.id, e.to_string()),
            };
        }
        if request.params.is_empty() {
            return Ack::error(request.id, "no channels given");
        }
        let channels = match parse_channels(&request.params) {
            Ok(c) => c,
            Err(e) => return Ack::error(request.id, e.to_string()),
        };

        let mut removed = 0;
        for channel in &channels {
            match self.unsubscribe(id, channel) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => return Ack::error(request.id, e.to_string()),
            }
        }
        Ack::success(
            request.id,
            format!("unsubscribed from {removed} channel(s)"),
        )
    }

    pub fn stats(&self) -> HubStats {
        let reg = self.registry.lock();
        let max_pong_age = reg
            .connections()
            .filter(|(_, c)| c.state == ConnectionState::Open)
            .map(|(_, c)| c.last_pong_at.elapsed())
            .max()
            .unwrap_or_default();
        HubStats {
            connections: reg.connection_count(),
            open_connections: reg
                .connections()
                .filter(|(_, c)| c.state == ConnectionState::Open)
                .count(),
            channels: reg.channel_count(),
            subscriptions: reg.subscription_count(),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            max_pong_age_ms: max_pong_age.as_millis() as u64,
        }
    }
}

/// All-or-nothing channel parsing.
fn parse_channels(params: &[String]) -> Result<Vec<ChannelKey>> {
    params
        .iter()
        .map(|raw| raw.parse::<ChannelKey>())
        .collect::<std::result::Result<Vec<_>, FeedError>>()
}
