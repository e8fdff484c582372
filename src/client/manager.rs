// =============================================================================
// Client Connection Manager — resilient hub subscriber
// =============================================================================
//
// A single actor task owns the transport, the local subscription table and
// the pending-message queue. The public `ConnectionHandle` talks to it over a
// command channel, so every state transition happens on one task:
//
//   Closed ──connect──▶ Connecting ──ok──▶ Open
//      ▲                    │                │ transport lost
//      │                    ▼ fail           ▼
//      └──budget spent── Reconnecting{attempt} ──backoff──▶ (retry)
//
// On every transition into Open the queued messages are flushed first, then
// the locally tracked channels are replayed: one SUBSCRIBE per distinct
// threshold override, so per-channel overrides survive the reconnect.
// =============================================================================

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::ThresholdOverride;
use crate::client::connector::{Connector, Transport};
use crate::error::{FeedError, Result};
use crate::hub::protocol::{Ack, ClientRequest, ServerFrame, ServerMessage};
use crate::hub::ConnectionId;
use crate::types::{BroadcastEnvelope, ChannelKey};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `step * attempt`, never more than `max`.
    CappedLinear { step: Duration, max: Duration },
}

impl Backoff {
    /// Delay before the given (1-based) reconnect attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::CappedLinear { step, max } => step.saturating_mul(attempt.max(1)).min(max),
        }
    }
}

/// Floor for the heartbeat period; a zero interval cannot drive a timer.
const MIN_HEARTBEAT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    /// Consecutive failed attempts tolerated since the last successful open.
    pub reconnect_attempts: u32,
    pub backoff: Backoff,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pending_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            reconnect_attempts: 5,
            backoff: Backoff::Fixed(Duration::from_secs(2)),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            pending_capacity: 1024,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Clamped to at least 1 ms.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT);
        self
    }

    pub fn with_pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }
}

// =============================================================================
// Public types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Closed,
    Connecting,
    Open,
    /// Waiting for (or running) the given 1-based attempt since the last open.
    Reconnecting { attempt: u32 },
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(ConnectionStatus),
    Welcome(ConnectionId),
    Ack(Ack),
    ServerError(String),
    ReconnectExhausted { attempts: u32 },
}

pub type SubscriptionId = u64;

pub type Handler = Arc<dyn Fn(&BroadcastEnvelope) + Send + Sync>;

/// Desired state for one channel: the override sent with its SUBSCRIBE and
/// the local handlers it fans out to.
#[derive(Default)]
struct LocalChannel {
    threshold: Option<ThresholdOverride>,
    handlers: Vec<(SubscriptionId, Handler)>,
}

enum Command {
    Connect {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Send(String),
    Subscribe {
        channel: ChannelKey,
        threshold: Option<ThresholdOverride>,
        handler: Handler,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        channel: ChannelKey,
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running connection manager.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<ClientEvent>,
    exhausted: Arc<Mutex<Option<u32>>>,
}

impl ConnectionHandle {
    fn command(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| FeedError::Transport("connection manager stopped".into()))
    }

    /// Start connecting if closed. Resolves once the first attempt has
    /// finished, with the resulting status.
    pub async fn connect(&self) -> Result<ConnectionStatus> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { reply })?;
        rx.await
            .map_err(|_| FeedError::Transport("connection manager stopped".into()))
    }

    /// Transmit now when open, otherwise queue (and connect if closed).
    pub fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.command(Command::Send(text))
    }

    pub async fn subscribe<F>(&self, channel: ChannelKey, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&BroadcastEnvelope) + Send + Sync + 'static,
    {
        self.subscribe_inner(channel, None, Arc::new(handler)).await
    }

    /// Like `subscribe`, but asks the hub to gate this channel with its own
    /// significance thresholds. The override replaces any earlier one for the
    /// channel and is re-sent on every reconnect.
    pub async fn subscribe_with_threshold<F>(
        &self,
        channel: ChannelKey,
        threshold: ThresholdOverride,
        handler: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(&BroadcastEnvelope) + Send + Sync + 'static,
    {
        threshold.validate().map_err(FeedError::InvalidThreshold)?;
        self.subscribe_inner(channel, Some(threshold), Arc::new(handler))
            .await
    }

    async fn subscribe_inner(
        &self,
        channel: ChannelKey,
        threshold: Option<ThresholdOverride>,
        handler: Handler,
    ) -> Result<SubscriptionId> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscribe {
            channel,
            threshold,
            handler,
            reply,
        })?;
        rx.await
            .map_err(|_| FeedError::Transport("connection manager stopped".into()))
    }

    /// Returns whether the subscription existed.
    pub async fn unsubscribe(&self, channel: &ChannelKey, id: SubscriptionId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Unsubscribe {
            channel: channel.clone(),
            id,
            reply,
        })?;
        rx.await
            .map_err(|_| FeedError::Transport("connection manager stopped".into()))
    }

    /// Voluntary disconnect; no reconnect follows.
    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Close { reply })?;
        rx.await
            .map_err(|_| FeedError::Transport("connection manager stopped".into()))
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Wait until the manager reports `status`.
    pub async fn wait_for(&self, status: ConnectionStatus) -> Result<()> {
        let mut rx = self.status.clone();
        rx.wait_for(|s| *s == status)
            .await
            .map(|_| ())
            .map_err(|_| FeedError::Transport("connection manager stopped".into()))
    }

    /// Wait for the next `Closed`. Fails when the reconnect budget ran out.
    pub async fn wait_closed(&self) -> Result<()> {
        self.wait_for(ConnectionStatus::Closed).await?;
        match *self.exhausted.lock() {
            Some(attempts) => Err(FeedError::ReconnectExhausted { attempts }),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

pub struct ConnectionManager<C: Connector> {
    config: ClientConfig,
    connector: Arc<C>,
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ClientEvent>,
    exhausted: Arc<Mutex<Option<u32>>>,

    transport: Option<Transport>,
    subscriptions: BTreeMap<String, LocalChannel>,
    pending: VecDeque<String>,
    failed_attempts: u32,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    next_subscription_id: SubscriptionId,
    next_request_id: u64,
}

impl<C: Connector> ConnectionManager<C> {
    /// Start the actor. It runs until every handle is dropped.
    pub fn spawn(config: ClientConfig, connector: C) -> (ConnectionHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Closed);
        let (events, _) = broadcast::channel(256);
        let exhausted = Arc::new(Mutex::new(None));

        let actor = ConnectionManager {
            config,
            connector: Arc::new(connector),
            commands: cmd_rx,
            status_tx,
            events: events.clone(),
            exhausted: exhausted.clone(),
            transport: None,
            subscriptions: BTreeMap::new(),
            pending: VecDeque::new(),
            failed_attempts: 0,
            reconnect_at: None,
            heartbeat: None,
            next_subscription_id: 1,
            next_request_id: 1,
        };
        let task = tokio::spawn(actor.run());

        let handle = ConnectionHandle {
            commands: cmd_tx,
            status: status_rx,
            events,
            exhausted,
        };
        (handle, task)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                inbound = next_inbound(&mut self.transport) => match inbound {
                    Some(text) => self.on_inbound(&text),
                    None => self.on_transport_lost(),
                },
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.attempt_connect().await;
                }
                _ = next_tick(&mut self.heartbeat) => self.send_heartbeat(),
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        if self.status() != status {
            debug!(?status, "client state");
            self.status_tx.send_replace(status);
            let _ = self.events.send(ClientEvent::StateChanged(status));
        }
    }

    // ── Commands ────────────────────────────────────────────────────────────

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                if self.status() == ConnectionStatus::Closed {
                    self.begin_connect().await;
                }
                let _ = reply.send(self.status());
            }
            Command::Send(text) => {
                if self.status() == ConnectionStatus::Open {
                    self.transmit(text);
                } else {
                    self.enqueue(text);
                    if self.status() == ConnectionStatus::Closed {
                        self.begin_connect().await;
                    }
                }
            }
            Command::Subscribe {
                channel,
                threshold,
                handler,
                reply,
            } => {
                let id = self.next_subscription_id;
                self.next_subscription_id += 1;
                let key = channel.to_string();
                let local = self.subscriptions.entry(key.clone()).or_default();
                let first = local.handlers.is_empty();
                // A plain subscribe keeps whatever override the channel has.
                let changed = threshold.is_some() && threshold != local.threshold;
                if changed {
                    local.threshold = threshold;
                }
                let threshold = local.threshold;
                local.handlers.push((id, handler));
                if (first || changed) && self.status() == ConnectionStatus::Open {
                    let rid = self.request_id();
                    self.transmit_request(&subscribe_request(vec![key], threshold, rid));
                }
                let _ = reply.send(id);
            }
            Command::Unsubscribe { channel, id, reply } => {
                let key = channel.to_string();
                let mut existed = false;
                let mut now_empty = false;
                if let Some(local) = self.subscriptions.get_mut(&key) {
                    let before = local.handlers.len();
                    local.handlers.retain(|(sid, _)| *sid != id);
                    existed = local.handlers.len() != before;
                    now_empty = local.handlers.is_empty();
                }
                if now_empty {
                    self.subscriptions.remove(&key);
                    if existed && self.status() == ConnectionStatus::Open {
                        let rid = self.request_id();
                        self.transmit_request(&ClientRequest::unsubscribe(vec![key], rid));
                    }
                }
                let _ = reply.send(existed);
            }
            Command::Close { reply } => {
                info!(url = %self.config.url, "closing hub connection");
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn shutdown(&mut self) {
        self.transport = None;
        self.heartbeat = None;
        self.reconnect_at = None;
        self.failed_attempts = 0;
        self.set_status(ConnectionStatus::Closed);
    }

    // ── Connection lifecycle ────────────────────────────────────────────────

    async fn begin_connect(&mut self) {
        *self.exhausted.lock() = None;
        self.failed_attempts = 0;
        self.set_status(ConnectionStatus::Connecting);
        self.attempt_connect().await;
    }

    async fn attempt_connect(&mut self) {
        let outcome = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.config.url),
        )
        .await;

        let err = match outcome {
            Ok(Ok(transport)) => {
                self.on_open(transport);
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => FeedError::Transport("connect timed out".into()),
        };

        self.failed_attempts += 1;
        warn!(
            url = %self.config.url,
            attempt = self.failed_attempts,
            budget = self.config.reconnect_attempts,
            error = %err,
            "hub connect failed"
        );

        if self.failed_attempts >= self.config.reconnect_attempts {
            let attempts = self.failed_attempts;
            *self.exhausted.lock() = Some(attempts);
            let _ = self.events.send(ClientEvent::ReconnectExhausted { attempts });
            warn!(attempts, "reconnect budget exhausted, giving up");
            self.reconnect_at = None;
            self.failed_attempts = 0;
            self.set_status(ConnectionStatus::Closed);
        } else {
            self.schedule_reconnect(self.failed_attempts + 1);
        }
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        let delay = self.config.backoff.delay(attempt);
        self.reconnect_at = Some(Instant::now() + delay);
        self.set_status(ConnectionStatus::Reconnecting { attempt });
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }

    fn on_open(&mut self, transport: Transport) {
        self.transport = Some(transport);
        self.failed_attempts = 0;
        self.reconnect_at = None;
        self.set_status(ConnectionStatus::Open);
        info!(url = %self.config.url, "hub connection open");

        while let Some(text) = self.pending.pop_front() {
            self.transmit(text);
        }

        for (threshold, params) in self.replay_groups() {
            let id = self.request_id();
            self.transmit_request(&subscribe_request(params, threshold, id));
        }

        let period = self.config.heartbeat_interval.max(MIN_HEARTBEAT);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
    }

    /// Tracked channels grouped by override, plain channels first.
    fn replay_groups(&self) -> Vec<(Option<ThresholdOverride>, Vec<String>)> {
        let mut groups: Vec<(Option<ThresholdOverride>, Vec<String>)> = Vec::new();
        for (key, local) in &self.subscriptions {
            match groups.iter_mut().find(|(t, _)| *t == local.threshold) {
                Some((_, params)) => params.push(key.clone()),
                None => groups.push((local.threshold, vec![key.clone()])),
            }
        }
        groups.sort_by_key(|(t, _)| t.is_some());
        groups
    }

    fn on_transport_lost(&mut self) {
        self.transport = None;
        self.heartbeat = None;
        if self.status() == ConnectionStatus::Open {
            warn!(url = %self.config.url, "hub connection lost");
            self.failed_attempts = 0;
            self.schedule_reconnect(1);
        }
    }

    // ── Outbound ────────────────────────────────────────────────────────────

    fn request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn transmit_request(&mut self, request: &ClientRequest) {
        match serde_json::to_string(request) {
            Ok(text) => self.transmit(text),
            Err(e) => warn!(error = %e, "failed to encode request"),
        }
    }

    fn transmit(&mut self, text: String) {
        let failed = match &self.transport {
            Some(t) => t.outbound.send(text).err().map(|e| e.0),
            None => Some(text),
        };
        if let Some(text) = failed {
            self.enqueue(text);
        }
    }

    fn enqueue(&mut self, text: String) {
        if self.config.pending_capacity == 0 {
            return;
        }
        if self.pending.len() >= self.config.pending_capacity {
            self.pending.pop_front();
            debug!("pending queue full, dropped oldest message");
        }
        self.pending.push_back(text);
    }

    fn send_heartbeat(&mut self) {
        if self.status() == ConnectionStatus::Open {
            let id = self.request_id();
            self.transmit_request(&ClientRequest::ping(id));
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    fn on_inbound(&mut self, text: &str) {
        match ServerMessage::parse(text) {
            Ok(ServerMessage::Update(envelope)) => self.dispatch(&envelope),
            Ok(ServerMessage::Ack(ack)) => {
                if !ack.is_success() {
                    warn!(id = ?ack.id, message = %ack.message, "hub rejected request");
                }
                let _ = self.events.send(ClientEvent::Ack(ack));
            }
            Ok(ServerMessage::Control(ServerFrame::Welcome { connection_id, .. })) => {
                debug!(connection = %connection_id, "hub welcome");
                let _ = self.events.send(ClientEvent::Welcome(connection_id));
            }
            Ok(ServerMessage::Control(ServerFrame::Error { message, .. })) => {
                warn!(message = %message, "hub error");
                let _ = self.events.send(ClientEvent::ServerError(message));
            }
            Ok(ServerMessage::Control(ServerFrame::Pong { .. })) => {}
            Err(e) => warn!(error = %e, "unparseable hub frame"),
        }
    }

    /// Call each handler registered on the envelope's channel or an ancestor,
    /// at most once.
    fn dispatch(&self, envelope: &BroadcastEnvelope) {
        let channel = match envelope.channel() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "broadcast on invalid channel");
                return;
            }
        };

        let mut called: HashSet<*const ()> = HashSet::new();
        let ancestors = channel.ancestors();
        for key in std::iter::once(&channel).chain(ancestors.iter()) {
            let Some(local) = self.subscriptions.get(&key.to_string()) else {
                continue;
            };
            for (_, handler) in &local.handlers {
                if called.insert(Arc::as_ptr(handler) as *const ()) {
                    handler(envelope);
                }
            }
        }
    }
}

fn subscribe_request(
    params: Vec<String>,
    threshold: Option<ThresholdOverride>,
    id: u64,
) -> ClientRequest {
    let request = ClientRequest::subscribe(params, id);
    match threshold {
        Some(t) => request.with_threshold(t),
        None => request,
    }
}

async fn next_inbound(transport: &mut Option<Transport>) -> Option<String> {
    match transport {
        Some(t) => t.inbound.recv().await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Server side of a mock transport.
    struct Peer {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        async fn next_request(&mut self) -> ClientRequest {
            let text = self.from_client.recv().await.expect("client frame");
            serde_json::from_str(&text).expect("client request")
        }
    }

    struct MockConnector {
        failures_left: AtomicU32,
        attempts: Arc<AtomicU32>,
        peers: mpsc::UnboundedSender<Peer>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _url: &str) -> Result<Transport> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(FeedError::Transport("connection refused".into()));
            }
            let (client, server) = Transport::pair();
            let _ = self.peers.send(Peer {
                to_client: server.outbound,
                from_client: server.inbound,
            });
            Ok(client)
        }
    }

    fn mock(failures: u32) -> (MockConnector, Arc<AtomicU32>, mpsc::UnboundedReceiver<Peer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicU32::new(0));
        (
            MockConnector {
                failures_left: AtomicU32::new(failures),
                attempts: attempts.clone(),
                peers: tx,
            },
            attempts,
            rx,
        )
    }

    fn config() -> ClientConfig {
        ClientConfig::new("ws://hub.test/ws")
            .with_reconnect_attempts(3)
            .with_backoff(Backoff::Fixed(Duration::from_secs(1)))
            .with_heartbeat_interval(Duration::from_secs(3600))
    }

    fn ticker_update(symbol: &str, price: f64) -> String {
        serde_json::json!({
            "type": "ticker_update",
            "symbol": symbol,
            "data": { "price": price },
            "timestamp": 1,
        })
        .to_string()
    }

    fn channel(raw: &str) -> ChannelKey {
        raw.parse().unwrap()
    }

    #[test]
    fn backoff_policies() {
        let fixed = Backoff::Fixed(Duration::from_secs(2));
        assert_eq!(fixed.delay(1), Duration::from_secs(2));
        assert_eq!(fixed.delay(9), Duration::from_secs(2));

        let linear = Backoff::CappedLinear {
            step: Duration::from_millis(500),
            max: Duration::from_secs(2),
        };
        assert_eq!(linear.delay(1), Duration::from_millis(500));
        assert_eq!(linear.delay(3), Duration::from_millis(1500));
        assert_eq!(linear.delay(10), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_subscriptions_without_duplicate_delivery() {
        let (connector, attempts, mut peers) = mock(0);
        let (handle, _task) = ConnectionManager::spawn(config(), connector);

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<f64>();
        handle
            .subscribe(channel("ticker:BTCUSDT"), move |env| {
                let _ = seen_tx.send(env.data["price"].as_f64().unwrap_or_default());
            })
            .await
            .unwrap();

        handle.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        handle.wait_for(ConnectionStatus::Open).await.unwrap();
        let replay = peer.next_request().await;
        assert_eq!(replay.params, vec!["ticker:BTCUSDT".to_string()]);

        peer.to_client.send(ticker_update("BTCUSDT", 1.0)).unwrap();
        assert_eq!(seen_rx.recv().await, Some(1.0));

        // Server drops the connection.
        drop(peer);
        let mut peer = peers.recv().await.unwrap();
        handle.wait_for(ConnectionStatus::Open).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let replay = peer.next_request().await;
        assert_eq!(replay.params, vec!["ticker:BTCUSDT".to_string()]);
        tokio::task::yield_now().await;
        assert!(peer.from_client.try_recv().is_err(), "exactly one replay");

        peer.to_client.send(ticker_update("BTCUSDT", 2.0)).unwrap();
        assert_eq!(seen_rx.recv().await, Some(2.0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen_rx.try_recv().is_err(), "handler called once per message");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_budget() {
        let (connector, attempts, _peers) = mock(u32::MAX);
        let (handle, _task) = ConnectionManager::spawn(config(), connector);
        let mut events = handle.events();

        handle.connect().await.unwrap();
        let err = handle.wait_closed().await.unwrap_err();
        assert!(matches!(err, FeedError::ReconnectExhausted { attempts: 3 }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(handle.status(), ConnectionStatus::Closed);

        let mut exhausted = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, ClientEvent::ReconnectExhausted { attempts: 3 }) {
                exhausted = true;
            }
        }
        assert!(exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_budget() {
        let (connector, attempts, mut peers) = mock(2);
        let (handle, _task) = ConnectionManager::spawn(config(), connector);

        handle.connect().await.unwrap();
        let _peer = peers.recv().await.unwrap();
        handle.wait_for(ConnectionStatus::Open).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_messages_flush_before_replay() {
        let (connector, _attempts, mut peers) = mock(0);
        let (handle, _task) = ConnectionManager::spawn(config(), connector);

        handle.subscribe(channel("depth:ETHUSDT"), |_| {}).await.unwrap();
        // Sending while closed queues the message and starts connecting.
        handle.send(&ClientRequest::ping(99)).unwrap();

        let mut peer = peers.recv().await.unwrap();
        let first = peer.next_request().await;
        assert_eq!(first.id, Some(99));
        let second = peer.next_request().await;
        assert_eq!(second.params, vec!["depth:ETHUSDT".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn network_subscribe_only_on_first_local_handler() {
        let (connector, _attempts, mut peers) = mock(0);
        let (handle, _task) = ConnectionManager::spawn(config(), connector);
        handle.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        handle.wait_for(ConnectionStatus::Open).await.unwrap();

        let ch = channel("trade:BTCUSDT");
        let a = handle.subscribe(ch.clone(), |_| {}).await.unwrap();
        let b = handle.subscribe(ch.clone(), |_| {}).await.unwrap();
        let sub = peer.next_request().await;
        assert_eq!(sub.params, vec!["trade:BTCUSDT".to_string()]);
        assert!(peer.from_client.try_recv().is_err());

        assert!(handle.unsubscribe(&ch, a).await.unwrap());
        assert!(peer.from_client.try_recv().is_err());
        assert!(handle.unsubscribe(&ch, b).await.unwrap());
        let unsub = peer.next_request().await;
        assert_eq!(unsub.method, crate::hub::protocol::Method::Unsubscribe);
        assert!(!handle.unsubscribe(&ch, b).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ancestor_handlers_receive_specific_updates() {
        let (connector, _attempts, mut peers) = mock(0);
        let (handle, _task) = ConnectionManager::spawn(config(), connector);

        let (tx, mut rx) = mpsc::unbounded_channel::<UpdateType>();
        let firehose_tx = tx.clone();
        handle
            .subscribe(channel("ticker"), move |env| {
                let _ = firehose_tx.send(env.kind);
            })
            .await
            .unwrap();
        handle
            .subscribe(channel("ticker:SOLUSDT"), move |env| {
                let _ = tx.send(env.kind);
            })
            .await
            .unwrap();

        handle.connect().await.unwrap();
        let peer = peers.recv().await.unwrap();
        handle.wait_for(ConnectionStatus::Open).await.unwrap();
        peer.to_client.send(ticker_update("SOLUSDT", 150.0)).unwrap();

        assert_eq!(rx.recv().await, Some(UpdateType::TickerUpdate));
        assert_eq!(rx.recv().await, Some(UpdateType::TickerUpdate));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_sends_ping_while_open() {
        let (connector, _attempts, mut peers) = mock(0);
        let cfg = config().with_heartbeat_interval(Duration::from_secs(5));
        let (handle, _task) = ConnectionManager::spawn(cfg, connector);
        handle.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let ping = peer.next_request().await;
        assert_eq!(ping.method, crate::hub::protocol::Method::Ping);
        assert_eq!(handle.status(), ConnectionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_override_survives_reconnect() {
        let (connector, _attempts, mut peers) = mock(0);
        let (handle, _task) = ConnectionManager::spawn(config(), connector);
        handle.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        handle.wait_for(ConnectionStatus::Open).await.unwrap();

        let tight = ThresholdOverride {
            percentage: Some(0.01),
            absolute: None,
        };
        handle
            .subscribe_with_threshold(channel("ticker:BTCUSDT"), tight, |_| {})
            .await
            .unwrap();
        handle.subscribe(channel("depth:BTCUSDT"), |_| {}).await.unwrap();
        let sub = peer.next_request().await;
        assert_eq!(sub.params, vec!["ticker:BTCUSDT".to_string()]);
        assert_eq!(sub.threshold, Some(tight));
        let plain = peer.next_request().await;
        assert_eq!(plain.threshold, None);

        // A second plain handler does not clear the override.
        handle.subscribe(channel("ticker:BTCUSDT"), |_| {}).await.unwrap();

        drop(peer);
        let mut peer = peers.recv().await.unwrap();
        handle.wait_for(ConnectionStatus::Open).await.unwrap();

        let first = peer.next_request().await;
        assert_eq!(first.params, vec!["depth:BTCUSDT".to_string()]);
        assert_eq!(first.threshold, None);
        let second = peer.next_request().await;
        assert_eq!(second.params, vec!["ticker:BTCUSDT".to_string()]);
        assert_eq!(second.threshold, Some(tight));
        tokio::task::yield_now().await;
        assert!(peer.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn changed_override_is_resent() {
        let (connector, _attempts, mut peers) = mock(0);
        let (handle, _task) = ConnectionManager::spawn(config(), connector);
        handle.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        handle.wait_for(ConnectionStatus::Open).await.unwrap();

        let ch = channel("trade:ETHUSDT");
        let loose = ThresholdOverride {
            percentage: Some(1.0),
            absolute: None,
        };
        let tight = ThresholdOverride {
            percentage: Some(0.1),
            absolute: Some(0.5),
        };
        handle.subscribe_with_threshold(ch.clone(), loose, |_| {}).await.unwrap();
        handle.subscribe_with_threshold(ch.clone(), loose, |_| {}).await.unwrap();
        handle.subscribe_with_threshold(ch, tight, |_| {}).await.unwrap();

        assert_eq!(peer.next_request().await.threshold, Some(loose));
        assert_eq!(peer.next_request().await.threshold, Some(tight));
        tokio::task::yield_now().await;
        assert!(peer.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_override_is_refused_locally() {
        let (connector, attempts, _peers) = mock(0);
        let (handle, _task) = ConnectionManager::spawn(config(), connector);
        let bad = ThresholdOverride {
            percentage: Some(-0.5),
            absolute: None,
        };
        let err = handle
            .subscribe_with_threshold(channel("ticker:BTCUSDT"), bad, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::InvalidThreshold(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_heartbeat_interval_keeps_actor_alive() {
        let (connector, _attempts, mut peers) = mock(0);
        let mut cfg = config();
        // Set directly, bypassing the builder clamp.
        cfg.heartbeat_interval = Duration::ZERO;
        let (handle, task) = ConnectionManager::spawn(cfg, connector);
        assert_eq!(handle.connect().await.unwrap(), ConnectionStatus::Open);
        let mut peer = peers.recv().await.unwrap();

        let ping = peer.next_request().await;
        assert_eq!(ping.method, crate::hub::protocol::Method::Ping);
        assert!(!task.is_finished());

        handle.subscribe(channel("ticker:BTCUSDT"), |_| {}).await.unwrap();
        let mut saw_subscribe = false;
        for _ in 0..64 {
            if peer.next_request().await.method == crate::hub::protocol::Method::Subscribe {
                saw_subscribe = true;
                break;
            }
        }
        assert!(saw_subscribe);
        assert_eq!(
            ClientConfig::default()
                .with_heartbeat_interval(Duration::ZERO)
                .heartbeat_interval,
            Duration::from_millis(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_does_not_reconnect() {
        let (connector, attempts, mut peers) = mock(0);
        let (handle, _task) = ConnectionManager::spawn(config(), connector);
        handle.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        handle.wait_for(ConnectionStatus::Open).await.unwrap();

        handle.close().await.unwrap();
        assert_eq!(peer.from_client.recv().await, None);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(handle.wait_closed().await.is_ok());
    }
}
