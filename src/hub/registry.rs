// =============================================================================
// Connection registry
// =============================================================================
//
// Two views of the same membership relation:
//
//   connections : id      -> Connection { subscriptions, state, liveness, tx }
//   channels    : channel -> { id, ... }
//
// Every mutation goes through methods on `Registry` that update both sides,
// and the whole struct sits behind a single lock in `SubscriptionHub`.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::cache::{ChannelThreshold, ThresholdOverride};
use crate::error::FeedError;
use crate::hub::{ConnectionId, ConnectionState, Outbound};
use crate::types::ChannelKey;

pub(crate) struct Connection {
    pub state: ConnectionState,
    pub subscriptions: HashMap<ChannelKey, Option<ThresholdOverride>>,
    pub last_pong_at: Instant,
    pub is_alive: bool,
    pub missed_pongs: u32,
    pub outbound: mpsc::Sender<Outbound>,
    /// Fired once on eviction; the socket task selects on it.
    pub terminated: Arc<Notify>,
}

impl Connection {
    fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            state: ConnectionState::Connecting,
            subscriptions: HashMap::new(),
            last_pong_at: Instant::now(),
            is_alive: true,
            missed_pongs: 0,
            outbound,
            terminated: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    channels: HashMap<ChannelKey, HashSet<ConnectionId>>,
}

impl Registry {
    pub fn insert(&mut self, id: ConnectionId, outbound: mpsc::Sender<Outbound>) -> Arc<Notify> {
        let conn = Connection::new(outbound);
        let terminated = conn.terminated.clone();
        self.connections.insert(id, conn);
        terminated
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Result<&mut Connection, FeedError> {
        self.connections
            .get_mut(id)
            .ok_or(FeedError::ConnectionNotFound(*id))
    }

    pub fn connections(&self) -> impl Iterator<Item = (&ConnectionId, &Connection)> {
        self.connections.iter()
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = (&ConnectionId, &mut Connection)> {
        self.connections.iter_mut()
    }

    /// Add (or update the override of) a subscription. Returns `true` when the
    /// connection was not yet a member of the channel.
    pub fn subscribe(
        &mut self,
        id: ConnectionId,
        channel: &ChannelKey,
        threshold: Option<ThresholdOverride>,
    ) -> Result<bool, FeedError> {
        let conn = self.get_mut(&id)?;
        let newly = conn
            .subscriptions
            .insert(channel.clone(), threshold)
            .is_none();
        self.channels.entry(channel.clone()).or_default().insert(id);
        Ok(newly)
    }

    /// Returns `true` when the connection was a member of the channel.
    pub fn unsubscribe(&mut self, id: ConnectionId, channel: &ChannelKey) -> Result<bool, FeedError> {
        let conn = self.get_mut(&id)?;
        let was_member = conn.subscriptions.remove(channel).is_some();
        self.detach(id, channel);
        Ok(was_member)
    }

    /// Drop every subscription of a connection, returning the drained channels.
    pub fn unsubscribe_all(&mut self, id: ConnectionId) -> Result<Vec<ChannelKey>, FeedError> {
        let conn = self.get_mut(&id)?;
        let drained: Vec<ChannelKey> = conn.subscriptions.drain().map(|(k, _)| k).collect();
        for channel in &drained {
            self.detach(id, channel);
        }
        Ok(drained)
    }

    /// Remove a connection entirely, returning it with its drained channels.
    pub fn remove(&mut self, id: ConnectionId) -> Option<(Connection, Vec<ChannelKey>)> {
        let mut conn = self.connections.remove(&id)?;
        let drained: Vec<ChannelKey> = conn.subscriptions.drain().map(|(k, _)| k).collect();
        for channel in &drained {
            self.detach(id, channel);
        }
        Some((conn, drained))
    }

    fn detach(&mut self, id: ConnectionId, channel: &ChannelKey) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(&id);
            if members.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    /// Members of a channel (exact match only).
    pub fn members(&self, channel: &ChannelKey) -> Option<&HashSet<ConnectionId>> {
        self.channels.get(channel)
    }

    /// Outbound queues of every `Open` connection subscribed to the channel or
    /// one of its ancestors, each connection at most once.
    pub fn recipients(&self, channel: &ChannelKey) -> Vec<(ConnectionId, mpsc::Sender<Outbound>)> {
        let mut seen: HashSet<ConnectionId> = HashSet::new();
        let mut out = Vec::new();
        let ancestors = channel.ancestors();
        for key in std::iter::once(channel).chain(ancestors.iter()) {
            let Some(members) = self.channels.get(key) else {
                continue;
            };
            for id in members {
                if !seen.insert(*id) {
                    continue;
                }
                if let Some(conn) = self.connections.get(id) {
                    if conn.state == ConnectionState::Open {
                        out.push((*id, conn.outbound.clone()));
                    }
                }
            }
        }
        out
    }

    /// Most sensitive thresholds requested by the channel's current members.
    pub fn reduce(&self, channel: &ChannelKey) -> Option<ChannelThreshold> {
        let members = self.channels.get(channel)?;
        ChannelThreshold::reduce(members.iter().map(|id| {
            self.connections
                .get(id)
                .and_then(|c| c.subscriptions.get(channel))
                .and_then(|o| o.as_ref())
        }))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.channels.values().map(|m| m.len()).sum()
    }

    /// Both indexes describe the same relation.
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        let forward: usize = self.connections.values().map(|c| c.subscriptions.len()).sum();
        forward == self.subscription_count()
            && self.channels.iter().all(|(channel, members)| {
                !members.is_empty()
                    && members.iter().all(|id| {
                        self.connections
                            .get(id)
                            .is_some_and(|c| c.subscriptions.contains_key(channel))
                    })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn channel(raw: &str) -> ChannelKey {
        raw.parse().unwrap()
    }

    #[test]
    fn indexes_stay_in_sync() {
        let mut reg = Registry::default();
        let (tx, _rx) = mpsc::channel(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        reg.insert(a, tx.clone());
        reg.insert(b, tx);

        assert!(reg.subscribe(a, &channel("ticker:BTCUSDT"), None).unwrap());
        assert!(!reg.subscribe(a, &channel("ticker:BTCUSDT"), None).unwrap());
        reg.subscribe(b, &channel("ticker:BTCUSDT"), None).unwrap();
        reg.subscribe(b, &channel("depth:ETHUSDT"), None).unwrap();
        assert!(reg.is_consistent());
        assert_eq!(reg.subscription_count(), 3);

        assert!(reg.unsubscribe(a, &channel("ticker:BTCUSDT")).unwrap());
        assert!(!reg.unsubscribe(a, &channel("ticker:BTCUSDT")).unwrap());
        assert!(reg.is_consistent());

        let (_, drained) = reg.remove(b).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(reg.channel_count(), 0);
        assert!(reg.is_consistent());
    }

    #[test]
    fn unknown_connection_is_an_error() {
        let mut reg = Registry::default();
        let id = Uuid::new_v4();
        let err = reg.subscribe(id, &channel("ticker"), None).unwrap_err();
        assert!(matches!(err, FeedError::ConnectionNotFound(x) if x == id));
    }

    #[test]
    fn reduce_reflects_member_overrides() {
        let mut reg = Registry::default();
        let (tx, _rx) = mpsc::channel(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        reg.insert(a, tx.clone());
        reg.insert(b, tx);
        let ch = channel("trade:BTCUSDT");
        let tight = ThresholdOverride {
            percentage: Some(0.01),
            absolute: None,
        };

        reg.subscribe(a, &ch, Some(tight)).unwrap();
        reg.subscribe(b, &ch, None).unwrap();
        let reduced = reg.reduce(&ch).unwrap();
        assert_eq!(reduced.percentage.min, Some(0.01));
        assert!(reduced.percentage.includes_global);

        reg.unsubscribe(a, &ch).unwrap();
        reg.unsubscribe(b, &ch).unwrap();
        assert!(reg.reduce(&ch).is_none());
    }
}
