//! Bookkeeping of which swarms run with which peers.
//!
//! The embedder hands every established peer connection to [Runner::run_peer] and pushes the
//!  connection's inbound datagrams into the returned [ChannelReader]. Swarms are then run with
//!  the peer through the [RunnerPeer] handle. A swarm's scheduler lives as long as at least one
//!  peer runs the swarm.

use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::bail;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, instrument, trace, warn};

use crate::buffer_pool::BufferPool;
use crate::channel::{ChannelMetrics, ChannelMetricsPair, ChannelReader, ChannelWriter};
use crate::config::RunnerConfig;
use crate::peer::{Conn, Peer, PeerId, PeerMetricsSnapshot};
use crate::scheduler::{new_swarm_scheduler, PeerTaskQueue, SchedulerConsumer, SwarmScheduler};
use crate::store::ChunkConsumer;
use crate::swarm::{Swarm, SwarmId};
use crate::ticker::{TickSubscriber, Ticker};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelMetricsSnapshot {
    pub read: ChannelMetrics,
    pub write: ChannelMetrics,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunnerPeerSnapshot {
    pub peer: PeerMetricsSnapshot,
    pub swarms: FxHashMap<SwarmId, ChannelMetricsSnapshot>,
}

struct RunnerSwarm {
    swarm: Arc<Swarm>,
    scheduler: Arc<dyn SwarmScheduler>,
    consumer: Arc<dyn ChunkConsumer>,
    tick_subscription: u64,
    /// our channel id per peer
    peers: FxHashMap<PeerId, u64>,
}

struct RunnerPeerEntry {
    peer: Arc<Peer>,
    reader: Arc<ChannelReader>,
    pool: Arc<BufferPool>,
    tick_subscription: u64,
    channels: FxHashMap<SwarmId, Arc<ChannelMetricsPair>>,
}

#[derive(Default)]
struct RunnerState {
    swarms: FxHashMap<SwarmId, RunnerSwarm>,
    peers: FxHashMap<PeerId, RunnerPeerEntry>,
}

struct RunnerInner {
    config: RunnerConfig,
    ticker: Arc<Ticker>,
    state: Mutex<RunnerState>,
}

/// Drives a swarm scheduler from the ticker
struct SchedulerTick(Arc<dyn SwarmScheduler>);

impl TickSubscriber for SchedulerTick {
    fn tick(&self, now: Instant) {
        self.0.run(now);
    }
}

/// Recomputes the peers' QoS weights every `qos_update_interval`
struct QosTick {
    runner: Weak<RunnerInner>,
    next: Mutex<Instant>,
}

impl TickSubscriber for QosTick {
    fn tick(&self, now: Instant) {
        let Some(runner) = self.runner.upgrade() else {
            return;
        };
        {
            let mut next = self.next.lock();
            if now < *next {
                return;
            }
            *next = now + runner.config.qos_update_interval;
        }
        runner.update_peer_weights(now);
    }
}

pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    /// Starts the shared ticker. It is stopped when the runner is dropped.
    pub fn new(config: RunnerConfig) -> anyhow::Result<Runner> {
        config.validate()?;

        let ticker = Ticker::start(config.tick_interval)?;
        let inner = Arc::new(RunnerInner {
            config,
            ticker,
            state: Mutex::new(RunnerState::default()),
        });
        inner.ticker.subscribe(Arc::new(QosTick {
            runner: Arc::downgrade(&inner),
            next: Mutex::new(Instant::now() + inner.config.qos_update_interval),
        }));
        Ok(Runner { inner })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Starts the write loop for a new peer connection. Inbound datagrams of the connection go
    ///  to the returned reader.
    pub fn run_peer(&self, id: PeerId, conn: Arc<dyn Conn>) -> anyhow::Result<(Arc<ChannelReader>, RunnerPeer)> {
        let mut state = self.inner.state.lock();
        if state.peers.contains_key(&id) {
            bail!("peer {} is already running", id.escape_ascii());
        }

        let pool = Arc::new(BufferPool::new(conn.mtu(), self.inner.config.buffer_pool_size));
        let peer = Peer::start(id.clone(), conn)?;
        let reader = Arc::new(ChannelReader::new());
        let tick_subscription = self.inner.ticker.subscribe(peer.clone());

        state.peers.insert(id.clone(), RunnerPeerEntry {
            peer,
            reader: reader.clone(),
            pool,
            tick_subscription,
            channels: FxHashMap::default(),
        });
        info!("running peer {}", id.escape_ascii());

        Ok((reader, RunnerPeer {
            runner: self.inner.clone(),
            id,
        }))
    }

    /// number of swarms run with at least one peer
    pub fn swarm_count(&self) -> usize {
        self.inner.state.lock().swarms.len()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.state.lock().peers.len()
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        let peers: Vec<PeerId> = self.inner.state.lock().peers.keys().cloned().collect();
        for id in peers {
            self.inner.stop_peer(&id);
        }
        self.inner.ticker.stop();
    }
}

impl RunnerInner {
    #[instrument(level = "debug", skip_all, fields(swarm = %swarm.id(), peer = %peer_id.escape_ascii()))]
    fn run_swarm_peer(self: &Arc<Self>, swarm: &Arc<Swarm>, peer_id: &PeerId, channel: u64, peer_channel: u64) -> anyhow::Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(p) = state.peers.get_mut(peer_id) else {
            bail!("channel cannot be run with closed peer");
        };
        if p.peer.is_closed() {
            bail!("channel cannot be run with closed peer");
        }

        let rs = state.swarms.entry(swarm.id().clone()).or_insert_with(|| {
            let scheduler = new_swarm_scheduler(swarm.clone(), &self.config.scheduler);
            let consumer: Arc<dyn ChunkConsumer> = Arc::new(SchedulerConsumer(scheduler.clone()));
            swarm.pubsub().subscribe(consumer.clone());
            let tick_subscription = self.ticker.subscribe(Arc::new(SchedulerTick(scheduler.clone())));
            debug!("started scheduler for swarm {}", swarm.id());
            RunnerSwarm {
                swarm: swarm.clone(),
                scheduler,
                consumer,
                tick_subscription,
                peers: FxHashMap::default(),
            }
        });

        if rs.peers.contains_key(peer_id) {
            bail!("channel for swarm/peer pair already running");
        }
        rs.peers.insert(peer_id.clone(), channel);

        let metrics = Arc::new(ChannelMetricsPair::default());
        p.channels.insert(swarm.id().clone(), metrics.clone());

        let writer = ChannelWriter::new(peer_channel, p.peer.conn().clone(), p.pool.clone(), metrics.clone(), p.peer.metrics().clone());
        let queue: Arc<dyn PeerTaskQueue> = p.peer.clone();
        let scheduler = rs.scheduler.clone().channel_scheduler(queue, Box::new(writer));

        let runner = Arc::downgrade(self);
        let swarm_id = swarm.id().clone();
        let failed_peer = peer_id.clone();
        let on_failure = Box::new(move |e: anyhow::Error| {
            debug!("channel of swarm {} with {} failed: {:#}", swarm_id, failed_peer.escape_ascii(), e);
            if let Some(runner) = runner.upgrade() {
                runner.stop_swarm_peer(&swarm_id, &failed_peer);
            }
        });
        p.reader.open_channel(channel, rs.swarm.clone(), scheduler, metrics, p.peer.metrics().clone(), on_failure);

        info!("running swarm {} with {} on channel {}/{}", swarm.id(), peer_id.escape_ascii(), channel, peer_channel);
        Ok(())
    }

    fn stop_swarm_peer(&self, swarm_id: &SwarmId, peer_id: &PeerId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.stop_channel(state, swarm_id, peer_id);
    }

    fn stop_channel(&self, state: &mut RunnerState, swarm_id: &SwarmId, peer_id: &PeerId) {
        let Some(rs) = state.swarms.get_mut(swarm_id) else {
            return;
        };
        let Some(channel) = rs.peers.remove(peer_id) else {
            return;
        };

        if let Some(p) = state.peers.get_mut(peer_id) {
            p.reader.close_channel(channel);
            p.channels.remove(swarm_id);
        }
        rs.scheduler.close_channel(peer_id);
        debug!("stopped swarm {} with {}", swarm_id, peer_id.escape_ascii());

        if rs.peers.is_empty() {
            self.ticker.unsubscribe(rs.tick_subscription);
            rs.swarm.pubsub().unsubscribe(&rs.consumer);
            state.swarms.remove(swarm_id);
            debug!("stopped scheduler for swarm {}", swarm_id);
        }
    }

    fn stop_peer(&self, peer_id: &PeerId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.peers.contains_key(peer_id) {
            return;
        }

        let swarms: Vec<SwarmId> = state.swarms.iter()
            .filter(|(_, rs)| rs.peers.contains_key(peer_id))
            .map(|(id, _)| id.clone())
            .collect();
        for swarm_id in swarms {
            self.stop_channel(state, &swarm_id, peer_id);
        }

        if let Some(p) = state.peers.remove(peer_id) {
            self.ticker.unsubscribe(p.tick_subscription);
            p.peer.close();
        }
        info!("stopped peer {}", peer_id.escape_ascii());
    }

    fn update_peer_weights(&self, now: Instant) {
        let state = self.state.lock();

        let rates: Vec<(&Arc<Peer>, u64)> = state.peers.values()
            .map(|p| (&p.peer, p.peer.metrics().read_rate(now)))
            .collect();
        let total: u64 = rates.iter().map(|(_, rate)| rate).sum();
        if total == 0 {
            return;
        }

        let max = self.config.max_qos_weight;
        for (peer, rate) in rates {
            let weight = (rate as u128 * max as u128 / total as u128) as u64;
            let weight = weight.clamp(self.config.min_qos_weight, max);
            trace!("qos weight of {} is {}", peer.id().escape_ascii(), weight);
            peer.conn().set_qos_weight(weight);
        }
    }

    fn snapshot(&self, peer_id: &PeerId, now: Instant) -> Option<RunnerPeerSnapshot> {
        let state = self.state.lock();
        let p = state.peers.get(peer_id)?;
        let swarms = p.channels.iter()
            .map(|(id, m)| (id.clone(), ChannelMetricsSnapshot {
                read: m.read.lock().clone(),
                write: m.write.lock().clone(),
            }))
            .collect();
        Some(RunnerPeerSnapshot {
            peer: p.peer.metrics().snapshot(now),
            swarms,
        })
    }
}

/// Handle for running swarms with one peer
pub struct RunnerPeer {
    runner: Arc<RunnerInner>,
    id: PeerId,
}

impl RunnerPeer {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Opens the swarm's channel to the peer. `channel` is the id the peer uses in the frames
    ///  it sends us, `peer_channel` the id we use in the frames we send.
    pub fn run_swarm(&self, swarm: &Arc<Swarm>, channel: u64, peer_channel: u64) -> anyhow::Result<()> {
        self.runner.run_swarm_peer(swarm, &self.id, channel, peer_channel)
    }

    pub fn stop_swarm(&self, swarm_id: &SwarmId) {
        self.runner.stop_swarm_peer(swarm_id, &self.id);
    }

    /// Stops all of the peer's channels and closes its connection
    pub fn stop(&self) {
        self.runner.stop_peer(&self.id);
    }

    /// Empty if the peer was stopped
    pub fn metrics_snapshot(&self, now: Instant) -> RunnerPeerSnapshot {
        match self.runner.snapshot(&self.id, now) {
            Some(snapshot) => snapshot,
            None => {
                warn!("no metrics for stopped peer {}", self.id.escape_ascii());
                RunnerPeerSnapshot::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ChannelHeader, Message};
    use crate::config::SwarmOptions;
    use crate::integrity::Ed25519Signer;
    use crate::peer::MockConn;
    use bytes::{BufMut, Bytes, BytesMut};
    use std::time::Duration;

    fn config() -> RunnerConfig {
        let mut config = RunnerConfig::default_live();
        config.tick_interval = Duration::from_millis(10);
        config.qos_update_interval = Duration::from_secs(3600);
        config
    }

    fn conn() -> MockConn {
        let mut conn = MockConn::new();
        conn.expect_mtu().return_const(1500usize);
        conn.expect_write().returning(|buf| Ok(buf.len()));
        conn.expect_flush().returning(|| Ok(()));
        conn.expect_close().returning(|| Ok(()));
        conn
    }

    fn swarm() -> Arc<Swarm> {
        let signer = Ed25519Signer::generate();
        let mut options = SwarmOptions::default_live();
        options.chunk_size = 16;
        options.live_window = 64;
        options.chunks_per_signature = 4;
        options.stream_count = 4;
        Arc::new(Swarm::new(SwarmId::from(signer.public_key().to_vec()), options).unwrap())
    }

    #[test]
    fn test_run_swarm_with_peer() {
        let runner = Runner::new(config()).unwrap();
        let (reader, peer) = runner.run_peer(Bytes::from_static(b"a"), Arc::new(conn())).unwrap();
        let swarm = swarm();

        peer.run_swarm(&swarm, 1, 2).unwrap();
        assert_eq!(runner.swarm_count(), 1);
        assert!(reader.is_open(1));

        let err = peer.run_swarm(&swarm, 3, 4).unwrap_err();
        assert_eq!(err.to_string(), "channel for swarm/peer pair already running");

        peer.stop_swarm(swarm.id());
        assert_eq!(runner.swarm_count(), 0);
        assert!(!reader.is_open(1));
    }

    #[test]
    fn test_swarm_scheduler_shared_between_peers() {
        let runner = Runner::new(config()).unwrap();
        let (_, a) = runner.run_peer(Bytes::from_static(b"a"), Arc::new(conn())).unwrap();
        let (_, b) = runner.run_peer(Bytes::from_static(b"b"), Arc::new(conn())).unwrap();
        let swarm = swarm();

        a.run_swarm(&swarm, 1, 1).unwrap();
        b.run_swarm(&swarm, 1, 1).unwrap();
        assert_eq!(runner.swarm_count(), 1);
        assert_eq!(swarm.pubsub().len(), 2);

        a.stop();
        assert_eq!(runner.swarm_count(), 1);
        assert_eq!(runner.peer_count(), 1);

        b.stop_swarm(swarm.id());
        assert_eq!(runner.swarm_count(), 0);
        // only the buffer is left
        assert_eq!(swarm.pubsub().len(), 1);
    }

    #[test]
    fn test_run_swarm_with_stopped_peer() {
        let runner = Runner::new(config()).unwrap();
        let (_, peer) = runner.run_peer(Bytes::from_static(b"a"), Arc::new(conn())).unwrap();
        peer.stop();

        let err = peer.run_swarm(&swarm(), 1, 1).unwrap_err();
        assert_eq!(err.to_string(), "channel cannot be run with closed peer");
        assert_eq!(peer.metrics_snapshot(Instant::now()), RunnerPeerSnapshot::default());
    }

    #[test]
    fn test_run_peer_twice() {
        let runner = Runner::new(config()).unwrap();
        let _peer = runner.run_peer(Bytes::from_static(b"a"), Arc::new(conn())).unwrap();
        assert!(runner.run_peer(Bytes::from_static(b"a"), Arc::new(conn())).is_err());
    }

    #[test]
    fn test_stop_closes_connection() {
        let runner = Runner::new(config()).unwrap();
        let mut conn = MockConn::new();
        conn.expect_mtu().return_const(1500usize);
        conn.expect_close().times(1).returning(|| Ok(()));
        let (_, peer) = runner.run_peer(Bytes::from_static(b"a"), Arc::new(conn)).unwrap();

        peer.stop();
        peer.stop();
        assert_eq!(runner.peer_count(), 0);
    }

    #[test]
    fn test_failed_channel_is_stopped() {
        let runner = Runner::new(config()).unwrap();
        let (reader, peer) = runner.run_peer(Bytes::from_static(b"a"), Arc::new(conn())).unwrap();
        let swarm = swarm();
        peer.run_swarm(&swarm, 5, 5).unwrap();

        // a handshake for some other swarm
        let mut payload = BytesMut::new();
        Message::Handshake(crate::codec::Handshake::new(0)).ser(&mut payload);
        let mut datagram = BytesMut::new();
        ChannelHeader { channel: 5, length: payload.len() as u16 }.ser(&mut datagram);
        datagram.put_slice(&payload);
        reader.handle_message(&datagram).unwrap();

        assert!(!reader.is_open(5));
        assert_eq!(runner.swarm_count(), 0);
    }

    #[test]
    fn test_metrics_snapshot_per_swarm() {
        let runner = Runner::new(config()).unwrap();
        let (_, peer) = runner.run_peer(Bytes::from_static(b"a"), Arc::new(conn())).unwrap();
        let a = swarm();
        let b = swarm();
        peer.run_swarm(&a, 1, 1).unwrap();
        peer.run_swarm(&b, 2, 2).unwrap();

        let snapshot = peer.metrics_snapshot(Instant::now());
        assert_eq!(snapshot.swarms.len(), 2);
        assert!(snapshot.swarms.contains_key(a.id()));
        assert!(snapshot.swarms.contains_key(b.id()));
    }

    #[test]
    fn test_update_peer_weights() {
        let runner = Runner::new(config()).unwrap();

        let mut peers = Vec::new();
        for (id, expected) in [(b"a", 750u64), (b"b", 250), (b"c", 50)] {
            let mut conn = conn();
            conn.expect_set_qos_weight().withf(move |w| *w == expected).times(1).return_const(());
            let (_, peer) = runner.run_peer(Bytes::from_static(id), Arc::new(conn)).unwrap();
            peers.push(peer);
        }

        {
            let state = runner.inner.state.lock();
            state.peers[&Bytes::from_static(b"a")].peer.metrics().add_read_bytes(3000);
            state.peers[&Bytes::from_static(b"b")].peer.metrics().add_read_bytes(1000);
        }
        runner.inner.update_peer_weights(Instant::now());
    }

    #[test]
    fn test_no_weights_without_traffic() {
        let runner = Runner::new(config()).unwrap();
        let mut conn = conn();
        conn.expect_set_qos_weight().never();
        let _peer = runner.run_peer(Bytes::from_static(b"a"), Arc::new(conn)).unwrap();

        runner.inner.update_peer_weights(Instant::now());
    }
}
