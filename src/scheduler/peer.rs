use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::bail;
use binmap::{Bin, BinCursor, BinMap, IntersectionIterator};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};

use super::streams::{new_streams, StreamLayout, StreamState};
use super::timing::{BinQueue, TimeSet};
use super::{next_runner_id, write_chunk_data, write_extra_messages, write_map_bins, ChannelFlags, ChannelMessageWriter, ChannelScheduler, PeerPriority, PeerTaskQueue, PeerTaskRunner, SwarmScheduler, WriteError};
use crate::codec::{CodecError, Message, Pong, Request, StreamAddress, Timestamp};
use crate::config::{DeliveryMode, SchedulerConfig};
use crate::etcp::Etcp;
use crate::integrity::ProtectionMethod;
use crate::peer::PeerId;
use crate::safe_converter::PrecheckedCast;
use crate::store::Chunk;
use crate::stream_assigner::StreamAssigner;
use crate::swarm::Swarm;
use crate::util::sma::Sma;
use crate::util::welford::Welford;

const SECOND: Duration = Duration::from_secs(1);

/// Swarm scheduler of a regular peer. It requests missing chunks from the channels that
///  announced them, serves requests, and subscribes to streams at the channels that announce
///  their chunks earliest so that those chunks are pushed without per-chunk requests.
pub struct PeerSwarmScheduler {
    swarm: Arc<Swarm>,
    config: SchedulerConfig,
    layout: StreamLayout,
    /// announcement times are tracked per bin of this layer
    signature_layer: u64,
    /// the span of bins that is of interest: twice the live window because bins are numbered
    ///  two per chunk
    live_window: u64,
    state: Mutex<PeerSwarmState>,
}

struct PeerSwarmState {
    /// when a bin was first announced by any peer
    bin_times: TimeSet,
    peer_have_chunk_rate: Sma,
    peer_max_have_bin: Bin,
    have_bins: BinMap,
    have_bin_max: Bin,
    /// requested or received, a superset of `have_bins`
    request_bins: BinMap,
    streams: Vec<StreamState<PeerChannelScheduler>>,
    channels: FxHashMap<PeerId, Arc<PeerChannelScheduler>>,
    first_chunk_set: bool,
    next_gc: Instant,
    next_stream_check: Instant,
    /// request order of the streams: the stream with rank 0 is requested first
    stream_ranks: Vec<usize>,
}

impl PeerSwarmState {
    fn new(swarm: &Swarm, layout: StreamLayout, config: &SchedulerConfig, now: Instant) -> PeerSwarmState {
        let have_bins = swarm.buffer().bins();
        let last = have_bins.find_last_filled();
        let stream_count = layout.stream_count() as usize;

        let mut rng = rand::rng();
        let mut stream_ranks: Vec<usize> = (0..stream_count).collect();
        stream_ranks.shuffle(&mut rng);

        // spread the periodic work of swarms that start together
        let jitter = |rng: &mut rand::rngs::ThreadRng, interval: Duration| {
            Duration::from_millis(rng.random_range(0..=interval.as_millis() as u64))
        };

        PeerSwarmState {
            bin_times: TimeSet::new(),
            peer_have_chunk_rate: Sma::new(15, SECOND),
            peer_max_have_bin: Bin(0),
            request_bins: have_bins.clone(),
            first_chunk_set: !have_bins.empty(),
            have_bin_max: if last.is_none() { Bin(0) } else { last },
            have_bins,
            streams: new_streams(layout.stream_count()),
            channels: FxHashMap::default(),
            next_gc: now + jitter(&mut rng, config.gc_interval),
            next_stream_check: now + jitter(&mut rng, config.stream_check_interval),
            stream_ranks,
        }
    }
}

impl PeerSwarmScheduler {
    pub fn new(swarm: Arc<Swarm>, config: SchedulerConfig) -> PeerSwarmScheduler {
        let options = swarm.options();
        let layout = StreamLayout::new(options.stream_count.prechecked_cast());
        let signature_layer = match options.integrity.protection_method {
            ProtectionMethod::MerkleTree => options.chunks_per_signature.trailing_zeros() as u64,
            _ => 0,
        };
        let live_window = options.live_window as u64 * 2;
        let state = PeerSwarmState::new(&swarm, layout, &config, Instant::now());

        PeerSwarmScheduler {
            swarm,
            config,
            layout,
            signature_layer,
            live_window,
            state: Mutex::new(state),
        }
    }

    fn label(&self) -> &str {
        &self.swarm.options().label
    }

    fn handshake(&self) -> Message {
        Message::Handshake(self.swarm.handshake())
    }

    fn stream_index(&self, stream: u16) -> anyhow::Result<usize> {
        if stream >= self.layout.stream_count() {
            bail!("stream {} out of range, the swarm has {} streams", stream, self.layout.stream_count());
        }
        Ok(stream as usize)
    }

    /// Records when `b` was first announced. Chunks are verified per signed subtree, so times
    ///  are kept at that granularity.
    fn set_bin_time(&self, state: &mut PeerSwarmState, mut b: Bin, t: Instant) {
        while b.layer() < self.signature_layer {
            b = b.parent();
        }
        state.bin_times.set_first(b, t);
    }

    /// where reading starts once the first chunk arrived
    fn first_chunk_offset(&self, state: &PeerSwarmState) -> Bin {
        match self.swarm.options().delivery_mode {
            DeliveryMode::Mandatory => Bin(0),
            DeliveryMode::LowLatency => state.have_bin_max,
            DeliveryMode::BestEffort => {
                let half = self.live_window / 4 * 2;
                if state.have_bin_max.0 > half {
                    Bin(state.have_bin_max.0 - half)
                }
                else {
                    Bin(0)
                }
            }
        }
    }

    fn gc(&self, state: &mut PeerSwarmState) {
        if self.live_window < state.have_bin_max.0 {
            state.bin_times.prune(Bin(state.have_bin_max.0 - self.live_window));
        }

        let next = self.swarm.buffer().next();
        if next.is_none() {
            return;
        }
        for c in state.channels.values() {
            c.state.lock().request_times.prune(next);
        }
    }

    /// Re-evaluates which channel each stream is subscribed at, preferring the channels that
    ///  announce a stream's chunks earliest, within the number of streams each channel can
    ///  carry at its current delivery rate.
    fn check_streams(&self, state: &mut PeerSwarmState, now: Instant) {
        let stream_count = self.layout.stream_count() as usize;

        let current_sources: Vec<Option<PeerId>> = state.streams.iter()
            .map(|s| s.source.as_ref().map(|src| src.peer.clone()))
            .collect();
        let current_lags: Vec<Welford> = state.streams.iter_mut()
            .map(|s| {
                let lag = s.received_chunk_lag;
                s.received_chunk_lag.reset();
                lag
            })
            .collect();

        let stream_rate = state.peer_have_chunk_rate.rate(SECOND, now) / stream_count as u64;
        if stream_rate == 0 {
            trace!("{}: no chunks announced, skipping stream check", self.label());
            return;
        }

        let mut channels: Vec<Arc<PeerChannelScheduler>> = state.channels.values().cloned().collect();
        channels.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let mut candidates = Vec::new();
        let mut capacities = Vec::new();
        let mut candidate_lags: Vec<Vec<Welford>> = Vec::new();
        for c in channels {
            let mut cs = c.state.lock();
            let mut capacity = (cs.data_rtt.sample_rate(SECOND, now) / stream_rate).min(1) as i64;
            let choked = cs.flags.contains(ChannelFlags::CHOKED);

            let mut lags = vec![Welford::new(); stream_count];
            for (i, lag) in lags.iter_mut().enumerate() {
                let assigned = current_sources[i].as_ref() == Some(&c.peer_id);
                if assigned {
                    capacity += 1;
                }
                if !choked || assigned {
                    *lag = cs.stream_have_lag[i];
                }
                cs.stream_have_lag[i].reset();
            }
            drop(cs);

            if capacity > 0 {
                candidates.push(c);
                capacities.push(capacity);
                candidate_lags.push(lags);
            }
        }
        if candidates.is_empty() {
            return;
        }

        let aggregate_lags: Vec<f64> = (0..stream_count)
            .map(|i| Welford::merge(candidate_lags.iter().map(|lags| &lags[i])).mean())
            .collect();
        let mut order: Vec<usize> = (0..stream_count).collect();
        order.sort_by(|a, b| aggregate_lags[*b].total_cmp(&aggregate_lags[*a]));
        for (rank, stream) in order.into_iter().enumerate() {
            state.stream_ranks[stream] = rank;
        }

        let mut assigner = StreamAssigner::new(stream_count, capacities);
        for (i, current_lag) in current_lags.iter().enumerate() {
            if current_lag.count() == 0 {
                continue;
            }
            for (j, lags) in candidate_lags.iter().enumerate() {
                if lags[i].count() > 0 {
                    let current = current_sources[i].as_ref() == Some(&candidates[j].peer_id);
                    assigner.add_candidate(i, j, lags[i].mean() as i64, current);
                }
            }
        }
        let (flow, assignments) = assigner.run();
        debug!("{}: {} of {} streams assigned", self.label(), flow, stream_count);

        let last = state.request_bins.find_last_filled();
        let start = if last.is_none() { Bin(0) } else { last + 2 };
        for a in assignments {
            let c = &candidates[a.channel];
            let stream = a.stream as u16;

            if let Some(current) = &current_sources[a.stream] {
                if current == &c.peer_id {
                    continue;
                }
                if let Some(previous) = state.channels.get(current).cloned() {
                    let mut ps = previous.state.lock();
                    self.close_stream(state, &previous, &mut ps, stream);
                    ps.extra_messages.push(Message::StreamCancel(stream));
                    drop(ps);
                    previous.enqueue();
                }
            }

            let mut cs = c.state.lock();
            self.subscribe_stream(state, c, &mut cs, stream, start);
            drop(cs);
            c.enqueue();
        }
    }

    fn set_stream_source(&self, state: &mut PeerSwarmState, peer: PeerId, stream: u16, start: Bin) {
        let s = &mut state.streams[stream as usize];
        s.set_source(peer, start, self.layout.bin_stream_offset(start));

        for interval in state.have_bins.iterate_filled().intervals_after(start) {
            for b in self.layout.stream_bins(stream, interval.base_left(), interval.base_right()) {
                if b >= start {
                    s.received.add(self.layout.bin_stream_offset(b));
                }
            }
        }
    }

    fn subscribe_stream(&self, state: &mut PeerSwarmState, c: &PeerChannelScheduler, cs: &mut PeerChannelState, stream: u16, start: Bin) {
        let start = self.layout.first_stream_bin(stream, start);
        debug!("{}: subscribing to stream {} at {} from {}", self.label(), stream, c.peer_id.escape_ascii(), start);

        self.set_stream_source(state, c.peer_id.clone(), stream, start);
        cs.request_streams[stream as usize] = start;
        cs.extra_messages.push(Message::StreamRequest(StreamAddress { stream, address: start }));

        // these are pushed by the peer, they must not be requested individually
        for b in self.layout.stream_bins(stream, start, state.peer_max_have_bin) {
            state.request_bins.set(b);
        }
    }

    /// Forgets the subscription of `stream` at channel `c`. Chunks that were expected from it
    ///  become eligible for requests again.
    fn close_stream(&self, state: &mut PeerSwarmState, c: &PeerChannelScheduler, cs: &mut PeerChannelState, stream: u16) {
        let s = stream as usize;
        let start = cs.request_streams[s];
        if start.is_none() {
            return;
        }

        let pending: Vec<Bin> = IntersectionIterator::new(
            state.have_bins.iterate_empty_at(state.request_bins.root_bin()),
            state.request_bins.iterate_filled(),
        )
            .intervals_after(start)
            .flat_map(|i| self.layout.stream_bins(stream, i.base_left(), i.base_right()))
            .filter(|b| *b >= start)
            .collect();
        for b in pending {
            state.request_bins.reset(b);
        }

        cs.request_streams[s] = Bin::NONE;
        if state.streams[s].is_source(&c.peer_id) {
            state.streams[s].reset_source();
        }
        debug!("{}: stream {} from {} closed", self.label(), stream, c.peer_id.escape_ascii());
    }

    /// Subscribes channel `c` to `stream`: everything we have of the stream from `start` on is
    ///  queued for sending, and so is every chunk of it that arrives later.
    fn open_stream(&self, state: &mut PeerSwarmState, c: &Arc<PeerChannelScheduler>, cs: &mut PeerChannelState, stream: u16, start: Bin) {
        let tail = self.swarm.buffer().tail();
        let start = if !tail.is_none() && start < tail { tail } else { start };
        let start = self.layout.first_stream_bin(stream, start);

        state.streams[stream as usize].add_subscriber(c.peer_id.clone(), c.clone(), start);

        let runner: Arc<dyn PeerTaskRunner> = c.clone();
        for interval in state.have_bins.iterate_filled().intervals_after(start) {
            for b in self.layout.stream_bins(stream, interval.base_left(), interval.base_right()) {
                if b >= start {
                    c.queue.push_data(runner.clone(), b, Timestamp::now(), PeerPriority::High);
                }
            }
        }

        cs.extra_messages.push(Message::StreamOpen(StreamAddress { stream, address: start }));
        debug!("{}: opened stream {} at {} for {}", self.label(), stream, start, c.peer_id.escape_ascii());
    }
}

impl SwarmScheduler for PeerSwarmScheduler {
    fn run(&self, now: Instant) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if now >= state.next_gc {
            self.gc(state);
            state.next_gc = now + self.config.gc_interval;
        }
        if now >= state.next_stream_check {
            self.check_streams(state, now);
            state.next_stream_check = now + self.config.stream_check_interval;
        }

        let channels: Vec<Arc<PeerChannelScheduler>> = state.channels.values().cloned().collect();
        for c in &channels {
            c.time_out_requests(state, now);
            c.try_restart(now);
            c.wake_for_ping(now);
        }

        if !state.first_chunk_set && !state.have_bins.empty() {
            let b = self.first_chunk_offset(state);
            state.request_bins.fill_before(b);
            self.swarm.buffer().set_offset(b);
            state.first_chunk_set = true;
            info!("{}: first chunk received, reading from {}", self.label(), b);

            for c in &channels {
                c.enqueue();
            }
        }
    }

    fn consume(&self, chunk: &Chunk) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        self.set_bin_time(state, chunk.bin, now);

        let new_bins: Vec<Bin> = state.have_bins.iterate_empty_at(chunk.bin).bases().collect();
        for b in new_bins {
            let first = state.bin_times.get(b).map_or(now, |(_, t)| t);
            let stream = &mut state.streams[self.layout.bin_stream(b) as usize];
            stream.add_received_chunk(self.layout.bin_stream_offset(b), now, now.saturating_duration_since(first));
            stream.update_peer_have_max(b);

            for sub in stream.subscribers.iter().filter(|sub| sub.start_bin <= b) {
                let runner: Arc<dyn PeerTaskRunner> = sub.channel.clone();
                sub.channel.queue.push_data(runner, b, Timestamp::now(), PeerPriority::High);
            }
        }

        state.have_bins.set(chunk.bin);
        let mut hb = state.have_bins.cover(chunk.bin);
        if hb.is_all() {
            hb = state.have_bins.root_bin();
        }
        for c in state.channels.values() {
            c.state.lock().have_bins.set(hb);
            c.enqueue();
        }

        let br = chunk.bin.base_right();
        if br > state.have_bin_max {
            state.have_bin_max = br;
        }
        state.request_bins.set(chunk.bin);
    }

    fn channel_scheduler(self: Arc<Self>, queue: Arc<dyn PeerTaskQueue>, writer: Box<dyn ChannelMessageWriter>) -> Arc<dyn ChannelScheduler> {
        let now = Instant::now();
        let peer_id = queue.id();
        let stream_count = self.layout.stream_count() as usize;

        let mut state = self.state.lock();
        let have_bins = state.have_bins.clone();
        let channel = Arc::new_cyclic(|this| PeerChannelScheduler {
            runner_id: next_runner_id(),
            peer_id: peer_id.clone(),
            queue: queue.clone(),
            swarm: self.clone(),
            this: this.clone(),
            wake_now: AtomicBool::new(false),
            state: Mutex::new(PeerChannelState::new(writer, have_bins, self.handshake(), stream_count, &self.config, now)),
        });
        state.channels.insert(peer_id, channel.clone());
        drop(state);

        debug!("{}: channel to {} opened", self.label(), channel.peer_id.escape_ascii());
        queue.enqueue(channel.clone());
        channel
    }

    fn close_channel(&self, peer: &PeerId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(c) = state.channels.remove(peer) else {
            return;
        };

        let mut cs = c.state.lock();
        for stream in 0..self.layout.stream_count() {
            state.streams[stream as usize].remove_subscriber(peer);
            if state.streams[stream as usize].is_source(peer) {
                self.close_stream(state, &c, &mut cs, stream);
            }
        }
        c.clear_requests(state, &mut cs);
        drop(cs);
        drop(guard);

        debug!("{}: channel to {} closed", self.label(), peer.escape_ascii());
        c.queue.remove_runner(c.runner_id);
    }

    fn reset(&self) {
        let now = Instant::now();
        let stream_count = self.layout.stream_count() as usize;

        let mut guard = self.state.lock();
        let channels = std::mem::take(&mut guard.channels);
        *guard = PeerSwarmState::new(&self.swarm, self.layout, &self.config, now);
        guard.channels = channels;

        for c in guard.channels.values() {
            c.state.lock().reset(self.handshake(), stream_count, &self.config, now);
            c.enqueue_now();
        }
        info!("{}: scheduler reset", self.label());
    }
}

/// The scheduler of one peer's channel in a [PeerSwarmScheduler]
pub struct PeerChannelScheduler {
    runner_id: u64,
    peer_id: PeerId,
    queue: Arc<dyn PeerTaskQueue>,
    swarm: Arc<PeerSwarmScheduler>,
    this: Weak<PeerChannelScheduler>,
    /// a handler wants the channel to be written without waiting for the next tick
    wake_now: AtomicBool,
    state: Mutex<PeerChannelState>,
}

struct PeerChannelState {
    writer: Box<dyn ChannelMessageWriter>,
    flags: ChannelFlags,
    /// delay of this peer's announcements behind the first announcement, per stream
    stream_have_lag: Vec<Welford>,
    request_times: TimeSet,
    request_deadlines: BinQueue,
    data_rtt: Sma,
    data_chunks: Sma,
    etcp: Etcp,
    /// bins to announce
    have_bins: BinMap,
    /// timed out requests to cancel
    cancel_bins: BinMap,
    /// start of each stream subscribed at this peer, [Bin::NONE] if not subscribed
    request_streams: Vec<Bin>,
    extra_messages: Vec<Message>,
    peer_live_window: u64,
    peer_max_have_bin: Bin,
    peer_have_bins: BinMap,
    next_restart: Instant,
    next_ping: Instant,
    /// nonce and send time of the ping awaiting its pong
    ping: Option<(u64, Instant)>,
}

impl PeerChannelState {
    fn new(writer: Box<dyn ChannelMessageWriter>, have_bins: BinMap, handshake: Message, stream_count: usize, config: &SchedulerConfig, now: Instant) -> PeerChannelState {
        PeerChannelState {
            writer,
            flags: ChannelFlags::empty(),
            stream_have_lag: vec![Welford::new(); stream_count],
            request_times: TimeSet::new(),
            request_deadlines: BinQueue::new(),
            data_rtt: Sma::new(50, Duration::from_millis(100)),
            data_chunks: Sma::new(15, SECOND),
            etcp: Etcp::new(config.max_congestion_window),
            have_bins,
            cancel_bins: BinMap::new(),
            request_streams: vec![Bin::NONE; stream_count],
            extra_messages: vec![handshake],
            peer_live_window: 0,
            peer_max_have_bin: Bin(0),
            peer_have_bins: BinMap::new(),
            next_restart: now + config.restart_cooldown,
            next_ping: now,
            ping: None,
        }
    }

    /// back to the state of a new channel, the peer has to handshake again
    fn reset(&mut self, handshake: Message, stream_count: usize, config: &SchedulerConfig, now: Instant) {
        self.flags = ChannelFlags::empty();
        self.stream_have_lag = vec![Welford::new(); stream_count];
        self.request_times = TimeSet::new();
        self.request_deadlines = BinQueue::new();
        self.data_chunks = Sma::new(15, SECOND);
        self.etcp = Etcp::new(config.max_congestion_window);
        self.have_bins = BinMap::new();
        self.cancel_bins = BinMap::new();
        self.request_streams = vec![Bin::NONE; stream_count];
        self.extra_messages = vec![handshake];
        self.peer_max_have_bin = Bin(0);
        self.peer_have_bins = BinMap::new();
        self.next_restart = now + config.restart_cooldown;
        self.ping = None;
    }
}

impl PeerChannelScheduler {
    fn runner(&self) -> Option<Arc<dyn PeerTaskRunner>> {
        self.this.upgrade().map(|c| c as Arc<dyn PeerTaskRunner>)
    }

    fn enqueue(&self) {
        if let Some(runner) = self.runner() {
            self.queue.enqueue(runner);
        }
    }

    fn enqueue_now(&self) {
        if let Some(runner) = self.runner() {
            self.queue.enqueue_now(runner);
        }
    }

    fn handshake_received(&self) -> bool {
        self.state.lock().flags.contains(ChannelFlags::HANDSHAKE_RECEIVED)
    }

    /// Gives up on requests that were not answered in time: they are cancelled at the peer and
    ///  can be requested from anyone again.
    fn time_out_requests(&self, state: &mut PeerSwarmState, now: Instant) {
        let mut cs = self.state.lock();
        let mut lost = 0;
        let mut discarded = 0;

        for r in cs.request_deadlines.pop_due(now) {
            let mut b = r.base_left();
            while b <= r.base_right() {
                if cs.request_times.get(b).is_some() {
                    cs.request_times.unset(b);
                    if state.have_bins.filled_at(b) {
                        discarded += 1;
                    }
                    else {
                        state.request_bins.reset(b);
                        cs.cancel_bins.set(b);
                        lost += 1;
                    }
                }
                b = b + 2;
            }
        }

        if discarded > 0 {
            cs.etcp.on_discard(discarded);
        }
        if lost > 0 {
            debug!("{}: {} requests to {} timed out", self.swarm.label(), lost, self.peer_id.escape_ascii());
            cs.etcp.on_loss(lost);
            drop(cs);
            self.enqueue();
        }
    }

    /// Asks a peer that did not answer our handshake to start over
    fn try_restart(&self, now: Instant) {
        let mut cs = self.state.lock();
        if cs.flags.contains(ChannelFlags::HANDSHAKE_RECEIVED) || now < cs.next_restart {
            return;
        }
        cs.next_restart = now + self.swarm.config.restart_cooldown;
        if !cs.extra_messages.contains(&Message::Restart) {
            cs.extra_messages.push(Message::Restart);
        }
        drop(cs);

        debug!("{}: no handshake from {}, restarting", self.swarm.label(), self.peer_id.escape_ascii());
        self.enqueue();
    }

    fn wake_for_ping(&self, now: Instant) {
        let cs = self.state.lock();
        let due = cs.flags.contains(ChannelFlags::HANDSHAKE_RECEIVED) && now >= cs.next_ping;
        drop(cs);
        if due {
            self.enqueue();
        }
    }

    /// makes the pending requests available to other channels
    fn clear_requests(&self, state: &mut PeerSwarmState, cs: &mut PeerChannelState) {
        for r in cs.request_deadlines.drain() {
            let missing: Vec<Bin> = state.have_bins.iterate_empty_at(r).bases().collect();
            for b in missing {
                state.request_bins.reset(b);
            }
        }
    }

    fn write_control(&self, max_bytes: usize, now: Instant) -> Result<(), CodecError> {
        let mut guard = self.state.lock();
        let cs = &mut *guard;
        cs.writer.resize(max_bytes);

        write_extra_messages(&mut cs.extra_messages, cs.writer.as_mut())?;

        if cs.flags.contains(ChannelFlags::HANDSHAKE_RECEIVED) && now >= cs.next_ping {
            let nonce = rand::random::<u64>();
            cs.writer.write(&Message::Ping(nonce))?;
            cs.ping = Some((nonce, now));
            cs.next_ping = now + self.swarm.config.ping_interval;
        }

        write_map_bins(&mut cs.have_bins, cs.writer.as_mut(), Message::Have)?;
        write_map_bins(&mut cs.cancel_bins, cs.writer.as_mut(), Message::Cancel)
    }

    /// Requests chunks the peer announced and nobody was asked for yet, as many as the
    ///  congestion window allows, streams with the highest rank first
    fn write_requests(&self, now: Instant) -> Result<(), CodecError> {
        let scheduler = &self.swarm;
        let mut swarm_guard = scheduler.state.lock();
        let state = &mut *swarm_guard;
        let mut guard = self.state.lock();
        let cs = &mut *guard;

        if cs.flags.contains(ChannelFlags::CHOKED) || !cs.flags.contains(ChannelFlags::HANDSHAKE_RECEIVED) {
            return Ok(());
        }
        let mut n = cs.etcp.available();
        if n == 0 {
            return Ok(());
        }

        let mut min = if cs.peer_max_have_bin.0 > cs.peer_live_window {
            Bin(cs.peer_max_have_bin.0 - cs.peer_live_window)
        }
        else {
            Bin(0)
        };
        let next = scheduler.swarm.buffer().next();
        if !next.is_none() && min > next {
            min = next;
        }
        if !state.first_chunk_set && cs.peer_max_have_bin > min {
            min = cs.peer_max_have_bin;
        }

        let timeout = now + cs.etcp.rtt().timeout(scheduler.config.min_rtt_var, scheduler.config.max_request_timeout);

        let stream_count = scheduler.layout.stream_count() as usize;
        let limit = n as usize * stream_count;
        let mut collected = 0;
        let mut candidates: Vec<Vec<Bin>> = vec![Vec::new(); stream_count];
        let wanted = IntersectionIterator::new(
            state.request_bins.iterate_empty_at(cs.peer_have_bins.root_bin()),
            cs.peer_have_bins.iterate_filled(),
        );
        'intervals: for interval in wanted.intervals_after(min) {
            let mut b = interval.base_left().max(min.base_left());
            while b <= interval.base_right() {
                let rank = state.stream_ranks[scheduler.layout.bin_stream(b) as usize];
                if candidates[rank].len() < n as usize {
                    candidates[rank].push(b);
                    collected += 1;
                    if collected >= limit {
                        break 'intervals;
                    }
                }
                b = b + 2;
            }
        }

        let timestamp = Timestamp::now();
        'ranks: for bins in candidates {
            for b in bins {
                cs.writer.write(&Message::Request(Request { address: b, timestamp }))?;
                state.request_bins.set(b);
                cs.request_times.set(b, now);
                cs.request_deadlines.push(b, timeout);
                cs.etcp.on_sent(1);

                n -= 1;
                if n == 0 {
                    break 'ranks;
                }
            }
        }
        Ok(())
    }
}

impl PeerTaskRunner for PeerChannelScheduler {
    fn runner_id(&self) -> u64 {
        self.runner_id
    }

    fn write(&self, max_bytes: usize) -> Result<usize, WriteError> {
        let now = Instant::now();
        let result = self.write_control(max_bytes, now)
            .and_then(|_| self.write_requests(now));
        let incomplete = match result {
            Ok(()) => false,
            Err(CodecError::NotEnoughSpace) => true,
            Err(e) => return Err(e.into()),
        };

        let mut cs = self.state.lock();
        let n = cs.writer.len();
        cs.writer.flush()?;
        drop(cs);
        if incomplete {
            self.enqueue();
        }
        Ok(n)
    }

    fn write_data(&self, max_bytes: usize, bin: Bin, _timestamp: Timestamp, priority: PeerPriority) -> Result<usize, WriteError> {
        let Some(runner) = self.runner() else {
            return Ok(0);
        };
        let mut guard = self.state.lock();
        let cs = &mut *guard;
        write_chunk_data(
            &self.swarm.swarm,
            cs.writer.as_mut(),
            &cs.peer_have_bins,
            self.queue.as_ref(),
            runner,
            max_bytes,
            bin,
            Timestamp::now(),
            priority,
        )
    }
}

impl ChannelScheduler for PeerChannelScheduler {
    fn handle_handshake(&self, live_window: u32) -> anyhow::Result<()> {
        let mut cs = self.state.lock();
        cs.peer_live_window = live_window as u64 * 2;
        cs.flags.insert(ChannelFlags::HANDSHAKE_RECEIVED);
        debug!("{}: handshake from {}", self.swarm.label(), self.peer_id.escape_ascii());
        Ok(())
    }

    fn handle_restart(&self) -> anyhow::Result<()> {
        let state = self.swarm.state.lock();
        let mut cs = self.state.lock();
        cs.extra_messages.push(self.swarm.handshake());
        cs.have_bins = state.have_bins.clone();
        Ok(())
    }

    fn handle_data(&self, bin: Bin, _timestamp: Timestamp, valid: bool) -> anyhow::Result<()> {
        let now = Instant::now();
        if !valid {
            let mut state = self.swarm.state.lock();
            let missing: Vec<Bin> = state.have_bins.iterate_empty_at(bin).bases().collect();
            for b in missing {
                state.request_bins.reset(b);
            }
            return Ok(());
        }

        self.wake_now.store(true, Ordering::Release);

        let mut cs = self.state.lock();
        if !cs.flags.contains(ChannelFlags::HANDSHAKE_RECEIVED) {
            return Ok(());
        }

        if let Some((_, requested)) = cs.request_times.get(bin) {
            let rtt = now.saturating_duration_since(requested);
            cs.data_rtt.add_n_with_time(bin.base_length(), rtt.as_millis() as u64, now);
            cs.etcp.on_ack(rtt, bin.base_length());
            cs.request_times.unset(bin);
        }
        cs.data_chunks.add_with_time(bin.base_length(), now);
        Ok(())
    }

    fn handle_ack(&self, _bin: Bin, _delay: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle_have(&self, bin: Bin) -> anyhow::Result<()> {
        let now = Instant::now();
        let scheduler = &self.swarm;
        let mut swarm_guard = scheduler.state.lock();
        let state = &mut *swarm_guard;
        let mut guard = self.state.lock();
        let cs = &mut *guard;

        if !cs.flags.contains(ChannelFlags::HANDSHAKE_RECEIVED) {
            return Ok(());
        }

        scheduler.set_bin_time(state, bin, now);

        let new_bins: Vec<Bin> = cs.peer_have_bins.iterate_empty_at(bin).bases().collect();
        for b in new_bins {
            let first = state.bin_times.get(b).map_or(now, |(_, t)| t);
            let stream = scheduler.layout.bin_stream(b) as usize;
            cs.stream_have_lag[stream].update(now.saturating_duration_since(first).as_nanos() as f64);
            state.streams[stream].update_peer_have_max(b);
        }

        cs.peer_have_bins.set(bin);
        let br = bin.base_right();
        if br > cs.peer_max_have_bin {
            cs.peer_max_have_bin = br;
        }

        if br > state.peer_max_have_bin {
            if state.peer_max_have_bin != Bin(0) {
                state.peer_have_chunk_rate.add_with_time(br.base_offset() - state.peer_max_have_bin.base_offset(), now);
            }

            // chunks of subscribed streams are pushed to us, they are not requested
            let mut b = state.peer_max_have_bin;
            if br.0 > scheduler.live_window && b.0 < br.0 - scheduler.live_window {
                b = Bin(br.0 - scheduler.live_window);
            }
            while b <= br {
                let stream = &state.streams[scheduler.layout.bin_stream(b) as usize];
                if stream.source.as_ref().is_some_and(|src| b >= src.start_bin) {
                    state.request_bins.set(b);
                }
                b = b + 2;
            }
            state.peer_max_have_bin = br;
        }
        Ok(())
    }

    fn handle_request(&self, bin: Bin, timestamp: Timestamp) -> anyhow::Result<()> {
        if !self.handshake_received() {
            return Ok(());
        }
        if let Some(runner) = self.runner() {
            self.queue.push_data(runner, bin, timestamp, PeerPriority::Low);
        }
        self.wake_now.store(true, Ordering::Release);
        Ok(())
    }

    fn handle_cancel(&self, bin: Bin) -> anyhow::Result<()> {
        self.queue.remove_data(self.runner_id, bin, PeerPriority::Low);
        Ok(())
    }

    fn handle_choke(&self) -> anyhow::Result<()> {
        self.state.lock().flags.insert(ChannelFlags::CHOKED);
        Ok(())
    }

    fn handle_unchoke(&self) -> anyhow::Result<()> {
        self.state.lock().flags.remove(ChannelFlags::CHOKED);
        Ok(())
    }

    fn handle_ping(&self, nonce: u64) -> anyhow::Result<()> {
        self.state.lock().extra_messages.push(Message::Pong(Pong { nonce, delay: 0 }));
        self.wake_now.store(true, Ordering::Release);
        Ok(())
    }

    fn handle_pong(&self, nonce: u64) -> anyhow::Result<()> {
        let mut cs = self.state.lock();
        match cs.ping {
            Some((expected, sent)) if expected == nonce => {
                let rtt = sent.elapsed();
                cs.etcp.on_rtt_sample(rtt);
                cs.ping = None;
                trace!("{}: ping rtt to {} is {:?}", self.swarm.label(), self.peer_id.escape_ascii(), rtt);
            }
            _ => trace!("{}: unexpected pong from {}", self.swarm.label(), self.peer_id.escape_ascii()),
        }
        Ok(())
    }

    fn handle_stream_request(&self, stream: u16, bin: Bin) -> anyhow::Result<()> {
        self.swarm.stream_index(stream)?;
        let Some(this) = self.this.upgrade() else {
            return Ok(());
        };

        let mut swarm_guard = self.swarm.state.lock();
        let mut cs = self.state.lock();
        if !cs.flags.contains(ChannelFlags::HANDSHAKE_RECEIVED) {
            return Ok(());
        }
        self.swarm.open_stream(&mut swarm_guard, &this, &mut cs, stream, bin);
        Ok(())
    }

    fn handle_stream_cancel(&self, stream: u16) -> anyhow::Result<()> {
        let s = self.swarm.stream_index(stream)?;
        self.swarm.state.lock().streams[s].remove_subscriber(&self.peer_id);
        Ok(())
    }

    fn handle_stream_open(&self, stream: u16, bin: Bin) -> anyhow::Result<()> {
        let s = self.swarm.stream_index(stream)?;
        let scheduler = &self.swarm;
        let mut swarm_guard = scheduler.state.lock();
        let state = &mut *swarm_guard;
        let mut cs = self.state.lock();

        // the peer may start later than we asked, what lies before is requested individually
        let previous = cs.request_streams[s];
        if !previous.is_none() && previous < bin {
            let skipped: Vec<Bin> = scheduler.layout.stream_bins(stream, previous, bin)
                .filter(|b| *b < bin && state.have_bins.empty_at(*b))
                .collect();
            for b in skipped {
                state.request_bins.reset(b);
            }
        }

        cs.request_streams[s] = bin;
        scheduler.set_stream_source(state, self.peer_id.clone(), stream, bin);
        Ok(())
    }

    fn handle_stream_close(&self, stream: u16) -> anyhow::Result<()> {
        self.swarm.stream_index(stream)?;
        let mut swarm_guard = self.swarm.state.lock();
        let mut cs = self.state.lock();
        self.swarm.close_stream(&mut swarm_guard, self, &mut cs, stream);
        Ok(())
    }

    fn handle_message_end(&self) -> anyhow::Result<()> {
        if self.wake_now.swap(false, Ordering::AcqRel) {
            self.enqueue_now();
        }
        else {
            self.enqueue();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwarmOptions;
    use crate::integrity::Ed25519Signer;
    use crate::scheduler::test_support::RecordingWriter;
    use crate::scheduler::MockPeerTaskQueue;
    use crate::swarm::SwarmId;
    use bytes::Bytes;
    use mockall::predicate::eq;
    use rstest::rstest;

    fn swarm(stream_count: usize) -> Arc<Swarm> {
        let signer = Ed25519Signer::generate();
        let mut options = SwarmOptions::default_live();
        options.live_window = 256;
        options.chunks_per_signature = 4;
        options.stream_count = stream_count;
        Arc::new(Swarm::new(SwarmId::from(signer.public_key().to_vec()), options).unwrap())
    }

    fn queue() -> MockPeerTaskQueue {
        let mut queue = MockPeerTaskQueue::new();
        queue.expect_id().return_const(Bytes::from_static(b"peer-a"));
        queue.expect_enqueue().returning(|_| ());
        queue.expect_enqueue_now().returning(|_| ());
        queue.expect_remove_runner().returning(|_| ());
        queue
    }

    fn setup(queue: MockPeerTaskQueue) -> (Arc<PeerSwarmScheduler>, Arc<dyn ChannelScheduler>, Arc<parking_lot::Mutex<Vec<Message>>>) {
        let scheduler = Arc::new(PeerSwarmScheduler::new(swarm(4), SchedulerConfig::default_live()));
        let (writer, sent) = RecordingWriter::new(1500);
        let channel = scheduler.clone().channel_scheduler(Arc::new(queue), Box::new(writer));
        (scheduler, channel, sent)
    }

    fn requests(sent: &[Message]) -> Vec<Bin> {
        sent.iter()
            .filter_map(|m| match m {
                Message::Request(r) => Some(r.address),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_first_write_is_handshake() {
        let (_, channel, sent) = setup(queue());
        channel.write(1500).unwrap();

        let sent = sent.lock();
        assert!(matches!(sent.first(), Some(Message::Handshake(_))));
        assert!(requests(&sent).is_empty());
    }

    #[test]
    fn test_no_requests_before_handshake() {
        let (_, channel, sent) = setup(queue());
        channel.handle_have(Bin(3)).unwrap();
        channel.write(1500).unwrap();
        assert!(requests(&sent.lock()).is_empty());
    }

    #[test]
    fn test_requests_newest_chunk_first() {
        let (_, channel, sent) = setup(queue());
        channel.handle_handshake(256).unwrap();
        channel.handle_have(Bin(3)).unwrap();
        channel.write(1500).unwrap();

        // nothing received yet: start with the newest chunk the peer has
        assert_eq!(requests(&sent.lock()), vec![Bin(6)]);

        sent.lock().clear();
        channel.write(1500).unwrap();
        assert!(requests(&sent.lock()).is_empty());
    }

    #[test]
    fn test_timed_out_request_is_cancelled() {
        let (scheduler, channel, sent) = setup(queue());
        channel.handle_handshake(256).unwrap();
        channel.handle_have(Bin(3)).unwrap();
        channel.write(1500).unwrap();
        sent.lock().clear();

        scheduler.run(Instant::now() + Duration::from_secs(2));
        channel.write(1500).unwrap();

        let sent = sent.lock();
        assert!(sent.contains(&Message::Cancel(Bin(6))));
        // the bin is free to be requested again
        assert_eq!(requests(&sent), vec![Bin(6)]);
    }

    #[test]
    fn test_ping_pong() {
        let (_, channel, sent) = setup(queue());
        channel.handle_ping(77).unwrap();
        channel.write(1500).unwrap();
        assert!(sent.lock().contains(&Message::Pong(Pong { nonce: 77, delay: 0 })));
    }

    #[test]
    fn test_request_is_queued_with_low_priority() {
        let mut queue = queue();
        queue.expect_push_data()
            .withf(|_, bin, _, priority| *bin == Bin(4) && *priority == PeerPriority::Low)
            .times(1)
            .returning(|_, _, _, _| ());
        let (_, channel, _) = setup(queue);

        channel.handle_handshake(256).unwrap();
        channel.handle_request(Bin(4), Timestamp::now()).unwrap();
    }

    #[test]
    fn test_cancel_removes_queued_data() {
        let mut queue = queue();
        queue.expect_remove_data()
            .with(mockall::predicate::always(), eq(Bin(4)), eq(PeerPriority::Low))
            .times(1)
            .returning(|_, _, _| ());
        let (_, channel, _) = setup(queue);
        channel.handle_cancel(Bin(4)).unwrap();
    }

    #[rstest]
    #[case::request(|c: &dyn ChannelScheduler| c.handle_stream_request(4, Bin(0)))]
    #[case::cancel(|c: &dyn ChannelScheduler| c.handle_stream_cancel(4))]
    #[case::open(|c: &dyn ChannelScheduler| c.handle_stream_open(9, Bin(0)))]
    #[case::close(|c: &dyn ChannelScheduler| c.handle_stream_close(100))]
    fn test_stream_out_of_range(#[case] f: fn(&dyn ChannelScheduler) -> anyhow::Result<()>) {
        let (_, channel, _) = setup(queue());
        assert!(f(channel.as_ref()).is_err());
    }

    #[test]
    fn test_stream_open_sets_source() {
        let (scheduler, channel, _) = setup(queue());
        channel.handle_handshake(256).unwrap();
        channel.handle_stream_open(1, Bin(2)).unwrap();

        let state = scheduler.state.lock();
        let source = state.streams[1].source.as_ref().unwrap();
        assert_eq!(source.peer, Bytes::from_static(b"peer-a"));
        assert_eq!(source.start_bin, Bin(2));
        drop(state);

        channel.handle_stream_close(1).unwrap();
        assert!(scheduler.state.lock().streams[1].source.is_none());
    }

    #[test]
    fn test_subscribed_chunks_are_not_requested() {
        let (_, channel, sent) = setup(queue());
        channel.handle_handshake(256).unwrap();
        channel.handle_stream_open(3, Bin(6)).unwrap();
        channel.handle_have(Bin(6)).unwrap();
        channel.write(1500).unwrap();
        assert!(requests(&sent.lock()).is_empty());
    }

    #[test]
    fn test_consume_announces_to_channels() {
        let (scheduler, channel, sent) = setup(queue());
        channel.handle_handshake(256).unwrap();
        scheduler.consume(&Chunk { bin: Bin(0), data: Bytes::from(vec![0u8; 1024]) });
        channel.write(1500).unwrap();
        assert!(sent.lock().contains(&Message::Have(Bin(0))));
    }

    #[test]
    fn test_missing_handshake_triggers_restart() {
        let (scheduler, channel, sent) = setup(queue());
        channel.write(1500).unwrap();
        scheduler.run(Instant::now() + Duration::from_secs(2));
        channel.write(1500).unwrap();
        assert!(sent.lock().contains(&Message::Restart));
    }

    #[test]
    fn test_close_channel_removes_runner() {
        let mut queue = MockPeerTaskQueue::new();
        queue.expect_id().return_const(Bytes::from_static(b"peer-a"));
        queue.expect_enqueue().returning(|_| ());
        queue.expect_remove_runner().times(1).returning(|_| ());
        let (scheduler, _, _) = setup(queue);

        scheduler.close_channel(&Bytes::from_static(b"peer-a"));
        assert!(scheduler.state.lock().channels.is_empty());
    }
}
