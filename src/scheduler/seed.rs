use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::bail;
use binmap::{Bin, BinCursor, BinMap};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};

use super::streams::StreamLayout;
use super::timing::TimeSet;
use super::{next_runner_id, write_chunk_data, write_extra_messages, write_map_bins, ChannelFlags, ChannelMessageWriter, ChannelScheduler, PeerPriority, PeerTaskQueue, PeerTaskRunner, SwarmScheduler, WriteError};
use crate::codec::{CodecError, Message, Pong, StreamAddress, Timestamp};
use crate::config::SchedulerConfig;
use crate::peer::PeerId;
use crate::safe_converter::PrecheckedCast;
use crate::store::Chunk;
use crate::swarm::Swarm;
use crate::util::welford::Welford;

/// Swarm scheduler of the publisher. It never requests anything. Its streams are partitioned
///  over the connected peers, each stream is pushed to one of them, and it serves whatever
///  else is requested.
pub struct SeedSwarmScheduler {
    swarm: Arc<Swarm>,
    config: SchedulerConfig,
    layout: StreamLayout,
    live_window: u64,
    state: Mutex<SeedSwarmState>,
}

struct SeedSwarmState {
    /// when a chunk was published
    bin_times: TimeSet,
    have_bins: BinMap,
    have_bin_max: Bin,
    channels: FxHashMap<PeerId, Arc<SeedChannelScheduler>>,
    /// in the order the channels were opened, stream `i` goes to channel `i % len`
    channel_order: Vec<PeerId>,
    stream_owners: Vec<Option<PeerId>>,
    next_gc: Instant,
    next_stream_check: Instant,
}

impl SeedSwarmScheduler {
    pub fn new(swarm: Arc<Swarm>, config: SchedulerConfig) -> SeedSwarmScheduler {
        let layout = StreamLayout::new(swarm.options().stream_count.prechecked_cast());
        let live_window = swarm.options().live_window as u64 * 2;
        let now = Instant::now();
        let have_bins = swarm.buffer().bins();
        let last = have_bins.find_last_filled();

        let state = SeedSwarmState {
            bin_times: TimeSet::new(),
            have_bin_max: if last.is_none() { Bin(0) } else { last },
            have_bins,
            channels: FxHashMap::default(),
            channel_order: Vec::new(),
            stream_owners: vec![None; layout.stream_count() as usize],
            next_gc: now + config.gc_interval,
            next_stream_check: now + config.stream_check_interval,
        };

        SeedSwarmScheduler {
            swarm,
            config,
            layout,
            live_window,
            state: Mutex::new(state),
        }
    }

    fn label(&self) -> &str {
        &self.swarm.options().label
    }

    fn stream_index(&self, stream: u16) -> anyhow::Result<usize> {
        if stream >= self.layout.stream_count() {
            bail!("stream {} out of range, the swarm has {} streams", stream, self.layout.stream_count());
        }
        Ok(stream as usize)
    }

    fn initial_messages(&self) -> Vec<Message> {
        vec![Message::Handshake(self.swarm.handshake())]
    }

    /// Moves every stream whose owner changed to its new owner, telling the previous owner
    ///  that the stream is closed
    fn assign_streams(&self, state: &mut SeedSwarmState) {
        let n = state.channel_order.len();
        let tail = self.swarm.buffer().tail();
        let start = if tail.is_none() { Bin(0) } else { tail };

        for s in 0..self.layout.stream_count() {
            let i = s as usize;
            let owner = (n > 0).then(|| state.channel_order[i % n].clone());
            if owner == state.stream_owners[i] {
                continue;
            }

            if let Some(previous) = state.stream_owners[i].take() {
                if let Some(c) = state.channels.get(&previous) {
                    let mut cs = c.state.lock();
                    cs.peer_request_streams[i] = Bin::NONE;
                    cs.pending_closes.push(s);
                    drop(cs);
                    c.enqueue();
                }
            }

            if let Some(c) = owner.as_ref().and_then(|o| state.channels.get(o)) {
                let mut cs = c.state.lock();
                self.open_stream(&state.have_bins, c, &mut cs, s, start);
                drop(cs);
                c.enqueue();
            }
            state.stream_owners[i] = owner;
        }
    }

    /// Pushes `stream` to channel `c` from `start` on, starting with what we already have
    fn open_stream(&self, have_bins: &BinMap, c: &Arc<SeedChannelScheduler>, cs: &mut SeedChannelState, stream: u16, start: Bin) {
        let tail = self.swarm.buffer().tail();
        let start = if !tail.is_none() && start < tail { tail } else { start };
        let start = self.layout.first_stream_bin(stream, start);
        cs.peer_request_streams[stream as usize] = start;

        let runner: Arc<dyn PeerTaskRunner> = c.clone();
        for interval in have_bins.iterate_filled().intervals_after(start) {
            for b in self.layout.stream_bins(stream, interval.base_left(), interval.base_right()) {
                if b >= start {
                    c.queue.push_data(runner.clone(), b, Timestamp::now(), PeerPriority::High);
                }
            }
        }

        cs.pending_opens.push(StreamAddress { stream, address: start });
        debug!("{}: stream {} opened for {} at {}", self.label(), stream, c.peer_id.escape_ascii(), start);
    }

    fn log_stream_lags(&self, state: &SeedSwarmState) {
        let mut lags = vec![Welford::new(); self.layout.stream_count() as usize];
        for c in state.channels.values() {
            let mut cs = c.state.lock();
            for (lag, channel_lag) in lags.iter_mut().zip(cs.stream_have_lag.iter_mut()) {
                *lag = Welford::merge([&*lag, &*channel_lag]);
                channel_lag.reset();
            }
        }

        for (stream, lag) in lags.iter().enumerate().filter(|(_, l)| l.count() > 0) {
            debug!(
                "{}: stream {} announced after {:?} (+/- {:?}) on average",
                self.label(),
                stream,
                Duration::from_nanos(lag.mean() as u64),
                Duration::from_nanos(lag.std_dev() as u64),
            );
        }
    }
}

impl SwarmScheduler for SeedSwarmScheduler {
    fn run(&self, now: Instant) {
        let mut state = self.state.lock();

        if now >= state.next_gc {
            if self.live_window < state.have_bin_max.0 {
                let threshold = Bin(state.have_bin_max.0 - self.live_window);
                state.bin_times.prune(threshold);
            }
            state.next_gc = now + self.config.gc_interval;
        }
        if now >= state.next_stream_check {
            self.log_stream_lags(&state);
            state.next_stream_check = now + self.config.stream_check_interval;
        }
    }

    fn consume(&self, chunk: &Chunk) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.have_bins.set(chunk.bin);
        let mut hb = state.have_bins.cover(chunk.bin);
        if hb.is_all() {
            hb = state.have_bins.root_bin();
        }

        for c in state.channels.values() {
            let mut cs = c.state.lock();
            cs.have_bins.set(hb);

            let runner: Arc<dyn PeerTaskRunner> = c.clone();
            let mut b = chunk.bin.base_left();
            while b <= chunk.bin.base_right() {
                let start = cs.peer_request_streams[self.layout.bin_stream(b) as usize];
                if !start.is_none() && start <= b {
                    c.queue.push_data(runner.clone(), b, Timestamp::now(), PeerPriority::High);
                }
                b = b + 2;
            }
            drop(cs);
            c.enqueue();
        }

        state.bin_times.set_first(chunk.bin, now);
        let br = chunk.bin.base_right();
        if br > state.have_bin_max {
            state.have_bin_max = br;
        }
    }

    fn channel_scheduler(self: Arc<Self>, queue: Arc<dyn PeerTaskQueue>, writer: Box<dyn ChannelMessageWriter>) -> Arc<dyn ChannelScheduler> {
        let peer_id = queue.id();
        let stream_count = self.layout.stream_count() as usize;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let channel = Arc::new_cyclic(|this| SeedChannelScheduler {
            runner_id: next_runner_id(),
            peer_id: peer_id.clone(),
            queue: queue.clone(),
            swarm: self.clone(),
            this: this.clone(),
            wake_now: AtomicBool::new(false),
            state: Mutex::new(SeedChannelState {
                writer,
                flags: ChannelFlags::empty(),
                have_bins: state.have_bins.clone(),
                peer_have_bins: BinMap::new(),
                stream_have_lag: vec![Welford::new(); stream_count],
                peer_request_streams: vec![Bin::NONE; stream_count],
                pending_opens: Vec::new(),
                pending_closes: Vec::new(),
                extra_messages: self.initial_messages(),
            }),
        });

        if state.channels.insert(peer_id.clone(), channel.clone()).is_none() {
            state.channel_order.push(peer_id);
        }
        self.assign_streams(state);
        drop(guard);

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
        state.channel_order.retain(|p| p != peer);
        for owner in state.stream_owners.iter_mut() {
            if owner.as_ref() == Some(peer) {
                *owner = None;
            }
        }
        self.assign_streams(state);
        drop(guard);

        debug!("{}: channel to {} closed", self.label(), peer.escape_ascii());
        c.queue.remove_runner(c.runner_id);
    }

    fn reset(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.bin_times = TimeSet::new();
        state.have_bins = BinMap::new();
        state.have_bin_max = Bin(0);

        for c in state.channels.values() {
            let mut cs = c.state.lock();
            cs.have_bins = BinMap::new();
            cs.peer_have_bins = BinMap::new();
            cs.flags = ChannelFlags::empty();
            cs.extra_messages = self.initial_messages();
            // subscriptions survive, the stream just starts over
            for start in cs.peer_request_streams.iter_mut().filter(|s| !s.is_none()) {
                *start = Bin(0);
            }
            drop(cs);
            c.enqueue_now();
        }
        info!("{}: scheduler reset", self.label());
    }
}

/// The scheduler of one peer's channel in a [SeedSwarmScheduler]
pub struct SeedChannelScheduler {
    runner_id: u64,
    peer_id: PeerId,
    queue: Arc<dyn PeerTaskQueue>,
    swarm: Arc<SeedSwarmScheduler>,
    this: Weak<SeedChannelScheduler>,
    wake_now: AtomicBool,
    state: Mutex<SeedChannelState>,
}

struct SeedChannelState {
    writer: Box<dyn ChannelMessageWriter>,
    flags: ChannelFlags,
    have_bins: BinMap,
    peer_have_bins: BinMap,
    stream_have_lag: Vec<Welford>,
    /// where pushing each stream starts, [Bin::NONE] if the peer does not receive it from us
    peer_request_streams: Vec<Bin>,
    pending_opens: Vec<StreamAddress>,
    pending_closes: Vec<u16>,
    extra_messages: Vec<Message>,
}

impl SeedChannelScheduler {
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

    fn write_messages(cs: &mut SeedChannelState) -> Result<(), CodecError> {
        write_extra_messages(&mut cs.extra_messages, cs.writer.as_mut())?;
        write_map_bins(&mut cs.have_bins, cs.writer.as_mut(), Message::Have)?;

        let mut written = 0;
        let result: Result<(), CodecError> = cs.pending_opens.iter()
            .try_for_each(|open| {
                cs.writer.write(&Message::StreamOpen(*open))?;
                written += 1;
                Ok(())
            });
        cs.pending_opens.drain(..written);
        result?;

        let mut written = 0;
        let result: Result<(), CodecError> = cs.pending_closes.iter()
            .try_for_each(|stream| {
                cs.writer.write(&Message::StreamClose(*stream))?;
                written += 1;
                Ok(())
            });
        cs.pending_closes.drain(..written);
        result
    }
}

impl PeerTaskRunner for SeedChannelScheduler {
    fn runner_id(&self) -> u64 {
        self.runner_id
    }

    fn write(&self, max_bytes: usize) -> Result<usize, WriteError> {
        let mut guard = self.state.lock();
        let cs = &mut *guard;
        cs.writer.resize(max_bytes);

        let incomplete = match Self::write_messages(cs) {
            Ok(()) => false,
            Err(CodecError::NotEnoughSpace) => true,
            Err(e) => return Err(e.into()),
        };

        let n = cs.writer.len();
        cs.writer.flush()?;
        drop(guard);
        if incomplete {
            self.enqueue();
        }
        Ok(n)
    }

    fn write_data(&self, max_bytes: usize, bin: Bin, timestamp: Timestamp, priority: PeerPriority) -> Result<usize, WriteError> {
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
            timestamp,
            priority,
        )
    }
}

impl ChannelScheduler for SeedChannelScheduler {
    fn handle_handshake(&self, _live_window: u32) -> anyhow::Result<()> {
        self.state.lock().flags.insert(ChannelFlags::HANDSHAKE_RECEIVED);
        debug!("{}: handshake from {}", self.swarm.label(), self.peer_id.escape_ascii());
        Ok(())
    }

    fn handle_restart(&self) -> anyhow::Result<()> {
        let state = self.swarm.state.lock();
        let mut cs = self.state.lock();
        cs.extra_messages.extend(self.swarm.initial_messages());
        cs.have_bins = state.have_bins.clone();
        Ok(())
    }

    fn handle_data(&self, bin: Bin, _timestamp: Timestamp, _valid: bool) -> anyhow::Result<()> {
        trace!("{}: ignoring data {} from {}", self.swarm.label(), bin, self.peer_id.escape_ascii());
        Ok(())
    }

    fn handle_ack(&self, _bin: Bin, _delay: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle_have(&self, bin: Bin) -> anyhow::Result<()> {
        let now = Instant::now();
        let state = self.swarm.state.lock();
        let mut cs = self.state.lock();

        let new_bins: Vec<Bin> = cs.peer_have_bins.iterate_empty_at(bin).bases().collect();
        for b in new_bins {
            if let Some((_, published)) = state.bin_times.get(b) {
                let stream = self.swarm.layout.bin_stream(b) as usize;
                cs.stream_have_lag[stream].update(now.saturating_duration_since(published).as_nanos() as f64);
            }
        }
        cs.peer_have_bins.set(bin);
        Ok(())
    }

    fn handle_request(&self, bin: Bin, timestamp: Timestamp) -> anyhow::Result<()> {
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
        Ok(())
    }

    fn handle_unchoke(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle_ping(&self, nonce: u64) -> anyhow::Result<()> {
        self.state.lock().extra_messages.push(Message::Pong(Pong { nonce, delay: 0 }));
        self.wake_now.store(true, Ordering::Release);
        Ok(())
    }

    fn handle_pong(&self, _nonce: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle_stream_request(&self, stream: u16, bin: Bin) -> anyhow::Result<()> {
        self.swarm.stream_index(stream)?;
        let Some(this) = self.this.upgrade() else {
            return Ok(());
        };

        let state = self.swarm.state.lock();
        let mut cs = self.state.lock();
        self.swarm.open_stream(&state.have_bins, &this, &mut cs, stream, bin);
        self.wake_now.store(true, Ordering::Release);
        Ok(())
    }

    fn handle_stream_cancel(&self, stream: u16) -> anyhow::Result<()> {
        let s = self.swarm.stream_index(stream)?;
        self.state.lock().peer_request_streams[s] = Bin::NONE;
        debug!("{}: {} cancelled stream {}", self.swarm.label(), self.peer_id.escape_ascii(), stream);
        Ok(())
    }

    fn handle_stream_open(&self, _stream: u16, _bin: Bin) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle_stream_close(&self, _stream: u16) -> anyhow::Result<()> {
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
    use crate::config::{SchedulingMethod, SwarmOptions};
    use crate::integrity::Ed25519Signer;
    use crate::scheduler::test_support::RecordingWriter;
    use crate::scheduler::MockPeerTaskQueue;
    use crate::swarm::SwarmId;
    use bytes::Bytes;

    fn scheduler() -> Arc<SeedSwarmScheduler> {
        let signer = Ed25519Signer::generate();
        let mut options = SwarmOptions::default_live();
        options.live_window = 256;
        options.chunks_per_signature = 4;
        options.stream_count = 4;
        options.scheduling_method = SchedulingMethod::Seed;
        let swarm = Swarm::new(SwarmId::from(signer.public_key().to_vec()), options).unwrap();
        Arc::new(SeedSwarmScheduler::new(Arc::new(swarm), SchedulerConfig::default_live()))
    }

    type Pushed = Arc<parking_lot::Mutex<Vec<(Bin, PeerPriority)>>>;

    fn queue(id: &'static [u8]) -> (MockPeerTaskQueue, Pushed) {
        let pushed: Pushed = Default::default();
        let mut queue = MockPeerTaskQueue::new();
        queue.expect_id().return_const(Bytes::from_static(id));
        queue.expect_enqueue().returning(|_| ());
        queue.expect_enqueue_now().returning(|_| ());
        queue.expect_remove_runner().returning(|_| ());
        let p = pushed.clone();
        queue.expect_push_data().returning(move |_, bin, _, priority| p.lock().push((bin, priority)));
        (queue, pushed)
    }

    fn connect(scheduler: &Arc<SeedSwarmScheduler>, id: &'static [u8]) -> (Arc<dyn ChannelScheduler>, Arc<parking_lot::Mutex<Vec<Message>>>, Pushed) {
        let (queue, pushed) = queue(id);
        let (writer, sent) = RecordingWriter::new(1500);
        let channel = scheduler.clone().channel_scheduler(Arc::new(queue), Box::new(writer));
        (channel, sent, pushed)
    }

    fn opened(sent: &[Message]) -> Vec<u16> {
        sent.iter()
            .filter_map(|m| match m {
                Message::StreamOpen(open) => Some(open.stream),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_peer_gets_all_streams() {
        let scheduler = scheduler();
        let (channel, sent, _) = connect(&scheduler, b"a");
        channel.write(1500).unwrap();

        let sent = sent.lock();
        assert!(matches!(sent[0], Message::Handshake(_)));
        assert!(!sent.contains(&Message::Choke));
        assert_eq!(opened(&sent), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_streams_are_partitioned() {
        let scheduler = scheduler();
        let (a, sent_a, _) = connect(&scheduler, b"a");
        a.write(1500).unwrap();
        let (b, sent_b, _) = connect(&scheduler, b"b");
        a.write(1500).unwrap();
        b.write(1500).unwrap();

        assert_eq!(opened(&sent_b.lock()), vec![1, 3]);
        let sent_a = sent_a.lock();
        assert!(sent_a.contains(&Message::StreamClose(1)));
        assert!(sent_a.contains(&Message::StreamClose(3)));
        assert!(!sent_a.contains(&Message::StreamClose(0)));
    }

    #[test]
    fn test_close_channel_reassigns_streams() {
        let scheduler = scheduler();
        let (a, sent_a, _) = connect(&scheduler, b"a");
        let _ = connect(&scheduler, b"b");
        a.write(1500).unwrap();
        sent_a.lock().clear();

        scheduler.close_channel(&Bytes::from_static(b"b"));
        a.write(1500).unwrap();
        assert_eq!(opened(&sent_a.lock()), vec![1, 3]);
    }

    #[test]
    fn test_consume_pushes_to_stream_owner() {
        let scheduler = scheduler();
        let (_, _, pushed_a) = connect(&scheduler, b"a");
        let (_, _, pushed_b) = connect(&scheduler, b"b");

        scheduler.consume(&Chunk { bin: Bin(0), data: Bytes::from(vec![0u8; 1024]) });
        scheduler.consume(&Chunk { bin: Bin(2), data: Bytes::from(vec![0u8; 1024]) });

        assert_eq!(*pushed_a.lock(), vec![(Bin(0), PeerPriority::High)]);
        assert_eq!(*pushed_b.lock(), vec![(Bin(2), PeerPriority::High)]);
    }

    #[test]
    fn test_stream_request_pushes_what_we_have() {
        let scheduler = scheduler();
        let (a, sent_a, pushed_a) = connect(&scheduler, b"a");
        let _ = connect(&scheduler, b"b");
        scheduler.consume(&Chunk { bin: Bin(2), data: Bytes::from(vec![0u8; 1024]) });
        assert!(pushed_a.lock().is_empty());

        a.handle_stream_request(1, Bin(0)).unwrap();
        assert_eq!(*pushed_a.lock(), vec![(Bin(2), PeerPriority::High)]);

        a.write(1500).unwrap();
        assert!(sent_a.lock().contains(&Message::StreamOpen(StreamAddress { stream: 1, address: Bin(2) })));
    }

    #[test]
    fn test_request_is_served() {
        let scheduler = scheduler();
        let (a, _, pushed_a) = connect(&scheduler, b"a");
        a.handle_request(Bin(8), Timestamp::now()).unwrap();
        assert_eq!(*pushed_a.lock(), vec![(Bin(8), PeerPriority::Low)]);
    }

    #[test]
    fn test_stream_out_of_range() {
        let scheduler = scheduler();
        let (a, _, _) = connect(&scheduler, b"a");
        assert!(a.handle_stream_request(4, Bin(0)).is_err());
        assert!(a.handle_stream_cancel(4).is_err());
    }
}
