//! A remote endpoint and the write loop that feeds its connection.
//!
//! The channel schedulers of all swarms shared with a peer put their work into the peer's
//!  queues via [PeerTaskQueue]. A dedicated thread drains the queues whenever the shared ticker
//!  ticks or a scheduler asks to be run now: first the schedulers that have messages to send,
//!  then the pushed chunks, subscribed ones before requested ones. Frames are collected into
//!  datagrams of at most the connection's MTU.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use binmap::Bin;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::codec::Timestamp;
use crate::scheduler::{PeerPriority, PeerTaskQueue, PeerTaskRunner, WriteError};
use crate::ticker::TickSubscriber;
use crate::util::sma::Sma;

pub type PeerId = Bytes;

/// An established connection to a peer. Frames are appended with `write` and sent as one
///  datagram by `flush`.
#[cfg_attr(test, automock)]
pub trait Conn: Send + Sync {
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn flush(&self) -> io::Result<()>;
    fn close(&self) -> io::Result<()>;
    /// maximum size of a datagram
    fn mtu(&self) -> usize;
    /// relative share of the bandwidth of the underlying link
    fn set_qos_weight(&self, weight: u64);
}

/// frames smaller than this are not worth starting before a datagram is sent
const MIN_FRAME_BUDGET: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub bytes: u64,
    /// bytes per second
    pub rate: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerMetricsSnapshot {
    pub read: TransferSnapshot,
    pub write: TransferSnapshot,
}

struct TransferMetrics {
    bytes: u64,
    rate: Sma,
}

impl TransferMetrics {
    fn new() -> TransferMetrics {
        TransferMetrics {
            bytes: 0,
            rate: Sma::new(60, Duration::from_secs(1)),
        }
    }

    fn add(&mut self, n: u64, now: Instant) {
        self.bytes += n;
        self.rate.add_with_time(n, now);
    }

    fn snapshot(&mut self, now: Instant) -> TransferSnapshot {
        TransferSnapshot {
            bytes: self.bytes,
            rate: self.rate.rate(Duration::from_secs(1), now),
        }
    }
}

/// Chunk payload bytes exchanged with a peer, across all swarms
pub struct PeerMetrics {
    read: Mutex<TransferMetrics>,
    write: Mutex<TransferMetrics>,
}

impl PeerMetrics {
    pub fn new() -> PeerMetrics {
        PeerMetrics {
            read: Mutex::new(TransferMetrics::new()),
            write: Mutex::new(TransferMetrics::new()),
        }
    }

    pub fn add_read_bytes(&self, n: u64) {
        self.read.lock().add(n, Instant::now());
    }

    pub fn add_written_bytes(&self, n: u64) {
        self.write.lock().add(n, Instant::now());
    }

    pub fn read_rate(&self, now: Instant) -> u64 {
        self.read.lock().snapshot(now).rate
    }

    pub fn snapshot(&self, now: Instant) -> PeerMetricsSnapshot {
        PeerMetricsSnapshot {
            read: self.read.lock().snapshot(now),
            write: self.write.lock().snapshot(now),
        }
    }
}

impl Default for PeerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

struct DataTask {
    runner: Arc<dyn PeerTaskRunner>,
    bin: Bin,
    timestamp: Timestamp,
}

#[derive(Default)]
struct PeerState {
    runners: VecDeque<Arc<dyn PeerTaskRunner>>,
    runner_ids: FxHashSet<u64>,
    high: VecDeque<DataTask>,
    low: VecDeque<DataTask>,
    ticked: bool,
    run_now: bool,
    done: bool,
}

impl PeerState {
    fn data(&mut self, priority: PeerPriority) -> &mut VecDeque<DataTask> {
        match priority {
            PeerPriority::High => &mut self.high,
            PeerPriority::Low => &mut self.low,
        }
    }

    fn pop_data(&mut self) -> Option<(DataTask, PeerPriority)> {
        if let Some(task) = self.high.pop_front() {
            return Some((task, PeerPriority::High));
        }
        self.low.pop_front().map(|task| (task, PeerPriority::Low))
    }
}

pub struct Peer {
    id: PeerId,
    conn: Arc<dyn Conn>,
    metrics: Arc<PeerMetrics>,
    state: Mutex<PeerState>,
    ready: Condvar,
}

impl Peer {
    pub fn new(id: PeerId, conn: Arc<dyn Conn>) -> Peer {
        Peer {
            id,
            conn,
            metrics: Arc::new(PeerMetrics::new()),
            state: Mutex::new(PeerState::default()),
            ready: Condvar::new(),
        }
    }

    /// Creates the peer and starts its write loop thread
    pub fn start(id: PeerId, conn: Arc<dyn Conn>) -> io::Result<Arc<Peer>> {
        let peer = Arc::new(Peer::new(id, conn));
        let p = peer.clone();
        thread::Builder::new()
            .name(format!("peer-{}", peer.id.escape_ascii()))
            .spawn(move || p.write_loop())?;
        Ok(peer)
    }

    pub fn conn(&self) -> &Arc<dyn Conn> {
        &self.conn
    }

    pub fn metrics(&self) -> &Arc<PeerMetrics> {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().done
    }

    /// Stops the write loop, drops all queued work and closes the connection
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            state.runners.clear();
            state.runner_ids.clear();
            state.high.clear();
            state.low.clear();
            self.ready.notify_all();
        }

        debug!("closing peer {}", self.id.escape_ascii());
        if let Err(e) = self.conn.close() {
            debug!("error closing connection to {}: {}", self.id.escape_ascii(), e);
        }
    }

    fn write_loop(&self) {
        debug!("starting write loop for {}", self.id.escape_ascii());
        loop {
            {
                let mut state = self.state.lock();
                while !state.done && !state.ticked && !state.run_now {
                    self.ready.wait(&mut state);
                }
                if state.done {
                    break;
                }
                state.ticked = false;
                state.run_now = false;
            }

            if let Err(e) = self.write_pending() {
                warn!("writing to {} failed, closing: {}", self.id.escape_ascii(), e);
                self.close();
                break;
            }
        }
        debug!("write loop for {} finished", self.id.escape_ascii());
    }

    /// Runs the enqueued schedulers, then writes queued chunks until the queues are empty
    fn write_pending(&self) -> Result<(), WriteError> {
        let mtu = self.conn.mtu();
        let mut used = 0;

        let runners = {
            let mut state = self.state.lock();
            state.runner_ids.clear();
            std::mem::take(&mut state.runners)
        };
        for runner in runners {
            loop {
                match runner.write(mtu.saturating_sub(used)) {
                    Ok(n) => {
                        used = self.after_write(mtu, used + n)?;
                        break;
                    }
                    Err(e) if e.is_not_enough_space() && used > 0 => used = self.send(used)?,
                    Err(e) => return Err(e),
                }
            }
        }

        loop {
            let Some((task, priority)) = self.state.lock().pop_data() else {
                break;
            };
            match task.runner.write_data(mtu.saturating_sub(used), task.bin, task.timestamp, priority) {
                Ok(n) => used = self.after_write(mtu, used + n)?,
                // the remainder was pushed back to the front of the queue
                Err(e) if e.is_not_enough_space() && used > 0 => used = self.send(used)?,
                Err(e) if e.is_not_enough_space() => {
                    warn!("chunk {} does not fit into a datagram to {}", task.bin, self.id.escape_ascii());
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        self.send(used)?;
        Ok(())
    }

    /// returns the bytes used in the current datagram, sending it if it is (almost) full
    fn after_write(&self, mtu: usize, used: usize) -> io::Result<usize> {
        if mtu.saturating_sub(used) < MIN_FRAME_BUDGET {
            return self.send(used);
        }
        Ok(used)
    }

    fn send(&self, used: usize) -> io::Result<usize> {
        if used > 0 {
            trace!("sending {} bytes to {}", used, self.id.escape_ascii());
            self.conn.flush()?;
        }
        Ok(0)
    }
}

impl PeerTaskQueue for Peer {
    fn id(&self) -> PeerId {
        self.id.clone()
    }

    fn enqueue(&self, runner: Arc<dyn PeerTaskRunner>) {
        let mut state = self.state.lock();
        if !state.done && state.runner_ids.insert(runner.runner_id()) {
            state.runners.push_back(runner);
        }
    }

    fn enqueue_now(&self, runner: Arc<dyn PeerTaskRunner>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        if state.runner_ids.insert(runner.runner_id()) {
            state.runners.push_back(runner);
        }
        state.run_now = true;
        self.ready.notify_one();
    }

    fn push_data(&self, runner: Arc<dyn PeerTaskRunner>, bin: Bin, timestamp: Timestamp, priority: PeerPriority) {
        let mut state = self.state.lock();
        if !state.done {
            state.data(priority).push_back(DataTask { runner, bin, timestamp });
        }
    }

    fn push_front_data(&self, runner: Arc<dyn PeerTaskRunner>, bin: Bin, timestamp: Timestamp, priority: PeerPriority) {
        let mut state = self.state.lock();
        if !state.done {
            state.data(priority).push_front(DataTask { runner, bin, timestamp });
        }
    }

    fn remove_data(&self, runner_id: u64, bin: Bin, priority: PeerPriority) {
        self.state.lock().data(priority)
            .retain(|t| t.runner.runner_id() != runner_id || !bin.contains(t.bin));
    }

    fn remove_runner(&self, runner_id: u64) {
        let mut state = self.state.lock();
        state.runners.retain(|r| r.runner_id() != runner_id);
        state.runner_ids.remove(&runner_id);
        state.high.retain(|t| t.runner.runner_id() != runner_id);
        state.low.retain(|t| t.runner.runner_id() != runner_id);
    }
}

impl TickSubscriber for Peer {
    fn tick(&self, _now: Instant) {
        let mut state = self.state.lock();
        state.ticked = true;
        self.ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use rstest::rstest;

    /// Records what the write loop asks of it. Data writes use `chunk_len` bytes each.
    struct TestRunner {
        id: u64,
        chunk_len: usize,
        calls: Mutex<Vec<String>>,
    }

    impl TestRunner {
        fn new(id: u64, chunk_len: usize) -> Arc<TestRunner> {
            Arc::new(TestRunner { id, chunk_len, calls: Mutex::new(Vec::new()) })
        }
    }

    impl PeerTaskRunner for TestRunner {
        fn runner_id(&self) -> u64 {
            self.id
        }

        fn write(&self, max_bytes: usize) -> Result<usize, WriteError> {
            self.calls.lock().push(format!("write {}", max_bytes));
            Ok(10)
        }

        fn write_data(&self, max_bytes: usize, bin: Bin, _timestamp: Timestamp, priority: PeerPriority) -> Result<usize, WriteError> {
            if max_bytes < self.chunk_len {
                return Err(CodecError::NotEnoughSpace.into());
            }
            self.calls.lock().push(format!("data {} {}", bin, priority));
            Ok(self.chunk_len)
        }
    }

    fn conn(mtu: usize, flushes: usize) -> Arc<MockConn> {
        let mut conn = MockConn::new();
        conn.expect_mtu().return_const(mtu);
        conn.expect_flush().times(flushes).returning(|| Ok(()));
        conn.expect_close().returning(|| Ok(()));
        Arc::new(conn)
    }

    #[test]
    fn test_enqueue_deduplicates() {
        let peer = Peer::new(Bytes::from_static(b"a"), conn(1500, 1));
        let runner = TestRunner::new(1, 100);
        peer.enqueue(runner.clone());
        peer.enqueue(runner.clone());
        peer.enqueue_now(runner.clone());

        peer.write_pending().unwrap();
        assert_eq!(*runner.calls.lock(), vec!["write 1500".to_string()]);
    }

    #[test]
    fn test_high_priority_first() {
        let peer = Peer::new(Bytes::from_static(b"a"), conn(1500, 1));
        let runner = TestRunner::new(1, 100);
        peer.push_data(runner.clone(), Bin(0), Timestamp::from_millis(0), PeerPriority::Low);
        peer.push_data(runner.clone(), Bin(2), Timestamp::from_millis(0), PeerPriority::High);
        peer.push_front_data(runner.clone(), Bin(4), Timestamp::from_millis(0), PeerPriority::High);

        peer.write_pending().unwrap();
        assert_eq!(*runner.calls.lock(), vec!["data 4 high", "data 2 high", "data 0 low"]);
    }

    #[rstest]
    #[case::one_datagram(3, 1)]
    #[case::two_datagrams(6, 2)]
    #[case::exactly_full(5, 1)]
    fn test_datagrams_bounded_by_mtu(#[case] chunks: u64, #[case] datagrams: usize) {
        let peer = Peer::new(Bytes::from_static(b"a"), conn(1000, datagrams));
        let runner = TestRunner::new(1, 200);
        for i in 0..chunks {
            peer.push_data(runner.clone(), Bin(i * 2), Timestamp::from_millis(0), PeerPriority::Low);
        }
        peer.write_pending().unwrap();
        assert_eq!(runner.calls.lock().len(), chunks as usize);
    }

    #[test]
    fn test_chunk_larger_than_mtu_stops() {
        let peer = Peer::new(Bytes::from_static(b"a"), conn(100, 0));
        let runner = TestRunner::new(1, 200);
        peer.push_data(runner.clone(), Bin(0), Timestamp::from_millis(0), PeerPriority::Low);
        peer.push_data(runner.clone(), Bin(2), Timestamp::from_millis(0), PeerPriority::Low);

        peer.write_pending().unwrap();
        assert!(runner.calls.lock().is_empty());
    }

    #[test]
    fn test_remove_runner_and_data() {
        let peer = Peer::new(Bytes::from_static(b"a"), conn(1500, 0));
        let a = TestRunner::new(1, 100);
        let b = TestRunner::new(2, 100);
        peer.enqueue(a.clone());
        peer.push_data(a.clone(), Bin(0), Timestamp::from_millis(0), PeerPriority::High);
        peer.push_data(b.clone(), Bin(0), Timestamp::from_millis(0), PeerPriority::Low);
        peer.push_data(b.clone(), Bin(2), Timestamp::from_millis(0), PeerPriority::Low);

        peer.remove_runner(1);
        peer.remove_data(2, Bin(1), PeerPriority::Low);
        peer.write_pending().unwrap();

        assert!(a.calls.lock().is_empty());
        assert!(b.calls.lock().is_empty());
    }

    #[test]
    fn test_closed_peer_ignores_work() {
        let peer = Peer::new(Bytes::from_static(b"a"), conn(1500, 0));
        peer.close();
        assert!(peer.is_closed());

        let runner = TestRunner::new(1, 100);
        peer.enqueue_now(runner.clone());
        peer.push_data(runner.clone(), Bin(0), Timestamp::from_millis(0), PeerPriority::High);
        peer.write_pending().unwrap();
        assert!(runner.calls.lock().is_empty());
    }

    #[test]
    fn test_write_loop_runs_on_tick() {
        let mut conn = MockConn::new();
        conn.expect_mtu().return_const(1500usize);
        conn.expect_flush().returning(|| Ok(()));
        conn.expect_close().returning(|| Ok(()));
        let peer = Peer::start(Bytes::from_static(b"a"), Arc::new(conn)).unwrap();

        let runner = TestRunner::new(1, 100);
        peer.enqueue(runner.clone());
        peer.tick(Instant::now());

        let deadline = Instant::now() + Duration::from_secs(5);
        while runner.calls.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(runner.calls.lock().len(), 1);
        peer.close();
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = PeerMetrics::new();
        metrics.add_read_bytes(600);
        metrics.add_written_bytes(100);
        let snapshot = metrics.snapshot(Instant::now());
        assert_eq!(snapshot.read.bytes, 600);
        assert_eq!(snapshot.write.bytes, 100);
        assert!(snapshot.read.rate > 0);
    }
}
