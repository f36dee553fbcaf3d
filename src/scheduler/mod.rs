//! Decides what a node sends to each of its peers: requests for chunks it is missing, the
//!  chunks its peers requested or subscribed to, and the protocol's bookkeeping messages.
//!
//! A [SwarmScheduler] holds the state of one swarm (what we have, what we requested, stream
//!  subscriptions) and creates a [ChannelScheduler] per peer connected to the swarm. Channel
//!  schedulers are driven from two sides: the channel reader calls the `handle_*` functions
//!  for incoming messages, and the peer's write loop calls the [PeerTaskRunner] functions when
//!  the scheduler asked to be run via its [PeerTaskQueue].
//!
//! Lock order: swarm scheduler state before channel state, the peer's queue last.

mod peer;
mod seed;
mod streams;
mod timing;

pub use peer::{PeerChannelScheduler, PeerSwarmScheduler};
pub use seed::{SeedChannelScheduler, SeedSwarmScheduler};
pub use streams::{ReceivedChunks, StreamLayout};
pub use timing::{BinQueue, TimeSet};

use std::fmt::{Display, Formatter};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use binmap::{Bin, BinMap};
use bitflags::bitflags;
#[cfg(test)] use mockall::automock;
use tracing::debug;

use crate::codec::{CodecError, Data, Integrity, Message, SignedIntegrity, Timestamp, MESSAGE_TYPE_LEN};
use crate::config::{SchedulerConfig, SchedulingMethod};
use crate::integrity::{IntegrityError, IntegrityWriter};
use crate::peer::PeerId;
use crate::store::{Chunk, ChunkConsumer, DataWriter, StoreError};
use crate::swarm::Swarm;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerPriority {
    /// chunks of subscribed streams
    High,
    /// chunks that were requested individually
    Low,
}

impl Display for PeerPriority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerPriority::High => write!(f, "high"),
            PeerPriority::Low => write!(f, "low"),
        }
    }
}

static NEXT_RUNNER_ID: AtomicU64 = AtomicU64::new(1);

/// process wide unique id for a [PeerTaskRunner]
pub fn next_runner_id() -> u64 {
    NEXT_RUNNER_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WriteError {
    /// The frame is full: flush and retry, this is not a failure
    pub fn is_not_enough_space(&self) -> bool {
        matches!(self,
            WriteError::Codec(CodecError::NotEnoughSpace)
            | WriteError::Store(StoreError::Codec(CodecError::NotEnoughSpace))
            | WriteError::Integrity(IntegrityError::Codec(CodecError::NotEnoughSpace))
        )
    }
}

/// Something the peer's write loop runs when it was enqueued
pub trait PeerTaskRunner: Send + Sync {
    fn runner_id(&self) -> u64;

    /// Writes whatever is pending, at most `max_bytes`. Returns the number of bytes written.
    fn write(&self, max_bytes: usize) -> Result<usize, WriteError>;

    /// Writes the data at `bin` that was pushed via [PeerTaskQueue::push_data]
    fn write_data(&self, max_bytes: usize, bin: Bin, timestamp: Timestamp, priority: PeerPriority) -> Result<usize, WriteError>;
}

/// The part of a peer that schedulers see: the queues of its write loop
#[cfg_attr(test, automock)]
pub trait PeerTaskQueue: Send + Sync {
    fn id(&self) -> PeerId;

    /// run the runner on the next tick
    fn enqueue(&self, runner: Arc<dyn PeerTaskRunner>);
    /// run the runner as soon as possible
    fn enqueue_now(&self, runner: Arc<dyn PeerTaskRunner>);

    fn push_data(&self, runner: Arc<dyn PeerTaskRunner>, bin: Bin, timestamp: Timestamp, priority: PeerPriority);
    /// re-queues (the remainder of) a data write that did not fit, ahead of everything else
    fn push_front_data(&self, runner: Arc<dyn PeerTaskRunner>, bin: Bin, timestamp: Timestamp, priority: PeerPriority);
    fn remove_data(&self, runner_id: u64, bin: Bin, priority: PeerPriority);

    fn remove_runner(&self, runner_id: u64);
}

/// The framing writer of a channel as the scheduler sees it
pub trait ChannelMessageWriter: Send {
    /// limits the frame to `max_bytes` including the channel header
    fn resize(&mut self, max_bytes: usize);
    /// bytes in the pending frame, including the channel header, 0 if nothing was written
    fn len(&self) -> usize;
    fn available(&self) -> usize;
    fn write(&mut self, msg: &Message) -> Result<usize, CodecError>;
    /// discards the pending frame
    fn reset(&mut self);
    fn flush(&mut self) -> io::Result<()>;
}

/// Lets integrity verifiers and the store write into a [ChannelMessageWriter]
pub struct MessageWire<'a>(pub &'a mut dyn ChannelMessageWriter);

impl IntegrityWriter for MessageWire<'_> {
    fn write_integrity(&mut self, msg: Integrity) -> Result<usize, CodecError> {
        self.0.write(&Message::Integrity(msg))
    }

    fn write_signed_integrity(&mut self, msg: SignedIntegrity) -> Result<usize, CodecError> {
        self.0.write(&Message::SignedIntegrity(msg))
    }
}

impl DataWriter for MessageWire<'_> {
    fn write_data(&mut self, msg: Data) -> Result<usize, CodecError> {
        self.0.write(&Message::Data(msg))
    }
}

/// The per-channel half of a scheduler: message handlers called by the channel reader
pub trait ChannelScheduler: PeerTaskRunner {
    /// the peer's handshake was validated, `live_window` is its live window in chunks
    fn handle_handshake(&self, live_window: u32) -> anyhow::Result<()>;
    fn handle_restart(&self) -> anyhow::Result<()>;
    fn handle_data(&self, bin: Bin, timestamp: Timestamp, valid: bool) -> anyhow::Result<()>;
    fn handle_ack(&self, bin: Bin, delay: Duration) -> anyhow::Result<()>;
    fn handle_have(&self, bin: Bin) -> anyhow::Result<()>;
    fn handle_request(&self, bin: Bin, timestamp: Timestamp) -> anyhow::Result<()>;
    fn handle_cancel(&self, bin: Bin) -> anyhow::Result<()>;
    fn handle_choke(&self) -> anyhow::Result<()>;
    fn handle_unchoke(&self) -> anyhow::Result<()>;
    fn handle_ping(&self, nonce: u64) -> anyhow::Result<()>;
    fn handle_pong(&self, nonce: u64) -> anyhow::Result<()>;
    fn handle_stream_request(&self, stream: u16, bin: Bin) -> anyhow::Result<()>;
    fn handle_stream_cancel(&self, stream: u16) -> anyhow::Result<()>;
    fn handle_stream_open(&self, stream: u16, bin: Bin) -> anyhow::Result<()>;
    fn handle_stream_close(&self, stream: u16) -> anyhow::Result<()>;
    /// all messages of a datagram were handled
    fn handle_message_end(&self) -> anyhow::Result<()>;
}

pub trait SwarmScheduler: Send + Sync {
    /// periodic housekeeping, called by the ticker
    fn run(&self, now: Instant);

    /// a verified chunk arrived (or was published locally)
    fn consume(&self, chunk: &Chunk);

    fn channel_scheduler(self: Arc<Self>, peer: Arc<dyn PeerTaskQueue>, writer: Box<dyn ChannelMessageWriter>) -> Arc<dyn ChannelScheduler>;

    fn close_channel(&self, peer: &PeerId);

    /// the stream was restarted: forget everything about it and handshake again
    fn reset(&self);
}

pub fn new_swarm_scheduler(swarm: Arc<Swarm>, config: &SchedulerConfig) -> Arc<dyn SwarmScheduler> {
    match swarm.options().scheduling_method {
        SchedulingMethod::Peer => Arc::new(PeerSwarmScheduler::new(swarm, config.clone())),
        SchedulingMethod::Seed => Arc::new(SeedSwarmScheduler::new(swarm, config.clone())),
    }
}

/// Subscribes a scheduler to a swarm's [crate::store::PubSub]
pub struct SchedulerConsumer(pub Arc<dyn SwarmScheduler>);

impl ChunkConsumer for SchedulerConsumer {
    fn consume(&self, chunk: &Chunk) {
        self.0.consume(chunk);
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    struct ChannelFlags: u8 {
        const HANDSHAKE_RECEIVED = 0x01;
        /// the peer does not serve our requests
        const CHOKED = 0x02;
    }
}

/// upper bound for a data message's type, address and timestamp
const DATA_HEADER_MAX_LEN: usize = MESSAGE_TYPE_LEN + 2 * 10;

/// Writes the integrity messages and data for `bin` into `writer`. If the bin's chunks do not
///  fit into `max_bytes`, the right halves are pushed back to the front of the peer's queue
///  until they do. A single chunk that does not fit is pushed back as a whole and
///  `NotEnoughSpace` is returned.
#[allow(clippy::too_many_arguments)]
fn write_chunk_data(
    swarm: &Swarm,
    writer: &mut dyn ChannelMessageWriter,
    peer_have: &BinMap,
    queue: &dyn PeerTaskQueue,
    runner: Arc<dyn PeerTaskRunner>,
    max_bytes: usize,
    mut bin: Bin,
    timestamp: Timestamp,
    priority: PeerPriority,
) -> Result<usize, WriteError> {
    writer.resize(max_bytes);

    let chunk_size = swarm.options().chunk_size as u64;
    let overhead = (swarm.options().verifier_options().max_message_bytes() + DATA_HEADER_MAX_LEN) as u64;
    while (writer.available() as u64) < bin.base_length() * chunk_size + overhead {
        if bin.is_base() {
            queue.push_front_data(runner, bin, timestamp, priority);
            return Err(CodecError::NotEnoughSpace.into());
        }
        queue.push_front_data(runner.clone(), bin.right(), timestamp, priority);
        bin = bin.left();
    }

    if let Err(e) = swarm.verifier().write_integrity(bin, peer_have, &mut MessageWire(writer)) {
        writer.reset();
        if matches!(e, IntegrityError::Codec(CodecError::NotEnoughSpace)) {
            queue.push_front_data(runner, bin, timestamp, priority);
            return Err(e.into());
        }
        debug!("no integrity for {}, dropping it: {}", bin, e);
        return Ok(0);
    }

    match swarm.buffer().write_data(bin, timestamp, &mut MessageWire(writer)) {
        Ok(_) => {}
        Err(StoreError::Codec(CodecError::NotEnoughSpace)) => {
            writer.reset();
            queue.push_front_data(runner, bin, timestamp, priority);
            return Err(CodecError::NotEnoughSpace.into());
        }
        Err(e) => {
            writer.reset();
            debug!("dropping {}: {}", bin, e);
            return Ok(0);
        }
    }

    let n = writer.len();
    writer.flush()?;
    Ok(n)
}

/// Writes the bins of `bins` as messages created by `msg`. On success the map is cleared,
///  otherwise the bins that were written are removed and the error is returned.
fn write_map_bins(bins: &mut BinMap, writer: &mut dyn ChannelMessageWriter, msg: impl Fn(Bin) -> Message) -> Result<(), CodecError> {
    use binmap::BinCursor;

    if bins.empty() {
        return Ok(());
    }

    let pending: Vec<Bin> = bins.iterate_filled().intervals().collect();
    for b in pending {
        if let Err(e) = writer.write(&msg(b)) {
            bins.reset_before(b);
            return Err(e);
        }
    }
    bins.reset(bins.root_bin());
    Ok(())
}

/// Writes queued one-off messages in order, dropping the ones that were written
fn write_extra_messages(messages: &mut Vec<Message>, writer: &mut dyn ChannelMessageWriter) -> Result<(), CodecError> {
    let mut written = 0;
    let result = messages.iter()
        .try_for_each(|m| {
            writer.write(m)?;
            written += 1;
            Ok(())
        });
    messages.drain(..written);
    result
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::RecordingWriter;
    use rstest::rstest;

    #[rstest]
    #[case::codec(WriteError::Codec(CodecError::NotEnoughSpace), true)]
    #[case::store(WriteError::Store(StoreError::Codec(CodecError::NotEnoughSpace)), true)]
    #[case::integrity(WriteError::Integrity(IntegrityError::Codec(CodecError::NotEnoughSpace)), true)]
    #[case::underflow(WriteError::Codec(CodecError::BufferUnderflow), false)]
    #[case::underrun(WriteError::Store(StoreError::BufferUnderrun), false)]
    fn test_is_not_enough_space(#[case] error: WriteError, #[case] expected: bool) {
        assert_eq!(error.is_not_enough_space(), expected);
    }

    #[test]
    fn test_write_map_bins_clears_map() {
        let (mut writer, _) = RecordingWriter::new(1000);
        let mut bins = BinMap::new();
        bins.set(Bin(1));
        bins.set(Bin(8));

        write_map_bins(&mut bins, &mut writer, Message::Have).unwrap();
        assert_eq!(writer.pending, vec![Message::Have(Bin(1)), Message::Have(Bin(8))]);
        assert!(bins.empty());
    }

    #[test]
    fn test_write_map_bins_keeps_unwritten() {
        let one = Message::Have(Bin(1)).serialized_len() + crate::codec::MESSAGE_TYPE_LEN;
        let (mut writer, _) = RecordingWriter::new(one);
        let mut bins = BinMap::new();
        bins.set(Bin(1));
        bins.set(Bin(8));

        assert!(write_map_bins(&mut bins, &mut writer, Message::Have).is_err());
        assert_eq!(writer.pending, vec![Message::Have(Bin(1))]);
        assert!(bins.empty_at(Bin(1)));
        assert!(bins.filled_at(Bin(8)));
    }

    #[test]
    fn test_write_extra_messages_prunes_written() {
        let one = Message::Choke.serialized_len() + crate::codec::MESSAGE_TYPE_LEN;
        let (mut writer, _) = RecordingWriter::new(one);
        let mut messages = vec![Message::Choke, Message::Unchoke];

        assert!(write_extra_messages(&mut messages, &mut writer).is_err());
        assert_eq!(messages, vec![Message::Unchoke]);

        writer.reset();
        write_extra_messages(&mut messages, &mut writer).unwrap();
        assert!(messages.is_empty());
    }
}
