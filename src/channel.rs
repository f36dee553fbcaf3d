//! The protocol endpoint of one swarm on one peer connection.
//!
//! Frames of all swarms shared with a peer travel over the same connection, each prefixed with
//!  a [ChannelHeader] that names the receiving side's channel. [ChannelWriter] frames what a
//!  channel scheduler writes, [ChannelReader] splits incoming datagrams into frames and hands
//!  their messages to the channel's scheduler after validating the handshake and verifying
//!  data.

use std::fmt::{Debug, Formatter};
use std::io;
use std::sync::Arc;

use anyhow::Context;
use binmap::Bin;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, instrument, trace, warn};

use crate::buffer_pool::BufferPool;
use crate::codec::{Ack, ChannelHeader, CodecError, Data, Handshake, Integrity, Message, MessageHandler, MessageType, Pong, ProtocolOption, ProtocolOptionType, Reader, Request, SignedIntegrity, StreamAddress, Writer, MESSAGE_TYPE_LEN};
use crate::config::frame_capacity;
use crate::integrity::ChannelVerifier;
use crate::peer::{Conn, PeerMetrics};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::scheduler::{ChannelMessageWriter, ChannelScheduler};
use crate::store::Chunk;
use crate::swarm::{Swarm, MINIMUM_PROTOCOL_VERSION, PROTOCOL_VERSION};

/// A handshake that makes talking to the peer in this swarm impossible
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("handshake missing {0:?} option")]
    MissingOption(ProtocolOptionType),
    #[error("incompatible {0:?} option")]
    IncompatibleOption(ProtocolOptionType),
}

/// Checks a peer's handshake against the swarm. Returns the peer's live window in chunks.
pub fn validate_handshake(swarm: &Swarm, handshake: &Handshake) -> Result<u32, ChannelError> {
    use ProtocolOptionType as T;

    let find = |t: ProtocolOptionType| handshake.find(t).ok_or(ChannelError::MissingOption(t));
    let check = |t: ProtocolOptionType, ok: bool| if ok { Ok(()) } else { Err(ChannelError::IncompatibleOption(t)) };

    let options = swarm.options();
    let integrity = options.integrity;

    match find(T::SwarmIdentifier)? {
        ProtocolOption::SwarmIdentifier(id) => check(T::SwarmIdentifier, &id[..] == swarm.id().as_bytes())?,
        _ => return Err(ChannelError::IncompatibleOption(T::SwarmIdentifier)),
    }
    match find(T::Version)? {
        ProtocolOption::Version(v) => check(T::Version, *v >= MINIMUM_PROTOCOL_VERSION)?,
        _ => return Err(ChannelError::IncompatibleOption(T::Version)),
    }
    match find(T::MinimumVersion)? {
        ProtocolOption::MinimumVersion(v) => check(T::MinimumVersion, *v <= PROTOCOL_VERSION)?,
        _ => return Err(ChannelError::IncompatibleOption(T::MinimumVersion)),
    }
    let live_window = match find(T::LiveWindow)? {
        ProtocolOption::LiveWindow(v) => *v,
        _ => return Err(ChannelError::IncompatibleOption(T::LiveWindow)),
    };
    match find(T::ChunkSize)? {
        ProtocolOption::ChunkSize(v) => check(T::ChunkSize, SafeCast::<usize>::safe_cast(*v) == options.chunk_size)?,
        _ => return Err(ChannelError::IncompatibleOption(T::ChunkSize)),
    }
    match find(T::ChunksPerSignature)? {
        ProtocolOption::ChunksPerSignature(v) => check(T::ChunksPerSignature, SafeCast::<usize>::safe_cast(*v) == options.chunks_per_signature)?,
        _ => return Err(ChannelError::IncompatibleOption(T::ChunksPerSignature)),
    }
    match find(T::StreamCount)? {
        ProtocolOption::StreamCount(v) => check(T::StreamCount, SafeCast::<usize>::safe_cast(*v) == options.stream_count)?,
        _ => return Err(ChannelError::IncompatibleOption(T::StreamCount)),
    }
    match find(T::ContentIntegrityProtectionMethod)? {
        ProtocolOption::ContentIntegrityProtectionMethod(v) => check(T::ContentIntegrityProtectionMethod, *v == u8::from(integrity.protection_method))?,
        _ => return Err(ChannelError::IncompatibleOption(T::ContentIntegrityProtectionMethod)),
    }
    match find(T::MerkleHashTreeFunction)? {
        ProtocolOption::MerkleHashTreeFunction(v) => check(T::MerkleHashTreeFunction, *v == u8::from(integrity.hash_tree_function))?,
        _ => return Err(ChannelError::IncompatibleOption(T::MerkleHashTreeFunction)),
    }
    match find(T::LiveSignatureAlgorithm)? {
        ProtocolOption::LiveSignatureAlgorithm(v) => check(T::LiveSignatureAlgorithm, *v == u8::from(integrity.signature_algorithm))?,
        _ => return Err(ChannelError::IncompatibleOption(T::LiveSignatureAlgorithm)),
    }

    Ok(live_window)
}

/// Message and byte counters of one direction of a channel
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelMetrics {
    messages: FxHashMap<MessageType, u64>,
    pub chunks: u64,
    pub data_bytes: u64,
    /// everything that is not chunk payload, including the type bytes
    pub overhead_bytes: u64,
    pub invalid_data: u64,
    pub invalid_chunks: u64,
    pub invalid_bytes: u64,
}

impl ChannelMetrics {
    pub fn message_count(&self, message_type: MessageType) -> u64 {
        self.messages.get(&message_type).copied().unwrap_or(0)
    }

    fn add_message(&mut self, message_type: MessageType, wire_len: usize) {
        *self.messages.entry(message_type).or_default() += 1;
        self.overhead_bytes += wire_len as u64;
    }

    fn add_data(&mut self, data: &Data, wire_len: usize) {
        *self.messages.entry(MessageType::Data).or_default() += 1;
        self.chunks += data.address.base_length();
        self.data_bytes += SafeCast::<u64>::safe_cast(data.data.len());
        self.overhead_bytes += (wire_len - data.data.len()) as u64;
    }

    fn add_invalid(&mut self, data: &Data) {
        self.invalid_data += 1;
        self.invalid_chunks += data.address.base_length();
        self.invalid_bytes += SafeCast::<u64>::safe_cast(data.data.len());
    }

    fn record(&mut self, msg: &Message, wire_len: usize) {
        match msg {
            Message::Data(data) => self.add_data(data, wire_len),
            other => self.add_message(other.message_type(), wire_len),
        }
    }

    fn merge(&mut self, other: &ChannelMetrics) {
        for (t, n) in &other.messages {
            *self.messages.entry(*t).or_default() += n;
        }
        self.chunks += other.chunks;
        self.data_bytes += other.data_bytes;
        self.overhead_bytes += other.overhead_bytes;
        self.invalid_data += other.invalid_data;
        self.invalid_chunks += other.invalid_chunks;
        self.invalid_bytes += other.invalid_bytes;
    }

    fn clear(&mut self) {
        *self = ChannelMetrics::default();
    }
}

/// Counters of both directions, shared between the channel's reader and writer and whoever
///  reports them
#[derive(Default)]
pub struct ChannelMetricsPair {
    pub read: Mutex<ChannelMetrics>,
    pub write: Mutex<ChannelMetrics>,
}

/// Frames the messages of a channel scheduler for the peer's connection. Counters of a frame
///  are only merged into the channel's metrics when the frame is actually sent.
pub struct ChannelWriter {
    header: ChannelHeader,
    writer: Writer,
    conn: Arc<dyn Conn>,
    pool: Arc<BufferPool>,
    pending: ChannelMetrics,
    metrics: Arc<ChannelMetricsPair>,
    peer_metrics: Arc<PeerMetrics>,
}

impl Debug for ChannelWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("channel", &self.header.channel)
            .field("len", &self.writer.len())
            .finish()
    }
}

impl ChannelWriter {
    /// `channel` is the peer's id for the channel
    pub fn new(channel: u64, conn: Arc<dyn Conn>, pool: Arc<BufferPool>, metrics: Arc<ChannelMetricsPair>, peer_metrics: Arc<PeerMetrics>) -> ChannelWriter {
        let header = ChannelHeader { channel, length: 0 };
        let capacity = frame_capacity(conn.mtu()).saturating_sub(header.serialized_len());
        ChannelWriter {
            header,
            writer: Writer::new(capacity),
            conn,
            pool,
            pending: ChannelMetrics::default(),
            metrics,
            peer_metrics,
        }
    }
}

impl ChannelMessageWriter for ChannelWriter {
    fn resize(&mut self, max_bytes: usize) {
        let capacity = frame_capacity(max_bytes).saturating_sub(self.header.serialized_len());
        self.writer.set_capacity(capacity);
    }

    fn len(&self) -> usize {
        if self.writer.is_empty() {
            return 0;
        }
        self.header.serialized_len() + self.writer.len()
    }

    fn available(&self) -> usize {
        self.writer.available()
    }

    fn write(&mut self, msg: &Message) -> Result<usize, CodecError> {
        let n = self.writer.write(msg)?;
        self.pending.record(msg, n);
        Ok(n)
    }

    fn reset(&mut self) {
        self.writer.reset();
        self.pending.clear();
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.writer.is_empty() {
            return Ok(());
        }

        let payload = self.writer.take();
        // NB: the writer's capacity is bounded by frame_capacity, so the length fits
        self.header.length = payload.len().prechecked_cast();

        let mut buf = self.pool.acquire();
        self.header.ser(&mut buf);
        buf.put_slice(&payload);
        let result = self.conn.write(&buf);
        self.pool.release(buf);
        result?;

        self.peer_metrics.add_written_bytes(self.pending.data_bytes);
        self.metrics.write.lock().merge(&self.pending);
        self.pending.clear();
        Ok(())
    }
}

/// Dispatches the messages of one channel to its scheduler
struct ChannelMessageHandler {
    swarm: Arc<Swarm>,
    scheduler: Arc<dyn ChannelScheduler>,
    verifier: Box<dyn ChannelVerifier>,
    metrics: Arc<ChannelMetricsPair>,
    peer_metrics: Arc<PeerMetrics>,
}

impl ChannelMessageHandler {
    fn count(&self, message_type: MessageType, len: usize) {
        self.metrics.read.lock().add_message(message_type, len + MESSAGE_TYPE_LEN);
    }
}

impl MessageHandler for ChannelMessageHandler {
    #[instrument(level = "debug", skip_all, fields(swarm = %self.swarm.id()))]
    fn handle_handshake(&mut self, msg: Handshake) -> anyhow::Result<()> {
        self.count(MessageType::Handshake, msg.serialized_len());
        let live_window = validate_handshake(&self.swarm, &msg)?;
        self.scheduler.handle_handshake(live_window)
    }

    fn handle_restart(&mut self) -> anyhow::Result<()> {
        self.count(MessageType::Restart, 0);
        self.scheduler.handle_restart()
    }

    fn handle_data(&mut self, msg: Data) -> anyhow::Result<()> {
        self.metrics.read.lock().add_data(&msg, msg.serialized_len() + MESSAGE_TYPE_LEN);
        self.peer_metrics.add_read_bytes(msg.data.len() as u64);

        let b = msg.address;
        let verified = self.verifier.chunk_verifier(b).verify(b, &msg.data);
        match verified {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.read.lock().add_invalid(&msg);
                debug!("invalid data {}", b);
                return self.scheduler.handle_data(b, msg.timestamp, false);
            }
            Err(e) => {
                self.metrics.read.lock().add_invalid(&msg);
                if e.is_transient() {
                    trace!("cannot verify {} yet: {}", b, e);
                }
                else {
                    debug!("invalid data {}: {}", b, e);
                }
                return self.scheduler.handle_data(b, msg.timestamp, false);
            }
        }

        self.swarm.pubsub().publish(&Chunk {
            bin: b,
            data: msg.data,
        });
        self.scheduler.handle_data(b, msg.timestamp, true)
    }

    fn handle_ack(&mut self, msg: Ack) -> anyhow::Result<()> {
        self.count(MessageType::Ack, msg.serialized_len());
        self.scheduler.handle_ack(msg.address, msg.delay_sample)
    }

    fn handle_have(&mut self, bin: Bin) -> anyhow::Result<()> {
        self.count(MessageType::Have, Message::Have(bin).serialized_len());
        self.scheduler.handle_have(bin)
    }

    fn handle_integrity(&mut self, msg: Integrity) -> anyhow::Result<()> {
        self.count(MessageType::Integrity, msg.serialized_len());
        self.verifier.chunk_verifier(msg.address).set_integrity(msg.address, &msg.hash);
        Ok(())
    }

    fn handle_signed_integrity(&mut self, msg: SignedIntegrity) -> anyhow::Result<()> {
        self.count(MessageType::SignedIntegrity, msg.serialized_len());
        self.verifier.chunk_verifier(msg.address).set_signed_integrity(msg.address, msg.timestamp, &msg.signature);
        Ok(())
    }

    fn handle_request(&mut self, msg: Request) -> anyhow::Result<()> {
        self.count(MessageType::Request, msg.serialized_len());
        self.scheduler.handle_request(msg.address, msg.timestamp)
    }

    fn handle_cancel(&mut self, bin: Bin) -> anyhow::Result<()> {
        self.count(MessageType::Cancel, Message::Cancel(bin).serialized_len());
        self.scheduler.handle_cancel(bin)
    }

    fn handle_choke(&mut self) -> anyhow::Result<()> {
        self.count(MessageType::Choke, 0);
        self.scheduler.handle_choke()
    }

    fn handle_unchoke(&mut self) -> anyhow::Result<()> {
        self.count(MessageType::Unchoke, 0);
        self.scheduler.handle_unchoke()
    }

    fn handle_ping(&mut self, nonce: u64) -> anyhow::Result<()> {
        self.count(MessageType::Ping, Message::Ping(nonce).serialized_len());
        self.scheduler.handle_ping(nonce)
    }

    fn handle_pong(&mut self, msg: Pong) -> anyhow::Result<()> {
        self.count(MessageType::Pong, Message::Pong(msg).serialized_len());
        self.scheduler.handle_pong(msg.nonce)
    }

    fn handle_stream_request(&mut self, msg: StreamAddress) -> anyhow::Result<()> {
        self.count(MessageType::StreamRequest, Message::StreamRequest(msg).serialized_len());
        self.scheduler.handle_stream_request(msg.stream, msg.address)
    }

    fn handle_stream_cancel(&mut self, stream: u16) -> anyhow::Result<()> {
        self.count(MessageType::StreamCancel, 2);
        self.scheduler.handle_stream_cancel(stream)
    }

    fn handle_stream_open(&mut self, msg: StreamAddress) -> anyhow::Result<()> {
        self.count(MessageType::StreamOpen, Message::StreamOpen(msg).serialized_len());
        self.scheduler.handle_stream_open(msg.stream, msg.address)
    }

    fn handle_stream_close(&mut self, stream: u16) -> anyhow::Result<()> {
        self.count(MessageType::StreamClose, 2);
        self.scheduler.handle_stream_close(stream)
    }
}

/// Called when a channel fails, after it was removed from the reader
pub type ChannelFailureHook = Box<dyn FnOnce(anyhow::Error) + Send>;

struct ReaderChannel {
    reader: Reader,
    handler: ChannelMessageHandler,
    on_failure: Option<ChannelFailureHook>,
    /// the datagram this channel last received a frame in
    version: u64,
}

#[derive(Default)]
struct ChannelReaderState {
    version: u64,
    channels: FxHashMap<u64, ReaderChannel>,
}

/// The receiving side of a peer connection: the embedder pushes each datagram into
///  [ChannelReader::handle_message]
#[derive(Default)]
pub struct ChannelReader {
    state: Mutex<ChannelReaderState>,
}

impl ChannelReader {
    pub fn new() -> ChannelReader {
        ChannelReader::default()
    }

    /// Registers our end of a channel. `channel` is our id for it, i.e. the id the peer puts
    ///  into the headers of the channel's frames.
    pub fn open_channel(&self, channel: u64, swarm: Arc<Swarm>, scheduler: Arc<dyn ChannelScheduler>, metrics: Arc<ChannelMetricsPair>, peer_metrics: Arc<PeerMetrics>, on_failure: ChannelFailureHook) {
        let reader = Reader::new(swarm.options().message_sizes());
        let verifier = swarm.verifier().clone().channel_verifier();
        let handler = ChannelMessageHandler {
            swarm,
            scheduler,
            verifier,
            metrics,
            peer_metrics,
        };
        self.state.lock().channels.insert(channel, ReaderChannel {
            reader,
            handler,
            on_failure: Some(on_failure),
            version: 0,
        });
        debug!("opened channel {}", channel);
    }

    pub fn close_channel(&self, channel: u64) {
        if self.state.lock().channels.remove(&channel).is_some() {
            debug!("closed channel {}", channel);
        }
    }

    pub fn is_open(&self, channel: u64) -> bool {
        self.state.lock().channels.contains_key(&channel)
    }

    /// Handles a datagram. A channel whose messages cannot be decoded or handled is closed
    ///  and its failure hook is called. An error is returned only if the framing itself is
    ///  broken.
    pub fn handle_message(&self, mut buf: &[u8]) -> anyhow::Result<()> {
        let mut failed = Vec::new();
        let result = self.handle_frames(&mut buf, &mut failed);

        for (channel, e, hook) in failed {
            warn!("closing channel {}: {:#}", channel, e);
            if let Some(hook) = hook {
                hook(e);
            }
        }
        result
    }

    fn handle_frames(&self, buf: &mut &[u8], failed: &mut Vec<(u64, anyhow::Error, Option<ChannelFailureHook>)>) -> anyhow::Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.version += 1;
        let version = state.version;
        let mut touched = Vec::new();

        while buf.has_remaining() {
            let header = ChannelHeader::deser(buf).context("malformed channel header")?;
            let len = header.length as usize;
            let data: &[u8] = *buf;
            if data.len() < len {
                anyhow::bail!("truncated channel frame: {} of {} bytes", data.len(), len);
            }
            let (mut frame, rest) = data.split_at(len);
            *buf = rest;

            let Some(c) = state.channels.get_mut(&header.channel) else {
                trace!("dropping frame for unknown channel {}", header.channel);
                continue;
            };
            if c.version != version {
                c.version = version;
                touched.push(header.channel);
            }

            if let Err(e) = c.reader.read(&mut frame, &mut c.handler) {
                if let Some(mut c) = state.channels.remove(&header.channel) {
                    failed.push((header.channel, e, c.on_failure.take()));
                }
            }
        }

        for channel in touched {
            let Some(c) = state.channels.get(&channel) else {
                continue;
            };
            if let Err(e) = c.handler.scheduler.handle_message_end() {
                if let Some(mut c) = state.channels.remove(&channel) {
                    failed.push((channel, e, c.on_failure.take()));
                }
            }
        }
        Ok(())
    }
}
