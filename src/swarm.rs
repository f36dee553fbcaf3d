use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use anyhow::Context;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use binmap::Bin;
use bytes::Bytes;
use tracing::{debug, info};

use crate::codec::{Handshake, ProtocolOption};
use crate::config::SwarmOptions;
use crate::integrity::{SwarmIntegrity, SwarmVerifier};
use crate::safe_converter::PrecheckedCast;
use crate::store::{Buffer, BufferReader, ChunkWriter, PubSub, StreamWriter};

pub const PROTOCOL_VERSION: u8 = 2;
pub const MINIMUM_PROTOCOL_VERSION: u8 = 2;

/// Identity of a swarm: the public key its chunks are signed with
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwarmId(Bytes);

impl SwarmId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }
}

impl From<Vec<u8>> for SwarmId {
    fn from(value: Vec<u8>) -> Self {
        SwarmId(value.into())
    }
}

impl From<Bytes> for SwarmId {
    fn from(value: Bytes) -> Self {
        SwarmId(value)
    }
}

impl Display for SwarmId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(&self.0))
    }
}

impl Debug for SwarmId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SwarmId({})", self)
    }
}

/// One live stream: its identity and options, the buffer of recent chunks, the fan-out of
///  arriving chunks, and the verifier for its chunks.
///
/// Chunks reach the buffer (and the schedulers that subscribed) through [Swarm::pubsub],
///  either from the publisher's [Swarm::writer] or from verified data messages.
pub struct Swarm {
    id: SwarmId,
    options: SwarmOptions,
    buffer: Arc<Buffer>,
    pubsub: Arc<PubSub>,
    integrity: SwarmIntegrity,
    verifier: Arc<dyn SwarmVerifier>,
}

impl Debug for Swarm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("id", &self.id)
            .field("label", &self.options.label)
            .finish()
    }
}

impl Swarm {
    pub fn new(id: SwarmId, options: SwarmOptions) -> anyhow::Result<Swarm> {
        options.validate()?;

        let buffer = Arc::new(Buffer::new(options.live_window, options.chunk_size)?);
        let pubsub = Arc::new(PubSub::new());
        pubsub.subscribe(buffer.clone());

        let integrity = SwarmIntegrity::new(id.as_bytes(), &options.verifier_options())
            .with_context(|| format!("creating the verifier for swarm {}", id))?;
        let verifier = integrity.verifier();

        debug!("created swarm {} ({:?})", id, options.label);
        Ok(Swarm {
            id,
            options,
            buffer,
            pubsub,
            integrity,
            verifier,
        })
    }

    pub fn id(&self) -> &SwarmId {
        &self.id
    }

    pub fn options(&self) -> &SwarmOptions {
        &self.options
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn pubsub(&self) -> &Arc<PubSub> {
        &self.pubsub
    }

    pub fn verifier(&self) -> &Arc<dyn SwarmVerifier> {
        &self.verifier
    }

    /// The handshake this node sends on every channel of the swarm
    pub fn handshake(&self) -> Handshake {
        let integrity = self.options.integrity;
        Handshake {
            channel_id: 0,
            options: vec![
                ProtocolOption::SwarmIdentifier(self.id.to_bytes()),
                ProtocolOption::Version(PROTOCOL_VERSION),
                ProtocolOption::MinimumVersion(MINIMUM_PROTOCOL_VERSION),
                ProtocolOption::LiveWindow(self.options.live_window.prechecked_cast()),
                ProtocolOption::ChunkSize(self.options.chunk_size.prechecked_cast()),
                ProtocolOption::ContentIntegrityProtectionMethod(integrity.protection_method.into()),
                ProtocolOption::MerkleHashTreeFunction(integrity.hash_tree_function.into()),
                ProtocolOption::LiveSignatureAlgorithm(integrity.signature_algorithm.into()),
                ProtocolOption::ChunksPerSignature(self.options.chunks_per_signature.prechecked_cast()),
                ProtocolOption::StreamCount(self.options.stream_count.prechecked_cast()),
            ],
        }
    }

    /// A blocking reader of the stream, starting wherever the buffer's read cursor is
    pub fn reader(&self) -> BufferReader {
        BufferReader::new(self.buffer.clone())
    }

    /// The publisher's end of the stream. Everything written is cut into chunks, signed with
    ///  `private_key` and published to the swarm, starting at the first chunk.
    pub fn writer(&self, private_key: &[u8]) -> anyhow::Result<Box<dyn StreamWriter>> {
        self.buffer.set_offset(Bin(0));
        let chunks = ChunkWriter::new(self.options.chunk_size, self.pubsub.clone(), self.buffer.clone());
        let writer = self.integrity.writer(private_key, &self.options.verifier_options(), chunks)
            .with_context(|| format!("creating the writer for swarm {}", self.id))?;
        info!("publishing swarm {}", self.id);
        Ok(writer)
    }

    /// Wakes up and fails all readers. The swarm cannot be used afterwards.
    pub fn close(&self) {
        debug!("closing swarm {}", self.id);
        self.buffer.close();
    }
}
