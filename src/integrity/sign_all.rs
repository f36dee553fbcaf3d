use std::io;
use std::sync::Arc;

use binmap::{Bin, BinMap};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::trace;

use super::{ChannelVerifier, ChunkVerifier, IntegrityError, IntegrityWriter, SignatureSigner, SignatureVerifier, SwarmVerifier};
use crate::codec::{SignedIntegrity, Timestamp};
use crate::store::StreamWriter;

/// Every chunk carries its own signature. The signatures of the live discard window are kept in
///  a ring indexed by chunk number so they can be forwarded to other peers.
pub struct SignAllSwarmVerifier {
    chunk_size: usize,
    signature_verifier: Arc<dyn SignatureVerifier>,
    ring: Mutex<SignatureRing>,
}

struct SignatureRing {
    mask: u64,
    /// the ring's span in bins
    size: Bin,
    head: Bin,
    tail: Bin,
    timestamps: Vec<Timestamp>,
    signatures: Vec<u8>,
}

impl SignAllSwarmVerifier {
    pub fn new(live_discard_window: usize, chunk_size: usize, signature_verifier: Arc<dyn SignatureVerifier>) -> SignAllSwarmVerifier {
        let signature_size = signature_verifier.size();
        SignAllSwarmVerifier {
            chunk_size,
            signature_verifier,
            ring: Mutex::new(SignatureRing {
                mask: live_discard_window as u64 - 1,
                size: Bin(live_discard_window as u64 * 2),
                head: Bin(0),
                tail: Bin(0),
                timestamps: vec![Timestamp::default(); live_discard_window],
                signatures: vec![0; live_discard_window * signature_size],
            }),
        }
    }

    /// `b` is a base bin
    pub(crate) fn store_signature(&self, b: Bin, timestamp: Timestamp, signature: &[u8]) {
        let size = self.signature_verifier.size();
        let mut ring = self.ring.lock();

        if b >= ring.head {
            ring.head = b + 2;
            if ring.head > ring.size {
                ring.tail = Bin(ring.head - ring.size);
            }
        }

        if b < ring.tail {
            trace!("dropping signature of {} behind the ring", b);
            return;
        }

        let i = ((b.0 >> 1) & ring.mask) as usize;
        ring.timestamps[i] = timestamp;
        ring.signatures[i * size..(i + 1) * size].copy_from_slice(signature);
    }
}

impl SwarmVerifier for SignAllSwarmVerifier {
    fn write_integrity(&self, b: Bin, _have: &BinMap, writer: &mut dyn IntegrityWriter) -> Result<usize, IntegrityError> {
        let size = self.signature_verifier.size();
        let ring = self.ring.lock();

        let mut n = 0;
        let mut l = b.base_left();
        while l <= b.base_right() {
            if l < ring.tail || l >= ring.head {
                return Err(IntegrityError::MissingChunkSignature);
            }

            let i = ((l.0 >> 1) & ring.mask) as usize;
            n += writer.write_signed_integrity(SignedIntegrity {
                address: l,
                timestamp: ring.timestamps[i],
                signature: Bytes::copy_from_slice(&ring.signatures[i * size..(i + 1) * size]),
            })?;
            l = l + 2;
        }
        Ok(n)
    }

    fn channel_verifier(self: Arc<Self>) -> Box<dyn ChannelVerifier> {
        Box::new(SignAllChannelVerifier {
            chunk_verifier: SignAllChunkVerifier {
                swarm_verifier: self,
                bin: Bin::NONE,
                timestamps: Vec::new(),
                signatures: Vec::new(),
            },
        })
    }

    fn reset(&self) {
        let mut ring = self.ring.lock();
        ring.head = Bin(0);
        ring.tail = Bin(0);
    }
}

pub struct SignAllChannelVerifier {
    chunk_verifier: SignAllChunkVerifier,
}

impl ChannelVerifier for SignAllChannelVerifier {
    fn chunk_verifier(&mut self, _b: Bin) -> &mut dyn ChunkVerifier {
        &mut self.chunk_verifier
    }
}

/// Collects the signatures preceding a data message, one per chunk starting at `bin`
struct SignAllChunkVerifier {
    swarm_verifier: Arc<SignAllSwarmVerifier>,
    bin: Bin,
    timestamps: Vec<Timestamp>,
    signatures: Vec<u8>,
}

impl SignAllChunkVerifier {
    fn clear(&mut self) {
        self.bin = Bin::NONE;
        self.timestamps.clear();
        self.signatures.clear();
    }
}

impl ChunkVerifier for SignAllChunkVerifier {
    fn set_signed_integrity(&mut self, b: Bin, timestamp: Timestamp, signature: &[u8]) {
        if self.bin.is_none() {
            self.bin = b;
        }
        self.timestamps.push(timestamp);
        self.signatures.extend_from_slice(signature);
    }

    fn set_integrity(&mut self, _b: Bin, _hash: &[u8]) {}

    fn verify(&mut self, b: Bin, data: &[u8]) -> Result<bool, IntegrityError> {
        if b.base_left() != self.bin {
            self.clear();
            return Err(IntegrityError::MissingChunkSignature);
        }
        let chunks = b.base_length() as usize;
        let chunk_size = self.swarm_verifier.chunk_size;
        let signature_size = self.swarm_verifier.signature_verifier.size();
        if chunks > self.timestamps.len() || self.signatures.len() < chunks * signature_size || data.len() < chunks * chunk_size {
            self.clear();
            return Err(IntegrityError::MissingChunkSignature);
        }

        for i in 0..chunks {
            let chunk = &data[i * chunk_size..(i + 1) * chunk_size];
            let signature = &self.signatures[i * signature_size..(i + 1) * signature_size];
            if !self.swarm_verifier.signature_verifier.verify(self.timestamps[i], chunk, signature) {
                self.clear();
                return Err(IntegrityError::InvalidChunkSignature);
            }
            self.swarm_verifier.store_signature(self.bin + 2 * i as u64, self.timestamps[i], signature);
        }

        self.clear();
        Ok(true)
    }
}

/// Signs every chunk of the stream before passing it on. Data is buffered until a chunk is
///  complete.
pub struct SignAllWriter<W: StreamWriter> {
    b: Bin,
    chunk_size: usize,
    chunk: BytesMut,
    swarm_verifier: Arc<SignAllSwarmVerifier>,
    signer: Box<dyn SignatureSigner>,
    inner: W,
}

impl<W: StreamWriter> SignAllWriter<W> {
    pub fn new(swarm_verifier: Arc<SignAllSwarmVerifier>, signer: Box<dyn SignatureSigner>, chunk_size: usize, inner: W) -> SignAllWriter<W> {
        SignAllWriter {
            b: Bin(0),
            chunk_size,
            chunk: BytesMut::with_capacity(chunk_size),
            swarm_verifier,
            signer,
            inner,
        }
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    fn write_chunk(&mut self) -> io::Result<()> {
        let chunk = self.chunk.split().freeze();
        let timestamp = Timestamp::now();
        let signature = self.signer.sign(timestamp, &chunk);
        trace!("signed chunk {}", self.b);
        self.swarm_verifier.store_signature(self.b, timestamp, &signature);
        self.b = self.b + 2;

        self.inner.write_all(&chunk)
    }
}

impl<W: StreamWriter> io::Write for SignAllWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = (self.chunk_size - self.chunk.len()).min(rest.len());
            self.chunk.extend_from_slice(&rest[..n]);
            rest = &rest[n..];

            if self.chunk.len() == self.chunk_size {
                self.write_chunk()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: StreamWriter> StreamWriter for SignAllWriter<W> {
    fn reset(&mut self) {
        self.b = Bin(0);
        self.chunk.clear();
        self.swarm_verifier.reset();
        self.inner.reset();
    }
}
