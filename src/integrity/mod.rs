//! Content integrity: proving that a chunk was published by the swarm's owner.
//!
//! A [SwarmVerifier] holds the swarm-wide window of verified signatures (and for Merkle trees,
//!  hashes). Each channel gets its own [ChannelVerifier] that collects the integrity messages
//!  preceding a data message and then checks the data against them.

mod merkle;
mod none;
mod sign_all;

pub use self::merkle::{MerkleChannelVerifier, MerkleSwarmVerifier, MerkleWriter};
pub use none::NoneSwarmVerifier;
pub use sign_all::{SignAllChannelVerifier, SignAllSwarmVerifier, SignAllWriter};

use std::sync::Arc;

use binmap::{Bin, BinMap};
use ed25519_dalek::{Signer, Verifier};
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::codec::{CodecError, Integrity, SignedIntegrity, Timestamp, MESSAGE_TYPE_LEN};
use crate::merkle::{Hasher, MerkleError};
use crate::store::StreamWriter;

#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("missing hash subtree")]
    MissingHashSubtree,
    #[error("signature too short")]
    SignatureTooShort,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("bin {0} out of bounds")]
    BinOutOfBounds(Bin),
    #[error("missing chunk signature")]
    MissingChunkSignature,
    #[error("invalid chunk signature")]
    InvalidChunkSignature,
    #[error("unsupported protection method {0}")]
    UnsupportedProtectionMethod(u8),
    #[error("unsupported hash tree function {0}")]
    UnsupportedHashTreeFunction(u8),
    #[error("unsupported live signature algorithm {0}")]
    UnsupportedSignatureAlgorithm(u8),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl IntegrityError {
    /// transient failures: the data may well be valid once the missing state arrives
    pub fn is_transient(&self) -> bool {
        matches!(self, IntegrityError::MissingHashSubtree)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProtectionMethod {
    None = 1,
    MerkleTree = 2,
    SignAll = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MerkleHashTreeFunction {
    Sha1 = 1,
    Sha256 = 2,
    Sha512 = 3,
    Blake2b256 = 4,
    Blake2b512 = 5,
    Md5 = 6,
    Blake3 = 7,
    Sha3_224 = 8,
    Sha3_256 = 9,
    Sha3_384 = 10,
    Sha3_512 = 11,
}

impl MerkleHashTreeFunction {
    pub fn hash_size(&self) -> usize {
        match self {
            MerkleHashTreeFunction::Sha1 => 20,
            MerkleHashTreeFunction::Sha256 => 32,
            MerkleHashTreeFunction::Sha512 => 64,
            MerkleHashTreeFunction::Blake2b256 => 32,
            MerkleHashTreeFunction::Blake2b512 => 64,
            MerkleHashTreeFunction::Md5 => 16,
            MerkleHashTreeFunction::Blake3 => 32,
            MerkleHashTreeFunction::Sha3_224 => 28,
            MerkleHashTreeFunction::Sha3_256 => 32,
            MerkleHashTreeFunction::Sha3_384 => 48,
            MerkleHashTreeFunction::Sha3_512 => 64,
        }
    }

    /// Only a subset of the identifiers that can be negotiated is implemented
    pub fn hasher(&self) -> Result<Hasher, IntegrityError> {
        match self {
            MerkleHashTreeFunction::Sha256 => Ok(Hasher::sha256()),
            MerkleHashTreeFunction::Sha512 => Ok(Hasher::sha512()),
            MerkleHashTreeFunction::Blake3 => Ok(Hasher::blake3()),
            other => Err(IntegrityError::UnsupportedHashTreeFunction((*other).into())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LiveSignatureAlgorithm {
    Ed25519 = 1,
}

impl LiveSignatureAlgorithm {
    pub fn signature_size(&self) -> usize {
        match self {
            LiveSignatureAlgorithm::Ed25519 => ed25519_dalek::SIGNATURE_LENGTH,
        }
    }

    pub fn verifier(&self, public_key: &[u8]) -> Result<Arc<dyn SignatureVerifier>, IntegrityError> {
        match self {
            LiveSignatureAlgorithm::Ed25519 => Ok(Arc::new(Ed25519Verifier::new(public_key)?)),
        }
    }

    pub fn signer(&self, private_key: &[u8]) -> Result<Box<dyn SignatureSigner>, IntegrityError> {
        match self {
            LiveSignatureAlgorithm::Ed25519 => Ok(Box::new(Ed25519Signer::new(private_key)?)),
        }
    }
}

/// The integrity algorithms of a swarm. They are part of the swarm's identity and must match
///  between peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifierOptions {
    pub protection_method: ProtectionMethod,
    pub hash_tree_function: MerkleHashTreeFunction,
    pub signature_algorithm: LiveSignatureAlgorithm,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        VerifierOptions {
            protection_method: ProtectionMethod::MerkleTree,
            hash_tree_function: MerkleHashTreeFunction::Sha256,
            signature_algorithm: LiveSignatureAlgorithm::Ed25519,
        }
    }
}

/// Everything needed to set up a swarm's verifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwarmVerifierOptions {
    /// number of chunks for which signatures are retained, a power of two
    pub live_discard_window: usize,
    pub chunk_size: usize,
    /// number of chunks covered by one Merkle tree signature, a power of two
    pub chunks_per_signature: usize,
    pub verifier: VerifierOptions,
}

impl SwarmVerifierOptions {
    /// Upper bound for the size of the integrity messages that precede a data message. This is
    ///  reserved in the frame when data messages are split to fit.
    pub fn max_message_bytes(&self) -> usize {
        let signed_integrity = SignedIntegrity::header_len() + self.verifier.signature_algorithm.signature_size();

        match self.verifier.protection_method {
            ProtectionMethod::None => 0,
            ProtectionMethod::SignAll => MESSAGE_TYPE_LEN + signed_integrity,
            ProtectionMethod::MerkleTree => {
                let uncles = self.chunks_per_signature.trailing_zeros() as usize;
                let integrity = Integrity::header_len() + self.verifier.hash_tree_function.hash_size();
                MESSAGE_TYPE_LEN + signed_integrity + uncles * (MESSAGE_TYPE_LEN + integrity)
            }
        }
    }
}

/// The verifier of a swarm. The concrete type is kept because the publisher signs through it.
#[derive(Clone)]
pub enum SwarmIntegrity {
    None(Arc<NoneSwarmVerifier>),
    Merkle(Arc<MerkleSwarmVerifier>),
    SignAll(Arc<SignAllSwarmVerifier>),
}

impl SwarmIntegrity {
    /// Creates the verifier for a swarm, checking that its algorithms are supported
    pub fn new(public_key: &[u8], options: &SwarmVerifierOptions) -> Result<SwarmIntegrity, IntegrityError> {
        Ok(match options.verifier.protection_method {
            ProtectionMethod::None => SwarmIntegrity::None(Arc::new(NoneSwarmVerifier)),
            ProtectionMethod::MerkleTree => SwarmIntegrity::Merkle(Arc::new(MerkleSwarmVerifier::new(
                options.live_discard_window,
                options.chunk_size,
                options.chunks_per_signature,
                options.verifier.hash_tree_function,
                options.verifier.signature_algorithm.verifier(public_key)?,
            )?)),
            ProtectionMethod::SignAll => SwarmIntegrity::SignAll(Arc::new(SignAllSwarmVerifier::new(
                options.live_discard_window,
                options.chunk_size,
                options.verifier.signature_algorithm.verifier(public_key)?,
            ))),
        })
    }

    pub fn verifier(&self) -> Arc<dyn SwarmVerifier> {
        match self {
            SwarmIntegrity::None(v) => v.clone(),
            SwarmIntegrity::Merkle(v) => v.clone(),
            SwarmIntegrity::SignAll(v) => v.clone(),
        }
    }

    /// Puts the signing stage of the protection method in front of the publisher's `inner`
    ///  writer. The private key is not used without protection.
    pub fn writer<W: StreamWriter + 'static>(&self, private_key: &[u8], options: &SwarmVerifierOptions, inner: W) -> Result<Box<dyn StreamWriter>, IntegrityError> {
        let signer = || options.verifier.signature_algorithm.signer(private_key);
        Ok(match self {
            SwarmIntegrity::None(_) => Box::new(inner),
            SwarmIntegrity::Merkle(v) => Box::new(MerkleWriter::new(v.clone(), signer()?, options.chunks_per_signature, options.chunk_size, inner)),
            SwarmIntegrity::SignAll(v) => Box::new(SignAllWriter::new(v.clone(), signer()?, options.chunk_size, inner)),
        })
    }
}

/// Where a [SwarmVerifier] puts the integrity messages for a peer
pub trait IntegrityWriter {
    fn write_integrity(&mut self, msg: Integrity) -> Result<usize, CodecError>;
    fn write_signed_integrity(&mut self, msg: SignedIntegrity) -> Result<usize, CodecError>;
}

pub trait SwarmVerifier: Send + Sync {
    /// Writes whatever integrity messages a peer with the given have map needs to verify the
    ///  data at `b`. Returns the number of bytes written.
    fn write_integrity(&self, b: Bin, have: &BinMap, writer: &mut dyn IntegrityWriter) -> Result<usize, IntegrityError>;

    fn channel_verifier(self: Arc<Self>) -> Box<dyn ChannelVerifier>;

    /// forget all retained signatures, e.g. when the stream is restarted
    fn reset(&self);
}

pub trait ChannelVerifier: Send {
    /// The verifier for the data message at `b` and the integrity messages preceding it
    fn chunk_verifier(&mut self, b: Bin) -> &mut dyn ChunkVerifier;
}

pub trait ChunkVerifier {
    fn set_signed_integrity(&mut self, b: Bin, timestamp: Timestamp, signature: &[u8]);
    fn set_integrity(&mut self, b: Bin, hash: &[u8]);
    fn verify(&mut self, b: Bin, data: &[u8]) -> Result<bool, IntegrityError>;
}

pub trait SignatureSigner: Send {
    fn sign(&self, timestamp: Timestamp, data: &[u8]) -> Vec<u8>;
    fn size(&self) -> usize;
}

#[cfg_attr(test, automock)]
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, timestamp: Timestamp, data: &[u8], signature: &[u8]) -> bool;
    fn size(&self) -> usize;
}

/// the signed message is the big endian timestamp followed by the data
fn signed_message(timestamp: Timestamp, data: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(8 + data.len());
    msg.extend_from_slice(&timestamp.millis().to_be_bytes());
    msg.extend_from_slice(data);
    msg
}

pub struct Ed25519Signer {
    key: ed25519_dalek::SigningKey,
}

impl Ed25519Signer {
    /// `key` is the 32 byte secret key, optionally followed by the public key
    pub fn new(key: &[u8]) -> Result<Ed25519Signer, IntegrityError> {
        let secret: [u8; ed25519_dalek::SECRET_KEY_LENGTH] = key.get(..ed25519_dalek::SECRET_KEY_LENGTH)
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| IntegrityError::InvalidKey(format!("expected at least {} bytes", ed25519_dalek::SECRET_KEY_LENGTH)))?;
        Ok(Ed25519Signer {
            key: ed25519_dalek::SigningKey::from_bytes(&secret),
        })
    }

    /// a fresh random key pair
    pub fn generate() -> Ed25519Signer {
        Ed25519Signer {
            key: ed25519_dalek::SigningKey::from_bytes(&rand::random::<[u8; ed25519_dalek::SECRET_KEY_LENGTH]>()),
        }
    }

    pub fn public_key(&self) -> [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] {
        self.key.verifying_key().to_bytes()
    }

    pub fn private_key(&self) -> [u8; ed25519_dalek::SECRET_KEY_LENGTH] {
        self.key.to_bytes()
    }
}

impl SignatureSigner for Ed25519Signer {
    fn sign(&self, timestamp: Timestamp, data: &[u8]) -> Vec<u8> {
        self.key.sign(&signed_message(timestamp, data)).to_bytes().to_vec()
    }

    fn size(&self) -> usize {
        ed25519_dalek::SIGNATURE_LENGTH
    }
}

pub struct Ed25519Verifier {
    key: ed25519_dalek::VerifyingKey,
}

impl Ed25519Verifier {
    pub fn new(key: &[u8]) -> Result<Ed25519Verifier, IntegrityError> {
        let bytes: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = key.try_into()
            .map_err(|_| IntegrityError::InvalidKey(format!("expected {} bytes, got {}", ed25519_dalek::PUBLIC_KEY_LENGTH, key.len())))?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map_err(|e| IntegrityError::InvalidKey(e.to_string()))?;
        Ok(Ed25519Verifier { key })
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, timestamp: Timestamp, data: &[u8], signature: &[u8]) -> bool {
        match ed25519_dalek::Signature::from_slice(signature) {
            Ok(signature) => self.key.verify(&signed_message(timestamp, data), &signature).is_ok(),
            Err(_) => false,
        }
    }

    fn size(&self) -> usize {
        ed25519_dalek::SIGNATURE_LENGTH
    }
}

/// Integrity messages collected into a list, for tests and for measuring
#[cfg(test)]
#[derive(Default)]
pub struct RecordingIntegrityWriter {
    pub integrity: Vec<Integrity>,
    pub signed: Vec<SignedIntegrity>,
    pub capacity: Option<usize>,
}

#[cfg(test)]
impl IntegrityWriter for RecordingIntegrityWriter {
    fn write_integrity(&mut self, msg: Integrity) -> Result<usize, CodecError> {
        if let Some(c) = &mut self.capacity {
            if *c == 0 {
                return Err(CodecError::NotEnoughSpace);
            }
            *c -= 1;
        }
        let n = msg.serialized_len() + MESSAGE_TYPE_LEN;
        self.integrity.push(msg);
        Ok(n)
    }

    fn write_signed_integrity(&mut self, msg: SignedIntegrity) -> Result<usize, CodecError> {
        if let Some(c) = &mut self.capacity {
            if *c == 0 {
                return Err(CodecError::NotEnoughSpace);
            }
            *c -= 1;
        }
        let n = msg.serialized_len() + MESSAGE_TYPE_LEN;
        self.signed.push(msg);
        Ok(n)
    }
}
