use std::fmt::{Debug, Formatter};
use std::time::Duration;

use binmap::Bin;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{address_len, delay_len, put_address, put_delay, try_get_address, try_get_bytes, try_get_delay, varint_len, CodecError, MAX_VARINT_LEN, MessageSizes, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 1,
    Data = 2,
    Ack = 3,
    Have = 4,
    Integrity = 5,
    SignedIntegrity = 6,
    Request = 7,
    Cancel = 8,
    Choke = 9,
    Unchoke = 10,
    Ping = 11,
    Pong = 12,
    StreamRequest = 13,
    StreamCancel = 14,
    StreamOpen = 15,
    StreamClose = 16,
    Restart = 17,
    End = 255,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProtocolOptionType {
    Version = 0,
    MinimumVersion = 1,
    SwarmIdentifier = 2,
    ContentIntegrityProtectionMethod = 3,
    MerkleHashTreeFunction = 4,
    LiveSignatureAlgorithm = 5,
    LiveWindow = 7,
    ChunkSize = 9,
    ChunksPerSignature = 10,
    StreamCount = 11,
    Epoch = 12,
    End = 255,
}

/// A handshake option. Integrity algorithm identifiers travel as raw numbers, they are
///  interpreted when the handshake is validated against the swarm's options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolOption {
    Version(u8),
    MinimumVersion(u8),
    SwarmIdentifier(Bytes),
    ContentIntegrityProtectionMethod(u8),
    MerkleHashTreeFunction(u8),
    LiveSignatureAlgorithm(u8),
    LiveWindow(u32),
    ChunkSize(u32),
    ChunksPerSignature(u32),
    StreamCount(u16),
    Epoch { timestamp: Timestamp, signature: Bytes },
}

impl ProtocolOption {
    pub fn option_type(&self) -> ProtocolOptionType {
        match self {
            ProtocolOption::Version(_) => ProtocolOptionType::Version,
            ProtocolOption::MinimumVersion(_) => ProtocolOptionType::MinimumVersion,
            ProtocolOption::SwarmIdentifier(_) => ProtocolOptionType::SwarmIdentifier,
            ProtocolOption::ContentIntegrityProtectionMethod(_) => ProtocolOptionType::ContentIntegrityProtectionMethod,
            ProtocolOption::MerkleHashTreeFunction(_) => ProtocolOptionType::MerkleHashTreeFunction,
            ProtocolOption::LiveSignatureAlgorithm(_) => ProtocolOptionType::LiveSignatureAlgorithm,
            ProtocolOption::LiveWindow(_) => ProtocolOptionType::LiveWindow,
            ProtocolOption::ChunkSize(_) => ProtocolOptionType::ChunkSize,
            ProtocolOption::ChunksPerSignature(_) => ProtocolOptionType::ChunksPerSignature,
            ProtocolOption::StreamCount(_) => ProtocolOptionType::StreamCount,
            ProtocolOption::Epoch { .. } => ProtocolOptionType::Epoch,
        }
    }

    /// length of the payload, without the type byte
    pub fn serialized_len(&self) -> usize {
        match self {
            ProtocolOption::Version(_)
            | ProtocolOption::MinimumVersion(_)
            | ProtocolOption::ContentIntegrityProtectionMethod(_)
            | ProtocolOption::MerkleHashTreeFunction(_)
            | ProtocolOption::LiveSignatureAlgorithm(_) => 1,
            ProtocolOption::LiveWindow(_)
            | ProtocolOption::ChunkSize(_)
            | ProtocolOption::ChunksPerSignature(_) => 4,
            ProtocolOption::StreamCount(_) => 2,
            ProtocolOption::SwarmIdentifier(id) => 2 + id.len(),
            ProtocolOption::Epoch { timestamp, signature } => timestamp.serialized_len() + signature.len(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.option_type().into());
        match self {
            ProtocolOption::Version(v)
            | ProtocolOption::MinimumVersion(v)
            | ProtocolOption::ContentIntegrityProtectionMethod(v)
            | ProtocolOption::MerkleHashTreeFunction(v)
            | ProtocolOption::LiveSignatureAlgorithm(v) => buf.put_u8(*v),
            ProtocolOption::LiveWindow(v)
            | ProtocolOption::ChunkSize(v)
            | ProtocolOption::ChunksPerSignature(v) => buf.put_u32(*v),
            ProtocolOption::StreamCount(v) => buf.put_u16(*v),
            ProtocolOption::SwarmIdentifier(id) => {
                buf.put_u16(id.len() as u16);
                buf.put_slice(id);
            }
            ProtocolOption::Epoch { timestamp, signature } => {
                timestamp.ser(buf);
                buf.put_slice(signature);
            }
        }
    }

    fn deser(option_type: ProtocolOptionType, buf: &mut impl Buf, sizes: &MessageSizes) -> Result<ProtocolOption, CodecError> {
        Ok(match option_type {
            ProtocolOptionType::Version => ProtocolOption::Version(buf.try_get_u8()?),
            ProtocolOptionType::MinimumVersion => ProtocolOption::MinimumVersion(buf.try_get_u8()?),
            ProtocolOptionType::SwarmIdentifier => {
                let len = buf.try_get_u16()? as usize;
                ProtocolOption::SwarmIdentifier(try_get_bytes(buf, len)?)
            }
            ProtocolOptionType::ContentIntegrityProtectionMethod => ProtocolOption::ContentIntegrityProtectionMethod(buf.try_get_u8()?),
            ProtocolOptionType::MerkleHashTreeFunction => ProtocolOption::MerkleHashTreeFunction(buf.try_get_u8()?),
            ProtocolOptionType::LiveSignatureAlgorithm => ProtocolOption::LiveSignatureAlgorithm(buf.try_get_u8()?),
            ProtocolOptionType::LiveWindow => ProtocolOption::LiveWindow(buf.try_get_u32()?),
            ProtocolOptionType::ChunkSize => ProtocolOption::ChunkSize(buf.try_get_u32()?),
            ProtocolOptionType::ChunksPerSignature => ProtocolOption::ChunksPerSignature(buf.try_get_u32()?),
            ProtocolOptionType::StreamCount => ProtocolOption::StreamCount(buf.try_get_u16()?),
            ProtocolOptionType::Epoch => {
                let timestamp = Timestamp::deser(buf)?;
                let signature = try_get_bytes(buf, sizes.signature_size)?;
                ProtocolOption::Epoch { timestamp, signature }
            }
            ProtocolOptionType::End => return Err(CodecError::UnsupportedProtocolOption(ProtocolOptionType::End.into())),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Handshake {
    pub channel_id: u32,
    pub options: Vec<ProtocolOption>,
}

impl Handshake {
    pub fn new(channel_id: u32) -> Handshake {
        Handshake {
            channel_id,
            options: Vec::new(),
        }
    }

    pub fn find(&self, option_type: ProtocolOptionType) -> Option<&ProtocolOption> {
        self.options.iter()
            .find(|o| o.option_type() == option_type)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.channel_id);
        for option in &self.options {
            option.ser(buf);
        }
        buf.put_u8(ProtocolOptionType::End.into());
    }

    pub fn deser(buf: &mut impl Buf, sizes: &MessageSizes) -> Result<Handshake, CodecError> {
        let channel_id = buf.try_get_u32()?;
        let mut options = Vec::new();
        loop {
            let raw = buf.try_get_u8()?;
            let option_type = ProtocolOptionType::try_from(raw)
                .map_err(|_| CodecError::UnsupportedProtocolOption(raw))?;
            if option_type == ProtocolOptionType::End {
                break;
            }
            options.push(ProtocolOption::deser(option_type, buf, sizes)?);
        }
        Ok(Handshake { channel_id, options })
    }

    pub fn serialized_len(&self) -> usize {
        self.options.iter()
            .map(|o| o.serialized_len() + 1)
            .sum::<usize>() + 5
    }
}

/// One or more contiguous chunks. The payload length is implied by the address and the
///  swarm's chunk size.
#[derive(Clone, PartialEq, Eq)]
pub struct Data {
    pub address: Bin,
    pub timestamp: Timestamp,
    pub data: Bytes,
}

impl Data {
    pub fn ser(&self, buf: &mut impl BufMut) {
        put_address(buf, self.address);
        self.timestamp.ser(buf);
        buf.put_slice(&self.data);
    }

    /// NB: a payload shorter than the address implies is truncated to what is in the buffer
    pub fn deser(buf: &mut impl Buf, sizes: &MessageSizes) -> Result<Data, CodecError> {
        let address = try_get_address(buf)?;
        let timestamp = Timestamp::deser(buf)?;
        let len = (address.base_length() as usize)
            .saturating_mul(sizes.chunk_size)
            .min(buf.remaining());
        let data = buf.copy_to_bytes(len);
        Ok(Data { address, timestamp, data })
    }

    pub fn serialized_len(&self) -> usize {
        address_len(self.address) + self.timestamp.serialized_len() + self.data.len()
    }
}

impl Debug for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Data{{{}@{:?}:{}b}}", self.address, self.timestamp, self.data.len())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub address: Bin,
    pub delay_sample: Duration,
}

impl Ack {
    pub fn ser(&self, buf: &mut impl BufMut) {
        put_address(buf, self.address);
        put_delay(buf, self.delay_sample);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Ack, CodecError> {
        Ok(Ack {
            address: try_get_address(buf)?,
            delay_sample: try_get_delay(buf)?,
        })
    }

    pub fn serialized_len(&self) -> usize {
        address_len(self.address) + delay_len(self.delay_sample)
    }
}

/// An uncle hash in a Merkle tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Integrity {
    pub address: Bin,
    pub hash: Bytes,
}

impl Integrity {
    pub fn ser(&self, buf: &mut impl BufMut) {
        put_address(buf, self.address);
        buf.put_slice(&self.hash);
    }

    pub fn deser(buf: &mut impl Buf, sizes: &MessageSizes) -> Result<Integrity, CodecError> {
        Ok(Integrity {
            address: try_get_address(buf)?,
            hash: try_get_bytes(buf, sizes.hash_size)?,
        })
    }

    pub fn serialized_len(&self) -> usize {
        address_len(self.address) + self.hash.len()
    }

    /// upper bound for the length without the hash
    pub const fn header_len() -> usize {
        MAX_VARINT_LEN
    }
}

/// A signature over a munro root (or a single chunk) and its timestamp
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedIntegrity {
    pub address: Bin,
    pub timestamp: Timestamp,
    pub signature: Bytes,
}

impl SignedIntegrity {
    pub fn ser(&self, buf: &mut impl BufMut) {
        put_address(buf, self.address);
        self.timestamp.ser(buf);
        buf.put_slice(&self.signature);
    }

    pub fn deser(buf: &mut impl Buf, sizes: &MessageSizes) -> Result<SignedIntegrity, CodecError> {
        Ok(SignedIntegrity {
            address: try_get_address(buf)?,
            timestamp: Timestamp::deser(buf)?,
            signature: try_get_bytes(buf, sizes.signature_size)?,
        })
    }

    pub fn serialized_len(&self) -> usize {
        address_len(self.address) + self.timestamp.serialized_len() + self.signature.len()
    }

    /// upper bound for the length without the signature
    pub const fn header_len() -> usize {
        2 * MAX_VARINT_LEN
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub address: Bin,
    pub timestamp: Timestamp,
}

impl Request {
    pub fn ser(&self, buf: &mut impl BufMut) {
        put_address(buf, self.address);
        self.timestamp.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Request, CodecError> {
        Ok(Request {
            address: try_get_address(buf)?,
            timestamp: Timestamp::deser(buf)?,
        })
    }

    pub fn serialized_len(&self) -> usize {
        address_len(self.address) + self.timestamp.serialized_len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
    pub delay: u64,
}

/// the `(stream, address)` pair of stream subscription messages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamAddress {
    pub stream: u16,
    pub address: Bin,
}

impl StreamAddress {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.stream);
        put_address(buf, self.address);
    }

    fn deser(buf: &mut impl Buf) -> Result<StreamAddress, CodecError> {
        Ok(StreamAddress {
            stream: buf.try_get_u16()?,
            address: try_get_address(buf)?,
        })
    }

    fn serialized_len(&self) -> usize {
        2 + address_len(self.address)
    }
}

/// Every message of the protocol. [Message::End] terminates a frame early.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    Data(Data),
    Ack(Ack),
    Have(Bin),
    Integrity(Integrity),
    SignedIntegrity(SignedIntegrity),
    Request(Request),
    Cancel(Bin),
    Choke,
    Unchoke,
    Ping(u64),
    Pong(Pong),
    StreamRequest(StreamAddress),
    StreamCancel(u16),
    StreamOpen(StreamAddress),
    StreamClose(u16),
    Restart,
    End,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::Data(_) => MessageType::Data,
            Message::Ack(_) => MessageType::Ack,
            Message::Have(_) => MessageType::Have,
            Message::Integrity(_) => MessageType::Integrity,
            Message::SignedIntegrity(_) => MessageType::SignedIntegrity,
            Message::Request(_) => MessageType::Request,
            Message::Cancel(_) => MessageType::Cancel,
            Message::Choke => MessageType::Choke,
            Message::Unchoke => MessageType::Unchoke,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::StreamRequest(_) => MessageType::StreamRequest,
            Message::StreamCancel(_) => MessageType::StreamCancel,
            Message::StreamOpen(_) => MessageType::StreamOpen,
            Message::StreamClose(_) => MessageType::StreamClose,
            Message::Restart => MessageType::Restart,
            Message::End => MessageType::End,
        }
    }

    /// length of the payload, without the type byte
    pub fn serialized_len(&self) -> usize {
        match self {
            Message::Handshake(m) => m.serialized_len(),
            Message::Data(m) => m.serialized_len(),
            Message::Ack(m) => m.serialized_len(),
            Message::Have(b) | Message::Cancel(b) => address_len(*b),
            Message::Integrity(m) => m.serialized_len(),
            Message::SignedIntegrity(m) => m.serialized_len(),
            Message::Request(m) => m.serialized_len(),
            Message::Ping(_) => 8,
            Message::Pong(_) => 16,
            Message::StreamRequest(m) | Message::StreamOpen(m) => m.serialized_len(),
            Message::StreamCancel(_) | Message::StreamClose(_) => 2,
            Message::Choke | Message::Unchoke | Message::Restart | Message::End => 0,
        }
    }

    /// writes the type byte followed by the payload
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_type().into());
        match self {
            Message::Handshake(m) => m.ser(buf),
            Message::Data(m) => m.ser(buf),
            Message::Ack(m) => m.ser(buf),
            Message::Have(b) | Message::Cancel(b) => put_address(buf, *b),
            Message::Integrity(m) => m.ser(buf),
            Message::SignedIntegrity(m) => m.ser(buf),
            Message::Request(m) => m.ser(buf),
            Message::Ping(nonce) => buf.put_u64(*nonce),
            Message::Pong(m) => {
                buf.put_u64(m.nonce);
                buf.put_u64(m.delay);
            }
            Message::StreamRequest(m) | Message::StreamOpen(m) => m.ser(buf),
            Message::StreamCancel(s) | Message::StreamClose(s) => buf.put_u16(*s),
            Message::Choke | Message::Unchoke | Message::Restart | Message::End => {}
        }
    }

    /// reads the payload of a message whose type byte was already consumed
    pub fn deser(message_type: MessageType, buf: &mut impl Buf, sizes: &MessageSizes) -> Result<Message, CodecError> {
        Ok(match message_type {
            MessageType::Handshake => Message::Handshake(Handshake::deser(buf, sizes)?),
            MessageType::Data => Message::Data(Data::deser(buf, sizes)?),
            MessageType::Ack => Message::Ack(Ack::deser(buf)?),
            MessageType::Have => Message::Have(try_get_address(buf)?),
            MessageType::Integrity => Message::Integrity(Integrity::deser(buf, sizes)?),
            MessageType::SignedIntegrity => Message::SignedIntegrity(SignedIntegrity::deser(buf, sizes)?),
            MessageType::Request => Message::Request(Request::deser(buf)?),
            MessageType::Cancel => Message::Cancel(try_get_address(buf)?),
            MessageType::Choke => Message::Choke,
            MessageType::Unchoke => Message::Unchoke,
            MessageType::Ping => Message::Ping(buf.try_get_u64()?),
            MessageType::Pong => Message::Pong(Pong {
                nonce: buf.try_get_u64()?,
                delay: buf.try_get_u64()?,
            }),
            MessageType::StreamRequest => Message::StreamRequest(StreamAddress::deser(buf)?),
            MessageType::StreamCancel => Message::StreamCancel(buf.try_get_u16()?),
            MessageType::StreamOpen => Message::StreamOpen(StreamAddress::deser(buf)?),
            MessageType::StreamClose => Message::StreamClose(buf.try_get_u16()?),
            MessageType::Restart => Message::Restart,
            MessageType::End => Message::End,
        })
    }
}

/// Prefix of every channel frame on a peer connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelHeader {
    pub channel: u64,
    pub length: u16,
}

impl ChannelHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_varint(self.channel);
        buf.put_u16(self.length);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<ChannelHeader, CodecError> {
        let channel = buf.try_get_u64_varint()
            .map_err(|_| CodecError::MalformedVarint)?;
        let length = buf.try_get_u16()?;
        Ok(ChannelHeader { channel, length })
    }

    pub fn serialized_len(&self) -> usize {
        varint_len(self.channel) + 2
    }
}
