//! Wire format of the protocol.
//!
//! A datagram on a peer connection is a sequence of channel frames, each starting with a
//!  [ChannelHeader] (varint channel id, u16 BE payload length). The payload of a frame is a
//!  sequence of messages, each introduced by a one byte [MessageType] tag, terminated by
//!  [MessageType::End] or the end of the frame.
//!
//! Bin addresses are unsigned LEB128 varints, timestamps are zig-zag varints of milliseconds
//!  since the Unix epoch. Fixed width integers are big endian.

mod messages;
mod reader;
mod writer;

pub use messages::*;
pub use reader::{MessageHandler, MessageSizes, Reader};
#[cfg(test)] pub use reader::MockMessageHandler;
pub use writer::{Writer, MESSAGE_TYPE_LEN};

use std::fmt::{Debug, Formatter};
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use binmap::Bin;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("unsupported protocol option {0}")]
    UnsupportedProtocolOption(u8),
    #[error("buffer underflow")]
    BufferUnderflow,
    #[error("malformed varint")]
    MalformedVarint,
    #[error("write buffer has insufficient space for message")]
    NotEnoughSpace,
}

impl From<bytes::TryGetError> for CodecError {
    fn from(_: bytes::TryGetError) -> Self {
        CodecError::BufferUnderflow
    }
}

/// Wall clock time with millisecond precision, as it goes on the wire
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Timestamp(millis)
    }

    pub const fn from_millis(millis: i64) -> Timestamp {
        Timestamp(millis)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    /// NB: saturates at zero if `earlier` is actually later
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i64_varint(self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Timestamp, CodecError> {
        buf.try_get_i64_varint()
            .map(Timestamp)
            .map_err(|_| CodecError::MalformedVarint)
    }

    pub fn serialized_len(&self) -> usize {
        varint_len(zigzag(self.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_millis() as i64))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.as_millis() as i64))
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub const MAX_VARINT_LEN: usize = 10;

/// number of bytes of the LEB128 encoding of `v`
pub fn varint_len(v: u64) -> usize {
    let bits = 64 - v.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

pub fn put_address(buf: &mut impl BufMut, b: Bin) {
    buf.put_u64_varint(b.0);
}

pub fn try_get_address(buf: &mut impl Buf) -> Result<Bin, CodecError> {
    buf.try_get_u64_varint()
        .map(Bin)
        .map_err(|_| CodecError::MalformedVarint)
}

pub fn address_len(b: Bin) -> usize {
    varint_len(b.0)
}

pub fn put_delay(buf: &mut impl BufMut, d: Duration) {
    buf.put_i64_varint(d.as_millis() as i64);
}

pub fn try_get_delay(buf: &mut impl Buf) -> Result<Duration, CodecError> {
    let millis = buf.try_get_i64_varint()
        .map_err(|_| CodecError::MalformedVarint)?;
    Ok(Duration::from_millis(millis.max(0) as u64))
}

pub fn delay_len(d: Duration) -> usize {
    varint_len(zigzag(d.as_millis() as i64))
}

/// copies `len` bytes out of `buf`, failing if there are not enough
pub fn try_get_bytes(buf: &mut impl Buf, len: usize) -> Result<bytes::Bytes, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::BufferUnderflow);
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 1)]
    #[case::one_byte(127, 1)]
    #[case::two_bytes(128, 2)]
    #[case::three_bytes(1 << 14, 3)]
    #[case::max(u64::MAX, 10)]
    fn test_varint_len(#[case] value: u64, #[case] expected: usize) {
        assert_eq!(varint_len(value), expected);

        let mut buf = BytesMut::new();
        put_address(&mut buf, Bin(value));
        assert_eq!(buf.len(), expected);
        assert_eq!(try_get_address(&mut buf.freeze()).unwrap(), Bin(value));
    }

    #[rstest]
    #[case::epoch(0)]
    #[case::recent(1_700_000_000_000)]
    #[case::negative(-5)]
    fn test_timestamp(#[case] millis: i64) {
        let ts = Timestamp::from_millis(millis);
        let mut buf = BytesMut::new();
        ts.ser(&mut buf);
        assert_eq!(buf.len(), ts.serialized_len());
        assert_eq!(Timestamp::deser(&mut buf.freeze()).unwrap(), ts);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_millis(1000);
        assert_eq!((ts + Duration::from_millis(250)).millis(), 1250);
        assert_eq!((ts - Duration::from_millis(250)).millis(), 750);
        assert_eq!(ts.duration_since(Timestamp::from_millis(400)), Duration::from_millis(600));
        assert_eq!(Timestamp::from_millis(400).duration_since(ts), Duration::ZERO);
    }

    #[test]
    fn test_truncated_varint() {
        let mut buf = bytes::Bytes::from_static(&[0x80]);
        assert_eq!(try_get_address(&mut buf), Err(CodecError::MalformedVarint));
    }
}
