//! Local storage of the stream: a ring buffer of recent chunks with blocking readers, and the
//!  fan-out of newly arrived chunks to everyone interested in them.

mod buffer;
mod pubsub;
mod writer;

pub use buffer::{Buffer, BufferReader, ReadStopper};
pub use pubsub::PubSub;
pub use writer::ChunkWriter;

use std::io;

use binmap::Bin;
use bytes::Bytes;

use crate::codec::{CodecError, Data};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("buffer underrun")]
    BufferUnderrun,
    #[error("stream reset")]
    StreamReset,
    #[error("bin data not set")]
    BinDataNotSet,
    #[error("cannot read from closed buffer")]
    Closed,
    #[error("viable read offset not found")]
    ReadOffsetNotFound,
    #[error("read stopped")]
    Stopped,
    #[error("buffer size must be a power of two, was {0}")]
    InvalidSize(usize),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One or more contiguous chunks of the stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub bin: Bin,
    pub data: Bytes,
}

pub trait ChunkConsumer: Send + Sync {
    fn consume(&self, chunk: &Chunk);
}

/// Where the data of a [Buffer] goes when it is sent to a peer
pub trait DataWriter {
    fn write_data(&mut self, msg: Data) -> Result<usize, CodecError>;
}

/// The publishing side of a stream: a byte sink that can start the stream over
pub trait StreamWriter: io::Write + Send {
    fn reset(&mut self);
}

/// byte offset of bin `b` in the stream
pub fn bin_byte(b: Bin, chunk_size: u64) -> u64 {
    (b.0 / 2) * chunk_size
}

/// the base bin containing byte offset `n` of the stream
pub fn byte_bin(n: u64, chunk_size: u64) -> Bin {
    Bin(n / chunk_size * 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::start(Bin(0), 0)]
    #[case::second(Bin(2), 16)]
    #[case::layer(Bin(5), 32)]
    fn test_bin_byte(#[case] b: Bin, #[case] expected: u64) {
        assert_eq!(bin_byte(b, 16), expected);
    }

    #[rstest]
    #[case::start(0, Bin(0))]
    #[case::inside_first(15, Bin(0))]
    #[case::second(16, Bin(2))]
    #[case::inside_second(31, Bin(2))]
    fn test_byte_bin(#[case] n: u64, #[case] expected: Bin) {
        assert_eq!(byte_bin(n, 16), expected);
    }
}
