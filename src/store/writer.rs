use std::io;
use std::sync::Arc;

use binmap::Bin;
use bytes::BytesMut;
use tracing::trace;

use super::{Buffer, Chunk, PubSub, StreamWriter};

/// Cuts the published stream into chunks and hands them to the swarm's subscribers. Bytes
///  that do not fill a chunk stay buffered until more data arrives.
pub struct ChunkWriter {
    chunk_size: usize,
    b: Bin,
    chunk: BytesMut,
    pubsub: Arc<PubSub>,
    buffer: Arc<Buffer>,
}

impl ChunkWriter {
    pub fn new(chunk_size: usize, pubsub: Arc<PubSub>, buffer: Arc<Buffer>) -> ChunkWriter {
        ChunkWriter {
            chunk_size,
            b: Bin(0),
            chunk: BytesMut::with_capacity(chunk_size),
            pubsub,
            buffer,
        }
    }

    /// the bin the next chunk is published at
    pub fn next_bin(&self) -> Bin {
        self.b
    }
}

impl io::Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = (self.chunk_size - self.chunk.len()).min(rest.len());
            self.chunk.extend_from_slice(&rest[..n]);
            rest = &rest[n..];

            if self.chunk.len() == self.chunk_size {
                let chunk = Chunk {
                    bin: self.b,
                    data: self.chunk.split().freeze(),
                };
                trace!("publishing chunk {}", chunk.bin);
                self.pubsub.publish(&chunk);
                self.b = self.b + 2;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StreamWriter for ChunkWriter {
    fn reset(&mut self) {
        self.b = Bin(0);
        self.chunk.clear();
        self.buffer.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BufferReader;
    use std::io::{Read, Write};

    fn setup() -> (ChunkWriter, Arc<Buffer>) {
        let buffer = Arc::new(Buffer::new(16, 4).unwrap());
        buffer.set_offset(Bin(0));
        let pubsub = Arc::new(PubSub::new());
        pubsub.subscribe(buffer.clone());
        (ChunkWriter::new(4, pubsub, buffer.clone()), buffer)
    }

    #[test]
    fn test_chunks_reach_buffer() {
        let (mut writer, buffer) = setup();
        writer.write_all(b"0123456789").unwrap();
        assert_eq!(writer.next_bin(), Bin(4));
        assert_eq!(buffer.next(), Bin(4));

        let mut reader = BufferReader::new(buffer);
        let mut out = [0u8; 16];
        assert_eq!(reader.read(&mut out).unwrap(), 8);
        assert_eq!(&out[..8], b"01234567");
    }

    #[test]
    fn test_reset() {
        let (mut writer, buffer) = setup();
        writer.write_all(b"012345").unwrap();
        writer.reset();
        assert!(buffer.empty());
        assert_eq!(writer.next_bin(), Bin(0));

        writer.write_all(b"abcd").unwrap();
        assert!(buffer.contains(Bin(0)));
    }
}
