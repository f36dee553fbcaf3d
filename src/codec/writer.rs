use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::{CodecError, Message};

pub const MESSAGE_TYPE_LEN: usize = 1;

/// Accumulates messages into a buffer of fixed capacity. A message that does not fit is
///  rejected with [CodecError::NotEnoughSpace] and nothing of it is written, so the caller
///  can flush and retry it in the next frame.
pub struct Writer {
    buf: BytesMut,
    capacity: usize,
}

impl Writer {
    pub fn new(capacity: usize) -> Writer {
        Writer {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the capacity for the next frame. Messages that were already written stay.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(self.buf.len());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn available(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn dirty(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Returns the number of bytes written, including the type byte
    pub fn write(&mut self, msg: &Message) -> Result<usize, CodecError> {
        let n = msg.serialized_len() + MESSAGE_TYPE_LEN;
        if n > self.available() {
            return Err(CodecError::NotEnoughSpace);
        }

        msg.ser(&mut self.buf);
        trace!("wrote {:?}", msg);
        Ok(n)
    }

    /// Takes the accumulated frame, leaving the writer empty
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmap::Bin;

    #[test]
    fn test_write_and_take() {
        let mut writer = Writer::new(16);
        assert!(!writer.dirty());
        assert_eq!(writer.write(&Message::Have(Bin(300))).unwrap(), 3);
        assert_eq!(writer.write(&Message::Choke).unwrap(), 1);
        assert!(writer.dirty());
        assert_eq!(writer.len(), 4);
        assert_eq!(writer.available(), 12);

        let frame = writer.take();
        assert_eq!(&frame[..], &[4, 0xac, 0x02, 9]);
        assert!(!writer.dirty());
        assert_eq!(writer.available(), 16);
    }

    #[test]
    fn test_not_enough_space_writes_nothing() {
        let mut writer = Writer::new(10);
        writer.write(&Message::Ping(1)).unwrap();
        assert_eq!(writer.write(&Message::Ping(2)), Err(CodecError::NotEnoughSpace));
        assert_eq!(writer.len(), 9);

        writer.reset();
        assert_eq!(writer.write(&Message::Ping(2)).unwrap(), 9);
    }

    #[test]
    fn test_set_capacity_keeps_content() {
        let mut writer = Writer::new(10);
        writer.write(&Message::Ping(1)).unwrap();
        writer.set_capacity(4);
        assert_eq!(writer.capacity(), 9);
        assert_eq!(writer.available(), 0);
    }
}
