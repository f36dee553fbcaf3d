use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Free list of frame buffers shared by the channel writers of a peer connection. Every buffer
///  has room for one transport MTU.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn acquire(&self) -> BytesMut {
        if let Some(buffer) = self.buffers.lock().pop() {
            trace!("returning buffer from pool");
            return buffer;
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    /// Buffers that grew beyond the pool's buffer size are dropped rather than pooled
    pub fn release(&self, mut buffer: BytesMut) {
        if buffer.capacity() != self.buf_size {
            debug!("released buffer has capacity {} instead of {}: discarding", buffer.capacity(), self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding released buffer");
        }
    }
}
