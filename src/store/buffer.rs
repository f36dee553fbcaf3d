use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use binmap::{Bin, BinMap};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::{bin_byte, byte_bin, Chunk, ChunkConsumer, DataWriter, StoreError};
use crate::codec::{Data, Timestamp};

/// A ring of chunk slots holding the most recent part of the stream, addressed by bin.
///
/// The buffer tracks the first missing bin after the read position (`next`). Readers can read
///  everything up to there. If chunks arrive so far ahead that the ring wraps past `next`, the
///  readers are told [StoreError::BufferUnderrun] and must [BufferReader::recover] explicitly.
pub struct Buffer {
    state: Mutex<BufferState>,
    readable: Condvar,
}

struct BufferState {
    chunk_size: u64,
    mask: u64,
    /// span of the ring in bins
    size: u64,
    head: Bin,
    bins: BinMap,
    buf: Vec<u8>,
    ready: bool,
    next: Bin,
    /// changes whenever the read position jumps
    sem: u64,
    err: Option<StoreError>,
    /// pending wakeup per reader: `Ok` for new data, `Err` for a terminal condition
    readers: FxHashMap<u64, Option<Result<(), StoreError>>>,
    next_reader_id: u64,
}

impl BufferState {
    fn tail(&self) -> Bin {
        if self.next.is_none() {
            return Bin::NONE;
        }
        Bin(self.head.0 - self.size)
    }

    fn index(&self, b: Bin) -> usize {
        ((b.base_offset() & self.mask) * self.chunk_size) as usize
    }

    fn contains(&self, b: Bin) -> bool {
        self.tail() <= b.base_left() && b.base_right() < self.head && self.bins.filled_at(b)
    }

    /// byte offset of the tail, 0 until the buffer has a read position
    fn tail_byte(&self) -> u64 {
        let tail = self.tail();
        if tail.is_none() {
            return 0;
        }
        bin_byte(tail, self.chunk_size)
    }

    fn fallback_next(&self) -> Bin {
        self.bins.root_bin().base_right() + 2
    }

    /// wakes all readers, replacing whatever they have not seen yet
    fn swap_readable(&mut self, err: Option<StoreError>) {
        self.err = err.clone();
        let signal = match err {
            Some(e) => Err(e),
            None => Ok(()),
        };
        for pending in self.readers.values_mut() {
            *pending = Some(signal.clone());
        }
    }

    /// wakes readers that have no pending signal
    fn push_readable(&mut self) {
        self.err = None;
        for pending in self.readers.values_mut() {
            if pending.is_none() {
                *pending = Some(Ok(()));
            }
        }
    }

    fn set(&mut self, b: Bin, data: &[u8]) -> bool {
        let l = b.base_left();
        let r = b.base_right();
        if l.0 < self.head.0 - self.size {
            trace!("dropping chunk {} behind the tail", b);
            return false;
        }
        if self.head < r + 2 {
            self.head = r + 2;
        }

        let i = self.index(b);
        let n = data.len().min(self.buf.len() - i);
        self.buf[i..i + n].copy_from_slice(&data[..n]);
        self.bins.set(b);

        if self.next < self.tail() {
            debug!("buffer underrun: next {} behind tail {}", self.next, self.tail());
            self.swap_readable(Some(StoreError::BufferUnderrun));
            return true;
        }

        if b.contains(self.next) {
            let next = self.bins.find_empty_after(self.next);
            self.next = if next.is_none() { self.fallback_next() } else { next };
            self.push_readable();
            return true;
        }
        false
    }

    fn recover(&mut self) -> Result<(), StoreError> {
        match &self.err {
            Some(StoreError::BufferUnderrun) => {}
            Some(e) => return Err(e.clone()),
            None => return Ok(()),
        }

        let next = self.bins.find_filled_after(self.tail());
        if next.is_none() {
            return Err(StoreError::ReadOffsetNotFound);
        }

        self.head = next + self.size;
        self.bins.fill_before(next);

        let next = self.bins.find_empty_after(next);
        self.next = if next.is_none() { self.fallback_next() } else { next };

        self.sem += 1;
        self.swap_readable(None);
        Ok(())
    }
}

impl Buffer {
    /// `size` is the number of chunks and must be a power of two
    pub fn new(size: usize, chunk_size: usize) -> Result<Buffer, StoreError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(StoreError::InvalidSize(size));
        }

        Ok(Buffer {
            state: Mutex::new(BufferState {
                chunk_size: chunk_size as u64,
                mask: size as u64 - 1,
                size: size as u64 * 2,
                head: Bin(size as u64 * 2),
                bins: BinMap::new(),
                buf: vec![0; size * chunk_size],
                ready: false,
                next: Bin::NONE,
                sem: 0,
                err: None,
                readers: FxHashMap::default(),
                next_reader_id: 0,
            }),
            readable: Condvar::new(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.state.lock().chunk_size as usize
    }

    /// Discards the content, e.g. because the publisher restarted the stream. Readers get
    ///  [StoreError::StreamReset] once and continue reading from the start.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.bins.empty() {
            return;
        }

        state.head = Bin(state.size);
        state.bins = BinMap::new();
        state.next = Bin(0);
        state.sem += 1;
        state.ready = false;

        state.swap_readable(Some(StoreError::StreamReset));
        state.err = None;
        self.readable.notify_all();
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.swap_readable(Some(StoreError::Closed));
        state.ready = true;
        self.readable.notify_all();
    }

    pub fn write_data(&self, b: Bin, timestamp: Timestamp, writer: &mut dyn DataWriter) -> Result<usize, StoreError> {
        let state = self.state.lock();
        if !state.contains(b) {
            return Err(StoreError::BinDataNotSet);
        }

        let i = state.index(b);
        let len = (b.base_length() * state.chunk_size) as usize;
        let data = Bytes::copy_from_slice(&state.buf[i..i + len]);
        drop(state);

        Ok(writer.write_data(Data { address: b, timestamp, data })?)
    }

    /// Sets the read position to the start of the contiguous run of data that includes `b`,
    ///  and `next` to the first missing bin at or after `b`. Everything before the read
    ///  position is treated as present.
    pub fn set_offset(&self, b: Bin) {
        let mut state = self.state.lock();
        state.sem += 1;

        let mut b = b.base_left();
        let next = state.bins.find_empty_after(b);
        let mut prev = next;
        while state.bins.filled_at(b) {
            b = state.bins.cover(b).base_left();
            prev = b;
            b = b.layer_left();
        }

        debug!("read offset set to {}, next {}", prev, next);
        state.next = next;
        state.head = prev + state.size;
        state.bins.fill_before(prev);
        state.ready = true;
        state.swap_readable(None);
        self.readable.notify_all();
    }

    pub fn empty(&self) -> bool {
        self.state.lock().bins.empty()
    }

    /// the chunks that are present and inside the ring
    pub fn bins(&self) -> BinMap {
        let state = self.state.lock();
        let tail = state.tail();
        if tail.is_none() {
            return BinMap::new();
        }
        let mut bins = state.bins.clone();
        bins.reset_before(tail);
        bins
    }

    pub fn tail(&self) -> Bin {
        self.state.lock().tail()
    }

    pub fn next(&self) -> Bin {
        self.state.lock().next
    }

    pub fn contains(&self, b: Bin) -> bool {
        self.state.lock().contains(b)
    }
}

impl ChunkConsumer for Buffer {
    fn consume(&self, chunk: &Chunk) {
        let mut state = self.state.lock();
        if state.set(chunk.bin, &chunk.data) {
            self.readable.notify_all();
        }
    }
}

/// Stops a blocked [BufferReader::read] from another thread
#[derive(Clone)]
pub struct ReadStopper {
    stopped: Arc<AtomicBool>,
    buffer: Arc<Buffer>,
}

impl ReadStopper {
    pub fn stop(&self) {
        let _state = self.buffer.state.lock();
        self.stopped.store(true, Ordering::Release);
        self.buffer.readable.notify_all();
    }
}

/// A reader of the contiguous stream in a [Buffer]. Several readers can read the same buffer
///  independently.
pub struct BufferReader {
    buffer: Arc<Buffer>,
    id: u64,
    sem: u64,
    prev: Bin,
    off: u64,
    err: Option<StoreError>,
    stopped: Arc<AtomicBool>,
}

impl BufferReader {
    pub fn new(buffer: Arc<Buffer>) -> BufferReader {
        let (id, sem, prev, off, err) = {
            let mut state = buffer.state.lock();
            let id = state.next_reader_id;
            state.next_reader_id += 1;
            state.readers.insert(id, None);
            (id, state.sem, state.tail(), state.tail_byte(), state.err.clone())
        };

        BufferReader {
            buffer,
            id,
            sem,
            prev,
            off,
            err,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stopper(&self) -> ReadStopper {
        ReadStopper {
            stopped: self.stopped.clone(),
            buffer: self.buffer.clone(),
        }
    }

    /// catches up with a jump of the buffer's read position
    fn sync(&mut self, state: &BufferState) {
        if self.sem != state.sem {
            self.sem = state.sem;
            self.prev = state.tail();
            self.off = state.tail_byte();
            self.err = state.err.clone();
        }
    }

    /// Rewinds to the oldest data in the buffer
    pub fn unread(&mut self) {
        let mut state = self.buffer.state.lock();
        if state.next.is_none() {
            return;
        }

        self.prev = state.tail();
        self.off = state.tail_byte();
        if let Some(pending) = state.readers.get_mut(&self.id) {
            *pending = Some(Ok(()));
        }
        self.buffer.readable.notify_all();
    }

    /// The byte offset of the next read in the stream. Blocks until the buffer has a read
    ///  position.
    pub fn offset(&mut self) -> u64 {
        let buffer = self.buffer.clone();
        let mut state = buffer.state.lock();
        while !state.ready {
            buffer.readable.wait(&mut state);
        }
        self.sync(&state);
        self.off
    }

    /// Skips to the next data after a [StoreError::BufferUnderrun]. Returns the number of bytes
    ///  that were skipped.
    pub fn recover(&mut self) -> Result<u64, StoreError> {
        match &self.err {
            Some(StoreError::BufferUnderrun) => {}
            Some(e) => return Err(e.clone()),
            None => return Ok(0),
        }

        let buffer = self.buffer.clone();
        let mut state = buffer.state.lock();
        if self.sem == state.sem {
            state.recover()?;
            buffer.readable.notify_all();
        }
        if let Some(pending) = state.readers.get_mut(&self.id) {
            *pending = None;
        }

        let off = self.off;
        self.sync(&state);
        if !state.next.is_none() && self.off < state.tail_byte() {
            // this reader fell behind the ring on its own
            self.prev = state.tail();
            self.off = state.tail_byte();
        }
        self.err = None;
        Ok(self.off.saturating_sub(off))
    }

    pub fn read(&mut self, p: &mut [u8]) -> Result<usize, StoreError> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }

        let buffer = self.buffer.clone();
        let mut state = buffer.state.lock();
        loop {
            match state.readers.get_mut(&self.id).and_then(|s| s.take()) {
                Some(Err(e)) => {
                    self.err = Some(e.clone());
                    if e == StoreError::StreamReset {
                        // the reader continues at the start of the new stream
                        self.err = None;
                        self.sync(&state);
                    }
                    return Err(e);
                }
                Some(Ok(())) => continue,
                None => {}
            }

            self.sync(&state);
            if !state.next.is_none() && self.off < state.tail_byte() {
                debug!("reader at {} overtaken by the ring tail {}", self.off, state.tail());
                self.err = Some(StoreError::BufferUnderrun);
                return Err(StoreError::BufferUnderrun);
            }
            if !state.next.is_none() && state.next != self.prev {
                break;
            }
            if self.stopped.load(Ordering::Acquire) {
                return Err(StoreError::Stopped);
            }
            buffer.readable.wait(&mut state);
        }

        let n = Self::copy_out(&state, self.off, p);
        self.off += n as u64;
        self.prev = byte_bin(self.off, state.chunk_size);
        Ok(n)
    }

    /// copies from the contiguous data between the read offset and `next`, which may wrap
    ///  around the end of the ring
    fn copy_out(state: &MutexGuard<'_, BufferState>, off: u64, p: &mut [u8]) -> usize {
        let tail = state.tail();
        let l = (off - state.tail_byte()) as usize;
        let h = bin_byte(Bin(state.next.0 - tail.0), state.chunk_size) as usize;
        let n = (h - l).min(p.len());

        let i = state.index(tail);
        let ring = state.buf.len();
        for (k, dst) in p[..n].iter_mut().enumerate() {
            *dst = state.buf[(i + l + k) % ring];
        }
        n
    }

    /// Stops reading. Later reads fail with [StoreError::Closed].
    pub fn close(&mut self) {
        if self.err == Some(StoreError::Closed) {
            return;
        }
        self.buffer.state.lock().readers.remove(&self.id);
        self.err = Some(StoreError::Closed);
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BufferReader::read(self, buf)
            .map_err(io::Error::other)
    }
}
