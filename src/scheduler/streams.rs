//! Live sub-streams: the chunks of a swarm are striped round robin over `stream_count` streams
//!  so that different peers can deliver different streams.

use std::sync::Arc;
use std::time::{Duration, Instant};

use binmap::Bin;

use crate::peer::PeerId;
use crate::util::sma::Sma;
use crate::util::welford::Welford;

/// Mapping between bins and streams. Base bin `b` belongs to stream `(b / 2) % stream_count`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamLayout {
    stream_count: u16,
    stream_layer: u32,
    stream_bits: u64,
}

impl StreamLayout {
    /// NB: `stream_count` must be a power of two, see [crate::config::SwarmOptions::validate]
    pub fn new(stream_count: u16) -> StreamLayout {
        StreamLayout {
            stream_count,
            stream_layer: stream_count.trailing_zeros(),
            stream_bits: stream_count as u64 - 1,
        }
    }

    pub fn stream_count(&self) -> u16 {
        self.stream_count
    }

    pub fn bin_stream(&self, b: Bin) -> u16 {
        ((b.0 >> 1) & self.stream_bits) as u16
    }

    /// position of base bin `b` within its stream
    pub fn bin_stream_offset(&self, b: Bin) -> u64 {
        b.0 >> (self.stream_layer + 1)
    }

    /// the first base bin of `stream` at or after `start`
    pub fn first_stream_bin(&self, stream: u16, start: Bin) -> Bin {
        let round = self.stream_count as u64 * 2;
        let b = start.0 / round * round + stream as u64 * 2;
        if b < start.0 {
            Bin(b + round)
        }
        else {
            Bin(b)
        }
    }

    /// the base bins of `stream` from `start` up to and including `end`
    pub fn stream_bins(&self, stream: u16, start: Bin, end: Bin) -> impl Iterator<Item = Bin> {
        let round = self.stream_count as u64 * 2;
        let first = self.first_stream_bin(stream, start);
        (0..)
            .map(move |i| first + i * round)
            .take_while(move |b| *b <= end && !end.is_none())
    }
}

/// Sliding window over the positions of a stream's chunks that arrived. `next` is the first
///  position that is still missing, bit `i` of `m` stands for position `next + i`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReceivedChunks {
    m: u64,
    next: u64,
    max: u64,
}

impl ReceivedChunks {
    pub fn starting_at(offset: u64) -> ReceivedChunks {
        ReceivedChunks {
            m: 0,
            next: offset,
            max: offset,
        }
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Returns `(unique, ok)`: `unique` if the chunk was not seen before, `ok` unless it
    ///  arrived too far ahead of the first missing chunk to be tracked.
    pub fn add(&mut self, offset: u64) -> (bool, bool) {
        if offset == self.next && offset == self.max {
            self.next += 1;
            self.max += 1;
            return (true, true);
        }

        if offset < self.next {
            return (false, true);
        }

        let Some(bit) = 1u64.checked_shl((offset - self.next).min(64) as u32) else {
            return (false, false);
        };

        if self.m & bit != 0 {
            return (false, true);
        }
        self.m |= bit;

        if offset == self.next {
            let n = (!self.m).trailing_zeros();
            self.m = self.m.checked_shr(n).unwrap_or(0);
            self.next += n as u64;
        }
        if offset >= self.max {
            self.max = offset + 1;
        }

        (true, true)
    }
}

/// A peer that receives a stream, starting at `start_bin`
pub struct StreamSubscriber<C> {
    pub start_bin: Bin,
    pub peer: PeerId,
    pub channel: Arc<C>,
}

impl<C> Clone for StreamSubscriber<C> {
    fn clone(&self) -> Self {
        StreamSubscriber {
            start_bin: self.start_bin,
            peer: self.peer.clone(),
            channel: self.channel.clone(),
        }
    }
}

/// The peer a stream is received from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSource {
    pub start_bin: Bin,
    pub peer: PeerId,
}

/// What a swarm scheduler knows about one of its streams
pub struct StreamState<C> {
    pub received: ReceivedChunks,
    pub source: Option<StreamSource>,
    pub received_chunk_rate: Sma,
    /// delay between the first announcement of a chunk by any peer and its arrival here
    pub received_chunk_lag: Welford,
    pub peer_have_max: Bin,
    pub subscribers: Vec<StreamSubscriber<C>>,
}

impl<C> StreamState<C> {
    pub fn new() -> StreamState<C> {
        StreamState {
            received: ReceivedChunks::default(),
            source: None,
            received_chunk_rate: Sma::new(50, Duration::from_millis(200)),
            received_chunk_lag: Welford::new(),
            peer_have_max: Bin(0),
            subscribers: Vec::new(),
        }
    }

    pub fn set_source(&mut self, peer: PeerId, start_bin: Bin, offset: u64) {
        self.source = Some(StreamSource { start_bin, peer });
        self.received = ReceivedChunks::starting_at(offset);
    }

    pub fn reset_source(&mut self) {
        self.source = None;
    }

    pub fn is_source(&self, peer: &PeerId) -> bool {
        self.source.as_ref().is_some_and(|s| &s.peer == peer)
    }

    pub fn add_received_chunk(&mut self, offset: u64, t: Instant, lag: Duration) {
        if self.source.is_some() {
            self.received_chunk_rate.add_with_time(1, t);
            self.received.add(offset);
        }
        self.received_chunk_lag.update(lag.as_nanos() as f64);
    }

    pub fn update_peer_have_max(&mut self, b: Bin) {
        if b > self.peer_have_max {
            self.peer_have_max = b;
        }
    }

    /// replaces an existing subscription of the same peer
    pub fn add_subscriber(&mut self, peer: PeerId, channel: Arc<C>, start_bin: Bin) {
        self.remove_subscriber(&peer);
        self.subscribers.push(StreamSubscriber { start_bin, peer, channel });
    }

    pub fn remove_subscriber(&mut self, peer: &PeerId) {
        if let Some(i) = self.subscribers.iter().position(|s| &s.peer == peer) {
            self.subscribers.swap_remove(i);
        }
    }
}

impl<C> Default for StreamState<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub fn new_streams<C>(stream_count: u16) -> Vec<StreamState<C>> {
    (0..stream_count).map(|_| StreamState::new()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;

    #[rstest]
    #[case::first(Bin(0), 0, 0)]
    #[case::second_stream(Bin(2), 1, 0)]
    #[case::wraps(Bin(8), 0, 1)]
    #[case::last(Bin(14), 3, 1)]
    fn test_stream_layout(#[case] b: Bin, #[case] stream: u16, #[case] offset: u64) {
        let layout = StreamLayout::new(4);
        assert_eq!(layout.bin_stream(b), stream);
        assert_eq!(layout.bin_stream_offset(b), offset);
    }

    #[rstest]
    #[case::aligned(1, Bin(0), Bin(2))]
    #[case::before_start(1, Bin(4), Bin(10))]
    #[case::at_start(2, Bin(12), Bin(12))]
    fn test_first_stream_bin(#[case] stream: u16, #[case] start: Bin, #[case] expected: Bin) {
        assert_eq!(StreamLayout::new(4).first_stream_bin(stream, start), expected);
    }

    #[test]
    fn test_stream_bins() {
        let bins: Vec<Bin> = StreamLayout::new(4).stream_bins(1, Bin(4), Bin(26)).collect();
        assert_eq!(bins, vec![Bin(10), Bin(18), Bin(26)]);
    }

    #[test]
    fn test_received_chunks_in_order() {
        let mut r = ReceivedChunks::starting_at(5);
        assert_eq!(r.add(5), (true, true));
        assert_eq!(r.add(6), (true, true));
        assert_eq!((r.next(), r.max()), (7, 7));
        assert_eq!(r.add(6), (false, true));
    }

    #[test]
    fn test_received_chunks_out_of_order() {
        let mut r = ReceivedChunks::starting_at(0);
        assert_eq!(r.add(2), (true, true));
        assert_eq!((r.next(), r.max()), (0, 3));
        assert_eq!(r.add(2), (false, true));
        assert_eq!(r.add(1), (true, true));
        assert_eq!(r.add(0), (true, true));
        assert_eq!((r.next(), r.max()), (3, 3));
    }

    #[rstest]
    #[case::edge_of_window(63, (true, true))]
    #[case::beyond_window(64, (false, false))]
    #[case::far_beyond(1000, (false, false))]
    fn test_received_chunks_window(#[case] offset: u64, #[case] expected: (bool, bool)) {
        let mut r = ReceivedChunks::starting_at(0);
        r.add(1);
        assert_eq!(r.add(offset), expected);
    }

    #[test]
    fn test_subscribers() {
        let mut s: StreamState<()> = StreamState::new();
        let a = Bytes::from_static(b"a");
        let b = Bytes::from_static(b"b");
        s.add_subscriber(a.clone(), Arc::new(()), Bin(0));
        s.add_subscriber(b.clone(), Arc::new(()), Bin(2));
        s.add_subscriber(a.clone(), Arc::new(()), Bin(4));
        assert_eq!(s.subscribers.len(), 2);
        assert!(s.subscribers.iter().any(|s| s.peer == a && s.start_bin == Bin(4)));

        s.remove_subscriber(&a);
        assert_eq!(s.subscribers.len(), 1);
        assert_eq!(s.subscribers[0].peer, b);
    }
}
