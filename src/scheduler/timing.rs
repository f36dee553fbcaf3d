use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use binmap::Bin;

/// Times attached to non-overlapping bins, e.g. when a chunk was first announced or when it
///  was requested. Lookups find the entry covering a bin.
#[derive(Debug, Default)]
pub struct TimeSet {
    /// keyed by the base left of the entry's bin
    entries: BTreeMap<u64, (Bin, Instant)>,
}

impl TimeSet {
    pub fn new() -> TimeSet {
        TimeSet::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// the entry covering `b`
    pub fn get(&self, b: Bin) -> Option<(Bin, Instant)> {
        self.entries.range(..=b.base_left().0)
            .next_back()
            .map(|(_, e)| *e)
            .filter(|(eb, _)| eb.contains(b))
    }

    /// Records `t` for `b`, replacing entries inside `b` and the entry covering it
    pub fn set(&mut self, b: Bin, t: Instant) {
        if let Some((eb, _)) = self.get(b) {
            self.entries.remove(&eb.base_left().0);
        }
        self.remove_inside(b);
        self.entries.insert(b.base_left().0, (b, t));
    }

    /// Records `t` for `b` unless some part of `b` already has a time
    pub fn set_first(&mut self, b: Bin, t: Instant) {
        if self.get(b).is_some() || self.entries.range(b.base_left().0..=b.base_right().0).next().is_some() {
            return;
        }
        self.entries.insert(b.base_left().0, (b, t));
    }

    pub fn unset(&mut self, b: Bin) {
        if let Some((eb, _)) = self.get(b) {
            self.entries.remove(&eb.base_left().0);
        }
        self.remove_inside(b);
    }

    /// removes the entries that end before `threshold`
    pub fn prune(&mut self, threshold: Bin) {
        let threshold = threshold.base_left().0;
        let stale: Vec<u64> = self.entries.range(..threshold)
            .filter(|(_, (b, _))| b.base_right().0 < threshold)
            .map(|(k, _)| *k)
            .collect();
        for k in stale {
            self.entries.remove(&k);
        }
    }

    fn remove_inside(&mut self, b: Bin) {
        let inside: Vec<u64> = self.entries.range(b.base_left().0..=b.base_right().0)
            .map(|(k, _)| *k)
            .collect();
        for k in inside {
            self.entries.remove(&k);
        }
    }
}

/// Bins with deadlines in the order they were pushed, e.g. the timeouts of requests
#[derive(Debug, Default)]
pub struct BinQueue {
    entries: VecDeque<(Bin, Instant)>,
}

impl BinQueue {
    pub fn new() -> BinQueue {
        BinQueue::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// NB: deadlines are expected to be pushed in ascending order
    pub fn push(&mut self, b: Bin, deadline: Instant) {
        self.entries.push_back((b, deadline));
    }

    /// removes and returns the bins whose deadline is before `t`
    pub fn pop_due(&mut self, t: Instant) -> Vec<Bin> {
        let mut due = Vec::new();
        while let Some(&(b, deadline)) = self.entries.front() {
            if deadline >= t {
                break;
            }
            due.push(b);
            self.entries.pop_front();
        }
        due
    }

    /// removes and returns all bins
    pub fn drain(&mut self) -> Vec<Bin> {
        self.entries.drain(..).map(|(b, _)| b).collect()
    }
}
