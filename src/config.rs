use std::time::Duration;

use anyhow::bail;

use crate::codec::{MessageSizes, Writer};
use crate::integrity::{ProtectionMethod, SwarmVerifierOptions, VerifierOptions};

/// Where a joining peer starts reading a live stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// start half a live window behind the newest chunk that peers announce
    #[default]
    BestEffort,
    /// start at the newest chunk that peers announce
    LowLatency,
    /// start at the beginning of the stream
    Mandatory,
}

/// Role of the local node in a swarm
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SchedulingMethod {
    /// a regular peer that requests chunks and serves what it has
    #[default]
    Peer,
    /// the publisher: never requests, pushes subscribed streams to its peers
    Seed,
}

/// The parameters of a swarm. Everything except `label`, `delivery_mode` and
///  `scheduling_method` is part of the swarm's identity and is checked in the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwarmOptions {
    /// for logging only
    pub label: String,
    /// size of a chunk in bytes
    pub chunk_size: usize,
    /// number of chunks that are kept and exchanged, a power of two
    pub live_window: usize,
    /// number of chunks covered by one signature (Merkle tree protection), a power of two
    pub chunks_per_signature: usize,
    /// number of sub-streams the chunks are striped over for balancing, a power of two
    pub stream_count: usize,
    pub integrity: VerifierOptions,
    pub delivery_mode: DeliveryMode,
    pub scheduling_method: SchedulingMethod,
}

impl SwarmOptions {
    pub fn default_live() -> SwarmOptions {
        SwarmOptions {
            label: String::new(),
            chunk_size: 1024,
            live_window: 1 << 14,
            chunks_per_signature: 64,
            stream_count: 16,
            integrity: VerifierOptions::default(),
            delivery_mode: DeliveryMode::BestEffort,
            scheduling_method: SchedulingMethod::Peer,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk size must not be 0");
        }
        // a data message for one chunk plus its integrity must fit into a channel frame
        if self.chunk_size + self.verifier_options().max_message_bytes() > u16::MAX as usize / 2 {
            bail!("chunk size {} is too big for a channel frame", self.chunk_size);
        }
        if !self.live_window.is_power_of_two() {
            bail!("live window must be a power of two, was {}", self.live_window);
        }
        if !self.stream_count.is_power_of_two() || self.stream_count > u16::MAX as usize {
            bail!("stream count must be a power of two that fits into 16 bits, was {}", self.stream_count);
        }
        if self.stream_count > self.live_window {
            bail!("stream count {} exceeds the live window {}", self.stream_count, self.live_window);
        }
        if self.integrity.protection_method == ProtectionMethod::MerkleTree {
            if !self.chunks_per_signature.is_power_of_two() {
                bail!("chunks per signature must be a power of two, was {}", self.chunks_per_signature);
            }
            if self.chunks_per_signature > self.live_window {
                bail!("chunks per signature {} exceed the live window {}", self.chunks_per_signature, self.live_window);
            }
            self.integrity.hash_tree_function.hasher()?;
        }
        Ok(())
    }

    pub fn verifier_options(&self) -> SwarmVerifierOptions {
        SwarmVerifierOptions {
            live_discard_window: self.live_window,
            chunk_size: self.chunk_size,
            chunks_per_signature: self.chunks_per_signature,
            verifier: self.integrity,
        }
    }

    pub fn message_sizes(&self) -> MessageSizes {
        MessageSizes {
            chunk_size: self.chunk_size,
            hash_size: self.integrity.hash_tree_function.hash_size(),
            signature_size: self.integrity.signature_algorithm.signature_size(),
        }
    }
}

/// Timing of the scheduler's periodic work and of request timeouts
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// pruning of request and chunk announcement times
    pub gc_interval: Duration,
    /// re-evaluation of stream subscriptions
    pub stream_check_interval: Duration,
    /// minimum time between two restart messages to a peer that did not answer the handshake
    pub restart_cooldown: Duration,
    pub ping_interval: Duration,
    /// lower bound for the round trip time variance term of the request timeout
    pub min_rtt_var: Duration,
    pub max_request_timeout: Duration,
    /// upper bound for the congestion window in chunks
    pub max_congestion_window: u64,
}

impl SchedulerConfig {
    pub fn default_live() -> SchedulerConfig {
        SchedulerConfig {
            gc_interval: Duration::from_secs(5),
            stream_check_interval: Duration::from_secs(5),
            restart_cooldown: Duration::from_secs(1),
            ping_interval: Duration::from_secs(1),
            min_rtt_var: Duration::from_millis(200),
            max_request_timeout: Duration::from_millis(500),
            max_congestion_window: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gc_interval.is_zero() || self.stream_check_interval.is_zero() {
            bail!("scheduler intervals must not be zero");
        }
        if self.min_rtt_var >= self.max_request_timeout {
            bail!("minimum rtt variance must be smaller than the maximum request timeout");
        }
        if self.max_congestion_window < 2 {
            bail!("congestion window limit must be at least 2");
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::default_live()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunnerConfig {
    /// period of the shared ticker driving peer write loops and swarm schedulers
    pub tick_interval: Duration,
    pub qos_update_interval: Duration,
    pub min_qos_weight: u64,
    pub max_qos_weight: u64,
    /// number of frame buffers pooled per peer
    pub buffer_pool_size: usize,
    pub scheduler: SchedulerConfig,
}

impl RunnerConfig {
    pub fn default_live() -> RunnerConfig {
        RunnerConfig {
            tick_interval: Duration::from_millis(100),
            qos_update_interval: Duration::from_secs(1),
            min_qos_weight: 50,
            max_qos_weight: 1000,
            buffer_pool_size: 64,
            scheduler: SchedulerConfig::default_live(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        if self.qos_update_interval < self.tick_interval {
            bail!("qos update interval must not be shorter than the tick interval");
        }
        if self.min_qos_weight > self.max_qos_weight {
            bail!("minimum qos weight exceeds the maximum");
        }
        self.scheduler.validate()
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::default_live()
    }
}

/// size of the frames a channel writes into, bounded by the frame header's 16 bit length
pub fn frame_capacity(mtu: usize) -> usize {
    mtu.min(u16::MAX as usize)
}

/// a writer sized for one frame of a connection with the given MTU
pub fn frame_writer(mtu: usize) -> Writer {
    Writer::new(frame_capacity(mtu))
}
