//! Data exchange core of a peer-to-peer live streaming protocol in the style of PPSPP
//!  (RFC 7574): swarms of peers exchanging the chunks of a live stream, verified with Merkle
//!  trees or per-chunk signatures, scheduled per peer with delay based congestion control.

pub mod buffer_pool;
pub mod channel;
pub mod codec;
pub mod config;
pub mod etcp;
pub mod integrity;
pub mod merkle;
pub mod peer;
pub mod runner;
pub mod safe_converter;
pub mod scheduler;
pub mod store;
pub mod stream_assigner;
pub mod swarm;
pub mod ticker;
pub mod uri;
pub mod util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
