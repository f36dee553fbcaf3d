use std::sync::Arc;

use binmap::{Bin, BinMap};

use super::{ChannelVerifier, ChunkVerifier, IntegrityError, IntegrityWriter, SwarmVerifier};
use crate::codec::Timestamp;

/// Accepts all data without proof. Only useful for trusted peers and tests.
pub struct NoneSwarmVerifier;

impl SwarmVerifier for NoneSwarmVerifier {
    fn write_integrity(&self, _b: Bin, _have: &BinMap, _writer: &mut dyn IntegrityWriter) -> Result<usize, IntegrityError> {
        Ok(0)
    }

    fn channel_verifier(self: Arc<Self>) -> Box<dyn ChannelVerifier> {
        Box::new(NoneChunkVerifier)
    }

    fn reset(&self) {}
}

struct NoneChunkVerifier;

impl ChannelVerifier for NoneChunkVerifier {
    fn chunk_verifier(&mut self, _b: Bin) -> &mut dyn ChunkVerifier {
        self
    }
}

impl ChunkVerifier for NoneChunkVerifier {
    fn set_signed_integrity(&mut self, _b: Bin, _timestamp: Timestamp, _signature: &[u8]) {}

    fn set_integrity(&mut self, _b: Bin, _hash: &[u8]) {}

    fn verify(&mut self, _b: Bin, _data: &[u8]) -> Result<bool, IntegrityError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::RecordingIntegrityWriter;

    #[test]
    fn test_accepts_everything() {
        let verifier = Arc::new(NoneSwarmVerifier);
        let mut messages = RecordingIntegrityWriter::default();
        assert_eq!(verifier.write_integrity(Bin(3), &BinMap::new(), &mut messages).unwrap(), 0);
        assert!(messages.signed.is_empty());

        let mut channel = verifier.channel_verifier();
        assert!(channel.chunk_verifier(Bin(0)).verify(Bin(0), b"anything").unwrap());
    }
}
