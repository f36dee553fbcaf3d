use std::io;
use std::sync::Arc;

use binmap::{Bin, BinMap};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::{ChannelVerifier, ChunkVerifier, IntegrityError, IntegrityWriter, MerkleHashTreeFunction, SignatureSigner, SignatureVerifier, SwarmVerifier};
use crate::codec::{Integrity, SignedIntegrity, Timestamp};
use crate::merkle::{Hasher, Tree};
use crate::store::StreamWriter;

/// Verified Merkle trees for the most recent signature windows ("munros"), in a ring indexed
///  by munro number.
pub struct MerkleSwarmVerifier {
    /// number of layers of a munro's tree including the base layer
    tree_height: u64,
    chunk_size: usize,
    hasher: Hasher,
    signature_verifier: Arc<dyn SignatureVerifier>,
    ring: Mutex<SegmentRing>,
    tree_pool: TreePool,
}

struct SegmentRing {
    head: u64,
    tail: u64,
    size: u64,
    mask: u64,
    next_generation: u64,
    slots: Vec<Option<SegmentSlot>>,
}

#[derive(Clone)]
struct SegmentSlot {
    generation: u64,
    segment: Arc<Mutex<Segment>>,
}

struct Segment {
    generation: u64,
    timestamp: Timestamp,
    signature: Bytes,
    tree: Option<Tree>,
}

impl SegmentSlot {
    /// Locks the segment if it still holds the tree it held when the slot was looked up, and
    ///  that tree covers `b`
    fn lock_if(&self, b: Bin) -> Option<MutexGuard<'_, Segment>> {
        let segment = self.segment.lock();
        if segment.generation != self.generation {
            debug!("segment was replaced while waiting for its lock");
            return None;
        }
        match &segment.tree {
            Some(tree) if tree.contains(b) => Some(segment),
            _ => None,
        }
    }
}

impl MerkleSwarmVerifier {
    pub fn new(
        live_discard_window: usize,
        chunk_size: usize,
        chunks_per_signature: usize,
        hash_tree_function: MerkleHashTreeFunction,
        signature_verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<MerkleSwarmVerifier, IntegrityError> {
        let size = ((live_discard_window / chunks_per_signature) as u64).max(1);
        Ok(MerkleSwarmVerifier {
            tree_height: chunks_per_signature.trailing_zeros() as u64 + 1,
            chunk_size,
            hasher: hash_tree_function.hasher()?,
            signature_verifier,
            ring: Mutex::new(SegmentRing {
                head: 0,
                tail: 0,
                size,
                mask: size - 1,
                next_generation: 0,
                slots: vec![None; size as usize],
            }),
            tree_pool: TreePool::new(size as usize),
        })
    }

    pub fn munro_layer(&self) -> u64 {
        self.tree_height - 1
    }

    pub fn munro(&self, b: Bin) -> Bin {
        Bin::new(self.tree_height - 1, b.0 >> self.tree_height)
    }

    /// an empty tree for the munro containing `b`
    pub(crate) fn tree(&self, b: Bin) -> Tree {
        let root = self.munro(b);
        match self.tree_pool.get_from_pool() {
            Some(mut tree) => {
                tree.reset(root);
                tree
            }
            None => Tree::new(root, self.chunk_size, self.hasher.clone()),
        }
    }

    fn segment(&self, b: Bin) -> Option<SegmentSlot> {
        let ring = self.ring.lock();
        let i = b.0 >> self.tree_height;
        if i >= ring.head || i < ring.tail {
            return None;
        }
        ring.slots[(i & ring.mask) as usize].clone()
    }

    /// Retains a tree whose root is covered by a valid signature. A tree for a munro that is
    ///  already retained is merged into it.
    pub(crate) fn store_segment(&self, timestamp: Timestamp, tree: Tree, signature: &[u8]) {
        let mut ring = self.ring.lock();

        let i = tree.root_bin().0 >> self.tree_height;
        if i < ring.tail {
            trace!("discarding tree for munro {} behind the tail", tree.root_bin());
            self.tree_pool.return_to_pool(tree);
            return;
        }

        let head = i + 1;
        if head > ring.head {
            if ring.head != 0 {
                let first = ring.head.max(head.saturating_sub(ring.size));
                for j in first..head {
                    let slot = (j & ring.mask) as usize;
                    self.free_slot(&mut ring, slot);
                }
            }
            ring.head = head;
            if ring.head > ring.size {
                ring.tail = ring.head - ring.size;
            }
        }

        let slot = (i & ring.mask) as usize;
        match &ring.slots[slot] {
            Some(existing) => {
                let mut segment = existing.segment.lock();
                match &mut segment.tree {
                    Some(retained) => {
                        retained.merge(&tree);
                        self.tree_pool.return_to_pool(tree);
                    }
                    None => segment.tree = Some(tree),
                }
            }
            None => {
                let generation = ring.next_generation;
                ring.next_generation += 1;
                ring.slots[slot] = Some(SegmentSlot {
                    generation,
                    segment: Arc::new(Mutex::new(Segment {
                        generation,
                        timestamp,
                        signature: Bytes::copy_from_slice(signature),
                        tree: Some(tree),
                    })),
                });
            }
        }
    }

    /// Empties a ring slot. Readers still holding the slot's segment see its generation change.
    fn free_slot(&self, ring: &mut SegmentRing, slot: usize) {
        if let Some(evicted) = ring.slots[slot].take() {
            let mut segment = evicted.segment.lock();
            segment.generation = ring.next_generation;
            ring.next_generation += 1;
            if let Some(tree) = segment.tree.take() {
                self.tree_pool.return_to_pool(tree);
            }
        }
    }

    fn verify_signature(&self, timestamp: Timestamp, root_hash: &[u8], signature: &[u8]) -> Result<(), IntegrityError> {
        if signature.len() != self.signature_verifier.size() {
            return Err(IntegrityError::SignatureTooShort);
        }
        if !self.signature_verifier.verify(timestamp, root_hash, signature) {
            return Err(IntegrityError::InvalidSignature);
        }
        Ok(())
    }
}

impl SwarmVerifier for MerkleSwarmVerifier {
    fn write_integrity(&self, b: Bin, have: &BinMap, writer: &mut dyn IntegrityWriter) -> Result<usize, IntegrityError> {
        let slot = self.segment(b)
            .ok_or(IntegrityError::MissingHashSubtree)?;
        let segment = slot.lock_if(b)
            .ok_or(IntegrityError::MissingHashSubtree)?;
        let Some(tree) = &segment.tree else {
            return Err(IntegrityError::MissingHashSubtree);
        };
        let root = tree.root_bin();

        let mut n = 0;
        if have.empty_at(root) {
            n += writer.write_signed_integrity(SignedIntegrity {
                address: root,
                timestamp: segment.timestamp,
                signature: segment.signature.clone(),
            })?;
        }

        let mut b = b;
        while b != root {
            let parent = b.parent();
            if !have.empty_at(parent) {
                break;
            }

            let uncle = b.sibling();
            n += writer.write_integrity(Integrity {
                address: uncle,
                hash: Bytes::copy_from_slice(tree.get(uncle)),
            })?;
            b = parent;
        }

        Ok(n)
    }

    fn channel_verifier(self: Arc<Self>) -> Box<dyn ChannelVerifier> {
        Box::new(MerkleChannelVerifier::new(self))
    }

    fn reset(&self) {
        let mut ring = self.ring.lock();
        ring.head = 0;
        ring.tail = 0;
        for slot in 0..ring.slots.len() {
            self.free_slot(&mut ring, slot);
        }
    }
}

/// Recycled trees, all with the same number of chunks
struct TreePool {
    trees: Mutex<Vec<Tree>>,
}

impl TreePool {
    fn new(max_pool_size: usize) -> TreePool {
        TreePool {
            trees: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    fn get_from_pool(&self) -> Option<Tree> {
        self.trees.lock().pop()
    }

    fn return_to_pool(&self, tree: Tree) {
        let mut trees = self.trees.lock();
        if trees.capacity() > trees.len() {
            trees.push(tree);
        }
        else {
            trace!("tree pool is full: discarding returned tree");
        }
    }
}

/// Collects the integrity messages a peer sends for one munro and checks data against them
pub struct MerkleChannelVerifier {
    chunk_verifier: MerkleChunkVerifier,
}

impl MerkleChannelVerifier {
    fn new(swarm_verifier: Arc<MerkleSwarmVerifier>) -> MerkleChannelVerifier {
        MerkleChannelVerifier {
            chunk_verifier: MerkleChunkVerifier {
                bin: Bin::NONE,
                swarm_verifier,
                timestamp: Timestamp::default(),
                signature: Vec::new(),
                tree: None,
            },
        }
    }
}

impl ChannelVerifier for MerkleChannelVerifier {
    fn chunk_verifier(&mut self, b: Bin) -> &mut dyn ChunkVerifier {
        let munro = self.chunk_verifier.swarm_verifier.munro(b);
        if self.chunk_verifier.bin != munro {
            self.chunk_verifier.reset(munro);
        }
        &mut self.chunk_verifier
    }
}

struct MerkleChunkVerifier {
    bin: Bin,
    swarm_verifier: Arc<MerkleSwarmVerifier>,
    timestamp: Timestamp,
    signature: Vec<u8>,
    tree: Option<Tree>,
}

impl MerkleChunkVerifier {
    fn reset(&mut self, munro: Bin) {
        if let Some(tree) = self.tree.take() {
            self.swarm_verifier.tree_pool.return_to_pool(tree);
        }
        let tree = self.swarm_verifier.tree(munro);
        self.bin = tree.root_bin();
        self.tree = Some(tree);
        self.signature.clear();
    }

    fn verify_with_segment(&mut self, b: Bin, data: &[u8]) -> Result<bool, IntegrityError> {
        let Some(tree) = self.tree.as_mut() else {
            return Err(IntegrityError::BinOutOfBounds(b));
        };
        if !self.bin.contains(b) {
            return Err(IntegrityError::BinOutOfBounds(b));
        }

        let slot = self.swarm_verifier.segment(b);
        let verified = match &slot {
            Some(slot) => {
                let segment = slot.lock_if(b)
                    .ok_or(IntegrityError::MissingHashSubtree)?;
                tree.verify(b, data, segment.tree.as_ref())?
            }
            None => tree.verify(b, data, None)?,
        };
        if verified {
            return Ok(true);
        }

        // the data is consistent with the munro root we computed: it needs a signature
        self.swarm_verifier.verify_signature(self.timestamp, tree.root_hash(), &self.signature)?;
        Ok(true)
    }
}

impl ChunkVerifier for MerkleChunkVerifier {
    fn set_signed_integrity(&mut self, _b: Bin, timestamp: Timestamp, signature: &[u8]) {
        self.timestamp = timestamp;
        self.signature.clear();
        self.signature.extend_from_slice(signature);
    }

    fn set_integrity(&mut self, b: Bin, hash: &[u8]) {
        if let Some(tree) = self.tree.as_mut() {
            if self.bin.contains(b) {
                tree.set(b, hash);
            }
        }
    }

    fn verify(&mut self, b: Bin, data: &[u8]) -> Result<bool, IntegrityError> {
        let result = self.verify_with_segment(b, data);
        if let Ok(true) = result {
            if let Some(tree) = self.tree.take() {
                self.swarm_verifier.store_segment(self.timestamp, tree, &self.signature);
            }
        }
        self.bin = Bin::NONE;
        result
    }
}

/// Signs the stream one munro at a time: every `chunks_per_signature` chunks are hashed into a
///  tree whose root is signed, and the tree is retained by the swarm verifier before the data
///  is passed on.
///
/// Data is buffered until a munro is complete. Flushing does not sign a partial munro.
pub struct MerkleWriter<W: StreamWriter> {
    munro_layer: u64,
    n: u64,
    block_size: usize,
    block: BytesMut,
    swarm_verifier: Arc<MerkleSwarmVerifier>,
    signer: Box<dyn SignatureSigner>,
    inner: W,
}

impl<W: StreamWriter> MerkleWriter<W> {
    pub fn new(swarm_verifier: Arc<MerkleSwarmVerifier>, signer: Box<dyn SignatureSigner>, chunks_per_signature: usize, chunk_size: usize, inner: W) -> MerkleWriter<W> {
        let block_size = chunks_per_signature * chunk_size;
        MerkleWriter {
            munro_layer: swarm_verifier.munro_layer(),
            n: 0,
            block_size,
            block: BytesMut::with_capacity(block_size),
            swarm_verifier,
            signer,
            inner,
        }
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    fn write_block(&mut self) -> io::Result<()> {
        let block = self.block.split().freeze();

        let b = Bin::new(self.munro_layer, self.n);
        self.n += 1;

        let timestamp = Timestamp::now();
        let mut tree = self.swarm_verifier.tree(b);
        tree.fill(b, &block)
            .map_err(io::Error::other)?;
        let signature = self.signer.sign(timestamp, tree.root_hash());
        trace!("signed munro {}", b);
        self.swarm_verifier.store_segment(timestamp, tree, &signature);

        self.inner.write_all(&block)
    }
}

impl<W: StreamWriter> io::Write for MerkleWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = (self.block_size - self.block.len()).min(rest.len());
            self.block.extend_from_slice(&rest[..n]);
            rest = &rest[n..];

            if self.block.len() == self.block_size {
                self.write_block()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: StreamWriter> StreamWriter for MerkleWriter<W> {
    fn reset(&mut self) {
        self.n = 0;
        self.block.clear();
        self.swarm_verifier.reset();
        self.inner.reset();
    }
}
