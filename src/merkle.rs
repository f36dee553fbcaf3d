//! Merkle hash trees over a contiguous range of chunks, addressed by bin.

use binmap::Bin;
use sha2::{Digest, Sha256, Sha512};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("hash mismatch")]
    HashMismatch,
    #[error("bin {0} is outside of the tree")]
    OutOfBounds(Bin),
    #[error("expected {expected} bytes of data, got {actual}")]
    DataTooShort { expected: usize, actual: usize },
}

/// The hash functions that can back a tree
#[derive(Clone)]
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn sha256() -> Hasher {
        Hasher::Sha256(Sha256::new())
    }

    pub fn sha512() -> Hasher {
        Hasher::Sha512(Sha512::new())
    }

    pub fn blake3() -> Hasher {
        Hasher::Blake3(Box::new(blake3::Hasher::new()))
    }

    pub fn size(&self) -> usize {
        match self {
            Hasher::Sha256(_) => 32,
            Hasher::Sha512(_) => 64,
            Hasher::Blake3(_) => blake3::OUT_LEN,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => Digest::update(h, data),
            Hasher::Sha512(h) => Digest::update(h, data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// writes the digest of everything hashed so far to `out` and starts over
    pub fn finalize_into(&mut self, out: &mut [u8]) {
        match self {
            Hasher::Sha256(h) => out.copy_from_slice(&h.finalize_reset()),
            Hasher::Sha512(h) => out.copy_from_slice(&h.finalize_reset()),
            Hasher::Blake3(h) => {
                out.copy_from_slice(h.finalize().as_bytes());
                h.reset();
            }
        }
    }
}

/// A tree of hashes below `root_bin`. Digests are stored in a flat array indexed by the bin's
///  distance from the tree's leftmost base bin. A separate bit mask tracks which digests are
///  verified, i.e. known to be consistent with a signed root.
///
/// Verification runs against an optional reference tree holding previously verified digests:
///  the tree being checked only needs to be consistent with the reference, not signed itself.
#[derive(Clone)]
pub struct Tree {
    hasher: Hasher,
    chunk_size: usize,
    root_bin: Bin,
    base_left: Bin,
    verified: Vec<u64>,
    digests: Vec<u8>,
}

impl Tree {
    pub fn new(root_bin: Bin, chunk_size: usize, hasher: Hasher) -> Tree {
        let base_length = root_bin.base_length() as usize;
        let hash_size = hasher.size();
        Tree {
            hasher,
            chunk_size,
            root_bin,
            base_left: root_bin.base_left(),
            verified: vec![0; (base_length * 2).div_ceil(64)],
            digests: vec![0; (base_length * 2 - 1) * hash_size],
        }
    }

    /// Moves the tree to a different root of the same size and forgets what was verified
    pub fn reset(&mut self, root_bin: Bin) {
        assert_eq!(self.root_bin.base_length(), root_bin.base_length(), "reset cannot change the size of a tree");

        self.root_bin = root_bin;
        self.base_left = root_bin.base_left();
        self.verified.fill(0);
    }

    pub fn root_bin(&self) -> Bin {
        self.root_bin
    }

    pub fn root_hash(&self) -> &[u8] {
        self.get(self.root_bin)
    }

    pub fn hash_size(&self) -> usize {
        self.hasher.size()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn contains(&self, b: Bin) -> bool {
        self.root_bin.contains(b)
    }

    /// Copies verified digests from `other` to where this tree has none. Both trees must have
    ///  the same root.
    pub fn merge(&mut self, other: &Tree) {
        let s = self.hash_size();
        for (i, (mine, theirs)) in self.verified.iter_mut().zip(other.verified.iter()).enumerate() {
            let mut added = theirs & !*mine;
            *mine |= theirs;

            let mut j = 0;
            while added != 0 {
                let n = added.trailing_zeros() as usize;
                added >>= n;
                j += n;

                let n = (!added).trailing_zeros() as usize;
                let from = (j + i * 64) * s;
                let to = (j + i * 64 + n) * s;
                self.digests[from..to].copy_from_slice(&other.digests[from..to]);
                added = added.checked_shr(n as u32).unwrap_or(0);
                j += n;
            }
        }
    }

    /// all verified bins, in bin order
    pub fn verified_bins(&self) -> Vec<Bin> {
        let mut result = Vec::new();
        let mut i = self.root_bin.base_left();
        while i <= self.root_bin.base_right() {
            if self.is_verified(i) {
                result.push(i);
            }
            i = i + 1;
        }
        result
    }

    fn index(&self, b: Bin) -> usize {
        (b - self.base_left) as usize
    }

    pub fn is_verified(&self, b: Bin) -> bool {
        if !self.contains(b) {
            return false;
        }
        let j = self.index(b);
        self.verified[j >> 6] & (1 << (j & 0x3f)) != 0
    }

    pub(crate) fn set_verified(&mut self, b: Bin) {
        let j = self.index(b);
        self.verified[j >> 6] |= 1 << (j & 0x3f);
    }

    /// Sets the (unverified) digest of `b`, e.g. an uncle hash received from a peer
    pub fn set(&mut self, b: Bin, digest: &[u8]) {
        if !self.contains(b) || digest.len() != self.hash_size() {
            return;
        }
        let s = self.hash_size();
        let start = self.index(b) * s;
        self.digests[start..start + s].copy_from_slice(digest);
    }

    pub fn get(&self, b: Bin) -> &[u8] {
        let s = self.hash_size();
        let i = self.index(b);
        &self.digests[i * s..(i + 1) * s]
    }

    /// finalizes the pending hash into `b`'s slot and checks it against the reference tree
    ///  if that has a verified digest for `b`. Returns `(ok, verified)`.
    fn set_or_verify(&mut self, b: Bin, reference: Option<&Tree>) -> (bool, bool) {
        let s = self.hash_size();
        let i = self.index(b);
        self.hasher.finalize_into(&mut self.digests[i * s..(i + 1) * s]);

        if let Some(reference) = reference {
            if reference.is_verified(b) {
                return (self.get(b) == reference.get(b), true);
            }
        }

        self.set_verified(b);
        (true, false)
    }

    fn set_or_verify_branch(&mut self, b: Bin, reference: Option<&Tree>) -> (bool, bool) {
        let s = self.hash_size();
        for child in [b.left(), b.right()] {
            match reference {
                Some(reference) if reference.is_verified(child) => self.hasher.update(reference.get(child)),
                _ => {
                    let i = self.index(child);
                    self.hasher.update(&self.digests[i * s..(i + 1) * s]);
                }
            }
        }
        self.set_or_verify(b, reference)
    }

    /// Hashes the chunks of `data` into the leaves below `b` and computes the branches up to
    ///  `b`, marking them verified. Returns `true` if a verified digest of the reference tree
    ///  confirmed `b`.
    pub fn fill(&mut self, b: Bin, data: &[u8]) -> Result<bool, MerkleError> {
        self.fill_with_reference(b, data, None)
    }

    fn fill_with_reference(&mut self, b: Bin, data: &[u8], reference: Option<&Tree>) -> Result<bool, MerkleError> {
        if !self.contains(b) {
            return Err(MerkleError::OutOfBounds(b));
        }
        let base_length = b.base_length() as usize;
        let expected = base_length * self.chunk_size;
        if data.len() < expected {
            return Err(MerkleError::DataTooShort { expected, actual: data.len() });
        }

        let mut l = b.base_left();
        let mut r = b.base_right();

        for (i, chunk) in data[..expected].chunks(self.chunk_size).enumerate() {
            self.hasher.update(chunk);
            match self.set_or_verify(l + i as u64 * 2, reference) {
                (false, _) => return Err(MerkleError::HashMismatch),
                (true, true) if b.is_base() => return Ok(true),
                _ => {}
            }
        }

        for layer in 1..=b.layer() {
            l = l.parent();
            r = r.parent();
            let step = 1u64 << (layer + 1);
            let mut j = l;
            while j <= r {
                match self.set_or_verify_branch(j, reference) {
                    (false, _) => return Err(MerkleError::HashMismatch),
                    (true, true) if b.layer() == layer => return Ok(true),
                    _ => {}
                }
                j = j + step;
            }
        }

        Ok(false)
    }

    /// Checks `data` at `b` using the uncle hashes already set in this tree and the verified
    ///  digests of `reference`.
    ///
    /// Returns `Ok(true)` when the data was confirmed by a verified digest of the reference,
    ///  and `Ok(false)` when the climb reached this tree's root without meeting a verified
    ///  digest. In that case the data is merely consistent with [Tree::root_hash], which the
    ///  caller must check against a signature before trusting anything in this tree.
    pub fn verify(&mut self, b: Bin, data: &[u8], reference: Option<&Tree>) -> Result<bool, MerkleError> {
        if self.fill_with_reference(b, data, reference)? {
            return Ok(true);
        }

        let mut b = b;
        while b != self.root_bin {
            self.set_verified(b.sibling());

            b = b.parent();
            match self.set_or_verify_branch(b, reference) {
                (false, _) => return Err(MerkleError::HashMismatch),
                (true, true) => return Ok(true),
                _ => {}
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const CHUNK_SIZE: usize = 16;

    fn data(chunks: usize) -> Vec<u8> {
        (0..chunks * CHUNK_SIZE).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn chunk(d: &[u8], i: usize) -> &[u8] {
        &d[i * CHUNK_SIZE..(i + 1) * CHUNK_SIZE]
    }

    fn reference(root: Bin, d: &[u8], hasher: Hasher) -> Tree {
        let mut tree = Tree::new(root, CHUNK_SIZE, hasher);
        assert_eq!(tree.fill(root, d), Ok(false));
        tree
    }

    #[rstest]
    #[case::sha256(Hasher::sha256())]
    #[case::sha512(Hasher::sha512())]
    #[case::blake3(Hasher::blake3())]
    fn test_fill_then_verify(#[case] hasher: Hasher) {
        let root = Bin(7);
        let d = data(8);
        let filled = reference(root, &d, hasher.clone());

        let mut tree = Tree::new(root, CHUNK_SIZE, hasher);
        assert_eq!(tree.verify(root, &d, Some(&filled)), Ok(true));
    }

    #[test]
    fn test_corrupted_data_fails() {
        let root = Bin(7);
        let d = data(8);
        let filled = reference(root, &d, Hasher::sha256());

        let mut corrupted = d.clone();
        corrupted[CHUNK_SIZE * 3 + 5] ^= 1;

        let mut tree = Tree::new(root, CHUNK_SIZE, Hasher::sha256());
        assert_eq!(tree.verify(root, &corrupted, Some(&filled)), Err(MerkleError::HashMismatch));
    }

    #[test]
    fn test_hash_of_two_chunks() {
        let d = data(2);
        let tree = reference(Bin(1), &d, Hasher::sha256());

        let left = Sha256::digest(chunk(&d, 0));
        let right = Sha256::digest(chunk(&d, 1));
        let mut h = Sha256::new();
        Digest::update(&mut h, left);
        Digest::update(&mut h, right);
        assert_eq!(tree.root_hash(), &h.finalize()[..]);
        assert_eq!(tree.get(Bin(0)), &left[..]);
    }

    /// a single chunk plus its uncle hashes reproduces the root, but is not verified by itself
    #[test]
    fn test_verify_chunk_with_uncles() {
        let root = Bin(7);
        let d = data(8);
        let full = reference(root, &d, Hasher::sha256());

        let mut tree = Tree::new(root, CHUNK_SIZE, Hasher::sha256());
        for uncle in [Bin(2), Bin(5), Bin(11)] {
            tree.set(uncle, full.get(uncle));
        }
        assert_eq!(tree.verify(Bin(0), chunk(&d, 0), None), Ok(false));
        assert_eq!(tree.root_hash(), full.root_hash());
        assert!(tree.is_verified(Bin(11)));
        assert!(tree.is_verified(root));
    }

    #[test]
    fn test_verify_chunk_against_verified_root() {
        let root = Bin(7);
        let d = data(8);
        let full = reference(root, &d, Hasher::sha256());

        let mut signed = Tree::new(root, CHUNK_SIZE, Hasher::sha256());
        signed.set(root, full.root_hash());
        signed.set_verified(root);

        let mut tree = Tree::new(root, CHUNK_SIZE, Hasher::sha256());
        for uncle in [Bin(6), Bin(1), Bin(11)] {
            tree.set(uncle, full.get(uncle));
        }
        assert_eq!(tree.verify(Bin(4), chunk(&d, 2), Some(&signed)), Ok(true));

        let mut tree = Tree::new(root, CHUNK_SIZE, Hasher::sha256());
        for uncle in [Bin(6), Bin(1), Bin(11)] {
            tree.set(uncle, full.get(uncle));
        }
        let mut bad = chunk(&d, 2).to_vec();
        bad[0] ^= 0xff;
        assert_eq!(tree.verify(Bin(4), &bad, Some(&signed)), Err(MerkleError::HashMismatch));
    }

    #[test]
    fn test_verified_reference_subtree_short_circuits() {
        let root = Bin(7);
        let d = data(8);
        let full = reference(root, &d, Hasher::sha256());

        let mut tree = Tree::new(root, CHUNK_SIZE, Hasher::sha256());
        assert_eq!(tree.verify(Bin(5), &d[2 * CHUNK_SIZE..4 * CHUNK_SIZE], Some(&full)), Ok(true));
    }

    #[test]
    fn test_merge() {
        let root = Bin(7);
        let d = data(8);
        let full = reference(root, &d, Hasher::sha256());

        let mut tree = Tree::new(root, CHUNK_SIZE, Hasher::sha256());
        tree.merge(&full);
        for b in 0..15 {
            assert!(tree.is_verified(Bin(b)));
            assert_eq!(tree.get(Bin(b)), full.get(Bin(b)));
        }
    }

    #[test]
    fn test_merge_keeps_own_verified() {
        let root = Bin(3);
        let d = data(4);
        let mut tree = reference(root, &d, Hasher::sha256());
        let before = tree.get(Bin(0)).to_vec();

        let mut other = Tree::new(root, CHUNK_SIZE, Hasher::sha256());
        other.set(Bin(0), &[9u8; 32]);
        other.set_verified(Bin(0));

        tree.merge(&other);
        assert_eq!(tree.get(Bin(0)), &before[..]);
    }

    #[test]
    fn test_reset() {
        let d = data(4);
        let mut tree = reference(Bin(3), &d, Hasher::sha256());
        assert!(!tree.verified_bins().is_empty());

        tree.reset(Bin(11));
        assert_eq!(tree.root_bin(), Bin(11));
        assert!(tree.verified_bins().is_empty());
        assert_eq!(tree.fill(Bin(11), &d), Ok(false));
        assert!(tree.is_verified(Bin(8)));
    }

    #[test]
    fn test_verified_bins_include_last_chunk() {
        let d = data(4);
        let tree = reference(Bin(3), &d, Hasher::sha256());
        assert_eq!(tree.verified_bins(), (0..=6).map(Bin).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic]
    fn test_reset_other_size_panics() {
        let mut tree = Tree::new(Bin(3), CHUNK_SIZE, Hasher::sha256());
        tree.reset(Bin(7));
    }

    #[rstest]
    #[case::outside(Bin(16), MerkleError::OutOfBounds(Bin(16)))]
    #[case::short(Bin(1), MerkleError::DataTooShort { expected: 32, actual: 16 })]
    fn test_fill_errors(#[case] b: Bin, #[case] expected: MerkleError) {
        let mut tree = Tree::new(Bin(7), CHUNK_SIZE, Hasher::sha256());
        assert_eq!(tree.fill(b, &data(1)), Err(expected));
    }
}
