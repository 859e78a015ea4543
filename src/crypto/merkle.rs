//! Merkle integrity manifests for file transfer.
//!
//! The sender hashes every plaintext chunk with BLAKE3, builds a binary
//! Merkle tree over the leaves (odd levels duplicate the last node), and
//! transmits the manifest before the first chunk. The receiver verifies
//! per-chunk hashes and the rebuilt root before accepting the file, and
//! gets back the exact set of corrupted chunk indices so retransmission can
//! target only the failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hash::{self, ct_eq, ct_eq_32};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Merkle tree requires at least one chunk")]
    NoChunks,
    #[error("Chunk index {0} out of range")]
    IndexOutOfRange(u32),
    #[error("Manifest chunk count {manifest} does not match received chunks {received}")]
    ChunkCountMismatch { manifest: u32, received: u32 },
    #[error("All chunks verified but the root hash does not match — manifest corrupted in transit")]
    ManifestCorrupted,
    #[error("Malformed manifest hash encoding")]
    MalformedManifest,
}

pub type Result<T> = std::result::Result<T, MerkleError>;

/// A binary Merkle tree over chunk hashes. Level 0 is the leaves; the last
/// level is the single root.
#[derive(Debug)]
pub struct MerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

/// One step of a membership proof: the sibling hash and which side it sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: [u8; 32],
    /// True when the sibling is the left input of the parent hash.
    pub sibling_is_left: bool,
}

impl MerkleTree {
    /// Build a tree over chunk plaintexts.
    pub fn from_chunks<'a, I>(chunks: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let leaves: Vec<[u8; 32]> = chunks.into_iter().map(hash::hash).collect();
        Self::from_leaves(leaves)
    }

    /// Build a tree over precomputed leaf hashes.
    pub fn from_leaves(leaves: Vec<[u8; 32]>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(MerkleError::NoChunks);
        }
        let mut levels = vec![leaves];
        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let prev = levels.last().expect("levels is nonempty");
            let mut next = Vec::with_capacity((prev.len() + 1) / 2);
            for pair in prev.chunks(2) {
                let left = &pair[0];
                // Odd count: the last node is paired with itself.
                let right = pair.get(1).unwrap_or(left);
                next.push(hash_pair(left, right));
            }
            levels.push(next);
        }
        Ok(Self { levels })
    }

    pub fn root(&self) -> [u8; 32] {
        self.levels.last().expect("tree has a root")[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Membership proof for the chunk at `index`: sibling hashes from leaf
    /// to root, each tagged with its side.
    pub fn proof(&self, index: u32) -> Result<Vec<ProofStep>> {
        let mut idx = index as usize;
        if idx >= self.leaf_count() {
            return Err(MerkleError::IndexOutOfRange(index));
        }
        let mut steps = Vec::new();
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            // Duplicated last node when the level has an odd count.
            let sibling = *level.get(sibling_idx).unwrap_or(&level[idx]);
            steps.push(ProofStep {
                sibling,
                sibling_is_left: idx % 2 == 1,
            });
            idx /= 2;
        }
        Ok(steps)
    }
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = hash::Hasher::new();
    hasher.update(left).update(right);
    hasher.finalize()
}

/// Re-derive the root from a leaf hash and a proof, and compare with the
/// expected root in constant time.
pub fn verify_proof(leaf_hash: &[u8; 32], proof: &[ProofStep], expected_root: &[u8; 32]) -> bool {
    let mut node = *leaf_hash;
    for step in proof {
        node = if step.sibling_is_left {
            hash_pair(&step.sibling, &node)
        } else {
            hash_pair(&node, &step.sibling)
        };
    }
    ct_eq_32(&node, expected_root)
}

/// The integrity manifest transmitted (and signed) before the first chunk.
///
/// Hashes are hex-encoded for host-application display and storage; the
/// wire layer carries them raw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub root_hash: String,
    pub chunk_hashes: Vec<String>,
    pub total_chunks: u32,
    pub file_size: u64,
}

/// Outcome of whole-file verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVerification {
    pub ok: bool,
    pub corrupted_indices: Vec<u32>,
}

/// Hash every chunk and build the manifest for a file of `chunks`.
pub fn build_manifest<'a, I>(chunks: I) -> Result<IntegrityManifest>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut leaves = Vec::new();
    let mut file_size = 0u64;
    for chunk in chunks {
        file_size += chunk.len() as u64;
        leaves.push(hash::hash(chunk));
    }
    let tree = MerkleTree::from_leaves(leaves.clone())?;
    Ok(IntegrityManifest {
        root_hash: hex::encode(tree.root()),
        chunk_hashes: leaves.iter().map(hex::encode).collect(),
        total_chunks: tree.leaf_count() as u32,
        file_size,
    })
}

/// Verify received chunk plaintexts against a manifest.
///
/// Per-chunk hashes are compared as constant-time hex; any mismatch lands
/// the index in `corrupted_indices` and the file is not accepted. If every
/// chunk matches but the rebuilt root differs from the manifest's, the
/// manifest itself was corrupted in transit — that is fatal.
pub fn verify_file<'a, I>(chunks: I, manifest: &IntegrityManifest) -> Result<FileVerification>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let chunks: Vec<&[u8]> = chunks.into_iter().collect();
    if chunks.len() as u32 != manifest.total_chunks
        || manifest.chunk_hashes.len() != chunks.len()
    {
        return Err(MerkleError::ChunkCountMismatch {
            manifest: manifest.total_chunks,
            received: chunks.len() as u32,
        });
    }

    let mut corrupted = Vec::new();
    let mut leaves = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let leaf = hash::hash(chunk);
        let computed_hex = hex::encode(leaf);
        if !ct_eq(computed_hex.as_bytes(), manifest.chunk_hashes[i].as_bytes()) {
            corrupted.push(i as u32);
        }
        leaves.push(leaf);
    }

    if !corrupted.is_empty() {
        return Ok(FileVerification {
            ok: false,
            corrupted_indices: corrupted,
        });
    }

    let tree = MerkleTree::from_leaves(leaves)?;
    let expected_root = decode_hash(&manifest.root_hash)?;
    if !ct_eq_32(&tree.root(), &expected_root) {
        return Err(MerkleError::ManifestCorrupted);
    }

    Ok(FileVerification {
        ok: true,
        corrupted_indices: Vec::new(),
    })
}

pub(crate) fn decode_hash(hex_hash: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_hash).map_err(|_| MerkleError::MalformedManifest)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| MerkleError::MalformedManifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunks() -> Vec<Vec<u8>> {
        (0u8..7).map(|i| vec![i; 64]).collect()
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(
            MerkleTree::from_leaves(Vec::new()).unwrap_err(),
            MerkleError::NoChunks
        );
    }

    #[test]
    fn test_single_chunk_root_is_leaf() {
        let chunk = b"only chunk".as_slice();
        let tree = MerkleTree::from_chunks([chunk]).unwrap();
        assert_eq!(tree.root(), hash::hash(chunk));
        assert!(tree.proof(0).unwrap().is_empty());
    }

    #[test]
    fn test_proof_roundtrip_all_indices() {
        let chunks = sample_chunks();
        let tree = MerkleTree::from_chunks(chunks.iter().map(Vec::as_slice)).unwrap();
        let root = tree.root();
        for (i, chunk) in chunks.iter().enumerate() {
            let proof = tree.proof(i as u32).unwrap();
            let leaf = hash::hash(chunk);
            assert!(verify_proof(&leaf, &proof, &root), "index {i}");
        }
    }

    #[test]
    fn test_proof_rejects_wrong_leaf() {
        let chunks = sample_chunks();
        let tree = MerkleTree::from_chunks(chunks.iter().map(Vec::as_slice)).unwrap();
        let proof = tree.proof(3).unwrap();
        let wrong = hash::hash(b"not chunk 3");
        assert!(!verify_proof(&wrong, &proof, &tree.root()));
    }

    #[test]
    fn test_proof_index_out_of_range() {
        let chunks = sample_chunks();
        let tree = MerkleTree::from_chunks(chunks.iter().map(Vec::as_slice)).unwrap();
        assert_eq!(
            tree.proof(7).unwrap_err(),
            MerkleError::IndexOutOfRange(7)
        );
    }

    #[test]
    fn test_verify_file_clean() {
        let chunks = sample_chunks();
        let manifest = build_manifest(chunks.iter().map(Vec::as_slice)).unwrap();
        assert_eq!(manifest.total_chunks, 7);
        assert_eq!(manifest.file_size, 7 * 64);
        let result = verify_file(chunks.iter().map(Vec::as_slice), &manifest).unwrap();
        assert!(result.ok);
        assert!(result.corrupted_indices.is_empty());
    }

    #[test]
    fn test_verify_file_reports_corrupted_indices() {
        let chunks = sample_chunks();
        let manifest = build_manifest(chunks.iter().map(Vec::as_slice)).unwrap();

        let mut tampered = chunks.clone();
        tampered[4][10] ^= 0x01;
        tampered[6][0] ^= 0x80;

        let result = verify_file(tampered.iter().map(Vec::as_slice), &manifest).unwrap();
        assert!(!result.ok);
        assert_eq!(result.corrupted_indices, vec![4, 6]);
    }

    #[test]
    fn test_verify_file_chunk_count_mismatch() {
        let chunks = sample_chunks();
        let manifest = build_manifest(chunks.iter().map(Vec::as_slice)).unwrap();
        let short: Vec<&[u8]> = chunks[..5].iter().map(Vec::as_slice).collect();
        assert_eq!(
            verify_file(short, &manifest).unwrap_err(),
            MerkleError::ChunkCountMismatch {
                manifest: 7,
                received: 5
            }
        );
    }

    #[test]
    fn test_corrupted_manifest_root_is_fatal() {
        let chunks = sample_chunks();
        let mut manifest = build_manifest(chunks.iter().map(Vec::as_slice)).unwrap();
        // Flip one hex digit of the root; all chunk hashes still match.
        let mut root = manifest.root_hash.into_bytes();
        root[0] = if root[0] == b'a' { b'b' } else { b'a' };
        manifest.root_hash = String::from_utf8(root).unwrap();

        assert_eq!(
            verify_file(chunks.iter().map(Vec::as_slice), &manifest).unwrap_err(),
            MerkleError::ManifestCorrupted
        );
    }

    #[test]
    fn test_odd_level_duplication_is_stable() {
        // Three leaves: level 1 pairs (0,1) and (2,2).
        let leaves: Vec<[u8; 32]> = (0u8..3).map(|i| hash::hash(&[i])).collect();
        let tree = MerkleTree::from_leaves(leaves.clone()).unwrap();
        let l01 = hash_pair(&leaves[0], &leaves[1]);
        let l22 = hash_pair(&leaves[2], &leaves[2]);
        assert_eq!(tree.root(), hash_pair(&l01, &l22));
    }
}
