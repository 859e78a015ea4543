//! BLAKE3 hashing facade.
//!
//! Every hash in the protocol goes through this module: plain 32-byte
//! hashes, keyed hashes (MACs), and derive-key mode. Derive-key calls are
//! restricted to the frozen [`KdfContext`] registry — a context outside the
//! registry is unrepresentable, which keeps domain separation auditable in
//! one place.

use subtle::ConstantTimeEq;

/// Output size of every hash mode (BLAKE3 native).
pub const HASH_BYTES: usize = 32;

/// The frozen registry of key-derivation contexts.
///
/// Each variant maps to a fixed, versioned label string. Adding a variant is
/// a protocol change; removing or editing one breaks interoperability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfContext {
    /// Combining classical and post-quantum KEM outputs, and the triple
    /// ratchet's initial root key.
    HybridKex,
    /// Root-key updates on DH ratchet steps and the prekey handshake secret.
    RootKey,
    /// Chain-key initialization and per-message chain advance.
    ChainKey,
    /// Per-message key derivation from a chain key.
    MessageKey,
    /// Seeding derived nonce material.
    NonceSeed,
    /// Sealing keys persisted at rest.
    StorageKey,
    /// Sparse PQ ratchet: combining an epoch secret with a KEM secret.
    SckaCombine,
    /// Sparse PQ ratchet: deriving an epoch key from an epoch secret.
    SckaEpochKey,
    /// Sparse PQ ratchet: per-message key within an epoch.
    SckaMsgKey,
    /// Combining the DH and PQ message keys into the final message key.
    CombineKey,
    /// Expanding the 12-byte directional nonce to AEGIS-256's 32 bytes.
    Aegis256Nonce,
}

impl KdfContext {
    /// The wire-frozen label string for this context.
    pub const fn as_str(self) -> &'static str {
        match self {
            KdfContext::HybridKex => "tallow.kdf.hybrid-kex.v1",
            KdfContext::RootKey => "tallow.kdf.root-key.v1",
            KdfContext::ChainKey => "tallow.kdf.chain-key.v1",
            KdfContext::MessageKey => "tallow.kdf.message-key.v1",
            KdfContext::NonceSeed => "tallow.kdf.nonce-seed.v1",
            KdfContext::StorageKey => "tallow.kdf.storage-key.v1",
            KdfContext::SckaCombine => "tallow.scka.combine.v1",
            KdfContext::SckaEpochKey => "tallow.scka.epoch-key.v1",
            KdfContext::SckaMsgKey => "tallow.scka.msg-key.v1",
            KdfContext::CombineKey => "tallow.kdf.combine-key.v1",
            KdfContext::Aegis256Nonce => "tallow.symmetric.aegis256-nonce.v1",
        }
    }
}

/// One-shot plain hash.
pub fn hash(data: &[u8]) -> [u8; HASH_BYTES] {
    *blake3::hash(data).as_bytes()
}

/// One-shot keyed hash (MAC) with a 32-byte key.
pub fn keyed_hash(key: &[u8; HASH_BYTES], data: &[u8]) -> [u8; HASH_BYTES] {
    *blake3::keyed_hash(key, data).as_bytes()
}

/// One-shot key derivation under a registered context.
pub fn derive_key(context: KdfContext, ikm: &[u8]) -> [u8; HASH_BYTES] {
    blake3::derive_key(context.as_str(), ikm)
}

/// Streaming hasher over any of the three modes.
pub struct Hasher {
    inner: blake3::Hasher,
}

impl Hasher {
    /// Streaming plain hash.
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    /// Streaming keyed hash.
    pub fn new_keyed(key: &[u8; HASH_BYTES]) -> Self {
        Self {
            inner: blake3::Hasher::new_keyed(key),
        }
    }

    /// Streaming key derivation under a registered context.
    pub fn new_derive_key(context: KdfContext) -> Self {
        Self {
            inner: blake3::Hasher::new_derive_key(context.as_str()),
        }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    pub fn finalize(&self) -> [u8; HASH_BYTES] {
        *self.inner.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Constant-time equality for byte slices. Length mismatch returns false
/// without inspecting contents.
#[inline(always)]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Constant-time equality for 32-byte values (hashes, keys, roots).
#[inline(always)]
pub fn ct_eq_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_known_answer_empty_input() {
        // BLAKE3 of the empty string, from the reference test vectors.
        assert_eq!(
            hash(b""),
            hex!("af1349b9f5f9a1a6a0404dee36dcc9499bcb25c9adc112b7cc9a93cae41f3262")
        );
    }

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"tallow"), hash(b"tallow"));
        assert_ne!(hash(b"tallow"), hash(b"mallow"));
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let mut hasher = Hasher::new();
        hasher.update(b"hello ").update(b"world");
        assert_eq!(hasher.finalize(), hash(b"hello world"));
    }

    #[test]
    fn test_keyed_streaming_matches_oneshot() {
        let key = [0x42u8; 32];
        let mut hasher = Hasher::new_keyed(&key);
        hasher.update(b"chunk");
        assert_eq!(hasher.finalize(), keyed_hash(&key, b"chunk"));
    }

    #[test]
    fn test_derive_key_contexts_are_separated() {
        let ikm = [7u8; 32];
        let a = derive_key(KdfContext::ChainKey, &ikm);
        let b = derive_key(KdfContext::MessageKey, &ikm);
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_key_streaming_matches_oneshot() {
        let mut hasher = Hasher::new_derive_key(KdfContext::RootKey);
        hasher.update(b"secret material");
        assert_eq!(
            hasher.finalize(),
            derive_key(KdfContext::RootKey, b"secret material")
        );
    }

    #[test]
    fn test_aegis_label_is_wire_frozen() {
        assert_eq!(
            KdfContext::Aegis256Nonce.as_str(),
            "tallow.symmetric.aegis256-nonce.v1"
        );
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"same", b"same"));
        assert!(!ct_eq(b"same", b"sane"));
        assert!(!ct_eq(b"short", b"longer"));
        assert!(ct_eq_32(&[1u8; 32], &[1u8; 32]));
        assert!(!ct_eq_32(&[1u8; 32], &[2u8; 32]));
    }
}
