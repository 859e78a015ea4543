//! Symmetric AEAD sentinel: cipher selection, nonce discipline, and
//! authenticated chunk encryption.
//!
//! One cipher is chosen per session (AEGIS-256 when AES-NI is available,
//! AES-256-GCM on x86 without it, ChaCha20-Poly1305 elsewhere) and used for
//! every chunk. Nonces are `[4-byte direction | 8-byte counter]`, big-endian,
//! with independent counters per direction so both peers can encrypt under
//! the same session key without collision. Counter monotonicity is the real
//! uniqueness guarantee; the bounded recently-used set is a tripwire for
//! internal bugs, not a protocol mechanism.
//!
//! Hard contract: the authentication tag is verified before any plaintext
//! byte is released, and tag failures are a single opaque error.

use std::num::NonZeroUsize;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use lru::LruCache;
use sha2::Sha256;
use thiserror::Error;

use crate::crypto::hash::KdfContext;
use crate::memory::{MemoryError, SecureBytes};

/// AEAD key size for every supported cipher.
pub const KEY_BYTES: usize = 32;
/// Directional nonce size as stored and transmitted.
pub const NONCE_BYTES: usize = 12;
/// Authentication tag size for every supported cipher.
pub const TAG_BYTES: usize = 16;
/// AEGIS-256 native nonce size (expanded from the 12-byte wire nonce).
pub const AEGIS_NONCE_BYTES: usize = 32;
/// Capacity of the recently-used-nonce tripwire set.
const RECENT_NONCE_CAP: usize = 100_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AeadError {
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Nonce counter exhausted — session must be torn down")]
    NonceExhausted,
    #[error("AEAD key must be 32 bytes")]
    KeySizeInvalid,
    #[error("Nonce was already used in this session")]
    NonceReused,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type Result<T> = std::result::Result<T, AeadError>;

/// The closed set of chunk ciphers. Discriminants are the wire cipher ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    Aes256Gcm = 1,
    ChaCha20Poly1305 = 2,
    Aegis256 = 3,
}

impl CipherSuite {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(CipherSuite::Aes256Gcm),
            2 => Some(CipherSuite::ChaCha20Poly1305),
            3 => Some(CipherSuite::Aegis256),
            _ => None,
        }
    }

    /// Runtime cipher preference: AEGIS-256 where AES-NI makes it fastest,
    /// AES-256-GCM on x86 otherwise, ChaCha20-Poly1305 everywhere else.
    pub fn preferred() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if std::arch::is_x86_feature_detected!("aes") {
                CipherSuite::Aegis256
            } else {
                CipherSuite::Aes256Gcm
            }
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        {
            CipherSuite::ChaCha20Poly1305
        }
    }
}

/// Which half of the session this nonce counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Direction {
    Sender = 0,
    Receiver = 1,
}

impl Direction {
    fn index(self) -> usize {
        self as usize
    }
}

/// Build the 12-byte directional nonce: direction (BE32) || counter (BE64).
pub fn build_nonce(direction: Direction, counter: u64) -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    nonce[..4].copy_from_slice(&(direction as u32).to_be_bytes());
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// An encrypted chunk. The stored nonce is always the 12-byte directional
/// form, even when the cipher ran under an expanded nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    pub cipher: CipherSuite,
    pub nonce: [u8; NONCE_BYTES],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_BYTES],
}

/// Options for a single chunk encryption.
pub struct EncryptOptions<'a> {
    /// Override the session cipher for this chunk (tests and migration).
    pub cipher: Option<CipherSuite>,
    pub direction: Direction,
    pub associated_data: &'a [u8],
    /// Explicit nonce; when absent the sentinel draws the next counter.
    pub nonce: Option<[u8; NONCE_BYTES]>,
}

impl<'a> EncryptOptions<'a> {
    pub fn new(direction: Direction) -> Self {
        Self {
            cipher: None,
            direction,
            associated_data: &[],
            nonce: None,
        }
    }

    pub fn with_aad(mut self, aad: &'a [u8]) -> Self {
        self.associated_data = aad;
        self
    }
}

/// Per-session AEAD state: the negotiated cipher, per-direction counters,
/// and the recently-used-nonce tripwire.
pub struct Sentinel {
    cipher: CipherSuite,
    counters: [u64; 2],
    recent_nonces: LruCache<[u8; NONCE_BYTES], ()>,
}

impl Sentinel {
    pub fn new(cipher: CipherSuite) -> Self {
        Self {
            cipher,
            counters: [0; 2],
            recent_nonces: LruCache::new(
                NonZeroUsize::new(RECENT_NONCE_CAP).expect("nonzero capacity"),
            ),
        }
    }

    /// The session cipher.
    pub fn cipher(&self) -> CipherSuite {
        self.cipher
    }

    /// Current counter value for a direction (the next nonce to be drawn).
    pub fn counter(&self, direction: Direction) -> u64 {
        self.counters[direction.index()]
    }

    /// Draw the next nonce for a direction. Counter overflow is fatal for
    /// the session.
    fn next_nonce(&mut self, direction: Direction) -> Result<[u8; NONCE_BYTES]> {
        let idx = direction.index();
        let counter = self.counters[idx];
        self.counters[idx] = counter.checked_add(1).ok_or(AeadError::NonceExhausted)?;
        Ok(build_nonce(direction, counter))
    }

    /// Reserve a nonce against the recently-used set. A hit means a counter
    /// was reused inside this session — an internal bug, not peer input.
    fn reserve_nonce(&mut self, nonce: &[u8; NONCE_BYTES]) -> Result<()> {
        if self.recent_nonces.contains(nonce) {
            return Err(AeadError::NonceReused);
        }
        self.recent_nonces.put(*nonce, ());
        Ok(())
    }

    /// Encrypt one chunk. The tag is produced over ciphertext and
    /// associated data; the nonce is committed before any ciphertext leaves.
    pub fn encrypt_chunk(
        &mut self,
        plaintext: &[u8],
        key: &SecureBytes,
        opts: EncryptOptions<'_>,
    ) -> Result<EncryptedChunk> {
        let cipher = opts.cipher.unwrap_or(self.cipher);
        let nonce = match opts.nonce {
            Some(nonce) => nonce,
            None => self.next_nonce(opts.direction)?,
        };
        self.reserve_nonce(&nonce)?;

        let key_bytes = read_key(key)?;
        let mut sealed = seal(cipher, &key_bytes, &nonce, plaintext, opts.associated_data)?;

        // All three ciphers append a 16-byte tag.
        let tag_start = sealed.len() - TAG_BYTES;
        let mut auth_tag = [0u8; TAG_BYTES];
        auth_tag.copy_from_slice(&sealed[tag_start..]);
        sealed.truncate(tag_start);

        Ok(EncryptedChunk {
            cipher,
            nonce,
            ciphertext: sealed,
            auth_tag,
        })
    }

    /// Decrypt one chunk, dispatching on its cipher tag. No plaintext is
    /// returned unless the authentication tag verifies.
    pub fn decrypt_chunk(
        &self,
        chunk: &EncryptedChunk,
        key: &SecureBytes,
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        let key_bytes = read_key(key)?;
        let mut sealed = Vec::with_capacity(chunk.ciphertext.len() + TAG_BYTES);
        sealed.extend_from_slice(&chunk.ciphertext);
        sealed.extend_from_slice(&chunk.auth_tag);
        open(chunk.cipher, &key_bytes, &chunk.nonce, &sealed, associated_data)
    }
}

fn read_key(key: &SecureBytes) -> Result<[u8; KEY_BYTES]> {
    if key.len() != KEY_BYTES {
        return Err(AeadError::KeySizeInvalid);
    }
    Ok(key.to_array()?)
}

/// Expand the 12-byte directional nonce to AEGIS-256's 32 bytes with
/// HKDF-SHA-256 (zero salt, registry-frozen info label).
fn expand_aegis_nonce(nonce: &[u8; NONCE_BYTES]) -> [u8; AEGIS_NONCE_BYTES] {
    let hkdf = Hkdf::<Sha256>::new(None, nonce);
    let mut expanded = [0u8; AEGIS_NONCE_BYTES];
    hkdf.expand(KdfContext::Aegis256Nonce.as_str().as_bytes(), &mut expanded)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    expanded
}

fn seal(
    cipher: CipherSuite,
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    match cipher {
        CipherSuite::Aes256Gcm => {
            let aead = Aes256Gcm::new_from_slice(key).map_err(|_| AeadError::KeySizeInvalid)?;
            aead.encrypt(
                aes_gcm::Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| AeadError::AuthFailed)
        }
        CipherSuite::ChaCha20Poly1305 => {
            let aead =
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::KeySizeInvalid)?;
            aead.encrypt(
                chacha20poly1305::Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| AeadError::AuthFailed)
        }
        CipherSuite::Aegis256 => {
            let expanded = expand_aegis_nonce(nonce);
            let (mut ciphertext, tag) =
                aegis::aegis256::Aegis256::<TAG_BYTES>::new(key, &expanded)
                    .encrypt(plaintext, aad);
            ciphertext.extend_from_slice(&tag);
            Ok(ciphertext)
        }
    }
}

fn open(
    cipher: CipherSuite,
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if sealed.len() < TAG_BYTES {
        return Err(AeadError::AuthFailed);
    }
    match cipher {
        CipherSuite::Aes256Gcm => {
            let aead = Aes256Gcm::new_from_slice(key).map_err(|_| AeadError::KeySizeInvalid)?;
            aead.decrypt(
                aes_gcm::Nonce::from_slice(nonce),
                Payload { msg: sealed, aad },
            )
            .map_err(|_| AeadError::AuthFailed)
        }
        CipherSuite::ChaCha20Poly1305 => {
            let aead =
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::KeySizeInvalid)?;
            aead.decrypt(
                chacha20poly1305::Nonce::from_slice(nonce),
                Payload { msg: sealed, aad },
            )
            .map_err(|_| AeadError::AuthFailed)
        }
        CipherSuite::Aegis256 => {
            let expanded = expand_aegis_nonce(nonce);
            let (ciphertext, tag_bytes) = sealed.split_at(sealed.len() - TAG_BYTES);
            let mut tag = [0u8; TAG_BYTES];
            tag.copy_from_slice(tag_bytes);
            aegis::aegis256::Aegis256::<TAG_BYTES>::new(key, &expanded)
                .decrypt(ciphertext, &tag, aad)
                .map_err(|_| AeadError::AuthFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CipherSuite; 3] = [
        CipherSuite::Aes256Gcm,
        CipherSuite::ChaCha20Poly1305,
        CipherSuite::Aegis256,
    ];

    fn key() -> SecureBytes {
        SecureBytes::from_copy(&[0x42u8; 32], "test-key").unwrap()
    }

    #[test]
    fn test_roundtrip_all_ciphers() {
        for cipher in ALL {
            let mut sentinel = Sentinel::new(cipher);
            let chunk = sentinel
                .encrypt_chunk(
                    b"hello",
                    &key(),
                    EncryptOptions::new(Direction::Sender).with_aad(b"header"),
                )
                .unwrap();
            assert_eq!(chunk.cipher, cipher);
            let plaintext = sentinel.decrypt_chunk(&chunk, &key(), b"header").unwrap();
            assert_eq!(plaintext, b"hello");
        }
    }

    #[test]
    fn test_tamper_detection_every_field() {
        for cipher in ALL {
            let mut sentinel = Sentinel::new(cipher);
            let chunk = sentinel
                .encrypt_chunk(
                    b"chunk data",
                    &key(),
                    EncryptOptions::new(Direction::Sender).with_aad(b"aad"),
                )
                .unwrap();

            let mut bad = chunk.clone();
            bad.ciphertext[0] ^= 0x01;
            assert_eq!(
                sentinel.decrypt_chunk(&bad, &key(), b"aad").unwrap_err(),
                AeadError::AuthFailed,
                "{cipher:?} ciphertext"
            );

            let mut bad = chunk.clone();
            bad.auth_tag[15] ^= 0x80;
            assert_eq!(
                sentinel.decrypt_chunk(&bad, &key(), b"aad").unwrap_err(),
                AeadError::AuthFailed,
                "{cipher:?} tag"
            );

            let mut bad = chunk.clone();
            bad.nonce[11] ^= 0x01;
            assert_eq!(
                sentinel.decrypt_chunk(&bad, &key(), b"aad").unwrap_err(),
                AeadError::AuthFailed,
                "{cipher:?} nonce"
            );

            assert_eq!(
                sentinel.decrypt_chunk(&chunk, &key(), b"other").unwrap_err(),
                AeadError::AuthFailed,
                "{cipher:?} aad"
            );
        }
    }

    #[test]
    fn test_nonce_structure_and_monotonicity() {
        let mut sentinel = Sentinel::new(CipherSuite::ChaCha20Poly1305);
        let c0 = sentinel
            .encrypt_chunk(b"a", &key(), EncryptOptions::new(Direction::Sender))
            .unwrap();
        let c1 = sentinel
            .encrypt_chunk(b"b", &key(), EncryptOptions::new(Direction::Sender))
            .unwrap();
        assert_eq!(c0.nonce, build_nonce(Direction::Sender, 0));
        assert_eq!(c1.nonce, build_nonce(Direction::Sender, 1));
        assert_eq!(sentinel.counter(Direction::Sender), 2);

        // The receiver direction has its own counter.
        let r0 = sentinel
            .encrypt_chunk(b"c", &key(), EncryptOptions::new(Direction::Receiver))
            .unwrap();
        assert_eq!(r0.nonce, build_nonce(Direction::Receiver, 0));
        assert_ne!(r0.nonce, c0.nonce);
    }

    #[test]
    fn test_direction_prefix() {
        let nonce = build_nonce(Direction::Receiver, 0x0102030405060708);
        assert_eq!(&nonce[..4], &[0, 0, 0, 1]);
        assert_eq!(&nonce[4..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_explicit_nonce_reuse_detected() {
        let mut sentinel = Sentinel::new(CipherSuite::Aes256Gcm);
        let nonce = build_nonce(Direction::Sender, 7);
        let opts = |n| EncryptOptions {
            cipher: None,
            direction: Direction::Sender,
            associated_data: &[],
            nonce: Some(n),
        };
        sentinel.encrypt_chunk(b"x", &key(), opts(nonce)).unwrap();
        assert_eq!(
            sentinel.encrypt_chunk(b"y", &key(), opts(nonce)).unwrap_err(),
            AeadError::NonceReused
        );
    }

    #[test]
    fn test_counter_exhaustion_is_fatal() {
        let mut sentinel = Sentinel::new(CipherSuite::ChaCha20Poly1305);
        sentinel.counters[Direction::Sender.index()] = u64::MAX;
        // The final counter value is still usable...
        sentinel
            .encrypt_chunk(b"last", &key(), EncryptOptions::new(Direction::Sender))
            .unwrap();
        // ...drawing past it is not.
        assert_eq!(
            sentinel
                .encrypt_chunk(b"next", &key(), EncryptOptions::new(Direction::Sender))
                .unwrap_err(),
            AeadError::NonceExhausted
        );
    }

    #[test]
    fn test_key_size_validated() {
        let mut sentinel = Sentinel::new(CipherSuite::Aes256Gcm);
        let short = SecureBytes::from_copy(&[1u8; 16], "short").unwrap();
        assert_eq!(
            sentinel
                .encrypt_chunk(b"x", &short, EncryptOptions::new(Direction::Sender))
                .unwrap_err(),
            AeadError::KeySizeInvalid
        );
    }

    #[test]
    fn test_cipher_ids_are_wire_frozen() {
        assert_eq!(CipherSuite::Aes256Gcm.id(), 1);
        assert_eq!(CipherSuite::ChaCha20Poly1305.id(), 2);
        assert_eq!(CipherSuite::Aegis256.id(), 3);
        assert_eq!(CipherSuite::from_id(3), Some(CipherSuite::Aegis256));
        assert_eq!(CipherSuite::from_id(0), None);
        assert_eq!(CipherSuite::from_id(4), None);
    }

    #[test]
    fn test_aegis_nonce_expansion_deterministic() {
        let nonce = build_nonce(Direction::Sender, 99);
        assert_eq!(expand_aegis_nonce(&nonce), expand_aegis_nonce(&nonce));
        let other = build_nonce(Direction::Sender, 100);
        assert_ne!(expand_aegis_nonce(&nonce), expand_aegis_nonce(&other));
    }

    #[test]
    fn test_cross_cipher_decrypt_fails() {
        let mut sentinel = Sentinel::new(CipherSuite::Aes256Gcm);
        let mut chunk = sentinel
            .encrypt_chunk(b"data", &key(), EncryptOptions::new(Direction::Sender))
            .unwrap();
        // Re-tag the chunk as a different cipher; the tag cannot verify.
        chunk.cipher = CipherSuite::ChaCha20Poly1305;
        assert_eq!(
            sentinel.decrypt_chunk(&chunk, &key(), b"").unwrap_err(),
            AeadError::AuthFailed
        );
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let mut sentinel = Sentinel::new(CipherSuite::ChaCha20Poly1305);
        let chunk = sentinel
            .encrypt_chunk(b"", &key(), EncryptOptions::new(Direction::Sender))
            .unwrap();
        assert!(chunk.ciphertext.is_empty());
        assert_eq!(sentinel.decrypt_chunk(&chunk, &key(), b"").unwrap(), b"");
    }
}
