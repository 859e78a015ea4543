//! Wire formats.
//!
//! Hand-framed byte layouts; counters and length fields are big-endian.
//! Decoding is strict: unknown versions, unknown cipher ids, and truncated
//! buffers are protocol errors that the session survives (the message is
//! dropped, state is untouched).
//!
//! Message envelope (version 1):
//!
//! ```text
//! [1]  version
//! [1]  cipher id (1 = AES-256-GCM, 2 = ChaCha20-Poly1305, 3 = AEGIS-256)
//! [4]  PQ epoch (BE)
//! [8]  message number (BE)
//! [32] sender DH public key
//! [4]  previous chain length (BE)
//! [2]  KEM advance length (BE, 0 when absent)
//! [..] KEM advance
//! [12] nonce
//! [16] auth tag
//! [..] ciphertext
//! ```

use thiserror::Error;

use crate::crypto::aead::{CipherSuite, EncryptedChunk, NONCE_BYTES, TAG_BYTES};
use crate::crypto::kem::{HybridPublicKey, KemError, HYBRID_CIPHERTEXT_BYTES};
use crate::crypto::merkle::IntegrityManifest;
use crate::crypto::prekey::{InitiatorHandshake, PrekeyBundle};
use crate::crypto::sign::ED25519_SIGNATURE_BYTES;
use crate::ratchet::{KemAdvance, RatchetMessage};

/// Current envelope format version.
pub const WIRE_VERSION: u8 = 1;

/// Fixed header size before the variable KEM advance field.
const HEADER_BYTES: usize = 1 + 1 + 4 + 8 + 32 + 4 + 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("Unknown wire format version {0}")]
    UnknownVersion(u8),
    #[error("Unknown cipher id {0}")]
    UnknownCipher(u8),
    #[error("Message truncated")]
    Truncated,
    #[error("Length field does not match payload")]
    LengthMismatch,
    #[error(transparent)]
    Kem(#[from] KemError),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// A cursor over an inbound buffer; every read is bounds-checked.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(WireError::Truncated)?;
        if end > self.bytes.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("len 2")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("len 4")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("len 8")))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().expect("fixed len"))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        slice
    }

    fn finished(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

// ── Message envelope ────────────────────────────────────────────────────────

/// Serialize a ratchet message into the version-1 envelope.
pub fn encode_message(message: &RatchetMessage) -> Result<Vec<u8>> {
    let prev: u32 = message
        .previous_chain_length
        .try_into()
        .map_err(|_| WireError::LengthMismatch)?;
    let kem_bytes = message
        .kem_advance
        .as_ref()
        .map(KemAdvance::to_bytes)
        .unwrap_or_default();
    let kem_len: u16 = kem_bytes
        .len()
        .try_into()
        .map_err(|_| WireError::LengthMismatch)?;

    let mut out = Vec::with_capacity(
        HEADER_BYTES + kem_bytes.len() + NONCE_BYTES + TAG_BYTES + message.chunk.ciphertext.len(),
    );
    out.push(WIRE_VERSION);
    out.push(message.chunk.cipher.id());
    out.extend_from_slice(&message.epoch.to_be_bytes());
    out.extend_from_slice(&message.message_number.to_be_bytes());
    out.extend_from_slice(&message.sender_dh_public);
    out.extend_from_slice(&prev.to_be_bytes());
    out.extend_from_slice(&kem_len.to_be_bytes());
    out.extend_from_slice(&kem_bytes);
    out.extend_from_slice(&message.chunk.nonce);
    out.extend_from_slice(&message.chunk.auth_tag);
    out.extend_from_slice(&message.chunk.ciphertext);
    Ok(out)
}

/// Parse a version-1 envelope.
pub fn decode_message(bytes: &[u8]) -> Result<RatchetMessage> {
    let mut reader = Reader::new(bytes);

    let version = reader.u8()?;
    if version != WIRE_VERSION {
        return Err(WireError::UnknownVersion(version));
    }
    let cipher_id = reader.u8()?;
    let cipher = CipherSuite::from_id(cipher_id).ok_or(WireError::UnknownCipher(cipher_id))?;
    let epoch = reader.u32()?;
    let message_number = reader.u64()?;
    let sender_dh_public: [u8; 32] = reader.array()?;
    let previous_chain_length = reader.u32()? as u64;

    let kem_len = reader.u16()? as usize;
    let kem_advance = if kem_len == 0 {
        None
    } else {
        Some(KemAdvance::from_bytes(reader.take(kem_len)?)?)
    };

    let nonce: [u8; NONCE_BYTES] = reader.array()?;
    let auth_tag: [u8; TAG_BYTES] = reader.array()?;
    let ciphertext = reader.rest().to_vec();

    Ok(RatchetMessage {
        epoch,
        message_number,
        sender_dh_public,
        previous_chain_length,
        kem_advance,
        chunk: EncryptedChunk {
            cipher,
            nonce,
            ciphertext,
            auth_tag,
        },
    })
}

// ── Prekey bundle ───────────────────────────────────────────────────────────

fn encode_hybrid_public(out: &mut Vec<u8>, public: &HybridPublicKey) {
    out.extend_from_slice(&(public.mlkem.len() as u32).to_be_bytes());
    out.extend_from_slice(&public.mlkem);
    out.extend_from_slice(&(public.x25519.len() as u32).to_be_bytes());
    out.extend_from_slice(&public.x25519);
}

fn decode_hybrid_public(reader: &mut Reader<'_>) -> Result<HybridPublicKey> {
    let mlkem_len = reader.u32()? as usize;
    let mlkem = reader.take(mlkem_len)?.to_vec();
    let x25519_len = reader.u32()? as usize;
    if x25519_len != 32 {
        return Err(WireError::LengthMismatch);
    }
    let x25519: [u8; 32] = reader.array()?;
    Ok(HybridPublicKey { mlkem, x25519 })
}

/// Serialize a prekey bundle for publication.
pub fn encode_prekey_bundle(bundle: &PrekeyBundle) -> Result<Vec<u8>> {
    if bundle.signed_prekey_signature.len() != ED25519_SIGNATURE_BYTES {
        return Err(WireError::LengthMismatch);
    }
    let created_at: u32 = bundle
        .signed_prekey_created_at
        .try_into()
        .map_err(|_| WireError::LengthMismatch)?;

    let mut out = Vec::new();
    out.extend_from_slice(&bundle.identity_public);
    out.extend_from_slice(&bundle.signed_prekey_id.to_be_bytes());
    out.extend_from_slice(&created_at.to_be_bytes());
    encode_hybrid_public(&mut out, &bundle.signed_prekey_public);
    out.extend_from_slice(&bundle.signed_prekey_signature);
    match &bundle.one_time_prekey {
        Some((id, public)) => {
            out.push(1);
            out.extend_from_slice(&id.to_be_bytes());
            encode_hybrid_public(&mut out, public);
        }
        None => out.push(0),
    }
    Ok(out)
}

/// Parse a published prekey bundle.
pub fn decode_prekey_bundle(bytes: &[u8]) -> Result<PrekeyBundle> {
    let mut reader = Reader::new(bytes);
    let identity_public: [u8; 32] = reader.array()?;
    let signed_prekey_id = reader.u32()?;
    let signed_prekey_created_at = reader.u32()? as i64;
    let signed_prekey_public = decode_hybrid_public(&mut reader)?;
    let signed_prekey_signature = reader.take(ED25519_SIGNATURE_BYTES)?.to_vec();
    let one_time_prekey = match reader.u8()? {
        0 => None,
        1 => {
            let id = reader.u32()?;
            let public = decode_hybrid_public(&mut reader)?;
            Some((id, public))
        }
        _ => return Err(WireError::LengthMismatch),
    };
    if !reader.finished() {
        return Err(WireError::LengthMismatch);
    }
    Ok(PrekeyBundle {
        identity_public,
        signed_prekey_id,
        signed_prekey_created_at,
        signed_prekey_public,
        signed_prekey_signature,
        one_time_prekey,
    })
}

// ── Initiator handshake ─────────────────────────────────────────────────────

/// Serialize the initiator's handshake (prekey ids + KEM ciphertexts).
pub fn encode_handshake(handshake: &InitiatorHandshake) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&handshake.signed_prekey_id.to_be_bytes());
    out.extend_from_slice(&handshake.signed_prekey_ciphertext.to_bytes());
    match (
        handshake.one_time_prekey_id,
        &handshake.one_time_prekey_ciphertext,
    ) {
        (Some(id), Some(ct)) => {
            out.push(1);
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&ct.to_bytes());
        }
        _ => out.push(0),
    }
    out
}

/// Parse an initiator handshake.
pub fn decode_handshake(bytes: &[u8]) -> Result<InitiatorHandshake> {
    use crate::crypto::kem::HybridCiphertext;

    let mut reader = Reader::new(bytes);
    let signed_prekey_id = reader.u32()?;
    let signed_prekey_ciphertext =
        HybridCiphertext::from_bytes(reader.take(HYBRID_CIPHERTEXT_BYTES)?)?;
    let (one_time_prekey_id, one_time_prekey_ciphertext) = match reader.u8()? {
        0 => (None, None),
        1 => {
            let id = reader.u32()?;
            let ct = HybridCiphertext::from_bytes(reader.take(HYBRID_CIPHERTEXT_BYTES)?)?;
            (Some(id), Some(ct))
        }
        _ => return Err(WireError::LengthMismatch),
    };
    if !reader.finished() {
        return Err(WireError::LengthMismatch);
    }
    Ok(InitiatorHandshake {
        signed_prekey_id,
        one_time_prekey_id,
        signed_prekey_ciphertext,
        one_time_prekey_ciphertext,
    })
}

// ── Integrity manifest ──────────────────────────────────────────────────────

/// Serialize a manifest: total chunks, file size, root hash, chunk hashes.
pub fn encode_manifest(manifest: &IntegrityManifest) -> Result<Vec<u8>> {
    if manifest.chunk_hashes.len() != manifest.total_chunks as usize {
        return Err(WireError::LengthMismatch);
    }
    let mut out = Vec::with_capacity(4 + 8 + 32 + manifest.chunk_hashes.len() * 32);
    out.extend_from_slice(&manifest.total_chunks.to_be_bytes());
    out.extend_from_slice(&manifest.file_size.to_be_bytes());
    out.extend_from_slice(&decode_hex_hash(&manifest.root_hash)?);
    for hash in &manifest.chunk_hashes {
        out.extend_from_slice(&decode_hex_hash(hash)?);
    }
    Ok(out)
}

/// Parse a manifest.
pub fn decode_manifest(bytes: &[u8]) -> Result<IntegrityManifest> {
    let mut reader = Reader::new(bytes);
    let total_chunks = reader.u32()?;
    let file_size = reader.u64()?;
    let root: [u8; 32] = reader.array()?;
    let mut chunk_hashes = Vec::with_capacity(total_chunks as usize);
    for _ in 0..total_chunks {
        let hash: [u8; 32] = reader.array()?;
        chunk_hashes.push(hex::encode(hash));
    }
    if !reader.finished() {
        return Err(WireError::LengthMismatch);
    }
    Ok(IntegrityManifest {
        root_hash: hex::encode(root),
        chunk_hashes,
        total_chunks,
        file_size,
    })
}

fn decode_hex_hash(hex_hash: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_hash).map_err(|_| WireError::LengthMismatch)?;
    bytes.try_into().map_err(|_| WireError::LengthMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::merkle::build_manifest;
    use crate::crypto::prekey::{self, PrekeyStore};
    use crate::crypto::sign::{self, SignatureAlgorithm};

    fn sample_message(kem_advance: Option<KemAdvance>) -> RatchetMessage {
        RatchetMessage {
            epoch: 3,
            message_number: 0x0102030405060708,
            sender_dh_public: [0xAB; 32],
            previous_chain_length: 42,
            kem_advance,
            chunk: EncryptedChunk {
                cipher: CipherSuite::Aegis256,
                nonce: [7u8; NONCE_BYTES],
                ciphertext: vec![1, 2, 3, 4, 5],
                auth_tag: [9u8; TAG_BYTES],
            },
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let message = sample_message(None);
        let bytes = encode_message(&message).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(bytes[1], CipherSuite::Aegis256.id());
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn test_message_roundtrip_with_kem_advance() {
        let keypair = crate::crypto::kem::HybridKeyPair::generate().unwrap();
        let (ciphertext, _) = crate::crypto::kem::encapsulate(keypair.public()).unwrap();
        let advance = KemAdvance {
            ciphertext,
            next_public: keypair.public().clone(),
        };
        let message = sample_message(Some(advance));
        let bytes = encode_message(&message).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = encode_message(&sample_message(None)).unwrap();
        bytes[0] = 2;
        assert_eq!(decode_message(&bytes).unwrap_err(), WireError::UnknownVersion(2));
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        let mut bytes = encode_message(&sample_message(None)).unwrap();
        bytes[1] = 9;
        assert_eq!(decode_message(&bytes).unwrap_err(), WireError::UnknownCipher(9));
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = encode_message(&sample_message(None)).unwrap();
        for cut in [0, 1, 10, HEADER_BYTES, bytes.len() - 6] {
            // Anything shorter than nonce+tag cannot parse; the ciphertext
            // itself may be empty, so only cuts into the fixed fields fail.
            if cut < HEADER_BYTES + NONCE_BYTES + TAG_BYTES {
                assert!(
                    decode_message(&bytes[..cut]).is_err(),
                    "cut at {cut} should fail"
                );
            }
        }
    }

    #[test]
    fn test_prekey_bundle_roundtrip() {
        let identity = sign::generate_keypair(SignatureAlgorithm::Ed25519).unwrap();
        let mut store = PrekeyStore::initialize(identity).unwrap();
        let bundle = store.publish_bundle().unwrap();
        let bytes = encode_prekey_bundle(&bundle).unwrap();
        let decoded = decode_prekey_bundle(&bytes).unwrap();
        assert_eq!(decoded, bundle);

        // The decoded bundle still verifies and establishes.
        prekey::establish_as_initiator(&decoded).unwrap();
    }

    #[test]
    fn test_prekey_bundle_truncation_rejected() {
        let identity = sign::generate_keypair(SignatureAlgorithm::Ed25519).unwrap();
        let mut store = PrekeyStore::initialize(identity).unwrap();
        let bytes = encode_prekey_bundle(&store.publish_bundle().unwrap()).unwrap();
        assert!(decode_prekey_bundle(&bytes[..bytes.len() - 1]).is_err());
        // Trailing garbage is also rejected.
        let mut extended = bytes.clone();
        extended.push(0);
        assert_eq!(
            decode_prekey_bundle(&extended).unwrap_err(),
            WireError::LengthMismatch
        );
    }

    #[test]
    fn test_handshake_roundtrip() {
        let identity = sign::generate_keypair(SignatureAlgorithm::Ed25519).unwrap();
        let mut store = PrekeyStore::initialize(identity).unwrap();
        let bundle = store.publish_bundle().unwrap();
        let result = prekey::establish_as_initiator(&bundle).unwrap();
        let bytes = encode_handshake(&result.handshake);
        assert_eq!(decode_handshake(&bytes).unwrap(), result.handshake);
    }

    #[test]
    fn test_manifest_roundtrip() {
        let chunks: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 100]).collect();
        let manifest = build_manifest(chunks.iter().map(Vec::as_slice)).unwrap();
        let bytes = encode_manifest(&manifest).unwrap();
        assert_eq!(bytes.len(), 4 + 8 + 32 + 5 * 32);
        assert_eq!(decode_manifest(&bytes).unwrap(), manifest);
    }

    #[test]
    fn test_manifest_truncation_rejected() {
        let chunks: Vec<Vec<u8>> = (0u8..3).map(|i| vec![i; 10]).collect();
        let manifest = build_manifest(chunks.iter().map(Vec::as_slice)).unwrap();
        let bytes = encode_manifest(&manifest).unwrap();
        assert!(decode_manifest(&bytes[..bytes.len() - 1]).is_err());
    }
}
