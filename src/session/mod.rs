//! Session orchestrator.
//!
//! A [`Session`] wires the subsystems together: it owns one triple ratchet
//! and one AEAD sentinel, derives the SAS at establishment, frames messages
//! for the wire, and runs the file-transfer integrity flow (manifest build,
//! manifest signing, chunk AAD binding, whole-file verification).
//!
//! Sessions are single-threaded: callers serialize all operations on one
//! session. Multiple sessions run independently; the only process-wide
//! state is the secure-memory registry behind [`destroy_all_keys`].

pub mod replay;
pub mod storage;

use crate::crypto::aead::{CipherSuite, Sentinel};
use crate::crypto::kem::HybridPublicKey;
use crate::crypto::merkle::{self, FileVerification, IntegrityManifest};
use crate::crypto::prekey::{PrekeyBundle, PrekeyStore};
use crate::crypto::sas::Sas;
use crate::crypto::sign::{self, SignatureAlgorithm, SignatureKeyPair};
use crate::error::{ProtocolError, Result};
use crate::memory::{self, SecureBytes};
use crate::ratchet::{RatchetConfig, RatchetError, TripleRatchet};
use crate::wire;

use replay::ReplayGuard;

/// Which side of the handshake this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// A file offer: the manifest plus its identity signature, transmitted
/// before the first chunk.
#[derive(Debug, Clone)]
pub struct FileOffer {
    pub transfer_id: [u8; 16],
    pub manifest: IntegrityManifest,
    /// Ed25519 signature by the sender's identity key over the manifest
    /// wire bytes.
    pub manifest_signature: Vec<u8>,
}

/// One end-to-end encrypted session with a single peer.
pub struct Session {
    id: Vec<u8>,
    ratchet: TripleRatchet,
    sentinel: Sentinel,
    sas: Sas,
    replay: ReplayGuard,
    closed: bool,
}

impl Session {
    /// Establish a session from an initial shared secret (the prekey
    /// handshake output). Peer public keys may be absent when the transport
    /// has not delivered them yet; they are learned from the first inbound
    /// message.
    pub fn open(
        role: Role,
        shared_secret: &SecureBytes,
        peer_dh_public: Option<[u8; 32]>,
        peer_pq_public: Option<HybridPublicKey>,
        session_id: Option<Vec<u8>>,
        config: RatchetConfig,
    ) -> Result<Self> {
        let id = session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().into_bytes().to_vec());
        let is_initiator = role == Role::Initiator;
        let ratchet = TripleRatchet::new(
            shared_secret,
            is_initiator,
            peer_dh_public,
            peer_pq_public,
            config,
        )?;
        let sas = Sas::derive(shared_secret, &id)?;
        log::debug!("session {} opened as {:?}", hex::encode(&id[..4.min(id.len())]), role);
        Ok(Self {
            id,
            ratchet,
            sentinel: Sentinel::new(CipherSuite::preferred()),
            sas,
            replay: ReplayGuard::new(),
            closed: false,
        })
    }

    /// Override the negotiated cipher (before any traffic flows).
    pub fn with_cipher(mut self, cipher: CipherSuite) -> Self {
        self.sentinel = Sentinel::new(cipher);
        self
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn cipher(&self) -> CipherSuite {
        self.sentinel.cipher()
    }

    /// Our DH ratchet public key, for the peer's session construction.
    pub fn local_dh_public(&self) -> [u8; 32] {
        self.ratchet.local_dh_public()
    }

    /// Our PQ ratchet public key, for the peer's session construction.
    pub fn local_pq_public(&self) -> HybridPublicKey {
        self.ratchet.local_pq_public().clone()
    }

    /// Adopt peer ratchet public keys once the transport delivers them.
    pub fn set_peer_keys(
        &mut self,
        peer_dh_public: Option<[u8; 32]>,
        peer_pq_public: Option<HybridPublicKey>,
    ) {
        self.ratchet.set_peer_keys(peer_dh_public, peer_pq_public);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ProtocolError::SessionClosed);
        }
        Ok(())
    }

    /// Encrypt a message and frame it for the wire.
    pub fn encrypt(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let message = self
            .ratchet
            .encrypt(&mut self.sentinel, plaintext, associated_data)?;
        Ok(wire::encode_message(&message)?)
    }

    /// Parse and decrypt a wire message. Exact duplicates of an
    /// already-accepted message are rejected before any key derivation.
    pub fn decrypt(&mut self, wire_message: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let message = wire::decode_message(wire_message)?;
        if self.replay.is_replay(wire_message) {
            return Err(RatchetError::MessageReplayed {
                message_number: message.message_number,
            }
            .into());
        }
        let plaintext = self
            .ratchet
            .decrypt(&self.sentinel, &message, associated_data)?;
        self.replay.record(wire_message);
        Ok(plaintext)
    }

    /// The short authentication string for out-of-band verification.
    pub fn sas(&self) -> &Sas {
        &self.sas
    }

    /// Transport ACK for a message that carried a PQ epoch advance.
    pub fn confirm_epoch_advance(&mut self) -> Result<()> {
        self.ensure_open()?;
        Ok(self.ratchet.confirm_epoch_advance()?)
    }

    pub fn epoch(&self) -> u32 {
        self.ratchet.epoch()
    }

    // ── File transfer ───────────────────────────────────────────────────

    /// Build and sign the integrity manifest for an outgoing file. The
    /// offer travels before the first chunk.
    pub fn offer_file<'a, I>(
        &self,
        chunks: I,
        identity: &SignatureKeyPair,
    ) -> Result<FileOffer>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        self.ensure_open()?;
        let manifest = merkle::build_manifest(chunks)?;
        let manifest_bytes = wire::encode_manifest(&manifest)?;
        let manifest_signature = sign::sign(
            identity.algorithm,
            identity.secret_key(),
            &manifest_bytes,
        )?;
        Ok(FileOffer {
            transfer_id: *uuid::Uuid::new_v4().as_bytes(),
            manifest,
            manifest_signature,
        })
    }

    /// Verify a received offer's manifest signature before accepting any
    /// chunk.
    pub fn verify_offer(
        &self,
        offer: &FileOffer,
        algorithm: SignatureAlgorithm,
        sender_identity_public: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        let manifest_bytes = wire::encode_manifest(&offer.manifest)?;
        let verified = sign::verify(
            algorithm,
            sender_identity_public,
            &manifest_bytes,
            &offer.manifest_signature,
        )?;
        if !verified {
            return Err(ProtocolError::InvalidManifestSignature);
        }
        Ok(())
    }

    /// Encrypt one file chunk. The AAD binds the transfer id and chunk
    /// index, so chunks cannot be replayed across positions or transfers.
    pub fn encrypt_chunk(
        &mut self,
        transfer_id: &[u8; 16],
        chunk_index: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let aad = chunk_aad(transfer_id, chunk_index);
        self.encrypt(plaintext, &aad)
    }

    /// Decrypt one file chunk, authenticating its transfer id and index.
    pub fn decrypt_chunk(
        &mut self,
        transfer_id: &[u8; 16],
        chunk_index: u64,
        wire_message: &[u8],
    ) -> Result<Vec<u8>> {
        let aad = chunk_aad(transfer_id, chunk_index);
        self.decrypt(wire_message, &aad)
    }

    /// Whole-file verification against the offer's manifest. Returns the
    /// corrupted chunk indices for targeted retransmission.
    pub fn verify_file<'a, I>(
        &self,
        chunks: I,
        manifest: &IntegrityManifest,
    ) -> Result<FileVerification>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        self.ensure_open()?;
        Ok(merkle::verify_file(chunks, manifest)?)
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Destroy the session: zeroize the ratchet and refuse all further
    /// operations.
    pub fn close(&mut self) {
        if !self.closed {
            self.ratchet.destroy();
            self.closed = true;
            log::debug!("session {} closed", hex::encode(&self.id[..4.min(self.id.len())]));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// AAD for a file chunk: transfer id (16 bytes) || chunk index (BE64).
fn chunk_aad(transfer_id: &[u8; 16], chunk_index: u64) -> [u8; 24] {
    let mut aad = [0u8; 24];
    aad[..16].copy_from_slice(transfer_id);
    aad[16..].copy_from_slice(&chunk_index.to_be_bytes());
    aad
}

/// Serialize the store's current bundle for publication.
pub fn publish_prekey_bundle(store: &mut PrekeyStore) -> Result<Vec<u8>> {
    let bundle = store.publish_bundle()?;
    Ok(wire::encode_prekey_bundle(&bundle)?)
}

/// Parse a peer's published bundle.
pub fn ingest_prekey_bundle(bytes: &[u8]) -> Result<PrekeyBundle> {
    Ok(wire::decode_prekey_bundle(bytes)?)
}

/// Emergency teardown: zeroize every live secure buffer in the process.
/// Returns the number of buffers wiped.
pub fn destroy_all_keys() -> u32 {
    memory::destroy_all()
}
