//! Sparse post-quantum ratchet.
//!
//! Rather than a KEM per message, the PQ layer advances in epochs: after a
//! configurable number of messages or a maximum epoch age, the side whose
//! parity matches the current epoch (initiator on even epochs, responder on
//! odd) encapsulates against the peer's hybrid public key and attaches the
//! ciphertext to an outgoing message. The advance blob also carries the
//! advancing side's next hybrid public key, so each rotation reaches the
//! peer exactly when it becomes relevant.
//!
//! Epoch commits are two-phase, mirroring the transport's delivery
//! guarantees: the sender holds the new secret pending until the carrier
//! message is acknowledged ([`SparsePqRatchet::confirm_epoch_advance`]) or
//! until a peer message from the target epoch arrives (implicit ACK); the
//! receiver decapsulates immediately but combines only when the first
//! message of the next epoch shows up, so in-flight old-epoch messages stay
//! readable until the sender actually switches.
//!
//! Within an epoch, message keys are derived by message number from the
//! epoch secret — random access, no per-message chain. Forward secrecy
//! across epochs comes from the combine step consuming the old secret.

use chrono::Utc;

use super::{RatchetConfig, RatchetError, Result};
use crate::crypto::hash::{derive_key, Hasher, KdfContext};
use crate::crypto::kem::{
    self, HybridCiphertext, HybridKeyPair, HybridPublicKey, HYBRID_CIPHERTEXT_BYTES,
    HYBRID_PUBLIC_KEY_BYTES,
};
use crate::memory::SecureBytes;

/// Serialized size of a [`KemAdvance`] blob.
pub const KEM_ADVANCE_BYTES: usize = HYBRID_CIPHERTEXT_BYTES + HYBRID_PUBLIC_KEY_BYTES;

/// The epoch-advance blob attached to a carrier message: the KEM ciphertext
/// plus the advancing side's next hybrid public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KemAdvance {
    pub ciphertext: HybridCiphertext,
    pub next_public: HybridPublicKey,
}

impl KemAdvance {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEM_ADVANCE_BYTES);
        out.extend_from_slice(&self.ciphertext.to_bytes());
        out.extend_from_slice(&self.next_public.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> kem::Result<Self> {
        if bytes.len() != KEM_ADVANCE_BYTES {
            return Err(kem::KemError::InvalidKeyLength);
        }
        Ok(Self {
            ciphertext: HybridCiphertext::from_bytes(&bytes[..HYBRID_CIPHERTEXT_BYTES])?,
            next_public: HybridPublicKey::from_bytes(&bytes[HYBRID_CIPHERTEXT_BYTES..])?,
        })
    }
}

/// What a send produces: the per-message key, the epoch the message belongs
/// to, and an advance blob when this message carries a rekey.
#[derive(Debug)]
pub struct PqSendStep {
    pub message_key: SecureBytes,
    pub epoch: u32,
    pub kem_advance: Option<KemAdvance>,
}

struct PendingOutbound {
    kem_secret: SecureBytes,
    next_keypair: HybridKeyPair,
    target_epoch: u32,
}

struct PendingInbound {
    kem_secret: SecureBytes,
    peer_next_public: HybridPublicKey,
    target_epoch: u32,
}

/// Sparse PQ ratchet state for one session.
pub struct SparsePqRatchet {
    epoch: u32,
    epoch_secret: SecureBytes,
    local_keypair: HybridKeyPair,
    /// Kept one epoch so in-flight ciphertexts against the replaced key
    /// still decapsulate.
    previous_keypair: Option<HybridKeyPair>,
    peer_public: Option<HybridPublicKey>,
    pending_outbound: Option<PendingOutbound>,
    pending_inbound: Option<PendingInbound>,
    message_count: u32,
    epoch_created_at_ms: i64,
    is_initiator: bool,
    config: RatchetConfig,
}

impl SparsePqRatchet {
    /// Build epoch 0 from the session's initial shared secret.
    pub fn new(
        initial_secret: &SecureBytes,
        is_initiator: bool,
        peer_public: Option<HybridPublicKey>,
        config: RatchetConfig,
    ) -> Result<Self> {
        let mut secret = derive_key(KdfContext::SckaEpochKey, &initial_secret.data()?).to_vec();
        let epoch_secret = SecureBytes::take(&mut secret, "pq-epoch-secret")?;
        Ok(Self {
            epoch: 0,
            epoch_secret,
            local_keypair: HybridKeyPair::generate()?,
            previous_keypair: None,
            peer_public,
            pending_outbound: None,
            pending_inbound: None,
            message_count: 0,
            epoch_created_at_ms: Utc::now().timestamp_millis(),
            is_initiator,
            config,
        })
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn local_public(&self) -> &HybridPublicKey {
        self.local_keypair.public()
    }

    /// Let the peer's initial public key be learned after construction
    /// (responder side, first inbound handshake).
    pub fn set_peer_public(&mut self, public: HybridPublicKey) {
        self.peer_public = Some(public);
    }

    /// Whether the epoch is due to advance: message threshold reached or
    /// epoch too old.
    pub fn should_advance_epoch(&self) -> bool {
        self.message_count >= self.config.message_threshold
            || Utc::now().timestamp_millis() - self.epoch_created_at_ms
                > self.config.max_epoch_age_ms as i64
    }

    /// Whether this side generates the KEM for the current epoch's advance.
    fn our_parity(&self) -> bool {
        let even = self.epoch % 2 == 0;
        (self.is_initiator && even) || (!self.is_initiator && !even)
    }

    /// Per-message key: random access within the epoch by message number.
    fn message_key(secret: &SecureBytes, epoch: u32, message_number: u64) -> Result<SecureBytes> {
        let mut hasher = Hasher::new_derive_key(KdfContext::SckaMsgKey);
        hasher
            .update(&secret.data()?)
            .update(&epoch.to_be_bytes())
            .update(&(message_number as u32).to_be_bytes());
        let mut key = hasher.finalize().to_vec();
        Ok(SecureBytes::take(&mut key, "pq-message-key")?)
    }

    /// Derive the key for an outgoing message and, when an advance is due on
    /// our parity, generate the KEM ciphertext and hold the advance pending.
    pub fn prepare_send(&mut self, message_number: u64) -> Result<PqSendStep> {
        let message_key = Self::message_key(&self.epoch_secret, self.epoch, message_number)?;
        self.message_count += 1;

        let mut kem_advance = None;
        if self.should_advance_epoch() && self.our_parity() && self.pending_outbound.is_none() {
            let peer = self
                .peer_public
                .as_ref()
                .ok_or(RatchetError::PeerKeyUnknown)?;
            let (ciphertext, kem_secret) = kem::encapsulate(peer)?;
            let next_keypair = HybridKeyPair::generate()?;
            kem_advance = Some(KemAdvance {
                ciphertext,
                next_public: next_keypair.public().clone(),
            });
            self.pending_outbound = Some(PendingOutbound {
                kem_secret,
                next_keypair,
                target_epoch: self.epoch + 1,
            });
            log::debug!(
                "pq ratchet: proposing epoch {} -> {}",
                self.epoch,
                self.epoch + 1
            );
        }

        Ok(PqSendStep {
            message_key,
            epoch: self.epoch,
            kem_advance,
        })
    }

    /// Transport acknowledged the carrier message: commit the pending
    /// outbound advance.
    pub fn confirm_epoch_advance(&mut self) -> Result<()> {
        let pending = match self.pending_outbound.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        self.commit_outbound(pending)
    }

    fn commit_outbound(&mut self, pending: PendingOutbound) -> Result<()> {
        self.advance_epoch(pending.target_epoch, &pending.kem_secret)?;
        self.rotate_local_keypair(pending.next_keypair);
        Ok(())
    }

    fn commit_inbound(&mut self, pending: PendingInbound) -> Result<()> {
        self.advance_epoch(pending.target_epoch, &pending.kem_secret)?;
        self.peer_public = Some(pending.peer_next_public);
        Ok(())
    }

    fn advance_epoch(&mut self, target_epoch: u32, kem_secret: &SecureBytes) -> Result<()> {
        let mut hasher = Hasher::new_derive_key(KdfContext::SckaCombine);
        hasher
            .update(&self.epoch_secret.data()?)
            .update(&kem_secret.data()?);
        let mut next = hasher.finalize().to_vec();
        let next_secret = SecureBytes::take(&mut next, "pq-epoch-secret")?;
        // The combine consumed the old secret; drop it wiped.
        self.epoch_secret.zero();
        self.epoch_secret = next_secret;
        self.epoch = target_epoch;
        self.message_count = 0;
        self.epoch_created_at_ms = Utc::now().timestamp_millis();
        log::debug!("pq ratchet: epoch advanced to {}", target_epoch);
        Ok(())
    }

    fn rotate_local_keypair(&mut self, next: HybridKeyPair) {
        let retired = std::mem::replace(&mut self.local_keypair, next);
        if let Some(mut old) = self.previous_keypair.replace(retired) {
            old.zeroize_secrets();
        }
    }

    /// Process an inbound message's PQ fields and return its message key.
    ///
    /// A KEM blob on a current-epoch message is decapsulated into a pending
    /// inbound advance; the advance commits when the first message of the
    /// target epoch arrives. A message from our own pending outbound target
    /// epoch is an implicit ACK. Anything further ahead is `FutureEpoch`;
    /// anything behind the current epoch is past the forward-secrecy
    /// boundary and refused.
    pub fn process_receive(
        &mut self,
        epoch: u32,
        message_number: u64,
        kem_advance: Option<&KemAdvance>,
    ) -> Result<SecureBytes> {
        if epoch < self.epoch {
            return Err(RatchetError::EpochRegressed {
                epoch,
                current: self.epoch,
            });
        }

        if epoch > self.epoch {
            // Only a single prepared step forward is reachable; everything
            // else lacks its prerequisite KEM.
            let mut committed = false;
            if let Some(pending) = self.pending_inbound.take() {
                if pending.target_epoch == epoch {
                    self.commit_inbound(pending)?;
                    committed = true;
                } else {
                    self.pending_inbound = Some(pending);
                }
            }
            if !committed {
                if let Some(pending) = self.pending_outbound.take() {
                    if pending.target_epoch == epoch {
                        // The peer is already speaking from our proposed
                        // epoch: the carrier message arrived, commit without
                        // waiting for the transport ACK.
                        self.commit_outbound(pending)?;
                        committed = true;
                    } else {
                        self.pending_outbound = Some(pending);
                    }
                }
            }
            if !committed {
                return Err(RatchetError::FutureEpoch { epoch });
            }
        }

        // A rekey proposal rides on a message from the epoch it leaves,
        // which by now is the current epoch.
        if let Some(advance) = kem_advance {
            if self.pending_inbound.is_none() && self.pending_outbound.is_none() {
                let kem_secret = self.decapsulate_with_transition(&advance.ciphertext)?;
                self.pending_inbound = Some(PendingInbound {
                    kem_secret,
                    peer_next_public: advance.next_public.clone(),
                    target_epoch: self.epoch + 1,
                });
                log::debug!(
                    "pq ratchet: peer proposed epoch {} -> {}",
                    self.epoch,
                    self.epoch + 1
                );
            }
        }

        let key = Self::message_key(&self.epoch_secret, epoch, message_number)?;
        self.message_count += 1;
        Ok(key)
    }

    /// Decapsulate against the current keypair, falling back to the
    /// previous one for ciphertexts that crossed a rotation in flight.
    fn decapsulate_with_transition(&self, ciphertext: &HybridCiphertext) -> Result<SecureBytes> {
        match kem::decapsulate(ciphertext, &self.local_keypair) {
            Ok(secret) => Ok(secret),
            Err(err) => match &self.previous_keypair {
                Some(previous) => Ok(kem::decapsulate(ciphertext, previous)?),
                None => Err(err.into()),
            },
        }
    }

    /// The current epoch secret, for mixing into the hybrid root key.
    pub(crate) fn epoch_secret(&self) -> &SecureBytes {
        &self.epoch_secret
    }

    /// Zeroize all PQ state.
    pub fn destroy(&mut self) {
        self.epoch_secret.zero();
        self.local_keypair.zeroize_secrets();
        if let Some(previous) = self.previous_keypair.as_mut() {
            previous.zeroize_secrets();
        }
        if let Some(pending) = self.pending_outbound.as_mut() {
            pending.kem_secret.zero();
            pending.next_keypair.zeroize_secrets();
        }
        if let Some(pending) = self.pending_inbound.as_mut() {
            pending.kem_secret.zero();
        }
    }

    #[cfg(test)]
    fn age_epoch(&mut self, by_ms: i64) {
        self.epoch_created_at_ms -= by_ms;
    }
}
