//! The triple ratchet session: Double Ratchet ⊕ sparse PQ ratchet.
//!
//! Every message key is `derive(combine-key, dh_message_key || pq_message_key)`,
//! so an adversary must break both the X25519 ratchet and the ML-KEM epoch
//! chain to read a message. Out-of-order delivery within a chain is served
//! from a bounded skipped-key map; ordering across DH ratchet steps requires
//! the sender's new public key to have arrived first.
//!
//! A session is single-threaded: callers serialize encrypt and decrypt. The
//! state machine assumes it, and the AEAD sentinel's counters depend on it.

use std::collections::HashMap;

use super::{
    DoubleRatchet, KemAdvance, RatchetConfig, RatchetError, Result, SparsePqRatchet,
};
use crate::crypto::aead::{
    AeadError, Direction, EncryptOptions, EncryptedChunk, Sentinel,
};
use crate::crypto::hash::{Hasher, KdfContext};
use crate::crypto::kem::HybridPublicKey;
use crate::memory::SecureBytes;

/// A DH ratchet send step is forced every this many messages even without a
/// direction change.
pub const DH_RATCHET_MESSAGE_INTERVAL: u64 = 1000;
/// Ceiling on stored skipped message keys per session.
pub const MAX_SKIPPED_KEYS: usize = 1000;

/// One protocol message as the ratchet sees it: the header fields that
/// drive both ratchets, plus the AEAD chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    pub epoch: u32,
    pub message_number: u64,
    pub sender_dh_public: [u8; 32],
    pub previous_chain_length: u64,
    pub kem_advance: Option<KemAdvance>,
    pub chunk: EncryptedChunk,
}

pub struct TripleRatchet {
    dr: DoubleRatchet,
    pq: SparsePqRatchet,
    /// Running digest of root material across both ratchets; refreshed with
    /// the PQ epoch secret at every DH ratchet step.
    hybrid_root: SecureBytes,
    /// (sender DH public, message number) -> DH message key.
    skipped: HashMap<([u8; 32], u64), SecureBytes>,
    is_initiator: bool,
    closed: bool,
}

impl TripleRatchet {
    pub fn new(
        initial_secret: &SecureBytes,
        is_initiator: bool,
        peer_dh_public: Option<[u8; 32]>,
        peer_pq_public: Option<HybridPublicKey>,
        config: RatchetConfig,
    ) -> Result<Self> {
        let dr = DoubleRatchet::new(initial_secret, is_initiator, peer_dh_public)?;
        let pq = SparsePqRatchet::new(initial_secret, is_initiator, peer_pq_public, config)?;
        let mut root =
            crate::crypto::hash::derive_key(KdfContext::HybridKex, &initial_secret.data()?)
                .to_vec();
        let hybrid_root = SecureBytes::take(&mut root, "hybrid-root-key")?;
        Ok(Self {
            dr,
            pq,
            hybrid_root,
            skipped: HashMap::new(),
            is_initiator,
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn epoch(&self) -> u32 {
        self.pq.epoch()
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Our DH and PQ public keys, for the peer's session construction.
    pub fn local_dh_public(&self) -> [u8; 32] {
        self.dr.local_public()
    }

    pub fn local_pq_public(&self) -> &HybridPublicKey {
        self.pq.local_public()
    }

    /// Adopt peer ratchet public keys delivered by the transport after
    /// construction. Already-known keys are left untouched.
    pub fn set_peer_keys(
        &mut self,
        peer_dh_public: Option<[u8; 32]>,
        peer_pq_public: Option<HybridPublicKey>,
    ) {
        if let Some(dh) = peer_dh_public {
            self.dr.learn_peer_public(dh);
        }
        if let Some(pq) = peer_pq_public {
            self.pq.set_peer_public(pq);
        }
    }

    /// The direction this side encrypts under.
    pub fn send_direction(&self) -> Direction {
        if self.is_initiator {
            Direction::Sender
        } else {
            Direction::Receiver
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RatchetError::SessionClosed);
        }
        Ok(())
    }

    /// Transport ACK for a message that carried a KEM advance.
    pub fn confirm_epoch_advance(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.pq.confirm_epoch_advance()
    }

    /// Encrypt one message.
    pub fn encrypt(
        &mut self,
        sentinel: &mut Sentinel,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<RatchetMessage> {
        self.ensure_open()?;

        // Lazy DH ratchet: first send after a ratchet receive, or the
        // periodic interval. Without the peer's DH key there is nothing to
        // ratchet against yet.
        let interval_due =
            self.dr.send_n() > 0 && self.dr.send_n() % DH_RATCHET_MESSAGE_INTERVAL == 0;
        if (self.dr.needs_send_ratchet() || interval_due) && self.dr.peer_public().is_some() {
            self.dr.ratchet_send()?;
            self.refresh_hybrid_root()?;
        }

        let (message_number, dh_key) = self.dr.next_send_key()?;
        let pq_step = self.pq.prepare_send(message_number)?;
        let combined = combine_keys(&dh_key, &pq_step.message_key)?;

        let chunk = sentinel.encrypt_chunk(
            plaintext,
            &combined,
            EncryptOptions::new(self.send_direction()).with_aad(associated_data),
        )?;

        Ok(RatchetMessage {
            epoch: pq_step.epoch,
            message_number,
            sender_dh_public: self.dr.local_public(),
            previous_chain_length: self.dr.prev_chain_len(),
            kem_advance: pq_step.kem_advance,
            chunk,
        })
    }

    /// Decrypt one message, tolerating out-of-order delivery within the
    /// skipped-key window.
    pub fn decrypt(
        &mut self,
        sentinel: &Sentinel,
        message: &RatchetMessage,
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;

        let skip_key = (message.sender_dh_public, message.message_number);
        let (dh_key, from_skipped) = match self.skipped.remove(&skip_key) {
            Some(key) => (key, true),
            None => (self.derive_fresh_recv_key(message)?, false),
        };

        let pq_key =
            match self
                .pq
                .process_receive(message.epoch, message.message_number, message.kem_advance.as_ref())
            {
                Ok(key) => key,
                Err(err) => {
                    // Keep the already-derived DH key so a redelivery of
                    // this message can still decrypt.
                    self.skipped.insert(skip_key, dh_key);
                    return Err(err);
                }
            };

        let combined = combine_keys(&dh_key, &pq_key)?;
        match sentinel.decrypt_chunk(&message.chunk, &combined, associated_data) {
            Ok(plaintext) => {
                // Each direction change turns the DH ratchet on the next send.
                self.dr.flag_send_ratchet();
                Ok(plaintext)
            }
            Err(AeadError::AuthFailed) => {
                // A forged header must not burn the real message's key.
                if !from_skipped {
                    self.skipped.insert(skip_key, dh_key);
                }
                Err(AeadError::AuthFailed.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Advance the receive side of the DH ratchet as far as the message
    /// header requires and derive its chain key.
    fn derive_fresh_recv_key(&mut self, message: &RatchetMessage) -> Result<SecureBytes> {
        match self.dr.peer_public() {
            None => self.dr.learn_peer_public(message.sender_dh_public),
            Some(known) if known != message.sender_dh_public => {
                // New ratchet key: bank the rest of the old chain first.
                let drain_to = message.previous_chain_length;
                self.check_skip_budget(drain_to.saturating_sub(self.dr.recv_n()))?;
                for (n, key) in self.dr.skip_recv_keys(drain_to)? {
                    self.skipped.insert((known, n), key);
                }
                self.dr.ratchet_receive(message.sender_dh_public)?;
                self.refresh_hybrid_root()?;
            }
            Some(_) => {}
        }

        if message.message_number > self.dr.recv_n() {
            self.check_skip_budget(message.message_number - self.dr.recv_n())?;
            for (n, key) in self.dr.skip_recv_keys(message.message_number)? {
                self.skipped.insert((message.sender_dh_public, n), key);
            }
        }

        if message.message_number == self.dr.recv_n() {
            self.dr.next_recv_key()
        } else {
            Err(RatchetError::MessageReplayed {
                message_number: message.message_number,
            })
        }
    }

    fn check_skip_budget(&self, additional: u64) -> Result<()> {
        if self.skipped.len() as u64 + additional > MAX_SKIPPED_KEYS as u64 {
            return Err(RatchetError::ReceiveSkipLimitExceeded);
        }
        Ok(())
    }

    /// Mix the current PQ epoch secret into the hybrid root. Runs at every
    /// DH ratchet step so the root reflects both adversary classes.
    fn refresh_hybrid_root(&mut self) -> Result<()> {
        let mut hasher = Hasher::new_derive_key(KdfContext::RootKey);
        hasher
            .update(&self.hybrid_root.data()?)
            .update(&self.pq.epoch_secret().data()?);
        let mut next = hasher.finalize().to_vec();
        let next = SecureBytes::take(&mut next, "hybrid-root-key")?;
        self.hybrid_root.zero();
        self.hybrid_root = next;
        Ok(())
    }

    /// Zeroize every chain key, root key, private key, skipped key, and the
    /// embedded PQ ratchet. Every later operation fails `SessionClosed`.
    pub fn destroy(&mut self) {
        self.dr.destroy();
        self.pq.destroy();
        self.hybrid_root.zero();
        for (_, mut key) in self.skipped.drain() {
            key.zero();
        }
        self.closed = true;
        log::debug!("triple ratchet destroyed");
    }
}

fn combine_keys(dh_key: &SecureBytes, pq_key: &SecureBytes) -> Result<SecureBytes> {
    let mut hasher = Hasher::new_derive_key(KdfContext::CombineKey);
    hasher.update(&dh_key.data()?).update(&pq_key.data()?);
    let mut key = hasher.finalize().to_vec();
    Ok(SecureBytes::take(&mut key, "combined-message-key")?)
}
