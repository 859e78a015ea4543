//! Double Ratchet (X25519) state: root key, per-direction chains, and DH
//! ratchet steps.
//!
//! State separation:
//!   root key    — updated on every DH ratchet step
//!   send chain  — advanced once per outgoing message
//!   recv chain  — advanced once per incoming message
//!   message key — derived from (chain key, message number), used once
//!
//! The message number is part of the message-key derivation input, so a
//! desynchronized chain produces keys that fail authentication instead of
//! silently decrypting the wrong message.
//!
//! Unlike the classic presentation, the DH ratchet send step is lazy: it
//! runs on the first send after a ratchet receive (or on the periodic
//! interval), which the owning triple ratchet decides.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::{RatchetError, Result};
use crate::crypto::hash::{derive_key, Hasher, KdfContext};
use crate::memory::SecureBytes;

/// Tags feeding the initial chain derivation; initiator and responder use
/// swapped assignments so one side's send chain is the other's recv chain.
const CHAIN_TAG_A: u8 = 0x01;
const CHAIN_TAG_B: u8 = 0x02;

pub struct DoubleRatchet {
    root_key: SecureBytes,
    send_chain: SecureBytes,
    recv_chain: SecureBytes,
    local_secret: SecureBytes,
    local_public: [u8; 32],
    peer_public: Option<[u8; 32]>,
    send_n: u64,
    recv_n: u64,
    prev_chain_len: u64,
    needs_send_ratchet: bool,
}

impl DoubleRatchet {
    /// Initialize from the session's initial shared secret.
    ///
    /// Root key = derive(hybrid-kex, initial secret); the two chains are
    /// derived from the root under swapped direction tags. The peer's DH
    /// public key may be unknown until their first message arrives.
    pub fn new(
        initial_secret: &SecureBytes,
        is_initiator: bool,
        peer_public: Option<[u8; 32]>,
    ) -> Result<Self> {
        let root = derive_key(KdfContext::HybridKex, &initial_secret.data()?);
        let (send_tag, recv_tag) = if is_initiator {
            (CHAIN_TAG_A, CHAIN_TAG_B)
        } else {
            (CHAIN_TAG_B, CHAIN_TAG_A)
        };
        let send_chain = chain_from_root(&root, send_tag)?;
        let recv_chain = chain_from_root(&root, recv_tag)?;

        let local_secret = StaticSecret::random_from_rng(OsRng);
        let local_public = PublicKey::from(&local_secret).to_bytes();
        let mut root = root.to_vec();
        let root_key = SecureBytes::take(&mut root, "dr-root-key")?;

        Ok(Self {
            root_key,
            send_chain,
            recv_chain,
            local_secret: SecureBytes::from_copy(local_secret.as_bytes(), "dr-local-secret")?,
            local_public,
            peer_public,
            send_n: 0,
            recv_n: 0,
            prev_chain_len: 0,
            needs_send_ratchet: false,
        })
    }

    pub fn local_public(&self) -> [u8; 32] {
        self.local_public
    }

    pub fn peer_public(&self) -> Option<[u8; 32]> {
        self.peer_public
    }

    pub fn send_n(&self) -> u64 {
        self.send_n
    }

    pub fn recv_n(&self) -> u64 {
        self.recv_n
    }

    pub fn prev_chain_len(&self) -> u64 {
        self.prev_chain_len
    }

    pub fn needs_send_ratchet(&self) -> bool {
        self.needs_send_ratchet
    }

    /// First message from a peer whose DH key we did not know yet: adopt it
    /// without a ratchet step (the initial chains already cover it).
    pub fn learn_peer_public(&mut self, peer: [u8; 32]) {
        if self.peer_public.is_none() {
            self.peer_public = Some(peer);
        }
    }

    /// Request a DH ratchet step on the next send. Called after every
    /// successful receive so each direction change turns the ratchet.
    pub fn flag_send_ratchet(&mut self) {
        self.needs_send_ratchet = true;
    }

    /// DH ratchet send step: fresh keypair, ECDH against the peer key, new
    /// root and send chain, counters reset.
    pub fn ratchet_send(&mut self) -> Result<()> {
        let peer = self.peer_public.ok_or(RatchetError::PeerKeyUnknown)?;

        let fresh_secret = StaticSecret::random_from_rng(OsRng);
        let fresh_public = PublicKey::from(&fresh_secret).to_bytes();
        let dh = fresh_secret.diffie_hellman(&PublicKey::from(peer));

        let (new_root, new_chain) = self.kdf_root_step(dh.as_bytes())?;
        self.root_key.zero();
        self.root_key = new_root;
        self.send_chain.zero();
        self.send_chain = new_chain;
        self.local_secret.zero();
        self.local_secret = SecureBytes::from_copy(fresh_secret.as_bytes(), "dr-local-secret")?;
        self.local_public = fresh_public;
        self.prev_chain_len = self.send_n;
        self.send_n = 0;
        self.needs_send_ratchet = false;
        log::debug!("dh ratchet send step, new public {}", &hex::encode(fresh_public)[..8]);
        Ok(())
    }

    /// DH ratchet receive step for a new peer public key: ECDH with our
    /// current secret, new root and recv chain, flag the lazy send step.
    pub fn ratchet_receive(&mut self, new_peer_public: [u8; 32]) -> Result<()> {
        let local: [u8; 32] = self.local_secret.to_array()?;
        let secret = StaticSecret::from(local);
        let dh = secret.diffie_hellman(&PublicKey::from(new_peer_public));

        let (new_root, new_chain) = self.kdf_root_step(dh.as_bytes())?;
        self.root_key.zero();
        self.root_key = new_root;
        self.recv_chain.zero();
        self.recv_chain = new_chain;
        self.peer_public = Some(new_peer_public);
        self.recv_n = 0;
        self.needs_send_ratchet = true;
        Ok(())
    }

    /// KDF_RK: (root, dh) -> (new root, new chain). Both outputs read the
    /// old root, under separate registry contexts.
    fn kdf_root_step(&self, dh_output: &[u8; 32]) -> Result<(SecureBytes, SecureBytes)> {
        let root_guard = self.root_key.data()?;

        let mut hasher = Hasher::new_derive_key(KdfContext::RootKey);
        hasher.update(&root_guard).update(dh_output);
        let mut new_root = hasher.finalize().to_vec();

        let mut hasher = Hasher::new_derive_key(KdfContext::ChainKey);
        hasher.update(&root_guard).update(dh_output);
        let mut new_chain = hasher.finalize().to_vec();
        drop(root_guard);

        Ok((
            SecureBytes::take(&mut new_root, "dr-root-key")?,
            SecureBytes::take(&mut new_chain, "dr-chain-key")?,
        ))
    }

    /// Derive the key for the next outgoing message and advance the send
    /// chain. Returns (message number, key).
    pub fn next_send_key(&mut self) -> Result<(u64, SecureBytes)> {
        if self.send_n == u64::MAX {
            return Err(RatchetError::ChainExhausted);
        }
        let n = self.send_n;
        let key = message_key(&self.send_chain, n)?;
        self.send_chain = advance_chain(&mut self.send_chain)?;
        self.send_n += 1;
        Ok((n, key))
    }

    /// Derive the key for the incoming message at the current chain
    /// position and advance the recv chain.
    pub fn next_recv_key(&mut self) -> Result<SecureBytes> {
        if self.recv_n == u64::MAX {
            return Err(RatchetError::ChainExhausted);
        }
        let key = message_key(&self.recv_chain, self.recv_n)?;
        self.recv_chain = advance_chain(&mut self.recv_chain)?;
        self.recv_n += 1;
        Ok(key)
    }

    /// Derive and collect the message keys from the current recv position
    /// up to (excluding) `until`, advancing the chain past them. The caller
    /// stores them in its skipped-key map.
    pub fn skip_recv_keys(&mut self, until: u64) -> Result<Vec<(u64, SecureBytes)>> {
        let mut skipped = Vec::new();
        while self.recv_n < until {
            let n = self.recv_n;
            let key = self.next_recv_key()?;
            skipped.push((n, key));
        }
        Ok(skipped)
    }

    /// Zeroize all double-ratchet state.
    pub fn destroy(&mut self) {
        self.root_key.zero();
        self.send_chain.zero();
        self.recv_chain.zero();
        self.local_secret.zero();
        self.local_public.zeroize();
    }
}

fn chain_from_root(root: &[u8; 32], tag: u8) -> Result<SecureBytes> {
    let mut hasher = Hasher::new_derive_key(KdfContext::ChainKey);
    hasher.update(root).update(&[tag]);
    let mut chain = hasher.finalize().to_vec();
    Ok(SecureBytes::take(&mut chain, "dr-chain-key")?)
}

/// Message key from (chain key, message number). The number is always part
/// of the input.
fn message_key(chain: &SecureBytes, n: u64) -> Result<SecureBytes> {
    let mut hasher = Hasher::new_derive_key(KdfContext::MessageKey);
    hasher.update(&chain.data()?).update(&n.to_be_bytes());
    let mut key = hasher.finalize().to_vec();
    Ok(SecureBytes::take(&mut key, "dr-message-key")?)
}

/// One-way chain advance. The old chain key is wiped.
fn advance_chain(chain: &mut SecureBytes) -> Result<SecureBytes> {
    let mut next = derive_key(KdfContext::ChainKey, &chain.data()?).to_vec();
    chain.zero();
    Ok(SecureBytes::take(&mut next, "dr-chain-key")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SecureBytes {
        SecureBytes::from_copy(&[0x5Au8; 32], "initial").unwrap()
    }

    fn pair() -> (DoubleRatchet, DoubleRatchet) {
        let alice = DoubleRatchet::new(&secret(), true, None).unwrap();
        let mut bob = DoubleRatchet::new(&secret(), false, None).unwrap();
        bob.learn_peer_public(alice.local_public());
        (alice, bob)
    }

    #[test]
    fn test_initial_chains_cross_match() {
        let (mut alice, mut bob) = pair();
        // Alice's send chain is Bob's recv chain, message by message.
        for _ in 0..3 {
            let (n, alice_key) = alice.next_send_key().unwrap();
            let bob_key = bob.next_recv_key().unwrap();
            assert_eq!(
                &*alice_key.data().unwrap(),
                &*bob_key.data().unwrap(),
                "message {n}"
            );
        }
        // And the reverse direction is a distinct chain.
        let (_, bob_key) = bob.next_send_key().unwrap();
        let alice_key = alice.next_recv_key().unwrap();
        assert_eq!(&*bob_key.data().unwrap(), &*alice_key.data().unwrap());
    }

    #[test]
    fn test_message_number_in_derivation() {
        let (mut alice, _) = pair();
        let (_, k0) = alice.next_send_key().unwrap();
        let (_, k1) = alice.next_send_key().unwrap();
        assert_ne!(&*k0.data().unwrap(), &*k1.data().unwrap());
    }

    #[test]
    fn test_dh_ratchet_roundtrip() {
        let (mut alice, mut bob) = pair();
        // Bob must know Alice's current public; Alice must know Bob's.
        alice.learn_peer_public(bob.local_public());

        // Alice ratchets and sends; Bob sees the new public and follows.
        alice.ratchet_send().unwrap();
        bob.ratchet_receive(alice.local_public()).unwrap();
        assert!(bob.needs_send_ratchet());

        let (_, alice_key) = alice.next_send_key().unwrap();
        let bob_key = bob.next_recv_key().unwrap();
        assert_eq!(&*alice_key.data().unwrap(), &*bob_key.data().unwrap());

        // Bob's lazy send step, mirrored by Alice.
        bob.ratchet_send().unwrap();
        alice.ratchet_receive(bob.local_public()).unwrap();
        let (_, bob_key) = bob.next_send_key().unwrap();
        let alice_key = alice.next_recv_key().unwrap();
        assert_eq!(&*bob_key.data().unwrap(), &*alice_key.data().unwrap());
    }

    #[test]
    fn test_ratchet_send_without_peer_key_fails() {
        let mut alice = DoubleRatchet::new(&secret(), true, None).unwrap();
        assert_eq!(alice.ratchet_send().unwrap_err(), RatchetError::PeerKeyUnknown);
    }

    #[test]
    fn test_counters_reset_on_ratchet() {
        let (mut alice, mut bob) = pair();
        alice.learn_peer_public(bob.local_public());
        for _ in 0..5 {
            alice.next_send_key().unwrap();
            bob.next_recv_key().unwrap();
        }
        assert_eq!(alice.send_n(), 5);
        alice.ratchet_send().unwrap();
        assert_eq!(alice.send_n(), 0);
        assert_eq!(alice.prev_chain_len(), 5);
    }

    #[test]
    fn test_skip_recv_keys() {
        let (mut alice, mut bob) = pair();
        let (_, k0) = alice.next_send_key().unwrap();
        let (_, k1) = alice.next_send_key().unwrap();
        let (_, k2) = alice.next_send_key().unwrap();

        // Bob jumps straight to message 2, banking 0 and 1.
        let skipped = bob.skip_recv_keys(2).unwrap();
        assert_eq!(skipped.len(), 2);
        assert_eq!(skipped[0].0, 0);
        assert_eq!(&*skipped[0].1.data().unwrap(), &*k0.data().unwrap());
        assert_eq!(&*skipped[1].1.data().unwrap(), &*k1.data().unwrap());

        let bob_k2 = bob.next_recv_key().unwrap();
        assert_eq!(&*bob_k2.data().unwrap(), &*k2.data().unwrap());
        assert_eq!(bob.recv_n(), 3);
    }

    #[test]
    fn test_destroy_wipes_state() {
        let (mut alice, _) = pair();
        alice.destroy();
        assert!(alice.next_send_key().is_err());
    }
}
