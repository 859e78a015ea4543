//! Signed prekey bundles for asynchronous session initiation.
//!
//! Each party publishes a bundle: an Ed25519 identity key, a current signed
//! prekey (a hybrid KEM keypair whose serialized public half is signed by
//! the identity key), and optionally a one-time prekey drawn from a bounded
//! pool. An initiator verifies the signature, encapsulates against the
//! signed prekey (and the one-time prekey when present), and hashes the
//! encapsulation secrets into the initial session secret. The responder
//! decapsulates with the matching private keys, consuming the one-time
//! prekey at most once.
//!
//! The previous signed prekey is retained for one rotation period so
//! messages initiated against the old bundle still establish.

use std::collections::HashSet;

use chrono::Utc;
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::hash::{Hasher, KdfContext};
use crate::crypto::kem::{self, HybridCiphertext, HybridKeyPair, HybridPublicKey, KemError};
use crate::crypto::sign::{self, SignatureAlgorithm, SignatureKeyPair, SignError};
use crate::memory::{MemoryError, SecureBytes};

/// Signed prekeys rotate every 7 days.
pub const SIGNED_PREKEY_LIFETIME_SECS: i64 = 7 * 24 * 60 * 60;
/// Replenish the one-time pool when it drops below this.
pub const ONE_TIME_PREKEY_MIN_POOL: usize = 20;
/// Hard cap on the one-time pool.
pub const ONE_TIME_PREKEY_MAX_POOL: usize = 100;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PrekeyError {
    #[error("Prekey bundle signature did not verify")]
    InvalidPrekeyBundle,
    #[error("No prekey with id {0}")]
    PrekeyNotFound(u32),
    #[error("Identity key must be Ed25519")]
    WrongIdentityAlgorithm,
    #[error("Malformed prekey store state")]
    MalformedState,
    #[error(transparent)]
    Kem(#[from] KemError),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type Result<T> = std::result::Result<T, PrekeyError>;

/// A signed prekey: hybrid keypair + identity signature over its public half.
#[derive(Debug)]
pub struct SignedPrekey {
    pub id: u32,
    pub created_at: i64,
    pub signature: Vec<u8>,
    keypair: HybridKeyPair,
}

impl SignedPrekey {
    pub fn public(&self) -> &HybridPublicKey {
        self.keypair.public()
    }
}

/// A one-time prekey. Consumed at most once.
#[derive(Debug)]
pub struct OneTimePrekey {
    pub id: u32,
    keypair: HybridKeyPair,
}

/// The publishable half of a prekey store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrekeyBundle {
    pub identity_public: [u8; 32],
    pub signed_prekey_id: u32,
    pub signed_prekey_created_at: i64,
    pub signed_prekey_public: HybridPublicKey,
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey: Option<(u32, HybridPublicKey)>,
}

/// What the initiator sends alongside the first message so the responder
/// can reconstruct the initial secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatorHandshake {
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub signed_prekey_ciphertext: HybridCiphertext,
    pub one_time_prekey_ciphertext: Option<HybridCiphertext>,
}

/// Result of initiating: the initial session secret plus the handshake to
/// transmit.
#[derive(Debug)]
pub struct InitiationResult {
    pub initial_secret: SecureBytes,
    pub handshake: InitiatorHandshake,
}

/// Owns the identity keypair, signed prekeys, and the one-time pool.
#[derive(Debug)]
pub struct PrekeyStore {
    identity: SignatureKeyPair,
    current: SignedPrekey,
    previous: Option<SignedPrekey>,
    one_time: Vec<OneTimePrekey>,
    /// One-time prekey ids already handed out in a bundle.
    offered: HashSet<u32>,
    next_key_id: u32,
}

impl PrekeyStore {
    /// Populate a store around an Ed25519 identity keypair: one signed
    /// prekey and a full one-time pool.
    pub fn initialize(identity: SignatureKeyPair) -> Result<Self> {
        if identity.algorithm != SignatureAlgorithm::Ed25519 {
            return Err(PrekeyError::WrongIdentityAlgorithm);
        }
        let current = make_signed_prekey(&identity, 1, Utc::now().timestamp())?;
        let mut store = Self {
            identity,
            current,
            previous: None,
            one_time: Vec::new(),
            offered: HashSet::new(),
            next_key_id: 2,
        };
        store.replenish_one_time_prekeys_if_needed()?;
        Ok(store)
    }

    pub fn identity_public(&self) -> &[u8] {
        &self.identity.public_key
    }

    pub fn identity(&self) -> &SignatureKeyPair {
        &self.identity
    }

    pub fn one_time_pool_size(&self) -> usize {
        self.one_time.len()
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_key_id;
        self.next_key_id += 1;
        id
    }

    /// The bundle to publish: identity key, current signed prekey, and the
    /// oldest not-yet-offered one-time prekey. An empty pool is logged and
    /// non-fatal — the bundle simply carries no one-time prekey, weakening
    /// forward secrecy for the first message only.
    pub fn publish_bundle(&mut self) -> Result<PrekeyBundle> {
        let one_time = self
            .one_time
            .iter()
            .find(|otp| !self.offered.contains(&otp.id))
            .map(|otp| (otp.id, otp.keypair.public().clone()));
        match &one_time {
            Some((id, _)) => {
                self.offered.insert(*id);
            }
            None => {
                log::warn!("prekey bundle published without a one-time prekey");
            }
        }

        let identity_public: [u8; 32] = self
            .identity
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| PrekeyError::WrongIdentityAlgorithm)?;

        Ok(PrekeyBundle {
            identity_public,
            signed_prekey_id: self.current.id,
            signed_prekey_created_at: self.current.created_at,
            signed_prekey_public: self.current.public().clone(),
            signed_prekey_signature: self.current.signature.clone(),
            one_time_prekey: one_time,
        })
    }

    /// Rotate the signed prekey when it has exceeded its lifetime. The
    /// outgoing prekey is retained one rotation period for in-flight
    /// initiations. Returns whether a rotation happened.
    pub fn rotate_signed_prekey_if_needed(&mut self) -> Result<bool> {
        self.rotate_signed_prekey_at(Utc::now().timestamp())
    }

    fn rotate_signed_prekey_at(&mut self, now: i64) -> Result<bool> {
        if now - self.current.created_at < SIGNED_PREKEY_LIFETIME_SECS {
            return Ok(false);
        }
        let id = self.next_id();
        let fresh = make_signed_prekey(&self.identity, id, now)?;
        let retired = std::mem::replace(&mut self.current, fresh);
        if let Some(mut old) = self.previous.take() {
            old.keypair.zeroize_secrets();
        }
        log::debug!(
            "rotated signed prekey {} -> {}",
            retired.id,
            self.current.id
        );
        self.previous = Some(retired);
        Ok(true)
    }

    /// Top the one-time pool up to the cap once it falls below the
    /// replenish threshold. Returns how many prekeys were generated.
    pub fn replenish_one_time_prekeys_if_needed(&mut self) -> Result<usize> {
        if self.one_time.len() >= ONE_TIME_PREKEY_MIN_POOL {
            return Ok(0);
        }
        let missing = ONE_TIME_PREKEY_MAX_POOL - self.one_time.len();
        for _ in 0..missing {
            let id = self.next_id();
            self.one_time.push(OneTimePrekey {
                id,
                keypair: HybridKeyPair::generate()?,
            });
        }
        log::debug!("replenished {} one-time prekeys", missing);
        Ok(missing)
    }

    /// Responder side: reconstruct the initial secret from a handshake,
    /// consuming the one-time prekey.
    pub fn establish_as_responder(
        &mut self,
        handshake: &InitiatorHandshake,
    ) -> Result<SecureBytes> {
        let spk = if self.current.id == handshake.signed_prekey_id {
            &self.current
        } else {
            self.previous
                .as_ref()
                .filter(|prev| prev.id == handshake.signed_prekey_id)
                .ok_or(PrekeyError::PrekeyNotFound(handshake.signed_prekey_id))?
        };
        let spk_secret = kem::decapsulate(&handshake.signed_prekey_ciphertext, &spk.keypair)?;

        let otp_secret = match (handshake.one_time_prekey_id, &handshake.one_time_prekey_ciphertext)
        {
            (Some(id), Some(ct)) => {
                let pos = self
                    .one_time
                    .iter()
                    .position(|otp| otp.id == id)
                    .ok_or(PrekeyError::PrekeyNotFound(id))?;
                // Consume: the same one-time prekey never serves twice.
                let mut otp = self.one_time.remove(pos);
                self.offered.remove(&id);
                let secret = kem::decapsulate(ct, &otp.keypair);
                otp.keypair.zeroize_secrets();
                Some(secret?)
            }
            _ => {
                log::warn!(
                    "handshake for signed prekey {} carried no one-time prekey",
                    handshake.signed_prekey_id
                );
                None
            }
        };

        Ok(combine_establishment_secrets(&spk_secret, otp_secret.as_ref())?)
    }
}

// ── Secret-state persistence ────────────────────────────────────────────────
//
// The store's private keys survive restarts as a single framed blob that
// the orchestrator seals under the storage key before it touches disk.
// Which one-time prekeys were merely *offered* (handed out in a bundle but
// never consumed) is not persisted; after import they may be offered again,
// which is harmless — consumption is what must happen at most once.

const STATE_VERSION: u8 = 1;
const KEYPAIR_SECRET_BYTES: usize =
    crate::crypto::kem::MLKEM768_DK_BYTES + crate::crypto::kem::X25519_KEY_BYTES;

impl PrekeyStore {
    /// Serialize the full secret state into secure memory. Seal the result
    /// before persisting it.
    pub fn export_secret_state(&self) -> Result<SecureBytes> {
        let mut blob = Vec::new();
        blob.push(STATE_VERSION);
        blob.extend_from_slice(&self.identity.secret_key().data()?);
        blob.extend_from_slice(&self.identity.public_key);
        blob.extend_from_slice(&self.next_key_id.to_be_bytes());

        write_signed_prekey(&mut blob, &self.current)?;
        match &self.previous {
            Some(previous) => {
                blob.push(1);
                write_signed_prekey(&mut blob, previous)?;
            }
            None => blob.push(0),
        }

        blob.extend_from_slice(&(self.one_time.len() as u32).to_be_bytes());
        for otp in &self.one_time {
            blob.extend_from_slice(&otp.id.to_be_bytes());
            write_keypair(&mut blob, &otp.keypair)?;
        }

        Ok(SecureBytes::take(&mut blob, "prekey-store-state")?)
    }

    /// Rebuild a store from [`Self::export_secret_state`] output.
    pub fn import_secret_state(state: &SecureBytes) -> Result<Self> {
        let data = state.data()?;
        let mut cursor = StateCursor::new(&data);

        if cursor.u8()? != STATE_VERSION {
            return Err(PrekeyError::MalformedState);
        }
        let identity_secret = cursor.take(32)?.to_vec();
        let identity_public = cursor.take(32)?.to_vec();
        let identity = SignatureKeyPair::from_parts(
            SignatureAlgorithm::Ed25519,
            identity_public,
            identity_secret,
        )?;
        let next_key_id = cursor.u32()?;

        let current = read_signed_prekey(&mut cursor)?;
        let previous = match cursor.u8()? {
            0 => None,
            1 => Some(read_signed_prekey(&mut cursor)?),
            _ => return Err(PrekeyError::MalformedState),
        };

        let count = cursor.u32()? as usize;
        if count > ONE_TIME_PREKEY_MAX_POOL {
            return Err(PrekeyError::MalformedState);
        }
        let mut one_time = Vec::with_capacity(count);
        for _ in 0..count {
            let id = cursor.u32()?;
            let keypair = read_keypair(&mut cursor)?;
            one_time.push(OneTimePrekey { id, keypair });
        }
        if !cursor.finished() {
            return Err(PrekeyError::MalformedState);
        }

        Ok(Self {
            identity,
            current,
            previous,
            one_time,
            offered: HashSet::new(),
            next_key_id,
        })
    }
}

fn write_keypair(blob: &mut Vec<u8>, keypair: &HybridKeyPair) -> Result<()> {
    blob.extend_from_slice(&keypair.public().to_bytes());
    let mut secrets = keypair.secret_bytes()?;
    blob.extend_from_slice(&secrets);
    secrets.zeroize();
    Ok(())
}

fn read_keypair(cursor: &mut StateCursor<'_>) -> Result<HybridKeyPair> {
    let public = HybridPublicKey::from_bytes(
        cursor.take(crate::crypto::kem::HYBRID_PUBLIC_KEY_BYTES)?,
    )?;
    let secrets = cursor.take(KEYPAIR_SECRET_BYTES)?;
    Ok(HybridKeyPair::from_secret_bytes(public, secrets)?)
}

fn write_signed_prekey(blob: &mut Vec<u8>, prekey: &SignedPrekey) -> Result<()> {
    blob.extend_from_slice(&prekey.id.to_be_bytes());
    blob.extend_from_slice(&prekey.created_at.to_be_bytes());
    blob.extend_from_slice(&prekey.signature);
    write_keypair(blob, &prekey.keypair)
}

fn read_signed_prekey(cursor: &mut StateCursor<'_>) -> Result<SignedPrekey> {
    let id = cursor.u32()?;
    let created_at = i64::from_be_bytes(
        cursor
            .take(8)?
            .try_into()
            .map_err(|_| PrekeyError::MalformedState)?,
    );
    let signature = cursor.take(64)?.to_vec();
    let keypair = read_keypair(cursor)?;
    Ok(SignedPrekey {
        id,
        created_at,
        signature,
        keypair,
    })
}

struct StateCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> StateCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(PrekeyError::MalformedState)?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(
            self.take(4)?
                .try_into()
                .map_err(|_| PrekeyError::MalformedState)?,
        ))
    }

    fn finished(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

fn make_signed_prekey(
    identity: &SignatureKeyPair,
    id: u32,
    now: i64,
) -> Result<SignedPrekey> {
    let keypair = HybridKeyPair::generate()?;
    let signature = sign::sign(
        SignatureAlgorithm::Ed25519,
        identity.secret_key(),
        &keypair.public().to_bytes(),
    )?;
    Ok(SignedPrekey {
        id,
        created_at: now,
        signature,
        keypair,
    })
}

/// Initiator side: verify the bundle and derive the initial session secret.
///
/// The signed-prekey signature is checked against the peer's identity key
/// before any encapsulation happens.
pub fn establish_as_initiator(bundle: &PrekeyBundle) -> Result<InitiationResult> {
    let verified = sign::verify(
        SignatureAlgorithm::Ed25519,
        &bundle.identity_public,
        &bundle.signed_prekey_public.to_bytes(),
        &bundle.signed_prekey_signature,
    )?;
    if !verified {
        return Err(PrekeyError::InvalidPrekeyBundle);
    }

    let (spk_ct, spk_secret) = kem::encapsulate(&bundle.signed_prekey_public)?;

    let mut otp_id = None;
    let mut otp_ct = None;
    let mut otp_secret = None;
    if let Some((id, public)) = &bundle.one_time_prekey {
        let (ct, secret) = kem::encapsulate(public)?;
        otp_id = Some(*id);
        otp_ct = Some(ct);
        otp_secret = Some(secret);
    }

    let initial_secret = combine_establishment_secrets(&spk_secret, otp_secret.as_ref())?;

    Ok(InitiationResult {
        initial_secret,
        handshake: InitiatorHandshake {
            signed_prekey_id: bundle.signed_prekey_id,
            one_time_prekey_id: otp_id,
            signed_prekey_ciphertext: spk_ct,
            one_time_prekey_ciphertext: otp_ct,
        },
    })
}

/// Concatenate the encapsulation secrets and hash them, domain-separated,
/// into the 32-byte initial session secret.
fn combine_establishment_secrets(
    spk_secret: &SecureBytes,
    otp_secret: Option<&SecureBytes>,
) -> std::result::Result<SecureBytes, MemoryError> {
    let mut hasher = Hasher::new_derive_key(KdfContext::RootKey);
    hasher.update(&spk_secret.data()?);
    if let Some(otp) = otp_secret {
        hasher.update(&otp.data()?);
    }
    let mut secret = hasher.finalize().to_vec();
    SecureBytes::take(&mut secret, "initial-session-secret")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_store() -> PrekeyStore {
        let identity = sign::generate_keypair(SignatureAlgorithm::Ed25519).unwrap();
        PrekeyStore::initialize(identity).unwrap()
    }

    #[test]
    fn test_initialize_fills_pool() {
        let store = new_store();
        assert_eq!(store.one_time_pool_size(), ONE_TIME_PREKEY_MAX_POOL);
    }

    #[test]
    fn test_establishment_roundtrip_with_otp() {
        let mut bob = new_store();
        let bundle = bob.publish_bundle().unwrap();
        assert!(bundle.one_time_prekey.is_some());

        let result = establish_as_initiator(&bundle).unwrap();
        let bob_secret = bob.establish_as_responder(&result.handshake).unwrap();

        assert_eq!(
            &*result.initial_secret.data().unwrap(),
            &*bob_secret.data().unwrap()
        );
        // The one-time prekey was consumed.
        assert_eq!(bob.one_time_pool_size(), ONE_TIME_PREKEY_MAX_POOL - 1);
    }

    #[test]
    fn test_establishment_roundtrip_without_otp() {
        let mut bob = new_store();
        let mut bundle = bob.publish_bundle().unwrap();
        bundle.one_time_prekey = None;

        let result = establish_as_initiator(&bundle).unwrap();
        assert!(result.handshake.one_time_prekey_id.is_none());
        let bob_secret = bob.establish_as_responder(&result.handshake).unwrap();
        assert_eq!(
            &*result.initial_secret.data().unwrap(),
            &*bob_secret.data().unwrap()
        );
    }

    #[test]
    fn test_invalid_bundle_signature_rejected() {
        let mut bob = new_store();
        let mut bundle = bob.publish_bundle().unwrap();
        bundle.signed_prekey_signature[5] ^= 0x01;
        assert_eq!(
            establish_as_initiator(&bundle).unwrap_err(),
            PrekeyError::InvalidPrekeyBundle
        );
    }

    #[test]
    fn test_bundle_signed_by_wrong_identity_rejected() {
        let mut bob = new_store();
        let mallory = sign::generate_keypair(SignatureAlgorithm::Ed25519).unwrap();
        let mut bundle = bob.publish_bundle().unwrap();
        // Mallory substitutes her identity key without re-signing.
        bundle.identity_public = mallory.public_key.as_slice().try_into().unwrap();
        assert_eq!(
            establish_as_initiator(&bundle).unwrap_err(),
            PrekeyError::InvalidPrekeyBundle
        );
    }

    #[test]
    fn test_unknown_signed_prekey_id() {
        let mut bob = new_store();
        let bundle = bob.publish_bundle().unwrap();
        let mut result = establish_as_initiator(&bundle).unwrap();
        result.handshake.signed_prekey_id = 9999;
        assert_eq!(
            bob.establish_as_responder(&result.handshake).unwrap_err(),
            PrekeyError::PrekeyNotFound(9999)
        );
    }

    #[test]
    fn test_one_time_prekey_consumed_at_most_once() {
        let mut bob = new_store();
        let bundle = bob.publish_bundle().unwrap();
        let result = establish_as_initiator(&bundle).unwrap();
        let otp_id = result.handshake.one_time_prekey_id.unwrap();

        bob.establish_as_responder(&result.handshake).unwrap();
        // Replay with the same one-time prekey id must fail.
        assert_eq!(
            bob.establish_as_responder(&result.handshake).unwrap_err(),
            PrekeyError::PrekeyNotFound(otp_id)
        );
    }

    #[test]
    fn test_rotation_keeps_previous_prekey_usable() {
        let mut bob = new_store();
        let bundle = bob.publish_bundle().unwrap();
        let result = establish_as_initiator(&bundle).unwrap();

        // Force a rotation well past the prekey lifetime.
        let later = bundle.signed_prekey_created_at + SIGNED_PREKEY_LIFETIME_SECS + 1;
        assert!(bob.rotate_signed_prekey_at(later).unwrap());

        // An initiation against the old bundle still establishes.
        let secret = bob.establish_as_responder(&result.handshake).unwrap();
        assert_eq!(
            &*result.initial_secret.data().unwrap(),
            &*secret.data().unwrap()
        );
    }

    #[test]
    fn test_rotation_not_due() {
        let mut bob = new_store();
        assert!(!bob.rotate_signed_prekey_if_needed().unwrap());
    }

    #[test]
    fn test_replenish_tops_up_below_threshold() {
        let mut bob = new_store();
        // Drain the pool below the replenish threshold.
        while bob.one_time.len() >= ONE_TIME_PREKEY_MIN_POOL {
            let bundle = bob.publish_bundle().unwrap();
            let result = establish_as_initiator(&bundle).unwrap();
            bob.establish_as_responder(&result.handshake).unwrap();
        }
        let added = bob.replenish_one_time_prekeys_if_needed().unwrap();
        assert!(added > 0);
        assert_eq!(bob.one_time_pool_size(), ONE_TIME_PREKEY_MAX_POOL);
    }

    #[test]
    fn test_secret_state_roundtrip() {
        let mut bob = new_store();
        // Exercise rotation so `previous` is populated too.
        let later = bob.current.created_at + SIGNED_PREKEY_LIFETIME_SECS + 1;
        bob.rotate_signed_prekey_at(later).unwrap();

        let state = bob.export_secret_state().unwrap();
        let mut restored = PrekeyStore::import_secret_state(&state).unwrap();

        assert_eq!(restored.identity_public(), bob.identity_public());
        assert_eq!(restored.one_time_pool_size(), bob.one_time_pool_size());
        assert_eq!(restored.next_key_id, bob.next_key_id);
        assert!(restored.previous.is_some());

        // The restored store still serves a full handshake.
        let bundle = restored.publish_bundle().unwrap();
        let result = establish_as_initiator(&bundle).unwrap();
        let secret = restored.establish_as_responder(&result.handshake).unwrap();
        assert_eq!(
            &*result.initial_secret.data().unwrap(),
            &*secret.data().unwrap()
        );
    }

    #[test]
    fn test_import_rejects_truncated_state() {
        let bob = new_store();
        let state = bob.export_secret_state().unwrap();
        let truncated =
            SecureBytes::from_copy(&state.data().unwrap()[..100], "truncated").unwrap();
        assert_eq!(
            PrekeyStore::import_secret_state(&truncated).unwrap_err(),
            PrekeyError::MalformedState
        );
    }

    #[test]
    fn test_import_rejects_unknown_version() {
        let bob = new_store();
        let state = bob.export_secret_state().unwrap();
        let mut bytes = state.data().unwrap().to_vec();
        bytes[0] = 99;
        let tampered = SecureBytes::take(&mut bytes, "tampered").unwrap();
        assert_eq!(
            PrekeyStore::import_secret_state(&tampered).unwrap_err(),
            PrekeyError::MalformedState
        );
    }

    #[test]
    fn test_distinct_bundles_offer_distinct_otps() {
        let mut bob = new_store();
        let b1 = bob.publish_bundle().unwrap();
        let b2 = bob.publish_bundle().unwrap();
        assert_ne!(
            b1.one_time_prekey.unwrap().0,
            b2.one_time_prekey.unwrap().0
        );
    }
}
