//! Digital signatures over a closed algorithm set.
//!
//! Four algorithms behind one tagged-variant API, matched exhaustively:
//!
//! - `Ed25519` — the classical baseline (32-byte keys, 64-byte signatures).
//! - `MlDsa65` — ML-DSA-65, NIST FIPS 204 (lattice).
//! - `SlhDsa` — SLH-DSA-SHA2-192s, NIST FIPS 205 (stateless hash-based),
//!   the high-assurance backup at the same security category as ML-DSA-65.
//! - `Hybrid` — Ed25519 signature concatenated with ML-DSA-65; both halves
//!   must verify.
//!
//! There is no open extension point: a new algorithm is a protocol change.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pqcrypto_mldsa::mldsa65;
use pqcrypto_sphincsplus::sphincssha2192ssimple as slhdsa;
use pqcrypto_traits::sign::{
    DetachedSignature as _, PublicKey as _, SecretKey as _,
};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::memory::{MemoryError, SecureBytes};

/// Ed25519 sizes.
pub const ED25519_PUBLIC_KEY_BYTES: usize = 32;
pub const ED25519_SECRET_KEY_BYTES: usize = 32;
pub const ED25519_SIGNATURE_BYTES: usize = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignError {
    #[error("Invalid key length for algorithm")]
    InvalidKeyLength,
    #[error("Malformed signature")]
    MalformedSignature,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type Result<T> = std::result::Result<T, SignError>;

/// The closed set of supported signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Ed25519,
    MlDsa65,
    SlhDsa,
    /// Ed25519 || ML-DSA-65; secure if either component is secure.
    Hybrid,
}

impl SignatureAlgorithm {
    pub fn public_key_bytes(self) -> usize {
        match self {
            SignatureAlgorithm::Ed25519 => ED25519_PUBLIC_KEY_BYTES,
            SignatureAlgorithm::MlDsa65 => mldsa65::public_key_bytes(),
            SignatureAlgorithm::SlhDsa => slhdsa::public_key_bytes(),
            SignatureAlgorithm::Hybrid => {
                ED25519_PUBLIC_KEY_BYTES + mldsa65::public_key_bytes()
            }
        }
    }

    pub fn secret_key_bytes(self) -> usize {
        match self {
            SignatureAlgorithm::Ed25519 => ED25519_SECRET_KEY_BYTES,
            SignatureAlgorithm::MlDsa65 => mldsa65::secret_key_bytes(),
            SignatureAlgorithm::SlhDsa => slhdsa::secret_key_bytes(),
            SignatureAlgorithm::Hybrid => {
                ED25519_SECRET_KEY_BYTES + mldsa65::secret_key_bytes()
            }
        }
    }

    pub fn signature_bytes(self) -> usize {
        match self {
            SignatureAlgorithm::Ed25519 => ED25519_SIGNATURE_BYTES,
            SignatureAlgorithm::MlDsa65 => mldsa65::signature_bytes(),
            SignatureAlgorithm::SlhDsa => slhdsa::signature_bytes(),
            SignatureAlgorithm::Hybrid => {
                ED25519_SIGNATURE_BYTES + mldsa65::signature_bytes()
            }
        }
    }
}

/// A signing keypair. The secret key lives in [`SecureBytes`].
pub struct SignatureKeyPair {
    pub algorithm: SignatureAlgorithm,
    pub public_key: Vec<u8>,
    secret_key: SecureBytes,
}

impl SignatureKeyPair {
    pub fn secret_key(&self) -> &SecureBytes {
        &self.secret_key
    }

    /// Rebuild a keypair from stored parts. The secret vector is taken
    /// into secure memory and wiped.
    pub(crate) fn from_parts(
        algorithm: SignatureAlgorithm,
        public_key: Vec<u8>,
        mut secret_bytes: Vec<u8>,
    ) -> Result<Self> {
        if public_key.len() != algorithm.public_key_bytes()
            || secret_bytes.len() != algorithm.secret_key_bytes()
        {
            return Err(SignError::InvalidKeyLength);
        }
        let secret_key = SecureBytes::take(&mut secret_bytes, "signature-secret-key")?;
        Ok(Self {
            algorithm,
            public_key,
            secret_key,
        })
    }
}

impl std::fmt::Debug for SignatureKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureKeyPair")
            .field("algorithm", &self.algorithm)
            .field("public_key", &hex::encode(&self.public_key[..8.min(self.public_key.len())]))
            .finish_non_exhaustive()
    }
}

/// Generate a keypair for the given algorithm.
pub fn generate_keypair(algorithm: SignatureAlgorithm) -> Result<SignatureKeyPair> {
    let (public_key, mut secret_bytes) = match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let signing_key = SigningKey::generate(&mut OsRng);
            (
                signing_key.verifying_key().to_bytes().to_vec(),
                signing_key.to_bytes().to_vec(),
            )
        }
        SignatureAlgorithm::MlDsa65 => {
            let (pk, sk) = mldsa65::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
        SignatureAlgorithm::SlhDsa => {
            let (pk, sk) = slhdsa::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
        SignatureAlgorithm::Hybrid => {
            let signing_key = SigningKey::generate(&mut OsRng);
            let (pq_pk, pq_sk) = mldsa65::keypair();
            let mut public = signing_key.verifying_key().to_bytes().to_vec();
            public.extend_from_slice(pq_pk.as_bytes());
            let mut secret = signing_key.to_bytes().to_vec();
            secret.extend_from_slice(pq_sk.as_bytes());
            (public, secret)
        }
    };
    let secret_key = SecureBytes::take(&mut secret_bytes, "signature-secret-key")?;
    Ok(SignatureKeyPair {
        algorithm,
        public_key,
        secret_key,
    })
}

/// Sign a message.
pub fn sign(
    algorithm: SignatureAlgorithm,
    secret_key: &SecureBytes,
    message: &[u8],
) -> Result<Vec<u8>> {
    let secret = secret_key.data()?;
    if secret.len() != algorithm.secret_key_bytes() {
        return Err(SignError::InvalidKeyLength);
    }
    match algorithm {
        SignatureAlgorithm::Ed25519 => Ok(ed25519_sign(&secret, message)?.to_vec()),
        SignatureAlgorithm::MlDsa65 => {
            let sk = mldsa65::SecretKey::from_bytes(&secret)
                .map_err(|_| SignError::InvalidKeyLength)?;
            Ok(mldsa65::detached_sign(message, &sk).as_bytes().to_vec())
        }
        SignatureAlgorithm::SlhDsa => {
            let sk = slhdsa::SecretKey::from_bytes(&secret)
                .map_err(|_| SignError::InvalidKeyLength)?;
            Ok(slhdsa::detached_sign(message, &sk).as_bytes().to_vec())
        }
        SignatureAlgorithm::Hybrid => {
            let (ed_secret, pq_secret) = secret.split_at(ED25519_SECRET_KEY_BYTES);
            let mut out = ed25519_sign(ed_secret, message)?.to_vec();
            let sk = mldsa65::SecretKey::from_bytes(pq_secret)
                .map_err(|_| SignError::InvalidKeyLength)?;
            out.extend_from_slice(mldsa65::detached_sign(message, &sk).as_bytes());
            Ok(out)
        }
    }
}

/// Verify a signature. Returns `Ok(false)` for a well-formed signature that
/// does not verify; malformed inputs are errors.
pub fn verify(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<bool> {
    if public_key.len() != algorithm.public_key_bytes() {
        return Err(SignError::InvalidKeyLength);
    }
    if signature.len() != algorithm.signature_bytes() {
        return Err(SignError::MalformedSignature);
    }
    match algorithm {
        SignatureAlgorithm::Ed25519 => ed25519_verify(public_key, message, signature),
        SignatureAlgorithm::MlDsa65 => {
            let pk = mldsa65::PublicKey::from_bytes(public_key)
                .map_err(|_| SignError::InvalidKeyLength)?;
            let sig = mldsa65::DetachedSignature::from_bytes(signature)
                .map_err(|_| SignError::MalformedSignature)?;
            Ok(mldsa65::verify_detached_signature(&sig, message, &pk).is_ok())
        }
        SignatureAlgorithm::SlhDsa => {
            let pk = slhdsa::PublicKey::from_bytes(public_key)
                .map_err(|_| SignError::InvalidKeyLength)?;
            let sig = slhdsa::DetachedSignature::from_bytes(signature)
                .map_err(|_| SignError::MalformedSignature)?;
            Ok(slhdsa::verify_detached_signature(&sig, message, &pk).is_ok())
        }
        SignatureAlgorithm::Hybrid => {
            let (ed_public, pq_public) = public_key.split_at(ED25519_PUBLIC_KEY_BYTES);
            let (ed_sig, pq_sig) = signature.split_at(ED25519_SIGNATURE_BYTES);
            // Evaluate both halves before combining so the failure branch
            // does not reveal which component rejected.
            let ed_ok = ed25519_verify(ed_public, message, ed_sig)?;
            let pk = mldsa65::PublicKey::from_bytes(pq_public)
                .map_err(|_| SignError::InvalidKeyLength)?;
            let sig = mldsa65::DetachedSignature::from_bytes(pq_sig)
                .map_err(|_| SignError::MalformedSignature)?;
            let pq_ok = mldsa65::verify_detached_signature(&sig, message, &pk).is_ok();
            Ok(ed_ok & pq_ok)
        }
    }
}

fn ed25519_sign(secret: &[u8], message: &[u8]) -> Result<[u8; ED25519_SIGNATURE_BYTES]> {
    let key_bytes: [u8; 32] = secret
        .try_into()
        .map_err(|_| SignError::InvalidKeyLength)?;
    let signing_key = SigningKey::from_bytes(&key_bytes);
    Ok(signing_key.sign(message).to_bytes())
}

fn ed25519_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let pk_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| SignError::InvalidKeyLength)?;
    let verifying_key =
        VerifyingKey::from_bytes(&pk_bytes).map_err(|_| SignError::InvalidKeyLength)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignError::MalformedSignature)?;
    let sig = Signature::from_bytes(&sig_bytes);
    Ok(verifying_key.verify(message, &sig).is_ok())
}
