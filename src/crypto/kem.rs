//! Hybrid key encapsulation: X25519 + ML-KEM-768 (NIST FIPS 203).
//!
//! Classical ECDH and a post-quantum KEM are combined so the shared secret
//! stays confidential if either primitive remains unbroken. The two raw
//! secrets are bound together with the BLAKE3 derive-key registry under the
//! `hybrid-kex` context; the combined output alone does not reveal whether
//! the ML-KEM half succeeded (implicit rejection yields a
//! random-but-deterministic secret for an invalid ciphertext).
//!
//! Key sizes (ML-KEM-768):
//! - Encapsulation key (public):  1184 bytes
//! - Decapsulation key (secret):  2400 bytes
//! - Ciphertext:                  1088 bytes
//! - Shared secret:               32 bytes
//! - X25519 public / secret:      32 bytes each

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Encoded, EncodedSizeUser, KemCore, MlKem768, MlKem768Params};
use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::crypto::hash::{derive_key, KdfContext};
use crate::memory::{MemoryError, SecureBytes};

/// ML-KEM-768 encapsulation key (public) size in bytes.
pub const MLKEM768_EK_BYTES: usize = 1184;
/// ML-KEM-768 ciphertext size in bytes.
pub const MLKEM768_CT_BYTES: usize = 1088;
/// ML-KEM-768 decapsulation key (secret) size in bytes.
pub const MLKEM768_DK_BYTES: usize = 2400;
/// X25519 key size in bytes (public and secret).
pub const X25519_KEY_BYTES: usize = 32;
/// Serialized hybrid public key size (ML-KEM public || X25519 public).
pub const HYBRID_PUBLIC_KEY_BYTES: usize = MLKEM768_EK_BYTES + X25519_KEY_BYTES;
/// Serialized hybrid ciphertext size (ML-KEM ciphertext || X25519 ephemeral).
pub const HYBRID_CIPHERTEXT_BYTES: usize = MLKEM768_CT_BYTES + X25519_KEY_BYTES;
/// Combined shared secret size.
pub const SHARED_SECRET_BYTES: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KemError {
    #[error("Hybrid KEM key generation failed")]
    KeyGenFailed,
    #[error("Hybrid KEM encapsulation failed")]
    EncapsulationFailed,
    #[error("Hybrid KEM decapsulation failed")]
    DecapsulationFailed,
    #[error("Invalid key or ciphertext length")]
    InvalidKeyLength,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type Result<T> = std::result::Result<T, KemError>;

/// Public half of a hybrid keypair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridPublicKey {
    /// ML-KEM-768 encapsulation key (1184 bytes).
    pub mlkem: Vec<u8>,
    /// X25519 public key.
    pub x25519: [u8; 32],
}

impl HybridPublicKey {
    /// Serialize as ML-KEM public || X25519 public. This byte string is what
    /// prekey signatures cover.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HYBRID_PUBLIC_KEY_BYTES);
        out.extend_from_slice(&self.mlkem);
        out.extend_from_slice(&self.x25519);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HYBRID_PUBLIC_KEY_BYTES {
            return Err(KemError::InvalidKeyLength);
        }
        let mut x25519 = [0u8; 32];
        x25519.copy_from_slice(&bytes[MLKEM768_EK_BYTES..]);
        Ok(Self {
            mlkem: bytes[..MLKEM768_EK_BYTES].to_vec(),
            x25519,
        })
    }
}

/// Hybrid keypair. Secret halves live in [`SecureBytes`] and are wiped on
/// drop; the keypair is not `Clone`.
pub struct HybridKeyPair {
    public: HybridPublicKey,
    mlkem_secret: SecureBytes,
    x25519_secret: SecureBytes,
}

impl std::fmt::Debug for HybridKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridKeyPair")
            .field("x25519_public", &hex::encode(self.public.x25519))
            .finish_non_exhaustive()
    }
}

impl HybridKeyPair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Result<Self> {
        let x25519_secret = StaticSecret::random_from_rng(OsRng);
        let x25519_public = PublicKey::from(&x25519_secret);
        let (dk, ek) = MlKem768::generate(&mut OsRng);
        Self::assemble(x25519_secret, x25519_public, dk, ek)
    }

    /// Derive a keypair deterministically from a 32-byte seed (device
    /// re-derivation and test vectors).
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        let mut rng = ChaCha20Rng::from_seed(*seed);
        let mut x25519_seed = [0u8; 32];
        rng.fill_bytes(&mut x25519_seed);
        let x25519_secret = StaticSecret::from(x25519_seed);
        x25519_seed.zeroize();
        let x25519_public = PublicKey::from(&x25519_secret);
        let (dk, ek) = MlKem768::generate(&mut rng);
        Self::assemble(x25519_secret, x25519_public, dk, ek)
    }

    fn assemble(
        x25519_secret: StaticSecret,
        x25519_public: PublicKey,
        dk: ml_kem::kem::DecapsulationKey<MlKem768Params>,
        ek: ml_kem::kem::EncapsulationKey<MlKem768Params>,
    ) -> Result<Self> {
        let mut dk_bytes = dk.as_bytes().to_vec();
        let mlkem_secret = SecureBytes::take(&mut dk_bytes, "mlkem768-secret")?;
        let x25519_secret =
            SecureBytes::from_copy(x25519_secret.as_bytes(), "x25519-secret")?;
        Ok(Self {
            public: HybridPublicKey {
                mlkem: ek.as_bytes().to_vec(),
                x25519: x25519_public.to_bytes(),
            },
            mlkem_secret,
            x25519_secret,
        })
    }

    pub fn public(&self) -> &HybridPublicKey {
        &self.public
    }

    /// Wipe both secret halves. The keypair is unusable afterwards.
    pub fn zeroize_secrets(&mut self) {
        self.mlkem_secret.zero();
        self.x25519_secret.zero();
    }

    /// Concatenated secret halves (ML-KEM DK || X25519 SK) for sealed
    /// persistence. The caller owns wiping the returned buffer.
    pub(crate) fn secret_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(MLKEM768_DK_BYTES + X25519_KEY_BYTES);
        out.extend_from_slice(&self.mlkem_secret.data()?);
        out.extend_from_slice(&self.x25519_secret.data()?);
        Ok(out)
    }

    /// Rebuild a keypair from its public half and [`Self::secret_bytes`]
    /// output.
    pub(crate) fn from_secret_bytes(public: HybridPublicKey, secrets: &[u8]) -> Result<Self> {
        if public.mlkem.len() != MLKEM768_EK_BYTES
            || secrets.len() != MLKEM768_DK_BYTES + X25519_KEY_BYTES
        {
            return Err(KemError::InvalidKeyLength);
        }
        Ok(Self {
            public,
            mlkem_secret: SecureBytes::from_copy(&secrets[..MLKEM768_DK_BYTES], "mlkem768-secret")?,
            x25519_secret: SecureBytes::from_copy(&secrets[MLKEM768_DK_BYTES..], "x25519-secret")?,
        })
    }
}

/// Hybrid ciphertext produced by [`encapsulate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridCiphertext {
    /// ML-KEM-768 ciphertext (1088 bytes).
    pub mlkem_ciphertext: Vec<u8>,
    /// X25519 ephemeral public key.
    pub x25519_ephemeral: [u8; 32],
}

impl HybridCiphertext {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HYBRID_CIPHERTEXT_BYTES);
        out.extend_from_slice(&self.mlkem_ciphertext);
        out.extend_from_slice(&self.x25519_ephemeral);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HYBRID_CIPHERTEXT_BYTES {
            return Err(KemError::InvalidKeyLength);
        }
        let mut x25519_ephemeral = [0u8; 32];
        x25519_ephemeral.copy_from_slice(&bytes[MLKEM768_CT_BYTES..]);
        Ok(Self {
            mlkem_ciphertext: bytes[..MLKEM768_CT_BYTES].to_vec(),
            x25519_ephemeral,
        })
    }
}

/// Encapsulate against a peer's hybrid public key.
///
/// Returns the hybrid ciphertext to transmit and the 32-byte combined
/// shared secret.
pub fn encapsulate(peer: &HybridPublicKey) -> Result<(HybridCiphertext, SecureBytes)> {
    if peer.mlkem.len() != MLKEM768_EK_BYTES {
        return Err(KemError::InvalidKeyLength);
    }

    // X25519 half: ephemeral ECDH against the peer's static key.
    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let x25519_shared = ephemeral_secret.diffie_hellman(&PublicKey::from(peer.x25519));

    // ML-KEM half: reconstruct the encapsulation key from raw bytes.
    let ek_encoded = Encoded::<ml_kem::kem::EncapsulationKey<MlKem768Params>>::try_from(
        peer.mlkem.as_slice(),
    )
    .map_err(|_| KemError::InvalidKeyLength)?;
    let ek = ml_kem::kem::EncapsulationKey::<MlKem768Params>::from_bytes(&ek_encoded);
    let (ct, mlkem_shared) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| KemError::EncapsulationFailed)?;

    let shared = combine(x25519_shared.as_bytes(), mlkem_shared.as_ref())?;
    let ct_bytes: Vec<u8> = ct.iter().copied().collect();

    Ok((
        HybridCiphertext {
            mlkem_ciphertext: ct_bytes,
            x25519_ephemeral: ephemeral_public.to_bytes(),
        },
        shared,
    ))
}

/// Decapsulate a hybrid ciphertext with our keypair. Returns the same
/// 32-byte combined secret the sender derived.
pub fn decapsulate(ciphertext: &HybridCiphertext, keypair: &HybridKeyPair) -> Result<SecureBytes> {
    if ciphertext.mlkem_ciphertext.len() != MLKEM768_CT_BYTES {
        return Err(KemError::InvalidKeyLength);
    }

    // X25519 half.
    let x25519_secret: [u8; 32] = keypair.x25519_secret.to_array()?;
    let our_secret = StaticSecret::from(x25519_secret);
    let x25519_shared =
        our_secret.diffie_hellman(&PublicKey::from(ciphertext.x25519_ephemeral));

    // ML-KEM half: reconstruct the decapsulation key from raw bytes.
    let dk_guard = keypair.mlkem_secret.data()?;
    let dk_encoded =
        Encoded::<ml_kem::kem::DecapsulationKey<MlKem768Params>>::try_from(&*dk_guard)
            .map_err(|_| KemError::InvalidKeyLength)?;
    drop(dk_guard);
    let dk = ml_kem::kem::DecapsulationKey::<MlKem768Params>::from_bytes(&dk_encoded);

    let ct = ml_kem::Ciphertext::<MlKem768>::try_from(ciphertext.mlkem_ciphertext.as_slice())
        .map_err(|_| KemError::InvalidKeyLength)?;
    let mlkem_shared = dk
        .decapsulate(&ct)
        .map_err(|_| KemError::DecapsulationFailed)?;

    combine(x25519_shared.as_bytes(), mlkem_shared.as_ref())
}

/// Bind the classical and post-quantum secrets into one 32-byte secret.
fn combine(x25519_shared: &[u8; 32], mlkem_shared: &[u8]) -> Result<SecureBytes> {
    let mut ikm = Vec::with_capacity(x25519_shared.len() + mlkem_shared.len());
    ikm.extend_from_slice(x25519_shared);
    ikm.extend_from_slice(mlkem_shared);
    let mut combined = derive_key(KdfContext::HybridKex, &ikm).to_vec();
    ikm.zeroize();
    Ok(SecureBytes::take(&mut combined, "hybrid-shared-secret")?)
}
