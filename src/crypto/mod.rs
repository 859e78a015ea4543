//! Cryptographic primitives: hashing, integrity manifests, hybrid KEM,
//! signatures, prekeys, the AEAD sentinel, and short authentication
//! strings.

pub mod aead;
pub mod hash;
pub mod kem;
pub mod merkle;
pub mod prekey;
pub mod sas;
pub mod sign;

pub use aead::{CipherSuite, Direction, EncryptedChunk, Sentinel};
pub use hash::KdfContext;
pub use kem::{decapsulate, encapsulate, HybridCiphertext, HybridKeyPair, HybridPublicKey};
pub use merkle::{build_manifest, verify_file, IntegrityManifest, MerkleTree};
pub use prekey::{establish_as_initiator, PrekeyBundle, PrekeyStore};
pub use sas::{detect_identity_key_change, identity_fingerprint, IdentityKeyChange, Sas};
pub use sign::{SignatureAlgorithm, SignatureKeyPair};
