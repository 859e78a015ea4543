//! # Tallow Protocol
//!
//! **The hybrid post-quantum end-to-end encryption core of the Tallow
//! peer-to-peer file-transfer system.**
//!
//! This crate is a standalone cryptographic library: it owns session
//! establishment, forward-secret messaging, authenticated chunk
//! encryption, and integrity verification between two peers over an
//! untrusted transport. The transport itself (WebRTC data channels,
//! signaling, room codes), the UI, and persistent storage are external
//! collaborators and never see key material.
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`memory`] | Secure buffers: zeroize-on-drop key material, emergency wipe registry |
//! | [`crypto`] | BLAKE3 facade, Merkle manifests, hybrid KEM, signatures, prekeys, AEAD sentinel, SAS |
//! | [`ratchet`] | Triple ratchet: Double Ratchet (X25519) over a sparse ML-KEM epoch ratchet |
//! | [`session`] | Orchestrator: session lifecycle, wire framing, file-transfer integrity flow |
//! | [`wire`] | Byte-exact wire formats for messages, prekey bundles, and manifests |
//!
//! ## Security model
//!
//! - **Hybrid everywhere.** Key agreement is X25519 + ML-KEM-768; message
//!   keys combine a Double Ratchet key with a PQ epoch key; signatures
//!   offer an Ed25519 + ML-DSA-65 hybrid mode. Breaking one primitive
//!   class is never enough.
//! - **Forward secrecy and post-compromise security** from the two
//!   ratchet layers, against classical and quantum adversary classes.
//! - **Tag-before-plaintext.** No AEAD plaintext is released before the
//!   authentication tag verifies; failures are a single opaque error.
//! - **Memory discipline.** Every secret lives in a
//!   [`memory::SecureBytes`] and is wiped (random overwrite, then zeros)
//!   on destruction; [`session::destroy_all_keys`] is the global
//!   emergency teardown.
//!
//! ## Quick start
//!
//! ```no_run
//! use tallow_protocol::crypto::prekey::{self, PrekeyStore};
//! use tallow_protocol::crypto::sign::{self, SignatureAlgorithm};
//! use tallow_protocol::ratchet::RatchetConfig;
//! use tallow_protocol::session::{Role, Session};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Bob publishes a prekey bundle; Alice initiates against it.
//! let bob_identity = sign::generate_keypair(SignatureAlgorithm::Ed25519)?;
//! let mut bob_store = PrekeyStore::initialize(bob_identity)?;
//! let bundle = bob_store.publish_bundle()?;
//!
//! let init = prekey::establish_as_initiator(&bundle)?;
//! let mut alice = Session::open(
//!     Role::Initiator,
//!     &init.initial_secret,
//!     None,
//!     None,
//!     None,
//!     RatchetConfig::default(),
//! )?;
//!
//! let wire_message = alice.encrypt(b"hello", b"")?;
//! println!("SAS: {}", alice.sas().words);
//! # Ok(())
//! # }
//! ```

// ── Public modules ──────────────────────────────────────────────────────────

/// Secure memory: zeroizing buffers and the emergency-wipe registry.
pub mod memory;

/// Cryptographic primitives.
pub mod crypto;

/// The triple ratchet state machines.
pub mod ratchet;

/// Session orchestration and key-storage sealing.
pub mod session;

/// Wire formats.
pub mod wire;

/// The aggregate error surface.
pub mod error;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use crypto::{
    CipherSuite, HybridKeyPair, HybridPublicKey, IntegrityManifest, PrekeyBundle, PrekeyStore,
    Sas, SignatureAlgorithm,
};
pub use error::ProtocolError;
pub use memory::SecureBytes;
pub use ratchet::{RatchetConfig, TripleRatchet};
pub use session::{
    destroy_all_keys, ingest_prekey_bundle, publish_prekey_bundle, FileOffer, Role, Session,
};

// ── Library metadata ────────────────────────────────────────────────────────

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
        assert!(version().contains('.'));
    }

    #[test]
    fn test_public_surface_is_usable() {
        let secret = SecureBytes::random(32, "smoke").unwrap();
        let session = Session::open(
            Role::Initiator,
            &secret,
            None,
            None,
            None,
            RatchetConfig::default(),
        )
        .unwrap();
        assert!(!session.is_closed());
        assert_eq!(session.epoch(), 0);
    }
}
