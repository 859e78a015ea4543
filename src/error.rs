//! The aggregate error surface of the session API.
//!
//! Subsystems keep their own `thiserror` enums; everything a session
//! operation can fail with converges here. Errors are returned, never
//! thrown across the API boundary.

use thiserror::Error;

use crate::crypto::aead::AeadError;
use crate::crypto::kem::KemError;
use crate::crypto::merkle::MerkleError;
use crate::crypto::prekey::PrekeyError;
use crate::crypto::sign::SignError;
use crate::memory::MemoryError;
use crate::ratchet::RatchetError;
use crate::session::storage::StorageError;
use crate::wire::WireError;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Aead(#[from] AeadError),
    #[error(transparent)]
    Kem(#[from] KemError),
    #[error(transparent)]
    Signature(#[from] SignError),
    #[error(transparent)]
    Prekey(#[from] PrekeyError),
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Integrity(#[from] MerkleError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Manifest signature did not verify")]
    InvalidManifestSignature,
    #[error("Session is closed")]
    SessionClosed,
}

impl ProtocolError {
    /// Whether this error requires the session to be torn down (a fresh
    /// handshake is needed), as opposed to dropping the offending message.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Aead(AeadError::NonceExhausted)
                | ProtocolError::Ratchet(RatchetError::ReceiveSkipLimitExceeded)
                | ProtocolError::Ratchet(RatchetError::ChainExhausted)
                | ProtocolError::Ratchet(RatchetError::Aead(AeadError::NonceExhausted))
                | ProtocolError::SessionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(ProtocolError::SessionClosed.is_session_fatal());
        assert!(ProtocolError::Aead(AeadError::NonceExhausted).is_session_fatal());
        assert!(
            ProtocolError::Ratchet(RatchetError::ReceiveSkipLimitExceeded).is_session_fatal()
        );
        // Dropped-message errors keep the session alive.
        assert!(!ProtocolError::Aead(AeadError::AuthFailed).is_session_fatal());
        assert!(!ProtocolError::Wire(WireError::UnknownVersion(9)).is_session_fatal());
        assert!(
            !ProtocolError::Ratchet(RatchetError::FutureEpoch { epoch: 2 }).is_session_fatal()
        );
    }
}
