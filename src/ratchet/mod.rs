//! The triple ratchet: a Double Ratchet (X25519) layered over a sparse
//! post-quantum ratchet (ML-KEM epochs).
//!
//! The Double Ratchet gives per-message forward secrecy and classical
//! post-compromise security; the sparse PQ ratchet re-keys with hybrid KEM
//! encapsulations at epoch boundaries so that a quantum adversary recording
//! traffic today cannot unwind the session later. Every message key is the
//! domain-separated combination of one key from each layer.

pub mod config;
pub mod double;
pub mod pq;
pub mod triple;

use thiserror::Error;

use crate::crypto::aead::AeadError;
use crate::crypto::kem::KemError;
use crate::memory::MemoryError;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RatchetError {
    #[error("Message from future epoch {epoch} — prerequisite KEM not yet received")]
    FutureEpoch { epoch: u32 },
    #[error("Message from epoch {epoch} behind current epoch {current}")]
    EpochRegressed { epoch: u32, current: u32 },
    #[error("Skipped-message window exceeded")]
    ReceiveSkipLimitExceeded,
    #[error("Message number space exhausted")]
    ChainExhausted,
    #[error("Peer public key not yet known")]
    PeerKeyUnknown,
    #[error("Message number {message_number} was already consumed")]
    MessageReplayed { message_number: u64 },
    #[error("Ratchet configuration out of range: {0}")]
    ConfigOutOfRange(&'static str),
    #[error("Session is closed")]
    SessionClosed,
    #[error(transparent)]
    Aead(#[from] AeadError),
    #[error(transparent)]
    Kem(#[from] KemError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type Result<T> = std::result::Result<T, RatchetError>;

pub use config::RatchetConfig;
pub use double::DoubleRatchet;
pub use pq::{KemAdvance, SparsePqRatchet};
pub use triple::{RatchetMessage, TripleRatchet, DH_RATCHET_MESSAGE_INTERVAL, MAX_SKIPPED_KEYS};
