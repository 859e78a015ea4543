//! Duplicate-delivery guard for inbound wire messages.
//!
//! The ratchet already refuses replays at the key-schedule level, but only
//! after parsing and key derivation. This cache rejects exact duplicates of
//! already-accepted messages up front, by BLAKE3 hash of the wire bytes.
//!
//! A message is recorded only after it decrypts successfully: redelivery of
//! a message whose first copy failed authentication must stay possible,
//! since the genuine bytes differ from the tampered copy.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::crypto::hash;

/// Entries kept per session. Old entries age out; the ratchet's replay
/// checks remain the backstop for anything evicted.
const REPLAY_CACHE_CAP: usize = 10_000;

/// Per-session LRU of accepted message hashes.
pub struct ReplayGuard {
    seen: LruCache<[u8; 32], ()>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(REPLAY_CACHE_CAP).expect("nonzero capacity")),
        }
    }

    /// Whether these exact wire bytes were already accepted.
    pub fn is_replay(&self, wire_message: &[u8]) -> bool {
        self.seen.contains(&hash::hash(wire_message))
    }

    /// Record a message after it decrypted successfully.
    pub fn record(&mut self, wire_message: &[u8]) {
        self.seen.put(hash::hash(wire_message), ());
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_message_is_not_replay() {
        let guard = ReplayGuard::new();
        assert!(!guard.is_replay(b"message one"));
    }

    #[test]
    fn test_recorded_message_is_replay() {
        let mut guard = ReplayGuard::new();
        guard.record(b"message one");
        assert!(guard.is_replay(b"message one"));
        assert!(!guard.is_replay(b"message two"));
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn test_unrecorded_failure_can_be_redelivered() {
        // A tampered first copy is never recorded, so the genuine bytes
        // pass the guard later.
        let mut guard = ReplayGuard::new();
        let genuine = b"genuine wire bytes";
        let mut tampered = genuine.to_vec();
        tampered[0] ^= 0x01;

        // The tampered copy fails AEAD downstream; nothing is recorded.
        assert!(!guard.is_replay(&tampered));
        // The genuine redelivery is accepted and then recorded.
        assert!(!guard.is_replay(genuine));
        guard.record(genuine);
        assert!(guard.is_replay(genuine));
        assert!(!guard.is_replay(&tampered));
    }
}
