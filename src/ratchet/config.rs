//! Sparse PQ ratchet tuning parameters.

use serde::{Deserialize, Serialize};

use super::{RatchetError, Result};

/// Lowest accepted message threshold.
pub const MESSAGE_THRESHOLD_MIN: u32 = 10;
/// Highest accepted message threshold.
pub const MESSAGE_THRESHOLD_MAX: u32 = 10_000;
/// Shortest accepted epoch age (30 seconds).
pub const MAX_EPOCH_AGE_MIN_MS: u64 = 30_000;
/// Longest accepted epoch age (1 hour).
pub const MAX_EPOCH_AGE_MAX_MS: u64 = 3_600_000;

/// When the sparse PQ ratchet advances: after `message_threshold` messages
/// in an epoch, or once the epoch is older than `max_epoch_age_ms`,
/// whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetConfig {
    pub message_threshold: u32,
    pub max_epoch_age_ms: u64,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            message_threshold: 100,
            max_epoch_age_ms: 300_000,
        }
    }
}

impl RatchetConfig {
    /// Construct a config, rejecting out-of-range values.
    pub fn new(message_threshold: u32, max_epoch_age_ms: u64) -> Result<Self> {
        if !(MESSAGE_THRESHOLD_MIN..=MESSAGE_THRESHOLD_MAX).contains(&message_threshold) {
            return Err(RatchetError::ConfigOutOfRange(
                "message_threshold must be within 10..=10000",
            ));
        }
        if !(MAX_EPOCH_AGE_MIN_MS..=MAX_EPOCH_AGE_MAX_MS).contains(&max_epoch_age_ms) {
            return Err(RatchetError::ConfigOutOfRange(
                "max_epoch_age_ms must be within 30s..=1h",
            ));
        }
        Ok(Self {
            message_threshold,
            max_epoch_age_ms,
        })
    }

    /// Negotiate with a peer: the stricter (smaller) value wins per field.
    pub fn negotiate(&self, peer: &RatchetConfig) -> RatchetConfig {
        RatchetConfig {
            message_threshold: self.message_threshold.min(peer.message_threshold),
            max_epoch_age_ms: self.max_epoch_age_ms.min(peer.max_epoch_age_ms),
        }
    }
}
