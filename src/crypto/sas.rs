//! Short authentication strings for out-of-band peer verification.
//!
//! Both peers derive the SAS independently from the session's established
//! shared secret (plus the session id) and compare it over a channel the
//! attacker does not control — a video call, a phone call, in person. A
//! matching SAS rules out a man-in-the-middle on the key agreement.
//!
//! Two display forms of the same derivation: three words from a fixed
//! 64-word list, and a six-digit number. Storage of the verification
//! outcome is the host application's concern.

use crate::crypto::hash::{ct_eq_32, Hasher};
use crate::memory::{MemoryError, SecureBytes};

/// The fixed 64-word SAS list. Index order is wire-frozen: changing a word
/// breaks verification against older peers.
const WORD_LIST: [&str; 64] = [
    "acid", "amber", "anchor", "apple", "atlas", "badge", "bamboo", "beacon",
    "birch", "bison", "bridge", "bronze", "cabin", "candle", "canyon", "cedar",
    "cobalt", "comet", "copper", "coral", "crane", "delta", "drift", "eagle",
    "ember", "falcon", "fern", "flint", "garnet", "glacier", "granite", "harbor",
    "hazel", "heron", "island", "ivory", "jade", "juniper", "kestrel", "lagoon",
    "lantern", "lotus", "maple", "marble", "meadow", "mesa", "nectar", "north",
    "oasis", "onyx", "orchid", "osprey", "pebble", "pine", "quartz", "raven",
    "reef", "saffron", "sierra", "summit", "thistle", "tundra", "violet", "willow",
];

/// A derived short authentication string.
#[derive(Debug, Clone)]
pub struct Sas {
    hash: [u8; 32],
    /// Three words joined by hyphens, e.g. `comet-harbor-willow`.
    pub words: String,
    /// Six-digit numeric form, zero-padded.
    pub numeric: String,
}

impl Sas {
    /// Derive the SAS for a session: BLAKE3 over (shared secret || session id).
    pub fn derive(shared_secret: &SecureBytes, session_id: &[u8]) -> Result<Self, MemoryError> {
        let mut hasher = Hasher::new();
        hasher.update(&shared_secret.data()?).update(session_id);
        let hash = hasher.finalize();
        Ok(Self::from_hash(hash))
    }

    fn from_hash(hash: [u8; 32]) -> Self {
        // Three 16-bit indices from the first six bytes, each mod 64.
        let words: Vec<&str> = (0..3)
            .map(|i| {
                let idx = u16::from_be_bytes([hash[2 * i], hash[2 * i + 1]]) as usize;
                WORD_LIST[idx % WORD_LIST.len()]
            })
            .collect();
        // Six digits from the first three bytes.
        let numeric =
            u32::from_be_bytes([0, hash[0], hash[1], hash[2]]) % 1_000_000;
        Self {
            hash,
            words: words.join("-"),
            numeric: format!("{:06}", numeric),
        }
    }

    /// Constant-time comparison over the raw derivation, not the rendered
    /// strings.
    pub fn matches(&self, other: &Sas) -> bool {
        ct_eq_32(&self.hash, &other.hash)
    }
}

// ── Identity fingerprints ───────────────────────────────────────────────────

/// Human-comparable fingerprint of an identity public key: the BLAKE3 hash
/// rendered as eight hyphenated groups of four hex digits.
pub fn identity_fingerprint(identity_public: &[u8]) -> String {
    let digest = crate::crypto::hash::hash(identity_public);
    let hex = hex::encode(&digest[..16]);
    hex.as_bytes()
        .chunks(4)
        .map(|group| std::str::from_utf8(group).expect("hex is ascii"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Outcome of comparing a peer's current identity key against the stored
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityKeyChange {
    /// Key unchanged; nothing to do.
    Unchanged,
    /// Key changed: the peer reinstalled or is being impersonated. The host
    /// must surface a warning and demand re-verification.
    Changed {
        previous_fingerprint: String,
        new_fingerprint: String,
    },
    /// No previous key on record.
    FirstSeen,
}

/// Compare a peer's current identity key against the previously stored one,
/// in constant time.
pub fn detect_identity_key_change(
    stored: Option<&[u8]>,
    current: &[u8],
) -> IdentityKeyChange {
    match stored {
        None => IdentityKeyChange::FirstSeen,
        Some(stored) if crate::crypto::hash::ct_eq(stored, current) => {
            IdentityKeyChange::Unchanged
        }
        Some(stored) => IdentityKeyChange::Changed {
            previous_fingerprint: identity_fingerprint(stored),
            new_fingerprint: identity_fingerprint(current),
        },
    }
}
