//! Secure memory management for key material.
//!
//! Every secret in the protocol lives inside a [`SecureBytes`]: an owned,
//! labelled byte buffer that is wiped with a double overwrite (random bytes,
//! then zeros) when destroyed. A process-wide registry tracks every live
//! buffer so that [`destroy_all`] can perform an emergency wipe on detected
//! compromise.
//!
//! The destructor wipe is a safety net, not the primary mechanism — callers
//! destroy sessions explicitly and the session teardown zeroizes each field.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Secure buffer read after zeroization")]
    UseAfterZero,
    #[error("Secure buffer must have nonzero length")]
    EmptyBuffer,
}

pub type Result<T> = std::result::Result<T, MemoryError>;

struct Inner {
    bytes: Vec<u8>,
    zeroed: bool,
    label: &'static str,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.zeroed {
            wipe(&mut self.bytes);
            self.zeroed = true;
        }
    }
}

/// Double overwrite: cryptographically random bytes first, then zeros.
///
/// The random pass prevents the final zero store from being elided by a
/// compiler that can prove the buffer is never read again.
fn wipe(bytes: &mut [u8]) {
    OsRng.fill_bytes(bytes);
    bytes.zeroize();
}

/// Process-wide registry of live secure buffers, for emergency teardown.
/// The only process-wide mutable state in the crate.
static REGISTRY: Lazy<Mutex<Vec<Weak<Mutex<Inner>>>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn register(inner: &Arc<Mutex<Inner>>) {
    let mut registry = REGISTRY.lock().expect("secure registry poisoned");
    // Drop dead entries opportunistically so the registry stays small.
    registry.retain(|weak| weak.strong_count() > 0);
    registry.push(Arc::downgrade(inner));
}

/// Zeroize every live [`SecureBytes`] in the process. Returns the number of
/// buffers wiped. Intended for emergency teardown (detected compromise).
pub fn destroy_all() -> u32 {
    let mut registry = REGISTRY.lock().expect("secure registry poisoned");
    let mut wiped = 0u32;
    for weak in registry.drain(..) {
        if let Some(inner) = weak.upgrade() {
            let mut inner = inner.lock().expect("secure buffer poisoned");
            if !inner.zeroed {
                wipe(&mut inner.bytes);
                inner.zeroed = true;
                wiped += 1;
            }
        }
    }
    log::warn!("emergency wipe: zeroized {} live secure buffers", wiped);
    wiped
}

/// Number of live, not-yet-zeroed secure buffers.
pub fn live_count() -> usize {
    let registry = REGISTRY.lock().expect("secure registry poisoned");
    registry
        .iter()
        .filter_map(Weak::upgrade)
        .filter(|inner| !inner.lock().expect("secure buffer poisoned").zeroed)
        .count()
}

/// An owned byte buffer holding key material.
///
/// Reads after zeroization fail with [`MemoryError::UseAfterZero`]. The
/// buffer is deliberately not `Clone`: key material has exactly one owner.
pub struct SecureBytes {
    inner: Arc<Mutex<Inner>>,
    len: usize,
}

impl SecureBytes {
    /// Copy `src` into a new secure buffer. The caller remains responsible
    /// for wiping `src`.
    pub fn from_copy(src: &[u8], label: &'static str) -> Result<Self> {
        if src.is_empty() {
            return Err(MemoryError::EmptyBuffer);
        }
        Ok(Self::new(src.to_vec(), label))
    }

    /// Take ownership of `src`, leaving a zeroized vector behind.
    pub fn take(src: &mut Vec<u8>, label: &'static str) -> Result<Self> {
        if src.is_empty() {
            return Err(MemoryError::EmptyBuffer);
        }
        let bytes = std::mem::take(src);
        Ok(Self::new(bytes, label))
    }

    /// Allocate `len` bytes of fresh OS randomness.
    pub fn random(len: usize, label: &'static str) -> Result<Self> {
        if len == 0 {
            return Err(MemoryError::EmptyBuffer);
        }
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        Ok(Self::new(bytes, label))
    }

    /// Allocate `len` zero bytes.
    pub fn alloc(len: usize, label: &'static str) -> Result<Self> {
        if len == 0 {
            return Err(MemoryError::EmptyBuffer);
        }
        Ok(Self::new(vec![0u8; len], label))
    }

    fn new(bytes: Vec<u8>, label: &'static str) -> Self {
        let len = bytes.len();
        let inner = Arc::new(Mutex::new(Inner {
            bytes,
            zeroed: false,
            label,
        }));
        register(&inner);
        Self { inner, len }
    }

    /// Borrow the bytes. Fails once the buffer has been zeroized.
    pub fn data(&self) -> Result<SecureBytesGuard<'_>> {
        let guard = self.inner.lock().expect("secure buffer poisoned");
        if guard.zeroed {
            return Err(MemoryError::UseAfterZero);
        }
        Ok(SecureBytesGuard { guard })
    }

    /// Copy the contents into a fixed-size array.
    pub fn to_array<const N: usize>(&self) -> Result<[u8; N]> {
        let data = self.data()?;
        let mut out = [0u8; N];
        out.copy_from_slice(&data[..N]);
        Ok(out)
    }

    /// Wipe the buffer: random overwrite, then zeros. Idempotent.
    pub fn zero(&mut self) {
        let mut guard = self.inner.lock().expect("secure buffer poisoned");
        if !guard.zeroed {
            wipe(&mut guard.bytes);
            guard.zeroed = true;
        }
    }

    pub fn is_zeroed(&self) -> bool {
        self.inner.lock().expect("secure buffer poisoned").zeroed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn label(&self) -> &'static str {
        self.inner.lock().expect("secure buffer poisoned").label
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        // Safety net: explicit zeroization is the primary mechanism.
        self.zero();
    }
}

impl std::fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureBytes")
            .field("label", &self.label())
            .field("len", &self.len)
            .field("zeroed", &self.is_zeroed())
            .finish()
    }
}

/// RAII read guard over a secure buffer's bytes.
pub struct SecureBytesGuard<'a> {
    guard: MutexGuard<'a, Inner>,
}

impl Deref for SecureBytesGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.bytes
    }
}

impl std::fmt::Debug for SecureBytesGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the bytes.
        f.debug_struct("SecureBytesGuard")
            .field("len", &self.guard.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_copy_and_read() {
        let buf = SecureBytes::from_copy(&[1, 2, 3, 4], "test").unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(&*buf.data().unwrap(), &[1, 2, 3, 4]);
        assert_eq!(buf.label(), "test");
    }

    #[test]
    fn test_zero_length_rejected() {
        assert_eq!(
            SecureBytes::from_copy(&[], "empty").unwrap_err(),
            MemoryError::EmptyBuffer
        );
        assert_eq!(
            SecureBytes::random(0, "empty").unwrap_err(),
            MemoryError::EmptyBuffer
        );
        assert_eq!(
            SecureBytes::alloc(0, "empty").unwrap_err(),
            MemoryError::EmptyBuffer
        );
    }

    #[test]
    fn test_take_wipes_source() {
        let mut src = vec![0xAA; 16];
        let buf = SecureBytes::take(&mut src, "taken").unwrap();
        assert!(src.is_empty());
        assert_eq!(buf.len(), 16);
        assert_eq!(&*buf.data().unwrap(), &[0xAA; 16]);
    }

    #[test]
    fn test_use_after_zero() {
        let mut buf = SecureBytes::random(32, "key").unwrap();
        buf.zero();
        assert!(buf.is_zeroed());
        assert_eq!(buf.data().unwrap_err(), MemoryError::UseAfterZero);
        // Idempotent
        buf.zero();
        assert!(buf.is_zeroed());
    }

    #[test]
    fn test_random_is_random() {
        let a = SecureBytes::random(32, "a").unwrap();
        let b = SecureBytes::random(32, "b").unwrap();
        assert_ne!(&*a.data().unwrap(), &*b.data().unwrap());
    }

    #[test]
    fn test_destroy_all_counts_live_buffers() {
        // Other tests run in parallel, so only check relative behavior.
        let before = live_count();
        let _a = SecureBytes::random(32, "wipe-a").unwrap();
        let _b = SecureBytes::random(32, "wipe-b").unwrap();
        assert!(live_count() >= before + 2);
        let wiped = destroy_all();
        assert!(wiped >= 2);
        assert_eq!(_a.data().unwrap_err(), MemoryError::UseAfterZero);
        assert_eq!(_b.data().unwrap_err(), MemoryError::UseAfterZero);
    }

    #[test]
    fn test_to_array() {
        let buf = SecureBytes::from_copy(&[7u8; 32], "arr").unwrap();
        let arr: [u8; 32] = buf.to_array().unwrap();
        assert_eq!(arr, [7u8; 32]);
    }
}
