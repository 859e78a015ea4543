//! Sealing key material for storage at rest.
//!
//! Keys are never persisted in plaintext. A storage key is derived from a
//! session-level secret under the `storage-key` registry context, and each
//! entry is sealed with AES-256-GCM under a fresh random IV.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hash::{derive_key, KdfContext};
use crate::memory::{MemoryError, SecureBytes};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("Sealed entry failed to open")]
    OpenFailed,
    #[error("Storage key must be 32 bytes")]
    KeySizeInvalid,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One sealed entry: random IV plus AES-256-GCM ciphertext (tag appended).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// Derive the storage key from a session-level secret.
pub fn storage_key(secret: &SecureBytes) -> Result<SecureBytes> {
    let mut key = derive_key(KdfContext::StorageKey, &secret.data()?).to_vec();
    Ok(SecureBytes::take(&mut key, "storage-key")?)
}

/// Seal key material under a storage key with a fresh IV.
pub fn seal(material: &SecureBytes, storage_key: &SecureBytes) -> Result<SealedKey> {
    let key: [u8; 32] = read_key(storage_key)?;
    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);
    let aead = Aes256Gcm::new_from_slice(&key).map_err(|_| StorageError::KeySizeInvalid)?;
    let ciphertext = aead
        .encrypt(aes_gcm::Nonce::from_slice(&iv), &*material.data()?)
        .map_err(|_| StorageError::OpenFailed)?;
    Ok(SealedKey { iv, ciphertext })
}

/// Open a sealed entry back into secure memory.
pub fn open(sealed: &SealedKey, storage_key: &SecureBytes) -> Result<SecureBytes> {
    let key: [u8; 32] = read_key(storage_key)?;
    let aead = Aes256Gcm::new_from_slice(&key).map_err(|_| StorageError::KeySizeInvalid)?;
    let mut plaintext = aead
        .decrypt(
            aes_gcm::Nonce::from_slice(&sealed.iv),
            sealed.ciphertext.as_slice(),
        )
        .map_err(|_| StorageError::OpenFailed)?;
    Ok(SecureBytes::take(&mut plaintext, "unsealed-key")?)
}

fn read_key(storage_key: &SecureBytes) -> Result<[u8; 32]> {
    if storage_key.len() != 32 {
        return Err(StorageError::KeySizeInvalid);
    }
    Ok(storage_key.to_array()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let secret = SecureBytes::from_copy(&[1u8; 32], "session-secret").unwrap();
        let sk = storage_key(&secret).unwrap();
        let material = SecureBytes::from_copy(&[0xEE; 64], "private-key").unwrap();

        let sealed = seal(&material, &sk).unwrap();
        assert_ne!(sealed.ciphertext, vec![0xEE; 64]);
        let opened = open(&sealed, &sk).unwrap();
        assert_eq!(&*opened.data().unwrap(), &[0xEE; 64][..]);
    }

    #[test]
    fn test_each_seal_uses_fresh_iv() {
        let secret = SecureBytes::from_copy(&[2u8; 32], "session-secret").unwrap();
        let sk = storage_key(&secret).unwrap();
        let material = SecureBytes::from_copy(&[5u8; 32], "k").unwrap();
        let a = seal(&material, &sk).unwrap();
        let b = seal(&material, &sk).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_entry_fails() {
        let secret = SecureBytes::from_copy(&[3u8; 32], "session-secret").unwrap();
        let sk = storage_key(&secret).unwrap();
        let material = SecureBytes::from_copy(&[5u8; 32], "k").unwrap();
        let mut sealed = seal(&material, &sk).unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert_eq!(open(&sealed, &sk).unwrap_err(), StorageError::OpenFailed);
    }

    #[test]
    fn test_wrong_storage_key_fails() {
        let sk1 = storage_key(&SecureBytes::from_copy(&[4u8; 32], "a").unwrap()).unwrap();
        let sk2 = storage_key(&SecureBytes::from_copy(&[5u8; 32], "b").unwrap()).unwrap();
        let material = SecureBytes::from_copy(&[6u8; 32], "k").unwrap();
        let sealed = seal(&material, &sk1).unwrap();
        assert_eq!(open(&sealed, &sk2).unwrap_err(), StorageError::OpenFailed);
    }
}
