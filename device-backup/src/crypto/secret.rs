//! Owned key material that is zero-filled when dropped.
//!
//! `SecretKey` is deliberately not `Clone` or `Copy`: moving a key out of
//! [`EncryptionKeys`] transfers the only copy, so exactly one buffer is ever
//! zeroed for each key.

use std::collections::BTreeMap;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of every AES-256 key handled by the pipeline.
pub const KEY_LEN: usize = 32;

/// A 256-bit key zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_LEN],
}

impl SecretKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Copies a 32-byte slice into a new key. Returns `None` for any other length.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = slice.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Takes ownership of an unwrapped buffer; the buffer itself is zeroed when
    /// it goes out of scope here.
    pub fn from_unwrapped(buffer: Zeroizing<Vec<u8>>) -> Option<Self> {
        Self::from_slice(&buffer)
    }

    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// The key encryption key and every class key it unwrapped.
pub struct EncryptionKeys {
    kek: SecretKey,
    class_keys: BTreeMap<u32, SecretKey>,
}

impl EncryptionKeys {
    pub fn new(kek: SecretKey) -> Self {
        Self {
            kek,
            class_keys: BTreeMap::new(),
        }
    }

    pub fn kek(&self) -> &SecretKey {
        &self.kek
    }

    pub fn insert_class_key(&mut self, class: u32, key: SecretKey) {
        self.class_keys.insert(class, key);
    }

    pub fn class_key(&self, class: u32) -> Option<&SecretKey> {
        self.class_keys.get(&class)
    }

    /// Moves a class key out of the set.
    pub fn take_class_key(&mut self, class: u32) -> Option<SecretKey> {
        self.class_keys.remove(&class)
    }

    pub fn class_count(&self) -> usize {
        self.class_keys.len()
    }

    pub fn classes(&self) -> impl Iterator<Item = u32> + '_ {
        self.class_keys.keys().copied()
    }
}

impl std::fmt::Debug for EncryptionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeys")
            .field("classes", &self.class_keys.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
