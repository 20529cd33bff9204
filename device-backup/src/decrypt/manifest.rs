//! `Manifest.plist` parsing.
//!
//! The manifest records whether the backup is encrypted and, when it is,
//! carries the keybag and the wrapped key of `Manifest.db`.

use plist::{Dictionary, Value};
use std::path::{Path, PathBuf};

use crate::utils::errors::DecryptError;

pub const MANIFEST_PLIST: &str = "Manifest.plist";
pub const MANIFEST_DB: &str = "Manifest.db";

/// A key wrapped under a protection class key, stored as a 4-byte
/// little-endian class number followed by the RFC 3394 ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub class: u32,
    pub wrapped: Vec<u8>,
}

impl WrappedKey {
    pub fn from_prefixed(data: &[u8]) -> Option<Self> {
        if data.len() <= 4 {
            return None;
        }
        let class = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        Some(Self {
            class,
            wrapped: data[4..].to_vec(),
        })
    }

    pub fn to_prefixed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.wrapped.len());
        out.extend_from_slice(&self.class.to_le_bytes());
        out.extend_from_slice(&self.wrapped);
        out
    }
}

/// Fields of `Manifest.plist` used by decryption and the catalog.
#[derive(Debug, Clone, Default)]
pub struct ManifestPlist {
    pub is_encrypted: bool,
    pub manifest_key: Option<WrappedKey>,
    pub keybag: Option<Vec<u8>>,
    pub device_name: Option<String>,
    pub product_version: Option<String>,
    pub unique_device_id: Option<String>,
}

impl ManifestPlist {
    pub fn from_value(value: &Value) -> Result<Self, DecryptError> {
        let dict = value
            .as_dictionary()
            .ok_or(DecryptError::MissingField("top-level dictionary"))?;
        let lockdown = dict.get("Lockdown").and_then(Value::as_dictionary);

        Ok(Self {
            is_encrypted: dict
                .get("IsEncrypted")
                .and_then(Value::as_boolean)
                .unwrap_or(false),
            manifest_key: dict
                .get("ManifestKey")
                .and_then(Value::as_data)
                .and_then(WrappedKey::from_prefixed),
            keybag: dict
                .get("BackupKeyBag")
                .and_then(Value::as_data)
                .map(<[u8]>::to_vec),
            device_name: lockdown.and_then(|d| string_field(d, "DeviceName")),
            product_version: lockdown.and_then(|d| string_field(d, "ProductVersion")),
            unique_device_id: lockdown.and_then(|d| string_field(d, "UniqueDeviceID")),
        })
    }
}

fn string_field(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_string)
}

pub fn manifest_path(backup_root: &Path) -> PathBuf {
    backup_root.join(MANIFEST_PLIST)
}

/// Reads and parses `<backup_root>/Manifest.plist`.
pub fn read_manifest(backup_root: &Path) -> Result<ManifestPlist, DecryptError> {
    let path = manifest_path(backup_root);
    if !path.is_file() {
        return Err(DecryptError::ManifestNotFound(backup_root.display().to_string()));
    }
    let value = Value::from_file(&path)?;
    ManifestPlist::from_value(&value)
}
