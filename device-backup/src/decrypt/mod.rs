//! Selective decryption of encrypted backups.
//!
//! Only the files the rest of the system needs (the messages store and the
//! contacts store) are decrypted. The pipeline is:
//!
//! 1. parse `Manifest.plist` and its keybag
//! 2. derive the key encryption key from the password
//! 3. unwrap every class key (none unwrapping means a wrong password)
//! 4. unwrap the `Manifest.db` key and decrypt the database to a temporary file
//! 5. look up, unwrap and decrypt each target file into `<backup>/decrypted/`
//!
//! All key material lives in [`EncryptionKeys`] / [`SecretKey`] values owned by
//! the call, so it is zeroed when the call returns, whichever way it returns.

pub mod manifest;
pub mod manifest_db;

use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::cbc::decrypt_cbc_stream;
use crate::crypto::keybag::{parse_keybag, WRAP_PASSCODE};
use crate::crypto::{derive_kek, unwrap_key, EncryptionKeys, SecretKey};
use crate::utils::errors::DecryptError;
use manifest::{read_manifest, ManifestPlist, MANIFEST_DB};
use manifest_db::{parse_file_metadata, ManifestDb};

/// `HomeDomain/Library/SMS/sms.db`
pub const MESSAGES_DB_ID: &str = "3d0d7e5fb2ce288813306e4d4636395e047a3d28";
/// `HomeDomain/Library/AddressBook/AddressBook.sqlitedb`
pub const CONTACTS_DB_ID: &str = "31bb7ba8914766d4ba40d6dfb6113c8b614be442";

/// Name of the output directory created inside the backup.
pub const DECRYPTED_DIR: &str = "decrypted";

const TEMP_MANIFEST_DB: &str = "Manifest.decrypted.db";
const SCRUB_CHUNK: usize = 64 * 1024;

/// A file to extract from the backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptTarget {
    pub file_id: String,
    pub label: String,
}

impl DecryptTarget {
    pub fn new(file_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            label: label.into(),
        }
    }
}

/// Why a decryption failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecryptFailure {
    ManifestNotFound,
    NotEncrypted,
    IncorrectPassword,
    Cancelled,
    Other,
}

impl From<&DecryptError> for DecryptFailure {
    fn from(error: &DecryptError) -> Self {
        match error {
            DecryptError::ManifestNotFound(_) => DecryptFailure::ManifestNotFound,
            DecryptError::NotEncrypted => DecryptFailure::NotEncrypted,
            DecryptError::IncorrectPassword => DecryptFailure::IncorrectPassword,
            DecryptError::Cancelled => DecryptFailure::Cancelled,
            _ => DecryptFailure::Other,
        }
    }
}

/// Outcome of [`DecryptionEngine::decrypt`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecryptionOutcome {
    pub success: bool,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<DecryptFailure>,
    pub decrypted_path: Option<PathBuf>,
    pub decrypted_files: Vec<PathBuf>,
}

impl DecryptionOutcome {
    fn failed(error: &DecryptError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            failure: Some(error.into()),
            ..Self::default()
        }
    }

    /// Whether the failure was a wrong password rather than anything else.
    pub fn is_incorrect_password(&self) -> bool {
        self.failure == Some(DecryptFailure::IncorrectPassword)
    }

    pub fn is_cancelled(&self) -> bool {
        self.failure == Some(DecryptFailure::Cancelled)
    }
}

/// Decrypts the target files of an encrypted backup.
#[derive(Debug, Clone)]
pub struct DecryptionEngine {
    targets: Vec<DecryptTarget>,
}

impl Default for DecryptionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DecryptionEngine {
    /// Engine extracting the messages and contacts databases.
    pub fn new() -> Self {
        Self::with_targets(vec![
            DecryptTarget::new(MESSAGES_DB_ID, "messages"),
            DecryptTarget::new(CONTACTS_DB_ID, "contacts"),
        ])
    }

    pub fn with_targets(targets: Vec<DecryptTarget>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[DecryptTarget] {
        &self.targets
    }

    /// Decrypts the configured targets into `<backup_root>/decrypted`.
    ///
    /// Never returns an error or panics on bad input: every failure is
    /// reported through the outcome's `error`.
    pub fn decrypt(&self, backup_root: &Path, password: &str) -> DecryptionOutcome {
        self.decrypt_cancellable(backup_root, password, &CancellationToken::new())
    }

    /// Like [`decrypt`](Self::decrypt), but stops between files once `cancel`
    /// fires. Files already written are scrubbed and the outcome reports
    /// [`DecryptFailure::Cancelled`].
    pub fn decrypt_cancellable(
        &self,
        backup_root: &Path,
        password: &str,
        cancel: &CancellationToken,
    ) -> DecryptionOutcome {
        info!("Decrypting backup at {}", backup_root.display());

        match self.try_decrypt(backup_root, password, cancel) {
            Ok((output_dir, files)) => {
                info!(
                    "Decrypted {} of {} file(s) into {}",
                    files.len(),
                    self.targets.len(),
                    output_dir.display()
                );
                DecryptionOutcome {
                    success: true,
                    error: None,
                    failure: None,
                    decrypted_path: Some(output_dir),
                    decrypted_files: files,
                }
            }
            Err(e) => {
                warn!("Decryption of {} failed: {}", backup_root.display(), e);
                DecryptionOutcome::failed(&e)
            }
        }
    }

    /// Whether `<backup_root>/Manifest.plist` exists and marks the backup encrypted.
    pub fn is_encrypted(&self, backup_root: &Path) -> bool {
        is_backup_encrypted(backup_root)
    }

    /// Whether `password` unwraps at least one class key of the backup.
    pub fn verify_password(&self, backup_root: &Path, password: &str) -> bool {
        let manifest = match read_manifest(backup_root) {
            Ok(manifest) if manifest.is_encrypted => manifest,
            Ok(_) => return false,
            Err(e) => {
                debug!("Cannot verify password: {}", e);
                return false;
            }
        };
        unlock(&manifest, password).is_ok()
    }

    /// Overwrites every decrypted file with zeros, unlinks it and removes the
    /// directory. Returns the number of files scrubbed.
    pub fn cleanup(&self, decrypted_dir: &Path) -> std::io::Result<usize> {
        if !decrypted_dir.exists() {
            return Ok(0);
        }

        let mut scrubbed = 0usize;
        for entry in fs::read_dir(decrypted_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                scrub_file(&entry.path())?;
                scrubbed += 1;
            }
        }
        fs::remove_dir(decrypted_dir)?;

        info!("Scrubbed {} decrypted file(s) from {}", scrubbed, decrypted_dir.display());
        Ok(scrubbed)
    }

    fn try_decrypt(
        &self,
        backup_root: &Path,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, Vec<PathBuf>), DecryptError> {
        let manifest = read_manifest(backup_root)?;
        if !manifest.is_encrypted {
            return Err(DecryptError::NotEncrypted);
        }

        let keys = unlock(&manifest, password)?;
        debug!("Unwrapped {} class key(s)", keys.class_count());

        let temp_db = ScrubOnDrop(backup_root.join(TEMP_MANIFEST_DB));
        {
            let db_key = unwrap_manifest_key(&manifest, &keys)?;
            decrypt_file(&db_key, &backup_root.join(MANIFEST_DB), &temp_db.0, None)?;
        }
        let db = ManifestDb::open(&temp_db.0)?;

        if cancel.is_cancelled() {
            return Err(DecryptError::Cancelled);
        }
        let output_dir = backup_root.join(DECRYPTED_DIR);
        let created_dir = !output_dir.exists();
        fs::create_dir_all(&output_dir)?;

        let mut files = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            if cancel.is_cancelled() {
                discard_output(&output_dir, &files, created_dir);
                return Err(DecryptError::Cancelled);
            }
            match extract_target(&db, &keys, backup_root, &output_dir, target) {
                Ok(path) => {
                    info!("Decrypted {} to {}", target.label, path.display());
                    files.push(path);
                }
                Err(e) => warn!("Skipping {} ({}): {}", target.label, target.file_id, e),
            }
        }
        drop(db);
        drop(temp_db);

        if files.is_empty() {
            discard_output(&output_dir, &files, created_dir);
            return Err(DecryptError::NothingExtracted);
        }

        Ok((output_dir, files))
    }
}

/// Scrubs files written by this call and removes the output directory if
/// this call created it.
fn discard_output(output_dir: &Path, files: &[PathBuf], created_dir: bool) {
    for file in files {
        if let Err(e) = scrub_file(file) {
            warn!("Failed to scrub {}: {}", file.display(), e);
        }
    }
    if created_dir {
        if let Err(e) = fs::remove_dir_all(output_dir) {
            warn!("Failed to remove {}: {}", output_dir.display(), e);
        }
    }
}

/// Whether `<backup_root>/Manifest.plist` exists and marks the backup encrypted.
pub fn is_backup_encrypted(backup_root: &Path) -> bool {
    match read_manifest(backup_root) {
        Ok(manifest) => manifest.is_encrypted,
        Err(e) => {
            debug!("Treating {} as unencrypted: {}", backup_root.display(), e);
            false
        }
    }
}

/// Derives the KEK and unwraps every class key it protects.
fn unlock(manifest: &ManifestPlist, password: &str) -> Result<EncryptionKeys, DecryptError> {
    let blob = manifest
        .keybag
        .as_deref()
        .ok_or(DecryptError::MissingField("BackupKeyBag"))?;
    let keybag = parse_keybag(blob).tolerate_truncation();

    let mut keys = EncryptionKeys::new(derive_kek(password, &keybag));
    for (class, item) in &keybag.class_keys {
        if item.wrap.is_some_and(|wrap| wrap & WRAP_PASSCODE == 0) {
            debug!("Class {} is not password-wrapped, skipping", class);
            continue;
        }
        let Some(wrapped) = item.wrapped_key.as_deref() else {
            continue;
        };
        match unwrap_key(keys.kek(), wrapped).and_then(SecretKey::from_unwrapped) {
            Some(key) => keys.insert_class_key(*class, key),
            None => debug!("Class {} key did not unwrap", class),
        }
    }

    if keys.class_count() == 0 {
        return Err(DecryptError::IncorrectPassword);
    }
    Ok(keys)
}

fn unwrap_manifest_key(
    manifest: &ManifestPlist,
    keys: &EncryptionKeys,
) -> Result<SecretKey, DecryptError> {
    let wrapped = manifest
        .manifest_key
        .as_ref()
        .ok_or(DecryptError::MissingField("ManifestKey"))?;
    let class_key = keys
        .class_key(wrapped.class)
        .ok_or(DecryptError::MissingClassKey(wrapped.class))?;

    unwrap_key(class_key, &wrapped.wrapped)
        .and_then(SecretKey::from_unwrapped)
        .ok_or_else(|| DecryptError::Crypto("failed to unwrap the Manifest.db key".into()))
}

fn extract_target(
    db: &ManifestDb,
    keys: &EncryptionKeys,
    backup_root: &Path,
    output_dir: &Path,
    target: &DecryptTarget,
) -> Result<PathBuf, DecryptError> {
    let entry = db
        .lookup(&target.file_id)?
        .ok_or_else(|| DecryptError::NotInManifest(target.file_id.clone()))?;
    let metadata = parse_file_metadata(&entry.metadata)?;

    let class = metadata
        .class()
        .ok_or(DecryptError::MissingField("ProtectionClass"))?;
    let wrapped = metadata
        .wrapped_key
        .as_ref()
        .ok_or(DecryptError::MissingField("EncryptionKey"))?;
    let class_key = keys
        .class_key(class)
        .ok_or(DecryptError::MissingClassKey(class))?;
    let file_key = unwrap_key(class_key, &wrapped.wrapped)
        .and_then(SecretKey::from_unwrapped)
        .ok_or_else(|| DecryptError::Crypto(format!("failed to unwrap key of {}", entry.file_id)))?;

    let source = blob_path(backup_root, &entry.file_id)
        .ok_or_else(|| DecryptError::NotInManifest(entry.file_id.clone()))?;
    if !source.is_file() {
        return Err(DecryptError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is missing from the backup", source.display()),
        )));
    }

    let dest = output_dir.join(entry.file_name());
    decrypt_file(&file_key, &source, &dest, metadata.size)?;
    Ok(dest)
}

/// On-disk location of a backed-up file: `<root>/<first two hex chars>/<file id>`.
pub fn blob_path(backup_root: &Path, file_id: &str) -> Option<PathBuf> {
    let prefix = file_id.get(..2)?;
    Some(backup_root.join(prefix).join(file_id))
}

/// Decrypts `source` into a new file at `dest`, removing `dest` on failure.
fn decrypt_file(
    key: &SecretKey,
    source: &Path,
    dest: &Path,
    plaintext_len: Option<u64>,
) -> Result<u64, DecryptError> {
    let mut reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(create_private_file(dest)?);

    let result = decrypt_cbc_stream(key, &mut reader, &mut writer, plaintext_len)
        .and_then(|written| writer.flush().map(|_| written).map_err(Into::into));
    drop(writer);

    if result.is_err() {
        if let Err(e) = scrub_file(dest) {
            warn!("Failed to remove partial output {}: {}", dest.display(), e);
        }
    }
    result
}

fn create_private_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Overwrites a file with zero bytes of the same length, then unlinks it.
pub fn scrub_file(path: &Path) -> std::io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    {
        let mut file = OpenOptions::new().write(true).open(path)?;
        let zeros = vec![0u8; SCRUB_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(SCRUB_CHUNK as u64) as usize;
            file.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }

    fs::remove_file(path)
}

/// Temporary plaintext file scrubbed when it goes out of scope.
struct ScrubOnDrop(PathBuf);

impl Drop for ScrubOnDrop {
    fn drop(&mut self) {
        if let Err(e) = scrub_file(&self.0) {
            warn!("Failed to remove temporary file {}: {}", self.0.display(), e);
        }
    }
}

/// Builders for synthetic encrypted backups.
#[cfg(test)]
pub(crate) mod test_support {
    use super::manifest::{WrappedKey, MANIFEST_PLIST};
    use super::manifest_db::{create_manifest_db, encode_file_metadata};
    use super::*;
    use crate::crypto::cbc::encrypt_cbc_zero_iv;
    use crate::crypto::keybag::encode_record;
    use crate::crypto::wrap_key;
    use plist::{Dictionary, Value};

    pub const PASSWORD: &str = "correct horse battery staple";
    pub const MESSAGES: &[u8] = b"SQLite format 3\0 messages database contents";
    pub const CONTACTS: &[u8] = b"SQLite format 3\0 contacts database contents, a bit longer";

    const CLASS_FILES: u32 = 3;
    const CLASS_MANIFEST: u32 = 4;
    const CLASS_UNKNOWN: u32 = 7;

    fn keybag_bytes(password: &str) -> Vec<u8> {
        let mut data = Vec::new();
        encode_record(&mut data, b"VERS", &3u32.to_be_bytes());
        encode_record(&mut data, b"TYPE", &1u32.to_be_bytes());
        encode_record(&mut data, b"UUID", &[0x10; 16]);
        encode_record(&mut data, b"WRAP", &0u32.to_be_bytes());
        encode_record(&mut data, b"SALT", &[0x5A; 20]);
        encode_record(&mut data, b"ITER", &10u32.to_be_bytes());
        encode_record(&mut data, b"DPWT", &1u32.to_be_bytes());
        encode_record(&mut data, b"DPIC", &20u32.to_be_bytes());
        encode_record(&mut data, b"DPSL", &[0xA5; 20]);

        let kek = derive_kek(password, &parse_keybag(&data).keybag);
        for (class, key) in [(CLASS_FILES, [0x33u8; 32]), (CLASS_MANIFEST, [0x44u8; 32])] {
            encode_record(&mut data, b"UUID", &[class as u8; 16]);
            encode_record(&mut data, b"CLAS", &class.to_be_bytes());
            encode_record(&mut data, b"WRAP", &3u32.to_be_bytes());
            encode_record(&mut data, b"KTYP", &0u32.to_be_bytes());
            encode_record(&mut data, b"WPKY", &wrap_key(&kek, &key).unwrap());
        }
        data
    }

    fn class_key(class: u32) -> SecretKey {
        SecretKey::new([if class == CLASS_FILES { 0x33 } else { 0x44 }; 32])
    }

    fn write_manifest_plist(root: &Path, encrypted: bool, keybag: Option<Vec<u8>>, manifest_key: Option<WrappedKey>) {
        let mut lockdown = Dictionary::new();
        lockdown.insert("DeviceName".into(), Value::String("Test Phone".into()));
        lockdown.insert("ProductVersion".into(), Value::String("17.4".into()));
        lockdown.insert("UniqueDeviceID".into(), Value::String("test-udid".into()));

        let mut dict = Dictionary::new();
        dict.insert("IsEncrypted".into(), Value::Boolean(encrypted));
        if let Some(keybag) = keybag {
            dict.insert("BackupKeyBag".into(), Value::Data(keybag));
        }
        if let Some(key) = manifest_key {
            dict.insert("ManifestKey".into(), Value::Data(key.to_prefixed()));
        }
        dict.insert("Lockdown".into(), Value::Dictionary(lockdown));
        Value::Dictionary(dict)
            .to_file_xml(root.join(MANIFEST_PLIST))
            .unwrap();
    }

    /// Writes an unencrypted backup skeleton.
    pub fn build_plain_backup(root: &Path) {
        fs::create_dir_all(root).unwrap();
        write_manifest_plist(root, false, None, None);
    }

    /// How the contacts row of a synthetic backup is written.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ContactsRecord {
        Valid,
        /// `file` column is not a property list
        Corrupt,
        /// Protection class with no key in the keybag
        UnknownClass,
    }

    /// Writes an encrypted backup holding the messages and contacts stores.
    pub fn build_encrypted_backup(root: &Path, include_contacts_blob: bool) {
        build_encrypted_backup_with(root, include_contacts_blob, ContactsRecord::Valid);
    }

    pub fn build_encrypted_backup_with(
        root: &Path,
        include_contacts_blob: bool,
        contacts: ContactsRecord,
    ) {
        fs::create_dir_all(root).unwrap();

        let files_class = class_key(CLASS_FILES);
        let mut rows = Vec::new();
        let mut blobs = Vec::new();
        for (i, (file_id, path, content)) in [
            (MESSAGES_DB_ID, "Library/SMS/sms.db", MESSAGES),
            (CONTACTS_DB_ID, "Library/AddressBook/AddressBook.sqlitedb", CONTACTS),
        ]
        .into_iter()
        .enumerate()
        {
            let file_key = SecretKey::new([0x60 + i as u8; 32]);
            let class = match (file_id, contacts) {
                (CONTACTS_DB_ID, ContactsRecord::UnknownClass) => CLASS_UNKNOWN,
                _ => CLASS_FILES,
            };
            let wrapped = WrappedKey {
                class,
                wrapped: wrap_key(&files_class, file_key.expose()).unwrap(),
            };
            let metadata = match (file_id, contacts) {
                (CONTACTS_DB_ID, ContactsRecord::Corrupt) => b"bplist00 garbage".to_vec(),
                _ => encode_file_metadata(u64::from(class), &wrapped, content.len() as u64),
            };
            rows.push((file_id, "HomeDomain", path, metadata));
            blobs.push((file_id, encrypt_cbc_zero_iv(&file_key, content)));
        }

        let plain_db = root.join("plain-manifest.db");
        create_manifest_db(&plain_db, &rows);
        let db_bytes = fs::read(&plain_db).unwrap();
        fs::remove_file(&plain_db).unwrap();

        let db_key = SecretKey::new([0xDB; 32]);
        fs::write(root.join(MANIFEST_DB), encrypt_cbc_zero_iv(&db_key, &db_bytes)).unwrap();

        for (file_id, ciphertext) in blobs {
            if file_id == CONTACTS_DB_ID && !include_contacts_blob {
                continue;
            }
            let path = blob_path(root, file_id).unwrap();
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, ciphertext).unwrap();
        }

        let manifest_key = WrappedKey {
            class: CLASS_MANIFEST,
            wrapped: wrap_key(&class_key(CLASS_MANIFEST), db_key.expose()).unwrap(),
        };
        write_manifest_plist(root, true, Some(keybag_bytes(PASSWORD)), Some(manifest_key));
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_decrypt_extracts_targets() {
        let dir = tempfile::tempdir().unwrap();
        build_encrypted_backup(dir.path(), true);

        let outcome = DecryptionEngine::new().decrypt(dir.path(), PASSWORD);
        assert!(outcome.success, "{:?}", outcome.error);
        assert!(outcome.error.is_none());

        let out_dir = outcome.decrypted_path.unwrap();
        assert_eq!(out_dir, dir.path().join(DECRYPTED_DIR));
        assert_eq!(fs::read(out_dir.join("sms.db")).unwrap(), MESSAGES);
        assert_eq!(fs::read(out_dir.join("AddressBook.sqlitedb")).unwrap(), CONTACTS);
        assert_eq!(outcome.decrypted_files.len(), 2);

        // temporary decrypted database is gone
        assert!(!dir.path().join(TEMP_MANIFEST_DB).exists());
    }

    #[test]
    fn test_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        build_encrypted_backup(dir.path(), true);

        let outcome = DecryptionEngine::new().decrypt(dir.path(), "not the password");
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("Incorrect password"));
        assert!(outcome.is_incorrect_password());
        assert!(!dir.path().join(DECRYPTED_DIR).exists());
        assert!(!dir.path().join(TEMP_MANIFEST_DB).exists());
    }

    #[test]
    fn test_missing_manifest_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();

        let outcome = DecryptionEngine::new().decrypt(dir.path(), PASSWORD);
        assert!(!outcome.success);
        assert!(outcome
            .error
            .as_deref()
            .unwrap()
            .contains("Manifest.plist not found"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unencrypted_backup() {
        let dir = tempfile::tempdir().unwrap();
        build_plain_backup(dir.path());

        let outcome = DecryptionEngine::new().decrypt(dir.path(), PASSWORD);
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("not encrypted"));
        assert!(!outcome.is_incorrect_password());
    }

    #[test]
    fn test_partial_extraction_skips_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        build_encrypted_backup(dir.path(), false);

        let outcome = DecryptionEngine::new().decrypt(dir.path(), PASSWORD);
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.decrypted_files.len(), 1);
        let out_dir = outcome.decrypted_path.unwrap();
        assert!(out_dir.join("sms.db").exists());
        assert!(!out_dir.join("AddressBook.sqlitedb").exists());
    }

    #[test]
    fn test_corrupt_metadata_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        build_encrypted_backup_with(dir.path(), true, ContactsRecord::Corrupt);

        let outcome = DecryptionEngine::new().decrypt(dir.path(), PASSWORD);
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.decrypted_files.len(), 1);
        let out_dir = outcome.decrypted_path.unwrap();
        assert_eq!(fs::read(out_dir.join("sms.db")).unwrap(), MESSAGES);
        assert!(!out_dir.join("AddressBook.sqlitedb").exists());
    }

    #[test]
    fn test_missing_class_key_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        build_encrypted_backup_with(dir.path(), true, ContactsRecord::UnknownClass);

        let outcome = DecryptionEngine::new().decrypt(dir.path(), PASSWORD);
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.decrypted_files.len(), 1);
        let out_dir = outcome.decrypted_path.unwrap();
        assert_eq!(fs::read(out_dir.join("sms.db")).unwrap(), MESSAGES);
        assert!(!out_dir.join("AddressBook.sqlitedb").exists());
    }

    #[test]
    fn test_cancelled_decryption_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        build_encrypted_backup(dir.path(), true);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = DecryptionEngine::new().decrypt_cancellable(dir.path(), PASSWORD, &cancel);

        assert!(!outcome.success);
        assert!(outcome.is_cancelled());
        assert!(!outcome.is_incorrect_password());
        assert!(!dir.path().join(DECRYPTED_DIR).exists());
        assert!(!dir.path().join(TEMP_MANIFEST_DB).exists());
    }

    #[test]
    fn test_discard_output_scrubs_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join(DECRYPTED_DIR);
        fs::create_dir(&out_dir).unwrap();
        let written = out_dir.join("sms.db");
        fs::write(&written, MESSAGES).unwrap();

        discard_output(&out_dir, &[written.clone()], true);
        assert!(!written.exists());
        assert!(!out_dir.exists());
    }

    #[test]
    fn test_failure_kind_comes_from_error_variant() {
        let outcome = DecryptionOutcome::failed(&DecryptError::IncorrectPassword);
        assert!(outcome.is_incorrect_password());
        assert_eq!(outcome.failure, Some(DecryptFailure::IncorrectPassword));

        // text mentioning a password is not enough
        let outcome = DecryptionOutcome::failed(&DecryptError::Keybag(
            "Incorrect password field layout".into(),
        ));
        assert!(!outcome.is_incorrect_password());
        assert_eq!(outcome.failure, Some(DecryptFailure::Other));
    }

    #[test]
    fn test_no_targets_found_removes_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        build_encrypted_backup(dir.path(), true);

        let engine = DecryptionEngine::with_targets(vec![DecryptTarget::new(
            "ffffffffffffffffffffffffffffffffffffffff",
            "missing",
        )]);
        let outcome = engine.decrypt(dir.path(), PASSWORD);
        assert!(!outcome.success);
        assert!(!dir.path().join(DECRYPTED_DIR).exists());
    }

    #[test]
    fn test_is_encrypted() {
        let engine = DecryptionEngine::new();

        let missing = tempfile::tempdir().unwrap();
        assert!(!engine.is_encrypted(missing.path()));

        let plain = tempfile::tempdir().unwrap();
        build_plain_backup(plain.path());
        assert!(!engine.is_encrypted(plain.path()));

        let encrypted = tempfile::tempdir().unwrap();
        build_encrypted_backup(encrypted.path(), true);
        assert!(engine.is_encrypted(encrypted.path()));
    }

    #[test]
    fn test_verify_password() {
        let dir = tempfile::tempdir().unwrap();
        build_encrypted_backup(dir.path(), true);

        let engine = DecryptionEngine::new();
        assert!(engine.verify_password(dir.path(), PASSWORD));
        assert!(!engine.verify_password(dir.path(), "wrong"));
        // verification never writes output
        assert!(!dir.path().join(DECRYPTED_DIR).exists());
    }

    #[test]
    fn test_cleanup_scrubs_output() {
        let dir = tempfile::tempdir().unwrap();
        build_encrypted_backup(dir.path(), true);

        let engine = DecryptionEngine::new();
        let outcome = engine.decrypt(dir.path(), PASSWORD);
        let out_dir = outcome.decrypted_path.unwrap();

        assert_eq!(engine.cleanup(&out_dir).unwrap(), 2);
        assert!(!out_dir.exists());
        // second call is a no-op
        assert_eq!(engine.cleanup(&out_dir).unwrap(), 0);
    }

    #[test]
    fn test_scrub_file_zeroes_before_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        fs::write(&path, b"private").unwrap();

        scrub_file(&path).unwrap();
        assert!(!path.exists());
        scrub_file(&path).unwrap();
    }

    #[test]
    fn test_blob_path() {
        let root = Path::new("/backups/x");
        assert_eq!(
            blob_path(root, MESSAGES_DB_ID).unwrap(),
            root.join("3d").join(MESSAGES_DB_ID)
        );
        assert!(blob_path(root, "a").is_none());
    }
}
