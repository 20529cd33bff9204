//! Read-only access to a decrypted `Manifest.db`.
//!
//! Each row of the `Files` table describes one backed-up file. For encrypted
//! backups the `file` column holds an NSKeyedArchiver property list with the
//! file's protection class, size and wrapped per-file key.

use plist::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::io::Cursor;
use std::path::Path;

use super::manifest::WrappedKey;
use crate::utils::errors::DecryptError;

const LOOKUP_SQL: &str =
    "SELECT fileID, domain, relativePath, file FROM Files WHERE fileID = ?1";

/// One row of the `Files` table.
#[derive(Debug, Clone)]
pub struct ManifestDbEntry {
    pub file_id: String,
    pub domain: String,
    pub relative_path: String,
    pub metadata: Vec<u8>,
}

impl ManifestDbEntry {
    /// Final path component of the original file, e.g. `sms.db`.
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.file_id)
    }
}

/// Decoded `file` column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    pub protection_class: Option<u32>,
    pub wrapped_key: Option<WrappedKey>,
    pub size: Option<u64>,
}

impl FileMetadata {
    /// Protection class from the record, falling back to the key's own prefix.
    pub fn class(&self) -> Option<u32> {
        self.protection_class
            .or_else(|| self.wrapped_key.as_ref().map(|key| key.class))
    }
}

pub struct ManifestDb {
    conn: Connection,
}

impl ManifestDb {
    pub fn open(path: &Path) -> Result<Self, DecryptError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Looks up a single file by its identifier (SHA-1 of domain and path).
    pub fn lookup(&self, file_id: &str) -> Result<Option<ManifestDbEntry>, DecryptError> {
        let entry = self
            .conn
            .query_row(LOOKUP_SQL, params![file_id], |row| {
                Ok(ManifestDbEntry {
                    file_id: row.get(0)?,
                    domain: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    relative_path: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    metadata: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                })
            })
            .optional()?;
        Ok(entry)
    }
}

/// Decodes the archived file record stored in the `file` column.
pub fn parse_file_metadata(blob: &[u8]) -> Result<FileMetadata, DecryptError> {
    let archive = Value::from_reader(Cursor::new(blob))?;
    let dict = archive
        .as_dictionary()
        .ok_or(DecryptError::MissingField("archive dictionary"))?;
    let objects = dict
        .get("$objects")
        .and_then(Value::as_array)
        .ok_or(DecryptError::MissingField("$objects"))?;

    let root_index = dict
        .get("$top")
        .and_then(Value::as_dictionary)
        .and_then(|top| top.get("root"))
        .and_then(uid_index)
        .unwrap_or(1);
    let root = objects
        .get(root_index)
        .and_then(Value::as_dictionary)
        .ok_or(DecryptError::MissingField("file record"))?;

    let wrapped_key = root
        .get("EncryptionKey")
        .and_then(|value| resolve(objects, value))
        .and_then(|value| match value {
            Value::Data(data) => Some(data.as_slice()),
            Value::Dictionary(dict) => dict.get("NS.data").and_then(Value::as_data),
            _ => None,
        })
        .and_then(WrappedKey::from_prefixed);

    Ok(FileMetadata {
        protection_class: root
            .get("ProtectionClass")
            .and_then(Value::as_unsigned_integer)
            .and_then(|class| u32::try_from(class).ok()),
        wrapped_key,
        size: root.get("Size").and_then(Value::as_unsigned_integer),
    })
}

fn uid_index(value: &Value) -> Option<usize> {
    match value {
        Value::Uid(uid) => Some(uid.get() as usize),
        _ => None,
    }
}

/// Follows an archiver reference into `$objects`; plain values resolve to themselves.
fn resolve<'a>(objects: &'a [Value], value: &'a Value) -> Option<&'a Value> {
    match uid_index(value) {
        Some(index) => objects.get(index),
        None => Some(value),
    }
}

/// Builds an archived file record the way the device writes it.
#[cfg(test)]
pub(crate) fn encode_file_metadata(
    protection_class: u64,
    wrapped_key: &WrappedKey,
    size: u64,
) -> Vec<u8> {
    use plist::{Dictionary, Uid};

    let mut record = Dictionary::new();
    record.insert("ProtectionClass".into(), Value::Integer(protection_class.into()));
    record.insert("Size".into(), Value::Integer(size.into()));
    record.insert("EncryptionKey".into(), Value::Uid(Uid::new(2)));
    record.insert("$class".into(), Value::Uid(Uid::new(3)));

    let mut key_object = Dictionary::new();
    key_object.insert("NS.data".into(), Value::Data(wrapped_key.to_prefixed()));

    let mut class_object = Dictionary::new();
    class_object.insert("$classname".into(), Value::String("MBFile".into()));

    let objects = vec![
        Value::String("$null".into()),
        Value::Dictionary(record),
        Value::Dictionary(key_object),
        Value::Dictionary(class_object),
    ];

    let mut top = Dictionary::new();
    top.insert("root".into(), Value::Uid(Uid::new(1)));

    let mut archive = Dictionary::new();
    archive.insert("$archiver".into(), Value::String("NSKeyedArchiver".into()));
    archive.insert("$version".into(), Value::Integer(100000.into()));
    archive.insert("$top".into(), Value::Dictionary(top));
    archive.insert("$objects".into(), Value::Array(objects));

    let mut out = Vec::new();
    Value::Dictionary(archive)
        .to_writer_binary(&mut out)
        .expect("binary plist encoding");
    out
}

/// Creates a `Manifest.db` with the `Files` table layout used by backups.
#[cfg(test)]
pub(crate) fn create_manifest_db(path: &Path, rows: &[(&str, &str, &str, Vec<u8>)]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Files (fileID TEXT PRIMARY KEY, domain TEXT, relativePath TEXT, flags INTEGER, file BLOB);",
    )
    .unwrap();
    for (file_id, domain, relative_path, file) in rows {
        conn.execute(
            "INSERT INTO Files (fileID, domain, relativePath, flags, file) VALUES (?1, ?2, ?3, 1, ?4)",
            params![file_id, domain, relative_path, file],
        )
        .unwrap();
    }
}
