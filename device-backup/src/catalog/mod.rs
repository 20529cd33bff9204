//! Catalog of backups stored under the backup root.
//!
//! A backup is any directory holding `Info.plist` or `Manifest.plist`, at
//! most two levels below the root (`<root>/<udid>` or
//! `<root>/<output>/<udid>`).

use crate::decrypt::manifest::read_manifest;
use crate::fs::walker::{directory_size, find_backup_dirs};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use plist::{Dictionary, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

pub const INFO_PLIST: &str = "Info.plist";
pub const STATUS_PLIST: &str = "Status.plist";

const SCAN_DEPTH: usize = 2;
const DELETE_ATTEMPTS: u32 = 3;
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// One backup found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub is_encrypted: bool,
    pub ios_version: Option<String>,
    pub device_name: Option<String>,
}

impl BackupInfo {
    /// Reads what the backup's property lists say about it. Unreadable or
    /// missing files leave the corresponding fields empty.
    pub fn read(dir: &Path) -> Self {
        let info = read_dictionary(&dir.join(INFO_PLIST));
        let status = read_dictionary(&dir.join(STATUS_PLIST));
        let manifest = read_manifest(dir).ok();

        let info_str = |key: &str| {
            info.as_ref()
                .and_then(|d| d.get(key))
                .and_then(Value::as_string)
                .map(str::to_string)
        };

        let device_id = info_str("Unique Identifier")
            .or_else(|| manifest.as_ref().and_then(|m| m.unique_device_id.clone()))
            .or_else(|| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();

        let created_at = info
            .as_ref()
            .and_then(|d| date_field(d, "Last Backup Date"))
            .or_else(|| status.as_ref().and_then(|d| date_field(d, "Date")))
            .or_else(|| dir.metadata().and_then(|m| m.modified()).ok())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        Self {
            path: dir.to_path_buf(),
            device_id,
            created_at,
            size_bytes: directory_size(dir),
            is_encrypted: manifest.as_ref().is_some_and(|m| m.is_encrypted),
            ios_version: info_str("Product Version")
                .or_else(|| manifest.as_ref().and_then(|m| m.product_version.clone())),
            device_name: info_str("Device Name")
                .or_else(|| manifest.as_ref().and_then(|m| m.device_name.clone())),
        }
    }
}

fn read_dictionary(path: &Path) -> Option<Dictionary> {
    if !path.is_file() {
        return None;
    }
    match Value::from_file(path) {
        Ok(Value::Dictionary(dict)) => Some(dict),
        Ok(_) => {
            debug!("{} is not a dictionary", path.display());
            None
        }
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            None
        }
    }
}

fn date_field(dict: &Dictionary, key: &str) -> Option<SystemTime> {
    dict.get(key)
        .and_then(Value::as_date)
        .map(SystemTime::from)
}

/// Lists, deletes and prunes backups below one root directory.
#[derive(Debug, Clone)]
pub struct BackupCatalog {
    root: PathBuf,
}

impl BackupCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All backups under the root, newest first.
    pub fn list_backups(&self) -> Vec<BackupInfo> {
        let mut backups: Vec<BackupInfo> = find_backup_dirs(&self.root, SCAN_DEPTH)
            .iter()
            .map(|dir| BackupInfo::read(dir))
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        backups
    }

    /// Removes a backup directory, refusing anything not strictly inside the
    /// root.
    ///
    /// Removal is retried a few times since a cancelled backup tool may still
    /// be releasing files.
    pub async fn delete_backup(&self, path: &Path) -> Result<()> {
        let target = self.contained_path(path)?;

        let mut attempt = 1;
        loop {
            match tokio::fs::remove_dir_all(&target).await {
                Ok(()) => {
                    info!("Deleted backup {}", target.display());
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound && attempt > 1 => return Ok(()),
                Err(e) if attempt < DELETE_ATTEMPTS && e.kind() != io::ErrorKind::NotFound => {
                    debug!(
                        "Deleting {} failed (attempt {}): {}",
                        target.display(),
                        attempt,
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(DELETE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Keeps the newest `keep` backups of each device and deletes the rest.
    /// Returns the deleted paths.
    pub async fn cleanup_old_backups(&self, keep: usize) -> Vec<PathBuf> {
        let mut by_device: BTreeMap<String, Vec<BackupInfo>> = BTreeMap::new();
        for backup in self.list_backups() {
            by_device
                .entry(backup.device_id.clone())
                .or_default()
                .push(backup);
        }

        let mut deleted = Vec::new();
        for (device_id, mut backups) in by_device {
            backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            for backup in backups.into_iter().skip(keep) {
                match self.delete_backup(&backup.path).await {
                    Ok(()) => deleted.push(backup.path),
                    Err(e) => warn!(
                        "Failed to delete old backup {} of {}: {}",
                        backup.path.display(),
                        device_id,
                        e
                    ),
                }
            }
        }

        if !deleted.is_empty() {
            info!("Removed {} old backup(s)", deleted.len());
        }
        deleted
    }

    /// Resolves `path` and checks that it lies strictly below the root.
    fn contained_path(&self, path: &Path) -> Result<PathBuf> {
        let root = self.root.canonicalize().unwrap_or_else(|_| normalize(&self.root));
        let target = path.canonicalize().unwrap_or_else(|_| normalize(path));

        if target == root || !target.starts_with(&root) {
            warn!("Refusing to delete {} outside {}", path.display(), root.display());
            return Err(BackupError::OutsideBackupRoot);
        }
        Ok(target)
    }
}

/// Lexically resolves `.` and `..` for paths that do not exist.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decrypt::test_support::build_encrypted_backup;
    use std::fs;

    fn write_backup(dir: &Path, udid: &str, name: &str, days_ago: u64) {
        fs::create_dir_all(dir).unwrap();
        let date = SystemTime::now() - Duration::from_secs(days_ago * 86_400);

        let mut info = Dictionary::new();
        info.insert("Unique Identifier".into(), Value::String(udid.into()));
        info.insert("Device Name".into(), Value::String(name.into()));
        info.insert("Product Version".into(), Value::String("17.4".into()));
        info.insert("Last Backup Date".into(), Value::Date(date.into()));
        Value::Dictionary(info)
            .to_file_xml(dir.join(INFO_PLIST))
            .unwrap();
    }

    #[test]
    fn test_list_backups() {
        let root = tempfile::tempdir().unwrap();
        write_backup(&root.path().join("aaa"), "aaa", "Phone", 2);
        write_backup(&root.path().join("out/bbb"), "bbb", "Pad", 1);
        build_encrypted_backup(&root.path().join("ccc"), false);
        fs::create_dir_all(root.path().join("not-a-backup")).unwrap();

        let backups = catalog(root.path()).list_backups();
        assert_eq!(backups.len(), 3);

        let aaa = backups.iter().find(|b| b.device_id == "aaa").unwrap();
        assert_eq!(aaa.device_name.as_deref(), Some("Phone"));
        assert_eq!(aaa.ios_version.as_deref(), Some("17.4"));
        assert!(!aaa.is_encrypted);
        assert!(aaa.size_bytes > 0);

        let bbb_index = backups.iter().position(|b| b.device_id == "bbb").unwrap();
        let aaa_index = backups.iter().position(|b| b.device_id == "aaa").unwrap();
        assert!(bbb_index < aaa_index);

        assert!(backups.iter().any(|b| b.is_encrypted));
    }

    #[test]
    fn test_list_tolerates_corrupt_plists() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("broken");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(INFO_PLIST), b"not a plist").unwrap();

        let backups = catalog(root.path()).list_backups();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].device_id, "broken");
        assert_eq!(backups[0].device_name, None);
    }

    fn catalog(root: &Path) -> BackupCatalog {
        BackupCatalog::new(root)
    }

    #[tokio::test]
    async fn test_delete_outside_root_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        write_backup(&elsewhere.path().join("xyz"), "xyz", "Phone", 0);

        let catalog = catalog(root.path());
        let err = catalog
            .delete_backup(&elsewhere.path().join("xyz"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot delete backup outside of backup directory");
        assert!(elsewhere.path().join("xyz").exists());

        let sneaky = root.path().join("..").join(elsewhere.path().file_name().unwrap());
        assert!(matches!(
            catalog.delete_backup(&sneaky).await,
            Err(BackupError::OutsideBackupRoot)
        ));
        assert!(matches!(
            catalog.delete_backup(root.path()).await,
            Err(BackupError::OutsideBackupRoot)
        ));
        assert!(root.path().exists());
    }

    #[tokio::test]
    async fn test_delete_inside_root() {
        let root = tempfile::tempdir().unwrap();
        write_backup(&root.path().join("abc"), "abc", "Phone", 0);

        catalog(root.path())
            .delete_backup(&root.path().join("abc"))
            .await
            .unwrap();
        assert!(!root.path().join("abc").exists());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest_per_device() {
        let root = tempfile::tempdir().unwrap();
        write_backup(&root.path().join("old"), "device-1", "Phone", 5);
        write_backup(&root.path().join("new"), "device-1", "Phone", 1);
        write_backup(&root.path().join("other"), "device-2", "Pad", 9);

        let deleted = catalog(root.path()).cleanup_old_backups(1).await;

        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with("old"));
        assert!(!root.path().join("old").exists());
        assert!(root.path().join("new").exists());
        assert!(root.path().join("other").exists());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
    }
}
