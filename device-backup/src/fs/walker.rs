//! Directory traversal over backup trees.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Files whose presence marks a directory as a device backup.
pub const BACKUP_MARKERS: &[&str] = &["Info.plist", "Manifest.plist"];

/// Total size of all regular files under `root`.
///
/// Entries that vanish or cannot be read mid-walk are skipped; a backup being
/// written or deleted concurrently must not fail the whole count.
pub fn directory_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Whether `dir` holds one of the [`BACKUP_MARKERS`].
pub fn is_backup_dir(dir: &Path) -> bool {
    BACKUP_MARKERS.iter().any(|marker| dir.join(marker).is_file())
}

/// Finds backup directories at most `max_depth` levels below `root`.
///
/// The walk does not descend into a backup once found.
pub fn find_backup_dirs(root: &Path, max_depth: usize) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        if is_backup_dir(entry.path()) {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }

    found
}
