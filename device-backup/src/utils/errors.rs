//! Error types for the backup core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the orchestrator, the catalog and configuration loading.
///
/// Expected operational failures (wrong password, locked device, ...) are not
/// errors at this level: they come back as a failed `BackupResult` carrying a
/// [`BackupErrorCode`].
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup already in progress")]
    AlreadyRunning,

    #[error("Cannot delete backup outside of backup directory")]
    OutsideBackupRoot,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Internal failures of the decryption pipeline.
///
/// These never cross the public boundary of the decryption engine; they are
/// rendered into the `error` string of a `DecryptionOutcome`.
#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("Manifest.plist not found at {0}")]
    ManifestNotFound(String),

    #[error("Backup is not encrypted")]
    NotEncrypted,

    #[error("Incorrect password")]
    IncorrectPassword,

    #[error("Manifest is missing {0}")]
    MissingField(&'static str),

    #[error("Keybag error: {0}")]
    Keybag(String),

    #[error("{0} is not listed in Manifest.db")]
    NotInManifest(String),

    #[error("No class key for protection class {0}")]
    MissingClassKey(u32),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Property list error: {0}")]
    Plist(#[from] plist::Error),

    #[error("Manifest database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("None of the requested files could be decrypted")]
    NothingExtracted,

    #[error("Decryption cancelled")]
    Cancelled,
}

/// Stable failure categories reported in a `BackupResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupErrorCode {
    PasswordRequired,
    IncorrectPassword,
    DecryptionFailed,
    DeviceNotFound,
    DeviceLocked,
    DeviceNotTrusted,
    DeviceDisconnected,
    InsufficientSpace,
    BackupCancelled,
    UnknownError,
}

impl BackupErrorCode {
    /// Short, actionable message shown to the user for this category.
    pub fn user_message(&self) -> &'static str {
        match self {
            BackupErrorCode::PasswordRequired => {
                "This device encrypts its backups. Enter the backup password to continue."
            }
            BackupErrorCode::IncorrectPassword => {
                "Incorrect backup password. Check the password and try again."
            }
            BackupErrorCode::DecryptionFailed => {
                "The backup completed but could not be decrypted."
            }
            BackupErrorCode::DeviceNotFound => {
                "No device found. Connect the device with a cable and try again."
            }
            BackupErrorCode::DeviceLocked => "The device is locked. Unlock it and try again.",
            BackupErrorCode::DeviceNotTrusted => {
                "This computer is not trusted. Unlock the device and tap \"Trust\"."
            }
            BackupErrorCode::DeviceDisconnected => {
                "The device was disconnected during the backup. Reconnect it and try again."
            }
            BackupErrorCode::InsufficientSpace => {
                "Not enough disk space to store the backup. Free up space and try again."
            }
            BackupErrorCode::BackupCancelled => "Backup cancelled.",
            BackupErrorCode::UnknownError => "The backup failed for an unknown reason.",
        }
    }

    /// Wire name, e.g. `PASSWORD_REQUIRED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupErrorCode::PasswordRequired => "PASSWORD_REQUIRED",
            BackupErrorCode::IncorrectPassword => "INCORRECT_PASSWORD",
            BackupErrorCode::DecryptionFailed => "DECRYPTION_FAILED",
            BackupErrorCode::DeviceNotFound => "DEVICE_NOT_FOUND",
            BackupErrorCode::DeviceLocked => "DEVICE_LOCKED",
            BackupErrorCode::DeviceNotTrusted => "DEVICE_NOT_TRUSTED",
            BackupErrorCode::DeviceDisconnected => "DEVICE_DISCONNECTED",
            BackupErrorCode::InsufficientSpace => "INSUFFICIENT_SPACE",
            BackupErrorCode::BackupCancelled => "BACKUP_CANCELLED",
            BackupErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for BackupErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(BackupError::AlreadyRunning.to_string(), "Backup already in progress");
        assert_eq!(
            BackupError::OutsideBackupRoot.to_string(),
            "Cannot delete backup outside of backup directory"
        );
        assert_eq!(DecryptError::IncorrectPassword.to_string(), "Incorrect password");
        assert!(DecryptError::ManifestNotFound("/x".into())
            .to_string()
            .contains("Manifest.plist not found"));
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&BackupErrorCode::PasswordRequired).unwrap();
        assert_eq!(json, "\"PASSWORD_REQUIRED\"");
        let code: BackupErrorCode = serde_json::from_str("\"INSUFFICIENT_SPACE\"").unwrap();
        assert_eq!(code, BackupErrorCode::InsufficientSpace);
        assert_eq!(code.to_string(), "INSUFFICIENT_SPACE");
    }
}
