//! Device Backup Library
//!
//! Drives an external device backup tool, tracks its progress and decrypts
//! selected files from encrypted backups.

pub mod catalog;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod decrypt;
pub mod events;
pub mod executor;
pub mod fs;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use catalog::{BackupCatalog, BackupInfo};
pub use config::Config;
pub use decrypt::{DecryptionEngine, DecryptionOutcome};
pub use events::{BackupEvent, EventBus};
pub use executor::{BackupOptions, BackupOrchestrator, BackupResult};
pub use transfer::progress::{BackupPhase, BackupProgress};
pub use utils::errors::{BackupError, BackupErrorCode, DecryptError};
pub type Result<T> = std::result::Result<T, BackupError>;
