//! Cryptographic building blocks for encrypted backups.

pub mod cbc;
pub mod kdf;
pub mod key_wrap;
pub mod keybag;
pub mod secret;

pub use kdf::derive_kek;
pub use key_wrap::{unwrap_key, wrap_key};
pub use keybag::{parse_keybag, Keybag, KeybagItem, KeybagScan, ScanStatus};
pub use secret::{EncryptionKeys, SecretKey};
