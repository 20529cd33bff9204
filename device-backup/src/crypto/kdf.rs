//! Password → key encryption key derivation.
//!
//! Backups use two chained PBKDF2 rounds: PBKDF2-HMAC-SHA256 over the
//! password with the double-protection salt and iteration count, then
//! PBKDF2-HMAC-SHA1 over that intermediate key with the keybag salt.

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use super::keybag::Keybag;
use super::secret::{SecretKey, KEY_LEN};

/// Salt used when the keybag carries none.
const DEFAULT_SALT: [u8; 20] = [0u8; 20];

/// Iterations of the SHA-256 round when `DPIC` is absent.
pub const DEFAULT_DOUBLE_PROTECTION_ITERATIONS: u32 = 10_000;

/// Iterations of the SHA-1 round when `ITER` is absent.
pub const DEFAULT_ITERATIONS: u32 = 1;

/// Derives the key encryption key for `keybag` from `password`.
pub fn derive_kek(password: &str, keybag: &Keybag) -> SecretKey {
    let outer_salt = keybag
        .double_protection_salt
        .as_deref()
        .or(keybag.salt.as_deref())
        .unwrap_or(&DEFAULT_SALT);
    let outer_iterations = keybag
        .double_protection_iterations
        .unwrap_or(DEFAULT_DOUBLE_PROTECTION_ITERATIONS)
        .max(1);

    let inner_salt = keybag.salt.as_deref().unwrap_or(&DEFAULT_SALT);
    let inner_iterations = keybag.iterations.unwrap_or(DEFAULT_ITERATIONS).max(1);

    let mut intermediate = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        outer_salt,
        outer_iterations,
        &mut intermediate[..],
    );

    let mut kek = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha1>(&intermediate[..], inner_salt, inner_iterations, &mut kek);
    let key = SecretKey::new(kek);
    kek.zeroize();
    key
}
