//! RFC 3394 AES key wrap over raw AES-256 block operations.
//!
//! One implementation serves all three unwraps in the pipeline: class keys
//! from the keybag, the manifest database key and every per-file key.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256Dec, Aes256Enc, Block};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use super::secret::SecretKey;

/// Initial value from RFC 3394 §2.2.3.1.
pub const DEFAULT_IV: [u8; 8] = [0xA6; 8];

const SEMIBLOCK: usize = 8;
const ROUNDS: u64 = 6;

/// Unwraps `wrapped` with `kek`.
///
/// Returns `None` when the input length is invalid or the integrity check
/// fails. An integrity failure is how an incorrect password shows up, so this
/// never panics or errors.
pub fn unwrap_key(kek: &SecretKey, wrapped: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    if wrapped.len() < 3 * SEMIBLOCK || wrapped.len() % SEMIBLOCK != 0 {
        return None;
    }
    let n = wrapped.len() / SEMIBLOCK - 1;
    let cipher = Aes256Dec::new(kek.expose().into());

    let mut a = [0u8; SEMIBLOCK];
    a.copy_from_slice(&wrapped[..SEMIBLOCK]);
    let mut r = Zeroizing::new(wrapped[SEMIBLOCK..].to_vec());
    let mut block = Block::default();

    for j in (0..ROUNDS).rev() {
        for i in (1..=n).rev() {
            let t = (n as u64) * j + i as u64;
            xor_counter(&mut a, t);

            let ri = &mut r[(i - 1) * SEMIBLOCK..i * SEMIBLOCK];
            block[..SEMIBLOCK].copy_from_slice(&a);
            block[SEMIBLOCK..].copy_from_slice(ri);
            cipher.decrypt_block(&mut block);
            a.copy_from_slice(&block[..SEMIBLOCK]);
            ri.copy_from_slice(&block[SEMIBLOCK..]);
        }
    }
    block.as_mut_slice().zeroize();

    let valid: bool = a[..].ct_eq(&DEFAULT_IV[..]).into();
    a.zeroize();
    if valid {
        Some(r)
    } else {
        None
    }
}

/// Wraps `key` (at least 16 bytes, a multiple of 8) with `kek`.
pub fn wrap_key(kek: &SecretKey, key: &[u8]) -> Option<Vec<u8>> {
    if key.len() < 2 * SEMIBLOCK || key.len() % SEMIBLOCK != 0 {
        return None;
    }
    let n = key.len() / SEMIBLOCK;
    let cipher = Aes256Enc::new(kek.expose().into());

    let mut a = DEFAULT_IV;
    let mut r = Zeroizing::new(key.to_vec());
    let mut block = Block::default();

    for j in 0..ROUNDS {
        for i in 1..=n {
            let ri = &mut r[(i - 1) * SEMIBLOCK..i * SEMIBLOCK];
            block[..SEMIBLOCK].copy_from_slice(&a);
            block[SEMIBLOCK..].copy_from_slice(ri);
            cipher.encrypt_block(&mut block);
            a.copy_from_slice(&block[..SEMIBLOCK]);
            ri.copy_from_slice(&block[SEMIBLOCK..]);

            xor_counter(&mut a, (n as u64) * j + i as u64);
        }
    }
    block.as_mut_slice().zeroize();

    let mut out = Vec::with_capacity(key.len() + SEMIBLOCK);
    out.extend_from_slice(&a);
    out.extend_from_slice(&r);
    Some(out)
}

fn xor_counter(a: &mut [u8; SEMIBLOCK], t: u64) {
    for (byte, counter) in a.iter_mut().zip(t.to_be_bytes()) {
        *byte ^= counter;
    }
}
