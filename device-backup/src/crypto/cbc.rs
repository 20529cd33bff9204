//! AES-256-CBC decryption with a zero IV and manual PKCS#7 unpadding.
//!
//! Both the manifest database and every file blob in an encrypted backup use
//! this scheme. The IV is fixed at zero by the backup format.

use std::io::{Read, Write};

use aes::cipher::{BlockDecrypt, KeyInit};
use aes::{Aes256Dec, Block};
use zeroize::{Zeroize, Zeroizing};

use super::secret::SecretKey;
use crate::utils::errors::DecryptError;

pub const BLOCK_LEN: usize = 16;

const CHUNK_LEN: usize = 64 * 1024;

/// Decrypts `reader` into `writer`, returning the number of plaintext bytes written.
///
/// With `plaintext_len` set (the size recorded in the file metadata), output
/// is truncated to that length instead of stripping padding.
pub fn decrypt_cbc_stream<R, W>(
    key: &SecretKey,
    reader: &mut R,
    writer: &mut W,
    plaintext_len: Option<u64>,
) -> Result<u64, DecryptError>
where
    R: Read,
    W: Write,
{
    let cipher = Aes256Dec::new(key.expose().into());
    let mut previous = [0u8; BLOCK_LEN];
    let mut pending: Option<[u8; BLOCK_LEN]> = None;
    let mut plain = [0u8; BLOCK_LEN];
    let mut block = Block::default();
    let mut buffer = vec![0u8; CHUNK_LEN];
    let mut filled = 0usize;
    let mut written = 0u64;

    loop {
        let n = reader.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        let whole = filled - filled % BLOCK_LEN;

        for chunk in buffer[..whole].chunks_exact(BLOCK_LEN) {
            block.copy_from_slice(chunk);
            cipher.decrypt_block(&mut block);
            for (out, (decrypted, prev)) in plain.iter_mut().zip(block.iter().zip(previous.iter())) {
                *out = decrypted ^ prev;
            }
            previous.copy_from_slice(chunk);

            if let Some(mut ready) = pending.replace(plain) {
                written += write_limited(writer, &ready, plaintext_len, written)?;
                ready.zeroize();
            }
        }

        buffer.copy_within(whole..filled, 0);
        filled -= whole;
    }

    plain.zeroize();
    block.as_mut_slice().zeroize();

    if filled != 0 {
        if let Some(mut last) = pending {
            last.zeroize();
        }
        return Err(DecryptError::Crypto(
            "ciphertext length is not a multiple of the AES block size".into(),
        ));
    }

    if let Some(mut last) = pending {
        let result = match plaintext_len {
            Some(_) => write_limited(writer, &last, plaintext_len, written),
            None => pkcs7_unpadded_len(&last)
                .and_then(|len| writer.write_all(&last[..len]).map(|_| len as u64).map_err(Into::into)),
        };
        last.zeroize();
        written += result?;
    }

    writer.flush()?;
    Ok(written)
}

/// Decrypts an in-memory buffer, stripping PKCS#7 padding.
pub fn decrypt_cbc_zero_iv(key: &SecretKey, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    let mut out = Zeroizing::new(Vec::with_capacity(ciphertext.len()));
    let mut reader = ciphertext;
    decrypt_cbc_stream(key, &mut reader, &mut *out, None)?;
    Ok(out)
}

/// Writes `block`, never exceeding `limit` total bytes. Returns bytes written.
fn write_limited<W: Write>(
    writer: &mut W,
    block: &[u8; BLOCK_LEN],
    limit: Option<u64>,
    already_written: u64,
) -> Result<u64, DecryptError> {
    let take = match limit {
        Some(limit) => limit.saturating_sub(already_written).min(BLOCK_LEN as u64) as usize,
        None => BLOCK_LEN,
    };
    writer.write_all(&block[..take])?;
    Ok(take as u64)
}

/// Length of the final block once its PKCS#7 padding is removed.
fn pkcs7_unpadded_len(last: &[u8; BLOCK_LEN]) -> Result<usize, DecryptError> {
    let pad = last[BLOCK_LEN - 1] as usize;
    if pad == 0 || pad > BLOCK_LEN {
        return Err(DecryptError::Crypto("invalid PKCS#7 padding".into()));
    }
    if last[BLOCK_LEN - pad..].iter().any(|&b| b as usize != pad) {
        return Err(DecryptError::Crypto("invalid PKCS#7 padding".into()));
    }
    Ok(BLOCK_LEN - pad)
}

/// Zero-IV AES-256-CBC encryption with PKCS#7 padding, for building fixtures.
#[cfg(test)]
pub(crate) fn encrypt_cbc_zero_iv(key: &SecretKey, plaintext: &[u8]) -> Vec<u8> {
    use aes::cipher::BlockEncrypt;
    use aes::Aes256Enc;

    let cipher = Aes256Enc::new(key.expose().into());
    let pad = BLOCK_LEN - plaintext.len() % BLOCK_LEN;
    let mut padded = plaintext.to_vec();
    padded.extend(std::iter::repeat(pad as u8).take(pad));

    let mut previous = [0u8; BLOCK_LEN];
    let mut out = Vec::with_capacity(padded.len());
    for chunk in padded.chunks_exact(BLOCK_LEN) {
        let mut block = Block::default();
        for (b, (p, prev)) in block.iter_mut().zip(chunk.iter().zip(previous.iter())) {
            *b = p ^ prev;
        }
        cipher.encrypt_block(&mut block);
        previous.copy_from_slice(&block);
        out.extend_from_slice(&block);
    }
    out
}
