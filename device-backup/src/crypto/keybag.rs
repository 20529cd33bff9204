//! Backup keybag decoding.
//!
//! The keybag stored in `Manifest.plist` is a flat stream of records: a 4-byte
//! ASCII tag, a 4-byte big-endian length and that many value bytes. The first
//! records describe the keybag itself (UUID, salts, iteration counts); the
//! rest describe one wrapped key per protection class.

use std::collections::BTreeMap;
use tracing::warn;

use crate::utils::errors::DecryptError;

const HEADER_LEN: usize = 8;

/// Bit in `WRAP` meaning the class key is wrapped with the password-derived key.
pub const WRAP_PASSCODE: u32 = 0x2;

/// Parsed keybag: container parameters plus one item per protection class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keybag {
    pub version: Option<u32>,
    pub uuid: Option<Vec<u8>>,
    pub kind: Option<u32>,
    pub hmac_key: Option<Vec<u8>>,
    pub wrap: Option<u32>,
    pub salt: Option<Vec<u8>>,
    pub iterations: Option<u32>,
    pub double_protection_wrap: Option<u32>,
    pub double_protection_iterations: Option<u32>,
    pub double_protection_salt: Option<Vec<u8>>,
    pub class_keys: BTreeMap<u32, KeybagItem>,
}

/// One protection class entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeybagItem {
    pub uuid: Option<Vec<u8>>,
    pub class: Option<u32>,
    pub wrap: Option<u32>,
    pub key_type: Option<u32>,
    pub wrapped_key: Option<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    pub salt: Option<Vec<u8>>,
    pub iterations: Option<u32>,
}

/// How the record scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Complete,
    /// A record header or value ran past the end of the buffer at `offset`.
    Truncated { offset: usize },
}

/// Result of [`parse_keybag`]: whatever was decoded, plus how the scan ended.
#[derive(Debug, Clone)]
pub struct KeybagScan {
    pub keybag: Keybag,
    pub status: ScanStatus,
}

impl KeybagScan {
    /// Rejects a truncated buffer.
    pub fn into_complete(self) -> Result<Keybag, DecryptError> {
        match self.status {
            ScanStatus::Complete => Ok(self.keybag),
            ScanStatus::Truncated { offset } => Err(DecryptError::Keybag(format!(
                "record truncated at offset {}",
                offset
            ))),
        }
    }

    /// Keeps the records decoded before a truncation.
    pub fn tolerate_truncation(self) -> Keybag {
        if let ScanStatus::Truncated { offset } = self.status {
            warn!(
                "Keybag ends mid-record at offset {}, using {} decoded class key(s)",
                offset,
                self.keybag.class_keys.len()
            );
        }
        self.keybag
    }
}

/// A single TLV record borrowed from the buffer.
struct Record<'a> {
    tag: &'a [u8],
    value: &'a [u8],
}

/// Returns the record starting at `offset` and the offset after it, or the
/// truncation status when the buffer is too short.
fn read_record(data: &[u8], offset: usize) -> Result<(Record<'_>, usize), ScanStatus> {
    let truncated = ScanStatus::Truncated { offset };
    let header_end = offset.checked_add(HEADER_LEN).ok_or(truncated)?;
    let header = data.get(offset..header_end).ok_or(truncated)?;

    let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let value_end = header_end.checked_add(length).ok_or(truncated)?;
    let value = data.get(header_end..value_end).ok_or(truncated)?;

    Ok((
        Record {
            tag: &header[..4],
            value,
        },
        value_end,
    ))
}

/// Big-endian unsigned value of up to 4 bytes. Longer values keep the low 32 bits.
fn be_u32(value: &[u8]) -> u32 {
    value.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

/// Decodes a keybag buffer.
///
/// Never fails: a buffer that ends mid-record yields the records decoded so
/// far with [`ScanStatus::Truncated`].
pub fn parse_keybag(data: &[u8]) -> KeybagScan {
    let mut keybag = Keybag::default();
    let mut current: Option<KeybagItem> = None;
    let mut offset = 0usize;
    let mut status = ScanStatus::Complete;

    while offset < data.len() {
        let (record, next) = match read_record(data, offset) {
            Ok(parsed) => parsed,
            Err(truncated) => {
                status = truncated;
                break;
            }
        };
        offset = next;

        match record.tag {
            b"CLAS" => {
                let class = be_u32(record.value);
                match current.as_mut() {
                    // An item opened by its UUID receives its class here.
                    Some(item) if item.class.is_none() => item.class = Some(class),
                    _ => {
                        flush_item(&mut keybag, current.take());
                        current = Some(KeybagItem {
                            class: Some(class),
                            ..KeybagItem::default()
                        });
                    }
                }
            }
            b"UUID" if keybag.uuid.is_none() && current.is_none() => {
                keybag.uuid = Some(record.value.to_vec());
            }
            b"UUID" => {
                flush_item(&mut keybag, current.take());
                current = Some(KeybagItem {
                    uuid: Some(record.value.to_vec()),
                    ..KeybagItem::default()
                });
            }
            tag => match current.as_mut() {
                Some(item) => apply_item_tag(item, tag, record.value),
                None => apply_keybag_tag(&mut keybag, tag, record.value),
            },
        }
    }

    flush_item(&mut keybag, current.take());

    KeybagScan { keybag, status }
}

fn apply_keybag_tag(keybag: &mut Keybag, tag: &[u8], value: &[u8]) {
    match tag {
        b"VERS" => keybag.version = Some(be_u32(value)),
        b"TYPE" => keybag.kind = Some(be_u32(value)),
        b"HMCK" => keybag.hmac_key = Some(value.to_vec()),
        b"WRAP" => keybag.wrap = Some(be_u32(value)),
        b"SALT" => keybag.salt = Some(value.to_vec()),
        b"ITER" => keybag.iterations = Some(be_u32(value)),
        b"DPWT" => keybag.double_protection_wrap = Some(be_u32(value)),
        b"DPIC" => keybag.double_protection_iterations = Some(be_u32(value)),
        b"DPSL" => keybag.double_protection_salt = Some(value.to_vec()),
        _ => {}
    }
}

fn apply_item_tag(item: &mut KeybagItem, tag: &[u8], value: &[u8]) {
    match tag {
        b"WRAP" => item.wrap = Some(be_u32(value)),
        b"KTYP" => item.key_type = Some(be_u32(value)),
        b"WPKY" => item.wrapped_key = Some(value.to_vec()),
        b"PBKY" => item.public_key = Some(value.to_vec()),
        b"SALT" => item.salt = Some(value.to_vec()),
        b"ITER" => item.iterations = Some(be_u32(value)),
        _ => {}
    }
}

/// Stores a finished item. Items without a wrapped key (asymmetric-only) or
/// without a class number cannot be unwrapped and are dropped.
fn flush_item(keybag: &mut Keybag, item: Option<KeybagItem>) {
    let Some(item) = item else { return };
    if let (Some(class), true) = (item.class, item.wrapped_key.is_some()) {
        keybag.class_keys.insert(class, item);
    }
}

/// Serialises one TLV record. Used to build keybags in tests.
#[cfg(test)]
pub(crate) fn encode_record(out: &mut Vec<u8>, tag: &[u8; 4], value: &[u8]) {
    out.extend_from_slice(tag);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_keybag() -> Vec<u8> {
        let mut data = Vec::new();
        encode_record(&mut data, b"VERS", &3u32.to_be_bytes());
        encode_record(&mut data, b"TYPE", &1u32.to_be_bytes());
        encode_record(&mut data, b"UUID", &[0x11; 16]);
        encode_record(&mut data, b"HMCK", &[0x22; 40]);
        encode_record(&mut data, b"WRAP", &0u32.to_be_bytes());
        encode_record(&mut data, b"SALT", &[0x33; 20]);
        encode_record(&mut data, b"ITER", &10_000u32.to_be_bytes());
        encode_record(&mut data, b"DPWT", &1u32.to_be_bytes());
        encode_record(&mut data, b"DPIC", &10_000_000u32.to_be_bytes());
        encode_record(&mut data, b"DPSL", &[0x44; 20]);

        // class 1, symmetric
        encode_record(&mut data, b"UUID", &[0x01; 16]);
        encode_record(&mut data, b"CLAS", &1u32.to_be_bytes());
        encode_record(&mut data, b"WRAP", &3u32.to_be_bytes());
        encode_record(&mut data, b"KTYP", &0u32.to_be_bytes());
        encode_record(&mut data, b"WPKY", &[0xA1; 40]);

        // class 2, asymmetric only
        encode_record(&mut data, b"UUID", &[0x02; 16]);
        encode_record(&mut data, b"CLAS", &2u32.to_be_bytes());
        encode_record(&mut data, b"WRAP", &3u32.to_be_bytes());
        encode_record(&mut data, b"KTYP", &1u32.to_be_bytes());
        encode_record(&mut data, b"PBKY", &[0xB2; 32]);

        // class 3, symmetric
        encode_record(&mut data, b"UUID", &[0x03; 16]);
        encode_record(&mut data, b"CLAS", &3u32.to_be_bytes());
        encode_record(&mut data, b"WRAP", &3u32.to_be_bytes());
        encode_record(&mut data, b"WPKY", &[0xA3; 40]);
        data
    }

    #[test]
    fn test_parse_top_level_fields() {
        let keybag = parse_keybag(&sample_keybag()).into_complete().unwrap();

        assert_eq!(keybag.version, Some(3));
        assert_eq!(keybag.kind, Some(1));
        assert_eq!(keybag.uuid.as_deref(), Some(&[0x11; 16][..]));
        assert_eq!(keybag.hmac_key.as_ref().map(Vec::len), Some(40));
        assert_eq!(keybag.salt.as_deref(), Some(&[0x33; 20][..]));
        assert_eq!(keybag.iterations, Some(10_000));
        assert_eq!(keybag.double_protection_wrap, Some(1));
        assert_eq!(keybag.double_protection_iterations, Some(10_000_000));
        assert_eq!(keybag.double_protection_salt.as_deref(), Some(&[0x44; 20][..]));
    }

    #[test]
    fn test_parse_class_items() {
        let keybag = parse_keybag(&sample_keybag()).into_complete().unwrap();

        // class 2 has no wrapped key and is discarded
        assert_eq!(keybag.class_keys.keys().copied().collect::<Vec<_>>(), vec![1, 3]);

        let first = &keybag.class_keys[&1];
        assert_eq!(first.uuid.as_deref(), Some(&[0x01; 16][..]));
        assert_eq!(first.wrap, Some(3));
        assert_eq!(first.key_type, Some(0));
        assert_eq!(first.wrapped_key.as_deref(), Some(&[0xA1; 40][..]));

        let third = &keybag.class_keys[&3];
        assert_eq!(third.uuid.as_deref(), Some(&[0x03; 16][..]));
        assert_eq!(third.wrapped_key.as_deref(), Some(&[0xA3; 40][..]));
    }

    #[test]
    fn test_clas_without_uuid_starts_new_item() {
        let mut data = Vec::new();
        encode_record(&mut data, b"UUID", &[0x11; 16]);
        encode_record(&mut data, b"CLAS", &5u32.to_be_bytes());
        encode_record(&mut data, b"WPKY", &[0x05; 40]);
        encode_record(&mut data, b"CLAS", &6u32.to_be_bytes());
        encode_record(&mut data, b"WPKY", &[0x06; 40]);

        let keybag = parse_keybag(&data).into_complete().unwrap();
        assert_eq!(keybag.uuid.as_deref(), Some(&[0x11; 16][..]));
        assert_eq!(keybag.class_keys.len(), 2);
        assert_eq!(keybag.class_keys[&6].wrapped_key.as_deref(), Some(&[0x06; 40][..]));
    }

    #[test]
    fn test_truncated_value_is_reported() {
        let mut data = sample_keybag();
        let full_len = data.len();
        encode_record(&mut data, b"UUID", &[0x04; 16]);
        encode_record(&mut data, b"CLAS", &4u32.to_be_bytes());
        // declares 40 bytes but only 10 follow
        data.extend_from_slice(b"WPKY");
        data.extend_from_slice(&40u32.to_be_bytes());
        data.extend_from_slice(&[0xA4; 10]);

        let scan = parse_keybag(&data);
        let wpky_offset = full_len + (8 + 16) + (8 + 4);
        assert_eq!(scan.status, ScanStatus::Truncated { offset: wpky_offset });
        assert!(scan.clone().into_complete().is_err());

        let keybag = scan.tolerate_truncation();
        assert_eq!(keybag.class_keys.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_truncated_header_is_reported() {
        let mut data = Vec::new();
        encode_record(&mut data, b"TYPE", &1u32.to_be_bytes());
        data.extend_from_slice(b"SAL");

        let scan = parse_keybag(&data);
        assert_eq!(scan.status, ScanStatus::Truncated { offset: 12 });
        assert_eq!(scan.keybag.kind, Some(1));
    }

    #[test]
    fn test_empty_buffer() {
        let scan = parse_keybag(&[]);
        assert_eq!(scan.status, ScanStatus::Complete);
        assert!(scan.keybag.class_keys.is_empty());
    }

    #[test]
    fn test_huge_length_does_not_overflow() {
        let mut data = Vec::new();
        data.extend_from_slice(b"WPKY");
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        let scan = parse_keybag(&data);
        assert_eq!(scan.status, ScanStatus::Truncated { offset: 0 });
    }
}
