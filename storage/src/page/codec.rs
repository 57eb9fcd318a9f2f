//! Byte-exact page serialization.
//!
//! A serialized page is `PAGE_SIZE` bytes: the 32-byte header followed by the
//! payload. Every multi-byte field is little-endian. The checksum is CRC-32
//! (IEEE) over the whole buffer with the checksum field read as zero.

use bytes::{Buf, BufMut};

use super::{Page, PageHeader, PageId, PAGE_HEADER_SIZE, PAGE_MAGIC, PAGE_SIZE, PAGE_VERSION, PAYLOAD_SIZE};
use crate::{Result, StorageError};

/// Byte offset of the checksum field within a serialized page.
pub const CHECKSUM_OFFSET: usize = 22;

const CHECKSUM_LEN: usize = 4;

/// Padding from the end of the checksum field to the end of the header.
const RESERVED_LEN: usize = PAGE_HEADER_SIZE - CHECKSUM_OFFSET - CHECKSUM_LEN;

/// Serializes a header and payload into a fresh `PAGE_SIZE` buffer.
///
/// The `checksum` field of `header` is ignored; the stored checksum is
/// always recomputed.
pub fn encode(header: &PageHeader, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() != PAYLOAD_SIZE {
        return Err(StorageError::InvalidPageSize {
            expected: PAYLOAD_SIZE,
            actual: payload.len(),
        });
    }

    let mut buf = Vec::with_capacity(PAGE_SIZE);
    put_header(&mut buf, header, 0);
    buf.put_slice(payload);
    debug_assert_eq!(buf.len(), PAGE_SIZE);

    let checksum = crc32fast::hash(&buf);
    buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].copy_from_slice(&checksum.to_le_bytes());

    Ok(buf)
}

/// Parses and verifies a serialized page.
///
/// The magic is checked before the checksum so that foreign data is reported
/// as [`StorageError::InvalidMagic`] rather than a checksum failure. The
/// returned page owns a copy of the payload; `raw` is not modified.
pub fn decode(raw: &[u8]) -> Result<Page> {
    if raw.len() != PAGE_SIZE {
        return Err(StorageError::InvalidPageSize {
            expected: PAGE_SIZE,
            actual: raw.len(),
        });
    }

    let mut cursor = raw;
    let magic = cursor.get_u32_le();
    if magic != PAGE_MAGIC {
        return Err(StorageError::InvalidMagic(magic));
    }

    let version = cursor.get_u16_le();
    let flags = cursor.get_u16_le();
    let page_id = cursor.get_u64_le();
    let free_start = cursor.get_u16_le();
    let free_end = cursor.get_u16_le();
    let slot_count = cursor.get_u16_le();
    let stored = cursor.get_u32_le();

    let computed = page_checksum(raw);
    if stored != computed {
        log::warn!(
            "checksum mismatch on page {}: stored {:#010x}, computed {:#010x}",
            page_id,
            stored,
            computed
        );
        return Err(StorageError::ChecksumMismatch {
            page_id,
            stored,
            computed,
        });
    }

    if version == 0 || version > PAGE_VERSION {
        return Err(StorageError::UnsupportedVersion(version));
    }

    let header = PageHeader {
        magic,
        version,
        flags,
        page_id,
        free_start,
        free_end,
        slot_count,
        checksum: stored,
    };

    Page::from_parts(header, raw[PAGE_HEADER_SIZE..].to_vec())
}

/// Like [`decode`], but also requires the header to name `expected` as its
/// page id. Use this when the buffer was read from a known location.
pub fn decode_as(raw: &[u8], expected: PageId) -> Result<Page> {
    let page = decode(raw)?;
    if page.page_id() != expected {
        return Err(StorageError::PageIdMismatch {
            expected,
            found: page.page_id(),
        });
    }
    Ok(page)
}

/// CRC-32 of a serialized page, treating the checksum field as zero.
/// `raw` must already be known to be `PAGE_SIZE` bytes.
pub(crate) fn page_checksum(raw: &[u8]) -> u32 {
    debug_assert_eq!(raw.len(), PAGE_SIZE);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&raw[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; CHECKSUM_LEN]);
    hasher.update(&raw[CHECKSUM_OFFSET + CHECKSUM_LEN..]);
    hasher.finalize()
}

fn put_header(buf: &mut impl BufMut, header: &PageHeader, checksum: u32) {
    buf.put_u32_le(header.magic);
    buf.put_u16_le(header.version);
    buf.put_u16_le(header.flags);
    buf.put_u64_le(header.page_id);
    buf.put_u16_le(header.free_start);
    buf.put_u16_le(header.free_end);
    buf.put_u16_le(header.slot_count);
    buf.put_u32_le(checksum);
    buf.put_bytes(0, RESERVED_LEN);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn sample_header() -> PageHeader {
        PageHeader {
            magic: PAGE_MAGIC,
            version: PAGE_VERSION,
            flags: 0x0A0B,
            page_id: 0x0102_0304_0506_0708,
            free_start: 12,
            free_end: 8000,
            slot_count: 3,
            checksum: 0,
        }
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let raw = encode(&sample_header(), &[0u8; PAYLOAD_SIZE]).unwrap();

        assert_eq!(&raw[0..4], &[0xDB, 0xDB, 0xDB, 0xDB]);
        assert_eq!(&raw[4..6], &[0x01, 0x00]);
        assert_eq!(&raw[6..8], &[0x0B, 0x0A]);
        assert_eq!(&raw[8..16], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&raw[16..18], &12u16.to_le_bytes());
        assert_eq!(&raw[18..20], &8000u16.to_le_bytes());
        assert_eq!(&raw[20..22], &3u16.to_le_bytes());
        assert_eq!(&raw[26..32], &[0u8; 6]);
    }

    #[test]
    fn test_checksum_covers_zeroed_field() {
        let raw = encode(&sample_header(), &[7u8; PAYLOAD_SIZE]).unwrap();

        let mut zeroed = raw.clone();
        zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        let expected = crc32fast::hash(&zeroed);

        let stored = u32::from_le_bytes(raw[22..26].try_into().unwrap());
        assert_eq!(stored, expected);
        assert_eq!(page_checksum(&raw), expected);
    }

    #[test]
    fn test_decode_restores_checksum_and_does_not_touch_input() {
        let raw = encode(&sample_header(), &[1u8; PAYLOAD_SIZE]).unwrap();
        let before = raw.clone();

        let page = decode(&raw).unwrap();
        assert_eq!(raw, before);
        assert_eq!(page.header.checksum, page_checksum(&raw));
        assert_eq!(page.header.flags, 0x0A0B);
        assert_eq!(page.header.free_start, 12);
        assert_eq!(page.header.free_end, 8000);
        assert_eq!(page.header.slot_count, 3);
    }

    #[test]
    fn test_encode_ignores_stale_checksum() {
        let mut header = sample_header();
        let fresh = encode(&header, &[0u8; PAYLOAD_SIZE]).unwrap();
        header.checksum = 0xFFFF_FFFF;
        let stale = encode(&header, &[0u8; PAYLOAD_SIZE]).unwrap();
        assert_eq!(fresh, stale);
    }

    #[test]
    fn test_encode_size_enforced() {
        let header = sample_header();
        assert!(matches!(
            encode(&header, &[0u8; 10]),
            Err(StorageError::InvalidPageSize { expected: PAYLOAD_SIZE, actual: 10 })
        ));
        assert!(encode(&header, &vec![0u8; PAYLOAD_SIZE + 1]).is_err());
    }

    #[test]
    fn test_decode_size_enforced() {
        let raw = encode(&sample_header(), &[0u8; PAYLOAD_SIZE]).unwrap();
        assert!(matches!(
            decode(&raw[..PAGE_SIZE - 1]),
            Err(StorageError::InvalidPageSize { expected: PAGE_SIZE, .. })
        ));

        let mut longer = raw.clone();
        longer.push(0);
        assert!(matches!(decode(&longer), Err(StorageError::InvalidPageSize { .. })));

        // Shorter than the header: rejected before any field or checksum is read.
        assert!(matches!(
            decode(&[0u8; 10]),
            Err(StorageError::InvalidPageSize { expected: PAGE_SIZE, actual: 10 })
        ));
        assert!(matches!(
            decode(&[]),
            Err(StorageError::InvalidPageSize { actual: 0, .. })
        ));
    }

    #[test]
    fn test_checksum_failure() {
        let page = Page::new(1);
        let mut raw = page.serialize().unwrap();
        raw[128] ^= 0xFF;

        assert!(matches!(
            decode(&raw),
            Err(StorageError::ChecksumMismatch { page_id: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let page = Page::new(42);
        let mut raw = page.serialize().unwrap();
        raw[0] = 0x00;

        assert!(matches!(decode(&raw), Err(StorageError::InvalidMagic(0xDBDB_DB00))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut header = sample_header();
        header.version = PAGE_VERSION + 1;
        let raw = encode(&header, &[0u8; PAYLOAD_SIZE]).unwrap();
        assert!(matches!(decode(&raw), Err(StorageError::UnsupportedVersion(2))));
    }

    #[test]
    fn test_decode_as_checks_page_id() {
        let raw = Page::new(9).serialize().unwrap();
        assert!(decode_as(&raw, 9).is_ok());
        assert!(matches!(
            decode_as(&raw, 10),
            Err(StorageError::PageIdMismatch { expected: 10, found: 9 })
        ));
    }

    #[test]
    fn test_non_page_data_is_rejected_by_magic() {
        let raw = vec![0u8; PAGE_SIZE];
        assert!(matches!(decode(&raw), Err(StorageError::InvalidMagic(0))));
    }

    fn arb_header() -> impl Strategy<Value = PageHeader> {
        (any::<u16>(), any::<u64>(), any::<u16>(), any::<u16>(), any::<u16>()).prop_map(
            |(flags, page_id, free_start, free_end, slot_count)| PageHeader {
                magic: PAGE_MAGIC,
                version: PAGE_VERSION,
                flags,
                page_id,
                free_start,
                free_end,
                slot_count,
                checksum: 0,
            },
        )
    }

    fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), PAYLOAD_SIZE)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_round_trip(header in arb_header(), payload in arb_payload()) {
            let raw = encode(&header, &payload).unwrap();
            let page = decode(&raw).unwrap();

            let mut expected = header;
            expected.checksum = page.header.checksum;
            prop_assert_eq!(page.header, expected);
            prop_assert_eq!(page.data(), &payload[..]);
        }

        #[test]
        fn prop_single_bit_flip_detected(
            header in arb_header(),
            payload in arb_payload(),
            bit in 0..PAGE_SIZE * 8,
        ) {
            let mut raw = encode(&header, &payload).unwrap();
            raw[bit / 8] ^= 1 << (bit % 8);

            match decode(&raw) {
                Err(StorageError::InvalidMagic(_)) => prop_assert!(bit < 32),
                Err(StorageError::ChecksumMismatch { .. }) => prop_assert!(bit >= 32),
                other => prop_assert!(false, "bit {} flip not detected: {:?}", bit, other),
            }
        }
    }
}
