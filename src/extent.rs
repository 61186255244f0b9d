// src/extent.rs

//! Extent wire format: multiple pages packed into one backend object
//!
//! Layout (little-endian):
//!
//! ```text
//! +----------+---------+-------+-----------+------------+--------+---------+----------+
//! | magic(4) | ver(2)  | flags | page_size | page_count | bitmap | payload | sha256   |
//! | "FSXE"   | 0x0001  | (2)   | u32       | u32        | var    | var     | (32)     |
//! +----------+---------+-------+-----------+------------+--------+---------+----------+
//! ```
//!
//! The presence bitmap holds one bit per slot, LSB-first within each byte
//! (slot 0 is bit 0 of byte 0). The payload is the concatenation of present
//! pages in slot order; every present page is exactly `page_size` bytes
//! except the last present slot, which may be short. With `flags` bit 0 set
//! the payload is wrapped in a codec frame; the trailing checksum always
//! covers the uncompressed payload.

use crate::codec::{self, Codec};
use crate::error::{Error, Result};
use crate::hash;

/// Extent magic bytes, ASCII "FSXE"
pub const EXTENT_MAGIC: [u8; 4] = [0x46, 0x53, 0x58, 0x45];

/// Current extent format version
pub const EXTENT_VERSION: u16 = 0x0001;

/// Flags bit 0: payload is codec-framed
pub const FLAG_COMPRESSED: u16 = 0x0001;

/// Fixed bytes before the bitmap
const FIXED_HEADER_LEN: usize = 16;

/// Trailing checksum length
const CHECKSUM_LEN: usize = 32;

/// Default extent size: 32 pages of the default page size
pub const DEFAULT_EXTENT_SIZE: usize = 64 * 1024 * 1024;

/// How many page slots an extent of `extent_size` holds
pub fn pages_per_extent(extent_size: usize, page_size: usize) -> usize {
    extent_size / page_size
}

/// A parsed extent with its payload already unwrapped
#[derive(Debug, Clone)]
pub struct Extent {
    page_size: u32,
    page_count: u32,
    flags: u16,
    bitmap: Vec<u8>,
    payload: Vec<u8>,
    checksum: [u8; 32],
}

impl Extent {
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Whether the given slot holds a page
    pub fn is_slot_present(&self, slot: u32) -> bool {
        if slot >= self.page_count {
            return false;
        }
        let byte = (slot / 8) as usize;
        let bit = slot % 8;
        self.bitmap[byte] & (1 << bit) != 0
    }

    /// Number of present slots
    pub fn present_count(&self) -> u32 {
        (0..self.page_count).filter(|&s| self.is_slot_present(s)).count() as u32
    }

    /// Extract the page bytes stored in `slot`
    ///
    /// Returns ENOENT when the slot's presence bit is zero.
    pub fn extract_page(&self, slot: u32) -> Result<Vec<u8>> {
        if !self.is_slot_present(slot) {
            return Err(Error::not_found(format!("extent slot {slot}")));
        }

        // Rank of this slot among present slots gives the payload offset
        let rank = (0..slot).filter(|&s| self.is_slot_present(s)).count();
        let offset = rank * self.page_size as usize;
        let end = (offset + self.page_size as usize).min(self.payload.len());

        if offset >= self.payload.len() {
            return Err(Error::Corrupted(format!(
                "extent payload too short for slot {slot}"
            )));
        }

        Ok(self.payload[offset..end].to_vec())
    }

    /// Recompute the payload checksum and compare to the stored one
    pub fn validate(&self) -> Result<()> {
        let computed = hash::sha256(&self.payload);
        if computed != self.checksum {
            return Err(Error::Corrupted(format!(
                "extent checksum mismatch: expected {}, got {}",
                hex::encode(self.checksum),
                hex::encode(computed)
            )));
        }
        Ok(())
    }
}

/// Pack pages into the extent wire format
///
/// `pages` maps slot index to page bytes; `None` slots are absent. Every
/// present page must be exactly `page_size` bytes, except the last present
/// slot which may be shorter. With a codec other than `None` the payload is
/// compressed and flags bit 0 is set.
pub fn build_extent(pages: &[Option<Vec<u8>>], page_size: u32, compression: Codec) -> Result<Vec<u8>> {
    if page_size == 0 {
        return Err(Error::invalid("extent page_size must be non-zero"));
    }
    let page_count = u32::try_from(pages.len())
        .map_err(|_| Error::invalid("extent page count overflows u32"))?;

    let last_present = pages.iter().rposition(|p| p.is_some());
    for (slot, page) in pages.iter().enumerate() {
        let Some(page) = page else { continue };
        if page.is_empty() {
            return Err(Error::invalid(format!("empty page in slot {slot}")));
        }
        if page.len() > page_size as usize {
            return Err(Error::invalid(format!(
                "page in slot {slot} exceeds page size: {} > {page_size}",
                page.len()
            )));
        }
        if page.len() < page_size as usize && Some(slot) != last_present {
            return Err(Error::invalid(format!(
                "short page in non-final slot {slot}: {} < {page_size}",
                page.len()
            )));
        }
    }

    let bitmap_len = page_count.div_ceil(8) as usize;
    let mut bitmap = vec![0u8; bitmap_len];
    let mut payload = Vec::new();
    for (slot, page) in pages.iter().enumerate() {
        if let Some(page) = page {
            bitmap[slot / 8] |= 1 << (slot % 8);
            payload.extend_from_slice(page);
        }
    }

    let checksum = hash::sha256(&payload);

    let (body, flags) = if compression == Codec::None {
        (payload, 0u16)
    } else {
        (codec::compress(compression, &payload, 3)?, FLAG_COMPRESSED)
    };

    let mut out = Vec::with_capacity(FIXED_HEADER_LEN + bitmap_len + body.len() + CHECKSUM_LEN);
    out.extend_from_slice(&EXTENT_MAGIC);
    out.extend_from_slice(&EXTENT_VERSION.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&page_size.to_le_bytes());
    out.extend_from_slice(&page_count.to_le_bytes());
    out.extend_from_slice(&bitmap);
    out.extend_from_slice(&body);
    out.extend_from_slice(&checksum);

    Ok(out)
}

/// Parse and unwrap an extent, validating magic, version, and structure
///
/// The payload is decompressed here when flags bit 0 is set; the checksum is
/// not verified (call [`Extent::validate`] for that).
pub fn parse_extent(bytes: &[u8]) -> Result<Extent> {
    if bytes.len() < FIXED_HEADER_LEN + CHECKSUM_LEN {
        return Err(Error::Corrupted(format!(
            "extent too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[0..4] != EXTENT_MAGIC {
        return Err(Error::Corrupted(format!(
            "bad extent magic: {:02x?}",
            &bytes[0..4]
        )));
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != EXTENT_VERSION {
        return Err(Error::Corrupted(format!(
            "unsupported extent version: {version}"
        )));
    }

    let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
    let page_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let page_count = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

    if page_size == 0 {
        return Err(Error::Corrupted("extent page_size is zero".to_string()));
    }

    let bitmap_len = page_count.div_ceil(8) as usize;
    if bytes.len() < FIXED_HEADER_LEN + bitmap_len + CHECKSUM_LEN {
        return Err(Error::Corrupted(
            "extent truncated inside bitmap".to_string(),
        ));
    }

    let bitmap = bytes[FIXED_HEADER_LEN..FIXED_HEADER_LEN + bitmap_len].to_vec();
    let body = &bytes[FIXED_HEADER_LEN + bitmap_len..bytes.len() - CHECKSUM_LEN];
    let mut checksum = [0u8; 32];
    checksum.copy_from_slice(&bytes[bytes.len() - CHECKSUM_LEN..]);

    let payload = if flags & FLAG_COMPRESSED != 0 {
        if Codec::from_magic_bytes(body) == Codec::None {
            return Err(Error::Corrupted(
                "compressed flag set but payload has no codec frame".to_string(),
            ));
        }
        codec::decompress_auto(body)?
    } else {
        body.to_vec()
    };

    let extent = Extent {
        page_size,
        page_count,
        flags,
        bitmap,
        payload,
        checksum,
    };

    // Structural sanity: payload must slice cleanly into present pages
    let present = extent.present_count() as usize;
    let max = present * page_size as usize;
    let min = present.saturating_sub(1) * page_size as usize;
    if extent.payload.len() > max || (present > 0 && extent.payload.len() <= min) {
        return Err(Error::Corrupted(format!(
            "extent payload length {} inconsistent with {present} present pages",
            extent.payload.len()
        )));
    }

    Ok(extent)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u32 = 64;

    fn filled(byte: u8, len: usize) -> Vec<u8> {
        vec![byte; len]
    }

    fn sample_slots() -> Vec<Option<Vec<u8>>> {
        vec![
            Some(filled(0xaa, PAGE as usize)),
            None,
            Some(filled(0xbb, PAGE as usize)),
            None,
            Some(filled(0xcc, 17)), // short final page
        ]
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let slots = sample_slots();
        let bytes = build_extent(&slots, PAGE, Codec::None).unwrap();
        let extent = parse_extent(&bytes).unwrap();

        assert_eq!(extent.page_count(), 5);
        assert_eq!(extent.page_size(), PAGE);
        assert!(!extent.is_compressed());
        assert_eq!(extent.present_count(), 3);

        for (slot, expected) in slots.iter().enumerate() {
            match expected {
                Some(page) => {
                    assert_eq!(&extent.extract_page(slot as u32).unwrap(), page);
                }
                None => {
                    let err = extent.extract_page(slot as u32).unwrap_err();
                    assert!(err.is_not_found(), "slot {slot}: {err}");
                }
            }
        }

        extent.validate().unwrap();
    }

    #[test]
    fn test_roundtrip_compressed() {
        let slots = sample_slots();
        for compression in [Codec::Zstd, Codec::Gzip, Codec::Brotli] {
            let bytes = build_extent(&slots, PAGE, compression).unwrap();
            let extent = parse_extent(&bytes).unwrap();

            assert!(extent.is_compressed());
            extent.validate().unwrap();
            assert_eq!(extent.extract_page(0).unwrap(), filled(0xaa, PAGE as usize));
            assert_eq!(extent.extract_page(4).unwrap(), filled(0xcc, 17));
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = build_extent(&sample_slots(), PAGE, Codec::None).unwrap();

        assert_eq!(&bytes[0..4], b"FSXE");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 1);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 0);
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), PAGE);
        assert_eq!(u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]), 5);
        // Bitmap: slots 0, 2, 4 present -> 0b0001_0101, LSB-first
        assert_eq!(bytes[16], 0b0001_0101);
    }

    #[test]
    fn test_compressed_flag_bit() {
        let slots = vec![Some(filled(0x11, PAGE as usize)), Some(filled(0x22, PAGE as usize))];
        let bytes = build_extent(&slots, PAGE, Codec::Zstd).unwrap();
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]) & FLAG_COMPRESSED, 1);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = build_extent(&sample_slots(), PAGE, Codec::None).unwrap();
        bytes[0] = b'X';
        assert!(parse_extent(&bytes).is_err());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut bytes = build_extent(&sample_slots(), PAGE, Codec::None).unwrap();
        bytes[4] = 9;
        assert!(parse_extent(&bytes).is_err());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut bytes = build_extent(&sample_slots(), PAGE, Codec::None).unwrap();
        // Flip a payload byte (past the fixed header + 1-byte bitmap)
        bytes[FIXED_HEADER_LEN + 1 + 3] ^= 0xff;
        let extent = parse_extent(&bytes).unwrap();
        assert!(extent.validate().is_err());
    }

    #[test]
    fn test_short_page_in_middle_rejected() {
        let slots = vec![
            Some(filled(0xaa, 10)),
            Some(filled(0xbb, PAGE as usize)),
        ];
        assert!(build_extent(&slots, PAGE, Codec::None).is_err());
    }

    #[test]
    fn test_oversized_page_rejected() {
        let slots = vec![Some(filled(0xaa, PAGE as usize + 1))];
        assert!(build_extent(&slots, PAGE, Codec::None).is_err());
    }

    #[test]
    fn test_empty_extent() {
        let bytes = build_extent(&[], PAGE, Codec::None).unwrap();
        let extent = parse_extent(&bytes).unwrap();
        assert_eq!(extent.page_count(), 0);
        assert_eq!(extent.present_count(), 0);
        extent.validate().unwrap();
    }

    #[test]
    fn test_pages_per_extent() {
        assert_eq!(pages_per_extent(DEFAULT_EXTENT_SIZE, 2 * 1024 * 1024), 32);
        assert_eq!(pages_per_extent(1024, 256), 4);
    }
}
