// src/hash.rs

//! Hashing for blob identity and cheap content tags
//!
//! Two hashes are used across the crate:
//! - **SHA-256**: content addressing (blob ids) and extent checksums
//! - **FNV-1a (64-bit)**: ETags on stored objects
//!
//! | Use Case | Hash | Why |
//! |----------|------|-----|
//! | Blob identity / dedup | SHA-256 | Collision resistance is the dedup law |
//! | Extent payload checksum | SHA-256 | Matches the wire format |
//! | Backend object ETags | FNV-1a 64 | Cheap change detection only |

use sha2::{Digest, Sha256};

/// Prefix carried by every blob id
pub const BLOB_ID_PREFIX: &str = "blob-";

/// Hex length of a SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

// FNV-1a 64-bit parameters (wire constants)
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Compute the raw SHA-256 digest of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the SHA-256 digest of `data` as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Derive the content-addressed blob id for a byte sequence
///
/// Format: `blob-` + 64 lowercase hex of SHA-256(payload). Equal payloads
/// always yield equal ids; that equality is what the store dedups on.
pub fn blob_id(data: &[u8]) -> String {
    format!("{}{}", BLOB_ID_PREFIX, sha256_hex(data))
}

/// Check that a string is a well-formed blob id
///
/// Validates the prefix and the hex digest length; it does not (and cannot)
/// verify that the id matches any particular content.
pub fn validate_blob_id(id: &str) -> bool {
    match id.strip_prefix(BLOB_ID_PREFIX) {
        Some(hexpart) => {
            hexpart.len() == SHA256_HEX_LEN
                && hexpart.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        }
        None => false,
    }
}

/// 64-bit FNV-1a over a byte slice
pub fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// ETag for stored object bytes: 16 hex digits of FNV-1a 64
pub fn etag(data: &[u8]) -> String {
    format!("{:016x}", fnv1a64(data))
}
