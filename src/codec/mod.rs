// src/codec/mod.rs

//! Page compression for tier demotion
//!
//! Provides a consistent interface over the supported codecs (zstd, brotli,
//! gzip). Demoted pages are compressed only when it pays off: compression is
//! skipped when disabled, when the input is small, when the declared content
//! type is already compressed, or when the framed result is not smaller than
//! the input.
//!
//! zstd and brotli payloads are wrapped in a 4-byte magic plus an 8-byte
//! little-endian original size so truncation and cross-codec confusion are
//! detected before decoding. Gzip is self-framing.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Frame magic for zstd-compressed pages
pub const ZSTD_FRAME_MAGIC: [u8; 4] = *b"ZSTF";
/// Frame magic for brotli-compressed pages
pub const BROTLI_FRAME_MAGIC: [u8; 4] = *b"BRTF";

/// Frame header: magic + u64 LE original size
const FRAME_HEADER_LEN: usize = 12;

/// Inputs smaller than this are never compressed
pub const DEFAULT_MIN_COMPRESS_SIZE: usize = 1024;

/// Content types that are already compressed and not worth re-encoding
const SKIP_CONTENT_TYPE_PREFIXES: &[&str] = &["image/", "video/", "audio/"];
const SKIP_CONTENT_TYPES: &[&str] = &[
    "application/zip",
    "application/gzip",
    "application/x-gzip",
    "application/x-xz",
    "application/zstd",
    "application/x-7z-compressed",
    "application/x-rar-compressed",
    "application/pdf",
];

/// Supported page codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// No compression (raw data)
    #[default]
    None,
    /// Zstandard
    Zstd,
    /// Brotli
    Brotli,
    /// Gzip
    Gzip,
}

impl Codec {
    /// Get a human-readable name for this codec
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zstd => "zstd",
            Self::Brotli => "brotli",
            Self::Gzip => "gzip",
        }
    }

    /// Parse a codec name
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Self::None),
            "zstd" => Ok(Self::Zstd),
            "brotli" => Ok(Self::Brotli),
            "gzip" => Ok(Self::Gzip),
            other => Err(Error::invalid(format!("unknown codec: {other}"))),
        }
    }

    /// Detect the codec from frame magic bytes
    ///
    /// Magic bytes:
    /// - zstd frame: `ZSTF`
    /// - brotli frame: `BRTF`
    /// - gzip: `1f 8b`
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.len() >= 4 && data[0..4] == ZSTD_FRAME_MAGIC {
            Self::Zstd
        } else if data.len() >= 4 && data[0..4] == BROTLI_FRAME_MAGIC {
            Self::Brotli
        } else if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
            Self::Gzip
        } else {
            Self::None
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Metadata that travels alongside stored page bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionMeta {
    pub codec: Codec,
    pub original_size: u64,
    pub compressed_size: u64,
    pub ratio: f64,
}

impl CompressionMeta {
    /// Identity metadata for bytes stored uncompressed
    pub fn identity(size: u64) -> Self {
        Self {
            codec: Codec::None,
            original_size: size,
            compressed_size: size,
            ratio: 1.0,
        }
    }
}

/// Compression configuration; disabled by default
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub codec: Codec,
    /// Codec-specific level; clamped per codec (gzip 0..=9, brotli 0..=11)
    pub level: i32,
    /// Inputs below this size are stored raw
    pub min_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            codec: Codec::Zstd,
            level: 3,
            min_size: DEFAULT_MIN_COMPRESS_SIZE,
        }
    }
}

impl CompressionConfig {
    pub fn enabled(codec: Codec) -> Self {
        Self {
            enabled: true,
            codec,
            ..Self::default()
        }
    }
}

/// Running compression totals; resettable for tests
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionStats {
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    pub pages_compressed: u64,
    pub pages_skipped: u64,
}

impl CompressionStats {
    /// Mean compressed/original ratio over compressed pages; 1.0 when none
    pub fn average_ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            1.0
        } else {
            self.compressed_bytes as f64 / self.original_bytes as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Stateful compressor applying the skip rules and keeping running totals
pub struct Compressor {
    config: CompressionConfig,
    stats: parking_lot::Mutex<CompressionStats>,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            stats: parking_lot::Mutex::new(CompressionStats::default()),
        }
    }

    /// Compressor that never compresses
    pub fn disabled() -> Self {
        Self::new(CompressionConfig::default())
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compress `data` if the skip rules allow it
    ///
    /// Returns the bytes to store plus the metadata describing them. When
    /// compression is skipped for any reason the original bytes come back
    /// with identity metadata and the call counts as skipped.
    pub fn maybe_compress(
        &self,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<(Vec<u8>, CompressionMeta)> {
        let original_size = data.len() as u64;

        let skip = !self.config.enabled
            || self.config.codec == Codec::None
            || data.len() < self.config.min_size
            || content_type.is_some_and(is_precompressed_content_type);

        if skip {
            self.stats.lock().pages_skipped += 1;
            return Ok((data.to_vec(), CompressionMeta::identity(original_size)));
        }

        let compressed = compress(self.config.codec, data, self.config.level)?;
        if compressed.len() as u64 >= original_size {
            // Framed overhead beat the savings
            self.stats.lock().pages_skipped += 1;
            return Ok((data.to_vec(), CompressionMeta::identity(original_size)));
        }

        let compressed_size = compressed.len() as u64;
        let meta = CompressionMeta {
            codec: self.config.codec,
            original_size,
            compressed_size,
            ratio: compressed_size as f64 / original_size as f64,
        };

        let mut stats = self.stats.lock();
        stats.original_bytes += original_size;
        stats.compressed_bytes += compressed_size;
        stats.pages_compressed += 1;

        Ok((compressed, meta))
    }

    /// Decompress bytes described by `meta`
    pub fn decompress(&self, data: &[u8], meta: &CompressionMeta) -> Result<Vec<u8>> {
        decompress(data, meta)
    }

    pub fn stats(&self) -> CompressionStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        self.stats.lock().reset();
    }
}

/// True when the declared content type is a known precompressed format
pub fn is_precompressed_content_type(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();

    SKIP_CONTENT_TYPE_PREFIXES.iter().any(|p| ct.starts_with(p))
        || SKIP_CONTENT_TYPES.contains(&ct.as_str())
}

/// Compress `data` with the given codec, including the frame
pub fn compress(codec: Codec, data: &[u8], level: i32) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Zstd => {
            let compressed = zstd::encode_all(data, level)
                .map_err(|e| Error::Storage(format!("zstd encode failed: {e}")))?;
            Ok(frame(ZSTD_FRAME_MAGIC, data.len() as u64, compressed))
        }
        Codec::Brotli => {
            let quality = level.clamp(0, 11) as u32;
            let mut compressed = Vec::new();
            {
                let mut writer =
                    brotli::CompressorWriter::new(&mut compressed, 4096, quality, 22);
                writer
                    .write_all(data)
                    .map_err(|e| Error::Storage(format!("brotli encode failed: {e}")))?;
                writer
                    .flush()
                    .map_err(|e| Error::Storage(format!("brotli encode failed: {e}")))?;
            }
            Ok(frame(BROTLI_FRAME_MAGIC, data.len() as u64, compressed))
        }
        Codec::Gzip => {
            let gz_level = flate2::Compression::new(level.clamp(0, 9) as u32);
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), gz_level);
            encoder
                .write_all(data)
                .map_err(|e| Error::Storage(format!("gzip encode failed: {e}")))?;
            encoder
                .finish()
                .map_err(|e| Error::Storage(format!("gzip encode failed: {e}")))
        }
    }
}

/// Decompress bytes described by `meta`, validating the frame and the
/// decoded length
pub fn decompress(data: &[u8], meta: &CompressionMeta) -> Result<Vec<u8>> {
    let output = match meta.codec {
        Codec::None => data.to_vec(),
        Codec::Zstd => {
            let payload = unframe(data, ZSTD_FRAME_MAGIC, meta)?;
            zstd::decode_all(payload)
                .map_err(|e| Error::Corrupted(format!("zstd decode failed: {e}")))?
        }
        Codec::Brotli => {
            let payload = unframe(data, BROTLI_FRAME_MAGIC, meta)?;
            let mut output = Vec::with_capacity(meta.original_size as usize);
            brotli::Decompressor::new(payload, 4096)
                .read_to_end(&mut output)
                .map_err(|e| Error::Corrupted(format!("brotli decode failed: {e}")))?;
            output
        }
        Codec::Gzip => {
            let mut output = Vec::with_capacity(meta.original_size as usize);
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut output)
                .map_err(|e| Error::Corrupted(format!("gzip decode failed: {e}")))?;
            output
        }
    };

    if output.len() as u64 != meta.original_size {
        return Err(Error::Corrupted(format!(
            "decompressed length {} does not match declared original size {}",
            output.len(),
            meta.original_size
        )));
    }

    Ok(output)
}

/// Decompress bytes whose codec is identified by frame magic alone
///
/// Used where no metadata record travels with the bytes (extent payloads).
/// zstd and brotli frames still validate their declared original size.
pub fn decompress_auto(data: &[u8]) -> Result<Vec<u8>> {
    let codec = Codec::from_magic_bytes(data);
    if codec == Codec::None {
        return Ok(data.to_vec());
    }

    let declared = match codec {
        Codec::Zstd | Codec::Brotli => {
            if data.len() < FRAME_HEADER_LEN {
                return Err(Error::Corrupted(format!(
                    "{} frame truncated: {} bytes",
                    codec,
                    data.len()
                )));
            }
            let mut size_bytes = [0u8; 8];
            size_bytes.copy_from_slice(&data[4..12]);
            Some(u64::from_le_bytes(size_bytes))
        }
        _ => None,
    };

    let output = match codec {
        Codec::Zstd => zstd::decode_all(&data[FRAME_HEADER_LEN..])
            .map_err(|e| Error::Corrupted(format!("zstd decode failed: {e}")))?,
        Codec::Brotli => {
            let mut output = Vec::new();
            brotli::Decompressor::new(&data[FRAME_HEADER_LEN..], 4096)
                .read_to_end(&mut output)
                .map_err(|e| Error::Corrupted(format!("brotli decode failed: {e}")))?;
            output
        }
        Codec::Gzip => {
            let mut output = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut output)
                .map_err(|e| Error::Corrupted(format!("gzip decode failed: {e}")))?;
            output
        }
        Codec::None => unreachable!(),
    };

    if let Some(declared) = declared
        && output.len() as u64 != declared
    {
        return Err(Error::Corrupted(format!(
            "decompressed length {} does not match frame-declared size {}",
            output.len(),
            declared
        )));
    }

    Ok(output)
}

fn frame(magic: [u8; 4], original_size: u64, compressed: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + compressed.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&original_size.to_le_bytes());
    out.extend_from_slice(&compressed);
    out
}

fn unframe<'a>(data: &'a [u8], magic: [u8; 4], meta: &CompressionMeta) -> Result<&'a [u8]> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(Error::Corrupted(format!(
            "{} frame truncated: {} bytes",
            meta.codec,
            data.len()
        )));
    }
    if data[0..4] != magic {
        return Err(Error::Corrupted(format!(
            "bad {} frame magic: {:02x?}",
            meta.codec,
            &data[0..4]
        )));
    }

    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&data[4..12]);
    let declared = u64::from_le_bytes(size_bytes);
    if declared != meta.original_size {
        return Err(Error::Corrupted(format!(
            "{} frame declares {} original bytes, metadata says {}",
            meta.codec, declared, meta.original_size
        )));
    }

    Ok(&data[FRAME_HEADER_LEN..])
}
