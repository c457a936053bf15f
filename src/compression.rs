//! Block payload compression and the lossy precision reduction applied per
//! compression (LOD) level.

use crate::error::{Result, VdfError};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Lossless byte compressors for stored blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// zlib/deflate
    Deflate = 1,
    /// Run-length encoding of 32-bit words
    Rle = 2,
    /// Zstandard
    Zstd = 3,
}

/// Compression effort (0-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    /// Effort for a compression (LOD) index: index 0 is the most
    /// compressed representation, so it gets the highest effort.
    pub fn for_lod(lod: usize, num_lods: usize) -> Self {
        if num_lods <= 1 {
            return Self::default();
        }
        let span = (num_lods - 1) as f64;
        let effort = 9.0 - 8.0 * (lod.min(num_lods - 1) as f64 / span);
        Self::new(effort.round() as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Byte compressor for block payloads
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    /// `expected_size` is the uncompressed byte count when known
    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>>;

    fn method(&self) -> CompressionMethod;
}

#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

#[derive(Debug, Default)]
pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(data.len() / 2),
            FlateCompression::new(level.value() as u32),
        );
        encoder
            .write_all(data)
            .map_err(|e| VdfError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| VdfError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(Vec::with_capacity(expected_size.unwrap_or(0)));
        decoder
            .write_all(data)
            .map_err(|e| VdfError::Decompression(e.to_string()))?;
        decoder
            .finish()
            .map_err(|e| VdfError::Decompression(e.to_string()))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        // zstd levels run 1..=22; stretch our 0..=9 scale over the useful part
        let zlevel = 1 + 2 * level.value() as i32;
        zstd::encode_all(data, zlevel).map_err(|e| VdfError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| VdfError::Decompression(e.to_string()))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Run-length encoding over 4-byte words, which catches constant runs of
/// 32-bit samples (fill values, masked blocks). Output records are
/// `count: u16 LE` followed by the 4-byte word; a trailing partial word is
/// stored verbatim after a zero count.
#[derive(Debug, Default)]
pub struct RleCompressor;

impl RleCompressor {
    const WORD: usize = 4;

    fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let words = data.chunks_exact(Self::WORD);
        let tail = words.remainder();
        let mut run: Option<(&[u8], u16)> = None;

        for word in words {
            match run {
                Some((w, n)) if w == word && n < u16::MAX => run = Some((w, n + 1)),
                _ => {
                    if let Some((w, n)) = run {
                        out.extend_from_slice(&n.to_le_bytes());
                        out.extend_from_slice(w);
                    }
                    run = Some((word, 1));
                }
            }
        }
        if let Some((w, n)) = run {
            out.extend_from_slice(&n.to_le_bytes());
            out.extend_from_slice(w);
        }
        if !tail.is_empty() {
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(tail);
        }
        out
    }

    fn decode(data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected_size.unwrap_or(data.len()));
        let mut pos = 0;
        while pos < data.len() {
            if pos + 2 > data.len() {
                return Err(VdfError::Decompression("Truncated RLE record".into()));
            }
            let count = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            if count == 0 {
                out.extend_from_slice(&data[pos..]);
                break;
            }
            let word = data
                .get(pos..pos + Self::WORD)
                .ok_or_else(|| VdfError::Decompression("Truncated RLE word".into()))?;
            for _ in 0..count {
                out.extend_from_slice(word);
            }
            pos += Self::WORD;
        }
        Ok(out)
    }
}

impl Compressor for RleCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(Self::encode(data))
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        Self::decode(data, expected_size)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Rle
    }
}

/// Get a compressor for a given method
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Deflate => Box::new(DeflateCompressor),
        CompressionMethod::Rle => Box::new(RleCompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
    }
}

/// Mantissa bits kept for a compression ratio: ratio 1 is lossless, each
/// doubling of the ratio drops two bits of precision.
pub fn mantissa_bits_for_ratio(ratio: u32) -> u32 {
    if ratio <= 1 {
        return 23;
    }
    let log2 = 31 - ratio.leading_zeros();
    23u32.saturating_sub(2 * log2).max(4)
}

/// Round samples to `keep` mantissa bits so that the byte compressor sees
/// longer repeated patterns. `skip` values (missing-value sentinels) are
/// left untouched.
pub fn reduce_precision(samples: &mut [f32], keep: u32, skip: Option<f32>) {
    if keep >= 23 {
        return;
    }
    let drop = 23 - keep;
    let half = 1u32 << (drop - 1);
    let mask = !((1u32 << drop) - 1);
    for v in samples.iter_mut() {
        if !v.is_finite() || Some(*v) == skip {
            continue;
        }
        let bits = v.to_bits();
        let rounded = bits.wrapping_add(half) & mask;
        let r = f32::from_bits(rounded);
        if r.is_finite() {
            *v = r;
        }
    }
}
