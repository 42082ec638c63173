//! Optional payload compression for outgoing values.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{Result, VellumError};

/// Attempts to compress a payload, returning `None` if not worthwhile.
///
/// The compressed candidate is accepted only when
/// `compressed_len <= original_len * min_ratio`; otherwise the caller must
/// send the original bytes uncompressed and leave the compressed data-type
/// bit clear.
pub fn try_compress(input: &[u8], min_ratio: f64) -> Option<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(input.len()), Compression::default());
    encoder.write_all(input).ok()?;
    let compressed = encoder.finish().ok()?;

    if (compressed.len() as f64) <= (input.len() as f64) * min_ratio {
        Some(compressed)
    } else {
        None
    }
}

/// Decompresses a response value carrying the compressed data-type bit.
pub fn decompress(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(input);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| VellumError::Protocol(format!("failed to decompress value: {}", e)))?;
    Ok(output)
}
