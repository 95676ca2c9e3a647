//! Brotli codec for cached page content.
//!
//! The compressed representation is the canonical in-memory form of every
//! cache entry; the decompressed form is only materialized on serve and in
//! the durable `.html` companion file.

use std::io::{Read, Write};

use super::error::CacheError;

// Quality 6 keeps encode latency acceptable on the write-through path.
const QUALITY: u32 = 6;
const LG_WINDOW_SIZE: u32 = 22;
const BUFFER_SIZE: usize = 4096;

/// Compress content with Brotli.
pub fn compress(content: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut out = Vec::new();
    let mut writer = brotli::CompressorWriter::new(&mut out, BUFFER_SIZE, QUALITY, LG_WINDOW_SIZE);
    writer.write_all(content).map_err(CacheError::Codec)?;
    writer.flush().map_err(CacheError::Codec)?;
    drop(writer);
    Ok(out)
}

/// Decompress Brotli-compressed content.
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut out = Vec::new();
    let mut reader = brotli::Decompressor::new(compressed, BUFFER_SIZE);
    reader.read_to_end(&mut out).map_err(CacheError::Codec)?;
    Ok(out)
}
