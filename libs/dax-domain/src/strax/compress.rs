//! Pluggable whole-file compression

use super::{Result, StraxError};

/// Compression applied to every flushed file
pub trait Compressor: Send + Sync {
    /// Name used in run options
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Vec<u8>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 block compression with the uncompressed size prepended
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        lz4_flex::compress_prepend_size(data)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data).map_err(|e| StraxError::Decompress(e.to_string()))
    }
}

/// Files are written as they are
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Compressor for Passthrough {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Look a compressor up by its options name
pub fn compressor_for(name: &str) -> Result<Box<dyn Compressor>> {
    match name.to_ascii_lowercase().as_str() {
        "lz4" => Ok(Box::new(Lz4Compressor)),
        "none" | "" => Ok(Box::new(Passthrough)),
        _ => Err(StraxError::UnknownCompressor(name.to_string())),
    }
}
