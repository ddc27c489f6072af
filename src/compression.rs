//! # Compression Adapters
//!
//! Pure byte-to-byte transforms applied to record payload before it is
//! chunked onto pages. A cluster's method is chosen by name at configuration
//! time and resolved through [`compression_by_name`]; the name is persisted
//! in the cluster configuration so reopening resolves the same codec.
//!
//! Methods:
//!
//! - `nothing` — identity, the default
//! - `snappy` — Snappy block format; decompression needs no external length
//!   because the raw format carries the uncompressed size

use std::sync::Arc;

use eyre::{bail, Result, WrapErr};

pub const NOTHING_COMPRESSION: &str = "nothing";
pub const SNAPPY_COMPRESSION: &str = "snappy";

pub trait Compression: Send + Sync {
    fn name(&self) -> &'static str;

    fn compress(&self, content: &[u8]) -> Vec<u8>;

    fn uncompress(&self, content: &[u8]) -> Result<Vec<u8>>;
}

/// Identity transform.
pub struct NothingCompression;

impl Compression for NothingCompression {
    fn name(&self) -> &'static str {
        NOTHING_COMPRESSION
    }

    fn compress(&self, content: &[u8]) -> Vec<u8> {
        content.to_vec()
    }

    fn uncompress(&self, content: &[u8]) -> Result<Vec<u8>> {
        Ok(content.to_vec())
    }
}

/// Snappy block compression.
pub struct SnappyCompression;

impl Compression for SnappyCompression {
    fn name(&self) -> &'static str {
        SNAPPY_COMPRESSION
    }

    fn compress(&self, content: &[u8]) -> Vec<u8> {
        let mut encoder = snap::raw::Encoder::new();
        encoder
            .compress_vec(content)
            .expect("snappy compression of an in-memory buffer cannot fail")
    }

    fn uncompress(&self, content: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = snap::raw::Decoder::new();
        decoder
            .decompress_vec(content)
            .wrap_err("snappy payload is corrupt")
    }
}

/// Resolves a compression method by its configured name.
pub fn compression_by_name(name: &str) -> Result<Arc<dyn Compression>> {
    match name {
        NOTHING_COMPRESSION => Ok(Arc::new(NothingCompression)),
        SNAPPY_COMPRESSION => Ok(Arc::new(SnappyCompression)),
        other => bail!("unknown compression method '{}'", other),
    }
}
