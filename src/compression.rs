//! Batch compression for message sets.
//!
//! The 0.8 wire format defines three compression attribute codes: 0 (none),
//! 1 (GZIP), 2 (Snappy). Snappy uses the raw block format, not the framed
//! stream format.

use std::io::{Read, Write};

use crate::codec::WireError;

/// Extra bytes a gzip stream carries around the deflate payload
/// (10-byte header + 8-byte trailer).
const GZIP_WRAPPER_LEN: usize = 18;

/// Compression kind applied to a whole message set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Snappy,
}

impl CompressionType {
    /// The value carried in the low two bits of a message's attributes byte.
    pub fn attribute(self) -> i8 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
            Self::Snappy => 2,
        }
    }

    /// Reads the compression kind out of a message's attributes byte.
    pub fn from_attributes(attributes: i8) -> Result<Self, WireError> {
        match attributes & 0x3 {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Snappy),
            other => Err(WireError::UnknownCompression(other)),
        }
    }
}

pub fn compress(kind: CompressionType, data: &[u8]) -> Result<Vec<u8>, WireError> {
    match kind {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| WireError::Compression(format!("gzip: {}", e)))
        }
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| WireError::Compression(format!("snappy: {}", e))),
    }
}

pub fn decompress(kind: CompressionType, data: &[u8]) -> Result<Vec<u8>, WireError> {
    match kind {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| WireError::Compression(format!("gzip: {}", e)))?;
            Ok(out)
        }
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| WireError::Compression(format!("snappy: {}", e))),
    }
}

/// Upper bound on the compressed size of `len` input bytes.
///
/// Message-set budget checks must be conservative: until the whole batch is
/// compressed there is no way to know the real output size, so incompressible
/// input has to be assumed. The gzip bound mirrors zlib's deflateBound
/// arithmetic for the default settings, plus the gzip wrapper.
pub fn max_compressed_len(kind: CompressionType, len: usize) -> usize {
    match kind {
        CompressionType::None => len,
        CompressionType::Gzip => {
            len + (len >> 12) + (len >> 14) + (len >> 25) + 13 + GZIP_WRAPPER_LEN
        }
        CompressionType::Snappy => snap::raw::max_compress_len(len),
    }
}
