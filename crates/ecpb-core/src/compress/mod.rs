use serde::{Deserialize, Serialize};

use crate::error::{EcpbError, Result};

/// Zstd level used for all chunk compression.
const ZSTD_LEVEL: i32 = 3;

/// Per-chunk compression codec. The codec is recorded in the chunk's
/// metadata row, not in the encoded stream, so decoding always knows
/// both the codec and the original size up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd,
}

impl Compression {
    pub fn code(self) -> i64 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Zstd => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Compression::None),
            1 => Some(Compression::Lz4),
            2 => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Parse from a config string like "lz4", "zstd", "none".
    pub fn from_config(algorithm: &str) -> Result<Self> {
        match algorithm {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(EcpbError::Argument(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "NONE",
            Compression::Lz4 => "LZ4",
            Compression::Zstd => "ZSTD",
        }
    }
}

/// Compress a chunk. `Compression::None` returns the input unchanged.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => Ok(lz4_flex::block::compress(data)),
        Compression::Zstd => zstd::bulk::compress(data, ZSTD_LEVEL)
            .map_err(|e| EcpbError::Other(format!("zstd compress: {e}"))),
    }
}

/// Decompress a chunk back to exactly `original_size` bytes.
///
/// The caller supplies `original_size` from the chunk's metadata row;
/// output of any other length is treated as corruption.
pub fn decompress(compression: Compression, data: &[u8], original_size: usize) -> Result<Vec<u8>> {
    let out = match compression {
        Compression::None => data.to_vec(),
        Compression::Lz4 => lz4_flex::block::decompress(data, original_size)
            .map_err(|e| EcpbError::Decompression(format!("lz4: {e}")))?,
        Compression::Zstd => zstd::bulk::decompress(data, original_size)
            .map_err(|e| EcpbError::Decompression(format!("zstd: {e}")))?,
    };
    if out.len() != original_size {
        return Err(EcpbError::Decompression(format!(
            "decoded {} bytes, expected {original_size}",
            out.len()
        )));
    }
    Ok(out)
}
