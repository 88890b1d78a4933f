use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{DavitError, Result};

/// Cap on decompressed output. Data chunks are at most 8 MiB; tree blobs may
/// be larger (trees are not split), so the cap is generous but still bounds a
/// crafted decompression bomb.
const MAX_DECOMPRESS_SIZE: u64 = 256 * 1024 * 1024;

/// Repository compression policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Off,
    #[default]
    Auto,
    Max,
}

impl Compression {
    /// Parse the `compression` option value.
    pub fn from_option(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(Compression::Off),
            "auto" => Ok(Compression::Auto),
            "max" => Ok(Compression::Max),
            other => Err(DavitError::Config(format!(
                "unknown compression mode '{other}' (expected off, auto or max)"
            ))),
        }
    }

    pub fn zstd_level(self) -> Option<i32> {
        match self {
            Compression::Off => None,
            Compression::Auto => Some(3),
            Compression::Max => Some(19),
        }
    }
}

/// zstd-compress `data` at `level`.
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::bulk::compress(data, level).map_err(|e| DavitError::Other(format!("zstd compress: {e}")))
}

/// Decompress with a hard output cap. `expected` is a capacity hint only.
pub fn decompress(data: &[u8], expected: Option<usize>) -> Result<Vec<u8>> {
    let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(data))
        .map_err(|e| DavitError::Decompression(format!("zstd init: {e}")))?;
    let capacity = expected.unwrap_or(0).min(MAX_DECOMPRESS_SIZE as usize);
    let mut out = Vec::with_capacity(capacity);
    decoder
        .by_ref()
        .take(MAX_DECOMPRESS_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| DavitError::Decompression(format!("zstd: {e}")))?;
    if out.len() as u64 > MAX_DECOMPRESS_SIZE {
        return Err(DavitError::Decompression(format!(
            "decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
        )));
    }
    Ok(out)
}
