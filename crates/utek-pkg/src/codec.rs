//! Package byte-stream codec.
//!
//! A package file is a JSON document, optionally wrapped in gzip or lz4
//! frame compression. Decoding sniffs the leading magic bytes rather than
//! trusting the header's `compression_info` tag (the tag is inside the
//! compressed document). Decompression is capped to defend against
//! decompression bombs before the header's own `max_size` can be read.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    #[default]
    Gzip,
    Lz4,
    None,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
            Compression::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "gzip" => Some(Compression::Gzip),
            "lz4" => Some(Compression::Lz4),
            "none" | "" => Some(Compression::None),
            _ => None,
        }
    }

    /// Sniff the codec from a file's leading bytes.
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
            Compression::Gzip
        } else if bytes.len() >= 4 && bytes[..4] == LZ4_FRAME_MAGIC {
            Compression::Lz4
        } else {
            Compression::None
        }
    }
}

pub fn encode(bytes: &[u8], method: Compression) -> Result<Vec<u8>> {
    match method {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            let mut enc =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(bytes).context("gzip write")?;
            enc.finish().context("gzip finish")
        }
        Compression::Lz4 => {
            let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
            enc.write_all(bytes).context("lz4 write")?;
            enc.finish().context("lz4 finish")
        }
    }
}

/// Decode with codec sniffing, refusing output larger than `max_bytes`.
pub fn decode_auto(bytes: &[u8], max_bytes: u64) -> Result<Vec<u8>> {
    match Compression::detect(bytes) {
        Compression::None => {
            if bytes.len() as u64 > max_bytes {
                anyhow::bail!(
                    "package document of {} bytes exceeds the {} byte ceiling",
                    bytes.len(),
                    max_bytes
                );
            }
            Ok(bytes.to_vec())
        }
        Compression::Gzip => {
            read_capped(flate2::read::GzDecoder::new(bytes), max_bytes).context("gzip decode")
        }
        Compression::Lz4 => {
            read_capped(lz4_flex::frame::FrameDecoder::new(bytes), max_bytes).context("lz4 decode")
        }
    }
}

fn read_capped<R: Read>(reader: R, max_bytes: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut capped = reader.take(max_bytes + 1);
    capped.read_to_end(&mut out).context("read stream")?;
    if out.len() as u64 > max_bytes {
        anyhow::bail!("decompressed package exceeds the {max_bytes} byte ceiling");
    }
    Ok(out)
}
