//! Compression for backup object bodies. The backup path wraps the source
//! file reader with a compressing adapter so the cipher stream only ever
//! sees the compressed bytes; the restore path feeds decrypted chunks
//! through a write-side decompressor.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};

/// Compression algorithm applied to an object body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    None,
    Gzip,
    Zstd,
}

impl Default for CompressionKind {
    fn default() -> Self {
        CompressionKind::None
    }
}

impl CompressionKind {
    /// Single-byte identifier used in the object preamble.
    pub fn wire_id(&self) -> u8 {
        match self {
            CompressionKind::None => 0,
            CompressionKind::Gzip => 1,
            CompressionKind::Zstd => 2,
        }
    }

    /// Inverse of [`CompressionKind::wire_id`].
    pub fn from_wire_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressionKind::None),
            1 => Ok(CompressionKind::Gzip),
            2 => Ok(CompressionKind::Zstd),
            other => Err(BackupError::PreambleParse(format!(
                "unknown compression id {other}"
            ))),
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, CompressionKind::None)
    }
}

/// Compression effort level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Fast,
    Balanced,
    Best,
}

impl Default for CompressionLevel {
    fn default() -> Self {
        CompressionLevel::Balanced
    }
}

impl CompressionLevel {
    fn to_gzip_level(self) -> flate2::Compression {
        match self {
            CompressionLevel::Fast => flate2::Compression::fast(),
            CompressionLevel::Balanced => flate2::Compression::default(),
            CompressionLevel::Best => flate2::Compression::best(),
        }
    }

    fn to_zstd_level(self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

/// Per-storage-definition compression settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CompressionSettings {
    pub kind: CompressionKind,
    #[serde(default)]
    pub level: CompressionLevel,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            kind: CompressionKind::Zstd,
            level: CompressionLevel::Balanced,
        }
    }
}

impl CompressionSettings {
    pub fn disabled() -> Self {
        Self {
            kind: CompressionKind::None,
            level: CompressionLevel::Balanced,
        }
    }
}

/// Wrap `inner` so that reads yield the compressed form of its bytes.
pub fn compressing_reader(
    settings: CompressionSettings,
    inner: Box<dyn Read + Send>,
) -> Result<Box<dyn Read + Send>> {
    match settings.kind {
        CompressionKind::None => Ok(inner),
        CompressionKind::Gzip => Ok(Box::new(flate2::read::GzEncoder::new(
            inner,
            settings.level.to_gzip_level(),
        ))),
        CompressionKind::Zstd => {
            let encoder = zstd::stream::read::Encoder::new(inner, settings.level.to_zstd_level())
                .map_err(|e| BackupError::Compression(e.to_string()))?;
            Ok(Box::new(encoder))
        }
    }
}

enum DecompressorImpl {
    None(Vec<u8>),
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Zstd(zstd::stream::write::Decoder<'static, Vec<u8>>),
}

/// Write-side decompressor accumulating plaintext in an internal buffer the
/// caller drains chunk by chunk.
pub struct Decompressor {
    inner: DecompressorImpl,
}

impl Decompressor {
    pub fn new(kind: CompressionKind) -> Result<Self> {
        let inner = match kind {
            CompressionKind::None => DecompressorImpl::None(Vec::new()),
            CompressionKind::Gzip => DecompressorImpl::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            CompressionKind::Zstd => DecompressorImpl::Zstd(
                zstd::stream::write::Decoder::new(Vec::new())
                    .map_err(|e| BackupError::Compression(e.to_string()))?,
            ),
        };
        Ok(Self { inner })
    }

    /// Feed compressed bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.inner {
            DecompressorImpl::None(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            DecompressorImpl::Gzip(dec) => dec
                .write_all(data)
                .map_err(|e| BackupError::Compression(e.to_string())),
            DecompressorImpl::Zstd(dec) => dec
                .write_all(data)
                .map_err(|e| BackupError::Compression(e.to_string())),
        }
    }

    /// Drain the plaintext produced so far.
    pub fn take_output(&mut self) -> Vec<u8> {
        match &mut self.inner {
            DecompressorImpl::None(buf) => std::mem::take(buf),
            DecompressorImpl::Gzip(dec) => std::mem::take(dec.get_mut()),
            DecompressorImpl::Zstd(dec) => std::mem::take(dec.get_mut()),
        }
    }

    /// Flush the stream end and drain any remaining plaintext.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        match &mut self.inner {
            DecompressorImpl::None(_) => {}
            DecompressorImpl::Gzip(dec) => dec
                .try_finish()
                .map_err(|e| BackupError::Compression(e.to_string()))?,
            DecompressorImpl::Zstd(dec) => dec
                .flush()
                .map_err(|e| BackupError::Compression(e.to_string()))?,
        }
        Ok(self.take_output())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(settings: CompressionSettings, data: &[u8]) -> Vec<u8> {
        let mut compressed = Vec::new();
        let mut reader =
            compressing_reader(settings, Box::new(std::io::Cursor::new(data.to_vec()))).unwrap();
        reader.read_to_end(&mut compressed).unwrap();

        let mut dec = Decompressor::new(settings.kind).unwrap();
        let mut out = Vec::new();
        // Feed in awkward chunk sizes to exercise incremental output.
        for piece in compressed.chunks(13) {
            dec.write(piece).unwrap();
            out.extend_from_slice(&dec.take_output());
        }
        out.extend_from_slice(&dec.finish().unwrap());
        out
    }

    #[test]
    fn zstd_roundtrip() {
        let data = b"compressible compressible compressible ".repeat(500);
        let settings = CompressionSettings {
            kind: CompressionKind::Zstd,
            level: CompressionLevel::Balanced,
        };
        assert_eq!(roundtrip(settings, &data), data);
    }

    #[test]
    fn gzip_roundtrip() {
        let data = b"gzip gzip gzip gzip gzip ".repeat(500);
        let settings = CompressionSettings {
            kind: CompressionKind::Gzip,
            level: CompressionLevel::Fast,
        };
        assert_eq!(roundtrip(settings, &data), data);
    }

    #[test]
    fn none_roundtrip_is_identity() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        assert_eq!(roundtrip(CompressionSettings::disabled(), &data), data);
    }

    #[test]
    fn wire_ids_roundtrip() {
        for kind in [CompressionKind::None, CompressionKind::Gzip, CompressionKind::Zstd] {
            assert_eq!(CompressionKind::from_wire_id(kind.wire_id()).unwrap(), kind);
        }
        assert!(CompressionKind::from_wire_id(200).is_err());
    }
}
