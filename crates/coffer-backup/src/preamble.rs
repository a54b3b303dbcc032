//! The self-describing header prepended, in the clear, to every stored
//! object. An object plus the encryption key is enough to recover file
//! identity during disaster recovery.
//!
//! Layout (big-endian):
//!
//! ```text
//!   u8   format_version
//!   u8   option_flags        // bit0: encrypted, bit1: iv inline, bit2: compressed
//!   u16  preamble_len_bytes  // total length including these four bytes
//!   [16] iv                  // present iff iv inline
//!   var  metadata            // tag-length-value sequence
//! ```

use crate::compression::CompressionKind;
use crate::error::{BackupError, Result};

/// Current preamble format version.
pub const PREAMBLE_FORMAT_VERSION: u8 = 1;

const FLAG_ENCRYPTED: u8 = 0b0000_0001;
const FLAG_IV_INLINE: u8 = 0b0000_0010;
const FLAG_COMPRESSED: u8 = 0b0000_0100;

const IV_LEN: usize = 16;
const HEADER_LEN: usize = 4;

const TAG_RELATIVE_PATH: u8 = 0x01;
const TAG_MODIFIED_TIME: u8 = 0x02;
const TAG_PLAINTEXT_SIZE: u8 = 0x03;
const TAG_COMPRESSION: u8 = 0x04;
const TAG_PRIMARY_DIGEST: u8 = 0x05;

/// Decoded object preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPreamble {
    pub version: u8,
    pub is_encrypted: bool,
    /// IV carried inline; `None` when the storage definition persists IVs in
    /// the database only.
    pub iv: Option<[u8; IV_LEN]>,
    pub compression: CompressionKind,
    /// Path of the original file relative to its discovery root.
    pub relative_path: String,
    /// Modified time as POSIX microseconds.
    pub modified_time_us: i64,
    pub plaintext_size: u64,
    /// Primary digest of the plaintext, lowercase hex.
    pub primary_digest: String,
    /// Tags this version does not understand, preserved verbatim.
    pub unknown_tags: Vec<(u8, Vec<u8>)>,
}

impl ObjectPreamble {
    /// Build a preamble for an object about to be written.
    pub fn new(
        is_encrypted: bool,
        iv: Option<[u8; IV_LEN]>,
        compression: CompressionKind,
        relative_path: String,
        modified_time_us: i64,
        plaintext_size: u64,
        primary_digest: String,
    ) -> Self {
        Self {
            version: PREAMBLE_FORMAT_VERSION,
            is_encrypted,
            iv,
            compression,
            relative_path,
            modified_time_us,
            plaintext_size,
            primary_digest,
            unknown_tags: Vec::new(),
        }
    }

    /// Encode to the wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut metadata = Vec::new();
        push_tag(&mut metadata, TAG_RELATIVE_PATH, self.relative_path.as_bytes())?;
        push_tag(&mut metadata, TAG_MODIFIED_TIME, &self.modified_time_us.to_be_bytes())?;
        push_tag(&mut metadata, TAG_PLAINTEXT_SIZE, &self.plaintext_size.to_be_bytes())?;
        push_tag(&mut metadata, TAG_COMPRESSION, &[self.compression.wire_id()])?;
        push_tag(&mut metadata, TAG_PRIMARY_DIGEST, self.primary_digest.as_bytes())?;
        for (tag, value) in &self.unknown_tags {
            push_tag(&mut metadata, *tag, value)?;
        }

        let iv_len = if self.iv.is_some() { IV_LEN } else { 0 };
        let total = HEADER_LEN + iv_len + metadata.len();
        let total_u16 = u16::try_from(total)
            .map_err(|_| BackupError::PreambleParse(format!("preamble of {total} bytes is too large")))?;

        let mut flags = 0u8;
        if self.is_encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if self.iv.is_some() {
            flags |= FLAG_IV_INLINE;
        }
        if self.compression.is_compressed() {
            flags |= FLAG_COMPRESSED;
        }

        let mut out = Vec::with_capacity(total);
        out.push(self.version);
        out.push(flags);
        out.extend_from_slice(&total_u16.to_be_bytes());
        if let Some(iv) = &self.iv {
            out.extend_from_slice(iv);
        }
        out.extend_from_slice(&metadata);
        Ok(out)
    }

    /// Total preamble length declared by the first four bytes of `buf`, or
    /// `None` when fewer than four bytes are available yet.
    pub fn declared_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(u16::from_be_bytes([buf[2], buf[3]]) as usize)
    }

    /// Decode a preamble from the start of `buf`, returning it along with
    /// the number of bytes consumed. Unknown tags are kept, not rejected.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return Err(BackupError::PreambleParse(format!(
                "need at least {HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let version = buf[0];
        let flags = buf[1];
        let total = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total < HEADER_LEN {
            return Err(BackupError::PreambleParse(format!(
                "declared length {total} is shorter than the fixed header"
            )));
        }
        if buf.len() < total {
            return Err(BackupError::PreambleParse(format!(
                "declared length {total} exceeds available {} bytes",
                buf.len()
            )));
        }

        let is_encrypted = flags & FLAG_ENCRYPTED != 0;
        let iv_inline = flags & FLAG_IV_INLINE != 0;
        let mut cursor = HEADER_LEN;
        let iv = if iv_inline {
            if total < HEADER_LEN + IV_LEN {
                return Err(BackupError::PreambleParse(
                    "iv-inline flag set but preamble too short for an IV".to_string(),
                ));
            }
            let mut iv = [0u8; IV_LEN];
            iv.copy_from_slice(&buf[cursor..cursor + IV_LEN]);
            cursor += IV_LEN;
            Some(iv)
        } else {
            None
        };

        let mut relative_path = None;
        let mut modified_time_us = None;
        let mut plaintext_size = None;
        let mut compression = None;
        let mut primary_digest = None;
        let mut unknown_tags = Vec::new();

        while cursor < total {
            if total - cursor < 3 {
                return Err(BackupError::PreambleParse("truncated tag header".to_string()));
            }
            let tag = buf[cursor];
            let len = u16::from_be_bytes([buf[cursor + 1], buf[cursor + 2]]) as usize;
            cursor += 3;
            if total - cursor < len {
                return Err(BackupError::PreambleParse("truncated tag value".to_string()));
            }
            let value = &buf[cursor..cursor + len];
            cursor += len;
            match tag {
                TAG_RELATIVE_PATH => {
                    relative_path = Some(
                        String::from_utf8(value.to_vec())
                            .map_err(|_| BackupError::PreambleParse("path is not UTF-8".to_string()))?,
                    )
                }
                TAG_MODIFIED_TIME => {
                    let arr: [u8; 8] = value
                        .try_into()
                        .map_err(|_| BackupError::PreambleParse("bad modified-time field".to_string()))?;
                    modified_time_us = Some(i64::from_be_bytes(arr));
                }
                TAG_PLAINTEXT_SIZE => {
                    let arr: [u8; 8] = value
                        .try_into()
                        .map_err(|_| BackupError::PreambleParse("bad size field".to_string()))?;
                    plaintext_size = Some(u64::from_be_bytes(arr));
                }
                TAG_COMPRESSION => {
                    if value.len() != 1 {
                        return Err(BackupError::PreambleParse("bad compression field".to_string()));
                    }
                    compression = Some(CompressionKind::from_wire_id(value[0])?);
                }
                TAG_PRIMARY_DIGEST => {
                    primary_digest = Some(
                        String::from_utf8(value.to_vec())
                            .map_err(|_| BackupError::PreambleParse("digest is not UTF-8".to_string()))?,
                    )
                }
                other => unknown_tags.push((other, value.to_vec())),
            }
        }

        let preamble = Self {
            version,
            is_encrypted,
            iv,
            compression: compression
                .ok_or_else(|| BackupError::PreambleParse("missing compression tag".to_string()))?,
            relative_path: relative_path
                .ok_or_else(|| BackupError::PreambleParse("missing path tag".to_string()))?,
            modified_time_us: modified_time_us
                .ok_or_else(|| BackupError::PreambleParse("missing modified-time tag".to_string()))?,
            plaintext_size: plaintext_size
                .ok_or_else(|| BackupError::PreambleParse("missing size tag".to_string()))?,
            primary_digest: primary_digest
                .ok_or_else(|| BackupError::PreambleParse("missing digest tag".to_string()))?,
            unknown_tags,
        };
        Ok((preamble, total))
    }
}

fn push_tag(out: &mut Vec<u8>, tag: u8, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| BackupError::PreambleParse(format!("tag {tag} value too large")))?;
    out.push(tag);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(iv: Option<[u8; 16]>) -> ObjectPreamble {
        ObjectPreamble::new(
            iv.is_some(),
            iv,
            CompressionKind::Zstd,
            "photos/2022/cat.jpg".to_string(),
            1_650_000_000_123_456,
            123_456_789,
            "ab".repeat(32),
        )
    }

    #[test]
    fn roundtrip_with_inline_iv() {
        let preamble = sample(Some([7u8; 16]));
        let encoded = preamble.encode().unwrap();
        assert_eq!(ObjectPreamble::declared_len(&encoded), Some(encoded.len()));
        let (decoded, consumed) = ObjectPreamble::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, preamble);
    }

    #[test]
    fn roundtrip_without_iv() {
        let preamble = sample(None);
        let encoded = preamble.encode().unwrap();
        let (decoded, _) = ObjectPreamble::decode(&encoded).unwrap();
        assert_eq!(decoded, preamble);
        assert!(decoded.iv.is_none());
    }

    #[test]
    fn unknown_tags_survive_roundtrip() {
        let mut preamble = sample(None);
        preamble.unknown_tags.push((0x7f, vec![1, 2, 3, 4]));
        let encoded = preamble.encode().unwrap();
        let (decoded, _) = ObjectPreamble::decode(&encoded).unwrap();
        assert_eq!(decoded.unknown_tags, vec![(0x7f, vec![1, 2, 3, 4])]);
        // Re-encoding keeps them.
        let (again, _) = ObjectPreamble::decode(&decoded.encode().unwrap()).unwrap();
        assert_eq!(again, decoded);
    }

    #[test]
    fn trailing_body_bytes_are_not_consumed() {
        let preamble = sample(Some([1u8; 16]));
        let mut encoded = preamble.encode().unwrap();
        let preamble_len = encoded.len();
        encoded.extend_from_slice(b"ciphertext follows");
        let (decoded, consumed) = ObjectPreamble::decode(&encoded).unwrap();
        assert_eq!(consumed, preamble_len);
        assert_eq!(decoded, preamble);
    }

    #[test]
    fn truncated_preamble_is_rejected() {
        let encoded = sample(None).encode().unwrap();
        for cut in [0, 1, 3, encoded.len() - 1] {
            assert!(ObjectPreamble::decode(&encoded[..cut]).is_err(), "cut {cut}");
        }
    }

    #[test]
    fn missing_required_tag_is_rejected() {
        // Hand-build a preamble with only the compression tag.
        let mut metadata = Vec::new();
        metadata.extend_from_slice(&[TAG_COMPRESSION, 0, 1, 0]);
        let total = (HEADER_LEN + metadata.len()) as u16;
        let mut buf = vec![PREAMBLE_FORMAT_VERSION, 0];
        buf.extend_from_slice(&total.to_be_bytes());
        buf.extend_from_slice(&metadata);
        assert!(ObjectPreamble::decode(&buf).is_err());
    }
}
