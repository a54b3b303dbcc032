//! Fixed-size chunk readers over a byte source, with optional in-stream
//! AES-CBC encryption. Storage drivers expect to see exactly `chunk_size`
//! bytes per read until the final short chunk; an empty chunk signals EOF.

use std::io::Read;
use std::path::Path;

use bytes::Bytes;
use coffer_crypto::{AesCbcEncryptor, BLOCK_SIZE};

use crate::error::{BackupError, Result};

/// Reads a byte source in chunks of a fixed size, optionally encrypting the
/// stream as it goes.
///
/// Out-of-band bytes can be queued ahead of the stream either as raw
/// cleartext (used for the object preamble) or as plaintext to be encrypted
/// along with the rest of the stream.
pub struct ChunkReader {
    source: Box<dyn Read + Send>,
    chunk_size: usize,
    encryptor: Option<AesCbcEncryptor>,
    pending: Vec<u8>,
    eof: bool,
    label: String,
}

impl ChunkReader {
    /// Create a chunk reader over an arbitrary source.
    pub fn new(
        source: Box<dyn Read + Send>,
        chunk_size: usize,
        encryptor: Option<AesCbcEncryptor>,
        label: impl Into<String>,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(BackupError::InvalidState(
                "chunk_size must be positive".to_string(),
            ));
        }
        Ok(Self {
            source,
            chunk_size,
            encryptor,
            pending: Vec::with_capacity(chunk_size + BLOCK_SIZE),
            eof: false,
            label: label.into(),
        })
    }

    /// Open `path` and wrap it in a chunk reader.
    pub fn open(
        path: &Path,
        chunk_size: usize,
        encryptor: Option<AesCbcEncryptor>,
    ) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::new(
            Box::new(file),
            chunk_size,
            encryptor,
            path.display().to_string(),
        )
    }

    /// True once the empty EOF chunk has been returned.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Queue bytes that enter the output stream as-is, before anything not
    /// yet read from the source. Used to prepend the cleartext preamble.
    pub fn queue_cleartext(&mut self, data: &[u8]) -> Result<()> {
        self.check_queue(data)?;
        self.pending.extend_from_slice(data);
        Ok(())
    }

    /// Queue bytes that pass through the encryptor (when one is present)
    /// before entering the output stream.
    pub fn queue_plaintext(&mut self, data: &[u8]) -> Result<()> {
        self.check_queue(data)?;
        match &mut self.encryptor {
            Some(enc) => {
                let ciphertext = enc.update(data)?;
                self.pending.extend_from_slice(&ciphertext);
            }
            None => self.pending.extend_from_slice(data),
        }
        Ok(())
    }

    fn check_queue(&self, data: &[u8]) -> Result<()> {
        if self.eof {
            return Err(BackupError::AlreadyEof(self.label.clone()));
        }
        if data.is_empty() {
            return Err(BackupError::InvalidState(
                "queued data must contain bytes".to_string(),
            ));
        }
        Ok(())
    }

    /// Read the next chunk.
    ///
    /// Returns exactly `chunk_size` bytes until the source is exhausted, then
    /// one final short (possibly empty) chunk, then an empty chunk marking
    /// EOF. Reading again after EOF fails with `already-eof`.
    pub fn read_chunk(&mut self) -> Result<Bytes> {
        if self.eof {
            return Err(BackupError::AlreadyEof(self.label.clone()));
        }

        let finalized = self.encryptor.as_ref().map_or(false, AesCbcEncryptor::is_finalized);
        if !finalized {
            // Read slightly past the chunk size when encrypting so block
            // buffering inside the encryptor does not starve the chunk.
            let slack = if self.encryptor.is_some() { BLOCK_SIZE * 3 } else { 0 };
            let mut buf = vec![0u8; self.chunk_size + slack];
            while self.pending.len() < self.chunk_size {
                let want = (self.chunk_size - self.pending.len() + slack).min(buf.len());
                let n = self.source.read(&mut buf[..want])?;
                if n == 0 {
                    if let Some(enc) = &mut self.encryptor {
                        let last = enc.finalize()?;
                        self.pending.extend_from_slice(&last);
                    }
                    break;
                }
                match &mut self.encryptor {
                    Some(enc) => {
                        let ciphertext = enc.update(&buf[..n])?;
                        self.pending.extend_from_slice(&ciphertext);
                    }
                    None => self.pending.extend_from_slice(&buf[..n]),
                }
            }
        }

        let chunk: Vec<u8> = if self.pending.len() <= self.chunk_size {
            std::mem::take(&mut self.pending)
        } else {
            self.pending.drain(..self.chunk_size).collect()
        };
        self.eof = chunk.is_empty();
        Ok(Bytes::from(chunk))
    }
}
