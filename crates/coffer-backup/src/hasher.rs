//! Content digesting. The set of algorithms is explicit configuration passed
//! to the drivers; SHA-256 is the primary algorithm whose hex digest is the
//! identity of file content throughout the history database.

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256, the primary algorithm.
    Sha256,
}

impl HashAlgorithm {
    /// Lowercase algorithm name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

/// Explicit hasher configuration; replaces any global algorithm registry.
#[derive(Debug, Clone)]
pub struct HasherConfig {
    algorithms: Vec<HashAlgorithm>,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            algorithms: vec![HashAlgorithm::Sha256],
        }
    }
}

impl HasherConfig {
    /// The primary (first) algorithm.
    pub fn primary(&self) -> HashAlgorithm {
        self.algorithms[0]
    }

    /// Create a hasher covering every configured algorithm.
    pub fn create_hasher(&self) -> MultiHasher {
        MultiHasher {
            states: self
                .algorithms
                .iter()
                .map(|a| match a {
                    HashAlgorithm::Sha256 => (HashAlgorithm::Sha256, HasherState::Sha256(Sha256::new())),
                })
                .collect(),
        }
    }
}

enum HasherState {
    Sha256(Sha256),
}

/// Feeds the same bytes to every configured algorithm at once.
pub struct MultiHasher {
    states: Vec<(HashAlgorithm, HasherState)>,
}

impl MultiHasher {
    pub fn update(&mut self, data: &[u8]) {
        for (_, state) in &mut self.states {
            match state {
                HasherState::Sha256(h) => h.update(data),
            }
        }
    }

    /// Hex digest of the primary algorithm, consuming the hasher.
    pub fn primary_hexdigest(self) -> String {
        let mut primary = None;
        for (algo, state) in self.states {
            let hexdigest = match state {
                HasherState::Sha256(h) => hex::encode(h.finalize()),
            };
            if primary.is_none() {
                primary = Some((algo, hexdigest));
            }
        }
        primary.map(|(_, d)| d).unwrap_or_default()
    }
}

/// Streaming SHA-256 hex digest of a file.
pub fn digest_file(config: &HasherConfig, path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = config.create_hasher();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.primary_hexdigest())
}

/// SHA-256 hex digest of an in-memory buffer.
pub fn digest_bytes(config: &HasherConfig, data: &[u8]) -> String {
    let mut hasher = config.create_hasher();
    hasher.update(data);
    hasher.primary_hexdigest()
}

/// A `Read` adapter that hashes and counts everything read through it.
///
/// The hash state and byte counter are shared handles so the digest can be
/// taken after a downstream consumer has driven the reader to EOF.
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: Arc<Mutex<Option<MultiHasher>>>,
    bytes_read: Arc<AtomicU64>,
}

impl<R: Read> HashingReader<R> {
    pub fn new(config: &HasherConfig, inner: R) -> Self {
        Self {
            inner,
            hasher: Arc::new(Mutex::new(Some(config.create_hasher()))),
            bytes_read: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared handles for retrieving the digest and byte count later.
    pub fn handles(&self) -> HashingHandles {
        HashingHandles {
            hasher: Arc::clone(&self.hasher),
            bytes_read: Arc::clone(&self.bytes_read),
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Ok(mut guard) = self.hasher.lock() {
                if let Some(h) = guard.as_mut() {
                    h.update(&buf[..n]);
                }
            }
            self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        }
        Ok(n)
    }
}

/// Shared view onto a [`HashingReader`]'s accumulated state.
#[derive(Clone)]
pub struct HashingHandles {
    hasher: Arc<Mutex<Option<MultiHasher>>>,
    bytes_read: Arc<AtomicU64>,
}

impl HashingHandles {
    /// Take the primary hex digest. Returns `None` if already taken.
    pub fn take_primary_hexdigest(&self) -> Option<String> {
        self.hasher
            .lock()
            .ok()
            .and_then(|mut g| g.take())
            .map(MultiHasher::primary_hexdigest)
    }

    /// Total bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digest_matches_known_vector() {
        let config = HasherConfig::default();
        // SHA-256 of the empty string.
        assert_eq!(
            digest_bytes(&config, b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            digest_bytes(&config, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_and_buffer_digests_agree() {
        let config = HasherConfig::default();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        tmp.write_all(&data).unwrap();
        let from_file = digest_file(&config, tmp.path()).unwrap();
        assert_eq!(from_file, digest_bytes(&config, &data));
    }

    #[test]
    fn hashing_reader_observes_all_bytes() {
        let config = HasherConfig::default();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = HashingReader::new(&config, data.as_slice());
        let handles = reader.handles();
        let mut sink = Vec::new();
        std::io::copy(&mut reader, &mut sink).unwrap();
        assert_eq!(sink, data);
        assert_eq!(handles.bytes_read(), data.len() as u64);
        assert_eq!(
            handles.take_primary_hexdigest().unwrap(),
            digest_bytes(&config, &data)
        );
        assert!(handles.take_primary_hexdigest().is_none());
    }
}
