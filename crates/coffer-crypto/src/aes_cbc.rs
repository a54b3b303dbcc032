//! AES-256-CBC with PKCS#7 padding, exposed as incremental update/finalize
//! pairs so callers can push plaintext or ciphertext through in arbitrarily
//! sized pieces and still observe clean block-aligned output.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Initialization vector size in bytes (one block).
pub const IV_SIZE: usize = BLOCK_SIZE;

/// Generate a random IV suitable for [`AesCbcEncryptor`].
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Generate a random AES-256 key.
pub fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn build_cipher(key: &[u8]) -> CryptoResult<Aes256> {
    Aes256::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey(format!("expected {KEY_SIZE} bytes, got {}", key.len())))
}

fn check_iv(iv: &[u8]) -> CryptoResult<[u8; IV_SIZE]> {
    if iv.len() != IV_SIZE {
        return Err(CryptoError::InvalidIv {
            expected: IV_SIZE,
            actual: iv.len(),
        });
    }
    let mut out = [0u8; IV_SIZE];
    out.copy_from_slice(iv);
    Ok(out)
}

/// Incremental AES-CBC encryptor.
///
/// `update` emits ciphertext for every complete input block; `finalize` pads
/// the remaining partial block with PKCS#7 (a full padding block when the
/// plaintext is block-aligned) and emits the final ciphertext block.
pub struct AesCbcEncryptor {
    cipher: Aes256,
    chain: [u8; BLOCK_SIZE],
    iv: [u8; IV_SIZE],
    buffered: Vec<u8>,
    finalized: bool,
}

impl AesCbcEncryptor {
    /// Create an encryptor from a 32-byte key and 16-byte IV.
    pub fn new(key: &[u8], iv: &[u8]) -> CryptoResult<Self> {
        let iv = check_iv(iv)?;
        Ok(Self {
            cipher: build_cipher(key)?,
            chain: iv,
            iv,
            buffered: Vec::with_capacity(BLOCK_SIZE * 2),
            finalized: false,
        })
    }

    /// The IV this encryptor was constructed with.
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Feed plaintext, returning any ciphertext produced by now-complete blocks.
    pub fn update(&mut self, input: &[u8]) -> CryptoResult<Vec<u8>> {
        if self.finalized {
            return Err(CryptoError::AlreadyFinalized);
        }
        self.buffered.extend_from_slice(input);
        let complete = self.buffered.len() / BLOCK_SIZE;
        if complete == 0 {
            return Ok(Vec::new());
        }
        let take = complete * BLOCK_SIZE;
        let mut out = Vec::with_capacity(take);
        let blocks: Vec<[u8; BLOCK_SIZE]> = self.buffered[..take]
            .chunks_exact(BLOCK_SIZE)
            .map(|b| b.try_into().unwrap())
            .collect();
        for block in &blocks {
            out.extend_from_slice(&self.encrypt_block(block));
        }
        self.buffered.drain(..take);
        Ok(out)
    }

    /// Pad and emit the final block. The instance cannot be used afterwards.
    pub fn finalize(&mut self) -> CryptoResult<Vec<u8>> {
        if self.finalized {
            return Err(CryptoError::AlreadyFinalized);
        }
        self.finalized = true;
        if self.buffered.len() >= BLOCK_SIZE {
            return Err(CryptoError::EncryptionDecryption(format!(
                "unexpected {} buffered bytes at finalize, expected at most {}",
                self.buffered.len(),
                BLOCK_SIZE - 1
            )));
        }
        let padding = (BLOCK_SIZE - self.buffered.len()) as u8;
        let mut block = std::mem::take(&mut self.buffered);
        block.resize(BLOCK_SIZE, padding);
        Ok(self.encrypt_block(&block).to_vec())
    }

    fn encrypt_block(&mut self, block: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut ga = GenericArray::clone_from_slice(block);
        for (b, c) in ga.iter_mut().zip(self.chain.iter()) {
            *b ^= *c;
        }
        self.cipher.encrypt_block(&mut ga);
        self.chain.copy_from_slice(&ga);
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&ga);
        out
    }
}

/// Incremental AES-CBC decryptor.
///
/// One complete block is always retained across `update` calls so that the
/// final block, which carries the PKCS#7 padding, can be stripped during
/// `finalize`. Padding validation is strict: the padding length must be in
/// `[1, 16]` and every padding byte must equal that length.
pub struct AesCbcDecryptor {
    cipher: Aes256,
    chain: [u8; BLOCK_SIZE],
    iv: [u8; IV_SIZE],
    buffered: Vec<u8>,
    finalized: bool,
}

impl AesCbcDecryptor {
    /// Create a decryptor from a 32-byte key and 16-byte IV.
    pub fn new(key: &[u8], iv: &[u8]) -> CryptoResult<Self> {
        let iv = check_iv(iv)?;
        Ok(Self {
            cipher: build_cipher(key)?,
            chain: iv,
            iv,
            buffered: Vec::with_capacity(BLOCK_SIZE * 2),
            finalized: false,
        })
    }

    /// The IV this decryptor was constructed with.
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Feed ciphertext, returning plaintext for every block that can no
    /// longer be the final (padded) block.
    pub fn update(&mut self, input: &[u8]) -> CryptoResult<Vec<u8>> {
        if self.finalized {
            return Err(CryptoError::AlreadyFinalized);
        }
        self.buffered.extend_from_slice(input);
        let complete = self.buffered.len() / BLOCK_SIZE;
        let remainder = self.buffered.len() % BLOCK_SIZE;
        // A trailing remainder means more ciphertext is still coming, so none
        // of the complete blocks can be the final one.
        let blocks_to_update = if remainder > 0 {
            complete
        } else {
            complete.saturating_sub(1)
        };
        if blocks_to_update == 0 {
            return Ok(Vec::new());
        }
        let take = blocks_to_update * BLOCK_SIZE;
        let mut out = Vec::with_capacity(take);
        let blocks: Vec<[u8; BLOCK_SIZE]> = self.buffered[..take]
            .chunks_exact(BLOCK_SIZE)
            .map(|b| b.try_into().unwrap())
            .collect();
        for block in &blocks {
            out.extend_from_slice(&self.decrypt_block(block));
        }
        self.buffered.drain(..take);
        if self.buffered.len() > BLOCK_SIZE {
            return Err(CryptoError::EncryptionDecryption(format!(
                "buffered data of {} bytes is unexpectedly too much",
                self.buffered.len()
            )));
        }
        Ok(out)
    }

    /// Decrypt the retained final block and strip its padding.
    pub fn finalize(&mut self) -> CryptoResult<Vec<u8>> {
        if self.finalized {
            return Err(CryptoError::AlreadyFinalized);
        }
        self.finalized = true;
        if self.buffered.len() != BLOCK_SIZE {
            return Err(CryptoError::EncryptionDecryption(format!(
                "final data of {} bytes is unexpected, expected exactly {}",
                self.buffered.len(),
                BLOCK_SIZE
            )));
        }
        let block = std::mem::take(&mut self.buffered);
        let plain = self.decrypt_block(&block);
        let padding = plain[BLOCK_SIZE - 1] as usize;
        if padding == 0 || padding > BLOCK_SIZE {
            return Err(CryptoError::EncryptionDecryption(format!(
                "last block ends with {padding} which is not a valid padding byte"
            )));
        }
        let boundary = BLOCK_SIZE - padding;
        for &b in &plain[boundary..] {
            if b as usize != padding {
                return Err(CryptoError::EncryptionDecryption(format!(
                    "expected padding byte value {padding} but got {b}"
                )));
            }
        }
        Ok(plain[..boundary].to_vec())
    }

    fn decrypt_block(&mut self, block: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut saved = [0u8; BLOCK_SIZE];
        saved.copy_from_slice(block);
        let mut ga = GenericArray::clone_from_slice(block);
        self.cipher.decrypt_block(&mut ga);
        for (b, c) in ga.iter_mut().zip(self.chain.iter()) {
            *b ^= *c;
        }
        self.chain = saved;
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&ga);
        out
    }
}

/// One-shot helper: encrypt `plaintext` in a single call.
pub fn encrypt_all(key: &[u8], iv: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut enc = AesCbcEncryptor::new(key, iv)?;
    let mut out = enc.update(plaintext)?;
    out.extend_from_slice(&enc.finalize()?);
    Ok(out)
}

/// One-shot helper: decrypt `ciphertext` in a single call.
pub fn decrypt_all(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut dec = AesCbcDecryptor::new(key, iv)?;
    let mut out = dec.update(ciphertext)?;
    out.extend_from_slice(&dec.finalize()?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_SIZE] {
        let mut k = [0u8; KEY_SIZE];
        for (i, b) in k.iter_mut().enumerate() {
            *b = i as u8;
        }
        k
    }

    #[test]
    fn roundtrip_all_lengths_to_sixteen_blocks() {
        let key = key();
        let iv = random_iv();
        for len in 0..=(BLOCK_SIZE * BLOCK_SIZE) {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let ciphertext = encrypt_all(&key, &iv, &plaintext).unwrap();
            assert_eq!(ciphertext.len(), (len / BLOCK_SIZE + 1) * BLOCK_SIZE);
            let recovered = decrypt_all(&key, &iv, &ciphertext).unwrap();
            assert_eq!(recovered, plaintext, "length {len}");
        }
    }

    #[test]
    fn incremental_matches_one_shot() {
        let key = key();
        let iv = random_iv();
        let plaintext: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
        let expected = encrypt_all(&key, &iv, &plaintext).unwrap();

        for feed in [1usize, 7, 16, 17, 64, 333] {
            let mut enc = AesCbcEncryptor::new(&key, &iv).unwrap();
            let mut out = Vec::new();
            for piece in plaintext.chunks(feed) {
                out.extend_from_slice(&enc.update(piece).unwrap());
            }
            out.extend_from_slice(&enc.finalize().unwrap());
            assert_eq!(out, expected, "feed size {feed}");

            let mut dec = AesCbcDecryptor::new(&key, &iv).unwrap();
            let mut plain = Vec::new();
            for piece in expected.chunks(feed) {
                plain.extend_from_slice(&dec.update(piece).unwrap());
            }
            plain.extend_from_slice(&dec.finalize().unwrap());
            assert_eq!(plain, plaintext, "feed size {feed}");
        }
    }

    #[test]
    fn update_after_finalize_fails() {
        let key = key();
        let iv = random_iv();
        let mut enc = AesCbcEncryptor::new(&key, &iv).unwrap();
        enc.finalize().unwrap();
        assert!(matches!(enc.update(b"x"), Err(CryptoError::AlreadyFinalized)));
        assert!(matches!(enc.finalize(), Err(CryptoError::AlreadyFinalized)));
    }

    #[test]
    fn corrupted_padding_is_rejected() {
        let key = key();
        let iv = random_iv();
        let mut ciphertext = encrypt_all(&key, &iv, b"hello world").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(matches!(
            decrypt_all(&key, &iv, &ciphertext),
            Err(CryptoError::EncryptionDecryption(_))
        ));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let key = key();
        let iv = random_iv();
        let err = decrypt_all(&key, &iv, &[]).unwrap_err();
        assert!(matches!(err, CryptoError::EncryptionDecryption(_)));
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let iv = random_iv();
        assert!(matches!(
            AesCbcEncryptor::new(&[0u8; 16], &iv),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn wrong_iv_is_rejected() {
        let key = key();
        assert!(matches!(
            AesCbcEncryptor::new(&key, &[0u8; 8]),
            Err(CryptoError::InvalidIv { .. })
        ));
    }
}
