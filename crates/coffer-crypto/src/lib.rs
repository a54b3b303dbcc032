//! # Coffer Crypto
//!
//! Client-side cryptography for the Coffer backup engine:
//!
//! - `aes_cbc`: incremental AES-256-CBC with PKCS#7 padding, shaped for
//!   chunked streaming (encrypt-as-you-read, decrypt with one block of
//!   retention so the padding block can be stripped at the end).
//! - `credential`: the data-encryption credential — key material, optional
//!   password wrapping via Argon2id, and a tagged binary form for vault
//!   storage and offline export.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aes_cbc;
pub mod credential;
pub mod error;

pub use aes_cbc::{AesCbcDecryptor, AesCbcEncryptor, BLOCK_SIZE, IV_SIZE, KEY_SIZE};
pub use credential::{Credential, ProtectionEnvelope};
pub use error::{CryptoError, CryptoResult};
