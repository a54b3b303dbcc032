//! Data-encryption credential material: a 32-byte AES key, optionally
//! wrapped with a password-derived key (Argon2id) and carried in a small
//! tagged binary form suitable for a secret vault or an offline export.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::aes_cbc::{self, AesCbcDecryptor, AesCbcEncryptor, IV_SIZE, KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// Salt size for the password KDF.
pub const SALT_SIZE: usize = 16;

/// Authentication tag size stored alongside the wrapped key.
pub const AUTH_TAG_SIZE: usize = 32;

const FORMAT_VERSION: u8 = 1;

const TAG_KEY: u8 = 0x01;
const TAG_KDF_PARAMS: u8 = 0x02;
const TAG_SALT: u8 = 0x03;
const TAG_AUTH_TAG: u8 = 0x04;
const TAG_IV: u8 = 0x05;
const TAG_WRAPPED_KEY: u8 = 0x06;

/// Parameters and material for a password-wrapped key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionEnvelope {
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
    pub salt: [u8; SALT_SIZE],
    pub auth_tag: [u8; AUTH_TAG_SIZE],
    pub iv: [u8; IV_SIZE],
    pub wrapped_key: Vec<u8>,
}

/// A data-encryption credential.
///
/// Holds the plaintext key when unlocked, the protection envelope when
/// password-wrapped, or both immediately after a successful `unprotect`.
#[derive(Debug, Clone)]
pub struct Credential {
    key: Option<Zeroizing<Vec<u8>>>,
    envelope: Option<ProtectionEnvelope>,
}

impl Credential {
    /// Create a credential with a freshly generated random key.
    pub fn generate() -> Self {
        Self {
            key: Some(Zeroizing::new(aes_cbc::random_key().to_vec())),
            envelope: None,
        }
    }

    /// Create a credential from existing key bytes.
    pub fn from_key(key: &[u8]) -> CryptoResult<Self> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            key: Some(Zeroizing::new(key.to_vec())),
            envelope: None,
        })
    }

    /// True when the plaintext key is immediately available.
    pub fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }

    /// True when the key is password-wrapped.
    pub fn is_protected(&self) -> bool {
        self.envelope.is_some()
    }

    /// The plaintext key bytes.
    pub fn key(&self) -> CryptoResult<&[u8]> {
        self.key
            .as_deref()
            .map(Vec::as_slice)
            .ok_or_else(|| CryptoError::CredentialInvalid("key is not unlocked".to_string()))
    }

    /// Wrap the key with a password-derived key and clear the plaintext key.
    pub fn protect(&mut self, password: &str) -> CryptoResult<()> {
        let key = self
            .key
            .take()
            .ok_or_else(|| CryptoError::CredentialInvalid("no key material to protect".to_string()))?;

        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let (memory_cost, time_cost, parallelism) = (
            Params::DEFAULT_M_COST,
            Params::DEFAULT_T_COST,
            Params::DEFAULT_P_COST,
        );
        let derived = derive_secret(password, &salt, memory_cost, time_cost, parallelism)?;
        let (wrap_key, auth_tag) = derived.split_at(KEY_SIZE);

        let iv = aes_cbc::random_iv();
        let wrapped_key = aes_cbc::encrypt_all(wrap_key, &iv, &key)?;

        let mut tag = [0u8; AUTH_TAG_SIZE];
        tag.copy_from_slice(auth_tag);
        self.envelope = Some(ProtectionEnvelope {
            memory_cost,
            time_cost,
            parallelism,
            salt,
            auth_tag: tag,
            iv,
            wrapped_key,
        });
        Ok(())
    }

    /// Unwrap the key using `password`.
    ///
    /// A wrong password fails with [`CryptoError::PasswordAuthenticationFailure`]
    /// before any decryption is attempted.
    pub fn unprotect(&mut self, password: &str) -> CryptoResult<()> {
        let envelope = self
            .envelope
            .as_ref()
            .ok_or_else(|| CryptoError::CredentialInvalid("credential is not password-protected".to_string()))?;

        let derived = derive_secret(
            password,
            &envelope.salt,
            envelope.memory_cost,
            envelope.time_cost,
            envelope.parallelism,
        )?;
        let (wrap_key, auth_tag) = derived.split_at(KEY_SIZE);
        if auth_tag != envelope.auth_tag {
            return Err(CryptoError::PasswordAuthenticationFailure);
        }

        let key = aes_cbc::decrypt_all(wrap_key, &envelope.iv, &envelope.wrapped_key)?;
        if key.len() != KEY_SIZE {
            return Err(CryptoError::SecretDerivation(format!(
                "unwrapped key has {} bytes, expected {KEY_SIZE}",
                key.len()
            )));
        }
        self.key = Some(Zeroizing::new(key));
        Ok(())
    }

    /// Drop the protection envelope, leaving only the unlocked key.
    pub fn clear_protection(&mut self) -> CryptoResult<()> {
        if self.key.is_none() {
            return Err(CryptoError::CredentialInvalid(
                "unlock the key before removing protection".to_string(),
            ));
        }
        self.envelope = None;
        Ok(())
    }

    /// Serialize to the tagged binary form.
    ///
    /// A protected credential serializes its envelope only; the plaintext key
    /// is written only for unprotected credentials.
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        let mut out = vec![FORMAT_VERSION];
        if let Some(env) = &self.envelope {
            let mut params = Vec::with_capacity(12);
            params.extend_from_slice(&env.memory_cost.to_be_bytes());
            params.extend_from_slice(&env.time_cost.to_be_bytes());
            params.extend_from_slice(&env.parallelism.to_be_bytes());
            push_field(&mut out, TAG_KDF_PARAMS, &params)?;
            push_field(&mut out, TAG_SALT, &env.salt)?;
            push_field(&mut out, TAG_AUTH_TAG, &env.auth_tag)?;
            push_field(&mut out, TAG_IV, &env.iv)?;
            push_field(&mut out, TAG_WRAPPED_KEY, &env.wrapped_key)?;
        } else if let Some(key) = &self.key {
            push_field(&mut out, TAG_KEY, key)?;
        } else {
            return Err(CryptoError::CredentialInvalid(
                "credential has neither key nor envelope".to_string(),
            ));
        }
        Ok(out)
    }

    /// Parse the tagged binary form produced by [`Credential::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        if data.is_empty() || data[0] != FORMAT_VERSION {
            return Err(CryptoError::CredentialInvalid(
                "unrecognized credential format".to_string(),
            ));
        }
        let mut key: Option<Zeroizing<Vec<u8>>> = None;
        let mut params: Option<(u32, u32, u32)> = None;
        let mut salt: Option<[u8; SALT_SIZE]> = None;
        let mut auth_tag: Option<[u8; AUTH_TAG_SIZE]> = None;
        let mut iv: Option<[u8; IV_SIZE]> = None;
        let mut wrapped_key: Option<Vec<u8>> = None;

        let mut rest = &data[1..];
        while !rest.is_empty() {
            if rest.len() < 3 {
                return Err(CryptoError::CredentialInvalid("truncated field header".to_string()));
            }
            let tag = rest[0];
            let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
            rest = &rest[3..];
            if rest.len() < len {
                return Err(CryptoError::CredentialInvalid("truncated field value".to_string()));
            }
            let value = &rest[..len];
            rest = &rest[len..];
            match tag {
                TAG_KEY => key = Some(Zeroizing::new(value.to_vec())),
                TAG_KDF_PARAMS => {
                    if len != 12 {
                        return Err(CryptoError::CredentialInvalid("bad KDF parameter field".to_string()));
                    }
                    params = Some((
                        u32::from_be_bytes(value[0..4].try_into().unwrap_or_default()),
                        u32::from_be_bytes(value[4..8].try_into().unwrap_or_default()),
                        u32::from_be_bytes(value[8..12].try_into().unwrap_or_default()),
                    ));
                }
                TAG_SALT => salt = value.try_into().ok(),
                TAG_AUTH_TAG => auth_tag = value.try_into().ok(),
                TAG_IV => iv = value.try_into().ok(),
                TAG_WRAPPED_KEY => wrapped_key = Some(value.to_vec()),
                // Unknown fields are skipped for forward compatibility.
                _ => {}
            }
        }

        let envelope = match (params, salt, auth_tag, iv, wrapped_key) {
            (Some((m, t, p)), Some(salt), Some(auth_tag), Some(iv), Some(wrapped_key)) => {
                Some(ProtectionEnvelope {
                    memory_cost: m,
                    time_cost: t,
                    parallelism: p,
                    salt,
                    auth_tag,
                    iv,
                    wrapped_key,
                })
            }
            (None, None, None, None, None) => None,
            _ => {
                return Err(CryptoError::CredentialInvalid(
                    "incomplete protection envelope".to_string(),
                ))
            }
        };
        if envelope.is_none() && key.is_none() {
            return Err(CryptoError::CredentialInvalid(
                "credential has neither key nor envelope".to_string(),
            ));
        }
        if let Some(k) = &key {
            if k.len() != KEY_SIZE {
                return Err(CryptoError::InvalidKey(format!(
                    "expected {KEY_SIZE} bytes, got {}",
                    k.len()
                )));
            }
        }
        Ok(Self { key, envelope })
    }

    /// Encrypt arbitrary data with this credential's key and a caller IV.
    pub fn encryptor(&self, iv: &[u8]) -> CryptoResult<AesCbcEncryptor> {
        AesCbcEncryptor::new(self.key()?, iv)
    }

    /// Decrypt arbitrary data with this credential's key and a caller IV.
    pub fn decryptor(&self, iv: &[u8]) -> CryptoResult<AesCbcDecryptor> {
        AesCbcDecryptor::new(self.key()?, iv)
    }
}

fn push_field(out: &mut Vec<u8>, tag: u8, value: &[u8]) -> CryptoResult<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| CryptoError::CredentialInvalid("field too large".to_string()))?;
    out.push(tag);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
    Ok(())
}

/// Derive 64 bytes from a password with Argon2id: the first 32 are the
/// wrapping key, the last 32 the stored authentication tag.
fn derive_secret(
    password: &str,
    salt: &[u8],
    memory_cost: u32,
    time_cost: u32,
    parallelism: u32,
) -> CryptoResult<Zeroizing<Vec<u8>>> {
    let params = Params::new(memory_cost, time_cost, parallelism, None)
        .map_err(|e| CryptoError::SecretDerivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = Zeroizing::new(vec![0u8; KEY_SIZE + AUTH_TAG_SIZE]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut out[..])
        .map_err(|e| CryptoError::SecretDerivation(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protect_then_unprotect_roundtrip() {
        let mut cred = Credential::generate();
        let original = cred.key().unwrap().to_vec();

        cred.protect("correct horse").unwrap();
        assert!(cred.is_protected());
        assert!(!cred.is_unlocked());

        cred.unprotect("correct horse").unwrap();
        assert!(cred.is_unlocked());
        assert_eq!(cred.key().unwrap(), original.as_slice());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let mut cred = Credential::generate();
        cred.protect("P1").unwrap();
        assert!(matches!(
            cred.unprotect("P1x"),
            Err(CryptoError::PasswordAuthenticationFailure)
        ));
        // The right password still works afterwards.
        cred.unprotect("P1").unwrap();
    }

    #[test]
    fn bytes_roundtrip_unprotected() {
        let cred = Credential::generate();
        let bytes = cred.to_bytes().unwrap();
        let parsed = Credential::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.key().unwrap(), cred.key().unwrap());
        assert!(!parsed.is_protected());
    }

    #[test]
    fn bytes_roundtrip_protected() {
        let mut cred = Credential::generate();
        let original = {
            let k = cred.key().unwrap().to_vec();
            cred.protect("pw").unwrap();
            k
        };
        let bytes = cred.to_bytes().unwrap();
        let mut parsed = Credential::from_bytes(&bytes).unwrap();
        assert!(parsed.is_protected());
        assert!(!parsed.is_unlocked());
        parsed.unprotect("pw").unwrap();
        assert_eq!(parsed.key().unwrap(), original.as_slice());
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(Credential::from_bytes(&[]).is_err());
        assert!(Credential::from_bytes(&[9, 9, 9]).is_err());
        assert!(Credential::from_bytes(&[FORMAT_VERSION]).is_err());
    }
}
