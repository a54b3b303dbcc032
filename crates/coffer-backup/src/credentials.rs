//! Described credentials bound to a storage definition, the secret-vault
//! contract, and the credential set that moves material between the vault,
//! the configuration record, and offline export files.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use coffer_crypto::Credential;
use serde::{Deserialize, Serialize};

use crate::constants::{CRED_NAME_DATA_ENCRYPTION, CRED_NAME_STORAGE_ACCESS};
use crate::error::{BackupError, Result};

/// Which credential slot of a storage definition a secret belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialName {
    StorageAccess,
    DataEncryption,
}

impl CredentialName {
    /// The vault username for this slot.
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialName::StorageAccess => CRED_NAME_STORAGE_ACCESS,
            CredentialName::DataEncryption => CRED_NAME_DATA_ENCRYPTION,
        }
    }
}

/// How the stored material is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    /// The material is the secret itself.
    ActualSecret,
    /// The material names a file whose content is the secret.
    FilenameRef,
    /// The material names an environment variable holding the secret or the
    /// path of a file holding it.
    EnvVarRef,
}

impl CredentialKind {
    fn wire_id(&self) -> u8 {
        match self {
            CredentialKind::ActualSecret => 0,
            CredentialKind::FilenameRef => 1,
            CredentialKind::EnvVarRef => 2,
        }
    }

    fn from_wire_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CredentialKind::ActualSecret),
            1 => Ok(CredentialKind::FilenameRef),
            2 => Ok(CredentialKind::EnvVarRef),
            other => Err(BackupError::CredentialInvalid(format!(
                "unknown credential kind {other}"
            ))),
        }
    }
}

/// One secret, described by its slot and interpretation.
#[derive(Debug, Clone)]
pub struct DescribedCredential {
    pub config_name: String,
    pub name: CredentialName,
    pub kind: CredentialKind,
    pub material: Vec<u8>,
}

impl DescribedCredential {
    /// Encode kind + material for vault storage.
    fn to_vault_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.kind.wire_id()];
        out.extend_from_slice(&self.material);
        out
    }

    fn from_vault_bytes(config_name: &str, name: CredentialName, data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(BackupError::CredentialInvalid(format!(
                "empty vault entry for {}/{}",
                config_name,
                name.as_str()
            )));
        }
        Ok(Self {
            config_name: config_name.to_string(),
            name,
            kind: CredentialKind::from_wire_id(data[0])?,
            material: data[1..].to_vec(),
        })
    }

    /// Follow filename/env-var indirection and return the effective secret.
    pub fn resolve_material(&self) -> Result<Vec<u8>> {
        match self.kind {
            CredentialKind::ActualSecret => Ok(self.material.clone()),
            CredentialKind::FilenameRef => {
                let path = String::from_utf8(self.material.clone()).map_err(|_| {
                    BackupError::CredentialInvalid("filename reference is not UTF-8".to_string())
                })?;
                Ok(std::fs::read(&path)?)
            }
            CredentialKind::EnvVarRef => {
                let var = String::from_utf8(self.material.clone()).map_err(|_| {
                    BackupError::CredentialInvalid("env var reference is not UTF-8".to_string())
                })?;
                let value = std::env::var(&var).map_err(|_| {
                    BackupError::CredentialInvalid(format!("environment variable {var} is not set"))
                })?;
                if std::path::Path::new(&value).is_file() {
                    Ok(std::fs::read(&value)?)
                } else {
                    Ok(value.into_bytes())
                }
            }
        }
    }
}

/// The get/set/delete contract of the process's credential vault. Entries
/// are addressed by `(service = storage-def name, username = slot name)`.
pub trait SecretVault: Send + Sync {
    fn get(&self, service: &str, username: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, service: &str, username: &str, secret: &[u8]) -> Result<()>;
    fn delete(&self, service: &str, username: &str) -> Result<()>;
}

/// In-memory vault for tests and embedding.
#[derive(Default)]
pub struct MemoryVault {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretVault for MemoryVault {
    fn get(&self, service: &str, username: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| BackupError::InvalidState("vault poisoned".to_string()))?;
        Ok(entries.get(&(service.to_string(), username.to_string())).cloned())
    }

    fn set(&self, service: &str, username: &str, secret: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BackupError::InvalidState("vault poisoned".to_string()))?;
        entries.insert((service.to_string(), username.to_string()), secret.to_vec());
        Ok(())
    }

    fn delete(&self, service: &str, username: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BackupError::InvalidState("vault poisoned".to_string()))?;
        entries.remove(&(service.to_string(), username.to_string()));
        Ok(())
    }
}

/// The credentials bound to one storage definition: at most one per slot.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    config_name: String,
    credentials: Vec<DescribedCredential>,
}

impl CredentialSet {
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            credentials: Vec::new(),
        }
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    /// Insert or replace the credential for its slot.
    pub fn set(&mut self, credential: DescribedCredential) {
        self.credentials.retain(|c| c.name != credential.name);
        self.credentials.push(credential);
    }

    pub fn get(&self, name: CredentialName) -> Option<&DescribedCredential> {
        self.credentials.iter().find(|c| c.name == name)
    }

    /// The resolved storage-access secret, if one is present.
    pub fn storage_secret(&self) -> Result<Option<Vec<u8>>> {
        match self.get(CredentialName::StorageAccess) {
            Some(c) => Ok(Some(c.resolve_material()?)),
            None => Ok(None),
        }
    }

    /// Parse the data-encryption credential material.
    pub fn encryption_credential(&self) -> Result<Option<Credential>> {
        match self.get(CredentialName::DataEncryption) {
            Some(c) => Ok(Some(Credential::from_bytes(&c.material)?)),
            None => Ok(None),
        }
    }

    /// Store a data-encryption credential's current form as material.
    pub fn set_encryption_credential(&mut self, credential: &Credential) -> Result<()> {
        self.set(DescribedCredential {
            config_name: self.config_name.clone(),
            name: CredentialName::DataEncryption,
            kind: CredentialKind::ActualSecret,
            material: credential.to_bytes()?,
        });
        Ok(())
    }

    /// Fetch vault-backed material for every slot named in `slots`.
    ///
    /// Callers pass the slots whose configuration value is the indirection
    /// marker; everything else already lives in the record itself.
    pub fn populate(&mut self, vault: &dyn SecretVault, slots: &[CredentialName]) -> Result<()> {
        for name in slots {
            let data = vault.get(&self.config_name, name.as_str())?.ok_or_else(|| {
                BackupError::CredentialInvalid(format!(
                    "vault entry not found for {}/{}",
                    self.config_name,
                    name.as_str()
                ))
            })?;
            let cred = DescribedCredential::from_vault_bytes(&self.config_name, *name, &data)?;
            self.set(cred);
        }
        Ok(())
    }

    /// Push every credential's material to the vault.
    pub fn save(&self, vault: &dyn SecretVault) -> Result<()> {
        for cred in &self.credentials {
            vault.set(&self.config_name, cred.name.as_str(), &cred.to_vault_bytes())?;
        }
        Ok(())
    }

    /// Remove every slot from the vault.
    pub fn delete_from_vault(&self, vault: &dyn SecretVault) -> Result<()> {
        for name in [CredentialName::StorageAccess, CredentialName::DataEncryption] {
            vault.delete(&self.config_name, name.as_str())?;
        }
        Ok(())
    }

    /// Cleartext export of every credential for offline backup.
    pub fn export_cleartext(&self) -> CredentialSetExport {
        CredentialSetExport {
            config_name: self.config_name.clone(),
            credentials: self
                .credentials
                .iter()
                .map(|c| CredentialExport {
                    name: c.name,
                    kind: c.kind,
                    material_base64: BASE64.encode(&c.material),
                })
                .collect(),
        }
    }

    /// Rebuild a set from an export, optionally under a new name.
    pub fn import_cleartext(export: &CredentialSetExport, new_name: Option<&str>) -> Result<Self> {
        let config_name = new_name.unwrap_or(&export.config_name).to_string();
        let mut set = CredentialSet::new(config_name.clone());
        for c in &export.credentials {
            let material = BASE64.decode(&c.material_base64).map_err(|e| {
                BackupError::CredentialInvalid(format!("bad base64 in credential export: {e}"))
            })?;
            set.set(DescribedCredential {
                config_name: config_name.clone(),
                name: c.name,
                kind: c.kind,
                material,
            });
        }
        Ok(set)
    }
}

/// Serialized form of one exported credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CredentialExport {
    pub name: CredentialName,
    pub kind: CredentialKind,
    pub material_base64: String,
}

/// Serialized form of an exported credential set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CredentialSetExport {
    pub config_name: String,
    pub credentials: Vec<CredentialExport>,
}
