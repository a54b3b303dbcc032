//! Storage-definition records, the persisted configuration document, and
//! the immutable resolved view handed to the drivers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use coffer_crypto::Credential;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::compression::CompressionSettings;
use crate::constants::{
    CONFIG_VERSION, CONTAINER_AUTO_FIND_ATTEMPTS, CONTAINER_AUTO_FIND_CHAR,
    DEFAULT_DOWNLOAD_CHUNK_SIZE, DEFAULT_UPLOAD_CHUNK_SIZE, SECRET_FROM_VAULT_MARKER,
    STORAGE_SPECIFIER_PREFIX,
};
use crate::credentials::{
    CredentialKind, CredentialName, CredentialSet, CredentialSetExport, DescribedCredential,
    SecretVault,
};
use crate::error::{BackupError, Result, StorageError};
use crate::storage::filesystem::FilesystemStorage;
use crate::storage::s3::{S3DriverParams, S3Storage};
use crate::storage::StorageInterface;

/// Kind of object-store interface a storage definition targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceKind {
    /// Objects stored as files under a local directory.
    Filesystem,
    /// Generic multi-provider driver.
    Libcloud,
    /// Provider-native SDK driver.
    Native,
}

/// Encryption settings inside a storage-definition record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct EncryptionRecord {
    /// The data-encryption credential: either the vault indirection marker
    /// or base64 of the credential's binary form.
    pub key: String,
    /// Whether object preambles carry the IV inline.
    #[serde(default = "default_true")]
    pub persist_iv: bool,
}

fn default_true() -> bool {
    true
}

/// A persisted storage definition, keyed by lowercased name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct StorageDefRecord {
    pub unique_id: String,
    pub interface: InterfaceKind,
    pub provider: String,
    pub container: String,
    /// Driver parameters; the `secret` entry holds either the indirection
    /// marker or the secret itself.
    #[serde(default)]
    pub driver: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionRecord>,
    #[serde(default)]
    pub compression: CompressionSettings,
    #[serde(default = "default_upload_chunk_size")]
    pub upload_chunk_size: usize,
    #[serde(default = "default_download_chunk_size")]
    pub download_chunk_size: usize,
}

fn default_upload_chunk_size() -> usize {
    DEFAULT_UPLOAD_CHUNK_SIZE
}

fn default_download_chunk_size() -> usize {
    DEFAULT_DOWNLOAD_CHUNK_SIZE
}

/// The persisted configuration document holding all storage definitions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigDocument {
    #[serde(default = "default_config_version")]
    pub version: String,
    #[serde(default)]
    pub storage_definitions: BTreeMap<String, StorageDefRecord>,
}

fn default_config_version() -> String {
    CONFIG_VERSION.to_string()
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            storage_definitions: BTreeMap::new(),
        }
    }

    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let doc: ConfigDocument = serde_json::from_str(&text)?;
        let major = doc.version.split('.').next().unwrap_or("");
        if major != CONFIG_VERSION.split('.').next().unwrap_or("") {
            return Err(BackupError::Configuration(format!(
                "unsupported configuration version {}",
                doc.version
            )));
        }
        Ok(doc)
    }

    /// Save as JSON, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&StorageDefRecord> {
        self.storage_definitions.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut StorageDefRecord> {
        self.storage_definitions.get_mut(name)
    }
}

/// True when `name` is a valid storage definition name: lowercase
/// alphanumeric, underscore, hyphen.
pub fn is_storage_def_name_ok(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Parse a `storage:<name>` specifier, returning the lowercased name.
pub fn parse_storage_def_specifier(specifier: &str) -> Option<String> {
    specifier
        .strip_prefix(STORAGE_SPECIFIER_PREFIX)
        .map(|rest| rest.to_lowercase())
}

/// Immutable resolved view of a backup target.
#[derive(Debug)]
pub struct StorageDefinition {
    name: String,
    unique_id: String,
    interface: InterfaceKind,
    provider: String,
    container_name: String,
    driver_params: BTreeMap<String, String>,
    upload_chunk_size: usize,
    download_chunk_size: usize,
    compression: CompressionSettings,
    persist_iv: bool,
    credentials: CredentialSet,
    encryption: Option<Credential>,
    /// The configuration file this view was resolved from, when known;
    /// container auto-find writes the concrete name back through it.
    config_path: Option<PathBuf>,
}

impl StorageDefinition {
    /// Resolve `name` from the configuration document, pulling vault-backed
    /// credentials and unlocking the data-encryption key.
    ///
    /// `password` is required only when the encryption credential is
    /// password-protected.
    pub fn resolve(
        doc: &ConfigDocument,
        vault: &dyn SecretVault,
        name: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        let name = name.to_lowercase();
        if !is_storage_def_name_ok(&name) {
            return Err(BackupError::Configuration(format!(
                "invalid storage definition name '{name}'"
            )));
        }
        let record = doc
            .get(&name)
            .ok_or_else(|| BackupError::StorageDefNotFound(name.clone()))?;
        if record.upload_chunk_size == 0 || record.download_chunk_size == 0 {
            return Err(BackupError::Configuration(
                "chunk sizes must be positive".to_string(),
            ));
        }

        let credentials = load_credential_set(&name, record, vault)?;

        let encryption = match record.encryption {
            Some(_) => {
                let mut credential = credentials.encryption_credential()?.ok_or_else(|| {
                    BackupError::CredentialInvalid(format!(
                        "storage definition '{name}' is encrypted but has no data-encryption credential"
                    ))
                })?;
                if !credential.is_unlocked() {
                    let password = password.ok_or_else(|| {
                        BackupError::CredentialInvalid(
                            "a password is required to unlock the data-encryption key".to_string(),
                        )
                    })?;
                    credential.unprotect(password)?;
                }
                Some(credential)
            }
            None => None,
        };

        Ok(Self {
            name,
            unique_id: record.unique_id.clone(),
            interface: record.interface,
            provider: record.provider.clone(),
            container_name: record.container.clone(),
            driver_params: record.driver.clone(),
            upload_chunk_size: record.upload_chunk_size,
            download_chunk_size: record.download_chunk_size,
            compression: record.compression,
            persist_iv: record
                .encryption
                .as_ref()
                .map(|e| e.persist_iv)
                .unwrap_or(true),
            credentials,
            encryption,
            config_path: None,
        })
    }

    /// Like [`StorageDefinition::resolve`], loading the document from disk
    /// and remembering its path so container auto-find can persist the
    /// resolved name.
    pub fn resolve_from_file(
        config_path: &Path,
        vault: &dyn SecretVault,
        name: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        let doc = ConfigDocument::load(config_path)?;
        let mut def = Self::resolve(&doc, vault, name, password)?;
        def.config_path = Some(config_path.to_path_buf());
        Ok(def)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn interface_kind(&self) -> InterfaceKind {
        self.interface
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn upload_chunk_size(&self) -> usize {
        self.upload_chunk_size
    }

    pub fn download_chunk_size(&self) -> usize {
        self.download_chunk_size
    }

    pub fn compression(&self) -> CompressionSettings {
        self.compression
    }

    pub fn is_encryption_used(&self) -> bool {
        self.encryption.is_some()
    }

    /// Whether object preambles carry the IV inline.
    pub fn persist_iv_in_object(&self) -> bool {
        self.persist_iv
    }

    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    /// The unlocked data-encryption key.
    pub fn encryption_key(&self) -> Result<&[u8]> {
        match &self.encryption {
            Some(c) => Ok(c.key()?),
            None => Err(BackupError::CredentialInvalid(format!(
                "storage definition '{}' is not encrypted",
                self.name
            ))),
        }
    }

    /// Replace the container name on this view, normally with the concrete
    /// name an auto-find resolution produced.
    pub fn set_container_name(&mut self, name: impl Into<String>) {
        self.container_name = name.into();
    }

    /// Resolve a trailing-`*` auto-find container name against the live
    /// interface, returning the concrete name.
    ///
    /// On a successful auto-find the view is updated and, when this view
    /// was resolved from a configuration file, the concrete name is saved
    /// back into that file so later runs reuse the container instead of
    /// re-running auto-find. A name without the indicator passes through
    /// untouched.
    pub async fn resolve_and_persist_container(
        &mut self,
        interface: &dyn StorageInterface,
    ) -> Result<String> {
        let requested = self.container_name.clone();
        let resolved = resolve_container_name(interface, &requested).await?;
        if resolved != requested {
            self.set_container_name(resolved.clone());
            self.persist_container_name()?;
        }
        Ok(resolved)
    }

    fn persist_container_name(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let mut doc = ConfigDocument::load(path)?;
        let record = doc
            .get_mut(&self.name)
            .ok_or_else(|| BackupError::StorageDefNotFound(self.name.clone()))?;
        record.container = self.container_name.clone();
        doc.save(path)?;
        info!(
            "Updated storage definition '{}' with container name '{}'",
            self.name, self.container_name
        );
        Ok(())
    }

    /// Build the object-store client for this definition.
    pub async fn create_storage_interface(&self) -> Result<Arc<dyn StorageInterface>> {
        match self.interface {
            InterfaceKind::Filesystem => Ok(Arc::new(FilesystemStorage::new())),
            InterfaceKind::Libcloud | InterfaceKind::Native => match self.provider.as_str() {
                "aws-s3" | "s3" => {
                    let secret = self
                        .credentials
                        .storage_secret()?
                        .map(|s| String::from_utf8_lossy(&s).to_string());
                    let params = S3DriverParams {
                        region: self.driver_params.get("region").cloned(),
                        endpoint: self.driver_params.get("endpoint").cloned(),
                        access_key: self.driver_params.get("key").cloned(),
                        secret_key: secret,
                    };
                    Ok(Arc::new(S3Storage::new(params).await?))
                }
                other => Err(BackupError::Configuration(format!(
                    "unsupported storage provider '{other}'"
                ))),
            },
        }
    }
}

/// Build the credential set for a record, pulling vault-backed slots and
/// taking inline values as-is.
fn load_credential_set(
    name: &str,
    record: &StorageDefRecord,
    vault: &dyn SecretVault,
) -> Result<CredentialSet> {
    let mut credentials = CredentialSet::new(name.to_string());
    let mut vault_slots = Vec::new();
    if let Some(secret) = record.driver.get("secret") {
        if secret == SECRET_FROM_VAULT_MARKER {
            vault_slots.push(CredentialName::StorageAccess);
        } else {
            credentials.set(DescribedCredential {
                config_name: name.to_string(),
                name: CredentialName::StorageAccess,
                kind: CredentialKind::ActualSecret,
                material: secret.clone().into_bytes(),
            });
        }
    }
    if let Some(enc) = &record.encryption {
        if enc.key == SECRET_FROM_VAULT_MARKER {
            vault_slots.push(CredentialName::DataEncryption);
        } else {
            let material = BASE64.decode(&enc.key).map_err(|e| {
                BackupError::CredentialInvalid(format!("bad base64 encryption key: {e}"))
            })?;
            credentials.set(DescribedCredential {
                config_name: name.to_string(),
                name: CredentialName::DataEncryption,
                kind: CredentialKind::ActualSecret,
                material,
            });
        }
    }
    credentials.populate(vault, &vault_slots)?;
    Ok(credentials)
}

/// Resolve a possibly auto-find container name against the live interface.
///
/// A trailing `*` means "find or create a unique container": a UUID suffix
/// is appended and creation retried within a fixed attempt budget.
pub async fn resolve_container_name(
    interface: &dyn StorageInterface,
    requested: &str,
) -> Result<String> {
    if !requested.ends_with(CONTAINER_AUTO_FIND_CHAR) {
        return Ok(requested.to_string());
    }
    let base = requested
        .trim_end_matches(CONTAINER_AUTO_FIND_CHAR)
        .trim_end_matches('-');
    info!(
        "Container name has the {} auto-find/create indicator, deriving from base '{}'",
        CONTAINER_AUTO_FIND_CHAR, base
    );
    let mut last_error = String::new();
    for _ in 0..CONTAINER_AUTO_FIND_ATTEMPTS {
        let candidate = format!("{}-{}", base, Uuid::new_v4().simple());
        match interface.create_container(&candidate).await {
            Ok(container) => {
                info!("Created container '{}'", container.name());
                return Ok(candidate);
            }
            Err(StorageError::ContainerAlreadyExists(_)) => {
                last_error = format!("candidate '{candidate}' already exists");
                continue;
            }
            Err(StorageError::InvalidContainerName(name)) => {
                return Err(StorageError::InvalidContainerName(name).into())
            }
            Err(other) => {
                last_error = other.to_string();
                continue;
            }
        }
    }
    Err(StorageError::ContainerAutoCreateFailed(format!(
        "gave up after {CONTAINER_AUTO_FIND_ATTEMPTS} attempts: {last_error}"
    ))
    .into())
}

/// Parameters for creating a storage definition.
pub struct CreateStorageDefParams {
    pub name: String,
    pub interface: InterfaceKind,
    pub provider: String,
    pub container: String,
    pub driver: BTreeMap<String, String>,
    /// Storage-access secret pushed to the vault, if any.
    pub storage_secret: Option<Vec<u8>>,
    /// Data-encryption credential pushed to the vault, if any.
    pub encryption: Option<Credential>,
    pub persist_iv: bool,
    pub compression: CompressionSettings,
}

/// Create and persist a storage definition, indirecting secrets to the vault.
pub fn create_storage_definition(
    doc: &mut ConfigDocument,
    vault: &dyn SecretVault,
    params: CreateStorageDefParams,
) -> Result<String> {
    let name = params.name.to_lowercase();
    if !is_storage_def_name_ok(&name) {
        return Err(BackupError::Configuration(format!(
            "invalid storage definition name '{name}': allowed characters are lowercase alphanumeric, underscore, hyphen"
        )));
    }
    if doc.get(&name).is_some() {
        return Err(BackupError::Configuration(format!(
            "storage definition '{name}' already exists; delete it first or choose another name"
        )));
    }

    let mut credentials = CredentialSet::new(name.clone());
    let mut driver = params.driver;
    if let Some(secret) = params.storage_secret {
        credentials.set(DescribedCredential {
            config_name: name.clone(),
            name: CredentialName::StorageAccess,
            kind: secret_kind_for(&secret),
            material: secret,
        });
        driver.insert("secret".to_string(), SECRET_FROM_VAULT_MARKER.to_string());
    }
    let encryption = match &params.encryption {
        Some(credential) => {
            credentials.set_encryption_credential(credential)?;
            Some(EncryptionRecord {
                key: SECRET_FROM_VAULT_MARKER.to_string(),
                persist_iv: params.persist_iv,
            })
        }
        None => None,
    };
    credentials.save(vault)?;

    let record = StorageDefRecord {
        unique_id: Uuid::new_v4().to_string(),
        interface: params.interface,
        provider: params.provider,
        container: params.container,
        driver,
        encryption,
        compression: params.compression,
        upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        download_chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
    };
    doc.storage_definitions.insert(name.clone(), record);
    info!("Storage definition '{}' saved", name);
    Ok(name)
}

/// A storage secret naming an existing credentials file, directly or through
/// an environment variable, is stored as a reference rather than a value.
fn secret_kind_for(secret: &[u8]) -> CredentialKind {
    if let Ok(text) = std::str::from_utf8(secret) {
        if Path::new(text).is_file() {
            return CredentialKind::FilenameRef;
        }
        if let Ok(value) = std::env::var(text) {
            if Path::new(&value).is_file() {
                return CredentialKind::EnvVarRef;
            }
        }
    }
    CredentialKind::ActualSecret
}

/// Delete a storage definition and its vault entries.
pub fn delete_storage_definition(
    doc: &mut ConfigDocument,
    vault: &dyn SecretVault,
    name: &str,
) -> Result<()> {
    let name = name.to_lowercase();
    if doc.storage_definitions.remove(&name).is_none() {
        return Err(BackupError::StorageDefNotFound(name));
    }
    CredentialSet::new(name).delete_from_vault(vault)?;
    Ok(())
}

/// Replace the storage-access secret of an existing definition.
pub fn set_storage_secret(
    doc: &mut ConfigDocument,
    vault: &dyn SecretVault,
    name: &str,
    secret: Vec<u8>,
) -> Result<()> {
    let name = name.to_lowercase();
    let record = doc
        .get_mut(&name)
        .ok_or_else(|| BackupError::StorageDefNotFound(name.clone()))?;
    let mut credentials = CredentialSet::new(name.clone());
    credentials.set(DescribedCredential {
        config_name: name.clone(),
        name: CredentialName::StorageAccess,
        kind: secret_kind_for(&secret),
        material: secret,
    });
    credentials.save(vault)?;
    record
        .driver
        .insert("secret".to_string(), SECRET_FROM_VAULT_MARKER.to_string());
    Ok(())
}

/// Change or set the password protecting the data-encryption key.
///
/// `current_password` unlocks an already-protected key; `new_password`
/// re-wraps it (or `None` leaves the key stored unwrapped).
pub fn set_encryption_password(
    doc: &mut ConfigDocument,
    vault: &dyn SecretVault,
    name: &str,
    current_password: Option<&str>,
    new_password: Option<&str>,
) -> Result<()> {
    let name = name.to_lowercase();
    let record = doc
        .get(&name)
        .ok_or_else(|| BackupError::StorageDefNotFound(name.clone()))?
        .clone();
    if record.encryption.is_none() {
        return Err(BackupError::Configuration(format!(
            "storage definition '{name}' is not encrypted"
        )));
    }
    let mut credentials = load_credential_set(&name, &record, vault)?;
    let mut credential = credentials.encryption_credential()?.ok_or_else(|| {
        BackupError::CredentialInvalid(format!("no data-encryption credential for '{name}'"))
    })?;
    if !credential.is_unlocked() {
        let password = current_password.ok_or_else(|| {
            BackupError::CredentialInvalid(
                "the current password is required to change the protection".to_string(),
            )
        })?;
        credential.unprotect(password)?;
    }
    match new_password {
        Some(password) => credential.protect(password)?,
        None => credential.clear_protection()?,
    }
    credentials.set_encryption_credential(&credential)?;
    credentials.save(vault)?;
    if let Some(enc) = doc
        .get_mut(&name)
        .and_then(|r| r.encryption.as_mut())
    {
        enc.key = SECRET_FROM_VAULT_MARKER.to_string();
    }
    Ok(())
}

/// Exported storage definition with cleartext secrets, for offline backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageDefExport {
    pub version: String,
    pub name: String,
    pub record: StorageDefRecord,
    pub credentials: CredentialSetExport,
}

/// Export `name` with its secrets in the clear.
pub fn export_storage_definition(
    doc: &ConfigDocument,
    vault: &dyn SecretVault,
    name: &str,
) -> Result<StorageDefExport> {
    let name = name.to_lowercase();
    let record = doc
        .get(&name)
        .ok_or_else(|| BackupError::StorageDefNotFound(name.clone()))?
        .clone();
    let credentials = load_credential_set(&name, &record, vault)?;

    Ok(StorageDefExport {
        version: CONFIG_VERSION.to_string(),
        name: name.clone(),
        record,
        credentials: credentials.export_cleartext(),
    })
}

/// Import an exported storage definition, re-indirecting its secrets into
/// the vault. Returns the name the definition was imported under.
pub fn import_storage_definition(
    doc: &mut ConfigDocument,
    vault: &dyn SecretVault,
    export: &StorageDefExport,
    new_name: Option<&str>,
) -> Result<String> {
    let name = new_name.unwrap_or(&export.name).to_lowercase();
    if !is_storage_def_name_ok(&name) {
        return Err(BackupError::Configuration(format!(
            "invalid storage definition name '{name}'"
        )));
    }
    let credentials = CredentialSet::import_cleartext(&export.credentials, Some(&name))?;
    credentials.save(vault)?;

    let mut record = export.record.clone();
    if credentials.get(CredentialName::StorageAccess).is_some() {
        record
            .driver
            .insert("secret".to_string(), SECRET_FROM_VAULT_MARKER.to_string());
    }
    if let Some(enc) = &mut record.encryption {
        enc.key = SECRET_FROM_VAULT_MARKER.to_string();
    }
    doc.storage_definitions.insert(name.clone(), record);
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryVault;

    fn create_params(name: &str, container: &str) -> CreateStorageDefParams {
        CreateStorageDefParams {
            name: name.to_string(),
            interface: InterfaceKind::Filesystem,
            provider: "filesystem".to_string(),
            container: container.to_string(),
            driver: BTreeMap::new(),
            storage_secret: Some(b"topsecret".to_vec()),
            encryption: Some(Credential::generate()),
            persist_iv: true,
            compression: CompressionSettings::default(),
        }
    }

    #[test]
    fn name_validation() {
        assert!(is_storage_def_name_ok("my-backup_01"));
        assert!(!is_storage_def_name_ok("My-Backup"));
        assert!(!is_storage_def_name_ok(""));
        assert!(!is_storage_def_name_ok("has space"));
    }

    #[test]
    fn specifier_parsing() {
        assert_eq!(
            parse_storage_def_specifier("storage:MyBackup"),
            Some("mybackup".to_string())
        );
        assert_eq!(parse_storage_def_specifier("/some/dir"), None);
    }

    #[test]
    fn create_resolve_roundtrip_with_vault_indirection() {
        let vault = MemoryVault::new();
        let mut doc = ConfigDocument::new();
        let name =
            create_storage_definition(&mut doc, &vault, create_params("MyBackup", "/tmp/c")).unwrap();
        assert_eq!(name, "mybackup");

        let record = doc.get("mybackup").unwrap();
        assert_eq!(
            record.driver.get("secret").unwrap(),
            SECRET_FROM_VAULT_MARKER
        );
        assert_eq!(
            record.encryption.as_ref().unwrap().key,
            SECRET_FROM_VAULT_MARKER
        );

        let def = StorageDefinition::resolve(&doc, &vault, "mybackup", None).unwrap();
        assert!(def.is_encryption_used());
        assert_eq!(def.encryption_key().unwrap().len(), coffer_crypto::KEY_SIZE);
        assert_eq!(
            def.credentials().storage_secret().unwrap().unwrap(),
            b"topsecret".to_vec()
        );
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let vault = MemoryVault::new();
        let mut doc = ConfigDocument::new();
        create_storage_definition(&mut doc, &vault, create_params("dup", "/tmp/c")).unwrap();
        assert!(create_storage_definition(&mut doc, &vault, create_params("dup", "/tmp/c")).is_err());
    }

    #[test]
    fn password_protected_key_requires_password() {
        let vault = MemoryVault::new();
        let mut doc = ConfigDocument::new();
        let mut credential = Credential::generate();
        credential.protect("P1").unwrap();
        let mut params = create_params("locked", "/tmp/c");
        params.encryption = Some(credential);
        create_storage_definition(&mut doc, &vault, params).unwrap();

        assert!(StorageDefinition::resolve(&doc, &vault, "locked", None).is_err());
        let err = StorageDefinition::resolve(&doc, &vault, "locked", Some("P1x")).unwrap_err();
        assert!(matches!(
            err,
            BackupError::Crypto(coffer_crypto::CryptoError::PasswordAuthenticationFailure)
        ));
        let def = StorageDefinition::resolve(&doc, &vault, "locked", Some("P1")).unwrap();
        assert!(def.is_encryption_used());
    }

    #[test]
    fn password_rotation_rewraps_the_key() {
        let vault = MemoryVault::new();
        let mut doc = ConfigDocument::new();
        let mut credential = Credential::generate();
        credential.protect("P1").unwrap();
        let mut params = create_params("rotate", "/tmp/c");
        params.encryption = Some(credential);
        create_storage_definition(&mut doc, &vault, params).unwrap();

        set_encryption_password(&mut doc, &vault, "rotate", Some("P1"), Some("P2")).unwrap();
        assert!(StorageDefinition::resolve(&doc, &vault, "rotate", Some("P1")).is_err());
        assert!(StorageDefinition::resolve(&doc, &vault, "rotate", Some("P2")).is_ok());

        // Removing protection leaves the key usable without a password.
        set_encryption_password(&mut doc, &vault, "rotate", Some("P2"), None).unwrap();
        assert!(StorageDefinition::resolve(&doc, &vault, "rotate", None).is_ok());
    }

    #[test]
    fn storage_secret_rotation() {
        let vault = MemoryVault::new();
        let mut doc = ConfigDocument::new();
        create_storage_definition(&mut doc, &vault, create_params("rot2", "/tmp/c")).unwrap();
        set_storage_secret(&mut doc, &vault, "rot2", b"rotated".to_vec()).unwrap();
        let def = StorageDefinition::resolve(&doc, &vault, "rot2", None).unwrap();
        assert_eq!(
            def.credentials().storage_secret().unwrap().unwrap(),
            b"rotated".to_vec()
        );
    }

    #[test]
    fn export_import_roundtrip() {
        let vault = MemoryVault::new();
        let mut doc = ConfigDocument::new();
        create_storage_definition(&mut doc, &vault, create_params("orig", "/tmp/c")).unwrap();
        let export = export_storage_definition(&doc, &vault, "orig").unwrap();

        // Import into a fresh config + vault under a new name.
        let vault2 = MemoryVault::new();
        let mut doc2 = ConfigDocument::new();
        let imported = import_storage_definition(&mut doc2, &vault2, &export, Some("copy")).unwrap();
        assert_eq!(imported, "copy");
        let def = StorageDefinition::resolve(&doc2, &vault2, "copy", None).unwrap();
        assert_eq!(
            def.credentials().storage_secret().unwrap().unwrap(),
            b"topsecret".to_vec()
        );
        assert!(def.is_encryption_used());
    }

    #[test]
    fn config_document_save_load() {
        let vault = MemoryVault::new();
        let mut doc = ConfigDocument::new();
        create_storage_definition(&mut doc, &vault, create_params("persisted", "/tmp/c")).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("coffer-config.json");
        doc.save(&path).unwrap();
        let loaded = ConfigDocument::load(&path).unwrap();
        assert_eq!(loaded.storage_definitions, doc.storage_definitions);
    }

    #[tokio::test]
    async fn container_auto_find_creates_unique_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("containers").join("backup");
        let requested = format!("{}*", base.display());
        let interface = FilesystemStorage::new();
        let resolved = resolve_container_name(&interface, &requested).await.unwrap();
        assert!(resolved.starts_with(&format!("{}-", base.display())));
        assert!(Path::new(&resolved).is_dir());
    }

    #[tokio::test]
    async fn auto_find_resolution_persists_the_concrete_name() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("coffer-config.json");
        let base = tmp.path().join("containers").join("bak");
        let vault = MemoryVault::new();
        let mut doc = ConfigDocument::new();
        create_storage_definition(
            &mut doc,
            &vault,
            create_params("autofind", &format!("{}*", base.display())),
        )
        .unwrap();
        doc.save(&config_path).unwrap();

        let mut def =
            StorageDefinition::resolve_from_file(&config_path, &vault, "autofind", None).unwrap();
        let interface = def.create_storage_interface().await.unwrap();
        let resolved = def
            .resolve_and_persist_container(interface.as_ref())
            .await
            .unwrap();
        assert!(!resolved.ends_with(CONTAINER_AUTO_FIND_CHAR));
        assert_eq!(def.container_name(), resolved);
        assert!(Path::new(&resolved).is_dir());

        // The saved record carries the concrete name, so the next resolve
        // reuses the container instead of re-running auto-find.
        let reloaded = ConfigDocument::load(&config_path).unwrap();
        assert_eq!(reloaded.get("autofind").unwrap().container, resolved);
        let mut def2 =
            StorageDefinition::resolve_from_file(&config_path, &vault, "autofind", None).unwrap();
        assert_eq!(def2.container_name(), resolved);
        let again = def2
            .resolve_and_persist_container(interface.as_ref())
            .await
            .unwrap();
        assert_eq!(again, resolved);
    }

    #[tokio::test]
    async fn plain_container_name_is_passed_through() {
        let interface = FilesystemStorage::new();
        let resolved = resolve_container_name(&interface, "/tmp/fixed-name").await.unwrap();
        assert_eq!(resolved, "/tmp/fixed-name");
    }
}
