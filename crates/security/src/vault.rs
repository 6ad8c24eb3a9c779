//! Encrypted secrets vault.
//!
//! Values are sealed with AES-256-GCM under a key derived from a passphrase
//! (PBKDF2-HMAC-SHA256) that lives outside the repository. The key name is
//! bound as associated data, so a ciphertext moved to another key fails to
//! open. A cleartext index beside the vault holds per-key metadata and is all
//! that `list` touches.
//!
//! Every operation writes one audit record naming the key, never the value.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use warden_config::VaultConfig;
use warden_core::{ErrorKind, GatewayError};

use crate::audit::{AuditLogger, AuditOp, AuditOutcome, RequestTag};
use crate::lock::FileLock;

const VAULT_FORMAT: u32 = 1;
const VERIFIER_KEY: &str = "warden:verifier";
const VERIFIER_PLAINTEXT: &[u8] = b"warden-vault-v1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// An encrypted value with its nonce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedValue {
    /// Random 96-bit nonce, unique per encryption.
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// Ciphertext with the GCM tag appended.
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

/// On-disk vault container.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultFile {
    format: u32,
    #[serde(with = "b64")]
    salt: Vec<u8>,
    kdf_iterations: u32,
    verifier: EncryptedValue,
    #[serde(default)]
    entries: BTreeMap<String, EncryptedValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct IndexEntry {
    created_at: DateTime<Utc>,
    last_rotated_at: DateTime<Utc>,
    access_count: u64,
}

impl IndexEntry {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_rotated_at: now,
            access_count: 0,
        }
    }
}

/// Metadata for one stored secret. Never carries the value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretMetadata {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub last_rotated_at: DateTime<Utc>,
    pub access_count: u64,
}

/// Errors from vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Vault is locked: {0}")]
    Locked(String),

    #[error("Vault {} is in use by another process", .0.display())]
    InUse(PathBuf),

    #[error("Secret key not found")]
    KeyNotFound,

    #[error("Secret key already exists")]
    KeyAlreadyExists,

    #[error("Vault storage error: {0}")]
    Io(#[from] io::Error),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Locked(_) | Self::InUse(_) => ErrorKind::VaultLocked,
            Self::KeyNotFound => ErrorKind::KeyNotFound,
            Self::KeyAlreadyExists => ErrorKind::KeyAlreadyExists,
            Self::Io(_) => ErrorKind::ExecutionFailed,
        }
    }
}

impl From<VaultError> for GatewayError {
    fn from(e: VaultError) -> Self {
        let reason = match &e {
            VaultError::Io(_) => "vault storage could not be updated".to_string(),
            other => other.to_string(),
        };
        GatewayError::new(e.kind(), reason)
    }
}

/// Seals and opens values with the derived key.
struct VaultCipher {
    cipher: Aes256Gcm,
}

impl VaultCipher {
    fn derive(passphrase: &str, salt: &[u8], iterations: u32) -> Result<Self, VaultError> {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| VaultError::Locked("key derivation failed".into()))?;
        Ok(Self { cipher })
    }

    fn encrypt(&self, key_name: &str, plaintext: &[u8]) -> Result<EncryptedValue, VaultError> {
        let nonce = random_bytes(NONCE_LEN);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: key_name.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Locked("encryption failed".into()))?;
        Ok(EncryptedValue { nonce, ciphertext })
    }

    fn decrypt(&self, key_name: &str, value: &EncryptedValue) -> Result<Vec<u8>, VaultError> {
        if value.nonce.len() != NONCE_LEN {
            return Err(VaultError::Locked("vault entry is corrupt".into()));
        }
        self.cipher
            .decrypt(
                Nonce::from_slice(&value.nonce),
                Payload {
                    msg: &value.ciphertext,
                    aad: key_name.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Locked("wrong passphrase or corrupt vault".into()))
    }
}

struct VaultState {
    salt: Vec<u8>,
    kdf_iterations: u32,
    verifier: EncryptedValue,
    entries: BTreeMap<String, EncryptedValue>,
}

impl VaultState {
    fn to_file(&self) -> VaultFile {
        VaultFile {
            format: VAULT_FORMAT,
            salt: self.salt.clone(),
            kdf_iterations: self.kdf_iterations,
            verifier: self.verifier.clone(),
            entries: self.entries.clone(),
        }
    }
}

/// The secrets vault. Exclusively owns its container and index files.
pub struct SecretsVault {
    _lock: FileLock,
    path: PathBuf,
    index_path: PathBuf,
    cipher: VaultCipher,
    state: RwLock<VaultState>,
    index: Mutex<BTreeMap<String, IndexEntry>>,
    audit: Arc<AuditLogger>,
}

impl std::fmt::Debug for SecretsVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsVault")
            .field("path", &self.path)
            .field("index_path", &self.index_path)
            .finish_non_exhaustive()
    }
}

impl SecretsVault {
    /// Open the configured vault. Fails with `Locked` when no passphrase is
    /// available.
    pub fn from_config(config: &VaultConfig, audit: Arc<AuditLogger>) -> Result<Self, VaultError> {
        let passphrase = config.passphrase().ok_or_else(|| {
            VaultError::Locked(format!(
                "no passphrase: set {} or vault.passphrase_file",
                config.passphrase_env
            ))
        })?;
        Self::open(
            &config.resolved_path(),
            &config.resolved_index_path(),
            &passphrase,
            config.kdf_iterations,
            audit,
        )
    }

    /// Open the vault at `path`, creating an empty one when the file does not
    /// exist. `kdf_iterations` only applies to a new vault; an existing one
    /// keeps the count it was created with. Fails with `InUse` while another
    /// handle owns the vault.
    pub fn open(
        path: &Path,
        index_path: &Path,
        passphrase: &str,
        kdf_iterations: u32,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, VaultError> {
        if passphrase.is_empty() {
            return Err(VaultError::Locked("empty passphrase".into()));
        }
        let lock =
            FileLock::try_acquire(path)?.ok_or_else(|| VaultError::InUse(path.to_path_buf()))?;

        let (cipher, state) = if path.exists() {
            let file = read_vault_file(path)?;
            let cipher = VaultCipher::derive(passphrase, &file.salt, file.kdf_iterations)?;
            check_verifier(&cipher, &file.verifier)?;
            let state = VaultState {
                salt: file.salt,
                kdf_iterations: file.kdf_iterations,
                verifier: file.verifier,
                entries: file.entries,
            };
            (cipher, state)
        } else {
            let salt = random_bytes(SALT_LEN);
            let cipher = VaultCipher::derive(passphrase, &salt, kdf_iterations)?;
            let verifier = cipher.encrypt(VERIFIER_KEY, VERIFIER_PLAINTEXT)?;
            let state = VaultState {
                salt,
                kdf_iterations,
                verifier,
                entries: BTreeMap::new(),
            };
            write_json_atomic(path, &state.to_file())?;
            tracing::info!(path = %path.display(), "Created new secrets vault");
            (cipher, state)
        };

        let index = reconcile_index(read_index(index_path), &state.entries);
        write_json_atomic(index_path, &index)?;

        tracing::debug!(path = %path.display(), keys = state.entries.len(), "Secrets vault opened");
        Ok(Self {
            _lock: lock,
            path: path.to_path_buf(),
            index_path: index_path.to_path_buf(),
            cipher,
            state: RwLock::new(state),
            index: Mutex::new(index),
            audit,
        })
    }

    /// Store a new secret.
    pub fn add(&self, tag: &RequestTag, key: &str, value: &str) -> Result<(), VaultError> {
        let result = self.add_inner(key, value);
        self.audit_outcome(tag, AuditOp::SecretAdd, key, &result, |_| "secret added".into());
        result
    }

    fn add_inner(&self, key: &str, value: &str) -> Result<(), VaultError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.entries.contains_key(key) {
            return Err(VaultError::KeyAlreadyExists);
        }
        let sealed = self.cipher.encrypt(key, value.as_bytes())?;
        state.entries.insert(key.to_string(), sealed);
        if let Err(e) = write_json_atomic(&self.path, &state.to_file()) {
            state.entries.remove(key);
            return Err(e.into());
        }

        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        index.insert(key.to_string(), IndexEntry::fresh());
        self.persist_index(&index);
        Ok(())
    }

    /// Decrypt and return a secret, counting the access.
    pub fn get(&self, tag: &RequestTag, key: &str) -> Result<String, VaultError> {
        let result = self.get_inner(key);
        self.audit_outcome(tag, AuditOp::SecretGet, key, &result, |(_, count)| {
            format!("secret read (access #{count})")
        });
        result.map(|(value, _)| value)
    }

    fn get_inner(&self, key: &str) -> Result<(String, u64), VaultError> {
        let plaintext = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let sealed = state.entries.get(key).ok_or(VaultError::KeyNotFound)?;
            self.cipher.decrypt(key, sealed)?
        };
        let value = String::from_utf8(plaintext)
            .map_err(|_| VaultError::Locked("vault entry is corrupt".into()))?;

        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = index.entry(key.to_string()).or_insert_with(IndexEntry::fresh);
        entry.access_count += 1;
        let count = entry.access_count;
        self.persist_index(&index);
        Ok((value, count))
    }

    /// Replace an existing secret's value.
    pub fn rotate(&self, tag: &RequestTag, key: &str, new_value: &str) -> Result<(), VaultError> {
        let result = self.rotate_inner(key, new_value);
        self.audit_outcome(tag, AuditOp::SecretRotate, key, &result, |_| "secret rotated".into());
        result
    }

    fn rotate_inner(&self, key: &str, new_value: &str) -> Result<(), VaultError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let sealed = self.cipher.encrypt(key, new_value.as_bytes())?;
        let Some(slot) = state.entries.get_mut(key) else {
            return Err(VaultError::KeyNotFound);
        };
        let previous = std::mem::replace(slot, sealed);
        if let Err(e) = write_json_atomic(&self.path, &state.to_file()) {
            state.entries.insert(key.to_string(), previous);
            return Err(e.into());
        }

        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        index
            .entry(key.to_string())
            .or_insert_with(IndexEntry::fresh)
            .last_rotated_at = Utc::now();
        self.persist_index(&index);
        Ok(())
    }

    /// Remove a secret.
    pub fn delete(&self, tag: &RequestTag, key: &str) -> Result<(), VaultError> {
        let result = self.delete_inner(key);
        self.audit_outcome(tag, AuditOp::SecretDelete, key, &result, |_| "secret deleted".into());
        result
    }

    fn delete_inner(&self, key: &str) -> Result<(), VaultError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let Some(removed) = state.entries.remove(key) else {
            return Err(VaultError::KeyNotFound);
        };
        if let Err(e) = write_json_atomic(&self.path, &state.to_file()) {
            state.entries.insert(key.to_string(), removed);
            return Err(e.into());
        }

        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        index.remove(key);
        self.persist_index(&index);
        Ok(())
    }

    /// Metadata for every key, from the index only.
    pub fn list(&self, tag: &RequestTag) -> Vec<SecretMetadata> {
        let listed: Vec<SecretMetadata> = {
            let index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
            index
                .iter()
                .map(|(key, meta)| SecretMetadata {
                    key: key.clone(),
                    created_at: meta.created_at,
                    last_rotated_at: meta.last_rotated_at,
                    access_count: meta.access_count,
                })
                .collect()
        };
        self.audit.record(tag.record(
            AuditOp::SecretList,
            "*",
            AuditOutcome::Executed,
            format!("{} key(s)", listed.len()),
        ));
        listed
    }

    /// Re-read the container and index from disk, e.g. after a restore.
    pub fn reload(&self, tag: &RequestTag) -> Result<usize, VaultError> {
        let result = self.reload_inner();
        self.audit_outcome(tag, AuditOp::SecretReload, "*", &result, |count| {
            format!("{count} key(s) loaded")
        });
        result
    }

    fn reload_inner(&self) -> Result<usize, VaultError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let file = read_vault_file(&self.path)?;
        if file.salt != state.salt || file.kdf_iterations != state.kdf_iterations {
            return Err(VaultError::Locked(
                "vault was re-keyed; restart with the new passphrase".into(),
            ));
        }
        check_verifier(&self.cipher, &file.verifier)?;

        *state = VaultState {
            salt: file.salt,
            kdf_iterations: file.kdf_iterations,
            verifier: file.verifier,
            entries: file.entries,
        };

        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        *index = reconcile_index(read_index(&self.index_path), &state.entries);
        self.persist_index(&index);
        Ok(state.entries.len())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist_index(&self, index: &BTreeMap<String, IndexEntry>) {
        if let Err(e) = write_json_atomic(&self.index_path, index) {
            tracing::warn!(error = %e, path = %self.index_path.display(), "Failed to write vault index");
        }
    }

    fn audit_outcome<T>(
        &self,
        tag: &RequestTag,
        op: AuditOp,
        key: &str,
        result: &Result<T, VaultError>,
        detail: impl FnOnce(&T) -> String,
    ) {
        let record = match result {
            Ok(value) => tag.record(op, key, AuditOutcome::Executed, detail(value)),
            Err(e) => {
                tracing::warn!(op = %op, key, kind = %e.kind(), "Vault operation failed");
                tag.record(op, key, AuditOutcome::Failed, e.kind().as_str())
            }
        };
        self.audit.record(record);
    }
}

fn check_verifier(cipher: &VaultCipher, verifier: &EncryptedValue) -> Result<(), VaultError> {
    match cipher.decrypt(VERIFIER_KEY, verifier) {
        Ok(plain) if plain == VERIFIER_PLAINTEXT => Ok(()),
        _ => Err(VaultError::Locked("wrong passphrase or corrupt vault".into())),
    }
}

fn read_vault_file(path: &Path) -> Result<VaultFile, VaultError> {
    let content = std::fs::read_to_string(path)?;
    let file: VaultFile = serde_json::from_str(&content)
        .map_err(|_| VaultError::Locked("vault container is corrupt".into()))?;
    if file.format != VAULT_FORMAT {
        return Err(VaultError::Locked(format!(
            "unsupported vault format {}",
            file.format
        )));
    }
    Ok(file)
}

/// Missing or unreadable index files are rebuilt from the container.
fn read_index(path: &Path) -> BTreeMap<String, IndexEntry> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

fn reconcile_index(
    mut index: BTreeMap<String, IndexEntry>,
    entries: &BTreeMap<String, EncryptedValue>,
) -> BTreeMap<String, IndexEntry> {
    index.retain(|key, _| entries.contains_key(key));
    for key in entries.keys() {
        index.entry(key.clone()).or_insert_with(IndexEntry::fresh);
    }
    index
}

fn random_bytes(len: usize) -> Vec<u8> {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf[..]);
    buf
}

/// Write JSON to a sibling temp file, fsync it, then rename over `path`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;

    const TEST_ITERATIONS: u32 = 1_000;

    struct Fixture {
        dir: tempfile::TempDir,
        sink: MemorySink,
        audit: Arc<AuditLogger>,
    }

    impl Fixture {
        fn new() -> Self {
            let (logger, sink) = AuditLogger::in_memory();
            Self {
                dir: tempfile::tempdir().unwrap(),
                sink,
                audit: Arc::new(logger),
            }
        }

        fn vault_path(&self) -> PathBuf {
            self.dir.path().join("secrets.vault")
        }

        fn index_path(&self) -> PathBuf {
            self.dir.path().join("secrets.index.json")
        }

        fn open(&self, passphrase: &str) -> Result<SecretsVault, VaultError> {
            SecretsVault::open(
                &self.vault_path(),
                &self.index_path(),
                passphrase,
                TEST_ITERATIONS,
                self.audit.clone(),
            )
        }
    }

    fn tag() -> RequestTag {
        RequestTag::new("tester")
    }

    #[test]
    fn add_then_get() {
        let fx = Fixture::new();
        let vault = fx.open("correct horse").unwrap();
        vault.add(&tag(), "DB_PASSWORD", "s3cr3t-value").unwrap();
        assert_eq!(vault.get(&tag(), "DB_PASSWORD").unwrap(), "s3cr3t-value");
        assert_eq!(vault.len(), 1);
    }

    #[test]
    fn values_are_not_stored_in_clear() {
        let fx = Fixture::new();
        let vault = fx.open("correct horse").unwrap();
        vault.add(&tag(), "API_TOKEN", "plain-token-123").unwrap();
        let container = std::fs::read_to_string(fx.vault_path()).unwrap();
        let index = std::fs::read_to_string(fx.index_path()).unwrap();
        assert!(!container.contains("plain-token-123"));
        assert!(!index.contains("plain-token-123"));
        assert!(index.contains("API_TOKEN"));
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let fx = Fixture::new();
        let vault = fx.open("pw").unwrap();
        vault.add(&tag(), "K", "v1").unwrap();
        let err = vault.add(&tag(), "K", "v2").unwrap_err();
        assert!(matches!(err, VaultError::KeyAlreadyExists));
        assert_eq!(vault.get(&tag(), "K").unwrap(), "v1");
    }

    #[test]
    fn rotate_replaces_value_and_updates_metadata() {
        let fx = Fixture::new();
        let vault = fx.open("pw").unwrap();
        vault.add(&tag(), "K", "old").unwrap();
        let before = vault.list(&tag()).remove(0);
        vault.rotate(&tag(), "K", "new").unwrap();
        assert_eq!(vault.get(&tag(), "K").unwrap(), "new");
        let after = vault.list(&tag()).remove(0);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.last_rotated_at >= before.last_rotated_at);
        assert!(matches!(
            vault.rotate(&tag(), "MISSING", "x"),
            Err(VaultError::KeyNotFound)
        ));
    }

    #[test]
    fn delete_removes_key() {
        let fx = Fixture::new();
        let vault = fx.open("pw").unwrap();
        vault.add(&tag(), "K", "v").unwrap();
        vault.delete(&tag(), "K").unwrap();
        assert!(matches!(vault.get(&tag(), "K"), Err(VaultError::KeyNotFound)));
        assert!(matches!(vault.delete(&tag(), "K"), Err(VaultError::KeyNotFound)));
        assert!(vault.list(&tag()).is_empty());
    }

    #[test]
    fn access_count_persists_across_reopen() {
        let fx = Fixture::new();
        {
            let vault = fx.open("pw").unwrap();
            vault.add(&tag(), "K", "v").unwrap();
            vault.get(&tag(), "K").unwrap();
            vault.get(&tag(), "K").unwrap();
        }
        let vault = fx.open("pw").unwrap();
        let meta = vault.list(&tag()).remove(0);
        assert_eq!(meta.key, "K");
        assert_eq!(meta.access_count, 2);
        assert_eq!(vault.get(&tag(), "K").unwrap(), "v");
    }

    #[test]
    fn wrong_passphrase_is_locked() {
        let fx = Fixture::new();
        fx.open("right").unwrap().add(&tag(), "K", "v").unwrap();
        let err = fx.open("wrong").unwrap_err();
        assert!(matches!(err, VaultError::Locked(_)));
        assert_eq!(err.kind(), ErrorKind::VaultLocked);
        assert!(matches!(fx.open(""), Err(VaultError::Locked(_))));
    }

    #[test]
    fn second_open_is_refused_while_held() {
        let fx = Fixture::new();
        let server = fx.open("pw").unwrap();
        let err = fx.open("pw").unwrap_err();
        assert!(matches!(err, VaultError::InUse(_)));
        assert_eq!(err.kind(), ErrorKind::VaultLocked);

        server.add(&tag(), "FROM_API", "v").unwrap();
        drop(server);
        let reopened = fx.open("pw").unwrap();
        let keys: Vec<_> = reopened.list(&tag()).into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["FROM_API"]);
    }

    #[test]
    fn corrupt_container_is_locked() {
        let fx = Fixture::new();
        std::fs::write(fx.vault_path(), "{not json").unwrap();
        assert!(matches!(fx.open("pw"), Err(VaultError::Locked(_))));
    }

    #[test]
    fn ciphertext_is_bound_to_key_name() {
        let fx = Fixture::new();
        let vault = fx.open("pw").unwrap();
        vault.add(&tag(), "A", "alpha").unwrap();
        vault.add(&tag(), "B", "beta").unwrap();
        drop(vault);

        let mut file: VaultFile =
            serde_json::from_str(&std::fs::read_to_string(fx.vault_path()).unwrap()).unwrap();
        let a = file.entries["A"].clone();
        file.entries.insert("B".into(), a);
        std::fs::write(fx.vault_path(), serde_json::to_string(&file).unwrap()).unwrap();

        let vault = fx.open("pw").unwrap();
        assert!(matches!(vault.get(&tag(), "B"), Err(VaultError::Locked(_))));
    }

    #[test]
    fn every_operation_is_audited_without_values() {
        let fx = Fixture::new();
        let vault = fx.open("pw").unwrap();
        vault.add(&tag(), "K", "very-secret-value").unwrap();
        vault.get(&tag(), "K").unwrap();
        vault.rotate(&tag(), "K", "another-secret-value").unwrap();
        vault.list(&tag());
        let _ = vault.get(&tag(), "MISSING");
        vault.delete(&tag(), "K").unwrap();

        let records = fx.sink.records();
        let ops: Vec<_> = records.iter().map(|r| (r.op, r.outcome)).collect();
        assert_eq!(
            ops,
            vec![
                (AuditOp::SecretAdd, AuditOutcome::Executed),
                (AuditOp::SecretGet, AuditOutcome::Executed),
                (AuditOp::SecretRotate, AuditOutcome::Executed),
                (AuditOp::SecretList, AuditOutcome::Executed),
                (AuditOp::SecretGet, AuditOutcome::Failed),
                (AuditOp::SecretDelete, AuditOutcome::Executed),
            ]
        );
        assert_eq!(records[4].detail, "KeyNotFound");
        for record in &records {
            let line = serde_json::to_string(record).unwrap();
            assert!(!line.contains("very-secret-value"));
            assert!(!line.contains("another-secret-value"));
        }
    }

    #[test]
    fn reload_picks_up_restored_file() {
        let fx = Fixture::new();
        let vault = fx.open("pw").unwrap();
        vault.add(&tag(), "K", "v").unwrap();
        let snapshot = std::fs::read(fx.vault_path()).unwrap();
        vault.add(&tag(), "L", "w").unwrap();
        assert_eq!(vault.len(), 2);

        std::fs::write(fx.vault_path(), snapshot).unwrap();
        assert_eq!(vault.reload(&tag()).unwrap(), 1);
        assert!(matches!(vault.get(&tag(), "L"), Err(VaultError::KeyNotFound)));
        let keys: Vec<_> = vault.list(&tag()).into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["K"]);
    }

    #[test]
    fn missing_index_is_rebuilt() {
        let fx = Fixture::new();
        fx.open("pw").unwrap().add(&tag(), "K", "v").unwrap();
        std::fs::remove_file(fx.index_path()).unwrap();
        let vault = fx.open("pw").unwrap();
        let meta = vault.list(&tag());
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].access_count, 0);
    }

    #[test]
    fn concurrent_reads_share_the_vault() {
        let fx = Fixture::new();
        let vault = Arc::new(fx.open("pw").unwrap());
        vault.add(&tag(), "K", "v").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let vault = vault.clone();
                std::thread::spawn(move || vault.get(&RequestTag::new("t"), "K").unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "v");
        }
        assert_eq!(vault.list(&tag())[0].access_count, 8);
    }

    #[test]
    fn gateway_error_mapping() {
        let err: GatewayError = VaultError::KeyNotFound.into();
        assert_eq!(err.kind, ErrorKind::KeyNotFound);
        let err: GatewayError = VaultError::Io(io::Error::other("boom")).into();
        assert_eq!(err.kind, ErrorKind::ExecutionFailed);
        assert!(!err.reason.contains("boom"));
    }
}
