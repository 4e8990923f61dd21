//! Secret backends for persisted tokens
//!
//! The token store is backend-agnostic: it loads every entry once, keeps the
//! working set in memory and writes through on each mutation. A backend only
//! persists individual records keyed by `TokenId` plus one active pointer.
//!
//! File layout (plaintext and encrypted):
//!
//! ```text
//! <dir>/tokens/<host>-<prefix>.json   plaintext record, 0600
//! <dir>/tokens/<host>-<prefix>.enc    base64(salt || nonce || AES-256-GCM ciphertext), 0600
//! <dir>/active_token                  id of the active record
//! ```
//!
//! All file writes use temp-file + rename so a crash never leaves a
//! half-written record behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::{Secret, StorageBackend, StorageConfig};
use rand::RngExt;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::token::{TokenId, TokenRecord};

const TOKENS_DIR: &str = "tokens";
const ACTIVE_FILE: &str = "active_token";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// One persisted entry as read back from a backend. `record` is an error
/// when the entry exists but cannot be decoded.
#[derive(Debug)]
pub struct StoredEntry {
    pub key: String,
    pub record: Result<TokenRecord>,
}

/// Durable storage for token records and the active pointer.
pub trait SecretBackend: Send + Sync {
    /// Label for logs ("plaintext", "encrypted", "keyring", "memory")
    fn kind(&self) -> &'static str;

    /// Every stored entry, decodable or not.
    fn load_all(&self) -> Result<Vec<StoredEntry>>;

    /// Write (or overwrite) the record under its id.
    fn store(&self, record: &TokenRecord) -> Result<()>;

    /// Returns whether an entry existed.
    fn remove(&self, id: &TokenId) -> Result<bool>;

    /// Id string (`host-prefix`) of the active record, if one is set.
    fn load_active(&self) -> Result<Option<String>>;

    fn store_active(&self, id: Option<&TokenId>) -> Result<()>;
}

/// Build the backend selected by the storage config.
pub fn open_backend(
    config: &StorageConfig,
    passphrase: Option<&Secret<String>>,
) -> Result<Arc<dyn SecretBackend>> {
    let dir = config.resolved_dir();
    match config.backend {
        StorageBackend::Plaintext => Ok(Arc::new(PlaintextFileBackend::new(dir))),
        StorageBackend::Encrypted => {
            let passphrase = passphrase.filter(|p| !p.is_empty()).ok_or_else(|| {
                Error::Backend(
                    "encrypted storage requires GH_SESSION_PASSPHRASE to be set".into(),
                )
            })?;
            Ok(Arc::new(EncryptedFileBackend::new(dir, passphrase.clone())))
        }
        #[cfg(feature = "keyring")]
        StorageBackend::Keyring => Ok(Arc::new(KeyringBackend::new())),
        #[cfg(not(feature = "keyring"))]
        StorageBackend::Keyring => Err(Error::Backend(
            "keyring storage requires building with the `keyring` feature".into(),
        )),
    }
}

/// Plain JSON files, owner read/write only.
pub struct PlaintextFileBackend {
    layout: FileLayout,
}

impl PlaintextFileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: FileLayout::new(dir.into(), "json"),
        }
    }
}

impl SecretBackend for PlaintextFileBackend {
    fn kind(&self) -> &'static str {
        "plaintext"
    }

    fn load_all(&self) -> Result<Vec<StoredEntry>> {
        self.layout.load_all(|bytes| {
            serde_json::from_slice(bytes)
                .map_err(|e| Error::CredentialParse(format!("parsing token file: {e}")))
        })
    }

    fn store(&self, record: &TokenRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::CredentialParse(format!("serializing token: {e}")))?;
        self.layout.write_record(&record.id(), &json)
    }

    fn remove(&self, id: &TokenId) -> Result<bool> {
        self.layout.remove_record(id)
    }

    fn load_active(&self) -> Result<Option<String>> {
        self.layout.load_active()
    }

    fn store_active(&self, id: Option<&TokenId>) -> Result<()> {
        self.layout.store_active(id)
    }
}

/// AES-256-GCM encrypted files. Each record gets a fresh salt and nonce;
/// the key is SHA-256(salt || passphrase).
pub struct EncryptedFileBackend {
    layout: FileLayout,
    passphrase: Secret<String>,
}

impl EncryptedFileBackend {
    pub fn new(dir: impl Into<PathBuf>, passphrase: Secret<String>) -> Self {
        Self {
            layout: FileLayout::new(dir.into(), "enc"),
            passphrase,
        }
    }

    fn cipher(&self, salt: &[u8]) -> Result<Aes256Gcm> {
        let key = Sha256::new()
            .chain_update(salt)
            .chain_update(self.passphrase.expose().as_bytes())
            .finalize();
        Aes256Gcm::new_from_slice(&key).map_err(|e| Error::Crypto(format!("invalid key: {e}")))
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut salt);
        rand::rng().fill(&mut nonce);

        let ciphertext = self
            .cipher(&salt)?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    fn decrypt(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        let blob = STANDARD
            .decode(encoded.trim_ascii())
            .map_err(|e| Error::Crypto(format!("invalid base64: {e}")))?;
        if blob.len() <= SALT_LEN + NONCE_LEN {
            return Err(Error::Crypto("ciphertext too short".into()));
        }
        let (salt, rest) = blob.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        self.cipher(salt)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                Error::Crypto("decryption failed (wrong passphrase or corrupt file)".into())
            })
    }
}

impl SecretBackend for EncryptedFileBackend {
    fn kind(&self) -> &'static str {
        "encrypted"
    }

    fn load_all(&self) -> Result<Vec<StoredEntry>> {
        self.layout.load_all(|bytes| {
            let plaintext = self.decrypt(bytes)?;
            serde_json::from_slice(&plaintext)
                .map_err(|e| Error::CredentialParse(format!("parsing decrypted token: {e}")))
        })
    }

    fn store(&self, record: &TokenRecord) -> Result<()> {
        let json = serde_json::to_vec(record)
            .map_err(|e| Error::CredentialParse(format!("serializing token: {e}")))?;
        let encoded = self.encrypt(&json)?;
        self.layout.write_record(&record.id(), encoded.as_bytes())
    }

    fn remove(&self, id: &TokenId) -> Result<bool> {
        self.layout.remove_record(id)
    }

    fn load_active(&self) -> Result<Option<String>> {
        self.layout.load_active()
    }

    fn store_active(&self, id: Option<&TokenId>) -> Result<()> {
        self.layout.store_active(id)
    }
}

/// In-process storage for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, String>,
    active: Option<String>,
    failing_removals: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw text under `key`, bypassing serialization (e.g. a corrupt entry).
    pub fn insert_raw(&self, key: impl Into<String>, raw: impl Into<String>) {
        self.lock().entries.insert(key.into(), raw.into());
    }

    /// Point the active pointer at an arbitrary key.
    pub fn set_active_raw(&self, key: Option<&str>) {
        self.lock().active = key.map(str::to_owned);
    }

    /// Make the next `count` calls to `remove` fail.
    pub fn fail_next_removals(&self, count: usize) {
        self.lock().failing_removals = count;
    }

    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SecretBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn load_all(&self) -> Result<Vec<StoredEntry>> {
        Ok(self
            .lock()
            .entries
            .iter()
            .map(|(key, raw)| StoredEntry {
                key: key.clone(),
                record: serde_json::from_str(raw)
                    .map_err(|e| Error::CredentialParse(format!("parsing token {key}: {e}"))),
            })
            .collect())
    }

    fn store(&self, record: &TokenRecord) -> Result<()> {
        let raw = serde_json::to_string(record)
            .map_err(|e| Error::CredentialParse(format!("serializing token: {e}")))?;
        self.lock().entries.insert(record.id().to_string(), raw);
        Ok(())
    }

    fn remove(&self, id: &TokenId) -> Result<bool> {
        let mut state = self.lock();
        if state.failing_removals > 0 {
            state.failing_removals -= 1;
            return Err(Error::Backend(format!("removal of {id} refused")));
        }
        Ok(state.entries.remove(&id.to_string()).is_some())
    }

    fn load_active(&self) -> Result<Option<String>> {
        Ok(self.lock().active.clone())
    }

    fn store_active(&self, id: Option<&TokenId>) -> Result<()> {
        self.lock().active = id.map(ToString::to_string);
        Ok(())
    }
}

/// OS keyring (macOS Keychain, Windows Credential Manager, Secret Service).
///
/// One entry per record under service `gh-session`, plus an `index` entry
/// listing stored ids and an `active` entry.
#[cfg(feature = "keyring")]
pub struct KeyringBackend {
    service: String,
}

#[cfg(feature = "keyring")]
impl KeyringBackend {
    const INDEX: &'static str = "index";
    const ACTIVE: &'static str = "active";

    pub fn new() -> Self {
        Self::with_service(crate::constants::KEYRING_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, user: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, user)
            .map_err(|e| Error::Backend(format!("keyring entry {user}: {e}")))
    }

    fn read(&self, user: &str) -> Result<Option<String>> {
        match self.entry(user)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::Backend(format!("reading keyring entry {user}: {e}"))),
        }
    }

    fn write(&self, user: &str, value: &str) -> Result<()> {
        self.entry(user)?
            .set_password(value)
            .map_err(|e| Error::Backend(format!("writing keyring entry {user}: {e}")))
    }

    fn delete(&self, user: &str) -> Result<bool> {
        match self.entry(user)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(Error::Backend(format!("deleting keyring entry {user}: {e}"))),
        }
    }

    fn index(&self) -> Result<Vec<String>> {
        match self.read(Self::INDEX)? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::CredentialParse(format!("parsing keyring index: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    fn write_index(&self, keys: &[String]) -> Result<()> {
        let raw = serde_json::to_string(keys)
            .map_err(|e| Error::CredentialParse(format!("serializing keyring index: {e}")))?;
        self.write(Self::INDEX, &raw)
    }
}

#[cfg(feature = "keyring")]
impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "keyring")]
impl SecretBackend for KeyringBackend {
    fn kind(&self) -> &'static str {
        "keyring"
    }

    fn load_all(&self) -> Result<Vec<StoredEntry>> {
        let mut entries = Vec::new();
        for key in self.index()? {
            let record = match self.read(&key) {
                Ok(Some(raw)) => serde_json::from_str(&raw)
                    .map_err(|e| Error::CredentialParse(format!("parsing token {key}: {e}"))),
                Ok(None) => Err(Error::NotFound(format!("keyring entry {key} missing"))),
                Err(e) => Err(e),
            };
            entries.push(StoredEntry { key, record });
        }
        Ok(entries)
    }

    fn store(&self, record: &TokenRecord) -> Result<()> {
        let key = record.id().to_string();
        let raw = serde_json::to_string(record)
            .map_err(|e| Error::CredentialParse(format!("serializing token: {e}")))?;
        self.write(&key, &raw)?;
        let mut index = self.index()?;
        if !index.contains(&key) {
            index.push(key);
            self.write_index(&index)?;
        }
        Ok(())
    }

    fn remove(&self, id: &TokenId) -> Result<bool> {
        let key = id.to_string();
        let existed = self.delete(&key)?;
        let mut index = self.index()?;
        let before = index.len();
        index.retain(|k| k != &key);
        if index.len() != before {
            self.write_index(&index)?;
        }
        Ok(existed)
    }

    fn load_active(&self) -> Result<Option<String>> {
        self.read(Self::ACTIVE)
    }

    fn store_active(&self, id: Option<&TokenId>) -> Result<()> {
        match id {
            Some(id) => self.write(Self::ACTIVE, &id.to_string()),
            None => self.delete(Self::ACTIVE).map(|_| ()),
        }
    }
}

/// Directory layout shared by the file backends.
struct FileLayout {
    dir: PathBuf,
    extension: &'static str,
}

impl FileLayout {
    fn new(dir: PathBuf, extension: &'static str) -> Self {
        Self { dir, extension }
    }

    fn tokens_dir(&self) -> PathBuf {
        self.dir.join(TOKENS_DIR)
    }

    fn record_path(&self, id: &TokenId) -> PathBuf {
        self.tokens_dir()
            .join(format!("{}.{}", file_stem(id), self.extension))
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_FILE)
    }

    fn load_all(
        &self,
        decode: impl Fn(&[u8]) -> Result<TokenRecord>,
    ) -> Result<Vec<StoredEntry>> {
        let dir = self.tokens_dir();
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(format!("reading {}: {e}", dir.display()))),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let path = entry
                .map_err(|e| Error::Io(format!("reading {}: {e}", dir.display())))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.extension) {
                continue;
            }
            let key = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let record = std::fs::read(&path)
                .map_err(|e| Error::Io(format!("reading {}: {e}", path.display())))
                .and_then(|bytes| decode(&bytes));
            entries.push(StoredEntry { key, record });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    fn write_record(&self, id: &TokenId, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.record_path(id), bytes)
    }

    fn remove_record(&self, id: &TokenId) -> Result<bool> {
        let path = self.record_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed token file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(format!("removing {}: {e}", path.display()))),
        }
    }

    fn load_active(&self) -> Result<Option<String>> {
        let path = self.active_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let id = contents.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(format!("reading {}: {e}", path.display()))),
        }
    }

    fn store_active(&self, id: Option<&TokenId>) -> Result<()> {
        let path = self.active_path();
        match id {
            Some(id) => write_atomic(&path, id.to_string().as_bytes()),
            None => match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Io(format!("removing {}: {e}", path.display()))),
            },
        }
    }
}

/// Filesystem-safe form of an id; hosts may carry a port.
fn file_stem(id: &TokenId) -> String {
    id.to_string()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write bytes to a file atomically with 0600 permissions.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token path has no parent directory".into()))?;
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{name}.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, bytes)
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&tmp_path, perms)
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted token file");
    Ok(())
}
