//! Credential Store Module
//! Persists the bearer token used for authenticated fetches

use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::engine::config::{Config, CredentialBackend};

const SERVICE_NAME: &str = "findbetter-updater";
const ACCOUNT_NAME: &str = "github_token";
const TOKEN_FILE: &str = "token.json";

/// Plaintext token file written by the old batch updater
pub const LEGACY_TOKEN_FILE: &str = ".github_token";

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Keyring error: {0}")]
    KeyringError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// Opaque bearer credential
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    value: String,
    pub acquired_at: DateTime<Utc>,
}

impl Token {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.trim().to_string(),
            acquired_at: Utc::now(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_blank(&self) -> bool {
        self.value.trim().is_empty()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

pub trait CredentialStore {
    fn get_token(&self) -> Result<Option<Token>, KeystoreError>;
    fn put_token(&self, token: &Token) -> Result<(), KeystoreError>;
    fn clear_token(&self) -> Result<(), KeystoreError>;
    /// Human-readable location for status output
    fn describe(&self) -> String;
}

/// Host platform credential store
pub struct KeyringStore {
    service: String,
    account: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            account: ACCOUNT_NAME.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry, KeystoreError> {
        Entry::new(&self.service, &self.account).map_err(|e| KeystoreError::KeyringError(e.to_string()))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn get_token(&self) -> Result<Option<Token>, KeystoreError> {
        match self.entry()?.get_password() {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeystoreError::KeyringError(e.to_string())),
        }
    }

    fn put_token(&self, token: &Token) -> Result<(), KeystoreError> {
        let raw = serde_json::to_string(token)?;
        self.entry()?
            .set_password(&raw)
            .map_err(|e| KeystoreError::KeyringError(e.to_string()))
    }

    fn clear_token(&self) -> Result<(), KeystoreError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeystoreError::KeyringError(e.to_string())),
        }
    }

    fn describe(&self) -> String {
        format!("OS keyring ({}/{})", self.service, self.account)
    }
}

/// Owner-only JSON file. The token is stored unencrypted; prefer [`KeyringStore`].
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(TOKEN_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn get_token(&self) -> Result<Option<Token>, KeystoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn put_token(&self, token: &Token) -> Result<(), KeystoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(token)?;
        let temp_path = self.path.with_extension("tmp");
        write_private(&temp_path, content.as_bytes())?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn clear_token(&self) -> Result<(), KeystoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    // Files under the user's profile already inherit a per-user ACL on Windows
    fs::write(path, bytes)
}

/// Process-local store; nothing survives the run
#[derive(Default)]
pub struct MemoryStore {
    token: Mutex<Option<Token>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: Token) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn get_token(&self) -> Result<Option<Token>, KeystoreError> {
        Ok(self.token.lock().map(|t| t.clone()).unwrap_or(None))
    }

    fn put_token(&self, token: &Token) -> Result<(), KeystoreError> {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token.clone());
        }
        Ok(())
    }

    fn clear_token(&self) -> Result<(), KeystoreError> {
        if let Ok(mut slot) = self.token.lock() {
            *slot = None;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Build the store selected by the configuration
pub fn open_store(config: &Config, app_dir: &Path) -> Box<dyn CredentialStore> {
    match config.credentials.backend {
        CredentialBackend::Keyring => Box::new(KeyringStore::new()),
        CredentialBackend::File => Box::new(FileStore::new(&Config::state_dir(app_dir))),
    }
}

/// Token from the environment, if the variable is set and non-empty
pub fn token_from_env(var: &str) -> Option<Token> {
    std::env::var(var)
        .ok()
        .map(|v| Token::new(&v))
        .filter(|t| !t.is_blank())
}

/// The old plaintext `.github_token`, if one is lying around
pub fn read_legacy_token(app_dir: &Path) -> Result<Option<Token>, KeystoreError> {
    let path = app_dir.join(LEGACY_TOKEN_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let token = Token::new(&fs::read_to_string(&path)?);
    Ok(Some(token).filter(|t| !t.is_blank()))
}

/// Delete the plaintext file once its token lives in a credential store
pub fn remove_legacy_token(app_dir: &Path) -> Result<(), KeystoreError> {
    match fs::remove_file(app_dir.join(LEGACY_TOKEN_FILE)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
