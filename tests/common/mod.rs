#![allow(dead_code)]

use findbetter_lib::engine::config::{Config, STATE_DIR};
use findbetter_lib::engine::github::{FetchError, RemoteFetcher};
use findbetter_lib::engine::keystore::{CredentialStore, KeystoreError, MemoryStore, Token};
use findbetter_lib::engine::orchestrator::{PromptReason, TokenPrompt};
use findbetter_lib::engine::runtime::{DependencyInstaller, RuntimeError, RuntimeInfo, RuntimeProbe};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// In-memory remote tree that only answers to known tokens
#[derive(Clone, Default)]
pub struct FakeRemote {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    tokens: Arc<Mutex<HashSet<String>>>,
    pub fetches: Arc<Mutex<Vec<String>>>,
    offline: Arc<Mutex<HashSet<String>>>,
    forbidden: Arc<Mutex<HashSet<String>>>,
}

impl FakeRemote {
    pub fn new(valid_token: &str) -> Self {
        let remote = Self::default();
        remote.tokens.lock().unwrap().insert(valid_token.to_string());
        remote
    }

    pub fn with_file(self, path: &str, contents: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.as_bytes().to_vec());
        self
    }

    /// Fetches of `path` fail with a network error
    pub fn with_offline(self, path: &str) -> Self {
        self.offline.lock().unwrap().insert(path.to_string());
        self
    }

    /// Fetches of `path` are refused even with a valid token
    pub fn with_forbidden(self, path: &str) -> Self {
        self.forbidden.lock().unwrap().insert(path.to_string());
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }
}

impl RemoteFetcher for FakeRemote {
    fn fetch(&self, resource: &str, token: &Token) -> Result<Vec<u8>, FetchError> {
        self.fetches.lock().unwrap().push(resource.to_string());
        // Authorization is decided before existence
        if !self.tokens.lock().unwrap().contains(token.value()) {
            return Err(FetchError::Unauthorized);
        }
        if self.forbidden.lock().unwrap().contains(resource) {
            return Err(FetchError::Unauthorized);
        }
        if self.offline.lock().unwrap().contains(resource) {
            return Err(FetchError::Network("connection reset".to_string()));
        }
        self.files
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .ok_or(FetchError::NotFound)
    }

    fn verify(&self, token: &Token) -> Result<(), FetchError> {
        if self.tokens.lock().unwrap().contains(token.value()) {
            Ok(())
        } else {
            Err(FetchError::Unauthorized)
        }
    }
}

/// Store shared with the test so its contents can be inspected after a run
#[derive(Clone, Default)]
pub struct SharedStore(pub Arc<MemoryStore>);

impl SharedStore {
    pub fn with_token(value: &str) -> Self {
        Self(Arc::new(MemoryStore::with_token(Token::new(value))))
    }

    pub fn current(&self) -> Option<String> {
        self.0
            .get_token()
            .unwrap()
            .map(|t| t.value().to_string())
    }
}

impl CredentialStore for SharedStore {
    fn get_token(&self) -> Result<Option<Token>, KeystoreError> {
        self.0.get_token()
    }
    fn put_token(&self, token: &Token) -> Result<(), KeystoreError> {
        self.0.put_token(token)
    }
    fn clear_token(&self) -> Result<(), KeystoreError> {
        self.0.clear_token()
    }
    fn describe(&self) -> String {
        "shared memory".to_string()
    }
}

/// Readable but refuses writes, like a locked keychain
pub struct ReadOnlyStore;

impl CredentialStore for ReadOnlyStore {
    fn get_token(&self) -> Result<Option<Token>, KeystoreError> {
        Ok(None)
    }
    fn put_token(&self, _token: &Token) -> Result<(), KeystoreError> {
        Err(KeystoreError::KeyringError("keychain is locked".to_string()))
    }
    fn clear_token(&self) -> Result<(), KeystoreError> {
        Ok(())
    }
    fn describe(&self) -> String {
        "read-only".to_string()
    }
}

/// Hands out pre-scripted answers and counts how often it was asked
#[derive(Clone, Default)]
pub struct ScriptedPrompt {
    answers: Arc<Mutex<VecDeque<String>>>,
    pub asked: Arc<Mutex<Vec<PromptReason>>>,
}

impl ScriptedPrompt {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Arc::new(Mutex::new(answers.iter().map(|s| s.to_string()).collect())),
            asked: Arc::default(),
        }
    }

    pub fn times_asked(&self) -> usize {
        self.asked.lock().unwrap().len()
    }
}

impl TokenPrompt for ScriptedPrompt {
    fn ask(&self, reason: PromptReason) -> Option<Token> {
        self.asked.lock().unwrap().push(reason);
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .map(|s| Token::new(&s))
    }
}

pub struct FakeRuntime {
    pub present: bool,
}

impl RuntimeProbe for FakeRuntime {
    fn locate(&self) -> Result<RuntimeInfo, RuntimeError> {
        if self.present {
            Ok(RuntimeInfo {
                executable: PathBuf::from("/usr/bin/python3"),
                version: "Python 3.12.1".to_string(),
            })
        } else {
            Err(RuntimeError::NotFound {
                candidates: vec!["python".to_string(), "python3".to_string()],
            })
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingInstaller {
    pub calls: Arc<Mutex<usize>>,
}

impl DependencyInstaller for RecordingInstaller {
    fn install(&self, _runtime: &RuntimeInfo, app_dir: &Path, requirements: &Path) -> Result<(), RuntimeError> {
        *self.calls.lock().unwrap() += 1;
        let path = app_dir.join(requirements);
        if !path.exists() {
            return Err(RuntimeError::MissingRequirements(path));
        }
        Ok(())
    }
}

/// pip exits non-zero
pub struct FailingInstaller;

impl DependencyInstaller for FailingInstaller {
    fn install(&self, _runtime: &RuntimeInfo, _app_dir: &Path, _requirements: &Path) -> Result<(), RuntimeError> {
        Err(RuntimeError::InstallFailed {
            status: "exit status: 1".to_string(),
            output: "No matching distribution found for streamlit==99".to_string(),
        })
    }
}

/// Config that never touches the keyring and provisions one administrator
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.credentials.max_token_attempts = 3;
    config.provisioning.admins = vec![findbetter_lib::engine::config::AdminSpec {
        email: "Admin@Example.com".to_string(),
        name: Some("Admin".to_string()),
    }];
    config
}

pub fn state_dir(app_dir: &Path) -> PathBuf {
    app_dir.join(STATE_DIR)
}

/// Remote tree with both core files and the settings carrying the version
pub fn standard_remote(token: &str) -> FakeRemote {
    FakeRemote::new(token)
        .with_file("app.py", "print('hello')\n")
        .with_file("requirements.txt", "streamlit\npandas\n")
        .with_file("config/settings.py", "VERSION = \"2.2.1\"\n")
}
