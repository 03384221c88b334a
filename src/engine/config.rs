//! Updater Configuration Module
//! Handles loading and validating updater.config.json

use crate::engine::admins::{MAX_SECRET_LENGTH, MIN_SECRET_LENGTH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "updater.config.json";

/// Internal working directory inside the application directory
pub const STATE_DIR: &str = ".updater";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_raw_base_url")]
    pub raw_base_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// File inside the remote tree that carries the `VERSION = "x.y.z"` line
    #[serde(default = "default_version_file")]
    pub version_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Executables probed in order on PATH
    #[serde(default = "default_runtime_candidates")]
    pub candidates: Vec<String>,
    #[serde(default = "default_requirements")]
    pub requirements: PathBuf,
    #[serde(default)]
    pub skip_install: bool,
    /// Arguments passed to the runtime by `findbetter run`
    #[serde(default = "default_launch_args")]
    pub launch_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialBackend {
    #[default]
    Keyring,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub backend: CredentialBackend,
    #[serde(default = "default_token_env")]
    pub env_var: String,
    #[serde(default = "default_max_token_attempts")]
    pub max_token_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningMode {
    /// Create accounts that do not exist yet, leave existing ones untouched
    #[default]
    CreateMissing,
    /// Create missing accounts and reset the credential of existing ones
    Rotate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default)]
    pub mode: ProvisioningMode,
    #[serde(default = "default_secret_length")]
    pub secret_length: usize,
    #[serde(default)]
    pub admins: Vec<AdminSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminSpec {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_repo() -> String {
    "moranlevy420/birmanet".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_raw_base_url() -> String {
    "https://raw.githubusercontent.com".to_string()
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_version_file() -> String {
    "config/settings.py".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("app_data.db")
}

fn default_runtime_candidates() -> Vec<String> {
    vec!["python".to_string(), "python3".to_string(), "py".to_string()]
}

fn default_requirements() -> PathBuf {
    PathBuf::from("requirements.txt")
}

fn default_launch_args() -> Vec<String> {
    ["-m", "streamlit", "run", "app.py"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_max_token_attempts() -> u32 {
    3
}

fn default_secret_length() -> usize {
    MIN_SECRET_LENGTH
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            repo: default_repo(),
            branch: default_branch(),
            raw_base_url: default_raw_base_url(),
            api_base_url: default_api_base_url(),
            timeout_secs: default_timeout_secs(),
            version_file: default_version_file(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            candidates: default_runtime_candidates(),
            requirements: default_requirements(),
            skip_install: false,
            launch_args: default_launch_args(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            backend: CredentialBackend::default(),
            env_var: default_token_env(),
            max_token_attempts: default_max_token_attempts(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            mode: ProvisioningMode::default(),
            secret_length: default_secret_length(),
            admins: Vec::new(),
        }
    }
}

impl RemoteConfig {
    /// Base URL for raw file content at the configured branch
    pub fn content_base(&self) -> String {
        format!(
            "{}/{}/{}",
            self.raw_base_url.trim_end_matches('/'),
            self.repo,
            self.branch
        )
    }
}

impl Config {
    /// Load the config from `app_dir`, falling back to defaults when the file is absent.
    pub fn load(app_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = app_dir.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            serde_json::from_str::<Config>(&content)?
        } else {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            Config::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, app_dir: &Path) -> Result<(), ConfigError> {
        let config_path = app_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// `GITHUB_REPO` / `GITHUB_BRANCH` override the remote location
    pub fn apply_env_overrides(&mut self) {
        if let Ok(repo) = std::env::var("GITHUB_REPO") {
            if !repo.trim().is_empty() {
                self.remote.repo = repo.trim().to_string();
            }
        }
        if let Ok(branch) = std::env::var("GITHUB_BRANCH") {
            if !branch.trim().is_empty() {
                self.remote.branch = branch.trim().to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.remote.repo.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "remote.repo must be <owner>/<name>, got '{}'",
                self.remote.repo
            )));
        }
        if self.runtime.candidates.is_empty() {
            return Err(ConfigError::Invalid(
                "runtime.candidates must name at least one executable".to_string(),
            ));
        }
        if self.credentials.max_token_attempts == 0 {
            return Err(ConfigError::Invalid(
                "credentials.max_token_attempts must be at least 1".to_string(),
            ));
        }
        let allowed = MIN_SECRET_LENGTH..=MAX_SECRET_LENGTH;
        if !allowed.contains(&self.provisioning.secret_length) {
            return Err(ConfigError::Invalid(format!(
                "provisioning.secret_length must be between {} and {}",
                MIN_SECRET_LENGTH, MAX_SECRET_LENGTH
            )));
        }
        Ok(())
    }

    pub fn database_path(&self, app_dir: &Path) -> PathBuf {
        app_dir.join(&self.database.path)
    }

    pub fn state_dir(app_dir: &Path) -> PathBuf {
        app_dir.join(STATE_DIR)
    }
}
