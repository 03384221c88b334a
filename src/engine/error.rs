//! Update pipeline error taxonomy
//!
//! Module errors are folded into [`UpdateError`] at stage boundaries so the
//! caller only ever sees what failed, where, and what to do about it.

use serde::Serialize;
use thiserror::Error;

use crate::engine::admins::ProvisionError;
use crate::engine::config::ConfigError;
use crate::engine::github::FetchError;
use crate::engine::keystore::KeystoreError;
use crate::engine::locks::LockError;
use crate::engine::migrations::MigrationError;
use crate::engine::runtime::RuntimeError;

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Lock,
    Prerequisites,
    Token,
    VersionCheck,
    Sync,
    Dependencies,
    Migrations,
    Provisioning,
    Summary,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Lock => "Lock",
            Stage::Prerequisites => "Prerequisites",
            Stage::Token => "Access token",
            Stage::VersionCheck => "Version check",
            Stage::Sync => "File sync",
            Stage::Dependencies => "Dependencies",
            Stage::Migrations => "Database migrations",
            Stage::Provisioning => "Administrators",
            Stage::Summary => "Summary",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailureKind {
    NotFound,
    Network,
    /// Downloaded, but the local copy could not be written
    Write,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Runtime prerequisite missing: {0}")]
    PrerequisiteMissing(String),
    #[error("GitHub rejected the access token: {0}")]
    AuthFailure(String),
    #[error("Required files could not be updated ({kind:?}): {}", .files.join(", "))]
    FetchFailure {
        kind: FetchFailureKind,
        files: Vec<String>,
    },
    #[error("Dependency installation failed: {0}")]
    DependencyInstallFailure(String),
    #[error("Database migration failed: {reason}")]
    MigrationFailure {
        /// Version that failed, if a script failed rather than the journal
        version: Option<String>,
        /// Versions committed before the failure
        applied: Vec<String>,
        reason: String,
    },
    #[error("Administrator provisioning failed for {email}: {reason}")]
    ProvisioningFailure { email: String, reason: String },
    #[error("Could not store the access token: {0}")]
    CredentialStorage(String),
    #[error("{0}")]
    AlreadyRunning(String),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl UpdateError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::AlreadyRunning(_) => Stage::Lock,
            Self::Configuration(_) | Self::PrerequisiteMissing(_) => Stage::Prerequisites,
            Self::AuthFailure(_) | Self::CredentialStorage(_) => Stage::Token,
            Self::FetchFailure { .. } => Stage::Sync,
            Self::DependencyInstallFailure(_) => Stage::Dependencies,
            Self::MigrationFailure { .. } => Stage::Migrations,
            Self::ProvisioningFailure { .. } => Stage::Provisioning,
        }
    }

    /// Actionable hint printed under the error
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::PrerequisiteMissing(_) => {
                "Install Python 3 from https://www.python.org/downloads/ and tick \"Add Python to PATH\", then run the updater again."
            }
            Self::AuthFailure(_) => {
                "Create a new token at https://github.com/settings/tokens with the 'repo' scope and enter it when prompted."
            }
            Self::FetchFailure { kind: FetchFailureKind::NotFound, .. } => {
                "The remote repository or branch does not contain this file. Check remote.repo and remote.branch in updater.config.json."
            }
            Self::FetchFailure { kind: FetchFailureKind::Network, .. } => {
                "Check your internet connection and try again."
            }
            Self::FetchFailure { kind: FetchFailureKind::Write, .. } => {
                "Close the application and check that the install folder is writable, then run again."
            }
            Self::DependencyInstallFailure(_) => {
                "Run 'python -m pip install -r requirements.txt' manually to see the full error."
            }
            Self::MigrationFailure { .. } => {
                "Earlier migrations were kept. Restore app_data.db from a backup or fix the failing script, then run the updater again."
            }
            Self::ProvisioningFailure { .. } => {
                "Fix the administrator list in updater.config.json, then run 'findbetter admin ensure <email>'."
            }
            Self::CredentialStorage(_) => {
                "The token was not saved. Set credentials.backend to \"file\" in updater.config.json or export GITHUB_TOKEN."
            }
            Self::AlreadyRunning(_) => {
                "Wait for the other updater process to finish. If none is running, delete the lock file under .updater/locks."
            }
            Self::Configuration(_) => "Fix or delete updater.config.json and run again.",
        }
    }
}

impl From<LockError> for UpdateError {
    fn from(e: LockError) -> Self {
        Self::AlreadyRunning(e.to_string())
    }
}

impl From<ConfigError> for UpdateError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<KeystoreError> for UpdateError {
    fn from(e: KeystoreError) -> Self {
        Self::CredentialStorage(e.to_string())
    }
}

/// A token check against the repository. GitHub answers 404 for private
/// repositories the token cannot see.
impl From<FetchError> for UpdateError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Unauthorized | FetchError::NotFound => Self::AuthFailure(e.to_string()),
            FetchError::Network(reason) => Self::FetchFailure {
                kind: FetchFailureKind::Network,
                files: vec![reason],
            },
        }
    }
}

impl From<RuntimeError> for UpdateError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotFound { .. } | RuntimeError::Unhealthy { .. } => {
                Self::PrerequisiteMissing(e.to_string())
            }
            other => Self::DependencyInstallFailure(other.to_string()),
        }
    }
}

impl From<MigrationError> for UpdateError {
    fn from(e: MigrationError) -> Self {
        let reason = e.summary();
        match e {
            MigrationError::Failed {
                version, applied, ..
            } => Self::MigrationFailure {
                version: Some(version),
                applied,
                reason,
            },
            _ => Self::MigrationFailure {
                version: None,
                applied: Vec::new(),
                reason,
            },
        }
    }
}

impl UpdateError {
    pub fn provisioning(email: &str, e: ProvisionError) -> Self {
        Self::ProvisioningFailure {
            email: email.to_string(),
            reason: e.to_string(),
        }
    }
}
