//! Manifest Replicator
//!
//! Fetches every manifest entry and writes it into the application directory.
//! Failures are recorded per entry; only required entries decide whether the
//! sync as a whole succeeded. Destinations are always overwritten.

use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::engine::github::{FetchError, RemoteFetcher};
use crate::engine::keystore::Token;
use crate::engine::manifest::ManifestEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Written { bytes: usize },
    Unauthorized,
    NotFound,
    Network { reason: String },
    /// Fetched, but the local file could not be written
    WriteFailed { reason: String },
}

impl EntryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

impl From<FetchError> for EntryOutcome {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Unauthorized => Self::Unauthorized,
            FetchError::NotFound => Self::NotFound,
            FetchError::Network(reason) => Self::Network { reason },
        }
    }
}

impl std::fmt::Display for EntryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Written { bytes } => write!(f, "written ({} bytes)", bytes),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::NotFound => write!(f, "not found"),
            Self::Network { reason } => write!(f, "network error: {}", reason),
            Self::WriteFailed { reason } => write!(f, "write failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub entry: ManifestEntry,
    pub outcome: EntryOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub entries: Vec<EntryReport>,
}

impl SyncReport {
    /// True when every required entry was written
    pub fn is_successful(&self) -> bool {
        self.entries
            .iter()
            .filter(|r| r.entry.required)
            .all(|r| r.outcome.is_success())
    }

    /// A required entry was rejected because of the token. Rejected
    /// auxiliary entries are only warnings.
    pub fn auth_failed(&self) -> bool {
        self.entries
            .iter()
            .any(|r| r.entry.required && r.outcome == EntryOutcome::Unauthorized)
    }

    pub fn written(&self) -> usize {
        self.entries.iter().filter(|r| r.outcome.is_success()).count()
    }

    /// Failed auxiliary entries
    pub fn warnings(&self) -> Vec<&EntryReport> {
        self.entries
            .iter()
            .filter(|r| !r.entry.required && !r.outcome.is_success())
            .collect()
    }

    pub fn failed_required(&self) -> Vec<&EntryReport> {
        self.entries
            .iter()
            .filter(|r| r.entry.required && !r.outcome.is_success())
            .collect()
    }
}

pub struct FileSync<'a> {
    fetcher: &'a dyn RemoteFetcher,
    root: PathBuf,
}

impl<'a> FileSync<'a> {
    pub fn new(fetcher: &'a dyn RemoteFetcher, root: &Path) -> Self {
        Self {
            fetcher,
            root: root.to_path_buf(),
        }
    }

    pub fn sync(&self, manifest: &[ManifestEntry], token: &Token) -> SyncReport {
        let entries = manifest
            .iter()
            .map(|entry| EntryReport {
                entry: entry.clone(),
                outcome: self.sync_entry(entry, token),
            })
            .collect();
        SyncReport { entries }
    }

    fn sync_entry(&self, entry: &ManifestEntry, token: &Token) -> EntryOutcome {
        let dest = self.root.join(&entry.local);

        if entry.create_parent {
            if let Some(parent) = dest.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    warn!(path = %parent.display(), error = %e, "Could not create directory");
                    return EntryOutcome::WriteFailed { reason: e.to_string() };
                }
            }
        }

        let bytes = match self.fetcher.fetch(&entry.remote, token) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %entry.remote, required = entry.required, error = %e, "Fetch failed");
                return e.into();
            }
        };

        match write_atomic(&dest, &bytes) {
            Ok(()) => {
                info!(file = %entry.remote, bytes = bytes.len(), "Updated");
                EntryOutcome::Written { bytes: bytes.len() }
            }
            Err(e) => {
                warn!(file = %entry.remote, error = %e, "Write failed");
                EntryOutcome::WriteFailed { reason: e.to_string() }
            }
        }
    }
}

/// Write to a hidden sibling, flush to disk, then rename over the destination
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?;
    let partial = dest.with_file_name(format!(".{}.partial", file_name.to_string_lossy()));

    let result = (|| {
        let mut file = File::create(&partial)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&partial, dest)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}
