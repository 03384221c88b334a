//! Operation Lock System
//!
//! Advisory lock files that stop two updater processes from touching the
//! application directory and database at the same time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::config::Config;

/// A lock file this young may still be mid-write by the process that created it
const WRITE_GRACE: Duration = Duration::from_secs(5);

/// Lock types for different operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Update,
    Migration,
    Provision,
}

impl LockType {
    pub const ALL: [LockType; 3] = [LockType::Update, LockType::Migration, LockType::Provision];

    pub fn filename(&self) -> &'static str {
        match self {
            LockType::Update => "update.lock",
            LockType::Migration => "migration.lock",
            LockType::Provision => "provision.lock",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            LockType::Update => "Application update in progress",
            LockType::Migration => "Database migration in progress",
            LockType::Provision => "Administrator provisioning in progress",
        }
    }

    /// Upper bound on a legitimate run. Past it the lock is stale even if
    /// its PID is alive, since the PID may have been reused.
    pub fn max_duration_secs(&self) -> u64 {
        match self {
            LockType::Update => 2 * 60 * 60,
            LockType::Migration => 30 * 60,
            LockType::Provision => 10 * 60,
        }
    }

    /// Lock types that must not be held while this one is acquired
    fn conflicts(&self) -> &'static [LockType] {
        match self {
            LockType::Update => &[LockType::Migration, LockType::Provision],
            LockType::Migration => &[LockType::Update, LockType::Provision],
            LockType::Provision => &[LockType::Update, LockType::Migration],
        }
    }
}

/// Information stored in a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_type: LockType,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub description: String,
    pub timeout_secs: Option<u64>,
}

impl LockInfo {
    pub fn new(lock_type: LockType) -> Self {
        Self {
            lock_type,
            pid: std::process::id(),
            started_at: Utc::now(),
            description: lock_type.description().to_string(),
            timeout_secs: Some(lock_type.max_duration_secs()),
        }
    }

    /// Check if lock has expired
    pub fn is_expired(&self) -> bool {
        if let Some(timeout) = self.timeout_secs {
            let elapsed = Utc::now().signed_duration_since(self.started_at);
            elapsed.num_seconds() > timeout as i64
        } else {
            false
        }
    }

    /// Check if the process that created the lock is still running
    pub fn is_process_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }

        #[cfg(unix)]
        {
            use std::process::Command;
            Command::new("kill")
                .args(["-0", &self.pid.to_string()])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        #[cfg(windows)]
        {
            use std::process::Command;
            Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", self.pid)])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&self.pid.to_string()))
                .unwrap_or(false)
        }

        #[cfg(not(any(unix, windows)))]
        true
    }

    fn is_live(&self) -> bool {
        self.is_process_alive() && !self.is_expired()
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Already running: {description} (PID {pid})")]
    AlreadyLocked {
        lock_type: LockType,
        pid: u32,
        description: String,
    },
    #[error("Cannot start {requested:?}: {description}")]
    BlockedBy {
        requested: LockType,
        blocking: LockType,
        description: String,
    },
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialize error: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// Operation lock manager
pub struct OperationLock {
    locks_dir: PathBuf,
}

impl OperationLock {
    pub fn new(app_dir: &Path) -> Self {
        Self {
            locks_dir: Config::state_dir(app_dir).join("locks"),
        }
    }

    fn lock_path(&self, lock_type: LockType) -> PathBuf {
        self.locks_dir.join(lock_type.filename())
    }

    fn read_lock(&self, path: &Path) -> Option<LockInfo> {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    }

    /// An unreadable lock file that was only just created
    fn is_being_written(path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .map(|modified| modified.elapsed().map_or(true, |age| age < WRITE_GRACE))
            .unwrap_or(false)
    }

    /// Acquire a lock, failing fast if another live process holds it
    pub fn acquire(&self, lock_type: LockType) -> Result<LockGuard, LockError> {
        self.check_conflicts(lock_type)?;
        fs::create_dir_all(&self.locks_dir)?;

        let lock_path = self.lock_path(lock_type);
        let content = serde_json::to_string_pretty(&LockInfo::new(lock_type))?;

        // Second attempt only happens after clearing a stale lock
        for _ in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(mut file) => {
                    file.write_all(content.as_bytes())?;
                    debug!(lock = ?lock_type, "Lock acquired");
                    return Ok(LockGuard { lock_path, lock_type });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match self.read_lock(&lock_path) {
                        Some(existing) if existing.is_live() => {
                            return Err(LockError::AlreadyLocked {
                                lock_type,
                                pid: existing.pid,
                                description: existing.description,
                            });
                        }
                        None if Self::is_being_written(&lock_path) => {
                            return Err(LockError::AlreadyLocked {
                                lock_type,
                                pid: 0,
                                description: lock_type.description().to_string(),
                            });
                        }
                        _ => {
                            warn!(path = %lock_path.display(), "Removing stale lock");
                            let _ = fs::remove_file(&lock_path);
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LockError::AlreadyLocked {
            lock_type,
            pid: 0,
            description: "lock file reappeared while clearing a stale lock".to_string(),
        })
    }

    fn check_conflicts(&self, requested: LockType) -> Result<(), LockError> {
        for &blocking in requested.conflicts() {
            let path = self.lock_path(blocking);
            let held = match self.read_lock(&path) {
                Some(info) => info.is_live(),
                None => path.exists() && Self::is_being_written(&path),
            };
            if held {
                return Err(LockError::BlockedBy {
                    requested,
                    blocking,
                    description: blocking.description().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn get_active_locks(&self) -> Vec<LockInfo> {
        LockType::ALL
            .iter()
            .filter_map(|t| self.read_lock(&self.lock_path(*t)))
            .filter(|info| info.is_live())
            .collect()
    }
}

/// RAII guard that releases lock on drop
pub struct LockGuard {
    lock_path: PathBuf,
    lock_type: LockType,
}

impl LockGuard {
    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_release() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());

        let guard = locks.acquire(LockType::Update).unwrap();
        assert_eq!(guard.lock_type(), LockType::Update);

        // Can't acquire same lock twice
        assert!(matches!(
            locks.acquire(LockType::Update),
            Err(LockError::AlreadyLocked { .. })
        ));

        drop(guard);
        assert!(locks.acquire(LockType::Update).is_ok());
    }

    #[test]
    fn test_update_blocks_migration() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());

        let _update = locks.acquire(LockType::Update).unwrap();
        assert!(matches!(
            locks.acquire(LockType::Migration),
            Err(LockError::BlockedBy { blocking: LockType::Update, .. })
        ));
    }

    #[test]
    fn test_lock_older_than_its_max_duration_is_replaced() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());
        fs::create_dir_all(&locks.locks_dir).unwrap();

        // Same PID, so only the age makes it stale
        let mut stale = LockInfo::new(LockType::Update);
        stale.started_at = Utc::now() - chrono::Duration::hours(3);
        assert!(stale.is_process_alive());
        assert!(stale.is_expired());
        fs::write(
            locks.lock_path(LockType::Update),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        assert!(locks.acquire(LockType::Update).is_ok());
    }

    #[test]
    fn test_fresh_empty_lock_file_counts_as_held() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());
        fs::create_dir_all(&locks.locks_dir).unwrap();
        let path = locks.lock_path(LockType::Update);

        // Another process has created the file but not written it yet
        fs::File::create(&path).unwrap();
        assert!(matches!(
            locks.acquire(LockType::Update),
            Err(LockError::AlreadyLocked { pid: 0, .. })
        ));
        assert!(matches!(
            locks.acquire(LockType::Migration),
            Err(LockError::BlockedBy { blocking: LockType::Update, .. })
        ));

        // Left empty well past the grace period: abandoned
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        assert!(locks.acquire(LockType::Update).is_ok());
    }

    #[test]
    fn test_get_active_locks() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());
        assert!(locks.get_active_locks().is_empty());

        let _guard = locks.acquire(LockType::Provision).unwrap();
        let active = locks.get_active_locks();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].lock_type, LockType::Provision);
    }
}
