//! Application version check
//!
//! Reads the `VERSION = "x.y.z"` assignment from the local and remote copies
//! of the settings file. Purely informational: the update always proceeds.

use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::engine::github::{FetchError, RemoteFetcher};
use crate::engine::keystore::Token;

fn version_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"(?m)^\s*VERSION\s*=\s*["']([^"']+)["']"#).ok())
        .as_ref()
}

/// Extract the version string from settings source text
pub fn parse_version_line(source: &str) -> Option<String> {
    version_pattern()?
        .captures(source)
        .map(|caps| caps[1].trim().to_string())
}

/// True when `a` is a strictly newer dotted version than `b`
pub fn is_newer_version(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> Vec<u32> {
        v.trim_start_matches('v')
            .split('.')
            .filter_map(|s| s.parse().ok())
            .collect()
    };
    parse(a) > parse(b)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionCheck {
    pub local: Option<String>,
    pub remote: Option<String>,
}

impl VersionCheck {
    pub fn update_available(&self) -> bool {
        match (&self.local, &self.remote) {
            (Some(local), Some(remote)) => is_newer_version(remote, local),
            // Nothing installed yet
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

pub fn local_version(app_dir: &Path, version_file: &str) -> Option<String> {
    let path = app_dir.join(version_file);
    match std::fs::read_to_string(&path) {
        Ok(source) => parse_version_line(&source),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No local version file");
            None
        }
    }
}

pub fn remote_version(
    fetcher: &dyn RemoteFetcher,
    token: &Token,
    version_file: &str,
) -> Result<Option<String>, FetchError> {
    let bytes = fetcher.fetch(version_file, token)?;
    Ok(parse_version_line(&String::from_utf8_lossy(&bytes)))
}

/// Compare local and remote versions. Fetch failures leave `remote` empty.
pub fn check(
    fetcher: &dyn RemoteFetcher,
    token: &Token,
    app_dir: &Path,
    version_file: &str,
) -> VersionCheck {
    let local = local_version(app_dir, version_file);
    let remote = match remote_version(fetcher, token, version_file) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Remote version unavailable");
            None
        }
    };
    let check = VersionCheck { local, remote };
    info!(
        local = check.local.as_deref().unwrap_or("unknown"),
        remote = check.remote.as_deref().unwrap_or("unknown"),
        update_available = check.update_available(),
        "Version check"
    );
    check
}
