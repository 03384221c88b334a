//! Sync Manifest
//!
//! The declarative list of files one update replicates from the remote tree.
//! It belongs to the running updater build and is never persisted.

use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    /// Path inside the remote versioned tree
    pub remote: String,
    /// Destination relative to the application directory
    pub local: PathBuf,
    /// Create the destination's parent directory before writing
    pub create_parent: bool,
    /// Core files must succeed for the sync to count as successful
    pub required: bool,
}

impl ManifestEntry {
    /// Mirror `path` to the same relative location
    pub fn mirror(path: &str) -> Self {
        Self {
            remote: path.to_string(),
            local: PathBuf::from(path),
            create_parent: path.contains('/'),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

const CORE_FILES: &[&str] = &["app.py", "requirements.txt"];

const AUXILIARY_FILES: &[&str] = &[
    // launchers
    "run_app.bat",
    "UPDATE_WINDOWS.bat",
    // configuration
    "config/__init__.py",
    "config/settings.py",
    "config/datasets.json",
    // data model
    "models/__init__.py",
    "models/database.py",
    "models/dataset.py",
    // services
    "services/__init__.py",
    "services/auth_service.py",
    "services/cache_service.py",
    "services/data_service.py",
    "services/db_service.py",
    "services/find_better_service.py",
    "services/update_service.py",
    // ui components
    "ui/__init__.py",
    "ui/styles.py",
    "ui/components/__init__.py",
    "ui/components/auth.py",
    "ui/components/charts.py",
    "ui/components/sidebar.py",
    "ui/components/tables.py",
    // ui pages
    "ui/pages/__init__.py",
    "ui/pages/about.py",
    "ui/pages/charts_page.py",
    "ui/pages/compare.py",
    "ui/pages/find_better.py",
    "ui/pages/historical.py",
    "ui/pages/settings.py",
    "ui/pages/world_view.py",
    // utilities
    "utils/__init__.py",
    "utils/formatters.py",
    // migration scripts
    "migrations/sql/README.md",
];

/// The manifest shipped with this build
pub fn default_manifest() -> Vec<ManifestEntry> {
    CORE_FILES
        .iter()
        .map(|p| ManifestEntry::mirror(p).required())
        .chain(AUXILIARY_FILES.iter().map(|p| ManifestEntry::mirror(p)))
        .collect()
}
