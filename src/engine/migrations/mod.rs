//! Schema Migrations Module
//! Discovers, orders, and applies schema migrations against the local store
//!
//! The journal must always hold a prefix of the ordered migration list. Each
//! migration runs in its own transaction together with its journal row, so a
//! crash leaves either both or neither.

use crate::engine::database::{Database, DatabaseError, MigrationRecord};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Migration scripts shipped with the application tree
pub const MIGRATIONS_SUBDIR: &str = "migrations/sql";

/// Revision stamp left by installs that predate the journal
const ALEMBIC_TABLE: &str = "alembic_version";

/// Longest failure reason shown to the operator
const MAX_REASON_LEN: usize = 200;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQL execution error: {0}")]
    SqlError(#[from] rusqlite::Error),
    #[error("Duplicate migration version: {0}")]
    DuplicateVersion(String),
    #[error("Invalid migration file name: {0}")]
    InvalidFileName(String),
    #[error("Schema drift detected: {0}")]
    SchemaDrift(String),
    #[error("Migration {version} ({description}) failed: {source}")]
    Failed {
        version: String,
        description: String,
        /// Versions committed earlier in the same run
        applied: Vec<String>,
        source: Box<MigrationError>,
    },
}

impl MigrationError {
    /// One-line cause for operator output. SQLite parse errors carry the
    /// whole remaining script, which is dropped here.
    pub fn summary(&self) -> String {
        match self {
            MigrationError::Failed { source, .. } => source.summary(),
            MigrationError::SqlError(rusqlite::Error::SqlInputError { msg, offset, .. }) => {
                format!("SQL execution error: {} (at offset {})", msg, offset)
            }
            other => {
                let text = other.to_string();
                let line = text.lines().next().unwrap_or_default();
                match line.char_indices().nth(MAX_REASON_LEN) {
                    Some((cut, _)) => format!("{}...", &line[..cut]),
                    None => line.to_string(),
                }
            }
        }
    }
}

/// A single one-way schema change
pub trait Migration: Send + Sync {
    /// Sortable version token, e.g. `20241213_0001`
    fn version(&self) -> &str;
    fn description(&self) -> &str;
    fn checksum(&self) -> String;
    /// Execute the change. Runs inside a transaction owned by the runner.
    fn apply(&self, conn: &Connection) -> rusqlite::Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqlMigration {
    pub version: String,
    pub description: String,
    pub sql: String,
    pub path: Option<PathBuf>,
}

impl SqlMigration {
    pub fn new(version: &str, description: &str, sql: &str) -> Self {
        Self {
            version: version.to_string(),
            description: description.to_string(),
            sql: sql.to_string(),
            path: None,
        }
    }

    /// Parse `<digits>[_<digits>...]_<description>.sql`
    pub fn from_file(path: &Path) -> Result<Self, MigrationError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| MigrationError::InvalidFileName(path.display().to_string()))?;
        let (version, description) = split_file_stem(&stem)
            .ok_or_else(|| MigrationError::InvalidFileName(stem.clone()))?;
        let sql = fs::read_to_string(path)?;
        Ok(Self {
            version,
            description,
            sql,
            path: Some(path.to_path_buf()),
        })
    }
}

impl Migration for SqlMigration {
    fn version(&self) -> &str {
        &self.version
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn checksum(&self) -> String {
        compute_checksum(&self.sql)
    }

    fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(&self.sql)
    }
}

fn split_file_stem(stem: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = stem.split('_').collect();
    let version_len = parts
        .iter()
        .take_while(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        .count();
    if version_len == 0 {
        return None;
    }
    let version = parts[..version_len].join("_");
    let description = if version_len < parts.len() {
        parts[version_len..].join(" ")
    } else {
        version.clone()
    };
    Some((version, description))
}

fn compute_checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex::encode(hasher.finalize())
}

/// Migrations compiled into the updater
pub fn builtin_migrations() -> Vec<SqlMigration> {
    vec![
        SqlMigration::new(
            "20241213_0001",
            "initial schema",
            include_str!("sql/20241213_0001_initial_schema.sql"),
        ),
        SqlMigration::new(
            "20241214_0002",
            "add system settings",
            include_str!("sql/20241214_0002_add_system_settings.sql"),
        ),
    ]
}

/// Load `*.sql` files from a directory; a missing directory yields nothing
pub fn discover(dir: &Path) -> Result<Vec<SqlMigration>, MigrationError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "sql"))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    entries
        .iter()
        .map(|e| SqlMigration::from_file(&e.path()))
        .collect()
}

/// The full ordered migration list
pub struct MigrationSet {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationSet {
    pub fn new(mut migrations: Vec<Box<dyn Migration>>) -> Result<Self, MigrationError> {
        migrations.sort_by(|a, b| a.version().cmp(b.version()));
        for pair in migrations.windows(2) {
            if pair[0].version() == pair[1].version() {
                return Err(MigrationError::DuplicateVersion(pair[0].version().to_string()));
            }
        }
        Ok(Self { migrations })
    }

    /// Built-in migrations plus any shipped under `<app_dir>/migrations/sql`.
    /// A shipped script with a built-in version replaces the built-in one.
    pub fn load(app_dir: &Path) -> Result<Self, MigrationError> {
        let mut all: Vec<Box<dyn Migration>> = Vec::new();
        let discovered = discover(&app_dir.join(MIGRATIONS_SUBDIR))?;
        for m in builtin_migrations() {
            if discovered.iter().any(|d| d.version() == m.version()) {
                debug!(version = %m.version(), "Shipped script overrides built-in migration");
                continue;
            }
            all.push(Box::new(m));
        }
        for m in discovered {
            all.push(Box::new(m));
        }
        Self::new(all)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn versions(&self) -> Vec<String> {
        self.migrations.iter().map(|m| m.version().to_string()).collect()
    }
}

#[derive(Debug)]
pub struct MigrationStatus {
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<String>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Versions applied by this run, in order
    pub applied: Vec<String>,
    /// Versions that were already recorded before the run
    pub already_applied: usize,
}

pub struct MigrationRunner {
    set: MigrationSet,
}

impl MigrationRunner {
    pub fn new(set: MigrationSet) -> Self {
        Self { set }
    }

    /// Index of the next unapplied migration, after checking the journal is a prefix
    fn next_index(&self, applied: &[MigrationRecord]) -> Result<usize, MigrationError> {
        if applied.len() > self.set.len() {
            return Err(MigrationError::SchemaDrift(format!(
                "{} migrations recorded but only {} known",
                applied.len(),
                self.set.len()
            )));
        }

        for (record, migration) in applied.iter().zip(&self.set.migrations) {
            if record.version != migration.version() {
                return Err(MigrationError::SchemaDrift(format!(
                    "journal has {} where {} was expected",
                    record.version,
                    migration.version()
                )));
            }
            if record.checksum != migration.checksum() {
                warn!(
                    version = %record.version,
                    "Applied migration differs from the current script"
                );
            }
        }

        Ok(applied.len())
    }

    /// Number of leading migrations an install without a journal already has.
    ///
    /// Installs made by the Alembic based installer carry an `alembic_version`
    /// stamp naming the last revision applied, either as the bare revision id
    /// (`0002`) or the full version token. Installs whose stamp was never
    /// written but whose `users` table exists hold every built-in migration.
    fn legacy_baseline(&self, db: &Database) -> Result<usize, MigrationError> {
        if !db.get_applied_migrations()?.is_empty() {
            return Ok(0);
        }

        if db.table_exists(ALEMBIC_TABLE)? {
            let conn = db.get_connection()?;
            let stamp: Option<String> = conn
                .query_row(
                    &format!("SELECT version_num FROM {ALEMBIC_TABLE} LIMIT 1"),
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(stamp) = stamp else {
                return Ok(0);
            };
            let suffix = format!("_{}", stamp);
            return self
                .set
                .migrations
                .iter()
                .position(|m| m.version() == stamp || m.version().ends_with(&suffix))
                .map(|index| index + 1)
                .ok_or_else(|| {
                    MigrationError::SchemaDrift(format!(
                        "database is stamped at unknown revision {}",
                        stamp
                    ))
                });
        }

        if db.table_exists("users")? {
            let builtin: Vec<String> = builtin_migrations().into_iter().map(|m| m.version).collect();
            return Ok(self
                .set
                .migrations
                .iter()
                .take_while(|m| builtin.iter().any(|v| v == m.version()))
                .count());
        }

        Ok(0)
    }

    /// Record the first `count` migrations as applied without running them
    fn adopt(&self, db: &Database, count: usize) -> Result<(), MigrationError> {
        let mut conn = db.get_connection()?;
        let tx = conn.transaction()?;
        for migration in &self.set.migrations[..count] {
            Database::record_migration(
                &tx,
                migration.version(),
                migration.description(),
                &migration.checksum(),
            )?;
        }
        tx.commit()?;
        info!(count, "Adopted existing schema into the migration journal");
        Ok(())
    }

    pub fn status(&self, db: &Database) -> Result<MigrationStatus, MigrationError> {
        let applied = db.get_applied_migrations()?;
        let next = self.next_index(&applied)?.max(self.legacy_baseline(db)?);
        let pending = self.set.migrations[next..]
            .iter()
            .map(|m| m.version().to_string())
            .collect();
        Ok(MigrationStatus { applied, pending })
    }

    /// Apply one migration and record it in the same transaction
    pub fn apply(&self, db: &Database, migration: &dyn Migration) -> Result<(), MigrationError> {
        let mut conn = db.get_connection()?;
        let tx = conn.transaction()?;

        migration.apply(&tx)?;
        Database::record_migration(
            &tx,
            migration.version(),
            migration.description(),
            &migration.checksum(),
        )?;

        // Dropping an uncommitted transaction rolls it back
        tx.commit()?;
        Ok(())
    }

    /// Apply every pending migration in order, halting at the first failure
    pub fn run(&self, db: &Database) -> Result<RunReport, MigrationError> {
        let baseline = self.legacy_baseline(db)?;
        if baseline > 0 {
            self.adopt(db, baseline)?;
        }

        let applied = db.get_applied_migrations()?;
        let next = self.next_index(&applied)?;

        let mut report = RunReport {
            applied: Vec::new(),
            already_applied: next,
        };

        if next == self.set.len() {
            info!(count = next, "Schema is up to date");
            return Ok(report);
        }

        for migration in &self.set.migrations[next..] {
            info!(version = %migration.version(), description = %migration.description(), "Applying migration");
            if let Err(source) = self.apply(db, migration.as_ref()) {
                return Err(MigrationError::Failed {
                    version: migration.version().to_string(),
                    description: migration.description().to_string(),
                    applied: report.applied,
                    source: Box::new(source),
                });
            }
            report.applied.push(migration.version().to_string());
        }

        info!(applied = report.applied.len(), "Migrations complete");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn runner(migrations: Vec<SqlMigration>) -> MigrationRunner {
        let boxed = migrations
            .into_iter()
            .map(|m| Box::new(m) as Box<dyn Migration>)
            .collect();
        MigrationRunner::new(MigrationSet::new(boxed).unwrap())
    }

    #[test]
    fn test_split_file_stem() {
        assert_eq!(
            split_file_stem("20241215_0003_add_alerts"),
            Some(("20241215_0003".to_string(), "add alerts".to_string()))
        );
        assert_eq!(
            split_file_stem("0004"),
            Some(("0004".to_string(), "0004".to_string()))
        );
        assert_eq!(split_file_stem("add_alerts"), None);
    }

    #[test]
    fn test_builtin_migrations_apply_cleanly() {
        let db = Database::in_memory().unwrap();
        let runner = runner(builtin_migrations());

        let report = runner.run(&db).unwrap();
        assert_eq!(report.applied, vec!["20241213_0001", "20241214_0002"]);
        assert!(db.table_exists("users").unwrap());
        assert!(db.table_exists("system_settings").unwrap());
        assert!(runner.status(&db).unwrap().is_up_to_date());
    }

    #[test]
    fn test_run_is_noop_when_up_to_date() {
        let db = Database::in_memory().unwrap();
        let runner = runner(builtin_migrations());
        runner.run(&db).unwrap();

        let second = runner.run(&db).unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.already_applied, 2);
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let a = SqlMigration::new("0001", "a", "CREATE TABLE a (id INTEGER)");
        let b = SqlMigration::new("0001", "b", "CREATE TABLE b (id INTEGER)");
        let result = MigrationSet::new(vec![Box::new(a), Box::new(b)]);
        assert!(matches!(result, Err(MigrationError::DuplicateVersion(v)) if v == "0001"));
    }

    #[test]
    fn test_failed_migration_leaves_no_partial_change() {
        let db = Database::in_memory().unwrap();
        let runner = runner(vec![SqlMigration::new(
            "0001",
            "half broken",
            "CREATE TABLE half (id INTEGER); INSERT INTO missing_table VALUES (1);",
        )]);

        let err = runner.run(&db).unwrap_err();
        assert!(matches!(err, MigrationError::Failed { ref version, .. } if version == "0001"));
        // the CREATE TABLE before the failing statement was rolled back
        assert!(!db.table_exists("half").unwrap());
        assert!(db.get_applied_migrations().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_journal_entry_is_drift() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_connection().unwrap();
        Database::record_migration(&conn, "0009", "from the future", "x").unwrap();
        drop(conn);

        let runner = runner(vec![SqlMigration::new("0001", "a", "CREATE TABLE a (id INTEGER)")]);
        assert!(matches!(runner.run(&db), Err(MigrationError::SchemaDrift(_))));
        assert!(!db.table_exists("a").unwrap());
    }

    fn legacy_install(stamp: Option<&str>) -> Database {
        let db = Database::in_memory().unwrap();
        let conn = db.get_connection().unwrap();
        // Tables as the application's own create_all leaves them
        conn.execute_batch(include_str!("sql/20241213_0001_initial_schema.sql")).unwrap();
        conn.execute_batch(include_str!("sql/20241214_0002_add_system_settings.sql")).unwrap();
        if let Some(stamp) = stamp {
            conn.execute_batch("CREATE TABLE alembic_version (version_num VARCHAR(32) NOT NULL PRIMARY KEY)")
                .unwrap();
            conn.execute("INSERT INTO alembic_version (version_num) VALUES (?1)", [stamp])
                .unwrap();
        }
        drop(conn);
        db
    }

    #[test]
    fn test_stamped_install_is_adopted_not_rerun() {
        for stamp in ["0002", "20241214_0002"] {
            let db = legacy_install(Some(stamp));
            let runner = runner(builtin_migrations());
            assert!(runner.status(&db).unwrap().is_up_to_date());

            let report = runner.run(&db).unwrap();
            assert!(report.applied.is_empty());
            assert_eq!(report.already_applied, 2);
            let journal: Vec<String> = db
                .get_applied_migrations()
                .unwrap()
                .into_iter()
                .map(|r| r.version)
                .collect();
            assert_eq!(journal, vec!["20241213_0001", "20241214_0002"]);
        }
    }

    #[test]
    fn test_install_stamped_at_first_revision_applies_the_rest() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_connection().unwrap();
        conn.execute_batch(include_str!("sql/20241213_0001_initial_schema.sql")).unwrap();
        conn.execute_batch(
            "CREATE TABLE alembic_version (version_num VARCHAR(32) NOT NULL PRIMARY KEY);
             INSERT INTO alembic_version VALUES ('0001');",
        )
        .unwrap();
        drop(conn);

        let report = runner(builtin_migrations()).run(&db).unwrap();
        assert_eq!(report.applied, vec!["20241214_0002"]);
        assert_eq!(report.already_applied, 1);
        assert!(db.table_exists("system_settings").unwrap());
    }

    #[test]
    fn test_unstamped_install_with_users_adopts_builtins() {
        let db = legacy_install(None);
        let report = runner(builtin_migrations()).run(&db).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(db.get_applied_migrations().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_alembic_stamp_is_drift() {
        let db = legacy_install(Some("9999"));
        assert!(matches!(
            runner(builtin_migrations()).run(&db),
            Err(MigrationError::SchemaDrift(_))
        ));
        assert!(db.get_applied_migrations().unwrap().is_empty());
    }

    #[test]
    fn test_failure_summary_omits_script_body() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_connection().unwrap();
        conn.execute_batch("CREATE TABLE users (id INTEGER)").unwrap();
        drop(conn);

        let long_script = format!(
            "CREATE TABLE users (id INTEGER);\n{}",
            "CREATE TABLE filler (id INTEGER);\n".repeat(40)
        );
        let err = runner(vec![SqlMigration::new("0001", "initial", &long_script)])
            .run(&db)
            .unwrap_err();
        let summary = err.summary();
        assert!(summary.contains("already exists"), "{}", summary);
        assert!(!summary.contains("filler"));
        assert!(!summary.contains('\n'));
    }

    #[test]
    fn test_discover_merges_with_builtins() {
        let dir = tempdir().unwrap();
        let sql_dir = dir.path().join(MIGRATIONS_SUBDIR);
        fs::create_dir_all(&sql_dir).unwrap();
        fs::write(
            sql_dir.join("20250101_0003_add_notes.sql"),
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);",
        )
        .unwrap();
        fs::write(sql_dir.join("README.txt"), "ignored").unwrap();

        let set = MigrationSet::load(dir.path()).unwrap();
        assert_eq!(
            set.versions(),
            vec!["20241213_0001", "20241214_0002", "20250101_0003"]
        );
    }

    #[test]
    fn test_shipped_script_overrides_builtin_version() {
        let dir = tempdir().unwrap();
        let sql_dir = dir.path().join(MIGRATIONS_SUBDIR);
        fs::create_dir_all(&sql_dir).unwrap();
        let shipped = "CREATE TABLE system_settings (key TEXT PRIMARY KEY, value TEXT);";
        fs::write(sql_dir.join("20241214_0002_add_system_settings.sql"), shipped).unwrap();

        let set = MigrationSet::load(dir.path()).unwrap();
        assert_eq!(set.versions(), vec!["20241213_0001", "20241214_0002"]);
        let db = Database::in_memory().unwrap();
        MigrationRunner::new(set).run(&db).unwrap();
        assert_eq!(
            db.get_applied_migrations().unwrap()[1].checksum,
            compute_checksum(shipped)
        );
    }
}
