//! Administrator Provisioning
//!
//! Creates administrator accounts and resets their credentials. Every
//! operation that sets a credential returns a freshly generated
//! [`OneTimeSecret`]; only its bcrypt hash is stored, in the same
//! `users.password_hash` column the application checks at login.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::engine::database::{Database, DatabaseError};

pub const MIN_SECRET_LENGTH: usize = 16;
/// bcrypt ignores everything past 72 bytes
pub const MAX_SECRET_LENGTH: usize = 72;

const SECRET_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%";

const ADMIN_ROLE: &str = "admin";

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),
    #[error("Account already exists: {0}")]
    AlreadyExists(String),
    #[error("Account not found: {0}")]
    NotFound(String),
    #[error("Password hashing failed: {0}")]
    Hash(String),
}

/// Plaintext credential handed to the operator exactly once
pub struct OneTimeSecret(String);

impl OneTimeSecret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for OneTimeSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OneTimeSecret([REDACTED])")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminAccount {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    pub must_change_password: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionAction {
    Created,
    Reset,
}

#[derive(Debug)]
pub struct ProvisionedAdmin {
    pub email: String,
    pub name: Option<String>,
    pub action: ProvisionAction,
    pub secret: OneTimeSecret,
}

/// Trim, lower-case and sanity check an address
pub fn normalize_email(email: &str) -> Result<String, ProvisionError> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(ProvisionError::InvalidEmail(email))
    }
}

pub fn generate_secret(length: usize) -> OneTimeSecret {
    let length = length.clamp(MIN_SECRET_LENGTH, MAX_SECRET_LENGTH);
    let secret = (0..length)
        .map(|_| SECRET_ALPHABET[OsRng.gen_range(0..SECRET_ALPHABET.len())] as char)
        .collect();
    OneTimeSecret(secret)
}

pub fn hash_secret(secret: &str) -> Result<String, ProvisionError> {
    bcrypt::hash(secret, bcrypt::DEFAULT_COST).map_err(|e| ProvisionError::Hash(e.to_string()))
}

/// A malformed or foreign hash never verifies
pub fn verify_secret(secret: &str, hash: &str) -> bool {
    bcrypt::verify(secret, hash).unwrap_or(false)
}

pub struct AdminProvisioner<'a> {
    db: &'a Database,
    secret_length: usize,
}

impl<'a> AdminProvisioner<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            secret_length: MIN_SECRET_LENGTH,
        }
    }

    /// Lengths outside what bcrypt can use are clamped
    pub fn with_secret_length(mut self, length: usize) -> Self {
        self.secret_length = length.clamp(MIN_SECRET_LENGTH, MAX_SECRET_LENGTH);
        self
    }

    pub fn get(&self, email: &str) -> Result<Option<AdminAccount>, ProvisionError> {
        let email = normalize_email(email)?;
        let conn = self.db.get_connection()?;
        let account = conn
            .query_row(
                "SELECT id, email, name, role, must_change_password, created_at, updated_at
                 FROM users WHERE email = ?1",
                params![email],
                |row| {
                    Ok(AdminAccount {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                        role: row.get(3)?,
                        must_change_password: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    /// Create a new administrator. Fails if the address is already registered.
    pub fn create(&self, email: &str, name: Option<&str>) -> Result<ProvisionedAdmin, ProvisionError> {
        let email = normalize_email(email)?;
        let secret = generate_secret(self.secret_length);
        let hash = hash_secret(secret.expose())?;

        let mut conn = self.db.get_connection()?;
        let tx = conn.transaction()?;
        if stored_hash(&tx, &email)?.is_some() {
            return Err(ProvisionError::AlreadyExists(email));
        }
        let now = Utc::now();
        tx.execute(
            "INSERT INTO users (email, name, password_hash, role, must_change_password, created_at, updated_at, is_active)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5, 1)",
            params![email, name, hash, ADMIN_ROLE, now],
        )?;
        tx.commit()?;

        info!(email = %email, "Administrator created");
        Ok(ProvisionedAdmin {
            email,
            name: name.map(str::to_string),
            action: ProvisionAction::Created,
            secret,
        })
    }

    /// Replace the credential of an existing account. The old secret stops working immediately.
    pub fn reset(&self, email: &str) -> Result<OneTimeSecret, ProvisionError> {
        self.reset_credential(&normalize_email(email)?, false)
    }

    /// Create the account if absent, otherwise reset its credential and grant the admin role
    pub fn ensure_admin(&self, email: &str, name: Option<&str>) -> Result<ProvisionedAdmin, ProvisionError> {
        let email = normalize_email(email)?;
        if self.get(&email)?.is_none() {
            return self.create(&email, name);
        }
        let secret = self.reset_credential(&email, true)?;
        Ok(ProvisionedAdmin {
            email,
            name: name.map(str::to_string),
            action: ProvisionAction::Reset,
            secret,
        })
    }

    /// Create the account if absent; an existing account is left untouched
    pub fn create_missing(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<Option<ProvisionedAdmin>, ProvisionError> {
        if self.get(email)?.is_some() {
            info!(email = %email.trim().to_lowercase(), "Administrator exists, leaving unchanged");
            return Ok(None);
        }
        self.create(email, name).map(Some)
    }

    pub fn verify(&self, email: &str, secret: &str) -> Result<bool, ProvisionError> {
        let email = normalize_email(email)?;
        let conn = self.db.get_connection()?;
        Ok(stored_hash(&conn, &email)?
            .flatten()
            .map(|hash| verify_secret(secret, &hash))
            .unwrap_or(false))
    }

    fn reset_credential(&self, email: &str, promote: bool) -> Result<OneTimeSecret, ProvisionError> {
        let mut conn = self.db.get_connection()?;
        let tx = conn.transaction()?;

        let previous = stored_hash(&tx, email)?
            .ok_or_else(|| ProvisionError::NotFound(email.to_string()))?;

        // Never hand out a secret that the old hash would still accept
        let secret = loop {
            let candidate = generate_secret(self.secret_length);
            match &previous {
                Some(old) if verify_secret(candidate.expose(), old) => continue,
                _ => break candidate,
            }
        };
        let hash = hash_secret(secret.expose())?;

        tx.execute(
            "UPDATE users SET password_hash = ?1, must_change_password = 1, updated_at = ?2 WHERE email = ?3",
            params![hash, Utc::now(), email],
        )?;
        if promote {
            tx.execute(
                "UPDATE users SET role = ?1, is_active = 1 WHERE email = ?2",
                params![ADMIN_ROLE, email],
            )?;
        }
        tx.commit()?;

        info!(email = %email, "Administrator credential reset");
        Ok(secret)
    }
}

/// `None` if the account is absent, `Some(None)` if it exists without a credential
fn stored_hash(conn: &Connection, email: &str) -> Result<Option<Option<String>>, rusqlite::Error> {
    conn.query_row(
        "SELECT password_hash FROM users WHERE email = ?1",
        params![email],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::migrations::{builtin_migrations, Migration, MigrationRunner, MigrationSet};

    fn migrated_db() -> Database {
        let db = Database::in_memory().unwrap();
        let set = MigrationSet::new(
            builtin_migrations()
                .into_iter()
                .map(|m| Box::new(m) as Box<dyn Migration>)
                .collect(),
        )
        .unwrap();
        MigrationRunner::new(set).run(&db).unwrap();
        db
    }

    #[test]
    fn test_generated_secret_shape() {
        let secret = generate_secret(4);
        assert_eq!(secret.expose().len(), MIN_SECRET_LENGTH);
        assert!(secret.expose().bytes().all(|b| SECRET_ALPHABET.contains(&b)));
        assert_eq!(generate_secret(24).expose().len(), 24);
        assert_eq!(generate_secret(500).expose().len(), MAX_SECRET_LENGTH);
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = generate_secret(MIN_SECRET_LENGTH);
        assert!(!format!("{:?}", secret).contains(secret.expose()));
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Ops@Example.COM ").unwrap(), "ops@example.com");
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("a b@example.com").is_err());
    }

    #[test]
    fn test_create_stores_hash_not_secret() {
        let db = migrated_db();
        let provisioner = AdminProvisioner::new(&db);

        let created = provisioner.create("ops@example.com", Some("Ops")).unwrap();
        assert_eq!(created.action, ProvisionAction::Created);

        let conn = db.get_connection().unwrap();
        let stored: String = conn
            .query_row("SELECT password_hash FROM users WHERE email = 'ops@example.com'", [], |r| r.get(0))
            .unwrap();
        drop(conn);
        assert!(stored.starts_with("$2b$"));
        assert!(!stored.contains(created.secret.expose()));
        // The application checks logins with plain bcrypt against this column
        assert!(bcrypt::verify(created.secret.expose(), &stored).unwrap());

        let account = provisioner.get("ops@example.com").unwrap().unwrap();
        assert_eq!(account.role, "admin");
        assert!(account.must_change_password);
        assert!(provisioner.verify("ops@example.com", created.secret.expose()).unwrap());
    }

    #[test]
    fn test_hash_written_by_the_application_verifies() {
        let db = migrated_db();
        let legacy = bcrypt::hash("Welcome2024!", 4).unwrap();
        let conn = db.get_connection().unwrap();
        conn.execute(
            "INSERT INTO users (email, role, password_hash) VALUES ('old@example.com', 'admin', ?1)",
            params![legacy],
        )
        .unwrap();
        drop(conn);

        let provisioner = AdminProvisioner::new(&db);
        assert!(provisioner.verify("old@example.com", "Welcome2024!").unwrap());
        assert!(!provisioner.verify("old@example.com", "welcome2024!").unwrap());
        assert!(!verify_secret("anything", "$argon2id$v=19$m=19456,t=2,p=1$abc$def"));
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let db = migrated_db();
        let provisioner = AdminProvisioner::new(&db);
        provisioner.create("ops@example.com", None).unwrap();

        let second = provisioner.create("OPS@example.com", None);
        assert!(matches!(second, Err(ProvisionError::AlreadyExists(_))));
    }

    #[test]
    fn test_reset_invalidates_previous_secret() {
        let db = migrated_db();
        let provisioner = AdminProvisioner::new(&db);
        let created = provisioner.create("ops@example.com", None).unwrap();

        let fresh = provisioner.reset("ops@example.com").unwrap();
        assert!(!fresh.expose().is_empty());
        assert_ne!(fresh.expose(), created.secret.expose());
        assert!(!provisioner.verify("ops@example.com", created.secret.expose()).unwrap());
        assert!(provisioner.verify("ops@example.com", fresh.expose()).unwrap());
    }

    #[test]
    fn test_reset_unknown_account() {
        let db = migrated_db();
        let provisioner = AdminProvisioner::new(&db);
        assert!(matches!(
            provisioner.reset("ghost@example.com"),
            Err(ProvisionError::NotFound(_))
        ));
    }

    #[test]
    fn test_ensure_admin_promotes_existing_member() {
        let db = migrated_db();
        let conn = db.get_connection().unwrap();
        conn.execute(
            "INSERT INTO users (email, role, password_hash) VALUES ('member@example.com', 'member', NULL)",
            [],
        )
        .unwrap();
        drop(conn);

        let provisioner = AdminProvisioner::new(&db);
        let result = provisioner.ensure_admin("member@example.com", None).unwrap();
        assert_eq!(result.action, ProvisionAction::Reset);
        assert_eq!(provisioner.get("member@example.com").unwrap().unwrap().role, "admin");
        assert!(provisioner.verify("member@example.com", result.secret.expose()).unwrap());
    }

    #[test]
    fn test_create_missing_leaves_existing_alone() {
        let db = migrated_db();
        let provisioner = AdminProvisioner::new(&db);
        let created = provisioner.create_missing("ops@example.com", None).unwrap().unwrap();

        assert!(provisioner.create_missing("ops@example.com", None).unwrap().is_none());
        assert!(provisioner.verify("ops@example.com", created.secret.expose()).unwrap());
    }
}
