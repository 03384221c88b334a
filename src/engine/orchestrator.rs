//! Update Orchestrator
//!
//! Runs the update pipeline end to end: lock, prerequisites, token, version
//! check, file sync, dependency install, migrations, administrator
//! provisioning. Fails fast at the first fatal stage; earlier stages are not
//! rolled back. Every collaborator is injected so the pipeline can be driven
//! without network, runtime or keyring.

use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::engine::admins::{AdminProvisioner, ProvisionedAdmin};
use crate::engine::config::{Config, ProvisioningMode};
use crate::engine::database::Database;
use crate::engine::error::{FetchFailureKind, Stage, UpdateError};
use crate::engine::github::{FetchError, GitHubFetcher, RemoteFetcher};
use crate::engine::keystore::{self, CredentialStore, Token};
use crate::engine::locks::{LockType, OperationLock};
use crate::engine::manifest::{self, ManifestEntry};
use crate::engine::migrations::{MigrationError, MigrationRunner, MigrationSet, RunReport};
use crate::engine::runtime::{DependencyInstaller, PathProbe, PipInstaller, RuntimeInfo, RuntimeProbe};
use crate::engine::sync::{EntryOutcome, FileSync, SyncReport};
use crate::engine::version::{self, VersionCheck};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptReason {
    /// No token is stored yet
    Missing,
    /// The previous token was rejected by the remote
    Rejected,
}

/// Interactive token entry
pub trait TokenPrompt {
    /// `None` when the operator gives up (empty input or closed stdin)
    fn ask(&self, reason: PromptReason) -> Option<Token>;
}

/// Reads a token from stdin after printing instructions to stdout
pub struct ConsolePrompt;

impl TokenPrompt for ConsolePrompt {
    fn ask(&self, reason: PromptReason) -> Option<Token> {
        let mut out = std::io::stdout();
        if reason == PromptReason::Rejected {
            let _ = writeln!(out, "\nThe token was rejected by GitHub or has no access to the repository.");
        }
        let _ = writeln!(
            out,
            "\nA GitHub access token is required to download updates.\n\
             \x20 1. Open https://github.com/settings/tokens\n\
             \x20 2. Generate a new token (classic) with the 'repo' scope\n\
             \x20 3. Copy it and paste it below\n"
        );
        let _ = write!(out, "Token (leave empty to cancel): ");
        let _ = out.flush();

        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(Token::new(&line)).filter(|t| !t.is_blank()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    Environment,
    Store,
    /// Migrated from the old plaintext token file
    LegacyFile,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Warning,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct UpdateReport {
    pub stages: Vec<StageRecord>,
    pub runtime: Option<RuntimeInfo>,
    pub token_source: Option<TokenSource>,
    pub version: Option<VersionCheck>,
    pub sync: Option<SyncReport>,
    pub migrations: Option<RunReport>,
    /// Accounts created or reset, carrying their one-time secrets
    pub admins: Vec<ProvisionedAdmin>,
    pub failure: Option<UpdateError>,
}

impl UpdateReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().rev().find(|r| r.stage == stage)
    }

    fn record(&mut self, stage: Stage, status: StageStatus, detail: impl Into<String>) {
        let detail = detail.into();
        match status {
            StageStatus::Warning => warn!(stage = %stage, detail = %detail, "Stage finished with warnings"),
            StageStatus::Failed => warn!(stage = %stage, detail = %detail, "Stage failed"),
            _ => info!(stage = %stage, status = ?status, detail = %detail, "Stage finished"),
        }
        self.stages.push(StageRecord { stage, status, detail });
    }

    fn fail(&mut self, error: UpdateError) {
        self.record(error.stage(), StageStatus::Failed, error.to_string());
        self.failure = Some(error);
    }
}

type MigrationLoader = Box<dyn Fn() -> Result<MigrationSet, MigrationError>>;

pub struct Orchestrator {
    app_dir: PathBuf,
    config: Config,
    manifest: Vec<ManifestEntry>,
    store: Box<dyn CredentialStore>,
    fetcher: Box<dyn RemoteFetcher>,
    prompt: Box<dyn TokenPrompt>,
    probe: Box<dyn RuntimeProbe>,
    installer: Box<dyn DependencyInstaller>,
    migrations: MigrationLoader,
    env_token: Option<Token>,
}

pub struct OrchestratorBuilder {
    app_dir: PathBuf,
    config: Config,
    manifest: Option<Vec<ManifestEntry>>,
    store: Option<Box<dyn CredentialStore>>,
    fetcher: Option<Box<dyn RemoteFetcher>>,
    prompt: Option<Box<dyn TokenPrompt>>,
    probe: Option<Box<dyn RuntimeProbe>>,
    installer: Option<Box<dyn DependencyInstaller>>,
    migrations: Option<MigrationLoader>,
    read_env: bool,
}

impl OrchestratorBuilder {
    pub fn manifest(mut self, manifest: Vec<ManifestEntry>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn store(mut self, store: impl CredentialStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn fetcher(mut self, fetcher: impl RemoteFetcher + 'static) -> Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    pub fn prompt(mut self, prompt: impl TokenPrompt + 'static) -> Self {
        self.prompt = Some(Box::new(prompt));
        self
    }

    pub fn probe(mut self, probe: impl RuntimeProbe + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    pub fn installer(mut self, installer: impl DependencyInstaller + 'static) -> Self {
        self.installer = Some(Box::new(installer));
        self
    }

    /// Replace the migration set; by default it is loaded after the sync so new scripts are picked up
    pub fn migrations(
        mut self,
        loader: impl Fn() -> Result<MigrationSet, MigrationError> + 'static,
    ) -> Self {
        self.migrations = Some(Box::new(loader));
        self
    }

    /// Do not consult the token environment variable
    pub fn ignore_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    pub fn build(self) -> Orchestrator {
        let app_dir = self.app_dir;
        let config = self.config;

        let env_token = if self.read_env {
            keystore::token_from_env(&config.credentials.env_var)
        } else {
            None
        };
        let migrations = self.migrations.unwrap_or_else(|| {
            let dir = app_dir.clone();
            let loader: MigrationLoader = Box::new(move || MigrationSet::load(&dir));
            loader
        });

        Orchestrator {
            manifest: self.manifest.unwrap_or_else(manifest::default_manifest),
            store: self
                .store
                .unwrap_or_else(|| keystore::open_store(&config, &app_dir)),
            fetcher: self
                .fetcher
                .unwrap_or_else(|| Box::new(GitHubFetcher::new(&config.remote))),
            prompt: self.prompt.unwrap_or_else(|| Box::new(ConsolePrompt)),
            probe: self
                .probe
                .unwrap_or_else(|| Box::new(PathProbe::new(&config.runtime.candidates))),
            installer: self.installer.unwrap_or_else(|| Box::new(PipInstaller)),
            migrations,
            env_token,
            app_dir,
            config,
        }
    }
}

/// Token in hand plus the bookkeeping needed to re-prompt
struct TokenSession {
    token: Token,
    source: TokenSource,
    prompts: u32,
    /// Persisting the token failed; reported once the sync has finished
    storage_error: Option<String>,
}

impl Orchestrator {
    pub fn builder(app_dir: &Path, config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder {
            app_dir: app_dir.to_path_buf(),
            config,
            manifest: None,
            store: None,
            fetcher: None,
            prompt: None,
            probe: None,
            installer: None,
            migrations: None,
            read_env: true,
        }
    }

    pub fn run(&self) -> UpdateReport {
        let mut report = UpdateReport::default();
        info!(app_dir = %self.app_dir.display(), repo = %self.config.remote.repo, "Starting update");
        if let Err(e) = self.execute(&mut report) {
            report.fail(e);
        }
        report
    }

    fn execute(&self, report: &mut UpdateReport) -> Result<(), UpdateError> {
        let _guard = OperationLock::new(&self.app_dir).acquire(LockType::Update)?;
        report.record(Stage::Lock, StageStatus::Ok, "update lock acquired");

        let runtime = self.probe.locate()?;
        report.record(Stage::Prerequisites, StageStatus::Ok, runtime.version.clone());
        report.runtime = Some(runtime.clone());

        let mut session = self.obtain_token()?;
        report.token_source = Some(session.source);
        report.record(Stage::Token, StageStatus::Ok, format!("token from {:?}", session.source));

        let check = version::check(
            self.fetcher.as_ref(),
            &session.token,
            &self.app_dir,
            &self.config.remote.version_file,
        );
        report.record(
            Stage::VersionCheck,
            StageStatus::Ok,
            format!(
                "installed {}, available {}",
                check.local.as_deref().unwrap_or("unknown"),
                check.remote.as_deref().unwrap_or("unknown")
            ),
        );
        report.version = Some(check);

        let sync = self.sync_with_reprompt(&mut session, report)?;
        let sync_failure = classify_sync(&sync);
        let warnings = sync.warnings().len();
        let written = sync.written();
        report.sync = Some(sync);
        if let Some(e) = sync_failure {
            return Err(e);
        }
        if let Some(reason) = session.storage_error.take() {
            return Err(UpdateError::CredentialStorage(reason));
        }
        let status = if warnings > 0 { StageStatus::Warning } else { StageStatus::Ok };
        report.record(
            Stage::Sync,
            status,
            format!("{} files updated, {} optional files skipped", written, warnings),
        );

        if self.config.runtime.skip_install {
            report.record(Stage::Dependencies, StageStatus::Skipped, "disabled in configuration");
        } else {
            self.installer
                .install(&runtime, &self.app_dir, &self.config.runtime.requirements)?;
            report.record(Stage::Dependencies, StageStatus::Ok, "requirements installed");
        }

        let db = Database::new(&self.config.database_path(&self.app_dir))
            .map_err(|e| UpdateError::from(MigrationError::from(e)))?;
        let runner = MigrationRunner::new((self.migrations)()?);
        let migrated = runner.run(&db)?;
        report.record(
            Stage::Migrations,
            StageStatus::Ok,
            if migrated.applied.is_empty() {
                "schema up to date".to_string()
            } else {
                format!("applied {}", migrated.applied.join(", "))
            },
        );
        report.migrations = Some(migrated);

        self.provision(&db, report)?;

        report.record(Stage::Summary, StageStatus::Ok, "update complete");
        Ok(())
    }

    /// env, then store, then the old token file, then the prompt
    fn obtain_token(&self) -> Result<TokenSession, UpdateError> {
        let session = |token, source| TokenSession {
            token,
            source,
            prompts: 0,
            storage_error: None,
        };

        if let Some(token) = self.env_token.clone() {
            info!(var = %self.config.credentials.env_var, "Using token from environment");
            return Ok(session(token, TokenSource::Environment));
        }

        match self.store.get_token() {
            Ok(Some(token)) if !token.is_blank() => {
                info!(store = %self.store.describe(), "Using stored token");
                return Ok(session(token, TokenSource::Store));
            }
            Ok(_) => {}
            Err(e) => warn!(store = %self.store.describe(), error = %e, "Could not read stored token"),
        }

        match keystore::read_legacy_token(&self.app_dir) {
            Ok(Some(token)) => {
                info!("Migrating token from legacy file");
                let mut s = session(token, TokenSource::LegacyFile);
                self.persist(&mut s);
                if s.storage_error.is_none() {
                    if let Err(e) = keystore::remove_legacy_token(&self.app_dir) {
                        warn!(error = %e, "Could not remove legacy token file");
                    }
                }
                return Ok(s);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read legacy token file"),
        }

        let mut s = session(Token::new(""), TokenSource::Prompt);
        self.prompt_verified(&mut s, PromptReason::Missing)?;
        Ok(s)
    }

    /// Prompt until a token verifies or the attempt budget runs out, then persist it
    fn prompt_verified(&self, session: &mut TokenSession, mut reason: PromptReason) -> Result<(), UpdateError> {
        let max = self.config.credentials.max_token_attempts;
        loop {
            if session.prompts >= max {
                return Err(UpdateError::AuthFailure(format!(
                    "no valid token after {} attempts",
                    session.prompts
                )));
            }
            session.prompts += 1;

            let Some(token) = self.prompt.ask(reason) else {
                return Err(UpdateError::AuthFailure("no token provided".to_string()));
            };

            match self.fetcher.verify(&token) {
                Ok(()) => {
                    info!("Token verified");
                    session.token = token;
                    session.source = TokenSource::Prompt;
                    self.persist(session);
                    return Ok(());
                }
                Err(FetchError::Network(reason)) => {
                    return Err(UpdateError::FetchFailure {
                        kind: FetchFailureKind::Network,
                        files: vec![format!("repos/{} ({})", self.config.remote.repo, reason)],
                    });
                }
                // 404 is what GitHub answers for a private repo the token cannot see
                Err(e) => {
                    warn!(error = %e, attempt = session.prompts, "Token rejected");
                    reason = PromptReason::Rejected;
                }
            }
        }
    }

    fn persist(&self, session: &mut TokenSession) {
        match self.store.put_token(&session.token) {
            Ok(()) => {
                info!(store = %self.store.describe(), "Token saved");
                session.storage_error = None;
            }
            Err(e) => {
                warn!(store = %self.store.describe(), error = %e, "Could not save token");
                session.storage_error = Some(e.to_string());
            }
        }
    }

    fn sync_with_reprompt(
        &self,
        session: &mut TokenSession,
        report: &mut UpdateReport,
    ) -> Result<SyncReport, UpdateError> {
        let sync = FileSync::new(self.fetcher.as_ref(), &self.app_dir);
        loop {
            let result = sync.sync(&self.manifest, &session.token);
            if !result.auth_failed() || session.prompts >= self.config.credentials.max_token_attempts {
                return Ok(result);
            }
            report.record(
                Stage::Token,
                StageStatus::Warning,
                format!("token from {:?} was rejected during sync", session.source),
            );
            if session.source == TokenSource::Store {
                let _ = self.store.clear_token();
            }
            self.prompt_verified(session, PromptReason::Rejected)?;
            report.token_source = Some(session.source);
        }
    }

    fn provision(&self, db: &Database, report: &mut UpdateReport) -> Result<(), UpdateError> {
        let provisioning = &self.config.provisioning;
        if provisioning.admins.is_empty() {
            report.record(Stage::Provisioning, StageStatus::Skipped, "no administrators configured");
            return Ok(());
        }

        let provisioner = AdminProvisioner::new(db).with_secret_length(provisioning.secret_length);
        let mut unchanged = 0;
        for entry in &provisioning.admins {
            let name = entry.name.as_deref();
            let outcome = match provisioning.mode {
                ProvisioningMode::CreateMissing => provisioner.create_missing(&entry.email, name),
                ProvisioningMode::Rotate => provisioner.ensure_admin(&entry.email, name).map(Some),
            }
            .map_err(|e| UpdateError::provisioning(&entry.email, e))?;

            match outcome {
                Some(admin) => report.admins.push(admin),
                None => unchanged += 1,
            }
        }

        report.record(
            Stage::Provisioning,
            StageStatus::Ok,
            format!("{} provisioned, {} unchanged", report.admins.len(), unchanged),
        );
        Ok(())
    }
}

/// Map the worst required-entry failure onto the error taxonomy
fn classify_sync(sync: &SyncReport) -> Option<UpdateError> {
    let failed = sync.failed_required();
    if failed.is_empty() {
        return None;
    }

    let files = failed.iter().map(|r| r.entry.remote.clone()).collect();
    let has = |pred: fn(&EntryOutcome) -> bool| failed.iter().any(|r| pred(&r.outcome));

    if has(|o| *o == EntryOutcome::Unauthorized) {
        return Some(UpdateError::AuthFailure(format!(
            "access denied for {}",
            failed
                .iter()
                .map(|r| r.entry.remote.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    let kind = if has(|o| matches!(o, EntryOutcome::Network { .. })) {
        FetchFailureKind::Network
    } else if has(|o| matches!(o, EntryOutcome::WriteFailed { .. })) {
        FetchFailureKind::Write
    } else {
        FetchFailureKind::NotFound
    };
    Some(UpdateError::FetchFailure { kind, files })
}
