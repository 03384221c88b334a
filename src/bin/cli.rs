//! FindBetter CLI - Main entry point for the maintenance binary
//!
//! This binary provides the `findbetter` tool for updating, migrating and
//! managing administrators and the GitHub access token.

use anyhow::{bail, Context, Result};
use clap::Parser;
use findbetter_lib::engine::{
    admins::{normalize_email, AdminProvisioner, ProvisionAction, ProvisionedAdmin},
    cli::{formatter::CliFormatter, AdminAction, Cli, Commands, MigrateAction, OutputFormat, TokenAction},
    config::Config,
    database::Database,
    github::{GitHubFetcher, RemoteFetcher},
    keystore::{self, Token},
    locks::{LockType, OperationLock},
    migrations::{MigrationError, MigrationRunner, MigrationSet},
    orchestrator::{ConsolePrompt, Orchestrator, PromptReason, TokenPrompt},
    runtime::{self, PathProbe, RuntimeProbe},
    version, UpdateError,
};
use std::path::Path;
use std::process::ExitCode;

fn main() -> ExitCode {
    findbetter_lib::init_logging();
    let cli = Cli::parse();

    match run_cli(cli) {
        Ok(code) => code,
        Err(e) => {
            CliFormatter::fatal(&e);
            ExitCode::FAILURE
        }
    }
}

/// Route a module error through the update taxonomy so it prints with its remediation hint
fn fatal(e: impl Into<UpdateError>) -> anyhow::Error {
    anyhow::Error::new(e.into())
}

fn run_cli(cli: Cli) -> Result<ExitCode> {
    let app_dir = cli.get_app_dir();
    let json = cli.format == OutputFormat::Json;
    let config = Config::load(&app_dir).map_err(fatal)?;

    match cli.command {
        Commands::Update => cmd_update(&app_dir, config, json),
        Commands::Migrate { action } => cmd_migrate(action, &app_dir, &config, json),
        Commands::Admin { action } => cmd_admin(action, &app_dir, &config, json),
        Commands::Token { action } => cmd_token(action, &app_dir, &config, json),
        Commands::Check => cmd_check(&app_dir, &config, json),
        Commands::Run => cmd_run(&app_dir, &config),
    }
}

fn cmd_update(app_dir: &Path, config: Config, json: bool) -> Result<ExitCode> {
    let report = Orchestrator::builder(app_dir, config).build().run();
    if json {
        println!("{}", serde_json::to_string_pretty(&CliFormatter::update_report_json(&report))?);
    } else {
        CliFormatter::update_report(&report);
    }
    Ok(if report.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn open_database(app_dir: &Path, config: &Config) -> Result<Database> {
    let path = config.database_path(app_dir);
    Database::new(&path).map_err(|e| fatal(MigrationError::from(e)))
}

fn cmd_migrate(action: MigrateAction, app_dir: &Path, config: &Config, json: bool) -> Result<ExitCode> {
    let db = open_database(app_dir, config)?;
    let runner = MigrationRunner::new(MigrationSet::load(app_dir).map_err(fatal)?);

    match action {
        MigrateAction::Run => {
            let _guard = OperationLock::new(app_dir).acquire(LockType::Migration).map_err(fatal)?;
            let report = runner.run(&db).map_err(fatal)?;
            if json {
                println!("{}", serde_json::json!({
                    "success": true,
                    "applied": report.applied,
                    "already_applied": report.already_applied,
                }));
            } else if report.applied.is_empty() {
                CliFormatter::success("No pending migrations");
            } else {
                CliFormatter::success(&format!("Applied {} migration(s):", report.applied.len()));
                for version in &report.applied {
                    CliFormatter::item(version);
                }
            }
        }
        MigrateAction::Status => {
            let status = runner.status(&db).map_err(fatal)?;
            if json {
                println!("{}", serde_json::json!({
                    "applied": status.applied,
                    "pending": status.pending,
                }));
            } else {
                CliFormatter::header("Migration Status");
                CliFormatter::kv("Applied", &status.applied.len().to_string());
                CliFormatter::kv("Pending", &status.pending.len().to_string());
                for record in &status.applied {
                    CliFormatter::item(&format!(
                        "{} {} ({})",
                        record.version,
                        record.description,
                        record.applied_at.format("%Y-%m-%d %H:%M")
                    ));
                }
                for (i, version) in status.pending.iter().enumerate() {
                    CliFormatter::numbered_item(i + 1, &format!("{} (pending)", version));
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn cmd_admin(action: AdminAction, app_dir: &Path, config: &Config, json: bool) -> Result<ExitCode> {
    let _guard = OperationLock::new(app_dir).acquire(LockType::Provision).map_err(fatal)?;
    let db = open_database(app_dir, config)?;

    let status = MigrationRunner::new(MigrationSet::load(app_dir).map_err(fatal)?)
        .status(&db)
        .map_err(fatal)?;
    if !status.is_up_to_date() {
        bail!(
            "{} migration(s) pending; run `findbetter migrate run` first",
            status.pending.len()
        );
    }

    let provisioner = AdminProvisioner::new(&db).with_secret_length(config.provisioning.secret_length);
    let email = match &action {
        AdminAction::Create { email, .. } | AdminAction::Ensure { email, .. } | AdminAction::Reset { email } => {
            email.clone()
        }
    };
    let provisioned = match action {
        AdminAction::Create { email, name } => provisioner.create(&email, name.as_deref()),
        AdminAction::Ensure { email, name } => provisioner.ensure_admin(&email, name.as_deref()),
        AdminAction::Reset { email } => provisioner.reset(&email).and_then(|secret| {
            Ok(ProvisionedAdmin {
                email: normalize_email(&email)?,
                name: provisioner.get(&email)?.and_then(|a| a.name),
                action: ProvisionAction::Reset,
                secret,
            })
        }),
    };
    let admin = provisioned.map_err(|e| fatal(UpdateError::provisioning(&email, e)))?;

    if json {
        println!("{}", serde_json::json!({
            "email": admin.email,
            "name": admin.name,
            "action": admin.action,
            "temporary_password": admin.secret.expose(),
        }));
    } else {
        CliFormatter::secret_banner(std::slice::from_ref(&admin));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_token(action: TokenAction, app_dir: &Path, config: &Config, json: bool) -> Result<ExitCode> {
    let store = keystore::open_store(config, app_dir);

    match action {
        TokenAction::Set { token } => {
            let token = match token {
                Some(value) => Token::new(&value),
                None => ConsolePrompt
                    .ask(PromptReason::Missing)
                    .context("no token entered")?,
            };
            GitHubFetcher::new(&config.remote).verify(&token).map_err(fatal)?;
            store.put_token(&token).map_err(fatal)?;
            keystore::remove_legacy_token(app_dir).map_err(fatal)?;
            if json {
                println!("{}", serde_json::json!({ "stored": true, "store": store.describe() }));
            } else {
                CliFormatter::success(&format!("Token verified and saved to {}", store.describe()));
            }
        }
        TokenAction::Clear => {
            store.clear_token().map_err(fatal)?;
            keystore::remove_legacy_token(app_dir).map_err(fatal)?;
            if json {
                println!("{}", serde_json::json!({ "cleared": true }));
            } else {
                CliFormatter::success("Stored token removed");
            }
        }
        TokenAction::Status => {
            let env = keystore::token_from_env(&config.credentials.env_var).is_some();
            let stored = store.get_token().map_err(fatal)?;
            let legacy = keystore::read_legacy_token(app_dir).map_err(fatal)?.is_some();
            if json {
                println!("{}", serde_json::json!({
                    "environment": env,
                    "store": store.describe(),
                    "stored": stored.is_some(),
                    "stored_at": stored.as_ref().map(|t| t.acquired_at),
                    "legacy_file": legacy,
                }));
            } else {
                CliFormatter::header("Access Token");
                CliFormatter::kv(&config.credentials.env_var, if env { "set" } else { "not set" });
                CliFormatter::kv(
                    "Store",
                    &match &stored {
                        Some(t) => format!("{} (saved {})", store.describe(), t.acquired_at.format("%Y-%m-%d")),
                        None => format!("{} (empty)", store.describe()),
                    },
                );
                if legacy {
                    CliFormatter::warning("A plaintext .github_token file is present; the next update moves it into the store");
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_check(app_dir: &Path, config: &Config, json: bool) -> Result<ExitCode> {
    let token = match keystore::token_from_env(&config.credentials.env_var) {
        Some(token) => token,
        None => keystore::open_store(config, app_dir)
            .get_token()
            .map_err(fatal)?
            .context("no access token; run `findbetter token set` first")?,
    };

    let fetcher = GitHubFetcher::new(&config.remote);
    let check = version::check(&fetcher, &token, app_dir, &config.remote.version_file);

    if json {
        println!("{}", serde_json::json!({
            "local": check.local,
            "remote": check.remote,
            "update_available": check.update_available(),
        }));
    } else {
        CliFormatter::header("Version");
        CliFormatter::kv("Installed", check.local.as_deref().unwrap_or("unknown"));
        CliFormatter::kv("Available", check.remote.as_deref().unwrap_or("unknown"));
        if check.update_available() {
            CliFormatter::info("An update is available. Run `findbetter update`.");
        } else if check.remote.is_some() {
            CliFormatter::success("Up to date");
        } else {
            CliFormatter::warning("Could not read the remote version");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_run(app_dir: &Path, config: &Config) -> Result<ExitCode> {
    let runtime_info = PathProbe::new(&config.runtime.candidates).locate().map_err(fatal)?;
    let status = runtime::launch(&runtime_info, app_dir, &config.runtime.launch_args)?;
    Ok(match status.code() {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(code.clamp(1, 255) as u8),
        None => ExitCode::FAILURE,
    })
}
