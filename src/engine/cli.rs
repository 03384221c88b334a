//! FindBetter CLI Module
//! Command-line interface for update and maintenance operations

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod formatter;

#[derive(Parser, Debug)]
#[command(name = "findbetter")]
#[command(version)]
#[command(about = "Update and maintenance tool for the FindBetter application", long_about = None)]
pub struct Cli {
    /// Application directory (defaults to the directory of this executable)
    #[arg(short, long, global = true)]
    pub app_dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download the latest files, install dependencies, migrate and provision
    Update,

    /// Database migration commands
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Administrator account management
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },

    /// GitHub access token management
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Compare the installed version with the remote one
    Check,

    /// Launch the application with the detected runtime
    Run,
}

#[derive(Subcommand, Debug)]
pub enum MigrateAction {
    /// Apply pending migrations
    Run,

    /// Show applied and pending migrations
    Status,
}

#[derive(Subcommand, Debug)]
pub enum AdminAction {
    /// Create a new administrator
    Create {
        email: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Issue a new temporary password for an existing account
    Reset { email: String },

    /// Create the administrator, or reset it if it already exists
    Ensure {
        email: String,

        #[arg(short, long)]
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum TokenAction {
    /// Verify and store a token (prompts when omitted)
    Set { token: Option<String> },

    /// Remove the stored token
    Clear,

    /// Show where the token comes from
    Status,
}

impl Cli {
    pub fn get_app_dir(&self) -> PathBuf {
        self.app_dir.clone().unwrap_or_else(default_app_dir)
    }
}

/// Directory holding the running executable, falling back to the working directory
pub fn default_app_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}
