//! CLI Output Formatting Module
//! Provides consistent, colorized output for terminal UX

use colored::Colorize;

use crate::engine::admins::{ProvisionAction, ProvisionedAdmin};
use crate::engine::error::UpdateError;
use crate::engine::orchestrator::{StageStatus, UpdateReport};
use crate::engine::sync::EntryOutcome;

pub struct CliFormatter;

impl CliFormatter {
    /// Print a success message
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Print an error message
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    /// Print a warning message
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    /// Print an info message
    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print a list item
    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }

    /// Print a numbered item
    pub fn numbered_item(num: usize, text: &str) {
        println!("  {}. {}", num.to_string().bright_white().bold(), text);
    }

    /// Print a divider
    pub fn divider() {
        println!("{}", "─".repeat(60).bright_black());
    }

    /// Print an empty line
    pub fn blank() {
        println!();
    }

    /// Print a fatal error with its remediation hint
    pub fn failure(error: &UpdateError) {
        Self::error(&format!("{} failed: {}", error.stage(), error));
        eprintln!("  {} {}", "→".bright_yellow(), error.remediation());
    }

    /// Fatal error from a CLI command
    pub fn fatal(error: &anyhow::Error) {
        match error.downcast_ref::<UpdateError>() {
            Some(e) => Self::failure(e),
            None => Self::error(&format!("{:#}", error)),
        }
    }

    pub fn remediation_for(error: &anyhow::Error) -> Option<&'static str> {
        error.downcast_ref::<UpdateError>().map(UpdateError::remediation)
    }

    /// One-time credentials, shown once and never logged
    pub fn secret_banner(admins: &[ProvisionedAdmin]) {
        if admins.is_empty() {
            return;
        }
        println!();
        Self::divider();
        println!("{}", "  ADMINISTRATOR CREDENTIALS (shown once)".bright_yellow().bold());
        Self::divider();
        for admin in admins {
            let action = match admin.action {
                ProvisionAction::Created => "created",
                ProvisionAction::Reset => "reset",
            };
            Self::kv("Email", &admin.email);
            if let Some(name) = &admin.name {
                Self::kv("Name", name);
            }
            Self::kv("Account", action);
            Self::kv("Temporary password", &admin.secret.expose().bright_green().bold().to_string());
            Self::blank();
        }
        println!("  Store these now. The password must be changed at first login.");
        Self::divider();
    }

    /// Human-readable rendering of a pipeline run
    pub fn update_report(report: &UpdateReport) {
        Self::header("FindBetter Update");

        for record in &report.stages {
            let line = format!("{}: {}", record.stage, record.detail);
            match record.status {
                StageStatus::Ok => Self::success(&line),
                StageStatus::Warning => Self::warning(&line),
                StageStatus::Skipped => Self::info(&line),
                StageStatus::Failed => Self::error(&line),
            }
        }

        if let Some(version) = &report.version {
            if version.update_available() {
                Self::info(&format!(
                    "New version {} replaces {}",
                    version.remote.as_deref().unwrap_or("?"),
                    version.local.as_deref().unwrap_or("(not installed)")
                ));
            }
        }

        if let Some(sync) = &report.sync {
            let skipped = sync.warnings();
            if !skipped.is_empty() {
                Self::header("Optional files not updated");
                for entry in skipped {
                    Self::item(&format!("{} ({})", entry.entry.remote, entry.outcome));
                }
            }
            let total: usize = sync
                .entries
                .iter()
                .filter_map(|r| match r.outcome {
                    EntryOutcome::Written { bytes } => Some(bytes),
                    _ => None,
                })
                .sum();
            Self::kv("Downloaded", &format_size(total as u64));
        }

        Self::secret_banner(&report.admins);

        match &report.failure {
            None => {
                Self::blank();
                Self::success("Update complete");
            }
            Some(error) => {
                Self::blank();
                Self::failure(error);
            }
        }
    }

    /// Machine-readable rendering; secrets are included because this is their only delivery
    pub fn update_report_json(report: &UpdateReport) -> serde_json::Value {
        serde_json::json!({
            "success": report.is_success(),
            "stages": report.stages,
            "token_source": report.token_source,
            "version": report.version,
            "sync": report.sync,
            "migrations": report.migrations.as_ref().map(|m| serde_json::json!({
                "applied": m.applied,
                "already_applied": m.already_applied,
            })),
            "admins": report.admins.iter().map(|a| serde_json::json!({
                "email": a.email,
                "name": a.name,
                "action": a.action,
                "temporary_password": a.secret.expose(),
            })).collect::<Vec<_>>(),
            "failure": report.failure.as_ref().map(|e| serde_json::json!({
                "stage": e.stage(),
                "message": e.to_string(),
                "remediation": e.remediation(),
            })),
        })
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}
