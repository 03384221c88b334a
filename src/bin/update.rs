//! FindBetter Update - double-click entry point
//!
//! Takes no arguments: updates the installation this executable lives in,
//! prints the one-time administrator credentials, and waits for Enter on
//! failure so the console window stays open.

use findbetter_lib::engine::{
    cli::{default_app_dir, formatter::CliFormatter},
    config::Config,
    error::UpdateError,
    orchestrator::Orchestrator,
};
use std::io::{BufRead, IsTerminal};
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> ExitCode {
    findbetter_lib::init_logging();

    let app_dir = default_app_dir();
    info!(app_dir = %app_dir.display(), version = env!("CARGO_PKG_VERSION"), "FindBetter updater starting");
    let config = match Config::load(&app_dir) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Could not load configuration");
            CliFormatter::failure(&UpdateError::from(e));
            pause();
            return ExitCode::FAILURE;
        }
    };

    let report = Orchestrator::builder(&app_dir, config).build().run();
    CliFormatter::update_report(&report);

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        if let Some(failure) = &report.failure {
            error!(stage = %failure.stage(), error = %failure, "Update failed");
        }
        pause();
        ExitCode::FAILURE
    }
}

fn pause() {
    if !std::io::stdin().is_terminal() {
        return;
    }
    println!("\nPress Enter to exit...");
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
}
