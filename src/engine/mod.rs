// FindBetter updater engine - core module structure
pub mod admins;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod github;
pub mod keystore;
pub mod locks;
pub mod manifest;
pub mod migrations;
pub mod orchestrator;
pub mod runtime;
pub mod sync;
pub mod version;

pub use config::Config;
pub use database::Database;
pub use error::UpdateError;
pub use orchestrator::{Orchestrator, UpdateReport};
