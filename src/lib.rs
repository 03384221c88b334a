//! FindBetter updater - keeps a local FindBetter installation in step with
//! its GitHub repository, migrates the database and provisions administrators.

pub mod engine;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// The library and both binaries log at info unless `RUST_LOG` says otherwise
pub const DEFAULT_LOG_FILTER: &str = "findbetter_lib=info,findbetter=info,findbetter_update=info";

/// Install the stderr subscriber. `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
