//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when it is set.

use crate::config::ApplicationConfig;
use crate::error::{RigError, RigResult};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber for a rig process.
///
/// Fails if the level does not parse or a subscriber is already installed.
pub fn init(config: &ApplicationConfig) -> RigResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            RigError::Configuration(format!("invalid log level '{}': {e}", config.log_level))
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);
    let installed = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| RigError::Configuration(format!("cannot install logger: {e}")))
}
