//! Tracing subscriber setup for processes embedding the wallet engine.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::LogFormat;
use crate::error::WalletError;

/// Install the global subscriber. `RUST_LOG`, when set, overrides `level`.
///
/// Fails if a global subscriber is already installed.
pub fn init(level: &str, format: LogFormat) -> Result<(), WalletError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| WalletError::InvalidConfiguration(format!("log level {level:?}: {e}")))?;

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .try_init(),
    };
    result.map_err(|e| WalletError::InvalidConfiguration(format!("logging already initialized: {e}")))
}
