//! Wallet engine configuration.
//!
//! [`WalletConfig::load`] layers, lowest precedence first: built-in
//! defaults, an optional TOML file, then `GLACIER__*` environment variables
//! with `__` separating nested keys (`GLACIER__NODE__RPC_PORT=18443`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use glacier_core::types::Network;
use glacier_electrum::ElectrumConfig;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

/// Which collaborator answers chain queries and broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSource {
    /// Trusted bitcoind over JSON-RPC.
    Node,
    /// Public Electrum server.
    Electrum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// bitcoind JSON-RPC settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRpcConfig {
    pub rpc_host: String,
    pub rpc_port: u16,
    pub rpc_user: String,
    pub rpc_password: String,
    pub timeout_secs: u64,
}

impl Default for NodeRpcConfig {
    fn default() -> Self {
        Self {
            rpc_host: "localhost".to_string(),
            rpc_port: 18443,
            rpc_user: "user".to_string(),
            rpc_password: "password".to_string(),
            timeout_secs: 30,
        }
    }
}

impl NodeRpcConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.rpc_host, self.rpc_port)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration for a [`WalletManager`](crate::WalletManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Root directory for the database and the seed key file.
    pub data_dir: PathBuf,
    /// Network of the configured chain source. Wallets on other networks
    /// are rejected.
    pub network: Network,
    pub chain_source: ChainSource,
    pub node: NodeRpcConfig,
    pub electrum: ElectrumConfig,
    /// Fee rate in sat/vB when neither the caller nor the chain source
    /// supplies one.
    pub default_fee_rate: u64,
    /// Confirmation target for fee estimates.
    pub fee_target_blocks: u16,
    pub confirmation_poll_secs: u64,
    /// Ceiling on waiting for a freeze transaction to confirm.
    pub confirmation_timeout_secs: u64,
    pub consolidation_batch_size: usize,
    /// How long a second rescan waits for the running one to yield.
    pub rescan_wait_secs: u64,
    /// Log level filter string (e.g. "info", "glacier_wallet=debug").
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for WalletConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("glacier");

        Self {
            data_dir,
            network: Network::Regtest,
            chain_source: ChainSource::Node,
            node: NodeRpcConfig::default(),
            electrum: ElectrumConfig::default(),
            default_fee_rate: 10,
            fee_target_blocks: 6,
            confirmation_poll_secs: 10,
            confirmation_timeout_secs: 600,
            consolidation_batch_size: 50,
            rescan_wait_secs: 5,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl WalletConfig {
    /// Load defaults, then `file` if given, then `GLACIER__*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self, WalletError> {
        let defaults = Config::try_from(&Self::default()).map_err(config_error)?;
        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(Environment::with_prefix("GLACIER").separator("__").try_parsing(true));

        let config: Self = builder.build().map_err(config_error)?.try_deserialize().map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        if self.default_fee_rate == 0 {
            return Err(WalletError::InvalidConfiguration("default_fee_rate must be at least 1 sat/vB".into()));
        }
        if self.consolidation_batch_size < 2 {
            return Err(WalletError::InvalidConfiguration("consolidation_batch_size must be at least 2".into()));
        }
        if self.electrum.protocol_versions.is_empty() {
            return Err(WalletError::InvalidConfiguration("electrum.protocol_versions is empty".into()));
        }
        Ok(())
    }

    /// Path to the RocksDB wallet database directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("wallets")
    }

    /// Path to the seed encryption key file.
    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("seed.key")
    }

    pub fn confirmation_poll(&self) -> Duration {
        Duration::from_secs(self.confirmation_poll_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn rescan_wait(&self) -> Duration {
        Duration::from_secs(self.rescan_wait_secs)
    }
}

fn config_error(err: config::ConfigError) -> WalletError {
    WalletError::InvalidConfiguration(err.to_string())
}
