//! # glacier-wallet
//! HD wallet engine with a freezable UTXO store.
//!
//! [`WalletManager`] creates and restores BIP-39/BIP-32 wallets, keeps a
//! persistent UTXO set per wallet, and builds, signs and broadcasts
//! transactions through a [`ChainBackend`](glacier_core::ChainBackend).
//! Outputs can be pinned as FROZEN so that no spend, consolidation or
//! rescan ever touches them.
//!
//! # Modules
//!
//! - [`manager`]: [`WalletManager`], wallet lifecycle, refresh, send, freeze, consolidate
//! - [`builder`]: [`TransactionBuilder`], shape, sign and broadcast transactions
//! - [`utxo_store`]: [`UtxoStore`], UTXO state machine and scan reconciliation
//! - [`coin_selection`]: largest-first selection over spendable outputs
//! - [`fee`]: linear vsize and fee model
//! - [`store`]: [`WalletStore`] trait, atomic batches, in-memory store
//! - [`rocks`]: RocksDB-backed [`WalletStore`]
//! - [`encryption`]: AES-256-GCM seed encryption under a local key file
//! - [`mnemonic`]: BIP-39 phrase generation and parsing
//! - [`node_rpc`]: bitcoind JSON-RPC chain source
//! - [`config`]: [`WalletConfig`] loading and validation
//! - [`logging`]: tracing subscriber setup
//! - [`error`]: [`WalletError`] and [`ErrorKind`]

pub mod builder;
pub mod coin_selection;
pub mod config;
pub mod encryption;
pub mod error;
pub mod fee;
pub mod logging;
pub mod manager;
pub mod mnemonic;
pub mod node_rpc;
pub mod rocks;
pub mod store;
pub mod utxo_store;

#[cfg(test)]
mod testing;

pub use builder::{SignedTransaction, TransactionBuilder, UnlockedWallet, UnsignedTransaction};
pub use coin_selection::{CoinSelection, CoinSelector};
pub use config::{ChainSource, LogFormat, NodeRpcConfig, WalletConfig};
pub use encryption::{KeyStatus, SeedCipher};
pub use error::{ErrorKind, WalletError};
pub use fee::FeeModel;
pub use manager::{Balance, ConsolidationReceipt, FreezeReceipt, NewWallet, WalletManager};
pub use node_rpc::NodeRpcClient;
pub use rocks::RocksStore;
pub use store::{MemoryStore, StoreOp, WalletStore};
pub use utxo_store::{ScanReport, UtxoStore};
