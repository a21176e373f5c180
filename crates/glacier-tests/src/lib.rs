//! Integration scenarios for Glacier.
//!
//! The tests under `tests/` drive a real [`glacier_wallet::WalletManager`]
//! over a RocksDB store against [`helpers::RegtestChain`], an in-process
//! chain that validates broadcasts against its own UTXO set and confirms
//! them when blocks are mined.

pub mod helpers;
