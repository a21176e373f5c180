//! # glacier-electrum
//! Electrum protocol client.
//!
//! A synchronous, retrying client for Electrum-protocol indexing servers.
//! [`ChainDataClient`] implements [`glacier_core::ChainBackend`], so the
//! wallet engine can use a public server instead of a trusted node.
//!
//! # Modules
//!
//! - [`client`]: connection state machine, retries, liveness probe, queries
//! - [`protocol`]: newline-delimited JSON-RPC framing and script hashes
//! - [`transport`]: plain TCP or rustls TLS stream
//! - [`rate_limiter`]: per-second request ceiling
//! - [`config`]: [`ElectrumConfig`]
//! - [`error`]: [`ElectrumError`]

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod rate_limiter;
pub mod transport;

pub use client::{ChainDataClient, ConnectionState};
pub use config::ElectrumConfig;
pub use error::ElectrumError;
