//! # glacier-core
//! Address codec, key derivation and shared types.
//!
//! The leaf crate of the Glacier workspace. Everything here is pure: no
//! storage, no network, no global state.
//!
//! # Modules
//!
//! - [`bech32`]: bit-level bech32 / bech32m codec (BIP-173, BIP-350)
//! - [`address`]: [`AddressCodec`], encode public keys, classify address strings
//! - [`keys`]: [`KeyDerivationEngine`], BIP-32 path derivation per network and address type
//! - [`types`]: wallet, UTXO and transaction records shared by all crates
//! - [`traits`]: [`ChainBackend`], the trusted chain-data collaborator
//! - [`constants`]: fee model, dust and maturity constants
//! - [`error`]: error enums for the above

pub mod address;
pub mod bech32;
pub mod constants;
pub mod error;
pub mod keys;
pub mod traits;
pub mod types;

pub use address::AddressCodec;
pub use error::{AddressError, ChainError, KeyError};
pub use keys::{DerivedKey, KeyDerivationEngine, Seed};
pub use traits::ChainBackend;
pub use types::{AddressType, Network, OutPoint, Txid, Utxo, UtxoState};
