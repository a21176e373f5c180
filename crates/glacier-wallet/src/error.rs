//! Wallet error types.

use glacier_core::error::{AddressError, ChainError, KeyError};
use thiserror::Error;

/// Coarse classification of a [`WalletError`] for upper layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Derivation,
    InvalidConfiguration,
    InsufficientFunds,
    Signing,
    Broadcast,
    NodeUnreachable,
    Encryption,
    StateViolation,
    NotFound,
    AlreadyExists,
    InvalidInput,
    Busy,
    Storage,
    Chain,
}

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Bad seed or derivation path.
    #[error(transparent)]
    Derivation(#[from] KeyError),

    /// Unsupported network/address-type combination or bad settings.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Spendable (non-frozen, mature, unlocked) total below the requirement.
    #[error("insufficient funds: spendable {available}, required {required} ({frozen} frozen)")]
    InsufficientFunds {
        /// Spendable total in satoshis.
        available: u64,
        /// Amount plus fee in satoshis.
        required: u64,
        /// Frozen total, reported separately so callers can tell the two apart.
        frozen: u64,
    },

    /// No derivation index reproduces an input's address.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The chain source rejected the transaction.
    #[error("broadcast failed: {0}")]
    Broadcast(String),

    /// The chain source could not be reached at all.
    #[error(
        "chain source unreachable at {endpoint}: check that bitcoind (or the Electrum server) \
         is running and that the configured rpc host, port and credentials are correct"
    )]
    NodeUnreachable { endpoint: String },

    /// Seed-encryption key missing, corrupt or replaced.
    #[error("encryption: {0}")]
    Encryption(String),

    /// Illegal UTXO state transition.
    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    #[error("wallet already exists: {0}")]
    WalletExists(String),

    /// The address is registered to another wallet.
    #[error("address {address} already belongs to wallet {owner}")]
    AddressInUse { address: String, owner: String },

    #[error("utxo not found: {0}")]
    UtxoNotFound(String),

    /// Consolidation needs at least two eligible outputs.
    #[error("consolidation needs at least 2 eligible UTXOs, found {eligible}")]
    ConsolidationTooSmall { eligible: usize },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid memo: {0}")]
    InvalidMemo(String),

    /// Invalid BIP-39 mnemonic phrase.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// Another balance refresh is running and did not yield in time.
    #[error("a rescan is already in progress")]
    RescanBusy,

    /// Persistence backend failure.
    #[error("storage: {0}")]
    Storage(String),

    #[error("serialization: {0}")]
    Serialization(String),

    /// Chain-source failure other than unreachability.
    #[error("chain source: {0}")]
    Chain(ChainError),
}

impl WalletError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WalletError::Derivation(_) => ErrorKind::Derivation,
            WalletError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            WalletError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            WalletError::Signing(_) => ErrorKind::Signing,
            WalletError::Broadcast(_) => ErrorKind::Broadcast,
            WalletError::NodeUnreachable { .. } => ErrorKind::NodeUnreachable,
            WalletError::Encryption(_) => ErrorKind::Encryption,
            WalletError::StateViolation(_) | WalletError::ConsolidationTooSmall { .. } => {
                ErrorKind::StateViolation
            }
            WalletError::WalletNotFound(_) | WalletError::UtxoNotFound(_) => ErrorKind::NotFound,
            WalletError::WalletExists(_) | WalletError::AddressInUse { .. } => ErrorKind::AlreadyExists,
            WalletError::InvalidAmount(_)
            | WalletError::InvalidAddress(_)
            | WalletError::InvalidMemo(_)
            | WalletError::InvalidMnemonic(_) => ErrorKind::InvalidInput,
            WalletError::RescanBusy => ErrorKind::Busy,
            WalletError::Storage(_) | WalletError::Serialization(_) => ErrorKind::Storage,
            WalletError::Chain(_) => ErrorKind::Chain,
        }
    }
}

impl From<ChainError> for WalletError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::ConnectionRefused { endpoint } => WalletError::NodeUnreachable { endpoint },
            other => WalletError::Chain(other),
        }
    }
}

impl From<AddressError> for WalletError {
    fn from(err: AddressError) -> Self {
        WalletError::InvalidAddress(err.to_string())
    }
}

impl From<rocksdb::Error> for WalletError {
    fn from(err: rocksdb::Error) -> Self {
        WalletError::Storage(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for WalletError {
    fn from(err: bincode::error::EncodeError) -> Self {
        WalletError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for WalletError {
    fn from(err: bincode::error::DecodeError) -> Self {
        WalletError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_insufficient_funds() {
        let e = WalletError::InsufficientFunds { available: 100, required: 200, frozen: 5_000 };
        assert_eq!(
            e.to_string(),
            "insufficient funds: spendable 100, required 200 (5000 frozen)"
        );
    }

    #[test]
    fn refused_connection_becomes_node_unreachable() {
        let err: WalletError = ChainError::ConnectionRefused { endpoint: "127.0.0.1:18443".into() }.into();
        assert_eq!(err.kind(), ErrorKind::NodeUnreachable);
        let text = err.to_string();
        assert!(text.contains("127.0.0.1:18443"));
        assert!(text.contains("credentials"));
    }

    #[test]
    fn other_chain_errors_stay_chain() {
        let err: WalletError = ChainError::Timeout("getblockcount".into()).into();
        assert_eq!(err, WalletError::Chain(ChainError::Timeout("getblockcount".into())));
        assert_eq!(err.kind(), ErrorKind::Chain);
    }

    #[test]
    fn consolidation_message_names_minimum() {
        let e = WalletError::ConsolidationTooSmall { eligible: 1 };
        assert!(e.to_string().contains("at least 2"));
        assert_eq!(e.kind(), ErrorKind::StateViolation);
    }

    #[test]
    fn from_key_error() {
        let err: WalletError = KeyError::InvalidPath("m/x".into()).into();
        assert_eq!(err.kind(), ErrorKind::Derivation);
    }

    #[test]
    fn from_address_error() {
        let err: WalletError = AddressError::InvalidChecksum.into();
        assert_eq!(err, WalletError::InvalidAddress("invalid checksum".into()));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
