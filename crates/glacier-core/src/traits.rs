//! Trait interfaces between the wallet engine and its collaborators.
//!
//! - [`ChainBackend`]: the trusted chain-data source used for UTXO
//!   discovery, confirmation tracking, fee estimates and broadcast.
//!   Implemented by the bitcoind RPC client (glacier-wallet) and the
//!   Electrum client (glacier-electrum).

use crate::error::ChainError;
use crate::types::{RawTransactionInfo, ScannedOutput, Txid};

/// Synchronous chain-data source. Every call blocks for the round trip.
pub trait ChainBackend: Send + Sync {
    /// Unspent outputs currently paying `address`.
    fn scan_address(&self, address: &str) -> Result<Vec<ScannedOutput>, ChainError>;

    /// Outputs and confirmation depth of a transaction.
    fn raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo, ChainError>;

    /// Submit a fully signed, consensus-serialized transaction.
    fn broadcast(&self, raw_tx: &[u8]) -> Result<Txid, ChainError>;

    /// Height of the best block.
    fn block_count(&self) -> Result<u64, ChainError>;

    /// Fee rate in sat/vB expected to confirm within `target_blocks`.
    /// `None` when the source has no estimate.
    fn estimate_fee_rate(&self, target_blocks: u16) -> Result<Option<u64>, ChainError>;

    /// Human-readable endpoint, used in connectivity errors.
    fn endpoint(&self) -> String;

    /// Confirmation depth of a transaction. 0 while unconfirmed.
    ///
    /// Default implementation delegates to [`raw_transaction`](Self::raw_transaction).
    fn confirmations(&self, txid: &Txid) -> Result<u32, ChainError> {
        Ok(self.raw_transaction(txid)?.confirmations)
    }
}
