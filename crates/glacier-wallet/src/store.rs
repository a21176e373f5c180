//! Persistence backend interface and the in-memory backend.
//!
//! Every logical wallet operation is expressed as one `Vec<StoreOp>` and
//! applied by a single [`WalletStore::commit`]: either every op lands or
//! none does. Reads never observe a half-applied commit.

use std::collections::BTreeMap;

use glacier_core::types::{AddressRecord, OutPoint, TransactionRecord, Txid, Utxo, UtxoTransition, WalletRecord};
use parking_lot::RwLock;

use crate::error::WalletError;

/// One write within an atomic commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOp {
    PutWallet(WalletRecord),
    DeleteWallet(String),
    PutAddress(AddressRecord),
    DeleteAddress(String),
    PutUtxo(Utxo),
    DeleteUtxo(OutPoint),
    PutTransaction(TransactionRecord),
    DeleteTransaction { wallet: String, txid: Txid },
    AppendHistory(UtxoTransition),
    /// Drop every history entry of an outpoint.
    DeleteHistory(OutPoint),
}

/// Storage backend for wallet records, addresses, UTXOs and transactions.
///
/// UTXOs are keyed by outpoint, addresses by their encoded string, wallets
/// by name and transactions by (wallet, txid).
pub trait WalletStore: Send + Sync {
    fn get_wallet(&self, name: &str) -> Result<Option<WalletRecord>, WalletError>;

    /// All wallets, ordered by name.
    fn list_wallets(&self) -> Result<Vec<WalletRecord>, WalletError>;

    fn get_address(&self, address: &str) -> Result<Option<AddressRecord>, WalletError>;

    /// Addresses of `wallet`, ordered by derivation index.
    fn addresses_for_wallet(&self, wallet: &str) -> Result<Vec<AddressRecord>, WalletError>;

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, WalletError>;

    /// Every tracked UTXO of `wallet` in any state, ordered by outpoint.
    fn utxos_for_wallet(&self, wallet: &str) -> Result<Vec<Utxo>, WalletError>;

    /// Transactions of `wallet`, oldest first.
    fn transactions_for_wallet(&self, wallet: &str) -> Result<Vec<TransactionRecord>, WalletError>;

    /// State history of one outpoint, oldest first.
    fn utxo_history(&self, outpoint: &OutPoint) -> Result<Vec<UtxoTransition>, WalletError>;

    /// Apply `ops` atomically, in order.
    fn commit(&self, ops: Vec<StoreOp>) -> Result<(), WalletError>;
}

#[derive(Default)]
struct Tables {
    wallets: BTreeMap<String, WalletRecord>,
    addresses: BTreeMap<String, AddressRecord>,
    utxos: BTreeMap<OutPoint, Utxo>,
    transactions: BTreeMap<(String, Txid), TransactionRecord>,
    history: BTreeMap<OutPoint, Vec<UtxoTransition>>,
}

/// In-memory [`WalletStore`] for tests and ephemeral use.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalletStore for MemoryStore {
    fn get_wallet(&self, name: &str) -> Result<Option<WalletRecord>, WalletError> {
        Ok(self.tables.read().wallets.get(name).cloned())
    }

    fn list_wallets(&self) -> Result<Vec<WalletRecord>, WalletError> {
        Ok(self.tables.read().wallets.values().cloned().collect())
    }

    fn get_address(&self, address: &str) -> Result<Option<AddressRecord>, WalletError> {
        Ok(self.tables.read().addresses.get(address).cloned())
    }

    fn addresses_for_wallet(&self, wallet: &str) -> Result<Vec<AddressRecord>, WalletError> {
        let mut out: Vec<AddressRecord> = self
            .tables
            .read()
            .addresses
            .values()
            .filter(|a| a.wallet == wallet)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.index);
        Ok(out)
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, WalletError> {
        Ok(self.tables.read().utxos.get(outpoint).cloned())
    }

    fn utxos_for_wallet(&self, wallet: &str) -> Result<Vec<Utxo>, WalletError> {
        Ok(self.tables.read().utxos.values().filter(|u| u.wallet == wallet).cloned().collect())
    }

    fn transactions_for_wallet(&self, wallet: &str) -> Result<Vec<TransactionRecord>, WalletError> {
        let mut out: Vec<TransactionRecord> = self
            .tables
            .read()
            .transactions
            .values()
            .filter(|t| t.wallet == wallet)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.timestamp);
        Ok(out)
    }

    fn utxo_history(&self, outpoint: &OutPoint) -> Result<Vec<UtxoTransition>, WalletError> {
        Ok(self.tables.read().history.get(outpoint).cloned().unwrap_or_default())
    }

    fn commit(&self, ops: Vec<StoreOp>) -> Result<(), WalletError> {
        let mut t = self.tables.write();
        for op in ops {
            match op {
                StoreOp::PutWallet(w) => {
                    t.wallets.insert(w.name.clone(), w);
                }
                StoreOp::DeleteWallet(name) => {
                    t.wallets.remove(&name);
                }
                StoreOp::PutAddress(a) => {
                    t.addresses.insert(a.address.clone(), a);
                }
                StoreOp::DeleteAddress(address) => {
                    t.addresses.remove(&address);
                }
                StoreOp::PutUtxo(u) => {
                    t.utxos.insert(u.outpoint, u);
                }
                StoreOp::DeleteUtxo(outpoint) => {
                    t.utxos.remove(&outpoint);
                }
                StoreOp::PutTransaction(tx) => {
                    t.transactions.insert((tx.wallet.clone(), tx.txid), tx);
                }
                StoreOp::DeleteTransaction { wallet, txid } => {
                    t.transactions.remove(&(wallet, txid));
                }
                StoreOp::AppendHistory(h) => {
                    t.history.entry(h.outpoint).or_default().push(h);
                }
                StoreOp::DeleteHistory(outpoint) => {
                    t.history.remove(&outpoint);
                }
            }
        }
        Ok(())
    }
}
