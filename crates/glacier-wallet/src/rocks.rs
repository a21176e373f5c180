//! RocksDB-backed wallet storage.
//!
//! Implements [`WalletStore`] using one column family per table. Every
//! commit is a single [`WriteBatch`].

use std::path::Path;

use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};

use glacier_core::types::{AddressRecord, OutPoint, TransactionRecord, Utxo, UtxoTransition, WalletRecord};

use crate::error::WalletError;
use crate::store::{StoreOp, WalletStore};

// --- Column family names ---

const CF_WALLETS: &str = "wallets";
const CF_ADDRESSES: &str = "addresses";
const CF_UTXOS: &str = "utxos";
const CF_TRANSACTIONS: &str = "transactions";
const CF_UTXO_HISTORY: &str = "utxo_history";
const CF_META: &str = "meta";

const ALL_CFS: &[&str] = &[CF_WALLETS, CF_ADDRESSES, CF_UTXOS, CF_TRANSACTIONS, CF_UTXO_HISTORY, CF_META];

// --- Metadata keys ---

const META_HISTORY_SEQ: &[u8] = b"history_seq";

/// RocksDB-backed [`WalletStore`].
pub struct RocksStore {
    db: DB,
    /// Serializes commits so the history sequence is read-modify-written once.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a database at `path`, creating missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)?;
        tracing::debug!(path = %path.as_ref().display(), "opened wallet database");
        Ok(Self { db, write_lock: Mutex::new(()) })
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), WalletError> {
        Ok(self.db.flush()?)
    }

    // --- Internal helpers ---

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily, WalletError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| WalletError::Storage(format!("missing column family: {name}")))
    }

    fn get_value<T: bincode::Decode<()>>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, WalletError> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decode every value of `cf` whose key starts with `prefix`.
    fn scan_prefix<T: bincode::Decode<()>>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>, WalletError> {
        let cf = self.cf_handle(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    fn history_keys(&self, outpoint: &OutPoint) -> Result<Vec<Box<[u8]>>, WalletError> {
        let cf = self.cf_handle(CF_UTXO_HISTORY)?;
        let prefix = outpoint_key(outpoint);
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn history_seq(&self) -> Result<u64, WalletError> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, META_HISTORY_SEQ)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| WalletError::Storage("invalid history sequence length".into()))?;
                Ok(u64::from_le_bytes(arr))
            }
            None => Ok(0),
        }
    }
}

impl WalletStore for RocksStore {
    fn get_wallet(&self, name: &str) -> Result<Option<WalletRecord>, WalletError> {
        self.get_value(CF_WALLETS, name.as_bytes())
    }

    fn list_wallets(&self) -> Result<Vec<WalletRecord>, WalletError> {
        self.scan_prefix(CF_WALLETS, &[])
    }

    fn get_address(&self, address: &str) -> Result<Option<AddressRecord>, WalletError> {
        self.get_value(CF_ADDRESSES, address.as_bytes())
    }

    fn addresses_for_wallet(&self, wallet: &str) -> Result<Vec<AddressRecord>, WalletError> {
        let mut out: Vec<AddressRecord> = self
            .scan_prefix::<AddressRecord>(CF_ADDRESSES, &[])?
            .into_iter()
            .filter(|a| a.wallet == wallet)
            .collect();
        out.sort_by_key(|a| a.index);
        Ok(out)
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, WalletError> {
        self.get_value(CF_UTXOS, &outpoint_key(outpoint))
    }

    fn utxos_for_wallet(&self, wallet: &str) -> Result<Vec<Utxo>, WalletError> {
        Ok(self
            .scan_prefix::<Utxo>(CF_UTXOS, &[])?
            .into_iter()
            .filter(|u| u.wallet == wallet)
            .collect())
    }

    fn transactions_for_wallet(&self, wallet: &str) -> Result<Vec<TransactionRecord>, WalletError> {
        let mut out: Vec<TransactionRecord> = self.scan_prefix(CF_TRANSACTIONS, &wallet_prefix(wallet))?;
        out.sort_by_key(|t| t.timestamp);
        Ok(out)
    }

    fn utxo_history(&self, outpoint: &OutPoint) -> Result<Vec<UtxoTransition>, WalletError> {
        self.scan_prefix(CF_UTXO_HISTORY, &outpoint_key(outpoint))
    }

    fn commit(&self, ops: Vec<StoreOp>) -> Result<(), WalletError> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut seq = self.history_seq()?;
        let mut seq_dirty = false;

        for op in ops {
            match op {
                StoreOp::PutWallet(w) => {
                    batch.put_cf(self.cf_handle(CF_WALLETS)?, w.name.as_bytes(), encode(&w)?);
                }
                StoreOp::DeleteWallet(name) => {
                    batch.delete_cf(self.cf_handle(CF_WALLETS)?, name.as_bytes());
                }
                StoreOp::PutAddress(a) => {
                    batch.put_cf(self.cf_handle(CF_ADDRESSES)?, a.address.as_bytes(), encode(&a)?);
                }
                StoreOp::DeleteAddress(address) => {
                    batch.delete_cf(self.cf_handle(CF_ADDRESSES)?, address.as_bytes());
                }
                StoreOp::PutUtxo(u) => {
                    batch.put_cf(self.cf_handle(CF_UTXOS)?, outpoint_key(&u.outpoint), encode(&u)?);
                }
                StoreOp::DeleteUtxo(outpoint) => {
                    batch.delete_cf(self.cf_handle(CF_UTXOS)?, outpoint_key(&outpoint));
                }
                StoreOp::PutTransaction(tx) => {
                    let key = transaction_key(&tx.wallet, tx.txid.as_bytes());
                    batch.put_cf(self.cf_handle(CF_TRANSACTIONS)?, key, encode(&tx)?);
                }
                StoreOp::DeleteTransaction { wallet, txid } => {
                    batch.delete_cf(self.cf_handle(CF_TRANSACTIONS)?, transaction_key(&wallet, txid.as_bytes()));
                }
                StoreOp::AppendHistory(h) => {
                    seq += 1;
                    seq_dirty = true;
                    let mut key = outpoint_key(&h.outpoint);
                    key.extend_from_slice(&seq.to_be_bytes());
                    batch.put_cf(self.cf_handle(CF_UTXO_HISTORY)?, key, encode(&h)?);
                }
                StoreOp::DeleteHistory(outpoint) => {
                    let cf = self.cf_handle(CF_UTXO_HISTORY)?;
                    for key in self.history_keys(&outpoint)? {
                        batch.delete_cf(cf, key);
                    }
                }
            }
        }
        if seq_dirty {
            batch.put_cf(self.cf_handle(CF_META)?, META_HISTORY_SEQ, seq.to_le_bytes());
        }

        self.db.write(batch)?;
        Ok(())
    }
}

/// `txid (32) || vout (4, big-endian)`, so one transaction's outputs sort together.
fn outpoint_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(36 + 8);
    key.extend_from_slice(outpoint.txid.as_bytes());
    key.extend_from_slice(&outpoint.vout.to_be_bytes());
    key
}

fn wallet_prefix(wallet: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(wallet.len() + 1);
    key.extend_from_slice(wallet.as_bytes());
    key.push(0);
    key
}

fn transaction_key(wallet: &str, txid: &[u8; 32]) -> Vec<u8> {
    let mut key = wallet_prefix(wallet);
    key.extend_from_slice(txid);
    key
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, WalletError> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, WalletError> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{exercise_addresses, exercise_backend, exercise_history, utxo};

    fn temp_store() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("db")).unwrap();
        (dir, store)
    }

    #[test]
    fn rocks_backend() {
        let (_dir, store) = temp_store();
        exercise_backend(&store);
    }

    #[test]
    fn rocks_history() {
        let (_dir, store) = temp_store();
        exercise_history(&store);
    }

    #[test]
    fn rocks_addresses() {
        let (_dir, store) = temp_store();
        exercise_addresses(&store);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let u = utxo("w", 5, 3, 12_345);
        {
            let store = RocksStore::open(&path).unwrap();
            store.commit(vec![StoreOp::PutUtxo(u.clone())]).unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(&path).unwrap();
        assert_eq!(store.get_utxo(&u.outpoint).unwrap(), Some(u));
    }

    #[test]
    fn transaction_prefix_does_not_leak_between_wallets() {
        use crate::store::tests::tx;
        let (_dir, store) = temp_store();
        store
            .commit(vec![StoreOp::PutTransaction(tx("ab", 1, 1)), StoreOp::PutTransaction(tx("a", 2, 2))])
            .unwrap();
        assert_eq!(store.transactions_for_wallet("a").unwrap().len(), 1);
        assert_eq!(store.transactions_for_wallet("ab").unwrap().len(), 1);
    }

    #[test]
    fn history_sequence_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(&path).unwrap();
            exercise_history(&store);
            assert!(store.history_seq().unwrap() >= 3);
        }
        let store = RocksStore::open(&path).unwrap();
        assert!(store.history_seq().unwrap() >= 3);
    }
}
