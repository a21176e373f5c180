//! In-crate test doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitcoin::Transaction;
use glacier_core::error::ChainError;
use glacier_core::traits::ChainBackend;
use glacier_core::types::{
    Network, OutPoint, RawTransactionInfo, ScannedOutput, TxOutputInfo, Txid,
};
use parking_lot::Mutex;

/// Scripted chain source. Scan results are set per address; broadcasts
/// are decoded and kept so `raw_transaction` can answer for them.
pub(crate) struct MockChain {
    network: Network,
    scans: Mutex<HashMap<String, Vec<ScannedOutput>>>,
    broadcasts: Mutex<Vec<Transaction>>,
    broadcast_error: Mutex<Option<ChainError>>,
    scan_error: Mutex<Option<ChainError>>,
    fee_rate: Mutex<Option<u64>>,
    confirmations: AtomicU32,
    pub scan_calls: AtomicUsize,
}

impl MockChain {
    pub(crate) fn new(network: Network) -> Self {
        Self {
            network,
            scans: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            broadcast_error: Mutex::new(None),
            scan_error: Mutex::new(None),
            fee_rate: Mutex::new(None),
            confirmations: AtomicU32::new(1),
            scan_calls: AtomicUsize::new(0),
        }
    }

    /// Report an unspent output of `amount` at `address`.
    pub(crate) fn fund(&self, address: &str, byte: u8, vout: u32, amount: u64) -> OutPoint {
        let outpoint = OutPoint::new(Txid([byte; 32]), vout);
        self.scans.lock().entry(address.to_string()).or_default().push(ScannedOutput {
            outpoint,
            amount,
            address: address.to_string(),
            confirmations: 6,
            coinbase: false,
        });
        outpoint
    }

    pub(crate) fn clear_address(&self, address: &str) {
        self.scans.lock().remove(address);
    }

    pub(crate) fn fail_broadcasts(&self, err: Option<ChainError>) {
        *self.broadcast_error.lock() = err;
    }

    pub(crate) fn fail_scans(&self, err: Option<ChainError>) {
        *self.scan_error.lock() = err;
    }

    pub(crate) fn set_fee_rate(&self, rate: Option<u64>) {
        *self.fee_rate.lock() = rate;
    }

    pub(crate) fn set_confirmations(&self, n: u32) {
        self.confirmations.store(n, Ordering::SeqCst);
    }

    pub(crate) fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts.lock().clone()
    }
}

impl ChainBackend for MockChain {
    fn scan_address(&self, address: &str) -> Result<Vec<ScannedOutput>, ChainError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scan_error.lock().clone() {
            return Err(err);
        }
        Ok(self.scans.lock().get(address).cloned().unwrap_or_default())
    }

    fn raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo, ChainError> {
        let broadcasts = self.broadcasts.lock();
        let tx = broadcasts
            .iter()
            .find(|tx| Txid::from(tx.compute_txid()) == *txid)
            .ok_or_else(|| ChainError::NotFound(txid.to_string()))?;
        let outputs = tx
            .output
            .iter()
            .enumerate()
            .map(|(vout, out)| TxOutputInfo {
                vout: vout as u32,
                amount: out.value.to_sat(),
                address: bitcoin::Address::from_script(&out.script_pubkey, self.network.to_bitcoin())
                    .ok()
                    .map(|a| a.to_string()),
            })
            .collect();
        Ok(RawTransactionInfo {
            txid: *txid,
            confirmations: self.confirmations.load(Ordering::SeqCst),
            outputs,
        })
    }

    fn broadcast(&self, raw_tx: &[u8]) -> Result<Txid, ChainError> {
        if let Some(err) = self.broadcast_error.lock().clone() {
            return Err(err);
        }
        let tx: Transaction = bitcoin::consensus::deserialize(raw_tx)
            .map_err(|e| ChainError::Rejected(format!("TX decode failed: {e}")))?;
        let txid = Txid::from(tx.compute_txid());
        self.broadcasts.lock().push(tx);
        Ok(txid)
    }

    fn block_count(&self) -> Result<u64, ChainError> {
        Ok(200)
    }

    fn estimate_fee_rate(&self, _target_blocks: u16) -> Result<Option<u64>, ChainError> {
        Ok(*self.fee_rate.lock())
    }

    fn endpoint(&self) -> String {
        "mock:18443".to_string()
    }
}
