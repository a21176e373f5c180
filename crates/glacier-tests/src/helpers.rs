//! Shared helpers for integration tests.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitcoin::Transaction;
use glacier_core::error::ChainError;
use glacier_core::keys::{KeyDerivationEngine, Seed};
use glacier_core::traits::ChainBackend;
use glacier_core::types::{
    AddressType, Network, OutPoint, RawTransactionInfo, ScannedOutput, TxOutputInfo, Txid,
};
use glacier_wallet::{RocksStore, SeedCipher, WalletConfig, WalletManager};
use parking_lot::Mutex;
use tempfile::TempDir;

/// sat/vB, as bitcoind's default `minrelaytxfee`.
pub const MIN_RELAY_FEE_RATE: u64 = 1;

/// The BIP-39 test mnemonic.
pub const ABANDON: &str = "abandon abandon abandon abandon abandon abandon \
                           abandon abandon abandon abandon abandon about";

struct ChainTx {
    inputs: Vec<OutPoint>,
    /// Virtual size; zero for funding transactions.
    vsize: u64,
    outputs: Vec<TxOutputInfo>,
    coinbase: bool,
    /// `None` while in the mempool.
    height: Option<u64>,
}

struct ChainOutput {
    address: String,
    amount: u64,
    height: u64,
    coinbase: bool,
}

#[derive(Default)]
struct ChainState {
    height: u64,
    txs: HashMap<Txid, ChainTx>,
    /// Confirmed, unspent outputs that pay an address.
    utxos: BTreeMap<OutPoint, ChainOutput>,
    /// Outpoints spent by a mempool transaction.
    mempool_spends: HashMap<OutPoint, Txid>,
    funding_counter: u64,
    broadcast_error: Option<ChainError>,
    offline: bool,
    auto_mine: bool,
    fee_rate: Option<u64>,
}

/// In-process regtest chain.
///
/// Broadcasts are decoded and checked against the chain's own UTXO set
/// (missing or double-spent inputs, outputs above inputs and fees under
/// 1 sat/vB are rejected), then held in a mempool until [`mine`](Self::mine). Scans report only
/// confirmed outputs, and keep reporting outputs spent by mempool
/// transactions, as `scantxoutset` does.
pub struct RegtestChain {
    network: Network,
    state: Mutex<ChainState>,
    pub scan_calls: AtomicUsize,
    pub broadcast_calls: AtomicUsize,
}

impl RegtestChain {
    pub fn new() -> Self {
        Self {
            network: Network::Regtest,
            state: Mutex::new(ChainState { height: 100, ..ChainState::default() }),
            scan_calls: AtomicUsize::new(0),
            broadcast_calls: AtomicUsize::new(0),
        }
    }

    /// Mine a block paying `amount` to `address`.
    pub fn fund(&self, address: &str, amount: u64) -> OutPoint {
        self.fund_inner(address, amount, false)
    }

    /// Mine a block whose coinbase pays `amount` to `address`.
    pub fn fund_coinbase(&self, address: &str, amount: u64) -> OutPoint {
        self.fund_inner(address, amount, true)
    }

    fn fund_inner(&self, address: &str, amount: u64, coinbase: bool) -> OutPoint {
        let mut state = self.state.lock();
        state.funding_counter += 1;
        let mut bytes = [0xF0; 32];
        bytes[..8].copy_from_slice(&state.funding_counter.to_le_bytes());
        let txid = Txid(bytes);
        state.txs.insert(
            txid,
            ChainTx {
                inputs: Vec::new(),
                vsize: 0,
                outputs: vec![TxOutputInfo { vout: 0, amount, address: Some(address.to_string()) }],
                coinbase,
                height: None,
            },
        );
        drop(state);
        self.mine();
        OutPoint::new(txid, 0)
    }

    /// Mine one block containing every mempool transaction.
    pub fn mine(&self) {
        let mut state = self.state.lock();
        state.height += 1;
        let height = state.height;
        let mut confirmed = Vec::new();
        for (txid, tx) in state.txs.iter_mut() {
            if tx.height.is_none() {
                tx.height = Some(height);
                confirmed.push((*txid, tx.inputs.clone(), tx.outputs.clone(), tx.coinbase));
            }
        }
        for (txid, inputs, outputs, coinbase) in confirmed {
            for input in inputs {
                state.utxos.remove(&input);
                state.mempool_spends.remove(&input);
            }
            for out in outputs {
                if let Some(address) = out.address {
                    state.utxos.insert(
                        OutPoint::new(txid, out.vout),
                        ChainOutput { address, amount: out.amount, height, coinbase },
                    );
                }
            }
        }
    }

    pub fn mine_blocks(&self, n: u64) {
        for _ in 0..n {
            self.mine();
        }
    }

    pub fn set_auto_mine(&self, on: bool) {
        self.state.lock().auto_mine = on;
    }

    pub fn fail_broadcasts(&self, err: Option<ChainError>) {
        self.state.lock().broadcast_error = err;
    }

    /// Refuse every connection, as a stopped node would.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn set_fee_rate(&self, rate: Option<u64>) {
        self.state.lock().fee_rate = rate;
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().txs.values().filter(|tx| tx.height.is_none()).count()
    }

    /// Virtual size of a broadcast transaction.
    pub fn vsize(&self, txid: &Txid) -> Option<u64> {
        self.state.lock().txs.get(txid).map(|tx| tx.vsize)
    }

    /// Outputs of a known transaction.
    pub fn outputs(&self, txid: &Txid) -> Option<Vec<TxOutputInfo>> {
        self.state.lock().txs.get(txid).map(|tx| tx.outputs.clone())
    }

    fn refused(&self) -> ChainError {
        ChainError::ConnectionRefused { endpoint: self.endpoint() }
    }
}

impl Default for RegtestChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBackend for RegtestChain {
    fn scan_address(&self, address: &str) -> Result<Vec<ScannedOutput>, ChainError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if state.offline {
            return Err(self.refused());
        }
        Ok(state
            .utxos
            .iter()
            .filter(|(_, out)| out.address == address)
            .map(|(outpoint, out)| ScannedOutput {
                outpoint: *outpoint,
                amount: out.amount,
                address: out.address.clone(),
                confirmations: (state.height + 1 - out.height) as u32,
                coinbase: out.coinbase,
            })
            .collect())
    }

    fn raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo, ChainError> {
        let state = self.state.lock();
        if state.offline {
            return Err(self.refused());
        }
        let tx = state
            .txs
            .get(txid)
            .ok_or_else(|| ChainError::NotFound(format!("No such mempool or blockchain transaction {txid}")))?;
        Ok(RawTransactionInfo {
            txid: *txid,
            confirmations: tx.height.map_or(0, |h| (state.height + 1 - h) as u32),
            outputs: tx.outputs.clone(),
        })
    }

    fn broadcast(&self, raw_tx: &[u8]) -> Result<Txid, ChainError> {
        self.broadcast_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.offline {
            return Err(self.refused());
        }
        if let Some(err) = state.broadcast_error.clone() {
            return Err(err);
        }
        let tx: Transaction = bitcoin::consensus::deserialize(raw_tx)
            .map_err(|e| ChainError::Rejected(format!("TX decode failed: {e}")))?;

        let mut inputs = Vec::with_capacity(tx.input.len());
        let mut input_total = 0u64;
        for input in &tx.input {
            let outpoint = OutPoint::new(Txid::from(input.previous_output.txid), input.previous_output.vout);
            let Some(prev) = state.utxos.get(&outpoint) else {
                return Err(ChainError::Rejected("bad-txns-inputs-missingorspent".into()));
            };
            if state.mempool_spends.contains_key(&outpoint) {
                return Err(ChainError::Rejected("txn-mempool-conflict".into()));
            }
            input_total += prev.amount;
            inputs.push(outpoint);
        }
        let output_total: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        if output_total > input_total {
            return Err(ChainError::Rejected("bad-txns-in-belowout".into()));
        }
        let vsize = tx.vsize() as u64;
        if input_total - output_total < vsize * MIN_RELAY_FEE_RATE {
            return Err(ChainError::Rejected(format!(
                "min relay fee not met, {} < {}",
                input_total - output_total,
                vsize * MIN_RELAY_FEE_RATE
            )));
        }

        let txid = Txid::from(tx.compute_txid());
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
        for outpoint in &inputs {
            state.mempool_spends.insert(*outpoint, txid);
        }
        state.txs.insert(txid, ChainTx { inputs, vsize, outputs, coinbase: false, height: None });
        let auto_mine = state.auto_mine;
        drop(state);
        if auto_mine {
            self.mine();
        }
        Ok(txid)
    }

    fn block_count(&self) -> Result<u64, ChainError> {
        let state = self.state.lock();
        if state.offline {
            return Err(self.refused());
        }
        Ok(state.height)
    }

    fn estimate_fee_rate(&self, _target_blocks: u16) -> Result<Option<u64>, ChainError> {
        let state = self.state.lock();
        if state.offline {
            return Err(self.refused());
        }
        Ok(state.fee_rate)
    }

    fn endpoint(&self) -> String {
        "127.0.0.1:18443".to_string()
    }
}

/// Regtest config rooted at `dir` that never sleeps.
pub fn test_config(dir: &Path) -> WalletConfig {
    WalletConfig {
        data_dir: dir.to_path_buf(),
        network: Network::Regtest,
        confirmation_poll_secs: 0,
        confirmation_timeout_secs: 0,
        rescan_wait_secs: 0,
        ..WalletConfig::default()
    }
}

/// A manager over RocksDB and a key file under `dir`.
pub fn open_manager(dir: &Path, chain: Arc<RegtestChain>) -> WalletManager {
    let config = test_config(dir);
    let cipher = SeedCipher::load_or_create(&config.key_path()).unwrap();
    let store = Arc::new(RocksStore::open(config.db_path()).unwrap());
    WalletManager::new(config, store, chain, cipher)
}

/// A fresh manager, its chain, and the temp directory holding its state.
pub fn setup() -> (WalletManager, Arc<RegtestChain>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(RegtestChain::new());
    let manager = open_manager(dir.path(), chain.clone());
    (manager, chain, dir)
}

/// A regtest address no test wallet owns.
pub fn external_address(byte: u8, address_type: AddressType) -> String {
    let seed = Seed::from_bytes(vec![byte; 32]).unwrap();
    KeyDerivationEngine::new()
        .derive(&seed, Network::Regtest, address_type, 0)
        .unwrap()
        .address(Network::Regtest, address_type)
        .unwrap()
}
