//! Wallet manager: the public surface of the engine.
//!
//! [`WalletManager`] owns wallet records and wires key derivation, the UTXO
//! store, the transaction builder and the chain source together. It is an
//! ordinary value built from injected parts; nothing is process-global.
//!
//! Every operation is synchronous and blocks for any chain round trip.
//! Operations that derive addresses or spend are serialized; a balance
//! refresh is single-flight, and a second refresh asks the running one to
//! yield before taking over.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bip39::Mnemonic;
use glacier_core::constants::MAX_ADDRESS_INDEX;
use glacier_core::error::KeyError;
use glacier_core::keys::KeyDerivationEngine;
use glacier_core::traits::ChainBackend;
use glacier_core::types::{
    now_secs, AddressRecord, AddressType, Network, OutPoint, TransactionRecord, TxStatus, Txid,
    Utxo, UtxoState, UtxoTransition, WalletRecord,
};
use glacier_electrum::ChainDataClient;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::builder::{normalize_memo, wait_for_confirmation, TransactionBuilder, UnlockedWallet};
use crate::config::{ChainSource, WalletConfig};
use crate::encryption::{seed_aad, KeyStatus, SeedCipher};
use crate::error::WalletError;
use crate::mnemonic;
use crate::node_rpc::NodeRpcClient;
use crate::rocks::RocksStore;
use crate::store::{StoreOp, WalletStore};
use crate::utxo_store::{ScanReport, UtxoStore};

/// Addresses generated per call at most.
pub const MAX_ADDRESSES_PER_CALL: u32 = 1_000;

const MAX_WALLET_NAME_LEN: usize = 64;

/// A newly created wallet and the mnemonic that backs it. The mnemonic is
/// shown once; only its ciphertext is stored.
pub struct NewWallet {
    pub record: WalletRecord,
    pub mnemonic: Mnemonic,
}

/// Balance after a refresh, in satoshis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Balance {
    /// Spendable amount per wallet address, including empty addresses.
    pub per_address: BTreeMap<String, u64>,
    pub total_spendable: u64,
    pub frozen: u64,
    pub locked: u64,
    /// Coinbase outputs below maturity.
    pub immature: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeReceipt {
    pub txid: Txid,
    pub outpoint: OutPoint,
    pub amount: u64,
    pub fee: u64,
    pub memo: Option<String>,
    /// Whether one confirmation was seen before the wait ended.
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationReceipt {
    pub txid: Txid,
    pub inputs: usize,
    pub amount: u64,
    pub fee: u64,
    pub destination: String,
}

pub struct WalletManager {
    config: WalletConfig,
    store: Arc<dyn WalletStore>,
    utxos: Arc<UtxoStore>,
    chain: Arc<dyn ChainBackend>,
    cipher: SeedCipher,
    engine: Arc<KeyDerivationEngine>,
    builder: TransactionBuilder,
    /// Serializes address derivation, spends and deletion.
    wallet_ops: Mutex<()>,
    rescan_guard: Mutex<()>,
    rescan_abort: AtomicBool,
}

impl WalletManager {
    /// Assemble a manager from explicit parts.
    pub fn new(
        config: WalletConfig,
        store: Arc<dyn WalletStore>,
        chain: Arc<dyn ChainBackend>,
        cipher: SeedCipher,
    ) -> Self {
        let engine = Arc::new(KeyDerivationEngine::new());
        let utxos = Arc::new(UtxoStore::new(store.clone()));
        let builder = TransactionBuilder::new(engine.clone(), store.clone(), utxos.clone());
        Self {
            config,
            store,
            utxos,
            chain,
            cipher,
            engine,
            builder,
            wallet_ops: Mutex::new(()),
            rescan_guard: Mutex::new(()),
            rescan_abort: AtomicBool::new(false),
        }
    }

    /// Open the on-disk database and key file under `config.data_dir` and
    /// connect the configured chain source.
    pub fn open(config: WalletConfig) -> Result<Self, WalletError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| WalletError::Storage(format!("{}: {e}", config.data_dir.display())))?;

        let cipher = SeedCipher::load_or_create(&config.key_path())?;
        if cipher.status() == KeyStatus::Regenerated {
            warn!(
                path = %config.key_path().display(),
                "seed key regenerated; wallets encrypted under the old key must be restored from their mnemonics"
            );
        }
        let store: Arc<dyn WalletStore> = Arc::new(RocksStore::open(config.db_path())?);
        let chain: Arc<dyn ChainBackend> = match config.chain_source {
            ChainSource::Node => Arc::new(NodeRpcClient::new(&config.node)?),
            ChainSource::Electrum => Arc::new(ChainDataClient::new(config.electrum.clone())),
        };
        info!(
            data_dir = %config.data_dir.display(),
            network = %config.network,
            chain = %chain.endpoint(),
            "wallet manager opened"
        );
        Ok(Self::new(config, store, chain, cipher))
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn key_status(&self) -> KeyStatus {
        self.cipher.status()
    }

    // --- wallets ---------------------------------------------------------

    /// Create a wallet from a fresh 24-word mnemonic and derive
    /// `address_count` addresses.
    pub fn create_wallet(
        &self,
        name: &str,
        network: Network,
        address_type: AddressType,
        address_count: u32,
    ) -> Result<NewWallet, WalletError> {
        let mnemonic = mnemonic::generate()?;
        let record = self.persist_new(name, network, address_type, &mnemonic, address_count)?;
        Ok(NewWallet { record, mnemonic })
    }

    /// Create a wallet from an existing mnemonic.
    pub fn restore_wallet(
        &self,
        name: &str,
        phrase: &str,
        network: Network,
        address_type: AddressType,
        address_count: u32,
    ) -> Result<WalletRecord, WalletError> {
        let mnemonic = mnemonic::parse(phrase)?;
        self.persist_new(name, network, address_type, &mnemonic, address_count)
    }

    fn persist_new(
        &self,
        name: &str,
        network: Network,
        address_type: AddressType,
        mnemonic: &Mnemonic,
        address_count: u32,
    ) -> Result<WalletRecord, WalletError> {
        validate_name(name)?;
        if network != self.config.network {
            return Err(WalletError::InvalidConfiguration(format!(
                "wallet network {network} does not match the configured chain source network {}",
                self.config.network
            )));
        }
        check_count(address_count)?;

        let _ops = self.wallet_ops.lock();
        if self.store.get_wallet(name)?.is_some() {
            return Err(WalletError::WalletExists(name.to_string()));
        }

        let phrase = Zeroizing::new(mnemonic.to_string());
        let record = WalletRecord {
            name: name.to_string(),
            network,
            address_type,
            encrypted_seed: self.cipher.encrypt(phrase.as_bytes(), &seed_aad(name, network, address_type))?,
            key_fingerprint: self.cipher.fingerprint().to_string(),
            addresses: Vec::new(),
            next_index: 0,
            created_at: now_secs(),
        };
        let mut wallet = UnlockedWallet::new(record, mnemonic::to_seed(mnemonic)?);
        let (_, mut ops) = self.derive_batch(&mut wallet, address_count)?;
        ops.push(StoreOp::PutWallet(wallet.record.clone()));
        self.store.commit(ops)?;

        info!(wallet = name, %network, %address_type, addresses = address_count, "wallet created");
        Ok(wallet.record)
    }

    pub fn get_wallet(&self, name: &str) -> Result<WalletRecord, WalletError> {
        self.store
            .get_wallet(name)?
            .ok_or_else(|| WalletError::WalletNotFound(name.to_string()))
    }

    pub fn list_wallets(&self) -> Result<Vec<WalletRecord>, WalletError> {
        self.store.list_wallets()
    }

    pub fn addresses(&self, name: &str) -> Result<Vec<AddressRecord>, WalletError> {
        self.get_wallet(name)?;
        self.store.addresses_for_wallet(name)
    }

    /// Decrypt the wallet's seed for one operation.
    fn unlock(&self, name: &str) -> Result<UnlockedWallet, WalletError> {
        let record = self.get_wallet(name)?;
        let aad = seed_aad(&record.name, record.network, record.address_type);
        let plaintext = self.cipher.decrypt(&record.encrypted_seed, &aad, &record.key_fingerprint)?;
        let phrase = std::str::from_utf8(&plaintext)
            .map_err(|_| WalletError::Encryption(format!("seed of {name} is not valid text")))?;
        let seed = mnemonic::to_seed(&mnemonic::parse(phrase)?)?;
        Ok(UnlockedWallet::new(record, seed))
    }

    /// Append `count` addresses to the wallet.
    pub fn generate_addresses(&self, name: &str, count: u32) -> Result<Vec<AddressRecord>, WalletError> {
        check_count(count)?;
        let _ops = self.wallet_ops.lock();
        let mut wallet = self.unlock(name)?;
        let (records, mut ops) = self.derive_batch(&mut wallet, count)?;
        ops.push(StoreOp::PutWallet(wallet.record.clone()));
        self.store.commit(ops)?;
        debug!(wallet = name, count, next_index = wallet.record.next_index, "addresses generated");
        Ok(records)
    }

    pub fn generate_address(&self, name: &str) -> Result<AddressRecord, WalletError> {
        self.generate_addresses(name, 1)?
            .pop()
            .ok_or_else(|| WalletError::StateViolation("no address generated".into()))
    }

    /// Derive the next `count` addresses into `wallet.record` and return
    /// the records with their put operations.
    fn derive_batch(
        &self,
        wallet: &mut UnlockedWallet,
        count: u32,
    ) -> Result<(Vec<AddressRecord>, Vec<StoreOp>), WalletError> {
        let start = wallet.record.next_index;
        let end = start
            .checked_add(count)
            .filter(|end| *end <= MAX_ADDRESS_INDEX)
            .ok_or_else(|| {
                WalletError::Derivation(KeyError::InvalidPath(format!(
                    "address index range {start}+{count} exceeds {MAX_ADDRESS_INDEX}"
                )))
            })?;
        let mut records = Vec::with_capacity(count as usize);
        let mut ops = Vec::with_capacity(count as usize + 1);
        for index in start..end {
            let record = wallet.derive_address(&self.engine, index)?;
            if let Some(owner) = self.store.get_address(&record.address)?.filter(|a| a.wallet != wallet.record.name) {
                return Err(WalletError::AddressInUse { address: record.address, owner: owner.wallet });
            }
            wallet.record.addresses.push(record.address.clone());
            ops.push(StoreOp::PutAddress(record.clone()));
            records.push(record);
        }
        wallet.record.next_index = end;
        Ok((records, ops))
    }

    /// Remove the wallet, its addresses, UTXOs, UTXO history and
    /// transactions in one commit.
    pub fn delete_wallet(&self, name: &str) -> Result<(), WalletError> {
        let _ops = self.wallet_ops.lock();
        let _rescan = self.rescan_guard.lock();
        self.get_wallet(name)?;

        let mut ops = Vec::new();
        for utxo in self.store.utxos_for_wallet(name)? {
            ops.push(StoreOp::DeleteUtxo(utxo.outpoint));
            ops.push(StoreOp::DeleteHistory(utxo.outpoint));
        }
        for tx in self.store.transactions_for_wallet(name)? {
            ops.push(StoreOp::DeleteTransaction { wallet: name.to_string(), txid: tx.txid });
        }
        for addr in self.store.addresses_for_wallet(name)? {
            ops.push(StoreOp::DeleteAddress(addr.address));
        }
        ops.push(StoreOp::DeleteWallet(name.to_string()));
        let count = ops.len();
        self.store.commit(ops)?;
        info!(wallet = name, records = count, "wallet deleted");
        Ok(())
    }

    // --- refresh ---------------------------------------------------------

    /// Rescan every wallet address and make the result authoritative for
    /// spendable coins. FROZEN entries survive. Pending transactions are
    /// checked for confirmation.
    pub fn rescan(&self, name: &str) -> Result<ScanReport, WalletError> {
        let record = self.get_wallet(name)?;
        let _guard = match self.rescan_guard.try_lock() {
            Some(guard) => guard,
            None => {
                info!(wallet = name, "rescan already running, asking it to yield");
                self.rescan_abort.store(true, Ordering::SeqCst);
                self.rescan_guard
                    .try_lock_for(self.config.rescan_wait())
                    .ok_or(WalletError::RescanBusy)?
            }
        };
        self.rescan_abort.store(false, Ordering::SeqCst);

        let mut scanned = Vec::new();
        for address in &record.addresses {
            if self.rescan_abort.load(Ordering::SeqCst) {
                info!(wallet = name, "rescan yielded to a newer request");
                return Err(WalletError::RescanBusy);
            }
            scanned.extend(self.chain.scan_address(address)?);
        }
        if self.rescan_abort.load(Ordering::SeqCst) {
            return Err(WalletError::RescanBusy);
        }

        let report = self.utxos.apply_scan(name, scanned)?;
        self.refresh_pending(name)?;
        Ok(report)
    }

    fn refresh_pending(&self, name: &str) -> Result<(), WalletError> {
        let mut ops = Vec::new();
        for mut tx in self.store.transactions_for_wallet(name)? {
            if tx.status != TxStatus::Pending {
                continue;
            }
            match self.chain.confirmations(&tx.txid) {
                Ok(n) if n >= 1 => {
                    debug!(wallet = name, txid = %tx.txid, confirmations = n, "transaction confirmed");
                    tx.status = TxStatus::Confirmed;
                    ops.push(StoreOp::PutTransaction(tx));
                }
                Ok(_) => {}
                Err(e) if e.is_connection_refused() => return Err(e.into()),
                Err(e) => debug!(wallet = name, txid = %tx.txid, error = %e, "status check failed"),
            }
        }
        if !ops.is_empty() {
            self.store.commit(ops)?;
        }
        Ok(())
    }

    /// Rescan, then report spendable amounts per address and in total.
    pub fn get_balance(&self, name: &str) -> Result<Balance, WalletError> {
        self.rescan(name)?;
        let mut balance = Balance::default();
        for addr in self.get_wallet(name)?.addresses {
            balance.per_address.insert(addr, 0);
        }
        for utxo in self.utxos.list(name, true)? {
            match utxo.state {
                UtxoState::Unspent if utxo.is_mature() => {
                    *balance.per_address.entry(utxo.address.clone()).or_default() += utxo.amount;
                    balance.total_spendable += utxo.amount;
                }
                UtxoState::Unspent => balance.immature += utxo.amount,
                UtxoState::Frozen => balance.frozen += utxo.amount,
                UtxoState::Locked => balance.locked += utxo.amount,
                UtxoState::Spent => {}
            }
        }
        Ok(balance)
    }

    // --- spending --------------------------------------------------------

    /// Fee rate for a spend: explicit, else the chain source's estimate,
    /// else the configured default.
    fn resolve_fee_rate(&self, explicit: Option<u64>) -> Result<u64, WalletError> {
        match explicit {
            Some(0) => Err(WalletError::InvalidAmount("fee rate must be at least 1 sat/vB".into())),
            Some(rate) => Ok(rate),
            None => match self.chain.estimate_fee_rate(self.config.fee_target_blocks) {
                Ok(Some(rate)) if rate >= 1 => Ok(rate),
                Ok(_) => Ok(self.config.default_fee_rate),
                Err(e) if e.is_connection_refused() => Err(e.into()),
                Err(e) => {
                    warn!(error = %e, fallback = self.config.default_fee_rate, "fee estimate failed");
                    Ok(self.config.default_fee_rate)
                }
            },
        }
    }

    /// Pay `amount` to `destination` from the wallet's spendable coins.
    pub fn send(
        &self,
        name: &str,
        destination: &str,
        amount: u64,
        memo: Option<&str>,
        fee_rate: Option<u64>,
    ) -> Result<TransactionRecord, WalletError> {
        let _ops = self.wallet_ops.lock();
        let wallet = self.unlock(name)?;
        let rate = self.resolve_fee_rate(fee_rate)?;
        let plan = self.builder.build(&wallet, destination, amount, memo, rate)?;
        let signed = self.builder.sign(&wallet, plan)?;
        self.builder.broadcast(self.chain.as_ref(), &wallet.record, &signed)
    }

    /// Move `amount` to a fresh wallet address and pin the new output as
    /// FROZEN with `memo`, then wait (bounded) for one confirmation.
    ///
    /// The FROZEN entry is recorded as soon as the broadcast is accepted.
    /// A confirmation timeout is reported through `confirmed`, not as an
    /// error.
    pub fn freeze(
        &self,
        name: &str,
        amount: u64,
        memo: Option<&str>,
        fee_rate: Option<u64>,
    ) -> Result<FreezeReceipt, WalletError> {
        let (record, destination, vout) = {
            let _ops = self.wallet_ops.lock();
            let wallet = self.unlock(name)?;
            let rate = self.resolve_fee_rate(fee_rate)?;
            let plan = self.builder.build_freeze(&wallet, amount, memo, rate)?;
            let signed = self.builder.sign(&wallet, plan)?;
            let destination = signed.plan.destination.clone();
            let vout = signed.plan.payment_vout;
            (self.builder.broadcast(self.chain.as_ref(), &wallet.record, &signed)?, destination, vout)
        };
        let outpoint = OutPoint::new(record.txid, vout);

        let confirmed = match wait_for_confirmation(
            self.chain.as_ref(),
            &record.txid,
            self.config.confirmation_poll(),
            self.config.confirmation_timeout(),
        ) {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(wallet = name, txid = %record.txid, error = %e, "could not wait for freeze confirmation");
                false
            }
        };
        if confirmed {
            self.settle_frozen(&outpoint, &destination, amount);
        }

        info!(wallet = name, %outpoint, amount, confirmed, "output frozen");
        Ok(FreezeReceipt { txid: record.txid, outpoint, amount, fee: record.fee, memo: record.memo, confirmed })
    }

    /// Check the confirmed freeze transaction pays `amount` to
    /// `destination` at `outpoint.vout` and record its depth.
    fn settle_frozen(&self, outpoint: &OutPoint, destination: &str, amount: u64) {
        let info = match self.chain.raw_transaction(&outpoint.txid) {
            Ok(info) => info,
            Err(e) => {
                warn!(%outpoint, error = %e, "could not fetch confirmed freeze transaction");
                return;
            }
        };
        match info.find_output(destination, amount) {
            Some(vout) if vout == outpoint.vout => {}
            found => {
                warn!(%outpoint, ?found, destination, "freeze output not where it was built");
                return;
            }
        }
        match self.utxos.get(outpoint) {
            Ok(Some(mut frozen)) if frozen.is_frozen() => {
                frozen.confirmations = info.confirmations;
                if let Err(e) = self.utxos.upsert(frozen) {
                    warn!(%outpoint, error = %e, "could not record freeze depth");
                }
            }
            Ok(_) => warn!(%outpoint, "frozen entry missing after confirmation"),
            Err(e) => warn!(%outpoint, error = %e, "could not read frozen entry"),
        }
    }

    /// Merge up to `batch_size` (default from config) spendable outputs
    /// into one. Call repeatedly for larger sets.
    pub fn consolidate(
        &self,
        name: &str,
        fee_rate: Option<u64>,
        batch_size: Option<usize>,
    ) -> Result<ConsolidationReceipt, WalletError> {
        let _ops = self.wallet_ops.lock();
        let wallet = self.unlock(name)?;
        let batch = batch_size.unwrap_or(self.config.consolidation_batch_size);
        let rate = self.resolve_fee_rate(fee_rate)?;
        let plan = self.builder.build_consolidation(&wallet, rate, batch)?;
        let signed = self.builder.sign(&wallet, plan)?;
        let record = self.builder.broadcast(self.chain.as_ref(), &wallet.record, &signed)?;
        Ok(ConsolidationReceipt {
            txid: record.txid,
            inputs: signed.plan.inputs.len(),
            amount: record.amount,
            fee: record.fee,
            destination: signed.plan.destination.clone(),
        })
    }

    // --- utxos -----------------------------------------------------------

    pub fn get_utxos(&self, name: &str, include_frozen: bool) -> Result<Vec<Utxo>, WalletError> {
        self.get_wallet(name)?;
        self.utxos.list(name, include_frozen)
    }

    fn owned(&self, name: &str, outpoint: &OutPoint) -> Result<Utxo, WalletError> {
        self.utxos
            .get(outpoint)?
            .filter(|u| u.wallet == name)
            .ok_or_else(|| WalletError::UtxoNotFound(format!("{outpoint} in wallet {name}")))
    }

    /// Freeze an output the wallet already holds.
    pub fn freeze_existing(&self, name: &str, outpoint: &OutPoint, memo: Option<&str>) -> Result<Utxo, WalletError> {
        self.owned(name, outpoint)?;
        let frozen = self.utxos.freeze(outpoint, normalize_memo(memo)?)?;
        info!(wallet = name, %outpoint, "utxo frozen");
        Ok(frozen)
    }

    pub fn unfreeze(&self, name: &str, outpoint: &OutPoint) -> Result<Utxo, WalletError> {
        self.owned(name, outpoint)?;
        let utxo = self.utxos.unfreeze(outpoint)?;
        info!(wallet = name, %outpoint, "utxo unfrozen");
        Ok(utxo)
    }

    pub fn lock_utxo(&self, name: &str, outpoint: &OutPoint, owner: &str) -> Result<Utxo, WalletError> {
        self.owned(name, outpoint)?;
        self.utxos.lock(outpoint, owner)
    }

    pub fn unlock_utxo(&self, name: &str, outpoint: &OutPoint) -> Result<Utxo, WalletError> {
        self.owned(name, outpoint)?;
        self.utxos.unlock(outpoint)
    }

    pub fn utxo_history(&self, name: &str, outpoint: &OutPoint) -> Result<Vec<UtxoTransition>, WalletError> {
        let history = self.utxos.history(outpoint)?;
        if history.iter().any(|h| h.wallet != name) || (history.is_empty() && self.utxos.get(outpoint)?.is_none()) {
            return Err(WalletError::UtxoNotFound(format!("{outpoint} in wallet {name}")));
        }
        Ok(history)
    }

    /// Transactions of the wallet, oldest first.
    pub fn transactions(&self, name: &str) -> Result<Vec<TransactionRecord>, WalletError> {
        self.get_wallet(name)?;
        self.store.transactions_for_wallet(name)
    }
}

fn validate_name(name: &str) -> Result<(), WalletError> {
    if name.trim().is_empty() || name.trim() != name {
        return Err(WalletError::InvalidConfiguration(format!(
            "wallet name {name:?} must be non-empty without surrounding whitespace"
        )));
    }
    if name.len() > MAX_WALLET_NAME_LEN || name.chars().any(char::is_control) {
        return Err(WalletError::InvalidConfiguration(format!(
            "wallet name {name:?} must be at most {MAX_WALLET_NAME_LEN} bytes of printable text"
        )));
    }
    Ok(())
}

fn check_count(count: u32) -> Result<(), WalletError> {
    if count > MAX_ADDRESSES_PER_CALL {
        return Err(WalletError::InvalidAmount(format!(
            "address count {count} exceeds {MAX_ADDRESSES_PER_CALL}"
        )));
    }
    Ok(())
}
