//! Transaction construction, signing and broadcast.
//!
//! Three shapes are built, all spending only UNSPENT, mature inputs:
//!
//! - **send**: payment, optional `OP_RETURN <memo>`, change to a fresh
//!   address (folded into the fee when below dust)
//! - **freeze**: payment to a fresh address of the wallet, later stored as
//!   a FROZEN output carrying the memo
//! - **consolidation**: up to `batch_size` inputs, largest first, merged
//!   into one output at a fresh address
//!
//! Broadcast is the only step with side effects. Nothing is written unless
//! the chain source accepts the transaction; after it does, every state
//! change (inputs SPENT, transaction record, new addresses, frozen output)
//! lands in one commit.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::key::{Keypair, TapTweak};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use glacier_core::address::{p2wpkh_redeem_script, AddressCodec};
use glacier_core::constants::{DUST_LIMIT, MAX_MEMO_BYTES};
use glacier_core::error::ChainError;
use glacier_core::keys::{DerivedKey, KeyDerivationEngine, Seed};
use glacier_core::traits::ChainBackend;
use glacier_core::types::{
    now_secs, AddressRecord, AddressType, Network, OutPoint, TransactionKind, TransactionRecord,
    Txid, TxStatus, Utxo, UtxoState, WalletRecord,
};
use tracing::{debug, info, warn};

use crate::coin_selection::frozen_total;
use crate::error::WalletError;
use crate::fee::FeeModel;
use crate::store::{StoreOp, WalletStore};
use crate::utxo_store::{plan_upsert, UtxoStore};

/// A wallet record together with its decrypted seed, alive for one
/// operation.
pub struct UnlockedWallet {
    pub record: WalletRecord,
    seed: Seed,
}

impl UnlockedWallet {
    pub fn new(record: WalletRecord, seed: Seed) -> Self {
        Self { record, seed }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn network(&self) -> Network {
        self.record.network
    }

    pub fn address_type(&self) -> AddressType {
        self.record.address_type
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    /// Derive the address record at `index`.
    pub fn derive_address(&self, engine: &KeyDerivationEngine, index: u32) -> Result<AddressRecord, WalletError> {
        let key = engine.derive(&self.seed, self.network(), self.address_type(), index)?;
        Ok(AddressRecord {
            address: key.address(self.network(), self.address_type())?,
            wallet: self.record.name.clone(),
            index,
            path: KeyDerivationEngine::path_string(self.network(), self.address_type(), index),
            public_key: key.public_key_hex(),
        })
    }
}

/// Change paid back to the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutput {
    pub address: String,
    pub amount: u64,
    pub vout: u32,
}

/// A fully shaped transaction with empty signatures.
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    pub wallet: String,
    pub kind: TransactionKind,
    pub tx: Transaction,
    pub inputs: Vec<Utxo>,
    pub destination: String,
    pub amount: u64,
    pub payment_vout: u32,
    /// Inputs minus outputs.
    pub fee: u64,
    pub change: Option<ChangeOutput>,
    pub memo: Option<String>,
    /// Addresses derived for this transaction, not yet persisted.
    pub new_addresses: Vec<AddressRecord>,
}

#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub plan: UnsignedTransaction,
    pub tx: Transaction,
    pub txid: Txid,
}

impl SignedTransaction {
    /// Consensus serialization, as handed to the chain source.
    pub fn serialize(&self) -> Vec<u8> {
        bitcoin::consensus::encode::serialize(&self.tx)
    }
}

/// Builds, signs and broadcasts wallet transactions.
pub struct TransactionBuilder {
    engine: Arc<KeyDerivationEngine>,
    store: Arc<dyn WalletStore>,
    utxos: Arc<UtxoStore>,
}

impl TransactionBuilder {
    pub fn new(engine: Arc<KeyDerivationEngine>, store: Arc<dyn WalletStore>, utxos: Arc<UtxoStore>) -> Self {
        Self { engine, store, utxos }
    }

    /// Pay `amount` to `destination`, with an optional `OP_RETURN` memo.
    pub fn build(
        &self,
        wallet: &UnlockedWallet,
        destination: &str,
        amount: u64,
        memo: Option<&str>,
        fee_rate: u64,
    ) -> Result<UnsignedTransaction, WalletError> {
        check_amount(amount)?;
        let memo = normalize_memo(memo)?;
        let dest_script = script_for(destination, wallet.network())?;

        // Destination plus change back to the wallet.
        let mut model = FeeModel::new(fee_rate, wallet.address_type(), 1).with_output(&dest_script);
        if let Some(m) = &memo {
            model = model.with_data_carrier(m.len());
        }
        let selection = self.utxos.select(wallet.name(), amount, &model)?;

        let mut outputs = vec![TxOut { value: Amount::from_sat(amount), script_pubkey: dest_script }];
        if let Some(m) = &memo {
            outputs.push(TxOut { value: Amount::ZERO, script_pubkey: op_return(m)? });
        }

        let excess = selection.excess(amount);
        let mut new_addresses = Vec::new();
        let mut change = None;
        if excess >= DUST_LIMIT {
            let record = wallet.derive_address(&self.engine, wallet.record.next_index)?;
            change = Some(ChangeOutput { address: record.address.clone(), amount: excess, vout: outputs.len() as u32 });
            outputs.push(TxOut { value: Amount::from_sat(excess), script_pubkey: script_for(&record.address, wallet.network())? });
            new_addresses.push(record);
        } else if excess > 0 {
            debug!(wallet = wallet.name(), excess, "change below dust, folded into fee");
        }
        let fee = selection.total - amount - change.as_ref().map_or(0, |c| c.amount);

        Ok(UnsignedTransaction {
            wallet: wallet.name().to_string(),
            kind: TransactionKind::Send,
            tx: unsigned_tx(&selection.selected, outputs),
            inputs: selection.selected,
            destination: destination.to_string(),
            amount,
            payment_vout: 0,
            fee,
            change,
            memo,
            new_addresses,
        })
    }

    /// Pay `amount` to a fresh address of the wallet itself. The memo is
    /// kept for the FROZEN entry, not written on chain.
    pub fn build_freeze(
        &self,
        wallet: &UnlockedWallet,
        amount: u64,
        memo: Option<&str>,
        fee_rate: u64,
    ) -> Result<UnsignedTransaction, WalletError> {
        check_amount(amount)?;
        let memo = normalize_memo(memo)?;
        let target = wallet.derive_address(&self.engine, wallet.record.next_index)?;
        let mut plan = self.build(wallet, &target.address, amount, None, fee_rate)?;

        // The change address was derived at the same index as the target.
        if let Some(change) = plan.change.take() {
            let record = wallet.derive_address(&self.engine, wallet.record.next_index + 1)?;
            plan.tx.output[change.vout as usize].script_pubkey = script_for(&record.address, wallet.network())?;
            plan.change = Some(ChangeOutput { address: record.address.clone(), ..change });
            plan.new_addresses = vec![target, record];
        } else {
            plan.new_addresses = vec![target];
        }
        plan.kind = TransactionKind::Freeze;
        plan.memo = memo;
        Ok(plan)
    }

    /// Merge up to `batch_size` spendable outputs into one at a fresh
    /// address. Fails without side effects when fewer than two qualify.
    pub fn build_consolidation(
        &self,
        wallet: &UnlockedWallet,
        fee_rate: u64,
        batch_size: usize,
    ) -> Result<UnsignedTransaction, WalletError> {
        if batch_size < 2 {
            return Err(WalletError::InvalidConfiguration(format!("batch size {batch_size} is below 2")));
        }
        let all = self.utxos.list(wallet.name(), true)?;
        let mut candidates: Vec<Utxo> = all.iter().filter(|u| u.is_spendable()).cloned().collect();
        if candidates.len() < 2 {
            return Err(WalletError::ConsolidationTooSmall { eligible: candidates.len() });
        }
        candidates.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.outpoint.cmp(&b.outpoint)));
        candidates.truncate(batch_size);

        let total: u64 = candidates.iter().map(|u| u.amount).sum();
        let fee = FeeModel::new(fee_rate, wallet.address_type(), 1).fee_for(candidates.len());
        let amount = total.saturating_sub(fee);
        if amount < DUST_LIMIT {
            return Err(WalletError::InsufficientFunds {
                available: total,
                required: fee + DUST_LIMIT,
                frozen: frozen_total(&all),
            });
        }

        let target = wallet.derive_address(&self.engine, wallet.record.next_index)?;
        let outputs = vec![TxOut { value: Amount::from_sat(amount), script_pubkey: script_for(&target.address, wallet.network())? }];
        Ok(UnsignedTransaction {
            wallet: wallet.name().to_string(),
            kind: TransactionKind::Consolidation,
            tx: unsigned_tx(&candidates, outputs),
            inputs: candidates,
            destination: target.address.clone(),
            amount,
            payment_vout: 0,
            fee,
            change: None,
            memo: None,
            new_addresses: vec![target],
        })
    }

    /// Sign every input with the key behind its address.
    pub fn sign(&self, wallet: &UnlockedWallet, plan: UnsignedTransaction) -> Result<SignedTransaction, WalletError> {
        let secp = self.engine.secp();
        let network = wallet.network();

        let mut keys = Vec::with_capacity(plan.inputs.len());
        let mut prevouts = Vec::with_capacity(plan.inputs.len());
        for utxo in &plan.inputs {
            keys.push(self.signing_key(wallet, &utxo.address)?);
            prevouts.push(TxOut { value: Amount::from_sat(utxo.amount), script_pubkey: script_for(&utxo.address, network)? });
        }

        let mut tx = plan.tx.clone();
        let mut cache = SighashCache::new(&plan.tx);
        for (i, (key, prevout)) in keys.iter().zip(&prevouts).enumerate() {
            match wallet.address_type() {
                AddressType::Legacy => {
                    let sighash = cache
                        .legacy_signature_hash(i, &prevout.script_pubkey, EcdsaSighashType::All.to_u32())
                        .map_err(signing_error)?;
                    let sig = ecdsa_sig(secp, sighash.to_byte_array(), key);
                    tx.input[i].script_sig = Builder::new()
                        .push_slice(push_bytes(sig)?)
                        .push_key(&bitcoin::PublicKey::new(key.public_key))
                        .into_script();
                }
                AddressType::Segwit => {
                    let sighash = cache
                        .p2wpkh_signature_hash(i, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
                        .map_err(signing_error)?;
                    tx.input[i].witness = p2wpkh_witness(ecdsa_sig(secp, sighash.to_byte_array(), key), key);
                }
                AddressType::NestedSegwit => {
                    let redeem = redeem_script(key);
                    let sighash = cache
                        .p2wpkh_signature_hash(i, &redeem, prevout.value, EcdsaSighashType::All)
                        .map_err(signing_error)?;
                    tx.input[i].script_sig = Builder::new().push_slice(push_bytes(redeem.to_bytes())?).into_script();
                    tx.input[i].witness = p2wpkh_witness(ecdsa_sig(secp, sighash.to_byte_array(), key), key);
                }
                AddressType::Taproot => {
                    let sighash = cache
                        .taproot_key_spend_signature_hash(i, &Prevouts::All(&prevouts[..]), TapSighashType::Default)
                        .map_err(signing_error)?;
                    let keypair = Keypair::from_secret_key(secp, &key.private_key).tap_tweak(secp, None).to_inner();
                    let signature = secp.sign_schnorr_no_aux_rand(&Message::from_digest(sighash.to_byte_array()), &keypair);
                    let mut witness = Witness::new();
                    witness.push(signature.serialize());
                    tx.input[i].witness = witness;
                }
            }
        }

        let txid = Txid::from(tx.compute_txid());
        debug!(wallet = wallet.name(), %txid, inputs = tx.input.len(), "transaction signed");
        Ok(SignedTransaction { plan, tx, txid })
    }

    /// The key for `address`, found through its stored derivation path and
    /// otherwise by searching every index the wallet has issued.
    fn signing_key(&self, wallet: &UnlockedWallet, address: &str) -> Result<DerivedKey, WalletError> {
        let (network, address_type) = (wallet.network(), wallet.address_type());
        if let Some(record) = self.store.get_address(address)?.filter(|r| r.wallet == wallet.record.name) {
            let key = self.engine.derive_at(wallet.seed(), network, &record.path)?;
            if key.address(network, address_type).ok().as_deref() == Some(address) {
                return Ok(key);
            }
            warn!(wallet = wallet.name(), address, path = %record.path, "stored path does not reproduce address");
        }
        self.engine
            .find_key_for_address(wallet.seed(), network, address_type, address, wallet.record.next_index)?
            .ok_or_else(|| {
                WalletError::Signing(format!(
                    "no index below {} of wallet {} reproduces {address}",
                    wallet.record.next_index,
                    wallet.name()
                ))
            })
    }

    /// Submit `signed` and, only once accepted, persist its effects.
    pub fn broadcast(
        &self,
        chain: &dyn ChainBackend,
        wallet: &WalletRecord,
        signed: &SignedTransaction,
    ) -> Result<TransactionRecord, WalletError> {
        let plan = &signed.plan;
        let txid = chain.broadcast(&signed.serialize()).map_err(|e| match e {
            ChainError::ConnectionRefused { endpoint } => WalletError::NodeUnreachable { endpoint },
            ChainError::Rejected(reason) => WalletError::Broadcast(reason),
            other => WalletError::Broadcast(other.to_string()),
        })?;
        if txid != signed.txid {
            warn!(local = %signed.txid, remote = %txid, "chain source reported a different txid");
        }

        let mut sources: Vec<String> = Vec::new();
        for u in &plan.inputs {
            if !sources.contains(&u.address) {
                sources.push(u.address.clone());
            }
        }
        let record = TransactionRecord {
            txid,
            wallet: plan.wallet.clone(),
            kind: plan.kind,
            timestamp: now_secs(),
            amount: plan.amount,
            fee: plan.fee,
            memo: plan.memo.clone(),
            sources,
            destinations: vec![plan.destination.clone()],
            change_address: plan.change.as_ref().map(|c| c.address.clone()),
            status: TxStatus::Pending,
        };

        let mut extra = vec![StoreOp::PutTransaction(record.clone())];
        if !plan.new_addresses.is_empty() {
            let mut updated = wallet.clone();
            for addr in &plan.new_addresses {
                updated.addresses.push(addr.address.clone());
                updated.next_index = updated.next_index.max(addr.index + 1);
                extra.push(StoreOp::PutAddress(addr.clone()));
            }
            extra.push(StoreOp::PutWallet(updated));
        }
        if plan.kind == TransactionKind::Freeze {
            let frozen = Utxo {
                outpoint: OutPoint::new(txid, plan.payment_vout),
                amount: plan.amount,
                address: plan.destination.clone(),
                wallet: plan.wallet.clone(),
                state: UtxoState::Frozen,
                memo: plan.memo.clone(),
                confirmations: 0,
                coinbase: false,
                locked_by: None,
                spent_by: None,
                updated_at: now_secs(),
            };
            extra.extend(plan_upsert(None, frozen, "freeze").1);
        }

        let inputs: Vec<OutPoint> = plan.inputs.iter().map(|u| u.outpoint).collect();
        self.utxos.commit_spend(&inputs, txid, extra).inspect_err(|e| {
            warn!(%txid, error = %e, "transaction broadcast but not recorded; a rescan will reconcile inputs");
        })?;

        info!(
            wallet = %plan.wallet,
            %txid,
            kind = ?plan.kind,
            amount = plan.amount,
            fee = plan.fee,
            inputs = inputs.len(),
            "transaction broadcast"
        );
        Ok(record)
    }
}

/// Poll until `txid` has at least one confirmation or `timeout` elapses.
///
/// A zero timeout checks once. Returns `false` on timeout; nothing is
/// rolled back. An unreachable chain source is an error; other query
/// failures (e.g. not yet indexed) count as unconfirmed.
pub fn wait_for_confirmation(
    chain: &dyn ChainBackend,
    txid: &Txid,
    poll: Duration,
    timeout: Duration,
) -> Result<bool, WalletError> {
    let started = Instant::now();
    loop {
        match chain.confirmations(txid) {
            Ok(n) if n >= 1 => {
                debug!(%txid, confirmations = n, "transaction confirmed");
                return Ok(true);
            }
            Ok(_) => {}
            Err(e) if e.is_connection_refused() => return Err(e.into()),
            Err(e) => debug!(%txid, error = %e, "confirmation check failed"),
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            info!(%txid, waited_secs = elapsed.as_secs(), "confirmation wait timed out");
            return Ok(false);
        }
        std::thread::sleep(poll.min(timeout - elapsed));
    }
}

/// Trim and bound a memo. Empty memos become `None`.
pub fn normalize_memo(memo: Option<&str>) -> Result<Option<String>, WalletError> {
    match memo.map(str::trim) {
        None | Some("") => Ok(None),
        Some(m) if m.len() > MAX_MEMO_BYTES => Err(WalletError::InvalidMemo(format!(
            "memo is {} bytes, limit is {MAX_MEMO_BYTES}",
            m.len()
        ))),
        Some(m) => Ok(Some(m.to_string())),
    }
}

fn check_amount(amount: u64) -> Result<(), WalletError> {
    if amount < DUST_LIMIT {
        return Err(WalletError::InvalidAmount(format!("{amount} sat is below the {DUST_LIMIT} sat dust limit")));
    }
    Ok(())
}

/// Output script for `address`, which must belong to `network`.
pub fn script_for(address: &str, network: Network) -> Result<ScriptBuf, WalletError> {
    let (found, address_type) = AddressCodec::classify(address)?;
    if found != AddressCodec::classified_network(network, address_type) {
        return Err(WalletError::InvalidAddress(format!("{address} is a {found} address, wallet is on {network}")));
    }
    let parsed = bitcoin::Address::from_str(address)
        .map_err(|e| WalletError::InvalidAddress(format!("{address}: {e}")))?
        .require_network(network.to_bitcoin())
        .map_err(|e| WalletError::InvalidAddress(format!("{address}: {e}")))?;
    Ok(parsed.script_pubkey())
}

fn unsigned_tx(inputs: &[Utxo], output: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|u| TxIn {
                previous_output: bitcoin::OutPoint { txid: u.outpoint.txid.into(), vout: u.outpoint.vout },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output,
    }
}

fn op_return(memo: &str) -> Result<ScriptBuf, WalletError> {
    Ok(ScriptBuf::new_op_return(push_bytes(memo.as_bytes().to_vec())?))
}

fn push_bytes(bytes: Vec<u8>) -> Result<PushBytesBuf, WalletError> {
    PushBytesBuf::try_from(bytes).map_err(|e| WalletError::Signing(e.to_string()))
}

fn redeem_script(key: &DerivedKey) -> ScriptBuf {
    let key_hash = hash160::Hash::hash(&key.public_key.serialize()).to_byte_array();
    ScriptBuf::from_bytes(p2wpkh_redeem_script(&key_hash))
}

/// DER signature with the SIGHASH_ALL byte appended.
fn ecdsa_sig(secp: &bitcoin::secp256k1::Secp256k1<bitcoin::secp256k1::All>, digest: [u8; 32], key: &DerivedKey) -> Vec<u8> {
    let signature = secp.sign_ecdsa(&Message::from_digest(digest), &key.private_key);
    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(EcdsaSighashType::All.to_u32() as u8);
    bytes
}

fn p2wpkh_witness(sig: Vec<u8>, key: &DerivedKey) -> Witness {
    let mut witness = Witness::new();
    witness.push(sig);
    witness.push(key.public_key.serialize());
    witness
}

fn signing_error(err: impl std::fmt::Display) -> WalletError {
    WalletError::Signing(err.to_string())
}
