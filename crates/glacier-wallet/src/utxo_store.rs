//! UTXO state machine over a [`WalletStore`].
//!
//! ```text
//!            lock                      freeze
//!  UNSPENT ◀──────▶ LOCKED     UNSPENT/LOCKED ─────▶ FROZEN
//!     │     unlock    │                             │  unfreeze
//!     │  mark_spent   │ mark_spent                  ▼
//!     └──────▶ SPENT ◀┘                          UNSPENT
//! ```
//!
//! A FROZEN entry is never replaced by a non-frozen upsert, never removed,
//! and never offered to coin selection. Every transition appends a
//! [`UtxoTransition`] in the same commit as the state change.

use std::collections::BTreeMap;
use std::sync::Arc;

use glacier_core::types::{now_secs, OutPoint, ScannedOutput, Txid, Utxo, UtxoState, UtxoTransition};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::coin_selection::{CoinSelection, CoinSelector};
use crate::error::WalletError;
use crate::fee::FeeModel;
use crate::store::{StoreOp, WalletStore};

/// What [`UtxoStore::upsert`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// The stored entry is FROZEN and the incoming one is not.
    RejectedFrozen,
    /// The stored entry is SPENT and the incoming one would revive it.
    RejectedSpent,
}

/// What [`UtxoStore::remove`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    Removed,
    Absent,
    /// FROZEN entries are not removable; nothing changed.
    KeptFrozen,
}

/// Effect of applying one chain scan to a wallet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub discovered: usize,
    pub refreshed: usize,
    /// UNSPENT/LOCKED entries the scan no longer reports.
    pub removed: usize,
    /// SPENT entries the scan no longer reports.
    pub pruned_spent: usize,
    pub frozen_kept: usize,
    /// Outputs already tracked by another wallet; left untouched.
    pub foreign: usize,
}

/// Query and transition operations on tracked UTXOs.
pub struct UtxoStore {
    store: Arc<dyn WalletStore>,
    /// Serializes read-check-commit sequences.
    write: Mutex<()>,
}

impl UtxoStore {
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self { store, write: Mutex::new(()) }
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, WalletError> {
        self.store.get_utxo(outpoint)
    }

    fn require(&self, outpoint: &OutPoint) -> Result<Utxo, WalletError> {
        self.store
            .get_utxo(outpoint)?
            .ok_or_else(|| WalletError::UtxoNotFound(outpoint.to_string()))
    }

    /// Insert or replace by outpoint. A FROZEN entry is only replaced by
    /// another FROZEN entry.
    pub fn upsert(&self, utxo: Utxo) -> Result<UpsertOutcome, WalletError> {
        let _guard = self.write.lock();
        let existing = self.store.get_utxo(&utxo.outpoint)?;
        let (outcome, ops) = plan_upsert(existing.as_ref(), utxo, "upsert");
        if !ops.is_empty() {
            self.store.commit(ops)?;
        }
        Ok(outcome)
    }

    /// Pin an entry out of the spendable pool, attaching `memo`.
    ///
    /// Freezing an already FROZEN entry overwrites its memo.
    pub fn freeze(&self, outpoint: &OutPoint, memo: Option<String>) -> Result<Utxo, WalletError> {
        let _guard = self.write.lock();
        let current = self.require(outpoint)?;
        if current.state == UtxoState::Spent {
            return Err(WalletError::StateViolation(format!("{outpoint} is spent and cannot be frozen")));
        }
        let mut next = current.clone();
        next.state = UtxoState::Frozen;
        next.memo = memo;
        next.locked_by = None;
        self.apply(&current, next, "freeze")
    }

    /// Return a FROZEN entry to UNSPENT. The memo is kept.
    pub fn unfreeze(&self, outpoint: &OutPoint) -> Result<Utxo, WalletError> {
        let _guard = self.write.lock();
        let current = self.require(outpoint)?;
        if current.state != UtxoState::Frozen {
            return Err(WalletError::StateViolation(format!(
                "{outpoint} is {} and cannot be unfrozen",
                current.state
            )));
        }
        let mut next = current.clone();
        next.state = UtxoState::Unspent;
        self.apply(&current, next, "unfreeze")
    }

    /// UNSPENT or LOCKED to SPENT.
    pub fn mark_spent(&self, outpoint: &OutPoint, spending_txid: Txid) -> Result<Utxo, WalletError> {
        let _guard = self.write.lock();
        let current = self.require(outpoint)?;
        let next = spent(&current, spending_txid)?;
        self.apply(&current, next, "spent")
    }

    /// Reserve an UNSPENT entry for `owner`.
    pub fn lock(&self, outpoint: &OutPoint, owner: &str) -> Result<Utxo, WalletError> {
        let _guard = self.write.lock();
        let current = self.require(outpoint)?;
        if current.state != UtxoState::Unspent {
            return Err(WalletError::StateViolation(format!(
                "{outpoint} is {} and cannot be locked",
                current.state
            )));
        }
        let mut next = current.clone();
        next.state = UtxoState::Locked;
        next.locked_by = Some(owner.to_string());
        self.apply(&current, next, "lock")
    }

    pub fn unlock(&self, outpoint: &OutPoint) -> Result<Utxo, WalletError> {
        let _guard = self.write.lock();
        let current = self.require(outpoint)?;
        if current.state != UtxoState::Locked {
            return Err(WalletError::StateViolation(format!(
                "{outpoint} is {} and cannot be unlocked",
                current.state
            )));
        }
        let mut next = current.clone();
        next.state = UtxoState::Unspent;
        next.locked_by = None;
        self.apply(&current, next, "unlock")
    }

    /// Delete an entry. Removing a FROZEN entry is a logged no-op.
    pub fn remove(&self, outpoint: &OutPoint) -> Result<Removal, WalletError> {
        let _guard = self.write.lock();
        match self.store.get_utxo(outpoint)? {
            None => Ok(Removal::Absent),
            Some(u) if u.state == UtxoState::Frozen => {
                warn!(%outpoint, wallet = %u.wallet, "refusing to remove frozen utxo");
                Ok(Removal::KeptFrozen)
            }
            Some(u) => {
                self.store.commit(removal_ops(&u, "removed"))?;
                debug!(%outpoint, wallet = %u.wallet, "utxo removed");
                Ok(Removal::Removed)
            }
        }
    }

    /// Entries of `wallet` in every state, optionally without FROZEN ones.
    pub fn list(&self, wallet: &str, include_frozen: bool) -> Result<Vec<Utxo>, WalletError> {
        let mut utxos = self.store.utxos_for_wallet(wallet)?;
        if !include_frozen {
            utxos.retain(|u| u.state != UtxoState::Frozen);
        }
        Ok(utxos)
    }

    /// Coin selection over the wallet's spendable entries.
    pub fn select(&self, wallet: &str, target: u64, model: &FeeModel) -> Result<CoinSelection, WalletError> {
        CoinSelector::select(&self.store.utxos_for_wallet(wallet)?, target, model)
    }

    /// Remove every UNSPENT and LOCKED entry of `wallet`. FROZEN and SPENT
    /// entries stay. Returns the number removed.
    pub fn clear_unfrozen(&self, wallet: &str) -> Result<usize, WalletError> {
        let _guard = self.write.lock();
        let doomed: Vec<Utxo> = self
            .store
            .utxos_for_wallet(wallet)?
            .into_iter()
            .filter(|u| matches!(u.state, UtxoState::Unspent | UtxoState::Locked))
            .collect();
        let ops: Vec<StoreOp> = doomed.iter().flat_map(|u| removal_ops(u, "cleared")).collect();
        if !ops.is_empty() {
            self.store.commit(ops)?;
        }
        Ok(doomed.len())
    }

    /// Replace the wallet's spendable set with a complete chain scan, in
    /// one commit.
    ///
    /// Equivalent to [`clear_unfrozen`](Self::clear_unfrozen) followed by an
    /// upsert of every scanned output, except that entries the scan still
    /// reports keep their LOCKED reservation, and SPENT entries the scan no
    /// longer reports are pruned. FROZEN entries only have their
    /// confirmation count refreshed.
    pub fn apply_scan(&self, wallet: &str, scanned: Vec<ScannedOutput>) -> Result<ScanReport, WalletError> {
        let _guard = self.write.lock();
        let mut scanned: BTreeMap<OutPoint, ScannedOutput> =
            scanned.into_iter().map(|s| (s.outpoint, s)).collect();
        let mut report = ScanReport::default();
        let mut ops = Vec::new();
        let now = now_secs();

        for existing in self.store.utxos_for_wallet(wallet)? {
            let fresh = scanned.remove(&existing.outpoint);
            match (existing.state, fresh) {
                (UtxoState::Frozen, fresh) => {
                    report.frozen_kept += 1;
                    if let Some(fresh) = fresh.filter(|f| f.confirmations != existing.confirmations) {
                        let mut next = existing.clone();
                        next.confirmations = fresh.confirmations;
                        next.updated_at = now;
                        ops.push(StoreOp::PutUtxo(next));
                    }
                }
                (UtxoState::Spent, Some(_)) => {}
                (UtxoState::Spent, None) => {
                    report.pruned_spent += 1;
                    ops.extend(removal_ops(&existing, "spend confirmed"));
                }
                (UtxoState::Unspent | UtxoState::Locked, Some(fresh)) => {
                    report.refreshed += 1;
                    let mut next = existing.clone();
                    next.amount = fresh.amount;
                    next.address = fresh.address;
                    next.confirmations = fresh.confirmations;
                    next.coinbase = fresh.coinbase;
                    next.updated_at = now;
                    if next != existing {
                        ops.push(StoreOp::PutUtxo(next));
                    }
                }
                (UtxoState::Unspent | UtxoState::Locked, None) => {
                    report.removed += 1;
                    ops.extend(removal_ops(&existing, "no longer reported"));
                }
            }
        }

        for fresh in scanned.into_values() {
            let existing = self.store.get_utxo(&fresh.outpoint)?;
            if let Some(owner) = existing.as_ref().filter(|e| e.wallet != wallet) {
                warn!(
                    outpoint = %fresh.outpoint,
                    wallet,
                    owner = %owner.wallet,
                    "scanned output belongs to another wallet"
                );
                report.foreign += 1;
                continue;
            }
            report.discovered += 1;
            let (_, insert) = plan_upsert(existing.as_ref(), Utxo::discovered(wallet, &fresh), "discovered");
            ops.extend(insert);
        }

        if !ops.is_empty() {
            self.store.commit(ops)?;
        }
        info!(
            wallet,
            discovered = report.discovered,
            refreshed = report.refreshed,
            removed = report.removed,
            frozen = report.frozen_kept,
            "scan applied"
        );
        Ok(report)
    }

    /// State history of one outpoint, oldest first.
    pub fn history(&self, outpoint: &OutPoint) -> Result<Vec<UtxoTransition>, WalletError> {
        self.store.utxo_history(outpoint)
    }

    /// Mark `inputs` SPENT by `spending_txid` and apply `extra` in the same
    /// commit. Fails without writing if any input is not spendable.
    pub fn commit_spend(
        &self,
        inputs: &[OutPoint],
        spending_txid: Txid,
        extra: Vec<StoreOp>,
    ) -> Result<(), WalletError> {
        let _guard = self.write.lock();
        let mut ops = Vec::with_capacity(inputs.len() * 2 + extra.len());
        for outpoint in inputs {
            let current = self.require(outpoint)?;
            let next = spent(&current, spending_txid)?;
            ops.extend(transition_ops(&current, next, "spent"));
        }
        ops.extend(extra);
        self.store.commit(ops)
    }

    fn apply(&self, current: &Utxo, next: Utxo, reason: &str) -> Result<Utxo, WalletError> {
        let ops = transition_ops(current, next.clone(), reason);
        self.store.commit(ops)?;
        debug!(outpoint = %next.outpoint, from = %current.state, to = %next.state, reason, "utxo transition");
        Ok(next)
    }
}

fn spent(current: &Utxo, spending_txid: Txid) -> Result<Utxo, WalletError> {
    match current.state {
        UtxoState::Unspent | UtxoState::Locked => {
            let mut next = current.clone();
            next.state = UtxoState::Spent;
            next.locked_by = None;
            next.spent_by = Some(spending_txid);
            Ok(next)
        }
        other => Err(WalletError::StateViolation(format!(
            "{} is {other} and cannot be spent",
            current.outpoint
        ))),
    }
}

/// Put plus history entry for a state change.
fn transition_ops(current: &Utxo, mut next: Utxo, reason: &str) -> Vec<StoreOp> {
    next.updated_at = now_secs();
    let transition = UtxoTransition {
        outpoint: next.outpoint,
        wallet: next.wallet.clone(),
        from: Some(current.state),
        to: Some(next.state),
        reason: reason.to_string(),
        at: next.updated_at,
    };
    vec![StoreOp::PutUtxo(next), StoreOp::AppendHistory(transition)]
}

/// Ops for inserting `incoming` over `existing`, or none if rejected.
pub(crate) fn plan_upsert(existing: Option<&Utxo>, incoming: Utxo, reason: &str) -> (UpsertOutcome, Vec<StoreOp>) {
    let outcome = match existing {
        None => UpsertOutcome::Inserted,
        Some(e) if e.state == UtxoState::Frozen && incoming.state != UtxoState::Frozen => {
            debug!(outpoint = %e.outpoint, "upsert rejected: stored entry is frozen");
            return (UpsertOutcome::RejectedFrozen, Vec::new());
        }
        Some(e) if e.state == UtxoState::Spent && incoming.state != UtxoState::Spent => {
            debug!(outpoint = %e.outpoint, "upsert rejected: stored entry is spent");
            return (UpsertOutcome::RejectedSpent, Vec::new());
        }
        Some(_) => UpsertOutcome::Replaced,
    };

    let from = existing.map(|e| e.state);
    let mut ops = Vec::with_capacity(2);
    if from != Some(incoming.state) {
        ops.push(StoreOp::AppendHistory(UtxoTransition {
            outpoint: incoming.outpoint,
            wallet: incoming.wallet.clone(),
            from,
            to: Some(incoming.state),
            reason: reason.to_string(),
            at: now_secs(),
        }));
    }
    ops.insert(0, StoreOp::PutUtxo(incoming));
    (outcome, ops)
}

fn removal_ops(utxo: &Utxo, reason: &str) -> Vec<StoreOp> {
    vec![
        StoreOp::DeleteUtxo(utxo.outpoint),
        StoreOp::AppendHistory(UtxoTransition {
            outpoint: utxo.outpoint,
            wallet: utxo.wallet.clone(),
            from: Some(utxo.state),
            to: None,
            reason: reason.to_string(),
            at: now_secs(),
        }),
    ]
}
