//! Coin selection.
//!
//! Candidates are UNSPENT outputs that are not immature coinbase; LOCKED,
//! FROZEN and SPENT entries never qualify. Two passes:
//!
//! 1. **Single input.** The smallest candidate covering
//!    `target + fee(1 input)` while staying within 1.5× of that requirement.
//!    One input, modest change.
//! 2. **Largest first.** Accumulate candidates in descending amount order,
//!    recomputing the fee for the current input count after each addition,
//!    until the total covers `target + fee`.

use glacier_core::constants::{SINGLE_INPUT_RATIO_DEN, SINGLE_INPUT_RATIO_NUM};
use glacier_core::types::{Utxo, UtxoState};

use crate::error::WalletError;
use crate::fee::FeeModel;

/// Result of coin selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub selected: Vec<Utxo>,
    /// Sum of selected amounts.
    pub total: u64,
    /// Fee for exactly `selected.len()` inputs under the model used.
    pub fee: u64,
}

impl CoinSelection {
    /// What is left after paying `target` and the fee.
    pub fn excess(&self, target: u64) -> u64 {
        self.total.saturating_sub(target).saturating_sub(self.fee)
    }
}

pub struct CoinSelector;

impl CoinSelector {
    /// Select from `utxos` to pay `target` plus fee.
    ///
    /// `utxos` may contain entries in any state; only spendable ones are
    /// considered.
    pub fn select(utxos: &[Utxo], target: u64, model: &FeeModel) -> Result<CoinSelection, WalletError> {
        if target == 0 {
            return Err(WalletError::InvalidAmount("target must be non-zero".into()));
        }

        let mut candidates: Vec<&Utxo> = utxos.iter().filter(|u| u.is_spendable()).collect();
        let available: u64 = candidates.iter().map(|u| u.amount).sum();
        let frozen = frozen_total(utxos);

        let single_required = target.saturating_add(model.fee_for(1));
        let single = candidates
            .iter()
            .filter(|u| {
                u.amount >= single_required
                    && (u.amount as u128) * (SINGLE_INPUT_RATIO_DEN as u128)
                        <= (single_required as u128) * (SINGLE_INPUT_RATIO_NUM as u128)
            })
            .min_by_key(|u| (u.amount, u.outpoint));
        if let Some(utxo) = single {
            tracing::debug!(amount = utxo.amount, target, "coin selection: single input");
            return Ok(CoinSelection { selected: vec![(*utxo).clone()], total: utxo.amount, fee: model.fee_for(1) });
        }

        candidates.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.outpoint.cmp(&b.outpoint)));
        let mut selected = Vec::new();
        let mut total: u64 = 0;
        for utxo in candidates {
            selected.push(utxo.clone());
            total = total.saturating_add(utxo.amount);
            let fee = model.fee_for(selected.len());
            if total >= target.saturating_add(fee) {
                tracing::debug!(inputs = selected.len(), total, fee, target, "coin selection: accumulated");
                return Ok(CoinSelection { selected, total, fee });
            }
        }

        Err(WalletError::InsufficientFunds {
            available,
            required: target.saturating_add(model.fee_for(selected.len().max(1))),
            frozen,
        })
    }
}

/// Sum of FROZEN amounts in `utxos`.
pub fn frozen_total(utxos: &[Utxo]) -> u64 {
    utxos.iter().filter(|u| u.state == UtxoState::Frozen).map(|u| u.amount).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::utxo;
    use glacier_core::types::AddressType;
    use proptest::prelude::*;

    fn model() -> FeeModel {
        FeeModel::new(1, AddressType::Segwit, 2)
    }

    fn pool(amounts: &[u64]) -> Vec<Utxo> {
        amounts.iter().enumerate().map(|(i, a)| utxo("w", i as u8 + 1, 0, *a)).collect()
    }

    #[test]
    fn prefers_single_input_within_ratio() {
        // fee(1) = 147, requirement 10_147, ceiling 15_220.
        let utxos = pool(&[5_000, 12_000, 15_000, 40_000]);
        let sel = CoinSelector::select(&utxos, 10_000, &model()).unwrap();
        assert_eq!(sel.selected.len(), 1);
        assert_eq!(sel.total, 12_000);
        assert_eq!(sel.fee, 147);
    }

    #[test]
    fn falls_back_to_largest_first() {
        // 40_000 exceeds 1.5x; nothing else covers alone.
        let utxos = pool(&[6_000, 7_000, 40_000]);
        let sel = CoinSelector::select(&utxos, 10_000, &model()).unwrap();
        assert_eq!(sel.selected.len(), 1);
        assert_eq!(sel.total, 40_000);

        let utxos = pool(&[6_000, 7_000, 3_000]);
        let sel = CoinSelector::select(&utxos, 10_000, &model()).unwrap();
        assert_eq!(sel.selected.iter().map(|u| u.amount).collect::<Vec<_>>(), vec![7_000, 6_000]);
        assert_eq!(sel.fee, model().fee_for(2));
    }

    #[test]
    fn fee_recomputed_per_input() {
        // Two inputs (10_200) fall short of 10_000 + fee(2) = 10_215.
        let utxos = pool(&[5_100, 5_100, 1_000]);
        let sel = CoinSelector::select(&utxos, 10_000, &model()).unwrap();
        assert_eq!(sel.selected.len(), 3);
        assert_eq!(sel.fee, model().fee_for(3));
        assert!(sel.total >= 10_000 + sel.fee);
    }

    #[test]
    fn frozen_locked_and_immature_are_skipped() {
        let mut utxos = pool(&[50_000, 50_000, 50_000, 1_000]);
        utxos[0].state = UtxoState::Frozen;
        utxos[1].state = UtxoState::Locked;
        utxos[2].coinbase = true;
        utxos[2].confirmations = 99;
        let err = CoinSelector::select(&utxos, 10_000, &model()).unwrap_err();
        assert_eq!(
            err,
            WalletError::InsufficientFunds { available: 1_000, required: 10_000 + model().fee_for(1), frozen: 50_000 }
        );

        utxos[2].confirmations = 100;
        let sel = CoinSelector::select(&utxos, 10_000, &model()).unwrap();
        assert_eq!(sel.selected[0].outpoint, utxos[2].outpoint);
    }

    #[test]
    fn empty_pool_is_insufficient() {
        let err = CoinSelector::select(&[], 1_000, &model()).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { available: 0, .. }));
    }

    #[test]
    fn zero_target_rejected() {
        assert!(matches!(
            CoinSelector::select(&pool(&[1_000]), 0, &model()),
            Err(WalletError::InvalidAmount(_))
        ));
    }

    proptest! {
        #[test]
        fn selection_always_sufficient(
            amounts in prop::collection::vec(546u64..5_000_000, 1..40),
            target in 546u64..20_000_000,
            fee_rate in 1u64..200,
            frozen_mask in any::<u64>(),
        ) {
            let mut utxos = pool(&amounts);
            for (i, u) in utxos.iter_mut().enumerate() {
                if frozen_mask & (1 << (i % 64)) != 0 {
                    u.state = UtxoState::Frozen;
                }
            }
            let model = FeeModel::new(fee_rate, AddressType::Segwit, 2);
            match CoinSelector::select(&utxos, target, &model) {
                Ok(sel) => {
                    prop_assert!(!sel.selected.is_empty());
                    prop_assert_eq!(sel.fee, model.fee_for(sel.selected.len()));
                    prop_assert_eq!(sel.total, sel.selected.iter().map(|u| u.amount).sum::<u64>());
                    prop_assert!(sel.total >= target + sel.fee);
                    prop_assert!(sel.selected.iter().all(|u| u.state == UtxoState::Unspent));
                }
                Err(WalletError::InsufficientFunds { available, .. }) => {
                    let spendable: u64 = utxos.iter().filter(|u| u.is_spendable()).map(|u| u.amount).sum();
                    prop_assert_eq!(available, spendable);
                    prop_assert!(spendable < target + model.fee_for(utxos.len()));
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }
}
