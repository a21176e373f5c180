//! Reference scenarios: wallet creation, freezing, spending around frozen
//! coins, consolidation preconditions, rescans and address classification.

use std::sync::atomic::Ordering;

use glacier_core::address::AddressCodec;
use glacier_core::types::{AddressType, Network, UtxoState};
use glacier_tests::helpers::*;
use glacier_wallet::{ErrorKind, WalletError};

#[test]
fn create_regtest_segwit_wallet() {
    let (manager, _chain, _dir) = setup();
    let created = manager.create_wallet("w1", Network::Regtest, AddressType::Segwit, 1).unwrap();

    assert_eq!(created.record.addresses.len(), 1);
    assert!(created.record.addresses[0].starts_with("bcrt1q"));
    assert_eq!(created.record.next_index, 1);
    assert_eq!(
        AddressCodec::classify(&created.record.addresses[0]).unwrap(),
        (Network::Regtest, AddressType::Segwit)
    );
    assert_eq!(manager.list_wallets().unwrap(), vec![created.record]);
}

#[test]
fn freeze_with_memo_is_listed_only_when_asked() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    chain.fund(&record.addresses[0], 100_000);
    assert_eq!(manager.get_balance("w").unwrap().total_spendable, 100_000);

    chain.set_auto_mine(true);
    let receipt = manager.freeze("w", 1_000, Some("Token Mint: ABC"), Some(1)).unwrap();
    assert!(receipt.confirmed);
    assert_eq!(receipt.amount, 1_000);

    let visible = manager.get_utxos("w", false).unwrap();
    assert!(visible.iter().all(|u| u.outpoint != receipt.outpoint));

    let all = manager.get_utxos("w", true).unwrap();
    let frozen = all.iter().find(|u| u.outpoint == receipt.outpoint).unwrap();
    assert_eq!(frozen.state, UtxoState::Frozen);
    assert_eq!(frozen.memo.as_deref(), Some("Token Mint: ABC"));
    assert_eq!(frozen.amount, 1_000);
}

#[test]
fn send_fails_when_only_frozen_coins_would_cover() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    let big = chain.fund(&record.addresses[0], 100_000);
    manager.get_balance("w").unwrap();
    manager.freeze_existing("w", &big, Some("reserved")).unwrap();
    chain.fund(&record.addresses[0], 5_000);

    let balance = manager.get_balance("w").unwrap();
    assert_eq!(balance.total_spendable, 5_000);
    assert_eq!(balance.frozen, 100_000);
    let before = manager.get_utxos("w", true).unwrap();

    let err = manager
        .send("w", &external_address(1, AddressType::Segwit), 50_000, None, Some(1))
        .unwrap_err();
    match err {
        WalletError::InsufficientFunds { available, required, frozen } => {
            assert_eq!(available, 5_000);
            assert_eq!(frozen, 100_000);
            assert!(required > 50_000);
        }
        other => panic!("expected InsufficientFunds, got {other}"),
    }
    assert_eq!(manager.get_utxos("w", true).unwrap(), before);
    assert_eq!(chain.broadcast_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn consolidate_with_one_eligible_output_fails() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 2).unwrap();
    let pinned = chain.fund(&record.addresses[0], 70_000);
    chain.fund(&record.addresses[1], 30_000);
    manager.get_balance("w").unwrap();
    manager.freeze_existing("w", &pinned, None).unwrap();
    let before = manager.get_utxos("w", true).unwrap();

    let err = manager.consolidate("w", Some(1), None).unwrap_err();
    assert_eq!(err, WalletError::ConsolidationTooSmall { eligible: 1 });
    assert!(err.to_string().contains("at least 2"));
    assert_eq!(err.kind(), ErrorKind::StateViolation);
    assert_eq!(manager.get_utxos("w", true).unwrap(), before);
}

#[test]
fn rescan_after_freeze_keeps_memo_and_state() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Taproot, 1).unwrap();
    chain.fund(&record.addresses[0], 250_000);
    manager.get_balance("w").unwrap();
    chain.set_auto_mine(true);
    let receipt = manager.freeze("w", 10_000, Some("ordinal #42"), Some(2)).unwrap();
    let find = |utxos: Vec<glacier_core::types::Utxo>| utxos.into_iter().find(|u| u.outpoint == receipt.outpoint).unwrap();

    let before = find(manager.get_utxos("w", true).unwrap());
    manager.rescan("w").unwrap();
    manager.get_balance("w").unwrap();
    let after = find(manager.get_utxos("w", true).unwrap());

    assert_eq!(after.state, UtxoState::Frozen);
    assert_eq!(after.state, before.state);
    assert_eq!(after.memo, before.memo);
    assert_eq!(after.amount, before.amount);
}

#[test]
fn classify_reference_addresses() {
    let taproot = external_address(3, AddressType::Taproot);
    assert!(taproot.starts_with("bcrt1p"));
    assert_eq!(AddressCodec::classify(&taproot).unwrap(), (Network::Regtest, AddressType::Taproot));
    assert_eq!(
        AddressCodec::classify("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4").unwrap(),
        (Network::Mainnet, AddressType::Segwit)
    );
    assert_eq!(
        AddressCodec::classify("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2").unwrap(),
        (Network::Mainnet, AddressType::Legacy)
    );
}
