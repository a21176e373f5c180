//! Wallet lifecycle against the in-process regtest chain: spends confirm
//! and reconcile, state survives reopening the store, failures leave no
//! partial writes.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use glacier_core::error::ChainError;
use glacier_core::types::{AddressType, Network, TransactionKind, TxStatus, UtxoState};
use glacier_tests::helpers::*;
use glacier_wallet::{ErrorKind, KeyStatus, WalletError};

#[test]
fn send_confirms_and_change_comes_back() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    chain.fund(&record.addresses[0], 100_000);
    manager.get_balance("w").unwrap();

    let dest = external_address(7, AddressType::Segwit);
    let tx = manager.send("w", &dest, 30_000, Some("invoice 17"), Some(2)).unwrap();
    assert_eq!(tx.kind, TransactionKind::Send);
    assert_eq!(tx.status, TxStatus::Pending);
    assert_eq!(tx.memo.as_deref(), Some("invoice 17"));
    let change = tx.change_address.clone().unwrap();
    assert_eq!(manager.get_wallet("w").unwrap().addresses[1], change);

    let outputs = chain.outputs(&tx.txid).unwrap();
    assert!(outputs.iter().any(|o| o.address.as_deref() == Some(dest.as_str()) && o.amount == 30_000));
    assert!(outputs.iter().any(|o| o.address.is_none() && o.amount == 0), "memo output");

    chain.mine();
    let balance = manager.get_balance("w").unwrap();
    assert_eq!(balance.total_spendable, 100_000 - 30_000 - tx.fee);
    assert_eq!(balance.per_address[&change], 100_000 - 30_000 - tx.fee);
    assert_eq!(balance.per_address[&record.addresses[0]], 0);
    assert_eq!(manager.transactions("w").unwrap()[0].status, TxStatus::Confirmed);

    // The spent input is gone once the chain stops reporting it.
    assert!(manager.get_utxos("w", true).unwrap().iter().all(|u| u.state == UtxoState::Unspent));
}

#[test]
fn spent_inputs_are_not_reused_before_confirmation() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::NestedSegwit, 1).unwrap();
    chain.fund(&record.addresses[0], 50_000);
    manager.get_balance("w").unwrap();

    let dest = external_address(8, AddressType::Legacy);
    manager.send("w", &dest, 20_000, None, Some(1)).unwrap();
    // Change is unconfirmed and the only coin is SPENT locally.
    let err = manager.send("w", &dest, 20_000, None, Some(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    assert_eq!(chain.mempool_len(), 1);

    // A refresh while the spend is unmined keeps the coin SPENT.
    manager.rescan("w").unwrap();
    assert!(matches!(manager.send("w", &dest, 20_000, None, Some(1)), Err(WalletError::InsufficientFunds { .. })));
}

#[test]
fn every_address_type_spends() {
    for (i, address_type) in AddressType::ALL.into_iter().enumerate() {
        let (manager, chain, _dir) = setup();
        let record = manager.restore_wallet("w", ABANDON, Network::Regtest, address_type, 2).unwrap();
        chain.fund(&record.addresses[0], 40_000);
        chain.fund(&record.addresses[1], 40_000);
        manager.get_balance("w").unwrap();

        let tx = manager
            .send("w", &external_address(20 + i as u8, AddressType::Taproot), 60_000, None, Some(3))
            .unwrap();
        assert_eq!(tx.sources.len(), 2, "{address_type}");
        let vsize = chain.vsize(&tx.txid).unwrap();
        assert!(tx.fee >= 3 * vsize, "{address_type}: fee {} for {vsize} vbytes", tx.fee);
        chain.mine();
        assert_eq!(manager.get_balance("w").unwrap().total_spendable, 80_000 - 60_000 - tx.fee, "{address_type}");
    }
}

#[test]
fn consolidation_merges_in_batches() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 3).unwrap();
    for (i, amount) in [10_000u64, 20_000, 30_000, 40_000, 50_000].into_iter().enumerate() {
        chain.fund(&record.addresses[i % 3], amount);
    }
    manager.get_balance("w").unwrap();

    let first = manager.consolidate("w", Some(1), Some(3)).unwrap();
    assert_eq!(first.inputs, 3);
    assert_eq!(first.amount + first.fee, 120_000);
    chain.mine();
    manager.get_balance("w").unwrap();
    assert_eq!(manager.get_utxos("w", false).unwrap().len(), 3);

    let second = manager.consolidate("w", Some(1), None).unwrap();
    assert_eq!(second.inputs, 3);
    chain.mine();
    let balance = manager.get_balance("w").unwrap();
    assert_eq!(balance.total_spendable, 150_000 - first.fee - second.fee);
    assert_eq!(manager.get_utxos("w", false).unwrap().len(), 1);

    let kinds: Vec<_> = manager.transactions("w").unwrap().into_iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![TransactionKind::Consolidation, TransactionKind::Consolidation]);
}

#[test]
fn immature_coinbase_waits_for_maturity() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    chain.fund_coinbase(&record.addresses[0], 5_000_000_000);

    let balance = manager.get_balance("w").unwrap();
    assert_eq!(balance.total_spendable, 0);
    assert_eq!(balance.immature, 5_000_000_000);
    let dest = external_address(9, AddressType::Segwit);
    assert!(matches!(
        manager.send("w", &dest, 1_000_000, None, Some(1)),
        Err(WalletError::InsufficientFunds { available: 0, .. })
    ));

    chain.mine_blocks(99);
    assert_eq!(manager.get_balance("w").unwrap().total_spendable, 5_000_000_000);
    manager.send("w", &dest, 1_000_000, None, Some(1)).unwrap();
}

#[test]
fn locked_coins_sit_out_selection() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    let reserved = chain.fund(&record.addresses[0], 60_000);
    chain.fund(&record.addresses[0], 50_000);
    manager.get_balance("w").unwrap();
    manager.lock_utxo("w", &reserved, "psbt-session-1").unwrap();

    let dest = external_address(10, AddressType::Segwit);
    assert!(matches!(
        manager.send("w", &dest, 55_000, None, Some(1)),
        Err(WalletError::InsufficientFunds { available: 50_000, .. })
    ));
    // The reservation survives a refresh.
    assert_eq!(manager.get_balance("w").unwrap().locked, 60_000);

    manager.unlock_utxo("w", &reserved).unwrap();
    manager.send("w", &dest, 55_000, None, Some(1)).unwrap();
    let history: Vec<_> = manager.utxo_history("w", &reserved).unwrap().into_iter().map(|h| h.to).collect();
    assert_eq!(history.first(), Some(&Some(UtxoState::Unspent)));
    assert!(history.contains(&Some(UtxoState::Locked)));
}

#[test]
fn failed_broadcast_changes_nothing() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    chain.fund(&record.addresses[0], 100_000);
    manager.get_balance("w").unwrap();
    let utxos = manager.get_utxos("w", true).unwrap();
    let wallet = manager.get_wallet("w").unwrap();

    chain.fail_broadcasts(Some(ChainError::Rejected("min relay fee not met".into())));
    let dest = external_address(11, AddressType::Segwit);
    let err = manager.send("w", &dest, 10_000, None, Some(1)).unwrap_err();
    assert_eq!(err, WalletError::Broadcast("min relay fee not met".into()));
    let err = manager.freeze("w", 10_000, Some("x"), Some(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Broadcast);

    assert_eq!(manager.get_utxos("w", true).unwrap(), utxos);
    assert_eq!(manager.get_wallet("w").unwrap(), wallet);
    assert!(manager.transactions("w").unwrap().is_empty());

    chain.fail_broadcasts(None);
    manager.send("w", &dest, 10_000, None, Some(1)).unwrap();
}

#[test]
fn stopped_node_is_reported_as_unreachable() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    chain.fund(&record.addresses[0], 100_000);
    manager.get_balance("w").unwrap();
    let utxos = manager.get_utxos("w", true).unwrap();

    chain.set_offline(true);
    let err = manager.get_balance("w").unwrap_err();
    assert_eq!(err, WalletError::NodeUnreachable { endpoint: "127.0.0.1:18443".into() });
    assert!(err.to_string().contains("check that bitcoind"));

    let dest = external_address(12, AddressType::Segwit);
    assert_eq!(manager.send("w", &dest, 10_000, None, None).unwrap_err().kind(), ErrorKind::NodeUnreachable);
    assert_eq!(manager.send("w", &dest, 10_000, None, Some(1)).unwrap_err().kind(), ErrorKind::NodeUnreachable);
    assert_eq!(manager.get_utxos("w", true).unwrap(), utxos);
}

#[test]
fn fee_estimate_is_used_when_no_rate_given() {
    let (manager, chain, _dir) = setup();
    let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    chain.fund(&record.addresses[0], 1_000_000);
    manager.get_balance("w").unwrap();
    let dest = external_address(13, AddressType::Segwit);

    chain.set_fee_rate(Some(4));
    let estimated = manager.send("w", &dest, 10_000, None, None).unwrap();
    chain.mine();
    manager.get_balance("w").unwrap();

    chain.set_fee_rate(None);
    let fallback = manager.send("w", &dest, 10_000, None, None).unwrap();
    // Same shape: one input, payment and change.
    assert_eq!(estimated.fee, 4 * 141);
    assert_eq!(fallback.fee, manager.config().default_fee_rate * 141);
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(RegtestChain::new());
    let frozen = {
        let manager = open_manager(dir.path(), chain.clone());
        assert_eq!(manager.key_status(), KeyStatus::Created);
        let record = manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
        let op = chain.fund(&record.addresses[0], 80_000);
        manager.get_balance("w").unwrap();
        manager.freeze_existing("w", &op, Some("kept across restarts")).unwrap();
        op
    };

    let manager = open_manager(dir.path(), chain);
    assert_eq!(manager.key_status(), KeyStatus::Loaded);
    let utxo = manager.get_utxos("w", true).unwrap().into_iter().find(|u| u.outpoint == frozen).unwrap();
    assert_eq!(utxo.state, UtxoState::Frozen);
    assert_eq!(utxo.memo.as_deref(), Some("kept across restarts"));
    // The seed still decrypts.
    assert_eq!(manager.generate_address("w").unwrap().index, 1);
}

#[test]
fn regenerated_key_cannot_read_old_seeds() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(RegtestChain::new());
    {
        let manager = open_manager(dir.path(), chain.clone());
        manager.restore_wallet("old", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
        std::fs::write(manager.config().key_path(), "not a key").unwrap();
    }

    let manager = open_manager(dir.path(), chain);
    assert_eq!(manager.key_status(), KeyStatus::Regenerated);
    assert_eq!(manager.generate_address("old").unwrap_err().kind(), ErrorKind::Encryption);
    // Records stay readable and the wallet can be restored under a new name.
    assert_eq!(manager.get_wallet("old").unwrap().addresses.len(), 1);
    let restored = manager.restore_wallet("new", ABANDON, Network::Regtest, AddressType::Legacy, 1).unwrap();
    assert_eq!(restored.addresses.len(), 1);
}

#[test]
fn delete_wallet_leaves_others_alone() {
    let (manager, chain, _dir) = setup();
    let a = manager.restore_wallet("a", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    let b = manager.create_wallet("b", Network::Regtest, AddressType::Taproot, 1).unwrap().record;
    let a_coin = chain.fund(&a.addresses[0], 40_000);
    chain.fund(&b.addresses[0], 40_000);
    manager.get_balance("a").unwrap();
    manager.get_balance("b").unwrap();
    manager.freeze_existing("a", &a_coin, Some("pinned")).unwrap();

    manager.delete_wallet("a").unwrap();
    assert_eq!(manager.get_wallet("a").unwrap_err().kind(), ErrorKind::NotFound);
    assert!(manager.utxo_history("b", &a_coin).is_err());
    assert_eq!(manager.list_wallets().unwrap().len(), 1);
    assert_eq!(manager.get_balance("b").unwrap().total_spendable, 40_000);

    // The name is free again.
    manager.restore_wallet("a", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    assert!(manager.get_utxos("a", true).unwrap().is_empty());
}

#[test]
fn same_mnemonic_cannot_take_over_a_frozen_coin() {
    let (manager, chain, _dir) = setup();
    let a = manager.restore_wallet("a", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap();
    let coin = chain.fund(&a.addresses[0], 60_000);
    manager.rescan("a").unwrap();
    manager.freeze_existing("a", &coin, Some("do not spend")).unwrap();

    let err = manager.restore_wallet("b", ABANDON, Network::Regtest, AddressType::Segwit, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert!(err.to_string().contains(&a.addresses[0]));

    // Another address type derives different addresses and is allowed.
    manager.restore_wallet("b", ABANDON, Network::Regtest, AddressType::Taproot, 1).unwrap();
    manager.rescan("b").unwrap();
    assert!(manager.get_utxos("b", true).unwrap().is_empty());
    manager.delete_wallet("b").unwrap();

    let frozen = manager.get_utxos("a", true).unwrap();
    assert_eq!(frozen.len(), 1);
    assert_eq!(frozen[0].state, UtxoState::Frozen);
    assert_eq!(frozen[0].memo.as_deref(), Some("do not spend"));
    assert_eq!(manager.addresses("a").unwrap().len(), 1);
    assert_eq!(manager.utxo_history("a", &coin).unwrap().len(), 2);
}

#[test]
fn rescan_counts_scan_calls_per_address() {
    let (manager, chain, _dir) = setup();
    manager.restore_wallet("w", ABANDON, Network::Regtest, AddressType::Segwit, 4).unwrap();
    manager.rescan("w").unwrap();
    assert_eq!(chain.scan_calls.load(Ordering::SeqCst), 4);
}
