//! Single-signature spends end to end: build, sign, broadcast, reconcile.

mod common;

use bitcoin::absolute::LockTime;
use chain_btc::address::parse_address;
use chain_btc::fee::FeeRate;
use chain_btc::network::BtcNetwork;
use chain_btc::psbt::{decode_psbt, finalize, serialize_raw_transaction, summarize};
use chain_btc::transaction::{build_psbt, PsbtInput, PsbtOutput};
use chain_btc::utxo::Keychain;
use chrono::Duration;
use common::*;
use spend_core::error::SpendError;
use spend_core::ledger::{DraftStore, TransactionStore};
use spend_core::selector::Ineligibility;
use spend_core::types::{DraftStatus, LockHolder, TxType};
use spend_core::{ErrorKind, SubmitSignatureRequest};
use uuid::Uuid;

// ─── Building ──────────────────────────────────────────────────────

#[test]
fn one_coin_spend_pays_exact_fee_and_change() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    let coin = fx.fund(&wallet, 0, 80_000, 3);

    let spend = fx
        .service
        .create_spend(wallet.id, &spend_request(RECIPIENT, 50_000, 2))
        .unwrap();

    // 141 vB at 2 sat/vB.
    assert_eq!(spend.fee, 282);
    assert_eq!(spend.change_amount, 29_718);
    assert_eq!(spend.total_input, 80_000);
    assert_eq!(spend.total_output, 79_718);
    assert_eq!(
        spend.change_address.as_deref(),
        Some(wallet.address(Keychain::Internal, 0).as_str())
    );

    let psbt = decode_psbt(&spend.psbt_base64).unwrap();
    assert_eq!(psbt.unsigned_tx.input.len(), 1);
    assert!(psbt.unsigned_tx.input[0].sequence.is_rbf());
    assert_eq!(psbt.unsigned_tx.lock_time, LockTime::from_height(800_000).unwrap());
    assert_eq!(summarize(&psbt).unwrap().fee, 282);

    assert_eq!(spend.input_paths.len(), 1);
    assert_eq!(spend.input_paths[0].outpoint, coin);
    let origin = &spend.input_paths[0].key_origins[0];
    assert_eq!(origin.path, "m/84'/1'/0'/0/0");
    assert_eq!(origin.fingerprint, fingerprint(&wallet.masters[0]));

    // Building alone locks nothing.
    assert!(fx.utxo(coin).lock.is_none());
}

#[test]
fn spend_without_room_for_change_folds_remainder_into_fee() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    fx.fund(&wallet, 0, 50_130, 3);

    // 110 vB with one input and one output; the 20 sat left over is dust.
    let spend = fx
        .service
        .create_spend(wallet.id, &spend_request(RECIPIENT, 50_000, 1))
        .unwrap();
    assert_eq!(spend.fee, 130);
    assert_eq!(spend.change_amount, 0);
    assert!(spend.change_address.is_none());
    assert_eq!(decode_psbt(&spend.psbt_base64).unwrap().unsigned_tx.output.len(), 1);

    let short = Fixture::new();
    let wallet = short.single_sig_wallet("");
    short.fund(&wallet, 0, 50_109, 3);
    assert!(matches!(
        short
            .service
            .create_spend(wallet.id, &spend_request(RECIPIENT, 50_000, 1)),
        Err(SpendError::InsufficientFunds {
            available_sat: 50_109,
            required_sat: 50_110,
            ..
        })
    ));
}

#[test]
fn fee_rate_outside_bounds_is_rejected() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    fx.fund(&wallet, 0, 80_000, 3);

    let mut req = spend_request(RECIPIENT, 50_000, 2);
    req.fee_rate = FeeRate::from_sat_per_vb_f64(0.5).unwrap();
    let err = fx.service.create_spend(wallet.id, &req).unwrap_err();
    assert!(matches!(err, SpendError::FeeTooLow { minimum, .. } if minimum == 1.0));
    assert_eq!(err.kind(), ErrorKind::Validation);

    req.fee_rate = FeeRate::from_sat_per_vb(6_000);
    assert!(matches!(
        fx.service.create_spend(wallet.id, &req),
        Err(SpendError::FeeTooHigh { .. })
    ));
}

#[test]
fn insufficient_funds_explains_ineligible_coins() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    fx.fund(&wallet, 0, 10_000, 3);
    let frozen = fx.fund(&wallet, 1, 20_000, 3);
    fx.ledger.set_frozen(&frozen, true).unwrap();
    fx.fund(&wallet, 2, 5_000, 0);

    let err = fx
        .service
        .create_spend(wallet.id, &spend_request(RECIPIENT, 50_000, 2))
        .unwrap_err();
    match err {
        SpendError::InsufficientFunds {
            available_sat,
            eligible_utxos,
            total_utxos,
            ..
        } => {
            assert_eq!(available_sat, 10_000);
            assert_eq!(eligible_utxos, 1);
            assert_eq!(total_utxos, 3);
        }
        other => panic!("expected InsufficientFunds, got {other:?}"),
    }
}

#[test]
fn explicit_coins_are_checked_individually() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    fx.fund(&wallet, 0, 90_000, 3);
    let frozen = fx.fund(&wallet, 1, 70_000, 3);
    fx.ledger.set_frozen(&frozen, true).unwrap();

    let mut req = spend_request(RECIPIENT, 50_000, 2);
    req.selected_utxo_ids = Some(vec![frozen]);
    let err = fx.service.create_spend(wallet.id, &req).unwrap_err();
    assert!(matches!(
        err,
        SpendError::UtxoNotEligible { outpoint, reason: Ineligibility::Frozen } if outpoint == frozen
    ));

    let unknown = bitcoin::OutPoint::new(random_txid(), 0);
    req.selected_utxo_ids = Some(vec![unknown]);
    assert!(matches!(
        fx.service.create_spend(wallet.id, &req),
        Err(SpendError::UtxoNotFound(o)) if o == unknown
    ));
}

#[test]
fn explicit_coin_is_spent_before_larger_ones() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    fx.fund(&wallet, 0, 500_000, 3);
    let chosen = fx.fund(&wallet, 1, 60_000, 3);

    let mut req = spend_request(RECIPIENT, 50_000, 2);
    req.selected_utxo_ids = Some(vec![chosen]);
    let spend = fx.service.create_spend(wallet.id, &req).unwrap();
    assert_eq!(spend.total_input, 60_000);
    assert_eq!(spend.input_paths[0].outpoint, chosen);
}

#[test]
fn send_max_sweeps_every_eligible_coin() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    fx.fund(&wallet, 0, 30_000, 3);
    fx.fund(&wallet, 1, 20_000, 3);

    let mut req = spend_request(RECIPIENT, 0, 2);
    req.amount = None;
    req.send_max = true;
    let spend = fx.service.create_spend(wallet.id, &req).unwrap();

    // Two inputs, one output: 178 vB.
    assert_eq!(spend.fee, 356);
    assert_eq!(spend.total_output, 49_644);
    assert_eq!(spend.change_amount, 0);
    assert_eq!(spend.change_address, None);
}

#[test]
fn subtract_fees_takes_fee_from_recipient() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    fx.fund(&wallet, 0, 80_000, 3);

    let mut req = spend_request(RECIPIENT, 50_000, 2);
    req.subtract_fees = true;
    let spend = fx.service.create_spend(wallet.id, &req).unwrap();

    assert_eq!(spend.change_amount, 30_000);
    assert_eq!(spend.total_output + spend.fee, 80_000);
    let psbt = decode_psbt(&spend.psbt_base64).unwrap();
    let recipient_script = parse_address(RECIPIENT, BtcNetwork::Testnet)
        .unwrap()
        .script_pubkey();
    let paid = psbt
        .unsigned_tx
        .output
        .iter()
        .find(|o| o.script_pubkey == recipient_script)
        .unwrap();
    assert_eq!(paid.value.to_sat(), 50_000 - spend.fee);
}

#[test]
fn decoy_outputs_split_change_without_losing_value() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    fx.fund(&wallet, 0, 200_000, 3);

    let mut req = spend_request(RECIPIENT, 50_000, 2);
    req.decoy_outputs = Some(2);
    let spend = fx.service.create_spend(wallet.id, &req).unwrap();

    let decoys = spend.decoy_outputs.clone().unwrap();
    assert_eq!(decoys.len(), 2);
    assert!(decoys.iter().all(|d| d.amount >= 546 && d.amount <= spend.change_amount));

    let psbt = decode_psbt(&spend.psbt_base64).unwrap();
    assert_eq!(psbt.unsigned_tx.output.len(), 4);
    assert_eq!(spend.total_output + spend.fee, spend.total_input);

    req.decoy_outputs = Some(4);
    assert!(matches!(
        fx.service.create_spend(wallet.id, &req),
        Err(SpendError::InvalidRequest(_))
    ));
}

#[test]
fn fee_recommendation_stays_within_bounds() {
    let fx = Fixture::new();
    fx.chain.set_fee_estimate(FeeRate::from_sat_per_vb(9_000));
    let rec = fx.service.recommended_fee_rate(2).unwrap();
    assert_eq!(rec.fee_rate, FeeRate::from_sat_per_vb(5_000));

    fx.chain.set_fee_estimate(FeeRate::ZERO);
    let rec = fx.service.recommended_fee_rate(144).unwrap();
    assert_eq!(rec.fee_rate, FeeRate::from_sat_per_vb(1));
}

// ─── Broadcasting ──────────────────────────────────────────────────

#[test]
fn signed_spend_is_broadcast_and_recorded() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    let coin = fx.fund(&wallet, 0, 80_000, 3);

    let spend = fx
        .service
        .create_spend(wallet.id, &spend_request(RECIPIENT, 50_000, 2))
        .unwrap();
    let mut req = broadcast_request(RECIPIENT, 50_000, spend.fee);
    req.signed_psbt_base64 = Some(sign(&spend.psbt_base64, &wallet.masters[0]));
    req.memo = Some("rent".into());
    let sent = fx.service.broadcast(wallet.id, &req).unwrap();

    assert!(sent.broadcasted);
    assert_eq!(fx.chain.broadcasts().len(), 1);
    assert_eq!(fx.chain.broadcasts()[0].compute_txid(), sent.txid);

    let spent = fx.utxo(coin);
    assert!(spent.spent);
    assert_eq!(spent.spent_by, Some(sent.txid));

    let record = fx.ledger.get_transaction(&sent.txid).unwrap().unwrap();
    assert_eq!(record.tx_type, TxType::Sent);
    assert_eq!(record.amount_sat, -50_282);
    assert_eq!(record.fee_sat, 282);
    assert_eq!(record.balance_after_sat, -50_282);
    assert_eq!(record.counterparty_address.as_deref(), Some(RECIPIENT));
    assert_eq!(record.memo.as_deref(), Some("rent"));
    assert!(record.rbf_signaled);
}

#[test]
fn unsigned_psbt_cannot_be_broadcast() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    let coin = fx.fund(&wallet, 0, 80_000, 3);

    let spend = fx
        .service
        .create_spend(wallet.id, &spend_request(RECIPIENT, 50_000, 2))
        .unwrap();
    let mut req = broadcast_request(RECIPIENT, 50_000, spend.fee);
    req.signed_psbt_base64 = Some(spend.psbt_base64);
    let err = fx.service.broadcast(wallet.id, &req).unwrap_err();

    assert!(matches!(err, SpendError::MalformedTransaction(_)));
    assert!(fx.chain.broadcasts().is_empty());
    assert!(!fx.utxo(coin).spent);
}

#[test]
fn spending_to_own_address_is_a_consolidation() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    fx.fund(&wallet, 0, 40_000, 3);
    fx.fund(&wallet, 1, 40_000, 3);

    let own = wallet.address(Keychain::External, 7);
    let mut spend_req = spend_request(&own, 0, 3);
    spend_req.amount = None;
    spend_req.send_max = true;
    let spend = fx.service.create_spend(wallet.id, &spend_req).unwrap();

    let mut req = broadcast_request(&own, spend.total_output, spend.fee);
    req.signed_psbt_base64 = Some(sign(&spend.psbt_base64, &wallet.masters[0]));
    let sent = fx.service.broadcast(wallet.id, &req).unwrap();

    let record = fx.ledger.get_transaction(&sent.txid).unwrap().unwrap();
    assert_eq!(record.tx_type, TxType::Consolidation);
    assert_eq!(record.amount_sat, -(spend.fee as i64));
    assert_eq!(record.counterparty_address, None);
}

#[test]
fn rejected_broadcast_leaves_ledger_untouched() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    let coin = fx.fund(&wallet, 0, 80_000, 3);

    let draft = fx
        .service
        .create_draft(wallet.id, Uuid::new_v4(), &spend_request(RECIPIENT, 50_000, 2))
        .unwrap();
    assert_eq!(draft.required_signatures, 1);
    let signed = fx
        .service
        .submit_signature(
            draft.id,
            &SubmitSignatureRequest {
                device_id: Uuid::new_v4(),
                signed_psbt_base64: sign(&draft.psbt_base64, &wallet.masters[0]),
                expected_version: draft.version,
            },
        )
        .unwrap();
    assert_eq!(signed.status, DraftStatus::Signed);

    fx.chain.reject_with("min relay fee not met");
    let mut req = broadcast_request(RECIPIENT, 50_000, draft.fee);
    req.draft_id = Some(draft.id);
    let err = fx.service.broadcast(wallet.id, &req).unwrap_err();
    assert!(matches!(&err, SpendError::BroadcastRejected(msg) if msg == "min relay fee not met"));
    assert_eq!(err.kind(), ErrorKind::ExternalRejection);

    let record = fx.utxo(coin);
    assert!(!record.spent);
    assert_eq!(record.lock.map(|l| l.holder), Some(LockHolder::Draft(draft.id)));
    assert!(fx.ledger.list_transactions(wallet.id).unwrap().is_empty());
    assert!(fx.ledger.get_draft(draft.id).unwrap().is_some());

    fx.chain.accept();
    let sent = fx.service.broadcast(wallet.id, &req).unwrap();
    assert!(fx.utxo(coin).spent);
    assert!(fx.ledger.get_transaction(&sent.txid).unwrap().is_some());
    assert!(matches!(
        fx.service.get_draft(draft.id),
        Err(SpendError::DraftNotFound(_))
    ));
}

#[test]
fn fee_bump_links_replacement_to_original() {
    let fx = Fixture::new();
    let wallet = fx.single_sig_wallet("");
    let coin = fx.fund(&wallet, 0, 80_000, 3);

    let spend = fx
        .service
        .create_spend(wallet.id, &spend_request(RECIPIENT, 50_000, 2))
        .unwrap();
    let mut req = broadcast_request(RECIPIENT, 50_000, spend.fee);
    req.signed_psbt_base64 = Some(sign(&spend.psbt_base64, &wallet.masters[0]));
    let original = fx.service.broadcast(wallet.id, &req).unwrap().txid;

    fx.clock.advance(Duration::minutes(20));

    // Same coin, same payment, 1,000 sat fee.
    let utxo = fx.utxo(coin).utxo;
    let mut bump = build_psbt(
        &wallet.descriptor,
        &[PsbtInput { utxo, prev_tx: None }],
        &[
            PsbtOutput {
                script_pubkey: parse_address(RECIPIENT, BtcNetwork::Testnet)
                    .unwrap()
                    .script_pubkey(),
                value_sat: 50_000,
                derivation: None,
            },
            PsbtOutput {
                script_pubkey: wallet.descriptor.script_pubkey(Keychain::Internal, 5).unwrap(),
                value_sat: 29_000,
                derivation: Some((Keychain::Internal, 5)),
            },
        ],
        true,
        LockTime::ZERO,
    )
    .unwrap();
    sign_psbt(&mut bump, &wallet.masters[0]);
    let tx = finalize(&bump).unwrap();

    let mut req = broadcast_request(RECIPIENT, 50_000, 1_000);
    req.raw_tx_hex = Some(serialize_raw_transaction(&tx));
    req.replaces_txid = Some(original);
    let replacement = fx.service.broadcast(wallet.id, &req).unwrap().txid;
    assert_ne!(replacement, original);

    let old = fx.ledger.get_transaction(&original).unwrap().unwrap();
    let new = fx.ledger.get_transaction(&replacement).unwrap().unwrap();
    assert_eq!(old.replaced_by_txid, Some(replacement));
    assert_eq!(new.replaces_txid, Some(original));
    assert_eq!(new.amount_sat, -51_000);
    assert_eq!(new.fee_sat, 1_000);
    // The replaced transaction no longer counts toward the balance.
    assert_eq!(old.balance_after_sat, 0);
    assert_eq!(new.balance_after_sat, -51_000);
    assert_eq!(fx.utxo(coin).spent_by, Some(replacement));
}
