mod common;

use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;

use battle_service::{Currency, LedgerError, TransactionStatus, TransactionType};
use common::{tx_hash, wallet, ConfirmMode, Harness, PLATFORM};

#[tokio::test]
async fn request_exceeding_balance_including_fee_is_rejected() {
    let h = Harness::new().await;
    let user = h.funded_user(1, dec!(0.01)).await;

    // 0.01 + 0.0005 fee > 0.01
    let err = h
        .state
        .withdrawals
        .request(user.id, dec!(0.01), Currency::Eth, &wallet(9))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    assert_eq!(h.balance(user.id).await, dec!(0.01));
    assert!(h.state.withdrawals.list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn request_validates_amount_and_destination() {
    let h = Harness::new().await;
    let user = h.funded_user(1, dec!(1)).await;

    for amount in [dec!(0), dec!(-1)] {
        let err = h.state.withdrawals.request(user.id, amount, Currency::Eth, &wallet(9)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
    let err = h.state.withdrawals.request(user.id, dec!(0.1), Currency::Eth, "0xnope").await.unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
    assert_eq!(h.balance(user.id).await, dec!(1));
}

#[tokio::test]
async fn pending_request_holds_amount_plus_fee() {
    let h = Harness::new().await;
    let user = h.funded_user(1, dec!(1)).await;

    let withdrawal = h
        .state
        .withdrawals
        .request(user.id, dec!(0.5), Currency::Eth, &wallet(9).to_uppercase().replacen("0X", "0x", 1))
        .await
        .unwrap();

    assert_eq!(withdrawal.status, TransactionStatus::Pending);
    assert_eq!(withdrawal.amount, dec!(0.525));
    assert_eq!(withdrawal.fee_amount, Some(dec!(0.025)));
    assert_eq!(withdrawal.destination_address.as_deref(), Some(wallet(9).as_str()));
    assert_eq!(withdrawal.tx_hash, None);
    assert_eq!(h.balance(user.id).await, dec!(0.475));

    let pending = h.state.withdrawals.list_pending().await.unwrap();
    assert_eq!(pending.iter().map(|w| w.id).collect::<Vec<_>>(), vec![withdrawal.id]);
}

#[tokio::test]
async fn two_pending_withdrawals_may_share_a_destination() {
    let h = Harness::new().await;
    let user = h.funded_user(1, dec!(1)).await;

    h.state.withdrawals.request(user.id, dec!(0.1), Currency::Eth, &wallet(9)).await.unwrap();
    h.state.withdrawals.request(user.id, dec!(0.1), Currency::Eth, &wallet(9)).await.unwrap();
    assert_eq!(h.state.withdrawals.list_pending().await.unwrap().len(), 2);
    assert_eq!(h.balance(user.id).await, dec!(0.79));
}

#[tokio::test]
async fn deposit_then_withdraw_round_trip() {
    let h = Harness::new().await;
    let user = h.user(1).await;
    h.chain.add_transfer(&tx_hash(1), &wallet(1), PLATFORM, dec!(0.1), true);
    h.state.deposits.check_transaction_for_user(user.id, &tx_hash(1), Currency::Eth).await.unwrap();
    assert_eq!(h.balance(user.id).await, dec!(0.095));

    let withdrawal = h.state.withdrawals.request(user.id, dec!(0.05), Currency::Eth, &wallet(9)).await.unwrap();
    let completed = h.state.withdrawals.approve(withdrawal.id).await.unwrap();

    assert_eq!(completed.status, TransactionStatus::Completed);
    assert!(completed.tx_hash.is_some());
    // Destination receives the requested amount; the fee stays with the platform
    assert_eq!(h.chain.sent(), vec![(wallet(9), dec!(0.05), Currency::Eth)]);
    assert_eq!(h.balance(user.id).await, dec!(0.0425));
    assert!(h.state.withdrawals.list_pending().await.unwrap().is_empty());

    let legacy = h.database.get_user(user.id).await.unwrap().unwrap().legacy_balance;
    assert_eq!(legacy, dec!(0.0425));
}

#[tokio::test]
async fn cancel_restores_the_balance_and_refunds_the_fee() {
    let h = Harness::new().await;
    let user = h.funded_user(1, dec!(1)).await;
    let withdrawal = h.state.withdrawals.request(user.id, dec!(0.2), Currency::Eth, &wallet(9)).await.unwrap();

    let canceled = h.state.withdrawals.cancel(withdrawal.id, user.id).await.unwrap();
    assert_eq!(canceled.status, TransactionStatus::Canceled);
    assert_eq!(h.balance(user.id).await, dec!(1));

    let fee = h
        .state
        .ledger
        .history(user.id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.tx_type == TransactionType::Fee)
        .unwrap();
    assert_eq!(fee.status, TransactionStatus::Refunded);

    let err = h.state.withdrawals.cancel(withdrawal.id, user.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyProcessed(_)));
}

#[tokio::test]
async fn only_the_owner_can_cancel() {
    let h = Harness::new().await;
    let owner = h.funded_user(1, dec!(1)).await;
    let other = h.user(2).await;
    let withdrawal = h.state.withdrawals.request(owner.id, dec!(0.2), Currency::Eth, &wallet(9)).await.unwrap();

    let err = h.state.withdrawals.cancel(withdrawal.id, other.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotAuthorized(_)));
    assert_eq!(h.balance(owner.id).await, dec!(0.79));
}

#[tokio::test]
async fn reject_records_the_reason_and_is_terminal() {
    let h = Harness::new().await;
    let user = h.funded_user(1, dec!(1)).await;
    let withdrawal = h.state.withdrawals.request(user.id, dec!(0.2), Currency::Eth, &wallet(9)).await.unwrap();

    let rejected = h
        .state
        .withdrawals
        .reject(withdrawal.id, Some("destination flagged".to_string()))
        .await
        .unwrap();
    assert_eq!(rejected.status, TransactionStatus::Rejected);
    assert_eq!(rejected.note.as_deref(), Some("destination flagged"));
    assert_eq!(h.balance(user.id).await, dec!(1));

    let err = h.state.withdrawals.approve(withdrawal.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyProcessed(_)));
    assert!(h.chain.sent().is_empty());
}

#[tokio::test]
async fn approve_aborts_without_platform_liquidity() {
    let h = Harness::new().await;
    let user = h.funded_user(1, dec!(1)).await;
    let withdrawal = h.state.withdrawals.request(user.id, dec!(0.5), Currency::Eth, &wallet(9)).await.unwrap();
    h.chain.set_liquidity(dec!(0.4));

    let err = h.state.withdrawals.approve(withdrawal.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    assert!(h.chain.sent().is_empty());

    let stored = h.database.get_transaction(withdrawal.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn reverted_payout_leaves_the_withdrawal_pending() {
    let h = Harness::new().await;
    let user = h.funded_user(1, dec!(1)).await;
    let withdrawal = h.state.withdrawals.request(user.id, dec!(0.1), Currency::Eth, &wallet(9)).await.unwrap();
    h.chain.set_confirm_mode(ConfirmMode::Reverted);

    let err = h.state.withdrawals.approve(withdrawal.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::ExternalUnavailable(_)));
    let stored = h.database.get_transaction(withdrawal.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn unconfirmed_broadcast_is_still_recorded() {
    let h = Harness::new().await;
    let user = h.funded_user(1, dec!(1)).await;
    let withdrawal = h.state.withdrawals.request(user.id, dec!(0.1), Currency::Eth, &wallet(9)).await.unwrap();
    h.chain.set_confirm_mode(ConfirmMode::TimedOut);

    let completed = h.state.withdrawals.approve(withdrawal.id).await.unwrap();
    assert_eq!(completed.status, TransactionStatus::Completed);
    assert_eq!(h.chain.sent().len(), 1);
}

#[tokio::test]
async fn unknown_or_non_withdrawal_ids_are_not_found() {
    let h = Harness::new().await;
    let user = h.user(1).await;
    let deposit = h.fund(user.id, dec!(1), Currency::Eth).await;

    let err = h.state.withdrawals.approve(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
    let err = h.state.withdrawals.reject(deposit.id, None).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn broadcast_payout_that_cannot_be_recorded_blocks_further_transitions() {
    let h = Harness::new().await;
    let user = h.funded_user(1, dec!(1)).await;
    let withdrawal = h.state.withdrawals.request(user.id, dec!(0.1), Currency::Eth, &wallet(9)).await.unwrap();
    h.storage.fail_withdrawal_settlement(true);

    let err = h.state.withdrawals.approve(withdrawal.id).await.unwrap_err();
    let LedgerError::PayoutUnrecorded { withdrawal_id, tx_hash } = err else {
        panic!("expected an unrecorded payout");
    };
    assert_eq!(withdrawal_id, withdrawal.id);
    assert_eq!(h.chain.sent().len(), 1);
    assert_eq!(h.state.withdrawals.unrecorded_payouts(), vec![(withdrawal.id, tx_hash.clone())]);

    // Storage is back, but the money already left: no second send, no refund
    h.storage.fail_withdrawal_settlement(false);
    let again = h.state.withdrawals.approve(withdrawal.id).await.unwrap_err();
    assert!(matches!(again, LedgerError::PayoutUnrecorded { tx_hash: ref hash, .. } if *hash == tx_hash));
    let cancel = h.state.withdrawals.cancel(withdrawal.id, user.id).await.unwrap_err();
    assert!(matches!(cancel, LedgerError::PayoutUnrecorded { .. }));
    let reject = h.state.withdrawals.reject(withdrawal.id, None).await.unwrap_err();
    assert!(matches!(reject, LedgerError::PayoutUnrecorded { .. }));

    assert_eq!(h.chain.sent().len(), 1);
    assert_eq!(h.balance(user.id).await, dec!(0.895));
}
