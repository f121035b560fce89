//! End-to-end settlement against the in-memory chain: game start, fee
//! escrow, fulfillment verification, payout, expiry refund and treasury
//! invariants.

mod common;

use common::{engine, engine_on, engine_with, fund_player, player, FlakyStore};
use fairwager::{
    coordinator::{CoinFlip, GameRequest, PayoutRule},
    errors::{ErrorClass, SubscriptionError, TreasuryError, WagerError},
    commitment::{commit, derive_random_value},
    types::{now_millis, Address, EntryKind, EntryStatus, Hash32, RequestState},
};
use std::sync::Arc;

fn coinflip(stake: u64) -> GameRequest {
    GameRequest {
        account: player(),
        category: "coinflip".to_string(),
        variant: "classic".to_string(),
        stake,
    }
}

/// A provider random that makes a classic coin flip on `seed` pay out.
fn winning_random(seed: &Hash32, stake: u64) -> (Hash32, u64) {
    (0u8..=u8::MAX)
        .map(|b| [b; 32])
        .map(|r| (r, CoinFlip.payout(&derive_random_value(seed, &r), stake, "classic")))
        .find(|(_, payout)| *payout > 0)
        .unwrap()
}

fn payouts(t: &common::TestEngine) -> Vec<u64> {
    t.engine
        .ledger
        .entries(&player())
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::Payout)
        .map(|e| e.amount)
        .collect()
}

#[tokio::test]
async fn test_underfunded_resource_rejects_and_refunds_stake() {
    let t = engine(50, 100).await;
    fund_player(&t, &player(), 1_000).await;

    let err = t.engine.coordinator.start_game(coinflip(100)).await.unwrap_err();
    assert!(matches!(
        err,
        WagerError::Subscription(SubscriptionError::InsufficientResourceBalance { fee: 100, balance: 50, .. })
    ));
    assert_eq!(err.class(), ErrorClass::Rejected);

    let requests = t.engine.store.list_requests().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].state, RequestState::Created);
    assert_eq!(t.chain.provider_request_count(), 0);
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 1_000);
}

#[tokio::test]
async fn test_game_escrows_fee_and_settles_verified_fulfillment() {
    let t = engine(150, 100).await;
    fund_player(&t, &player(), 1_000).await;

    let ticket = t.engine.coordinator.start_game(coinflip(100)).await.unwrap();
    assert_eq!(ticket.state, RequestState::AwaitingFulfillment);
    assert_eq!(ticket.sequence_number, Some(1));
    assert_eq!(commit(&ticket.seed), ticket.commitment);
    assert_eq!(t.chain.subscription_snapshot(t.handle).unwrap().balance, 50);
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 900);

    let provider_random = [7u8; 32];
    let fulfillment = t.chain.fulfill(1, ticket.seed, provider_random);
    let result = t
        .engine
        .coordinator
        .handle_fulfillment(&fulfillment)
        .await
        .unwrap()
        .expect("settled");

    let expected = derive_random_value(&ticket.seed, &provider_random);
    assert_eq!(result.random_value, expected);
    assert_eq!(result.payout, CoinFlip.payout(&expected, 100, "classic"));
    assert_eq!(result.tx_ref, fulfillment.tx_ref.map(|tx| tx.0));

    let request = t.engine.coordinator.request(&ticket.request_id).unwrap();
    assert_eq!(request.state, RequestState::Fulfilled);
    assert_eq!(request.random_value, Some(expected));
    assert_eq!(
        t.engine.ledger.reconcile(&player()).unwrap(),
        900 + result.payout as i128
    );
}

#[tokio::test]
async fn test_forged_seed_holds_request_without_payout() {
    let t = engine(1_000, 10).await;
    fund_player(&t, &player(), 500).await;
    let ticket = t.engine.coordinator.start_game(coinflip(100)).await.unwrap();

    let forged = t.chain.fulfill(1, [0xee; 32], [1u8; 32]);
    let err = t.engine.coordinator.handle_fulfillment(&forged).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Integrity);
    assert!(err.class().is_fatal());

    let request = t.engine.coordinator.request(&ticket.request_id).unwrap();
    assert_eq!(request.state, RequestState::AwaitingFulfillment);
    assert!(request.integrity_hold);
    assert!(t
        .engine
        .store
        .entry_for_reference(&ticket.request_id, EntryKind::Payout)
        .unwrap()
        .is_none());
    assert_eq!(t.engine.metrics.integrity_alerts_total.get(), 1);

    // A held request is not expired or refunded by the sweep.
    assert_eq!(t.engine.coordinator.sweep(now_millis() + 3_600_000).await.unwrap(), 0);
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 400);
}

#[tokio::test]
async fn test_polled_fulfillments_settle_once() {
    let t = engine(1_000, 10).await;
    fund_player(&t, &player(), 500).await;
    let first = t.engine.coordinator.start_game(coinflip(50)).await.unwrap();
    let second = t.engine.coordinator.start_game(coinflip(50)).await.unwrap();

    t.chain.fulfill(1, first.seed, [1u8; 32]);
    t.chain.fulfill(2, second.seed, [2u8; 32]);
    assert_eq!(t.engine.coordinator.poll_fulfillments().await.unwrap(), 2);
    assert_eq!(t.engine.coordinator.poll_fulfillments().await.unwrap(), 0);

    let mut expected_payout = 0;
    for (ticket, provider_random) in [(&first, [1u8; 32]), (&second, [2u8; 32])] {
        let request = t.engine.coordinator.request(&ticket.request_id).unwrap();
        assert_eq!(request.state, RequestState::Fulfilled);
        let value = derive_random_value(&ticket.seed, &provider_random);
        expected_payout += CoinFlip.payout(&value, 50, "classic");
    }
    let paid: u64 = t
        .engine
        .ledger
        .entries(&player())
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::Payout)
        .map(|e| e.amount)
        .sum();
    assert_eq!(paid, expected_payout);
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 400 + expected_payout as i128);
}

#[tokio::test]
async fn test_expired_request_refunds_exactly_once() {
    let mut config = common::config();
    config.tracker.fulfillment_timeout_ms = 1;
    let t = engine_with(config, 1_000, 10).await;
    fund_player(&t, &player(), 300).await;
    let ticket = t.engine.coordinator.start_game(coinflip(100)).await.unwrap();
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 200);

    let later = now_millis() + 60_000;
    assert_eq!(t.engine.coordinator.sweep(later).await.unwrap(), 1);
    assert_eq!(t.engine.coordinator.sweep(later + 1).await.unwrap(), 0);

    let request = t.engine.coordinator.request(&ticket.request_id).unwrap();
    assert_eq!(request.state, RequestState::Expired);
    let refunds: Vec<_> = t
        .engine
        .ledger
        .entries(&player())
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::Refund)
        .collect();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, 100);
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 300);

    // Calling the refund path again is a no-op.
    t.engine.coordinator.handle_expired(&request).await.unwrap();
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 300);

    // A fulfillment after expiry is refused.
    let late = t.chain.fulfill(1, ticket.seed, [9u8; 32]);
    assert!(t.engine.coordinator.handle_fulfillment(&late).await.is_err());
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 300);
}

#[tokio::test]
async fn test_expired_refund_is_paid_out_when_configured() {
    let mut config = common::config();
    config.tracker.fulfillment_timeout_ms = 1;
    config.treasury.auto_withdraw_refunds = true;
    let t = engine_with(config, 1_000, 10).await;
    fund_player(&t, &player(), 300).await;
    t.engine.coordinator.start_game(coinflip(100)).await.unwrap();

    t.engine.coordinator.sweep(now_millis() + 60_000).await.unwrap();
    let withdrawals: Vec<_> = t
        .engine
        .ledger
        .entries(&player())
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::Withdrawal)
        .collect();
    assert_eq!(withdrawals.len(), 1);
    assert_eq!(withdrawals[0].status, EntryStatus::Confirmed);
    assert_eq!(t.chain.balance_of(&player()), 100);
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 200);
}

#[tokio::test]
async fn test_withdrawal_above_live_treasury_balance_is_refused() {
    let t = engine(1_000, 10).await;
    let account = Address::new("0x00000000000000000000000000000000000000d2");
    fund_player(&t, &account, 5).await;

    let err = t.engine.ledger.withdraw(&account, 10).await.unwrap_err();
    assert!(matches!(
        err,
        WagerError::Treasury(TreasuryError::InsufficientTreasuryFunds { requested: 10, available: 5 })
    ));
    let entries = t.engine.ledger.entries(&account).unwrap();
    assert!(entries.iter().all(|e| e.kind == EntryKind::Deposit));
    assert_eq!(t.engine.ledger.reconcile(&account).unwrap(), 5);
}

#[tokio::test]
async fn test_balance_never_goes_negative() {
    let t = engine(1_000, 10).await;
    let account = player();
    fund_player(&t, &account, 100).await;
    // Another depositor keeps the treasury liquid.
    fund_player(&t, &Address::new("0x00000000000000000000000000000000000000d9"), 1_000).await;

    let steps: [(bool, u64); 8] = [
        (false, 60),
        (false, 60),
        (true, 30),
        (false, 80),
        (false, 1),
        (true, 5),
        (false, 36),
        (false, 1),
    ];
    for (deposit, amount) in steps {
        if deposit {
            fund_player(&t, &account, amount).await;
        } else {
            let _ = t.engine.ledger.withdraw(&account, amount).await;
        }
        let balance = t.engine.ledger.reconcile(&account).unwrap();
        assert!(balance >= 0, "balance went negative: {}", balance);
        assert!(t.engine.ledger.available_balance(&account).unwrap() >= 0);
    }
    assert_eq!(t.engine.ledger.reconcile(&account).unwrap(), 37);

    let health = t.engine.ledger.treasury_health().await.unwrap();
    assert!(health.solvent);
}

#[tokio::test]
async fn test_category_stats_group_by_variant() {
    let t = engine(1_000, 10).await;
    fund_player(&t, &player(), 1_000).await;
    t.engine.coordinator.start_game(coinflip(10)).await.unwrap();
    t.engine
        .coordinator
        .start_game(GameRequest {
            variant: "turbo".to_string(),
            ..coinflip(20)
        })
        .await
        .unwrap();

    let stats = t.engine.coordinator.category_stats().unwrap();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.category == "coinflip" && s.awaiting == 1));
    assert_eq!(stats.iter().map(|s| s.total_staked).sum::<u64>(), 30);
}

#[tokio::test]
async fn test_redelivered_fulfillment_credits_missing_payout() {
    let t = engine(1_000, 10).await;
    fund_player(&t, &player(), 1_000).await;
    let ticket = t.engine.coordinator.start_game(coinflip(100)).await.unwrap();
    let (provider_random, payout) = winning_random(&ticket.seed, 100);

    // The request is marked fulfilled but the payout was never written.
    let fulfillment = t.chain.fulfill(1, ticket.seed, provider_random);
    t.engine.tracker.on_fulfillment(&fulfillment).await.unwrap();
    assert!(payouts(&t).is_empty());
    assert_eq!(t.engine.store.pending_credits().unwrap(), vec![ticket.request_id.clone()]);

    let result = t
        .engine
        .coordinator
        .handle_fulfillment(&fulfillment)
        .await
        .unwrap()
        .expect("settled");
    assert_eq!(result.payout, payout);
    assert_eq!(payouts(&t), vec![payout]);
    assert!(t.engine.store.pending_credits().unwrap().is_empty());

    t.engine.coordinator.handle_fulfillment(&fulfillment).await.unwrap();
    assert_eq!(payouts(&t), vec![payout]);
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 900 + payout as i128);
}

#[tokio::test]
async fn test_queued_credit_is_paid_by_retry() {
    let t = engine(1_000, 10).await;
    fund_player(&t, &player(), 1_000).await;
    let ticket = t.engine.coordinator.start_game(coinflip(100)).await.unwrap();
    let (provider_random, payout) = winning_random(&ticket.seed, 100);

    let fulfillment = t.chain.fulfill(1, ticket.seed, provider_random);
    t.engine.tracker.on_fulfillment(&fulfillment).await.unwrap();

    assert_eq!(t.engine.coordinator.retry_pending_credits().await.unwrap(), 1);
    assert_eq!(t.engine.coordinator.retry_pending_credits().await.unwrap(), 0);
    assert_eq!(payouts(&t), vec![payout]);
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 900 + payout as i128);
}

#[tokio::test]
async fn test_sweep_refunds_requests_expired_elsewhere() {
    let mut config = common::config();
    config.tracker.fulfillment_timeout_ms = 1;
    let t = engine_with(config, 1_000, 10).await;
    fund_player(&t, &player(), 300).await;
    let ticket = t.engine.coordinator.start_game(coinflip(100)).await.unwrap();

    // Expired by the tracker alone, so no refund was written.
    let later = now_millis() + 60_000;
    assert_eq!(t.engine.tracker.sweep_expired(later).await.unwrap().len(), 1);
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 200);

    assert_eq!(t.engine.coordinator.sweep(later + 1).await.unwrap(), 0);
    assert_eq!(t.engine.coordinator.sweep(later + 2).await.unwrap(), 0);
    assert_eq!(
        t.engine.coordinator.request(&ticket.request_id).unwrap().state,
        RequestState::Expired
    );
    let refunds = t
        .engine
        .ledger
        .entries(&player())
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::Refund)
        .count();
    assert_eq!(refunds, 1);
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 300);
}

#[tokio::test]
async fn test_transiently_failed_poll_is_replayed() {
    let store = Arc::new(FlakyStore::new());
    let t = engine_on(common::config(), store.clone(), 1_000, 10).await;
    fund_player(&t, &player(), 500).await;
    let ticket = t.engine.coordinator.start_game(coinflip(100)).await.unwrap();
    let provider_random = [3u8; 32];
    t.chain.fulfill(1, ticket.seed, provider_random);

    store.fail_request_updates(1);
    assert_eq!(t.engine.coordinator.poll_fulfillments().await.unwrap(), 1);
    assert_eq!(
        t.engine.coordinator.request(&ticket.request_id).unwrap().state,
        RequestState::AwaitingFulfillment
    );
    assert_eq!(t.engine.store.parked_fulfillments().unwrap().len(), 1);

    // The cursor moved on, so only the parked copy can settle it.
    assert_eq!(t.engine.coordinator.poll_fulfillments().await.unwrap(), 0);
    t.engine.coordinator.resolve_pending().await.unwrap();

    let request = t.engine.coordinator.request(&ticket.request_id).unwrap();
    assert_eq!(request.state, RequestState::Fulfilled);
    assert!(t.engine.store.parked_fulfillments().unwrap().is_empty());
    let payout = CoinFlip.payout(&derive_random_value(&ticket.seed, &provider_random), 100, "classic");
    assert_eq!(t.engine.ledger.reconcile(&player()).unwrap(), 400 + payout as i128);
}
