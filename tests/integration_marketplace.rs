//! Marketplace Integration Tests
//!
//! Concurrency and failure scenarios run against the whole engine.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use care_market::domain::{BookingStatus, Role};
use care_market::handlers::{AvailabilityUpdate, CreateRequestCommand, RateCommand, TransferCommand};
use care_market::{EngineSettings, ErrorKind};

mod common;

use common::{ctx, signed_payment, TestMarket, UnreachablePayments};

// =========================================================================
// Accept race
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accepts_have_one_winner() {
    let market = TestMarket::new();
    let mut providers = Vec::new();
    for _ in 0..12 {
        providers.push(market.verified_provider("elder-care").await);
    }
    let client = Uuid::new_v4();
    let request = market.open_request(client, "Elder-Care-Basic", "900").await;

    let mut tasks = Vec::new();
    for &provider in &providers {
        let engine = market.engine.clone();
        tasks.push(tokio::spawn(async move {
            let result = engine
                .matching
                .accept(provider, request.id, &ctx(provider, Role::Provider))
                .await;
            (provider, result)
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        let (provider, result) = task.await.unwrap();
        match result {
            Ok(accepted) => winners.push((provider, accepted)),
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
        }
    }

    assert_eq!(winners.len(), 1, "exactly one accept must win");
    let (winner, accepted) = &winners[0];
    assert_eq!(accepted.booking.provider_id, Some(*winner));
    assert_eq!(accepted.availability, AvailabilityUpdate::Applied);

    let stored = market
        .engine
        .bookings
        .get(request.id, &ctx(client, Role::Client))
        .await
        .unwrap();
    assert_eq!(stored.status, BookingStatus::Accepted);
    assert_eq!(stored.provider_id, Some(*winner));

    // Only the winner went off the market
    for &provider in &providers {
        let profile = market
            .engine
            .providers
            .get(provider, &market.admin)
            .await
            .unwrap();
        assert_eq!(profile.available, provider != *winner);
    }
}

// =========================================================================
// Availability outbox
// =========================================================================

#[tokio::test]
async fn test_failed_availability_write_is_queued_and_reconciled() {
    let market = TestMarket::new();
    let provider = market.verified_provider("cooking").await;
    let request = market.open_request(Uuid::new_v4(), "Cooking", "450").await;

    market.store.fail_provider_writes(true);
    let accepted = assert_ok!(
        market
            .engine
            .matching
            .accept(provider, request.id, &ctx(provider, Role::Provider))
            .await
    );
    assert_eq!(accepted.availability, AvailabilityUpdate::Queued);
    assert_eq!(accepted.booking.status, BookingStatus::Accepted);

    let pending = market.engine.availability().pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].provider_id, provider);
    assert!(!pending[0].available);

    // Still failing: the job leaves the entry queued
    let report = market.engine.scheduler().run_all_once().await;
    assert_eq!(report.availability.failed, 1);

    market.store.fail_provider_writes(false);
    let report = market.engine.scheduler().run_all_once().await;
    assert_eq!(report.availability.applied, 1);
    assert_eq!(report.audit_chain_valid, Some(true));

    let profile = market.engine.providers.get(provider, &market.admin).await.unwrap();
    assert!(!profile.available);
    assert!(market.engine.availability().pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_completion_supersedes_queued_unavailability() {
    let market = TestMarket::new();
    let provider = market.verified_provider("cooking").await;
    let request = market.open_request(Uuid::new_v4(), "Cooking", "450").await;
    let as_provider = ctx(provider, Role::Provider);

    market.store.fail_provider_writes(true);
    let accepted = market
        .engine
        .matching
        .accept(provider, request.id, &as_provider)
        .await
        .unwrap();
    assert_eq!(accepted.availability, AvailabilityUpdate::Queued);
    market.store.fail_provider_writes(false);

    for status in [BookingStatus::InProgress, BookingStatus::Completed] {
        market
            .engine
            .bookings
            .update_status(provider, request.id, status, &as_provider)
            .await
            .unwrap();
    }
    assert!(market.engine.availability().pending().await.unwrap().is_empty());

    let report = market.engine.scheduler().run_all_once().await;
    assert_eq!(report.availability.applied, 0);

    let profile = market.engine.providers.get(provider, &market.admin).await.unwrap();
    assert!(profile.available);
    assert_eq!(profile.completed_jobs, 1);

    // Back on the market: the next request can be accepted
    let next = market.open_request(Uuid::new_v4(), "Cooking", "300").await;
    assert_ok!(market.engine.matching.accept(provider, next.id, &as_provider).await);
}

#[tokio::test]
async fn test_availability_toggle_supersedes_queued_change() {
    let market = TestMarket::new();
    let provider = market.verified_provider("cooking").await;
    let as_provider = ctx(provider, Role::Provider);

    market
        .engine
        .availability()
        .enqueue(provider, false, "accepted booking")
        .await
        .unwrap();
    market
        .engine
        .providers
        .set_availability(provider, true, &as_provider)
        .await
        .unwrap();

    market.engine.scheduler().run_all_once().await;
    let profile = market.engine.providers.get(provider, &market.admin).await.unwrap();
    assert!(profile.available);
}

// =========================================================================
// Ledger
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_conserve_total_balance() {
    let market = TestMarket::with_settings(EngineSettings {
        max_retries: 50,
        ..Default::default()
    });
    let accounts: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    for &account in &accounts {
        market.fund(account, Role::Client, "1000").await;
    }

    let mut tasks = Vec::new();
    for i in 0..24 {
        let from = accounts[i % accounts.len()];
        let to = accounts[(i + 1 + i / accounts.len()) % accounts.len()];
        if from == to {
            continue;
        }
        let engine = market.engine.clone();
        tasks.push(tokio::spawn(async move {
            let result = engine
                .ledger
                .transfer(from, TransferCommand::new(to, "35.50"), &ctx(from, Role::Client))
                .await;
            (from, to, result)
        }));
    }

    let mut expected: HashMap<Uuid, Decimal> = accounts.iter().map(|&a| (a, dec!(1000))).collect();
    for task in tasks {
        let (from, to, result) = task.await.unwrap();
        match result {
            Ok(transfer) => {
                assert_eq!(transfer.amount, dec!(35.50));
                *expected.get_mut(&from).unwrap() -= dec!(35.50);
                *expected.get_mut(&to).unwrap() += dec!(35.50);
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
        }
    }

    let mut total = Decimal::ZERO;
    for &account in &accounts {
        let wallet = market
            .engine
            .ledger
            .get_wallet(account, &market.admin)
            .await
            .unwrap();
        assert_eq!(wallet.balance.value(), expected[&account]);
        assert!(wallet.balance.value() >= Decimal::ZERO);
        total += wallet.balance.value();
    }
    assert_eq!(total, dec!(4000));
}

#[tokio::test]
async fn test_transfer_rejects_overdraft() {
    let market = TestMarket::new();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    market.fund(alice, Role::Client, "100").await;

    let err = assert_err!(
        market
            .engine
            .ledger
            .transfer(alice, TransferCommand::new(bob, "100.01"), &ctx(alice, Role::Client))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

    let wallet = market.engine.ledger.get_wallet(alice, &market.admin).await.unwrap();
    assert_eq!(wallet.balance.value(), dec!(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_payment_credit_is_idempotent_under_concurrency() {
    let market = TestMarket::with_settings(EngineSettings {
        max_retries: 20,
        ..Default::default()
    });
    let client = Uuid::new_v4();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = market.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .ledger
                .credit_from_payment(
                    client,
                    signed_payment("750", "order_42", "pay_42"),
                    &ctx(client, Role::Client),
                )
                .await
        }));
    }

    let mut fresh = 0;
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.amount, dec!(750));
        if !result.already_processed {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);

    let wallet = market.engine.ledger.get_wallet(client, &market.admin).await.unwrap();
    assert_eq!(wallet.balance.value(), dec!(750));
}

#[tokio::test]
async fn test_unreachable_payment_gateway_is_upstream_failure() {
    let market = TestMarket::with_payments(Arc::new(UnreachablePayments));
    let client = Uuid::new_v4();

    let err = assert_err!(
        market
            .engine
            .ledger
            .credit_from_payment(
                client,
                signed_payment("300", "order_7", "pay_7"),
                &ctx(client, Role::Client),
            )
            .await
    );
    assert_eq!(err.kind(), ErrorKind::UpstreamFailure);
}

#[tokio::test]
async fn test_forged_payment_signature_is_forbidden() {
    let market = TestMarket::new();
    let client = Uuid::new_v4();
    let mut command = signed_payment("300", "order_8", "pay_8");
    command.signature = "00".repeat(32);

    let err = assert_err!(
        market
            .engine
            .ledger
            .credit_from_payment(client, command, &ctx(client, Role::Client))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

// =========================================================================
// Ratings
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ratings_produce_exact_mean() {
    let market = TestMarket::with_settings(EngineSettings {
        max_retries: 20,
        ..Default::default()
    });
    let provider = market.verified_provider("elder-care").await;
    let as_provider = ctx(provider, Role::Provider);

    let mut jobs = Vec::new();
    for rating in [5u8, 4, 4, 3] {
        let client = Uuid::new_v4();
        let request = market.open_request(client, "Elder-Care-Basic", "600").await;
        market
            .engine
            .providers
            .set_availability(provider, true, &as_provider)
            .await
            .unwrap();
        market
            .engine
            .matching
            .accept(provider, request.id, &as_provider)
            .await
            .unwrap();
        for status in [BookingStatus::InProgress, BookingStatus::Completed] {
            market
                .engine
                .bookings
                .update_status(provider, request.id, status, &as_provider)
                .await
                .unwrap();
        }
        jobs.push((client, request.id, rating));
    }

    let mut tasks = Vec::new();
    for (client, booking_id, rating) in jobs {
        let engine = market.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .ratings
                .rate(
                    client,
                    booking_id,
                    RateCommand { rating, review: None },
                    &ctx(client, Role::Client),
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let profile = market.engine.providers.get(provider, &market.admin).await.unwrap();
    assert_eq!(profile.total_reviews, 4);
    assert_eq!(profile.rating, dec!(4));
    assert_eq!(profile.completed_jobs, 4);
}

// =========================================================================
// Postgres
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_accept_race() {
    let engine = common::setup_pg_engine().await;
    let admin = ctx(Uuid::new_v4(), Role::Admin);
    let mut providers = Vec::new();
    for _ in 0..8 {
        providers.push(common::verified_provider(&engine, &admin, "cooking").await);
    }
    let client = Uuid::new_v4();
    let request = engine
        .bookings
        .create_request(
            CreateRequestCommand::new(
                "Cooking",
                chrono::NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(),
                "500",
            ),
            &ctx(client, Role::Client),
        )
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for &provider in &providers {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .matching
                .accept(provider, request.id, &ctx(provider, Role::Provider))
                .await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
