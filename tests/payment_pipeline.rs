//! End-to-end pipeline behavior over the in-memory adapters.

mod common;

use common::{allocation, deliver, harness, harness_with, payment, settle, HarnessOptions};
use coinvest::domain::{
    EventKind, EventStatus, FundingRequestedEvent, OrderOutcome, OrderStatus,
};
use coinvest::error::FailureReason;
use coinvest::exchange::FillBehavior;
use coinvest::persistence::{LedgerStore as _, OrderStore as _};
use coinvest::pipeline::AdmissionDecision;
use rust_decimal_macros::dec;

#[tokio::test]
async fn two_allocation_happy_path() {
    let h = harness().await;
    let payment = payment(dec!(100));

    h.allocations
        .set(
            payment.subscription_id,
            vec![
                allocation("BTC", "binance", dec!(60)),
                allocation("ETH", "binance", dec!(40)),
            ],
        )
        .await;

    let (event_id, result) = deliver(&h, &payment).await;
    let results = result.expect("payment should succeed");

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(results[0].filled_qty, dec!(60.00));
    assert_eq!(results[1].filled_qty, dec!(40.00));

    // Two filled orders persisted
    let orders = h.orders.all().await;
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.status == OrderStatus::Filled));

    // Ledger entry per fill
    let entries = h.ledger.entries_for_payment(payment.id).await.unwrap();
    assert_eq!(entries.len(), 2);
    let total: rust_decimal::Decimal = entries.iter().map(|e| e.quote_amount).sum();
    assert_eq!(total, dec!(100.00));

    // Event settled and completions published
    let stored = h.bus.get(event_id).await.unwrap();
    assert_eq!(stored.status, EventStatus::Processed);
    assert_eq!(
        h.bus.events_of_kind(EventKind::OrderCompleted).await.len(),
        2
    );
}

#[tokio::test]
async fn redelivering_same_event_is_a_noop() {
    let h = harness().await;
    let payment = payment(dec!(100));
    h.allocations
        .set(
            payment.subscription_id,
            vec![allocation("BTC", "binance", dec!(100))],
        )
        .await;

    let (event_id, first) = deliver(&h, &payment).await;
    let first = first.unwrap();
    assert_eq!(h.orders.count().await, 1);

    // Same event id delivered again
    let event = coinvest::domain::PaymentReceivedEvent {
        event_id,
        payment: payment.clone(),
    };
    let second = h.orchestrator.handle(&event).await.unwrap();

    assert_eq!(h.orders.count().await, 1, "no new orders on redelivery");
    assert_eq!(first.len(), second.len());
    assert_eq!(first[0].order_id, second[0].order_id);
}

#[tokio::test]
async fn same_payment_under_new_event_returns_stored_result() {
    let h = harness().await;
    let payment = payment(dec!(100));
    h.allocations
        .set(
            payment.subscription_id,
            vec![allocation("BTC", "binance", dec!(100))],
        )
        .await;

    let (_, first) = deliver(&h, &payment).await;
    let first = first.unwrap();

    // The payment provider resubmits the same payment under a fresh event
    let (second_event_id, second) = deliver(&h, &payment).await;
    let second = second.unwrap();

    assert_eq!(h.orders.count().await, 1);
    assert_eq!(first[0].order_id, second[0].order_id);

    // The duplicate event is settled as processed, not left dangling
    let stored = h.bus.get(second_event_id).await.unwrap();
    assert_eq!(stored.status, EventStatus::Processed);
}

#[tokio::test]
async fn insufficient_balance_fails_the_payment_and_requests_funding() {
    let h = harness_with(HarnessOptions {
        paper_balance: dec!(10),
        ..Default::default()
    })
    .await;
    let payment = payment(dec!(100));
    h.allocations
        .set(
            payment.subscription_id,
            vec![allocation("BTC", "binance", dec!(50))],
        )
        .await;

    let (event_id, result) = deliver(&h, &payment).await;
    let failure = result.expect_err("single failed allocation fails the payment");
    assert!(failure.message.contains("Insufficient balance"));

    settle().await;

    // Funding request for the shortfall plus the 5% buffer: 40 + 2.5
    let funding = h.bus.events_of_kind(EventKind::FundingRequested).await;
    assert_eq!(funding.len(), 1);
    let request: FundingRequestedEvent =
        serde_json::from_value(funding[0].payload.clone()).unwrap();
    assert_eq!(request.amount, dec!(42.5));
    assert_eq!(request.exchange_name, "binance");

    // The event stays in the log, marked failed, for reprocessing
    let stored = h.bus.get(event_id).await.unwrap();
    assert_eq!(stored.status, EventStatus::Failed);
    assert!(stored.error.is_some());

    // No order was placed
    assert_eq!(h.orders.count().await, 0);
}

#[tokio::test]
async fn invalid_payment_is_rejected_with_field_errors() {
    let h = harness().await;
    let mut bad = payment(dec!(0));
    bad.currency = String::new();
    h.allocations
        .set(
            bad.subscription_id,
            vec![allocation("BTC", "binance", dec!(100))],
        )
        .await;

    let (event_id, result) = deliver(&h, &bad).await;
    let failure = result.unwrap_err();

    assert_eq!(failure.reason, FailureReason::Validation);
    assert!(failure.field_errors.contains_key("net_amount"));
    assert!(failure.field_errors.contains_key("currency"));

    let stored = h.bus.get(event_id).await.unwrap();
    assert_eq!(stored.status, EventStatus::Failed);
    assert_eq!(h.orders.count().await, 0);
}

#[tokio::test]
async fn partial_success_is_overall_success_with_mixed_results() {
    let h = harness().await;
    let payment = payment(dec!(100));
    h.allocations
        .set(
            payment.subscription_id,
            vec![
                allocation("BTC", "binance", dec!(60)),
                // Unknown exchange: hard validation failure for this
                // allocation only
                allocation("ETH", "kraken", dec!(40)),
            ],
        )
        .await;

    let (event_id, result) = deliver(&h, &payment).await;
    let results = result.expect("partial success is overall success");

    assert_eq!(results.len(), 2);
    assert!(results[0].success);
    assert!(!results[1].success);
    assert_eq!(results[1].failure_reason, Some(FailureReason::NotFound));

    let stored = h.bus.get(event_id).await.unwrap();
    assert_eq!(stored.status, EventStatus::Processed);
    assert_eq!(h.orders.count().await, 1);
}

#[tokio::test]
async fn resume_skips_allocations_already_satisfied() {
    // Zero idempotency TTL forces a full pipeline re-run per delivery
    let h = harness_with(HarnessOptions {
        idempotency_ttl_secs: 0,
        ..Default::default()
    })
    .await;
    let payment = payment(dec!(100));
    let btc = allocation("BTC", "binance", dec!(60));
    let eth = allocation("ETH", "binance", dec!(40));
    h.allocations
        .set(payment.subscription_id, vec![btc.clone(), eth.clone()])
        .await;

    // First run: BTC fills, ETH is rejected by the exchange
    h.exchange
        .script_fills("ETH", vec![FillBehavior::Reject])
        .await;
    let (_, first) = deliver(&h, &payment).await;
    let first = first.expect("one success keeps the payment successful");
    assert!(first[0].success);
    assert!(!first[1].success);

    // Second run: BTC is already satisfied and must not re-execute
    let (_, second) = deliver(&h, &payment).await;
    let second = second.unwrap();
    assert_eq!(second[0].status, OrderOutcome::AlreadyProcessed);
    assert_eq!(second[0].filled_qty, dec!(0));
    assert!(second[1].success);

    // Exactly one BTC order ever; fills across ETH orders equal the target
    let btc_orders = h
        .orders
        .orders_for_payment_asset(payment.id, btc.asset_id)
        .await
        .unwrap();
    assert_eq!(btc_orders.len(), 1);

    let eth_orders = h
        .orders
        .orders_for_payment_asset(payment.id, eth.asset_id)
        .await
        .unwrap();
    let eth_filled: rust_decimal::Decimal =
        eth_orders.iter().map(|o| o.filled_quote_qty).sum();
    assert_eq!(eth_filled, dec!(40.00));
}

#[tokio::test]
async fn low_balance_grants_but_requests_funding_in_background() {
    let h = harness_with(HarnessOptions {
        paper_balance: dec!(45),
        ..Default::default()
    })
    .await;

    // 40 <= 45 < 48 (1.2x): granted, with a background top-up for 40
    let decision = h.gate.check("binance", "EUR", dec!(40)).await.unwrap();
    assert_eq!(decision, AdmissionDecision::GrantedLowBalance);

    settle().await;
    let funding = h.bus.events_of_kind(EventKind::FundingRequested).await;
    assert_eq!(funding.len(), 1);
    let request: FundingRequestedEvent =
        serde_json::from_value(funding[0].payload.clone()).unwrap();
    assert_eq!(request.amount, dec!(40));
}

#[tokio::test]
async fn comfortable_balance_grants_without_funding() {
    let h = harness().await;

    let decision = h.gate.check("binance", "EUR", dec!(40)).await.unwrap();
    assert_eq!(decision, AdmissionDecision::Granted);

    settle().await;
    assert!(h
        .bus
        .events_of_kind(EventKind::FundingRequested)
        .await
        .is_empty());
}

#[tokio::test]
async fn duplicate_funding_requests_are_suppressed_within_cooldown() {
    let h = harness_with(HarnessOptions {
        paper_balance: dec!(45),
        ..Default::default()
    })
    .await;

    for _ in 0..3 {
        let decision = h.gate.check("binance", "EUR", dec!(40)).await.unwrap();
        assert!(decision.is_granted());
    }

    settle().await;
    let funding = h.bus.events_of_kind(EventKind::FundingRequested).await;
    assert_eq!(funding.len(), 1, "cooldown suppresses duplicates");
    assert!(h.funding_stats.snapshot().deduplicated >= 1);
}

#[tokio::test]
async fn balance_reads_are_cached_across_allocations() {
    let h = harness().await;
    let payment = payment(dec!(100));
    h.allocations
        .set(
            payment.subscription_id,
            vec![
                allocation("BTC", "binance", dec!(30)),
                allocation("ETH", "binance", dec!(30)),
            ],
        )
        .await;

    let (_, result) = deliver(&h, &payment).await;
    result.unwrap();

    // First allocation fetches the balance; the fill invalidates the cache,
    // so the second fetches again. Never one exchange call per check step.
    assert!(h.exchange.balance_calls().await <= 2);
}

#[tokio::test]
async fn allocation_targets_round_toward_zero() {
    let h = harness().await;
    let payment = payment(dec!(99.99));
    h.allocations
        .set(
            payment.subscription_id,
            vec![allocation("BTC", "binance", dec!(33.33))],
        )
        .await;

    let (_, result) = deliver(&h, &payment).await;
    let results = result.unwrap();

    // 99.99 * 33.33% = 33.326667 -> 33.32
    assert_eq!(results[0].requested_qty, dec!(33.32));
    assert_eq!(results[0].filled_qty, dec!(33.32));
}
