//! Shared test harness: full engine wired over in-memory adapters and a
//! paper exchange.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use uuid::Uuid;

use coinvest::adapters::{
    LoggingNotificationSink, MemoryAllocationSource, MemoryCache, MemoryEventBus,
    MemoryLedgerStore, MemoryOrderStore,
};
use coinvest::config::{BalanceGateConfig, PipelineConfig, ReconciliationConfig};
use coinvest::domain::{Allocation, EventKind, Payment, PaymentReceivedEvent, StoredEvent};
use coinvest::exchange::{ExchangeRegistry, PaperExchange};
use coinvest::persistence::{CacheStore, EventBus as _, NotificationSink};
use coinvest::pipeline::{
    AllocationProcessor, BalanceAdmissionGate, FundingStatsHandle, FundingWorker,
    IdempotencyGuard, OrderExecutor, PaymentOrchestrator,
};
use coinvest::resilience::ResilienceExecutor;
use coinvest::services::{Metrics, Reconciler};

pub struct Harness {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub reconciler: Arc<Reconciler>,
    pub gate: Arc<BalanceAdmissionGate>,
    pub orders: Arc<MemoryOrderStore>,
    pub ledger: Arc<MemoryLedgerStore>,
    pub bus: Arc<MemoryEventBus>,
    pub allocations: Arc<MemoryAllocationSource>,
    pub exchange: Arc<PaperExchange>,
    pub metrics: Arc<Metrics>,
    pub funding_stats: FundingStatsHandle,
}

pub struct HarnessOptions {
    pub idempotency_ttl_secs: u64,
    pub paper_balance: Decimal,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            idempotency_ttl_secs: 3600,
            paper_balance: Decimal::from(10_000),
        }
    }
}

pub async fn harness() -> Harness {
    harness_with(HarnessOptions::default()).await
}

pub async fn harness_with(options: HarnessOptions) -> Harness {
    let orders = Arc::new(MemoryOrderStore::new());
    let ledger = Arc::new(MemoryLedgerStore::new());
    let bus = Arc::new(MemoryEventBus::new());
    let allocations = Arc::new(MemoryAllocationSource::new());
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
    let executor = Arc::new(ResilienceExecutor::new());
    let metrics = Arc::new(Metrics::new());
    let sink: Arc<dyn NotificationSink> = Arc::new(LoggingNotificationSink::new());

    let exchange = Arc::new(PaperExchange::new("binance", "EUR"));
    exchange.set_balance("EUR", options.paper_balance).await;
    exchange.set_price("BTC", Decimal::from(50_000)).await;
    exchange.set_price("ETH", Decimal::from(2_000)).await;

    let mut registry = ExchangeRegistry::new();
    registry.register(exchange.clone());
    let registry = Arc::new(registry);

    let (funding, funding_worker, funding_stats) = FundingWorker::channel(
        64,
        cache.clone(),
        bus.clone(),
        sink.clone(),
        Duration::from_secs(900),
    );
    tokio::spawn(funding_worker.run());

    let gate = Arc::new(BalanceAdmissionGate::new(
        registry.clone(),
        cache.clone(),
        funding,
        executor.clone(),
        BalanceGateConfig::default(),
    ));
    let order_executor = Arc::new(OrderExecutor::new(executor.clone(), metrics.clone()));

    let processor = Arc::new(AllocationProcessor::new(
        registry.clone(),
        gate.clone(),
        order_executor.clone(),
        orders.clone(),
        ledger.clone(),
        bus.clone(),
        sink.clone(),
        cache.clone(),
        executor.clone(),
        metrics.clone(),
        PipelineConfig::default(),
    ));

    let idempotency = IdempotencyGuard::new(
        cache.clone(),
        Duration::from_secs(options.idempotency_ttl_secs),
    );
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        idempotency,
        allocations.clone(),
        processor,
        bus.clone(),
        executor.clone(),
        metrics.clone(),
        PipelineConfig::default(),
    ));

    let reconciler = Arc::new(Reconciler::new(
        orders.clone(),
        ledger.clone(),
        bus.clone(),
        registry,
        gate.clone(),
        order_executor,
        executor,
        metrics.clone(),
        ReconciliationConfig::default(),
    ));

    Harness {
        orchestrator,
        reconciler,
        gate,
        orders,
        ledger,
        bus,
        allocations,
        exchange,
        metrics,
        funding_stats,
    }
}

pub fn payment(net_amount: Decimal) -> Payment {
    Payment::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        format!("tx-{}", Uuid::new_v4()),
        net_amount,
        "EUR",
    )
}

pub fn allocation(ticker: &str, exchange_name: &str, percent: Decimal) -> Allocation {
    Allocation {
        asset_id: Uuid::new_v4(),
        ticker: ticker.to_string(),
        exchange_name: exchange_name.to_string(),
        percent,
    }
}

/// Publish a payment-received event to the durable log and hand it to the
/// orchestrator, the way the serve loop does.
pub async fn deliver(
    harness: &Harness,
    payment: &Payment,
) -> (
    Uuid,
    Result<Vec<coinvest::domain::OrderResult>, coinvest::error::OpFailure>,
) {
    let stored = StoredEvent::new(
        EventKind::PaymentReceived,
        serde_json::to_value(payment).expect("payment serializes"),
    );
    harness.bus.publish(&stored).await.expect("publish");

    let event = PaymentReceivedEvent {
        event_id: stored.id,
        payment: payment.clone(),
    };
    let result = harness.orchestrator.handle(&event).await;
    (stored.id, result)
}

/// Wait for the funding worker to drain in-flight requests.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
