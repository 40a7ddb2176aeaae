//! Order reconciliation background service
//!
//! Repairs orders whose terminal state was not observed synchronously:
//! refreshes Pending orders against the exchange, enqueues retry and
//! partial-fill continuation orders, and resubmits Queued orders through
//! the same admission-gate + order-executor path as the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::ReconciliationConfig;
use crate::domain::{
    EventKind, ExchangeOrder, LedgerEntry, LedgerEntryType, OrderCompletedEvent, OrderStatus,
    PlacedOrder, StoredEvent,
};
use crate::error::{CoinvestError, FailureReason, Result};
use crate::exchange::ExchangeRegistry;
use crate::persistence::{EventBus, LedgerStore, OrderPatch, OrderStore};
use crate::pipeline::{AdmissionDecision, BalanceAdmissionGate, OrderExecutor};
use crate::resilience::{ResilienceExecutor, ResiliencePolicy};
use crate::services::Metrics;

/// Reconciliation statistics
#[derive(Debug, Clone, Default)]
pub struct ReconcilerStats {
    pub cycles: u64,
    pub orders_checked: u64,
    pub orders_filled: u64,
    pub orders_failed: u64,
    pub retries_enqueued: u64,
    pub continuations_enqueued: u64,
    pub queued_submitted: u64,
    pub errors: u64,
    pub last_run: Option<DateTime<Utc>>,
}

/// Order reconciliation service
pub struct Reconciler {
    orders: Arc<dyn OrderStore>,
    ledger: Arc<dyn LedgerStore>,
    bus: Arc<dyn EventBus>,
    registry: Arc<ExchangeRegistry>,
    gate: Arc<BalanceAdmissionGate>,
    order_executor: Arc<OrderExecutor>,
    executor: Arc<ResilienceExecutor>,
    metrics: Arc<Metrics>,
    config: ReconciliationConfig,
    status_policy: ResiliencePolicy,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<ReconcilerStats>>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<dyn OrderStore>,
        ledger: Arc<dyn LedgerStore>,
        bus: Arc<dyn EventBus>,
        registry: Arc<ExchangeRegistry>,
        gate: Arc<BalanceAdmissionGate>,
        order_executor: Arc<OrderExecutor>,
        executor: Arc<ResilienceExecutor>,
        metrics: Arc<Metrics>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            orders,
            ledger,
            bus,
            registry,
            gate,
            order_executor,
            executor,
            metrics,
            config,
            status_policy: ResiliencePolicy::exchange_api("exchange.get_order"),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(ReconcilerStats::default())),
        }
    }

    pub async fn get_stats(&self) -> ReconcilerStats {
        self.stats.read().await.clone()
    }

    /// Start the periodic reconciliation loop.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Reconciler already running");
            return;
        }

        info!(
            "Starting reconciler (interval: {}s, max retries: {})",
            self.config.interval_secs, self.config.max_order_retries
        );

        let reconciler = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                reconciler.config.interval_secs,
            ));

            while reconciler.running.load(Ordering::SeqCst) {
                interval.tick().await;

                if let Err(e) = reconciler.reconcile_pending().await {
                    error!("Reconciliation cycle failed: {}", e);
                }
                if let Err(e) = reconciler.submit_queued().await {
                    error!("Queued order submission failed: {}", e);
                }
            }

            info!("Reconciler stopped");
        });
    }

    /// Stop the periodic loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Reconciler stop requested");
    }

    /// Refresh every Pending order against its exchange and enqueue the
    /// follow-up orders the observed state calls for. Per-order failures
    /// are logged and do not abort the scan.
    pub async fn reconcile_pending(&self) -> Result<ReconcilerStats> {
        let pending = self
            .orders
            .orders_with_status(OrderStatus::Pending, self.config.max_orders_per_cycle)
            .await?;

        let mut checked = 0u64;
        let mut errors = 0u64;

        if pending.is_empty() {
            debug!("No pending orders to reconcile");
        }

        for order in pending {
            checked += 1;
            if let Err(e) = self.reconcile_order(&order).await {
                warn!("Failed to reconcile order {}: {}", order.id, e);
                errors += 1;
            }
        }

        self.metrics.inc_reconciliation_cycles();
        let mut stats = self.stats.write().await;
        stats.cycles += 1;
        stats.orders_checked += checked;
        stats.errors += errors;
        stats.last_run = Some(Utc::now());

        debug!(
            "Reconciliation cycle complete: checked={}, errors={}",
            checked, errors
        );
        Ok(stats.clone())
    }

    async fn reconcile_order(&self, order: &ExchangeOrder) -> Result<()> {
        let Some(exchange_order_id) = order.exchange_order_id.clone() else {
            return self.reconcile_orphan(order).await;
        };

        let client = self.registry.get(&order.exchange_name)?;
        let placed: PlacedOrder = self
            .executor
            .execute(&self.status_policy, || {
                let client = client.clone();
                let id = exchange_order_id.clone();
                async move { client.get_order(&id).await }
            })
            .await
            .map_err(CoinvestError::from)?;

        match placed.status {
            OrderStatus::Failed => {
                self.handle_exchange_failure(order, Some("order failed on exchange"))
                    .await
            }
            OrderStatus::PartiallyFilled => self.handle_partial_fill(order, &placed).await,
            OrderStatus::Filled => self.handle_fill(order, &placed).await,
            OrderStatus::Pending | OrderStatus::Queued => {
                // Still open on the exchange; record any progress
                if placed.filled_quote_qty > order.filled_quote_qty {
                    self.orders
                        .update_order(
                            order.id,
                            OrderPatch::default().with_fill(
                                placed.filled_quote_qty,
                                placed.filled_base_qty,
                                placed.price,
                            ),
                        )
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// A Pending order that never received an exchange id is a submission
    /// whose outcome was lost. After the orphan threshold it goes down the
    /// failure path; the exchange-side client-reference dedup protects a
    /// submission that did land.
    async fn reconcile_orphan(&self, order: &ExchangeOrder) -> Result<()> {
        let age = Utc::now() - order.created_at;
        if age < ChronoDuration::seconds(self.config.orphan_threshold_secs as i64) {
            return Ok(());
        }
        warn!(
            "Orphaned order {} (age {}s); treating submission as failed",
            order.id,
            age.num_seconds()
        );
        self.handle_exchange_failure(order, Some("submission outcome never observed"))
            .await
    }

    async fn handle_exchange_failure(
        &self,
        order: &ExchangeOrder,
        detail: Option<&str>,
    ) -> Result<()> {
        self.orders
            .update_order(
                order.id,
                OrderPatch::status(OrderStatus::Failed)
                    .with_error(detail.unwrap_or("failed on exchange")),
            )
            .await?;

        {
            let mut stats = self.stats.write().await;
            stats.orders_failed += 1;
        }

        if order.retry_count >= self.config.max_order_retries {
            warn!(
                "Order {} exhausted {} retries; failing terminally",
                order.id, order.retry_count
            );
            return Ok(());
        }

        let allowed = self.chain_remaining(order, Decimal::ZERO).await?;
        if allowed <= Decimal::ZERO {
            info!(
                "Order {} failed but allocation already satisfied; no retry",
                order.id
            );
            return Ok(());
        }

        let mut retry = ExchangeOrder::retry_of(order);
        retry.requested_quote_qty = order.requested_quote_qty.min(allowed);
        self.orders.insert_order(&retry).await?;
        self.metrics.inc_orders_requeued();
        {
            let mut stats = self.stats.write().await;
            stats.retries_enqueued += 1;
        }
        info!(
            "Enqueued retry {} for failed order {} (attempt {})",
            retry.id, order.id, retry.retry_count
        );
        Ok(())
    }

    async fn handle_partial_fill(
        &self,
        order: &ExchangeOrder,
        placed: &PlacedOrder,
    ) -> Result<()> {
        self.record_fill_progress(order, placed, OrderStatus::PartiallyFilled)
            .await?;

        let remaining = order.requested_quote_qty - placed.filled_quote_qty;
        let allowed = self.chain_remaining(order, placed.filled_quote_qty).await?;
        let continuation_qty = remaining.min(allowed);
        if continuation_qty <= Decimal::ZERO {
            debug!(
                "Partially filled order {} has nothing left to continue",
                order.id
            );
            return Ok(());
        }

        let continuation = ExchangeOrder::continuation_of(order, continuation_qty);
        self.orders.insert_order(&continuation).await?;
        self.metrics.inc_orders_requeued();
        {
            let mut stats = self.stats.write().await;
            stats.continuations_enqueued += 1;
        }
        info!(
            "Enqueued continuation {} for partial order {} ({} remaining)",
            continuation.id, order.id, continuation_qty
        );
        Ok(())
    }

    async fn handle_fill(&self, order: &ExchangeOrder, placed: &PlacedOrder) -> Result<()> {
        self.record_fill_progress(order, placed, OrderStatus::Filled)
            .await?;
        self.metrics.inc_orders_filled();
        {
            let mut stats = self.stats.write().await;
            stats.orders_filled += 1;
        }

        let completion = OrderCompletedEvent {
            order_id: order.id,
            payment_id: order.payment_id,
            user_id: order.user_id,
            asset_id: order.asset_id,
            exchange_name: order.exchange_name.clone(),
            requested_quote_qty: order.requested_quote_qty,
            filled_quote_qty: placed.filled_quote_qty,
        };
        match serde_json::to_value(&completion) {
            Ok(payload) => {
                let event = StoredEvent::new(EventKind::OrderCompleted, payload);
                if let Err(e) = self.bus.publish(&event).await {
                    error!(
                        "Failed to publish completion event for reconciled order {}: {}",
                        order.id, e
                    );
                }
            }
            Err(e) => error!("Failed to serialize completion event: {}", e),
        }
        Ok(())
    }

    /// Update the local order with observed fills and write a ledger entry
    /// for the newly observed fill delta.
    async fn record_fill_progress(
        &self,
        order: &ExchangeOrder,
        placed: &PlacedOrder,
        status: OrderStatus,
    ) -> Result<()> {
        self.orders
            .update_order(
                order.id,
                OrderPatch::status(status).with_fill(
                    placed.filled_quote_qty,
                    placed.filled_base_qty,
                    placed.price,
                ),
            )
            .await?;

        let delta = placed.filled_quote_qty - order.filled_quote_qty;
        if delta > Decimal::ZERO {
            let base_delta = placed.filled_base_qty - order.filled_base_qty;
            let entry = LedgerEntry {
                id: uuid::Uuid::new_v4(),
                user_id: order.user_id,
                payment_id: order.payment_id,
                order_id: order.id,
                asset_id: order.asset_id,
                quote_amount: delta,
                base_amount: base_delta.max(Decimal::ZERO),
                price: placed.price,
                entry_type: LedgerEntryType::Purchase,
                created_at: Utc::now(),
            };
            if let Err(e) = self.ledger.insert_entry(&entry).await {
                error!(
                    "Failed to persist ledger entry for reconciled order {}: {}",
                    order.id, e
                );
            }
        }
        Ok(())
    }

    /// Quote quantity the retry chain may still request: the root order's
    /// requested quantity minus every fill observed along the chain. Keeps
    /// rounding drift across long chains from ever requesting more than the
    /// original allocation target.
    async fn chain_remaining(&self, tip: &ExchangeOrder, tip_filled: Decimal) -> Result<Decimal> {
        let mut total_filled = tip_filled;
        let mut root_requested = tip.requested_quote_qty;
        let mut previous = tip.previous_order_id;
        let mut depth = 0u32;

        while let Some(prev_id) = previous {
            depth += 1;
            if depth > 64 {
                warn!("Order chain for {} deeper than 64; stopping walk", tip.id);
                break;
            }
            match self.orders.get_order(prev_id).await? {
                Some(ancestor) => {
                    total_filled += ancestor.filled_quote_qty;
                    root_requested = ancestor.requested_quote_qty;
                    previous = ancestor.previous_order_id;
                }
                None => break,
            }
        }

        Ok(root_requested - total_filled)
    }

    /// Submit Queued retry/continuation orders through the same admission
    /// and placement path as the pipeline.
    pub async fn submit_queued(&self) -> Result<usize> {
        let queued = self
            .orders
            .orders_with_status(OrderStatus::Queued, self.config.max_orders_per_cycle)
            .await?;

        let mut submitted = 0usize;
        for order in queued {
            match self.submit_one(&order).await {
                Ok(true) => submitted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to submit queued order {}: {}", order.id, e);
                    let mut stats = self.stats.write().await;
                    stats.errors += 1;
                }
            }
        }

        if submitted > 0 {
            let mut stats = self.stats.write().await;
            stats.queued_submitted += submitted as u64;
        }
        Ok(submitted)
    }

    async fn submit_one(&self, order: &ExchangeOrder) -> Result<bool> {
        let exchange = self.registry.get(&order.exchange_name)?;

        let allowed = self.chain_remaining(order, Decimal::ZERO).await?;
        if allowed <= Decimal::ZERO {
            self.orders
                .update_order(
                    order.id,
                    OrderPatch::status(OrderStatus::Failed)
                        .with_error("allocation already satisfied by prior fills"),
                )
                .await?;
            return Ok(false);
        }
        let quantity = order.requested_quote_qty.min(allowed);

        let decision = self
            .gate
            .check(exchange.name(), exchange.quote_asset_ticker(), quantity)
            .await?;
        if let AdmissionDecision::Insufficient { shortfall } = decision {
            debug!(
                "Queued order {} blocked on balance (shortfall {}); will retry next cycle",
                order.id, shortfall
            );
            return Ok(false);
        }

        self.orders
            .update_order(order.id, OrderPatch::status(OrderStatus::Pending))
            .await?;

        let client_ref = order.id.to_string();
        match self
            .order_executor
            .place_order(
                exchange.clone(),
                &order.ticker,
                quantity,
                &client_ref,
                order.side,
            )
            .await
        {
            Ok(placed) => {
                self.orders
                    .update_order(
                        order.id,
                        OrderPatch::default()
                            .with_exchange_order_id(placed.exchange_order_id.clone()),
                    )
                    .await?;
                if placed.status == OrderStatus::Filled {
                    self.handle_fill(order, &placed).await?;
                } else {
                    self.orders
                        .update_order(
                            order.id,
                            OrderPatch::status(OrderStatus::Pending).with_fill(
                                placed.filled_quote_qty,
                                placed.filled_base_qty,
                                placed.price,
                            ),
                        )
                        .await?;
                }
                if placed.filled_quote_qty > Decimal::ZERO {
                    self.gate
                        .invalidate_balance(exchange.name(), exchange.quote_asset_ticker())
                        .await;
                }
                Ok(true)
            }
            Err(err) => {
                if err.reason() == FailureReason::ServiceUnavailable {
                    // Outcome unknown, leave Pending for the next cycle
                    warn!(
                        "Queued order {} submission unobserved ({}); leaving Pending",
                        order.id, err
                    );
                    return Ok(false);
                }
                self.handle_exchange_failure(order, Some(&err.to_string()))
                    .await?;
                Ok(false)
            }
        }
    }
}
