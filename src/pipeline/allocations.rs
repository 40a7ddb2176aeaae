//! Allocation fan-out for one payment
//!
//! Splits a payment's net amount across the subscription's allocations and
//! drives each through the admission gate and order executor. Allocations
//! run sequentially so each admission decision sees the balance already
//! consumed by earlier allocations of the same payment. A failure in one
//! allocation is isolated; the batch fails only when every allocation fails.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::domain::{
    Allocation, EventKind, ExchangeOrder, LedgerEntry, LedgerEntryType, OrderCompletedEvent,
    OrderResult, OrderSide, OrderStatus, Payment, PlacedOrder, StoredEvent,
};
use crate::error::{CoinvestError, FailureReason, Result};
use crate::exchange::{ExchangeClient, ExchangeRegistry};
use crate::persistence::{
    get_or_compute, CacheStore, EventBus, LedgerStore, NotificationSink, OrderPatch, OrderStore,
};
use crate::pipeline::balance_gate::{AdmissionDecision, BalanceAdmissionGate};
use crate::pipeline::order_executor::OrderExecutor;
use crate::resilience::{ResilienceExecutor, ResiliencePolicy};
use crate::services::Metrics;
use crate::validation::{validate_amount, validate_percent};

pub struct AllocationProcessor {
    registry: Arc<ExchangeRegistry>,
    gate: Arc<BalanceAdmissionGate>,
    order_executor: Arc<OrderExecutor>,
    orders: Arc<dyn OrderStore>,
    ledger: Arc<dyn LedgerStore>,
    bus: Arc<dyn EventBus>,
    sink: Arc<dyn NotificationSink>,
    cache: Arc<dyn CacheStore>,
    executor: Arc<ResilienceExecutor>,
    metrics: Arc<Metrics>,
    config: PipelineConfig,
    min_notional_policy: ResiliencePolicy,
}

impl AllocationProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ExchangeRegistry>,
        gate: Arc<BalanceAdmissionGate>,
        order_executor: Arc<OrderExecutor>,
        orders: Arc<dyn OrderStore>,
        ledger: Arc<dyn LedgerStore>,
        bus: Arc<dyn EventBus>,
        sink: Arc<dyn NotificationSink>,
        cache: Arc<dyn CacheStore>,
        executor: Arc<ResilienceExecutor>,
        metrics: Arc<Metrics>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            gate,
            order_executor,
            orders,
            ledger,
            bus,
            sink,
            cache,
            executor,
            metrics,
            config,
            min_notional_policy: ResiliencePolicy::quick("exchange.get_min_notional"),
        }
    }

    /// Process every allocation of one payment, sequentially.
    pub async fn process(
        &self,
        payment: &Payment,
        allocations: &[Allocation],
    ) -> Result<Vec<OrderResult>> {
        validate_amount(payment.net_amount, "net_amount")?;
        if allocations.is_empty() {
            return Err(CoinvestError::Validation(format!(
                "subscription {} has no allocations configured",
                payment.subscription_id
            )));
        }

        let mut results = Vec::with_capacity(allocations.len());
        for allocation in allocations {
            match self.process_allocation(payment, allocation).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    // One failed allocation never aborts its siblings
                    let reason = err.reason();
                    warn!(
                        "Allocation {} ({}%) of payment {} failed: {}",
                        allocation.ticker, allocation.percent, payment.id, err
                    );
                    self.metrics.inc_allocations_failed();
                    results.push(OrderResult::failed(
                        &allocation.exchange_name,
                        allocation.asset_id,
                        allocation.target_quantity(payment.net_amount),
                        reason,
                        err.to_string(),
                    ));
                }
            }
        }

        if results.iter().all(|r| !r.success) {
            let first_error = results
                .iter()
                .find_map(|r| r.error.clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(CoinvestError::OrderExecution(format!(
                "all {} allocations of payment {} failed; first error: {}",
                results.len(),
                payment.id,
                first_error
            )));
        }

        Ok(results)
    }

    async fn process_allocation(
        &self,
        payment: &Payment,
        allocation: &Allocation,
    ) -> Result<OrderResult> {
        validate_percent(allocation.percent)?;
        let target = allocation.target_quantity(payment.net_amount);
        if target <= Decimal::ZERO {
            return Err(CoinvestError::Validation(format!(
                "allocation target for {} is not positive: {}",
                allocation.ticker, target
            )));
        }

        let exchange = self.registry.get(&allocation.exchange_name)?;
        let reserve_ticker = exchange.quote_asset_ticker().to_string();

        match self
            .gate
            .check(exchange.name(), &reserve_ticker, target)
            .await?
        {
            AdmissionDecision::Insufficient { shortfall } => {
                return Err(CoinvestError::InsufficientBalance {
                    exchange: exchange.name().to_string(),
                    required: target,
                    available: target - shortfall,
                });
            }
            decision => {
                debug!(
                    "Admission granted for {} {} on {} ({:?})",
                    target, reserve_ticker, allocation.ticker, decision
                );
            }
        }

        // Net out fills from earlier runs of the same payment so a retry
        // never spends the allocation twice.
        let previous = self
            .orders
            .orders_for_payment_asset(payment.id, allocation.asset_id)
            .await?;
        let previous_filled: Decimal = previous.iter().map(|o| o.filled_quote_qty).sum();
        let remaining = target - previous_filled;

        let min_notional = self.min_notional(&exchange, &allocation.ticker).await?;
        if remaining <= min_notional {
            info!(
                "Allocation {} of payment {} already processed (remaining {} <= min notional {})",
                allocation.ticker, payment.id, remaining, min_notional
            );
            self.metrics.inc_allocations_skipped();
            return Ok(OrderResult::already_processed(
                exchange.name(),
                allocation.asset_id,
            ));
        }

        self.execute_order(payment, allocation, exchange, remaining)
            .await
    }

    async fn execute_order(
        &self,
        payment: &Payment,
        allocation: &Allocation,
        exchange: Arc<dyn ExchangeClient>,
        remaining: Decimal,
    ) -> Result<OrderResult> {
        // The order row is the submission-attempt record: inserted Pending
        // before the exchange call so an unobserved outcome stays visible
        // to reconciliation.
        let mut order = ExchangeOrder::for_allocation(
            payment.user_id,
            payment.id,
            payment.subscription_id,
            &allocation.exchange_name,
            allocation.asset_id,
            &allocation.ticker,
            OrderSide::Buy,
            remaining,
        );
        order.status = OrderStatus::Pending;
        self.orders.insert_order(&order).await?;

        let client_ref = order.id.to_string();
        let placed = match self
            .order_executor
            .place_order(
                exchange.clone(),
                &allocation.ticker,
                remaining,
                &client_ref,
                OrderSide::Buy,
            )
            .await
        {
            Ok(placed) => placed,
            Err(err) => {
                if err.reason() == FailureReason::ServiceUnavailable {
                    // Outcome unknown: leave the order Pending for the
                    // reconciliation loop to repair.
                    warn!(
                        "Order {} outcome unobserved ({}); leaving Pending",
                        order.id, err
                    );
                } else {
                    self.orders
                        .update_order(
                            order.id,
                            OrderPatch::status(OrderStatus::Failed).with_error(err.to_string()),
                        )
                        .await?;
                }
                return Err(err);
            }
        };

        let local_status = match placed.status {
            OrderStatus::Filled => OrderStatus::Filled,
            // Synchronously observed partial fills stay Pending; the
            // reconciliation loop closes them with exactly one continuation.
            _ => OrderStatus::Pending,
        };

        self.orders
            .update_order(
                order.id,
                OrderPatch::status(local_status)
                    .with_exchange_order_id(placed.exchange_order_id.clone())
                    .with_fill(
                        placed.filled_quote_qty,
                        placed.filled_base_qty,
                        placed.price,
                    ),
            )
            .await?;

        if placed.filled_quote_qty > Decimal::ZERO {
            self.record_fill(payment, allocation, &order, &placed).await;
            self.gate
                .invalidate_balance(exchange.name(), exchange.quote_asset_ticker())
                .await;
        }

        self.metrics.inc_allocations_executed();
        Ok(OrderResult::executed(
            exchange.name(),
            order.id,
            allocation.asset_id,
            remaining,
            placed.filled_quote_qty,
        ))
    }

    /// Persist the ledger entry and publish the completion event. Both are
    /// follow-ups to an already-executed order; failures are logged and do
    /// not fail the allocation.
    async fn record_fill(
        &self,
        payment: &Payment,
        allocation: &Allocation,
        order: &ExchangeOrder,
        placed: &PlacedOrder,
    ) {
        let entry = LedgerEntry {
            id: uuid::Uuid::new_v4(),
            user_id: payment.user_id,
            payment_id: payment.id,
            order_id: order.id,
            asset_id: allocation.asset_id,
            quote_amount: placed.filled_quote_qty,
            base_amount: placed.filled_base_qty,
            price: placed.price,
            entry_type: LedgerEntryType::Purchase,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.ledger.insert_entry(&entry).await {
            error!("Failed to persist ledger entry for order {}: {}", order.id, e);
        }

        if placed.status != OrderStatus::Filled {
            return;
        }

        let completion = OrderCompletedEvent {
            order_id: order.id,
            payment_id: payment.id,
            user_id: payment.user_id,
            asset_id: allocation.asset_id,
            exchange_name: allocation.exchange_name.clone(),
            requested_quote_qty: order.requested_quote_qty,
            filled_quote_qty: placed.filled_quote_qty,
        };
        match serde_json::to_value(&completion) {
            Ok(payload) => {
                let event = StoredEvent::new(EventKind::OrderCompleted, payload);
                if let Err(e) = self.bus.publish(&event).await {
                    error!("Failed to publish completion event for {}: {}", order.id, e);
                }
            }
            Err(e) => error!("Failed to serialize completion event: {}", e),
        }
        if let Err(e) = self.sink.notify_order_completed(&completion).await {
            warn!("Completion notification failed (ignored): {}", e);
        }
    }

    /// Min-notional for an asset on an exchange, cached for about an hour.
    async fn min_notional(
        &self,
        exchange: &Arc<dyn ExchangeClient>,
        ticker: &str,
    ) -> Result<Decimal> {
        let key = format!("min_notional:{}:{}", exchange.name(), ticker);
        let ttl = Duration::from_secs(self.config.min_notional_ttl_secs);
        let executor = self.executor.clone();
        let policy = self.min_notional_policy.clone();
        let exchange = exchange.clone();
        let ticker = ticker.to_string();

        get_or_compute(self.cache.as_ref(), &key, ttl, || async move {
            executor
                .execute(&policy, || {
                    let exchange = exchange.clone();
                    let ticker = ticker.clone();
                    async move { exchange.get_min_notional(&ticker).await }
                })
                .await
                .map_err(CoinvestError::from)
        })
        .await
    }
}
